//! Packet acquisition.
//!
//! This module defines the `PacketSource` trait and the `InputChannel`
//! that isolates acquisition from processing. A dedicated reader thread
//! performs the blocking reads and feeds a bounded queue; when the queue
//! is full the reader stalls, which is the backpressure point.

mod pnet_source;
mod replay_source;

pub use pnet_source::PnetSource;
pub use replay_source::ReplaySource;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, trace};

use crate::error::{InputError, SourceError};
use crate::packet::{InputId, LinkType, Packet, Timestamp};

/// A frame as delivered by a source, before it becomes a shared packet.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub timestamp: Timestamp,
    pub link: LinkType,
}

impl RawFrame {
    pub fn new(data: impl Into<Bytes>, timestamp: Timestamp, link: LinkType) -> Self {
        Self {
            data: data.into(),
            timestamp,
            link,
        }
    }
}

/// Supplier of timestamped frames.
///
/// Implementations may block in `read`. `Ok(None)` means the source is
/// exhausted and the channel should close.
pub trait PacketSource: Send {
    /// Read the next frame.
    fn read(&mut self) -> Result<Option<RawFrame>, SourceError>;

    /// Human-readable name of the source (interface, file, ...).
    fn name(&self) -> &str;
}

/// Input channel settings.
#[derive(Debug, Clone)]
pub struct InputConfig {
    /// Maximum number of packets queued between reader and pipeline.
    pub capacity: usize,
    /// Pause between retries after a transient read error.
    pub retry_delay: Duration,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            retry_delay: Duration::ZERO,
        }
    }
}

/// Result of [`InputChannel::acquire`].
#[derive(Debug)]
pub enum Acquired {
    Packet(Packet),
    Shutdown,
}

/// Snapshot of reader activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputStats {
    pub packets: u64,
    pub retries: u64,
    pub reader_finished: bool,
}

#[derive(Debug, Default)]
struct Shared {
    stop: AtomicBool,
    notify: Notify,
    packets: AtomicU64,
    retries: AtomicU64,
    finished: AtomicBool,
}

/// Cloneable handle that shuts an input channel down from anywhere,
/// including a signal handler.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }
}

/// Bounded FIFO between one packet source and the pipeline.
pub struct InputChannel {
    name: String,
    rx: mpsc::Receiver<Packet>,
    shared: Arc<Shared>,
    closed: bool,
}

impl InputChannel {
    /// Start a reader thread for `source`.
    pub fn spawn<S>(mut source: S, input: InputId, config: InputConfig) -> Result<Self, InputError>
    where
        S: PacketSource + 'static,
    {
        let name = source.name().to_string();
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let shared = Arc::new(Shared::default());

        let reader_shared = shared.clone();
        thread::Builder::new()
            .name(format!("reader-{}", name))
            .spawn(move || reader_loop(&mut source, input, &config, &tx, &reader_shared))
            .map_err(|e| InputError::Spawn {
                source_name: name.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            name,
            rx,
            shared,
            closed: false,
        })
    }

    /// Wait for the next packet.
    ///
    /// Packets come out in the order they were read. Once the channel is
    /// shut down or the source ends, already-queued packets are still
    /// returned and every later call yields [`Acquired::Shutdown`].
    pub async fn acquire(&mut self) -> Acquired {
        loop {
            if !self.closed && self.shared.stop.load(Ordering::SeqCst) {
                self.close();
            }

            if self.closed {
                return match self.rx.recv().await {
                    Some(packet) => Acquired::Packet(packet),
                    None => Acquired::Shutdown,
                };
            }

            let received = tokio::select! {
                biased;
                packet = self.rx.recv() => Some(packet),
                _ = self.shared.notify.notified() => None,
            };

            match received {
                Some(Some(packet)) => return Acquired::Packet(packet),
                Some(None) => {
                    self.closed = true;
                    return Acquired::Shutdown;
                }
                // Shutdown requested; loop to close and drain.
                None => continue,
            }
        }
    }

    /// Stop accepting packets. Queued packets remain available.
    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.close();
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> InputStats {
        InputStats {
            packets: self.shared.packets.load(Ordering::Relaxed),
            retries: self.shared.retries.load(Ordering::Relaxed),
            reader_finished: self.shared.finished.load(Ordering::SeqCst),
        }
    }

    fn close(&mut self) {
        if !self.closed {
            debug!(input = %self.name, "closing input channel");
            self.rx.close();
            self.closed = true;
        }
    }
}

impl Drop for InputChannel {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }
}

fn reader_loop<S: PacketSource>(
    source: &mut S,
    input: InputId,
    config: &InputConfig,
    tx: &mpsc::Sender<Packet>,
    shared: &Shared,
) {
    info!(source = source.name(), %input, "reader started");

    while !shared.stop.load(Ordering::SeqCst) {
        match source.read() {
            Ok(Some(frame)) => {
                let packet = Packet::new(frame.data, frame.timestamp, input, frame.link);
                // Blocks while the queue is full.
                if tx.blocking_send(packet).is_err() {
                    debug!(source = source.name(), "input channel closed, reader stopping");
                    break;
                }
                shared.packets.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {
                info!(source = source.name(), "source exhausted");
                break;
            }
            Err(SourceError::Transient(reason)) => {
                shared.retries.fetch_add(1, Ordering::Relaxed);
                trace!(source = source.name(), %reason, "transient read error, retrying");
                if !config.retry_delay.is_zero() {
                    thread::sleep(config.retry_delay);
                }
            }
            Err(SourceError::Fatal(reason)) => {
                error!(source = source.name(), %reason, "source failed, closing input");
                break;
            }
        }
    }

    shared.finished.store(true, Ordering::SeqCst);
    info!(source = source.name(), "reader stopped");
}
