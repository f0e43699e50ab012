//! Protocol stack dispatcher.
//!
//! Walks one packet through its protocol layers, top-down in a single pass.
//! Conntrack entries met along the way stay locked until the walk ends, so
//! packets of one flow are processed one at a time and in order.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::conntrack::EntryGuard;
use crate::error::{ConntrackError, ParseError};
use crate::event::{EventBus, EventContext};
use crate::packet::{Packet, Timestamp};
use crate::proto::{DissectContext, Layer, LayerStack, Next, ProcessContext, Protocol, ProtocolRegistry};
use crate::registry::Counters;

/// How a packet's walk ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The last layer reported no further layer, or one without a decoder.
    Completed,
    /// A layer could not be decoded; layers below it were processed.
    Malformed { protocol: Protocol, error: ParseError },
    /// The packet belongs to a flow judged corrupt.
    Ignored { protocol: Protocol },
    /// The stack exceeded the depth limit.
    DepthExceeded,
    /// No conntrack could be allocated for a new flow.
    Dropped {
        protocol: Protocol,
        error: ConntrackError,
    },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed => f.write_str("completed"),
            Outcome::Malformed { protocol, error } => write!(f, "malformed {}: {}", protocol, error),
            Outcome::Ignored { protocol } => write!(f, "ignored (invalid {} flow)", protocol),
            Outcome::DepthExceeded => f.write_str("stack depth exceeded"),
            Outcome::Dropped { protocol, error } => write!(f, "dropped at {}: {}", protocol, error),
        }
    }
}

/// Summary of one processed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessReport {
    pub outcome: Outcome,
    /// Layers decoded.
    pub layers: usize,
    /// Events emitted by decoders.
    pub events: usize,
    /// Listener callbacks that failed.
    pub listener_failures: usize,
}

impl ProcessReport {
    fn new() -> Self {
        Self {
            outcome: Outcome::Completed,
            layers: 0,
            events: 0,
            listener_failures: 0,
        }
    }
}

/// Capture-time clock.
///
/// Reads as the newest packet timestamp seen, advanced by the wall time
/// that passed since that packet was processed. Idle expiry compares
/// conntrack activity against this clock, so replayed captures age at
/// capture speed and a quiet live link still ages.
#[derive(Debug)]
pub struct PacketClock {
    origin: Instant,
    /// Newest capture timestamp, in microseconds.
    latest: AtomicU64,
    /// When `latest` was observed, in microseconds since `origin`.
    observed_at: AtomicU64,
}

impl PacketClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            latest: AtomicU64::new(0),
            observed_at: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, timestamp: Timestamp) {
        let micros = timestamp.as_micros();
        let previous = self.latest.fetch_max(micros, Ordering::AcqRel);
        if micros >= previous {
            self.observed_at.store(self.since_origin(), Ordering::Release);
        }
    }

    /// Current capture time; `None` until a packet was seen.
    pub fn now(&self) -> Option<Timestamp> {
        let latest = self.latest.load(Ordering::Acquire);
        if latest == 0 {
            return None;
        }
        let idle = self
            .since_origin()
            .saturating_sub(self.observed_at.load(Ordering::Acquire));
        Some(Timestamp::from_micros(latest) + Duration::from_micros(idle))
    }

    fn since_origin(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

impl Default for PacketClock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Dispatcher {
    registry: Arc<ProtocolRegistry>,
    bus: Arc<EventBus>,
    counters: Arc<Counters>,
    max_depth: AtomicUsize,
    clock: PacketClock,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProtocolRegistry>,
        bus: Arc<EventBus>,
        counters: Arc<Counters>,
        max_depth: usize,
    ) -> Self {
        Self {
            registry,
            bus,
            counters,
            max_depth: AtomicUsize::new(max_depth.max(1)),
            clock: PacketClock::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth.load(Ordering::Relaxed)
    }

    pub fn set_max_depth(&self, depth: usize) {
        self.max_depth.store(depth.max(1), Ordering::Relaxed);
    }

    pub fn clock(&self) -> &PacketClock {
        &self.clock
    }

    /// Decode `packet` layer by layer and dispatch the events it produces.
    pub fn process(&self, packet: &Packet) -> ProcessReport {
        let started = Instant::now();
        self.clock.observe(packet.timestamp());
        let report = self.walk(packet);

        let counters = &self.counters;
        counters.packets.inc();
        counters.bytes.inc_by(packet.len() as u64);
        counters.events.inc_by(report.events as u64);
        counters
            .listener_failures
            .inc_by(report.listener_failures as u64);
        match &report.outcome {
            Outcome::Completed => {}
            Outcome::Malformed { .. } => counters.malformed.inc(),
            Outcome::Ignored { .. } => counters.ignored.inc(),
            Outcome::DepthExceeded => counters.depth_exceeded.inc(),
            Outcome::Dropped { .. } => counters.dropped.inc(),
        }
        counters.processing_time.add(started.elapsed());
        report
    }

    fn walk(&self, packet: &Packet) -> ProcessReport {
        let mut report = ProcessReport::new();
        let mut stack = LayerStack::new();
        // Locked entries, bottom first. Released when the walk returns.
        let mut guards: Vec<EntryGuard> = Vec::new();

        let max_depth = self.max_depth();
        let mut protocol = packet.link().first_protocol();
        let mut offset = 0;
        let mut end = packet.len();

        loop {
            if report.layers >= max_depth {
                debug!(%protocol, max_depth, "stack depth exceeded");
                report.outcome = Outcome::DepthExceeded;
                break;
            }
            let Some(slot) = self.registry.slot(protocol) else {
                trace!(%protocol, "no decoder registered");
                break;
            };
            let decoder = slot.decoder();

            let data = &packet.data()[offset..end];
            let dissection = match decoder.dissect(&DissectContext {
                data,
                stack: &stack,
                packet,
            }) {
                Ok(dissection) => dissection,
                Err(error) => {
                    debug!(%protocol, %error, "malformed layer");
                    report.outcome = Outcome::Malformed { protocol, error };
                    break;
                }
            };

            if dissection.header_len > data.len() {
                let error = ParseError::PacketTooShort {
                    expected: dissection.header_len,
                    actual: data.len(),
                };
                debug!(%protocol, %error, "malformed layer");
                report.outcome = Outcome::Malformed { protocol, error };
                break;
            }
            let payload_start = offset + dissection.header_len;
            let payload_end = match dissection.payload_len {
                Some(len) if payload_start + len > end => {
                    let error = ParseError::InvalidLength {
                        field: "payload",
                        value: len,
                    };
                    debug!(%protocol, %error, "malformed layer");
                    report.outcome = Outcome::Malformed { protocol, error };
                    break;
                }
                Some(len) => payload_start + len,
                None => end,
            };

            let mut conntrack = None;
            match dissection.key {
                Some(key) if dissection.existing_only => {
                    match slot.conntracks().lookup_existing(&key, packet.timestamp()) {
                        Some(guard) => {
                            conntrack = Some(guard.id());
                            guards.push(guard);
                        }
                        None => trace!(%protocol, %key, "no flow to join"),
                    }
                }
                Some(key) => {
                    let lookup = slot.conntracks().lookup_or_create(
                        key,
                        packet.timestamp(),
                        |key| decoder.init_flow(key),
                    );
                    match lookup {
                        Ok(lookup) => {
                            conntrack = Some(lookup.guard.id());
                            guards.push(lookup.guard);
                        }
                        Err(error) => {
                            warn!(%protocol, %error, "dropping packet");
                            report.outcome = Outcome::Dropped { protocol, error };
                            break;
                        }
                    }
                }
                None => {}
            }

            stack.push(Layer {
                protocol,
                offset,
                len: dissection.header_len,
                info: dissection.info,
                conntrack,
            });
            report.layers += 1;

            let own_entry = conntrack.is_some();
            if own_entry && guards.last().is_some_and(|guard| guard.is_invalid()) {
                trace!(%protocol, "packet on invalid flow ignored");
                report.outcome = Outcome::Ignored { protocol };
                break;
            }

            let payload = packet.data().slice(payload_start..payload_end);
            let mut cx = ProcessContext::new(packet, &stack, payload);
            let entry = if own_entry {
                guards.last_mut().map(|guard| &mut **guard)
            } else {
                None
            };
            let result = decoder.process(&mut cx, entry);
            let verdict = cx.finish();

            if own_entry && verdict.invalidate {
                if let Some(guard) = guards.last_mut() {
                    guard.mark_invalid();
                }
            }

            for event in verdict.events {
                report.events += 1;
                let mut ecx = EventContext::new(&self.bus)
                    .with_packet(packet, &stack)
                    .with_conntrack(guards.last_mut().map(|guard| &mut **guard));
                if let Err(error) = self.bus.emit(event, &mut ecx) {
                    report.listener_failures += error.failures.len();
                }
            }

            if own_entry && verdict.close {
                if let Some(mut guard) = guards.pop() {
                    slot.conntracks().close(&mut guard);
                }
            }

            if let Err(error) = result {
                debug!(%protocol, %error, "malformed layer");
                report.outcome = Outcome::Malformed { protocol, error };
                break;
            }

            match dissection.next {
                Next::End => break,
                Next::Protocol(next) => {
                    protocol = next;
                    offset = payload_start;
                    end = payload_end;
                }
            }
        }

        report
    }
}
