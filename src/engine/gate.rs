//! Pause control for packet processing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use tracing::info;

/// Workers hold a read permit while processing a packet; pausing takes
/// the write side, so it waits for in-flight packets and blocks new ones.
#[derive(Debug, Default)]
pub struct PauseGate {
    lock: Arc<RwLock<()>>,
    held: Mutex<Option<OwnedRwLockWriteGuard<()>>>,
    running: AtomicBool,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Permission to process one packet. Blocks the calling thread while
    /// paused; must not be called from async code.
    pub fn enter_blocking(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.blocking_read()
    }

    /// Pause processing. Returns false if it was already paused.
    pub async fn pause(&self) -> bool {
        let mut held = self.held.lock().await;
        if held.is_some() {
            return false;
        }
        *held = Some(self.lock.clone().write_owned().await);
        info!("processing paused");
        true
    }

    /// Resume processing. Returns false if it was not paused.
    pub async fn resume(&self) -> bool {
        let mut held = self.held.lock().await;
        let was_paused = held.take().is_some();
        if was_paused {
            info!("processing resumed");
        }
        was_paused
    }

    pub fn is_paused(&self) -> bool {
        self.lock.try_read().is_err()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the previous state.
    pub(crate) fn set_running(&self, running: bool) -> bool {
        self.running.swap(running, Ordering::SeqCst)
    }
}
