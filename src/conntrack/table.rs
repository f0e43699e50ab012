//! Conntrack table.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use tracing::{debug, warn};

use super::entry::{BoxedFlow, ConntrackEntry};
use super::ConntrackKey;
use crate::error::ConntrackError;
use crate::packet::Timestamp;
use crate::proto::Protocol;

/// Shared handle to an entry stored in a table.
pub type EntryHandle = Arc<Mutex<ConntrackEntry>>;

/// Exclusive, owned access to an entry.
pub type EntryGuard = ArcMutexGuard<RawMutex, ConntrackEntry>;

/// Result of [`ConntrackTable::lookup_or_create`].
pub struct Lookup {
    pub guard: EntryGuard,
    pub created: bool,
}

/// Table activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub active: usize,
    pub created: u64,
    pub closed: u64,
    pub expired: u64,
    pub refused: u64,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    closed: AtomicU64,
    expired: AtomicU64,
    refused: AtomicU64,
}

/// Flow table for one protocol.
///
/// The map is sharded: lookups take a shard read lock, inserts and removals
/// a shard write lock. Entry contents sit behind their own mutex, which is
/// never locked while a shard lock is held.
pub struct ConntrackTable {
    protocol: Protocol,
    entries: DashMap<ConntrackKey, EntryHandle>,
    /// Entries in the map; reserved before an insert so the limit holds
    /// under concurrent creation.
    active: AtomicUsize,
    max_entries: usize,
    next_id: AtomicU64,
    counters: Counters,
}

impl ConntrackTable {
    pub fn new(protocol: Protocol, max_entries: usize) -> Self {
        Self {
            protocol,
            entries: DashMap::new(),
            active: AtomicUsize::new(0),
            max_entries: max_entries.max(1),
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the entry for `key` without creating one.
    pub fn lookup(&self, key: &ConntrackKey) -> Option<EntryHandle> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Lock the live entry for `key`, if there is one, and record activity
    /// at `timestamp`. Never creates an entry.
    pub fn lookup_existing(&self, key: &ConntrackKey, timestamp: Timestamp) -> Option<EntryGuard> {
        loop {
            let handle = self.lookup(key)?;
            let mut guard = handle.lock_arc();
            if guard.is_closed() {
                continue;
            }
            guard.touch(timestamp);
            return Some(guard);
        }
    }

    /// Lock the entry for `key`, creating it if needed, and record activity
    /// at `timestamp`.
    ///
    /// `init` produces the decoder-private state of a new entry. When the
    /// table is full, new keys are refused; existing flows keep working.
    pub fn lookup_or_create<F>(
        &self,
        key: ConntrackKey,
        timestamp: Timestamp,
        mut init: F,
    ) -> Result<Lookup, ConntrackError>
    where
        F: FnMut(&ConntrackKey) -> Option<BoxedFlow>,
    {
        loop {
            let existing = self.lookup(&key);
            let (handle, created) = match existing {
                Some(handle) => (handle, false),
                None => self.insert(&key, timestamp, &mut init)?,
            };

            let mut guard = handle.lock_arc();
            if guard.is_closed() {
                // Closed after we fetched it; it is gone from the map.
                continue;
            }
            guard.touch(timestamp);
            return Ok(Lookup { guard, created });
        }
    }

    fn insert<F>(
        &self,
        key: &ConntrackKey,
        timestamp: Timestamp,
        init: &mut F,
    ) -> Result<(EntryHandle, bool), ConntrackError>
    where
        F: FnMut(&ConntrackKey) -> Option<BoxedFlow>,
    {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => Ok((occupied.get().clone(), false)),
            Entry::Vacant(vacant) => {
                if !self.reserve() {
                    self.counters.refused.fetch_add(1, Ordering::Relaxed);
                    warn!(protocol = %self.protocol, limit = self.max_entries, "conntrack table full, refusing new flow");
                    return Err(ConntrackError::TableFull {
                        protocol: self.protocol,
                        limit: self.max_entries,
                    });
                }
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let flow = init(key);
                let entry = ConntrackEntry::new(id, self.protocol, key.clone(), timestamp, flow);
                let handle = Arc::new(Mutex::new(entry));
                vacant.insert(handle.clone());
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                debug!(protocol = %self.protocol, %key, id, "conntrack created");
                Ok((handle, true))
            }
        }
    }

    /// Take one slot below the limit.
    fn reserve(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < self.max_entries).then_some(active + 1)
            })
            .is_ok()
    }

    /// Remove `key` if it still maps to `handle`.
    fn remove(&self, key: &ConntrackKey, handle: &EntryHandle) -> bool {
        let removed = self
            .entries
            .remove_if(key, |_, stored| Arc::ptr_eq(stored, handle))
            .is_some();
        if removed {
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Remove the locked entry from the table and run its cleanups.
    ///
    /// Returns false if it was already closed.
    pub fn close(&self, guard: &mut EntryGuard) -> bool {
        if guard.is_closed() {
            return false;
        }
        let key = guard.key().clone();
        let handle = ArcMutexGuard::mutex(guard).clone();
        self.remove(&key, &handle);
        guard.close();
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Close every entry idle since before `threshold`.
    ///
    /// Entries currently locked by a worker are skipped; they are in use.
    /// Returns the number of entries closed.
    pub fn expire_idle(&self, threshold: Timestamp) -> usize {
        // Snapshot first; entries are only locked once the shards are released.
        let candidates: Vec<EntryHandle> = self
            .entries
            .iter()
            .map(|item| item.value().clone())
            .collect();

        let mut expired = 0;
        for handle in candidates {
            let Some(mut guard) = handle.try_lock_arc() else {
                continue;
            };
            if guard.is_closed() || guard.last_seen() >= threshold {
                continue;
            }
            let key = guard.key().clone();
            self.remove(&key, &handle);
            guard.close();
            expired += 1;
        }

        if expired > 0 {
            self.counters
                .expired
                .fetch_add(expired as u64, Ordering::Relaxed);
            debug!(protocol = %self.protocol, expired, remaining = self.len(), "expired idle conntracks");
        }
        expired
    }

    /// Close every entry. Used at teardown; waits for busy entries.
    pub fn close_all(&self) -> usize {
        let keys: Vec<ConntrackKey> = self.entries.iter().map(|item| item.key().clone()).collect();
        let handles: Vec<EntryHandle> = keys
            .iter()
            .filter_map(|key| self.entries.remove(key))
            .map(|(_, handle)| {
                self.active.fetch_sub(1, Ordering::AcqRel);
                handle
            })
            .collect();

        let mut closed = 0;
        for handle in handles {
            let mut guard = handle.lock_arc();
            if !guard.is_closed() {
                guard.close();
                closed += 1;
            }
        }
        self.counters
            .closed
            .fetch_add(closed as u64, Ordering::Relaxed);
        closed
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            active: self.len(),
            created: self.counters.created.load(Ordering::Relaxed),
            closed: self.counters.closed.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            refused: self.counters.refused.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::{AnalyzerId, Attachment, FlowState};
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[derive(Default)]
    struct Packets {
        seen: u32,
        closed: Option<Arc<AtomicUsize>>,
    }

    impl FlowState for Packets {
        fn on_close(&mut self) {
            if let Some(closed) = &self.closed {
                closed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn key(port: u16) -> ConntrackKey {
        let a: SocketAddr = format!("192.168.1.10:{}", port).parse().unwrap();
        let b: SocketAddr = "192.168.1.1:53".parse().unwrap();
        ConntrackKey::endpoints(a, b)
    }

    fn no_flow(_: &ConntrackKey) -> Option<BoxedFlow> {
        None
    }

    #[test]
    fn test_same_key_reuses_entry_and_updates_last_seen() {
        let table = ConntrackTable::new(Protocol::Udp, 16);
        let first = Timestamp::from_millis(1_000);
        let second = Timestamp::from_millis(1_010);

        let lookup = table.lookup_or_create(key(5000), first, no_flow).unwrap();
        assert!(lookup.created);
        let id = lookup.guard.id();
        drop(lookup);

        let lookup = table.lookup_or_create(key(5000), second, no_flow).unwrap();
        assert!(!lookup.created);
        assert_eq!(lookup.guard.id(), id);
        assert_eq!(lookup.guard.last_seen(), second);
        drop(lookup);

        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_init_runs_once_per_entry() {
        let table = ConntrackTable::new(Protocol::Udp, 16);
        let mut inits = 0;
        for ms in 0..3 {
            let mut lookup = table
                .lookup_or_create(key(1), Timestamp::from_millis(ms), |_| {
                    inits += 1;
                    Some(BoxedFlow::new(Packets::default()))
                })
                .unwrap();
            lookup.guard.flow_mut::<Packets>().unwrap().seen += 1;
        }
        assert_eq!(inits, 1);

        let handle = table.lookup(&key(1)).unwrap();
        assert_eq!(handle.lock().flow::<Packets>().unwrap().seen, 3);
    }

    #[test]
    fn test_close_removes_and_runs_cleanups() {
        struct Tracked(Arc<AtomicUsize>);
        impl Attachment for Tracked {
            fn cleanup(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let table = ConntrackTable::new(Protocol::Udp, 16);
        let flow_closed = Arc::new(AtomicUsize::new(0));
        let attachment_cleaned = Arc::new(AtomicUsize::new(0));

        let mut lookup = table
            .lookup_or_create(key(7), Timestamp::ZERO, |_| {
                Some(BoxedFlow::new(Packets {
                    seen: 0,
                    closed: Some(flow_closed.clone()),
                }))
            })
            .unwrap();
        lookup
            .guard
            .attach(AnalyzerId::new("test"), Tracked(attachment_cleaned.clone()));

        assert!(table.close(&mut lookup.guard));
        assert!(!table.close(&mut lookup.guard));
        drop(lookup);

        assert!(table.lookup(&key(7)).is_none());
        assert_eq!(flow_closed.load(Ordering::SeqCst), 1);
        assert_eq!(attachment_cleaned.load(Ordering::SeqCst), 1);
        assert_eq!(table.stats().closed, 1);
    }

    #[test]
    fn test_closed_key_gets_fresh_entry() {
        let table = ConntrackTable::new(Protocol::Udp, 16);
        let mut lookup = table.lookup_or_create(key(9), Timestamp::ZERO, no_flow).unwrap();
        let old_id = lookup.guard.id();
        table.close(&mut lookup.guard);
        drop(lookup);

        let lookup = table
            .lookup_or_create(key(9), Timestamp::from_millis(1), no_flow)
            .unwrap();
        assert!(lookup.created);
        assert_ne!(lookup.guard.id(), old_id);
        assert!(!lookup.guard.is_invalid());
    }

    #[test]
    fn test_expire_idle_is_idempotent() {
        let table = ConntrackTable::new(Protocol::Udp, 16);
        drop(table.lookup_or_create(key(1), Timestamp::from_millis(1_000), no_flow).unwrap());
        drop(table.lookup_or_create(key(2), Timestamp::from_millis(5_000), no_flow).unwrap());

        let threshold = Timestamp::from_millis(3_000);
        assert_eq!(table.expire_idle(threshold), 1);
        assert_eq!(table.len(), 1);
        assert!(table.lookup(&key(1)).is_none());

        assert_eq!(table.expire_idle(threshold), 0);
        assert_eq!(table.len(), 1);
        assert_eq!(table.stats().expired, 1);
    }

    #[test]
    fn test_expire_skips_entries_in_use() {
        let table = ConntrackTable::new(Protocol::Udp, 16);
        let held = table.lookup_or_create(key(1), Timestamp::ZERO, no_flow).unwrap();

        assert_eq!(table.expire_idle(Timestamp::from_millis(60_000)), 0);
        assert_eq!(table.len(), 1);

        drop(held);
        assert_eq!(table.expire_idle(Timestamp::from_millis(60_000)), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_full_table_refuses_new_keys_only() {
        let table = ConntrackTable::new(Protocol::Udp, 1);
        drop(table.lookup_or_create(key(1), Timestamp::ZERO, no_flow).unwrap());

        let refused = table.lookup_or_create(key(2), Timestamp::ZERO, no_flow);
        assert!(matches!(
            refused,
            Err(ConntrackError::TableFull { limit: 1, .. })
        ));

        let existing = table.lookup_or_create(key(1), Timestamp::from_millis(5), no_flow);
        assert!(existing.is_ok());
        drop(existing);
        assert_eq!(table.stats().refused, 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_full_table_still_serves_key_inserted_concurrently() {
        let table = ConntrackTable::new(Protocol::Udp, 1);
        drop(table.lookup_or_create(key(1), Timestamp::ZERO, no_flow).unwrap());

        // A creator whose lookup missed, racing with the insert of the same key.
        let (handle, created) = table.insert(&key(1), Timestamp::ZERO, &mut no_flow).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&handle, &table.lookup(&key(1)).unwrap()));
        assert_eq!(table.stats().refused, 0);
    }

    #[test]
    fn test_concurrent_creators_respect_limit() {
        let table = Arc::new(ConntrackTable::new(Protocol::Udp, 10));
        let refused = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8u16)
            .map(|n| {
                let table = table.clone();
                let refused = refused.clone();
                thread::spawn(move || {
                    for i in 0..20u16 {
                        match table.lookup_or_create(key(n * 100 + i), Timestamp::ZERO, no_flow) {
                            Ok(lookup) => drop(lookup),
                            Err(ConntrackError::TableFull { .. }) => {
                                refused.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(table.len(), 10);
        assert_eq!(table.entries.len(), 10);
        assert_eq!(refused.load(Ordering::SeqCst), 150);
        assert_eq!(table.stats().refused, 150);
    }

    #[test]
    fn test_closing_frees_a_slot() {
        let table = ConntrackTable::new(Protocol::Udp, 1);
        let mut lookup = table.lookup_or_create(key(1), Timestamp::ZERO, no_flow).unwrap();
        table.close(&mut lookup.guard);
        drop(lookup);

        assert!(table.lookup_or_create(key(2), Timestamp::ZERO, no_flow).is_ok());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_lookup_existing_never_creates() {
        let table = ConntrackTable::new(Protocol::Pppoe, 16);
        assert!(table.lookup_existing(&key(1), Timestamp::ZERO).is_none());
        assert!(table.is_empty());
        assert_eq!(table.stats().created, 0);

        drop(table.lookup_or_create(key(1), Timestamp::ZERO, no_flow).unwrap());
        let guard = table.lookup_existing(&key(1), Timestamp::from_millis(7)).unwrap();
        assert_eq!(guard.last_seen(), Timestamp::from_millis(7));
    }

    #[test]
    fn test_concurrent_creation_yields_one_entry() {
        let table = Arc::new(ConntrackTable::new(Protocol::Udp, 1024));
        let created = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|n| {
                let table = table.clone();
                let created = created.clone();
                thread::spawn(move || {
                    for i in 0..50u64 {
                        let mut lookup = table
                            .lookup_or_create(key(4242), Timestamp::from_micros(n * 100 + i), |_| {
                                Some(BoxedFlow::new(Packets::default()))
                            })
                            .unwrap();
                        if lookup.created {
                            created.fetch_add(1, Ordering::SeqCst);
                        }
                        lookup.guard.flow_mut::<Packets>().unwrap().seen += 1;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 1);
        let handle = table.lookup(&key(4242)).unwrap();
        assert_eq!(handle.lock().flow::<Packets>().unwrap().seen, 400);
    }

    #[test]
    fn test_close_all() {
        let table = ConntrackTable::new(Protocol::Udp, 16);
        for port in 1..=4 {
            drop(table.lookup_or_create(key(port), Timestamp::ZERO, no_flow).unwrap());
        }
        assert_eq!(table.close_all(), 4);
        assert!(table.is_empty());
    }
}
