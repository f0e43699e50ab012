//! In-memory payload store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use super::{PayloadContent, PayloadId, PayloadReader, PayloadStore, StoredPayload};
use crate::error::PayloadError;

/// Keeps payloads in memory up to a byte capacity.
pub struct MemoryPayloadStore {
    payloads: RwLock<HashMap<PayloadId, Arc<PayloadContent>>>,
    next_id: AtomicU64,
    stored_bytes: AtomicU64,
    capacity: u64,
}

impl MemoryPayloadStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            payloads: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stored_bytes: AtomicU64::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

impl PayloadStore for MemoryPayloadStore {
    fn store(&self, content: Bytes, mime_type: &str) -> Result<StoredPayload, PayloadError> {
        let size = content.len() as u64;
        let mut payloads = self.payloads.write();

        let used = self.stored_bytes.load(Ordering::SeqCst);
        let available = self.capacity.saturating_sub(used);
        if size > available {
            return Err(PayloadError::CapacityExceeded {
                requested: size,
                available,
            });
        }

        let id = PayloadId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let handle = Arc::new(PayloadContent {
            content,
            mime_type: mime_type.to_string(),
        });
        payloads.insert(id, handle.clone());
        self.stored_bytes.fetch_add(size, Ordering::SeqCst);

        debug!(%id, size, mime_type, "payload stored");
        Ok(StoredPayload { id, handle })
    }

    fn open(&self, id: PayloadId) -> Option<PayloadReader> {
        self.payloads.read().get(&id).cloned().map(PayloadReader::new)
    }

    fn remove(&self, id: PayloadId) -> bool {
        match self.payloads.write().remove(&id) {
            Some(payload) => {
                self.stored_bytes
                    .fetch_sub(payload.content.len() as u64, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.payloads.read().len()
    }

    fn stored_bytes(&self) -> u64 {
        self.stored_bytes.load(Ordering::SeqCst)
    }

    fn available(&self) -> Option<u64> {
        Some(self.capacity.saturating_sub(self.stored_bytes()))
    }
}
