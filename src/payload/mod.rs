//! Payload storage for reassembled content.
//!
//! Analyzers hand complete payloads to a [`PayloadStore`] and keep the
//! returned [`StoredPayload`] for as long as they reference it. Consumers
//! pull the content back through a [`PayloadReader`].

mod memory;

pub use memory::MemoryPayloadStore;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::PayloadError;

pub const DEFAULT_MIME_TYPE: &str = "binary/octet-stream";

/// Identifier of a stored payload. Allocated from a counter, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PayloadId(u64);

impl PayloadId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stored content shared between the store and its readers.
#[derive(Debug)]
pub struct PayloadContent {
    pub(crate) content: Bytes,
    pub(crate) mime_type: String,
}

/// The core's reference to a stored payload.
#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub id: PayloadId,
    pub handle: Arc<PayloadContent>,
}

impl StoredPayload {
    pub fn len(&self) -> usize {
        self.handle.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handle.content.is_empty()
    }

    pub fn mime_type(&self) -> &str {
        &self.handle.mime_type
    }

    pub fn reader(&self) -> PayloadReader {
        PayloadReader::new(self.handle.clone())
    }
}

/// Pull-based reader over a stored payload.
pub struct PayloadReader {
    payload: Arc<PayloadContent>,
    position: usize,
}

impl PayloadReader {
    pub(crate) fn new(payload: Arc<PayloadContent>) -> Self {
        Self {
            payload,
            position: 0,
        }
    }

    /// Read at most `max` bytes. Returns an empty buffer at the end.
    pub fn read(&mut self, max: usize) -> Result<Bytes, PayloadError> {
        let end = self.payload.content.len().min(self.position + max);
        let chunk = self.payload.content.slice(self.position..end);
        self.position = end;
        Ok(chunk)
    }

    pub fn mime_type(&self) -> &str {
        &self.payload.mime_type
    }

    pub fn len(&self) -> usize {
        self.payload.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.content.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.payload.content.len() - self.position
    }
}

/// Destination for reassembled payloads.
pub trait PayloadStore: Send + Sync {
    fn store(&self, content: Bytes, mime_type: &str) -> Result<StoredPayload, PayloadError>;

    fn open(&self, id: PayloadId) -> Option<PayloadReader>;

    /// Forget a payload. Readers already open keep their content.
    fn remove(&self, id: PayloadId) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stored_bytes(&self) -> u64;

    /// Bytes that can still be stored, or `None` when unbounded.
    fn available(&self) -> Option<u64> {
        None
    }
}

/// Guess a MIME type from a file name's extension.
pub fn mime_type_for(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("png") => "image/png",
        Some("jpeg") | Some("jpg") => "image/jpeg",
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        _ => DEFAULT_MIME_TYPE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_types() {
        assert_eq!(mime_type_for("index.HTML"), "text/html");
        assert_eq!(mime_type_for("boot/logo.png"), "image/png");
        assert_eq!(mime_type_for("photo.jpg"), "image/jpeg");
        assert_eq!(mime_type_for("app.js"), "application/javascript");
        assert_eq!(mime_type_for("pxelinux.0"), DEFAULT_MIME_TYPE);
        assert_eq!(mime_type_for("noext"), DEFAULT_MIME_TYPE);
    }

    #[test]
    fn test_reader_pulls_in_chunks() {
        let content = Bytes::from_static(b"0123456789");
        let payload = StoredPayload {
            id: PayloadId::new(1),
            handle: Arc::new(PayloadContent {
                content: content.clone(),
                mime_type: DEFAULT_MIME_TYPE.to_string(),
            }),
        };

        let mut reader = payload.reader();
        assert_eq!(reader.len(), 10);
        assert_eq!(reader.read(4).unwrap(), Bytes::from_static(b"0123"));
        assert_eq!(reader.remaining(), 6);
        assert_eq!(reader.read(100).unwrap(), Bytes::from_static(b"456789"));
        assert!(reader.read(4).unwrap().is_empty());
        assert_eq!(reader.remaining(), 0);
    }
}
