//! Content decoders.
//!
//! A decoder turns encoded content into a new buffer; the input is never
//! modified in place.

mod netascii;
mod percent;

pub use netascii::NetasciiDecoder;
pub use percent::PercentDecoder;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::ContentError;

pub trait ContentDecoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Upper bound of the decoded size for `encoded_len` input bytes.
    fn estimate_size(&self, encoded_len: usize) -> usize;

    fn decode(&self, input: &[u8]) -> Result<Bytes, ContentError>;
}

/// Content decoders by name.
#[derive(Clone)]
pub struct ContentDecoders {
    decoders: BTreeMap<&'static str, Arc<dyn ContentDecoder>>,
}

impl ContentDecoders {
    pub fn empty() -> Self {
        Self {
            decoders: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, decoder: Arc<dyn ContentDecoder>) {
        self.decoders.insert(decoder.name(), decoder);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ContentDecoder>, ContentError> {
        self.decoders
            .get(name)
            .cloned()
            .ok_or_else(|| ContentError::UnknownDecoder(name.to_string()))
    }

    pub fn decode(&self, name: &str, input: &[u8]) -> Result<Bytes, ContentError> {
        self.get(name)?.decode(input)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.decoders.keys().copied().collect()
    }
}

impl Default for ContentDecoders {
    fn default() -> Self {
        let mut decoders = Self::empty();
        decoders.register(Arc::new(PercentDecoder));
        decoders.register(Arc::new(NetasciiDecoder));
        decoders
    }
}
