//! Expected flows.

use std::net::SocketAddr;

use dashmap::DashMap;
use tracing::trace;

use super::Protocol;

/// Endpoints whose future traffic is known to belong to a protocol.
///
/// A TFTP request announces its client endpoint here, so the data packets
/// that come back from a fresh server port are still routed to TFTP.
#[derive(Debug, Default)]
pub struct Expectations {
    entries: DashMap<SocketAddr, Protocol>,
}

impl Expectations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(&self, endpoint: SocketAddr, protocol: Protocol) {
        trace!(%endpoint, %protocol, "expecting traffic");
        self.entries.insert(endpoint, protocol);
    }

    pub fn lookup(&self, endpoint: &SocketAddr) -> Option<Protocol> {
        self.entries.get(endpoint).map(|entry| *entry.value())
    }

    /// Forget `endpoint` if it is still expected for `protocol`.
    pub fn remove(&self, endpoint: &SocketAddr, protocol: Protocol) -> bool {
        self.entries
            .remove_if(endpoint, |_, expected| *expected == protocol)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
