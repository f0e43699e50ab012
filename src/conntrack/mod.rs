//! Connection tracking.
//!
//! A conntrack entry holds the state of one logical flow across packets:
//! the private state of the decoder that owns the flow and the state that
//! analyzers attach to it. Tables are protocol-agnostic; each decoder
//! defines its own key and flow state type.

mod attach;
mod entry;
mod table;

pub use attach::{AnalyzerId, Attachment};
pub use entry::{BoxedFlow, ConntrackEntry, FlowState, NoFlow};
pub use table::{ConntrackTable, EntryGuard, EntryHandle, Lookup, TableStats};

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use macaddr::MacAddr6;

/// Protocol-specific flow key.
///
/// Bidirectional keys are normalized so both directions of a flow map to
/// the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConntrackKey {
    /// Transport flow between two endpoints, lower endpoint first.
    Endpoints { a: SocketAddr, b: SocketAddr },
    /// File transfer identified by the client endpoint and the server address.
    Transfer { client: SocketAddr, server: IpAddr },
    /// PPPoE session between two stations, lower address first.
    Session { id: u16, a: [u8; 6], b: [u8; 6] },
}

impl ConntrackKey {
    pub fn endpoints(x: SocketAddr, y: SocketAddr) -> Self {
        if x <= y {
            ConntrackKey::Endpoints { a: x, b: y }
        } else {
            ConntrackKey::Endpoints { a: y, b: x }
        }
    }

    pub fn transfer(client: SocketAddr, server: IpAddr) -> Self {
        ConntrackKey::Transfer { client, server }
    }

    pub fn session(id: u16, x: MacAddr6, y: MacAddr6) -> Self {
        let (x, y) = (x.into_array(), y.into_array());
        if x <= y {
            ConntrackKey::Session { id, a: x, b: y }
        } else {
            ConntrackKey::Session { id, a: y, b: x }
        }
    }
}

impl fmt::Display for ConntrackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConntrackKey::Endpoints { a, b } => write!(f, "{} <-> {}", a, b),
            ConntrackKey::Transfer { client, server } => write!(f, "{} -> {}", client, server),
            ConntrackKey::Session { id, a, b } => write!(
                f,
                "session {:#06x} {} <-> {}",
                id,
                MacAddr6::from(*a),
                MacAddr6::from(*b)
            ),
        }
    }
}
