//! Protocol decoders.
//!
//! Each protocol layer is handled by a [`Decoder`]. The dispatcher walks a
//! packet through the stack in two steps per layer: `dissect` parses the
//! header and names the conntrack key and the next layer, then `process`
//! runs with exclusive access to the decoder's per-flow state.

mod chap;
mod ethernet;
mod expect;
mod ipv4;
mod ppp;
mod pppoe;
mod registry;
mod tftp;
mod udp;

pub use chap::{ChapDecoder, CHAP_CHALLENGE, CHAP_RESPONSE, CHAP_SUCCESS_FAILURE};
pub use ethernet::EthernetDecoder;
pub use expect::Expectations;
pub use ipv4::Ipv4Decoder;
pub use ppp::PppDecoder;
pub use pppoe::PppoeDecoder;
pub use registry::{ProtocolRegistry, ProtocolSlot};
pub use tftp::{TftpDecoder, TftpFlow, TFTP_DATA, TFTP_REQUEST};
pub use udp::{UdpDecoder, UdpFlow};

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::Bytes;
use macaddr::MacAddr6;

use crate::conntrack::{BoxedFlow, ConntrackEntry, ConntrackKey, FlowState};
use crate::error::ParseError;
use crate::event::Event;
use crate::packet::{Packet, Timestamp};

/// Protocols with a built-in decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Ethernet,
    Pppoe,
    Ppp,
    Chap,
    Ipv4,
    Udp,
    Tftp,
}

impl Protocol {
    pub const ALL: [Protocol; 7] = [
        Protocol::Ethernet,
        Protocol::Pppoe,
        Protocol::Ppp,
        Protocol::Chap,
        Protocol::Ipv4,
        Protocol::Udp,
        Protocol::Tftp,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Protocol::Ethernet => "ethernet",
            Protocol::Pppoe => "pppoe",
            Protocol::Ppp => "ppp",
            Protocol::Chap => "chap",
            Protocol::Ipv4 => "ipv4",
            Protocol::Udp => "udp",
            Protocol::Tftp => "tftp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Header facts of one decoded layer, readable by the layers above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerInfo {
    Ethernet {
        src: MacAddr6,
        dst: MacAddr6,
        ethertype: u16,
    },
    Pppoe {
        code: u8,
        session: u16,
    },
    Ppp {
        protocol: u16,
    },
    Chap {
        code: u8,
        identifier: u8,
    },
    Ipv4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        ttl: u8,
    },
    Udp {
        src_port: u16,
        dst_port: u16,
    },
    Tftp {
        opcode: u16,
    },
}

/// One decoded layer of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub protocol: Protocol,
    /// Offset of the header in the packet.
    pub offset: usize,
    /// Header length.
    pub len: usize,
    pub info: LayerInfo,
    /// Id of the conntrack entry this layer belongs to.
    pub conntrack: Option<u64>,
}

/// The layers decoded so far, bottom first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerStack {
    layers: Vec<Layer>,
}

impl LayerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    pub fn last(&self) -> Option<&Layer> {
        self.layers.last()
    }

    /// Nearest layer of `protocol`, searching from the top.
    pub fn find(&self, protocol: Protocol) -> Option<&Layer> {
        self.layers.iter().rev().find(|layer| layer.protocol == protocol)
    }

    pub fn protocols(&self) -> Vec<Protocol> {
        self.layers.iter().map(|layer| layer.protocol).collect()
    }

    pub fn ethernet_addresses(&self) -> Option<(MacAddr6, MacAddr6)> {
        self.layers.iter().rev().find_map(|layer| match layer.info {
            LayerInfo::Ethernet { src, dst, .. } => Some((src, dst)),
            _ => None,
        })
    }

    pub fn ipv4_addresses(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        self.layers.iter().rev().find_map(|layer| match layer.info {
            LayerInfo::Ipv4 { src, dst, .. } => Some((src, dst)),
            _ => None,
        })
    }

    pub fn udp_ports(&self) -> Option<(u16, u16)> {
        self.layers.iter().rev().find_map(|layer| match layer.info {
            LayerInfo::Udp { src_port, dst_port } => Some((src_port, dst_port)),
            _ => None,
        })
    }

    /// Source and destination socket addresses of the nearest UDP layer.
    pub fn udp_endpoints(&self) -> Option<(SocketAddr, SocketAddr)> {
        let (src_port, dst_port) = self.udp_ports()?;
        let (src, dst) = self.ipv4_addresses()?;
        Some((
            SocketAddr::new(IpAddr::V4(src), src_port),
            SocketAddr::new(IpAddr::V4(dst), dst_port),
        ))
    }
}

/// What follows a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Protocol(Protocol),
    End,
}

/// Result of parsing one layer header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dissection {
    pub info: LayerInfo,
    pub header_len: usize,
    /// Bound on the payload, when the header carries a length.
    pub payload_len: Option<usize>,
    pub key: Option<ConntrackKey>,
    /// Only join a flow that already exists; never create one for `key`.
    pub existing_only: bool,
    pub next: Next,
}

impl Dissection {
    pub fn new(info: LayerInfo, header_len: usize) -> Self {
        Self {
            info,
            header_len,
            payload_len: None,
            key: None,
            existing_only: false,
            next: Next::End,
        }
    }

    pub fn with_next(mut self, protocol: Protocol) -> Self {
        self.next = Next::Protocol(protocol);
        self
    }

    pub fn with_key(mut self, key: ConntrackKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Like [`Dissection::with_key`], for packets that can end a flow but
    /// never start one.
    pub fn with_existing_key(mut self, key: ConntrackKey) -> Self {
        self.key = Some(key);
        self.existing_only = true;
        self
    }

    pub fn with_payload_len(mut self, len: usize) -> Self {
        self.payload_len = Some(len);
        self
    }
}

/// Input of [`Decoder::dissect`].
pub struct DissectContext<'a> {
    /// Bytes from the start of this layer to the end of the lower layer's
    /// payload.
    pub data: &'a [u8],
    /// Layers below this one.
    pub stack: &'a LayerStack,
    pub packet: &'a Packet,
}

/// Input of [`Decoder::process`].
pub struct ProcessContext<'a> {
    packet: &'a Packet,
    stack: &'a LayerStack,
    payload: Bytes,
    outbox: Vec<Event>,
    invalidate: bool,
    close: bool,
}

/// What a decoder asked for while processing a layer.
pub(crate) struct Verdict {
    pub events: Vec<Event>,
    pub invalidate: bool,
    pub close: bool,
}

impl<'a> ProcessContext<'a> {
    pub(crate) fn new(packet: &'a Packet, stack: &'a LayerStack, payload: Bytes) -> Self {
        Self {
            packet,
            stack,
            payload,
            outbox: Vec::new(),
            invalidate: false,
            close: false,
        }
    }

    pub fn packet(&self) -> &'a Packet {
        self.packet
    }

    /// Layers so far, this one on top.
    pub fn stack(&self) -> &'a LayerStack {
        self.stack
    }

    /// Bytes after this layer's header, shared with the packet.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn timestamp(&self) -> Timestamp {
        self.packet.timestamp()
    }

    /// Queue an event; it is dispatched as soon as this layer is done.
    pub fn emit(&mut self, event: Event) {
        self.outbox.push(event);
    }

    /// Judge the flow corrupt. Later packets on its key are ignored.
    pub fn mark_invalid(&mut self) {
        self.invalidate = true;
    }

    /// Close the flow once this layer's events are dispatched.
    pub fn close_conntrack(&mut self) {
        self.close = true;
    }

    pub(crate) fn finish(self) -> Verdict {
        Verdict {
            events: self.outbox,
            invalidate: self.invalidate,
            close: self.close,
        }
    }
}

/// A protocol decoder.
pub trait Decoder: Send + Sync + 'static {
    /// Per-flow state kept in the conntrack entry.
    type Flow: FlowState;

    fn protocol(&self) -> Protocol;

    /// Parse this layer's header.
    fn dissect(&self, cx: &DissectContext<'_>) -> Result<Dissection, ParseError>;

    /// State for a flow seen for the first time.
    fn init_flow(&self, _key: &ConntrackKey) -> Option<Self::Flow> {
        None
    }

    /// Update flow state and emit events. `flow` is `None` when the layer
    /// has no conntrack key.
    fn process(
        &self,
        _cx: &mut ProcessContext<'_>,
        _flow: Option<&mut Self::Flow>,
    ) -> Result<(), ParseError> {
        Ok(())
    }
}

/// Object-safe form of [`Decoder`] stored by the registry.
pub(crate) trait DynDecoder: Send + Sync {
    fn protocol(&self) -> Protocol;
    fn dissect(&self, cx: &DissectContext<'_>) -> Result<Dissection, ParseError>;
    fn init_flow(&self, key: &ConntrackKey) -> Option<BoxedFlow>;
    fn process(
        &self,
        cx: &mut ProcessContext<'_>,
        entry: Option<&mut ConntrackEntry>,
    ) -> Result<(), ParseError>;
}

impl<D: Decoder> DynDecoder for D {
    fn protocol(&self) -> Protocol {
        Decoder::protocol(self)
    }

    fn dissect(&self, cx: &DissectContext<'_>) -> Result<Dissection, ParseError> {
        Decoder::dissect(self, cx)
    }

    fn init_flow(&self, key: &ConntrackKey) -> Option<BoxedFlow> {
        Decoder::init_flow(self, key).map(BoxedFlow::new)
    }

    fn process(
        &self,
        cx: &mut ProcessContext<'_>,
        entry: Option<&mut ConntrackEntry>,
    ) -> Result<(), ParseError> {
        let flow = entry
            .and_then(|entry| entry.flow_any_mut())
            .and_then(|any| any.downcast_mut::<D::Flow>());
        Decoder::process(self, cx, flow)
    }
}

fn ensure_len(data: &[u8], expected: usize) -> Result<(), ParseError> {
    if data.len() < expected {
        return Err(ParseError::PacketTooShort {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}
