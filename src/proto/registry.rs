//! Protocol registry.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{
    ChapDecoder, Decoder, DynDecoder, EthernetDecoder, Expectations, Ipv4Decoder, PppDecoder,
    PppoeDecoder, Protocol, TftpDecoder, UdpDecoder,
};
use crate::conntrack::ConntrackTable;
use crate::error::EngineError;
use crate::event::EventBus;

/// A registered decoder and the conntrack table of its flows.
pub struct ProtocolSlot {
    decoder: Box<dyn DynDecoder>,
    conntracks: ConntrackTable,
}

impl ProtocolSlot {
    pub(crate) fn decoder(&self) -> &dyn DynDecoder {
        self.decoder.as_ref()
    }

    pub fn conntracks(&self) -> &ConntrackTable {
        &self.conntracks
    }
}

/// Maps each protocol to its decoder.
pub struct ProtocolRegistry {
    slots: HashMap<Protocol, ProtocolSlot>,
    max_conntracks: usize,
}

impl ProtocolRegistry {
    /// An empty registry whose tables hold at most `max_conntracks` flows
    /// each.
    pub fn new(max_conntracks: usize) -> Self {
        Self {
            slots: HashMap::new(),
            max_conntracks,
        }
    }

    /// A registry with every built-in decoder.
    pub fn with_defaults(
        bus: &EventBus,
        expectations: Arc<Expectations>,
        max_conntracks: usize,
    ) -> Result<Self, EngineError> {
        let mut registry = Self::new(max_conntracks);
        registry.register(EthernetDecoder::new())?;
        registry.register(PppoeDecoder::new())?;
        registry.register(PppDecoder::new())?;
        registry.register(ChapDecoder::new(bus)?)?;
        registry.register(Ipv4Decoder::new())?;
        registry.register(UdpDecoder::new(expectations.clone()))?;
        registry.register(TftpDecoder::new(bus, expectations)?)?;
        Ok(registry)
    }

    pub fn register<D: Decoder>(&mut self, decoder: D) -> Result<(), EngineError> {
        let protocol = Decoder::protocol(&decoder);
        if self.slots.contains_key(&protocol) {
            return Err(EngineError::DuplicateProtocol(protocol));
        }
        debug!(%protocol, "registered decoder");
        self.slots.insert(
            protocol,
            ProtocolSlot {
                decoder: Box::new(decoder),
                conntracks: ConntrackTable::new(protocol, self.max_conntracks),
            },
        );
        Ok(())
    }

    pub fn slot(&self, protocol: Protocol) -> Option<&ProtocolSlot> {
        self.slots.get(&protocol)
    }

    pub fn conntracks(&self, protocol: Protocol) -> Option<&ConntrackTable> {
        self.slot(protocol).map(ProtocolSlot::conntracks)
    }

    /// Registered protocols, sorted.
    pub fn protocols(&self) -> Vec<Protocol> {
        let mut protocols: Vec<Protocol> = self.slots.keys().copied().collect();
        protocols.sort();
        protocols
    }

    /// Every conntrack table, sorted by protocol.
    pub fn tables(&self) -> Vec<&ConntrackTable> {
        self.protocols()
            .into_iter()
            .filter_map(|protocol| self.conntracks(protocol))
            .collect()
    }
}
