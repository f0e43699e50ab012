//! Ethernet II decoder.

use macaddr::MacAddr6;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};

use super::{ensure_len, Decoder, DissectContext, Dissection, LayerInfo, Protocol};
use crate::conntrack::NoFlow;
use crate::error::ParseError;

const HEADER_LEN: usize = 14;

const ETHERTYPE_PPPOE_DISCOVERY: u16 = 0x8863;
const ETHERTYPE_PPPOE_SESSION: u16 = 0x8864;

#[derive(Debug, Default)]
pub struct EthernetDecoder;

impl EthernetDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for EthernetDecoder {
    type Flow = NoFlow;

    fn protocol(&self) -> Protocol {
        Protocol::Ethernet
    }

    fn dissect(&self, cx: &DissectContext<'_>) -> Result<Dissection, ParseError> {
        ensure_len(cx.data, HEADER_LEN)?;
        let frame = EthernetPacket::new(cx.data).ok_or(ParseError::PacketTooShort {
            expected: HEADER_LEN,
            actual: cx.data.len(),
        })?;

        let src = MacAddr6::from(frame.get_source().octets());
        let dst = MacAddr6::from(frame.get_destination().octets());
        let ethertype = frame.get_ethertype();

        let dissection = Dissection::new(
            LayerInfo::Ethernet {
                src,
                dst,
                ethertype: ethertype.0,
            },
            HEADER_LEN,
        );

        Ok(match ethertype.0 {
            t if t == EtherTypes::Ipv4.0 => dissection.with_next(Protocol::Ipv4),
            ETHERTYPE_PPPOE_DISCOVERY | ETHERTYPE_PPPOE_SESSION => {
                dissection.with_next(Protocol::Pppoe)
            }
            _ => dissection,
        })
    }
}
