//! IPv4 decoder.

use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Flags, Ipv4Packet};
use tracing::trace;

use super::{ensure_len, Decoder, DissectContext, Dissection, LayerInfo, Protocol};
use crate::conntrack::NoFlow;
use crate::error::ParseError;

const MIN_HEADER_LEN: usize = 20;

/// Decodes IPv4 headers. Fragments are not reassembled; the walk ends at
/// the IP layer for them.
#[derive(Debug, Default)]
pub struct Ipv4Decoder;

impl Ipv4Decoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for Ipv4Decoder {
    type Flow = NoFlow;

    fn protocol(&self) -> Protocol {
        Protocol::Ipv4
    }

    fn dissect(&self, cx: &DissectContext<'_>) -> Result<Dissection, ParseError> {
        ensure_len(cx.data, MIN_HEADER_LEN)?;
        let ip = Ipv4Packet::new(cx.data).ok_or(ParseError::PacketTooShort {
            expected: MIN_HEADER_LEN,
            actual: cx.data.len(),
        })?;

        let version = ip.get_version();
        if version != 4 {
            return Err(ParseError::UnsupportedVersion(version));
        }

        let header_len = usize::from(ip.get_header_length()) * 4;
        if header_len < MIN_HEADER_LEN || header_len > cx.data.len() {
            return Err(ParseError::InvalidLength {
                field: "ihl",
                value: header_len,
            });
        }

        let total_len = usize::from(ip.get_total_length());
        if total_len < header_len || total_len > cx.data.len() {
            return Err(ParseError::InvalidLength {
                field: "total_length",
                value: total_len,
            });
        }

        let protocol = ip.get_next_level_protocol();
        let dissection = Dissection::new(
            LayerInfo::Ipv4 {
                src: ip.get_source(),
                dst: ip.get_destination(),
                protocol: protocol.0,
                ttl: ip.get_ttl(),
            },
            header_len,
        )
        .with_payload_len(total_len - header_len);

        let fragmented =
            ip.get_flags() & Ipv4Flags::MoreFragments != 0 || ip.get_fragment_offset() != 0;
        if fragmented {
            trace!(src = %ip.get_source(), dst = %ip.get_destination(), "ipv4 fragment, not reassembled");
            return Ok(dissection);
        }

        Ok(if protocol == IpNextHeaderProtocols::Udp {
            dissection.with_next(Protocol::Udp)
        } else {
            dissection
        })
    }
}
