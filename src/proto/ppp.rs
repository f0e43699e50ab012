//! PPP decoder (RFC 1661).

use super::{ensure_len, Decoder, DissectContext, Dissection, LayerInfo, Protocol};
use crate::conntrack::NoFlow;
use crate::error::ParseError;

const PROTO_IPV4: u16 = 0x0021;
const PROTO_CHAP: u16 = 0xc223;

#[derive(Debug, Default)]
pub struct PppDecoder;

impl PppDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for PppDecoder {
    type Flow = NoFlow;

    fn protocol(&self) -> Protocol {
        Protocol::Ppp
    }

    fn dissect(&self, cx: &DissectContext<'_>) -> Result<Dissection, ParseError> {
        ensure_len(cx.data, 1)?;
        // HDLC address and control bytes are optional.
        let offset = if cx.data.starts_with(&[0xff, 0x03]) { 2 } else { 0 };
        ensure_len(cx.data, offset + 1)?;

        // A protocol field with an odd first byte is compressed to one byte.
        let (protocol, header_len) = if cx.data[offset] & 0x01 == 1 {
            (u16::from(cx.data[offset]), offset + 1)
        } else {
            ensure_len(cx.data, offset + 2)?;
            (
                u16::from_be_bytes([cx.data[offset], cx.data[offset + 1]]),
                offset + 2,
            )
        };

        let dissection = Dissection::new(LayerInfo::Ppp { protocol }, header_len);
        Ok(match protocol {
            PROTO_CHAP => dissection.with_next(Protocol::Chap),
            PROTO_IPV4 => dissection.with_next(Protocol::Ipv4),
            _ => dissection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{InputId, LinkType, Packet, Timestamp};
    use crate::proto::{LayerStack, Next};

    fn dissect(bytes: &[u8]) -> Result<Dissection, ParseError> {
        let packet = Packet::new(bytes.to_vec(), Timestamp::ZERO, InputId(0), LinkType::Ppp);
        let stack = LayerStack::new();
        PppDecoder::new().dissect(&DissectContext {
            data: packet.data(),
            stack: &stack,
            packet: &packet,
        })
    }

    #[test]
    fn test_protocol_field_forms() {
        let full = dissect(&[0xff, 0x03, 0xc2, 0x23, 0x01]).unwrap();
        assert_eq!(full.header_len, 4);
        assert_eq!(full.next, Next::Protocol(Protocol::Chap));

        let bare = dissect(&[0x00, 0x21, 0x45]).unwrap();
        assert_eq!(bare.header_len, 2);
        assert_eq!(bare.next, Next::Protocol(Protocol::Ipv4));

        let compressed = dissect(&[0x21, 0x45]).unwrap();
        assert_eq!(compressed.header_len, 1);
        assert_eq!(compressed.info, LayerInfo::Ppp { protocol: 0x21 });
        assert_eq!(compressed.next, Next::Protocol(Protocol::Ipv4));

        let lcp = dissect(&[0xc0, 0x21, 0x01]).unwrap();
        assert_eq!(lcp.next, Next::End);
    }

    #[test]
    fn test_truncated() {
        assert!(dissect(&[]).is_err());
        assert!(dissect(&[0xff, 0x03]).is_err());
        assert!(dissect(&[0xc2]).is_err());
    }
}
