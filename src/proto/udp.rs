//! UDP decoder.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use pnet::packet::udp::UdpPacket;

use super::{
    ensure_len, Decoder, DissectContext, Dissection, Expectations, LayerInfo, ProcessContext,
    Protocol,
};
use crate::conntrack::{ConntrackKey, FlowState};
use crate::error::ParseError;

const HEADER_LEN: usize = 8;
const TFTP_PORT: u16 = 69;

/// Per-flow counters of a UDP conversation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UdpFlow {
    pub packets: u64,
    pub bytes: u64,
}

impl FlowState for UdpFlow {}

pub struct UdpDecoder {
    expectations: Arc<Expectations>,
}

impl UdpDecoder {
    pub fn new(expectations: Arc<Expectations>) -> Self {
        Self { expectations }
    }

    fn next_protocol(&self, src: &SocketAddr, dst: &SocketAddr) -> Option<Protocol> {
        if let Some(expected) = self
            .expectations
            .lookup(src)
            .or_else(|| self.expectations.lookup(dst))
        {
            return Some(expected);
        }
        (src.port() == TFTP_PORT || dst.port() == TFTP_PORT).then_some(Protocol::Tftp)
    }
}

impl Decoder for UdpDecoder {
    type Flow = UdpFlow;

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn dissect(&self, cx: &DissectContext<'_>) -> Result<Dissection, ParseError> {
        ensure_len(cx.data, HEADER_LEN)?;
        let udp = UdpPacket::new(cx.data).ok_or(ParseError::PacketTooShort {
            expected: HEADER_LEN,
            actual: cx.data.len(),
        })?;

        let length = usize::from(udp.get_length());
        if length < HEADER_LEN || length > cx.data.len() {
            return Err(ParseError::InvalidLength {
                field: "udp_length",
                value: length,
            });
        }

        let (src_ip, dst_ip) = cx
            .stack
            .ipv4_addresses()
            .ok_or(ParseError::MissingLayer("ipv4"))?;
        let src = SocketAddr::new(IpAddr::V4(src_ip), udp.get_source());
        let dst = SocketAddr::new(IpAddr::V4(dst_ip), udp.get_destination());

        let dissection = Dissection::new(
            LayerInfo::Udp {
                src_port: src.port(),
                dst_port: dst.port(),
            },
            HEADER_LEN,
        )
        .with_payload_len(length - HEADER_LEN)
        .with_key(ConntrackKey::endpoints(src, dst));

        Ok(match self.next_protocol(&src, &dst) {
            Some(protocol) => dissection.with_next(protocol),
            None => dissection,
        })
    }

    fn init_flow(&self, _key: &ConntrackKey) -> Option<UdpFlow> {
        Some(UdpFlow::default())
    }

    fn process(
        &self,
        cx: &mut ProcessContext<'_>,
        flow: Option<&mut UdpFlow>,
    ) -> Result<(), ParseError> {
        if let Some(flow) = flow {
            flow.packets += 1;
            flow.bytes += cx.payload().len() as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{InputId, LinkType, Packet, Timestamp};
    use crate::proto::{Layer, LayerStack, Next};
    use crate::testutil;
    use std::net::Ipv4Addr;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn ip_stack() -> LayerStack {
        let mut stack = LayerStack::new();
        stack.push(Layer {
            protocol: Protocol::Ipv4,
            offset: 0,
            len: 20,
            info: LayerInfo::Ipv4 {
                src: CLIENT,
                dst: SERVER,
                protocol: 17,
                ttl: 64,
            },
            conntrack: None,
        });
        stack
    }

    fn dissect(decoder: &UdpDecoder, bytes: Vec<u8>) -> Result<Dissection, ParseError> {
        let packet = Packet::new(bytes, Timestamp::ZERO, InputId(0), LinkType::Ipv4);
        let stack = ip_stack();
        decoder.dissect(&DissectContext {
            data: packet.data(),
            stack: &stack,
            packet: &packet,
        })
    }

    #[test]
    fn test_key_and_length() {
        let decoder = UdpDecoder::new(Arc::new(Expectations::new()));
        let dissection = dissect(&decoder, testutil::udp(5000, 53, b"query")).unwrap();

        assert_eq!(dissection.payload_len, Some(5));
        assert_eq!(dissection.next, Next::End);
        assert_eq!(
            dissection.key,
            Some(ConntrackKey::endpoints(
                "10.0.0.1:53".parse().unwrap(),
                "10.0.0.2:5000".parse().unwrap()
            ))
        );
    }

    #[test]
    fn test_tftp_port_and_expectations() {
        let expectations = Arc::new(Expectations::new());
        let decoder = UdpDecoder::new(expectations.clone());

        let request = dissect(&decoder, testutil::udp(3000, 69, b"\x00\x01")).unwrap();
        assert_eq!(request.next, Next::Protocol(Protocol::Tftp));

        let data = testutil::udp(3000, 40000, b"\x00\x04\x00\x01");
        assert_eq!(dissect(&decoder, data.clone()).unwrap().next, Next::End);

        expectations.expect("10.0.0.2:3000".parse().unwrap(), Protocol::Tftp);
        assert_eq!(
            dissect(&decoder, data).unwrap().next,
            Next::Protocol(Protocol::Tftp)
        );
    }

    #[test]
    fn test_bad_length_field() {
        let decoder = UdpDecoder::new(Arc::new(Expectations::new()));
        let mut bytes = testutil::udp(1, 2, b"abc");
        bytes[4] = 0;
        bytes[5] = 4;
        assert_eq!(
            dissect(&decoder, bytes).unwrap_err(),
            ParseError::InvalidLength {
                field: "udp_length",
                value: 4
            }
        );
    }

    #[test]
    fn test_requires_ip_below() {
        let decoder = UdpDecoder::new(Arc::new(Expectations::new()));
        let packet = Packet::new(testutil::udp(1, 2, b""), Timestamp::ZERO, InputId(0), LinkType::Ipv4);
        let stack = LayerStack::new();
        let err = decoder
            .dissect(&DissectContext {
                data: packet.data(),
                stack: &stack,
                packet: &packet,
            })
            .unwrap_err();
        assert_eq!(err, ParseError::MissingLayer("ipv4"));
    }
}
