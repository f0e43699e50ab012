//! Frame builders for tests.

use std::net::Ipv4Addr;

use macaddr::MacAddr6;

pub const CLIENT_MAC: MacAddr6 = MacAddr6::new(0x02, 0x00, 0x00, 0x00, 0x00, 0x14);
pub const SERVER_MAC: MacAddr6 = MacAddr6::new(0x02, 0x00, 0x00, 0x00, 0x00, 0x01);

pub fn ethernet(src: MacAddr6, dst: MacAddr6, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(14 + payload.len());
    frame.extend_from_slice(dst.as_bytes());
    frame.extend_from_slice(src.as_bytes());
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

pub fn ipv4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
    let total = (20 + payload.len()) as u16;
    let mut datagram = vec![0x45, 0x00];
    datagram.extend_from_slice(&total.to_be_bytes());
    datagram.extend_from_slice(&[0x00, 0x01, 0x40, 0x00, 64, protocol, 0x00, 0x00]);
    datagram.extend_from_slice(&src.octets());
    datagram.extend_from_slice(&dst.octets());
    datagram.extend_from_slice(payload);
    datagram
}

pub fn udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let length = (8 + payload.len()) as u16;
    let mut datagram = Vec::with_capacity(usize::from(length));
    datagram.extend_from_slice(&src_port.to_be_bytes());
    datagram.extend_from_slice(&dst_port.to_be_bytes());
    datagram.extend_from_slice(&length.to_be_bytes());
    datagram.extend_from_slice(&[0x00, 0x00]);
    datagram.extend_from_slice(payload);
    datagram
}

pub fn ethernet_ipv4_udp(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16), payload: &[u8]) -> Vec<u8> {
    ethernet(
        CLIENT_MAC,
        SERVER_MAC,
        0x0800,
        &ipv4(src.0, dst.0, 17, &udp(src.1, dst.1, payload)),
    )
}

fn nul_terminated(out: &mut Vec<u8>, parts: &[&str]) {
    for part in parts {
        out.extend_from_slice(part.as_bytes());
        out.push(0);
    }
}

pub fn tftp_rrq(filename: &str, mode: &str) -> Vec<u8> {
    tftp_rrq_with_options(filename, mode, &[])
}

pub fn tftp_rrq_with_options(filename: &str, mode: &str, options: &[(&str, &str)]) -> Vec<u8> {
    let mut packet = vec![0x00, 0x01];
    nul_terminated(&mut packet, &[filename, mode]);
    for (name, value) in options {
        nul_terminated(&mut packet, &[name, value]);
    }
    packet
}

pub fn tftp_wrq(filename: &str, mode: &str) -> Vec<u8> {
    let mut packet = vec![0x00, 0x02];
    nul_terminated(&mut packet, &[filename, mode]);
    packet
}

pub fn tftp_data(block: u16, content: &[u8]) -> Vec<u8> {
    let mut packet = vec![0x00, 0x03];
    packet.extend_from_slice(&block.to_be_bytes());
    packet.extend_from_slice(content);
    packet
}

pub fn tftp_ack(block: u16) -> Vec<u8> {
    let mut packet = vec![0x00, 0x04];
    packet.extend_from_slice(&block.to_be_bytes());
    packet
}

pub fn tftp_oack(options: &[(&str, &str)]) -> Vec<u8> {
    let mut packet = vec![0x00, 0x06];
    for (name, value) in options {
        nul_terminated(&mut packet, &[name, value]);
    }
    packet
}

/// PPPoE session frame carrying a PPP frame with address/control bytes.
pub fn pppoe_ppp(
    src: MacAddr6,
    dst: MacAddr6,
    session: u16,
    ppp_protocol: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut ppp = vec![0xff, 0x03];
    ppp.extend_from_slice(&ppp_protocol.to_be_bytes());
    ppp.extend_from_slice(payload);

    let mut pppoe = vec![0x11, 0x00];
    pppoe.extend_from_slice(&session.to_be_bytes());
    pppoe.extend_from_slice(&(ppp.len() as u16).to_be_bytes());
    pppoe.extend_from_slice(&ppp);
    ethernet(src, dst, 0x8864, &pppoe)
}

pub fn pppoe_padt(src: MacAddr6, dst: MacAddr6, session: u16) -> Vec<u8> {
    let mut pppoe = vec![0x11, 0xa7];
    pppoe.extend_from_slice(&session.to_be_bytes());
    pppoe.extend_from_slice(&[0x00, 0x00]);
    ethernet(src, dst, 0x8863, &pppoe)
}

/// CHAP challenge or response (`code` 1 or 2).
pub fn chap_value(code: u8, identifier: u8, value: &[u8], name: &str) -> Vec<u8> {
    let length = (4 + 1 + value.len() + name.len()) as u16;
    let mut packet = vec![code, identifier];
    packet.extend_from_slice(&length.to_be_bytes());
    packet.push(value.len() as u8);
    packet.extend_from_slice(value);
    packet.extend_from_slice(name.as_bytes());
    packet
}

/// CHAP success (`code` 3) or failure (4).
pub fn chap_result(code: u8, identifier: u8, message: &str) -> Vec<u8> {
    let length = (4 + message.len()) as u16;
    let mut packet = vec![code, identifier];
    packet.extend_from_slice(&length.to_be_bytes());
    packet.extend_from_slice(message.as_bytes());
    packet
}

pub fn pppoe_chap(src: MacAddr6, dst: MacAddr6, session: u16, chap: &[u8]) -> Vec<u8> {
    pppoe_ppp(src, dst, session, 0xc223, chap)
}
