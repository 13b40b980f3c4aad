//! Factory functions for the frames the router originates, plus the
//! traffic-shaped frames the tests inject.

use crate::{ETHERNET_HEADER_LEN, Frame, MacAddr};
use etherparse::{
    Ethernet2Header, EtherType, Icmpv4Header, Icmpv4Type, IpNumber, Ipv4Header, PacketBuilder,
};
use std::net::Ipv4Addr;

/// How much of the offending datagram an ICMP error quotes: the IPv4 header
/// plus eight payload bytes.
pub const ICMP_ERROR_QUOTE_LEN: usize = 28;

/// Builds a full ICMP error frame (destination-unreachable or time-exceeded).
///
/// Header fields follow what routers conventionally emit: TTL 64,
/// identification 1, don't-fragment set, and a fixed-size quote of the
/// original datagram (zero-padded if the datagram was shorter).
pub fn icmp_error(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    icmp_type: Icmpv4Type,
    original_datagram: &[u8],
) -> Frame {
    let mut quote = [0u8; ICMP_ERROR_QUOTE_LEN];
    let n = original_datagram.len().min(ICMP_ERROR_QUOTE_LEN);
    quote[..n].copy_from_slice(&original_datagram[..n]);

    let icmp = Icmpv4Header::with_checksum(icmp_type, &quote);

    let payload_len = (icmp.header_len() + ICMP_ERROR_QUOTE_LEN) as u16;
    let mut ip = Ipv4Header::new(
        payload_len,
        64,
        IpNumber::ICMP,
        src_ip.octets(),
        dst_ip.octets(),
    )
    .expect("a 36-byte ICMP message always fits an IPv4 payload");
    ip.identification = 1;
    ip.dont_fragment = true;

    let eth = Ethernet2Header {
        source: src_mac.octets(),
        destination: dst_mac.octets(),
        ether_type: EtherType::IPV4,
    };

    let mut buf =
        Vec::with_capacity(ETHERNET_HEADER_LEN + ip.header_len() + payload_len as usize);
    eth.write(&mut buf).expect("writing to a Vec cannot fail");
    ip.write(&mut buf).expect("writing to a Vec cannot fail");
    icmp.write(&mut buf).expect("writing to a Vec cannot fail");
    buf.extend_from_slice(&quote);

    Frame::from_built(buf)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpFlags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    /// `Some` sets the ACK flag and the acknowledgment number.
    pub ack: Option<u32>,
}

pub fn tcp_frame(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv4Addr,
    src_port: u16,
    dst_ip: Ipv4Addr,
    dst_port: u16,
    seq: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Frame {
    let mut builder = PacketBuilder::ethernet2(src_mac.octets(), dst_mac.octets())
        .ipv4(src_ip.octets(), dst_ip.octets(), 64)
        .tcp(src_port, dst_port, seq, 64240);

    if flags.syn {
        builder = builder.syn();
    }
    if flags.fin {
        builder = builder.fin();
    }
    if flags.rst {
        builder = builder.rst();
    }
    if let Some(ack) = flags.ack {
        builder = builder.ack(ack);
    }

    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut buf, payload)
        .expect("writing to a Vec cannot fail");

    Frame::from_built(buf)
}

pub fn udp_frame(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv4Addr,
    src_port: u16,
    dst_ip: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> Frame {
    let builder = PacketBuilder::ethernet2(src_mac.octets(), dst_mac.octets())
        .ipv4(src_ip.octets(), dst_ip.octets(), 64)
        .udp(src_port, dst_port);

    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut buf, payload)
        .expect("writing to a Vec cannot fail");

    Frame::from_built(buf)
}

pub fn icmp_echo_request(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    id: u16,
    seq: u16,
    payload: &[u8],
) -> Frame {
    let builder = PacketBuilder::ethernet2(src_mac.octets(), dst_mac.octets())
        .ipv4(src_ip.octets(), dst_ip.octets(), 64)
        .icmpv4_echo_request(id, seq);

    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut buf, payload)
        .expect("writing to a Vec cannot fail");

    Frame::from_built(buf)
}

pub fn icmp_echo_reply(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    id: u16,
    seq: u16,
    payload: &[u8],
) -> Frame {
    let builder = PacketBuilder::ethernet2(src_mac.octets(), dst_mac.octets())
        .ipv4(src_ip.octets(), dst_ip.octets(), 64)
        .icmpv4_echo_reply(id, seq);

    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut buf, payload)
        .expect("writing to a Vec cannot fail");

    Frame::from_built(buf)
}
