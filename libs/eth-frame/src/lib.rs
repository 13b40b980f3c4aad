//! Typed views over raw Ethernet II frames.
//!
//! A [`Frame`] owns the bytes received from (or destined for) a link and
//! validates the Ethernet header plus the carried ARP or IPv4 payload once,
//! at construction. Read access goes through `etherparse`'s slice types;
//! the fields a router rewrites (MACs, addresses, TTL, ports, ICMP
//! identifier, checksums) are mutated in place through the `*SliceMut`
//! views, which cannot invalidate the layout checked by the constructor.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod arp;
pub mod make;

mod icmpv4_header_slice_mut;
mod ipv4_header_slice_mut;
mod mac;
mod slice_utils;
mod tcp_header_slice_mut;

pub use icmpv4_header_slice_mut::Icmpv4HeaderSliceMut;
pub use ipv4_header_slice_mut::Ipv4HeaderSliceMut;
pub use mac::{InvalidMacAddr, MacAddr};
pub use tcp_header_slice_mut::TcpHeaderSliceMut;

use etherparse::{EtherType, Icmpv4Slice, IpNumber, Ipv4Slice, TcpSlice, UdpSlice};
use std::net::Ipv4Addr;
use std::ops::Range;

/// Length of an Ethernet II header.
pub const ETHERNET_HEADER_LEN: usize = 14;
/// Largest frame accepted or produced, Ethernet header included.
pub const MTU: usize = 1514;
/// Length of the ARP payload carried by every frame we send or accept.
pub const ARP_LEN: usize = 28;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {0} bytes is shorter than an Ethernet header")]
    Truncated(usize),
    #[error("frame of {0} bytes exceeds the MTU")]
    OverMtu(usize),
    #[error("unhandled ethertype {0:#06x}")]
    UnhandledEtherType(u16),
    #[error("malformed {0} payload")]
    Malformed(&'static str),
}

/// An owned, admission-checked Ethernet II frame carrying ARP or IPv4.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    buf: Vec<u8>,
}

impl Frame {
    pub fn parse(buf: Vec<u8>) -> Result<Self, FrameError> {
        if buf.len() < ETHERNET_HEADER_LEN {
            return Err(FrameError::Truncated(buf.len()));
        }

        if buf.len() > MTU {
            return Err(FrameError::OverMtu(buf.len()));
        }

        let ether_type = EtherType(slice_utils::read_be_u16(&buf, 12));

        match ether_type {
            EtherType::ARP => {
                arp::ArpSlice::from_slice(&buf[ETHERNET_HEADER_LEN..])?;
            }
            EtherType::IPV4 => {
                Ipv4Slice::from_slice(&buf[ETHERNET_HEADER_LEN..])
                    .map_err(|_| FrameError::Malformed("ipv4"))?;
            }
            other => return Err(FrameError::UnhandledEtherType(other.0)),
        }

        Ok(Self { buf })
    }

    /// Wraps bytes produced by one of our own builders.
    pub(crate) fn from_built(buf: Vec<u8>) -> Self {
        debug_assert!(Self::parse(buf.clone()).is_ok());

        Self { buf }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn ether_type(&self) -> EtherType {
        EtherType(slice_utils::read_be_u16(&self.buf, 12))
    }

    pub fn destination_mac(&self) -> MacAddr {
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&self.buf[0..6]);

        MacAddr::new(octets)
    }

    pub fn source_mac(&self) -> MacAddr {
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&self.buf[6..12]);

        MacAddr::new(octets)
    }

    pub fn set_destination_mac(&mut self, mac: MacAddr) {
        slice_utils::write_to_offset(&mut self.buf, 0, mac.octets());
    }

    pub fn set_source_mac(&mut self, mac: MacAddr) {
        slice_utils::write_to_offset(&mut self.buf, 6, mac.octets());
    }

    pub fn as_arp(&self) -> Option<arp::ArpSlice<'_>> {
        if self.ether_type() != EtherType::ARP {
            return None;
        }

        arp::ArpSlice::from_slice(&self.buf[ETHERNET_HEADER_LEN..]).ok()
    }

    pub fn as_ipv4(&self) -> Option<Ipv4Slice<'_>> {
        if self.ether_type() != EtherType::IPV4 {
            return None;
        }

        Ipv4Slice::from_slice(&self.buf[ETHERNET_HEADER_LEN..]).ok()
    }

    pub fn ipv4_source(&self) -> Option<Ipv4Addr> {
        Some(self.as_ipv4()?.header().source_addr())
    }

    pub fn ipv4_destination(&self) -> Option<Ipv4Addr> {
        Some(self.as_ipv4()?.header().destination_addr())
    }

    pub fn ipv4_protocol(&self) -> Option<IpNumber> {
        Some(self.as_ipv4()?.header().protocol())
    }

    pub fn ttl(&self) -> Option<u8> {
        Some(self.as_ipv4()?.header().ttl())
    }

    /// The IPv4 datagram (header plus payload), bounded by the total length
    /// field so link-layer padding is excluded.
    pub fn ipv4_datagram(&self) -> Option<&[u8]> {
        let ip = self.as_ipv4()?;
        let total = ip.header().total_len() as usize;

        self.buf
            .get(ETHERNET_HEADER_LEN..ETHERNET_HEADER_LEN + total)
    }

    pub fn as_icmpv4(&self) -> Option<Icmpv4Slice<'_>> {
        let ip = self.as_ipv4()?;

        if ip.payload().ip_number != IpNumber::ICMP {
            return None;
        }

        Icmpv4Slice::from_slice(ip.payload().payload).ok()
    }

    pub fn as_tcp(&self) -> Option<TcpSlice<'_>> {
        let ip = self.as_ipv4()?;

        if ip.payload().ip_number != IpNumber::TCP {
            return None;
        }

        TcpSlice::from_slice(ip.payload().payload).ok()
    }

    pub fn as_udp(&self) -> Option<UdpSlice<'_>> {
        let ip = self.as_ipv4()?;

        if ip.payload().ip_number != IpNumber::UDP {
            return None;
        }

        UdpSlice::from_slice(ip.payload().payload).ok()
    }

    pub fn ipv4_header_mut(&mut self) -> Option<Ipv4HeaderSliceMut<'_>> {
        if self.ether_type() != EtherType::IPV4 {
            return None;
        }

        Ipv4HeaderSliceMut::from_slice(&mut self.buf[ETHERNET_HEADER_LEN..]).ok()
    }

    pub fn icmpv4_header_mut(&mut self) -> Option<Icmpv4HeaderSliceMut<'_>> {
        let range = self.l4_range(IpNumber::ICMP)?;

        Icmpv4HeaderSliceMut::from_slice(&mut self.buf[range]).ok()
    }

    pub fn tcp_header_mut(&mut self) -> Option<TcpHeaderSliceMut<'_>> {
        let range = self.l4_range(IpNumber::TCP)?;

        TcpHeaderSliceMut::from_slice(&mut self.buf[range]).ok()
    }

    pub fn update_ipv4_checksum(&mut self) {
        let Some(ip) = self.as_ipv4() else {
            return;
        };

        let checksum = ip.header().to_header().calc_header_checksum();

        let Some(mut header) = self.ipv4_header_mut() else {
            return;
        };

        header.set_checksum(checksum);
    }

    /// Recomputes the ICMP checksum over the actual ICMP length (header plus
    /// payload as bounded by the IPv4 total length).
    pub fn update_icmpv4_checksum(&mut self) {
        let Some(icmp) = self.as_icmpv4() else {
            return;
        };

        let checksum = icmp.icmp_type().calc_checksum(icmp.payload());

        let Some(mut header) = self.icmpv4_header_mut() else {
            return;
        };

        header.set_checksum(checksum);
    }

    pub fn update_tcp_checksum(&mut self) {
        let Some(ip) = self.as_ipv4() else {
            return;
        };
        let Some(tcp) = self.as_tcp() else {
            return;
        };

        let Ok(checksum) = tcp
            .to_header()
            .calc_checksum_ipv4(&ip.header().to_header(), tcp.payload())
        else {
            return;
        };

        let Some(mut header) = self.tcp_header_mut() else {
            return;
        };

        header.set_checksum(checksum);
    }

    /// Drops the TTL by one and fixes the header checksum.
    ///
    /// The caller has already established that the TTL is above one.
    pub fn decrement_ttl(&mut self) {
        let Some(mut header) = self.ipv4_header_mut() else {
            return;
        };

        let ttl = header.get_ttl();
        header.set_ttl(ttl.saturating_sub(1));

        self.update_ipv4_checksum();
    }

    fn l4_range(&self, proto: IpNumber) -> Option<Range<usize>> {
        let ip = self.as_ipv4()?;

        if ip.payload().ip_number != proto {
            return None;
        }

        let header_len = ip.header().ihl() as usize * 4;
        let total_len = ip.header().total_len() as usize;

        let start = ETHERNET_HEADER_LEN + header_len;
        let end = ETHERNET_HEADER_LEN + total_len;

        (start <= end && end <= self.buf.len()).then_some(start..end)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("Frame");

        dbg.field("src_mac", &self.source_mac())
            .field("dst_mac", &self.destination_mac());

        if let Some(arp) = self.as_arp() {
            dbg.field("arp_op", &arp.operation())
                .field("arp_sender", &arp.sender_ip())
                .field("arp_target", &arp.target_ip());
        }

        if let Some(ip) = self.as_ipv4() {
            dbg.field("src", &ip.header().source_addr())
                .field("dst", &ip.header().destination_addr())
                .field("ttl", &ip.header().ttl());
        }

        if let Some(icmp) = self.as_icmpv4() {
            dbg.field("icmp_type", &icmp.type_u8())
                .field("icmp_code", &icmp.code_u8());
        }

        if let Some(tcp) = self.as_tcp() {
            dbg.field("src_port", &tcp.source_port())
                .field("dst_port", &tcp.destination_port());

            if tcp.syn() {
                dbg.field("syn", &true);
            }

            if tcp.fin() {
                dbg.field("fin", &true);
            }
        }

        if let Some(udp) = self.as_udp() {
            dbg.field("src_port", &udp.source_port())
                .field("dst_port", &udp.destination_port());
        }

        dbg.finish()
    }
}
