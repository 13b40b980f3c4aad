//! Reading and building the fixed-size Ethernet/IPv4 ARP payload.

use crate::slice_utils::read_be_u16;
use crate::{ARP_LEN, ETHERNET_HEADER_LEN, Frame, FrameError, MacAddr};
use etherparse::EtherType;
use std::net::Ipv4Addr;

const OP_REQUEST: u16 = 1;
const OP_REPLY: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOperation {
    Request,
    Reply,
    Other(u16),
}

/// Read view over a 28-byte ARP payload (hardware = Ethernet, protocol = IPv4).
pub struct ArpSlice<'a> {
    slice: &'a [u8],
}

impl<'a> ArpSlice<'a> {
    pub fn from_slice(slice: &'a [u8]) -> Result<Self, FrameError> {
        if slice.len() < ARP_LEN {
            return Err(FrameError::Malformed("arp"));
        }

        Ok(Self { slice })
    }

    pub fn operation(&self) -> ArpOperation {
        match read_be_u16(self.slice, 6) {
            OP_REQUEST => ArpOperation::Request,
            OP_REPLY => ArpOperation::Reply,
            other => ArpOperation::Other(other),
        }
    }

    pub fn sender_mac(&self) -> MacAddr {
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&self.slice[8..14]);

        MacAddr::new(octets)
    }

    pub fn sender_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.slice[14], self.slice[15], self.slice[16], self.slice[17])
    }

    pub fn target_mac(&self) -> MacAddr {
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&self.slice[18..24]);

        MacAddr::new(octets)
    }

    pub fn target_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.slice[24], self.slice[25], self.slice[26], self.slice[27])
    }
}

/// Builds the broadcast request asking who owns `target_ip`.
///
/// The target hardware address is all-zero; the answer comes back unicast.
pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Frame {
    build(
        OP_REQUEST,
        MacAddr::BROADCAST,
        sender_mac,
        sender_ip,
        MacAddr::ZERO,
        target_ip,
    )
}

/// Builds the unicast reply claiming `sender_ip` for `sender_mac`.
pub fn reply(
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> Frame {
    build(OP_REPLY, target_mac, sender_mac, sender_ip, target_mac, target_ip)
}

fn build(
    op: u16,
    dst_mac: MacAddr,
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> Frame {
    let mut buf = Vec::with_capacity(ETHERNET_HEADER_LEN + ARP_LEN);

    buf.extend_from_slice(&dst_mac.octets());
    buf.extend_from_slice(&sender_mac.octets());
    buf.extend_from_slice(&EtherType::ARP.0.to_be_bytes());

    buf.extend_from_slice(&1u16.to_be_bytes()); // hardware type: Ethernet
    buf.extend_from_slice(&EtherType::IPV4.0.to_be_bytes());
    buf.push(6); // hardware address length
    buf.push(4); // protocol address length
    buf.extend_from_slice(&op.to_be_bytes());
    buf.extend_from_slice(&sender_mac.octets());
    buf.extend_from_slice(&sender_ip.octets());
    buf.extend_from_slice(&target_mac.octets());
    buf.extend_from_slice(&target_ip.octets());

    Frame::from_built(buf)
}
