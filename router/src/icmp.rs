//! Locally-originated ICMP: echo replies and the error messages the
//! forwarding pipeline falls back to.

use crate::config::Interface;
use eth_frame::{Frame, make};
use etherparse::Icmpv4Type;
use etherparse::icmpv4::{DestUnreachableHeader, TimeExceededCode};

/// The error messages this router originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpError {
    /// Type 3 code 0: no route for the destination.
    NetUnreachable,
    /// Type 3 code 1: next hop never answered ARP, or the NAT pool is full.
    HostUnreachable,
    /// Type 3 code 3: nothing listens where the packet was aimed.
    PortUnreachable,
    /// Type 11 code 0: TTL ran out in transit.
    TtlExceeded,
}

impl IcmpError {
    fn to_icmp_type(self) -> Icmpv4Type {
        match self {
            IcmpError::NetUnreachable => {
                Icmpv4Type::DestinationUnreachable(DestUnreachableHeader::Network)
            }
            IcmpError::HostUnreachable => {
                Icmpv4Type::DestinationUnreachable(DestUnreachableHeader::Host)
            }
            IcmpError::PortUnreachable => {
                Icmpv4Type::DestinationUnreachable(DestUnreachableHeader::Port)
            }
            IcmpError::TtlExceeded => {
                Icmpv4Type::TimeExceeded(TimeExceededCode::TtlExceededInTransit)
            }
        }
    }
}

/// Builds the error reply for `original`, addressed straight back at its
/// sender (MACs swapped, so no ARP round trip is needed).
///
/// The IPv4 source is the receiving interface, except for port-unreachable
/// where it is the destination the sender was addressing, keeping up the
/// appearance that the intended peer itself refused the packet.
pub fn error_reply(kind: IcmpError, original: &Frame, in_iface: &Interface) -> Option<Frame> {
    let ip = original.as_ipv4()?;
    let orig_src = ip.header().source_addr();
    let orig_dst = ip.header().destination_addr();

    let src_ip = if kind == IcmpError::PortUnreachable {
        orig_dst
    } else {
        in_iface.ip
    };

    let datagram = original.ipv4_datagram()?;

    Some(make::icmp_error(
        original.destination_mac(),
        original.source_mac(),
        src_ip,
        orig_src,
        kind.to_icmp_type(),
        datagram,
    ))
}

/// The echo shortcut: rewrites the request into its reply in place.
///
/// Swaps the IPv4 addresses, flips the ICMP type to echo-reply and
/// recomputes both checksums. Ethernet MACs are set by the caller once the
/// way back is resolved.
pub fn echo_reply_in_place(frame: &mut Frame) {
    let Some(mut ip) = frame.ipv4_header_mut() else {
        return;
    };

    let src = ip.get_source();
    let dst = ip.get_destination();
    ip.set_source(dst);
    ip.set_destination(src);

    if let Some(mut icmp) = frame.icmpv4_header_mut() {
        icmp.set_type(0);
        icmp.set_code(0);
    }

    frame.update_icmpv4_checksum();
    frame.update_ipv4_checksum();
}
