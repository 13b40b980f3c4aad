//! The per-frame state machine: classification, the ARP path, local
//! delivery, plain forwarding, and the NAT rewrite paths.
//!
//! [`Pipeline::handle_frame`] is total: every branch ends in a (possibly
//! empty) list of [`Transmit`]s, never an error. Frame I/O happens in the
//! caller, outside any table lock.

use crate::arp_cache::{ArpCache, ArpProbe, QueuedFrame};
use crate::config::{Interface, Role, RouterConfig};
use crate::icmp::{self, IcmpError};
use crate::nat::{Direction, MappingKind, NatTable, SegmentMeta};
use eth_frame::arp::ArpOperation;
use eth_frame::{Frame, MacAddr, arp};
use etherparse::{EtherType, Icmpv4Type, IpNumber};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

/// Outbound TCP connections to this port are refused.
const RESTRICTED_TCP_PORT: u16 = 22;

/// A frame ready for transmission, keyed by egress interface.
#[derive(Debug)]
pub struct Transmit {
    pub iface: String,
    pub frame: Frame,
}

pub struct Pipeline {
    config: Arc<RouterConfig>,
    arp: Arc<ArpCache>,
    nat: Arc<NatTable>,
}

impl Pipeline {
    pub fn new(config: Arc<RouterConfig>, arp: Arc<ArpCache>, nat: Arc<NatTable>) -> Self {
        Self { config, arp, nat }
    }

    /// Runs one received frame through the router.
    pub fn handle_frame(&self, bytes: Vec<u8>, in_iface: &str, now: Instant) -> Vec<Transmit> {
        let frame = match Frame::parse(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::trace!(iface = in_iface, "Dropping frame: {e}");

                return Vec::new();
            }
        };

        let Some(iface) = self.config.interface(in_iface) else {
            tracing::debug!(iface = in_iface, "Frame from unconfigured interface");

            return Vec::new();
        };

        match frame.ether_type() {
            EtherType::ARP => self.handle_arp(&frame, iface, now),
            EtherType::IPV4 => self.handle_ipv4(frame, iface, now),
            _ => Vec::new(),
        }
    }

    fn handle_arp(&self, frame: &Frame, in_iface: &Interface, now: Instant) -> Vec<Transmit> {
        let Some(arp_packet) = frame.as_arp() else {
            return Vec::new();
        };

        let op = arp_packet.operation();
        let sender_mac = arp_packet.sender_mac();
        let sender_ip = arp_packet.sender_ip();
        let target_ip = arp_packet.target_ip();

        // ARP that does not concern one of our addresses is not ours to
        // answer or to learn from.
        let Some(owner) = self.config.interface_by_ip(target_ip) else {
            tracing::trace!(%target_ip, "ARP not for this router");

            return Vec::new();
        };

        match op {
            ArpOperation::Request => {
                tracing::trace!(%sender_ip, %target_ip, "Answering ARP request");

                vec![Transmit {
                    iface: in_iface.name.clone(),
                    frame: arp::reply(owner.mac, owner.ip, sender_mac, sender_ip),
                }]
            }
            ArpOperation::Reply => {
                let Some(pending) = self.arp.insert(sender_ip, sender_mac, now) else {
                    return Vec::new();
                };

                pending
                    .frames
                    .into_iter()
                    .map(|queued| self.release_queued(queued, sender_mac, in_iface))
                    .collect()
            }
            ArpOperation::Other(op) => {
                tracing::trace!(op, "Ignoring unknown ARP operation");

                Vec::new()
            }
        }
    }

    /// A parked frame can finally leave. Echo requests addressed to the
    /// router turn into replies here: they were queued while the way back
    /// to their sender resolved.
    fn release_queued(
        &self,
        queued: QueuedFrame,
        resolved: MacAddr,
        out_iface: &Interface,
    ) -> Transmit {
        let mut frame = queued.frame;

        let local_echo = frame
            .as_icmpv4()
            .is_some_and(|icmp| matches!(icmp.icmp_type(), Icmpv4Type::EchoRequest(_)))
            && frame
                .ipv4_destination()
                .is_some_and(|dst| self.config.is_local_ip(dst));

        if local_echo {
            icmp::echo_reply_in_place(&mut frame);
        }

        frame.set_destination_mac(resolved);
        frame.set_source_mac(out_iface.mac);

        Transmit {
            iface: out_iface.name.clone(),
            frame,
        }
    }

    fn handle_ipv4(&self, frame: Frame, in_iface: &Interface, now: Instant) -> Vec<Transmit> {
        let Some(dst) = frame.ipv4_destination() else {
            return Vec::new();
        };

        if self.config.nat_enabled {
            return match in_iface.role {
                Role::Internal if self.config.is_local_ip(dst) => {
                    self.deliver_local(frame, in_iface, now)
                }
                Role::Internal => self.forward_outbound_nat(frame, in_iface, now),
                Role::External => self.forward_inbound_nat(frame, in_iface, now),
            };
        }

        if self.config.is_local_ip(dst) {
            self.deliver_local(frame, in_iface, now)
        } else {
            self.forward_plain(frame, in_iface, now)
        }
    }

    /// The datagram is addressed to one of our interfaces.
    fn deliver_local(&self, frame: Frame, in_iface: &Interface, now: Instant) -> Vec<Transmit> {
        match frame.ipv4_protocol() {
            Some(IpNumber::ICMP) => {
                let echo_request = frame
                    .as_icmpv4()
                    .is_some_and(|icmp| matches!(icmp.icmp_type(), Icmpv4Type::EchoRequest(_)));

                if !echo_request {
                    tracing::trace!("Dropping non-echo ICMP addressed to the router");

                    return Vec::new();
                }

                self.answer_echo(frame, in_iface, now)
            }
            Some(IpNumber::TCP | IpNumber::UDP) => {
                tracing::debug!("TCP/UDP addressed to the router; answering port-unreachable");

                self.reply_with(IcmpError::PortUnreachable, &frame, in_iface)
            }
            _ => {
                tracing::trace!("Unhandled IP protocol addressed to the router");

                Vec::new()
            }
        }
    }

    /// Echo to one of our addresses. The reply leaves once the route back
    /// to the sender has a resolved next hop; until then the *request* is
    /// parked and converted at drain time.
    fn answer_echo(&self, frame: Frame, in_iface: &Interface, now: Instant) -> Vec<Transmit> {
        let Some(src) = frame.ipv4_source() else {
            return Vec::new();
        };

        let Some(route) = self.config.routes.lookup(src) else {
            tracing::trace!(%src, "No route back to echo sender");

            return Vec::new();
        };

        let next_hop = route.next_hop(src);
        let egress = route.iface.clone();

        match self.arp.lookup(next_hop, now) {
            Some(mac) => {
                let mut frame = frame;
                icmp::echo_reply_in_place(&mut frame);
                frame.set_destination_mac(mac);
                frame.set_source_mac(in_iface.mac);

                vec![Transmit {
                    iface: in_iface.name.clone(),
                    frame,
                }]
            }
            None => self.park_for_arp(next_hop, frame, in_iface, &egress, now),
        }
    }

    fn forward_plain(&self, frame: Frame, in_iface: &Interface, now: Instant) -> Vec<Transmit> {
        if frame.ttl().unwrap_or(0) <= 1 {
            return self.reply_with(IcmpError::TtlExceeded, &frame, in_iface);
        }

        self.route_and_send(frame, in_iface, now)
    }

    /// Internal to external in NAT mode: rewrite the source onto the
    /// external address, then forward as usual.
    fn forward_outbound_nat(
        &self,
        mut frame: Frame,
        in_iface: &Interface,
        now: Instant,
    ) -> Vec<Transmit> {
        if frame.ttl().unwrap_or(0) <= 1 {
            return self.reply_with(IcmpError::TtlExceeded, &frame, in_iface);
        }

        let (Some(src), Some(dst)) = (frame.ipv4_source(), frame.ipv4_destination()) else {
            return Vec::new();
        };

        let Some(route) = self.config.routes.lookup(dst) else {
            return self.reply_with(IcmpError::NetUnreachable, &frame, in_iface);
        };

        let Some(egress) = self.config.interface(&route.iface) else {
            return Vec::new();
        };
        let ext_ip = egress.ip;

        match frame.ipv4_protocol() {
            Some(IpNumber::ICMP) => {
                let Some(id) = echo_identifier(&frame) else {
                    tracing::trace!("Only echo traffic is translated; dropping ICMP");

                    return Vec::new();
                };

                let mapping = match self.nat.lookup_internal(src, id, MappingKind::Icmp) {
                    Some(mapping) => mapping,
                    None => match self.nat.insert(src, id, MappingKind::Icmp, ext_ip, now) {
                        Ok(mapping) => mapping,
                        Err(e) => {
                            tracing::warn!("Dropping outbound ICMP: {e}");

                            return self.reply_with(IcmpError::HostUnreachable, &frame, in_iface);
                        }
                    },
                };

                if let Some(mut ip) = frame.ipv4_header_mut() {
                    ip.set_source(mapping.ip_ext);
                }
                if let Some(mut icmp_header) = frame.icmpv4_header_mut() {
                    icmp_header.set_identifier(mapping.aux_ext);
                }
                frame.update_icmpv4_checksum();
                frame.update_ipv4_checksum();

                self.nat.touch(&mapping, now);
            }
            Some(IpNumber::TCP) => {
                let Some(tcp) = frame.as_tcp() else {
                    return Vec::new();
                };

                if tcp.destination_port() == RESTRICTED_TCP_PORT {
                    tracing::debug!("Refusing outbound TCP to port {RESTRICTED_TCP_PORT}");

                    return self.reply_with(IcmpError::PortUnreachable, &frame, in_iface);
                }

                let src_port = tcp.source_port();
                let seg = SegmentMeta::of(&tcp);

                let mapping = match self.nat.lookup_internal(src, src_port, MappingKind::Tcp) {
                    Some(mapping) => mapping,
                    None => match self.nat.insert(src, src_port, MappingKind::Tcp, ext_ip, now) {
                        Ok(mapping) => mapping,
                        Err(e) => {
                            tracing::warn!("Dropping outbound TCP: {e}");

                            return self.reply_with(IcmpError::HostUnreachable, &frame, in_iface);
                        }
                    },
                };

                self.nat
                    .advance_conn(&mapping, dst, Direction::Outbound, &seg, now);

                if let Some(mut ip) = frame.ipv4_header_mut() {
                    ip.set_source(mapping.ip_ext);
                }
                if let Some(mut tcp_header) = frame.tcp_header_mut() {
                    tcp_header.set_source_port(mapping.aux_ext);
                }
                frame.update_tcp_checksum();
                frame.update_ipv4_checksum();
            }
            _ => {
                // UDP and anything else crosses untranslated.
            }
        }

        self.route_and_send(frame, in_iface, now)
    }

    /// External to internal in NAT mode: demultiplex on the external aux
    /// and rewrite the destination back to the internal host.
    fn forward_inbound_nat(
        &self,
        mut frame: Frame,
        in_iface: &Interface,
        now: Instant,
    ) -> Vec<Transmit> {
        let Some(src) = frame.ipv4_source() else {
            return Vec::new();
        };

        match frame.ipv4_protocol() {
            Some(IpNumber::ICMP) => {
                let Some(id) = echo_identifier(&frame) else {
                    tracing::trace!("Untranslatable inbound ICMP; dropping");

                    return Vec::new();
                };

                let Some(mapping) = self.nat.lookup_external(id, MappingKind::Icmp) else {
                    tracing::debug!(id, "No mapping for inbound ICMP identifier");

                    return self.reply_with(IcmpError::NetUnreachable, &frame, in_iface);
                };

                if let Some(mut ip) = frame.ipv4_header_mut() {
                    ip.set_destination(mapping.ip_int);
                }
                if let Some(mut icmp_header) = frame.icmpv4_header_mut() {
                    icmp_header.set_identifier(mapping.aux_int);
                }
                frame.update_icmpv4_checksum();
                frame.update_ipv4_checksum();

                self.nat.touch(&mapping, now);

                self.route_and_send(frame, in_iface, now)
            }
            Some(IpNumber::TCP) => {
                let Some(tcp) = frame.as_tcp() else {
                    return Vec::new();
                };

                let dst_port = tcp.destination_port();
                let seg = SegmentMeta::of(&tcp);

                let Some(mapping) = self.nat.lookup_external(dst_port, MappingKind::Tcp) else {
                    if seg.is_opening_syn() {
                        // The port-unreachable verdict is delivered by the
                        // reaper once the hold expires.
                        tracing::debug!(port = dst_port, "Holding unsolicited inbound SYN");

                        self.nat.hold_unsolicited_syn(frame, &in_iface.name, now);
                    } else {
                        tracing::trace!(port = dst_port, "Inbound TCP without mapping; dropping");
                    }

                    return Vec::new();
                };

                self.nat
                    .advance_conn(&mapping, src, Direction::Inbound, &seg, now);

                if let Some(mut ip) = frame.ipv4_header_mut() {
                    ip.set_destination(mapping.ip_int);
                }
                if let Some(mut tcp_header) = frame.tcp_header_mut() {
                    tcp_header.set_destination_port(mapping.aux_int);
                }
                frame.update_tcp_checksum();
                frame.update_ipv4_checksum();

                self.route_and_send(frame, in_iface, now)
            }
            Some(IpNumber::UDP) => {
                let local = frame
                    .ipv4_destination()
                    .is_some_and(|dst| self.config.is_local_ip(dst));

                if local {
                    // UDP at the NAT address is refused outright.
                    self.reply_with(IcmpError::PortUnreachable, &frame, in_iface)
                } else {
                    tracing::trace!("Dropping inbound UDP");

                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    /// The shared forwarding tail: route, drop the TTL, resolve the next
    /// hop, transmit (or park the frame and probe).
    fn route_and_send(&self, mut frame: Frame, in_iface: &Interface, now: Instant) -> Vec<Transmit> {
        let Some(dst) = frame.ipv4_destination() else {
            return Vec::new();
        };

        let Some(route) = self.config.routes.lookup(dst) else {
            tracing::debug!(%dst, "No route");

            return self.reply_with(IcmpError::NetUnreachable, &frame, in_iface);
        };

        let Some(egress) = self.config.interface(&route.iface) else {
            return Vec::new();
        };

        frame.decrement_ttl();

        let next_hop = route.next_hop(dst);

        match self.arp.lookup(next_hop, now) {
            Some(mac) => {
                frame.set_destination_mac(mac);
                frame.set_source_mac(egress.mac);

                vec![Transmit {
                    iface: egress.name.clone(),
                    frame,
                }]
            }
            None => {
                let egress = egress.name.clone();

                self.park_for_arp(next_hop, frame, in_iface, &egress, now)
            }
        }
    }

    /// Queues the frame for `next_hop`; a fresh pending record also emits
    /// the first broadcast probe.
    fn park_for_arp(
        &self,
        next_hop: Ipv4Addr,
        frame: Frame,
        in_iface: &Interface,
        egress: &str,
        now: Instant,
    ) -> Vec<Transmit> {
        self.arp
            .queue(next_hop, frame, &in_iface.name, egress, now)
            .and_then(|probe| probe_transmit(&self.config, &probe))
            .into_iter()
            .collect()
    }

    fn reply_with(&self, kind: IcmpError, original: &Frame, in_iface: &Interface) -> Vec<Transmit> {
        icmp::error_reply(kind, original, in_iface)
            .map(|frame| Transmit {
                iface: in_iface.name.clone(),
                frame,
            })
            .into_iter()
            .collect()
    }
}

/// Turns an ARP probe work item into the broadcast frame to send.
pub(crate) fn probe_transmit(config: &RouterConfig, probe: &ArpProbe) -> Option<Transmit> {
    let iface = config.interface(&probe.egress)?;

    Some(Transmit {
        iface: iface.name.clone(),
        frame: arp::request(iface.mac, iface.ip, probe.target),
    })
}

fn echo_identifier(frame: &Frame) -> Option<u16> {
    let icmp = frame.as_icmpv4()?;

    match icmp.icmp_type() {
        Icmpv4Type::EchoRequest(echo) | Icmpv4Type::EchoReply(echo) => Some(echo.id),
        _ => None,
    }
}
