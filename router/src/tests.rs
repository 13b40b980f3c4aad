//! End-to-end scenarios against the pipeline: frames in, transmits out.

use crate::arp_cache::ArpCache;
use crate::config::{Interface, Role, Route, RouterConfig, Timeouts};
use crate::nat::{MappingKind, NatTable, TcpState};
use crate::pipeline::{Pipeline, Transmit};
use crate::worker;
use eth_frame::make::{self, TcpFlags};
use eth_frame::{Frame, MacAddr, arp};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const ETH1_MAC: MacAddr = MacAddr::new([2, 0, 0, 0, 0, 1]);
const ETH2_MAC: MacAddr = MacAddr::new([2, 0, 0, 0, 0, 2]);
const ETH1_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);
const ETH2_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 2, 2);

const HOST1_MAC: MacAddr = MacAddr::new([0x0a, 0, 0, 0, 0, 0x64]);
const HOST1_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 100);
const HOST2_MAC: MacAddr = MacAddr::new([0x0a, 0, 0, 0, 0, 0x65]);
const HOST2_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 101);

const GW_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 2, 1);
const GW_MAC: MacAddr = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
const SERVER_IP: Ipv4Addr = Ipv4Addr::new(172, 64, 3, 5);
const SERVER_MAC: MacAddr = MacAddr::new([0x0c, 0, 0, 0, 0, 0x05]);

struct Rig {
    pipeline: Pipeline,
    config: Arc<RouterConfig>,
    arp: Arc<ArpCache>,
    nat: Arc<NatTable>,
    now: Instant,
}

fn rig(nat_enabled: bool) -> Rig {
    let timeouts = Timeouts {
        icmp: Duration::from_secs(60),
        tcp_idle: Duration::from_secs(7440),
        transitory_idle: Duration::from_secs(300),
    };

    let config = Arc::new(
        RouterConfig::new(
            vec![
                Interface {
                    name: "eth1".to_owned(),
                    mac: ETH1_MAC,
                    ip: ETH1_IP,
                    role: Role::Internal,
                },
                Interface {
                    name: "eth2".to_owned(),
                    mac: ETH2_MAC,
                    ip: ETH2_IP,
                    role: Role::External,
                },
            ],
            vec![
                Route {
                    destination: Ipv4Addr::new(10, 0, 1, 0),
                    mask: Ipv4Addr::new(255, 255, 255, 0),
                    gateway: Ipv4Addr::UNSPECIFIED,
                    iface: "eth1".to_owned(),
                },
                Route {
                    destination: Ipv4Addr::new(172, 64, 3, 0),
                    mask: Ipv4Addr::new(255, 255, 255, 0),
                    gateway: GW_IP,
                    iface: "eth2".to_owned(),
                },
            ],
            nat_enabled,
            timeouts,
        )
        .unwrap(),
    );

    let arp = Arc::new(ArpCache::new());
    let nat = Arc::new(NatTable::new(timeouts));

    Rig {
        pipeline: Pipeline::new(Arc::clone(&config), Arc::clone(&arp), Arc::clone(&nat)),
        config,
        arp,
        nat,
        now: Instant::now(),
    }
}

impl Rig {
    fn handle(&self, frame: &Frame, iface: &str) -> Vec<Transmit> {
        self.pipeline
            .handle_frame(frame.as_bytes().to_vec(), iface, self.now)
    }
}

fn assert_tcp_checksum_valid(frame: &Frame) {
    let ip = frame.as_ipv4().unwrap().header().to_header();
    let tcp = frame.as_tcp().unwrap();

    assert_eq!(
        tcp.to_header()
            .calc_checksum_ipv4(&ip, tcp.payload())
            .unwrap(),
        tcp.to_header().checksum,
    );
}

fn assert_ipv4_checksum_valid(frame: &Frame) {
    let header = frame.as_ipv4().unwrap().header().to_header();

    assert_eq!(header.header_checksum, header.calc_header_checksum());
}

// S1: an echo to the router resolves the sender first, then replies.
#[test]
fn echo_to_router_is_answered_after_arp_resolution() {
    let rig = rig(false);
    let sender_ip = Ipv4Addr::new(10, 0, 1, 2);

    let echo = make::icmp_echo_request(HOST1_MAC, ETH1_MAC, sender_ip, ETH1_IP, 7, 1, b"ping");
    let out = rig.handle(&echo, "eth1");

    // ARP miss: the request is broadcast on the internal link.
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].iface, "eth1");
    assert_eq!(out[0].frame.destination_mac(), MacAddr::BROADCAST);
    let probe = out[0].frame.as_arp().unwrap();
    assert_eq!(probe.target_ip(), sender_ip);
    assert_eq!(probe.target_mac(), MacAddr::ZERO);
    assert_eq!(probe.sender_ip(), ETH1_IP);

    // The sender answers; the parked request drains as an echo reply.
    let reply = arp::reply(HOST1_MAC, sender_ip, ETH1_MAC, ETH1_IP);
    let out = rig.handle(&reply, "eth1");

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].iface, "eth1");

    let frame = &out[0].frame;
    assert_eq!(frame.destination_mac(), HOST1_MAC);
    assert_eq!(frame.source_mac(), ETH1_MAC);
    assert_eq!(frame.ipv4_source(), Some(ETH1_IP));
    assert_eq!(frame.ipv4_destination(), Some(sender_ip));

    let icmp = frame.as_icmpv4().unwrap();
    assert_eq!(icmp.type_u8(), 0);
    let etherparse::Icmpv4Type::EchoReply(echo) = icmp.icmp_type() else {
        panic!("expected an echo reply");
    };
    assert_eq!(echo.id, 7);
    assert_ipv4_checksum_valid(frame);
}

// S2: forwarding queues on ARP miss and releases on the reply.
#[test]
fn forward_waits_for_arp_then_transmits_with_decremented_ttl() {
    let rig = rig(false);
    let sender_ip = Ipv4Addr::new(10, 0, 1, 5);

    let datagram = make::udp_frame(HOST1_MAC, ETH1_MAC, sender_ip, 40000, SERVER_IP, 443, b"q");
    let out = rig.handle(&datagram, "eth1");

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].iface, "eth2");
    let probe = out[0].frame.as_arp().unwrap();
    assert_eq!(probe.target_ip(), GW_IP);

    let reply = arp::reply(GW_MAC, GW_IP, ETH2_MAC, ETH2_IP);
    let out = rig.handle(&reply, "eth2");

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].iface, "eth2");

    let frame = &out[0].frame;
    assert_eq!(frame.destination_mac(), GW_MAC);
    assert_eq!(frame.source_mac(), ETH2_MAC);
    assert_eq!(frame.ttl(), Some(63));
    assert_eq!(frame.ipv4_destination(), Some(SERVER_IP));
    assert_eq!(frame.as_udp().unwrap().payload(), b"q");
    assert_ipv4_checksum_valid(frame);
}

// S3: outbound TCP is rewritten onto the external address and tracked.
#[test]
fn nat_tcp_outbound_creates_mapping_and_tracks_handshake() {
    let rig = rig(true);
    rig.arp.insert(GW_IP, GW_MAC, rig.now);
    rig.arp.insert(HOST1_IP, HOST1_MAC, rig.now);

    let syn = make::tcp_frame(
        HOST1_MAC,
        ETH1_MAC,
        HOST1_IP,
        50000,
        SERVER_IP,
        80,
        1000,
        TcpFlags {
            syn: true,
            ..Default::default()
        },
        &[],
    );
    let out = rig.handle(&syn, "eth1");

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].iface, "eth2");

    let mapping = rig
        .nat
        .lookup_internal(HOST1_IP, 50000, MappingKind::Tcp)
        .unwrap();
    assert_eq!(mapping.ip_ext, ETH2_IP);
    assert!(mapping.aux_ext >= 1024);
    assert_eq!(
        rig.nat.conn_state(&mapping, SERVER_IP),
        Some(TcpState::SynSent)
    );

    let frame = &out[0].frame;
    let tcp = frame.as_tcp().unwrap();
    assert_eq!(frame.ipv4_source(), Some(ETH2_IP));
    assert_eq!(tcp.source_port(), mapping.aux_ext);
    assert_eq!(tcp.destination_port(), 80);
    assert_eq!(frame.ttl(), Some(63));
    assert_tcp_checksum_valid(frame);

    // The SYN+ACK comes back to the mapped port and is rewritten inward.
    let syn_ack = make::tcp_frame(
        GW_MAC,
        ETH2_MAC,
        SERVER_IP,
        80,
        ETH2_IP,
        mapping.aux_ext,
        5000,
        TcpFlags {
            syn: true,
            ack: Some(1001),
            ..Default::default()
        },
        &[],
    );
    let out = rig.handle(&syn_ack, "eth2");

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].iface, "eth1");

    let frame = &out[0].frame;
    let tcp = frame.as_tcp().unwrap();
    assert_eq!(frame.ipv4_destination(), Some(HOST1_IP));
    assert_eq!(tcp.destination_port(), 50000);
    assert_eq!(frame.destination_mac(), HOST1_MAC);
    assert_tcp_checksum_valid(frame);

    assert_eq!(
        rig.nat.conn_state(&mapping, SERVER_IP),
        Some(TcpState::SynRcvd)
    );
}

// S4: an unsolicited SYN gets port-unreachable six seconds later,
// regardless of how low the port is.
#[test]
fn unsolicited_syn_is_answered_after_the_hold() {
    for port in [8080u16, 500] {
        let rig = rig(true);

        let syn = make::tcp_frame(
            SERVER_MAC,
            ETH2_MAC,
            SERVER_IP,
            40000,
            ETH2_IP,
            port,
            9000,
            TcpFlags {
                syn: true,
                ..Default::default()
            },
            &[],
        );

        assert!(rig.handle(&syn, "eth2").is_empty());

        assert!(
            worker::nat_tick(&rig.nat, &rig.config, rig.now + Duration::from_secs(5)).is_empty()
        );

        let out = worker::nat_tick(&rig.nat, &rig.config, rig.now + Duration::from_secs(6));

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].iface, "eth2");

        let frame = &out[0].frame;
        assert_eq!(frame.destination_mac(), SERVER_MAC);
        // Port-unreachable pretends to come from the address the SYN hit.
        assert_eq!(frame.ipv4_source(), Some(ETH2_IP));
        assert_eq!(frame.ipv4_destination(), Some(SERVER_IP));

        let icmp = frame.as_icmpv4().unwrap();
        assert_eq!((icmp.type_u8(), icmp.code_u8()), (3, 3));
    }
}

// S5: outbound TCP to port 22 is refused immediately, no mapping made.
#[test]
fn outbound_ssh_is_refused() {
    let rig = rig(true);
    rig.arp.insert(GW_IP, GW_MAC, rig.now);

    let syn = make::tcp_frame(
        HOST1_MAC,
        ETH1_MAC,
        HOST1_IP,
        50000,
        SERVER_IP,
        22,
        1000,
        TcpFlags {
            syn: true,
            ..Default::default()
        },
        &[],
    );
    let out = rig.handle(&syn, "eth1");

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].iface, "eth1");

    let frame = &out[0].frame;
    let icmp = frame.as_icmpv4().unwrap();
    assert_eq!((icmp.type_u8(), icmp.code_u8()), (3, 3));
    // The refusal masquerades as the server itself.
    assert_eq!(frame.ipv4_source(), Some(SERVER_IP));
    assert_eq!(frame.ipv4_destination(), Some(HOST1_IP));

    assert!(
        rig.nat
            .lookup_internal(HOST1_IP, 50000, MappingKind::Tcp)
            .is_none()
    );
}

// S6: two hosts pinging with the same identifier stay demultiplexable.
#[test]
fn icmp_nat_demultiplexes_same_identifier_from_two_hosts() {
    let rig = rig(true);
    rig.arp.insert(GW_IP, GW_MAC, rig.now);
    rig.arp.insert(HOST1_IP, HOST1_MAC, rig.now);
    rig.arp.insert(HOST2_IP, HOST2_MAC, rig.now);

    let mut external_ids = Vec::new();

    for (mac, ip) in [(HOST1_MAC, HOST1_IP), (HOST2_MAC, HOST2_IP)] {
        let echo = make::icmp_echo_request(mac, ETH1_MAC, ip, SERVER_IP, 1, 1, b"hi");
        let out = rig.handle(&echo, "eth1");

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].iface, "eth2");
        assert_eq!(out[0].frame.ipv4_source(), Some(ETH2_IP));

        let etherparse::Icmpv4Type::EchoRequest(echo) =
            out[0].frame.as_icmpv4().unwrap().icmp_type()
        else {
            panic!("expected an echo request");
        };

        external_ids.push(echo.id);
    }

    assert_ne!(external_ids[0], external_ids[1]);

    // Replies come back to the external identifiers and find their hosts.
    for (id, host_ip, host_mac) in [
        (external_ids[0], HOST1_IP, HOST1_MAC),
        (external_ids[1], HOST2_IP, HOST2_MAC),
    ] {
        let reply = make::icmp_echo_reply(GW_MAC, ETH2_MAC, SERVER_IP, ETH2_IP, id, 1, b"hi");
        let out = rig.handle(&reply, "eth2");

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].iface, "eth1");
        assert_eq!(out[0].frame.ipv4_destination(), Some(host_ip));
        assert_eq!(out[0].frame.destination_mac(), host_mac);

        let etherparse::Icmpv4Type::EchoReply(echo) =
            out[0].frame.as_icmpv4().unwrap().icmp_type()
        else {
            panic!("expected an echo reply");
        };

        assert_eq!(echo.id, 1);
    }
}

// P4: every queued frame yields exactly one host-unreachable when ARP
// resolution runs out of attempts.
#[test]
fn arp_exhaustion_answers_each_queued_frame_once() {
    let rig = rig(false);
    let sender_a = Ipv4Addr::new(10, 0, 1, 5);
    let sender_b = Ipv4Addr::new(10, 0, 1, 6);

    let first = make::udp_frame(HOST1_MAC, ETH1_MAC, sender_a, 40000, SERVER_IP, 443, b"a");
    let second = make::udp_frame(HOST2_MAC, ETH1_MAC, sender_b, 40001, SERVER_IP, 443, b"b");

    assert_eq!(rig.handle(&first, "eth1").len(), 1); // initial probe
    assert!(rig.handle(&second, "eth1").is_empty()); // piggybacks

    // Four retransmissions, then the verdict.
    for tick in 1..=4u64 {
        let out = worker::arp_tick(&rig.arp, &rig.config, rig.now + Duration::from_secs(tick));

        assert_eq!(out.len(), 1);
        assert!(out[0].frame.as_arp().is_some());
    }

    let out = worker::arp_tick(&rig.arp, &rig.config, rig.now + Duration::from_secs(5));

    assert_eq!(out.len(), 2);

    for (transmit, sender) in out.iter().zip([sender_a, sender_b]) {
        assert_eq!(transmit.iface, "eth1");

        let frame = &transmit.frame;
        let icmp = frame.as_icmpv4().unwrap();
        assert_eq!((icmp.type_u8(), icmp.code_u8()), (3, 1));
        assert_eq!(frame.ipv4_source(), Some(ETH1_IP));
        assert_eq!(frame.ipv4_destination(), Some(sender));
    }

    // Nothing fires twice.
    assert!(worker::arp_tick(&rig.arp, &rig.config, rig.now + Duration::from_secs(6)).is_empty());
}

// TTL expiry and route misses answer with the right ICMP errors.
#[test]
fn ttl_expiry_elicits_time_exceeded() {
    let rig = rig(false);

    let mut datagram =
        make::udp_frame(HOST1_MAC, ETH1_MAC, HOST1_IP, 40000, SERVER_IP, 443, b"q");
    if let Some(mut ip) = datagram.ipv4_header_mut() {
        ip.set_ttl(1);
    }
    datagram.update_ipv4_checksum();

    let out = rig.handle(&datagram, "eth1");

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].iface, "eth1");

    let icmp = out[0].frame.as_icmpv4().unwrap();
    assert_eq!((icmp.type_u8(), icmp.code_u8()), (11, 0));
}

#[test]
fn route_miss_without_internal_fallback_elicits_net_unreachable() {
    // External arrival, destination in no table entry, no internal
    // interface configured: a genuine LPM miss.
    let timeouts = Timeouts {
        icmp: Duration::from_secs(60),
        tcp_idle: Duration::from_secs(7440),
        transitory_idle: Duration::from_secs(300),
    };
    let config = Arc::new(
        RouterConfig::new(
            vec![Interface {
                name: "eth2".to_owned(),
                mac: ETH2_MAC,
                ip: ETH2_IP,
                role: Role::External,
            }],
            vec![Route {
                destination: Ipv4Addr::new(192, 168, 2, 0),
                mask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: Ipv4Addr::UNSPECIFIED,
                iface: "eth2".to_owned(),
            }],
            false,
            timeouts,
        )
        .unwrap(),
    );
    let pipeline = Pipeline::new(
        Arc::clone(&config),
        Arc::new(ArpCache::new()),
        Arc::new(NatTable::new(timeouts)),
    );

    let datagram = make::udp_frame(
        GW_MAC,
        ETH2_MAC,
        GW_IP,
        40000,
        Ipv4Addr::new(8, 8, 8, 8),
        443,
        b"q",
    );
    let out = pipeline.handle_frame(datagram.as_bytes().to_vec(), "eth2", Instant::now());

    assert_eq!(out.len(), 1);

    let icmp = out[0].frame.as_icmpv4().unwrap();
    assert_eq!((icmp.type_u8(), icmp.code_u8()), (3, 0));
}

// Round-trip identity (P2): what leaves rewritten comes back restored.
#[test]
fn nat_round_trip_restores_internal_tuple() {
    let rig = rig(true);
    rig.arp.insert(GW_IP, GW_MAC, rig.now);
    rig.arp.insert(HOST1_IP, HOST1_MAC, rig.now);

    let syn = make::tcp_frame(
        HOST1_MAC,
        ETH1_MAC,
        HOST1_IP,
        50000,
        SERVER_IP,
        80,
        1000,
        TcpFlags {
            syn: true,
            ..Default::default()
        },
        &[],
    );
    let out = rig.handle(&syn, "eth1");
    let egress = &out[0].frame;
    let ext_port = egress.as_tcp().unwrap().source_port();

    let response = make::tcp_frame(
        GW_MAC,
        ETH2_MAC,
        SERVER_IP,
        80,
        ETH2_IP,
        ext_port,
        5000,
        TcpFlags {
            syn: true,
            ack: Some(1001),
            ..Default::default()
        },
        &[],
    );
    let back = rig.handle(&response, "eth2");

    assert_eq!(back[0].frame.ipv4_destination(), Some(HOST1_IP));
    assert_eq!(back[0].frame.as_tcp().unwrap().destination_port(), 50000);
}

// Local TCP in plain routing mode is refused with port-unreachable.
#[test]
fn tcp_to_router_address_is_refused() {
    let rig = rig(false);

    let syn = make::tcp_frame(
        HOST1_MAC,
        ETH1_MAC,
        HOST1_IP,
        50000,
        ETH1_IP,
        80,
        1000,
        TcpFlags {
            syn: true,
            ..Default::default()
        },
        &[],
    );
    let out = rig.handle(&syn, "eth1");

    assert_eq!(out.len(), 1);

    let frame = &out[0].frame;
    let icmp = frame.as_icmpv4().unwrap();
    assert_eq!((icmp.type_u8(), icmp.code_u8()), (3, 3));
    assert_eq!(frame.ipv4_source(), Some(ETH1_IP));
}

// ARP requests for our addresses are answered from the owning interface.
#[test]
fn arp_request_for_interface_ip_is_answered() {
    let rig = rig(false);

    let request = arp::request(HOST1_MAC, HOST1_IP, ETH1_IP);
    let out = rig.handle(&request, "eth1");

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].iface, "eth1");
    assert_eq!(out[0].frame.destination_mac(), HOST1_MAC);

    let reply = out[0].frame.as_arp().unwrap();
    assert_eq!(reply.operation(), eth_frame::arp::ArpOperation::Reply);
    assert_eq!(reply.sender_ip(), ETH1_IP);
    assert_eq!(reply.sender_mac(), ETH1_MAC);

    // Requests for somebody else's address are not ours to answer.
    let other = arp::request(HOST1_MAC, HOST1_IP, HOST2_IP);
    assert!(rig.handle(&other, "eth1").is_empty());
}

// UDP aimed at the NAT address is refused; UDP crossing outward is
// forwarded untouched.
#[test]
fn udp_is_never_translated() {
    let rig = rig(true);
    rig.arp.insert(GW_IP, GW_MAC, rig.now);

    let outbound = make::udp_frame(HOST1_MAC, ETH1_MAC, HOST1_IP, 40000, SERVER_IP, 53, b"q");
    let out = rig.handle(&outbound, "eth1");

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].iface, "eth2");
    // Source survives untranslated.
    assert_eq!(out[0].frame.ipv4_source(), Some(HOST1_IP));

    let at_router = make::udp_frame(SERVER_MAC, ETH2_MAC, SERVER_IP, 40000, ETH2_IP, 53, b"q");
    let out = rig.handle(&at_router, "eth2");

    assert_eq!(out.len(), 1);
    let icmp = out[0].frame.as_icmpv4().unwrap();
    assert_eq!((icmp.type_u8(), icmp.code_u8()), (3, 3));

    // Inbound UDP for anybody else just disappears.
    let inbound = make::udp_frame(SERVER_MAC, ETH2_MAC, SERVER_IP, 40000, HOST1_IP, 53, b"q");
    assert!(rig.handle(&inbound, "eth2").is_empty());
}
