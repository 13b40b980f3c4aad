//! The one-second background workers: ARP retransmit/expiry and the NAT
//! reaper. Each tick collects its outgoing frames under the table lock and
//! transmits them after releasing it.

use crate::arp_cache::ArpCache;
use crate::config::RouterConfig;
use crate::icmp::{self, IcmpError};
use crate::nat::NatTable;
use crate::pipeline::{Transmit, probe_transmit};
use crate::transport::Transport;
use anyhow::{Context as _, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_secs(1);

pub fn spawn_arp_worker(
    arp: Arc<ArpCache>,
    config: Arc<RouterConfig>,
    transport: Arc<dyn Transport>,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("arp-tick".to_owned())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(TICK);

                for transmit in arp_tick(&arp, &config, Instant::now()) {
                    send(transport.as_ref(), &transmit);
                }
            }

            tracing::debug!("ARP worker stopped");
        })
        .context("Failed to spawn ARP worker")
}

pub fn spawn_nat_reaper(
    nat: Arc<NatTable>,
    config: Arc<RouterConfig>,
    transport: Arc<dyn Transport>,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("nat-reaper".to_owned())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(TICK);

                for transmit in nat_tick(&nat, &config, Instant::now()) {
                    send(transport.as_ref(), &transmit);
                }
            }

            tracing::debug!("NAT reaper stopped");
        })
        .context("Failed to spawn NAT reaper")
}

/// One ARP pass: re-broadcast unanswered probes, and answer every frame of
/// an abandoned request with host-unreachable toward its original sender.
pub fn arp_tick(arp: &ArpCache, config: &RouterConfig, now: Instant) -> Vec<Transmit> {
    let outcome = arp.tick(now);
    let mut out = Vec::new();

    for probe in &outcome.probes {
        out.extend(probe_transmit(config, probe));
    }

    for queued in outcome.abandoned {
        let Some(iface) = config.interface(&queued.in_iface) else {
            continue;
        };

        out.extend(
            icmp::error_reply(IcmpError::HostUnreachable, &queued.frame, iface).map(|frame| {
                Transmit {
                    iface: iface.name.clone(),
                    frame,
                }
            }),
        );
    }

    out
}

/// One reaper pass: expire mappings and connections, and deliver the
/// delayed port-unreachable for held unsolicited SYNs.
pub fn nat_tick(nat: &NatTable, config: &RouterConfig, now: Instant) -> Vec<Transmit> {
    nat.tick(now)
        .into_iter()
        .filter_map(|held| {
            let iface = config.interface(&held.in_iface)?;
            let frame = icmp::error_reply(IcmpError::PortUnreachable, &held.frame, iface)?;

            Some(Transmit {
                iface: iface.name.clone(),
                frame,
            })
        })
        .collect()
}

fn send(transport: &dyn Transport, transmit: &Transmit) {
    if let Err(e) = transport.send(&transmit.iface, transmit.frame.as_bytes()) {
        tracing::warn!(iface = %transmit.iface, "Failed to transmit: {e:#}");
    }
}
