//! Resolved (IPv4, MAC) bindings plus per-destination queues of frames
//! awaiting resolution.
//!
//! The cache never performs I/O. [`ArpCache::queue`] hands back a probe to
//! broadcast when a destination is seen for the first time, and
//! [`ArpCache::tick`] hands back the probes to re-emit and the frames of
//! requests that ran out of attempts. The pipeline and the ARP worker turn
//! those into actual transmissions.

use eth_frame::{Frame, MacAddr};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// Resolved entries are trusted for this long.
pub const ENTRY_TTL: Duration = Duration::from_secs(15);
/// How often an unanswered request is re-broadcast.
const PROBE_INTERVAL: Duration = Duration::from_secs(1);
/// Requests emitted per destination before giving up.
pub const MAX_PROBES: u32 = 5;

#[derive(Debug, Clone, Copy)]
struct ArpEntry {
    mac: MacAddr,
    inserted_at: Instant,
}

/// A frame parked until its next hop resolves, together with the interface
/// it arrived on (needed to source an unreachable reply if resolution fails).
pub struct QueuedFrame {
    pub frame: Frame,
    pub in_iface: String,
}

/// The pending state for one unresolved destination.
pub struct PendingResolve {
    pub target: Ipv4Addr,
    pub frames: Vec<QueuedFrame>,
    egress: String,
    last_probe: Instant,
    probes: u32,
}

/// Work item: broadcast an ARP request for `target` out of `egress`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpProbe {
    pub target: Ipv4Addr,
    pub egress: String,
}

#[derive(Default)]
pub struct TickOutcome {
    pub probes: Vec<ArpProbe>,
    pub abandoned: Vec<QueuedFrame>,
}

#[derive(Default)]
pub struct ArpCache {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Ipv4Addr, ArpEntry>,
    pending: HashMap<Ipv4Addr, PendingResolve>,
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the MAC for `ip` if a fresh binding exists.
    pub fn lookup(&self, ip: Ipv4Addr, now: Instant) -> Option<MacAddr> {
        let inner = self.inner.lock();
        let entry = inner.entries.get(&ip)?;

        if now.duration_since(entry.inserted_at) >= ENTRY_TTL {
            return None;
        }

        Some(entry.mac)
    }

    /// Records (or refreshes) a binding.
    ///
    /// If frames were queued for `ip`, the pending record is detached and
    /// returned so the caller can drain it; a binding and a pending record
    /// never coexist.
    pub fn insert(&self, ip: Ipv4Addr, mac: MacAddr, now: Instant) -> Option<PendingResolve> {
        let mut inner = self.inner.lock();

        inner.entries.insert(
            ip,
            ArpEntry {
                mac,
                inserted_at: now,
            },
        );

        let pending = inner.pending.remove(&ip);

        if let Some(pending) = &pending {
            tracing::debug!(%ip, %mac, queued = pending.frames.len(), "ARP resolved");
        }

        pending
    }

    /// Parks a frame until `ip` resolves.
    ///
    /// On the first frame for a destination, the returned probe must be
    /// broadcast by the caller; it counts as the first attempt.
    pub fn queue(
        &self,
        ip: Ipv4Addr,
        frame: Frame,
        in_iface: &str,
        egress: &str,
        now: Instant,
    ) -> Option<ArpProbe> {
        let mut inner = self.inner.lock();

        // A queue implies the lookup missed; drop any stale entry so a
        // binding and a pending record never coexist.
        inner.entries.remove(&ip);

        let queued = QueuedFrame {
            frame,
            in_iface: in_iface.to_owned(),
        };

        match inner.pending.entry(ip) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().frames.push(queued);

                None
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PendingResolve {
                    target: ip,
                    frames: vec![queued],
                    egress: egress.to_owned(),
                    last_probe: now,
                    probes: 1,
                });

                Some(ArpProbe {
                    target: ip,
                    egress: egress.to_owned(),
                })
            }
        }
    }

    /// One pass of the resolution protocol; called once per second.
    pub fn tick(&self, now: Instant) -> TickOutcome {
        let mut inner = self.inner.lock();
        let mut outcome = TickOutcome::default();

        inner
            .entries
            .retain(|_, entry| now.duration_since(entry.inserted_at) < ENTRY_TTL);

        let due: Vec<Ipv4Addr> = inner
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_probe) >= PROBE_INTERVAL)
            .map(|(ip, _)| *ip)
            .collect();

        for ip in due {
            let Entry::Occupied(mut occupied) = inner.pending.entry(ip) else {
                continue;
            };

            let pending = occupied.get_mut();

            if pending.probes < MAX_PROBES {
                pending.probes += 1;
                pending.last_probe = now;

                outcome.probes.push(ArpProbe {
                    target: ip,
                    egress: pending.egress.clone(),
                });
            } else {
                let pending = occupied.remove();

                tracing::debug!(
                    %ip,
                    queued = pending.frames.len(),
                    "ARP resolution failed after {MAX_PROBES} attempts"
                );

                outcome.abandoned.extend(pending.frames);
            }
        }

        outcome
    }
}
