//! The NAPT table: bidirectional (internal IP, aux) ↔ (external IP, aux)
//! mappings with per-peer TCP connection state.
//!
//! `aux` is the ICMP echo identifier for ICMP mappings and the port for TCP
//! mappings. Lookups return plain [`Mapping`] snapshots that are safe to
//! read without the table lock; every mutation goes through a `&self`
//! method so concurrent rewrites stay serialized.

mod tcp;

pub use tcp::{Direction, SegmentMeta, TcpState};

use eth_frame::Frame;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::mem;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tcp::Connection;

use crate::config::Timeouts;

/// Bottom of the allocatable external port/identifier range; everything up
/// to 65535 is fair game.
pub const MIN_AUX: u16 = 1024;

/// How long an unsolicited inbound SYN is held before the port-unreachable
/// verdict is delivered.
pub const UNSOLICITED_SYN_HOLD: Duration = Duration::from_secs(6);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingKind {
    Icmp,
    Tcp,
}

/// Snapshot of one mapping. The external address is the address of the
/// external interface the flow first egressed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub kind: MappingKind,
    pub ip_int: Ipv4Addr,
    pub aux_int: u16,
    pub ip_ext: Ipv4Addr,
    pub aux_ext: u16,
}

#[derive(Debug, thiserror::Error)]
#[error("external port/identifier space is exhausted")]
pub struct AuxExhausted;

/// An inbound SYN with no mapping, parked until its deadline.
pub struct HeldSyn {
    pub frame: Frame,
    pub in_iface: String,
    deadline: Instant,
}

struct MappingState {
    mapping: Mapping,
    last_used: Instant,
    conns: HashMap<Ipv4Addr, Connection>,
}

pub struct NatTable {
    inner: Mutex<Inner>,
    timeouts: Timeouts,
}

#[derive(Default)]
struct Inner {
    /// Keyed by what inbound traffic carries.
    mappings: HashMap<(MappingKind, u16), MappingState>,
    /// (kind, internal IP, internal aux) → owning external aux.
    by_internal: HashMap<(MappingKind, Ipv4Addr, u16), u16>,
    aux: AuxAllocator,
    held_syns: Vec<HeldSyn>,
}

impl NatTable {
    pub fn new(timeouts: Timeouts) -> Self {
        Self {
            inner: Mutex::default(),
            timeouts,
        }
    }

    pub fn lookup_internal(
        &self,
        ip_int: Ipv4Addr,
        aux_int: u16,
        kind: MappingKind,
    ) -> Option<Mapping> {
        let inner = self.inner.lock();
        let aux_ext = inner.by_internal.get(&(kind, ip_int, aux_int))?;

        Some(inner.mappings.get(&(kind, *aux_ext))?.mapping)
    }

    pub fn lookup_external(&self, aux_ext: u16, kind: MappingKind) -> Option<Mapping> {
        let inner = self.inner.lock();

        Some(inner.mappings.get(&(kind, aux_ext))?.mapping)
    }

    /// Returns the mapping for the internal tuple, creating one if needed.
    ///
    /// Allocation of the external aux and installation happen under one
    /// lock acquisition, so no two mappings of a kind can share an external
    /// aux.
    pub fn insert(
        &self,
        ip_int: Ipv4Addr,
        aux_int: u16,
        kind: MappingKind,
        ip_ext: Ipv4Addr,
        now: Instant,
    ) -> Result<Mapping, AuxExhausted> {
        let mut inner = self.inner.lock();
        let Inner {
            mappings,
            by_internal,
            aux,
            ..
        } = &mut *inner;

        if let Some(existing) = by_internal
            .get(&(kind, ip_int, aux_int))
            .and_then(|aux_ext| mappings.get(&(kind, *aux_ext)))
        {
            return Ok(existing.mapping);
        }

        let aux_ext = aux.allocate().ok_or(AuxExhausted)?;

        let mapping = Mapping {
            kind,
            ip_int,
            aux_int,
            ip_ext,
            aux_ext,
        };

        mappings.insert(
            (kind, aux_ext),
            MappingState {
                mapping,
                last_used: now,
                conns: HashMap::new(),
            },
        );
        by_internal.insert((kind, ip_int, aux_int), aux_ext);

        tracing::debug!(?mapping, "New NAT mapping");

        Ok(mapping)
    }

    /// Marks the mapping as used.
    pub fn touch(&self, mapping: &Mapping, now: Instant) {
        let mut inner = self.inner.lock();

        if let Some(state) = inner.mappings.get_mut(&(mapping.kind, mapping.aux_ext)) {
            state.last_used = now;
        }
    }

    /// Runs one segment through the connection for `peer`, creating the
    /// connection if this is the first segment to or from that peer.
    ///
    /// Also refreshes the connection and mapping timestamps.
    pub fn advance_conn(
        &self,
        mapping: &Mapping,
        peer: Ipv4Addr,
        dir: Direction,
        seg: &SegmentMeta,
        now: Instant,
    ) {
        let mut inner = self.inner.lock();

        let Some(state) = inner.mappings.get_mut(&(mapping.kind, mapping.aux_ext)) else {
            return;
        };

        let conn = state.conns.entry(peer).or_insert_with(|| match dir {
            Direction::Outbound => Connection::new_outbound(now),
            Direction::Inbound => Connection::new_inbound(seg, now),
        });

        conn.advance(dir, seg);
        conn.last_used = now;
        state.last_used = now;
    }

    /// The tracked state of the connection to `peer`, if any.
    pub fn conn_state(&self, mapping: &Mapping, peer: Ipv4Addr) -> Option<TcpState> {
        let inner = self.inner.lock();

        Some(
            inner
                .mappings
                .get(&(mapping.kind, mapping.aux_ext))?
                .conns
                .get(&peer)?
                .state,
        )
    }

    /// Parks an inbound SYN that matched no mapping; [`NatTable::tick`]
    /// surfaces it again once the hold expires so the caller can answer
    /// with port-unreachable.
    pub fn hold_unsolicited_syn(&self, frame: Frame, in_iface: &str, now: Instant) {
        let mut inner = self.inner.lock();

        inner.held_syns.push(HeldSyn {
            frame,
            in_iface: in_iface.to_owned(),
            deadline: now + UNSOLICITED_SYN_HOLD,
        });
    }

    /// The reaper; called once per second.
    ///
    /// Prunes idle connections, then mappings: an ICMP mapping dies after
    /// `icmp_timeout` idle, a TCP mapping dies with its last connection.
    /// Returns the held SYNs whose deadline has passed.
    pub fn tick(&self, now: Instant) -> Vec<HeldSyn> {
        let mut inner = self.inner.lock();
        let timeouts = self.timeouts;
        let Inner {
            mappings,
            by_internal,
            aux,
            held_syns,
        } = &mut *inner;

        mappings.retain(|_, state| {
            state.conns.retain(|peer, conn| {
                let idle = now.duration_since(conn.last_used);

                let keep = match conn.state {
                    TcpState::Established => idle <= timeouts.tcp_idle,
                    _ => idle <= timeouts.transitory_idle,
                };

                if !keep {
                    tracing::debug!(%peer, state = ?conn.state, "Dropping idle NAT connection");
                }

                keep
            });

            let keep = match state.mapping.kind {
                MappingKind::Icmp => now.duration_since(state.last_used) <= timeouts.icmp,
                MappingKind::Tcp => !state.conns.is_empty(),
            };

            if !keep {
                tracing::debug!(mapping = ?state.mapping, "NAT mapping reaped");

                aux.release(state.mapping.aux_ext);
                by_internal.remove(&(
                    state.mapping.kind,
                    state.mapping.ip_int,
                    state.mapping.aux_int,
                ));
            }

            keep
        });

        let (due, rest): (Vec<_>, Vec<_>) = mem::take(held_syns)
            .into_iter()
            .partition(|held| now >= held.deadline);
        *held_syns = rest;

        due
    }
}

/// Bitmap over the whole u16 space; only `[MIN_AUX, 65535]` is handed out.
struct AuxAllocator {
    bitmap: Box<[u64; 1024]>,
}

impl Default for AuxAllocator {
    fn default() -> Self {
        Self {
            bitmap: Box::new([0; 1024]),
        }
    }
}

impl AuxAllocator {
    /// Lowest free slot, marked before the table lock is released.
    fn allocate(&mut self) -> Option<u16> {
        let aux = (MIN_AUX..=u16::MAX).find(|aux| !self.is_allocated(*aux))?;

        self.bitmap[aux as usize / 64] |= 1u64 << (aux % 64);

        Some(aux)
    }

    fn release(&mut self, aux: u16) {
        self.bitmap[aux as usize / 64] &= !(1u64 << (aux % 64));
    }

    fn is_allocated(&self, aux: u16) -> bool {
        self.bitmap[aux as usize / 64] & (1u64 << (aux % 64)) != 0
    }
}
