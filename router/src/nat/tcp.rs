//! Per-peer TCP connection tracking attached to a NAT mapping.

use etherparse::TcpSlice;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    SynSent,
    SynRcvd,
    Established,
    Closing,
}

/// Which way a segment crossed the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Internal host to external peer.
    Outbound,
    /// External peer to internal host.
    Inbound,
}

/// The header fields the state machine looks at.
#[derive(Debug, Clone, Copy)]
pub struct SegmentMeta {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub seq: u32,
    pub ack_number: u32,
}

impl SegmentMeta {
    pub fn of(tcp: &TcpSlice<'_>) -> Self {
        Self {
            syn: tcp.syn(),
            ack: tcp.ack(),
            fin: tcp.fin(),
            seq: tcp.sequence_number(),
            ack_number: tcp.acknowledgment_number(),
        }
    }

    /// A connection-opening SYN: no ACK flag, zero acknowledgment number.
    pub fn is_opening_syn(&self) -> bool {
        self.syn && !self.ack && self.ack_number == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) struct Connection {
    pub state: TcpState,
    pub client_isn: u32,
    pub server_isn: u32,
    pub last_used: Instant,
}

impl Connection {
    /// A connection first seen from the inside; the opening SYN is applied
    /// through [`Connection::advance`].
    pub fn new_outbound(now: Instant) -> Self {
        Self {
            state: TcpState::Closed,
            client_isn: 0,
            server_isn: 0,
            last_used: now,
        }
    }

    /// A connection first seen from the outside on an existing mapping.
    ///
    /// Endpoint-independent filtering: any external peer may talk to a
    /// mapped port, so an unsolicited SYN opens tracking in `SynRcvd`.
    pub fn new_inbound(seg: &SegmentMeta, now: Instant) -> Self {
        Self {
            state: TcpState::SynRcvd,
            client_isn: 0,
            server_isn: seg.seq,
            last_used: now,
        }
    }

    /// Applies one segment to the state machine.
    ///
    /// Unexpected segments do not transition; the packet itself is still
    /// forwarded by the caller because the mapping exists.
    pub fn advance(&mut self, dir: Direction, seg: &SegmentMeta) {
        use Direction::*;
        use TcpState::*;

        let next = match (self.state, dir) {
            (Closed, Outbound) if seg.is_opening_syn() => {
                self.client_isn = seg.seq;

                Some(SynSent)
            }
            (SynSent, Inbound)
                if seg.syn && seg.ack && seg.ack_number == self.client_isn.wrapping_add(1) =>
            {
                self.server_isn = seg.seq;

                Some(SynRcvd)
            }
            // Simultaneous open: both ends sent a bare SYN.
            (SynSent, Inbound) if seg.syn && !seg.ack => {
                self.server_isn = seg.seq;

                Some(SynRcvd)
            }
            (SynRcvd, Outbound)
                if !seg.syn
                    && seg.ack
                    && seg.seq == self.client_isn.wrapping_add(1)
                    && seg.ack_number == self.server_isn.wrapping_add(1) =>
            {
                Some(Established)
            }
            (SynRcvd, Inbound) if seg.syn && seg.ack => Some(Established),
            (Established, _) if seg.fin && seg.ack => Some(Closing),
            _ => None,
        };

        if let Some(next) = next {
            tracing::trace!(from = ?self.state, to = ?next, "TCP transition");

            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(syn: bool, ack: Option<u32>, fin: bool, seq: u32) -> SegmentMeta {
        SegmentMeta {
            syn,
            ack: ack.is_some(),
            fin,
            seq,
            ack_number: ack.unwrap_or(0),
        }
    }

    #[test]
    fn three_way_handshake() {
        let now = Instant::now();
        let mut conn = Connection::new_outbound(now);

        conn.advance(Direction::Outbound, &seg(true, None, false, 1000));
        assert_eq!(conn.state, TcpState::SynSent);
        assert_eq!(conn.client_isn, 1000);

        conn.advance(Direction::Inbound, &seg(true, Some(1001), false, 5000));
        assert_eq!(conn.state, TcpState::SynRcvd);
        assert_eq!(conn.server_isn, 5000);

        conn.advance(Direction::Outbound, &seg(false, Some(5001), false, 1001));
        assert_eq!(conn.state, TcpState::Established);
    }

    #[test]
    fn syn_ack_with_wrong_ack_number_is_ignored() {
        let now = Instant::now();
        let mut conn = Connection::new_outbound(now);

        conn.advance(Direction::Outbound, &seg(true, None, false, 1000));
        conn.advance(Direction::Inbound, &seg(true, Some(999), false, 5000));

        assert_eq!(conn.state, TcpState::SynSent);
    }

    #[test]
    fn simultaneous_open() {
        let now = Instant::now();
        let mut conn = Connection::new_outbound(now);

        conn.advance(Direction::Outbound, &seg(true, None, false, 1000));
        conn.advance(Direction::Inbound, &seg(true, None, false, 5000));

        assert_eq!(conn.state, TcpState::SynRcvd);

        conn.advance(Direction::Inbound, &seg(true, Some(1001), false, 5000));

        assert_eq!(conn.state, TcpState::Established);
    }

    #[test]
    fn fin_ack_closes_from_either_direction() {
        let now = Instant::now();

        for dir in [Direction::Outbound, Direction::Inbound] {
            let mut conn = Connection::new_outbound(now);
            conn.state = TcpState::Established;

            conn.advance(dir, &seg(false, Some(77), true, 42));

            assert_eq!(conn.state, TcpState::Closing);
        }
    }

    #[test]
    fn unsolicited_inbound_starts_in_syn_rcvd() {
        let now = Instant::now();
        let syn = seg(true, None, false, 9000);

        let conn = Connection::new_inbound(&syn, now);

        assert_eq!(conn.state, TcpState::SynRcvd);
        assert_eq!(conn.server_isn, 9000);
    }
}
