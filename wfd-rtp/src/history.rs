//! Send history for NACK-triggered retransmission.

use crate::packet::Packet;
use std::collections::VecDeque;

/// Default history depth: the last 1024 packets sent.
pub const DEFAULT_HISTORY_SIZE: usize = 1024;

/// The most recently sent RTP packets, oldest dropped first.
///
/// Because every packet on a channel comes out of one sequence counter,
/// the stored packets always carry consecutive sequence numbers; a NACKed
/// sequence is located by its offset from the oldest entry instead of a
/// scan. A sequence that has already aged out of the window yields `None`
/// and is not an error.
pub struct SendHistory {
    packets: VecDeque<Packet>,
    capacity: usize,
}

impl Default for SendHistory {
    fn default() -> Self {
        SendHistory::new(DEFAULT_HISTORY_SIZE)
    }
}

impl SendHistory {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity <= u16::MAX as usize);
        Self {
            packets: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Records a sent packet, dropping the oldest once the window is
    /// full. Packets must be recorded in send order.
    pub fn record(&mut self, packet: Packet) {
        if let Some(newest) = self.packets.back() {
            debug_assert_eq!(
                packet.header.sequence_number,
                newest.header.sequence_number.wrapping_add(1),
                "history requires consecutive sequence numbers"
            );
        }

        if self.packets.len() == self.capacity {
            self.packets.pop_front();
        }
        self.packets.push_back(packet);
    }

    /// Looks a packet up by its 16-bit sequence number.
    pub fn lookup(&self, seq: u16) -> Option<&Packet> {
        let oldest = self.packets.front()?.header.sequence_number;

        // Consecutive storage makes the wrapped distance from the oldest
        // entry the packet's position; anything at or past the length is
        // either not sent yet or long gone.
        let offset = seq.wrapping_sub(oldest) as usize;
        let packet = self.packets.get(offset)?;

        debug_assert_eq!(packet.header.sequence_number, seq);
        Some(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;
    use bytes::Bytes;

    fn make_packet(seq: u16) -> Packet {
        Packet {
            header: Header {
                sequence_number: seq,
                ..Default::default()
            },
            payload: Bytes::copy_from_slice(&seq.to_be_bytes()),
        }
    }

    #[test]
    fn test_lookup_returns_the_recorded_packet() {
        let mut history = SendHistory::new(8);
        history.record(make_packet(100));
        history.record(make_packet(101));

        assert_eq!(history.lookup(100).unwrap().payload, make_packet(100).payload);
        assert_eq!(history.lookup(101).unwrap().header.sequence_number, 101);
        assert!(history.lookup(102).is_none());
        assert!(history.lookup(99).is_none());
    }

    #[test]
    fn test_old_packets_age_out() {
        let mut history = SendHistory::new(8);
        for seq in 0..16 {
            history.record(make_packet(seq));
        }

        for seq in 0..8 {
            assert!(history.lookup(seq).is_none());
        }
        for seq in 8..16 {
            assert!(history.lookup(seq).is_some());
        }
    }

    #[test]
    fn test_lookup_across_sequence_wrap() {
        let mut history = SendHistory::new(8);
        for seq in [65534u16, 65535, 0, 1] {
            history.record(make_packet(seq));
        }

        assert!(history.lookup(65534).is_some());
        assert!(history.lookup(65535).is_some());
        assert!(history.lookup(0).is_some());
        assert!(history.lookup(1).is_some());
        assert!(history.lookup(2).is_none());
    }

    #[test]
    fn test_empty_history() {
        let history = SendHistory::new(8);
        assert!(history.lookup(0).is_none());
    }

    #[test]
    fn test_default_depth_is_1024() {
        let mut history = SendHistory::default();
        for seq in 0..2000u16 {
            history.record(make_packet(seq));
        }
        assert!(history.lookup(975).is_none());
        assert!(history.lookup(976).is_some());
        assert!(history.lookup(1999).is_some());
    }
}
