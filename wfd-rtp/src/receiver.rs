//! Receive-side RTP processing: per-SSRC reordering, loss declaration,
//! retransmission requests and receiver reports.

use crate::assembler::{AacAssembler, AssembledUnit, Assembler, H264Assembler, TsAssembler};
use crate::packet::Packet;
use crate::packetizer::PacketizationMode;
use bytes::{Bytes, BytesMut};
use rtcp::receiver_report::{ReceiverReport, ReceptionReport};
use rtcp::nack::{GenericNack, NackPair};
use rtcp::source_description::SourceDescription;
use shared::error::Result;
use shared::time::rtp_time_to_us;
use shared::util::SOURCE_ID;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Sequence delta below which a packet is considered in order.
pub const MAX_DROPOUT: u16 = 3000;
/// Sequence delta above which a backwards packet is a reorder rather than
/// a restart.
pub const MAX_MISORDER: u16 = 100;

/// How long after a packet's projected arrival time it is declared lost.
pub const PACKET_LOST_AFTER: Duration = Duration::from_millis(100);

/// Receiver report cadence.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(5);

const SDES_CNAME: &str = "wfd@localhost";
const SDES_TOOL: &str = "wfd/0.1";

/// Something the receiver wants its owner to act on.
#[derive(Debug)]
pub enum ReceiverEvent {
    /// An access unit completed, in strict extended-sequence order.
    AccessUnit { ssrc: u32, unit: AssembledUnit },
    /// A gap was declared lost after its grace period expired.
    PacketLost { ssrc: u32 },
    /// An RTCP packet (receiver report or NACK) ready to go out on the
    /// RTCP socket.
    RtcpReady(Bytes),
}

/// Per-SSRC reception state (RFC 3550 appendix A.1 bookkeeping plus the
/// reorder queue and loss timers).
struct RecvSource {
    ssrc: u32,

    first: bool,
    max_seq: u16,
    /// Shifted cycle count; ORed with the 16-bit sequence to form the
    /// extended sequence number.
    cycles: u32,
    base_seq: u32,
    received: u32,
    expected_prior: u32,
    received_prior: u32,

    /// Anchor mapping the first packet's RTP clock to its arrival time;
    /// projected arrival times for later packets derive from it.
    first_arrival: Option<(Instant, i64)>,

    /// Out-of-order packets keyed by extended sequence number.
    pending: BTreeMap<u32, Packet>,
    /// The next extended sequence number owed to the assembler.
    awaiting_ext_seq: Option<u32>,

    declare_lost_deadline: Option<Instant>,
    retransmit_deadline: Option<Instant>,
    requested_retransmission: bool,

    active_packet_type: Option<u8>,
    active_assembler: Option<Box<dyn Assembler>>,

    num_declared_lost: u32,
}

impl RecvSource {
    fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            first: true,
            max_seq: 0,
            cycles: 0,
            base_seq: 0,
            received: 0,
            expected_prior: 0,
            received_prior: 0,
            first_arrival: None,
            pending: BTreeMap::new(),
            awaiting_ext_seq: None,
            declare_lost_deadline: None,
            retransmit_deadline: None,
            requested_retransmission: false,
            active_packet_type: None,
            active_assembler: None,
            num_declared_lost: 0,
        }
    }

    fn ext_max_seq(&self) -> u32 {
        self.cycles | self.max_seq as u32
    }

    fn cancel_timers(&mut self) {
        self.declare_lost_deadline = None;
        self.retransmit_deadline = None;
    }

    /// Builds one RR report block for this source and resets the interval
    /// counters.
    fn report_block(&mut self) -> ReceptionReport {
        let ext_max = self.ext_max_seq();
        let expected = ext_max.wrapping_sub(self.base_seq).wrapping_add(1);

        let lost = (expected as i64 - self.received as i64)
            .clamp(-0x80_0000, 0x7f_ffff) as i32;

        let expected_interval = expected.wrapping_sub(self.expected_prior);
        self.expected_prior = expected;

        let received_interval = self.received.wrapping_sub(self.received_prior);
        self.received_prior = self.received;

        let lost_interval = expected_interval as i64 - received_interval as i64;

        let fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval as i64) as u8
        };

        ReceptionReport {
            ssrc: self.ssrc,
            fraction_lost,
            total_lost: lost,
            last_sequence_number: ext_max,
            jitter: 0,
            last_sender_report: 0,
            delay: 0,
        }
    }
}

/// Sans-io receive half of an RTP channel.
///
/// The owner feeds raw RTP datagrams through [`handle_rtp`](Receiver::handle_rtp),
/// drives timers via [`poll_timeout`](Receiver::poll_timeout) /
/// [`handle_timeout`](Receiver::handle_timeout), and drains
/// [`ReceiverEvent`]s.
pub struct Receiver {
    packet_types: HashMap<u8, PacketizationMode>,
    sources: HashMap<u32, RecvSource>,
    events: VecDeque<ReceiverEvent>,

    /// `None` disables retransmission requests (the default).
    request_retransmission_after: Option<Duration>,

    next_report: Option<Instant>,
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver {
    pub fn new() -> Self {
        Self {
            packet_types: HashMap::new(),
            sources: HashMap::new(),
            events: VecDeque::new(),
            request_retransmission_after: None,
            next_report: None,
        }
    }

    /// Registers the assembler kind used for a payload type
    /// (33 → TS, 96 → AAC, 97 → H264 by convention).
    pub fn register_packet_type(&mut self, payload_type: u8, mode: PacketizationMode) {
        self.packet_types.insert(payload_type, mode);
    }

    /// Enables generic-NACK retransmission requests, fired `after` the
    /// awaited packet's projected arrival time.
    pub fn enable_retransmission(&mut self, after: Duration) {
        self.request_retransmission_after = Some(after);
    }

    pub fn packets_declared_lost(&self) -> u32 {
        self.sources.values().map(|s| s.num_declared_lost).sum()
    }

    /// Processes one received RTP datagram.
    pub fn handle_rtp(&mut self, now: Instant, data: &[u8]) -> Result<()> {
        let packet = Packet::unmarshal(data)?;
        let ssrc = packet.header.ssrc;
        let seq = packet.header.sequence_number;

        if self.next_report.is_none() {
            self.next_report = Some(now + REPORT_INTERVAL);
        }

        let source = self
            .sources
            .entry(ssrc)
            .or_insert_with(|| RecvSource::new(ssrc));

        if source.first {
            source.first = false;
            source.base_seq = seq as u32;
            source.max_seq = seq;
            source.received += 1;
            Self::queue_packet(source, &mut self.events, &self.packet_types,
                self.request_retransmission_after, now, seq as u32, packet);
            return Ok(());
        }

        let udelta = seq.wrapping_sub(source.max_seq);
        if udelta < MAX_DROPOUT {
            // In order, with permissible gap.
            if seq < source.max_seq {
                // Sequence number wrapped - count another 64K cycle.
                source.cycles = source.cycles.wrapping_add(1 << 16);
            }
            source.max_seq = seq;
            source.received += 1;
        } else if udelta <= u16::MAX - MAX_MISORDER {
            // The sequence number made a very large jump.
            log::debug!("ssrc {ssrc:08x}: dropping packet with wild seq jump {udelta}");
            return Ok(());
        }
        // Otherwise duplicate or reordered packet; queue without counting.

        let ext_seq = source.cycles | seq as u32;
        Self::queue_packet(source, &mut self.events, &self.packet_types,
            self.request_retransmission_after, now, ext_seq, packet);
        Ok(())
    }

    fn queue_packet(
        source: &mut RecvSource,
        events: &mut VecDeque<ReceiverEvent>,
        packet_types: &HashMap<u8, PacketizationMode>,
        retransmit_after: Option<Duration>,
        now: Instant,
        ext_seq: u32,
        packet: Packet,
    ) {
        if source.first_arrival.is_none() {
            source.first_arrival =
                Some((now, rtp_time_to_us(packet.header.timestamp)));
        }

        if let Some(awaiting) = source.awaiting_ext_seq {
            if ext_seq < awaiting {
                // Arrived late; no longer interesting.
                log::debug!("ssrc {:08x}: dropping stale ext seq {ext_seq}", source.ssrc);
                return;
            }
        }

        if source.pending.contains_key(&ext_seq) {
            // Duplicate packet.
            return;
        }

        source.pending.insert(ext_seq, packet);
        Self::dequeue_more(source, events, packet_types, retransmit_after);
    }

    fn dequeue_more(
        source: &mut RecvSource,
        events: &mut VecDeque<ReceiverEvent>,
        packet_types: &HashMap<u8, PacketizationMode>,
        retransmit_after: Option<Duration>,
    ) {
        loop {
            let Some((&head, _)) = source.pending.first_key_value() else {
                break;
            };

            match source.awaiting_ext_seq {
                None => source.awaiting_ext_seq = Some(head),
                Some(awaiting) if head != awaiting => break,
                Some(_) => {}
            }

            let packet = source.pending.remove(&head).unwrap();
            source.cancel_timers();
            source.requested_retransmission = false;

            let packet_type = packet.header.payload_type;
            if source.active_packet_type != Some(packet_type) {
                source.active_assembler =
                    packet_types.get(&packet_type).map(|mode| match mode {
                        PacketizationMode::H264 => {
                            Box::new(H264Assembler::new()) as Box<dyn Assembler>
                        }
                        PacketizationMode::Aac => Box::new(AacAssembler::new()),
                        PacketizationMode::TransportStream | PacketizationMode::None => {
                            Box::new(TsAssembler::new())
                        }
                    });
                if source.active_assembler.is_none() {
                    log::warn!("no assembler registered for payload type {packet_type}");
                }
                source.active_packet_type = Some(packet_type);
            }

            if let Some(assembler) = source.active_assembler.as_mut() {
                if let Err(e) = assembler.process_packet(&packet) {
                    log::debug!("assembler returned error: {e}");
                }
                while let Some(unit) = assembler.poll_unit() {
                    events.push_back(ReceiverEvent::AccessUnit {
                        ssrc: source.ssrc,
                        unit,
                    });
                }
            }

            source.awaiting_ext_seq = Some(head.wrapping_add(1));
        }

        if source.declare_lost_deadline.is_some() || source.pending.is_empty() {
            return;
        }

        // The head of the queue is not the awaited packet; project when the
        // awaited one should have arrived from the first packet's RTP
        // anchor, and give it a grace period past that.
        let (&head, head_packet) = source.pending.first_key_value().unwrap();
        debug_assert!(source.awaiting_ext_seq.unwrap() < head);

        let (anchor_instant, anchor_rtp_us) = source.first_arrival.unwrap();
        let rtp_us = rtp_time_to_us(head_packet.header.timestamp);
        let elapsed_us = (rtp_us - anchor_rtp_us).max(0) as u64;
        let max_arrival = anchor_instant + Duration::from_micros(elapsed_us);

        source.declare_lost_deadline = Some(max_arrival + PACKET_LOST_AFTER);
        if let Some(after) = retransmit_after {
            source.retransmit_deadline = Some(max_arrival + after);
        }
    }

    /// Earliest time at which `handle_timeout` wants to run.
    pub fn poll_timeout(&self) -> Option<Instant> {
        let mut earliest = self.next_report;
        for source in self.sources.values() {
            for deadline in [source.declare_lost_deadline, source.retransmit_deadline] {
                earliest = match (earliest, deadline) {
                    (None, d) => d,
                    (e, None) => e,
                    (Some(e), Some(d)) => Some(e.min(d)),
                };
            }
        }
        earliest
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        for source in self.sources.values_mut() {
            if let Some(deadline) = source.retransmit_deadline {
                if deadline <= now && !source.requested_retransmission {
                    source.requested_retransmission = true;
                    source.retransmit_deadline = None;

                    if let Some(awaiting) = source.awaiting_ext_seq {
                        let nack = GenericNack {
                            sender_ssrc: SOURCE_ID,
                            media_ssrc: SOURCE_ID,
                            nacks: vec![NackPair {
                                packet_id: (awaiting & 0xffff) as u16,
                                lost_packets: 0,
                            }],
                        };
                        self.events.push_back(ReceiverEvent::RtcpReady(nack.marshal()));
                    }
                }
            }

            if let Some(deadline) = source.declare_lost_deadline {
                if deadline <= now {
                    source.cancel_timers();
                    source.requested_retransmission = false;

                    if let Some(assembler) = source.active_assembler.as_mut() {
                        assembler.signal_discontinuity();
                    }

                    source.awaiting_ext_seq =
                        source.awaiting_ext_seq.map(|s| s.wrapping_add(1));
                    source.num_declared_lost += 1;

                    self.events.push_back(ReceiverEvent::PacketLost { ssrc: source.ssrc });

                    Self::dequeue_more(
                        source,
                        &mut self.events,
                        &self.packet_types,
                        self.request_retransmission_after,
                    );
                }
            }
        }

        if let Some(next_report) = self.next_report {
            if next_report <= now {
                self.next_report = Some(now + REPORT_INTERVAL);
                let rr = self.build_receiver_report();
                self.events.push_back(ReceiverEvent::RtcpReady(rr));
            }
        }
    }

    /// Builds the periodic RR + SDES compound.
    fn build_receiver_report(&mut self) -> Bytes {
        let mut reports = Vec::new();
        for source in self.sources.values_mut() {
            if reports.len() >= 31 {
                break;
            }
            reports.push(source.report_block());
        }

        let rr = ReceiverReport {
            ssrc: SOURCE_ID,
            reports,
        };
        let sdes = SourceDescription::new(SOURCE_ID, SDES_CNAME, SDES_TOOL);

        let mut compound = BytesMut::new();
        compound.extend_from_slice(&rr.marshal());
        compound.extend_from_slice(&sdes.marshal());
        compound.freeze()
    }

    pub fn poll_event(&mut self) -> Option<ReceiverEvent> {
        self.events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{Header, VERSION};
    use crate::PAYLOAD_TYPE_TS;

    fn ts_rtp(seq: u16, rtp_time: u32) -> Vec<u8> {
        Packet {
            header: Header {
                version: VERSION,
                payload_type: PAYLOAD_TYPE_TS,
                sequence_number: seq,
                timestamp: rtp_time,
                ssrc: 0xdeadbeef,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x47; 188]),
        }
        .marshal()
        .to_vec()
    }

    fn receiver() -> Receiver {
        let mut receiver = Receiver::new();
        receiver.register_packet_type(PAYLOAD_TYPE_TS, PacketizationMode::TransportStream);
        receiver
    }

    fn delivered_seqs(receiver: &mut Receiver) -> Vec<i64> {
        let mut times = Vec::new();
        while let Some(event) = receiver.poll_event() {
            if let ReceiverEvent::AccessUnit { unit, .. } = event {
                times.push(unit.time_us);
            }
        }
        times
    }

    #[test]
    fn test_reorder_within_window_delivers_in_order() {
        // §"UDP reorder within window": [1, 3, 2, 4, 5] delivers as
        // [1, 2, 3, 4, 5] with no PacketLost.
        let mut receiver = receiver();
        let now = Instant::now();

        for seq in [1u16, 3, 2, 4, 5] {
            receiver
                .handle_rtp(now, &ts_rtp(seq, seq as u32 * 90))
                .unwrap();
        }

        let mut lost = 0;
        let mut order = Vec::new();
        while let Some(event) = receiver.poll_event() {
            match event {
                ReceiverEvent::AccessUnit { unit, .. } => order.push(unit.time_us * 9 / 100 / 90),
                ReceiverEvent::PacketLost { .. } => lost += 1,
                ReceiverEvent::RtcpReady(_) => {}
            }
        }
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
        assert_eq!(lost, 0);
    }

    #[test]
    fn test_loss_declared_after_grace_period() {
        // §"UDP loss": [1, 2, 4, 5] then, 100 ms past packet 3's projected
        // arrival, exactly one PacketLost fires and 4, 5 deliver.
        let mut receiver = receiver();
        let now = Instant::now();

        for seq in [1u16, 2, 4, 5] {
            receiver.handle_rtp(now, &ts_rtp(seq, 0)).unwrap();
        }
        assert_eq!(delivered_seqs(&mut receiver).len(), 2);

        let deadline = receiver.poll_timeout().unwrap();
        assert!(deadline <= now + PACKET_LOST_AFTER + Duration::from_millis(1));

        receiver.handle_timeout(deadline);

        let mut lost = 0;
        let mut delivered = 0;
        while let Some(event) = receiver.poll_event() {
            match event {
                ReceiverEvent::PacketLost { .. } => lost += 1,
                ReceiverEvent::AccessUnit { .. } => delivered += 1,
                ReceiverEvent::RtcpReady(_) => {}
            }
        }
        assert_eq!(lost, 1);
        assert_eq!(delivered, 2);
        assert_eq!(receiver.packets_declared_lost(), 1);
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let mut receiver = receiver();
        let now = Instant::now();

        receiver.handle_rtp(now, &ts_rtp(10, 0)).unwrap();
        receiver.handle_rtp(now, &ts_rtp(10, 0)).unwrap();

        assert_eq!(delivered_seqs(&mut receiver).len(), 1);
    }

    #[test]
    fn test_wild_jump_is_dropped() {
        let mut receiver = receiver();
        let now = Instant::now();

        receiver.handle_rtp(now, &ts_rtp(10, 0)).unwrap();
        receiver
            .handle_rtp(now, &ts_rtp(10 + MAX_DROPOUT + 7, 0))
            .unwrap();

        assert_eq!(delivered_seqs(&mut receiver).len(), 1);
    }

    #[test]
    fn test_extended_seq_survives_wrap() {
        let mut receiver = receiver();
        let now = Instant::now();

        for seq in [65533u16, 65534, 65535, 0, 1] {
            receiver.handle_rtp(now, &ts_rtp(seq, 0)).unwrap();
        }
        assert_eq!(delivered_seqs(&mut receiver).len(), 5);
        assert!(receiver.poll_timeout().unwrap() > now + Duration::from_secs(1));
    }

    #[test]
    fn test_retransmission_requests_nack_for_awaited_seq() {
        let mut receiver = receiver();
        receiver.enable_retransmission(Duration::from_millis(20));
        let now = Instant::now();

        receiver.handle_rtp(now, &ts_rtp(1, 0)).unwrap();
        receiver.handle_rtp(now, &ts_rtp(3, 0)).unwrap();
        delivered_seqs(&mut receiver);

        receiver.handle_timeout(now + Duration::from_millis(25));

        let mut nack_seen = false;
        while let Some(event) = receiver.poll_event() {
            if let ReceiverEvent::RtcpReady(data) = event {
                let packets = rtcp::parse_compound(&data).unwrap();
                if let rtcp::Packet::GenericNack(nack) = &packets[0] {
                    assert_eq!(nack.nacks[0].packet_id, 2);
                    nack_seen = true;
                }
            }
        }
        assert!(nack_seen);
    }

    #[test]
    fn test_receiver_report_every_five_seconds() {
        let mut receiver = receiver();
        let now = Instant::now();

        for seq in 1u16..=10 {
            receiver.handle_rtp(now, &ts_rtp(seq, 0)).unwrap();
        }
        delivered_seqs(&mut receiver);

        receiver.handle_timeout(now + REPORT_INTERVAL);

        let mut saw_rr = false;
        while let Some(event) = receiver.poll_event() {
            if let ReceiverEvent::RtcpReady(data) = event {
                let packets = rtcp::parse_compound(&data).unwrap();
                assert!(matches!(packets[0], rtcp::Packet::ReceiverReport(_)));
                assert!(matches!(packets[1], rtcp::Packet::SourceDescription(_)));
                if let rtcp::Packet::ReceiverReport(rr) = &packets[0] {
                    assert_eq!(rr.reports.len(), 1);
                    assert_eq!(rr.reports[0].ssrc, 0xdeadbeef);
                    assert_eq!(rr.reports[0].fraction_lost, 0);
                }
                saw_rr = true;
            }
        }
        assert!(saw_rr);
    }
}
