//! The send half of one RTP channel: packetization, retransmission
//! history and inbound RTCP handling.

use bytes::Bytes;
use rtcp::app::LatenessReport;
use rtcp::Packet as RtcpPacket;
use rtp::history::SendHistory;
use rtp::packetizer::{PacketizationMode, Packetizer};
use shared::error::Result;
use shared::util::SOURCE_ID;

/// Wire datagrams plus feedback produced by one call into the sender.
#[derive(Debug, Default)]
pub struct RtcpOutcome {
    /// Byte-identical retransmissions answering a NACK.
    pub retransmissions: Vec<Bytes>,
    /// A decoded "late" APP report, surfaced to the bitrate governor.
    pub inform_sender: Option<LatenessReport>,
}

/// Packetizes access units onto an RTP channel and answers NACKs from the
/// 1024-packet send history. The owner provides the sockets; this type
/// only produces datagrams.
pub struct RtpSender {
    packetizer: Packetizer,
    history: SendHistory,
    num_rtp_sent: u64,
    num_rtp_octets_sent: u64,
}

impl Default for RtpSender {
    fn default() -> Self {
        Self::new()
    }
}

impl RtpSender {
    pub fn new() -> Self {
        Self {
            packetizer: Packetizer::new(),
            history: SendHistory::default(),
            num_rtp_sent: 0,
            num_rtp_octets_sent: 0,
        }
    }

    pub fn num_rtp_sent(&self) -> u64 {
        self.num_rtp_sent
    }

    /// Packetizes one buffer into wire datagrams, recording each in the
    /// retransmission history.
    pub fn queue_buffer(
        &mut self,
        mode: PacketizationMode,
        payload: &[u8],
        payload_type: u8,
        time_us: i64,
    ) -> Result<Vec<Bytes>> {
        let packets = self
            .packetizer
            .packetize(mode, payload, payload_type, time_us)?;

        let mut datagrams = Vec::with_capacity(packets.len());
        for packet in packets {
            let wire = packet.marshal();
            self.num_rtp_sent += 1;
            self.num_rtp_octets_sent += (wire.len() - 12) as u64;
            self.history.record(packet);
            datagrams.push(wire);
        }

        Ok(datagrams)
    }

    /// Processes an inbound RTCP datagram from the peer.
    ///
    /// Generic NACKs are answered from the history; sequences already
    /// outside the window are skipped silently. Retransmitted packets are
    /// not re-recorded.
    pub fn handle_rtcp(&mut self, data: &[u8]) -> Result<RtcpOutcome> {
        let mut outcome = RtcpOutcome::default();

        for packet in rtcp::parse_compound(data)? {
            match packet {
                RtcpPacket::GenericNack(nack) => {
                    if nack.media_ssrc != SOURCE_ID {
                        log::debug!("NACK for foreign ssrc {:08x}", nack.media_ssrc);
                        continue;
                    }
                    for pair in &nack.nacks {
                        for seq in pair.packet_list() {
                            if let Some(packet) = self.history.lookup(seq) {
                                outcome.retransmissions.push(packet.marshal());
                            } else {
                                log::debug!(
                                    "seq {seq} no longer available for retransmission"
                                );
                            }
                        }
                    }
                }
                RtcpPacket::App(app) => {
                    if let Some(report) = LatenessReport::from_app(&app) {
                        outcome.inform_sender = Some(report);
                    }
                }
                RtcpPacket::ReceiverReport(rr) => {
                    for report in &rr.reports {
                        log::info!(
                            "peer lost {:.2}% of packets during report interval",
                            100.0 * report.fraction_lost as f64 / 256.0
                        );
                    }
                }
                RtcpPacket::SourceDescription(_) => {}
                RtcpPacket::Unknown { packet_type, .. } => {
                    log::debug!("ignoring RTCP packet type {packet_type}");
                }
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtcp::nack::{GenericNack, NackPair};

    #[test]
    fn test_nack_round_trip_byte_identical() {
        // §"NACK round trip": send 2000 packets, NACK 1500 with BLP 0x0001;
        // exactly two byte-identical retransmissions come back.
        let mut sender = RtpSender::new();

        let mut originals = Vec::new();
        for i in 0..2000i64 {
            let wire = sender
                .queue_buffer(PacketizationMode::None, &[i as u8; 32], 33, i * 1000)
                .unwrap();
            originals.extend(wire);
        }

        let nack = GenericNack {
            sender_ssrc: SOURCE_ID,
            media_ssrc: SOURCE_ID,
            nacks: vec![NackPair {
                packet_id: 1500,
                lost_packets: 0x0001,
            }],
        };

        let outcome = sender.handle_rtcp(&nack.marshal()).unwrap();
        assert_eq!(outcome.retransmissions.len(), 2);
        assert_eq!(outcome.retransmissions[0], originals[1500]);
        assert_eq!(outcome.retransmissions[1], originals[1501]);
    }

    #[test]
    fn test_nack_outside_window_is_silent() {
        let mut sender = RtpSender::new();
        for i in 0..2000i64 {
            sender
                .queue_buffer(PacketizationMode::None, &[1, 2, 3], 33, i)
                .unwrap();
        }

        // 2000 packets sent with a 1024 window: seq 100 is long gone.
        let nack = GenericNack {
            sender_ssrc: SOURCE_ID,
            media_ssrc: SOURCE_ID,
            nacks: vec![NackPair {
                packet_id: 100,
                lost_packets: 0,
            }],
        };

        let outcome = sender.handle_rtcp(&nack.marshal()).unwrap();
        assert!(outcome.retransmissions.is_empty());
    }

    #[test]
    fn test_late_app_report_surfaces() {
        let mut sender = RtpSender::new();
        let report = LatenessReport {
            avg_latency_us: 350_000,
            max_latency_us: 500_000,
        };

        let outcome = sender
            .handle_rtcp(&report.to_app(SOURCE_ID).marshal())
            .unwrap();
        assert_eq!(outcome.inform_sender, Some(report));
    }

    #[test]
    fn test_sequence_numbers_continuous_across_modes() {
        let mut sender = RtpSender::new();
        sender
            .queue_buffer(PacketizationMode::None, &[0; 8], 33, 0)
            .unwrap();
        let second = sender
            .queue_buffer(PacketizationMode::Aac, &[0; 8], 96, 0)
            .unwrap();
        let packet = rtp::Packet::unmarshal(&second[0]).unwrap();
        assert_eq!(packet.header.sequence_number, 1);
    }
}
