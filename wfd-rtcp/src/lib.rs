#![warn(rust_2018_idioms)]

pub mod app;
pub mod header;
pub mod nack;
pub mod receiver_report;
pub mod source_description;

use bytes::Bytes;
use shared::error::{Error, Result};

use app::App;
use header::{Header, PacketType, HEADER_LENGTH};
use nack::GenericNack;
use receiver_report::ReceiverReport;
use source_description::SourceDescription;

/// One packet of a (possibly compound) RTCP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReceiverReport(ReceiverReport),
    SourceDescription(SourceDescription),
    App(App),
    GenericNack(GenericNack),
    /// A packet type this stack does not interpret; kept for logging.
    Unknown { packet_type: u8, data: Bytes },
}

/// Walks a compound RTCP datagram, yielding every contained packet.
///
/// Sender reports and payload-specific feedback are surfaced as `Unknown`;
/// a truncated or version-mismatched packet aborts the walk with an error.
pub fn parse_compound(data: &[u8]) -> Result<Vec<Packet>> {
    let mut packets = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        if rest.len() < HEADER_LENGTH {
            return Err(Error::ErrRtcpPacketTooShort);
        }

        let header = Header::unmarshal(rest)?;
        let total = header.total_length();
        if rest.len() < total {
            return Err(Error::ErrRtcpPacketTooShort);
        }

        let body = &rest[..total];
        let packet = match PacketType::from(header.packet_type) {
            PacketType::ReceiverReport => {
                Packet::ReceiverReport(ReceiverReport::unmarshal(body)?)
            }
            PacketType::SourceDescription => {
                Packet::SourceDescription(SourceDescription::unmarshal(body)?)
            }
            PacketType::ApplicationDefined => Packet::App(App::unmarshal(body)?),
            PacketType::TransportSpecificFeedback => {
                Packet::GenericNack(GenericNack::unmarshal(body)?)
            }
            _ => Packet::Unknown {
                packet_type: header.packet_type,
                data: Bytes::copy_from_slice(body),
            },
        };

        packets.push(packet);
        rest = &rest[total..];
    }

    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nack::NackPair;

    #[test]
    fn test_parse_compound_rr_then_sdes() {
        let rr = ReceiverReport {
            ssrc: 0xdeadbeef,
            reports: vec![],
        };
        let sdes = SourceDescription::new(0xdeadbeef, "host@wfd", "wfd/0.1");

        let mut wire = rr.marshal().to_vec();
        wire.extend_from_slice(&sdes.marshal());

        let packets = parse_compound(&wire).unwrap();
        assert_eq!(packets.len(), 2);
        assert!(matches!(packets[0], Packet::ReceiverReport(_)));
        assert!(matches!(packets[1], Packet::SourceDescription(_)));
    }

    #[test]
    fn test_parse_compound_nack() {
        let nack = GenericNack {
            sender_ssrc: 1,
            media_ssrc: 0xdeadbeef,
            nacks: vec![NackPair {
                packet_id: 1500,
                lost_packets: 0x0001,
            }],
        };

        let packets = parse_compound(&nack.marshal()).unwrap();
        match &packets[0] {
            Packet::GenericNack(parsed) => {
                assert_eq!(parsed.nacks[0].packet_list(), vec![1500, 1501])
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn test_parse_compound_truncated() {
        let rr = ReceiverReport {
            ssrc: 1,
            reports: vec![],
        };
        let wire = rr.marshal();
        assert!(parse_compound(&wire[..wire.len() - 1]).is_err());
    }
}
