use crate::header::{Header, PacketType, HEADER_LENGTH};
use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

/// Feedback message type of a generic NACK (RFC 4585 section 6.2.1).
pub const FMT_GENERIC_NACK: u8 = 1;

/// One lost-packet entry: a packet id plus a bitmask covering the
/// following 16 sequence numbers.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct NackPair {
    pub packet_id: u16,
    pub lost_packets: u16,
}

impl NackPair {
    /// Expands the pair into the sequence numbers it names.
    pub fn packet_list(&self) -> Vec<u16> {
        let mut seqs = vec![self.packet_id];
        for i in 0..16 {
            if self.lost_packets & (1 << i) != 0 {
                seqs.push(self.packet_id.wrapping_add(i + 1));
            }
        }
        seqs
    }
}

/// A transport-layer feedback packet (packet type 205, fmt 1) listing lost
/// sequence numbers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GenericNack {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub nacks: Vec<NackPair>,
}

impl GenericNack {
    pub fn marshal(&self) -> Bytes {
        let words = 2 + self.nacks.len();
        let mut buf = BytesMut::with_capacity(4 * (words + 1));
        Header {
            padding: false,
            count: FMT_GENERIC_NACK,
            packet_type: PacketType::TransportSpecificFeedback.into(),
            length: words as u16,
        }
        .marshal_to(&mut buf);

        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        for pair in &self.nacks {
            buf.put_u16(pair.packet_id);
            buf.put_u16(pair.lost_packets);
        }

        buf.freeze()
    }

    pub fn unmarshal(data: &[u8]) -> Result<GenericNack> {
        let header = Header::unmarshal(data)?;
        if PacketType::from(header.packet_type) != PacketType::TransportSpecificFeedback {
            return Err(Error::ErrWrongRtcpType);
        }
        if header.count != FMT_GENERIC_NACK {
            return Err(Error::ErrUnsupportedFeedbackFormat);
        }
        if data.len() < HEADER_LENGTH + 8 {
            return Err(Error::ErrRtcpPacketTooShort);
        }

        let mut nacks = Vec::new();
        let mut off = HEADER_LENGTH + 8;
        while off + 4 <= data.len() {
            nacks.push(NackPair {
                packet_id: u16::from_be_bytes([data[off], data[off + 1]]),
                lost_packets: u16::from_be_bytes([data[off + 2], data[off + 3]]),
            });
            off += 4;
        }

        Ok(GenericNack {
            sender_ssrc: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            media_ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            nacks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nack_round_trip() {
        let nack = GenericNack {
            sender_ssrc: 0xdeadbeef,
            media_ssrc: 0xdeadbeef,
            nacks: vec![NackPair {
                packet_id: 42,
                lost_packets: 0b1011,
            }],
        };

        let wire = nack.marshal();
        assert_eq!(wire.len(), 16);
        let parsed = GenericNack::unmarshal(&wire).unwrap();
        assert_eq!(parsed, nack);
    }

    #[test]
    fn test_packet_list_expands_blp() {
        let pair = NackPair {
            packet_id: 100,
            lost_packets: 0b1001,
        };
        assert_eq!(pair.packet_list(), vec![100, 101, 104]);
    }

    #[test]
    fn test_packet_list_wraps() {
        let pair = NackPair {
            packet_id: 65535,
            lost_packets: 0b1,
        };
        assert_eq!(pair.packet_list(), vec![65535, 0]);
    }

    #[test]
    fn test_rejects_unknown_fmt() {
        let nack = GenericNack::default();
        let mut wire = nack.marshal().to_vec();
        wire[0] = (wire[0] & 0xe0) | 15;
        assert_eq!(
            GenericNack::unmarshal(&wire),
            Err(Error::ErrUnsupportedFeedbackFormat)
        );
    }
}
