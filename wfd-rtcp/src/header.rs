use bytes::{BufMut, BytesMut};
use shared::error::{Error, Result};

pub const HEADER_LENGTH: usize = 4;
pub const VERSION: u8 = 2;

/// RTCP packet types used by this stack.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PacketType {
    SenderReport,
    ReceiverReport,
    SourceDescription,
    Goodbye,
    ApplicationDefined,
    TransportSpecificFeedback,
    PayloadSpecificFeedback,
    Unknown(u8),
}

impl From<u8> for PacketType {
    fn from(v: u8) -> Self {
        match v {
            200 => PacketType::SenderReport,
            201 => PacketType::ReceiverReport,
            202 => PacketType::SourceDescription,
            203 => PacketType::Goodbye,
            204 => PacketType::ApplicationDefined,
            205 => PacketType::TransportSpecificFeedback,
            206 => PacketType::PayloadSpecificFeedback,
            other => PacketType::Unknown(other),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(v: PacketType) -> Self {
        match v {
            PacketType::SenderReport => 200,
            PacketType::ReceiverReport => 201,
            PacketType::SourceDescription => 202,
            PacketType::Goodbye => 203,
            PacketType::ApplicationDefined => 204,
            PacketType::TransportSpecificFeedback => 205,
            PacketType::PayloadSpecificFeedback => 206,
            PacketType::Unknown(other) => other,
        }
    }
}

/// The common 4-byte RTCP header.
///
/// `count` is the 5-bit report count for report packets and the feedback
/// message type (FMT) for feedback packets. `length` is the packet length
/// in 32-bit words minus one.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    pub padding: bool,
    pub count: u8,
    pub packet_type: u8,
    pub length: u16,
}

impl Header {
    /// Total packet length in bytes, header included.
    pub fn total_length(&self) -> usize {
        4 * (self.length as usize + 1)
    }

    pub fn marshal_to(&self, buf: &mut BytesMut) {
        let mut b0 = VERSION << 6;
        if self.padding {
            b0 |= 1 << 5;
        }
        b0 |= self.count & 0x1f;
        buf.put_u8(b0);
        buf.put_u8(self.packet_type);
        buf.put_u16(self.length);
    }

    pub fn unmarshal(data: &[u8]) -> Result<Header> {
        if data.len() < HEADER_LENGTH {
            return Err(Error::ErrRtcpPacketTooShort);
        }
        if data[0] >> 6 != VERSION {
            return Err(Error::ErrUnsupportedRtcpVersion);
        }

        Ok(Header {
            padding: (data[0] & 0x20) != 0,
            count: data[0] & 0x1f,
            packet_type: data[1],
            length: u16::from_be_bytes([data[2], data[3]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = Header {
            padding: false,
            count: 1,
            packet_type: PacketType::ReceiverReport.into(),
            length: 7,
        };

        let mut buf = BytesMut::new();
        header.marshal_to(&mut buf);

        let parsed = Header::unmarshal(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.total_length(), 32);
    }

    #[test]
    fn test_header_rejects_bad_version() {
        assert_eq!(
            Header::unmarshal(&[0x00, 201, 0, 0]),
            Err(Error::ErrUnsupportedRtcpVersion)
        );
    }
}
