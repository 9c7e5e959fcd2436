use crate::header::{Header, HEADER_LENGTH};
use bytes::{Bytes, BytesMut};
use shared::error::{Error, Result};

/// A complete RTP packet: header plus owned payload bytes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl Packet {
    /// Parses a datagram into an RTP packet, validating the version and
    /// stripping any padding.
    pub fn unmarshal(data: &[u8]) -> Result<Packet> {
        let (header, payload_offset) = Header::unmarshal(data)?;

        let mut end = data.len();
        if header.padding {
            let padding_length = data[end - 1] as usize;
            if padding_length + HEADER_LENGTH > end {
                return Err(Error::ErrInvalidRtpPadding);
            }
            end -= padding_length;
        }

        if end < payload_offset {
            return Err(Error::ErrRtpPacketTooShort);
        }

        Ok(Packet {
            header,
            payload: Bytes::copy_from_slice(&data[payload_offset..end]),
        })
    }

    /// Serializes the packet into a fresh buffer.
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.marshal_size() + self.payload.len());
        self.header.marshal_to(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::VERSION;

    #[test]
    fn test_packet_round_trip() {
        let packet = Packet {
            header: Header {
                version: VERSION,
                marker: true,
                payload_type: 97,
                sequence_number: 42,
                timestamp: 90_000,
                ssrc: 0xdeadbeef,
                ..Default::default()
            },
            payload: Bytes::from_static(b"some nal unit"),
        };

        let wire = packet.marshal();
        let parsed = Packet::unmarshal(&wire).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_packet_strips_padding() {
        let packet = Packet {
            header: Header {
                version: VERSION,
                padding: true,
                payload_type: 33,
                ..Default::default()
            },
            payload: Bytes::from_static(b"abcd"),
        };

        let mut wire = BytesMut::from(&packet.marshal()[..]);
        // Three padding bytes, the last carrying the count.
        wire.extend_from_slice(&[0, 0, 3]);

        let parsed = Packet::unmarshal(&wire).unwrap();
        assert_eq!(&parsed.payload[..], b"abcd");
    }

    #[test]
    fn test_packet_rejects_bogus_padding() {
        let mut wire = BytesMut::zeroed(13);
        wire[0] = 0xa0; // version 2, padding bit
        wire[12] = 200; // padding length larger than packet
        assert_eq!(
            Packet::unmarshal(&wire),
            Err(Error::ErrInvalidRtpPadding)
        );
    }
}
