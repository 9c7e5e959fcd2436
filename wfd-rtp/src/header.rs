use bytes::{BufMut, BytesMut};
use shared::error::{Error, Result};

pub const HEADER_LENGTH: usize = 12;
pub const VERSION: u8 = 2;

/// A parsed RTP fixed header (RFC 3550 section 5.1).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
}

impl Header {
    /// Size of the marshaled header in bytes.
    pub fn marshal_size(&self) -> usize {
        HEADER_LENGTH + 4 * self.csrc.len()
    }

    /// Appends the header to `buf`.
    pub fn marshal_to(&self, buf: &mut BytesMut) {
        let mut b0 = (self.version & 0x03) << 6;
        if self.padding {
            b0 |= 1 << 5;
        }
        if self.extension {
            b0 |= 1 << 4;
        }
        b0 |= self.csrc.len() as u8 & 0x0f;
        buf.put_u8(b0);

        let mut b1 = self.payload_type & 0x7f;
        if self.marker {
            b1 |= 1 << 7;
        }
        buf.put_u8(b1);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }
    }

    /// Parses the fixed header, CSRC list and any extension header.
    ///
    /// Returns the header and the offset at which the payload begins.
    /// Padding is a property of the whole packet and is handled by
    /// [`crate::Packet::unmarshal`].
    pub fn unmarshal(data: &[u8]) -> Result<(Header, usize)> {
        if data.len() < HEADER_LENGTH {
            return Err(Error::ErrRtpPacketTooShort);
        }

        let version = data[0] >> 6;
        if version != VERSION {
            return Err(Error::ErrUnsupportedRtpVersion);
        }

        let padding = (data[0] & 0x20) != 0;
        let extension = (data[0] & 0x10) != 0;
        let csrc_count = (data[0] & 0x0f) as usize;

        let mut payload_offset = HEADER_LENGTH + 4 * csrc_count;
        if data.len() < payload_offset {
            return Err(Error::ErrRtpPacketTooShort);
        }

        let mut csrc = Vec::with_capacity(csrc_count);
        for i in 0..csrc_count {
            let off = HEADER_LENGTH + 4 * i;
            csrc.push(u32::from_be_bytes([
                data[off],
                data[off + 1],
                data[off + 2],
                data[off + 3],
            ]));
        }

        if extension {
            if data.len() < payload_offset + 4 {
                return Err(Error::ErrRtpPacketTooShort);
            }
            let ext_words =
                ((data[payload_offset + 2] as usize) << 8) | data[payload_offset + 3] as usize;
            payload_offset += 4 + 4 * ext_words;
            if data.len() < payload_offset {
                return Err(Error::ErrRtpPacketTooShort);
            }
        }

        Ok((
            Header {
                version,
                padding,
                extension,
                marker: (data[1] >> 7) != 0,
                payload_type: data[1] & 0x7f,
                sequence_number: u16::from_be_bytes([data[2], data[3]]),
                timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
                ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
                csrc,
            },
            payload_offset,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = Header {
            version: VERSION,
            marker: true,
            payload_type: 33,
            sequence_number: 0x1234,
            timestamp: 0xdecafbad,
            ssrc: 0xdeadbeef,
            ..Default::default()
        };

        let mut buf = BytesMut::new();
        header.marshal_to(&mut buf);
        assert_eq!(buf.len(), HEADER_LENGTH);

        let (parsed, offset) = Header::unmarshal(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(offset, HEADER_LENGTH);
    }

    #[test]
    fn test_header_rejects_bad_version() {
        let mut raw = [0u8; 12];
        raw[0] = 0x40; // version 1
        assert_eq!(
            Header::unmarshal(&raw),
            Err(Error::ErrUnsupportedRtpVersion)
        );
    }

    #[test]
    fn test_header_skips_extension() {
        let header = Header {
            version: VERSION,
            extension: true,
            payload_type: 97,
            sequence_number: 7,
            timestamp: 90_000,
            ssrc: 1,
            ..Default::default()
        };

        let mut buf = BytesMut::new();
        header.marshal_to(&mut buf);
        // profile id + length of one 32-bit word, then the word itself
        buf.extend_from_slice(&[0xbe, 0xde, 0x00, 0x01, 1, 2, 3, 4]);
        buf.extend_from_slice(b"payload");

        let (parsed, offset) = Header::unmarshal(&buf).unwrap();
        assert!(parsed.extension);
        assert_eq!(offset, HEADER_LENGTH + 8);
        assert_eq!(&buf[offset..], b"payload");
    }

    #[test]
    fn test_header_too_short() {
        assert_eq!(
            Header::unmarshal(&[0x80, 33]),
            Err(Error::ErrRtpPacketTooShort)
        );
    }
}
