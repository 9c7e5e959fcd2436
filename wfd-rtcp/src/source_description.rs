use crate::header::{Header, PacketType, HEADER_LENGTH};
use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

const SDES_TYPE_END: u8 = 0;
const SDES_TYPE_CNAME: u8 = 1;
const SDES_TYPE_TOOL: u8 = 6;

/// A minimal RTCP source description (packet type 202) with a single chunk
/// carrying CNAME and TOOL items, appended after every receiver report.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SourceDescription {
    pub ssrc: u32,
    pub cname: String,
    pub tool: String,
}

impl SourceDescription {
    pub fn new(ssrc: u32, cname: &str, tool: &str) -> Self {
        Self {
            ssrc,
            cname: cname.to_owned(),
            tool: tool.to_owned(),
        }
    }

    pub fn marshal(&self) -> Bytes {
        assert!(self.cname.len() < 255 && self.tool.len() < 255);

        // chunk: ssrc + items + END, padded to a word boundary
        let items_len = 2 + self.cname.len() + 2 + self.tool.len() + 1;
        let padded = (4 + items_len + 3) & !3;

        let mut buf = BytesMut::with_capacity(HEADER_LENGTH + padded);
        Header {
            padding: false,
            count: 1,
            packet_type: PacketType::SourceDescription.into(),
            length: (padded / 4) as u16,
        }
        .marshal_to(&mut buf);

        buf.put_u32(self.ssrc);

        buf.put_u8(SDES_TYPE_CNAME);
        buf.put_u8(self.cname.len() as u8);
        buf.put_slice(self.cname.as_bytes());

        buf.put_u8(SDES_TYPE_TOOL);
        buf.put_u8(self.tool.len() as u8);
        buf.put_slice(self.tool.as_bytes());

        buf.put_u8(SDES_TYPE_END);
        while buf.len() < HEADER_LENGTH + padded {
            buf.put_u8(0);
        }

        buf.freeze()
    }

    pub fn unmarshal(data: &[u8]) -> Result<SourceDescription> {
        let header = Header::unmarshal(data)?;
        if PacketType::from(header.packet_type) != PacketType::SourceDescription {
            return Err(Error::ErrWrongRtcpType);
        }
        if data.len() < HEADER_LENGTH + 4 {
            return Err(Error::ErrRtcpPacketTooShort);
        }

        let mut sdes = SourceDescription {
            ssrc: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ..Default::default()
        };

        let mut rest = &data[HEADER_LENGTH + 4..];
        while rest.len() >= 2 && rest[0] != SDES_TYPE_END {
            let item_type = rest[0];
            let len = rest[1] as usize;
            if rest.len() < 2 + len {
                return Err(Error::ErrRtcpPacketTooShort);
            }
            let text = String::from_utf8(rest[2..2 + len].to_vec())?;
            match item_type {
                SDES_TYPE_CNAME => sdes.cname = text,
                SDES_TYPE_TOOL => sdes.tool = text,
                _ => {}
            }
            rest = &rest[2 + len..];
        }

        Ok(sdes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdes_round_trip() {
        let sdes = SourceDescription::new(0xdeadbeef, "wfd@somewhere", "wfd/0.1");
        let wire = sdes.marshal();
        assert_eq!(wire.len() % 4, 0);

        let parsed = SourceDescription::unmarshal(&wire).unwrap();
        assert_eq!(parsed, sdes);
    }

    #[test]
    fn test_sdes_wrong_type() {
        let sdes = SourceDescription::new(1, "a", "b");
        let mut wire = sdes.marshal().to_vec();
        wire[1] = 201;
        assert_eq!(
            SourceDescription::unmarshal(&wire),
            Err(Error::ErrWrongRtcpType)
        );
    }
}
