use crate::header::{Header, PacketType, HEADER_LENGTH};
use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

/// Application-defined packet name used for sink lateness feedback.
pub const NAME_LATE: [u8; 4] = *b"late";

/// An RTCP APP packet (packet type 204).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct App {
    pub subtype: u8,
    pub ssrc: u32,
    pub name: [u8; 4],
    pub data: Bytes,
}

impl App {
    pub fn marshal(&self) -> Bytes {
        assert_eq!(self.data.len() % 4, 0);

        let words = 2 + self.data.len() / 4;
        let mut buf = BytesMut::with_capacity(4 * (words + 1));
        Header {
            padding: false,
            count: self.subtype,
            packet_type: PacketType::ApplicationDefined.into(),
            length: words as u16,
        }
        .marshal_to(&mut buf);

        buf.put_u32(self.ssrc);
        buf.put_slice(&self.name);
        buf.put_slice(&self.data);

        buf.freeze()
    }

    pub fn unmarshal(data: &[u8]) -> Result<App> {
        let header = Header::unmarshal(data)?;
        if PacketType::from(header.packet_type) != PacketType::ApplicationDefined {
            return Err(Error::ErrWrongRtcpType);
        }
        if data.len() < HEADER_LENGTH + 8 {
            return Err(Error::ErrRtcpPacketTooShort);
        }

        Ok(App {
            subtype: header.count,
            ssrc: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            name: [data[8], data[9], data[10], data[11]],
            data: Bytes::copy_from_slice(&data[12..]),
        })
    }
}

/// The sink's latency measurement, carried in an APP packet named "late"
/// as two 64-bit microsecond fields.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct LatenessReport {
    pub avg_latency_us: i64,
    pub max_latency_us: i64,
}

impl LatenessReport {
    pub fn to_app(self, ssrc: u32) -> App {
        let mut data = BytesMut::with_capacity(16);
        data.put_i64(self.avg_latency_us);
        data.put_i64(self.max_latency_us);

        App {
            subtype: 0,
            ssrc,
            name: NAME_LATE,
            data: data.freeze(),
        }
    }

    /// Decodes the report out of an APP packet; `None` if the packet has
    /// a different name or a short body.
    pub fn from_app(app: &App) -> Option<LatenessReport> {
        if app.name != NAME_LATE || app.data.len() < 16 {
            return None;
        }

        Some(LatenessReport {
            avg_latency_us: i64::from_be_bytes(app.data[0..8].try_into().unwrap()),
            max_latency_us: i64::from_be_bytes(app.data[8..16].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lateness_round_trip() {
        let report = LatenessReport {
            avg_latency_us: 212_000,
            max_latency_us: 987_654,
        };

        let app = report.to_app(0xdeadbeef);
        let wire = app.marshal();
        assert_eq!(wire.len(), 28);

        let parsed = App::unmarshal(&wire).unwrap();
        assert_eq!(parsed.name, NAME_LATE);
        assert_eq!(LatenessReport::from_app(&parsed), Some(report));
    }

    #[test]
    fn test_unrelated_app_name_is_ignored() {
        let app = App {
            subtype: 0,
            ssrc: 1,
            name: *b"xxxx",
            data: Bytes::from_static(&[0u8; 16]),
        };
        assert_eq!(LatenessReport::from_app(&app), None);
    }
}
