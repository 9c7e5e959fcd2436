use crate::header::{Header, PacketType, HEADER_LENGTH};
use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

const RECEPTION_REPORT_LENGTH: usize = 24;
const MAX_REPORTS: usize = 31;

/// One report block of a receiver report.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ReceptionReport {
    /// The SSRC this block reports on.
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// Cumulative packets lost, clamped into a signed 24-bit range.
    pub total_lost: i32,
    /// Extended highest sequence number received (cycles << 16 | max seq).
    pub last_sequence_number: u32,
    pub jitter: u32,
    pub last_sender_report: u32,
    pub delay: u32,
}

impl ReceptionReport {
    fn marshal_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        buf.put_u8(self.fraction_lost);

        let lost = self.total_lost.clamp(-0x80_0000, 0x7f_ffff);
        buf.put_u8(((lost >> 16) & 0xff) as u8);
        buf.put_u8(((lost >> 8) & 0xff) as u8);
        buf.put_u8((lost & 0xff) as u8);

        buf.put_u32(self.last_sequence_number);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sender_report);
        buf.put_u32(self.delay);
    }

    fn unmarshal(data: &[u8]) -> ReceptionReport {
        let raw_lost =
            ((data[5] as u32) << 16) | ((data[6] as u32) << 8) | data[7] as u32;
        // sign-extend the 24-bit value
        let total_lost = ((raw_lost << 8) as i32) >> 8;

        ReceptionReport {
            ssrc: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            fraction_lost: data[4],
            total_lost,
            last_sequence_number: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            jitter: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            last_sender_report: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
            delay: u32::from_be_bytes([data[20], data[21], data[22], data[23]]),
        }
    }
}

/// An RTCP receiver report (packet type 201).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    /// The SSRC of the reporting receiver.
    pub ssrc: u32,
    pub reports: Vec<ReceptionReport>,
}

impl ReceiverReport {
    pub fn marshal(&self) -> Bytes {
        assert!(self.reports.len() <= MAX_REPORTS);

        let words = 1 + 6 * self.reports.len();
        let mut buf = BytesMut::with_capacity(4 * (words + 1));

        Header {
            padding: false,
            count: self.reports.len() as u8,
            packet_type: PacketType::ReceiverReport.into(),
            length: words as u16,
        }
        .marshal_to(&mut buf);

        buf.put_u32(self.ssrc);
        for report in &self.reports {
            report.marshal_to(&mut buf);
        }

        buf.freeze()
    }

    pub fn unmarshal(data: &[u8]) -> Result<ReceiverReport> {
        let header = Header::unmarshal(data)?;
        if PacketType::from(header.packet_type) != PacketType::ReceiverReport {
            return Err(Error::ErrWrongRtcpType);
        }

        let count = header.count as usize;
        let needed = HEADER_LENGTH + 4 + count * RECEPTION_REPORT_LENGTH;
        if data.len() < needed {
            return Err(Error::ErrRtcpPacketTooShort);
        }

        let ssrc = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let mut reports = Vec::with_capacity(count);
        for i in 0..count {
            let off = HEADER_LENGTH + 4 + i * RECEPTION_REPORT_LENGTH;
            reports.push(ReceptionReport::unmarshal(
                &data[off..off + RECEPTION_REPORT_LENGTH],
            ));
        }

        Ok(ReceiverReport { ssrc, reports })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receiver_report_round_trip() {
        let rr = ReceiverReport {
            ssrc: 0xdeadbeef,
            reports: vec![ReceptionReport {
                ssrc: 0x12345678,
                fraction_lost: 12,
                total_lost: -5,
                last_sequence_number: (3 << 16) | 4242,
                jitter: 0,
                last_sender_report: 0,
                delay: 0,
            }],
        };

        let wire = rr.marshal();
        let parsed = ReceiverReport::unmarshal(&wire).unwrap();
        assert_eq!(parsed, rr);
    }

    #[test]
    fn test_total_lost_clamped_to_24_bits() {
        let rr = ReceiverReport {
            ssrc: 1,
            reports: vec![ReceptionReport {
                ssrc: 2,
                total_lost: 0x7f_ffff + 100,
                ..Default::default()
            }],
        };

        let parsed = ReceiverReport::unmarshal(&rr.marshal()).unwrap();
        assert_eq!(parsed.reports[0].total_lost, 0x7f_ffff);
    }

    #[test]
    fn test_empty_report() {
        let rr = ReceiverReport {
            ssrc: 7,
            reports: vec![],
        };
        let wire = rr.marshal();
        assert_eq!(wire.len(), 8);
        assert_eq!(ReceiverReport::unmarshal(&wire).unwrap(), rr);
    }
}
