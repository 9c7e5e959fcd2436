use super::{AssembledUnit, Assembler};
use crate::packet::Packet;
use bytes::Bytes;
use shared::error::{Error, Result};
use shared::time::rtp_time_to_us;
use std::collections::VecDeque;

/// Unwraps RFC 3640 (AAC-hbr, non-interleaved) payloads: a 16-bit
/// AU-headers-length followed by one 13-bit-size AU header per unit.
#[derive(Debug, Default)]
pub struct AacAssembler {
    saw_discontinuity: bool,
    units: VecDeque<AssembledUnit>,
}

impl AacAssembler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Assembler for AacAssembler {
    fn signal_discontinuity(&mut self) {
        self.saw_discontinuity = true;
    }

    fn process_packet(&mut self, packet: &Packet) -> Result<()> {
        let data = &packet.payload;
        if data.len() < 4 {
            return Err(Error::ErrRtpPacketTooShort);
        }

        let headers_bits = u16::from_be_bytes([data[0], data[1]]) as usize;
        let headers_len = headers_bits.div_ceil(8);
        if data.len() < 2 + headers_len {
            return Err(Error::ErrRtpPacketTooShort);
        }

        let mut au_offset = 2 + headers_len;
        let time_us = rtp_time_to_us(packet.header.timestamp);

        for i in 0..headers_len / 2 {
            let off = 2 + 2 * i;
            let au_size =
                (u16::from_be_bytes([data[off], data[off + 1]]) >> 3) as usize;
            if data.len() < au_offset + au_size {
                return Err(Error::ErrRtpPacketTooShort);
            }

            self.units.push_back(AssembledUnit {
                data: Bytes::copy_from_slice(&data[au_offset..au_offset + au_size]),
                time_us,
                follows_discontinuity: self.saw_discontinuity,
            });
            self.saw_discontinuity = false;
            au_offset += au_size;
        }

        Ok(())
    }

    fn poll_unit(&mut self) -> Option<AssembledUnit> {
        self.units.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;
    use crate::packetizer::{PacketizationMode, Packetizer};

    #[test]
    fn test_aac_round_trip() {
        let au = vec![0x11u8; 321];
        let mut packetizer = Packetizer::new();
        let packets = packetizer
            .packetize(PacketizationMode::Aac, &au, 96, 21_333)
            .unwrap();

        let mut assembler = AacAssembler::new();
        assembler.process_packet(&packets[0]).unwrap();

        let unit = assembler.poll_unit().unwrap();
        assert_eq!(&unit.data[..], &au[..]);
    }

    #[test]
    fn test_truncated_au_is_rejected() {
        let mut assembler = AacAssembler::new();
        let packet = Packet {
            header: Header::default(),
            payload: Bytes::from_static(&[0, 16, 0xff, 0xf8, 1, 2]),
        };
        assert!(assembler.process_packet(&packet).is_err());
    }
}
