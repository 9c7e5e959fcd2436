use super::{AssembledUnit, Assembler};
use crate::packet::Packet;
use shared::error::Result;
use shared::time::rtp_time_to_us;
use std::collections::VecDeque;

/// Passthrough assembler for transport-stream payloads.
///
/// Each RTP payload is already a sequence of 188-byte TS packets; the only
/// state carried here is a one-shot discontinuity flag raised on
/// reorder/loss.
#[derive(Debug, Default)]
pub struct TsAssembler {
    saw_discontinuity: bool,
    units: VecDeque<AssembledUnit>,
}

impl TsAssembler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Assembler for TsAssembler {
    fn signal_discontinuity(&mut self) {
        self.saw_discontinuity = true;
    }

    fn process_packet(&mut self, packet: &Packet) -> Result<()> {
        self.units.push_back(AssembledUnit {
            data: packet.payload.clone(),
            time_us: rtp_time_to_us(packet.header.timestamp),
            follows_discontinuity: self.saw_discontinuity,
        });
        self.saw_discontinuity = false;
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
    use bytes::Bytes;

    fn ts_packet(timestamp: u32) -> Packet {
        Packet {
            header: Header {
                timestamp,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x47; 188]),
        }
    }

    #[test]
    fn test_passthrough_with_time_conversion() {
        let mut assembler = TsAssembler::new();
        assembler.process_packet(&ts_packet(90_000)).unwrap();

        let unit = assembler.poll_unit().unwrap();
        assert_eq!(unit.data.len(), 188);
        assert_eq!(unit.time_us, 1_000_000);
        assert!(!unit.follows_discontinuity);
    }

    #[test]
    fn test_discontinuity_flag_is_one_shot() {
        let mut assembler = TsAssembler::new();
        assembler.signal_discontinuity();

        assembler.process_packet(&ts_packet(0)).unwrap();
        assembler.process_packet(&ts_packet(3000)).unwrap();

        assert!(assembler.poll_unit().unwrap().follows_discontinuity);
        assert!(!assembler.poll_unit().unwrap().follows_discontinuity);
    }
}
