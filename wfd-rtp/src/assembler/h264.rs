use super::{AssembledUnit, Assembler};
use crate::packet::Packet;
use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};
use shared::time::rtp_time_to_us;
use std::collections::VecDeque;

const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;

const ANNEX_B_START_CODE: [u8; 4] = [0, 0, 0, 1];

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum State {
    #[default]
    Idle,
    CollectingFua,
}

/// Reassembles RFC 6184 payloads (single NAL, STAP-A, FU-A) into Annex-B
/// access units.
///
/// NAL units sharing one RTP timestamp are collected until the packet with
/// the marker bit arrives, then concatenated with 4-byte start codes into a
/// single access unit.
#[derive(Debug, Default)]
pub struct H264Assembler {
    state: State,
    indicator: u8,
    nal_type: u8,
    accumulator: BytesMut,

    nal_units: Vec<Bytes>,
    access_unit_rtp_time: u32,

    units: VecDeque<AssembledUnit>,
}

impl H264Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.nal_units.clear();
        self.accumulator.clear();
        self.state = State::Idle;
    }

    fn add_single_nal_unit(&mut self, nal: Bytes, rtp_time: u32) {
        if self.nal_units.is_empty() {
            self.access_unit_rtp_time = rtp_time;
        }
        self.nal_units.push(nal);
    }

    fn add_aggregation_packet(&mut self, payload: &[u8], rtp_time: u32) -> Result<()> {
        if payload.len() < 3 {
            return Err(Error::ErrMalformedH264Payload);
        }

        let mut data = &payload[1..];
        while data.len() >= 2 {
            let nal_size = ((data[0] as usize) << 8) | data[1] as usize;
            if data.len() < nal_size + 2 {
                return Err(Error::StapASizeLargerThanBuffer(nal_size, data.len() - 2));
            }

            self.add_single_nal_unit(Bytes::copy_from_slice(&data[2..2 + nal_size]), rtp_time);
            data = &data[2 + nal_size..];
        }

        if !data.is_empty() {
            log::debug!("unexpected padding at end of STAP-A packet");
        }

        Ok(())
    }

    fn flush_access_unit(&mut self) {
        if self.nal_units.is_empty() {
            return;
        }

        let total: usize = self
            .nal_units
            .iter()
            .map(|nal| ANNEX_B_START_CODE.len() + nal.len())
            .sum();

        let mut access_unit = BytesMut::with_capacity(total);
        for nal in self.nal_units.drain(..) {
            access_unit.put_slice(&ANNEX_B_START_CODE);
            access_unit.put_slice(&nal);
        }

        self.units.push_back(AssembledUnit {
            data: access_unit.freeze(),
            time_us: rtp_time_to_us(self.access_unit_rtp_time),
            follows_discontinuity: false,
        });
    }

    fn process_inner(&mut self, packet: &Packet) -> Result<()> {
        let data = &packet.payload;
        let rtp_time = packet.header.timestamp;

        match self.state {
            State::Idle => {
                if data.is_empty() || (data[0] & 0x80) != 0 {
                    return Err(Error::ErrMalformedH264Payload);
                }

                let nal_type = data[0] & 0x1f;
                match nal_type {
                    1..=23 => {
                        self.add_single_nal_unit(data.clone(), rtp_time);
                    }
                    NAL_TYPE_FU_A => {
                        if data.len() < 2 {
                            return Err(Error::ErrMalformedFua);
                        }
                        if (data[1] & 0x80) == 0 {
                            // Fragment without a start bit while idle.
                            return Err(Error::ErrMalformedFua);
                        }

                        self.indicator = data[0];
                        self.nal_type = data[1] & 0x1f;
                        let nri = (data[0] >> 5) & 0x03;

                        self.accumulator.clear();
                        self.accumulator.put_u8(self.nal_type | (nri << 5));
                        self.accumulator.extend_from_slice(&data[2..]);

                        if (data[1] & 0x40) != 0 {
                            // End bit already set on the first fragment.
                            let nal = self.accumulator.split().freeze();
                            self.add_single_nal_unit(nal, rtp_time);
                        } else {
                            self.access_unit_rtp_time = rtp_time;
                            self.state = State::CollectingFua;
                        }
                    }
                    NAL_TYPE_STAP_A => {
                        self.add_aggregation_packet(data, rtp_time)?;
                    }
                    t => {
                        return Err(Error::NaluTypeIsNotHandled(t));
                    }
                }
            }
            State::CollectingFua => {
                if data.len() < 2
                    || data[0] != self.indicator
                    || (data[1] & 0x1f) != self.nal_type
                    || (data[1] & 0x80) != 0
                {
                    return Err(Error::ErrMalformedFua);
                }

                self.accumulator.extend_from_slice(&data[2..]);

                if (data[1] & 0x40) != 0 {
                    let nal = self.accumulator.split().freeze();
                    let rtp_time = self.access_unit_rtp_time;
                    self.add_single_nal_unit(nal, rtp_time);
                    self.state = State::Idle;
                }
            }
        }

        if packet.header.marker {
            self.flush_access_unit();
        }

        Ok(())
    }
}

impl Assembler for H264Assembler {
    fn signal_discontinuity(&mut self) {
        self.reset();
    }

    fn process_packet(&mut self, packet: &Packet) -> Result<()> {
        let result = self.process_inner(packet);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn poll_unit(&mut self) -> Option<AssembledUnit> {
        self.units.pop_front()
    }
}
