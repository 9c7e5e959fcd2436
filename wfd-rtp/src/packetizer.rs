use crate::header::{Header, HEADER_LENGTH, VERSION};
use crate::packet::Packet;
use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};
use shared::time::us_to_rtp_time;
use shared::util::{MAX_UDP_PACKET_SIZE, SOURCE_ID};

/// Payload budget of a single RTP packet.
const MAX_PAYLOAD_SIZE: usize = MAX_UDP_PACKET_SIZE - HEADER_LENGTH;

/// How many 188-byte transport packets fit into one RTP packet.
pub const MAX_TS_PACKETS_PER_RTP_PACKET: usize = MAX_PAYLOAD_SIZE / 188;

const TS_PACKET_SIZE: usize = 188;

const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;

/// How an access unit is mapped onto RTP packets.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PacketizationMode {
    /// One RTP packet per buffer, raw payload.
    #[default]
    None,
    /// Payload is a sequence of 188-byte transport packets, bundled up to
    /// [MAX_TS_PACKETS_PER_RTP_PACKET] per RTP packet.
    TransportStream,
    /// RFC 6184: single NAL unit packets, STAP-A aggregation and FU-A
    /// fragmentation.
    H264,
    /// RFC 3640 (AAC-hbr), non-interleaved, one access unit per packet.
    Aac,
}

/// Turns access units into RTP packets.
///
/// A single 16-bit sequence counter is shared by all modes so that packets
/// emitted on one channel are strictly ordered regardless of payload kind.
#[derive(Debug, Default)]
pub struct Packetizer {
    sequence_number: u16,
}

impl Packetizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sequence number the next emitted packet will carry.
    pub fn next_sequence_number(&self) -> u16 {
        self.sequence_number
    }

    /// Packetizes one buffer.
    ///
    /// `time_us` is the presentation time for `None`, `H264` and `Aac`
    /// buffers; for `TransportStream` the caller passes the current time,
    /// which becomes the RTP timestamp of every emitted packet.
    pub fn packetize(
        &mut self,
        mode: PacketizationMode,
        payload: &[u8],
        payload_type: u8,
        time_us: i64,
    ) -> Result<Vec<Packet>> {
        match mode {
            PacketizationMode::None => self.packetize_raw(payload, payload_type, time_us),
            PacketizationMode::TransportStream => {
                self.packetize_ts(payload, payload_type, time_us)
            }
            PacketizationMode::H264 => self.packetize_h264(payload, payload_type, time_us),
            PacketizationMode::Aac => self.packetize_aac(payload, payload_type, time_us),
        }
    }

    fn next_packet(&mut self, payload_type: u8, marker: bool, rtp_time: u32, payload: Bytes) -> Packet {
        let header = Header {
            version: VERSION,
            marker,
            payload_type,
            sequence_number: self.sequence_number,
            timestamp: rtp_time,
            ssrc: SOURCE_ID,
            ..Default::default()
        };
        self.sequence_number = self.sequence_number.wrapping_add(1);
        Packet { header, payload }
    }

    fn packetize_raw(&mut self, payload: &[u8], payload_type: u8, time_us: i64) -> Result<Vec<Packet>> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::ErrPayloadTooLarge);
        }

        Ok(vec![self.next_packet(
            payload_type,
            false,
            us_to_rtp_time(time_us),
            Bytes::copy_from_slice(payload),
        )])
    }

    fn packetize_ts(&mut self, ts_packets: &[u8], payload_type: u8, now_us: i64) -> Result<Vec<Packet>> {
        if ts_packets.len() % TS_PACKET_SIZE != 0 {
            return Err(Error::ErrNotTsAligned);
        }

        let rtp_time = us_to_rtp_time(now_us);
        let mut packets = Vec::new();
        let mut offset = 0;
        while offset < ts_packets.len() {
            let remaining = (ts_packets.len() - offset) / TS_PACKET_SIZE;
            let count = remaining.min(MAX_TS_PACKETS_PER_RTP_PACKET);
            let end = offset + count * TS_PACKET_SIZE;

            let marker = end == ts_packets.len();
            packets.push(self.next_packet(
                payload_type,
                marker,
                rtp_time,
                Bytes::copy_from_slice(&ts_packets[offset..end]),
            ));

            offset = end;
        }

        Ok(packets)
    }

    fn packetize_aac(&mut self, access_unit: &[u8], payload_type: u8, time_us: i64) -> Result<Vec<Packet>> {
        // AU-headers-length (16 bits of AU headers), then one AU header with
        // a 13-bit size and a 3-bit index of zero.
        if access_unit.len() >= 1 << 13 || access_unit.len() + 4 > MAX_PAYLOAD_SIZE {
            return Err(Error::ErrPayloadTooLarge);
        }

        let mut payload = BytesMut::with_capacity(4 + access_unit.len());
        payload.put_u16(16);
        payload.put_u16((access_unit.len() as u16) << 3);
        payload.extend_from_slice(access_unit);

        Ok(vec![self.next_packet(
            payload_type,
            true,
            us_to_rtp_time(time_us),
            payload.freeze(),
        )])
    }

    fn packetize_h264(&mut self, access_unit: &[u8], payload_type: u8, time_us: i64) -> Result<Vec<Packet>> {
        let rtp_time = us_to_rtp_time(time_us);

        let mut payloads: Vec<Bytes> = Vec::new();
        // STAP-A aggregation in progress; empty when no packet is open.
        let mut stap = BytesMut::new();

        for nal in NalIter::new(access_unit) {
            let stap_needed = nal.len() + 2 + usize::from(stap.is_empty());

            if stap.len() + stap_needed <= MAX_PAYLOAD_SIZE {
                if stap.is_empty() {
                    stap.put_u8(NAL_TYPE_STAP_A);
                }
                stap.put_u16(nal.len() as u16);
                stap.extend_from_slice(nal);
                continue;
            }

            if !stap.is_empty() {
                payloads.push(stap.split().freeze());
            }

            if nal.len() + 3 <= MAX_PAYLOAD_SIZE {
                // Fits into a fresh aggregation packet.
                stap.put_u8(NAL_TYPE_STAP_A);
                stap.put_u16(nal.len() as u16);
                stap.extend_from_slice(nal);
                continue;
            }

            if nal.len() <= MAX_PAYLOAD_SIZE {
                // Too big to aggregate but small enough to stand alone.
                payloads.push(Bytes::copy_from_slice(nal));
                continue;
            }

            // This single NAL unit does not fit into one RTP packet, emit a
            // sequence of FU-A fragments.
            let nal_type = nal[0] & 0x1f;
            let nri = (nal[0] >> 5) & 0x03;
            let indicator = (nri << 5) | NAL_TYPE_FU_A;

            let mut src_offset = 1;
            while src_offset < nal.len() {
                let copy = (MAX_PAYLOAD_SIZE - 2).min(nal.len() - src_offset);

                let mut fragment = BytesMut::with_capacity(2 + copy);
                fragment.put_u8(indicator);

                let mut fu_header = nal_type;
                if src_offset == 1 {
                    fu_header |= 0x80; // start
                }
                if src_offset + copy == nal.len() {
                    fu_header |= 0x40; // end
                }
                fragment.put_u8(fu_header);

                fragment.extend_from_slice(&nal[src_offset..src_offset + copy]);
                src_offset += copy;

                payloads.push(fragment.freeze());
            }
        }

        if !stap.is_empty() {
            payloads.push(stap.freeze());
        }

        let last = payloads.len().saturating_sub(1);
        Ok(payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| self.next_packet(payload_type, i == last, rtp_time, payload))
            .collect())
    }
}

/// Iterates over the NAL units of an Annex-B formatted access unit,
/// yielding each unit without its start code.
struct NalIter<'a> {
    data: &'a [u8],
}

impl<'a> NalIter<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for NalIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        // Skip to the first start code; 4-byte codes show up here as a
        // leading zero before the 3-byte form.
        let start = memchr::memmem::find(self.data, &[0, 0, 1])?;
        let body = &self.data[start + 3..];

        match memchr::memmem::find(body, &[0, 0, 1]) {
            Some(mut next) => {
                let remainder = &body[next..];
                // A 4-byte start code terminates the unit one byte earlier.
                if next > 0 && body[next - 1] == 0 {
                    next -= 1;
                }
                self.data = remainder;
                let nal = &body[..next];
                if nal.is_empty() {
                    self.next()
                } else {
                    Some(nal)
                }
            }
            None => {
                self.data = &[];
                if body.is_empty() {
                    None
                } else {
                    Some(body)
                }
            }
        }
    }
}
