use crate::crc::crc32;
use crate::format::{is_idr, prepend_adts_header, MediaMime, TrackFormat};
use crate::track::Track;
use crate::{PID_AUDIO_START, PID_PCR, PID_PMT, PID_VIDEO_START, TS_PACKET_SIZE};
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};
use shared::time::pcr_fields;

/// Construction flags.
pub const EMIT_HDCP20_DESCRIPTOR: u32 = 1;
pub const EMIT_HDCP21_DESCRIPTOR: u32 = 2;

/// Per-call packetize flags.
pub const EMIT_PAT_AND_PMT: u32 = 1;
pub const EMIT_PCR: u32 = 2;
pub const IS_ENCRYPTED: u32 = 4;
pub const PREPEND_SPS_PPS_TO_IDR_FRAMES: u32 = 8;

const PES_HEADER_SIZE: usize = 14;

/// Produces 188-byte MPEG-2 transport stream packets from access units.
///
/// One instance carries the mux state for a playback session: the track
/// table, per-PID continuity counters and the PAT/PMT counters.
pub struct TsPacketizer {
    flags: u32,
    tracks: Vec<Track>,
    pat_continuity_counter: u8,
    pmt_continuity_counter: u8,
    program_info_descriptors: Vec<Bytes>,
}

impl TsPacketizer {
    pub fn new(flags: u32) -> Self {
        let mut program_info_descriptors = Vec::new();

        if flags & (EMIT_HDCP20_DESCRIPTOR | EMIT_HDCP21_DESCRIPTOR) != 0 {
            assert_ne!(
                flags & (EMIT_HDCP20_DESCRIPTOR | EMIT_HDCP21_DESCRIPTOR),
                EMIT_HDCP20_DESCRIPTOR | EMIT_HDCP21_DESCRIPTOR
            );

            // Both the HDCP 2.0 and 2.1 specs say to set the version inside
            // the HDCP descriptor to 0x20.
            let hdcp_version = 0x20u8;

            let mut descriptor = BytesMut::with_capacity(7);
            descriptor.put_u8(0x05); // descriptor_tag
            descriptor.put_u8(5); // descriptor_length
            descriptor.put_slice(b"HDCP");
            descriptor.put_u8(hdcp_version);
            program_info_descriptors.push(descriptor.freeze());
        }

        Self {
            flags,
            tracks: Vec::new(),
            pat_continuity_counter: 0,
            pmt_continuity_counter: 0,
            program_info_descriptors,
        }
    }

    /// Registers a track and returns its index.
    ///
    /// PIDs start at 0x1011 for video and 0x1100 for audio, incrementing
    /// per track of the same class; stream ids are allocated from the
    /// per-codec ranges.
    pub fn add_track(&mut self, format: TrackFormat) -> Result<usize> {
        let (stream_type, stream_id_start, stream_id_stop) = match format.mime {
            MediaMime::VideoAvc => (0x1bu8, 0xe0u8, 0xefu8),
            MediaMime::AudioAac => (0x0f, 0xc0, 0xdf),
            MediaMime::AudioLpcm => (0x83, 0xbd, 0xbd),
        };

        let pid_start = if format.mime.is_video() {
            PID_VIDEO_START
        } else {
            PID_AUDIO_START
        };

        let mut num_same_type = 0u8;
        let mut pid = pid_start;
        for track in &self.tracks {
            if track.stream_type() == stream_type {
                num_same_type += 1;
            }
            if track.format.mime.is_video() == format.mime.is_video() {
                pid += 1;
            }
        }

        let stream_id = stream_id_start + num_same_type;
        if stream_id > stream_id_stop {
            return Err(Error::ErrStreamIdExhausted);
        }

        self.tracks.push(Track::new(format, pid, stream_type, stream_id));
        Ok(self.tracks.len() - 1)
    }

    /// Concatenates the cached SPS/PPS with an IDR access unit, for flows
    /// where the caller must encrypt the prefixed buffer itself.
    pub fn prepend_csd(&self, track_index: usize, access_unit: &[u8]) -> Result<Bytes> {
        let track = self
            .tracks
            .get(track_index)
            .ok_or(Error::ErrNoSuchTrack)?;
        assert!(track.is_h264() && is_idr(access_unit));

        Ok(track.prepend_csd(access_unit))
    }

    /// Packetizes one access unit into a whole number of TS packets.
    ///
    /// Emission order: PAT and PMT (when `EMIT_PAT_AND_PMT`), a PCR-only
    /// packet (when `EMIT_PCR`, stamped from `now_us`), then the PES
    /// packets carrying the access unit with its PTS derived from
    /// `time_us`.
    #[allow(clippy::too_many_arguments)]
    pub fn packetize(
        &mut self,
        track_index: usize,
        access_unit: &[u8],
        time_us: i64,
        flags: u32,
        pes_private_data: &[u8],
        num_stuffing_bytes: usize,
        now_us: i64,
    ) -> Result<Bytes> {
        if track_index >= self.tracks.len() {
            return Err(Error::ErrNoSuchTrack);
        }

        let prefixed;
        let mut access_unit = access_unit;
        {
            let track = &self.tracks[track_index];
            if track.is_h264()
                && (flags & PREPEND_SPS_PPS_TO_IDR_FRAMES != 0)
                && is_idr(access_unit)
            {
                prefixed = track.prepend_csd(access_unit);
                access_unit = &prefixed;
            } else if track.is_aac() && track.lacks_adts_header() {
                assert_eq!(flags & IS_ENCRYPTED, 0);
                let csd = track
                    .format
                    .csd
                    .first()
                    .ok_or(Error::ErrMissingCodecSpecificData)?;
                prefixed = prepend_adts_header(csd, access_unit)?;
                access_unit = &prefixed;
            }
        }

        // Per HDCP spec, every transport packet except the last one
        // contributing to a PES payload must carry a multiple of 16 bytes
        // of payload.
        let align_payload =
            self.flags & (EMIT_HDCP20_DESCRIPTOR | EMIT_HDCP21_DESCRIPTOR) != 0;

        let pes_header_size = Self::pes_header_size(pes_private_data, num_stuffing_bytes);
        if pes_header_size > TS_PACKET_SIZE - 4 {
            return Err(Error::ErrPesHeaderTooLarge);
        }

        let mut out = BytesMut::new();

        if flags & EMIT_PAT_AND_PMT != 0 {
            self.emit_pat(&mut out);
            self.emit_pmt(&mut out)?;
        }

        if flags & EMIT_PCR != 0 {
            self.emit_pcr(&mut out, now_us);
        }

        self.emit_pes(
            &mut out,
            track_index,
            access_unit,
            time_us,
            pes_private_data,
            num_stuffing_bytes,
            align_payload,
        );

        debug_assert_eq!(out.len() % TS_PACKET_SIZE, 0);
        Ok(out.freeze())
    }

    fn pes_header_size(pes_private_data: &[u8], num_stuffing_bytes: usize) -> usize {
        let mut size = PES_HEADER_SIZE + num_stuffing_bytes;
        if !pes_private_data.is_empty() {
            size += pes_private_data.len() + 1;
        }
        size
    }

    fn emit_pat(&mut self, out: &mut BytesMut) {
        self.pat_continuity_counter = (self.pat_continuity_counter + 1) % 16;

        let start = out.len();
        out.put_u8(0x47);
        out.put_u8(0x40); // payload_unit_start_indicator, PID 0
        out.put_u8(0x00);
        out.put_u8(0x10 | self.pat_continuity_counter);
        out.put_u8(0x00); // pointer_field

        let section_start = out.len();
        out.put_u8(0x00); // table_id
        out.put_u8(0xb0); // section_syntax_indicator, section_length high
        out.put_u8(0x0d); // section_length low
        out.put_u16(0x0000); // transport_stream_id
        out.put_u8(0xc3); // reserved, version 1, current_next_indicator
        out.put_u8(0x00); // section_number
        out.put_u8(0x00); // last_section_number
        out.put_u16(0x0001); // program_number
        out.put_u8(0xe0 | (PID_PMT >> 8) as u8);
        out.put_u8((PID_PMT & 0xff) as u8);

        let crc = crc32(&out[section_start..]);
        out.put_u32(crc);

        out.resize(start + TS_PACKET_SIZE, 0xff);
    }

    fn emit_pmt(&mut self, out: &mut BytesMut) -> Result<()> {
        self.pmt_continuity_counter = (self.pmt_continuity_counter + 1) % 16;

        let start = out.len();
        out.put_u8(0x47);
        out.put_u8(0x40 | (PID_PMT >> 8) as u8);
        out.put_u8((PID_PMT & 0xff) as u8);
        out.put_u8(0x10 | self.pmt_continuity_counter);
        out.put_u8(0x00); // pointer_field

        let section_start = out.len();
        out.put_u8(0x02); // table_id
        out.put_u16(0x0000); // section_length, filled in below
        out.put_u16(0x0001); // program_number
        out.put_u8(0xc3); // reserved, version 1, current_next_indicator
        out.put_u8(0x00); // section_number
        out.put_u8(0x00); // last_section_number
        out.put_u8(0xe0 | (PID_PCR >> 8) as u8);
        out.put_u8((PID_PCR & 0xff) as u8);

        let program_info_length: usize =
            self.program_info_descriptors.iter().map(Bytes::len).sum();
        assert!(program_info_length < 0x400);
        out.put_u8(0xf0 | (program_info_length >> 8) as u8);
        out.put_u8((program_info_length & 0xff) as u8);
        for descriptor in &self.program_info_descriptors {
            out.extend_from_slice(descriptor);
        }

        for track in &mut self.tracks {
            track.finalize()?;

            out.put_u8(track.stream_type());
            out.put_u8(0xe0 | (track.pid() >> 8) as u8);
            out.put_u8((track.pid() & 0xff) as u8);

            let es_info_length: usize = track.descriptors().iter().map(Bytes::len).sum();
            assert!(es_info_length <= 0xfff);
            out.put_u8(0xf0 | (es_info_length >> 8) as u8);
            out.put_u8((es_info_length & 0xff) as u8);

            for descriptor in track.descriptors() {
                out.extend_from_slice(descriptor);
            }
        }

        let section_length = out.len() - (section_start + 3) + 4;
        out[section_start + 1] = 0xb0 | (section_length >> 8) as u8;
        out[section_start + 2] = (section_length & 0xff) as u8;

        let crc = crc32(&out[section_start..]);
        out.put_u32(crc);

        out.resize(start + TS_PACKET_SIZE, 0xff);
        Ok(())
    }

    fn emit_pcr(&self, out: &mut BytesMut, now_us: i64) {
        let (pcr_base, pcr_ext) = pcr_fields(now_us);

        let start = out.len();
        out.put_u8(0x47);
        out.put_u8(0x40 | (PID_PCR >> 8) as u8);
        out.put_u8((PID_PCR & 0xff) as u8);
        // adaptation field only, no payload; continuity counter does not
        // increment on payloadless packets.
        out.put_u8(0x20);
        out.put_u8(0xb7); // adaptation_field_length
        out.put_u8(0x10); // PCR_flag

        let mut pcr = [0u8; 6];
        pcr[0] = ((pcr_base >> 25) & 0xff) as u8;
        pcr[1] = ((pcr_base >> 17) & 0xff) as u8;
        pcr[2] = ((pcr_base >> 9) & 0xff) as u8;
        pcr[3] = ((pcr_base >> 1) & 0xff) as u8;
        pcr[4] = (((pcr_base & 1) << 7) as u8) | 0x7e | (((pcr_ext >> 8) & 1) as u8);
        pcr[5] = (pcr_ext & 0xff) as u8;
        out.put_slice(&pcr);

        out.resize(start + TS_PACKET_SIZE, 0xff);
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_pes(
        &mut self,
        out: &mut BytesMut,
        track_index: usize,
        access_unit: &[u8],
        time_us: i64,
        pes_private_data: &[u8],
        num_stuffing_bytes: usize,
        align_payload: bool,
    ) {
        let track = &mut self.tracks[track_index];

        let mut pes_packet_length = access_unit.len() + 8 + num_stuffing_bytes;
        if !pes_private_data.is_empty() {
            pes_packet_length += pes_private_data.len() + 1;
        }
        if pes_packet_length >= 65536 {
            // Only legal for video, where a zero length is allowed.
            assert!(track.is_h264());
            pes_packet_length = 0;
        }

        let pts = ((time_us * 9) / 100) as u64;

        // First TS packet of the PES unit: TS header, optional padding via
        // adaptation field, 14-byte PES header, private data, stuffing.
        let mut size_available =
            TS_PACKET_SIZE - 4 - Self::pes_header_size(pes_private_data, num_stuffing_bytes);

        let mut copy = access_unit.len().min(size_available);
        if align_payload && copy > 16 {
            copy -= copy % 16;
        }
        let num_padding_bytes = size_available - copy;

        let start = out.len();
        out.put_u8(0x47);
        out.put_u8(0x40 | (track.pid() >> 8) as u8);
        out.put_u8((track.pid() & 0xff) as u8);
        out.put_u8(
            if num_padding_bytes > 0 { 0x30 } else { 0x10 }
                | track.increment_continuity_counter(),
        );

        if num_padding_bytes > 0 {
            out.put_u8((num_padding_bytes - 1) as u8);
            if num_padding_bytes >= 2 {
                out.put_u8(0x00);
                out.resize(out.len() + num_padding_bytes - 2, 0xff);
            }
        }

        out.put_slice(&[0x00, 0x00, 0x01]);
        out.put_u8(track.stream_id());
        out.put_u16(pes_packet_length as u16);
        out.put_u8(0x84); // data_alignment_indicator
        out.put_u8(if pes_private_data.is_empty() { 0x80 } else { 0x81 });

        let mut header_length = 0x05 + num_stuffing_bytes;
        if !pes_private_data.is_empty() {
            header_length += 1 + pes_private_data.len();
        }
        out.put_u8(header_length as u8);

        // PTS in the 33-bit "0010" form.
        out.put_u8(0x20 | ((((pts >> 30) & 7) as u8) << 1) | 1);
        out.put_u8(((pts >> 22) & 0xff) as u8);
        out.put_u8(((((pts >> 15) & 0x7f) as u8) << 1) | 1);
        out.put_u8(((pts >> 7) & 0xff) as u8);
        out.put_u8((((pts & 0x7f) as u8) << 1) | 1);

        if !pes_private_data.is_empty() {
            out.put_u8(0x8e); // PES_private_data_flag, reserved
            out.put_slice(pes_private_data);
        }

        out.resize(out.len() + num_stuffing_bytes, 0xff);

        out.put_slice(&access_unit[..copy]);
        debug_assert_eq!(out.len(), start + TS_PACKET_SIZE);

        // Subsequent fragments: TS header plus payload, padded through the
        // adaptation field when short.
        let mut offset = copy;
        while offset < access_unit.len() {
            size_available = TS_PACKET_SIZE - 4;

            let mut copy = (access_unit.len() - offset).min(size_available);
            if align_payload && copy > 16 {
                copy -= copy % 16;
            }
            let num_padding_bytes = size_available - copy;

            let start = out.len();
            out.put_u8(0x47);
            out.put_u8((track.pid() >> 8) as u8);
            out.put_u8((track.pid() & 0xff) as u8);
            out.put_u8(
                if num_padding_bytes > 0 { 0x30 } else { 0x10 }
                    | track.increment_continuity_counter(),
            );

            if num_padding_bytes > 0 {
                out.put_u8((num_padding_bytes - 1) as u8);
                if num_padding_bytes >= 2 {
                    out.put_u8(0x00);
                    out.resize(out.len() + num_padding_bytes - 2, 0xff);
                }
            }

            out.put_slice(&access_unit[offset..offset + copy]);
            debug_assert_eq!(out.len(), start + TS_PACKET_SIZE);

            offset += copy;
        }
    }
}

/// Lightweight view of one emitted TS packet, for tests and diagnostics.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TsPacketHeader {
    pub payload_unit_start: bool,
    pub pid: u16,
    pub adaptation_field_control: u8,
    pub continuity_counter: u8,
}

impl TsPacketHeader {
    pub fn parse(packet: &[u8]) -> Result<TsPacketHeader> {
        if packet.len() != TS_PACKET_SIZE || packet[0] != 0x47 {
            return Err(Error::ErrNotTsAligned);
        }
        Ok(TsPacketHeader {
            payload_unit_start: packet[1] & 0x40 != 0,
            pid: BigEndian::read_u16(&packet[1..3]) & 0x1fff,
            adaptation_field_control: (packet[3] >> 4) & 0x3,
            continuity_counter: packet[3] & 0x0f,
        })
    }

    pub fn has_payload(&self) -> bool {
        self.adaptation_field_control & 0x1 != 0
    }
}
