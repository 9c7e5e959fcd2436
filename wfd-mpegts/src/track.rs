use crate::format::{MediaMime, TrackFormat};
use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

/// One elementary stream inside the mux: its PID, stream type/id,
/// continuity counter and the PMT descriptors it contributes.
pub(crate) struct Track {
    pub(crate) format: TrackFormat,
    pid: u16,
    stream_type: u8,
    stream_id: u8,
    continuity_counter: u8,
    descriptors: Vec<Bytes>,
    finalized: bool,
}

impl Track {
    pub(crate) fn new(format: TrackFormat, pid: u16, stream_type: u8, stream_id: u8) -> Self {
        Self {
            format,
            pid,
            stream_type,
            stream_id,
            continuity_counter: 0,
            descriptors: Vec::new(),
            finalized: false,
        }
    }

    pub(crate) fn pid(&self) -> u16 {
        self.pid
    }

    pub(crate) fn stream_type(&self) -> u8 {
        self.stream_type
    }

    pub(crate) fn stream_id(&self) -> u8 {
        self.stream_id
    }

    /// Advances the 4-bit continuity counter; returns the value the packet
    /// being emitted should carry.
    pub(crate) fn increment_continuity_counter(&mut self) -> u8 {
        let prev = self.continuity_counter;
        self.continuity_counter = (self.continuity_counter + 1) % 16;
        prev
    }

    pub(crate) fn is_h264(&self) -> bool {
        self.format.mime == MediaMime::VideoAvc
    }

    pub(crate) fn is_aac(&self) -> bool {
        self.format.mime == MediaMime::AudioAac
    }

    pub(crate) fn is_pcm_audio(&self) -> bool {
        self.format.mime == MediaMime::AudioLpcm
    }

    pub(crate) fn lacks_adts_header(&self) -> bool {
        self.is_aac() && !self.format.is_adts
    }

    /// Concatenates the cached codec specific data in front of an access
    /// unit.
    pub(crate) fn prepend_csd(&self, access_unit: &[u8]) -> Bytes {
        let csd_size: usize = self.format.csd.iter().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(csd_size + access_unit.len());
        for csd in &self.format.csd {
            out.extend_from_slice(csd);
        }
        out.extend_from_slice(access_unit);
        out.freeze()
    }

    pub(crate) fn descriptors(&self) -> &[Bytes] {
        &self.descriptors
    }

    /// Builds the PMT descriptors for this track on first use.
    pub(crate) fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }

        if self.is_h264() {
            // AVC video descriptor (40)
            let mut descriptor = BytesMut::with_capacity(6);
            descriptor.put_u8(40); // descriptor_tag
            descriptor.put_u8(4); // descriptor_length

            match self.format.csd.first() {
                Some(sps) => {
                    if sps.len() < 7 || &sps[0..4] != b"\x00\x00\x00\x01" {
                        return Err(Error::ErrMissingCodecSpecificData);
                    }
                    // profile_idc, constraint_set*, level_idc
                    descriptor.extend_from_slice(&sps[4 + 1..4 + 4]);
                }
                None => {
                    // Constrained baseline 3.1 when no SPS is known yet.
                    descriptor.put_u8(66);
                    descriptor.put_u8(0xc0);
                    descriptor.put_u8(31);
                }
            }

            // AVC_still_present=0, AVC_24_hour_picture_flag=0, reserved
            descriptor.put_u8(0x3f);
            self.descriptors.push(descriptor.freeze());

            // AVC timing and HRD descriptor (42)
            let mut descriptor = BytesMut::with_capacity(4);
            descriptor.put_u8(42); // descriptor_tag
            descriptor.put_u8(2); // descriptor_length

            // hrd_management_valid_flag = 0
            // reserved = 111111b
            // picture_and_timing_info_present = 0
            descriptor.put_u8(0x7e);

            // fixed_frame_rate_flag = 0
            // temporal_poc_flag = 0
            // picture_to_display_conversion_flag = 0
            // reserved = 11111b
            descriptor.put_u8(0x1f);
            self.descriptors.push(descriptor.freeze());
        } else if self.is_pcm_audio() {
            // LPCM audio stream descriptor (0x83)
            if self.format.channel_count != 2
                || !matches!(self.format.sample_rate, 44100 | 48000)
            {
                return Err(Error::ErrUnsupportedTrackFormat);
            }

            let sampling_frequency: u8 = if self.format.sample_rate == 44100 { 1 } else { 2 };

            let mut descriptor = BytesMut::with_capacity(4);
            descriptor.put_u8(0x83); // descriptor_tag
            descriptor.put_u8(2); // descriptor_length
            descriptor.put_u8((sampling_frequency << 5) | (3 << 1));
            // number_of_channels = stereo, reserved
            descriptor.put_u8((1 << 5) | 0x0f);
            self.descriptors.push(descriptor.freeze());
        }

        self.finalized = true;
        Ok(())
    }
}
