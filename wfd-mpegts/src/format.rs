use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

/// The payload kinds a transport stream track can carry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MediaMime {
    VideoAvc,
    AudioAac,
    /// Raw 16-bit stereo LPCM framed per the Wi-Fi Display spec.
    AudioLpcm,
}

impl MediaMime {
    pub fn is_video(&self) -> bool {
        matches!(self, MediaMime::VideoAvc)
    }

    pub fn is_audio(&self) -> bool {
        !self.is_video()
    }
}

/// Format descriptor for one elementary stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackFormat {
    pub mime: MediaMime,

    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,

    pub channel_count: u32,
    pub sample_rate: u32,
    /// Whether AAC access units already carry ADTS headers.
    pub is_adts: bool,

    /// Codec specific data: SPS and PPS with 4-byte start codes for H.264,
    /// the AudioSpecificConfig for AAC.
    pub csd: Vec<Bytes>,
}

impl TrackFormat {
    pub fn avc(width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            mime: MediaMime::VideoAvc,
            width,
            height,
            frame_rate,
            channel_count: 0,
            sample_rate: 0,
            is_adts: false,
            csd: Vec::new(),
        }
    }

    pub fn aac(channel_count: u32, sample_rate: u32) -> Self {
        Self {
            mime: MediaMime::AudioAac,
            width: 0,
            height: 0,
            frame_rate: 0,
            channel_count,
            sample_rate,
            is_adts: false,
            csd: Vec::new(),
        }
    }

    pub fn lpcm(channel_count: u32, sample_rate: u32) -> Self {
        Self {
            mime: MediaMime::AudioLpcm,
            width: 0,
            height: 0,
            frame_rate: 0,
            channel_count,
            sample_rate,
            is_adts: false,
            csd: Vec::new(),
        }
    }

    pub fn with_csd(mut self, csd: Vec<Bytes>) -> Self {
        self.csd = csd;
        self
    }
}

/// Returns true if the Annex-B access unit contains an IDR slice.
pub fn is_idr(access_unit: &[u8]) -> bool {
    each_nal_header(access_unit).any(|header| header & 0x1f == 5)
}

/// Iterates the first byte of every NAL unit in an Annex-B buffer.
fn each_nal_header(data: &[u8]) -> impl Iterator<Item = u8> + '_ {
    let mut rest = data;
    std::iter::from_fn(move || {
        while rest.len() >= 4 {
            if rest[0] == 0 && rest[1] == 0 && rest[2] == 1 {
                let header = rest[3];
                rest = &rest[4..];
                return Some(header);
            }
            rest = &rest[1..];
        }
        None
    })
}

/// Wraps a raw AAC access unit with a 7-byte ADTS header derived from the
/// AudioSpecificConfig.
pub fn prepend_adts_header(csd: &[u8], access_unit: &[u8]) -> Result<Bytes> {
    if csd.len() < 2 {
        return Err(Error::ErrMissingCodecSpecificData);
    }

    let aac_frame_length = access_unit.len() + 7;

    let profile = (csd[0] >> 3) - 1;
    let sampling_freq_index = ((csd[0] & 7) << 1) | (csd[1] >> 7);
    let channel_configuration = (csd[1] >> 3) & 0x0f;

    let mut out = BytesMut::with_capacity(aac_frame_length);
    out.put_u8(0xff);
    out.put_u8(0xf1); // ID=0, layer=0, protection_absent=1

    out.put_u8((profile << 6) | (sampling_freq_index << 2) | ((channel_configuration >> 2) & 1));
    out.put_u8(((channel_configuration & 3) << 6) | (aac_frame_length >> 11) as u8);
    out.put_u8(((aac_frame_length >> 3) & 0xff) as u8);
    out.put_u8(((aac_frame_length & 7) << 5) as u8);
    // adts_buffer_fullness=0, number_of_raw_data_blocks_in_frame=0
    out.put_u8(0);

    out.extend_from_slice(access_unit);
    Ok(out.freeze())
}
