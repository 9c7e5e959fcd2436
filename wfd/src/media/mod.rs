//! The media pipeline: capture, encode, packetize and the sender/receiver
//! glue joining tracks to RTP channels.

pub mod buffer;
pub mod converter;
pub mod hdcp;
pub mod puller;
pub mod receiver;
pub mod repeater;
pub mod rtp_sender;
pub mod sender;

use bytes::Bytes;
use shared::error::Result;

/// One encoded (or raw) frame travelling through the pipeline, with its
/// metadata.
#[derive(Debug, Default, Clone)]
pub struct AccessUnit {
    pub data: Bytes,
    /// Presentation time in microseconds.
    pub time_us: i64,
    /// The buffer carries codec specific data rather than media.
    pub is_csd: bool,
    pub is_eos: bool,
    /// Opaque handle for zero-copy encrypted flows; the bytes in `data`
    /// are then a placeholder the protection module fills in.
    pub handle: Option<u64>,
}

impl AccessUnit {
    pub fn new(data: Bytes, time_us: i64) -> Self {
        Self {
            data,
            time_us,
            ..Default::default()
        }
    }
}

/// A raw-frame producer: a capture surface, a microphone, or a repeater
/// wrapping either. Reads may block; pullers run them on their own
/// threads.
pub trait CaptureSource: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn read(&mut self) -> Result<AccessUnit>;
}

/// The codec engine behind a converter. Calls must not block beyond short
/// internal waits.
pub trait Encoder: Send {
    fn queue_input(&mut self, unit: AccessUnit) -> Result<()>;
    /// Returns the next encoded unit, or `None` when the encoder needs
    /// more input.
    fn dequeue_output(&mut self) -> Result<Option<AccessUnit>>;

    /// SPS/PPS or AudioSpecificConfig, available once encoding started.
    fn codec_specific_data(&self) -> Vec<Bytes>;

    fn set_video_bitrate(&mut self, _bitrate_bps: u32) -> Result<()> {
        Ok(())
    }
    fn request_idr_frame(&mut self) -> Result<()> {
        Ok(())
    }
    fn drop_input_frames(&mut self, _drop: bool) -> Result<()> {
        Ok(())
    }
}

/// Consumes decoded (or still-muxed) access units on the sink side.
pub trait Renderer: Send {
    fn render(&mut self, track_index: usize, unit: AccessUnit);
}

/// Supplies the external collaborators of a playback session: capture
/// sources, codec engines and the content protection module.
pub trait MediaComponentFactory: Send + Sync {
    fn create_video_source(
        &self,
        width: u32,
        height: u32,
        frame_rate: u32,
    ) -> Result<Box<dyn CaptureSource>>;

    fn create_audio_source(
        &self,
        sample_rate: u32,
        channel_count: u32,
    ) -> Result<Box<dyn CaptureSource>>;

    fn create_video_encoder(
        &self,
        width: u32,
        height: u32,
        frame_rate: u32,
        bitrate_bps: u32,
    ) -> Result<Box<dyn Encoder>>;

    fn create_audio_encoder(
        &self,
        sample_rate: u32,
        channel_count: u32,
        bitrate_bps: u32,
    ) -> Result<Box<dyn Encoder>>;

    /// `None` when the session runs without content protection.
    fn create_hdcp(
        &self,
        _remote_host: &str,
        _port: u16,
    ) -> Result<Option<Box<dyn hdcp::HdcpEncryptor>>> {
        Ok(None)
    }
}
