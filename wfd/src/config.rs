use serde::{Deserialize, Serialize};

/// How the video encoder's rate control reacts to sink feedback.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoBitrateMode {
    Constant,
    Variable,
    /// Scale with the sink's reported latency.
    #[default]
    Adaptive,
}

/// Every tunable of the streaming core, passed by value into the source
/// and sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub video_bitrate_bps: u32,
    pub audio_bitrate_bps: u32,

    /// Overrides the negotiated resolution.
    pub force_resolution: Option<(u32, u32)>,
    /// Overrides the capture frame rate.
    pub force_framerate_hz: Option<f64>,

    pub video_bitrate_mode: VideoBitrateMode,

    /// Stream LPCM instead of AAC audio.
    pub use_pcm_audio: bool,
    /// Carry RTP over TCP datagram sessions instead of UDP.
    pub use_tcp_transport: bool,
    /// Advertise 1080p30 instead of 720p30 in M4.
    pub prefer_1080p: bool,
    /// Restrict H.264 to constrained baseline.
    pub force_baseline_profile: bool,

    /// Ask peers to retransmit lost packets via generic NACK.
    pub enable_retransmission: bool,
    /// Tolerate sinks that understate the `wfd_idr_request` body length
    /// by two bytes.
    pub idr_request_compat: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            video_bitrate_bps: 5_000_000,
            audio_bitrate_bps: 128_000,
            force_resolution: None,
            force_framerate_hz: None,
            video_bitrate_mode: VideoBitrateMode::default(),
            use_pcm_audio: false,
            use_tcp_transport: false,
            prefer_1080p: false,
            force_baseline_profile: false,
            enable_retransmission: false,
            idr_request_compat: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitrate_defaults() {
        let config = Config::default();
        assert_eq!(config.video_bitrate_bps, 5_000_000);
        assert_eq!(config.audio_bitrate_bps, 128_000);
        assert_eq!(config.video_bitrate_mode, VideoBitrateMode::Adaptive);
        assert!(config.idr_request_compat);
        assert!(!config.enable_retransmission);
    }
}
