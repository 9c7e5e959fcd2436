//! The `wfd_audio_codecs` and `wfd_content_protection` grammars.

use shared::error::{Error, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AudioCodecKind {
    Lpcm,
    Aac,
    Ac3,
}

/// One advertised audio codec: a kind, a mode bitmask and a latency hint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AudioCodec {
    pub kind: AudioCodecKind,
    pub modes: u32,
    pub latency: u8,
}

/// Parses a `wfd_audio_codecs` value such as
/// `"LPCM 00000002 00, AAC 00000001 00"`.
pub fn parse_audio_codecs(value: &str) -> Result<Vec<AudioCodec>> {
    if value.trim() == "none" {
        return Ok(Vec::new());
    }

    let mut codecs = Vec::new();
    for entry in value.split(',') {
        let mut tokens = entry.split_whitespace();

        let kind = match tokens.next() {
            Some("LPCM") => AudioCodecKind::Lpcm,
            Some("AAC") => AudioCodecKind::Aac,
            Some("AC3") => AudioCodecKind::Ac3,
            _ => return Err(Error::ErrMalformedAudioCodecs),
        };

        let modes = tokens
            .next()
            .and_then(|t| u32::from_str_radix(t, 16).ok())
            .ok_or(Error::ErrMalformedAudioCodecs)?;
        let latency = tokens
            .next()
            .and_then(|t| u8::from_str_radix(t, 16).ok())
            .ok_or(Error::ErrMalformedAudioCodecs)?;

        codecs.push(AudioCodec {
            kind,
            modes,
            latency,
        });
    }

    Ok(codecs)
}

/// The chosen audio configuration, serialized back into an M4 body.
pub fn audio_codec_spec(use_pcm_audio: bool) -> &'static str {
    if use_pcm_audio {
        "LPCM 00000002 00" // 2 ch PCM 48kHz
    } else {
        "AAC 00000001 00" // 2 ch AAC 48kHz
    }
}

/// A sink's `wfd_content_protection` advertisement.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContentProtection {
    None,
    Hdcp20 { port: u16 },
    Hdcp21 { port: u16 },
}

pub fn parse_content_protection(value: &str) -> Result<ContentProtection> {
    let value = value.trim();
    if value == "none" {
        return Ok(ContentProtection::None);
    }

    let (scheme, rest) = value
        .split_once(' ')
        .ok_or(Error::ErrMalformedContentProtection)?;

    let port: u16 = rest
        .trim()
        .strip_prefix("port=")
        .and_then(|p| p.parse().ok())
        .ok_or(Error::ErrMalformedContentProtection)?;

    match scheme {
        "HDCP2.0" => Ok(ContentProtection::Hdcp20 { port }),
        "HDCP2.1" => Ok(ContentProtection::Hdcp21 { port }),
        _ => Err(Error::ErrMalformedContentProtection),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_audio_codecs() {
        let codecs = parse_audio_codecs("LPCM 00000002 00, AAC 00000001 00").unwrap();
        assert_eq!(codecs.len(), 2);
        assert_eq!(codecs[0].kind, AudioCodecKind::Lpcm);
        assert_eq!(codecs[0].modes, 2);
        assert_eq!(codecs[1].kind, AudioCodecKind::Aac);
        assert_eq!(codecs[1].modes, 1);
    }

    #[test]
    fn test_parse_audio_codecs_none() {
        assert_eq!(parse_audio_codecs("none").unwrap(), vec![]);
    }

    #[test]
    fn test_parse_audio_codecs_malformed() {
        assert!(parse_audio_codecs("OPUS 00000001 00").is_err());
        assert!(parse_audio_codecs("AAC").is_err());
    }

    #[test]
    fn test_parse_content_protection() {
        assert_eq!(
            parse_content_protection("HDCP2.1 port=31555").unwrap(),
            ContentProtection::Hdcp21 { port: 31555 }
        );
        assert_eq!(
            parse_content_protection("none").unwrap(),
            ContentProtection::None
        );
        assert!(parse_content_protection("HDCP9.9 port=1").is_err());
        assert!(parse_content_protection("HDCP2.0").is_err());
    }
}
