use shared::error::{Error, Result};

/// A `text/parameters` body: newline-separated `name: value` lines with
/// case-insensitive names.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Parameters {
    entries: Vec<(String, String)>,
}

impl Parameters {
    pub fn parse(data: &str) -> Result<Parameters> {
        let mut entries = Vec::new();

        for line in data.split("\r\n").flat_map(|l| l.split('\n')) {
            if line.is_empty() {
                continue;
            }
            let Some(colon) = line.find(':') else {
                return Err(Error::ErrMalformedParameters);
            };
            let name = line[..colon].trim().to_ascii_lowercase();
            if name.is_empty() {
                return Err(Error::ErrMalformedParameters);
            }
            let value = line[colon + 1..].trim().to_owned();
            entries.push((name, value));
        }

        Ok(Parameters { entries })
    }

    pub fn find(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_parameter_dictionary() {
        let body = "wfd_video_formats: 00 00 02 02 00000020 00000000 00000000 00 0000 0000 00 none none\r\n\
                    wfd_audio_codecs: AAC 00000001 00\r\n\
                    wfd_client_rtp_ports: RTP/AVP/UDP;unicast 19000 0 mode=play\r\n";

        let params = Parameters::parse(body).unwrap();
        assert!(params.find("WFD_AUDIO_CODECS").unwrap().starts_with("AAC"));
        assert!(params.find("wfd_client_rtp_ports").unwrap().contains("19000"));
        assert_eq!(params.find("wfd_uibc_capability"), None);
    }

    #[test]
    fn test_malformed_line() {
        assert!(Parameters::parse("no colon here\r\n").is_err());
    }

    #[test]
    fn test_empty_body() {
        let params = Parameters::parse("").unwrap();
        assert_eq!(params.find("anything"), None);
    }
}
