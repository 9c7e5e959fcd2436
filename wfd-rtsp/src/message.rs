use shared::error::{Error, Result};
use std::collections::HashMap;

/// A parsed RTSP request or response: the first line, a case-insensitive
/// header dictionary and the body governed by `Content-Length`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    first_line: String,
    headers: HashMap<String, String>,
    content: String,
}

impl ParsedMessage {
    /// Attempts to parse one message from the front of `data`.
    ///
    /// Returns the message and the number of bytes it consumed, or `None`
    /// if the buffer does not yet hold a complete message.
    pub fn parse(data: &[u8]) -> Result<Option<(ParsedMessage, usize)>> {
        let text = match std::str::from_utf8(data) {
            Ok(text) => text,
            // Tolerate partial UTF-8 at the tail of an incomplete read.
            Err(e) if e.error_len().is_none() => {
                std::str::from_utf8(&data[..e.valid_up_to()]).unwrap()
            }
            Err(_) => return Err(Error::ErrMalformedRtspMessage),
        };

        let Some(header_end) = text.find("\r\n\r\n") else {
            return Ok(None);
        };

        let header_text = &text[..header_end];
        let mut lines = header_text.split("\r\n");

        let first_line = lines.next().unwrap_or_default().to_owned();
        if first_line.is_empty() {
            return Err(Error::ErrMalformedRtspMessage);
        }

        let mut headers = HashMap::new();
        for line in lines {
            let Some(colon) = line.find(':') else {
                return Err(Error::ErrMalformedRtspMessage);
            };
            let name = line[..colon].trim().to_ascii_lowercase();
            let value = line[colon + 1..].trim().to_owned();
            if name.is_empty() {
                return Err(Error::ErrMalformedRtspMessage);
            }
            headers.insert(name, value);
        }

        let content_length: usize = headers
            .get("content-length")
            .map(|v| v.parse())
            .transpose()
            .map_err(|_| Error::ErrMalformedRtspMessage)?
            .unwrap_or(0);

        let body_start = header_end + 4;
        if data.len() < body_start + content_length {
            return Ok(None);
        }

        let content =
            String::from_utf8(data[body_start..body_start + content_length].to_vec())
                .map_err(|_| Error::ErrMalformedRtspMessage)?;

        Ok(Some((
            ParsedMessage {
                first_line,
                headers,
                content,
            },
            body_start + content_length,
        )))
    }

    /// Header lookup; names are case-insensitive.
    pub fn find_string(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Parses the leading integer of a header value, so
    /// `Session: 123;timeout=30` yields 123.
    pub fn find_i32(&self, name: &str) -> Option<i32> {
        let value = self.find_string(name)?;
        let digits: &str = value
            .split(|c: char| !(c.is_ascii_digit() || c == '-'))
            .next()?;
        digits.parse().ok()
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// For a response, the numeric status code.
    pub fn status_code(&self) -> Option<u16> {
        if !self.first_line.starts_with("RTSP/") {
            return None;
        }
        self.first_line.split_whitespace().nth(1)?.parse().ok()
    }

    /// For a request, the (method, uri, version) triple.
    pub fn request_line(&self) -> Option<(&str, &str, &str)> {
        if self.first_line.starts_with("RTSP/") {
            return None;
        }
        let mut fields = self.first_line.split_whitespace();
        Some((fields.next()?, fields.next()?, fields.next()?))
    }

    /// Extracts `;name=value` attributes out of a field such as the
    /// `Transport:` header.
    pub fn get_attribute(field: &str, name: &str) -> Option<String> {
        for part in field.split(';') {
            let part = part.trim();
            if let Some((key, value)) = part.split_once('=') {
                if key.eq_ignore_ascii_case(name) {
                    return Some(value.to_owned());
                }
            }
        }
        None
    }
}

/// One item scanned off an RTSP connection.
#[derive(Debug, PartialEq, Eq)]
pub enum ScannedItem {
    Message(ParsedMessage),
    /// An interleaved binary frame: `$<channel><len16>` payload.
    BinaryData { channel: u8, data: Vec<u8> },
}

/// Incremental scanner for the RTSP side of a TCP connection: CRLF
/// messages with bodies interleaved with `$`-framed binary data.
#[derive(Debug, Default)]
pub struct MessageScanner {
    buffer: Vec<u8>,
    /// Works around sinks that send `wfd_idr_request` with a
    /// `Content-Length: 17` instead of 19: the trailing CRLF is folded
    /// into the message instead of corrupting the next one.
    idr_request_compat: bool,
}

impl MessageScanner {
    pub fn new(idr_request_compat: bool) -> Self {
        Self {
            buffer: Vec::new(),
            idr_request_compat,
        }
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Scans the next complete item, if any.
    pub fn next_item(&mut self) -> Result<Option<ScannedItem>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        if self.buffer[0] == b'$' {
            if self.buffer.len() < 4 {
                return Ok(None);
            }
            let channel = self.buffer[1];
            let length = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
            if self.buffer.len() < 4 + length {
                return Ok(None);
            }
            let data = self.buffer[4..4 + length].to_vec();
            self.buffer.drain(..4 + length);
            return Ok(Some(ScannedItem::BinaryData { channel, data }));
        }

        match ParsedMessage::parse(&self.buffer)? {
            None => Ok(None),
            Some((message, mut consumed)) => {
                if self.idr_request_compat
                    && message.content().starts_with("wfd_idr_request\r\n")
                    && message.content().len() == 17
                    && self.buffer.len() >= consumed + 2
                    && &self.buffer[consumed..consumed + 2] == b"\r\n"
                {
                    consumed += 2;
                }

                self.buffer.drain(..consumed);
                Ok(Some(ScannedItem::Message(message)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPTIONS: &str = "OPTIONS * RTSP/1.0\r\nCSeq: 1\r\nRequire: org.wfa.wfd1.0\r\n\r\n";

    #[test]
    fn test_parse_request() {
        let (message, consumed) = ParsedMessage::parse(OPTIONS.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(consumed, OPTIONS.len());
        assert_eq!(message.request_line(), Some(("OPTIONS", "*", "RTSP/1.0")));
        assert_eq!(message.find_i32("cseq"), Some(1));
        assert_eq!(message.find_string("require"), Some("org.wfa.wfd1.0"));
        assert_eq!(message.status_code(), None);
    }

    #[test]
    fn test_parse_response_with_body() {
        let body = "wfd_video_formats: none\r\n";
        let text = format!(
            "RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );

        let (message, consumed) = ParsedMessage::parse(text.as_bytes()).unwrap().unwrap();
        assert_eq!(consumed, text.len());
        assert_eq!(message.status_code(), Some(200));
        assert_eq!(message.content(), body);
    }

    #[test]
    fn test_incomplete_message_returns_none() {
        assert_eq!(
            ParsedMessage::parse(b"OPTIONS * RTSP/1.0\r\nCSeq:").unwrap(),
            None
        );

        let text = "PLAY x RTSP/1.0\r\nContent-Length: 10\r\n\r\nabc";
        assert_eq!(ParsedMessage::parse(text.as_bytes()).unwrap(), None);
    }

    #[test]
    fn test_session_header_with_timeout_suffix() {
        let text = "TEARDOWN rtsp://x/wfd1.0 RTSP/1.0\r\nSession: 42;timeout=30\r\n\r\n";
        let (message, _) = ParsedMessage::parse(text.as_bytes()).unwrap().unwrap();
        assert_eq!(message.find_i32("session"), Some(42));
    }

    #[test]
    fn test_get_attribute() {
        let transport = "RTP/AVP/UDP;unicast;client_port=19000-19001;server_port=5000";
        assert_eq!(
            ParsedMessage::get_attribute(transport, "client_port").as_deref(),
            Some("19000-19001")
        );
        assert_eq!(ParsedMessage::get_attribute(transport, "interleaved"), None);
    }

    #[test]
    fn test_scanner_interleaved_binary_between_messages() {
        let mut scanner = MessageScanner::new(false);
        scanner.extend_from_slice(OPTIONS.as_bytes());
        scanner.extend_from_slice(&[b'$', 0, 0, 3, 1, 2, 3]);
        scanner.extend_from_slice(OPTIONS.as_bytes());

        assert!(matches!(
            scanner.next_item().unwrap(),
            Some(ScannedItem::Message(_))
        ));
        match scanner.next_item().unwrap() {
            Some(ScannedItem::BinaryData { channel, data }) => {
                assert_eq!(channel, 0);
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("unexpected item {other:?}"),
        }
        assert!(matches!(
            scanner.next_item().unwrap(),
            Some(ScannedItem::Message(_))
        ));
        assert!(scanner.next_item().unwrap().is_none());
    }

    #[test]
    fn test_scanner_idr_request_content_length_quirk() {
        // Some sinks declare Content-Length: 17 for "wfd_idr_request\r\n\r\n"
        // (19 bytes). With compat on, the stray CRLF must not leak into the
        // next message.
        let quirky = "SET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\r\n\
                      CSeq: 5\r\n\
                      Content-Length: 17\r\n\r\n\
                      wfd_idr_request\r\n\r\n";

        let mut scanner = MessageScanner::new(true);
        scanner.extend_from_slice(quirky.as_bytes());
        scanner.extend_from_slice(OPTIONS.as_bytes());

        match scanner.next_item().unwrap() {
            Some(ScannedItem::Message(message)) => {
                assert!(message.content().starts_with("wfd_idr_request"));
            }
            other => panic!("unexpected item {other:?}"),
        }
        match scanner.next_item().unwrap() {
            Some(ScannedItem::Message(message)) => {
                assert_eq!(message.request_line().unwrap().0, "OPTIONS");
            }
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[test]
    fn test_scanner_quirk_scoped_to_idr_request_only() {
        // An ordinary short body followed by a CRLF-led message must not
        // trigger the workaround.
        let normal = "SET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\r\n\
                      CSeq: 6\r\n\
                      Content-Length: 19\r\n\r\n\
                      wfd_idr_request\r\n\r\n";

        let mut scanner = MessageScanner::new(true);
        scanner.extend_from_slice(normal.as_bytes());
        scanner.extend_from_slice(OPTIONS.as_bytes());

        assert!(matches!(
            scanner.next_item().unwrap(),
            Some(ScannedItem::Message(_))
        ));
        match scanner.next_item().unwrap() {
            Some(ScannedItem::Message(message)) => {
                assert_eq!(message.request_line().unwrap().0, "OPTIONS");
            }
            other => panic!("unexpected item {other:?}"),
        }
    }
}
