#![warn(rust_2018_idioms)]

pub mod audio_codecs;
pub mod message;
pub mod parameters;
pub mod video_formats;

pub use message::{MessageScanner, ParsedMessage, ScannedItem};
pub use parameters::Parameters;
pub use video_formats::{ProfileType, LevelType, ResolutionType, VideoFormats};

/// The WFD capability token required on M1 and echoed in `Public:` lists.
pub const WFD_REQUIRE: &str = "org.wfa.wfd1.0";

/// Methods the source accepts from the sink.
pub const PUBLIC_METHODS: &str =
    "org.wfa.wfd1.0, SETUP, TEARDOWN, PLAY, PAUSE, GET_PARAMETER, SET_PARAMETER";

/// Liveness window granted to a playback session.
pub const PLAYBACK_SESSION_TIMEOUT_SECS: u64 = 30;

/// Server/user agent token carried on every message.
pub const SERVER_NAME: &str = "wfd/0.1";

/// Appends the headers every RTSP message carries: `Date:`, `Server:`,
/// `CSeq:` and, for responses bound to a playback session,
/// `Session: <id>;timeout=30`.
pub fn append_common_response(
    response: &mut String,
    cseq: i32,
    playback_session_id: Option<i32>,
) {
    let now = chrono::Utc::now();
    response.push_str(&format!(
        "Date: {}\r\n",
        now.format("%a, %d %b %Y %H:%M:%S %z")
    ));
    response.push_str(&format!("Server: {SERVER_NAME}\r\n"));

    if cseq >= 0 {
        response.push_str(&format!("CSeq: {cseq}\r\n"));
    }

    if let Some(id) = playback_session_id {
        response.push_str(&format!(
            "Session: {id};timeout={PLAYBACK_SESSION_TIMEOUT_SECS}\r\n"
        ));
    }
}

/// Builds a bare error response, e.g. `"455 Method Not Valid in This State"`.
pub fn error_response(status_line: &str, cseq: i32) -> String {
    let mut response = format!("RTSP/1.0 {status_line}\r\n");
    append_common_response(&mut response, cseq, None);
    response.push_str("\r\n");
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_response_headers() {
        let mut response = String::from("RTSP/1.0 200 OK\r\n");
        append_common_response(&mut response, 7, Some(123));
        assert!(response.contains("CSeq: 7\r\n"));
        assert!(response.contains("Server: wfd/0.1\r\n"));
        assert!(response.contains("Session: 123;timeout=30\r\n"));
        assert!(response.contains("Date: "));
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response("454 Session Not Found", 3);
        assert!(response.starts_with("RTSP/1.0 454 Session Not Found\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }
}
