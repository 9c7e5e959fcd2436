//! TCP framing for datagram-over-stream transports.
//!
//! A TCP session used as an RTP/RTCP transport carries discrete datagrams,
//! each prefixed with a 2-byte big-endian length. This module provides
//! helpers for encoding and decoding framed packets without performing any
//! I/O.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! -----------------------------------------------------------------
//! |             LENGTH            |  RTP/RTCP packet ...          |
//! -----------------------------------------------------------------
//! ```

/// Length of the framing header (2 bytes for length prefix).
pub const FRAMING_HEADER_LEN: usize = 2;

/// Maximum packet size that can be framed (u16::MAX = 65535 bytes).
pub const MAX_FRAMED_PACKET_SIZE: usize = u16::MAX as usize;

/// Adds a framing header to a packet.
///
/// Returns a new `Vec<u8>` containing the 2-byte big-endian length prefix
/// followed by the packet data.
///
/// # Panics
///
/// Panics if `buf.len() > 65535` (maximum u16 value).
pub fn frame_packet(buf: &[u8]) -> Vec<u8> {
    assert!(
        buf.len() <= MAX_FRAMED_PACKET_SIZE,
        "packet length {} exceeds maximum {}",
        buf.len(),
        MAX_FRAMED_PACKET_SIZE
    );

    let mut framed = Vec::with_capacity(FRAMING_HEADER_LEN + buf.len());
    let header = (buf.len() as u16).to_be_bytes();
    framed.extend_from_slice(&header);
    framed.extend_from_slice(buf);
    framed
}

/// A stateful decoder for length-prefix framed TCP packets.
///
/// The decoder buffers incoming TCP data and extracts complete framed
/// packets. It handles partial reads gracefully - data can be fed in any
/// chunk size.
#[derive(Debug, Default)]
pub struct TcpFrameDecoder {
    buffer: Vec<u8>,
}

impl TcpFrameDecoder {
    /// Creates a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Appends data to the internal buffer.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to extract the next complete packet from the buffer.
    ///
    /// Returns `Some(packet)` if a complete packet is available,
    /// or `None` if more data is needed.
    ///
    /// The returned packet does not include the 2-byte length header.
    pub fn next_packet(&mut self) -> Option<Vec<u8>> {
        if self.buffer.len() < FRAMING_HEADER_LEN {
            return None;
        }

        let length = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
        let total_len = FRAMING_HEADER_LEN + length;

        if self.buffer.len() < total_len {
            return None;
        }

        let packet = self.buffer[FRAMING_HEADER_LEN..total_len].to_vec();
        self.buffer.drain(..total_len);

        Some(packet)
    }

    /// Returns the number of buffered bytes.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns `true` if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_packet() {
        let packet = b"Hello, Wi-Fi Display!";
        let framed = frame_packet(packet);

        assert_eq!(framed.len(), FRAMING_HEADER_LEN + packet.len());

        let length = u16::from_be_bytes([framed[0], framed[1]]) as usize;
        assert_eq!(length, packet.len());
        assert_eq!(&framed[FRAMING_HEADER_LEN..], packet);
    }

    #[test]
    fn test_decoder_complete_packet() {
        let mut decoder = TcpFrameDecoder::new();
        let framed = frame_packet(b"Test");

        decoder.extend_from_slice(&framed);

        let packet = decoder.next_packet().unwrap();
        assert_eq!(packet, b"Test");
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_decoder_partial_payload() {
        let mut decoder = TcpFrameDecoder::new();

        decoder.extend_from_slice(&[0, 5, b'H', b'e']);
        assert!(decoder.next_packet().is_none());
        assert_eq!(decoder.buffered_len(), 4);

        decoder.extend_from_slice(&[b'l', b'l', b'o']);
        assert_eq!(decoder.next_packet(), Some(b"Hello".to_vec()));
    }

    #[test]
    fn test_decoder_multiple_packets() {
        let mut decoder = TcpFrameDecoder::new();

        decoder.extend_from_slice(&frame_packet(b"First"));
        decoder.extend_from_slice(&frame_packet(b"Second"));

        assert_eq!(decoder.next_packet(), Some(b"First".to_vec()));
        assert_eq!(decoder.next_packet(), Some(b"Second".to_vec()));
        assert!(decoder.next_packet().is_none());
    }

    #[test]
    fn test_empty_packet() {
        let framed = frame_packet(b"");
        assert_eq!(framed, vec![0, 0]);

        let mut decoder = TcpFrameDecoder::new();
        decoder.extend_from_slice(&framed);
        assert_eq!(decoder.next_packet(), Some(vec![]));
    }

    #[test]
    #[should_panic(expected = "packet length")]
    fn test_frame_packet_too_large() {
        let huge = vec![0u8; MAX_FRAMED_PACKET_SIZE + 1];
        frame_packet(&huge);
    }
}
