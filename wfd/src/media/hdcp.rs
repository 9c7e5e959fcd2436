//! Content-protection hooks: the pluggable encryptor interface and the
//! 16-byte PES private data block that rides along with every encrypted
//! access unit.

use shared::error::Result;

/// The external HDCP module. Encryption happens in place over the access
/// unit payload; the returned input counter goes into the private data
/// block.
pub trait HdcpEncryptor: Send {
    fn encrypt(&mut self, data: &mut [u8], stream_ctr: u32) -> Result<u64>;
    fn shutdown(&mut self);
}

/// Builds the 16-byte HDCP PES private data block from a 41-bit stream
/// counter and a 64-bit input counter.
///
/// Marker bits are mandatory at bit 0 of every odd byte.
pub fn private_data(stream_ctr: u32, input_ctr: u64) -> [u8; 16] {
    let s = stream_ctr as u64;

    [
        0x00,
        ((((s >> 30) & 3) << 1) | 1) as u8,
        ((s >> 22) & 0xff) as u8,
        ((((s >> 15) & 0x7f) << 1) | 1) as u8,
        ((s >> 7) & 0xff) as u8,
        (((s & 0x7f) << 1) | 1) as u8,
        0x00,
        ((((input_ctr >> 60) & 0x0f) << 1) | 1) as u8,
        ((input_ctr >> 52) & 0xff) as u8,
        ((((input_ctr >> 45) & 0x7f) << 1) | 1) as u8,
        ((input_ctr >> 37) & 0xff) as u8,
        ((((input_ctr >> 30) & 0x7f) << 1) | 1) as u8,
        ((input_ctr >> 22) & 0xff) as u8,
        ((((input_ctr >> 15) & 0x7f) << 1) | 1) as u8,
        ((input_ctr >> 7) & 0xff) as u8,
        (((input_ctr & 0x7f) << 1) | 1) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_bits_always_set() {
        // The marker positions {1,3,5,7,9,11,13,15} must have bit 0 set for
        // any counter values.
        let cases = [
            (0u32, 0u64),
            (1, 1),
            (0x1ff_ffff, u64::MAX),
            (0xffff_ffff, 0x8000_0000_0000_0000),
            (0x2aaa_aaaa, 0x5555_5555_5555_5555),
        ];

        for (stream_ctr, input_ctr) in cases {
            let block = private_data(stream_ctr, input_ctr);
            for position in [1, 3, 5, 7, 9, 11, 13, 15] {
                assert_eq!(block[position] & 1, 1, "position {position}");
            }
            assert_eq!(block[0], 0);
            assert_eq!(block[6], 0);
        }
    }

    #[test]
    fn test_counters_reconstruct() {
        let stream_ctr = 0x1234_5678u32;
        let input_ctr = 0xfedc_ba98_7654_3210u64;
        let b = private_data(stream_ctr, input_ctr);

        let s = (((b[1] as u64 >> 1) & 3) << 30)
            | ((b[2] as u64) << 22)
            | (((b[3] as u64 >> 1) & 0x7f) << 15)
            | ((b[4] as u64) << 7)
            | ((b[5] as u64 >> 1) & 0x7f);
        assert_eq!(s, stream_ctr as u64);

        let c = (((b[7] as u64 >> 1) & 0x0f) << 60)
            | ((b[8] as u64) << 52)
            | (((b[9] as u64 >> 1) & 0x7f) << 45)
            | ((b[10] as u64) << 37)
            | (((b[11] as u64 >> 1) & 0x7f) << 30)
            | ((b[12] as u64) << 22)
            | (((b[13] as u64 >> 1) & 0x7f) << 15)
            | ((b[14] as u64) << 7)
            | ((b[15] as u64 >> 1) & 0x7f);
        assert_eq!(c, input_ctr);
    }
}
