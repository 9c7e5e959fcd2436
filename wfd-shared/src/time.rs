/// Converts a presentation time in microseconds to a 90 kHz RTP timestamp.
pub fn us_to_rtp_time(time_us: i64) -> u32 {
    ((time_us * 9) / 100) as u32
}

/// Converts a 90 kHz RTP timestamp back to microseconds.
pub fn rtp_time_to_us(rtp_time: u32) -> i64 {
    (rtp_time as i64 * 100) / 9
}

/// Splits a wall-clock microsecond value into the 33-bit PCR base (90 kHz)
/// and 9-bit PCR extension (27 MHz remainder) fields of a transport stream
/// program clock reference.
pub fn pcr_fields(now_us: i64) -> (u64, u32) {
    let pcr = (now_us as u64).wrapping_mul(27);
    (pcr / 300, (pcr % 300) as u32)
}
