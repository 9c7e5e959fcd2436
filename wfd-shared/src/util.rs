use rand::Rng;
use std::sync::atomic::{AtomicI32, Ordering};

/// Fixed synchronization source identifier stamped on every RTP packet we
/// originate.
pub const SOURCE_ID: u32 = 0xdeadbeef;

/// UDP payload budget for a single RTP packet. 1472 is the largest payload
/// that survives a 1500-byte Ethernet MTU with IPv4 + UDP headers.
pub const MAX_UDP_PACKET_SIZE: usize = 1472;

static NEXT_SESSION_ID: AtomicI32 = AtomicI32::new(1);

/// Returns a process-unique positive 31-bit session identifier.
pub fn next_session_id() -> i32 {
    let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
    id & 0x7fff_ffff
}

/// Picks an even port in `[1024, 65534)` for RTP; RTCP uses the next odd
/// port up.
pub fn pick_random_rtp_port() -> u16 {
    const RANGE: u16 = (65534 - 1024) / 2;
    let mut rng = rand::thread_rng();
    rng.gen_range(0..=RANGE) * 2 + 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtp_port_is_even_and_in_range() {
        for _ in 0..1000 {
            let port = pick_random_rtp_port();
            assert_eq!(port % 2, 0);
            assert!((1024..65534).contains(&port));
        }
    }

    #[test]
    fn test_session_ids_unique_and_positive() {
        let a = next_session_id();
        let b = next_session_id();
        assert_ne!(a, b);
        assert!(a > 0 && b > 0);
    }
}
