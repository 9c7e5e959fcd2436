//! UDP round-trip clock synchronization between sink and source.
//!
//! The client sends a packet stamped with its send time; the server
//! returns it amended with its receive and reply times. Assuming the
//! path is symmetric, each exchange yields one clock-offset estimate;
//! a batch of 30 is filtered down to the third with the lowest round-trip
//! times and averaged.

use crate::session::{NetworkSession, SessionEvent};
use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

const NUM_PACKETS_PER_BATCH: usize = 30;
const TIMEOUT_DELAY: Duration = Duration::from_millis(500);
const BATCH_DELAY: Duration = Duration::from_secs(60);
const PACKET_SIZE: usize = 32;

/// One exchange: client send, server receive, server send, client
/// receive, all in microseconds on the respective clocks.
#[derive(Debug, Default, Copy, Clone)]
struct TimeInfo {
    t1: i64,
    t2: i64,
    t3: i64,
    t4: i64,
}

impl TimeInfo {
    fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_SIZE);
        buf.put_i64(self.t1);
        buf.put_i64(self.t2);
        buf.put_i64(self.t3);
        buf.put_i64(self.t4);
        buf.freeze()
    }

    fn unmarshal(data: &[u8]) -> Result<TimeInfo> {
        if data.len() != PACKET_SIZE {
            return Err(Error::ErrMalformedTimeSyncPacket);
        }
        Ok(TimeInfo {
            t1: i64::from_be_bytes(data[0..8].try_into().unwrap()),
            t2: i64::from_be_bytes(data[8..16].try_into().unwrap()),
            t3: i64::from_be_bytes(data[16..24].try_into().unwrap()),
            t4: i64::from_be_bytes(data[24..32].try_into().unwrap()),
        })
    }

    fn round_trip_us(&self) -> i64 {
        self.t4 - self.t1
    }

    /// Offset between the client clock (t1, t4) and the server clock
    /// (t2, t3).
    fn offset_us(&self) -> i64 {
        (self.t2 - self.t1 - self.t4 + self.t3) / 2
    }
}

#[derive(Debug)]
pub enum TimeSyncEvent {
    /// A fresh estimate of `server_clock - client_clock`.
    Offset { offset_us: i64 },
    Error(Error),
}

fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Runs the reflecting server half until its session dies.
pub async fn start_server(
    net: NetworkSession,
    local_port: u16,
    notify: mpsc::UnboundedSender<TimeSyncEvent>,
) -> Result<()> {
    let (session_tx, mut session_rx) = mpsc::unbounded_channel();
    let (session, _) = net.create_udp_session(local_port, None, session_tx).await?;

    tokio::spawn(async move {
        let mut connected = false;
        while let Some(event) = session_rx.recv().await {
            match event {
                SessionEvent::Datagram { datagram, .. } => {
                    let mut info = match TimeInfo::unmarshal(&datagram.payload) {
                        Ok(info) => info,
                        Err(_) => continue,
                    };
                    if !connected {
                        let peer = datagram.transport.peer_addr;
                        if net.connect_udp_session(session, peer).is_err() {
                            break;
                        }
                        connected = true;
                    }
                    info.t2 = now_us();
                    info.t3 = now_us();
                    let _ = net.send_request(session, info.marshal());
                }
                SessionEvent::Error { error, .. } => {
                    let _ = notify.send(TimeSyncEvent::Error(error));
                    break;
                }
                _ => {}
            }
        }
    });

    Ok(())
}

/// Runs the measuring client half; offsets arrive on `notify` once per
/// completed batch.
pub async fn start_client(
    net: NetworkSession,
    remote: SocketAddr,
    notify: mpsc::UnboundedSender<TimeSyncEvent>,
) -> Result<()> {
    let (session_tx, mut session_rx) = mpsc::unbounded_channel();
    let (session, _) = net.create_udp_session(0, Some(remote), session_tx).await?;

    tokio::spawn(async move {
        let mut history: Vec<TimeInfo> = Vec::new();
        let mut pending_t1: i64;

        'batch: loop {
            history.clear();

            while history.len() < NUM_PACKETS_PER_BATCH {
                pending_t1 = now_us();
                let probe = TimeInfo {
                    t1: pending_t1,
                    ..Default::default()
                };
                if net.send_request(session, probe.marshal()).is_err() {
                    break 'batch;
                }

                // Wait for the matching reply; resend on timeout.
                loop {
                    let event = tokio::time::timeout(TIMEOUT_DELAY, session_rx.recv()).await;
                    match event {
                        Err(_) => {
                            log::info!("timed out, sending another request");
                            break;
                        }
                        Ok(None) => break 'batch,
                        Ok(Some(SessionEvent::Datagram { datagram, .. })) => {
                            let Ok(mut info) = TimeInfo::unmarshal(&datagram.payload) else {
                                continue;
                            };
                            if info.t1 != pending_t1 {
                                // Stale reply to an earlier probe.
                                continue;
                            }
                            info.t4 = now_us();
                            history.push(info);
                            tokio::time::sleep(Duration::from_millis(1000 / 30)).await;
                            break;
                        }
                        Ok(Some(SessionEvent::Error { error, .. })) => {
                            let _ = notify.send(TimeSyncEvent::Error(error));
                            break 'batch;
                        }
                        Ok(Some(_)) => {}
                    }
                }
            }

            if let Some(offset_us) = filtered_offset(&mut history) {
                let _ = notify.send(TimeSyncEvent::Offset { offset_us });
            }

            tokio::time::sleep(BATCH_DELAY).await;
        }
    });

    Ok(())
}

/// Averages the offsets of the third of the batch with the smallest
/// round-trip times.
fn filtered_offset(history: &mut [TimeInfo]) -> Option<i64> {
    if history.is_empty() {
        return None;
    }

    history.sort_by_key(TimeInfo::round_trip_us);

    let count = (history.len() / 3).max(1);
    let sum: i64 = history[..count].iter().map(TimeInfo::offset_us).sum();
    Some(sum / count as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_math() {
        // Client clock runs 1000 us behind the server, 200 us one-way
        // delay each direction.
        let info = TimeInfo {
            t1: 10_000,
            t2: 11_200,
            t3: 11_250,
            t4: 10_450,
        };
        assert_eq!(info.round_trip_us(), 450);
        assert_eq!(info.offset_us(), 1000);
    }

    #[test]
    fn test_filtered_offset_prefers_low_rtt() {
        let mut history = vec![
            // Low-RTT exchanges agree on 500 us offset.
            TimeInfo { t1: 0, t2: 600, t3: 600, t4: 200 },
            TimeInfo { t1: 0, t2: 610, t3: 610, t4: 220 },
            TimeInfo { t1: 0, t2: 590, t3: 590, t4: 180 },
            // Congested exchanges would skew the estimate.
            TimeInfo { t1: 0, t2: 5500, t3: 5500, t4: 10_000 },
            TimeInfo { t1: 0, t2: 6000, t3: 6000, t4: 11_000 },
            TimeInfo { t1: 0, t2: 7000, t3: 7000, t4: 12_000 },
        ];

        let offset = filtered_offset(&mut history).unwrap();
        assert!((offset - 500).abs() < 20, "offset {offset}");
    }

    #[test]
    fn test_packet_round_trip() {
        let info = TimeInfo {
            t1: 1,
            t2: -2,
            t3: 3,
            t4: i64::MAX,
        };
        let parsed = TimeInfo::unmarshal(&info.marshal()).unwrap();
        assert_eq!(parsed.t1, 1);
        assert_eq!(parsed.t2, -2);
        assert_eq!(parsed.t3, 3);
        assert_eq!(parsed.t4, i64::MAX);
    }

    #[tokio::test]
    async fn test_client_server_sync_over_loopback() {
        let net = NetworkSession::new(true);
        let (server_notify, _server_rx) = mpsc::unbounded_channel();
        let (client_notify, mut client_rx) = mpsc::unbounded_channel();

        let probe = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        start_server(net.clone(), port, server_notify).await.unwrap();
        start_client(net, ([127, 0, 0, 1], port).into(), client_notify)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(30), client_rx.recv())
            .await
            .expect("no offset within 30s")
            .unwrap();
        match event {
            TimeSyncEvent::Offset { offset_us } => {
                // Same host, same clock: the offset is tiny.
                assert!(offset_us.abs() < 100_000, "offset {offset_us}");
            }
            TimeSyncEvent::Error(e) => panic!("sync failed: {e}"),
        }
    }
}
