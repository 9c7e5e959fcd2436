//! End-to-end negotiation and streaming over loopback: a sink attaches
//! to a source, negotiates 720p30, plays, receives media, tears down and
//! reconnects.

use bytes::Bytes;
use shared::error::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wfd::media::{AccessUnit, CaptureSource, Encoder, MediaComponentFactory, Renderer};
use wfd::session::NetworkSession;
use wfd::sink::{SinkEvent, WifiDisplaySink};
use wfd::source::{SourceEvent, WifiDisplaySource};
use wfd::Config;

struct PatternSource {
    frame: u64,
    interval_us: u64,
}

impl CaptureSource for PatternSource {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
    fn read(&mut self) -> Result<AccessUnit> {
        std::thread::sleep(Duration::from_micros(self.interval_us));
        self.frame += 1;
        // Non-zero payload so audio silence suppression stays out of the
        // picture.
        let data = vec![(self.frame % 250 + 1) as u8; 1024];
        Ok(AccessUnit::new(
            data.into(),
            (self.frame * self.interval_us) as i64,
        ))
    }
}

struct PassthroughEncoder {
    pending: Vec<AccessUnit>,
    csd: Vec<Bytes>,
    video: bool,
}

impl Encoder for PassthroughEncoder {
    fn queue_input(&mut self, mut unit: AccessUnit) -> Result<()> {
        if self.video {
            let mut data = vec![0u8, 0, 0, 1, 0x41];
            data.extend_from_slice(&unit.data);
            unit.data = data.into();
        }
        self.pending.push(unit);
        Ok(())
    }

    fn dequeue_output(&mut self) -> Result<Option<AccessUnit>> {
        Ok(if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.remove(0))
        })
    }

    fn codec_specific_data(&self) -> Vec<Bytes> {
        self.csd.clone()
    }
}

struct TestFactory;

impl MediaComponentFactory for TestFactory {
    fn create_video_source(
        &self,
        _width: u32,
        _height: u32,
        _frame_rate: u32,
    ) -> Result<Box<dyn CaptureSource>> {
        Ok(Box::new(PatternSource {
            frame: 0,
            interval_us: 33_333,
        }))
    }

    fn create_audio_source(
        &self,
        _sample_rate: u32,
        _channel_count: u32,
    ) -> Result<Box<dyn CaptureSource>> {
        Ok(Box::new(PatternSource {
            frame: 0,
            interval_us: 21_333,
        }))
    }

    fn create_video_encoder(
        &self,
        _width: u32,
        _height: u32,
        _frame_rate: u32,
        _bitrate_bps: u32,
    ) -> Result<Box<dyn Encoder>> {
        Ok(Box::new(PassthroughEncoder {
            pending: Vec::new(),
            csd: vec![
                Bytes::from_static(&[0, 0, 0, 1, 0x67, 0x42, 0xc0, 0x1f]),
                Bytes::from_static(&[0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80]),
            ],
            video: true,
        }))
    }

    fn create_audio_encoder(
        &self,
        _sample_rate: u32,
        _channel_count: u32,
        _bitrate_bps: u32,
    ) -> Result<Box<dyn Encoder>> {
        Ok(Box::new(PassthroughEncoder {
            pending: Vec::new(),
            csd: vec![Bytes::from_static(&[0x11, 0x90])],
            video: false,
        }))
    }
}

struct CountingRenderer {
    rendered_tx: mpsc::UnboundedSender<usize>,
}

impl Renderer for CountingRenderer {
    fn render(&mut self, _track_index: usize, unit: AccessUnit) {
        let _ = self.rendered_tx.send(unit.data.len());
    }
}

async fn expect<T: std::fmt::Debug>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    what: &str,
    secs: u64,
) -> T {
    tokio::time::timeout(Duration::from_secs(secs), rx.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap_or_else(|| panic!("channel closed waiting for {what}"))
}

async fn free_port() -> u16 {
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);
    port
}

async fn attach_sink(
    net: &NetworkSession,
    addr: SocketAddr,
) -> (
    WifiDisplaySink,
    mpsc::UnboundedReceiver<SinkEvent>,
    mpsc::UnboundedReceiver<usize>,
) {
    let (sink_tx, sink_rx) = mpsc::unbounded_channel();
    let (rendered_tx, rendered_rx) = mpsc::unbounded_channel();
    let sink = WifiDisplaySink::connect(
        net.clone(),
        Config::default(),
        Box::new(CountingRenderer { rendered_tx }),
        addr,
        sink_tx,
    )
    .await
    .expect("sink failed to connect");
    (sink, sink_rx, rendered_rx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sink_attaches_negotiates_plays_and_tears_down() {
    let net = NetworkSession::new(true);
    let addr: SocketAddr = ([127, 0, 0, 1], free_port().await).into();

    let (source_tx, mut source_rx) = mpsc::unbounded_channel();
    let source = WifiDisplaySource::spawn(
        net.clone(),
        Config::default(),
        Arc::new(TestFactory),
        addr,
        source_tx,
    )
    .await
    .expect("source failed to start");

    // First connection: negotiate, play, stream.
    let (sink, mut sink_rx, mut rendered_rx) = attach_sink(&net, addr).await;

    loop {
        match expect(&mut sink_rx, "sink Playing", 10).await {
            SinkEvent::Playing => break,
            SinkEvent::Error(e) => panic!("sink error during negotiation: {e}"),
            SinkEvent::Disconnected => panic!("sink disconnected during negotiation"),
        }
    }

    match expect(&mut source_rx, "source SessionEstablished", 10).await {
        SourceEvent::SessionEstablished => {}
        other => panic!("unexpected source event {other:?}"),
    }

    // Media must arrive promptly once playing.
    let first = expect(&mut rendered_rx, "first access unit", 5).await;
    assert!(first > 0);

    // Orderly teardown from the sink side.
    sink.stop().await;

    loop {
        match expect(&mut source_rx, "source disconnect", 10).await {
            SourceEvent::DisplayDisconnected => break,
            SourceEvent::DisplayError(_) => {}
            other => panic!("unexpected source event {other:?}"),
        }
    }

    // Reconnect: the listener must still accept a fresh sink.
    let (sink2, mut sink2_rx, mut rendered2_rx) = attach_sink(&net, addr).await;

    loop {
        match expect(&mut sink2_rx, "second sink Playing", 10).await {
            SinkEvent::Playing => break,
            SinkEvent::Error(e) => panic!("second sink error: {e}"),
            SinkEvent::Disconnected => panic!("second sink disconnected"),
        }
    }
    expect(&mut rendered2_rx, "second session access unit", 5).await;

    sink2.stop().await;
    source.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_teardown_without_session_returns_454() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let net = NetworkSession::new(true);
    let addr: SocketAddr = ([127, 0, 0, 1], free_port().await).into();

    let (source_tx, _source_rx) = mpsc::unbounded_channel();
    let source = WifiDisplaySource::spawn(
        net,
        Config::default(),
        Arc::new(TestFactory),
        addr,
        source_tx,
    )
    .await
    .expect("source failed to start");

    // A scripted peer that never performed SETUP sends TEARDOWN twice;
    // both must come back 454 and the connection must survive.
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let mut received = String::new();

    for round in 1..=2 {
        let request = format!(
            "TEARDOWN rtsp://localhost/wfd1.0/streamid=0 RTSP/1.0\r\n\
             CSeq: {round}\r\nSession: 99\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let n = tokio::time::timeout_at(deadline, stream.read(&mut buf))
                .await
                .expect("timed out waiting for 454")
                .unwrap();
            assert!(n > 0, "source closed the connection");
            received.push_str(&String::from_utf8_lossy(&buf[..n]));
            if received.contains("454 Session Not Found") {
                break;
            }
        }
        received.clear();
    }

    source.stop().await;
}
