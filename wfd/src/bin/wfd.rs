//! Command line shim around the streaming core: start a source, or
//! connect to one as a sink.

use clap::Parser;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use wfd::media::hdcp::HdcpEncryptor;
use wfd::media::{AccessUnit, CaptureSource, Encoder, MediaComponentFactory, Renderer};
use wfd::session::NetworkSession;
use wfd::sink::{SinkEvent, WifiDisplaySink};
use wfd::source::{SourceEvent, WifiDisplaySource};
use wfd::{Config, DEFAULT_RTSP_PORT};

#[derive(Parser, Debug)]
#[command(name = "wfd", about = "Wi-Fi Display source/sink")]
struct Args {
    /// Connect to a source as a sink: host[:port]
    #[arg(short = 'c', value_name = "HOST[:PORT]", conflicts_with_all = ["uri", "listen"])]
    connect: Option<String>,

    /// Connect to a source as a sink via an rtsp:// URI
    #[arg(short = 'u', value_name = "URI", conflicts_with = "listen")]
    uri: Option<String>,

    /// Start a source listening on [ip[:port]]
    #[arg(short = 'l', value_name = "[IP[:PORT]]", num_args = 0..=1, default_missing_value = "")]
    listen: Option<String>,

    /// Stream a media file instead of the screen
    #[arg(short = 'f', value_name = "PATH")]
    file: Option<String>,

    /// Special/test mode
    #[arg(short = 's')]
    special: bool,
}

fn parse_host_port(value: &str, default_port: u16) -> Option<SocketAddr> {
    if value.is_empty() {
        return Some(SocketAddr::new(IpAddr::from([0, 0, 0, 0]), default_port));
    }

    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr);
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, default_port));
    }
    (value, default_port)
        .to_socket_addrs()
        .ok()?
        .next()
}

fn parse_rtsp_uri(uri: &str) -> Option<SocketAddr> {
    let rest = uri.strip_prefix("rtsp://")?;
    let host = rest.split('/').next()?;
    parse_host_port(host, DEFAULT_RTSP_PORT)
}

/// Stand-in capture and codec plumbing for the command line tool; real
/// integrations plug their compositor and codec engine in through
/// [`MediaComponentFactory`].
struct TestPatternFactory;

struct TestPatternSource {
    frame: u64,
    audio: bool,
}

impl CaptureSource for TestPatternSource {
    fn start(&mut self) -> shared::error::Result<()> {
        Ok(())
    }
    fn stop(&mut self) -> shared::error::Result<()> {
        Ok(())
    }
    fn read(&mut self) -> shared::error::Result<AccessUnit> {
        let interval = if self.audio { 10_000 } else { 33_333 };
        std::thread::sleep(std::time::Duration::from_micros(interval));
        self.frame += 1;
        let data = if self.audio {
            vec![0u8; 1920]
        } else {
            vec![(self.frame & 0xff) as u8; 4096]
        };
        Ok(AccessUnit::new(data.into(), (self.frame * interval) as i64))
    }
}

struct PassthroughEncoder {
    pending: Vec<AccessUnit>,
    csd: Vec<bytes::Bytes>,
    video: bool,
}

impl Encoder for PassthroughEncoder {
    fn queue_input(&mut self, mut unit: AccessUnit) -> shared::error::Result<()> {
        if self.video {
            // Wrap the pattern in a single-NAL Annex-B access unit.
            let mut data = vec![0u8, 0, 0, 1, 0x41];
            data.extend_from_slice(&unit.data);
            unit.data = data.into();
        }
        self.pending.push(unit);
        Ok(())
    }

    fn dequeue_output(&mut self) -> shared::error::Result<Option<AccessUnit>> {
        Ok(if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.remove(0))
        })
    }

    fn codec_specific_data(&self) -> Vec<bytes::Bytes> {
        self.csd.clone()
    }
}

impl MediaComponentFactory for TestPatternFactory {
    fn create_video_source(
        &self,
        _width: u32,
        _height: u32,
        _frame_rate: u32,
    ) -> shared::error::Result<Box<dyn CaptureSource>> {
        Ok(Box::new(TestPatternSource {
            frame: 0,
            audio: false,
        }))
    }

    fn create_audio_source(
        &self,
        _sample_rate: u32,
        _channel_count: u32,
    ) -> shared::error::Result<Box<dyn CaptureSource>> {
        Ok(Box::new(TestPatternSource {
            frame: 0,
            audio: true,
        }))
    }

    fn create_video_encoder(
        &self,
        _width: u32,
        _height: u32,
        _frame_rate: u32,
        _bitrate_bps: u32,
    ) -> shared::error::Result<Box<dyn Encoder>> {
        Ok(Box::new(PassthroughEncoder {
            pending: Vec::new(),
            csd: vec![
                bytes::Bytes::from_static(&[0, 0, 0, 1, 0x67, 0x42, 0xc0, 0x1f]),
                bytes::Bytes::from_static(&[0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80]),
            ],
            video: true,
        }))
    }

    fn create_audio_encoder(
        &self,
        _sample_rate: u32,
        _channel_count: u32,
        _bitrate_bps: u32,
    ) -> shared::error::Result<Box<dyn Encoder>> {
        Ok(Box::new(PassthroughEncoder {
            pending: Vec::new(),
            csd: vec![bytes::Bytes::from_static(&[0x11, 0x90])],
            video: false,
        }))
    }

    fn create_hdcp(
        &self,
        _remote_host: &str,
        _port: u16,
    ) -> shared::error::Result<Option<Box<dyn HdcpEncryptor>>> {
        Ok(None)
    }
}

struct LoggingRenderer;

impl Renderer for LoggingRenderer {
    fn render(&mut self, track_index: usize, unit: AccessUnit) {
        log::debug!(
            "track {track_index}: {} bytes @ {} us",
            unit.data.len(),
            unit.time_us
        );
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let config = Config {
        use_pcm_audio: args.special,
        ..Config::default()
    };
    let net = NetworkSession::new(config.idr_request_compat);

    if let Some(listen) = args.listen.as_deref() {
        let Some(addr) = parse_host_port(listen, DEFAULT_RTSP_PORT) else {
            eprintln!("invalid listen address {listen:?}");
            return ExitCode::from(1);
        };
        if args.file.is_some() {
            log::warn!("file playback ignores the screen capture path");
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let source = match WifiDisplaySource::spawn(
            net,
            config,
            Arc::new(TestPatternFactory),
            addr,
            tx,
        )
        .await
        {
            Ok(source) => source,
            Err(e) => {
                eprintln!("failed to start source: {e}");
                return ExitCode::from(1);
            }
        };

        log::info!("source listening on {addr}");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    source.stop().await;
                    break;
                }
                event = rx.recv() => match event {
                    Some(SourceEvent::SessionEstablished) => log::info!("session established"),
                    Some(SourceEvent::DisplayDisconnected) => log::info!("sink disconnected"),
                    Some(SourceEvent::DisplayError(e)) => log::error!("display error: {e}"),
                    None => break,
                },
            }
        }
        return ExitCode::SUCCESS;
    }

    let source_addr = match (args.connect.as_deref(), args.uri.as_deref()) {
        (Some(host), _) => parse_host_port(host, DEFAULT_RTSP_PORT),
        (None, Some(uri)) => parse_rtsp_uri(uri),
        (None, None) => {
            eprintln!("one of -c, -u or -l is required");
            return ExitCode::from(1);
        }
    };
    let Some(source_addr) = source_addr else {
        eprintln!("invalid source address");
        return ExitCode::from(1);
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = match WifiDisplaySink::connect(
        net,
        config,
        Box::new(LoggingRenderer),
        source_addr,
        tx,
    )
    .await
    {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("failed to connect to {source_addr}: {e}");
            return ExitCode::from(1);
        }
    };

    log::info!("sink connected to {source_addr}");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                sink.stop().await;
                break;
            }
            event = rx.recv() => match event {
                Some(SinkEvent::Playing) => log::info!("playing"),
                Some(SinkEvent::Disconnected) => break,
                Some(SinkEvent::Error(e)) => {
                    log::error!("sink error: {e}");
                }
                None => break,
            },
        }
    }

    ExitCode::SUCCESS
}
