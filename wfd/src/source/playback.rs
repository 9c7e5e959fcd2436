//! The per-client playback session: owns the track pipelines, the media
//! sender and the RTP transport from `SETUP` to `TEARDOWN`.

use crate::config::{Config, VideoBitrateMode};
use crate::media::converter::{Converter, ConverterEvent, FLAG_PREPEND_CSD_IF_NECESSARY};
use crate::media::puller::{MediaPuller, PullerEvent};
use crate::media::repeater::{RepeaterControl, RepeaterSource};
use crate::media::sender::{MediaSender, OutputPacket};
use crate::media::{AccessUnit, MediaComponentFactory};
use crate::session::{NetworkSession, SessionEvent, SessionId};
use bytes::{BufMut, Bytes, BytesMut};
use mpegts::TrackFormat;
use rtcp::app::LatenessReport;
use shared::error::{Error, Result};
use shared::util::pick_random_rtp_port;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;

/// Transport negotiated by the `SETUP` request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransportMode {
    Udp,
    Tcp,
    /// RTP/RTCP ride inline on the RTSP socket as `$0`/`$1` frames.
    TcpInterleaved,
}

/// Events the source FSM consumes from a playback session.
#[derive(Debug)]
pub enum PlaybackSessionEvent {
    SessionDestroyed,
    SessionDead(Error),
    /// An interleaved frame to forward on the RTSP connection.
    BinaryData { channel: u8, data: Bytes },
}

/// Initial repeater cadence; adapted within [5, 30] Hz by sink feedback.
const DEFAULT_REPEAT_RATE_HZ: f64 = 30.0;

const MIN_VIDEO_BITRATE: u32 = 500_000;
const MAX_VIDEO_BITRATE: u32 = 10_000_000;

/// AudioSpecificConfig for AAC-LC 48 kHz stereo, used until the encoder
/// reports its own.
const DEFAULT_AAC_CSD: [u8; 2] = [0x11, 0x90];

enum Cmd {
    Play,
    Pause,
    RequestIdrFrame,
    Teardown,
    /// RTCP that arrived interleaved on the RTSP connection.
    RtcpFrame(Vec<u8>),
}

struct Track {
    puller: MediaPuller,
    converter: Converter,
    repeater: Option<RepeaterControl>,
    is_audio: bool,
    sender_track_index: usize,
    shutdown_complete: bool,
}

/// Handle owned by the source FSM.
pub struct PlaybackSession {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    rtp_port: u16,
    last_lifesign: Arc<Mutex<Instant>>,
}

impl PlaybackSession {
    /// Builds the whole pipeline for one client and spawns the session
    /// actor. Returns once the transport is up, i.e. in time to answer
    /// the `SETUP` with the chosen `server_port`.
    #[allow(clippy::too_many_arguments)]
    pub async fn init(
        net: NetworkSession,
        config: Config,
        factory: Arc<dyn MediaComponentFactory>,
        remote_ip: IpAddr,
        client_rtp: u16,
        client_rtcp: Option<u16>,
        transport: TransportMode,
        video_mode: (u32, u32, u32),
        hdcp_port: Option<u16>,
        notify: mpsc::UnboundedSender<PlaybackSessionEvent>,
    ) -> Result<PlaybackSession> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (puller_tx, puller_rx) = mpsc::unbounded_channel();
        let (converter_tx, converter_rx) = mpsc::unbounded_channel();
        let (net_tx, net_rx) = mpsc::unbounded_channel();

        let mut media_sender = MediaSender::new();
        let mut tracks = Vec::new();

        // Video track: capture -> repeater -> puller -> converter.
        let (width, height, frame_rate) = video_mode;
        {
            let capture = factory.create_video_source(width, height, frame_rate)?;
            let repeat_rate = config
                .force_framerate_hz
                .unwrap_or(DEFAULT_REPEAT_RATE_HZ)
                .clamp(5.0, 30.0);
            let repeater = RepeaterSource::new(capture, repeat_rate);
            let control = repeater.control();

            let encoder = factory.create_video_encoder(
                width,
                height,
                frame_rate,
                config.video_bitrate_bps,
            )?;
            let mut format = TrackFormat::avc(width, height, frame_rate);
            format.csd = encoder.codec_specific_data();

            let track_index = tracks.len();
            let tx = puller_tx.clone();
            let (event_tx, mut event_rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    if tx.send((track_index, event)).is_err() {
                        break;
                    }
                }
            });
            let puller = MediaPuller::new(Box::new(repeater), event_tx, "video");

            let tx = converter_tx.clone();
            let (conv_tx, mut conv_rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                while let Some(event) = conv_rx.recv().await {
                    if tx.send((track_index, event)).is_err() {
                        break;
                    }
                }
            });
            let converter = Converter::spawn(
                Some(encoder),
                false,
                FLAG_PREPEND_CSD_IF_NECESSARY,
                config.video_bitrate_bps,
                conv_tx,
            );

            let sender_track_index = media_sender.add_track(format, 0)?;
            tracks.push(Track {
                puller,
                converter,
                repeater: Some(control),
                is_audio: false,
                sender_track_index,
                shutdown_complete: false,
            });
        }

        // Audio track: capture -> puller -> converter (or the raw LPCM
        // path when PCM audio is negotiated).
        {
            let capture = factory.create_audio_source(48_000, 2)?;

            let (encoder, format) = if config.use_pcm_audio {
                (None, TrackFormat::lpcm(2, 48_000))
            } else {
                let encoder =
                    factory.create_audio_encoder(48_000, 2, config.audio_bitrate_bps)?;
                let mut csd = encoder.codec_specific_data();
                if csd.is_empty() {
                    csd = vec![Bytes::copy_from_slice(&DEFAULT_AAC_CSD)];
                }
                (Some(encoder), TrackFormat::aac(2, 48_000).with_csd(csd))
            };

            let track_index = tracks.len();
            let tx = puller_tx.clone();
            let (event_tx, mut event_rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    if tx.send((track_index, event)).is_err() {
                        break;
                    }
                }
            });
            let puller = MediaPuller::new(capture, event_tx, "audio");

            let tx = converter_tx.clone();
            let (conv_tx, mut conv_rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                while let Some(event) = conv_rx.recv().await {
                    if tx.send((track_index, event)).is_err() {
                        break;
                    }
                }
            });
            let converter = Converter::spawn(encoder, true, 0, 0, conv_tx);

            let sender_track_index = media_sender.add_track(format, 0)?;
            tracks.push(Track {
                puller,
                converter,
                repeater: None,
                is_audio: true,
                sender_track_index,
                shutdown_complete: false,
            });
        }

        if let Some(port) = hdcp_port {
            if let Some(hdcp) = factory.create_hdcp(&remote_ip.to_string(), port)? {
                media_sender.set_hdcp(hdcp)?;
            }
        }

        // All tracks mux into one transport stream on a single channel.
        media_sender.init_transport_stream()?;

        // Wire up the negotiated transport.
        let (rtp_session, rtcp_session, rtp_port) = match transport {
            TransportMode::Udp => {
                let mut attempts = 0;
                loop {
                    let port = pick_random_rtp_port();
                    let rtp_remote = SocketAddr::new(remote_ip, client_rtp);
                    let rtp = match net
                        .create_udp_session(port, Some(rtp_remote), net_tx.clone())
                        .await
                    {
                        Ok((id, _)) => id,
                        Err(_) if attempts < 10 => {
                            attempts += 1;
                            continue;
                        }
                        Err(e) => return Err(e),
                    };

                    let rtcp = match client_rtcp {
                        None => None,
                        Some(rtcp_port) => {
                            let rtcp_remote = SocketAddr::new(remote_ip, rtcp_port);
                            match net
                                .create_udp_session(port + 1, Some(rtcp_remote), net_tx.clone())
                                .await
                            {
                                Ok((id, _)) => Some(id),
                                Err(_) if attempts < 10 => {
                                    net.destroy_session(rtp);
                                    attempts += 1;
                                    continue;
                                }
                                Err(e) => {
                                    net.destroy_session(rtp);
                                    return Err(e);
                                }
                            }
                        }
                    };

                    break (Some(rtp), rtcp, port);
                }
            }
            TransportMode::Tcp => {
                let rtp = net
                    .create_tcp_datagram_session_active(
                        SocketAddr::new(remote_ip, client_rtp),
                        net_tx.clone(),
                    )
                    .await?;
                let rtcp = match client_rtcp {
                    None => None,
                    Some(port) => Some(
                        net.create_tcp_datagram_session_active(
                            SocketAddr::new(remote_ip, port),
                            net_tx.clone(),
                        )
                        .await?,
                    ),
                };
                (Some(rtp), rtcp, client_rtp)
            }
            TransportMode::TcpInterleaved => (None, None, client_rtp),
        };

        let last_lifesign = Arc::new(Mutex::new(Instant::now()));

        let actor = SessionActor {
            net,
            config,
            media_sender,
            tracks,
            rtp_session,
            rtcp_session,
            transport,
            notify,
            epoch: Instant::now(),
            tearing_down: false,
            _net_tx: net_tx,
        };
        tokio::spawn(actor.run(cmd_rx, puller_rx, converter_rx, net_rx));

        Ok(PlaybackSession {
            cmd_tx,
            rtp_port,
            last_lifesign,
        })
    }

    pub fn rtp_port(&self) -> u16 {
        self.rtp_port
    }

    pub fn play(&self) {
        let _ = self.cmd_tx.send(Cmd::Play);
    }

    pub fn pause(&self) {
        let _ = self.cmd_tx.send(Cmd::Pause);
    }

    pub fn request_idr_frame(&self) {
        let _ = self.cmd_tx.send(Cmd::RequestIdrFrame);
    }

    /// Asynchronous teardown: the actor emits `SessionDestroyed` once all
    /// converters acknowledged shutdown.
    pub fn destroy_async(&self) {
        let _ = self.cmd_tx.send(Cmd::Teardown);
    }

    /// Feeds RTCP received as an interleaved `$1` frame.
    pub fn handle_rtcp_frame(&self, data: Vec<u8>) {
        let _ = self.cmd_tx.send(Cmd::RtcpFrame(data));
    }

    pub fn update_liveness(&self) {
        *self.last_lifesign.lock().unwrap() = Instant::now();
    }

    pub fn time_since_lifesign(&self) -> std::time::Duration {
        self.last_lifesign.lock().unwrap().elapsed()
    }
}

struct SessionActor {
    net: NetworkSession,
    config: Config,
    media_sender: MediaSender,
    tracks: Vec<Track>,
    rtp_session: Option<SessionId>,
    rtcp_session: Option<SessionId>,
    transport: TransportMode,
    notify: mpsc::UnboundedSender<PlaybackSessionEvent>,
    epoch: Instant,
    tearing_down: bool,
    /// Keeps the media sessions' event channel open for the actor's
    /// lifetime, including the socketless interleaved mode.
    _net_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
        mut puller_rx: mpsc::UnboundedReceiver<(usize, PullerEvent)>,
        mut converter_rx: mpsc::UnboundedReceiver<(usize, ConverterEvent)>,
        mut net_rx: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Cmd::Play) => {
                        for track in &self.tracks {
                            if let Some(repeater) = &track.repeater {
                                repeater.wake_up();
                            }
                            track.puller.start();
                            track.puller.resume();
                        }
                    }
                    Some(Cmd::Pause) => {
                        for track in &self.tracks {
                            track.puller.pause();
                        }
                    }
                    Some(Cmd::RequestIdrFrame) => {
                        for track in &self.tracks {
                            if !track.is_audio {
                                track.converter.request_idr_frame();
                            }
                        }
                    }
                    Some(Cmd::RtcpFrame(data)) => {
                        match self.media_sender.handle_rtcp(None, &data) {
                            Ok((retransmissions, lateness)) => {
                                self.send_packets(retransmissions);
                                if let Some(report) = lateness {
                                    self.on_sink_feedback(report);
                                }
                            }
                            Err(e) => log::debug!("bad interleaved RTCP frame: {e}"),
                        }
                    }
                    Some(Cmd::Teardown) => {
                        self.tearing_down = true;
                        for track in &self.tracks {
                            if let Some(repeater) = &track.repeater {
                                repeater.shutdown();
                            }
                            let _ = track.puller.stop_async();
                            track.converter.shutdown_async();
                        }
                    }
                    None => break,
                },

                pulled = puller_rx.recv() => match pulled {
                    Some((track_index, PullerEvent::AccessUnit(unit))) => {
                        self.tracks[track_index].converter.feed(unit);
                    }
                    Some((track_index, PullerEvent::Eos)) => {
                        self.tracks[track_index].converter.feed_eos();
                    }
                    Some((_, PullerEvent::Error(e))) => {
                        if !self.tearing_down {
                            self.fail(e);
                            break;
                        }
                    }
                    None => break,
                },

                converted = converter_rx.recv() => match converted {
                    Some((track_index, event)) => {
                        if !self.on_converter_event(track_index, event) {
                            break;
                        }
                    }
                    None => break,
                },

                event = net_rx.recv() => match event {
                    Some(event) => {
                        if !self.on_net_event(event) {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        // Whatever path ended the loop, unblock the capture threads and
        // release the transport and the protection module.
        for track in &self.tracks {
            if let Some(repeater) = &track.repeater {
                repeater.shutdown();
            }
            let _ = track.puller.stop_async();
        }
        self.media_sender.shutdown();
        if let Some(id) = self.rtp_session.take() {
            self.net.destroy_session(id);
        }
        if let Some(id) = self.rtcp_session.take() {
            self.net.destroy_session(id);
        }
    }

    /// Returns false when the actor should exit.
    fn on_converter_event(&mut self, track_index: usize, event: ConverterEvent) -> bool {
        match event {
            ConverterEvent::AccessUnit(unit) => {
                if self.tearing_down {
                    return true;
                }
                let now_us = self.epoch.elapsed().as_micros() as i64;
                let sender_track = self.tracks[track_index].sender_track_index;
                match self
                    .media_sender
                    .queue_access_unit(sender_track, unit, now_us)
                {
                    Ok(packets) => self.send_packets(packets),
                    Err(e) => {
                        self.fail(e);
                        return false;
                    }
                }
                true
            }
            ConverterEvent::Eos => true,
            ConverterEvent::Error(e) => {
                self.fail(e);
                false
            }
            ConverterEvent::ShutdownCompleted => {
                self.tracks[track_index].shutdown_complete = true;
                if self.tracks.iter().all(|t| t.shutdown_complete) {
                    let _ = self.notify.send(PlaybackSessionEvent::SessionDestroyed);
                    return false;
                }
                true
            }
        }
    }

    fn on_net_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Datagram { session_id, datagram } => {
                if Some(session_id) == self.rtcp_session {
                    match self.media_sender.handle_rtcp(None, &datagram.payload) {
                        Ok((retransmissions, lateness)) => {
                            self.send_packets(retransmissions);
                            if let Some(report) = lateness {
                                self.on_sink_feedback(report);
                            }
                        }
                        Err(e) => log::debug!("bad RTCP datagram: {e}"),
                    }
                }
                true
            }
            SessionEvent::Error { error, .. } => {
                if self.tearing_down {
                    return true;
                }
                self.fail(error);
                false
            }
            SessionEvent::NetworkStall { num_bytes_queued, .. } => {
                log::warn!("network stalled with {num_bytes_queued} bytes queued");
                // Relieve pressure by dropping a video frame.
                for track in &self.tracks {
                    if !track.is_audio {
                        track.converter.drop_a_frame();
                    }
                }
                true
            }
            _ => true,
        }
    }

    fn send_packets(&self, packets: Vec<OutputPacket>) {
        for packet in packets {
            match self.transport {
                TransportMode::TcpInterleaved => {
                    // RTP on channel 0; RTCP would be channel 1.
                    let mut framed = BytesMut::with_capacity(4 + packet.data.len());
                    framed.put_u8(b'$');
                    framed.put_u8(0);
                    framed.put_u16(packet.data.len() as u16);
                    framed.extend_from_slice(&packet.data);
                    let _ = self.notify.send(PlaybackSessionEvent::BinaryData {
                        channel: 0,
                        data: framed.freeze(),
                    });
                }
                _ => {
                    if let Some(id) = self.rtp_session {
                        if let Err(e) = self.net.send_request(id, packet.data) {
                            log::warn!("dropping RTP packet: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Scales the video bitrate and the repeater frame rate off the
    /// sink's reported latency.
    fn on_sink_feedback(&mut self, report: LatenessReport) {
        let avg = report.avg_latency_us;
        log::info!(
            "sink reports avg. latency of {} ms (max {} ms)",
            avg / 1000,
            report.max_latency_us / 1000
        );

        let video = self.tracks.iter().find(|t| !t.is_audio);
        let Some(video) = video else { return };

        if self.config.video_bitrate_mode == VideoBitrateMode::Adaptive {
            let mut bitrate = video.converter.video_bitrate() as f64;
            if avg > 300_000 {
                bitrate *= 0.6;
            } else if avg < 100_000 {
                bitrate *= 1.1;
            }
            let bitrate = (bitrate as u32).clamp(MIN_VIDEO_BITRATE, MAX_VIDEO_BITRATE);
            if bitrate != video.converter.video_bitrate() {
                log::info!("setting video bitrate to {bitrate} bps");
                video.converter.set_video_bitrate(bitrate);
            }

            if let Some(repeater) = &video.repeater {
                let mut rate = repeater.frame_rate();
                if avg > 300_000 {
                    rate *= 0.9;
                } else if avg < 200_000 {
                    rate *= 1.1;
                }
                let rate = rate.clamp(5.0, 30.0);
                if rate != repeater.frame_rate() {
                    log::info!("setting frame rate to {rate:.2} Hz");
                    repeater.set_frame_rate(rate);
                }
            }
        }
    }

    fn fail(&mut self, error: Error) {
        log::error!("playback session failed: {error}");
        let _ = self.notify.send(PlaybackSessionEvent::SessionDead(error));
    }
}
