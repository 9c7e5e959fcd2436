//! The Wi-Fi Display source: listens for one sink on the RTSP port,
//! drives the M1..M16 negotiation and owns the playback session.

pub mod playback;

pub use playback::{PlaybackSession, PlaybackSessionEvent, TransportMode};

use crate::config::Config;
use crate::media::MediaComponentFactory;
use crate::session::{NetworkSession, SessionEvent, SessionId};
use bytes::Bytes;
use rtsp::video_formats::{LevelType, ProfileType, ResolutionType};
use rtsp::{
    append_common_response, audio_codecs, error_response, ParsedMessage, Parameters,
    VideoFormats, PLAYBACK_SESSION_TIMEOUT_SECS, PUBLIC_METHODS, WFD_REQUIRE,
};
use shared::error::{Error, Result};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Liveness reaper cadence.
const REAPER_INTERVAL: Duration = Duration::from_secs(1);
/// Keep-alive requests go out this long before the session would time
/// out.
const KEEPALIVE_MARGIN: Duration = Duration::from_secs(5);
/// An unanswered TEARDOWN trigger forces a disconnect after this long.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// The source half of the RTSP negotiation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum State {
    Initialized,
    AwaitingClientConnection,
    AwaitingClientSetup,
    AwaitingClientPlay,
    AboutToPlay,
    Playing,
    PlayingToPaused,
    Paused,
    PausedToPlaying,
    AwaitingClientTeardown,
    Stopping,
    Stopped,
}

/// What a registered response handler does with the sink's answer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ResponseKind {
    M1,
    M3,
    M4,
    Trigger,
    KeepAlive,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TriggerType {
    Setup,
    Play,
    Pause,
    Teardown,
}

/// Events surfaced to the embedding application.
#[derive(Debug)]
pub enum SourceEvent {
    /// A sink connected and completed SETUP.
    SessionEstablished,
    /// The client went away (normal teardown or liveness timeout).
    DisplayDisconnected,
    /// A fatal error; the client has been disconnected.
    DisplayError(Error),
}

enum Cmd {
    Pause,
    Resume,
    Stop(oneshot::Sender<()>),
}

/// Handle to a running source.
pub struct WifiDisplaySource {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
}

impl WifiDisplaySource {
    /// Binds the RTSP listener and spawns the source actor.
    pub async fn spawn(
        net: NetworkSession,
        config: Config,
        factory: Arc<dyn MediaComponentFactory>,
        listen_addr: SocketAddr,
        notify: mpsc::UnboundedSender<SourceEvent>,
    ) -> Result<WifiDisplaySource> {
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let listener_id = net.create_rtsp_server(listen_addr, session_tx).await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let mut supported_formats = VideoFormats::new();
        supported_formats.disable_all();
        let (resolution_type, index) = if config.prefer_1080p {
            (ResolutionType::Cea, 7) // 1080p30
        } else {
            (ResolutionType::Cea, 5) // 720p30
        };
        supported_formats.set_resolution_enabled(resolution_type, index, true);
        supported_formats.set_native_resolution(resolution_type, index);
        if !config.force_baseline_profile {
            supported_formats.set_profile_level(
                resolution_type,
                index,
                ProfileType::ConstrainedHigh,
                LevelType::L32,
            );
        }

        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let actor = SourceActor {
            net,
            config,
            factory,
            notify,
            state: State::AwaitingClientConnection,
            listener_id,
            client: None,
            next_cseq: 1,
            pending_responses: HashMap::new(),
            supported_formats,
            sink_formats: None,
            chosen_video_mode: None,
            using_pcm_audio: false,
            sink_hdcp: audio_codecs::ContentProtection::None,
            playback_tx,
            next_keepalive: None,
            teardown_deadline: None,
            stop_reply: None,
        };
        tokio::spawn(actor.run(session_rx, cmd_rx, playback_rx));

        Ok(WifiDisplaySource { cmd_tx })
    }

    /// Triggers a PAUSE on the sink.
    pub fn pause(&self) {
        let _ = self.cmd_tx.send(Cmd::Pause);
    }

    /// Triggers a PLAY on a paused sink.
    pub fn resume(&self) {
        let _ = self.cmd_tx.send(Cmd::Resume);
    }

    /// Orderly shutdown: triggers TEARDOWN and resolves once the client
    /// is fully disconnected.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

struct ClientInfo {
    session_id: SessionId,
    remote_ip: IpAddr,
    local_ip: IpAddr,
    playback_session_id: Option<i32>,
    playback_session: Option<PlaybackSession>,
}

struct SourceActor {
    net: NetworkSession,
    config: Config,
    factory: Arc<dyn MediaComponentFactory>,
    notify: mpsc::UnboundedSender<SourceEvent>,

    state: State,
    listener_id: SessionId,
    client: Option<ClientInfo>,

    next_cseq: i32,
    pending_responses: HashMap<(SessionId, i32), ResponseKind>,

    supported_formats: VideoFormats,
    sink_formats: Option<VideoFormats>,
    chosen_video_mode: Option<(u32, u32, u32)>,
    using_pcm_audio: bool,
    sink_hdcp: audio_codecs::ContentProtection,

    /// All playback sessions (one client at a time) report through this
    /// single channel; the receiving half lives in `run`.
    playback_tx: mpsc::UnboundedSender<PlaybackSessionEvent>,

    next_keepalive: Option<Instant>,
    teardown_deadline: Option<Instant>,
    stop_reply: Option<oneshot::Sender<()>>,
}

impl SourceActor {
    async fn run(
        mut self,
        mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
        mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
        mut playback_rx: mpsc::UnboundedReceiver<PlaybackSessionEvent>,
    ) {
        let mut reaper = tokio::time::interval(REAPER_INTERVAL);
        reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.state != State::Stopped {
            tokio::select! {
                event = session_rx.recv() => match event {
                    Some(event) => self.on_session_event(event).await,
                    None => break,
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_cmd(cmd),
                    None => break,
                },
                event = playback_rx.recv() => match event {
                    Some(event) => self.on_playback_event(event),
                    None => break,
                },
                _ = reaper.tick() => self.on_tick(),
            }
        }
    }

    fn on_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Pause => {
                if self.state == State::Playing {
                    self.state = State::PlayingToPaused;
                    self.send_trigger(TriggerType::Pause);
                }
            }
            Cmd::Resume => {
                if self.state == State::Paused {
                    self.state = State::PausedToPlaying;
                    self.send_trigger(TriggerType::Play);
                }
            }
            Cmd::Stop(reply) => {
                assert!(self.state < State::AwaitingClientTeardown);
                self.stop_reply = Some(reply);

                if self.state >= State::AwaitingClientPlay {
                    // A previous SETUP succeeded; ask the sink to tear the
                    // session down and give it two seconds to comply.
                    log::info!("Sending TEARDOWN trigger.");
                    self.state = State::AwaitingClientTeardown;
                    self.send_trigger(TriggerType::Teardown);
                    self.teardown_deadline = Some(Instant::now() + TEARDOWN_TIMEOUT);
                } else {
                    self.finish_stop();
                }
            }
        }
    }

    fn on_tick(&mut self) {
        if let Some(deadline) = self.teardown_deadline {
            if deadline <= Instant::now() && self.state == State::AwaitingClientTeardown {
                log::info!("TEARDOWN trigger timed out, forcing disconnection.");
                self.teardown_deadline = None;
                self.finish_stop();
                return;
            }
        }

        if let Some(next) = self.next_keepalive {
            if next <= Instant::now() {
                self.send_m16();
            }
        }

        // Reap a client that stopped talking to us.
        let timed_out = self
            .client
            .as_ref()
            .and_then(|c| c.playback_session.as_ref())
            .map(|p| {
                p.time_since_lifesign()
                    > Duration::from_secs(PLAYBACK_SESSION_TIMEOUT_SECS)
            })
            .unwrap_or(false);
        if timed_out {
            log::warn!("playback session timed out, reaping");
            self.disconnect_client(Some(Error::ErrKeepAliveTimeout));
        }
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::ClientConnected {
                session_id,
                listener_id,
                local,
                remote,
            } => {
                if listener_id != self.listener_id {
                    return;
                }
                if self.client.is_some() {
                    // One sink at a time.
                    log::warn!("rejecting second client {remote}");
                    self.net.destroy_session(session_id);
                    return;
                }

                log::info!("sink connected from {remote}");
                self.client = Some(ClientInfo {
                    session_id,
                    remote_ip: remote.ip(),
                    local_ip: local.ip(),
                    playback_session_id: None,
                    playback_session: None,
                });

                self.state = State::AwaitingClientSetup;
                self.send_m1();
            }
            SessionEvent::Data {
                session_id,
                message,
            } => {
                if Some(session_id) != self.client.as_ref().map(|c| c.session_id) {
                    return;
                }
                if message.request_line().is_some() {
                    self.on_client_request(session_id, &message).await;
                } else {
                    self.on_client_response(session_id, &message);
                }
            }
            SessionEvent::BinaryData { channel, data, .. } => {
                // RTCP rides on channel 1 in the interleaved transport.
                if channel == 1 {
                    if let Some(playback) = self
                        .client
                        .as_ref()
                        .and_then(|c| c.playback_session.as_ref())
                    {
                        playback.handle_rtcp_frame(data);
                    }
                } else {
                    log::debug!("ignoring interleaved data on channel {channel}");
                }
            }
            SessionEvent::Error {
                session_id, error, ..
            } => {
                if Some(session_id) == self.client.as_ref().map(|c| c.session_id) {
                    log::error!("client session failed: {error}");
                    self.disconnect_client(Some(error));
                } else if session_id == self.listener_id {
                    let _ = self.notify.send(SourceEvent::DisplayError(error));
                    self.state = State::Stopped;
                }
            }
            SessionEvent::NetworkStall {
                num_bytes_queued, ..
            } => {
                log::warn!("RTSP session stalling, {num_bytes_queued} bytes queued");
            }
            _ => {}
        }
    }

    fn on_playback_event(&mut self, event: PlaybackSessionEvent) {
        match event {
            PlaybackSessionEvent::SessionDestroyed => {
                if let Some(client) = self.client.as_mut() {
                    client.playback_session = None;
                    client.playback_session_id = None;
                }
                self.next_keepalive = None;

                if self.state == State::Stopping || self.stop_reply.is_some() {
                    self.disconnect_client2();
                } else {
                    self.disconnect_client(None);
                }
            }
            PlaybackSessionEvent::SessionDead(error) => {
                // The session actor is already winding itself down; do not
                // wait for a destruction notice that will not come.
                log::error!("playback session died: {error}");
                if let Some(client) = self.client.as_mut() {
                    client.playback_session = None;
                    client.playback_session_id = None;
                }
                self.next_keepalive = None;
                self.disconnect_client(Some(error));
            }
            PlaybackSessionEvent::BinaryData { data, .. } => {
                if let Some(client) = self.client.as_ref() {
                    let _ = self.net.send_request(client.session_id, data);
                }
            }
        }
    }

    //------------------------------------------------------------------
    // Outbound requests

    fn allocate_cseq(&mut self) -> i32 {
        let cseq = self.next_cseq;
        self.next_cseq += 1;
        cseq
    }

    fn send_request(
        &mut self,
        session_id: SessionId,
        cseq: i32,
        request: String,
        kind: ResponseKind,
    ) {
        if self
            .net
            .send_request(session_id, Bytes::from(request))
            .is_ok()
        {
            self.pending_responses.insert((session_id, cseq), kind);
        }
    }

    fn send_m1(&mut self) {
        let Some(client) = self.client.as_ref() else { return };
        let session_id = client.session_id;
        let cseq = self.allocate_cseq();

        let mut request = String::from("OPTIONS * RTSP/1.0\r\n");
        append_common_response(&mut request, cseq, None);
        request.push_str(&format!("Require: {WFD_REQUIRE}\r\n"));
        request.push_str("\r\n");

        self.send_request(session_id, cseq, request, ResponseKind::M1);
    }

    fn send_m3(&mut self) {
        let Some(client) = self.client.as_ref() else { return };
        let session_id = client.session_id;

        let body = "wfd_content_protection\r\n\
                    wfd_video_formats\r\n\
                    wfd_audio_codecs\r\n\
                    wfd_client_rtp_ports\r\n";

        let cseq = self.allocate_cseq();
        let mut request = String::from("GET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\r\n");
        append_common_response(&mut request, cseq, None);
        request.push_str("Content-Type: text/parameters\r\n");
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
        request.push_str("\r\n");
        request.push_str(body);

        self.send_request(session_id, cseq, request, ResponseKind::M3);
    }

    fn send_m4(&mut self, chosen_rtp_port: u16) {
        let Some(client) = self.client.as_ref() else { return };
        let session_id = client.session_id;
        let local_ip = client.local_ip;

        let transport = if self.config.use_tcp_transport {
            "TCP"
        } else {
            "UDP"
        };

        let body = format!(
            "wfd_video_formats: {}\r\n\
             wfd_audio_codecs: {}\r\n\
             wfd_presentation_URL: rtsp://{}/wfd1.0/streamid=0 none\r\n\
             wfd_client_rtp_ports: RTP/AVP/{};unicast {} 0 mode=play\r\n",
            self.supported_formats.format_spec(true),
            audio_codecs::audio_codec_spec(self.using_pcm_audio),
            local_ip,
            transport,
            chosen_rtp_port,
        );

        let cseq = self.allocate_cseq();
        let mut request = String::from("SET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\r\n");
        append_common_response(&mut request, cseq, None);
        request.push_str("Content-Type: text/parameters\r\n");
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
        request.push_str("\r\n");
        request.push_str(&body);

        self.send_request(session_id, cseq, request, ResponseKind::M4);
    }

    fn send_trigger(&mut self, trigger: TriggerType) {
        let Some(client) = self.client.as_ref() else { return };
        let session_id = client.session_id;

        let method = match trigger {
            TriggerType::Setup => "SETUP",
            TriggerType::Play => "PLAY",
            TriggerType::Pause => "PAUSE",
            TriggerType::Teardown => "TEARDOWN",
        };
        let body = format!("wfd_trigger_method: {method}\r\n");

        let cseq = self.allocate_cseq();
        let mut request = String::from("SET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\r\n");
        append_common_response(&mut request, cseq, None);
        request.push_str("Content-Type: text/parameters\r\n");
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
        request.push_str("\r\n");
        request.push_str(&body);

        self.send_request(session_id, cseq, request, ResponseKind::Trigger);
    }

    fn send_m16(&mut self) {
        let Some(client) = self.client.as_ref() else { return };
        let Some(playback_session_id) = client.playback_session_id else {
            return;
        };
        let session_id = client.session_id;

        let cseq = self.allocate_cseq();
        let mut request = String::from("GET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\r\n");
        append_common_response(&mut request, cseq, None);
        request.push_str(&format!("Session: {playback_session_id}\r\n"));
        request.push_str("\r\n");

        self.send_request(session_id, cseq, request, ResponseKind::KeepAlive);
        self.next_keepalive = Some(
            Instant::now() + Duration::from_secs(PLAYBACK_SESSION_TIMEOUT_SECS)
                - KEEPALIVE_MARGIN,
        );
    }

    //------------------------------------------------------------------
    // Inbound responses

    fn on_client_response(&mut self, session_id: SessionId, message: &ParsedMessage) {
        let Some(cseq) = message.find_i32("cseq") else {
            log::warn!("response without CSeq, dropping");
            return;
        };

        let Some(kind) = self.pending_responses.remove(&(session_id, cseq)) else {
            log::warn!("response with unmatched cseq {cseq}, dropping");
            return;
        };

        let status = message.status_code().unwrap_or(0);
        if status != 200 {
            log::error!("request (cseq {cseq}) failed with status {status}");
            if kind != ResponseKind::KeepAlive {
                self.disconnect_client(Some(Error::ErrRtspStatus(status)));
            }
            return;
        }

        match kind {
            ResponseKind::M1 => {
                // The sink now issues its own OPTIONS (M2); negotiation
                // continues when it arrives.
            }
            ResponseKind::M3 => {
                if let Err(e) = self.on_m3_response(message) {
                    log::error!("bad M3 response: {e}");
                    self.disconnect_client(Some(e));
                }
            }
            ResponseKind::M4 => {
                self.send_trigger(TriggerType::Setup);
            }
            ResponseKind::KeepAlive => {
                // A sink that still answers our keep-alives is alive, even
                // if it never originates requests of its own.
                self.update_liveness();
            }
            ResponseKind::Trigger => {}
        }
    }

    fn on_m3_response(&mut self, message: &ParsedMessage) -> Result<()> {
        let params = Parameters::parse(message.content())?;

        let value = params
            .find("wfd_client_rtp_ports")
            .ok_or(Error::ErrMalformedParameters)?;
        let chosen_rtp_port = parse_client_rtp_ports(value)?;

        let audio = params
            .find("wfd_audio_codecs")
            .ok_or(Error::ErrMalformedParameters)?;
        let codecs = audio_codecs::parse_audio_codecs(audio)?;
        let supports_aac = codecs
            .iter()
            .any(|c| c.kind == audio_codecs::AudioCodecKind::Aac && c.modes & 1 != 0);
        self.using_pcm_audio = self.config.use_pcm_audio || !supports_aac;

        let video = params
            .find("wfd_video_formats")
            .ok_or(Error::ErrMalformedParameters)?;
        let mut sink_formats = VideoFormats::new();
        if video.trim() != "none" {
            sink_formats.parse_format_spec(video)?;
        }

        let (chosen_type, chosen_index, _profile, _level) =
            VideoFormats::pick_best_format(&sink_formats, &self.supported_formats)?;
        let (width, height, frame_rate, _interlaced) =
            VideoFormats::get_configuration(chosen_type, chosen_index)
                .ok_or(Error::ErrNoCommonVideoFormat)?;

        let (width, height) = self.config.force_resolution.unwrap_or((width, height));
        self.chosen_video_mode = Some((width, height, frame_rate));
        self.sink_formats = Some(sink_formats);

        if let Some(value) = params.find("wfd_content_protection") {
            self.sink_hdcp = audio_codecs::parse_content_protection(value)?;
        }

        self.send_m4(chosen_rtp_port);
        Ok(())
    }

    //------------------------------------------------------------------
    // Inbound requests

    async fn on_client_request(&mut self, session_id: SessionId, message: &ParsedMessage) {
        let Some(cseq) = message.find_i32("cseq") else {
            self.send_error_response(session_id, "400 Bad Request", -1);
            return;
        };

        let (method, uri, version) = message.request_line().unwrap();
        if version != "RTSP/1.0" {
            self.send_error_response(session_id, "505 RTSP Version not supported", cseq);
            return;
        }
        let method = method.to_owned();
        let uri = uri.to_owned();

        match method.as_str() {
            "OPTIONS" => self.on_options_request(session_id, cseq, message),
            "SETUP" => self.on_setup_request(session_id, cseq, &uri, message).await,
            "PLAY" => self.on_play_request(session_id, cseq, message),
            "PAUSE" => self.on_pause_request(session_id, cseq, message),
            "TEARDOWN" => self.on_teardown_request(session_id, cseq, message),
            "GET_PARAMETER" => self.on_get_parameter_request(session_id, cseq, message),
            "SET_PARAMETER" => self.on_set_parameter_request(session_id, cseq, message),
            _ => {
                self.send_error_response(session_id, "405 Method Not Allowed", cseq);
            }
        }
    }

    fn on_options_request(
        &mut self,
        session_id: SessionId,
        cseq: i32,
        message: &ParsedMessage,
    ) {
        self.update_liveness();

        let mut response = String::from("RTSP/1.0 200 OK\r\n");
        append_common_response(&mut response, cseq, None);
        response.push_str(&format!("Public: {PUBLIC_METHODS}\r\n"));
        response.push_str("\r\n");

        if self
            .net
            .send_request(session_id, Bytes::from(response))
            .is_ok()
        {
            // The sink's OPTIONS completes M2; capability query follows.
            self.send_m3();
        }
    }

    async fn on_setup_request(
        &mut self,
        session_id: SessionId,
        cseq: i32,
        uri: &str,
        message: &ParsedMessage,
    ) {
        let Some(client) = self.client.as_ref() else { return };
        if client.playback_session_id.is_some() {
            // We only support a single playback session per client; this
            // is forced by the reversed keep-alive design of the protocol.
            self.send_error_response(session_id, "400 Bad Request", cseq);
            return;
        }

        let Some(transport) = message.find_string("transport").map(str::to_owned) else {
            self.send_error_response(session_id, "400 Bad Request", cseq);
            return;
        };

        let parsed = match parse_transport(&transport) {
            Ok(parsed) => parsed,
            Err(Error::ErrUnsupportedTransport) => {
                self.send_error_response(session_id, "461 Unsupported Transport", cseq);
                return;
            }
            Err(_) => {
                self.send_error_response(session_id, "400 Bad Request", cseq);
                return;
            }
        };

        if !(uri.starts_with("rtsp://") && uri.ends_with("/wfd1.0/streamid=0")) {
            self.send_error_response(session_id, "404 Not Found", cseq);
            return;
        }

        let remote_ip = client.remote_ip;
        let video_mode = self.chosen_video_mode.unwrap_or((1280, 720, 30));

        let mut config = self.config.clone();
        config.use_pcm_audio = self.using_pcm_audio;

        let hdcp_port = match self.sink_hdcp {
            audio_codecs::ContentProtection::None => None,
            audio_codecs::ContentProtection::Hdcp20 { port }
            | audio_codecs::ContentProtection::Hdcp21 { port } => Some(port),
        };

        let playback = match PlaybackSession::init(
            self.net.clone(),
            config,
            self.factory.clone(),
            remote_ip,
            parsed.client_rtp,
            parsed.client_rtcp,
            parsed.mode,
            video_mode,
            hdcp_port,
            self.playback_tx.clone(),
        )
        .await
        {
            Ok(playback) => playback,
            Err(e) => {
                log::error!("failed to set up playback session: {e}");
                self.send_error_response(session_id, "403 Forbidden", cseq);
                return;
            }
        };

        let playback_session_id = (rand::random::<u32>() & 0x7fff_ffff) as i32;
        let server_rtp = playback.rtp_port();

        let client = self.client.as_mut().unwrap();
        client.playback_session_id = Some(playback_session_id);
        client.playback_session = Some(playback);

        let mut response = String::from("RTSP/1.0 200 OK\r\n");
        append_common_response(&mut response, cseq, Some(playback_session_id));

        match parsed.mode {
            TransportMode::TcpInterleaved => {
                response.push_str(&format!(
                    "Transport: RTP/AVP/TCP;interleaved={}-{}\r\n",
                    parsed.client_rtp,
                    parsed.client_rtcp.unwrap_or(parsed.client_rtp + 1),
                ));
            }
            mode => {
                let transport = if mode == TransportMode::Tcp { "TCP" } else { "UDP" };
                match parsed.client_rtcp {
                    Some(client_rtcp) => response.push_str(&format!(
                        "Transport: RTP/AVP/{};unicast;client_port={}-{};\
                         server_port={}-{}\r\n",
                        transport,
                        parsed.client_rtp,
                        client_rtcp,
                        server_rtp,
                        server_rtp + 1,
                    )),
                    None => response.push_str(&format!(
                        "Transport: RTP/AVP/{};unicast;client_port={};server_port={}\r\n",
                        transport, parsed.client_rtp, server_rtp,
                    )),
                }
            }
        }
        response.push_str("\r\n");

        if self
            .net
            .send_request(session_id, Bytes::from(response))
            .is_err()
        {
            return;
        }

        self.state = State::AwaitingClientPlay;
        self.next_keepalive = Some(
            Instant::now() + Duration::from_secs(PLAYBACK_SESSION_TIMEOUT_SECS)
                - KEEPALIVE_MARGIN,
        );
    }

    fn on_play_request(&mut self, session_id: SessionId, cseq: i32, message: &ParsedMessage) {
        let Some(playback_session_id) = self.find_playback_session(message) else {
            self.send_error_response(session_id, "454 Session Not Found", cseq);
            return;
        };

        log::info!("Received PLAY request.");
        if !matches!(
            self.state,
            State::AwaitingClientPlay | State::PausedToPlaying
        ) {
            self.send_error_response(session_id, "405 Method Not Allowed", cseq);
            return;
        }

        if let Some(playback) = self
            .client
            .as_ref()
            .and_then(|c| c.playback_session.as_ref())
        {
            playback.play();
        }

        let mut response = String::from("RTSP/1.0 200 OK\r\n");
        append_common_response(&mut response, cseq, Some(playback_session_id));
        response.push_str("Range: npt=now-\r\n");
        response.push_str("\r\n");

        if self
            .net
            .send_request(session_id, Bytes::from(response))
            .is_err()
        {
            return;
        }

        if self.state == State::PausedToPlaying {
            self.state = State::Playing;
        } else {
            // Establishment is synchronous; go straight through AboutToPlay.
            self.state = State::AboutToPlay;
            self.state = State::Playing;
            let _ = self.notify.send(SourceEvent::SessionEstablished);
        }
    }

    fn on_pause_request(&mut self, session_id: SessionId, cseq: i32, message: &ParsedMessage) {
        let Some(playback_session_id) = self.find_playback_session(message) else {
            self.send_error_response(session_id, "454 Session Not Found", cseq);
            return;
        };

        log::info!("Received PAUSE request.");
        if self.state != State::PlayingToPaused {
            self.send_error_response(session_id, "405 Method Not Allowed", cseq);
            return;
        }

        if let Some(playback) = self
            .client
            .as_ref()
            .and_then(|c| c.playback_session.as_ref())
        {
            playback.pause();
        }

        let mut response = String::from("RTSP/1.0 200 OK\r\n");
        append_common_response(&mut response, cseq, Some(playback_session_id));
        response.push_str("\r\n");
        let _ = self.net.send_request(session_id, Bytes::from(response));

        self.state = State::Paused;
    }

    fn on_teardown_request(
        &mut self,
        session_id: SessionId,
        cseq: i32,
        message: &ParsedMessage,
    ) {
        log::info!("Received TEARDOWN request.");

        let Some(playback_session_id) = self.find_playback_session(message) else {
            self.send_error_response(session_id, "454 Session Not Found", cseq);
            return;
        };

        let mut response = String::from("RTSP/1.0 200 OK\r\n");
        append_common_response(&mut response, cseq, Some(playback_session_id));
        response.push_str("Connection: close\r\n");
        response.push_str("\r\n");
        let _ = self.net.send_request(session_id, Bytes::from(response));

        if self.state == State::AwaitingClientTeardown {
            self.teardown_deadline = None;
            self.finish_stop();
        } else {
            self.disconnect_client(Some(Error::Other("sink initiated teardown".into())));
        }
    }

    fn on_get_parameter_request(
        &mut self,
        session_id: SessionId,
        cseq: i32,
        message: &ParsedMessage,
    ) {
        if self.find_playback_session(message).is_none() {
            self.send_error_response(session_id, "454 Session Not Found", cseq);
            return;
        }
        self.update_liveness();

        let mut response = String::from("RTSP/1.0 200 OK\r\n");
        append_common_response(
            &mut response,
            cseq,
            self.client.as_ref().and_then(|c| c.playback_session_id),
        );
        response.push_str("\r\n");
        let _ = self.net.send_request(session_id, Bytes::from(response));
    }

    fn on_set_parameter_request(
        &mut self,
        session_id: SessionId,
        cseq: i32,
        message: &ParsedMessage,
    ) {
        if self.find_playback_session(message).is_none() {
            self.send_error_response(session_id, "454 Session Not Found", cseq);
            return;
        }

        if message.content().contains("wfd_idr_request\r\n") {
            if let Some(playback) = self
                .client
                .as_ref()
                .and_then(|c| c.playback_session.as_ref())
            {
                playback.request_idr_frame();
            }
        }

        self.update_liveness();

        let mut response = String::from("RTSP/1.0 200 OK\r\n");
        append_common_response(
            &mut response,
            cseq,
            self.client.as_ref().and_then(|c| c.playback_session_id),
        );
        response.push_str("\r\n");
        let _ = self.net.send_request(session_id, Bytes::from(response));
    }

    //------------------------------------------------------------------
    // Helpers

    /// Resolves the playback session named by a request's `Session:`
    /// header; requests without one fall back to the current session
    /// (some older sinks omit it).
    fn find_playback_session(&self, message: &ParsedMessage) -> Option<i32> {
        let client = self.client.as_ref()?;
        let current = client.playback_session_id?;
        match message.find_i32("session") {
            None => Some(current),
            Some(id) if id == current => Some(current),
            Some(_) => None,
        }
    }

    fn update_liveness(&self) {
        if let Some(playback) = self
            .client
            .as_ref()
            .and_then(|c| c.playback_session.as_ref())
        {
            playback.update_liveness();
        }
    }

    fn send_error_response(&self, session_id: SessionId, status_line: &str, cseq: i32) {
        let response = error_response(status_line, cseq);
        let _ = self.net.send_request(session_id, Bytes::from(response));
    }

    /// Tears the playback session down (asynchronously) and then the
    /// client connection.
    fn disconnect_client(&mut self, error: Option<Error>) {
        if let Some(error) = error {
            let _ = self.notify.send(SourceEvent::DisplayError(error));
        }

        let has_playback = self
            .client
            .as_ref()
            .map(|c| c.playback_session.is_some())
            .unwrap_or(false);

        if has_playback {
            if let Some(playback) = self
                .client
                .as_ref()
                .and_then(|c| c.playback_session.as_ref())
            {
                playback.destroy_async();
            }
            // Completion arrives as SessionDestroyed.
        } else {
            self.disconnect_client2();
        }
    }

    fn disconnect_client2(&mut self) {
        if let Some(client) = self.client.take() {
            self.net.destroy_session(client.session_id);
        }
        self.next_keepalive = None;
        self.pending_responses.clear();
        let _ = self.notify.send(SourceEvent::DisplayDisconnected);

        if self.state == State::Stopping || self.stop_reply.is_some() {
            self.finish_stop2();
        } else {
            self.state = State::AwaitingClientConnection;
        }
    }

    fn finish_stop(&mut self) {
        self.state = State::Stopping;

        let has_playback = self
            .client
            .as_ref()
            .map(|c| c.playback_session.is_some())
            .unwrap_or(false);
        if has_playback {
            if let Some(playback) = self
                .client
                .as_ref()
                .and_then(|c| c.playback_session.as_ref())
            {
                playback.destroy_async();
            }
        } else {
            self.disconnect_client2();
        }
    }

    fn finish_stop2(&mut self) {
        self.net.destroy_session(self.listener_id);
        log::info!("We're stopped.");
        self.state = State::Stopped;
        if let Some(reply) = self.stop_reply.take() {
            let _ = reply.send(());
        }
    }
}

#[derive(Debug)]
struct ParsedTransport {
    mode: TransportMode,
    client_rtp: u16,
    client_rtcp: Option<u16>,
}

/// Parses the `Transport:` header of a SETUP request.
fn parse_transport(transport: &str) -> Result<ParsedTransport> {
    fn parse_port_pair(value: &str) -> Result<(u16, Option<u16>)> {
        match value.split_once('-') {
            Some((rtp, rtcp)) => Ok((
                rtp.parse().map_err(|_| Error::ErrMalformedRtspMessage)?,
                Some(rtcp.parse().map_err(|_| Error::ErrMalformedRtspMessage)?),
            )),
            None => Ok((
                value.parse().map_err(|_| Error::ErrMalformedRtspMessage)?,
                None,
            )),
        }
    }

    if let Some(rest) = transport.strip_prefix("RTP/AVP/TCP;") {
        if let Some(interleaved) = ParsedMessage::get_attribute(rest, "interleaved") {
            let (rtp, rtcp) = parse_port_pair(&interleaved)?;
            return Ok(ParsedTransport {
                mode: TransportMode::TcpInterleaved,
                client_rtp: rtp,
                client_rtcp: rtcp,
            });
        }
        let client_port = ParsedMessage::get_attribute(rest, "client_port")
            .ok_or(Error::ErrMalformedRtspMessage)?;
        let (rtp, rtcp) = parse_port_pair(&client_port)?;
        return Ok(ParsedTransport {
            mode: TransportMode::Tcp,
            client_rtp: rtp,
            client_rtcp: rtcp,
        });
    }

    if transport.starts_with("RTP/AVP;unicast;")
        || transport.starts_with("RTP/AVP/UDP;unicast;")
    {
        let client_port = ParsedMessage::get_attribute(transport, "client_port")
            .ok_or(Error::ErrMalformedRtspMessage)?;
        let (rtp, rtcp) = parse_port_pair(&client_port)?;
        return Ok(ParsedTransport {
            mode: TransportMode::Udp,
            client_rtp: rtp,
            client_rtcp: rtcp,
        });
    }

    // Some older dongles say just "RTP/AVP/UDP;unicast" with no
    // client_port attribute at all.
    if transport == "RTP/AVP/UDP;unicast" {
        return Ok(ParsedTransport {
            mode: TransportMode::Udp,
            client_rtp: 19000,
            client_rtcp: None,
        });
    }

    Err(Error::ErrUnsupportedTransport)
}

/// Parses `wfd_client_rtp_ports: RTP/AVP/UDP;unicast <rtp> 0 mode=play`.
fn parse_client_rtp_ports(value: &str) -> Result<u16> {
    let mut tokens = value.split_whitespace();
    let profile = tokens.next().ok_or(Error::ErrMalformedParameters)?;
    if !profile.starts_with("RTP/AVP") {
        return Err(Error::ErrMalformedParameters);
    }
    tokens
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or(Error::ErrMalformedParameters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transport_udp_with_pair() {
        let parsed =
            parse_transport("RTP/AVP/UDP;unicast;client_port=19000-19001").unwrap();
        assert_eq!(parsed.mode, TransportMode::Udp);
        assert_eq!(parsed.client_rtp, 19000);
        assert_eq!(parsed.client_rtcp, Some(19001));
    }

    #[test]
    fn test_parse_transport_udp_single_port() {
        let parsed = parse_transport("RTP/AVP;unicast;client_port=19000").unwrap();
        assert_eq!(parsed.mode, TransportMode::Udp);
        assert_eq!(parsed.client_rtcp, None);
    }

    #[test]
    fn test_parse_transport_interleaved() {
        let parsed = parse_transport("RTP/AVP/TCP;interleaved=0-1").unwrap();
        assert_eq!(parsed.mode, TransportMode::TcpInterleaved);
        assert_eq!(parsed.client_rtp, 0);
        assert_eq!(parsed.client_rtcp, Some(1));
    }

    #[test]
    fn test_parse_transport_tcp_client_port() {
        let parsed = parse_transport("RTP/AVP/TCP;client_port=4000-4001").unwrap();
        assert_eq!(parsed.mode, TransportMode::Tcp);
        assert_eq!(parsed.client_rtp, 4000);
    }

    #[test]
    fn test_parse_transport_legacy_dongle() {
        // Older LG dongles send no client_port attribute at all.
        let parsed = parse_transport("RTP/AVP/UDP;unicast").unwrap();
        assert_eq!(parsed.client_rtp, 19000);
        assert_eq!(parsed.client_rtcp, None);
    }

    #[test]
    fn test_parse_transport_unsupported() {
        assert_eq!(
            parse_transport("RTP/SAVP;unicast;client_port=1").unwrap_err(),
            Error::ErrUnsupportedTransport
        );
    }

    #[test]
    fn test_parse_client_rtp_ports() {
        assert_eq!(
            parse_client_rtp_ports("RTP/AVP/UDP;unicast 19000 0 mode=play").unwrap(),
            19000
        );
        assert!(parse_client_rtp_ports("TCP 19000").is_err());
    }
}
