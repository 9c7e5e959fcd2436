//! The Wi-Fi Display sink: connects to a source, answers the capability
//! exchange, issues SETUP/PLAY/PAUSE/TEARDOWN on triggers and renders the
//! incoming transport stream.

use crate::config::Config;
use crate::media::receiver::{MediaReceiver, MediaReceiverEvent, ReceiverMode};
use crate::media::Renderer;
use crate::session::{NetworkSession, SessionEvent, SessionId};
use bytes::Bytes;
use rtcp::app::LatenessReport;
use rtsp::{
    append_common_response, error_response, ParsedMessage, Parameters, VideoFormats,
    PUBLIC_METHODS, WFD_REQUIRE,
};
use shared::error::{Error, Result};
use shared::util::{pick_random_rtp_port, SOURCE_ID};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Lateness reports go to the source once a second while playing.
const REPORT_LATENESS_EVERY: Duration = Duration::from_secs(1);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Undefined,
    Connecting,
    Connected,
    Paused,
    Playing,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ResponseKind {
    M2,
    Setup,
    Play,
    Pause,
    Teardown,
    IdrRequest,
}

#[derive(Debug)]
pub enum SinkEvent {
    /// Streaming started; access units are flowing to the renderer.
    Playing,
    Disconnected,
    Error(Error),
}

enum Cmd {
    Stop(oneshot::Sender<()>),
}

/// Handle to a running sink.
pub struct WifiDisplaySink {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
}

impl WifiDisplaySink {
    /// Connects to a source's RTSP port and spawns the sink actor.
    pub async fn connect(
        net: NetworkSession,
        config: Config,
        renderer: Box<dyn Renderer>,
        source_addr: SocketAddr,
        notify: mpsc::UnboundedSender<SinkEvent>,
    ) -> Result<WifiDisplaySink> {
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let rtsp_session = net.create_rtsp_client(source_addr, session_tx.clone()).await?;

        let mut supported_formats = VideoFormats::new();
        supported_formats.enable_all();

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = SinkActor {
            net,
            config,
            renderer,
            notify,
            session_notify: session_tx,
            state: State::Connecting,
            rtsp_session,
            source_addr,
            supported_formats,
            next_cseq: 1,
            pending_responses: HashMap::new(),
            media_receiver: MediaReceiver::new(),
            rtp_session: None,
            rtcp_session: None,
            local_rtp_port: 0,
            playback_session_id: None,
            rtcp_connected: false,
            session_timeout_secs: rtsp::PLAYBACK_SESSION_TIMEOUT_SECS,
            presentation_url: None,
            idr_request_pending: false,
            epoch: Instant::now(),
            latency_count: 0,
            latency_sum_us: 0,
            latency_max_us: 0,
            time_offset_us: 0,
            stop_reply: None,
        };
        tokio::spawn(actor.run(session_rx, cmd_rx));

        Ok(WifiDisplaySink { cmd_tx })
    }

    /// Sends TEARDOWN and resolves once the connection is closed.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

struct SinkActor {
    net: NetworkSession,
    config: Config,
    renderer: Box<dyn Renderer>,
    notify: mpsc::UnboundedSender<SinkEvent>,
    /// UDP media sessions report into the same loop as the RTSP session.
    session_notify: mpsc::UnboundedSender<SessionEvent>,

    state: State,
    rtsp_session: SessionId,
    source_addr: SocketAddr,
    supported_formats: VideoFormats,

    next_cseq: i32,
    pending_responses: HashMap<(SessionId, i32), ResponseKind>,

    media_receiver: MediaReceiver,
    rtp_session: Option<SessionId>,
    rtcp_session: Option<SessionId>,
    local_rtp_port: u16,

    playback_session_id: Option<i32>,
    rtcp_connected: bool,
    session_timeout_secs: u64,
    presentation_url: Option<String>,
    idr_request_pending: bool,

    epoch: Instant,
    latency_count: u64,
    latency_sum_us: i64,
    latency_max_us: i64,
    /// Clock offset to the source, when time sync ran.
    time_offset_us: i64,

    stop_reply: Option<oneshot::Sender<()>>,
}

impl SinkActor {
    async fn run(
        mut self,
        mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
        mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    ) {
        let mut lateness = tokio::time::interval(REPORT_LATENESS_EVERY);
        lateness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let deadline = self.media_receiver.poll_timeout();
            let receiver_timeout = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                event = session_rx.recv() => match event {
                    Some(event) => {
                        if !self.on_session_event(event).await {
                            break;
                        }
                    }
                    None => break,
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(Cmd::Stop(reply)) => {
                        self.stop_reply = Some(reply);
                        self.send_teardown();
                    }
                    None => break,
                },
                _ = receiver_timeout => {
                    self.media_receiver.handle_timeout(Instant::now());
                    self.drain_receiver_events();
                }
                _ = lateness.tick() => self.report_lateness(),
            }
        }

        if let Some(reply) = self.stop_reply.take() {
            let _ = reply.send(());
        }
    }

    async fn on_session_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Connected { session_id } if session_id == self.rtsp_session => {
                self.state = State::Connected;
                true
            }
            SessionEvent::Data {
                session_id,
                message,
            } if session_id == self.rtsp_session => {
                if message.request_line().is_some() {
                    self.on_source_request(&message).await;
                } else {
                    self.on_source_response(&message);
                }
                self.state != State::Undefined
            }
            SessionEvent::BinaryData { channel, data, .. } => {
                // TCP-interleaved RTP arrives on channel 0.
                if channel == 0 {
                    self.handle_rtp(&data);
                }
                true
            }
            SessionEvent::Datagram {
                session_id,
                datagram,
            } => {
                if Some(session_id) == self.rtp_session {
                    if !self.rtcp_connected {
                        // No server_port was negotiated; bind the feedback
                        // path towards whoever is actually sending to us.
                        if let Some(id) = self.rtcp_session {
                            let sender = datagram.transport.peer_addr;
                            let rtcp_remote =
                                SocketAddr::new(sender.ip(), sender.port() + 1);
                            if self.net.connect_udp_session(id, rtcp_remote).is_ok() {
                                self.rtcp_connected = true;
                            }
                        }
                    }
                    if let Err(e) =
                        self.media_receiver
                            .handle_rtp(0, datagram.arrival, &datagram.payload)
                    {
                        log::debug!("dropping bad RTP datagram: {e}");
                    }
                    self.drain_receiver_events();
                }
                true
            }
            SessionEvent::Error {
                session_id, error, ..
            } => {
                if session_id == self.rtsp_session {
                    if self.stop_reply.is_none() {
                        let _ = self.notify.send(SinkEvent::Error(error));
                    }
                    let _ = self.notify.send(SinkEvent::Disconnected);
                    return false;
                }
                true
            }
            _ => true,
        }
    }

    fn handle_rtp(&mut self, data: &[u8]) {
        if let Err(e) = self.media_receiver.handle_rtp(0, Instant::now(), data) {
            log::debug!("dropping bad interleaved RTP frame: {e}");
        }
        self.drain_receiver_events();
    }

    fn drain_receiver_events(&mut self) {
        while let Some(event) = self.media_receiver.poll_event() {
            match event {
                MediaReceiverEvent::AccessUnit { track_index, unit } => {
                    let now_us = self.epoch.elapsed().as_micros() as i64;
                    let latency = now_us - unit.time_us - self.time_offset_us;
                    if latency > 0 {
                        self.latency_count += 1;
                        self.latency_sum_us += latency;
                        self.latency_max_us = self.latency_max_us.max(latency);
                    }

                    self.renderer.render(
                        track_index,
                        crate::media::AccessUnit::new(unit.data, unit.time_us),
                    );
                }
                MediaReceiverEvent::PacketLost { .. } => {
                    // A lost packet corrupts the stream until the next IDR;
                    // ask for one.
                    self.send_idr_request();
                }
                MediaReceiverEvent::RtcpReady { data, .. } => {
                    if let Some(id) = self.rtcp_session {
                        let _ = self.net.send_request(id, data);
                    }
                }
            }
        }
    }

    fn report_lateness(&mut self) {
        if self.state != State::Playing || self.latency_count == 0 {
            return;
        }

        let report = LatenessReport {
            avg_latency_us: self.latency_sum_us / self.latency_count as i64,
            max_latency_us: self.latency_max_us,
        };
        self.latency_count = 0;
        self.latency_sum_us = 0;
        self.latency_max_us = 0;

        if let Some(id) = self.rtcp_session {
            let _ = self.net.send_request(id, report.to_app(SOURCE_ID).marshal());
        }
    }

    //------------------------------------------------------------------
    // Requests from the source

    async fn on_source_request(&mut self, message: &ParsedMessage) {
        let Some(cseq) = message.find_i32("cseq") else {
            self.send_error_response("400 Bad Request", -1);
            return;
        };

        let (method, _uri, version) = message.request_line().unwrap();
        if version != "RTSP/1.0" {
            self.send_error_response("505 RTSP Version not supported", cseq);
            return;
        }

        match method {
            "OPTIONS" => self.on_options_request(cseq, message),
            "GET_PARAMETER" => self.on_get_parameter_request(cseq, message).await,
            "SET_PARAMETER" => self.on_set_parameter_request(cseq, message),
            _ => self.send_error_response("405 Method Not Allowed", cseq),
        }
    }

    fn on_options_request(&mut self, cseq: i32, message: &ParsedMessage) {
        if let Some(require) = message.find_string("require") {
            if require != WFD_REQUIRE {
                self.send_error_response("551 Option not supported", cseq);
                return;
            }
        }

        let mut response = String::from("RTSP/1.0 200 OK\r\n");
        append_common_response(&mut response, cseq, None);
        response.push_str(&format!("Public: {PUBLIC_METHODS}\r\n"));
        response.push_str("\r\n");
        let _ = self.net.send_request(self.rtsp_session, Bytes::from(response));

        // M2: our own capability probe back at the source.
        self.send_m2();
    }

    /// M3: report our capabilities.
    async fn on_get_parameter_request(&mut self, cseq: i32, message: &ParsedMessage) {
        if message.content().is_empty() {
            // Keep-alive.
            let mut response = String::from("RTSP/1.0 200 OK\r\n");
            append_common_response(&mut response, cseq, None);
            response.push_str("\r\n");
            let _ = self.net.send_request(self.rtsp_session, Bytes::from(response));
            return;
        }

        if self.rtp_session.is_none() {
            if let Err(e) = self.prepare_media_receiver().await {
                log::error!("failed to open RTP port: {e}");
                self.send_error_response("500 Internal Server Error", cseq);
                return;
            }
        }

        let transport = if self.config.use_tcp_transport {
            "TCP"
        } else {
            "UDP"
        };
        let mut body = String::new();
        for line in message.content().lines() {
            match line.trim() {
                "wfd_content_protection" => body.push_str("wfd_content_protection: none\r\n"),
                "wfd_video_formats" => body.push_str(&format!(
                    "wfd_video_formats: {}\r\n",
                    self.supported_formats.format_spec(false)
                )),
                "wfd_audio_codecs" => body.push_str(
                    "wfd_audio_codecs: AAC 00000001 00, LPCM 00000002 00\r\n",
                ),
                "wfd_client_rtp_ports" => body.push_str(&format!(
                    "wfd_client_rtp_ports: RTP/AVP/{};unicast {} 0 mode=play\r\n",
                    transport, self.local_rtp_port
                )),
                "" => {}
                other => log::debug!("not reporting unknown parameter {other:?}"),
            }
        }

        let mut response = String::from("RTSP/1.0 200 OK\r\n");
        append_common_response(&mut response, cseq, None);
        response.push_str("Content-Type: text/parameters\r\n");
        response.push_str(&format!("Content-Length: {}\r\n", body.len()));
        response.push_str("\r\n");
        response.push_str(&body);
        let _ = self.net.send_request(self.rtsp_session, Bytes::from(response));
    }

    /// M4 parameters and M5 triggers.
    fn on_set_parameter_request(&mut self, cseq: i32, message: &ParsedMessage) {
        let content = message.content().to_owned();

        let params = match Parameters::parse(&content) {
            Ok(params) => params,
            Err(_) => {
                self.send_error_response("400 Bad Request", cseq);
                return;
            }
        };

        if let Some(url) = params.find("wfd_presentation_url") {
            let url = url
                .strip_suffix(" none")
                .unwrap_or(url)
                .trim()
                .to_owned();
            self.presentation_url = Some(url);
        }

        // Ack before acting on a trigger so the source's FSM sees the
        // response ahead of our request.
        let mut response = String::from("RTSP/1.0 200 OK\r\n");
        append_common_response(&mut response, cseq, None);
        response.push_str("\r\n");
        let _ = self.net.send_request(self.rtsp_session, Bytes::from(response));

        match params.find("wfd_trigger_method") {
            Some("SETUP") => self.send_setup(),
            Some("PLAY") => self.send_play(),
            Some("PAUSE") => self.send_pause(),
            Some("TEARDOWN") => self.send_teardown(),
            Some(other) => log::warn!("unknown trigger method {other:?}"),
            None => {}
        }
    }

    async fn prepare_media_receiver(&mut self) -> Result<()> {
        let net_tx = self.session_notify.clone();

        let mut attempts = 0;
        let (rtp, rtcp, port) = loop {
            let port = pick_random_rtp_port();
            match self.net.create_udp_session(port, None, net_tx.clone()).await {
                Ok((rtp, _)) => {
                    match self.net.create_udp_session(port + 1, None, net_tx.clone()).await {
                        Ok((rtcp, _)) => break (rtp, rtcp, port),
                        Err(_) if attempts < 10 => {
                            self.net.destroy_session(rtp);
                            attempts += 1;
                        }
                        Err(e) => {
                            self.net.destroy_session(rtp);
                            return Err(e);
                        }
                    }
                }
                Err(_) if attempts < 10 => attempts += 1,
                Err(e) => return Err(e),
            }
        };

        self.media_receiver = MediaReceiver::new();
        let retransmission = self
            .config
            .enable_retransmission
            .then(|| Duration::from_millis(20));
        self.media_receiver.add_track(retransmission)?;
        self.media_receiver.init(ReceiverMode::TransportStream)?;

        self.rtp_session = Some(rtp);
        self.rtcp_session = Some(rtcp);
        self.local_rtp_port = port;

        Ok(())
    }

    //------------------------------------------------------------------
    // Requests to the source

    fn allocate_cseq(&mut self) -> i32 {
        let cseq = self.next_cseq;
        self.next_cseq += 1;
        cseq
    }

    fn send_request(&mut self, cseq: i32, request: String, kind: ResponseKind) {
        if self
            .net
            .send_request(self.rtsp_session, Bytes::from(request))
            .is_ok()
        {
            self.pending_responses.insert((self.rtsp_session, cseq), kind);
        }
    }

    fn send_m2(&mut self) {
        let cseq = self.allocate_cseq();
        let mut request = String::from("OPTIONS * RTSP/1.0\r\n");
        append_common_response(&mut request, cseq, None);
        request.push_str(&format!("Require: {WFD_REQUIRE}\r\n"));
        request.push_str("\r\n");
        self.send_request(cseq, request, ResponseKind::M2);
    }

    fn session_url(&self) -> String {
        self.presentation_url.clone().unwrap_or_else(|| {
            format!("rtsp://{}/wfd1.0/streamid=0", self.source_addr.ip())
        })
    }

    fn send_setup(&mut self) {
        let url = self.session_url();
        let transport = if self.config.use_tcp_transport {
            "RTP/AVP/TCP"
        } else {
            "RTP/AVP/UDP"
        };

        let cseq = self.allocate_cseq();
        let mut request = format!("SETUP {url} RTSP/1.0\r\n");
        append_common_response(&mut request, cseq, None);
        request.push_str(&format!(
            "Transport: {};unicast;client_port={}-{}\r\n",
            transport,
            self.local_rtp_port,
            self.local_rtp_port + 1
        ));
        request.push_str("\r\n");
        self.send_request(cseq, request, ResponseKind::Setup);
    }

    fn send_play(&mut self) {
        let url = self.session_url();
        let cseq = self.allocate_cseq();
        let mut request = format!("PLAY {url} RTSP/1.0\r\n");
        append_common_response(&mut request, cseq, None);
        if let Some(id) = self.playback_session_id {
            request.push_str(&format!("Session: {id}\r\n"));
        }
        request.push_str("\r\n");
        self.send_request(cseq, request, ResponseKind::Play);
    }

    fn send_pause(&mut self) {
        let url = self.session_url();
        let cseq = self.allocate_cseq();
        let mut request = format!("PAUSE {url} RTSP/1.0\r\n");
        append_common_response(&mut request, cseq, None);
        if let Some(id) = self.playback_session_id {
            request.push_str(&format!("Session: {id}\r\n"));
        }
        request.push_str("\r\n");
        self.send_request(cseq, request, ResponseKind::Pause);
    }

    fn send_teardown(&mut self) {
        let url = self.session_url();
        let cseq = self.allocate_cseq();
        let mut request = format!("TEARDOWN {url} RTSP/1.0\r\n");
        append_common_response(&mut request, cseq, None);
        if let Some(id) = self.playback_session_id {
            request.push_str(&format!("Session: {id}\r\n"));
        }
        request.push_str("\r\n");
        self.send_request(cseq, request, ResponseKind::Teardown);
    }

    fn send_idr_request(&mut self) {
        if self.idr_request_pending {
            return;
        }
        self.idr_request_pending = true;

        let body = "wfd_idr_request\r\n";
        let cseq = self.allocate_cseq();
        let mut request = String::from("SET_PARAMETER rtsp://localhost/wfd1.0 RTSP/1.0\r\n");
        append_common_response(&mut request, cseq, None);
        request.push_str("Content-Type: text/parameters\r\n");
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
        request.push_str("\r\n");
        request.push_str(body);
        self.send_request(cseq, request, ResponseKind::IdrRequest);
    }

    //------------------------------------------------------------------
    // Responses from the source

    fn on_source_response(&mut self, message: &ParsedMessage) {
        let Some(cseq) = message.find_i32("cseq") else {
            log::warn!("response without CSeq, dropping");
            return;
        };
        let Some(kind) = self
            .pending_responses
            .remove(&(self.rtsp_session, cseq))
        else {
            log::warn!("response with unmatched cseq {cseq}, dropping");
            return;
        };

        let status = message.status_code().unwrap_or(0);
        if status != 200 && kind != ResponseKind::Teardown {
            log::error!("request (cseq {cseq}) failed with status {status}");
            if matches!(kind, ResponseKind::Setup | ResponseKind::Play) {
                let _ = self
                    .notify
                    .send(SinkEvent::Error(Error::ErrRtspStatus(status)));
            }
            if kind == ResponseKind::IdrRequest {
                self.idr_request_pending = false;
            }
            return;
        }

        match kind {
            ResponseKind::M2 => {}
            ResponseKind::Setup => self.on_setup_response(message),
            ResponseKind::Play => {
                self.state = State::Playing;
                let _ = self.notify.send(SinkEvent::Playing);
            }
            ResponseKind::Pause => {
                self.state = State::Paused;
            }
            // Even a refused TEARDOWN ends the session on our side.
            ResponseKind::Teardown => {
                self.net.destroy_session(self.rtsp_session);
                if let Some(id) = self.rtp_session.take() {
                    self.net.destroy_session(id);
                }
                if let Some(id) = self.rtcp_session.take() {
                    self.net.destroy_session(id);
                }
                let _ = self.notify.send(SinkEvent::Disconnected);
                self.state = State::Undefined;
            }
            ResponseKind::IdrRequest => {
                self.idr_request_pending = false;
            }
        }
    }

    fn on_setup_response(&mut self, message: &ParsedMessage) {
        if let Some(session) = message.find_i32("session") {
            self.playback_session_id = Some(session);
        }
        if let Some(value) = message.find_string("session") {
            if let Some(timeout) = ParsedMessage::get_attribute(value, "timeout") {
                if let Ok(timeout) = timeout.parse() {
                    self.session_timeout_secs = timeout;
                }
            }
        }

        // Bind the RTCP socket towards the server's reported port so our
        // receiver reports and lateness feedback reach the source.
        if let Some(transport) = message.find_string("transport") {
            if let Some(server_port) = ParsedMessage::get_attribute(transport, "server_port") {
                let server_rtcp = server_port
                    .split_once('-')
                    .map(|(_, rtcp)| rtcp.to_owned())
                    .unwrap_or(server_port);
                if let Ok(port) = server_rtcp.parse::<u16>() {
                    if let Some(id) = self.rtcp_session {
                        if self
                            .net
                            .connect_udp_session(
                                id,
                                SocketAddr::new(self.source_addr.ip(), port),
                            )
                            .is_ok()
                        {
                            self.rtcp_connected = true;
                        }
                    }
                }
            }
        }

        log::info!(
            "session {} established, timeout {} s",
            self.playback_session_id.unwrap_or(-1),
            self.session_timeout_secs
        );
        self.state = State::Paused;
        self.send_play();
    }

    fn send_error_response(&self, status_line: &str, cseq: i32) {
        let response = error_response(status_line, cseq);
        let _ = self.net.send_request(self.rtsp_session, Bytes::from(response));
    }
}
