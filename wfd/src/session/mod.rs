//! The network session layer: every socket of the stack lives here, keyed
//! by a process-unique session id, with one event channel per session.
//!
//! Supported session kinds mirror the control/media split of the
//! protocol: RTSP client/server connections with CRLF + interleaved-`$`
//! framing, plain UDP, and TCP carrying 16-bit length-prefixed datagrams
//! as an alternative RTP transport.

use bytes::{Bytes, BytesMut};
use rtsp::{MessageScanner, ParsedMessage, ScannedItem};
use shared::error::{Error, Result};
use shared::tcp_framing::{frame_packet, TcpFrameDecoder};
use shared::util::next_session_id;
use shared::{Tagged, TaggedDatagram, TransportContext};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

pub type SessionId = i32;

/// Outbound queue depth past which a `NetworkStall` is raised.
const STALL_THRESHOLD_BYTES: usize = 2048;

/// Events multiplexed onto a session's notify channel.
#[derive(Debug)]
pub enum SessionEvent {
    /// A server session accepted a connection; `session_id` is the new
    /// connection's id.
    ClientConnected {
        session_id: SessionId,
        listener_id: SessionId,
        local: SocketAddr,
        remote: SocketAddr,
    },
    /// An actively-opened connection completed.
    Connected { session_id: SessionId },
    /// A parsed RTSP message arrived.
    Data {
        session_id: SessionId,
        message: ParsedMessage,
    },
    /// An interleaved `$`-framed binary frame arrived on an RTSP
    /// connection.
    BinaryData {
        session_id: SessionId,
        channel: u8,
        data: Vec<u8>,
    },
    /// A UDP or TCP-framed datagram arrived, stamped with its arrival
    /// time and endpoints.
    Datagram {
        session_id: SessionId,
        datagram: TaggedDatagram,
    },
    /// The session failed and has been destroyed.
    Error {
        session_id: SessionId,
        during_send: bool,
        error: Error,
    },
    /// The send queue is backed up past the threshold.
    NetworkStall {
        session_id: SessionId,
        num_bytes_queued: usize,
    },
}

pub type Notify = mpsc::UnboundedSender<SessionEvent>;

enum Cmd {
    Send(Bytes),
    ConnectUdp(SocketAddr),
    Destroy,
}

struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    queued_bytes: Arc<AtomicUsize>,
    is_udp: bool,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, SessionHandle>,
}

/// Handle to the session table; cheap to clone.
#[derive(Clone)]
pub struct NetworkSession {
    inner: Arc<Mutex<Inner>>,
    idr_request_compat: bool,
}

impl NetworkSession {
    pub fn new(idr_request_compat: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            idr_request_compat,
        }
    }

    fn register(&self, id: SessionId, handle: SessionHandle) {
        self.inner.lock().unwrap().sessions.insert(id, handle);
    }

    fn unregister(&self, id: SessionId) {
        self.inner.lock().unwrap().sessions.remove(&id);
    }

    /// Queues bytes on a session. Backpressure surfaces as a
    /// `NetworkStall` event rather than an error.
    pub fn send_request(&self, id: SessionId, data: Bytes) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let handle = inner.sessions.get(&id).ok_or(Error::ErrNoSuchSession)?;
        handle
            .queued_bytes
            .fetch_add(data.len(), Ordering::Relaxed);
        handle
            .cmd_tx
            .send(Cmd::Send(data))
            .map_err(|_| Error::ErrNoSuchSession)
    }

    /// Binds a not-yet-connected UDP session to a remote peer.
    pub fn connect_udp_session(&self, id: SessionId, remote: SocketAddr) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let handle = inner.sessions.get(&id).ok_or(Error::ErrNoSuchSession)?;
        if !handle.is_udp {
            return Err(Error::ErrNotUdpSession);
        }
        handle
            .cmd_tx
            .send(Cmd::ConnectUdp(remote))
            .map_err(|_| Error::ErrNoSuchSession)
    }

    /// Destroys a session and closes its socket. Safe to call twice.
    pub fn destroy_session(&self, id: SessionId) {
        let handle = self.inner.lock().unwrap().sessions.remove(&id);
        if let Some(handle) = handle {
            let _ = handle.cmd_tx.send(Cmd::Destroy);
        }
    }

    /// Starts an RTSP server listening on `addr`. Each accepted client
    /// becomes its own session announced via `ClientConnected`.
    pub async fn create_rtsp_server(&self, addr: SocketAddr, notify: Notify) -> Result<SessionId> {
        let listener = TcpListener::bind(addr).await?;
        let id = next_session_id();

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        self.register(
            id,
            SessionHandle {
                cmd_tx,
                queued_bytes: Arc::new(AtomicUsize::new(0)),
                is_udp: false,
            },
        );

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(Cmd::Destroy) | None => break,
                        _ => {}
                    },
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let local = stream.local_addr().unwrap_or(remote);
                            let conn_id = this.adopt_rtsp_connection(stream, notify.clone());
                            let _ = notify.send(SessionEvent::ClientConnected {
                                session_id: conn_id,
                                listener_id: id,
                                local,
                                remote,
                            });
                        }
                        Err(e) => {
                            this.unregister(id);
                            let _ = notify.send(SessionEvent::Error {
                                session_id: id,
                                during_send: false,
                                error: e.into(),
                            });
                            break;
                        }
                    },
                }
            }
        });

        Ok(id)
    }

    /// Connects to an RTSP server; `Connected` fires once the TCP
    /// handshake completes.
    pub async fn create_rtsp_client(&self, remote: SocketAddr, notify: Notify) -> Result<SessionId> {
        let stream = TcpStream::connect(remote).await?;
        let id = self.adopt_rtsp_connection(stream, notify.clone());
        let _ = notify.send(SessionEvent::Connected { session_id: id });
        Ok(id)
    }

    fn adopt_rtsp_connection(&self, stream: TcpStream, notify: Notify) -> SessionId {
        let id = next_session_id();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let queued_bytes = Arc::new(AtomicUsize::new(0));
        self.register(
            id,
            SessionHandle {
                cmd_tx,
                queued_bytes: queued_bytes.clone(),
                is_udp: false,
            },
        );

        let this = self.clone();
        let idr_request_compat = self.idr_request_compat;
        tokio::spawn(async move {
            let result = run_rtsp_connection(
                id,
                stream,
                cmd_rx,
                notify.clone(),
                queued_bytes,
                idr_request_compat,
            )
            .await;
            this.unregister(id);
            if let Err((during_send, error)) = result {
                let _ = notify.send(SessionEvent::Error {
                    session_id: id,
                    during_send,
                    error,
                });
            }
        });
        id
    }

    /// Opens a UDP session on `local_port` (0 picks any), optionally
    /// pre-connected to a remote peer. Returns the session id and the
    /// actual local port.
    pub async fn create_udp_session(
        &self,
        local_port: u16,
        remote: Option<SocketAddr>,
        notify: Notify,
    ) -> Result<(SessionId, u16)> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port)).await?;
        let local_port = socket.local_addr()?.port();
        if let Some(remote) = remote {
            socket.connect(remote).await?;
        }

        let id = next_session_id();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let queued_bytes = Arc::new(AtomicUsize::new(0));
        self.register(
            id,
            SessionHandle {
                cmd_tx,
                queued_bytes: queued_bytes.clone(),
                is_udp: true,
            },
        );

        let this = self.clone();
        tokio::spawn(async move {
            let result =
                run_udp_session(id, socket, remote.is_some(), cmd_rx, notify.clone(), queued_bytes)
                    .await;
            this.unregister(id);
            if let Err((during_send, error)) = result {
                let _ = notify.send(SessionEvent::Error {
                    session_id: id,
                    during_send,
                    error,
                });
            }
        });

        Ok((id, local_port))
    }

    /// Actively connects a TCP session carrying length-prefixed
    /// datagrams.
    pub async fn create_tcp_datagram_session_active(
        &self,
        remote: SocketAddr,
        notify: Notify,
    ) -> Result<SessionId> {
        let stream = TcpStream::connect(remote).await?;
        let id = self.adopt_datagram_connection(stream, notify.clone());
        let _ = notify.send(SessionEvent::Connected { session_id: id });
        Ok(id)
    }

    /// Listens for a single peer that will send length-prefixed datagrams
    /// over TCP.
    pub async fn create_tcp_datagram_session_passive(
        &self,
        local_port: u16,
        notify: Notify,
    ) -> Result<SessionId> {
        let listener = TcpListener::bind(("0.0.0.0", local_port)).await?;
        let id = next_session_id();

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        self.register(
            id,
            SessionHandle {
                cmd_tx,
                queued_bytes: Arc::new(AtomicUsize::new(0)),
                is_udp: false,
            },
        );

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(Cmd::Destroy) | None => break,
                        _ => {}
                    },
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let local = stream.local_addr().unwrap_or(remote);
                            let conn_id = this.adopt_datagram_connection(stream, notify.clone());
                            let _ = notify.send(SessionEvent::ClientConnected {
                                session_id: conn_id,
                                listener_id: id,
                                local,
                                remote,
                            });
                        }
                        Err(e) => {
                            this.unregister(id);
                            let _ = notify.send(SessionEvent::Error {
                                session_id: id,
                                during_send: false,
                                error: e.into(),
                            });
                            break;
                        }
                    },
                }
            }
        });

        Ok(id)
    }

    fn adopt_datagram_connection(&self, stream: TcpStream, notify: Notify) -> SessionId {
        let id = next_session_id();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let queued_bytes = Arc::new(AtomicUsize::new(0));
        self.register(
            id,
            SessionHandle {
                cmd_tx,
                queued_bytes: queued_bytes.clone(),
                is_udp: false,
            },
        );

        let this = self.clone();
        tokio::spawn(async move {
            let result =
                run_tcp_datagram_connection(id, stream, cmd_rx, notify.clone(), queued_bytes)
                    .await;
            this.unregister(id);
            if let Err((during_send, error)) = result {
                let _ = notify.send(SessionEvent::Error {
                    session_id: id,
                    during_send,
                    error,
                });
            }
        });
        id
    }
}

type TaskResult = std::result::Result<(), (bool, Error)>;

async fn write_queued(
    wr: &mut OwnedWriteHalf,
    data: Bytes,
    queued_bytes: &AtomicUsize,
) -> std::result::Result<(), Error> {
    let result = wr.write_all(&data).await;
    queued_bytes.fetch_sub(data.len(), Ordering::Relaxed);
    result.map_err(Error::from)
}

async fn run_rtsp_connection(
    id: SessionId,
    stream: TcpStream,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    notify: Notify,
    queued_bytes: Arc<AtomicUsize>,
    idr_request_compat: bool,
) -> TaskResult {
    let (mut rd, mut wr) = stream.into_split();
    let mut scanner = MessageScanner::new(idr_request_compat);
    let mut buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Cmd::Send(data)) => {
                    let queued = queued_bytes.load(Ordering::Relaxed);
                    if queued > STALL_THRESHOLD_BYTES {
                        let _ = notify.send(SessionEvent::NetworkStall {
                            session_id: id,
                            num_bytes_queued: queued,
                        });
                    }
                    write_queued(&mut wr, data, &queued_bytes)
                        .await
                        .map_err(|e| (true, e))?;
                }
                Some(Cmd::ConnectUdp(_)) => {}
                Some(Cmd::Destroy) | None => return Ok(()),
            },
            read = rd.read(&mut buf) => {
                let n = read.map_err(|e| (false, Error::from(e)))?;
                if n == 0 {
                    return Err((false, Error::ErrConnectionReset));
                }
                scanner.extend_from_slice(&buf[..n]);
                loop {
                    match scanner.next_item() {
                        Ok(Some(ScannedItem::Message(message))) => {
                            let _ = notify.send(SessionEvent::Data {
                                session_id: id,
                                message,
                            });
                        }
                        Ok(Some(ScannedItem::BinaryData { channel, data })) => {
                            let _ = notify.send(SessionEvent::BinaryData {
                                session_id: id,
                                channel,
                                data,
                            });
                        }
                        Ok(None) => break,
                        Err(e) => return Err((false, e)),
                    }
                }
            }
        }
    }
}

async fn run_tcp_datagram_connection(
    id: SessionId,
    stream: TcpStream,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    notify: Notify,
    queued_bytes: Arc<AtomicUsize>,
) -> TaskResult {
    let peer = stream.peer_addr().map_err(|e| (false, Error::from(e)))?;
    let local = stream.local_addr().map_err(|e| (false, Error::from(e)))?;
    let transport = TransportContext::tcp(local, peer);
    let (mut rd, mut wr) = stream.into_split();
    let mut decoder = TcpFrameDecoder::new();
    let mut buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Cmd::Send(data)) => {
                    let framed = Bytes::from(frame_packet(&data));
                    queued_bytes.fetch_add(2, Ordering::Relaxed);
                    write_queued(&mut wr, framed, &queued_bytes)
                        .await
                        .map_err(|e| (true, e))?;
                }
                Some(Cmd::ConnectUdp(_)) => {}
                Some(Cmd::Destroy) | None => return Ok(()),
            },
            read = rd.read(&mut buf) => {
                let n = read.map_err(|e| (false, Error::from(e)))?;
                if n == 0 {
                    return Err((false, Error::ErrConnectionReset));
                }
                decoder.extend_from_slice(&buf[..n]);
                while let Some(packet) = decoder.next_packet() {
                    let _ = notify.send(SessionEvent::Datagram {
                        session_id: id,
                        datagram: Tagged::arrived(transport, BytesMut::from(&packet[..])),
                    });
                }
            }
        }
    }
}

async fn run_udp_session(
    id: SessionId,
    socket: UdpSocket,
    mut connected: bool,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    notify: Notify,
    queued_bytes: Arc<AtomicUsize>,
) -> TaskResult {
    let local = socket.local_addr().map_err(|e| (false, Error::from(e)))?;
    let mut buf = vec![0u8; 65536];

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Cmd::Send(data)) => {
                    let mut data = data.to_vec();
                    refresh_ts_rtp_time(&mut data);
                    let result = socket.send(&data).await;
                    queued_bytes.fetch_sub(data.len(), Ordering::Relaxed);
                    result.map_err(|e| (true, Error::from(e)))?;
                }
                Some(Cmd::ConnectUdp(remote)) => {
                    if connected {
                        return Err((false, Error::ErrSessionAlreadyConnected));
                    }
                    socket.connect(remote).await.map_err(|e| (false, Error::from(e)))?;
                    connected = true;
                }
                Some(Cmd::Destroy) | None => return Ok(()),
            },
            received = socket.recv_from(&mut buf) => {
                let (n, from) = received.map_err(|e| (false, Error::from(e)))?;
                let _ = notify.send(SessionEvent::Datagram {
                    session_id: id,
                    datagram: Tagged::arrived(
                        TransportContext::udp(local, from),
                        BytesMut::from(&buf[..n]),
                    ),
                });
            }
        }
    }
}

/// Transport-stream RTP packets queued a while ago would carry a stale
/// clock; refresh the RTP timestamp right before the datagram hits the
/// wire.
fn refresh_ts_rtp_time(data: &mut [u8]) {
    if data.len() >= 12 && data[0] == 0x80 && (data[1] & 0x7f) == 33 {
        let now_us = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        let rtp_time = shared::time::us_to_rtp_time(now_us);
        data[4..8].copy_from_slice(&rtp_time.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn recv_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_rtsp_client_server_exchange() {
        let net = NetworkSession::new(true);
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bound = listener.local_addr().unwrap();
        drop(listener);
        let _server = net.create_rtsp_server(bound, server_tx).await.unwrap();

        let client = net.create_rtsp_client(bound, client_tx).await.unwrap();

        assert!(matches!(
            recv_event(&mut client_rx).await,
            SessionEvent::Connected { .. }
        ));

        let accepted = match recv_event(&mut server_rx).await {
            SessionEvent::ClientConnected { session_id, .. } => session_id,
            other => panic!("unexpected event {other:?}"),
        };

        net.send_request(
            client,
            Bytes::from_static(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n"),
        )
        .unwrap();

        match recv_event(&mut server_rx).await {
            SessionEvent::Data { message, .. } => {
                assert_eq!(message.request_line().unwrap().0, "OPTIONS");
            }
            other => panic!("unexpected event {other:?}"),
        }

        net.send_request(
            accepted,
            Bytes::from_static(b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n"),
        )
        .unwrap();

        match recv_event(&mut client_rx).await {
            SessionEvent::Data { message, .. } => {
                assert_eq!(message.status_code(), Some(200));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_udp_session_round_trip() {
        let net = NetworkSession::new(true);
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();

        // Session A on a kernel-picked port; find its port by sending to B.
        let b_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_port = b_socket.local_addr().unwrap().port();
        drop(b_socket);

        let (b, _) = net.create_udp_session(b_port, None, b_tx).await.unwrap();
        let (a, _) = net
            .create_udp_session(0, Some(([127, 0, 0, 1], b_port).into()), a_tx)
            .await
            .unwrap();

        net.send_request(a, Bytes::from_static(b"ping")).unwrap();

        let from = match recv_event(&mut b_rx).await {
            SessionEvent::Datagram { datagram, .. } => {
                assert_eq!(&datagram.payload[..], b"ping");
                assert_eq!(datagram.transport.protocol, shared::TransportProtocol::Udp);
                datagram.transport.peer_addr
            }
            other => panic!("unexpected event {other:?}"),
        };

        // Late binding of the reply path.
        net.connect_udp_session(b, from).unwrap();
        net.send_request(b, Bytes::from_static(b"pong")).unwrap();

        match recv_event(&mut a_rx).await {
            SessionEvent::Datagram { datagram, .. } => assert_eq!(&datagram.payload[..], b"pong"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tcp_datagram_framing() {
        let net = NetworkSession::new(true);
        let (passive_tx, mut passive_rx) = mpsc::unbounded_channel();
        let (active_tx, mut active_rx) = mpsc::unbounded_channel();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let _passive = net
            .create_tcp_datagram_session_passive(port, passive_tx)
            .await
            .unwrap();
        let active = net
            .create_tcp_datagram_session_active(([127, 0, 0, 1], port).into(), active_tx)
            .await
            .unwrap();

        assert!(matches!(
            recv_event(&mut active_rx).await,
            SessionEvent::Connected { .. }
        ));
        assert!(matches!(
            recv_event(&mut passive_rx).await,
            SessionEvent::ClientConnected { .. }
        ));

        net.send_request(active, Bytes::from_static(b"datagram one"))
            .unwrap();
        net.send_request(active, Bytes::from_static(b"two")).unwrap();

        match recv_event(&mut passive_rx).await {
            SessionEvent::Datagram { datagram, .. } => {
                assert_eq!(&datagram.payload[..], b"datagram one");
                assert_eq!(datagram.transport.protocol, shared::TransportProtocol::Tcp);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match recv_event(&mut passive_rx).await {
            SessionEvent::Datagram { datagram, .. } => assert_eq!(&datagram.payload[..], b"two"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_destroyed_session_rejects_sends() {
        let net = NetworkSession::new(true);
        let (tx, _rx) = mpsc::unbounded_channel();
        let (id, _) = net.create_udp_session(0, None, tx).await.unwrap();
        net.destroy_session(id);

        assert_eq!(
            net.send_request(id, Bytes::from_static(b"x")),
            Err(Error::ErrNoSuchSession)
        );
    }
}
