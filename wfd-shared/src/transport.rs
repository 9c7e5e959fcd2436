use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Instant;

/// Which kind of socket a session runs on.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    #[default]
    Udp,
    Tcp,
}

/// The endpoints a payload travelled between.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TransportContext {
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub protocol: TransportProtocol,
}

impl TransportContext {
    pub fn udp(local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            peer_addr,
            protocol: TransportProtocol::Udp,
        }
    }

    pub fn tcp(local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            peer_addr,
            protocol: TransportProtocol::Tcp,
        }
    }
}

/// A payload stamped at reception with its arrival time and transport
/// endpoints. The arrival instant anchors downstream timing decisions
/// (loss declaration, clock sync), so it is taken as close to the socket
/// as possible and carried along rather than re-sampled.
#[derive(Debug)]
pub struct Tagged<T> {
    pub arrival: Instant,
    pub transport: TransportContext,
    pub payload: T,
}

impl<T> Tagged<T> {
    /// Stamps `payload` as arriving now.
    pub fn arrived(transport: TransportContext, payload: T) -> Self {
        Self {
            arrival: Instant::now(),
            transport,
            payload,
        }
    }
}

/// The datagram shape every session `Datagram` event carries.
pub type TaggedDatagram = Tagged<BytesMut>;
