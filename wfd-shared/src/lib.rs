#![warn(rust_2018_idioms)]

pub mod error;
pub mod tcp_framing;
pub mod time;
pub mod transport;
pub mod util;

pub use transport::{Tagged, TaggedDatagram, TransportContext, TransportProtocol};
