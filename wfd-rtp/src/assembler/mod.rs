//! Receiver-side assemblers turning RTP payloads back into access units.

mod aac;
mod h264;
mod ts;

pub use aac::AacAssembler;
pub use h264::H264Assembler;
pub use ts::TsAssembler;

use crate::packet::Packet;
use bytes::Bytes;
use shared::error::Result;

/// An access unit produced by an assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledUnit {
    pub data: Bytes,
    /// Presentation time derived from the RTP timestamp (90 kHz grid).
    pub time_us: i64,
    /// Set when the unit is the first one after a reorder/loss gap.
    pub follows_discontinuity: bool,
}

/// Turns a strictly-ordered sequence of RTP packets into access units.
///
/// `process_packet` consumes packets in extended-sequence order; completed
/// units are drained through `poll_unit`. A processing error resets the
/// assembler to a clean state; the offending packet is dropped.
pub trait Assembler: Send {
    /// Notes that one or more packets were lost before the next
    /// `process_packet` call.
    fn signal_discontinuity(&mut self);

    fn process_packet(&mut self, packet: &Packet) -> Result<()>;

    fn poll_unit(&mut self) -> Option<AssembledUnit>;
}
