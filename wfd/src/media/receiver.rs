//! The receive half of the media path: one RTP receiver per track, or a
//! single receiver whose transport-stream packets are handed to an
//! external demuxer.

use bytes::Bytes;
use rtp::assembler::AssembledUnit;
use rtp::packetizer::PacketizationMode;
use rtp::receiver::{Receiver, ReceiverEvent};
use rtp::{PAYLOAD_TYPE_AAC, PAYLOAD_TYPE_H264, PAYLOAD_TYPE_TS};
use shared::error::{Error, Result};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum ReceiverMode {
    #[default]
    Undefined,
    ElementaryStreams,
    /// A single track whose access units are 188-byte TS packet runs,
    /// forwarded to an external demuxer.
    TransportStream,
}

#[derive(Debug)]
pub enum MediaReceiverEvent {
    AccessUnit {
        track_index: usize,
        unit: AssembledUnit,
    },
    PacketLost {
        track_index: usize,
    },
    /// An RTCP datagram (RR or NACK) to send on the track's RTCP socket.
    RtcpReady {
        track_index: usize,
        data: Bytes,
    },
}

/// Mirrors [`crate::media::sender::MediaSender`] on the receiving side.
pub struct MediaReceiver {
    mode: ReceiverMode,
    tracks: Vec<Receiver>,
    events: VecDeque<MediaReceiverEvent>,
}

impl Default for MediaReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaReceiver {
    pub fn new() -> Self {
        Self {
            mode: ReceiverMode::Undefined,
            tracks: Vec::new(),
            events: VecDeque::new(),
        }
    }

    /// Adds one RTP channel with the conventional payload type map
    /// (33 → TS, 96 → AAC, 97 → H264).
    pub fn add_track(&mut self, enable_retransmission: Option<Duration>) -> Result<usize> {
        if self.mode != ReceiverMode::Undefined {
            return Err(Error::ErrInvalidOperation);
        }

        let mut receiver = Receiver::new();
        receiver.register_packet_type(PAYLOAD_TYPE_TS, PacketizationMode::TransportStream);
        receiver.register_packet_type(PAYLOAD_TYPE_AAC, PacketizationMode::Aac);
        receiver.register_packet_type(PAYLOAD_TYPE_H264, PacketizationMode::H264);
        if let Some(after) = enable_retransmission {
            receiver.enable_retransmission(after);
        }

        self.tracks.push(receiver);
        Ok(self.tracks.len() - 1)
    }

    pub fn init(&mut self, mode: ReceiverMode) -> Result<()> {
        if self.mode != ReceiverMode::Undefined || mode == ReceiverMode::Undefined {
            return Err(Error::ErrInvalidOperation);
        }
        if mode == ReceiverMode::TransportStream && self.tracks.len() > 1 {
            return Err(Error::ErrInvalidOperation);
        }
        self.mode = mode;
        Ok(())
    }

    pub fn mode(&self) -> ReceiverMode {
        self.mode
    }

    pub fn handle_rtp(&mut self, track_index: usize, now: Instant, data: &[u8]) -> Result<()> {
        let receiver = self
            .tracks
            .get_mut(track_index)
            .ok_or(Error::ErrTrackIndexOutOfRange)?;
        receiver.handle_rtp(now, data)?;
        self.drain(track_index);
        Ok(())
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.tracks.iter().filter_map(Receiver::poll_timeout).min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        for i in 0..self.tracks.len() {
            self.tracks[i].handle_timeout(now);
            self.drain(i);
        }
    }

    pub fn poll_event(&mut self) -> Option<MediaReceiverEvent> {
        self.events.pop_front()
    }

    fn drain(&mut self, track_index: usize) {
        while let Some(event) = self.tracks[track_index].poll_event() {
            let event = match event {
                ReceiverEvent::AccessUnit { unit, .. } => MediaReceiverEvent::AccessUnit {
                    track_index,
                    unit,
                },
                ReceiverEvent::PacketLost { .. } => {
                    MediaReceiverEvent::PacketLost { track_index }
                }
                ReceiverEvent::RtcpReady(data) => MediaReceiverEvent::RtcpReady {
                    track_index,
                    data,
                },
            };
            self.events.push_back(event);
        }
    }
}
