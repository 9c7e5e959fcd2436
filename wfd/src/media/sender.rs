//! Joins a set of tracks to RTP packetization: either one RTP channel per
//! elementary stream, or a single channel carrying the multiplexed
//! transport stream.

use crate::media::hdcp::{self, HdcpEncryptor};
use crate::media::rtp_sender::RtpSender;
use crate::media::AccessUnit;
use bytes::{Bytes, BytesMut};
use mpegts::packetizer::{
    EMIT_HDCP20_DESCRIPTOR, EMIT_PAT_AND_PMT, EMIT_PCR, IS_ENCRYPTED,
    PREPEND_SPS_PPS_TO_IDR_FRAMES,
};
use mpegts::{TrackFormat, TsPacketizer};
use rtcp::app::LatenessReport;
use rtp::packetizer::PacketizationMode;
use rtp::{PAYLOAD_TYPE_AAC, PAYLOAD_TYPE_H264, PAYLOAD_TYPE_TS};
use shared::error::{Error, Result};
use std::collections::VecDeque;

/// The encoder cannot prefix SPS/PPS itself; the sender must do it before
/// muxing (and before encryption).
pub const FLAG_MANUALLY_PREPEND_SPS_PPS: u32 = 1;

/// PAT/PMT and PCR cadence in the mux.
const PSI_INTERVAL_US: i64 = 100_000;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum Mode {
    #[default]
    Undefined,
    ElementaryStreams,
    TransportStream,
}

/// One datagram ready for the wire.
#[derive(Debug)]
pub struct OutputPacket {
    /// `None` for the shared transport-stream channel, `Some(i)` for
    /// track i's own RTP channel.
    pub track: Option<usize>,
    pub data: Bytes,
}

struct TrackInfo {
    format: TrackFormat,
    flags: u32,
    is_audio: bool,
    packetizer_track_index: usize,
    access_units: VecDeque<AccessUnit>,
    sender: Option<RtpSender>,
}

/// The send half of a playback session's media path.
pub struct MediaSender {
    mode: Mode,
    tracks: Vec<TrackInfo>,
    ts_packetizer: Option<TsPacketizer>,
    ts_sender: Option<RtpSender>,
    hdcp: Option<Box<dyn HdcpEncryptor>>,
    prev_psi_us: i64,
}

impl Default for MediaSender {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaSender {
    pub fn new() -> Self {
        Self {
            mode: Mode::Undefined,
            tracks: Vec::new(),
            ts_packetizer: None,
            ts_sender: None,
            hdcp: None,
            prev_psi_us: -1,
        }
    }

    /// Installs the content protection module. Must precede `init_*`.
    pub fn set_hdcp(&mut self, hdcp: Box<dyn HdcpEncryptor>) -> Result<()> {
        if self.mode != Mode::Undefined {
            return Err(Error::ErrInvalidOperation);
        }
        self.hdcp = Some(hdcp);
        Ok(())
    }

    pub fn add_track(&mut self, format: TrackFormat, flags: u32) -> Result<usize> {
        if self.mode != Mode::Undefined {
            return Err(Error::ErrInvalidOperation);
        }

        let is_audio = format.mime.is_audio();
        self.tracks.push(TrackInfo {
            format,
            flags,
            is_audio,
            packetizer_track_index: usize::MAX,
            access_units: VecDeque::new(),
            sender: None,
        });
        Ok(self.tracks.len() - 1)
    }

    /// Multiplexes every track into one transport stream on a single RTP
    /// channel.
    pub fn init_transport_stream(&mut self) -> Result<()> {
        if self.mode != Mode::Undefined {
            return Err(Error::ErrInvalidOperation);
        }

        let mut flags = 0;
        if self.hdcp.is_some() {
            flags |= EMIT_HDCP20_DESCRIPTOR;
        }
        let mut packetizer = TsPacketizer::new(flags);
        for track in &mut self.tracks {
            track.packetizer_track_index = packetizer.add_track(track.format.clone())?;
        }

        self.ts_packetizer = Some(packetizer);
        self.ts_sender = Some(RtpSender::new());
        self.mode = Mode::TransportStream;
        Ok(())
    }

    /// One RTP channel per track.
    pub fn init_elementary_streams(&mut self) -> Result<()> {
        if self.mode != Mode::Undefined {
            return Err(Error::ErrInvalidOperation);
        }
        for track in &mut self.tracks {
            track.sender = Some(RtpSender::new());
        }
        self.mode = Mode::ElementaryStreams;
        Ok(())
    }

    /// Feeds one encoded access unit in; returns the datagrams to put on
    /// the wire.
    pub fn queue_access_unit(
        &mut self,
        track_index: usize,
        access_unit: AccessUnit,
        now_us: i64,
    ) -> Result<Vec<OutputPacket>> {
        match self.mode {
            Mode::Undefined => Err(Error::ErrInvalidOperation),
            Mode::ElementaryStreams => {
                let track = self
                    .tracks
                    .get_mut(track_index)
                    .ok_or(Error::ErrTrackIndexOutOfRange)?;

                let (payload_type, mode) = if track.is_audio {
                    (PAYLOAD_TYPE_AAC, PacketizationMode::Aac)
                } else {
                    (PAYLOAD_TYPE_H264, PacketizationMode::H264)
                };

                let datagrams = track.sender.as_mut().unwrap().queue_buffer(
                    mode,
                    &access_unit.data,
                    payload_type,
                    access_unit.time_us,
                )?;

                Ok(datagrams
                    .into_iter()
                    .map(|data| OutputPacket {
                        track: Some(track_index),
                        data,
                    })
                    .collect())
            }
            Mode::TransportStream => {
                if track_index >= self.tracks.len() {
                    return Err(Error::ErrTrackIndexOutOfRange);
                }
                self.tracks[track_index].access_units.push_back(access_unit);

                let mut out = Vec::new();
                // Drain in presentation order: always mux the track whose
                // head unit has the smallest timestamp, as long as every
                // track has something queued.
                loop {
                    let mut min_track = None;
                    let mut min_time_us = i64::MAX;
                    for (i, track) in self.tracks.iter().enumerate() {
                        match track.access_units.front() {
                            None => {
                                min_track = None;
                                break;
                            }
                            Some(unit) if unit.time_us < min_time_us => {
                                min_time_us = unit.time_us;
                                min_track = Some(i);
                            }
                            Some(_) => {}
                        }
                    }

                    let Some(min_track) = min_track else {
                        return Ok(out);
                    };

                    let unit = self.tracks[min_track].access_units.pop_front().unwrap();
                    let ts_packets = self.packetize_access_unit(min_track, unit, now_us)?;

                    let datagrams = self.ts_sender.as_mut().unwrap().queue_buffer(
                        PacketizationMode::TransportStream,
                        &ts_packets,
                        PAYLOAD_TYPE_TS,
                        now_us,
                    )?;
                    out.extend(datagrams.into_iter().map(|data| OutputPacket {
                        track: None,
                        data,
                    }));
                }
            }
        }
    }

    fn packetize_access_unit(
        &mut self,
        track_index: usize,
        unit: AccessUnit,
        now_us: i64,
    ) -> Result<Bytes> {
        let track = &self.tracks[track_index];
        let packetizer = self.ts_packetizer.as_mut().unwrap();

        let mut flags = 0u32;
        let mut private_data: Option<[u8; 16]> = None;

        let manually_prepend_sps_pps = !track.is_audio
            && (track.flags & FLAG_MANUALLY_PREPEND_SPS_PPS != 0)
            && mpegts::format::is_idr(&unit.data);

        let mut payload = unit.data;

        if self.hdcp.is_some() && !track.is_audio {
            if manually_prepend_sps_pps {
                payload = packetizer
                    .prepend_csd(track.packetizer_track_index, &payload)?;
            }

            let mut plaintext = BytesMut::from(&payload[..]);
            let stream_ctr = track_index as u32;
            let input_ctr = self
                .hdcp
                .as_mut()
                .unwrap()
                .encrypt(&mut plaintext, stream_ctr)?;
            payload = plaintext.freeze();

            private_data = Some(hdcp::private_data(stream_ctr, input_ctr));
            flags |= IS_ENCRYPTED;
        } else if manually_prepend_sps_pps {
            flags |= PREPEND_SPS_PPS_TO_IDR_FRAMES;
        }

        if self.prev_psi_us < 0 || self.prev_psi_us + PSI_INTERVAL_US <= now_us {
            flags |= EMIT_PAT_AND_PMT | EMIT_PCR;
            self.prev_psi_us = now_us;
        }

        let track = &self.tracks[track_index];
        packetizer.packetize(
            track.packetizer_track_index,
            &payload,
            unit.time_us,
            flags,
            private_data.as_ref().map_or(&[], |p| &p[..]),
            if track.is_audio { 2 } else { 0 },
            now_us,
        )
    }

    /// Routes an inbound RTCP datagram to the right RTP sender.
    ///
    /// `track` is `None` for the shared TS channel. Returns retransmission
    /// datagrams plus any decoded lateness report.
    pub fn handle_rtcp(
        &mut self,
        track: Option<usize>,
        data: &[u8],
    ) -> Result<(Vec<OutputPacket>, Option<LatenessReport>)> {
        let sender = match track {
            None => self.ts_sender.as_mut().ok_or(Error::ErrInvalidOperation)?,
            Some(i) => self
                .tracks
                .get_mut(i)
                .and_then(|t| t.sender.as_mut())
                .ok_or(Error::ErrTrackIndexOutOfRange)?,
        };

        let outcome = sender.handle_rtcp(data)?;
        let packets = outcome
            .retransmissions
            .into_iter()
            .map(|data| OutputPacket { track, data })
            .collect();

        Ok((packets, outcome.inform_sender))
    }

    /// Shuts the content protection module down, if one was installed.
    pub fn shutdown(&mut self) {
        if let Some(mut hdcp) = self.hdcp.take() {
            hdcp.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpegts::packetizer::TsPacketHeader;
    use mpegts::TS_PACKET_SIZE;
    use std::collections::HashMap;

    fn video_format() -> TrackFormat {
        TrackFormat::avc(1280, 720, 30).with_csd(vec![
            Bytes::from_static(&[0, 0, 0, 1, 0x67, 0x42, 0xc0, 0x1f, 0x9a]),
            Bytes::from_static(&[0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80]),
        ])
    }

    fn video_au(i: i64) -> AccessUnit {
        let mut data = vec![0u8, 0, 0, 1, 0x41];
        data.extend(std::iter::repeat(i as u8).take(400));
        AccessUnit::new(data.into(), i * 33_333)
    }

    fn audio_au(i: i64) -> AccessUnit {
        AccessUnit::new(vec![0x22u8; 256].into(), i * 21_333)
    }

    #[test]
    fn test_ts_mode_interleaves_by_timestamp() {
        // §scenario "TS mux with two tracks": video and audio PES packets
        // come out interleaved by minimum timestamp, all continuity
        // counters correct, PCRs spaced at most 100 ms apart.
        let mut sender = MediaSender::new();
        let v = sender.add_track(video_format(), 0).unwrap();
        let a = sender.add_track(TrackFormat::lpcm(2, 48000), 0).unwrap();
        sender.init_transport_stream().unwrap();

        let mut rtp_payloads = Vec::new();
        for i in 0..64 {
            let now = i * 33_333;
            if i < 30 {
                for pkt in sender.queue_access_unit(v, video_au(i), now).unwrap() {
                    assert_eq!(pkt.track, None);
                    rtp_payloads.push(pkt.data);
                }
            }
            for pkt in sender.queue_access_unit(a, audio_au(i), now).unwrap() {
                rtp_payloads.push(pkt.data);
            }
        }

        // Unwrap RTP, collect TS packets, verify continuity per PID and
        // count PCRs.
        let mut counters: HashMap<u16, u8> = HashMap::new();
        let mut num_pcr = 0;
        let mut num_pat = 0;
        for datagram in &rtp_payloads {
            let packet = rtp::Packet::unmarshal(datagram).unwrap();
            assert_eq!(packet.header.payload_type, PAYLOAD_TYPE_TS);
            for ts in packet.payload.chunks(TS_PACKET_SIZE) {
                let header = TsPacketHeader::parse(ts).unwrap();
                if header.pid == mpegts::PID_PCR {
                    num_pcr += 1;
                }
                if header.pid == 0 {
                    num_pat += 1;
                }
                if !header.has_payload() {
                    continue;
                }
                if let Some(prev) = counters.get(&header.pid) {
                    assert_eq!(header.continuity_counter, (prev + 1) % 16);
                }
                counters.insert(header.pid, header.continuity_counter);
            }
        }

        // 30 video frames over a second with a 100 ms PSI cadence.
        assert!(num_pcr >= 10, "only {num_pcr} PCR packets");
        assert_eq!(num_pat, num_pcr);
    }

    #[test]
    fn test_elementary_mode_routes_per_track() {
        let mut sender = MediaSender::new();
        let v = sender.add_track(video_format(), 0).unwrap();
        let a = sender.add_track(TrackFormat::aac(2, 48000), 0).unwrap();
        sender.init_elementary_streams().unwrap();

        let out = sender.queue_access_unit(v, video_au(0), 0).unwrap();
        assert!(out.iter().all(|p| p.track == Some(v)));
        let packet = rtp::Packet::unmarshal(&out[0].data).unwrap();
        assert_eq!(packet.header.payload_type, PAYLOAD_TYPE_H264);

        let out = sender.queue_access_unit(a, audio_au(0), 0).unwrap();
        assert!(out.iter().all(|p| p.track == Some(a)));
        let packet = rtp::Packet::unmarshal(&out[0].data).unwrap();
        assert_eq!(packet.header.payload_type, PAYLOAD_TYPE_AAC);
    }

    struct XorHdcp;

    impl HdcpEncryptor for XorHdcp {
        fn encrypt(&mut self, data: &mut [u8], _stream_ctr: u32) -> Result<u64> {
            for b in data.iter_mut() {
                *b ^= 0x5a;
            }
            Ok(42)
        }
        fn shutdown(&mut self) {}
    }

    #[test]
    fn test_hdcp_encrypts_video_and_frames_private_data() {
        let mut sender = MediaSender::new();
        let v = sender.add_track(video_format(), 0).unwrap();
        sender.set_hdcp(Box::new(XorHdcp)).unwrap();
        sender.init_transport_stream().unwrap();

        let out = sender.queue_access_unit(v, video_au(0), 0).unwrap();
        assert!(!out.is_empty());

        // First TS packet of the PES carries the 0x8e private data flag and
        // a block with the marker bits set.
        let packet = rtp::Packet::unmarshal(&out[0].data).unwrap();
        let mut pes_packets = packet
            .payload
            .chunks(TS_PACKET_SIZE)
            .filter(|ts| TsPacketHeader::parse(ts).unwrap().pid == mpegts::PID_VIDEO_START);
        let first = pes_packets.next().unwrap();
        assert!(first.contains(&0x8e));
    }
}
