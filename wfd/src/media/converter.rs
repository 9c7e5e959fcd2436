//! Wraps an encoder into an actor: raw access units in, timestamped
//! encoded units out, with codec-specific-data prefixing, silence
//! suppression and the raw LPCM grouping path.

use crate::media::{AccessUnit, Encoder};
use bytes::{BufMut, Bytes, BytesMut};
use shared::error::Error;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// The converter is fed straight from a graphics producer; there is no
/// explicit input queue to service.
pub const FLAG_USE_SURFACE_INPUT: u32 = 1;
/// Re-prefix SPS/PPS onto every IDR frame, for encoders that do not do it
/// themselves.
pub const FLAG_PREPEND_CSD_IF_NECESSARY: u32 = 2;

/// All-zero audio longer than this switches the converter into silent
/// mode.
const SILENT_AFTER: Duration = Duration::from_secs(10);

// LPCM grouping: 6 AUs x 80 frames x 2 channels x 16-bit samples per PES
// payload, behind a 4-byte Wi-Fi Display header.
const LPCM_FRAME_SIZE: usize = 4;
const LPCM_FRAMES_PER_AU: usize = 80;
const LPCM_AUS_PER_PES: usize = 6;
const LPCM_PAYLOAD_SIZE: usize = LPCM_AUS_PER_PES * LPCM_FRAMES_PER_AU * LPCM_FRAME_SIZE;
const LPCM_SAMPLE_RATE: f64 = 48_000.0;

#[derive(Debug)]
pub enum ConverterEvent {
    AccessUnit(AccessUnit),
    Eos,
    Error(Error),
    ShutdownCompleted,
}

enum Cmd {
    Input(AccessUnit),
    InputEos,
    SetVideoBitrate(u32),
    RequestIdrFrame,
    DropAFrame,
    SuspendEncoding(bool),
    Shutdown,
}

/// Handle to a converter actor.
pub struct Converter {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    video_bitrate: std::sync::Arc<std::sync::atomic::AtomicU32>,
}

impl Converter {
    /// Spawns the actor. `encoder` is `None` for the raw LPCM path, which
    /// needs no codec engine at all.
    pub fn spawn(
        encoder: Option<Box<dyn Encoder>>,
        is_audio: bool,
        flags: u32,
        initial_video_bitrate: u32,
        notify: mpsc::UnboundedSender<ConverterEvent>,
    ) -> Converter {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let video_bitrate = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(
            initial_video_bitrate,
        ));

        let actor = ConverterActor {
            encoder,
            is_audio,
            flags,
            notify,
            csd_sent: false,
            first_silent_frame: None,
            in_silent_mode: false,
            drop_next_frame: false,
            encoding_suspended: false,
            partial_audio_au: None,
            video_bitrate: video_bitrate.clone(),
        };
        tokio::spawn(actor.run(cmd_rx));

        Converter {
            cmd_tx,
            video_bitrate,
        }
    }

    pub fn feed(&self, unit: AccessUnit) {
        let _ = self.cmd_tx.send(Cmd::Input(unit));
    }

    pub fn feed_eos(&self) {
        let _ = self.cmd_tx.send(Cmd::InputEos);
    }

    pub fn video_bitrate(&self) -> u32 {
        self.video_bitrate.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_video_bitrate(&self, bitrate_bps: u32) {
        let _ = self.cmd_tx.send(Cmd::SetVideoBitrate(bitrate_bps));
    }

    pub fn request_idr_frame(&self) {
        let _ = self.cmd_tx.send(Cmd::RequestIdrFrame);
    }

    pub fn drop_a_frame(&self) {
        let _ = self.cmd_tx.send(Cmd::DropAFrame);
    }

    pub fn suspend_encoding(&self, suspend: bool) {
        let _ = self.cmd_tx.send(Cmd::SuspendEncoding(suspend));
    }

    /// Asks the actor to wind down; a `ShutdownCompleted` event follows.
    pub fn shutdown_async(&self) {
        let _ = self.cmd_tx.send(Cmd::Shutdown);
    }
}

struct ConverterActor {
    encoder: Option<Box<dyn Encoder>>,
    is_audio: bool,
    flags: u32,
    notify: mpsc::UnboundedSender<ConverterEvent>,

    csd_sent: bool,
    first_silent_frame: Option<Instant>,
    in_silent_mode: bool,
    drop_next_frame: bool,
    encoding_suspended: bool,

    /// Partially filled LPCM group awaiting more samples.
    partial_audio_au: Option<(BytesMut, i64)>,

    video_bitrate: std::sync::Arc<std::sync::atomic::AtomicU32>,
}

impl ConverterActor {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Cmd>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Cmd::Input(unit) => self.on_input(unit),
                Cmd::InputEos => {
                    let _ = self.notify.send(ConverterEvent::Eos);
                }
                Cmd::SetVideoBitrate(bitrate) => {
                    self.video_bitrate
                        .store(bitrate, std::sync::atomic::Ordering::Relaxed);
                    if let Some(encoder) = self.encoder.as_mut() {
                        if let Err(e) = encoder.set_video_bitrate(bitrate) {
                            let _ = self.notify.send(ConverterEvent::Error(e));
                        }
                    }
                }
                Cmd::RequestIdrFrame => {
                    if let Some(encoder) = self.encoder.as_mut() {
                        let _ = encoder.request_idr_frame();
                    }
                }
                Cmd::DropAFrame => self.drop_next_frame = true,
                Cmd::SuspendEncoding(suspend) => {
                    self.encoding_suspended = suspend;
                    if let Some(encoder) = self.encoder.as_mut() {
                        let _ = encoder.drop_input_frames(suspend);
                    }
                }
                Cmd::Shutdown => {
                    let _ = self.notify.send(ConverterEvent::ShutdownCompleted);
                    return;
                }
            }
        }
    }

    fn on_input(&mut self, unit: AccessUnit) {
        if self.is_audio && self.detect_silence(&unit) {
            return;
        }

        if self.encoder.is_none() {
            // Raw LPCM needs no encoder; group and frame the samples.
            self.feed_raw_audio(unit);
            return;
        }

        if self.drop_next_frame && !self.is_audio {
            self.drop_next_frame = false;
            return;
        }
        if self.encoding_suspended && !self.is_audio {
            return;
        }

        let encoder = self.encoder.as_mut().unwrap();
        if let Err(e) = encoder.queue_input(unit) {
            let _ = self.notify.send(ConverterEvent::Error(e));
            return;
        }

        loop {
            match self.encoder.as_mut().unwrap().dequeue_output() {
                Ok(Some(output)) => {
                    if output.is_eos {
                        let _ = self.notify.send(ConverterEvent::Eos);
                        return;
                    }
                    self.emit_output(output);
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = self.notify.send(ConverterEvent::Error(e));
                    return;
                }
            }
        }
    }

    /// Prefix codec-specific data on the first emitted buffer, and on each
    /// IDR when the encoder cannot do it itself.
    fn emit_output(&mut self, mut output: AccessUnit) {
        let needs_csd = !self.csd_sent
            || (self.flags & FLAG_PREPEND_CSD_IF_NECESSARY != 0
                && !self.is_audio
                && mpegts::format::is_idr(&output.data));

        if needs_csd && !output.is_csd {
            let csd = self.encoder.as_ref().unwrap().codec_specific_data();
            if !csd.is_empty() {
                let csd_size: usize = csd.iter().map(Bytes::len).sum();
                let mut data = BytesMut::with_capacity(csd_size + output.data.len());
                for chunk in &csd {
                    data.extend_from_slice(chunk);
                }
                data.extend_from_slice(&output.data);
                output.data = data.freeze();
            }
        }
        self.csd_sent = true;

        let _ = self.notify.send(ConverterEvent::AccessUnit(output));
    }

    /// Tracks runs of all-zero audio; in silent mode the frames are
    /// dropped until real audio returns.
    fn detect_silence(&mut self, unit: &AccessUnit) -> bool {
        if unit.data.iter().all(|&b| b == 0) {
            if self.in_silent_mode {
                return true;
            }
            match self.first_silent_frame {
                None => self.first_silent_frame = Some(Instant::now()),
                Some(first) if first.elapsed() >= SILENT_AFTER => {
                    log::info!("audio in silent mode now");
                    self.in_silent_mode = true;
                    return true;
                }
                Some(_) => {}
            }
        } else {
            if self.in_silent_mode {
                log::info!("audio no longer in silent mode");
            }
            self.in_silent_mode = false;
            self.first_silent_frame = None;
        }
        false
    }

    /// Splits incoming PCM audio into groups of 6 AUs of 80 stereo frames
    /// each, framed with the 4-byte Wi-Fi Display LPCM header, samples
    /// byte-swapped to network order.
    fn feed_raw_audio(&mut self, unit: AccessUnit) {
        let mut swapped = BytesMut::from(&unit.data[..]);
        for sample in swapped.chunks_exact_mut(2) {
            sample.swap(0, 1);
        }

        let mut offset = 0usize;
        let mut time_us = unit.time_us;

        while offset < swapped.len() {
            let (mut group, group_time) = self.partial_audio_au.take().unwrap_or_else(|| {
                let mut group = BytesMut::with_capacity(4 + LPCM_PAYLOAD_SIZE);
                group.put_u8(0xa0);
                group.put_u8(LPCM_AUS_PER_PES as u8);
                group.put_u8(0); // reserved, audio_emphasis_flag = 0

                // quantization 16-bit, 48 kHz, stereo
                let quantization_word_length = 0u8;
                let audio_sampling_frequency = 2u8;
                let number_of_audio_channels = 1u8;
                group.put_u8(
                    (quantization_word_length << 6)
                        | (audio_sampling_frequency << 3)
                        | number_of_audio_channels,
                );
                (group, time_us)
            });

            let missing = 4 + LPCM_PAYLOAD_SIZE - group.len();
            let copy = missing.min(swapped.len() - offset);
            group.extend_from_slice(&swapped[offset..offset + copy]);
            offset += copy;
            time_us += ((copy / LPCM_FRAME_SIZE) as f64 * 1e6 / LPCM_SAMPLE_RATE) as i64;

            if group.len() == 4 + LPCM_PAYLOAD_SIZE {
                let _ = self.notify.send(ConverterEvent::AccessUnit(AccessUnit::new(
                    group.freeze(),
                    group_time,
                )));
            } else {
                self.partial_audio_au = Some((group, group_time));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::error::Result;

    /// Doubles every input unit's bytes, emitting one output per input.
    struct DoublingEncoder {
        pending: Vec<AccessUnit>,
        csd: Vec<Bytes>,
        bitrate: u32,
    }

    impl Encoder for DoublingEncoder {
        fn queue_input(&mut self, unit: AccessUnit) -> Result<()> {
            let mut data = BytesMut::new();
            data.extend_from_slice(&unit.data);
            data.extend_from_slice(&unit.data);
            self.pending.push(AccessUnit::new(data.freeze(), unit.time_us));
            Ok(())
        }

        fn dequeue_output(&mut self) -> Result<Option<AccessUnit>> {
            Ok(if self.pending.is_empty() {
                None
            } else {
                Some(self.pending.remove(0))
            })
        }

        fn codec_specific_data(&self) -> Vec<Bytes> {
            self.csd.clone()
        }

        fn set_video_bitrate(&mut self, bitrate_bps: u32) -> Result<()> {
            self.bitrate = bitrate_bps;
            Ok(())
        }
    }

    fn encoder() -> Box<DoublingEncoder> {
        Box::new(DoublingEncoder {
            pending: Vec::new(),
            csd: vec![Bytes::from_static(&[0, 0, 0, 1, 0x67, 0xee])],
            bitrate: 0,
        })
    }

    #[tokio::test]
    async fn test_csd_prefixed_on_first_output_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let converter = Converter::spawn(Some(encoder()), false, 0, 5_000_000, tx);

        converter.feed(AccessUnit::new(Bytes::from_static(&[0xab]), 0));
        converter.feed(AccessUnit::new(Bytes::from_static(&[0xcd]), 33_000));

        match rx.recv().await.unwrap() {
            ConverterEvent::AccessUnit(unit) => {
                assert_eq!(&unit.data[..6], &[0, 0, 0, 1, 0x67, 0xee]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await.unwrap() {
            ConverterEvent::AccessUnit(unit) => {
                assert_eq!(&unit.data[..], &[0xcd, 0xcd]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lpcm_grouping_and_byte_swap() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let converter = Converter::spawn(None, true, 0, 0, tx);

        // Exactly one group of samples 0x0102 little... the converter swaps
        // byte pairs as-is.
        let mut samples = Vec::with_capacity(LPCM_PAYLOAD_SIZE);
        for _ in 0..LPCM_PAYLOAD_SIZE / 2 {
            samples.extend_from_slice(&[0x01, 0x02]);
        }
        converter.feed(AccessUnit::new(samples.into(), 1000));

        match rx.recv().await.unwrap() {
            ConverterEvent::AccessUnit(unit) => {
                assert_eq!(unit.data.len(), 4 + LPCM_PAYLOAD_SIZE);
                assert_eq!(unit.data[0], 0xa0);
                assert_eq!(unit.data[1], 6);
                assert_eq!(unit.data[2], 0);
                assert_eq!(unit.data[3], (2 << 3) | 1);
                // Samples arrive byte-swapped to network order.
                assert_eq!(&unit.data[4..6], &[0x02, 0x01]);
                assert_eq!(unit.time_us, 1000);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lpcm_partial_groups_carry_over() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let converter = Converter::spawn(None, true, 0, 0, tx);

        // A group and a half: exactly one full AU comes out, the rest is
        // held back.
        let samples = vec![0x11u8; LPCM_PAYLOAD_SIZE * 3 / 2];
        converter.feed(AccessUnit::new(samples.into(), 0));

        assert!(matches!(
            rx.recv().await.unwrap(),
            ConverterEvent::AccessUnit(_)
        ));

        // The second half arrives; another full AU completes.
        let samples = vec![0x11u8; LPCM_PAYLOAD_SIZE / 2];
        converter.feed(AccessUnit::new(samples.into(), 40_000));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ConverterEvent::AccessUnit(_)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_completes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let converter = Converter::spawn(Some(encoder()), false, 0, 0, tx);

        converter.shutdown_async();
        assert!(matches!(
            rx.recv().await.unwrap(),
            ConverterEvent::ShutdownCompleted
        ));
    }

    #[tokio::test]
    async fn test_drop_a_frame_drops_exactly_one() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let converter = Converter::spawn(Some(encoder()), false, 0, 0, tx);

        converter.drop_a_frame();
        converter.feed(AccessUnit::new(Bytes::from_static(&[1]), 0));
        converter.feed(AccessUnit::new(Bytes::from_static(&[2]), 1));

        match rx.recv().await.unwrap() {
            ConverterEvent::AccessUnit(unit) => {
                // Only the second frame survived.
                assert_eq!(&unit.data[unit.data.len() - 2..], &[2, 2]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
