//! A video source adapter that re-emits the most recent captured frame at
//! a fixed cadence, so the encoder keeps producing output even when the
//! capture surface goes idle.

use crate::media::{AccessUnit, CaptureSource};
use shared::error::{Error, Result};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// A dormant repeater releases its pacing state after this much idle time.
const SUSPEND_AFTER: Duration = Duration::from_secs(1);

struct Shared {
    buffer: Option<AccessUnit>,
    failure: Option<String>,
    /// `None` while dormant.
    last_buffer_update: Option<Instant>,
    rate_hz: f64,
    stopping: bool,
}

/// Wraps a real capture source; a background thread keeps reading it and
/// the repeater's own `read` paces re-emission of the latest frame.
pub struct RepeaterSource {
    inner: Option<Box<dyn CaptureSource>>,
    shared: Arc<(Mutex<Shared>, Condvar)>,
    reader: Option<thread::JoinHandle<Box<dyn CaptureSource>>>,

    /// Timestamps are measured against this fixed origin so they stay
    /// monotonic across dormancy.
    clock_origin: Instant,
    start_time: Option<Instant>,
    frame_count: u64,
    paced_rate_hz: f64,
}

/// Shared control surface over a repeater whose `RepeaterSource` has been
/// handed off to a puller thread.
#[derive(Clone)]
pub struct RepeaterControl {
    shared: Arc<(Mutex<Shared>, Condvar)>,
}

impl RepeaterControl {
    pub fn frame_rate(&self) -> f64 {
        self.shared.0.lock().unwrap().rate_hz
    }

    pub fn set_frame_rate(&self, rate_hz: f64) {
        self.shared.0.lock().unwrap().rate_hz = rate_hz;
    }

    /// Re-arms a dormant repeater so the next `read` returns promptly.
    pub fn wake_up(&self) {
        let (mutex, condvar) = &*self.shared;
        let mut shared = mutex.lock().unwrap();
        if shared.last_buffer_update.is_none() && shared.buffer.is_some() {
            shared.last_buffer_update = Some(Instant::now());
            condvar.notify_all();
        }
    }

    /// Unblocks a `read` waiting for a first frame, so the puller thread
    /// can wind down even when the capture never produced anything.
    pub fn shutdown(&self) {
        let (mutex, condvar) = &*self.shared;
        mutex.lock().unwrap().stopping = true;
        condvar.notify_all();
    }
}

impl RepeaterSource {
    pub fn new(source: Box<dyn CaptureSource>, rate_hz: f64) -> Self {
        Self {
            inner: Some(source),
            shared: Arc::new((
                Mutex::new(Shared {
                    buffer: None,
                    failure: None,
                    last_buffer_update: None,
                    rate_hz,
                    stopping: false,
                }),
                Condvar::new(),
            )),
            reader: None,
            clock_origin: Instant::now(),
            start_time: None,
            frame_count: 0,
            paced_rate_hz: rate_hz,
        }
    }

    /// A clonable control handle usable after the source itself has moved
    /// into a puller.
    pub fn control(&self) -> RepeaterControl {
        RepeaterControl {
            shared: self.shared.clone(),
        }
    }

    pub fn frame_rate(&self) -> f64 {
        self.shared.0.lock().unwrap().rate_hz
    }

    fn failure(&self, shared: &Shared) -> Option<Error> {
        shared.failure.as_ref().map(|m| Error::Other(m.clone()))
    }
}

impl CaptureSource for RepeaterSource {
    fn start(&mut self) -> Result<()> {
        let mut source = self.inner.take().ok_or(Error::ErrInvalidOperation)?;
        source.start()?;

        {
            let mut shared = self.shared.0.lock().unwrap();
            shared.buffer = None;
            shared.failure = None;
            shared.last_buffer_update = None;
            shared.stopping = false;
        }
        self.start_time = None;
        self.frame_count = 0;

        let shared = self.shared.clone();
        let join = thread::Builder::new()
            .name("wfd-repeater".into())
            .spawn(move || {
                loop {
                    let read = source.read();
                    let (mutex, condvar) = &*shared;
                    let mut state = mutex.lock().unwrap();
                    if state.stopping {
                        break;
                    }
                    match read {
                        Ok(unit) => {
                            state.buffer = Some(unit);
                            state.last_buffer_update = Some(Instant::now());
                        }
                        Err(e) => {
                            state.buffer = None;
                            state.failure = Some(e.to_string());
                        }
                    }
                    let failed = state.failure.is_some();
                    condvar.notify_all();
                    if failed {
                        break;
                    }
                }
                source
            })
            .expect("failed to spawn repeater thread");

        self.reader = Some(join);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        {
            let (mutex, condvar) = &*self.shared;
            let mut shared = mutex.lock().unwrap();
            shared.stopping = true;
            condvar.notify_all();
        }

        if let Some(join) = self.reader.take() {
            // The reader hands the inner source back so it can be stopped
            // and the repeater restarted later.
            if let Ok(mut source) = join.join() {
                source.stop()?;
                self.inner = Some(source);
            }
        }
        Ok(())
    }

    fn read(&mut self) -> Result<AccessUnit> {
        loop {
            let buffer_time;

            if self.start_time.is_none() {
                // Wait until the capture produced its first (or, when
                // waking from dormancy, next) frame.
                let (mutex, condvar) = &*self.shared;
                let mut shared = mutex.lock().unwrap();
                while (shared.last_buffer_update.is_none() || shared.buffer.is_none())
                    && shared.failure.is_none()
                    && !shared.stopping
                {
                    shared = condvar.wait(shared).unwrap();
                }
                if shared.stopping {
                    return Err(Error::ErrInvalidOperation);
                }
                if let Some(e) = self.failure(&shared) {
                    return Err(e);
                }
                drop(shared);

                self.start_time = Some(Instant::now());
                buffer_time = Instant::now();
            } else {
                let rate = self.frame_rate();
                if rate != self.paced_rate_hz {
                    // Rate changed under us: re-anchor so the new cadence
                    // takes over at the next frame slot.
                    let elapsed = Duration::from_secs_f64(
                        self.frame_count as f64 / self.paced_rate_hz.max(1.0),
                    );
                    self.start_time = Some(self.start_time.unwrap() + elapsed);
                    self.frame_count = 0;
                    self.paced_rate_hz = rate;
                }

                let start = self.start_time.unwrap();
                let target =
                    start + Duration::from_secs_f64(self.frame_count as f64 / rate.max(1.0));

                let now = Instant::now();
                if target > now {
                    thread::sleep(target - now);
                }
                buffer_time = target;
            }

            let (mutex, _) = &*self.shared;
            let mut shared = mutex.lock().unwrap();
            if let Some(e) = self.failure(&shared) {
                return Err(e);
            }

            // Go dormant when the capture surface has been idle too long;
            // the next wake_up re-arms the pacing.
            let stale = match shared.last_buffer_update {
                Some(last) => last.elapsed() > SUSPEND_AFTER,
                None => true,
            };
            if stale {
                shared.last_buffer_update = None;
                drop(shared);
                self.start_time = None;
                self.frame_count = 0;
                log::debug!("repeater now dormant");
                continue;
            }

            let mut unit = shared.buffer.as_ref().unwrap().clone();
            drop(shared);

            unit.time_us = buffer_time.duration_since(self.clock_origin).as_micros() as i64;
            self.frame_count += 1;
            return Ok(unit);
        }
    }
}
