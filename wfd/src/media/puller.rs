//! Pulls access units off a blocking capture source on a dedicated
//! thread, one unit per loop iteration.

use crate::media::{AccessUnit, CaptureSource};
use shared::error::Error;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[derive(Debug)]
pub enum PullerEvent {
    AccessUnit(AccessUnit),
    Eos,
    Error(Error),
}

enum Cmd {
    Start,
    Pause,
    Resume,
    /// Stop is asynchronous; the completion is signalled through the
    /// carried channel once the source is released.
    Stop(tokio::sync::oneshot::Sender<()>),
}

/// Handle to a puller thread. Dropping the handle stops the thread.
pub struct MediaPuller {
    cmd_tx: mpsc::Sender<Cmd>,
    join: Option<thread::JoinHandle<()>>,
}

impl MediaPuller {
    pub fn new(
        source: Box<dyn CaptureSource>,
        notify: tokio::sync::mpsc::UnboundedSender<PullerEvent>,
        name: &str,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let join = thread::Builder::new()
            .name(format!("wfd-puller-{name}"))
            .spawn(move || pull_loop(source, cmd_rx, notify))
            .expect("failed to spawn puller thread");

        Self {
            cmd_tx,
            join: Some(join),
        }
    }

    pub fn start(&self) {
        let _ = self.cmd_tx.send(Cmd::Start);
    }

    pub fn pause(&self) {
        let _ = self.cmd_tx.send(Cmd::Pause);
    }

    pub fn resume(&self) {
        let _ = self.cmd_tx.send(Cmd::Resume);
    }

    /// Requests the loop to stop; resolves once the capture source has
    /// been released.
    pub fn stop_async(&self) -> tokio::sync::oneshot::Receiver<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _ = self.cmd_tx.send(Cmd::Stop(tx));
        rx
    }
}

impl Drop for MediaPuller {
    fn drop(&mut self) {
        let (tx, _rx) = tokio::sync::oneshot::channel();
        let _ = self.cmd_tx.send(Cmd::Stop(tx));
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn pull_loop(
    mut source: Box<dyn CaptureSource>,
    cmd_rx: mpsc::Receiver<Cmd>,
    notify: tokio::sync::mpsc::UnboundedSender<PullerEvent>,
) {
    let mut started = false;
    let mut paused = false;

    'outer: loop {
        // Block while idle, poll between reads while running.
        let first_cmd = if started {
            match cmd_rx.try_recv() {
                Ok(cmd) => Some(cmd),
                Err(mpsc::TryRecvError::Empty) => None,
                Err(mpsc::TryRecvError::Disconnected) => break,
            }
        } else {
            match cmd_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(cmd) => Some(cmd),
                Err(mpsc::RecvTimeoutError::Timeout) => None,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        };

        let mut cmd = first_cmd;
        while let Some(c) = cmd {
            match c {
                Cmd::Start => {
                    if !started {
                        if let Err(e) = source.start() {
                            let _ = notify.send(PullerEvent::Error(e));
                            break 'outer;
                        }
                        started = true;
                        paused = false;
                    }
                }
                Cmd::Pause => paused = true,
                Cmd::Resume => paused = false,
                Cmd::Stop(reply) => {
                    if started {
                        let _ = source.stop();
                    }
                    let _ = reply.send(());
                    break 'outer;
                }
            }
            cmd = cmd_rx.try_recv().ok();
        }

        if !started {
            continue;
        }

        match source.read() {
            Ok(unit) if unit.is_eos => {
                let _ = notify.send(PullerEvent::Eos);
                started = false;
            }
            Ok(unit) => {
                // While paused the capture keeps flowing but nothing is
                // forwarded downstream.
                if !paused {
                    let _ = notify.send(PullerEvent::AccessUnit(unit));
                }
            }
            Err(e) => {
                let _ = notify.send(PullerEvent::Error(e));
                started = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use shared::error::Result;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct CountingSource {
        counter: i64,
        stopped: Arc<AtomicBool>,
    }

    impl CaptureSource for CountingSource {
        fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn read(&mut self) -> Result<AccessUnit> {
            self.counter += 1;
            thread::sleep(Duration::from_millis(1));
            Ok(AccessUnit::new(Bytes::from_static(b"frame"), self.counter))
        }
    }

    #[tokio::test]
    async fn test_puller_emits_then_stops() {
        let stopped = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let puller = MediaPuller::new(
            Box::new(CountingSource {
                counter: 0,
                stopped: stopped.clone(),
            }),
            tx,
            "test",
        );

        puller.start();
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, PullerEvent::AccessUnit(_)));

        puller.stop_async().await.unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_paused_puller_forwards_nothing() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let puller = MediaPuller::new(
            Box::new(CountingSource {
                counter: 0,
                stopped: Arc::new(AtomicBool::new(false)),
            }),
            tx,
            "test",
        );

        puller.start();
        let _ = rx.recv().await.unwrap();
        puller.pause();

        // Drain anything that raced with the pause, then expect silence.
        tokio::time::sleep(Duration::from_millis(50)).await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        puller.resume();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_ok());

        puller.stop_async().await.unwrap();
    }
}
