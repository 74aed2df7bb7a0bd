//! In-process capture device.
//!
//! [`MemoryDevice`] stands in for a real interface: frames pushed through its [`MemoryPeer`] are
//! captured, and injected frames come out of the peer. Useful for tests and for running the
//! socket without capture privileges.

use crate::device::{CaptureDevice, FrameHandler, FrameMeta};
use crate::error::DeviceError;
use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::trace;

enum Event {
    Frame(Vec<u8>),
    Wake,
}

#[derive(Debug, Default)]
struct Shared {
    timeout_ns: AtomicU64,
    failing_injections: AtomicUsize,
    failing_dispatches: AtomicBool,
    dispatches: AtomicUsize,
}

pub struct MemoryDevice {
    link: i32,
    incoming: Receiver<Event>,
    wake: Sender<Event>,
    injected: Sender<Vec<u8>>,
    shared: Arc<Shared>,
}

/// The far end of a [`MemoryDevice`].
#[derive(Clone)]
pub struct MemoryPeer {
    capture: Sender<Event>,
    injected: Receiver<Vec<u8>>,
    shared: Arc<Shared>,
}

impl MemoryDevice {
    pub fn new(link: i32) -> (Self, MemoryPeer) {
        let (capture_s, capture_r) = flume::unbounded();
        let (injected_s, injected_r) = flume::unbounded();
        let shared = Arc::new(Shared::default());
        shared
            .timeout_ns
            .store(Duration::from_millis(1).as_nanos() as u64, Ordering::Relaxed);

        (
            Self {
                link,
                incoming: capture_r,
                wake: capture_s.clone(),
                injected: injected_s,
                shared: Arc::clone(&shared),
            },
            MemoryPeer {
                capture: capture_s,
                injected: injected_r,
                shared,
            },
        )
    }

    fn timeout(&self) -> Duration {
        Duration::from_nanos(self.shared.timeout_ns.load(Ordering::Relaxed))
    }
}

impl CaptureDevice for MemoryDevice {
    fn link_type(&self) -> i32 {
        self.link
    }

    fn dispatch(&self, max: usize, handler: &mut FrameHandler<'_>) -> Result<usize, DeviceError> {
        self.shared.dispatches.fetch_add(1, Ordering::Relaxed);
        if self.shared.failing_dispatches.load(Ordering::Acquire) {
            return Err(DeviceError::Transient("injected dispatch failure".into()));
        }
        let deadline = Instant::now() + self.timeout();
        let mut count = 0;
        while count < max {
            // block for the first frame only, then drain what is already queued
            let ev = if count == 0 {
                match self.incoming.recv_deadline(deadline) {
                    Ok(ev) => ev,
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(DeviceError::Fatal("capture channel closed".into()))
                    }
                }
            } else {
                match self.incoming.try_recv() {
                    Ok(ev) => ev,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break,
                }
            };

            let frame = match ev {
                Event::Frame(frame) => frame,
                Event::Wake if count == 0 => return Err(DeviceError::Interrupted),
                Event::Wake => break,
            };

            count += 1;
            let meta = FrameMeta {
                caplen: frame.len(),
                len: frame.len(),
                timestamp: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default(),
            };
            if handler(&meta, &frame).is_break() {
                break;
            }
        }

        Ok(count)
    }

    fn inject(&self, frame: &[u8]) -> Result<(), DeviceError> {
        let fail = self
            .shared
            .failing_injections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(DeviceError::Transient("injected failure".into()));
        }

        trace!(len = frame.len(), "inject");
        self.injected
            .send(frame.to_vec())
            .map_err(|_| DeviceError::Transient("injection receiver dropped".into()))
    }

    fn break_loop(&self) {
        let _ = self.wake.send(Event::Wake);
    }

    fn set_timeout(&self, timeout: Duration) -> Result<(), DeviceError> {
        self.shared
            .timeout_ns
            .store(timeout.as_nanos() as u64, Ordering::Relaxed);
        Ok(())
    }
}

impl MemoryPeer {
    /// Queues a frame, as if captured on the wire.
    pub fn capture(&self, frame: Vec<u8>) {
        let _ = self.capture.send(Event::Frame(frame));
    }

    /// Frames the device has transmitted, in order.
    pub fn injected(&self) -> &Receiver<Vec<u8>> {
        &self.injected
    }

    /// Makes the next `n` injections fail.
    pub fn fail_injections(&self, n: usize) {
        self.shared.failing_injections.store(n, Ordering::Release);
    }

    /// Makes every dispatch fail with a transient error until turned off again.
    pub fn fail_dispatches(&self, fail: bool) {
        self.shared.failing_dispatches.store(fail, Ordering::Release);
    }

    /// The wait timeout the device was last configured with.
    pub fn timeout(&self) -> Duration {
        Duration::from_nanos(self.shared.timeout_ns.load(Ordering::Relaxed))
    }

    /// Number of dispatch calls so far.
    pub fn dispatches(&self) -> usize {
        self.shared.dispatches.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::ControlFlow;

    #[test]
    fn dispatch_respects_max_and_break() {
        let (dev, peer) = MemoryDevice::new(0);
        for i in 0..5u8 {
            peer.capture(vec![i; 3]);
        }

        let mut seen = vec![];
        let n = dev
            .dispatch(2, &mut |_, f| {
                seen.push(f[0]);
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(n, 2);

        let n = dev
            .dispatch(10, &mut |_, f| {
                seen.push(f[0]);
                ControlFlow::Break(())
            })
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn dispatch_times_out() {
        let (dev, _peer) = MemoryDevice::new(0);
        dev.set_timeout(Duration::from_millis(5)).unwrap();
        let start = Instant::now();
        let n = dev.dispatch(4, &mut |_, _| ControlFlow::Continue(())).unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn break_loop_interrupts() {
        let (dev, _peer) = MemoryDevice::new(0);
        dev.set_timeout(Duration::from_secs(10)).unwrap();
        dev.break_loop();
        assert_eq!(
            dev.dispatch(4, &mut |_, _| ControlFlow::Continue(())),
            Err(DeviceError::Interrupted)
        );
    }

    #[test]
    fn injection_failures() {
        let (dev, peer) = MemoryDevice::new(0);
        peer.fail_injections(1);
        assert!(dev.inject(b"a").is_err());
        dev.inject(b"b").unwrap();
        assert_eq!(peer.injected().try_recv().unwrap(), b"b".to_vec());
    }
}
