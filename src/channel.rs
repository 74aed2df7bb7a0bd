//! Double-buffered hand-off from producer threads to the transmitter.
//!
//! Two buffers of identical capacity exist at any time: the active one lives inside the mutex and
//! receives appends from [`SendChannel::push`], the draining one is owned by the [`Transmitter`].
//! A swap under the lock exchanges them, so injection always runs outside the lock and never sees
//! bytes appended after the swap.

use crate::batch::OutgoingBatch;
use crate::device::CaptureDevice;
use crate::error::SendError;
use crate::stats::Counters;
use crate::utils::Frames;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, trace, warn};

#[derive(Debug)]
pub(crate) struct SendChannel {
    active: Mutex<Vec<u8>>,
    wakeup: Condvar,
    capacity: usize,
}

impl SendChannel {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            active: Mutex::new(Vec::with_capacity(capacity)),
            wakeup: Condvar::new(),
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Moves the whole of `batch` into the active buffer, or drops it if it does not fit.
    ///
    /// `batch` is empty afterwards either way. Returns the number of bytes queued.
    pub(crate) fn push(&self, batch: &mut OutgoingBatch) -> Result<usize, SendError> {
        let mut active = self.active.lock().unwrap();
        if batch.is_empty() {
            return Ok(0);
        }

        let len = batch.len();
        if active.len() + len > self.capacity {
            let available = self.capacity - active.len();
            batch.clear();
            warn!(
                dropped_kib = len / 1024,
                dropped = len,
                available,
                "send: packet buffer too large"
            );
            return Err(SendError::ChannelFull {
                dropped: len,
                available,
            });
        }

        active.extend_from_slice(batch.as_bytes());
        batch.clear();
        Ok(len)
    }

    /// Swaps the active buffer with `draining` if anything is pending.
    ///
    /// `draining` must be empty. When nothing is pending, waits up to `idle` (or until
    /// [`SendChannel::wake`]) and returns `false`.
    pub(crate) fn take(&self, draining: &mut Vec<u8>, idle: Duration) -> bool {
        debug_assert!(draining.is_empty());
        let mut active = self.active.lock().unwrap();
        if active.is_empty() {
            let _ = self.wakeup.wait_timeout(active, idle).unwrap();
            return false;
        }

        std::mem::swap(&mut *active, draining);
        true
    }

    pub(crate) fn wake(&self) {
        let _guard = self.active.lock().unwrap();
        self.wakeup.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> Vec<u8> {
        self.active.lock().unwrap().clone()
    }
}

/// Background worker that drains the channel into the capture device.
pub(crate) struct Transmitter<D> {
    pub(crate) device: Arc<D>,
    pub(crate) channel: Arc<SendChannel>,
    pub(crate) closed: Arc<AtomicBool>,
    pub(crate) counters: Arc<Counters>,
    pub(crate) idle: Duration,
}

impl<D: CaptureDevice> Transmitter<D> {
    pub(crate) fn run(self) {
        let mut draining = Vec::with_capacity(self.channel.capacity());
        while !self.closed.load(Ordering::Acquire) {
            if !self.channel.take(&mut draining, self.idle) {
                continue;
            }

            let mut sent = 0u64;
            for frame in Frames::new(&draining) {
                if self.closed.load(Ordering::Acquire) {
                    break;
                }
                match self.device.inject(frame) {
                    Ok(()) => sent += 1,
                    Err(err) => {
                        warn!(%err, len = frame.len(), "inject failed");
                        Counters::add(&self.counters.inject_failures, 1);
                    }
                }
            }
            Counters::add(&self.counters.frames_sent, sent);
            trace!(sent, bytes = draining.len(), "drained send buffer");
            draining.clear();
        }
        debug!("transmitter exiting");
    }
}
