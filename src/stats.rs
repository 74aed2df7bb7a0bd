use std::sync::atomic::{AtomicU64, Ordering};

/// Send-side counters, shared between producers and the transmitter.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) bytes_out: AtomicU64,
    pub(crate) frames_sent: AtomicU64,
    pub(crate) inject_failures: AtomicU64,
    pub(crate) batches_dropped: AtomicU64,
    pub(crate) bytes_dropped: AtomicU64,
}

/// Point-in-time copy of a socket's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketStats {
    /// Bytes accepted by `send`, framing included.
    pub bytes_out: u64,
    /// Frames the device accepted for transmission.
    pub frames_sent: u64,
    pub inject_failures: u64,
    /// Batches `send` refused because the send buffer was full.
    pub batches_dropped: u64,
    pub bytes_dropped: u64,
}

impl Counters {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SocketStats {
        SocketStats {
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            inject_failures: self.inject_failures.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
        }
    }
}
