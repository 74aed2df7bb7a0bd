//! The capture device seam.
//!
//! A [`CaptureDevice`] is handed to [`crate::PacketSocket`] already opened, filtered and
//! activated. The socket only dispatches captured frames, injects raw frames, and adjusts the
//! wait timeout.

use crate::error::DeviceError;
use std::ops::ControlFlow;
use std::time::Duration;

/// Capture metadata delivered alongside each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    /// Bytes actually captured.
    pub caplen: usize,
    /// Length of the frame on the wire.
    pub len: usize,
    /// Capture time since the Unix epoch.
    pub timestamp: Duration,
}

/// Per-frame callback. Returning `Break` stops the current dispatch after this frame.
pub type FrameHandler<'a> = dyn FnMut(&FrameMeta, &[u8]) -> ControlFlow<()> + 'a;

pub trait CaptureDevice: Send + Sync + 'static {
    /// The raw data link type the device was activated with.
    fn link_type(&self) -> i32;

    /// Waits up to the current timeout for frames, handing at most `max` of them to `handler`.
    ///
    /// Returns the number of frames handed over. Returns [`DeviceError::Interrupted`] if
    /// [`CaptureDevice::break_loop`] ended the call before any frame was processed.
    fn dispatch(&self, max: usize, handler: &mut FrameHandler<'_>) -> Result<usize, DeviceError>;

    /// Transmits one complete link-layer frame.
    fn inject(&self, frame: &[u8]) -> Result<(), DeviceError>;

    /// Asks an in-progress or the next `dispatch` to return early. Callable from any thread.
    fn break_loop(&self);

    fn set_timeout(&self, timeout: Duration) -> Result<(), DeviceError>;
}
