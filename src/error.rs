//! Typed errors for the operations callers branch on.
//!
//! Bootstrap and configuration paths report through `color_eyre` instead.

use std::net::SocketAddr;

/// Why a packet could not be appended to an [`crate::OutgoingBatch`].
///
/// The batch is left untouched in every case.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("unsupported destination {0} (only IPv4 is supported)")]
    UnsupportedAddressFamily(SocketAddr),

    #[error("batch full: {needed} bytes needed, {available} available")]
    BatchFull { needed: usize, available: usize },
}

/// Why [`crate::PacketSocket::send`] dropped a batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("send buffer full (dropping {dropped} bytes, {available} available)")]
    ChannelFull { dropped: usize, available: usize },
}

/// Errors reported by a [`crate::CaptureDevice`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The dispatch loop was broken before any frame was processed.
    #[error("dispatch interrupted")]
    Interrupted,

    /// The call failed but the device remains usable.
    #[error("transient device error: {0}")]
    Transient(String),

    /// The device can no longer be used.
    #[error("fatal device error: {0}")]
    Fatal(String),
}

/// Errors from [`crate::PacketSocket::receive`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("capture device failed")]
    Device(#[from] DeviceError),
}

pub type Result<T> = std::result::Result<T, Error>;
