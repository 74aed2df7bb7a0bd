//! UDP over a packet capture device.
//!
//! Frames are captured and injected directly, with the IPv4 and UDP headers built and parsed in
//! user space. Outgoing packets are encoded into batches and injected in bursts by a background
//! thread; incoming packets are filtered in the capture callback and copied into a reusable
//! arena.

macro_rules! static_assert(
    ($x: expr) => {
        #[allow(unknown_lints, eq_op)]
        const _: [(); 0 - !{
            const ASSERT: bool = $x;
            ASSERT
        } as usize] = [];
    }
);

pub mod device;
pub mod error;
pub mod memory;
pub mod utils;

mod batch;
mod channel;
mod receive;
mod socket;
mod stats;

#[cfg(feature = "pcap")]
pub mod capture;

pub use batch::OutgoingBatch;
pub use device::{CaptureDevice, FrameMeta};
pub use error::{DeviceError, EncodeError, Error, SendError};
pub use memory::{MemoryDevice, MemoryPeer};
pub use receive::{IncomingPacket, ReceiveBatch};
pub use socket::{CaptureConfig, Config, PacketSocket, Received, SocketConfig};
pub use stats::SocketStats;
pub use utils::{LinkType, SourceInfo};
