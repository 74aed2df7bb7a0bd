//! Receive arena and the per-frame capture filter.

use crate::device::FrameMeta;
use crate::utils::{decode_frame, LinkType, MAX_INCOMING_PAYLOAD};
use std::net::SocketAddrV4;
use std::ops::ControlFlow;
use tracing::{error, trace, warn};

/// Payloads start on multiples of this many bytes within the arena.
pub const ARENA_ALIGN: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Descriptor {
    offset: usize,
    len: usize,
    from: SocketAddrV4,
}

/// A received datagram. The payload borrows the [`ReceiveBatch`] it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingPacket<'a> {
    pub payload: &'a [u8],
    pub from: SocketAddrV4,
}

/// Reusable destination for [`crate::PacketSocket::receive`].
///
/// Holds the arena payloads are copied into and the descriptors pointing at them. Everything is
/// overwritten by the next `receive` into the same batch.
#[derive(Debug)]
pub struct ReceiveBatch {
    arena: Box<[u8]>,
    offset: usize,
    descriptors: Vec<Descriptor>,
    max_packets: usize,
}

impl ReceiveBatch {
    /// `arena_size` is raised to fit at least one maximum-size payload.
    pub fn new(arena_size: usize, max_packets: usize) -> Self {
        let arena_size = arena_size.max(MAX_INCOMING_PAYLOAD);
        Self {
            arena: vec![0u8; arena_size].into_boxed_slice(),
            offset: 0,
            descriptors: Vec::with_capacity(max_packets),
            max_packets,
        }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn max_packets(&self) -> usize {
        self.max_packets
    }

    pub fn arena_size(&self) -> usize {
        self.arena.len()
    }

    pub fn get(&self, idx: usize) -> Option<IncomingPacket<'_>> {
        self.descriptors.get(idx).map(|d| self.view(d))
    }

    pub fn packets(&self) -> impl ExactSizeIterator<Item = IncomingPacket<'_>> + '_ {
        self.descriptors.iter().map(move |d| self.view(d))
    }

    fn view(&self, d: &Descriptor) -> IncomingPacket<'_> {
        IncomingPacket {
            payload: &self.arena[d.offset..d.offset + d.len],
            from: d.from,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.offset = 0;
        self.descriptors.clear();
    }
}

/// Validates captured frames and records accepted payloads into a [`ReceiveBatch`].
pub(crate) struct ReceiveFilter<'b> {
    batch: &'b mut ReceiveBatch,
    limit: usize,
    link: LinkType,
    listen_port: u16,
}

impl<'b> ReceiveFilter<'b> {
    pub(crate) fn new(batch: &'b mut ReceiveBatch, limit: usize, link: LinkType, listen_port: u16) -> Self {
        let limit = limit.min(batch.max_packets);
        Self {
            batch,
            limit,
            link,
            listen_port,
        }
    }

    /// Handles one captured frame. `Break` means deliver what we have now.
    pub(crate) fn on_frame(&mut self, meta: &FrameMeta, frame: &[u8]) -> ControlFlow<()> {
        let batch = &mut *self.batch;
        if batch.descriptors.len() >= self.limit {
            error!(
                count = batch.descriptors.len(),
                "receive descriptors full, dispatch should have stopped"
            );
            return ControlFlow::Break(());
        }

        let pkt = match decode_frame(self.link, self.listen_port, meta.caplen, frame) {
            Some(pkt) => pkt,
            None => return ControlFlow::Continue(()),
        };

        let len = pkt.payload.len();
        let end = batch.offset + len;
        if end > batch.arena.len() {
            // the check after each accepted frame keeps room for a full payload
            warn!(len, offset = batch.offset, "receive arena overflow, dropping packet");
            debug_assert!(false, "receive arena overflow");
            return ControlFlow::Break(());
        }

        batch.arena[batch.offset..end].copy_from_slice(pkt.payload);
        batch.descriptors.push(Descriptor {
            offset: batch.offset,
            len,
            from: pkt.from,
        });
        batch.offset += (len + ARENA_ALIGN - 1) / ARENA_ALIGN * ARENA_ALIGN;

        if batch.descriptors.len() >= self.limit {
            return ControlFlow::Break(());
        }

        // if another full packet won't fit, deliver what we have so far
        if batch.offset + MAX_INCOMING_PAYLOAD > batch.arena.len() {
            trace!(offset = batch.offset, "receive buffer full");
            return ControlFlow::Break(());
        }

        ControlFlow::Continue(())
    }
}
