//! Caller-owned burst of encoded outgoing frames.

use crate::error::EncodeError;
use crate::utils::{encode_frame, Frames, SourceInfo};
use std::net::SocketAddr;
use tracing::warn;

/// An append-only buffer of length-prefixed frames, handed to [`crate::PacketSocket::send`] as
/// one unit.
///
/// Created with [`crate::PacketSocket::batch`] so it carries the socket's source address, listen
/// port, and link type. A batch can be reused after it has been sent.
#[derive(Debug, Clone)]
pub struct OutgoingBatch {
    src: SourceInfo,
    buf: Box<[u8]>,
    cursor: usize,
}

impl OutgoingBatch {
    pub fn new(src: SourceInfo, capacity: usize) -> Self {
        Self {
            src,
            buf: vec![0u8; capacity].into_boxed_slice(),
            cursor: 0,
        }
    }

    /// Encodes one datagram to `to`, its payload the concatenation of `payload`.
    ///
    /// On error the batch is unchanged.
    pub fn append(&mut self, to: SocketAddr, payload: &[&[u8]]) -> Result<(), EncodeError> {
        match encode_frame(&self.src, to, payload, &mut self.buf[self.cursor..]) {
            Ok(written) => {
                self.cursor += written;
                Ok(())
            }
            Err(err) => {
                warn!(?to, %err, "append: dropping packet");
                Err(err)
            }
        }
    }

    /// Encoded bytes not yet sent.
    pub fn len(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.cursor = 0;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.cursor]
    }

    /// The encoded frames, without their length prefixes.
    pub fn frames(&self) -> Frames<'_> {
        Frames::new(self.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{LinkType, LENGTH_PREFIX_SIZE};
    use std::net::Ipv4Addr;

    fn batch(capacity: usize) -> OutgoingBatch {
        OutgoingBatch::new(
            SourceInfo {
                link: LinkType::Null,
                ipv4_addr: Ipv4Addr::new(10, 0, 0, 1),
                udp_port: 8080,
            },
            capacity,
        )
    }

    #[test]
    fn appends_frames() {
        let mut b = batch(1024);
        let to: SocketAddr = "10.0.0.5:6000".parse().unwrap();
        b.append(to, &[b"hello world!"]).unwrap();
        assert_eq!(b.len(), 46);
        b.append(to, &[b"abc", b"def"]).unwrap();
        assert_eq!(b.len(), 46 + 40);
        assert_eq!(b.frames().count(), 2);

        b.clear();
        assert!(b.is_empty());
        assert_eq!(b.frames().count(), 0);
    }

    #[test]
    fn rejected_append_leaves_batch() {
        let mut b = batch(4096);
        let to: SocketAddr = "10.0.0.5:6000".parse().unwrap();
        b.append(to, &[b"x"]).unwrap();
        let before = b.as_bytes().to_vec();

        let oversized = vec![0u8; LinkType::Null.max_payload() + 1];
        assert!(matches!(
            b.append(to, &[&oversized]),
            Err(EncodeError::PayloadTooLarge { .. })
        ));
        let v6: SocketAddr = "[::1]:6000".parse().unwrap();
        assert!(b.append(v6, &[b"x"]).is_err());
        assert_eq!(b.as_bytes(), &before[..]);

        let max = vec![0u8; LinkType::Null.max_payload()];
        b.append(to, &[&max]).unwrap();
        assert_eq!(b.len(), before.len() + LENGTH_PREFIX_SIZE + 1500);
    }

    #[test]
    fn batch_capacity() {
        let mut b = batch(100);
        let to: SocketAddr = "10.0.0.5:6000".parse().unwrap();
        b.append(to, &[&[0u8; 50]]).unwrap();
        assert_eq!(b.len(), 84);
        assert!(matches!(
            b.append(to, &[b"0123"]),
            Err(EncodeError::BatchFull {
                needed: 38,
                available: 16
            })
        ));
        assert_eq!(b.len(), 84);
    }
}
