//! Frame encoding and decoding for link + IPv4 + UDP.
//!
//! A framed region in a send buffer looks like
//! `[u16 length][link header][IPv4 header][UDP header][payload]`, where the length prefix counts
//! everything after itself.

use crate::error::EncodeError;
use byteorder::{ByteOrder, NativeEndian, NetworkEndian};
use color_eyre::eyre::{bail, Result};
use std::convert::{TryFrom, TryInto};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub const LENGTH_PREFIX_SIZE: usize = 2;
pub const NULL_LINK_HEADER_SIZE: usize = 4;
pub const IPV4_HEADER_SIZE: usize = 20;
pub const UDP_HEADER_SIZE: usize = 8;
pub const SNAP_LEN: usize = 1500;
/// Incoming payloads larger than this are dropped.
pub const MAX_INCOMING_PAYLOAD: usize = 1500;
/// Local deployments only. Kept at 4 on purpose; see DESIGN.md before changing.
pub const IPV4_TTL: u8 = 4;
pub const IPV4_IHL_NO_OPTIONS: u8 = 5;
pub const IPV4_VERSION: u8 = 4;
pub const IPPROTO_UDP: u8 = 17;
/// Protocol family tag written into null link headers.
pub const PF_INET: u32 = 2;

const IPV4_MORE_FRAGMENTS: u8 = 0x20;
const IPV4_FRAGMENT_OFFSET_HI: u8 = 0x1f;

/// Link-layer encapsulation of the capture device.
#[repr(i32)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum LinkType {
    /// BSD loopback: a 4-byte protocol family in host byte order.
    Null = 0,
}

impl TryFrom<i32> for LinkType {
    type Error = color_eyre::eyre::Error;

    fn try_from(n: i32) -> Result<Self> {
        if n == LinkType::Null as i32 {
            Ok(LinkType::Null)
        } else {
            bail!("Unsupported data link type: {}", n);
        }
    }
}

impl LinkType {
    pub const fn header_size(self) -> usize {
        match self {
            LinkType::Null => NULL_LINK_HEADER_SIZE,
        }
    }

    /// Largest payload whose frame still fits in one snap length.
    pub const fn max_payload(self) -> usize {
        SNAP_LEN - IPV4_HEADER_SIZE - UDP_HEADER_SIZE - self.header_size()
    }

    /// Length of the frame (without prefix) carrying `payload_len` bytes.
    pub const fn frame_len(self, payload_len: usize) -> usize {
        self.header_size() + IPV4_HEADER_SIZE + UDP_HEADER_SIZE + payload_len
    }
}

static_assert!(LinkType::Null.max_payload() == 1468);

/// The fixed local end of every frame this socket writes.
#[derive(Debug, PartialEq, Clone, Copy, Eq, Hash)]
pub struct SourceInfo {
    pub link: LinkType,
    pub ipv4_addr: Ipv4Addr,
    pub udp_port: u16,
}

#[inline]
pub fn write_link_hdr(link: LinkType, buf: &mut [u8]) -> Result<()> {
    match link {
        LinkType::Null => {
            let buf: &mut [u8; NULL_LINK_HEADER_SIZE] = buf.try_into()?;
            NativeEndian::write_u32(&mut buf[..], PF_INET);
        }
    }
    Ok(())
}

/// One's-complement sum of the big-endian halfwords in `buf`, carries folded back in.
pub fn ones_complement_sum(buf: &[u8]) -> u16 {
    let mut state = 0u32;
    for word in buf.chunks(2) {
        state += match word {
            &[hi, lo] => u16::from_be_bytes([hi, lo]),
            &[hi] => u16::from_be_bytes([hi, 0]),
            _ => unreachable!(),
        } as u32;
    }
    while state > 0xffff {
        state = (state & 0xffff) + (state >> 16);
    }
    state as u16
}

#[inline]
pub fn ipv4_checksum(buf: &[u8]) -> Result<u16> {
    let buf: &[u8; IPV4_HEADER_SIZE] = buf.try_into()?;
    // octets 10-12 hold the checksum itself and count as zero
    let sum = ones_complement_sum(&buf[..10]) as u32 + ones_complement_sum(&buf[12..]) as u32;
    let folded = (sum & 0xffff) + (sum >> 16);
    Ok(!(folded as u16))
}

#[inline]
pub fn write_ipv4_hdr(
    src: &SourceInfo,
    dst: Ipv4Addr,
    buf: &mut [u8],
    payload_len: usize,
) -> Result<()> {
    let buf: &mut [u8; IPV4_HEADER_SIZE] = buf.try_into()?;
    buf[..].copy_from_slice(&[0u8; IPV4_HEADER_SIZE]);

    buf[0] = (IPV4_VERSION << 4) | IPV4_IHL_NO_OPTIONS;
    NetworkEndian::write_u16(
        &mut buf[2..4],
        (IPV4_HEADER_SIZE + UDP_HEADER_SIZE + payload_len) as u16,
    );
    // identification, flags and fragment offset stay zero
    buf[8] = IPV4_TTL;
    buf[9] = IPPROTO_UDP;

    buf[12..16].copy_from_slice(&src.ipv4_addr.octets());
    buf[16..20].copy_from_slice(&dst.octets());

    let checksum = ipv4_checksum(buf)?;
    NetworkEndian::write_u16(&mut buf[10..12], checksum);
    Ok(())
}

#[inline]
pub fn write_udp_hdr(src_port: u16, dst_port: u16, buf: &mut [u8], payload_len: usize) -> Result<()> {
    let buf: &mut [u8; UDP_HEADER_SIZE] = buf.try_into()?;
    NetworkEndian::write_u16(&mut buf[0..2], src_port);
    NetworkEndian::write_u16(&mut buf[2..4], dst_port);
    NetworkEndian::write_u16(&mut buf[4..6], (UDP_HEADER_SIZE + payload_len) as u16);
    // no checksum
    NetworkEndian::write_u16(&mut buf[6..8], 0);
    Ok(())
}

/// Encodes one length-prefixed frame into the front of `out`.
///
/// Returns the number of bytes written, prefix included. On error nothing in `out` is modified.
pub fn encode_frame(
    src: &SourceInfo,
    to: SocketAddr,
    payload: &[&[u8]],
    out: &mut [u8],
) -> std::result::Result<usize, EncodeError> {
    let payload_len: usize = payload.iter().map(|seg| seg.len()).sum();
    let max = src.link.max_payload();
    if payload_len > max {
        return Err(EncodeError::PayloadTooLarge {
            size: payload_len,
            max,
        });
    }

    let to = match to {
        SocketAddr::V4(to) => to,
        SocketAddr::V6(_) => return Err(EncodeError::UnsupportedAddressFamily(to)),
    };

    let frame_len = src.link.frame_len(payload_len);
    let needed = LENGTH_PREFIX_SIZE + frame_len;
    if needed > out.len() {
        return Err(EncodeError::BatchFull {
            needed,
            available: out.len(),
        });
    }

    let out = &mut out[..needed];
    let (prefix, frame) = out.split_at_mut(LENGTH_PREFIX_SIZE);
    NetworkEndian::write_u16(prefix, frame_len as u16);

    let (link_hdr, rest) = frame.split_at_mut(src.link.header_size());
    let (ip_hdr, rest) = rest.split_at_mut(IPV4_HEADER_SIZE);
    let (udp_hdr, mut body) = rest.split_at_mut(UDP_HEADER_SIZE);

    // the slices above are exactly sized, so these cannot fail
    write_link_hdr(src.link, link_hdr).expect("link header slice is sized");
    write_ipv4_hdr(src, *to.ip(), ip_hdr, payload_len).expect("ipv4 header slice is sized");
    write_udp_hdr(src.udp_port, to.port(), udp_hdr, payload_len).expect("udp header slice is sized");

    for seg in payload {
        let (dst, rest) = body.split_at_mut(seg.len());
        dst.copy_from_slice(seg);
        body = rest;
    }

    Ok(needed)
}

/// Walks a buffer of length-prefixed frames.
///
/// Stops at the first prefix that does not fit inside the buffer.
#[derive(Debug, Clone)]
pub struct Frames<'a> {
    buf: &'a [u8],
}

impl<'a> Frames<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return None;
        }
        let len = NetworkEndian::read_u16(&self.buf[..LENGTH_PREFIX_SIZE]) as usize;
        debug_assert!(len > 0 && len <= SNAP_LEN, "bad frame length {}", len);
        let rest = &self.buf[LENGTH_PREFIX_SIZE..];
        if rest.len() < len {
            self.buf = &[];
            return None;
        }
        let (frame, rest) = rest.split_at(len);
        self.buf = rest;
        Some(frame)
    }
}

/// An accepted incoming datagram, still borrowing the captured frame.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct DecodedFrame<'a> {
    pub from: SocketAddrV4,
    pub payload: &'a [u8],
}

/// Validates a captured frame and extracts its UDP payload.
///
/// `caplen` is the captured length reported by the device. Frames that are not unfragmented,
/// option-less IPv4/UDP datagrams to `listen_port` yield `None`.
pub fn decode_frame(
    link: LinkType,
    listen_port: u16,
    caplen: usize,
    frame: &[u8],
) -> Option<DecodedFrame<'_>> {
    let headers = link.header_size() + IPV4_HEADER_SIZE + UDP_HEADER_SIZE;
    if caplen < headers || frame.len() < headers {
        return None;
    }

    let ip_hdr = &frame[link.header_size()..link.header_size() + IPV4_HEADER_SIZE];
    if ip_hdr[0] != (IPV4_VERSION << 4) | IPV4_IHL_NO_OPTIONS {
        return None;
    }
    if ip_hdr[6] & IPV4_MORE_FRAGMENTS != 0 {
        return None;
    }
    if ip_hdr[6] & IPV4_FRAGMENT_OFFSET_HI != 0 || ip_hdr[7] != 0 {
        return None;
    }
    if ip_hdr[9] != IPPROTO_UDP {
        return None;
    }

    let udp_hdr = &frame[link.header_size() + IPV4_HEADER_SIZE..headers];
    if NetworkEndian::read_u16(&udp_hdr[2..4]) != listen_port {
        return None;
    }

    let len = caplen - headers;
    if len > MAX_INCOMING_PAYLOAD {
        tracing::warn!(len, "incoming packet too large");
        return None;
    }
    let payload = frame.get(headers..headers + len)?;

    let src_ip = Ipv4Addr::new(ip_hdr[12], ip_hdr[13], ip_hdr[14], ip_hdr[15]);
    let src_port = NetworkEndian::read_u16(&udp_hdr[0..2]);
    Some(DecodedFrame {
        from: SocketAddrV4::new(src_ip, src_port),
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn source() -> SourceInfo {
        SourceInfo {
            link: LinkType::Null,
            ipv4_addr: Ipv4Addr::new(10, 0, 0, 1),
            udp_port: 8080,
        }
    }

    fn encode(to: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 2048];
        let n = encode_frame(&source(), to.into(), &[payload], &mut out).unwrap();
        out.truncate(n);
        out
    }

    #[test]
    fn source_info_is_a_map_key() {
        let mut bound = std::collections::HashSet::new();
        assert!(bound.insert(source()));
        assert!(!bound.insert(source()));
        assert!(bound.insert(SourceInfo {
            udp_port: 9090,
            ..source()
        }));
        assert_eq!(bound.len(), 2);
    }

    #[test]
    fn scenario_layout() {
        let dst = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 6000);
        let out = encode(dst, b"hello world!");
        assert_eq!(out.len(), 46);
        assert_eq!(&out[0..2], &[0x00, 44]);
        assert_eq!(&out[2..6], &PF_INET.to_ne_bytes());

        let ip = &out[6..26];
        assert_eq!(ip[0], 0x45);
        assert_eq!(&ip[2..4], &[0x00, 0x28]);
        assert_eq!(ip[8], IPV4_TTL);
        assert_eq!(ip[9], IPPROTO_UDP);
        assert_eq!(&ip[12..16], &[10, 0, 0, 1]);
        assert_eq!(&ip[16..20], &[10, 0, 0, 5]);

        let udp = &out[26..34];
        assert_eq!(&udp[0..2], &8080u16.to_be_bytes());
        assert_eq!(&udp[2..4], &6000u16.to_be_bytes());
        assert_eq!(&udp[4..6], &[0x00, 0x14]);
        assert_eq!(&udp[6..8], &[0, 0]);
        assert_eq!(&out[34..], b"hello world!");
    }

    #[test]
    fn checksum_validates() {
        let mut rng = rand::rngs::SmallRng::seed_from_u64(7);
        for _ in 0..200 {
            let dst = SocketAddrV4::new(Ipv4Addr::from(rng.gen::<u32>()), rng.gen());
            let len = rng.gen_range(0..=LinkType::Null.max_payload());
            let out = encode(dst, &vec![0xa5; len]);
            let ip = &out[6..26];
            assert_eq!(ones_complement_sum(ip), 0xffff, "header {:?}", ip);
        }
    }

    #[test]
    fn round_trip() {
        let mut rng = rand::rngs::SmallRng::seed_from_u64(42);
        for _ in 0..100 {
            let dst = SocketAddrV4::new(Ipv4Addr::from(rng.gen::<u32>()), rng.gen());
            let len = rng.gen_range(0..=LinkType::Null.max_payload());
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let out = encode(dst, &payload);
            let frame = &out[LENGTH_PREFIX_SIZE..];

            // decode as if the frame came back addressed to the destination port
            let decoded = decode_frame(LinkType::Null, dst.port(), frame.len(), frame).unwrap();
            assert_eq!(decoded.payload, &payload[..]);
            assert_eq!(*decoded.from.ip(), source().ipv4_addr);
            assert_eq!(decoded.from.port(), source().udp_port);
        }
    }

    #[test]
    fn segments_are_concatenated() {
        let dst: SocketAddr = "10.0.0.5:6000".parse().unwrap();
        let mut out = vec![0u8; 128];
        let n = encode_frame(&source(), dst, &[b"ab", b"", b"cde"], &mut out).unwrap();
        assert_eq!(&out[34..n], b"abcde");
    }

    #[test]
    fn payload_limit() {
        let dst: SocketAddr = "10.0.0.5:6000".parse().unwrap();
        let mut out = vec![0u8; 2048];
        let max = vec![1u8; 1468];
        let n = encode_frame(&source(), dst, &[&max], &mut out).unwrap();
        assert_eq!(n, LENGTH_PREFIX_SIZE + SNAP_LEN);

        let mut out = vec![0u8; 2048];
        let too_big = vec![1u8; 1469];
        assert_eq!(
            encode_frame(&source(), dst, &[&too_big], &mut out),
            Err(EncodeError::PayloadTooLarge {
                size: 1469,
                max: 1468
            })
        );
        assert!(out.iter().all(|b| *b == 0));
    }

    #[test]
    fn rejects_ipv6() {
        let dst: SocketAddr = "[::1]:6000".parse().unwrap();
        let mut out = vec![0u8; 128];
        assert!(matches!(
            encode_frame(&source(), dst, &[b"x"], &mut out),
            Err(EncodeError::UnsupportedAddressFamily(_))
        ));
    }

    #[test]
    fn short_output() {
        let dst: SocketAddr = "10.0.0.5:6000".parse().unwrap();
        let mut out = vec![0u8; 40];
        assert_eq!(
            encode_frame(&source(), dst, &[b"0123456789"], &mut out),
            Err(EncodeError::BatchFull {
                needed: 44,
                available: 40
            })
        );
    }

    #[test]
    fn unsupported_link_type() {
        assert_eq!(LinkType::try_from(0).unwrap(), LinkType::Null);
        assert!(LinkType::try_from(1).is_err());
    }

    fn inbound(payload: &[u8]) -> Vec<u8> {
        let src = SourceInfo {
            link: LinkType::Null,
            ipv4_addr: Ipv4Addr::new(192, 168, 1, 9),
            udp_port: 51000,
        };
        let mut out = vec![0u8; 2048];
        let to: SocketAddr = "10.0.0.1:8080".parse().unwrap();
        let n = encode_frame(&src, to, &[payload], &mut out).unwrap();
        out[LENGTH_PREFIX_SIZE..n].to_vec()
    }

    #[test]
    fn decode_filters() {
        let good = inbound(b"ping");
        let d = decode_frame(LinkType::Null, 8080, good.len(), &good).unwrap();
        assert_eq!(d.from, "192.168.1.9:51000".parse::<SocketAddrV4>().unwrap());
        assert_eq!(d.payload, b"ping");

        let mut options = good.clone();
        options[4] = 0x46;
        assert!(decode_frame(LinkType::Null, 8080, options.len(), &options).is_none());

        let mut more_frags = good.clone();
        more_frags[4 + 6] |= 0x20;
        assert!(decode_frame(LinkType::Null, 8080, more_frags.len(), &more_frags).is_none());

        let mut offset = good.clone();
        offset[4 + 7] = 1;
        assert!(decode_frame(LinkType::Null, 8080, offset.len(), &offset).is_none());

        let mut tcp = good.clone();
        tcp[4 + 9] = 6;
        assert!(decode_frame(LinkType::Null, 8080, tcp.len(), &tcp).is_none());

        assert!(decode_frame(LinkType::Null, 8081, good.len(), &good).is_none());
        assert!(decode_frame(LinkType::Null, 8080, 20, &good[..20]).is_none());
    }

    #[test]
    fn decode_uses_caplen() {
        let good = inbound(b"ping");
        let d = decode_frame(LinkType::Null, 8080, good.len() - 2, &good).unwrap();
        assert_eq!(d.payload, b"pi");
        assert!(decode_frame(LinkType::Null, 8080, good.len() + 1, &good).is_none());
    }

    #[test]
    fn frames_iter() {
        let mut buf = vec![0u8; 256];
        let dst: SocketAddr = "10.0.0.5:6000".parse().unwrap();
        let a = encode_frame(&source(), dst, &[b"one"], &mut buf).unwrap();
        let b = encode_frame(&source(), dst, &[b"three"], &mut buf[a..]).unwrap();
        let frames: Vec<_> = Frames::new(&buf[..a + b]).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][32..], b"one");
        assert_eq!(&frames[1][32..], b"three");
    }
}
