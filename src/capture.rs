//! libpcap-backed [`CaptureDevice`].
//!
//! Two handles are opened on the same interface: one filtered, inbound-only handle that the
//! receive path dispatches on, and one for injection, so the transmitter never waits on the
//! receive side's lock. The injection handle captures nothing.

use crate::device::{CaptureDevice, FrameHandler, FrameMeta};
use crate::error::DeviceError;
use crate::socket::CaptureConfig;
use crate::utils::SNAP_LEN;
use color_eyre::eyre::{bail, eyre, Result, WrapErr};
use ::pcap::{Active, Capture, Device, Direction};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// libpcap's own read timeout. Longer waits are built out of several of these.
const READ_TIMEOUT_MS: i32 = 1;

/// Kernel buffer for the injection handle, which never reads.
const INJECT_BUFFER_SIZE: usize = 64 * 1024;

/// Matches no packet: nothing has a length of 0.
const MATCH_NOTHING: &str = "less 0";

pub struct PcapDevice {
    rx: Mutex<Capture<Active>>,
    tx: Mutex<Capture<Active>>,
    link: i32,
    wait_ns: AtomicU64,
    break_requested: AtomicBool,
}

/// How one of the two handles is set up.
#[derive(Debug)]
struct HandleSetup {
    buffer_size: usize,
    direction: Direction,
    filter: String,
}

impl HandleSetup {
    fn receive(cfg: &CaptureConfig, listen_port: u16) -> Self {
        Self {
            buffer_size: cfg.buffer_size,
            direction: Direction::In,
            filter: cfg
                .filter
                .clone()
                .unwrap_or_else(|| format!("udp dst port {}", listen_port)),
        }
    }

    fn inject() -> Self {
        Self {
            buffer_size: INJECT_BUFFER_SIZE,
            direction: Direction::Out,
            filter: MATCH_NOTHING.to_owned(),
        }
    }

    fn open(&self, device: &str) -> Result<Capture<Active>> {
        let mut cap = Capture::from_device(device)
            .wrap_err_with(|| eyre!("failed to create packet capture handle for {}", device))?
            .snaplen(SNAP_LEN as i32)
            .buffer_size(self.buffer_size as i32)
            .timeout(READ_TIMEOUT_MS)
            .open()
            .wrap_err_with(|| eyre!("failed to activate {}", device))?;
        cap.direction(self.direction)
            .wrap_err("set capture direction")?;
        cap.filter(&self.filter, true)
            .wrap_err_with(|| eyre!("install capture filter {:?}", self.filter))?;
        Ok(cap)
    }
}

impl PcapDevice {
    pub fn open(cfg: &CaptureConfig, listen_port: u16) -> Result<Self> {
        let setup = HandleSetup::receive(cfg, listen_port);
        let rx = setup.open(&cfg.device)?;
        let link = rx.get_datalink().0;

        let tx = HandleSetup::inject().open(&cfg.device)?;
        let tx_link = tx.get_datalink().0;
        if tx_link != link {
            bail!(
                "injection handle on {} has data link type {}, capture has {}",
                cfg.device,
                tx_link,
                link
            );
        }
        debug!(device = %cfg.device, filter = %setup.filter, link, "capture device open");

        Ok(Self {
            rx: Mutex::new(rx),
            tx: Mutex::new(tx),
            link,
            wait_ns: AtomicU64::new(Duration::from_millis(READ_TIMEOUT_MS as u64).as_nanos() as u64),
            break_requested: AtomicBool::new(false),
        })
    }
}

/// The first IPv4 address assigned to `device`.
pub fn interface_ipv4(device: &str) -> Result<Ipv4Addr> {
    let devices = Device::list().wrap_err("list capture devices")?;
    let dev = devices
        .into_iter()
        .find(|d| d.name == device)
        .ok_or_else(|| eyre!("no such device: {}", device))?;
    let ip = dev
        .addresses
        .iter()
        .find_map(|a| match a.addr {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| eyre!("device {:?} has no IPv4 address", device))?;
    info!(%ip, device, "bound to");
    Ok(ip)
}

impl CaptureDevice for PcapDevice {
    fn link_type(&self) -> i32 {
        self.link
    }

    fn dispatch(&self, max: usize, handler: &mut FrameHandler<'_>) -> Result<usize, DeviceError> {
        let mut rx = self.rx.lock().unwrap();
        let wait = Duration::from_nanos(self.wait_ns.load(Ordering::Relaxed));
        let start = Instant::now();
        let mut count = 0;
        while count < max {
            if self.break_requested.swap(false, Ordering::AcqRel) {
                if count == 0 {
                    return Err(DeviceError::Interrupted);
                }
                break;
            }

            match rx.next_packet() {
                Ok(packet) => {
                    count += 1;
                    let ts = packet.header.ts;
                    let meta = FrameMeta {
                        caplen: packet.header.caplen as usize,
                        len: packet.header.len as usize,
                        timestamp: Duration::new(ts.tv_sec as u64, ts.tv_usec as u32 * 1000),
                    };
                    if handler(&meta, packet.data).is_break() {
                        break;
                    }
                }
                Err(::pcap::Error::TimeoutExpired) => {
                    if count > 0 || start.elapsed() >= wait {
                        break;
                    }
                }
                Err(::pcap::Error::NoMorePackets) => {
                    return Err(DeviceError::Fatal("capture source exhausted".into()))
                }
                Err(err) => return Err(DeviceError::Fatal(err.to_string())),
            }
        }

        Ok(count)
    }

    fn inject(&self, frame: &[u8]) -> Result<(), DeviceError> {
        self.tx
            .lock()
            .unwrap()
            .sendpacket(frame)
            .map_err(|err| DeviceError::Transient(err.to_string()))
    }

    fn break_loop(&self) {
        self.break_requested.store(true, Ordering::Release);
    }

    /// libpcap cannot change the read timeout of an active handle, so this sets how long one
    /// `dispatch` keeps polling an idle handle instead.
    fn set_timeout(&self, timeout: Duration) -> Result<(), DeviceError> {
        self.wait_ns
            .store(timeout.as_nanos() as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CaptureConfig {
        CaptureConfig {
            device: "lo0".into(),
            buffer_size: 8 * 1024 * 1024,
            filter: None,
        }
    }

    #[test]
    fn receive_handle_setup() {
        let rx = HandleSetup::receive(&cfg(), 8080);
        assert_eq!(rx.buffer_size, 8 * 1024 * 1024);
        assert!(matches!(rx.direction, Direction::In));
        assert_eq!(rx.filter, "udp dst port 8080");

        let custom = CaptureConfig {
            filter: Some("udp".into()),
            ..cfg()
        };
        assert_eq!(HandleSetup::receive(&custom, 8080).filter, "udp");
    }

    #[test]
    fn inject_handle_captures_nothing() {
        let tx = HandleSetup::inject();
        assert!(tx.buffer_size < cfg().buffer_size);
        assert!(matches!(tx.direction, Direction::Out));
        assert_eq!(tx.filter, MATCH_NOTHING);
    }
}
