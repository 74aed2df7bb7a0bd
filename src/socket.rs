//! Socket-like API over a capture device.
//!
//! Producer threads fill [`OutgoingBatch`]es and hand them to [`PacketSocket::send`]; a
//! background transmitter thread injects them. One consumer thread calls
//! [`PacketSocket::receive`], which runs the device's dispatch loop until packets arrive or the
//! socket is closed.

use crate::{
    batch::OutgoingBatch,
    channel::{SendChannel, Transmitter},
    device::CaptureDevice,
    error::{DeviceError, SendError},
    receive::{ReceiveBatch, ReceiveFilter},
    stats::{Counters, SocketStats},
    utils::{LinkType, SourceInfo, LENGTH_PREFIX_SIZE},
};
use color_eyre::{
    eyre::{bail, ensure, eyre, WrapErr},
    Result,
};
use std::convert::TryFrom;
use std::fs::read_to_string;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use toml::Value;
use tracing::{debug, error, info, warn};

pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 8 * 1024 * 1024;
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 4 * 1024 * 1024;
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 256 * 1024;

/// How the capture device should be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub device: String,
    /// Kernel capture buffer size in bytes.
    pub buffer_size: usize,
    /// Capture filter; `udp dst port <listen_port>` when unset.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConfig {
    pub listen_port: u16,
    /// Capacity of each of the two send buffers.
    pub send_buffer_size: usize,
    /// Arena size of batches made by [`PacketSocket::receive_batch`].
    pub receive_buffer_size: usize,
    /// Device wait while traffic is flowing.
    pub wait_timeout: Duration,
    /// Device wait after a dispatch came back empty.
    pub idle_wait_timeout: Duration,
    /// Transmitter sleep when there is nothing to send.
    pub transmit_idle_sleep: Duration,
}

impl SocketConfig {
    pub fn new(listen_port: u16) -> Self {
        Self {
            listen_port,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            wait_timeout: Duration::from_millis(1),
            idle_wait_timeout: Duration::from_millis(100),
            transmit_idle_sleep: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub capture: CaptureConfig,
    /// Source address for outgoing frames; looked up from the device when unset.
    pub ip: Option<Ipv4Addr>,
    pub socket: SocketConfig,
}

impl Config {
    /// Load from a TOML file with:
    /// - "capture" table with "device" key, and optional "buffer_size" and "filter" keys.
    /// - "net" table with "listen_port" key and optional "ip" key.
    /// - optional "socket" table with "send_buffer_size" and "receive_buffer_size" keys.
    ///
    /// # Example Config
    /// ```toml
    /// [capture]
    /// device = "lo0"
    /// buffer_size = 8388608
    ///
    /// [net]
    /// listen_port = 8080
    /// ip = "10.0.0.1"
    ///
    /// [socket]
    /// send_buffer_size = 4194304
    /// receive_buffer_size = 262144
    /// ```
    pub fn from_file(config_path: &std::path::Path) -> Result<Self> {
        let file_str = read_to_string(config_path)
            .wrap_err_with(|| eyre!("read config {}", config_path.display()))?;
        parse_cfg(&file_str)
    }
}

fn parse_cfg(file_str: &str) -> Result<Config> {
    let mut cfg: Value = file_str.parse().wrap_err("parse TOML config")?;

    fn size(tab: &mut toml::value::Table, key: &str, default: usize) -> Result<usize> {
        match tab.remove(key) {
            None => Ok(default),
            Some(Value::Integer(n)) if n > 0 => Ok(n as usize),
            Some(_) => bail!("{} should be a positive integer", key),
        }
    }

    fn capture_cfg(mut capture_cfg: Value) -> Result<CaptureConfig> {
        let tab = capture_cfg
            .as_table_mut()
            .ok_or_else(|| eyre!("Capture config not a table"))?;
        let device = tab
            .remove("device")
            .ok_or_else(|| eyre!("No device in capture"))?
            .as_str()
            .ok_or_else(|| eyre!("device value should be a string"))?
            .to_owned();
        let buffer_size = size(tab, "buffer_size", DEFAULT_SOCKET_BUFFER_SIZE)?;
        let filter = match tab.remove("filter") {
            None => None,
            Some(Value::String(f)) => Some(f),
            Some(_) => bail!("filter value should be a string"),
        };

        Ok(CaptureConfig {
            device,
            buffer_size,
            filter,
        })
    }

    fn net_cfg(mut net_cfg: Value) -> Result<(u16, Option<Ipv4Addr>)> {
        let tab = net_cfg
            .as_table_mut()
            .ok_or_else(|| eyre!("Net config not a table"))?;
        let port = tab
            .remove("listen_port")
            .ok_or_else(|| eyre!("No listen_port in net"))?
            .as_integer()
            .ok_or_else(|| eyre!("listen_port value should be an integer"))?;
        let port = u16::try_from(port).wrap_err("listen_port out of range")?;
        ensure!(port != 0, "listen_port must be nonzero");

        let ip = match tab.remove("ip") {
            None => None,
            Some(ip) => Some(
                ip.as_str()
                    .ok_or_else(|| eyre!("ip value should be a string"))?
                    .parse::<Ipv4Addr>()
                    .wrap_err("parse ip")?,
            ),
        };

        Ok((port, ip))
    }

    cfg.as_table_mut()
        .ok_or_else(|| eyre!("Malformed TOML, want table structure with capture and net sections"))
        .and_then(|tab| {
            let capture = capture_cfg(
                tab.remove("capture")
                    .ok_or_else(|| eyre!("No entry capture in cfg"))?,
            )?;
            let (listen_port, ip) = net_cfg(
                tab.remove("net")
                    .ok_or_else(|| eyre!("No entry net in cfg"))?,
            )?;

            let mut socket = SocketConfig::new(listen_port);
            if let Some(mut socket_cfg) = tab.remove("socket") {
                let stab = socket_cfg
                    .as_table_mut()
                    .ok_or_else(|| eyre!("Socket config not a table"))?;
                socket.send_buffer_size = size(stab, "send_buffer_size", socket.send_buffer_size)?;
                socket.receive_buffer_size =
                    size(stab, "receive_buffer_size", socket.receive_buffer_size)?;
            }

            Ok(Config {
                capture,
                ip,
                socket,
            })
        })
}

/// Outcome of [`PacketSocket::receive`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// This many packets are now in the batch.
    Packets(usize),
    /// The socket was closed.
    Closed,
}

/// UDP endpoint that reads and writes raw frames through a [`CaptureDevice`].
///
/// Dropping the socket closes it, joins the transmitter, and only then releases the device.
pub struct PacketSocket<D: CaptureDevice> {
    device: Arc<D>,
    src: SourceInfo,
    cfg: SocketConfig,
    channel: Arc<SendChannel>,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
    transmitter: Option<JoinHandle<()>>,
}

impl<D: CaptureDevice> PacketSocket<D> {
    /// Takes over an opened device and starts the transmitter.
    ///
    /// `ipv4_addr` is the source address written into every outgoing frame. Fails if the device's
    /// link type is unsupported.
    pub fn new(device: D, ipv4_addr: Ipv4Addr, cfg: SocketConfig) -> Result<Self> {
        let link = LinkType::try_from(device.link_type()).wrap_err("query data link type")?;
        ensure!(
            cfg.send_buffer_size >= LENGTH_PREFIX_SIZE + link.frame_len(link.max_payload()),
            "send buffer of {} bytes cannot hold a full frame",
            cfg.send_buffer_size
        );
        device
            .set_timeout(cfg.wait_timeout)
            .wrap_err("set capture timeout")?;

        let device = Arc::new(device);
        let channel = Arc::new(SendChannel::new(cfg.send_buffer_size));
        let closed = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());

        let transmitter = Transmitter {
            device: Arc::clone(&device),
            channel: Arc::clone(&channel),
            closed: Arc::clone(&closed),
            counters: Arc::clone(&counters),
            idle: cfg.transmit_idle_sleep,
        };
        let transmitter = std::thread::Builder::new()
            .name("pcap-udp-tx".into())
            .spawn(move || transmitter.run())
            .wrap_err("spawn transmitter thread")?;

        let src = SourceInfo {
            link,
            ipv4_addr,
            udp_port: cfg.listen_port,
        };
        info!(%ipv4_addr, port = cfg.listen_port, ?link, "bound");

        Ok(Self {
            device,
            src,
            cfg,
            channel,
            closed,
            counters,
            transmitter: Some(transmitter),
        })
    }

    pub fn source(&self) -> SourceInfo {
        self.src
    }

    pub fn config(&self) -> &SocketConfig {
        &self.cfg
    }

    /// A batch as large as one send buffer.
    pub fn batch(&self) -> OutgoingBatch {
        self.batch_with_capacity(self.cfg.send_buffer_size)
    }

    pub fn batch_with_capacity(&self, capacity: usize) -> OutgoingBatch {
        OutgoingBatch::new(self.src, capacity)
    }

    /// A receive batch sized from the socket config.
    pub fn receive_batch(&self, max_packets: usize) -> ReceiveBatch {
        ReceiveBatch::new(self.cfg.receive_buffer_size, max_packets)
    }

    /// Queues every frame in `batch` for transmission and clears it.
    ///
    /// Never waits for the network. If the send buffer cannot take the whole batch, the whole
    /// batch is dropped.
    pub fn send(&self, batch: &mut OutgoingBatch) -> Result<(), SendError> {
        match self.channel.push(batch) {
            Ok(n) => {
                Counters::add(&self.counters.bytes_out, n as u64);
                Ok(())
            }
            Err(err) => {
                let SendError::ChannelFull { dropped, .. } = &err;
                Counters::add(&self.counters.batches_dropped, 1);
                Counters::add(&self.counters.bytes_dropped, *dropped as u64);
                Err(err)
            }
        }
    }

    /// Waits for at least one packet addressed to the listen port, collecting up to `max` of
    /// them into `batch`.
    ///
    /// Previous contents of `batch` are discarded. Returns [`Received::Closed`] once the socket
    /// is closed, and an error only if the device failed for good.
    pub fn receive(&self, batch: &mut ReceiveBatch, max: usize) -> crate::error::Result<Received> {
        batch.reset();
        let limit = max.min(batch.max_packets());
        if limit == 0 {
            return Ok(Received::Packets(0));
        }

        let mut relaxed = false;
        let mut failures = 0u64;
        loop {
            if self.is_closed() {
                return Ok(Received::Closed);
            }

            let res = {
                let remaining = limit - batch.len();
                let mut filter =
                    ReceiveFilter::new(batch, limit, self.src.link, self.src.udp_port);
                self.device
                    .dispatch(remaining, &mut |meta, frame| filter.on_frame(meta, frame))
            };

            match res {
                Ok(_) => failures = 0,
                Err(DeviceError::Interrupted) => continue,
                Err(DeviceError::Transient(err)) => {
                    failures += 1;
                    // log the 1st, 2nd, 4th, 8th... failure in a row
                    if failures.is_power_of_two() {
                        warn!(%err, failures, "dispatch failed");
                    }
                }
                Err(err @ DeviceError::Fatal(_)) => {
                    error!(%err, "capture device failed");
                    return Err(err.into());
                }
            }

            if !batch.is_empty() {
                if relaxed {
                    self.set_wait(self.cfg.wait_timeout);
                }
                return Ok(Received::Packets(batch.len()));
            }

            if failures > 0 {
                // retry a failing device at the idle pace
                std::thread::sleep(self.cfg.idle_wait_timeout);
                continue;
            }

            // nothing arrived: wake up less often until traffic resumes
            if !relaxed {
                self.set_wait(self.cfg.idle_wait_timeout);
                relaxed = true;
            }
        }
    }

    fn set_wait(&self, timeout: Duration) {
        if let Err(err) = self.device.set_timeout(timeout) {
            warn!(%err, ?timeout, "set capture timeout");
        }
    }

    /// Stops the socket: wakes a blocked `receive` and makes the transmitter exit.
    ///
    /// Frames still queued are not sent. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("closing packet socket");
        }
        self.device.break_loop();
        self.channel.wake();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SocketStats {
        self.counters.snapshot()
    }
}

impl<D: CaptureDevice> Drop for PacketSocket<D> {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self.transmitter.take() {
            if handle.join().is_err() {
                error!("transmitter thread panicked");
            }
        }
        // `device` is released after this, once the transmitter no longer holds it
    }
}
