//! Echo every datagram sent to the listen port back to its sender.

use color_eyre::{eyre::WrapErr, Result};
use pcap_udp::capture::{interface_ipv4, PcapDevice};
use pcap_udp::{Config, PacketSocket, Received};
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;
use tracing::{debug, info, warn};
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, StructOpt)]
struct Opt {
    #[structopt(long)]
    cfg: PathBuf,

    /// Threads building reply batches.
    #[structopt(short, long, default_value = "2")]
    workers: usize,

    /// Packets to collect per receive call.
    #[structopt(long, default_value = "64")]
    burst: usize,

    /// Stop after echoing this many packets.
    #[structopt(long)]
    count: Option<usize>,
}

struct Msg {
    from: SocketAddrV4,
    buf: Vec<u8>,
}

fn main() -> Result<()> {
    let subscriber = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(ErrorLayer::default());
    let d = tracing::Dispatch::new(subscriber);
    d.init();
    color_eyre::install()?;
    let Opt {
        cfg,
        workers,
        burst,
        count,
    } = Opt::from_args();

    let cfg = Config::from_file(&cfg).wrap_err("load config")?;
    let ip = match cfg.ip {
        Some(ip) => ip,
        None => interface_ipv4(&cfg.capture.device).wrap_err("interface lookup")?,
    };
    let device =
        PcapDevice::open(&cfg.capture, cfg.socket.listen_port).wrap_err("open capture device")?;
    let socket = Arc::new(PacketSocket::new(device, ip, cfg.socket.clone()).wrap_err("socket")?);

    let (msgs_s, msgs_r) = flume::bounded::<Vec<Msg>>(16);
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let socket = Arc::clone(&socket);
            let msgs_r = msgs_r.clone();
            std::thread::spawn(move || do_worker(&socket, msgs_r))
        })
        .collect();

    let res = do_receive(&socket, msgs_s, burst, count);
    socket.close();
    for h in handles {
        let _ = h.join();
    }
    info!(stats = ?socket.stats(), "done");
    res
}

fn do_receive(
    socket: &PacketSocket<PcapDevice>,
    msgs_s: flume::Sender<Vec<Msg>>,
    burst: usize,
    count: Option<usize>,
) -> Result<()> {
    let mut batch = socket.receive_batch(burst);
    let mut echoed = 0;
    loop {
        match socket.receive(&mut batch, burst).wrap_err("receive")? {
            Received::Closed => return Ok(()),
            Received::Packets(n) => {
                debug!(?n, "received");
                let msgs = batch
                    .packets()
                    .map(|p| Msg {
                        from: p.from,
                        buf: p.payload.to_vec(),
                    })
                    .collect();
                msgs_s.send(msgs).wrap_err("hand off to workers")?;
                echoed += n;
            }
        }

        if count.map_or(false, |c| echoed >= c) {
            return Ok(());
        }
    }
}

fn do_worker(socket: &PacketSocket<PcapDevice>, msgs_r: flume::Receiver<Vec<Msg>>) {
    let mut out = socket.batch_with_capacity(64 * 1024);
    while let Ok(msgs) = msgs_r.recv() {
        for Msg { from, buf } in msgs {
            if out.append(SocketAddr::V4(from), &[&buf]).is_err() {
                // full: flush and retry once
                if let Err(err) = socket.send(&mut out) {
                    warn!(%err, "dropped replies");
                }
                if let Err(err) = out.append(SocketAddr::V4(from), &[&buf]) {
                    warn!(%err, %from, "dropped reply");
                }
            }
        }
        if let Err(err) = socket.send(&mut out) {
            warn!(%err, "dropped replies");
        }
    }
}
