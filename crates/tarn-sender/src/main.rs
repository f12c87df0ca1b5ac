//! Tarn sender daemon.
//!
//! Binds a UDP socket, waits for a receiver's one-byte session request, and
//! streams one file through the retransmission engine. Single-threaded
//! cooperative loop: the socket read deadline is the next timer expiry, so
//! ACK handling, timer checks, and dispatch interleave deterministically.

use std::fs;
use std::net::{IpAddr, UdpSocket};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use quanta::Instant;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use tarn_transport::congestion::{Algorithm, CongestionControl};
use tarn_transport::error::TransportError;
use tarn_transport::retransmit::{EngineConfig, RetransmitEngine};
use tarn_transport::session::{SenderAction, SenderSession};
use tarn_transport::wire::{AckFrame, DataFrame, MAX_DATAGRAM, MSS};

/// Floor on the socket read timeout (zero is rejected by the OS).
const MIN_POLL: Duration = Duration::from_millis(1);
/// Poll interval when no timer is pending.
const IDLE_POLL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(
    name = "tarn-sender",
    about = "Serve one file over the Tarn reliable-UDP transport"
)]
struct Args {
    /// Address to bind the UDP socket on.
    bind_ip: IpAddr,
    /// Port to bind.
    bind_port: u16,
    /// Hard cap on the congestion window, in bytes.
    window_bytes: Option<u64>,
    /// File to serve.
    #[arg(long, default_value = "data.txt")]
    file: PathBuf,
    /// Congestion control algorithm (cubic or bbr).
    #[arg(long, default_value = "cubic")]
    cc: Algorithm,
    /// Print the final sender statistics as JSON.
    #[arg(long)]
    stats_json: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(err) = run(&args) {
        error!("session failed: {err:#}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let data = fs::read(&args.file)
        .map_err(TransportError::SourceUnavailable)
        .with_context(|| format!("reading {}", args.file.display()))?;
    let segments: Vec<Bytes> = data
        .chunks(MSS)
        .map(Bytes::copy_from_slice)
        .collect();
    info!(
        file = %args.file.display(),
        bytes = data.len(),
        segments = segments.len(),
        cc = ?args.cc,
        "source loaded"
    );

    let socket = UdpSocket::bind((args.bind_ip, args.bind_port))
        .with_context(|| format!("binding {}:{}", args.bind_ip, args.bind_port))?;
    info!("listening on {}:{}", args.bind_ip, args.bind_port);

    // The first datagram from any peer is the session request; its sender
    // becomes the pinned peer for the rest of the session.
    let mut buf = [0u8; MAX_DATAGRAM];
    let (_, peer) = socket
        .recv_from(&mut buf)
        .context("waiting for session request")?;
    info!(%peer, "session request received");

    let now = Instant::now();
    let mut session = SenderSession::new(now);
    session.on_request(now);

    // Size the segment pool to the requested window so the slab can never
    // throttle dispatch below it.
    let pool_capacity = match args.window_bytes {
        Some(limit) => (limit / MSS as u64) as usize + 1,
        None => EngineConfig::default().pool_capacity,
    };
    let mut engine = RetransmitEngine::new(
        CongestionControl::new(args.cc, now),
        EngineConfig {
            window_limit: args.window_bytes,
            pool_capacity,
        },
    );
    engine.start(segments);

    let started = Instant::now();
    let total_bytes = data.len();

    loop {
        let now = Instant::now();

        // Timers fire before dispatch so a collapsed window is respected.
        for frame in engine.on_tick(now) {
            socket.send_to(&frame, peer).context("retransmit send")?;
        }
        for frame in engine.try_send(now) {
            socket.send_to(&frame, peer).context("segment send")?;
        }

        if engine.is_complete() {
            if let SenderAction::SendEof = session.on_transfer_complete(now) {
                socket
                    .send_to(&DataFrame::Eof.encode(), peer)
                    .context("EOF send")?;
            }
        }
        match session.poll(now) {
            SenderAction::SendEof => {
                socket
                    .send_to(&DataFrame::Eof.encode(), peer)
                    .context("EOF retransmit")?;
            }
            SenderAction::Fail(err) => return Err(err.into()),
            SenderAction::None => {}
        }
        if session.is_closed() {
            break;
        }

        // Block for ACKs until the next timer is due.
        let deadline = [engine.next_deadline(), session.next_deadline()]
            .into_iter()
            .flatten()
            .min();
        let timeout = deadline
            .map(|d| d.duration_since(now).max(MIN_POLL))
            .unwrap_or(IDLE_POLL);
        socket
            .set_read_timeout(Some(timeout))
            .context("setting socket deadline")?;

        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                if from != peer {
                    debug!(%from, "ignoring datagram from unknown peer");
                    continue;
                }
                let now = Instant::now();
                session.on_peer_activity(now);
                match AckFrame::decode(Bytes::copy_from_slice(&buf[..len])) {
                    Ok(AckFrame::Ack { cum_ack, sacks }) => {
                        for frame in engine.on_ack(cum_ack, &sacks, now) {
                            socket.send_to(&frame, peer).context("fast retransmit")?;
                        }
                    }
                    Ok(AckFrame::EofAck) => session.on_eof_ack(),
                    Err(err) => debug!(%err, "dropping malformed frame"),
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(err) => return Err(anyhow::Error::new(err).context("socket receive")),
        }
    }

    let elapsed = started.elapsed();
    let stats = engine.stats();
    info!(
        bytes = total_bytes,
        secs = elapsed.as_secs_f64(),
        mbps = total_bytes as f64 * 8.0 / elapsed.as_secs_f64().max(1e-9) / 1e6,
        retransmissions = stats.retransmissions,
        fast_retransmits = stats.fast_retransmits,
        timeouts = stats.timeouts,
        eof_attempts = session.eof_attempts(),
        "transfer complete"
    );
    if args.stats_json {
        println!("{}", serde_json::to_string_pretty(stats)?);
    }
    Ok(())
}
