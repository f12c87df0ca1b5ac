//! Tarn receiver daemon.
//!
//! Sends the one-byte session request, reassembles the stream into the sink
//! file (append-only, strictly in sequence order), answers with cumulative
//! ACK + SACK, and runs the EOF handshake. On failure the partial output is
//! retained on disk and labeled incomplete in the log.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::{IpAddr, UdpSocket};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use quanta::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use tarn_transport::error::TransportError;
use tarn_transport::reassembly::{ReassemblyBuffer, ReceiverEvent};
use tarn_transport::session::{ReceiverAction, ReceiverSession, REQUEST_TIMEOUT};
use tarn_transport::wire::{self, AckFrame, DataFrame, MAX_DATAGRAM};

/// Receive poll interval: bounds how late a timeout-forced ACK can be.
const RECV_POLL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(
    name = "tarn-receiver",
    about = "Request a file over the Tarn reliable-UDP transport and reassemble it"
)]
struct Args {
    /// Sender address.
    server_ip: IpAddr,
    /// Sender port.
    server_port: u16,
    /// Prefix for the sink path (`<prefix>received_data.txt`).
    output_prefix: Option<String>,
    /// Print the final receiver statistics as JSON.
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

/// Send a frame, swallowing ICMP-unreachable errors: the peer closing its
/// socket right after the handshake must not fail a completed transfer.
fn send_best_effort(socket: &UdpSocket, payload: &[u8]) -> std::io::Result<()> {
    match socket.send(payload) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => Ok(()),
        Err(err) => Err(err),
    }
}

fn run(args: &Args) -> Result<()> {
    let sink_path = format!(
        "{}received_data.txt",
        args.output_prefix.as_deref().unwrap_or_default()
    );
    let sink = File::create(&sink_path)
        .map_err(TransportError::SinkUnwritable)
        .with_context(|| format!("creating {sink_path}"))?;
    let mut sink = BufWriter::new(sink);

    let bind_addr: IpAddr = if args.server_ip.is_ipv4() {
        IpAddr::from([0u8; 4])
    } else {
        IpAddr::from([0u16; 8])
    };
    let socket = UdpSocket::bind((bind_addr, 0)).context("binding local socket")?;
    socket
        .connect((args.server_ip, args.server_port))
        .with_context(|| format!("connecting {}:{}", args.server_ip, args.server_port))?;
    info!(
        "requesting transfer from {}:{} into {sink_path}",
        args.server_ip, args.server_port
    );

    let now = Instant::now();
    let mut session = ReceiverSession::new(now);
    let mut buffer = ReassemblyBuffer::new();
    let mut buf = [0u8; MAX_DATAGRAM];
    let mut started = None;

    loop {
        let now = Instant::now();

        // Handshake: (re)send the request until the first frame lands.
        match session.poll_request(now) {
            ReceiverAction::SendRequest => {
                send_best_effort(&socket, &wire::session_request())
                    .context("sending session request")?;
            }
            ReceiverAction::Fail(err) => return Err(err.into()),
            _ => {}
        }

        // Move buffered work out before deciding the session's fate.
        let events: Vec<ReceiverEvent> = buffer.drain_events().collect();
        for event in events {
            match event {
                ReceiverEvent::Deliver(payload) => {
                    sink.write_all(&payload)
                        .map_err(TransportError::SinkUnwritable)
                        .with_context(|| format!("writing {sink_path}"))?;
                }
                ReceiverEvent::SendAck(ack) => {
                    send_best_effort(&socket, &ack.encode()).context("sending ACK")?;
                }
                ReceiverEvent::SendEofAck => {
                    send_best_effort(&socket, &AckFrame::EofAck.encode())
                        .context("sending EOF-ACK")?;
                }
            }
        }

        if buffer.file_complete() {
            session.on_file_complete();
        }
        match session.poll(buffer.eof_frames_seen(), buffer.pending_is_empty(), now) {
            ReceiverAction::Close => break,
            ReceiverAction::Fail(err) => {
                sink.flush().ok();
                warn!(
                    path = %sink_path,
                    delivered_segments = buffer.expected_seq(),
                    missing = buffer.pending_len(),
                    "transfer INCOMPLETE — partial output retained"
                );
                return Err(err.into());
            }
            _ => {}
        }

        let poll = match session.next_deadline() {
            Some(deadline) => deadline
                .duration_since(now)
                .max(Duration::from_millis(1))
                .min(if started.is_none() { REQUEST_TIMEOUT } else { RECV_POLL }),
            None => RECV_POLL,
        };
        socket
            .set_read_timeout(Some(poll))
            .context("setting socket deadline")?;

        match socket.recv(&mut buf) {
            Ok(len) => {
                let now = Instant::now();
                session.on_peer_activity(now);
                started.get_or_insert(now);
                match DataFrame::decode(Bytes::copy_from_slice(&buf[..len])) {
                    Ok(frame) => buffer.on_data(frame, now),
                    Err(err) => debug!(%err, "dropping malformed frame"),
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                // A quiet interval with data outstanding: re-ACK so the
                // sender's duplicate-ACK machinery keeps moving.
                if started.is_some() && !session.is_closed() {
                    buffer.force_ack(Instant::now());
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
                // ICMP unreachable surfaces here on connected sockets; the
                // request retry budget decides when to give up.
                debug!("peer refused — will retry");
            }
            Err(err) => return Err(anyhow::Error::new(err).context("socket receive")),
        }
    }

    sink.flush()
        .map_err(TransportError::SinkUnwritable)
        .context("flushing sink")?;

    let stats = buffer.stats();
    let elapsed = started.map(|t| t.elapsed()).unwrap_or_default();
    info!(
        path = %sink_path,
        bytes = stats.bytes_received,
        delivered_segments = stats.packets_delivered,
        duplicates = stats.duplicates,
        out_of_order = stats.out_of_order,
        acks_sent = stats.acks_sent,
        secs = elapsed.as_secs_f64(),
        mbps = stats.bytes_received as f64 * 8.0 / elapsed.as_secs_f64().max(1e-9) / 1e6,
        "transfer complete"
    );
    if args.stats_json {
        println!("{}", serde_json::to_string_pretty(stats)?);
    }
    Ok(())
}
