//! # Integration tests: engine ↔ reassembly through the wire format
//!
//! The "network" is a pair of in-memory queues carrying encoded frames, so
//! loss, duplication, reordering, and delay are applied exactly where a real
//! link would apply them. No sockets, no sleeps — time is a stepped
//! `quanta::Instant`.

use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

use tarn_transport::congestion::{Algorithm, CongestionControl};
use tarn_transport::reassembly::{ReassemblyBuffer, ReceiverEvent};
use tarn_transport::retransmit::{EngineConfig, RetransmitEngine};
use tarn_transport::session::{
    ReceiverAction, ReceiverSession, SenderAction, SenderSession, EOF_INTERVAL,
};
use tarn_transport::wire::{AckFrame, DataFrame, MSS};

// ─── Helpers ────────────────────────────────────────────────────────────────

fn engine(algo: Algorithm, now: Instant) -> RetransmitEngine {
    RetransmitEngine::new(CongestionControl::new(algo, now), EngineConfig::default())
}

fn chunk(data: &[u8]) -> Vec<Bytes> {
    data.chunks(MSS).map(Bytes::copy_from_slice).collect()
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Feed one encoded data frame across the "wire" into the receiver.
fn deliver(rx: &mut ReassemblyBuffer, frame: &Bytes, now: Instant) {
    let decoded = DataFrame::decode(frame.clone()).expect("valid frame");
    rx.on_data(decoded, now);
}

/// Drain receiver events: deliveries append to `sink`, ACKs round-trip
/// through the wire encoding, EOF-ACK count is returned.
fn pump(rx: &mut ReassemblyBuffer, sink: &mut Vec<u8>) -> (Vec<AckFrame>, usize) {
    let mut acks = Vec::new();
    let mut eof_acks = 0;
    for event in rx.drain_events().collect::<Vec<_>>() {
        match event {
            ReceiverEvent::Deliver(payload) => sink.extend_from_slice(&payload),
            ReceiverEvent::SendAck(ack) => {
                let wire = ack.encode();
                acks.push(AckFrame::decode(wire).expect("own ACK is well-formed"));
            }
            ReceiverEvent::SendEofAck => eof_acks += 1,
        }
    }
    (acks, eof_acks)
}

/// Apply a decoded ACK to the engine, returning any fast retransmissions.
fn apply_ack(tx: &mut RetransmitEngine, ack: &AckFrame, now: Instant) -> Vec<Bytes> {
    match ack {
        AckFrame::Ack { cum_ack, sacks } => tx.on_ack(*cum_ack, sacks, now),
        AckFrame::EofAck => Vec::new(),
    }
}

/// Run a lossless transfer to completion with a fixed time step.
fn run_lossless(tx: &mut RetransmitEngine, rx: &mut ReassemblyBuffer) -> Vec<u8> {
    let mut sink = Vec::new();
    let mut now = Instant::now();
    for _ in 0..10_000 {
        if tx.is_complete() {
            break;
        }
        now += Duration::from_millis(5);
        let mut frames = tx.on_tick(now);
        frames.extend(tx.try_send(now));
        assert!(
            tx.in_flight_bytes() <= tx.cwnd_bytes(),
            "dispatch must stay within the window"
        );
        for frame in &frames {
            deliver(rx, frame, now);
        }
        now += Duration::from_millis(5);
        let (acks, _) = pump(rx, &mut sink);
        for ack in &acks {
            for frame in apply_ack(tx, ack, now) {
                deliver(rx, &frame, now);
            }
        }
        let (acks, _) = pump(rx, &mut sink);
        for ack in &acks {
            apply_ack(tx, ack, now);
        }
    }
    assert!(tx.is_complete(), "lossless transfer must finish");
    sink
}

// ─── Lossless sessions ──────────────────────────────────────────────────────

#[test]
fn lossless_transfer_is_bit_exact() {
    let now = Instant::now();
    let src = patterned(10 * MSS + 37);
    let mut tx = engine(Algorithm::Cubic, now);
    tx.start(chunk(&src));
    let mut rx = ReassemblyBuffer::new();

    let sink = run_lossless(&mut tx, &mut rx);
    assert_eq!(sink, src);
    assert_eq!(rx.stats().duplicates, 0);
    assert_eq!(tx.stats().retransmissions, 0);
}

#[test]
fn repeated_sessions_produce_identical_sinks() {
    let src = patterned(7 * MSS + 311);
    let run = || {
        let now = Instant::now();
        let mut tx = engine(Algorithm::Cubic, now);
        tx.start(chunk(&src));
        let mut rx = ReassemblyBuffer::new();
        run_lossless(&mut tx, &mut rx)
    };
    assert_eq!(run(), run());
}

#[test]
fn single_segment_transfer() {
    let now = Instant::now();
    let src = b"one small segment".to_vec();
    let mut tx = engine(Algorithm::Cubic, now);
    tx.start(chunk(&src));
    let mut rx = ReassemblyBuffer::new();

    let sink = run_lossless(&mut tx, &mut rx);
    assert_eq!(sink, src);
    assert_eq!(rx.expected_seq(), 1);
}

#[test]
fn zero_length_source_exchanges_eof_only() {
    let mut now = Instant::now();
    let mut tx = engine(Algorithm::Cubic, now);
    tx.start(Vec::new());
    assert!(tx.is_complete(), "nothing to send");

    let mut sender = SenderSession::new(now);
    sender.on_request(now);
    let mut receiver = ReceiverSession::new(now);
    let mut rx = ReassemblyBuffer::new();
    let mut sink = Vec::new();

    // Sender goes straight to the EOF handshake.
    assert!(matches!(
        sender.on_transfer_complete(now),
        SenderAction::SendEof
    ));
    receiver.on_peer_activity(now);
    rx.on_data(DataFrame::Eof, now);
    let (_, eof_acks) = pump(&mut rx, &mut sink);
    assert_eq!(eof_acks, 1);
    sender.on_eof_ack();

    assert!(sender.is_closed() && sender.clean_close());
    assert!(sink.is_empty(), "sink file must be empty");

    // Receiver settles after a quiet grace period.
    receiver.on_file_complete();
    now += Duration::from_secs(2);
    assert!(matches!(
        receiver.poll(rx.eof_frames_seen(), rx.pending_is_empty(), now),
        ReceiverAction::Close
    ));
    assert!(receiver.clean_close());
}

// ─── Loss scenarios ─────────────────────────────────────────────────────────

/// Two segments; the second is lost on its first transmission. The tail
/// loss is invisible to SACK, so only the base timer can recover it.
#[test]
fn tail_loss_recovers_via_timeout() {
    let mut now = Instant::now();
    let src = patterned(2 * MSS);
    let mut tx = engine(Algorithm::Cubic, now);
    tx.start(chunk(&src));
    let mut rx = ReassemblyBuffer::new();
    let mut sink = Vec::new();

    // seq 0 out and acked; the window opens.
    for frame in tx.try_send(now) {
        deliver(&mut rx, &frame, now);
    }
    now += Duration::from_millis(10);
    let (acks, _) = pump(&mut rx, &mut sink);
    for ack in &acks {
        apply_ack(&mut tx, ack, now);
    }

    // seq 1 goes out and is lost.
    let lost = tx.try_send(now);
    assert_eq!(lost.len(), 1);
    assert!(rx.pending_is_empty(), "tail loss leaves no gap to buffer");

    // Nothing happens until the retransmission timer fires.
    now += tx.rto() + Duration::from_millis(1);
    let frames = tx.on_tick(now);
    assert_eq!(frames.len(), 1, "base segment retransmitted");
    assert_eq!(tx.stats().timeouts, 1);
    for frame in &frames {
        deliver(&mut rx, frame, now);
    }

    now += Duration::from_millis(10);
    let (acks, _) = pump(&mut rx, &mut sink);
    for ack in &acks {
        apply_ack(&mut tx, ack, now);
    }
    assert!(tx.is_complete());
    assert_eq!(sink, src);
}

/// Three segments; the middle one is lost. The receiver's SACK + the
/// timeout-forced duplicate ACKs drive a fast retransmit on the third
/// duplicate, well before the RTO.
#[test]
fn middle_loss_triggers_fast_retransmit() {
    let mut now = Instant::now();
    let src = patterned(3 * MSS);
    let mut tx = engine(Algorithm::Cubic, now);
    tx.start(chunk(&src));
    let mut rx = ReassemblyBuffer::new();
    let mut sink = Vec::new();

    // seq 0 delivered and acked.
    for frame in tx.try_send(now) {
        deliver(&mut rx, &frame, now);
    }
    now += Duration::from_millis(10);
    let (acks, _) = pump(&mut rx, &mut sink);
    for ack in &acks {
        apply_ack(&mut tx, ack, now);
    }

    // seqs 1 and 2 go out; 1 is lost.
    let frames = tx.try_send(now);
    assert_eq!(frames.len(), 2);
    deliver(&mut rx, &frames[1], now);

    // The out-of-order arrival ACKs immediately: cum=1, SACK=[2,1).
    let (acks, _) = pump(&mut rx, &mut sink);
    assert_eq!(acks.len(), 1);
    assert!(matches!(
        &acks[0],
        AckFrame::Ack { cum_ack: 1, sacks } if sacks.len() == 1 && sacks[0].start == 2
    ));
    let mut retransmits = apply_ack(&mut tx, &acks[0], now); // dup #1

    // Two timeout-forced re-ACKs from the receiver complete the triple.
    for _ in 0..2 {
        now += Duration::from_millis(10);
        rx.force_ack(now);
        let (acks, _) = pump(&mut rx, &mut sink);
        for ack in &acks {
            retransmits.extend(apply_ack(&mut tx, ack, now));
        }
    }
    assert_eq!(retransmits.len(), 1, "exactly one fast retransmit");
    assert_eq!(tx.stats().fast_retransmits, 1);
    assert_eq!(tx.stats().timeouts, 0, "recovered without an RTO");

    now += Duration::from_millis(10);
    for frame in &retransmits {
        deliver(&mut rx, frame, now);
    }
    let (acks, _) = pump(&mut rx, &mut sink);
    for ack in &acks {
        apply_ack(&mut tx, ack, now);
    }
    assert!(tx.is_complete());
    assert_eq!(sink, src);
}

#[test]
fn duplicated_frames_deliver_exactly_once() {
    let now = Instant::now();
    let src = patterned(4 * MSS);
    let mut tx = engine(Algorithm::Cubic, now);
    tx.start(chunk(&src));
    let mut rx = ReassemblyBuffer::new();
    let mut sink = Vec::new();
    let mut t = now;

    for _ in 0..1000 {
        if tx.is_complete() {
            break;
        }
        t += Duration::from_millis(10);
        let frames = tx.try_send(t);
        for frame in &frames {
            // The link duplicates every frame.
            deliver(&mut rx, frame, t);
            deliver(&mut rx, frame, t);
        }
        let (acks, _) = pump(&mut rx, &mut sink);
        for ack in &acks {
            apply_ack(&mut tx, ack, t);
        }
    }
    assert!(tx.is_complete());
    assert_eq!(sink, src, "duplicates must not corrupt the sink");
    assert_eq!(rx.stats().packets_delivered, 4);
    assert!(rx.stats().duplicates >= 4);
}

// ─── Randomized loss + jitter ───────────────────────────────────────────────

/// Shared harness: 100-segment session over a link with the given loss rate
/// and per-frame jitter (which reorders). Returns (sink, tx, rx).
fn run_lossy(
    algo: Algorithm,
    loss: f64,
    jitter_ms: u64,
    seed: u64,
) -> (Vec<u8>, RetransmitEngine, ReassemblyBuffer) {
    let mut rng = StdRng::seed_from_u64(seed);
    let src = patterned(100 * MSS);
    let start = Instant::now();
    let mut tx = engine(algo, start);
    tx.start(chunk(&src));
    let mut rx = ReassemblyBuffer::new();
    let mut sink = Vec::new();

    // In-transit frames, tagged with their arrival time.
    let mut data_wire: Vec<(Instant, Bytes)> = Vec::new();
    let mut ack_wire: Vec<(Instant, AckFrame)> = Vec::new();
    let mut now = start;
    let mut last_rx_activity = start;

    let jitter = move |rng: &mut StdRng| {
        let extra = if jitter_ms > 0 {
            rng.random_range(0..jitter_ms)
        } else {
            0
        };
        Duration::from_millis(5 + extra)
    };
    let send = |frames: Vec<Bytes>,
                now: Instant,
                rng: &mut StdRng,
                wire: &mut Vec<(Instant, Bytes)>| {
        for frame in frames {
            if loss > 0.0 && rng.random_bool(loss) {
                continue; // the link ate it
            }
            let delay = jitter(rng);
            wire.push((now + delay, frame));
        }
    };

    for _ in 0..200_000 {
        if tx.is_complete() {
            break;
        }
        now += Duration::from_millis(1);

        // Sender: timers, then dispatch.
        let cwnd_before = tx.cwnd_bytes();
        let expired = tx.on_tick(now);
        if !expired.is_empty() && algo == Algorithm::Cubic {
            assert!(
                tx.cwnd_bytes() <= cwnd_before,
                "cwnd must not grow across a loss event"
            );
        }
        send(expired, now, &mut rng, &mut data_wire);
        send(tx.try_send(now), now, &mut rng, &mut data_wire);

        // Link → receiver.
        let mut due: Vec<Bytes> = Vec::new();
        data_wire.retain(|(at, frame)| {
            if *at <= now {
                due.push(frame.clone());
                false
            } else {
                true
            }
        });
        for frame in due {
            deliver(&mut rx, &frame, now);
            last_rx_activity = now;
        }
        // Receiver re-ACKs on its own timer when the link goes quiet.
        if now.duration_since(last_rx_activity) > Duration::from_millis(500)
            && rx.stats().packets_received > 0
        {
            rx.force_ack(now);
            last_rx_activity = now;
        }
        let (acks, _) = pump(&mut rx, &mut sink);
        for ack in acks {
            let delay = jitter(&mut rng);
            ack_wire.push((now + delay, ack));
        }

        // Link → sender.
        let mut due: Vec<AckFrame> = Vec::new();
        ack_wire.retain(|(at, ack)| {
            if *at <= now {
                due.push(ack.clone());
                false
            } else {
                true
            }
        });
        for ack in due {
            send(apply_ack(&mut tx, &ack, now), now, &mut rng, &mut data_wire);
        }
    }

    assert!(
        tx.is_complete(),
        "session must complete within the time budget"
    );
    assert_eq!(sink, src, "sink must equal source bit-exactly");
    (sink, tx, rx)
}

#[test]
fn cubic_survives_ten_percent_loss_with_jitter() {
    let (_, tx, rx) = run_lossy(Algorithm::Cubic, 0.10, 50, 0x7a51);
    assert!(tx.stats().retransmissions > 0, "loss must force repairs");
    assert_eq!(rx.stats().packets_delivered, 100);
}

#[test]
fn bbr_survives_ten_percent_loss_with_jitter() {
    let (_, tx, rx) = run_lossy(Algorithm::Bbr, 0.10, 50, 0x7a52);
    assert!(tx.stats().retransmissions > 0);
    assert_eq!(rx.stats().packets_delivered, 100);
}

#[test]
fn steady_link_needs_no_repairs() {
    let (_, tx, _) = run_lossy(Algorithm::Cubic, 0.0, 0, 0x7a53);
    assert_eq!(tx.stats().fast_retransmits, 0);
    assert_eq!(tx.stats().timeouts, 0);
}

// ─── EOF handshake ──────────────────────────────────────────────────────────

/// The EOF-ACK is dropped twice; the sender's 200 ms retry loop carries the
/// handshake on the third exchange.
#[test]
fn eof_ack_lost_twice_then_handshake_completes() {
    let mut now = Instant::now();
    let mut sender = SenderSession::new(now);
    sender.on_request(now);
    let mut rx = ReassemblyBuffer::new();
    let mut sink = Vec::new();

    assert!(matches!(
        sender.on_transfer_complete(now),
        SenderAction::SendEof
    ));

    for attempt in 1..=3 {
        // The EOF frame reaches the receiver, which confirms every copy.
        rx.on_data(DataFrame::Eof, now);
        let (_, eof_acks) = pump(&mut rx, &mut sink);
        assert_eq!(eof_acks, 1);

        if attempt < 3 {
            // EOF-ACK lost: the retry timer fires.
            now += EOF_INTERVAL + Duration::from_millis(1);
            assert!(matches!(sender.poll(now), SenderAction::SendEof));
        } else {
            sender.on_eof_ack();
        }
    }

    assert!(sender.is_closed());
    assert!(sender.clean_close());
    assert!(sender.eof_attempts() <= 3);
    assert_eq!(rx.eof_frames_seen(), 3);
}
