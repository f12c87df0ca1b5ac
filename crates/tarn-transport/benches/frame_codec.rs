use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use quanta::Instant;

use tarn_transport::congestion::{Algorithm, CongestionControl};
use tarn_transport::reassembly::ReassemblyBuffer;
use tarn_transport::retransmit::{EngineConfig, RetransmitEngine};
use tarn_transport::wire::{AckFrame, DataFrame, SackRange, MSS};

/// Benchmark the wire codec hot path: encode + decode of full-size frames.
fn bench_frame_codec(c: &mut Criterion) {
    let payload = Bytes::from(vec![0xABu8; MSS]);

    let mut group = c.benchmark_group("wire");
    group.throughput(Throughput::Bytes(MSS as u64));

    group.bench_function("encode_data_frame", |b| {
        b.iter(|| {
            let frame = DataFrame::Segment {
                seq: black_box(42),
                payload: payload.clone(),
            };
            black_box(frame.encode());
        });
    });

    let encoded = DataFrame::Segment {
        seq: 42,
        payload: payload.clone(),
    }
    .encode();
    group.bench_function("decode_data_frame", |b| {
        b.iter(|| black_box(DataFrame::decode(black_box(encoded.clone())).unwrap()));
    });

    let ack = AckFrame::Ack {
        cum_ack: 100,
        sacks: vec![
            SackRange { start: 102, len: 3 },
            SackRange { start: 110, len: 1 },
        ],
    }
    .encode();
    group.bench_function("decode_ack_frame", |b| {
        b.iter(|| black_box(AckFrame::decode(black_box(ack.clone())).unwrap()));
    });

    group.finish();
}

/// Benchmark the engine hot path: dispatch + ACK ingestion for one window.
fn bench_engine_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine");
    group.throughput(Throughput::Elements(1));

    group.bench_function("send_and_ack_100_segments", |b| {
        let segments: Vec<Bytes> = (0..100).map(|_| Bytes::from(vec![0u8; MSS])).collect();
        b.iter(|| {
            let mut now = Instant::now();
            let mut tx = RetransmitEngine::new(
                CongestionControl::new(Algorithm::Cubic, now),
                EngineConfig::default(),
            );
            tx.start(segments.clone());
            while !tx.is_complete() {
                now += std::time::Duration::from_millis(10);
                tx.try_send(now);
                tx.on_ack(tx.next_seq(), &[], now);
            }
        });
    });

    group.finish();
}

/// Benchmark the receiver hot path: in-order reassembly of a full stream.
fn bench_reassembly(c: &mut Criterion) {
    let frames: Vec<Bytes> = (0..100)
        .map(|seq| {
            DataFrame::Segment {
                seq,
                payload: Bytes::from(vec![0u8; MSS]),
            }
            .encode()
        })
        .collect();

    let mut group = c.benchmark_group("reassembly");
    group.throughput(Throughput::Bytes((100 * MSS) as u64));

    group.bench_function("reassemble_100_in_order", |b| {
        b.iter(|| {
            let now = Instant::now();
            let mut rx = ReassemblyBuffer::new();
            for frame in &frames {
                rx.on_data(DataFrame::decode(frame.clone()).unwrap(), now);
                rx.drain_events().for_each(drop);
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_codec,
    bench_engine_window,
    bench_reassembly
);
criterion_main!(benches);
