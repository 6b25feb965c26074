//! Ring span-protocol benchmarks.

use bifrost::memory::Space;
use bifrost::ring::Ring;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn bench_reserve_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("reserve_commit");

    for span_bytes in [4 * 1024, 64 * 1024, 1024 * 1024] {
        let ring = Ring::new(format!("bench-w-{span_bytes}"), Space::System);
        ring.resize(span_bytes as u64, 8 * span_bytes as u64, 1).unwrap();
        let mut writer = ring.begin_writing().unwrap();
        let seq = writer.begin_sequence("bench", 0, b"").unwrap();

        group.throughput(Throughput::Bytes(span_bytes as u64));
        group.bench_with_input(BenchmarkId::from_parameter(span_bytes), &seq, |b, seq| {
            b.iter(|| {
                let span = seq.reserve(span_bytes).unwrap();
                span.commit().unwrap();
            });
        });
    }

    group.finish();
}

fn bench_write_read_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_read_cycle");

    for span_bytes in [4 * 1024, 64 * 1024] {
        let ring = Ring::new(format!("bench-rw-{span_bytes}"), Space::System);
        ring.resize(span_bytes as u64, 8 * span_bytes as u64, 1).unwrap();
        let mut writer = ring.begin_writing().unwrap();
        let seq = writer.begin_sequence("bench", 0, b"").unwrap();
        let reader = ring.open_reading(false);
        let mut rseq = reader.open_earliest().unwrap();

        group.throughput(Throughput::Bytes(span_bytes as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(span_bytes),
            &span_bytes,
            |b, &n| {
                b.iter(|| {
                    let mut span = seq.reserve(n).unwrap();
                    span[0] = 1;
                    span.commit().unwrap();
                    let rspan = rseq.acquire(n).unwrap();
                    criterion::black_box(rspan[0]);
                    rspan.release();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_reserve_commit, bench_write_read_cycle);
criterion_main!(benches);
