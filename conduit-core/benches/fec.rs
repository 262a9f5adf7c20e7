use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
#[cfg(feature = "fec-rs")]
use conduit_core::fec::RsCodec;
use conduit_core::fec::{RedundancyDecoder, RedundancyEncoder, XorCodec};

fn group_of(shard_size: usize, members: usize) -> Vec<Bytes> {
    (0..members)
        .map(|i| Bytes::from(vec![i as u8; shard_size]))
        .collect()
}

fn bench_xor_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec_xor_encode");
    for &sz in &[256usize, 1200, 2033] {
        let shards = group_of(sz, 5);
        group.throughput(Throughput::Bytes((sz * shards.len()) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(sz), &sz, |b, _| {
            b.iter(|| XorCodec.encode_batch(&shards, 1).unwrap());
        });
    }
    group.finish();
}

fn bench_xor_recover(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec_xor_recover");
    for &sz in &[256usize, 1200, 2033] {
        let shards = group_of(sz, 5);
        let parity = XorCodec.encode_batch(&shards, 1).unwrap();
        group.throughput(Throughput::Bytes((sz * shards.len()) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(sz), &sz, |b, _| {
            b.iter_batched(
                || {
                    let mut all: Vec<Option<Bytes>> = shards.iter().cloned().map(Some).collect();
                    all.extend(parity.iter().cloned().map(Some));
                    all[2] = None;
                    all
                },
                |mut all| XorCodec.decode_batch(&mut all, 5).unwrap(),
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_rs_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec_rs_encode");
    let sizes = [256usize, 1200, 2033];
    #[cfg(feature = "fec-rs")]
    for &sz in &sizes {
        let shards = group_of(sz, 8);
        group.throughput(Throughput::Bytes((sz * shards.len()) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(sz), &sz, |b, _| {
            b.iter(|| RsCodec.encode_batch(&shards, 2).unwrap());
        });
    }
    #[cfg(not(feature = "fec-rs"))]
    let _ = sizes;
    group.finish();
}

criterion_group!(benches, bench_xor_encode, bench_xor_recover, bench_rs_encode);
criterion_main!(benches);
