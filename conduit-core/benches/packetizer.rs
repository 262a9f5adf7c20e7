use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use conduit_core::{
    decoder::decode_packet_from_bytes, encoder::encode_packet_struct, packetizer::Packetizer,
    FecRatio, FrameType, Packet, Reassembler, SessionConfig,
};

fn config() -> SessionConfig {
    SessionConfig {
        store_capacity: 1024,
        max_queued_packets: 512,
        ..SessionConfig::default()
    }
}

fn packetize(frame: &Bytes) -> Vec<Packet> {
    let mut p = Packetizer::new(&config(), FecRatio::default()).unwrap();
    p.packetize(0, frame.clone(), FrameType::Normal).unwrap();
    std::iter::from_fn(|| p.pop_for_send().ok()).collect()
}

fn bench_packetize(c: &mut Criterion) {
    let mut group = c.benchmark_group("packetize");
    for size in [4_096usize, 65_536, 262_144] {
        let frame = Bytes::from(vec![0x42u8; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| packetize(&frame));
        });
    }
    group.finish();
}

fn bench_wire(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_round_trip");
    let packets = packetize(&Bytes::from(vec![0x17u8; 65_536]));
    let bytes: usize = packets.iter().map(Packet::total_size).sum();
    group.throughput(Throughput::Bytes(bytes as u64));
    group.bench_function("encode_decode", |b| {
        b.iter(|| {
            for packet in &packets {
                let wire = encode_packet_struct(packet).unwrap();
                decode_packet_from_bytes(&wire).unwrap();
            }
        });
    });
    group.finish();
}

fn bench_reassemble(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassemble_one_loss_per_group");
    for size in [4_096usize, 65_536] {
        let packets = packetize(&Bytes::from(vec![0x99u8; size]));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter_batched(
                Reassembler::new,
                |mut r| {
                    // Every sixth packet lost: one per 6:5 group
                    for (i, packet) in packets.iter().enumerate() {
                        if i % 6 != 3 {
                            r.push(packet.clone());
                        }
                    }
                    r
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_packetize, bench_wire, bench_reassemble);
criterion_main!(benches);
