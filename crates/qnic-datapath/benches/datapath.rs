//! Datapath Benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use qnic_common::NicConfig;
use qnic_datapath::checksum::{insert_checksum, rx_checksum};
use qnic_datapath::optable::OperationTable;
use qnic_datapath::ring::{ChecksumCommand, CompletionRecord, Descriptor};
use qnic_datapath::{
    DmaRegion, DriverConfig, FlowHasher, HashTypes, HostDriver, Interface, LoopbackTransport,
    ToeplitzHasher, XorFoldHasher,
};
use std::sync::Arc;

fn udp_frame(len: usize, dport: u16) -> Vec<u8> {
    let mut frame = vec![0u8; len];
    frame[12] = 0x08;
    frame[14] = 0x45;
    frame[16..18].copy_from_slice(&((len - 14) as u16).to_be_bytes());
    frame[22] = 64;
    frame[23] = 17;
    frame[26..30].copy_from_slice(&[192, 168, 1, 100]);
    frame[30..34].copy_from_slice(&[192, 168, 1, 101]);
    frame[34..36].copy_from_slice(&1u16.to_be_bytes());
    frame[36..38].copy_from_slice(&dport.to_be_bytes());
    frame[38..40].copy_from_slice(&((len - 34) as u16).to_be_bytes());
    frame
}

fn bench_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum");
    for len in [60usize, 1514, 9014] {
        let frame = udp_frame(len, 2);
        group.throughput(Throughput::Bytes(len as u64));

        group.bench_with_input(BenchmarkId::new("tx_insert", len), &frame, |b, frame| {
            let cmd = ChecksumCommand { start: 34, offset: 6 };
            b.iter(|| {
                let mut pkt = frame.clone();
                black_box(insert_checksum(&mut pkt, cmd))
            })
        });
        group.bench_with_input(BenchmarkId::new("rx", len), &frame, |b, frame| {
            b.iter(|| black_box(rx_checksum(black_box(frame), 14)))
        });
    }
    group.finish();
}

fn bench_rss_hash(c: &mut Criterion) {
    let frame = udp_frame(128, 4791);
    let toeplitz = FlowHasher::new(Box::new(ToeplitzHasher::default()), HashTypes::all());
    let xor = FlowHasher::new(Box::new(XorFoldHasher), HashTypes::all());

    let mut group = c.benchmark_group("rss_hash");
    group.bench_function("toeplitz_udp4", |b| b.iter(|| black_box(toeplitz.hash_frame(black_box(&frame)))));
    group.bench_function("xor_fold_udp4", |b| b.iter(|| black_box(xor.hash_frame(black_box(&frame)))));
    group.finish();
}

fn bench_records(c: &mut Criterion) {
    let desc = Descriptor::new(0x1_0000, 1514, 7).with_checksum(34, 6);
    let raw = desc.encode();
    c.bench_function("descriptor_decode", |b| b.iter(|| black_box(Descriptor::decode(black_box(&raw)))));

    let record = CompletionRecord { queue_id: 3, descriptor_tag: 7, length: 1514, ..Default::default() };
    c.bench_function("completion_encode", |b| b.iter(|| black_box(black_box(&record).encode(true))));
}

fn bench_op_table(c: &mut Criterion) {
    let table: OperationTable<u32> = OperationTable::new(32);
    c.bench_function("op_table_cycle", |b| {
        let mut index = 0u32;
        b.iter(|| {
            let tag = table.allocate(0, index, index).unwrap();
            table.mark_in_flight(tag).unwrap();
            for entry in table.complete(tag).unwrap() {
                table.release(entry.tag).unwrap();
            }
            index = index.wrapping_add(1);
        })
    });
}

fn bench_tx_burst(c: &mut Criterion) {
    let mem = Arc::new(DmaRegion::new(16 << 20));
    let wire = Arc::new(LoopbackTransport::new(1, 1024));
    let iface = Interface::builder(NicConfig::default(), mem.clone(), wire.clone())
        .build()
        .unwrap();
    let config = DriverConfig { tx_queues: 1, rx_queues: 1, ..DriverConfig::default() };
    let mut driver = HostDriver::open(Arc::new(iface), mem, &config).unwrap();
    let frame = udp_frame(1514, 2);

    let mut group = c.benchmark_group("tx_burst");
    group.throughput(Throughput::Bytes(32 * 1514));
    group.bench_function("32x1514", |b| {
        b.iter(|| {
            for _ in 0..32 {
                driver.start_xmit(0, &frame, Some((34, 6))).unwrap();
            }
            driver.interface().run_until_idle().unwrap();
            black_box(wire.drain(0));
            driver.poll().unwrap();
        })
    });
    group.finish();
}

criterion_group!(benches, bench_checksum, bench_rss_hash, bench_records, bench_op_table, bench_tx_burst);
criterion_main!(benches);
