//! Criterion benchmarks for the wire and record codecs
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use remotefs::protocol::{Decoder, DirEntry, DirListing, Encoder, FileStat, ListOptions, Record};

fn sample_stat(i: u64) -> FileStat {
    FileStat {
        dev: 2049,
        ino: 1_000_000 + i,
        mode: 0o100644,
        nlink: 1,
        uid: 1000,
        gid: 1000,
        size: 4096 * i,
        blksize: 4096,
        blocks: 8 * i,
        atime: 1_700_000_000 + i,
        mtime: 1_700_000_000 + i,
        ctime: 1_700_000_000 + i,
        ..Default::default()
    }
}

fn bench_varint(c: &mut Criterion) {
    let mut group = c.benchmark_group("varint");
    let values: Vec<u64> = (0..1024u64)
        .map(|i| i.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> (i % 64))
        .collect();
    group.throughput(Throughput::Elements(values.len() as u64));

    group.bench_function("put_uint", |b| {
        let mut enc = Encoder::with_capacity(16 * 1024);
        b.iter(|| {
            enc.reset();
            for v in &values {
                enc.put_uint(black_box(*v));
            }
        });
    });

    let mut enc = Encoder::new();
    for v in &values {
        enc.put_uint(*v);
    }
    let bytes = enc.into_bytes();
    group.bench_function("uint", |b| {
        b.iter(|| {
            let mut dec = Decoder::new(black_box(&bytes));
            while !dec.is_empty() {
                black_box(dec.uint().ok());
            }
        });
    });

    group.finish();
}

fn bench_float(c: &mut Criterion) {
    let mut group = c.benchmark_group("float");
    let values: Vec<f64> = (1..=1024).map(|i| 1.0 / i as f64).collect();
    group.throughput(Throughput::Elements(values.len() as u64));

    group.bench_function("put_float", |b| {
        let mut enc = Encoder::with_capacity(32 * 1024);
        b.iter(|| {
            enc.reset();
            for v in &values {
                enc.put_float(black_box(*v));
            }
        });
    });

    group.finish();
}

fn bench_listing(c: &mut Criterion) {
    let mut group = c.benchmark_group("listing");

    for count in [10u64, 100, 1000] {
        let listing = DirListing::new(
            (0..count)
                .map(|i| DirEntry {
                    name: format!("file_{i:05}.txt").into(),
                    stat: sample_stat(i),
                    options: ListOptions::FILES_ONLY,
                })
                .collect(),
        );
        let mut enc = Encoder::new();
        listing.encode(&mut enc);
        let bytes = enc.into_bytes();

        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_function(format!("decode_{count}"), |b| {
            b.iter(|| {
                let mut dec = Decoder::new(black_box(&bytes));
                black_box(DirListing::decode(&mut dec, ListOptions::FILES_ONLY).ok());
            });
        });
    }

    group.finish();
}

fn bench_record(c: &mut Criterion) {
    let record: Record = sample_stat(7).to_record();
    let mut enc = Encoder::new();
    record.encode(&mut enc);
    let bytes = enc.into_bytes();

    c.bench_function("record_decode_stat", |b| {
        b.iter(|| {
            let mut dec = Decoder::new(black_box(&bytes));
            black_box(Record::decode(&mut dec).ok());
        });
    });
}

criterion_group!(benches, bench_varint, bench_float, bench_listing, bench_record);
criterion_main!(benches);
