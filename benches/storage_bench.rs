//! Benchmarks for the timebatch storage layers
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;
use timebatch::cache::{BatchCache, MemoryCache};
use timebatch::config::WriterConfig;
use timebatch::range::read_all;
use timebatch::storage::*;
use timebatch::{DataStream, InsertOptions};

fn create_test_points(count: usize, offset: usize) -> Vec<Datapoint> {
    (offset..offset + count)
        .map(|i| {
            Datapoint::new(
                i as f64,
                json!({"temperature": 20.0 + (i % 10) as f64, "room": "kitchen"}),
            )
        })
        .collect()
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let dp = create_test_points(1, 0).remove(0);

    for compression in [CompressionType::None, CompressionType::Lz4] {
        group.bench_function(format!("encode_{:?}", compression), |b| {
            b.iter(|| encode_datapoint(black_box(&dp), compression).unwrap())
        });

        let payload = encode_datapoint(&dp, compression).unwrap();
        group.bench_function(format!("decode_{:?}", compression), |b| {
            b.iter(|| decode_datapoint(black_box(&payload)).unwrap())
        });
    }

    let schema = Schema::parse(
        r#"{"type": "object", "properties": {"temperature": {"type": "number"}}, "required": ["temperature"]}"#,
    )
    .unwrap();
    group.bench_function("validate_object", |b| {
        b.iter(|| schema.validate(black_box(&dp.data)).unwrap())
    });

    group.finish();
}

fn bench_segment(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment");
    group.throughput(Throughput::Elements(250));

    group.bench_function("append_batch_250", |b| {
        let dir = tempdir().unwrap();
        // No fsync for benchmarking raw performance
        let store = FileSegmentStore::open(dir.path(), CompressionType::Lz4, false).unwrap();
        let key = StreamKey::new(1, 1);
        let mut next = 0u64;

        b.iter(|| {
            let points = create_test_points(250, next as usize);
            store.append(&key, next, black_box(&points)).unwrap();
            next += 250;
        });
    });

    let dir = tempdir().unwrap();
    let store = FileSegmentStore::open(dir.path(), CompressionType::Lz4, false).unwrap();
    let key = StreamKey::new(1, 2);
    store.append(&key, 0, &create_test_points(10_000, 0)).unwrap();

    group.bench_function("read_batch_250", |b| {
        let mut reader = store.reader(&key).unwrap();
        b.iter(|| reader.read_batch(black_box(5_000), 5_250).unwrap())
    });

    group.bench_function("find_time", |b| {
        let mut reader = store.reader(&key).unwrap();
        b.iter(|| reader.find_time(black_box(7_345.5)).unwrap())
    });

    group.finish();
}

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache");
    group.throughput(Throughput::Elements(100));

    group.bench_function("insert_100", |b| {
        let cache = MemoryCache::with_batch_size(250);
        let key = StreamKey::new(1, 1);
        let mut offset = 0;

        b.iter(|| {
            let points = create_test_points(100, offset);
            offset += 100;
            cache.insert(&key, black_box(points), false, 0, 0).unwrap();
            // Keep pending volume bounded
            let batches = cache.read_processing_queue().unwrap();
            cache.clear_batches(&batches).unwrap();
        });
    });

    group.finish();
}

fn bench_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream");
    group.throughput(Throughput::Elements(1_100));

    let dir = tempdir().unwrap();
    let store = FileSegmentStore::open(dir.path(), CompressionType::Lz4, false).unwrap();
    let ds = DataStream::with_backends(
        Arc::new(MemoryCache::with_batch_size(250)),
        Arc::new(store),
        WriterConfig::default(),
    );
    let key = StreamKey::new(1, 1);

    // 1000 committed, 100 still cached
    ds.insert(&key, create_test_points(1_100, 0), &InsertOptions::new())
        .unwrap();
    ds.write_chunk().unwrap();

    group.bench_function("irange_1100_mixed", |b| {
        b.iter(|| {
            let mut range = ds.irange(&key, 0, 0).unwrap();
            read_all(range.as_mut()).unwrap()
        })
    });

    group.bench_function("time_index", |b| {
        b.iter(|| ds.time_index(&key, black_box(512.5)).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_codec, bench_segment, bench_cache, bench_stream);
criterion_main!(benches);
