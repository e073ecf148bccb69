use criterion::{black_box, criterion_group, criterion_main, Criterion};
use slugline_sync::codec;
use slugline_sync::{DurableQueue, QueueConfig, QueueEntry, UpdatePayload};
use yrs::{Doc, ReadTxn, Transact, Text, WriteTxn};

/// Real Yrs update bytes for a text insertion of the given length.
fn yrs_update(len: usize) -> UpdatePayload {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        let body = txn.get_or_insert_text("body");
        body.insert(&mut txn, 0, &"x".repeat(len));
    }
    let bytes = doc
        .transact()
        .encode_state_as_update_v1(&yrs::StateVector::default());
    UpdatePayload::new(bytes)
}

fn bench_codec_encode(c: &mut Criterion) {
    let small = yrs_update(64);
    let large = yrs_update(4096);

    c.bench_function("codec_encode_64B_edit", |b| {
        b.iter(|| black_box(codec::encode(black_box(&small)).unwrap()))
    });
    c.bench_function("codec_encode_4KB_edit", |b| {
        b.iter(|| black_box(codec::encode(black_box(&large)).unwrap()))
    });
}

fn bench_codec_decode(c: &mut Criterion) {
    let transport = codec::encode(&yrs_update(4096)).unwrap();

    c.bench_function("codec_decode_4KB_edit", |b| {
        b.iter(|| black_box(codec::decode(black_box(&transport)).unwrap()))
    });
}

fn bench_codec_validate(c: &mut Criterion) {
    let payload = yrs_update(1024);

    c.bench_function("codec_validate_1KB_edit", |b| {
        b.iter(|| black_box(codec::validate(black_box(payload.as_bytes()))))
    });
}

fn bench_queue_entry_encode(c: &mut Criterion) {
    let entry = QueueEntry::new(1, yrs_update(1024));

    c.bench_function("queue_entry_encode_1KB", |b| {
        b.iter(|| black_box(entry.encode().unwrap()))
    });
}

fn bench_memory_queue_cycle(c: &mut Criterion) {
    c.bench_function("memory_queue_enqueue_dequeue", |b| {
        let mut queue = DurableQueue::open(QueueConfig::in_memory());
        let payload = yrs_update(256);
        b.iter(|| {
            queue.enqueue(black_box(payload.clone())).unwrap();
            black_box(queue.dequeue().unwrap());
        })
    });
}

fn bench_rocks_queue_enqueue(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = QueueConfig::durable(dir.path());
    config.capacity = usize::MAX; // keep the hot path, not the reject path
    let mut queue = DurableQueue::open(config);
    let payload = yrs_update(256);

    c.bench_function("rocks_queue_enqueue_256B", |b| {
        b.iter(|| {
            queue.enqueue(black_box(payload.clone())).unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_codec_encode,
    bench_codec_decode,
    bench_codec_validate,
    bench_queue_entry_encode,
    bench_memory_queue_cycle,
    bench_rocks_queue_enqueue,
);
criterion_main!(benches);
