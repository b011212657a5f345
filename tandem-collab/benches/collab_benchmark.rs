use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;

use tandem_collab::broadcast::{BroadcastGroup, Frame};
use tandem_collab::protocol::SyncMessage;
use tandem_collab::storage::{RocksStore, StoreConfig};
use tandem_core::{Document, EditIntent, Operation, ReplicaId};

fn typed_ops(n: usize) -> (Document, Vec<Operation>) {
    let mut doc = Document::new(ReplicaId::random());
    let mut ops = Vec::with_capacity(n);
    for i in 0..n {
        ops.extend(doc.apply_local(EditIntent::insert_text(i, "x")).unwrap());
    }
    (doc, ops)
}

fn bench_update_encode(c: &mut Criterion) {
    let (doc, ops) = typed_ops(1);
    let replica = doc.replica();

    c.bench_function("update_encode_1_op", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(replica), "room", black_box(&ops)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let (doc, ops) = typed_ops(1);
    let encoded = SyncMessage::update(doc.replica(), "room", &ops)
        .unwrap()
        .encode()
        .unwrap();

    c.bench_function("update_decode_1_op", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.operations().unwrap());
        })
    });
}

fn bench_sync_step2_1000_ops(c: &mut Criterion) {
    let (doc, ops) = typed_ops(1000);

    c.bench_function("sync_step2_roundtrip_1000_ops", |b| {
        b.iter(|| {
            let msg = SyncMessage::sync_step2(doc.replica(), "room", &ops).unwrap();
            let encoded = msg.encode().unwrap();
            black_box(SyncMessage::decode(&encoded).unwrap().operations().unwrap());
        })
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);

                let mut receivers = Vec::new();
                for _ in 0..100 {
                    receivers.push(group.add_peer(ReplicaId::random()).await.1);
                }

                let origin = ReplicaId::random();
                for _ in 0..1000 {
                    let frame = Arc::new(Frame {
                        origin,
                        bytes: vec![0u8; 64],
                    });
                    black_box(group.broadcast_raw(frame));
                }
                black_box(receivers.len());
            });
        })
    });
}

fn bench_rocks_save_snapshot(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let (doc, _) = typed_ops(1000);
    let snapshot = doc.snapshot();

    c.bench_function("rocks_save_snapshot_1000_ops", |b| {
        b.iter(|| {
            black_box(store.save_snapshot("bench", black_box(&snapshot)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_sync_step2_1000_ops,
    bench_broadcast_1000_messages,
    bench_rocks_save_snapshot,
);
criterion_main!(benches);
