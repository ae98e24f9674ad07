use criterion::{criterion_group, criterion_main, Criterion};
use hublink_relay::protocol::{encode_envelope, enrich, Inbound};
use hublink_relay::relay::Relay;
use hublink_relay::room::RoomTable;
use hublink_relay::Frame;
use hublink_store::DeviceStore;
use std::hint::black_box;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

const OPERATION: &str = r#"{"type":"operation","action":"ON","payload":{"pin":13}}"#;

fn bench_classify(c: &mut Criterion) {
    c.bench_function("parse_and_classify_operation", |b| {
        b.iter(|| black_box(Inbound::parse(black_box(OPERATION)).unwrap()))
    });
}

fn bench_enrich(c: &mut Criterion) {
    let inbound = Inbound::parse(OPERATION).unwrap();
    c.bench_function("enrich_and_encode", |b| {
        b.iter(|| {
            let envelope = enrich(&inbound.raw, "lamp1", chrono::Utc::now());
            black_box(encode_envelope(&envelope).unwrap())
        })
    });
}

fn bench_fan_out_100(c: &mut Criterion) {
    let mut table = RoomTable::new();
    let mut receivers = Vec::new();
    for _ in 0..100 {
        let (tx, rx) = mpsc::unbounded_channel::<Frame>();
        table.join("R", Uuid::new_v4(), tx);
        receivers.push(rx);
    }
    let frame: Frame = Arc::from(OPERATION);

    c.bench_function("fan_out_100_members", |b| {
        b.iter(|| {
            black_box(table.fan_out("R", None, &frame));
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_relay_message(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let relay = Relay::new(Arc::new(DeviceStore::with_defaults()));
    let (sender, _rx_sender) = runtime.block_on(relay.join("R"));
    let (_peer, mut rx_peer) = runtime.block_on(relay.join("R"));

    c.bench_function("relay_generic_message_1_peer", |b| {
        b.iter(|| {
            runtime.block_on(relay.handle_text(&sender, r#"{"text":"hi"}"#));
            while rx_peer.try_recv().is_ok() {}
        })
    });
}

criterion_group!(benches, bench_classify, bench_enrich, bench_fan_out_100, bench_relay_message);
criterion_main!(benches);
