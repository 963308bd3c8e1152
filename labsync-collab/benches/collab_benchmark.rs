use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use labsync_collab::action_log::CausalActionLog;
use labsync_collab::hub::{HubServices, SessionHub};
use labsync_collab::protocol::{Command, Frame};
use labsync_collab::storage::encode_value;
use labsync_collab::{EphemeralSignal, HubConfig, HubEvent};
use labsync_core::{
    ActionKind, CursorPosition, DisplayProfile, Member, Role, Session, SessionConfig,
};
use uuid::Uuid;

fn edit(i: usize) -> ActionKind {
    ActionKind::NotebookEdit { cell_id: format!("cell-{}", i % 16), content: "pH 7.2 at 25C".into() }
}

fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("Frame");
    let session = Uuid::new_v4();
    let user = Uuid::new_v4();
    let command = Command::Execute { action: edit(0) };
    let encoded = Frame::command(session, user, 1, &command).unwrap().encode().unwrap();
    group.throughput(Throughput::Bytes(encoded.len() as u64));

    group.bench_function("encode_execute", |b| {
        b.iter(|| {
            let frame = Frame::command(black_box(session), black_box(user), 1, &command).unwrap();
            black_box(frame.encode().unwrap());
        })
    });

    group.bench_function("decode_execute", |b| {
        b.iter(|| {
            let frame = Frame::decode(black_box(&encoded)).unwrap();
            black_box(frame.command_payload().unwrap());
        })
    });

    let cursor = HubEvent::from_signal(
        user,
        EphemeralSignal::Cursor { position: CursorPosition::new(120.0, 48.5) },
    );
    group.bench_function("encode_cursor_event", |b| {
        b.iter(|| black_box(Frame::event(session, user, black_box(&cursor)).unwrap().encode().unwrap()))
    });

    group.finish();
}

fn bench_action_log(c: &mut Criterion) {
    let mut group = c.benchmark_group("Action log");
    group.throughput(Throughput::Elements(1));
    let users: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();

    group.bench_function("execute_window_1000", |b| {
        let mut log = CausalActionLog::new(Uuid::new_v4(), 1000);
        for u in &users {
            log.register_member(*u);
        }
        let mut i = 0usize;
        b.iter(|| {
            let actor = users[i % users.len()];
            black_box(log.execute(actor, edit(i), false, i as u64).unwrap());
            i += 1;
        })
    });

    group.finish();
}

fn bench_hub_execute(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap();
    let leader = Uuid::new_v4();
    let session = Session::from_config(
        Uuid::new_v4(),
        SessionConfig::new(Uuid::new_v4(), "Bench", 32),
        leader,
        0,
    )
    .unwrap();
    let member = Member::new(session.id, leader, Role::Leader, DisplayProfile::named("L"), 0);
    let hub = SessionHub::new(session, vec![member], Vec::new(), HubServices::in_memory(), HubConfig::default());

    let mut group = c.benchmark_group("Hub");
    group.throughput(Throughput::Elements(1));
    let mut i = 0usize;
    group.bench_function("execute_memory_store", |b| {
        b.iter(|| {
            let action = rt.block_on(hub.execute(leader, edit(i))).unwrap();
            i += 1;
            black_box(action);
        })
    });
    group.finish();
}

fn bench_store_codec(c: &mut Criterion) {
    let mut log = CausalActionLog::new(Uuid::new_v4(), 10);
    let user = Uuid::new_v4();
    log.register_member(user);
    let action = log.execute(user, edit(1), false, 0).unwrap();

    c.bench_function("store_encode_action", |b| {
        b.iter(|| black_box(encode_value(black_box(&action)).unwrap()))
    });
}

criterion_group!(benches, bench_frame_codec, bench_action_log, bench_hub_execute, bench_store_codec);
criterion_main!(benches);
