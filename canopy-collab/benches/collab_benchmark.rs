use canopy_collab::conflict::{
    ChangeSet, ConflictResolver, FieldChange, RemoteEdit, ResolverConfig,
};
use canopy_collab::connection::OutboundBuffer;
use canopy_collab::presence::{user_id_to_color, CursorPosition, PresenceRecord, PresenceStatus};
use canopy_collab::protocol::{ChannelMessage, CurrentUser, MessageKind};
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

fn sample_record() -> PresenceRecord {
    PresenceRecord {
        user_id: "user-42".to_string(),
        user_name: "Ada".to_string(),
        avatar: None,
        color: user_id_to_color("user-42").to_string(),
        cursor: Some(CursorPosition::new(120.5, 88.0).in_element("canvas")),
        selection: None,
        status: PresenceStatus::Active,
        last_activity: Utc::now(),
    }
}

fn bench_envelope_encode(c: &mut Criterion) {
    let record = sample_record();

    c.bench_function("presence_envelope_encode", |b| {
        b.iter(|| {
            let msg = ChannelMessage::new(MessageKind::Presence, "doc-1", black_box(&record))
                .with_sender(Some("user-42".to_string()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let encoded = ChannelMessage::new(MessageKind::Presence, "doc-1", sample_record())
        .encode()
        .unwrap();

    c.bench_function("presence_envelope_decode_typed", |b| {
        b.iter(|| {
            let msg = ChannelMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.into_typed::<PresenceRecord>().unwrap());
        })
    });
}

fn bench_color_hash(c: &mut Criterion) {
    let ids: Vec<String> = (0..100).map(|i| format!("user-{i:04}")).collect();

    c.bench_function("user_id_to_color_100", |b| {
        b.iter(|| {
            for id in &ids {
                black_box(user_id_to_color(black_box(id)));
            }
        })
    });
}

fn resolver_with_history(versions: usize) -> (ConflictResolver, Vec<canopy_collab::VersionId>) {
    let mut resolver = ConflictResolver::new(
        CurrentUser::new("u1", "Alice"),
        ResolverConfig::default().with_max_versions(None),
    );
    let mut ids = Vec::with_capacity(versions);
    for n in 0..versions {
        let mut changes = ChangeSet::new();
        let field = format!("field-{}", n % 20);
        changes.insert(field, FieldChange::new(Some(json!(n)), Some(json!(n + 1))));
        ids.push(resolver.record_version(changes, None));
    }
    (resolver, ids)
}

fn bench_revert_to_version(c: &mut Criterion) {
    let (resolver, ids) = resolver_with_history(1_000);
    let target = ids[ids.len() / 2];

    c.bench_function("revert_to_version_1K", |b| {
        b.iter(|| {
            black_box(resolver.revert_to_version(black_box(target)).unwrap());
        })
    });
}

fn bench_compare_versions(c: &mut Criterion) {
    let (resolver, ids) = resolver_with_history(1_000);

    c.bench_function("compare_versions_1K", |b| {
        b.iter(|| {
            black_box(resolver.compare_versions(ids[0], ids[999]).unwrap());
        })
    });
}

fn bench_reconcile_remote(c: &mut Criterion) {
    let (mut resolver, _) = resolver_with_history(200);
    let edit = RemoteEdit {
        field: "field-3".to_string(),
        before: Some(json!(-1)),
        after: Some(json!(-2)),
        user_id: "u2".to_string(),
        timestamp: Utc::now(),
    };

    c.bench_function("reconcile_remote_conflict", |b| {
        b.iter(|| {
            black_box(resolver.reconcile_remote(black_box(&edit)));
            resolver.resolve_all_conflicts(canopy_collab::Resolution::Local);
        })
    });
}

fn bench_buffer_replay(c: &mut Criterion) {
    let data = json!({"field": "title", "after": "Roadmap"});
    let frame = ChannelMessage::new(MessageKind::Edit, "doc-1", data)
        .encode()
        .unwrap();

    c.bench_function("outbound_buffer_1K_replay", |b| {
        b.iter(|| {
            let mut buffer = OutboundBuffer::new(1024);
            for _ in 0..1000 {
                buffer.enqueue(MessageKind::Edit, frame.clone());
            }
            black_box(buffer.drain());
        })
    });
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_color_hash,
    bench_revert_to_version,
    bench_compare_versions,
    bench_reconcile_remote,
    bench_buffer_replay,
);
criterion_main!(benches);
