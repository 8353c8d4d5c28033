//! Integration tests for collaboration sessions.
//!
//! Two participants join the same channel through a real relay and
//! exchange presence, edits and leave notices.

mod common;

use canopy_collab::conflict::{ChangeSet, FieldChange};
use canopy_collab::presence::{CursorPosition, PresenceStatus};
use canopy_collab::protocol::{ChannelMessage, CurrentUser, MessageKind};
use canopy_collab::session::{CollabSession, SessionConfig, SessionEvent};
use canopy_collab::{ConnectionConfig, ReconnectPolicy};
use common::{start_relay, wait_for, Relay};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

fn join(url: &str, id: &str, name: &str) -> (CollabSession, mpsc::Receiver<SessionEvent>) {
    let config = SessionConfig {
        connection: ConnectionConfig::new(url, "board-7").with_reconnect(ReconnectPolicy {
            base: Duration::from_millis(50),
            ..ReconnectPolicy::default()
        }),
        ..SessionConfig::default()
    };
    let mut session = CollabSession::new(CurrentUser::new(id, name), config);
    let events = session.take_event_rx().unwrap();
    (session, events)
}

/// Presence frames the relay received from `user_id`.
fn presence_frames_from(relay: &Relay, user_id: &str) -> usize {
    relay
        .received()
        .iter()
        .filter_map(|text| ChannelMessage::decode(text).ok())
        .filter(|msg| msg.kind == MessageKind::Presence && msg.sender.as_deref() == Some(user_id))
        .count()
}

/// Wait for the first event matching `pred`, skipping others.
async fn expect_event(
    events: &mut mpsc::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("Event channel closed"),
            }
        }
    })
    .await
    .expect("Timed out waiting for session event")
}

fn joined(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::ParticipantJoined(_))
}

fn left(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::ParticipantLeft { .. })
}

fn conflict_detected(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::ConflictDetected { .. })
}

fn remote_edit(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::RemoteEdit(_))
}

fn single(field: &str, change: FieldChange) -> ChangeSet {
    ChangeSet::from([(field.to_string(), change)])
}

#[tokio::test]
async fn test_participants_see_each_other() {
    let relay = start_relay().await;
    let (alice, mut alice_events) = join(&relay.url(), "alice", "Alice");
    let (bob, mut bob_events) = join(&relay.url(), "bob", "Bob");

    alice.connect().await;
    assert!(wait_for(|| relay.active() == 1).await);
    bob.connect().await;

    // Bob's announce reaches Alice
    match expect_event(&mut alice_events, joined).await {
        SessionEvent::ParticipantJoined(record) => {
            assert_eq!(record.user_id, "bob");
            assert_eq!(record.user_name, "Bob");
            assert_eq!(record.status, PresenceStatus::Active);
            assert_eq!(record.color, canopy_collab::user_id_to_color("bob"));
        }
        other => panic!("Expected ParticipantJoined, got {other:?}"),
    }

    // Let the throttle window from Alice's last announce pass
    sleep(Duration::from_millis(60)).await;
    alice.presence().update_cursor(CursorPosition::new(10.0, 20.0).in_element("canvas"));
    expect_event(&mut bob_events, |e| {
        matches!(e, SessionEvent::ParticipantJoined(r) if r.user_id == "alice")
    })
    .await;

    assert!(wait_for(|| bob.presence().remote("alice").and_then(|r| r.cursor).is_some()).await);
    assert_eq!(bob.presence().participant_count(), 2);
    assert_eq!(alice.presence().participant_count(), 2);
}

#[tokio::test]
async fn test_edit_applies_on_peer() {
    let relay = start_relay().await;
    let (alice, _alice_events) = join(&relay.url(), "alice", "Alice");
    let (bob, mut bob_events) = join(&relay.url(), "bob", "Bob");
    alice.connect().await;
    bob.connect().await;
    assert!(wait_for(|| relay.active() == 2).await);

    alice
        .commit(single("title", FieldChange::set(json!("Roadmap"))), Some("name it".into()))
        .unwrap();

    match expect_event(&mut bob_events, remote_edit).await {
        SessionEvent::RemoteEdit(edit) => {
            assert_eq!(edit.field, "title");
            assert_eq!(edit.after, Some(json!("Roadmap")));
            assert_eq!(edit.user_id, "alice");
        }
        other => panic!("Expected RemoteEdit, got {other:?}"),
    }
    assert_eq!(bob.resolver().current_value("title"), Some(json!("Roadmap")));
    // Remote edits never become local versions
    assert_eq!(bob.resolver().version_count(), 0);
    assert_eq!(alice.resolver().version_count(), 1);
}

#[tokio::test]
async fn test_divergent_edit_raises_conflict() {
    let relay = start_relay().await;
    let (alice, _alice_events) = join(&relay.url(), "alice", "Alice");
    let (bob, mut bob_events) = join(&relay.url(), "bob", "Bob");
    alice.connect().await;
    bob.connect().await;
    assert!(wait_for(|| relay.active() == 2).await);

    bob.commit(single("status", FieldChange::set(json!("open"))), None).unwrap();
    // Alice edits from a base Bob never had
    alice
        .commit(single("status", FieldChange::update(json!("draft"), json!("closed"))), None)
        .unwrap();

    let id = match expect_event(&mut bob_events, conflict_detected).await {
        SessionEvent::ConflictDetected { id, field } => {
            assert_eq!(field, "status");
            id
        }
        other => panic!("Expected ConflictDetected, got {other:?}"),
    };

    let mut resolver = bob.resolver();
    assert!(resolver.has_conflicts());
    let conflict = resolver.conflict(id).unwrap();
    assert_eq!(conflict.local_value, json!("open"));
    assert_eq!(conflict.remote_value, json!("closed"));
    assert_eq!(conflict.remote_user_id, "alice");

    let resolved = resolver
        .resolve_conflict(id, canopy_collab::Resolution::Remote)
        .unwrap();
    assert_eq!(resolved.value(), &json!("closed"));
    assert!(!resolver.has_conflicts());
}

#[tokio::test]
async fn test_shutdown_announces_leave() {
    let relay = start_relay().await;
    let (alice, _alice_events) = join(&relay.url(), "alice", "Alice");
    let (bob, mut bob_events) = join(&relay.url(), "bob", "Bob");
    bob.connect().await;
    assert!(wait_for(|| relay.active() == 1).await);
    alice.connect().await;

    expect_event(&mut bob_events, joined).await;
    assert_eq!(bob.presence().participant_count(), 2);

    alice.shutdown();
    match expect_event(&mut bob_events, left).await {
        SessionEvent::ParticipantLeft { user_id } => assert_eq!(user_id, "alice"),
        other => panic!("Expected ParticipantLeft, got {other:?}"),
    }
    assert_eq!(bob.presence().participant_count(), 1);

    let leave = relay
        .received()
        .iter()
        .filter_map(|text| ChannelMessage::decode(text).ok())
        .find(|msg| msg.kind == MessageKind::Leave)
        .unwrap();
    assert_eq!(leave.data["userId"], "alice");
    assert_eq!(leave.sender.as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_offline_commit_flushes_on_connect() {
    let relay = start_relay().await;
    let (alice, _alice_events) = join(&relay.url(), "alice", "Alice");

    alice.commit(single("a", FieldChange::set(json!(1))), None).unwrap();
    alice.commit(single("a", FieldChange::update(json!(1), json!(2))), None).unwrap();
    assert_eq!(alice.connection().buffered_len(), 2);

    alice.connect().await;
    // Two edits then the presence announce
    assert!(wait_for(|| relay.received().len() == 3).await);
    let kinds: Vec<MessageKind> = relay
        .received()
        .iter()
        .map(|text| ChannelMessage::decode(text).unwrap().kind)
        .collect();
    assert_eq!(kinds, vec![MessageKind::Edit, MessageKind::Edit, MessageKind::Presence]);
}

#[tokio::test]
async fn test_newcomer_learns_existing_participants() {
    let relay = start_relay().await;
    let (alice, _alice_events) = join(&relay.url(), "alice", "Alice");
    let (bob, mut bob_events) = join(&relay.url(), "bob", "Bob");

    alice.connect().await;
    assert!(wait_for(|| presence_frames_from(&relay, "alice") == 1).await);
    bob.connect().await;

    // Alice answers Bob's announce without any local activity
    match expect_event(&mut bob_events, joined).await {
        SessionEvent::ParticipantJoined(record) => assert_eq!(record.user_id, "alice"),
        other => panic!("Expected ParticipantJoined, got {other:?}"),
    }
    assert_eq!(bob.presence().participant_count(), 2);
    assert!(alice.presence().cursor().is_none());
}

#[tokio::test]
async fn test_presence_reannounced_after_reconnect() {
    let relay = start_relay().await;
    let (alice, _alice_events) = join(&relay.url(), "alice", "Alice");
    let (bob, mut bob_events) = join(&relay.url(), "bob", "Bob");
    alice.connect().await;
    bob.connect().await;
    assert!(wait_for(|| bob.presence().participant_count() == 2).await);
    let before = presence_frames_from(&relay, "alice");

    relay.drop_all();
    assert!(wait_for(|| alice.connection().stats().connections == 2).await);
    assert!(wait_for(|| bob.connection().stats().connections == 2).await);
    assert!(wait_for(|| presence_frames_from(&relay, "alice") > before).await);

    // The roster survives the outage
    assert_eq!(bob.presence().participant_count(), 2);
    assert_eq!(alice.presence().participant_count(), 2);
    while let Ok(event) = bob_events.try_recv() {
        assert!(!matches!(event, SessionEvent::ParticipantLeft { .. }), "{event:?}");
    }
}

#[tokio::test]
async fn test_manual_reconnect_reannounces() {
    let relay = start_relay().await;
    let (alice, _alice_events) = join(&relay.url(), "alice", "Alice");
    alice.connect().await;
    assert!(wait_for(|| presence_frames_from(&relay, "alice") == 1).await);

    alice.connection().reconnect().await;
    assert!(wait_for(|| presence_frames_from(&relay, "alice") == 2).await);
    assert_eq!(relay.accepted(), 2);
}

#[tokio::test]
async fn test_disconnect_clears_roster() {
    let relay = start_relay().await;
    let (alice, mut alice_events) = join(&relay.url(), "alice", "Alice");
    let (bob, _bob_events) = join(&relay.url(), "bob", "Bob");
    alice.connect().await;
    bob.connect().await;
    expect_event(&mut alice_events, joined).await;

    alice.connection().disconnect();
    match expect_event(&mut alice_events, left).await {
        SessionEvent::ParticipantLeft { user_id } => assert_eq!(user_id, "bob"),
        other => panic!("Expected ParticipantLeft, got {other:?}"),
    }
    assert_eq!(alice.presence().participant_count(), 1);
    // A plain disconnect sends no leave notice, so Bob keeps Alice
    assert!(wait_for(|| bob.presence().remote("alice").is_some()).await);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(bob.presence().participant_count(), 2);
}
