mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use roomsync_client::LeaderChange;
use roomsync_protocol::{FrameBody, FrameKind, LeaderChangeReason};
use serde_json::{Value, json};

use common::{client, eventually, joined};

fn update(key: &str, value: Value, version: u64) -> FrameBody {
    FrameBody::RegisterUpdate {
        key: key.into(),
        value,
        version,
        updated_by: Some("host".into()),
    }
}

fn leader_changed(new: &str, previous: &str) -> FrameBody {
    FrameBody::LeaderChanged {
        new_leader_id: new.into(),
        previous_leader_id: Some(previous.into()),
        reason: Some(LeaderChangeReason::Transfer),
    }
}

#[tokio::test]
async fn set_broadcasts_versioned_value() {
    let (client, _channel, mut host) = client();
    let mut conn = joined(&client, &mut host, "host").await;

    assert_eq!(client.store().set("score", json!({"red": 1})).unwrap(), 1);
    assert_eq!(client.store().set("score", json!({"red": 2})).unwrap(), 2);

    for expected in 1..=2u64 {
        let frame = conn.expect(FrameKind::RegisterSet).await;
        assert_eq!(frame.room_id.as_deref(), Some("r1"));
        match frame.body {
            FrameBody::RegisterSet { key, version, .. } => {
                assert_eq!(key, "score");
                assert_eq!(version, expected);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[tokio::test]
async fn stale_remote_updates_are_ignored() {
    let (client, _channel, mut host) = client();
    let conn = joined(&client, &mut host, "host").await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client.store().watch("board", move |value, key| {
        sink.lock().unwrap().push((key.to_string(), value.clone()));
    });

    conn.push("r1", update("board", json!("v3"), 3));
    conn.push("r1", update("board", json!("v2"), 2));
    conn.push("r1", update("board", json!("v3-again"), 3));
    conn.push("r2", update("board", json!("elsewhere"), 9));
    conn.push("r1", update("marker", json!(true), 1));

    eventually(|| client.store().get("marker").is_some()).await;
    let entry = client.store().entry("board").unwrap();
    assert_eq!(entry.value, json!("v3"));
    assert_eq!(entry.version, 3);
    assert_eq!(entry.updated_by.as_deref(), Some("host"));
    assert_eq!(*seen.lock().unwrap(), vec![("board".to_string(), json!("v3"))]);

    // the next local write builds on the adopted version
    assert_eq!(client.store().set("board", "v4").unwrap(), 4);
}

#[tokio::test]
async fn watchers_survive_rooms() {
    let (client, _channel, mut host) = client();
    let count = Arc::new(AtomicU32::new(0));
    let counter = count.clone();
    client.store().watch("k", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let conn = joined(&client, &mut host, "host").await;
    conn.push("r1", update("k", json!(1), 1));
    eventually(|| count.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn leadership_callbacks_refire_per_term() {
    let (client, _channel, mut host) = client();
    let fired = Arc::new(AtomicU32::new(0));
    let counter = fired.clone();
    client.leader().if_leader(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let changes: Arc<Mutex<Vec<LeaderChange>>> = Arc::default();
    let sink = changes.clone();
    client
        .leader()
        .on_leader_change(move |change| sink.lock().unwrap().push(change.clone()));

    let conn = joined(&client, &mut host, "host").await;
    assert!(!client.is_leader());
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    conn.push("r1", leader_changed("me", "host"));
    eventually(|| client.is_leader()).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(client.state().unwrap().is_leader);

    // same leader again changes nothing
    conn.push("r1", leader_changed("me", "host"));
    conn.push("r1", leader_changed("p2", "me"));
    eventually(|| !client.is_leader()).await;
    conn.push("r1", leader_changed("me", "p2"));
    eventually(|| client.is_leader()).await;
    assert_eq!(fired.load(Ordering::SeqCst), 2);

    let changes = changes.lock().unwrap();
    let leaders: Vec<Option<&str>> = changes
        .iter()
        .map(|c| c.new_leader_id.as_deref())
        .collect();
    // initial snapshot, then three real changes
    assert_eq!(leaders, vec![Some("host"), Some("me"), Some("p2"), Some("me")]);
    assert_eq!(changes[1].previous_leader_id.as_deref(), Some("host"));
    assert!(changes[1].is_leader_now);
    assert_eq!(changes[1].reason, Some(LeaderChangeReason::Transfer));
}

#[tokio::test]
async fn if_leader_runs_at_once_when_already_leading() {
    let (client, _channel, mut host) = client();
    let _conn = joined(&client, &mut host, "me").await;
    assert!(client.is_leader());

    let fired = Arc::new(AtomicU32::new(0));
    let counter = fired.clone();
    client.leader().if_leader(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn panicking_callbacks_do_not_break_dispatch() {
    let (client, _channel, mut host) = client();
    client.leader().if_leader(|| panic!("leader callback"));
    client.store().watch("k", |_, _| panic!("watcher"));

    let conn = joined(&client, &mut host, "host").await;
    conn.push("r1", leader_changed("me", "host"));
    conn.push("r1", update("k", json!(1), 1));

    eventually(|| client.store().get("k").is_some()).await;
    assert!(client.is_leader());
}
