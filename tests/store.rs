use serde_json::json;

use strata::actor::{Message, Pid};
use strata::remote::{FileMessageStore, MessageStatus, MessageStore, RemoteEnvelope};

fn envelope(to: &str) -> RemoteEnvelope {
    RemoteEnvelope::new(
        Pid::remote(to, "node-b"),
        Some(Pid::remote("origin", "node-a")),
        Message::new("greet", json!({ "n": 1 })),
    )
}

#[tokio::test]
async fn save_get_roundtrip_with_pending_status() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileMessageStore::new(dir.path());

    let env = envelope("target");
    store.save(&env).await.unwrap();

    let loaded = store.get(&env.id).await.unwrap().unwrap();
    assert_eq!(loaded.to, env.to);
    assert_eq!(loaded.message.msg_type, "greet");
    assert_eq!(
        store.message_status(&env.id).await.unwrap(),
        Some(MessageStatus::Pending)
    );
}

#[tokio::test]
async fn status_progresses_through_the_delivery_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileMessageStore::new(dir.path());
    let env = envelope("target");
    store.save(&env).await.unwrap();

    store.mark_delivered(&env.id).await.unwrap();
    assert_eq!(
        store.message_status(&env.id).await.unwrap(),
        Some(MessageStatus::Delivered)
    );

    store.mark_acknowledged(&env.id).await.unwrap();
    assert_eq!(
        store.message_status(&env.id).await.unwrap(),
        Some(MessageStatus::Acknowledged)
    );
}

#[tokio::test]
async fn marking_an_unknown_id_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileMessageStore::new(dir.path());
    assert!(store.mark_delivered("missing-id").await.is_err());
    assert_eq!(store.message_status("missing-id").await.unwrap(), None);
    assert!(store.get("missing-id").await.unwrap().is_none());
}

#[tokio::test]
async fn unacknowledged_scan_filters_by_receiver_and_status() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileMessageStore::new(dir.path());

    let for_a1 = envelope("receiver-a");
    let for_a2 = envelope("receiver-a");
    let for_b = envelope("receiver-b");
    for env in [&for_a1, &for_a2, &for_b] {
        store.save(env).await.unwrap();
    }
    store.mark_acknowledged(&for_a2.id).await.unwrap();

    let pending = store
        .get_unacknowledged(&Pid::remote("receiver-a", "node-b"))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, for_a1.id);
}

#[tokio::test]
async fn delete_removes_both_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileMessageStore::new(dir.path());
    let env = envelope("target");
    store.save(&env).await.unwrap();

    assert!(dir.path().join(format!("{}.msg", env.id)).exists());
    assert!(dir.path().join(format!("{}.status", env.id)).exists());

    store.delete(&env.id).await.unwrap();
    assert!(!dir.path().join(format!("{}.msg", env.id)).exists());
    assert!(!dir.path().join(format!("{}.status", env.id)).exists());

    // Deleting again is a no-op.
    store.delete(&env.id).await.unwrap();
}

#[tokio::test]
async fn clear_empties_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileMessageStore::new(dir.path());
    for _ in 0..3 {
        store.save(&envelope("target")).await.unwrap();
    }
    store.clear().await.unwrap();
    let remaining = store
        .get_unacknowledged(&Pid::remote("target", "node-b"))
        .await
        .unwrap();
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn rejects_path_traversal_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileMessageStore::new(dir.path());
    assert!(store.get("../etc/passwd").await.is_err());
    assert!(store.mark_delivered("a/b").await.is_err());
}
