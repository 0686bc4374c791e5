//! Session store behavior against a real on-disk database

use cadence::session::{format_history, Role, SessionStore};
use tempfile::TempDir;

async fn open_store(dir: &TempDir, max_messages: usize, ttl_seconds: u64) -> SessionStore {
    SessionStore::open(dir.path().join("sessions.db"), max_messages, ttl_seconds)
        .await
        .expect("store should open")
}

#[tokio::test]
async fn history_preserves_insertion_order() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 10, 3600).await;

    store.save_message("s1", Role::User, "first").await;
    store.save_message("s1", Role::Assistant, "second").await;
    store.save_message("s1", Role::User, "third").await;

    let history = store.get_history("s1").await;
    let contents: Vec<&str> = history.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second", "third"]);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[1].role, Role::Assistant);
}

#[tokio::test]
async fn history_caps_at_most_recent_messages() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 4, 3600).await;

    for i in 0..7 {
        store.save_message("s1", Role::User, &format!("m{}", i)).await;
    }

    let history = store.get_history("s1").await;
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].content, "m3");
    assert_eq!(history[3].content, "m6");
}

#[tokio::test]
async fn sessions_are_independent() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 10, 3600).await;

    store.save_message("a", Role::User, "for a").await;
    store.save_message("b", Role::User, "for b").await;

    assert_eq!(store.get_history("a").await.len(), 1);
    assert_eq!(store.get_history("b").await[0].content, "for b");
    assert!(store.get_history("unknown").await.is_empty());
}

#[tokio::test]
async fn expired_session_reads_empty() {
    let dir = TempDir::new().unwrap();
    // Zero TTL: the session is expired the moment it is written
    let store = open_store(&dir, 10, 0).await;

    store.save_message("s1", Role::User, "gone soon").await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert!(store.get_history("s1").await.is_empty());
}

#[tokio::test]
async fn save_refreshes_ttl_for_whole_session() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 10, 3600).await;

    store.save_message("s1", Role::User, "one").await;
    store.save_message("s1", Role::Assistant, "two").await;

    // Both messages survive as long as the session stays active
    assert_eq!(store.get_history("s1").await.len(), 2);
}

#[tokio::test]
async fn formatted_history_flows_from_store() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 10, 3600).await;

    store.save_message("s1", Role::User, "where did you work?").await;
    store.save_message("s1", Role::Assistant, "At Acme.").await;

    let history = store.get_history("s1").await;
    assert_eq!(
        format_history(&history, 5),
        "User: where did you work?\nAssistant: At Acme."
    );
}
