//! Integration tests for the checkpoint store.

use batchrun::checkpoint::{CheckpointStore, DEFAULT_CHECKPOINT_FILE};

#[test]
fn missing_file_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::open_default(dir.path());
    assert_eq!(store.processed_count(), 0);
    assert!(!store.is_processed("a"));
    assert_eq!(store.path(), dir.path().join(DEFAULT_CHECKPOINT_FILE));
}

#[test]
fn missing_directory_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("runs").join("today");
    let store = CheckpointStore::open(&nested, "progress.json");
    store.mark_processed("a");
    assert!(nested.join("progress.json").exists());
}

#[test]
fn corrupt_file_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(DEFAULT_CHECKPOINT_FILE), "{not json").unwrap();

    let store = CheckpointStore::open_default(dir.path());
    assert_eq!(store.processed_count(), 0);

    // The store still works and overwrites the corrupt file.
    store.mark_processed("a");
    let reopened = CheckpointStore::open_default(dir.path());
    assert!(reopened.is_processed("a"));
}

#[test]
fn marks_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();

    let store = CheckpointStore::open_default(dir.path());
    store.mark_processed("a");
    store.mark_processed("b");

    // Simulated crash: a fresh store reads what was flushed, nothing more.
    let after_crash = CheckpointStore::open_default(dir.path());
    assert_eq!(after_crash.processed_ids(), vec!["a".to_string(), "b".to_string()]);
    assert!(!after_crash.is_processed("c"));

    store.mark_processed("c");
    let later = CheckpointStore::open_default(dir.path());
    assert_eq!(later.processed_count(), 3);
}

#[test]
fn mark_failed_removes_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::open_default(dir.path());

    store.mark_processed("a");
    store.mark_failed("a");
    store.mark_failed("a");
    store.mark_failed("never-seen");

    assert!(!store.is_processed("a"));
    let reopened = CheckpointStore::open_default(dir.path());
    assert_eq!(reopened.processed_count(), 0);
}

#[test]
fn clear_empties_the_persisted_set() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::open_default(dir.path());
    store.mark_processed("a");
    store.mark_processed("b");

    store.clear();

    assert_eq!(store.processed_count(), 0);
    assert_eq!(CheckpointStore::open_default(dir.path()).processed_count(), 0);
}

#[test]
fn file_holds_processed_items_and_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::open_default(dir.path());
    store.mark_processed("https://a.example");

    let raw = std::fs::read_to_string(store.path()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(
        value["processedItems"],
        serde_json::json!(["https://a.example"])
    );
    assert!(value["timestamp"].is_string());
}

#[test]
fn file_without_timestamp_still_loads() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join(DEFAULT_CHECKPOINT_FILE),
        r#"{"processedItems": ["x", "y"]}"#,
    )
    .unwrap();

    let store = CheckpointStore::open_default(dir.path());
    assert!(store.is_processed("x"));
    assert!(store.is_processed("y"));
}

#[test]
fn write_failure_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    // A regular file where the checkpoint directory should be.
    let blocker = dir.path().join("blocked");
    std::fs::write(&blocker, "").unwrap();

    let store = CheckpointStore::open_default(&blocker);
    store.mark_processed("a");

    assert!(store.is_processed("a"));
    assert!(store.flush().is_err());
}
