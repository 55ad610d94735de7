//! Integration tests for the checkpoint wrapper and command handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use batchrun::checkpoint::CheckpointStore;
use batchrun::followup::FollowUps;
use batchrun::handler::{CheckpointHandler, CommandHandler};
use batchrun::model::{BatchConfig, Outcome, WorkItem};
use batchrun::runner::{Handler, TaskRunner};

fn fast_runner(batch_size: usize) -> TaskRunner {
    TaskRunner::new(
        BatchConfig::default()
            .with_batch_size(batch_size)
            .delay_between_items(Duration::ZERO)
            .delay_between_batches(Duration::ZERO),
    )
    .unwrap()
}

fn items(ids: &[&str]) -> Vec<WorkItem> {
    ids.iter().map(|id| WorkItem::new(*id)).collect()
}

// ---------------------------------------------------------------------------
// CheckpointHandler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn checkpointed_items_are_skipped_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CheckpointStore::open_default(dir.path()));
    store.mark_processed("X");

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let inner = move |_item: WorkItem, _f: FollowUps| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, anyhow::Error>(Outcome::Success) }
    };
    let handler = CheckpointHandler::new(inner, Arc::clone(&store));

    let results = fast_runner(2).run(items(&["X", "Y"]), handler).await;

    assert_eq!(results.get("X"), Some(&Outcome::Skipped));
    assert_eq!(results.get("Y"), Some(&Outcome::Success));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(store.is_processed("Y"));
}

#[tokio::test]
async fn failed_items_are_never_marked_processed() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CheckpointStore::open_default(dir.path()));

    let inner = |item: WorkItem, _f: FollowUps| async move {
        match item.id.as_str() {
            "Y" => Ok(Outcome::error("response never arrived")),
            "Z" => anyhow::bail!("page closed"),
            _ => Ok(Outcome::Success),
        }
    };
    let handler = CheckpointHandler::new(inner, Arc::clone(&store));

    assert!(!store.is_processed("Y"));
    let results = fast_runner(3).run(items(&["W", "Y", "Z"]), handler).await;

    assert!(matches!(results.get("Y"), Some(Outcome::Error { .. })));
    assert!(matches!(results.get("Z"), Some(Outcome::Error { .. })));
    assert!(!store.is_processed("Y"));
    assert!(!store.is_processed("Z"));
    assert!(store.is_processed("W"));
}

#[tokio::test]
async fn errors_and_manual_intervention_clear_a_stale_mark() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CheckpointStore::open_default(dir.path()));

    let inner = |item: WorkItem, _f: FollowUps| async move {
        Ok::<_, anyhow::Error>(match item.id.as_str() {
            "m" => Outcome::manual_intervention("login required"),
            _ => Outcome::error("boom"),
        })
    };
    let handler = CheckpointHandler::new(inner, Arc::clone(&store));

    let item = WorkItem::new("e");
    store.mark_processed("other");
    let outcome = handler.handle(item, FollowUps::new("e")).await.unwrap();
    assert!(matches!(outcome, Outcome::Error { .. }));

    let outcome = handler
        .handle(WorkItem::new("m"), FollowUps::new("m"))
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::ManualInterventionRequired { .. }));
    assert!(!store.is_processed("e"));
    assert!(!store.is_processed("m"));
    assert!(store.is_processed("other"));
}

#[tokio::test]
async fn excluded_ids_are_reported_without_running() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CheckpointStore::open_default(dir.path()));

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let inner = move |_item: WorkItem, _f: FollowUps| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, anyhow::Error>(Outcome::Success) }
    };
    let handler = CheckpointHandler::new(inner, Arc::clone(&store)).exclude(["b"]);

    let results = fast_runner(3).run(items(&["a", "b", "c"]), handler).await;

    assert_eq!(results.get("b"), Some(&Outcome::Excluded));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!store.is_processed("b"));
}

#[tokio::test]
async fn second_run_resumes_where_the_first_left_off() {
    let dir = tempfile::tempdir().unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));

    let make_handler = |fail_b: bool| {
        let store = Arc::new(CheckpointStore::open_default(dir.path()));
        let attempts = Arc::clone(&attempts);
        let inner = move |item: WorkItem, _f: FollowUps| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if fail_b && item.id == "b" {
                    anyhow::bail!("transient failure");
                }
                Ok(Outcome::Success)
            }
        };
        CheckpointHandler::new(inner, store)
    };

    let first = fast_runner(2)
        .run(items(&["a", "b", "c"]), make_handler(true))
        .await;
    assert_eq!(first.summary().success, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let second = fast_runner(2)
        .run(items(&["a", "b", "c"]), make_handler(false))
        .await;
    assert_eq!(second.get("a"), Some(&Outcome::Skipped));
    assert_eq!(second.get("b"), Some(&Outcome::Success));
    assert_eq!(second.get("c"), Some(&Outcome::Skipped));
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
}

// ---------------------------------------------------------------------------
// CommandHandler
// ---------------------------------------------------------------------------

#[cfg(unix)]
async fn run_shell(script: &str, item: WorkItem) -> Outcome {
    let handler = CommandHandler::new("sh")
        .args(["-c", script])
        .timeout(Duration::from_secs(10));
    let id = item.id.clone();
    handler.handle(item, FollowUps::new(&id)).await.unwrap()
}

#[cfg(unix)]
#[tokio::test]
async fn zero_exit_is_success() {
    assert_eq!(run_shell("exit 0", WorkItem::new("a")).await, Outcome::Success);
}

#[cfg(unix)]
#[tokio::test]
async fn item_is_passed_through_the_environment() {
    let item = WorkItem::new("acme").with_field("Website", "https://acme.example");
    let script = concat!(
        r#"test "$BATCHRUN_ITEM_ID" = acme && "#,
        r#"echo "$BATCHRUN_ITEM" | grep -q 'https://acme.example'"#
    );
    assert_eq!(run_shell(script, item).await, Outcome::Success);
}

#[cfg(unix)]
#[tokio::test]
async fn nonzero_exit_is_error_with_stderr() {
    let outcome = run_shell("echo 'chat input not found' >&2; exit 3", WorkItem::new("a")).await;
    match outcome {
        Outcome::Error { error } => {
            assert!(error.contains("status 3"), "{error}");
            assert!(error.contains("chat input not found"), "{error}");
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn exit_75_requests_manual_intervention() {
    let outcome = run_shell("echo 'solve the captcha' >&2; exit 75", WorkItem::new("a")).await;
    assert_eq!(outcome, Outcome::manual_intervention("solve the captcha"));
}

#[cfg(unix)]
#[tokio::test]
async fn slow_command_times_out() {
    let handler = CommandHandler::new("sh")
        .args(["-c", "sleep 5"])
        .timeout(Duration::from_millis(100));
    let started = std::time::Instant::now();
    let outcome = handler
        .handle(WorkItem::new("slow"), FollowUps::new("slow"))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(4));
    match outcome {
        Outcome::Error { error } => assert!(error.contains("timed out"), "{error}"),
        other => panic!("expected timeout error, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_program_is_an_error() {
    let handler = CommandHandler::new("/nonexistent/batchrun-test-program");
    let result = handler
        .handle(WorkItem::new("a"), FollowUps::new("a"))
        .await;
    assert!(result.is_err());
}
