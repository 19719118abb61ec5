//! End-to-end scheduler behavior against an in-memory transport: worker
//! bounds, per-path serialization, retries, cancellation, disconnect
//! handling and directory aggregation.

mod common;

use common::{fast_retry_config, setup, Planned};
use filebridge::events::BridgeEvent;
use filebridge::types::{TransferDirection, TransferRecord, TransferState};
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn test_upload_round_trip() {
    let h = setup(fast_retry_config(), 1);
    let local = h.local_file("a.txt", b"hello world");
    let mut events = h.events.subscribe();

    let id = h
        .queue
        .enqueue_upload("s1", local, "/srv/data/a.txt".into())
        .await
        .unwrap();
    let record = h.wait_terminal(&id).await;

    assert_eq!(record.state, TransferState::Succeeded);
    assert_eq!(record.bytes_done, 11);
    assert_eq!(record.attempts, 1);
    assert_eq!(h.remote.file("/srv/data/a.txt").unwrap(), b"hello world");
    // The destination parent was created on the way.
    assert!(h.remote.dirs.lock().contains("/srv/data"));

    // At least one progress frame made it out.
    let mut saw_progress = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, BridgeEvent::TransferProgress { ref update } if update.bytes_done > 0) {
            saw_progress = true;
        }
    }
    assert!(saw_progress);
}

#[tokio::test]
async fn test_download_round_trip() {
    let h = setup(fast_retry_config(), 1);
    h.remote.seed_file("/srv/report.csv", b"1,2,3\n");
    let dest = h.tmp.path().join("report.csv");

    let id = h
        .queue
        .enqueue_download("s1", "/srv/report.csv".into(), dest.clone(), 6)
        .await
        .unwrap();
    let record = h.wait_terminal(&id).await;

    assert_eq!(record.state, TransferState::Succeeded);
    assert_eq!(std::fs::read(&dest).unwrap(), b"1,2,3\n");
}

#[tokio::test]
async fn test_same_remote_path_is_serialized() {
    let mut config = fast_retry_config();
    config.workers_per_session = 4;
    let h = setup(config, 5);
    let first = h.local_file("v1.txt", b"first version");
    let second = h.local_file("v2.txt", b"second writer");

    let a = h
        .queue
        .enqueue_upload("s1", first, "/srv/shared.txt".into())
        .await
        .unwrap();
    let b = h
        .queue
        .enqueue_upload("s1", second, "/srv/shared.txt".into())
        .await
        .unwrap();
    h.wait_terminal(&a).await;
    h.wait_terminal(&b).await;

    assert_eq!(h.remote.overlap_seen.load(Ordering::SeqCst), 0);
    // Whichever ran last wins whole, no interleaving.
    let content = h.remote.file("/srv/shared.txt").unwrap();
    assert!(content == b"first version" || content == b"second writer");
}

#[tokio::test]
async fn test_worker_bound_respected() {
    let mut config = fast_retry_config();
    config.workers_per_session = 2;
    let h = setup(config, 10);

    let mut ids = Vec::new();
    for i in 0..6 {
        let local = h.local_file(&format!("f{i}.txt"), b"0123456789");
        let id = h
            .queue
            .enqueue_upload("s1", local, format!("/srv/f{i}.txt"))
            .await
            .unwrap();
        ids.push(id);
    }
    for id in &ids {
        assert_eq!(h.wait_terminal(id).await.state, TransferState::Succeeded);
    }
    assert!(h.remote.max_active.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_retryable_fault_retries_then_succeeds() {
    let h = setup(fast_retry_config(), 1);
    h.remote
        .plan_failures("/srv/flaky.txt", &[Planned::Retryable, Planned::Retryable]);
    let local = h.local_file("flaky.txt", b"payload");

    let id = h
        .queue
        .enqueue_upload("s1", local, "/srv/flaky.txt".into())
        .await
        .unwrap();
    let record = h.wait_terminal(&id).await;

    assert_eq!(record.state, TransferState::Succeeded);
    assert_eq!(record.attempts, 3);
    assert_eq!(h.remote.file("/srv/flaky.txt").unwrap(), b"payload");
}

#[tokio::test]
async fn test_retries_exhausted_leaves_retryable_failure() {
    let h = setup(fast_retry_config(), 1);
    h.remote.plan_failures(
        "/srv/dead.txt",
        &[Planned::Retryable, Planned::Retryable, Planned::Retryable],
    );
    let local = h.local_file("dead.txt", b"payload");

    let id = h
        .queue
        .enqueue_upload("s1", local, "/srv/dead.txt".into())
        .await
        .unwrap();
    let record = h.wait_terminal(&id).await;

    assert_eq!(record.state, TransferState::Failed);
    assert!(record.retryable);
    assert_eq!(record.attempts, 3);
}

#[tokio::test]
async fn test_non_retryable_fault_fails_immediately() {
    let h = setup(fast_retry_config(), 1);
    h.remote
        .plan_failures("/srv/missing.txt", &[Planned::NotFound]);
    let local = h.local_file("x.txt", b"payload");

    let id = h
        .queue
        .enqueue_upload("s1", local, "/srv/missing.txt".into())
        .await
        .unwrap();
    let record = h.wait_terminal(&id).await;

    assert_eq!(record.state, TransferState::Failed);
    assert!(!record.retryable);
    assert_eq!(record.attempts, 1);
}

#[tokio::test]
async fn test_manual_retry_after_failure() {
    let h = setup(fast_retry_config(), 1);
    h.remote
        .plan_failures("/srv/once.txt", &[Planned::NotFound]);
    let local = h.local_file("once.txt", b"try again");

    let id = h
        .queue
        .enqueue_upload("s1", local, "/srv/once.txt".into())
        .await
        .unwrap();
    assert_eq!(h.wait_terminal(&id).await.state, TransferState::Failed);

    h.queue.retry(&id).await.unwrap();
    let record = h.wait_terminal(&id).await;
    assert_eq!(record.state, TransferState::Succeeded);
    assert_eq!(record.attempts, 2);
    assert_eq!(h.remote.file("/srv/once.txt").unwrap(), b"try again");
}

#[tokio::test]
async fn test_retry_rejected_for_non_failed() {
    let h = setup(fast_retry_config(), 1);
    let local = h.local_file("ok.txt", b"fine");
    let id = h
        .queue
        .enqueue_upload("s1", local, "/srv/ok.txt".into())
        .await
        .unwrap();
    h.wait_terminal(&id).await;
    assert!(h.queue.retry(&id).await.is_err());
}

#[tokio::test]
async fn test_cancel_mid_flight_removes_new_partial() {
    let h = setup(fast_retry_config(), 20);
    let local = h.local_file("big.txt", b"0123456789abcdef");

    let id = h
        .queue
        .enqueue_upload("s1", local, "/srv/new.txt".into())
        .await
        .unwrap();
    h.wait_for(&id, |r| r.state == TransferState::Running && r.bytes_done > 0)
        .await;

    h.queue.cancel(&id).await.unwrap();
    let record = h.wait_terminal(&id).await;

    assert_eq!(record.state, TransferState::Cancelled);
    // The destination did not exist before, so the partial is cleaned up.
    assert!(h.remote.file("/srv/new.txt").is_none());
}

#[tokio::test]
async fn test_cancel_never_deletes_preexisting_destination() {
    let h = setup(fast_retry_config(), 20);
    h.remote.seed_file("/srv/existing.txt", b"original content");
    let local = h.local_file("big.txt", b"replacement data going up");

    let id = h
        .queue
        .enqueue_upload("s1", local, "/srv/existing.txt".into())
        .await
        .unwrap();
    h.wait_for(&id, |r| r.state == TransferState::Running && r.bytes_done > 0)
        .await;

    h.queue.cancel(&id).await.unwrap();
    let record = h.wait_terminal(&id).await;

    assert_eq!(record.state, TransferState::Cancelled);
    // Possibly partially overwritten, but never deleted.
    assert!(h.remote.file("/srv/existing.txt").is_some());
}

#[tokio::test]
async fn test_cancel_while_queued() {
    let mut config = fast_retry_config();
    config.workers_per_session = 1;
    let h = setup(config, 20);
    let blocker = h.local_file("blocker.txt", b"0123456789abcdef");
    let queued = h.local_file("queued.txt", b"never sent");

    let a = h
        .queue
        .enqueue_upload("s1", blocker, "/srv/blocker.txt".into())
        .await
        .unwrap();
    h.wait_for(&a, |r| r.state == TransferState::Running).await;
    let b = h
        .queue
        .enqueue_upload("s1", queued, "/srv/queued.txt".into())
        .await
        .unwrap();

    h.queue.cancel(&b).await.unwrap();
    assert_eq!(h.queue.record(&b).unwrap().state, TransferState::Cancelled);

    h.wait_terminal(&a).await;
    assert!(h.remote.file("/srv/queued.txt").is_none());
}

#[tokio::test]
async fn test_pause_and_resume() {
    let h = setup(fast_retry_config(), 10);
    let local = h.local_file("paused.txt", b"0123456789abcdef");

    let id = h
        .queue
        .enqueue_upload("s1", local, "/srv/paused.txt".into())
        .await
        .unwrap();
    h.wait_for(&id, |r| r.state == TransferState::Running && r.bytes_done > 0)
        .await;

    h.queue.pause(&id).unwrap();
    assert_eq!(h.queue.record(&id).unwrap().state, TransferState::Paused);
    let frozen = h.queue.record(&id).unwrap().bytes_done;
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Parked at a checkpoint, give or take one in-flight chunk.
    assert!(h.queue.record(&id).unwrap().bytes_done <= frozen + 2);

    h.queue.resume(&id).unwrap();
    let record = h.wait_terminal(&id).await;
    assert_eq!(record.state, TransferState::Succeeded);
    assert_eq!(
        h.remote.file("/srv/paused.txt").unwrap(),
        b"0123456789abcdef"
    );
}

#[tokio::test]
async fn test_disconnect_fails_running_and_preserves_queued() {
    let h = setup(fast_retry_config(), 20);
    let running = h.local_file("running.txt", b"0123456789abcdef");

    let a = h
        .queue
        .enqueue_upload("s1", running, "/srv/running.txt".into())
        .await
        .unwrap();
    h.wait_for(&a, |r| r.state == TransferState::Running && r.bytes_done > 0)
        .await;

    h.session.mark_disconnected();
    h.queue.handle_disconnect("s1").await;

    let failed = h.wait_terminal(&a).await;
    assert_eq!(failed.state, TransferState::Failed);
    assert!(failed.retryable);

    // Enqueued while disconnected: waits, does not fail.
    let waiting = h.local_file("waiting.txt", b"later");
    let b = h
        .queue
        .enqueue_upload("s1", waiting, "/srv/waiting.txt".into())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.queue.record(&b).unwrap().state, TransferState::Queued);

    h.session
        .mark_connected(h.remote.clone(), "/home/user".into(), None);
    let record = h.wait_terminal(&b).await;
    assert_eq!(record.state, TransferState::Succeeded);
    assert_eq!(h.remote.file("/srv/waiting.txt").unwrap(), b"later");
}

#[tokio::test]
async fn test_directory_parent_aggregates_success() {
    let h = setup(fast_retry_config(), 1);
    let mut parent = TransferRecord::new("s1", TransferDirection::Upload, "/tmp/dir", "/srv/dir");
    parent.is_directory = true;
    parent.bytes_total = 10;
    let parent_id = h.queue.enqueue_parent(parent).await.unwrap();

    for i in 0..2 {
        let local = h.local_file(&format!("c{i}.txt"), b"12345");
        let mut child = TransferRecord::new(
            "s1",
            TransferDirection::Upload,
            local.to_string_lossy(),
            format!("/srv/dir/c{i}.txt"),
        );
        child.bytes_total = 5;
        h.queue
            .enqueue_child(h.session.clone(), child, &parent_id)
            .await
            .unwrap();
    }

    let record = h.wait_terminal(&parent_id).await;
    assert_eq!(record.state, TransferState::Succeeded);
    assert_eq!(record.bytes_done, 10);
    assert!(h.remote.file("/srv/dir/c0.txt").is_some());
    assert!(h.remote.file("/srv/dir/c1.txt").is_some());
}

#[tokio::test]
async fn test_directory_parent_reports_partial_failure() {
    let h = setup(fast_retry_config(), 1);
    h.remote
        .plan_failures("/srv/dir/bad.txt", &[Planned::NotFound]);

    let mut parent = TransferRecord::new("s1", TransferDirection::Upload, "/tmp/dir", "/srv/dir");
    parent.is_directory = true;
    let parent_id = h.queue.enqueue_parent(parent).await.unwrap();

    for name in ["good.txt", "bad.txt"] {
        let local = h.local_file(name, b"12345");
        let child = TransferRecord::new(
            "s1",
            TransferDirection::Upload,
            local.to_string_lossy(),
            format!("/srv/dir/{name}"),
        );
        h.queue
            .enqueue_child(h.session.clone(), child, &parent_id)
            .await
            .unwrap();
    }

    let record = h.wait_terminal(&parent_id).await;
    assert_eq!(record.state, TransferState::Failed);
    assert_eq!(record.error.as_deref(), Some("1 of 2 items failed"));
    assert!(record.retryable);
    assert!(h.remote.file("/srv/dir/good.txt").is_some());
}

#[tokio::test]
async fn test_cancel_directory_cancels_children() {
    let mut config = fast_retry_config();
    config.workers_per_session = 1;
    let h = setup(config, 20);

    let mut parent = TransferRecord::new("s1", TransferDirection::Upload, "/tmp/dir", "/srv/dir");
    parent.is_directory = true;
    let parent_id = h.queue.enqueue_parent(parent).await.unwrap();

    let mut child_ids = Vec::new();
    for i in 0..3 {
        let local = h.local_file(&format!("c{i}.txt"), b"0123456789abcdef");
        let child = TransferRecord::new(
            "s1",
            TransferDirection::Upload,
            local.to_string_lossy(),
            format!("/srv/dir/c{i}.txt"),
        );
        let id = h
            .queue
            .enqueue_child(h.session.clone(), child, &parent_id)
            .await
            .unwrap();
        child_ids.push(id);
    }
    h.wait_for(&child_ids[0], |r| r.state == TransferState::Running)
        .await;

    h.queue.cancel(&parent_id).await.unwrap();
    // Whenever the parent is observed terminal, every child must already
    // be terminal too; the running child settles the parent, not cancel().
    let parent_now = h.queue.record(&parent_id).unwrap();
    if parent_now.state.is_terminal() {
        for id in &child_ids {
            assert!(h.queue.record(id).unwrap().state.is_terminal());
        }
    }
    let record = h.wait_terminal(&parent_id).await;

    assert_eq!(record.state, TransferState::Cancelled);
    for id in &child_ids {
        assert_eq!(h.queue.record(id).unwrap().state, TransferState::Cancelled);
    }
}

#[tokio::test]
async fn test_retry_directory_parent_requeues_failed_children() {
    let h = setup(fast_retry_config(), 1);
    h.remote.plan_failures(
        "/srv/dir/bad.txt",
        &[Planned::Retryable, Planned::Retryable, Planned::Retryable],
    );

    let mut parent = TransferRecord::new("s1", TransferDirection::Upload, "/tmp/dir", "/srv/dir");
    parent.is_directory = true;
    let parent_id = h.queue.enqueue_parent(parent).await.unwrap();

    for name in ["good.txt", "bad.txt"] {
        let local = h.local_file(name, b"12345");
        let child = TransferRecord::new(
            "s1",
            TransferDirection::Upload,
            local.to_string_lossy(),
            format!("/srv/dir/{name}"),
        );
        h.queue
            .enqueue_child(h.session.clone(), child, &parent_id)
            .await
            .unwrap();
    }
    let failed = h.wait_terminal(&parent_id).await;
    assert_eq!(failed.state, TransferState::Failed);

    // The parent is aggregation-only: retrying it reruns the failed child
    // rather than executing the parent as a transfer of its own.
    h.queue.retry(&parent_id).await.unwrap();
    let record = h.wait_terminal(&parent_id).await;
    assert_eq!(record.state, TransferState::Succeeded);
    assert_eq!(h.remote.file("/srv/dir/bad.txt").unwrap(), b"12345");
    assert_eq!(h.remote.file("/srv/dir/good.txt").unwrap(), b"12345");
}

#[tokio::test]
async fn test_records_listed_per_session() {
    let h = setup(fast_retry_config(), 1);
    let local = h.local_file("a.txt", b"x");
    let id = h
        .queue
        .enqueue_upload("s1", local, "/srv/a.txt".into())
        .await
        .unwrap();
    h.wait_terminal(&id).await;

    let records = h.queue.records_for_session("s1");
    assert_eq!(records.len(), 1);
    assert!(h.queue.records_for_session("other").is_empty());
    assert!(h.registry.get("s1").is_ok());
}
