//! Supervised result consumption integration tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, TestHarness, RESULT_TOPIC};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use z_metering_core::{JobStatus, TransactionKind};
use z_metering_queue::{ConsumeOptions, MessageQueue};
use z_metering_service::{ResultConsumer, Supervisor, SupervisorConfig, SupervisorState};

fn supervised_consumer(harness: &TestHarness) -> Arc<Supervisor> {
    let consumer = ResultConsumer::new(
        Arc::clone(&harness.queue),
        Arc::clone(&harness.state.settlement),
        RESULT_TOPIC,
        ConsumeOptions {
            poll_interval: Duration::from_millis(20),
        },
    );
    let config = SupervisorConfig {
        check_interval: Duration::from_millis(50),
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(100),
        hang_timeout: Some(Duration::from_secs(5)),
        shutdown_grace: Duration::from_secs(1),
    };
    Arc::new(Supervisor::new(Arc::new(consumer), config))
}

fn start(supervisor: &Arc<Supervisor>) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let shutdown = CancellationToken::new();
    let handle = {
        let supervisor = Arc::clone(supervisor);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { supervisor.run(shutdown).await })
    };
    (shutdown, handle)
}

async fn queue_drained(harness: &TestHarness) -> bool {
    harness.queue.depth(RESULT_TOPIC).await.unwrap() == 0
}

// ============================================================================
// Normal operation
// ============================================================================

#[tokio::test]
async fn consumer_settles_published_results() {
    let harness = TestHarness::new();
    harness.fund(100);
    let ok = harness.admit(10).await;
    let empty = harness.admit(10).await;

    let supervisor = supervised_consumer(&harness);
    let (shutdown, handle) = start(&supervisor);

    harness
        .publish_result(ok.id, json!({"status": "completed", "faces_count": 1, "emotions": {"happy": 0.8}}))
        .await;
    harness
        .publish_result(empty.id, json!({"status": "completed", "faces_count": 0}))
        .await;

    eventually(|| harness.job(&empty.id).status == JobStatus::Failed).await;
    eventually(|| harness.job(&ok.id).status == JobStatus::Completed).await;
    assert_eq!(harness.balance(), 90);
    assert_eq!(supervisor.restarts(), 0);

    shutdown.cancel();
    handle.await.unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert!(queue_drained(&harness).await);
    harness.assert_consistent();
}

#[tokio::test]
async fn undecodable_and_duplicate_messages_are_acknowledged() {
    let harness = TestHarness::new();
    harness.fund(100);
    let job = harness.admit(10).await;

    harness.queue.publish(RESULT_TOPIC, b"{not json").await.unwrap();
    harness.publish_result(job.id, json!({"status": "failed"})).await;
    harness.publish_result(job.id, json!({"status": "failed"})).await;

    let supervisor = supervised_consumer(&harness);
    let (shutdown, handle) = start(&supervisor);

    for _ in 0..500 {
        if queue_drained(&harness).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(queue_drained(&harness).await);

    assert_eq!(harness.job(&job.id).status, JobStatus::Failed);
    assert_eq!(harness.balance(), 100);
    assert_eq!(harness.transactions_of(TransactionKind::Refund).len(), 1);
    assert_eq!(supervisor.restarts(), 0);

    shutdown.cancel();
    handle.await.unwrap();
}

// ============================================================================
// Crash and redelivery
// ============================================================================

#[tokio::test]
async fn crashed_consumer_is_restarted_and_result_redelivered() {
    let harness = TestHarness::new();
    harness.fund(100);
    let job = harness.admit(10).await;

    // Both refund paths fail for the first delivery only.
    harness.store.fail_refunding_settles(1);
    harness.store.fail_refund_commits(1);
    harness.publish_result(job.id, json!({"status": "completed", "faces_count": 0})).await;

    let supervisor = supervised_consumer(&harness);
    let (shutdown, handle) = start(&supervisor);

    eventually(|| harness.job(&job.id).status == JobStatus::Failed).await;
    assert!(supervisor.restarts() >= 1);
    eventually(|| supervisor.state() == SupervisorState::Running).await;

    assert_eq!(harness.balance(), 100);
    assert_eq!(harness.transactions_of(TransactionKind::Refund).len(), 1);
    assert_eq!(harness.transactions_of(TransactionKind::AdjustmentFailed).len(), 1);
    harness.assert_consistent();

    shutdown.cancel();
    handle.await.unwrap();
    assert!(queue_drained(&harness).await);
}

#[tokio::test]
async fn unacknowledged_result_survives_consumer_restart() {
    let harness = TestHarness::new();
    harness.fund(100);
    let job = harness.admit(10).await;
    harness.publish_result(job.id, json!({"status": "failed"})).await;

    // A previous consumer leased the message and died without acking.
    let leased = harness
        .queue
        .receive(RESULT_TOPIC, Duration::ZERO)
        .await
        .unwrap()
        .expect("result queued");
    assert_eq!(leased.attempts, 1);

    let supervisor = supervised_consumer(&harness);
    // Leases are released on recovery, before a restart.
    assert_eq!(harness.queue.recover(RESULT_TOPIC).await.unwrap(), 1);
    let (shutdown, handle) = start(&supervisor);

    eventually(|| harness.job(&job.id).status == JobStatus::Failed).await;
    assert_eq!(harness.balance(), 100);

    shutdown.cancel();
    handle.await.unwrap();
}
