//! Reconciliation integration tests.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::TestHarness;
use serde_json::json;

use z_metering_core::{JobStatus, TransactionKind};
use z_metering_service::{Reconciler, SweepReport};

fn reconciler(harness: &TestHarness, deadline: Duration) -> Reconciler {
    Reconciler::new(
        harness.state.ledger.clone(),
        harness.state.settlement.clone(),
        deadline,
        Duration::from_secs(60),
    )
}

#[tokio::test]
async fn overdue_job_is_expired_and_refunded() {
    let harness = TestHarness::new();
    harness.fund(100);
    let job = harness.admit(10).await;
    let reconciler = reconciler(&harness, Duration::from_secs(600));

    let report = reconciler
        .sweep(Utc::now() + chrono::Duration::seconds(601))
        .unwrap();

    assert_eq!(
        report,
        SweepReport {
            examined: 1,
            expired: 1,
            errors: 0
        }
    );
    let stored = harness.job(&job.id);
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.failure_reason.as_deref(), Some("settlement deadline exceeded"));
    assert_eq!(stored.settled_by.as_deref(), Some("reconciler"));
    assert_eq!(harness.balance(), 100);
    harness.assert_consistent();
}

#[tokio::test]
async fn fresh_job_is_left_pending() {
    let harness = TestHarness::new();
    harness.fund(100);
    let job = harness.admit(10).await;
    let reconciler = reconciler(&harness, Duration::from_secs(600));

    let report = reconciler.sweep(Utc::now()).unwrap();

    assert_eq!(report.examined, 1);
    assert_eq!(report.expired, 0);
    assert_eq!(harness.job(&job.id).status, JobStatus::Pending);
    assert_eq!(harness.balance(), 90);
}

#[tokio::test]
async fn repeated_sweep_refunds_once() {
    let harness = TestHarness::new();
    harness.fund(100);
    harness.admit(10).await;
    harness.admit(20).await;
    let reconciler = reconciler(&harness, Duration::from_secs(1));
    let later = Utc::now() + chrono::Duration::seconds(5);

    assert_eq!(reconciler.sweep(later).unwrap().expired, 2);
    assert_eq!(reconciler.sweep(later).unwrap(), SweepReport::default());

    assert_eq!(harness.balance(), 100);
    assert_eq!(harness.transactions_of(TransactionKind::Refund).len(), 2);
    harness.assert_consistent();
}

#[tokio::test]
async fn late_result_after_expiry_is_ignored() {
    let harness = TestHarness::new();
    harness.fund(100);
    let job = harness.admit(10).await;
    let reconciler = reconciler(&harness, Duration::from_secs(1));

    reconciler
        .sweep(Utc::now() + chrono::Duration::seconds(5))
        .unwrap();
    harness
        .state
        .settlement
        .settle(
            job.id,
            json!({"status": "completed", "faces_count": 1, "dominant_emotion": "calm"}),
            "worker-1",
        )
        .unwrap();

    assert_eq!(harness.job(&job.id).status, JobStatus::Failed);
    assert_eq!(harness.balance(), 100);
}

#[tokio::test]
async fn settled_jobs_are_not_examined() {
    let harness = TestHarness::new();
    harness.fund(100);
    let job = harness.admit(10).await;
    harness
        .state
        .settlement
        .settle(job.id, json!({"status": "failed"}), "worker-1")
        .unwrap();

    let report = reconciler(&harness, Duration::from_secs(1))
        .sweep(Utc::now() + chrono::Duration::seconds(5))
        .unwrap();

    assert_eq!(report, SweepReport::default());
}
