//! Common test utilities for z-metering integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use z_metering_core::{
    Account, BalanceChange, Job, JobId, ResultMessage, TaskMessage, Transaction, TransactionId,
    TransactionKind, UserId,
};
use z_metering_queue::{Delivery, MemoryQueue, MessageQueue, QueueError};
use z_metering_service::{AppState, ServiceConfig};
use z_metering_store::{RocksStore, Store, StoreError};

/// Task topic used by every harness.
pub const TASK_TOPIC: &str = "ml_tasks";

/// Result topic used by every harness.
pub const RESULT_TOPIC: &str = "ml_results";

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// Temporary directory for the database (kept alive for test duration).
    pub _temp_dir: TempDir,
    /// The store, with injectable failures.
    pub store: Arc<FlakyStore>,
    /// The queue the service publishes to and consumes from.
    pub queue: Arc<dyn MessageQueue>,
    /// Wired service components.
    pub state: AppState,
    /// A test user.
    pub user_id: UserId,
}

impl TestHarness {
    /// Create a new test harness with a fresh database and in-memory queue.
    pub fn new() -> Self {
        Self::with_queue(Arc::new(MemoryQueue::new()))
    }

    /// Create a harness whose task publishes always fail.
    pub fn with_failing_queue() -> Self {
        Self::with_queue(Arc::new(FailingQueue))
    }

    /// Create a harness over `queue`.
    pub fn with_queue(queue: Arc<dyn MessageQueue>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let rocks = RocksStore::open(temp_dir.path()).expect("Failed to open store");
        let store = Arc::new(FlakyStore::new(rocks));

        let config = ServiceConfig {
            data_dir: temp_dir.path().to_string_lossy().to_string(),
            queue_dir: temp_dir.path().join("queue").to_string_lossy().to_string(),
            task_topic: TASK_TOPIC.into(),
            result_topic: RESULT_TOPIC.into(),
            consumer_poll_interval_ms: 20,
            ..ServiceConfig::default()
        };

        let state = AppState::new(store.clone(), Arc::clone(&queue), config);

        Self {
            _temp_dir: temp_dir,
            store,
            queue,
            state,
            user_id: UserId::generate(),
        }
    }

    /// Deposit `amount` for the test user.
    pub fn fund(&self, amount: i64) {
        self.state
            .ledger
            .deposit(self.user_id, amount, "test funding")
            .expect("Failed to fund test user");
    }

    /// Current balance of the test user.
    pub fn balance(&self) -> i64 {
        self.state.ledger.balance(&self.user_id).expect("Failed to read balance")
    }

    /// All of the test user's transactions, newest first.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.state
            .ledger
            .transactions(&self.user_id, 1000, 0)
            .expect("Failed to list transactions")
    }

    /// The test user's transactions of one kind.
    pub fn transactions_of(&self, kind: TransactionKind) -> Vec<Transaction> {
        self.transactions()
            .into_iter()
            .filter(|tx| tx.kind == kind)
            .collect()
    }

    /// Admit a job for the test user with a valid input.
    pub async fn admit(&self, cost: i64) -> Job {
        self.state
            .admission
            .admit(self.user_id, serde_json::json!({"transaction": {"amount": 5}}), cost)
            .await
            .expect("Failed to admit job")
    }

    /// Reload a job from the store.
    pub fn job(&self, job_id: &JobId) -> Job {
        self.state
            .ledger
            .job(job_id)
            .expect("Failed to read job")
            .expect("Job missing")
    }

    /// Take the next task message off the task topic.
    pub async fn next_task(&self) -> Option<TaskMessage> {
        let delivery = self
            .queue
            .receive(TASK_TOPIC, Duration::ZERO)
            .await
            .expect("Failed to receive task")?;
        self.queue.ack(&delivery).await.expect("Failed to ack task");
        Some(serde_json::from_slice(&delivery.payload).expect("Invalid task message"))
    }

    /// Publish a worker result for `job_id`.
    pub async fn publish_result(&self, job_id: JobId, result: serde_json::Value) {
        let message = ResultMessage {
            job_id,
            result,
            worker_id: "worker-1".into(),
        };
        self.queue
            .publish(RESULT_TOPIC, &message.to_bytes().expect("Failed to encode result"))
            .await
            .expect("Failed to publish result");
    }

    /// Assert the test user's balance equals their ledger sum.
    pub fn assert_consistent(&self) {
        let report = self.state.ledger.audit(&self.user_id).expect("Failed to audit");
        assert!(
            report.is_consistent(),
            "balance {} != ledger sum {}",
            report.balance,
            report.ledger_sum
        );
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

// ============================================================================
// Test doubles
// ============================================================================

/// A queue that cannot publish.
pub struct FailingQueue;

#[async_trait]
impl MessageQueue for FailingQueue {
    async fn publish(&self, _topic: &str, _payload: &[u8]) -> z_metering_queue::Result<()> {
        Err(QueueError::Backend("broker unavailable".into()))
    }

    async fn receive(&self, _topic: &str, _wait: Duration) -> z_metering_queue::Result<Option<Delivery>> {
        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> z_metering_queue::Result<()> {
        Err(QueueError::UnknownDelivery {
            topic: delivery.topic.clone(),
            tag: delivery.tag,
        })
    }

    async fn nack(&self, delivery: Delivery) -> z_metering_queue::Result<()> {
        Err(QueueError::UnknownDelivery {
            topic: delivery.topic,
            tag: delivery.tag,
        })
    }

    async fn recover(&self, _topic: &str) -> z_metering_queue::Result<usize> {
        Ok(0)
    }

    async fn depth(&self, _topic: &str) -> z_metering_queue::Result<usize> {
        Ok(0)
    }
}

/// A [`RocksStore`] that fails selected writes with a transient error.
pub struct FlakyStore {
    inner: RocksStore,
    refunding_settles: AtomicUsize,
    refund_commits: AtomicUsize,
}

impl FlakyStore {
    /// Wrap a store with no failures armed.
    pub fn new(inner: RocksStore) -> Self {
        Self {
            inner,
            refunding_settles: AtomicUsize::new(0),
            refund_commits: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` job settlements that carry a refund.
    pub fn fail_refunding_settles(&self, n: usize) {
        self.refunding_settles.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` standalone refund commits.
    pub fn fail_refund_commits(&self, n: usize) {
        self.refund_commits.store(n, Ordering::SeqCst);
    }

    fn trip(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn injected() -> StoreError {
        StoreError::Database("injected failure".into())
    }
}

impl Store for FlakyStore {
    fn get_account(&self, user_id: &UserId) -> z_metering_store::Result<Option<Account>> {
        self.inner.get_account(user_id)
    }

    fn ensure_account(&self, user_id: &UserId) -> z_metering_store::Result<Account> {
        self.inner.ensure_account(user_id)
    }

    fn commit_transaction(&self, transaction: Transaction) -> z_metering_store::Result<BalanceChange> {
        if transaction.kind == TransactionKind::Refund && Self::trip(&self.refund_commits) {
            return Err(Self::injected());
        }
        self.inner.commit_transaction(transaction)
    }

    fn get_transaction(&self, transaction_id: &TransactionId) -> z_metering_store::Result<Option<Transaction>> {
        self.inner.get_transaction(transaction_id)
    }

    fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> z_metering_store::Result<Vec<Transaction>> {
        self.inner.list_transactions_by_user(user_id, limit, offset)
    }

    fn sum_transactions(&self, user_id: &UserId) -> z_metering_store::Result<i64> {
        self.inner.sum_transactions(user_id)
    }

    fn find_refund(&self, job_id: &JobId) -> z_metering_store::Result<Option<TransactionId>> {
        self.inner.find_refund(job_id)
    }

    fn open_job(&self, job: &Job, reservation: Transaction) -> z_metering_store::Result<BalanceChange> {
        self.inner.open_job(job, reservation)
    }

    fn settle_job(&self, job: &Job, refund: Option<Transaction>) -> z_metering_store::Result<Option<BalanceChange>> {
        if refund.is_some() && Self::trip(&self.refunding_settles) {
            return Err(Self::injected());
        }
        self.inner.settle_job(job, refund)
    }

    fn get_job(&self, job_id: &JobId) -> z_metering_store::Result<Option<Job>> {
        self.inner.get_job(job_id)
    }

    fn list_jobs_by_user(&self, user_id: &UserId, limit: usize, offset: usize) -> z_metering_store::Result<Vec<Job>> {
        self.inner.list_jobs_by_user(user_id, limit, offset)
    }

    fn list_pending_jobs(&self, limit: usize) -> z_metering_store::Result<Vec<Job>> {
        self.inner.list_pending_jobs(limit)
    }
}
