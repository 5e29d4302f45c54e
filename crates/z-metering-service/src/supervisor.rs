//! Supervision of long-lived background tasks.
//!
//! A [`Supervisor`] keeps exactly one instance of a [`SupervisedTask`]
//! running. It notices the task exiting (returned, failed or panicked) as
//! soon as it happens, and checks the task's [`Heartbeat`] on a fixed
//! interval to catch silent hangs. Dead or hung tasks are restarted after
//! a doubling backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;

/// Liveness signal written by a running task.
pub struct Heartbeat {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Heartbeat {
    /// A heartbeat that has just beaten.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    /// Record that the task is alive.
    #[allow(clippy::cast_possible_truncation)]
    pub fn beat(&self) {
        let ms = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Relaxed);
    }

    /// Time since the last beat.
    #[must_use]
    pub fn since_last_beat(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// A task run under a [`Supervisor`].
#[async_trait]
pub trait SupervisedTask: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Run until `cancel` fires. Returning at any other time, with or
    /// without an error, counts as a crash.
    async fn run(&self, heartbeat: Arc<Heartbeat>, cancel: CancellationToken) -> Result<(), ServiceError>;

    /// Release whatever a crashed run left behind before the next start.
    async fn recover(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Supervisor tuning.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// Interval between liveness checks.
    pub check_interval: Duration,
    /// First restart delay. Doubles on consecutive crashes.
    pub initial_backoff: Duration,
    /// Upper bound for the restart delay.
    pub max_backoff: Duration,
    /// A task silent for longer than this is treated as hung.
    pub hang_timeout: Option<Duration>,
    /// How long a cancelled or aborted task may take to wind down.
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
            hang_timeout: Some(Duration::from_secs(120)),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Lifecycle of the supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Not running.
    Stopped,
    /// Being spawned.
    Starting,
    /// Spawned and passing liveness checks.
    Running,
    /// Exited or hung; waiting to restart.
    Crashed,
}

enum Exit {
    Shutdown,
    Finished(Result<Result<(), ServiceError>, tokio::task::JoinError>),
    Hung(Duration),
}

/// Keeps one instance of a task alive.
pub struct Supervisor {
    task: Arc<dyn SupervisedTask>,
    config: SupervisorConfig,
    state: watch::Sender<SupervisorState>,
    restarts: AtomicU64,
    abandoned: AtomicU64,
}

impl Supervisor {
    /// Create a supervisor for `task`.
    #[must_use]
    pub fn new(task: Arc<dyn SupervisedTask>, config: SupervisorConfig) -> Self {
        let (state, _) = watch::channel(SupervisorState::Stopped);
        Self {
            task,
            config,
            state,
            restarts: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Number of restarts so far.
    #[must_use]
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Number of hung instances that were still running after abort.
    #[must_use]
    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// Run the task until `shutdown` fires, restarting it whenever it dies.
    pub async fn run(&self, shutdown: CancellationToken) {
        let name = self.task.name().to_string();
        let mut backoff = self.config.initial_backoff;

        loop {
            self.set_state(SupervisorState::Starting);
            let heartbeat = Arc::new(Heartbeat::new());
            let cancel = shutdown.child_token();
            let started = Instant::now();

            let mut handle = {
                let task = Arc::clone(&self.task);
                let heartbeat = Arc::clone(&heartbeat);
                let cancel = cancel.clone();
                tokio::spawn(async move { task.run(heartbeat, cancel).await })
            };
            self.set_state(SupervisorState::Running);
            tracing::info!(task = %name, "Supervised task started");

            match self.watch(&mut handle, &heartbeat, &shutdown).await {
                Exit::Shutdown => {
                    cancel.cancel();
                    if tokio::time::timeout(self.config.shutdown_grace, &mut handle)
                        .await
                        .is_err()
                    {
                        tracing::warn!(task = %name, "Task ignored cancellation, aborting");
                        handle.abort();
                    }
                    self.set_state(SupervisorState::Stopped);
                    tracing::info!(task = %name, "Supervised task stopped");
                    return;
                }
                Exit::Finished(Ok(Ok(()))) => {
                    tracing::error!(task = %name, "Supervised task exited unexpectedly");
                }
                Exit::Finished(Ok(Err(e))) => {
                    tracing::error!(task = %name, error = %e, "Supervised task failed");
                }
                Exit::Finished(Err(e)) => {
                    tracing::error!(task = %name, error = %e, "Supervised task panicked");
                }
                Exit::Hung(silent) => {
                    tracing::error!(
                        task = %name,
                        silent = ?silent,
                        "Supervised task stopped responding, aborting"
                    );
                    cancel.cancel();
                    handle.abort();
                    if tokio::time::timeout(self.config.shutdown_grace, &mut handle)
                        .await
                        .is_err()
                    {
                        self.abandoned.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            task = %name,
                            grace = ?self.config.shutdown_grace,
                            "Hung task still running after abort, restarting alongside it"
                        );
                    }
                }
            }

            self.set_state(SupervisorState::Crashed);
            let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;

            if started.elapsed() >= self.config.max_backoff {
                backoff = self.config.initial_backoff;
            }

            if let Err(e) = self.task.recover().await {
                tracing::warn!(task = %name, error = %e, "Recovery before restart failed");
            }

            tracing::info!(
                task = %name,
                restarts = restarts,
                backoff = ?backoff,
                "Restarting supervised task"
            );

            tokio::select! {
                () = shutdown.cancelled() => {
                    self.set_state(SupervisorState::Stopped);
                    return;
                }
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    async fn watch(
        &self,
        handle: &mut JoinHandle<Result<(), ServiceError>>,
        heartbeat: &Heartbeat,
        shutdown: &CancellationToken,
    ) -> Exit {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return Exit::Shutdown,
                result = &mut *handle => return Exit::Finished(result),
                _ = ticker.tick() => {
                    if let Some(limit) = self.config.hang_timeout {
                        let silent = heartbeat.since_last_beat();
                        if silent > limit {
                            return Exit::Hung(silent);
                        }
                    }
                    tracing::debug!(task = %self.task.name(), "Liveness check passed");
                }
            }
        }
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }
}
