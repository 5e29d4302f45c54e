//! Application state.

use std::sync::Arc;

use z_metering_queue::MessageQueue;
use z_metering_store::Store;

use crate::admission::AdmissionController;
use crate::config::ServiceConfig;
use crate::consumer::ResultConsumer;
use crate::jobs::JobQueries;
use crate::ledger::Ledger;
use crate::reconcile::Reconciler;
use crate::settlement::SettlementEngine;
use crate::supervisor::Supervisor;

/// Components shared by the service's entry points and background tasks.
#[derive(Clone)]
pub struct AppState {
    /// The storage backend.
    pub store: Arc<dyn Store>,

    /// The task and result queue.
    pub queue: Arc<dyn MessageQueue>,

    /// Credits ledger.
    pub ledger: Ledger,

    /// Result settlement.
    pub settlement: Arc<SettlementEngine>,

    /// Job admission.
    pub admission: Arc<AdmissionController>,

    /// Job lookups.
    pub jobs: JobQueries,

    /// Service configuration.
    pub config: ServiceConfig,
}

impl AppState {
    /// Wire the service together.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn MessageQueue>, config: ServiceConfig) -> Self {
        let ledger = Ledger::new(Arc::clone(&store));
        let settlement = Arc::new(SettlementEngine::new(
            ledger.clone(),
            config.classifier.clone(),
        ));
        let admission = Arc::new(AdmissionController::new(
            ledger.clone(),
            Arc::clone(&settlement),
            Arc::clone(&queue),
            config.task_topic.clone(),
            config.required_input_fields.clone(),
        ));
        let jobs = JobQueries::new(Arc::clone(&store));

        if config.reconcile_deadline().is_none() {
            tracing::warn!("Reconciliation disabled - jobs without a result stay pending");
        }

        Self {
            store,
            queue,
            ledger,
            settlement,
            admission,
            jobs,
            config,
        }
    }

    /// Build supervisors for the background tasks: the result consumer,
    /// and the reconciler when a deadline is configured.
    #[must_use]
    pub fn supervisors(&self) -> Vec<Arc<Supervisor>> {
        let consumer = ResultConsumer::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.settlement),
            self.config.result_topic.clone(),
            self.config.consume_options(),
        );
        let mut supervisors = vec![Arc::new(Supervisor::new(
            Arc::new(consumer),
            self.config.consumer_supervisor(),
        ))];

        if let Some(deadline) = self.config.reconcile_deadline() {
            tracing::info!(deadline = ?deadline, "Reconciliation enabled");
            let reconciler = Reconciler::new(
                self.ledger.clone(),
                Arc::clone(&self.settlement),
                deadline,
                self.config.reconcile_interval(),
            );
            supervisors.push(Arc::new(Supervisor::new(
                Arc::new(reconciler),
                self.config.reconciler_supervisor(),
            )));
        }

        supervisors
    }
}
