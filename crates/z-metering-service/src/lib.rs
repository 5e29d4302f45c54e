//! Z-Metering service.
//!
//! Ties the credits ledger to an asynchronous job pipeline:
//!
//! - **Admission** reserves a job's cost and dispatches it to the task queue
//! - **Settlement** classifies worker results and refunds failed jobs once
//! - **Consumption** drains the result queue under a restarting supervisor
//! - **Reconciliation** expires jobs whose result never arrives
//!
//! # Guarantees
//!
//! A user's balance always equals the sum of their ledger transactions, and
//! a job's cost is refunded at most once no matter how often its result is
//! delivered.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod admission;
pub mod config;
pub mod consumer;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod reconcile;
pub mod settlement;
pub mod state;
pub mod supervisor;

pub use admission::AdmissionController;
pub use config::{QueueBackend, ServiceConfig};
pub use consumer::ResultConsumer;
pub use error::{AdmissionError, ConfigError, LedgerError, ServiceError, SettlementError};
pub use jobs::JobQueries;
pub use ledger::{AuditReport, Ledger};
pub use reconcile::{Reconciler, SweepReport};
pub use settlement::{SettlementEngine, SettlementOutcome};
pub use state::AppState;
pub use supervisor::{Heartbeat, SupervisedTask, Supervisor, SupervisorConfig, SupervisorState};
