//! Core types and utilities for z-metering.
//!
//! This crate provides the foundational types for metered compute jobs:
//!
//! - **Identifiers**: `UserId`, `JobId`, `TransactionId`
//! - **Accounts**: `Account`
//! - **Ledger**: `Transaction`, `TransactionKind`, `TransactionStatus`, `BalanceChange`
//! - **Jobs**: `Job`, `JobStatus`
//! - **Wire messages**: `TaskMessage`, `ResultMessage`
//! - **Classification**: `ClassifierRules`, `Outcome`, `FailureReason`
//!
//! # Credit unit
//!
//! Balances and amounts are `i64` counts of credit minor units. There is no
//! floating point anywhere in the ledger.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod account;
pub mod classifier;
pub mod error;
pub mod ids;
pub mod job;
pub mod ledger;
pub mod message;

pub use account::Account;
pub use classifier::{classify, ClassifierRules, FailureReason, Outcome};
pub use error::{MeteringError, Result};
pub use ids::{IdError, JobId, TransactionId, UserId};
pub use job::{Job, JobStatus};
pub use ledger::{BalanceChange, Transaction, TransactionKind, TransactionStatus};
pub use message::{ResultMessage, TaskMessage, UNKNOWN_WORKER};
