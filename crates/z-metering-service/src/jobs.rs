//! Read-only job and history queries.

use std::sync::Arc;

use z_metering_core::{Job, JobId, UserId};
use z_metering_store::Store;

use crate::error::ServiceError;

/// Default page size for listings.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Largest page size a caller may request.
pub const MAX_PAGE_SIZE: usize = 100;

/// Job lookups scoped to their owner.
#[derive(Clone)]
pub struct JobQueries {
    store: Arc<dyn Store>,
}

impl JobQueries {
    /// Create a query handle over a store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Get one of `user_id`'s jobs.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::NotFound` if the job does not exist or belongs
    /// to someone else.
    pub fn get_job(&self, user_id: &UserId, job_id: &JobId) -> Result<Job, ServiceError> {
        self.store
            .get_job(job_id)?
            .filter(|job| job.user_id == *user_id)
            .ok_or_else(|| ServiceError::NotFound {
                entity: "job",
                id: job_id.to_string(),
            })
    }

    /// List `user_id`'s jobs, newest first.
    ///
    /// `limit` is clamped to [`MAX_PAGE_SIZE`]; zero means the default.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Store` on storage failure.
    pub fn list_jobs(&self, user_id: &UserId, limit: usize, offset: usize) -> Result<Vec<Job>, ServiceError> {
        let limit = match limit {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        Ok(self.store.list_jobs_by_user(user_id, limit, offset)?)
    }
}
