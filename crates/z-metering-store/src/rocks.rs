//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use z_metering_core::{
    Account, BalanceChange, Job, JobId, JobStatus, Transaction, TransactionId,
    TransactionStatus, UserId,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::locks::UserLocks;
use crate::schema::{all_column_families, cf};
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    locks: UserLocks,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            locks: UserLocks::default(),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get_value<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    /// The stored account, or a fresh zero-balance one. Caller holds the lock.
    fn load_account(&self, user_id: &UserId) -> Result<Account> {
        Ok(self
            .get_account(user_id)?
            .unwrap_or_else(|| Account::new(*user_id)))
    }

    fn stage_account(&self, batch: &mut WriteBatch, account: &Account) -> Result<()> {
        let cf = self.cf(cf::ACCOUNTS)?;
        batch.put_cf(&cf, keys::account_key(&account.user_id), Self::serialize(account)?);
        Ok(())
    }

    /// Check a transaction against the account and stage its writes.
    ///
    /// Mutates `account` in memory; the caller stages the account afterwards.
    fn stage_transaction(
        &self,
        batch: &mut WriteBatch,
        account: &mut Account,
        mut transaction: Transaction,
    ) -> Result<BalanceChange> {
        let delta = match transaction.status {
            TransactionStatus::Completed => transaction.amount,
            TransactionStatus::Failed => 0,
        };

        if delta < 0 && !account.has_sufficient_credits(-delta) {
            return Err(StoreError::InsufficientCredits {
                balance: account.balance,
                required: -delta,
            });
        }

        if let Some(job_id) = transaction
            .related_job_id
            .filter(|job_id| transaction.is_refund_for(*job_id))
        {
            if let Some(existing) = self.find_refund(&job_id)? {
                return Err(StoreError::DuplicateRefund {
                    job_id: job_id.to_string(),
                    transaction_id: existing.to_string(),
                });
            }
            let cf_refunds = self.cf(cf::REFUNDS_BY_JOB)?;
            batch.put_cf(
                &cf_refunds,
                keys::job_key(&job_id),
                keys::transaction_key(&transaction.id),
            );
        }

        let previous = account
            .apply_delta(delta)
            .ok_or(StoreError::BalanceOverflow {
                balance: account.balance,
                delta,
            })?;
        transaction.balance_after = account.balance;

        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        let cf_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;
        batch.put_cf(
            &cf_tx,
            keys::transaction_key(&transaction.id),
            Self::serialize(&transaction)?,
        );
        batch.put_cf(
            &cf_by_user,
            keys::user_scoped_key(&transaction.user_id, transaction.id.to_bytes()),
            [],
        );

        Ok(BalanceChange {
            previous,
            current: account.balance,
            transaction_id: transaction.id,
        })
    }

    /// Stage a job record and keep its indexes in step with its status.
    fn stage_job(&self, batch: &mut WriteBatch, job: &Job) -> Result<()> {
        let cf_jobs = self.cf(cf::JOBS)?;
        let cf_by_user = self.cf(cf::JOBS_BY_USER)?;
        let cf_pending = self.cf(cf::PENDING_JOBS)?;

        let key = keys::job_key(&job.id);
        batch.put_cf(&cf_jobs, &key, Self::serialize(job)?);
        batch.put_cf(
            &cf_by_user,
            keys::user_scoped_key(&job.user_id, job.id.to_bytes()),
            [],
        );
        if job.status == JobStatus::Pending {
            batch.put_cf(&cf_pending, &key, []);
        } else {
            batch.delete_cf(&cf_pending, &key);
        }
        Ok(())
    }

    /// Walk a user-scoped index newest first and return the trailing ids.
    fn scan_user_index(
        &self,
        cf_name: &str,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<[u8; 16]>> {
        let cf = self.cf(cf_name)?;
        let prefix = keys::user_prefix(user_id);
        let upper = keys::user_scoped_key(user_id, [0xFF; 16]);

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&upper, Direction::Reverse));

        let mut ids = Vec::new();
        let mut skipped = 0;
        for item in iter {
            if ids.len() >= limit {
                break;
            }
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            if skipped < offset {
                skipped += 1;
                continue;
            }
            if let Some(id) = keys::id_from_user_key(&key) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Accounts
    // =========================================================================

    fn get_account(&self, user_id: &UserId) -> Result<Option<Account>> {
        self.get_value(cf::ACCOUNTS, &keys::account_key(user_id))
    }

    fn ensure_account(&self, user_id: &UserId) -> Result<Account> {
        let _guard = self.locks.lock(user_id);

        if let Some(account) = self.get_account(user_id)? {
            return Ok(account);
        }

        let account = Account::new(*user_id);
        let cf = self.cf(cf::ACCOUNTS)?;
        self.db
            .put_cf(&cf, keys::account_key(user_id), Self::serialize(&account)?)?;

        tracing::debug!(user_id = %user_id, "Account created");
        Ok(account)
    }

    // =========================================================================
    // Ledger
    // =========================================================================

    fn commit_transaction(&self, transaction: Transaction) -> Result<BalanceChange> {
        let user_id = transaction.user_id;
        let _guard = self.locks.lock(&user_id);

        let mut account = self.load_account(&user_id)?;
        let mut batch = WriteBatch::default();
        let change = self.stage_transaction(&mut batch, &mut account, transaction)?;
        self.stage_account(&mut batch, &account)?;
        self.db.write(batch)?;

        Ok(change)
    }

    fn get_transaction(&self, transaction_id: &TransactionId) -> Result<Option<Transaction>> {
        self.get_value(cf::TRANSACTIONS, &keys::transaction_key(transaction_id))
    }

    fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>> {
        let ids = self.scan_user_index(cf::TRANSACTIONS_BY_USER, user_id, limit, offset)?;

        let mut transactions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(tx) = self.get_transaction(&TransactionId::from_bytes(id))? {
                transactions.push(tx);
            }
        }
        Ok(transactions)
    }

    fn sum_transactions(&self, user_id: &UserId) -> Result<i64> {
        let ids = self.scan_user_index(cf::TRANSACTIONS_BY_USER, user_id, usize::MAX, 0)?;

        let mut total = 0i64;
        for id in ids {
            let tx = self
                .get_transaction(&TransactionId::from_bytes(id))?
                .ok_or_else(|| StoreError::NotFound {
                    entity: "transaction",
                    id: TransactionId::from_bytes(id).to_string(),
                })?;
            total = total
                .checked_add(tx.amount)
                .ok_or(StoreError::BalanceOverflow {
                    balance: total,
                    delta: tx.amount,
                })?;
        }
        Ok(total)
    }

    fn find_refund(&self, job_id: &JobId) -> Result<Option<TransactionId>> {
        let cf = self.cf(cf::REFUNDS_BY_JOB)?;
        let Some(value) = self.db.get_cf(&cf, keys::job_key(job_id))? else {
            return Ok(None);
        };
        keys::id_from_key(&value)
            .map(|bytes| Some(TransactionId::from_bytes(bytes)))
            .ok_or_else(|| StoreError::Serialization(format!("malformed refund anchor for {job_id}")))
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    fn open_job(&self, job: &Job, reservation: Transaction) -> Result<BalanceChange> {
        let _guard = self.locks.lock(&job.user_id);

        let mut account = self.load_account(&job.user_id)?;
        let mut batch = WriteBatch::default();
        let change = self.stage_transaction(&mut batch, &mut account, reservation)?;
        self.stage_account(&mut batch, &account)?;
        self.stage_job(&mut batch, job)?;
        self.db.write(batch)?;

        Ok(change)
    }

    fn settle_job(&self, job: &Job, refund: Option<Transaction>) -> Result<Option<BalanceChange>> {
        let _guard = self.locks.lock(&job.user_id);

        let stored = self.get_job(&job.id)?.ok_or_else(|| StoreError::NotFound {
            entity: "job",
            id: job.id.to_string(),
        })?;
        if stored.is_terminal() {
            return Err(StoreError::JobAlreadySettled {
                job_id: job.id.to_string(),
                status: stored.status.as_str(),
            });
        }

        let mut batch = WriteBatch::default();
        let change = match refund {
            Some(refund) => {
                let mut account = self.load_account(&job.user_id)?;
                let change = self.stage_transaction(&mut batch, &mut account, refund)?;
                self.stage_account(&mut batch, &account)?;
                Some(change)
            }
            None => None,
        };
        self.stage_job(&mut batch, job)?;
        self.db.write(batch)?;

        Ok(change)
    }

    fn get_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        self.get_value(cf::JOBS, &keys::job_key(job_id))
    }

    fn list_jobs_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>> {
        let ids = self.scan_user_index(cf::JOBS_BY_USER, user_id, limit, offset)?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.get_job(&JobId::from_bytes(id))? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    fn list_pending_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let cf = self.cf(cf::PENDING_JOBS)?;

        let mut jobs = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            if jobs.len() >= limit {
                break;
            }
            let (key, _) = item?;
            let Some(id) = keys::id_from_key(&key) else {
                tracing::warn!(key_len = key.len(), "Skipping malformed pending job key");
                continue;
            };
            if let Some(job) = self.get_job(&JobId::from_bytes(id))? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}
