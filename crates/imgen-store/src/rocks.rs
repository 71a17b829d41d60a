//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};
use tracing::debug;

use imgen_core::{
    normalize_match_token, CreditSource, CreditTransaction, EventKey, GenerationJob, JobId,
    JobState, JobTransition, LedgerAccount, LedgerEffect, PaymentIntent, PaymentIntentId,
    PaymentState, ProcessedEventRecord, TransactionId, TransactionType, UserId,
};

use crate::error::{Result, StoreError};
use crate::keys::{self, lock};
use crate::locks::KeyedLocks;
use crate::schema::{all_column_families, cf};
use crate::{IntentTransition, Store};

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    locks: KeyedLocks,
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

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(StoreError::db)?;

        Ok(Self {
            db: Arc::new(db),
            locks: KeyedLocks::new(),
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

    fn read<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(StoreError::db)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn read_raw(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(cf_name)?;
        self.db.get_cf(&cf, key).map_err(StoreError::db)
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db.write(batch).map_err(StoreError::db)
    }

    /// All keys of an index column family, in key order.
    fn index_keys(&self, cf_name: &str) -> Result<Vec<Vec<u8>>> {
        let cf = self.cf(cf_name)?;
        self.db
            .iterator_cf(&cf, IteratorMode::Start)
            .map(|item| item.map(|(key, _)| key.to_vec()).map_err(StoreError::db))
            .collect()
    }

    /// Add an account update and its history entry to `batch`.
    fn stage_ledger(
        &self,
        batch: &mut WriteBatch,
        account: &LedgerAccount,
        transaction: &CreditTransaction,
    ) -> Result<()> {
        let cf_accounts = self.cf(cf::ACCOUNTS)?;
        let cf_tx = self.cf(cf::TRANSACTIONS)?;
        let cf_tx_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;

        batch.put_cf(
            &cf_accounts,
            keys::account_key(&account.user_id),
            Self::serialize(account)?,
        );
        batch.put_cf(
            &cf_tx,
            keys::transaction_key(&transaction.id),
            Self::serialize(transaction)?,
        );
        batch.put_cf(
            &cf_tx_by_user,
            keys::user_transaction_key(&account.user_id, &transaction.id),
            [],
        );
        Ok(())
    }

    fn stage_event(&self, batch: &mut WriteBatch, event: &EventKey) -> Result<()> {
        let cf_events = self.cf(cf::PROCESSED_EVENTS)?;
        let record = ProcessedEventRecord::new(event.clone());
        batch.put_cf(&cf_events, keys::event_key(event), Self::serialize(&record)?);
        Ok(())
    }

    /// Run one ledger operation under the account lock and persist it with
    /// its history entry.
    fn apply_ledger_op<F>(
        &self,
        user_id: &UserId,
        transaction_type: TransactionType,
        amount: i64,
        reference: Option<&str>,
        apply: F,
    ) -> Result<LedgerAccount>
    where
        F: FnOnce(&mut LedgerAccount) -> imgen_core::Result<()>,
    {
        if amount <= 0 {
            return Err(StoreError::InvalidAmount(amount));
        }
        let _guard = self.locks.lock(lock::account(user_id));

        let mut account = match self.get_account(user_id)? {
            Some(account) => account,
            None => match transaction_type {
                TransactionType::Purchase | TransactionType::Grant => LedgerAccount::new(*user_id),
                TransactionType::Hold => {
                    return Err(StoreError::InsufficientCredits {
                        available: 0,
                        required: amount,
                    })
                }
                TransactionType::Release | TransactionType::Settle => {
                    return Err(StoreError::LedgerInvariant(format!(
                        "no account for {user_id} to take held credits from"
                    )))
                }
            },
        };
        apply(&mut account)?;

        let transaction = CreditTransaction::record(
            &account,
            transaction_type,
            amount,
            reference.map(str::to_owned),
            describe(transaction_type),
        );
        let mut batch = WriteBatch::default();
        self.stage_ledger(&mut batch, &account, &transaction)?;
        self.write(batch)?;

        debug!(
            user_id = %user_id,
            kind = transaction_type.as_str(),
            amount,
            balance = account.balance,
            held = account.held,
            "ledger updated"
        );
        Ok(account)
    }

    fn get_intent_by_id_bytes(&self, bytes: &[u8]) -> Result<Option<PaymentIntent>> {
        let intent_id = keys::intent_id_from_bytes(bytes)?;
        self.get_payment_intent(&intent_id)
    }
}

fn describe(transaction_type: TransactionType) -> &'static str {
    match transaction_type {
        TransactionType::Hold => "Hold for generation job",
        TransactionType::Release => "Hold released",
        TransactionType::Settle => "Generation charged",
        TransactionType::Purchase => "Payment received",
        TransactionType::Grant => "Credits granted",
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Ledger Operations
    // =========================================================================

    fn get_account(&self, user_id: &UserId) -> Result<Option<LedgerAccount>> {
        self.read(cf::ACCOUNTS, &keys::account_key(user_id))
    }

    fn open_account(&self, user_id: &UserId) -> Result<LedgerAccount> {
        let _guard = self.locks.lock(lock::account(user_id));
        if let Some(account) = self.get_account(user_id)? {
            return Ok(account);
        }

        let account = LedgerAccount::new(*user_id);
        let cf = self.cf(cf::ACCOUNTS)?;
        self.db
            .put_cf(&cf, keys::account_key(user_id), Self::serialize(&account)?)
            .map_err(StoreError::db)?;
        debug!(user_id = %user_id, "account opened");
        Ok(account)
    }

    fn hold(&self, user_id: &UserId, amount: i64, reference: Option<&str>) -> Result<LedgerAccount> {
        self.apply_ledger_op(user_id, TransactionType::Hold, amount, reference, |account| {
            account.hold(amount)
        })
    }

    fn release_hold(
        &self,
        user_id: &UserId,
        amount: i64,
        reference: Option<&str>,
    ) -> Result<LedgerAccount> {
        self.apply_ledger_op(user_id, TransactionType::Release, amount, reference, |account| {
            account.release_hold(amount)
        })
    }

    fn settle_hold(
        &self,
        user_id: &UserId,
        amount: i64,
        reference: Option<&str>,
    ) -> Result<LedgerAccount> {
        self.apply_ledger_op(user_id, TransactionType::Settle, amount, reference, |account| {
            account.settle_hold(amount)
        })
    }

    fn credit(
        &self,
        user_id: &UserId,
        amount: i64,
        source: CreditSource,
        reference: Option<&str>,
    ) -> Result<LedgerAccount> {
        let transaction_type = match source {
            CreditSource::Payment => TransactionType::Purchase,
            CreditSource::Grant => TransactionType::Grant,
        };
        self.apply_ledger_op(user_id, transaction_type, amount, reference, |account| {
            account.credit(amount, source)
        })
    }

    // =========================================================================
    // Transaction Operations
    // =========================================================================

    fn get_transaction(&self, transaction_id: &TransactionId) -> Result<Option<CreditTransaction>> {
        self.read(cf::TRANSACTIONS, &keys::transaction_key(transaction_id))
    }

    fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let cf_by_user = self.cf(cf::TRANSACTIONS_BY_USER)?;
        let prefix = keys::user_transactions_prefix(user_id);

        let iter = self.db.iterator_cf(
            &cf_by_user,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );

        // ULID suffixes keep one user's keys in time order.
        let mut all_keys: Vec<Vec<u8>> = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(StoreError::db)?;
            if !key.starts_with(&prefix) {
                break;
            }
            all_keys.push(key.to_vec());
        }

        let mut transactions = Vec::new();
        for key in all_keys.iter().rev().skip(offset).take(limit) {
            let tx_id = keys::extract_transaction_id_from_user_key(key)?;
            if let Some(tx) = self.get_transaction(&tx_id)? {
                transactions.push(tx);
            }
        }

        Ok(transactions)
    }

    // =========================================================================
    // Job Operations
    // =========================================================================

    fn create_job(&self, job: &GenerationJob) -> Result<LedgerAccount> {
        if job.state != JobState::Created {
            return Err(StoreError::InvalidInput(format!(
                "new jobs must be created, not {}",
                job.state.as_str()
            )));
        }
        let _guard = self
            .locks
            .lock_many(vec![lock::account(&job.owner_id), lock::job(&job.id)]);

        if self.get_job(&job.id)?.is_some() {
            return Err(StoreError::AlreadyExists {
                entity: "job",
                id: job.id.to_string(),
            });
        }

        let mut account =
            self.get_account(&job.owner_id)?
                .ok_or(StoreError::InsufficientCredits {
                    available: 0,
                    required: job.cost_estimate,
                })?;
        account.hold(job.cost_estimate)?;

        let transaction = CreditTransaction::record(
            &account,
            TransactionType::Hold,
            job.cost_estimate,
            Some(job.id.to_string()),
            describe(TransactionType::Hold),
        );

        let cf_jobs = self.cf(cf::JOBS)?;
        let cf_live = self.cf(cf::LIVE_JOBS)?;
        let job_key = keys::job_key(&job.id);

        let mut batch = WriteBatch::default();
        self.stage_ledger(&mut batch, &account, &transaction)?;
        batch.put_cf(&cf_jobs, &job_key, Self::serialize(job)?);
        batch.put_cf(&cf_live, &job_key, []);
        self.write(batch)?;

        debug!(
            job_id = %job.id,
            user_id = %job.owner_id,
            cost = job.cost_estimate,
            balance = account.balance,
            "job created with hold"
        );
        Ok(account)
    }

    fn get_job(&self, job_id: &JobId) -> Result<Option<GenerationJob>> {
        self.read(cf::JOBS, &keys::job_key(job_id))
    }

    fn get_job_by_task(&self, provider: &str, task_id: &str) -> Result<Option<GenerationJob>> {
        match self.read_raw(cf::JOBS_BY_TASK, &keys::task_key(provider, task_id))? {
            Some(bytes) => self.get_job(&keys::job_id_from_bytes(&bytes)?),
            None => Ok(None),
        }
    }

    fn transition_job(
        &self,
        job_id: &JobId,
        from: JobState,
        transition: &JobTransition,
        event: Option<&EventKey>,
    ) -> Result<GenerationJob> {
        // The owner never changes, so it can be read before locking.
        let owner_id = self
            .get_job(job_id)?
            .ok_or_else(|| StoreError::not_found("job", job_id))?
            .owner_id;

        let mut lock_keys = vec![lock::job(job_id), lock::account(&owner_id)];
        if let Some(event) = event {
            lock_keys.push(lock::event(event));
        }
        let _guard = self.locks.lock_many(lock_keys);

        let mut job = self
            .get_job(job_id)?
            .ok_or_else(|| StoreError::not_found("job", job_id))?;
        if job.state != from {
            return Err(StoreError::StaleTransition {
                entity: "job",
                expected: from.as_str(),
                actual: job.state.as_str(),
            });
        }
        if let Some(event) = event {
            if self.has_event(event)? {
                return Err(StoreError::DuplicateEvent {
                    event_id: event.external_id.clone(),
                });
            }
        }

        let previous_task = job.provider_task_id.clone();
        let effect = job.apply(transition, Utc::now())?;

        let cf_jobs = self.cf(cf::JOBS)?;
        let job_key = keys::job_key(job_id);
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_jobs, &job_key, Self::serialize(&job)?);

        if job.provider_task_id != previous_task {
            if let Some(task_id) = &job.provider_task_id {
                let cf_by_task = self.cf(cf::JOBS_BY_TASK)?;
                batch.put_cf(
                    &cf_by_task,
                    keys::task_key(&job.provider, task_id),
                    job_id.to_bytes(),
                );
            }
        }
        if job.state.is_terminal() {
            let cf_live = self.cf(cf::LIVE_JOBS)?;
            batch.delete_cf(&cf_live, &job_key);
        }

        let ledger_change = match effect {
            LedgerEffect::None => None,
            LedgerEffect::Settle(amount) => Some((TransactionType::Settle, amount)),
            LedgerEffect::Release(amount) => Some((TransactionType::Release, amount)),
        };
        if let Some((transaction_type, amount)) = ledger_change {
            let mut account = self.get_account(&owner_id)?.ok_or_else(|| {
                StoreError::LedgerInvariant(format!("job {job_id} holds credits of missing account"))
            })?;
            if transaction_type == TransactionType::Settle {
                account.settle_hold(amount)?;
            } else {
                account.release_hold(amount)?;
            }
            let transaction = CreditTransaction::record(
                &account,
                transaction_type,
                amount,
                Some(job_id.to_string()),
                describe(transaction_type),
            );
            self.stage_ledger(&mut batch, &account, &transaction)?;
        }

        if let Some(event) = event {
            self.stage_event(&mut batch, event)?;
        }
        self.write(batch)?;

        debug!(
            job_id = %job_id,
            from = from.as_str(),
            to = job.state.as_str(),
            "job transitioned"
        );
        Ok(job)
    }

    fn list_live_jobs(&self) -> Result<Vec<GenerationJob>> {
        let mut jobs = Vec::new();
        for key in self.index_keys(cf::LIVE_JOBS)? {
            if let Some(job) = self.get_job(&keys::job_id_from_bytes(&key)?)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    // =========================================================================
    // Payment Intent Operations
    // =========================================================================

    fn create_payment_intent(&self, intent: &PaymentIntent) -> Result<()> {
        if normalize_match_token(&intent.match_token).as_deref() != Some(&intent.match_token) {
            return Err(StoreError::InvalidInput(format!(
                "match token is not normalized: {}",
                intent.match_token
            )));
        }
        let _guard = self.locks.lock_many(vec![
            lock::token(&intent.match_token),
            lock::intent(&intent.id),
        ]);

        let token_key = keys::token_key(&intent.match_token);
        if self.read_raw(cf::INTENTS_BY_TOKEN, &token_key)?.is_some() {
            return Err(StoreError::AlreadyExists {
                entity: "match token",
                id: intent.match_token.clone(),
            });
        }

        let cf_intents = self.cf(cf::PAYMENT_INTENTS)?;
        let cf_by_token = self.cf(cf::INTENTS_BY_TOKEN)?;
        let cf_open = self.cf(cf::OPEN_INTENTS)?;
        let intent_key = keys::intent_key(&intent.id);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_intents, &intent_key, Self::serialize(intent)?);
        batch.put_cf(&cf_by_token, &token_key, intent.id.to_bytes());
        if !intent.state.is_terminal() {
            batch.put_cf(&cf_open, &intent_key, []);
        }
        self.write(batch)?;

        debug!(
            intent_id = %intent.id,
            user_id = %intent.owner_id,
            amount = intent.expected_amount,
            "payment intent created"
        );
        Ok(())
    }

    fn get_payment_intent(&self, intent_id: &PaymentIntentId) -> Result<Option<PaymentIntent>> {
        self.read(cf::PAYMENT_INTENTS, &keys::intent_key(intent_id))
    }

    fn get_payment_intent_by_token(&self, match_token: &str) -> Result<Option<PaymentIntent>> {
        let Some(token) = normalize_match_token(match_token) else {
            return Ok(None);
        };
        match self.read_raw(cf::INTENTS_BY_TOKEN, &keys::token_key(&token))? {
            Some(bytes) => self.get_intent_by_id_bytes(&bytes),
            None => Ok(None),
        }
    }

    fn transition_payment_intent(
        &self,
        intent_id: &PaymentIntentId,
        from: PaymentState,
        transition: &IntentTransition,
    ) -> Result<PaymentIntent> {
        let mut lock_keys = vec![lock::intent(intent_id)];
        if let Some(event) = &transition.event {
            lock_keys.push(lock::event(event));
        }
        let _guard = self.locks.lock_many(lock_keys);

        let mut intent = self
            .get_payment_intent(intent_id)?
            .ok_or_else(|| StoreError::not_found("payment intent", intent_id))?;
        if intent.state != from {
            return Err(StoreError::StaleTransition {
                entity: "payment intent",
                expected: from.as_str(),
                actual: intent.state.as_str(),
            });
        }
        if let Some(event) = &transition.event {
            if self.has_event(event)? {
                return Err(StoreError::DuplicateEvent {
                    event_id: event.external_id.clone(),
                });
            }
        }

        intent.transition(transition.to, Utc::now())?;
        if let Some(event) = &transition.event {
            intent.matched_event_id = Some(event.external_id.clone());
        }
        if transition.received_amount.is_some() {
            intent.received_amount = transition.received_amount;
        }

        let cf_intents = self.cf(cf::PAYMENT_INTENTS)?;
        let intent_key = keys::intent_key(intent_id);
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_intents, &intent_key, Self::serialize(&intent)?);
        if intent.state.is_terminal() {
            let cf_open = self.cf(cf::OPEN_INTENTS)?;
            batch.delete_cf(&cf_open, &intent_key);
        }
        if let Some(event) = &transition.event {
            self.stage_event(&mut batch, event)?;
        }
        self.write(batch)?;

        debug!(
            intent_id = %intent_id,
            from = from.as_str(),
            to = intent.state.as_str(),
            "payment intent transitioned"
        );
        Ok(intent)
    }

    fn complete_payment_intent(
        &self,
        intent_id: &PaymentIntentId,
    ) -> Result<(PaymentIntent, LedgerAccount)> {
        let owner_id = self
            .get_payment_intent(intent_id)?
            .ok_or_else(|| StoreError::not_found("payment intent", intent_id))?
            .owner_id;
        let _guard = self
            .locks
            .lock_many(vec![lock::intent(intent_id), lock::account(&owner_id)]);

        let mut intent = self
            .get_payment_intent(intent_id)?
            .ok_or_else(|| StoreError::not_found("payment intent", intent_id))?;
        if intent.state != PaymentState::Matched {
            return Err(StoreError::StaleTransition {
                entity: "payment intent",
                expected: PaymentState::Matched.as_str(),
                actual: intent.state.as_str(),
            });
        }
        intent.transition(PaymentState::Completed, Utc::now())?;

        let mut account = self
            .get_account(&owner_id)?
            .unwrap_or_else(|| LedgerAccount::new(owner_id));
        account.credit(intent.expected_amount, CreditSource::Payment)?;
        let transaction = CreditTransaction::record(
            &account,
            TransactionType::Purchase,
            intent.expected_amount,
            Some(intent_id.to_string()),
            describe(TransactionType::Purchase),
        );

        let cf_intents = self.cf(cf::PAYMENT_INTENTS)?;
        let cf_open = self.cf(cf::OPEN_INTENTS)?;
        let intent_key = keys::intent_key(intent_id);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_intents, &intent_key, Self::serialize(&intent)?);
        batch.delete_cf(&cf_open, &intent_key);
        self.stage_ledger(&mut batch, &account, &transaction)?;
        self.write(batch)?;

        debug!(
            intent_id = %intent_id,
            user_id = %owner_id,
            amount = intent.expected_amount,
            balance = account.balance,
            "payment intent completed"
        );
        Ok((intent, account))
    }

    fn list_open_intents(&self) -> Result<Vec<PaymentIntent>> {
        let mut intents = Vec::new();
        for key in self.index_keys(cf::OPEN_INTENTS)? {
            if let Some(intent) = self.get_intent_by_id_bytes(&key)? {
                intents.push(intent);
            }
        }
        Ok(intents)
    }

    // =========================================================================
    // Idempotency Guard
    // =========================================================================

    fn record_event(&self, event: &EventKey) -> Result<bool> {
        let _guard = self.locks.lock(lock::event(event));
        if self.has_event(event)? {
            return Ok(false);
        }
        let mut batch = WriteBatch::default();
        self.stage_event(&mut batch, event)?;
        self.write(batch)?;
        Ok(true)
    }

    fn has_event(&self, event: &EventKey) -> Result<bool> {
        Ok(self
            .read_raw(cf::PROCESSED_EVENTS, &keys::event_key(event))?
            .is_some())
    }

    fn get_event(&self, event: &EventKey) -> Result<Option<ProcessedEventRecord>> {
        self.read(cf::PROCESSED_EVENTS, &keys::event_key(event))
    }
}
