use std::sync::Arc;
use std::time::Duration;

use policy_store_core::{
    collect_model_records, load_record_into, AdapterError, PolicyAdapter, PolicyModel,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{CancelToken, SqliteRuleStore};

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

fn millis(deadline: Duration) -> u64 {
    u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX)
}

/// Async front of a [`SqliteRuleStore`] where every call carries a deadline.
///
/// Work runs on the blocking pool behind an async mutex, so calls are
/// serialized in arrival order. Each call gets its own cancellation token.
/// When the deadline expires before the work commits, the token is tripped:
/// the running statement aborts, no further statement starts, the transaction
/// rolls back and the caller gets [`AdapterError::Cancelled`]. `Cancelled`
/// therefore always means nothing was written.
///
/// Once the work has committed it can no longer be cancelled; the call then
/// waits for the work to finish and returns its real result. Plain blocking
/// code inside a [`Self::with_store`] closure is not interrupted, but any
/// store write it attempts after cancellation is refused.
#[derive(Clone)]
pub struct DeadlineAdapter {
    store: Arc<Mutex<SqliteRuleStore>>,
}

impl DeadlineAdapter {
    #[must_use]
    pub fn new(store: SqliteRuleStore) -> Self {
        Self { store: Arc::new(Mutex::new(store)) }
    }

    /// Run `work` against the store within `deadline`.
    ///
    /// # Errors
    /// Returns [`AdapterError::Cancelled`] when the deadline expires before
    /// anything commits, otherwise whatever `work` returns.
    pub async fn with_store<T, F>(&self, deadline: Duration, work: F) -> Result<T, AdapterError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteRuleStore) -> Result<T, AdapterError> + Send + 'static,
    {
        self.run("with_store", deadline, work).await
    }

    async fn run<T, F>(
        &self,
        operation: &'static str,
        deadline: Duration,
        work: F,
    ) -> Result<T, AdapterError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteRuleStore) -> Result<T, AdapterError> + Send + 'static,
    {
        let expires_at = Instant::now() + deadline;
        let lock = Arc::clone(&self.store).lock_owned();
        let Ok(mut guard) = tokio::time::timeout_at(expires_at, lock).await else {
            warn!(
                operation,
                deadline_ms = millis(deadline),
                "deadline expired waiting for the store"
            );
            return Err(AdapterError::Cancelled { operation });
        };

        let token = CancelToken::new();
        let worker_token = token.clone();
        let mut worker = tokio::task::spawn_blocking(move || {
            if worker_token.is_cancelled() {
                return Err(AdapterError::Cancelled { operation });
            }
            guard.install_cancel_token(worker_token);
            let result = work(&mut *guard);
            guard.clear_cancel_token();
            result
        });

        let joined = match tokio::time::timeout_at(expires_at, &mut worker).await {
            Ok(joined) => joined,
            Err(_elapsed) => {
                if token.cancel() {
                    warn!(
                        operation,
                        deadline_ms = millis(deadline),
                        "deadline expired; operation cancelled"
                    );
                    return Err(AdapterError::Cancelled { operation });
                }
                debug!(operation, "deadline expired after commit; waiting for the result");
                worker.await
            }
        };
        joined.map_err(|err| AdapterError::storage_all(operation, err))?
    }

    /// # Errors
    /// Returns a storage error, or `Cancelled` when the deadline expires.
    pub async fn load_policy(
        &self,
        deadline: Duration,
        model: &mut dyn PolicyModel,
    ) -> Result<(), AdapterError> {
        let records = self.run("load_policy", deadline, |store| store.load_records()).await?;
        for record in &records {
            load_record_into(model, record);
        }
        debug!(rows = records.len(), "loaded policy");
        Ok(())
    }

    /// # Errors
    /// Returns an encoding or storage error, or `Cancelled` when the deadline expires.
    pub async fn save_policy(
        &self,
        deadline: Duration,
        model: &dyn PolicyModel,
    ) -> Result<(), AdapterError> {
        let records = collect_model_records(model)?;
        self.run("save_policy", deadline, move |store| store.replace_all(&records)).await
    }

    /// # Errors
    /// Returns an encoding or storage error, or `Cancelled` when the deadline expires.
    pub async fn add_policy(
        &self,
        deadline: Duration,
        sec: &str,
        ptype: &str,
        rule: Vec<String>,
    ) -> Result<(), AdapterError> {
        let (sec, ptype) = (sec.to_string(), ptype.to_string());
        self.run("add_policy", deadline, move |store| store.add_policy(&sec, &ptype, &rule)).await
    }

    /// # Errors
    /// Returns an encoding or storage error, or `Cancelled` when the deadline expires.
    pub async fn add_policies(
        &self,
        deadline: Duration,
        sec: &str,
        ptype: &str,
        rules: Vec<Vec<String>>,
    ) -> Result<(), AdapterError> {
        let (sec, ptype) = (sec.to_string(), ptype.to_string());
        self.run("add_policies", deadline, move |store| store.add_policies(&sec, &ptype, &rules))
            .await
    }

    /// # Errors
    /// Returns an encoding or storage error, or `Cancelled` when the deadline expires.
    pub async fn remove_policy(
        &self,
        deadline: Duration,
        sec: &str,
        ptype: &str,
        rule: Vec<String>,
    ) -> Result<(), AdapterError> {
        let (sec, ptype) = (sec.to_string(), ptype.to_string());
        self.run("remove_policy", deadline, move |store| store.remove_policy(&sec, &ptype, &rule))
            .await
    }

    /// # Errors
    /// Returns an encoding or storage error, or `Cancelled` when the deadline expires.
    pub async fn remove_policies(
        &self,
        deadline: Duration,
        sec: &str,
        ptype: &str,
        rules: Vec<Vec<String>>,
    ) -> Result<(), AdapterError> {
        let (sec, ptype) = (sec.to_string(), ptype.to_string());
        self.run("remove_policies", deadline, move |store| {
            store.remove_policies(&sec, &ptype, &rules)
        })
        .await
    }

    /// # Errors
    /// Returns a storage error, or `Cancelled` when the deadline expires.
    pub async fn remove_filtered_policy(
        &self,
        deadline: Duration,
        sec: &str,
        ptype: &str,
        field_index: isize,
        field_values: Vec<String>,
    ) -> Result<(), AdapterError> {
        let (sec, ptype) = (sec.to_string(), ptype.to_string());
        self.run("remove_filtered_policy", deadline, move |store| {
            store.remove_filtered_policy(&sec, &ptype, field_index, &field_values)
        })
        .await
    }

    /// # Errors
    /// Returns an encoding or storage error, or `Cancelled` when the deadline expires.
    pub async fn update_policy(
        &self,
        deadline: Duration,
        sec: &str,
        ptype: &str,
        old_rule: Vec<String>,
        new_rule: Vec<String>,
    ) -> Result<(), AdapterError> {
        let (sec, ptype) = (sec.to_string(), ptype.to_string());
        self.run("update_policy", deadline, move |store| {
            store.update_policy(&sec, &ptype, &old_rule, &new_rule)
        })
        .await
    }

    /// # Errors
    /// Returns a mismatch, encoding or storage error, or `Cancelled` when the
    /// deadline expires.
    pub async fn update_policies(
        &self,
        deadline: Duration,
        sec: &str,
        ptype: &str,
        old_rules: Vec<Vec<String>>,
        new_rules: Vec<Vec<String>>,
    ) -> Result<(), AdapterError> {
        let (sec, ptype) = (sec.to_string(), ptype.to_string());
        self.run("update_policies", deadline, move |store| {
            store.update_policies(&sec, &ptype, &old_rules, &new_rules)
        })
        .await
    }

    /// # Errors
    /// Returns an encoding or storage error, or `Cancelled` when the deadline
    /// expires; the table is unchanged in every error case.
    pub async fn update_filtered_policies(
        &self,
        deadline: Duration,
        sec: &str,
        ptype: &str,
        new_rules: Vec<Vec<String>>,
        field_index: isize,
        field_values: Vec<String>,
    ) -> Result<Vec<Vec<String>>, AdapterError> {
        let (sec, ptype) = (sec.to_string(), ptype.to_string());
        self.run("update_filtered_policies", deadline, move |store| {
            store.update_filtered_policies(&sec, &ptype, &new_rules, field_index, &field_values)
        })
        .await
    }
}
