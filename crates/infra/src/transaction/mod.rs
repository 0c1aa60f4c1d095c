//! Write-only unit of work.
//!
//! A [`WriteOnlyTransaction`] buffers [`QueuedOperation`]s and applies all of
//! them in one repeatable-read transaction on [`commit`](WriteOnlyTransaction::commit).
//! Nothing touches the store before that.
//!
//! ## Commit failure mapping
//!
//! | Failure | Error | Store |
//! |---------|-------|-------|
//! | `begin` fails | [`CommitError::Begin`] | untouched |
//! | operation `i` fails | [`CommitError::Operation`] | rolled back |
//! | `commit` fails | [`CommitError::Commit`] | rolled back by the server |
//!
//! Commits are never retried.

mod operation;

pub use operation::QueuedOperation;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, instrument, warn};

use jobstore_core::JobId;

use crate::queue::QueueProviderCollection;
use crate::store::{
    AggregateTable, IsolationLevel, JobState, Mutation, SessionTransaction, StoreError,
    StoreSession,
};

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("could not begin the write transaction: {0}")]
    Begin(#[source] StoreError),

    #[error("write transaction operation #{index} ({kind} on '{target}') failed: {source}")]
    Operation {
        index: usize,
        kind: &'static str,
        target: String,
        #[source]
        source: StoreError,
    },

    #[error("could not commit the write transaction: {0}")]
    Commit(#[source] StoreError),
}

/// Buffered write operations committed atomically.
pub struct WriteOnlyTransaction<S: StoreSession> {
    session: S,
    queue_providers: Arc<QueueProviderCollection>,
    operations: Vec<QueuedOperation>,
}

impl<S: StoreSession> std::fmt::Debug for WriteOnlyTransaction<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteOnlyTransaction")
            .field("operations", &self.operations)
            .finish_non_exhaustive()
    }
}

impl<S: StoreSession> WriteOnlyTransaction<S> {
    pub fn new(session: S, queue_providers: Arc<QueueProviderCollection>) -> Self {
        Self {
            session,
            queue_providers,
            operations: Vec::new(),
        }
    }

    /// Append one operation to the buffer.
    pub fn enqueue(&mut self, operation: impl Into<QueuedOperation>) -> &mut Self {
        self.operations.push(operation.into());
        self
    }

    /// Buffered operations in commit order.
    pub fn operations(&self) -> &[QueuedOperation] {
        &self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Apply every buffered operation in order inside one transaction.
    #[instrument(skip(self), fields(operations = self.operations.len()), err)]
    pub async fn commit(self) -> Result<(), CommitError> {
        let mut tx = self
            .session
            .begin(IsolationLevel::RepeatableRead)
            .await
            .map_err(CommitError::Begin)?;

        for (index, operation) in self.operations.iter().enumerate() {
            if let Err(source) = self.apply(tx.as_mut(), operation).await {
                error!(
                    index,
                    kind = operation.kind(),
                    target = %operation.target(),
                    error = %source,
                    "write transaction failed, rolling back"
                );
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback after failed operation also failed");
                }
                return Err(CommitError::Operation {
                    index,
                    kind: operation.kind(),
                    target: operation.target(),
                    source,
                });
            }
        }

        tx.commit().await.map_err(CommitError::Commit)?;
        debug!("write transaction committed");
        Ok(())
    }

    async fn apply(
        &self,
        tx: &mut dyn SessionTransaction,
        operation: &QueuedOperation,
    ) -> Result<(), StoreError> {
        match operation {
            QueuedOperation::Mutation(mutation) => {
                tx.execute(mutation).await?;
            }
            QueuedOperation::AddToQueue { queue, job_id } => {
                let job_queue = self.queue_providers.provider_for(queue).job_queue();
                job_queue.enqueue(tx, queue, *job_id).await?;
            }
        }
        Ok(())
    }

    // Jobs

    pub fn expire_job(&mut self, job_id: JobId, expire_in: Duration) -> &mut Self {
        self.enqueue(Mutation::ExpireJob { job_id, expire_in })
    }

    pub fn persist_job(&mut self, job_id: JobId) -> &mut Self {
        self.enqueue(Mutation::PersistJob { job_id })
    }

    /// Record `state` and make it the job's current state.
    pub fn set_job_state(&mut self, job_id: JobId, state: JobState) -> &mut Self {
        self.enqueue(Mutation::SetJobState { job_id, state })
    }

    /// Record `state` in the job's history only.
    pub fn add_job_state(&mut self, job_id: JobId, state: JobState) -> &mut Self {
        self.enqueue(Mutation::AddJobState { job_id, state })
    }

    pub fn add_to_queue(&mut self, queue: impl Into<String>, job_id: JobId) -> &mut Self {
        self.enqueue(QueuedOperation::AddToQueue {
            queue: queue.into(),
            job_id,
        })
    }

    // Counters

    pub fn increment_counter(&mut self, key: impl Into<String>) -> &mut Self {
        self.counter(key, 1, None)
    }

    pub fn increment_counter_with_expiry(
        &mut self,
        key: impl Into<String>,
        expire_in: Duration,
    ) -> &mut Self {
        self.counter(key, 1, Some(expire_in))
    }

    pub fn decrement_counter(&mut self, key: impl Into<String>) -> &mut Self {
        self.counter(key, -1, None)
    }

    pub fn decrement_counter_with_expiry(
        &mut self,
        key: impl Into<String>,
        expire_in: Duration,
    ) -> &mut Self {
        self.counter(key, -1, Some(expire_in))
    }

    fn counter(
        &mut self,
        key: impl Into<String>,
        delta: i64,
        expire_in: Option<Duration>,
    ) -> &mut Self {
        self.enqueue(Mutation::InsertCounter {
            key: key.into(),
            delta,
            expire_in,
        })
    }

    // Sets

    pub fn add_to_set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.add_to_set_with_score(key, value, 0.0)
    }

    pub fn add_to_set_with_score(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        score: f64,
    ) -> &mut Self {
        self.enqueue(Mutation::UpsertSetMember {
            key: key.into(),
            value: value.into(),
            score,
        })
    }

    /// One upsert per value, each with score 0.
    pub fn add_range_to_set<I>(&mut self, key: impl Into<String>, values: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let key = key.into();
        for value in values {
            self.add_to_set(key.clone(), value);
        }
        self
    }

    pub fn remove_from_set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.enqueue(Mutation::RemoveSetMember {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn remove_set(&mut self, key: impl Into<String>) -> &mut Self {
        self.enqueue(Mutation::RemoveSet { key: key.into() })
    }

    // Lists

    pub fn insert_to_list(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.enqueue(Mutation::InsertListValue {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn remove_from_list(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.enqueue(Mutation::RemoveListValue {
            key: key.into(),
            value: value.into(),
        })
    }

    /// Keep only the entries ranked `keep_starting_from..=keep_ending_at`
    /// (0-based, insertion order). An inverted window keeps nothing.
    pub fn trim_list(
        &mut self,
        key: impl Into<String>,
        keep_starting_from: usize,
        keep_ending_at: usize,
    ) -> &mut Self {
        self.enqueue(Mutation::TrimList {
            key: key.into(),
            keep_starting_from,
            keep_ending_at,
        })
    }

    // Hashes

    /// One upsert per (field, value) pair.
    pub fn set_range_in_hash<I, F, V>(&mut self, key: impl Into<String>, pairs: I) -> &mut Self
    where
        I: IntoIterator<Item = (F, V)>,
        F: Into<String>,
        V: Into<String>,
    {
        let key = key.into();
        for (field, value) in pairs {
            self.enqueue(Mutation::UpsertHashField {
                key: key.clone(),
                field: field.into(),
                value: value.into(),
            });
        }
        self
    }

    pub fn remove_hash(&mut self, key: impl Into<String>) -> &mut Self {
        self.enqueue(Mutation::RemoveHash { key: key.into() })
    }

    // Expiry

    pub fn expire_set(&mut self, key: impl Into<String>, expire_in: Duration) -> &mut Self {
        self.expire(AggregateTable::Set, key, expire_in)
    }

    pub fn expire_list(&mut self, key: impl Into<String>, expire_in: Duration) -> &mut Self {
        self.expire(AggregateTable::List, key, expire_in)
    }

    pub fn expire_hash(&mut self, key: impl Into<String>, expire_in: Duration) -> &mut Self {
        self.expire(AggregateTable::Hash, key, expire_in)
    }

    pub fn persist_set(&mut self, key: impl Into<String>) -> &mut Self {
        self.persist(AggregateTable::Set, key)
    }

    pub fn persist_list(&mut self, key: impl Into<String>) -> &mut Self {
        self.persist(AggregateTable::List, key)
    }

    pub fn persist_hash(&mut self, key: impl Into<String>) -> &mut Self {
        self.persist(AggregateTable::Hash, key)
    }

    fn expire(
        &mut self,
        table: AggregateTable,
        key: impl Into<String>,
        expire_in: Duration,
    ) -> &mut Self {
        self.enqueue(Mutation::ExpireKey {
            table,
            key: key.into(),
            expire_in,
        })
    }

    fn persist(&mut self, table: AggregateTable, key: impl Into<String>) -> &mut Self {
        self.enqueue(Mutation::PersistKey {
            table,
            key: key.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::queue::{JobQueue, JobQueueProvider};
    use crate::store::InMemoryStore;

    fn transaction(store: &InMemoryStore) -> WriteOnlyTransaction<InMemoryStore> {
        WriteOnlyTransaction::new(store.clone(), Arc::new(QueueProviderCollection::default()))
    }

    #[tokio::test]
    async fn operations_are_buffered_until_commit() {
        let store = InMemoryStore::new();
        let mut tx = transaction(&store);
        tx.insert_to_list("log", "a")
            .increment_counter("stats:succeeded")
            .set_range_in_hash("recurring-job:nightly", [("Cron", "0 0 * * *"), ("Queue", "default")]);

        assert_eq!(tx.operations().len(), 4);
        assert_eq!(tx.operations()[2].kind(), "upsert_hash_field");
        assert_eq!(store.snapshot().await, Default::default());

        tx.commit().await.unwrap();
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.list_values("log"), vec!["a"]);
        assert_eq!(snapshot.counter_value("stats:succeeded"), 1);
        assert_eq!(snapshot.hash("recurring-job:nightly").get("Queue"), Some(&"default"));
    }

    #[tokio::test]
    async fn empty_transaction_commits() {
        let store = InMemoryStore::new();
        let tx = transaction(&store);
        assert!(tx.is_empty());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn operations_apply_in_order() {
        let store = InMemoryStore::new();
        let mut tx = transaction(&store);
        for value in ["a", "b", "c"] {
            tx.insert_to_list("log", value);
        }
        tx.trim_list("log", 1, 5).insert_to_list("log", "d");
        tx.commit().await.unwrap();

        assert_eq!(store.snapshot().await.list_values("log"), vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn failing_operation_rolls_back_everything() {
        let store = InMemoryStore::new();
        let mut seed = transaction(&store);
        seed.add_to_set("tags", "existing");
        seed.commit().await.unwrap();
        let before = store.snapshot().await;

        store.fail_when(|m| matches!(m, Mutation::TrimList { .. }));
        let mut tx = transaction(&store);
        tx.add_to_set("tags", "new")
            .increment_counter("stats:deleted")
            .trim_list("history", 0, 10)
            .insert_to_list("history", "never");

        let err = tx.commit().await.unwrap_err();
        match err {
            CommitError::Operation {
                index, kind, target, ..
            } => {
                assert_eq!(index, 2);
                assert_eq!(kind, "trim_list");
                assert_eq!(target, "history");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.snapshot().await, before);
    }

    #[tokio::test]
    async fn state_for_missing_job_fails_the_commit() {
        let store = InMemoryStore::new();
        let job = store.create_job().await;

        let mut tx = transaction(&store);
        tx.set_job_state(job, JobState::new("Enqueued"))
            .set_job_state(JobId::new(999), JobState::new("Enqueued"));
        let err = tx.commit().await.unwrap_err();

        assert!(err.to_string().contains("job:999"));
        let snapshot = store.snapshot().await;
        assert!(snapshot.states_for(job).is_empty());
        assert_eq!(snapshot.job(job).and_then(|j| j.state_name.clone()), None);
    }

    #[tokio::test]
    async fn job_state_and_expiry() {
        let store = InMemoryStore::new();
        let job = store.create_job().await;

        let mut tx = transaction(&store);
        tx.add_job_state(job, JobState::new("Processing"))
            .set_job_state(job, JobState::new("Succeeded").with_reason("done"))
            .expire_job(job, Duration::from_secs(3600));
        tx.commit().await.unwrap();

        let snapshot = store.snapshot().await;
        let row = snapshot.job(job).unwrap();
        assert_eq!(row.state_name.as_deref(), Some("Succeeded"));
        assert!(row.expire_at.is_some());
        assert_eq!(snapshot.states_for(job).len(), 2);

        let mut tx = transaction(&store);
        tx.persist_job(job);
        tx.commit().await.unwrap();
        assert!(store.snapshot().await.job(job).unwrap().expire_at.is_none());
    }

    #[tokio::test]
    async fn key_expiry_applies_to_every_row_of_the_key() {
        let store = InMemoryStore::new();
        let mut tx = transaction(&store);
        tx.add_range_to_set("tags", ["a", "b"])
            .add_to_set("other", "c")
            .expire_set("tags", Duration::from_secs(60));
        tx.commit().await.unwrap();

        let snapshot = store.snapshot().await;
        assert!(snapshot.set_members("tags").iter().all(|s| s.expire_at.is_some()));
        assert!(snapshot.set_members("other")[0].expire_at.is_none());

        let mut tx = transaction(&store);
        tx.persist_set("tags").remove_from_set("tags", "a").remove_set("other");
        tx.commit().await.unwrap();

        let snapshot = store.snapshot().await;
        let tags = snapshot.set_members("tags");
        assert_eq!(tags.len(), 1);
        assert!(tags[0].expire_at.is_none());
        assert!(snapshot.set_members("other").is_empty());
    }

    struct RecordingQueue {
        seen: Arc<Mutex<Vec<(String, JobId)>>>,
    }

    #[async_trait]
    impl JobQueue for RecordingQueue {
        async fn enqueue(
            &self,
            _tx: &mut dyn SessionTransaction,
            queue: &str,
            job_id: JobId,
        ) -> Result<(), StoreError> {
            self.seen.lock().unwrap().push((queue.to_string(), job_id));
            Ok(())
        }
    }

    struct RecordingProvider {
        seen: Arc<Mutex<Vec<(String, JobId)>>>,
    }

    impl JobQueueProvider for RecordingProvider {
        fn job_queue(&self) -> Arc<dyn JobQueue> {
            Arc::new(RecordingQueue {
                seen: self.seen.clone(),
            })
        }
    }

    #[tokio::test]
    async fn queue_pushes_go_to_the_registered_provider() {
        let store = InMemoryStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut providers = QueueProviderCollection::default();
        providers
            .add(Arc::new(RecordingProvider { seen: seen.clone() }), ["external"])
            .unwrap();

        let mut tx = WriteOnlyTransaction::new(store.clone(), Arc::new(providers));
        tx.add_to_queue("external", JobId::new(1))
            .add_to_queue("default", JobId::new(2));
        tx.commit().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![("external".to_string(), JobId::new(1))]);
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.queued_jobs("default"), vec![JobId::new(2)]);
        assert!(snapshot.queued_jobs("external").is_empty());
    }
}
