//! In-memory store gateway.
//!
//! Holds every job storage table in process memory with the statement
//! semantics of the Postgres gateway. Supports injected faults and table
//! snapshots for tests.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use jobstore_core::JobId;

use super::gateway::{IsolationLevel, SessionTransaction, StoreError, StoreSession};
use super::mutation::{AggregateTable, Mutation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRow {
    pub resource: String,
    pub update_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterRow {
    pub id: i64,
    pub key: String,
    pub value: i64,
    pub expire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetRow {
    pub id: i64,
    pub key: String,
    pub value: String,
    pub score: f64,
    pub expire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRow {
    pub id: i64,
    pub key: String,
    pub value: String,
    pub expire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRow {
    pub id: i64,
    pub key: String,
    pub field: String,
    pub value: String,
    pub expire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRow {
    pub id: JobId,
    pub state_id: Option<i64>,
    pub state_name: Option<String>,
    pub expire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRow {
    pub id: i64,
    pub job_id: JobId,
    pub name: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQueueRow {
    pub id: i64,
    pub job_id: JobId,
    pub queue: String,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Point-in-time copy of every table held by an [`InMemoryStore`].
///
/// Rows of each table are kept in ascending id order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub locks: Vec<LockRow>,
    pub counters: Vec<CounterRow>,
    pub sets: Vec<SetRow>,
    pub lists: Vec<ListRow>,
    pub hashes: Vec<HashRow>,
    pub jobs: Vec<JobRow>,
    pub states: Vec<StateRow>,
    pub job_queue: Vec<JobQueueRow>,
    last_id: i64,
}

impl StoreSnapshot {
    pub fn lock(&self, resource: &str) -> Option<&LockRow> {
        self.locks.iter().find(|l| l.resource == resource)
    }

    /// Sum of every delta row recorded for `key`.
    pub fn counter_value(&self, key: &str) -> i64 {
        self.counters
            .iter()
            .filter(|c| c.key == key)
            .map(|c| c.value)
            .sum()
    }

    pub fn set_members(&self, key: &str) -> Vec<&SetRow> {
        self.sets.iter().filter(|s| s.key == key).collect()
    }

    pub fn list_values(&self, key: &str) -> Vec<&str> {
        self.lists
            .iter()
            .filter(|l| l.key == key)
            .map(|l| l.value.as_str())
            .collect()
    }

    pub fn hash(&self, key: &str) -> BTreeMap<&str, &str> {
        self.hashes
            .iter()
            .filter(|h| h.key == key)
            .map(|h| (h.field.as_str(), h.value.as_str()))
            .collect()
    }

    pub fn job(&self, job_id: JobId) -> Option<&JobRow> {
        self.jobs.iter().find(|j| j.id == job_id)
    }

    pub fn states_for(&self, job_id: JobId) -> Vec<&StateRow> {
        self.states.iter().filter(|s| s.job_id == job_id).collect()
    }

    pub fn queued_jobs(&self, queue: &str) -> Vec<JobId> {
        self.job_queue
            .iter()
            .filter(|q| q.queue == queue)
            .map(|q| q.job_id)
            .collect()
    }

    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn ensure_job(&self, operation: &str, job_id: JobId) -> Result<(), StoreError> {
        if self.job(job_id).is_none() {
            return Err(StoreError::database(
                operation,
                Some("23503"),
                format!("job {job_id} does not exist"),
            ));
        }
        Ok(())
    }

    /// Apply one statement. Validation happens before any row is touched, so a
    /// failed statement leaves the tables unchanged.
    fn apply(&mut self, mutation: &Mutation, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let op = mutation.kind();
        let affected = match mutation {
            Mutation::InsertLock {
                resource,
                update_count,
            } => {
                if self.lock(resource).is_some() {
                    0
                } else {
                    self.locks.push(LockRow {
                        resource: resource.clone(),
                        update_count: *update_count,
                    });
                    1
                }
            }
            Mutation::ClaimLock { resource } => {
                match self
                    .locks
                    .iter_mut()
                    .find(|l| &l.resource == resource && l.update_count == 0)
                {
                    Some(row) => {
                        row.update_count = 1;
                        1
                    }
                    None => 0,
                }
            }
            Mutation::DeleteLock { resource } => {
                retain_counting(&mut self.locks, |l| &l.resource != resource)
            }
            Mutation::ExpireJob { job_id, expire_in } => {
                let at = expires_at(op, now, *expire_in)?;
                match self.jobs.iter_mut().find(|j| j.id == *job_id) {
                    Some(job) => {
                        job.expire_at = Some(at);
                        1
                    }
                    None => 0,
                }
            }
            Mutation::PersistJob { job_id } => match self.jobs.iter_mut().find(|j| j.id == *job_id) {
                Some(job) => {
                    job.expire_at = None;
                    1
                }
                None => 0,
            },
            Mutation::SetJobState { job_id, state } | Mutation::AddJobState { job_id, state } => {
                self.ensure_job(op, *job_id)?;
                let id = self.next_id();
                self.states.push(StateRow {
                    id,
                    job_id: *job_id,
                    name: state.name.clone(),
                    reason: state.reason.clone(),
                    created_at: now,
                    data: state.data.clone(),
                });
                if matches!(mutation, Mutation::SetJobState { .. }) {
                    if let Some(job) = self.jobs.iter_mut().find(|j| j.id == *job_id) {
                        job.state_id = Some(id);
                        job.state_name = Some(state.name.clone());
                    }
                }
                1
            }
            Mutation::EnqueueJob { queue, job_id } => {
                let id = self.next_id();
                self.job_queue.push(JobQueueRow {
                    id,
                    job_id: *job_id,
                    queue: queue.clone(),
                    fetched_at: None,
                });
                1
            }
            Mutation::InsertCounter {
                key,
                delta,
                expire_in,
            } => {
                let expire_at = expire_in.map(|d| expires_at(op, now, d)).transpose()?;
                let id = self.next_id();
                self.counters.push(CounterRow {
                    id,
                    key: key.clone(),
                    value: *delta,
                    expire_at,
                });
                1
            }
            Mutation::UpsertSetMember { key, value, score } => {
                match self
                    .sets
                    .iter_mut()
                    .find(|s| &s.key == key && &s.value == value)
                {
                    Some(row) => row.score = *score,
                    None => {
                        let id = self.next_id();
                        self.sets.push(SetRow {
                            id,
                            key: key.clone(),
                            value: value.clone(),
                            score: *score,
                            expire_at: None,
                        });
                    }
                }
                1
            }
            Mutation::RemoveSetMember { key, value } => {
                retain_counting(&mut self.sets, |s| !(&s.key == key && &s.value == value))
            }
            Mutation::RemoveSet { key } => retain_counting(&mut self.sets, |s| &s.key != key),
            Mutation::InsertListValue { key, value } => {
                let id = self.next_id();
                self.lists.push(ListRow {
                    id,
                    key: key.clone(),
                    value: value.clone(),
                    expire_at: None,
                });
                1
            }
            Mutation::RemoveListValue { key, value } => {
                retain_counting(&mut self.lists, |l| !(&l.key == key && &l.value == value))
            }
            Mutation::TrimList {
                key,
                keep_starting_from,
                keep_ending_at,
            } => {
                let mut rank = 0usize;
                retain_counting(&mut self.lists, |l| {
                    if &l.key != key {
                        return true;
                    }
                    let keep = rank >= *keep_starting_from && rank <= *keep_ending_at;
                    rank += 1;
                    keep
                })
            }
            Mutation::UpsertHashField { key, field, value } => {
                match self
                    .hashes
                    .iter_mut()
                    .find(|h| &h.key == key && &h.field == field)
                {
                    Some(row) => row.value = value.clone(),
                    None => {
                        let id = self.next_id();
                        self.hashes.push(HashRow {
                            id,
                            key: key.clone(),
                            field: field.clone(),
                            value: value.clone(),
                            expire_at: None,
                        });
                    }
                }
                1
            }
            Mutation::RemoveHash { key } => retain_counting(&mut self.hashes, |h| &h.key != key),
            Mutation::ExpireKey {
                table,
                key,
                expire_in,
            } => {
                let at = expires_at(op, now, *expire_in)?;
                self.set_key_expiry(*table, key, Some(at))
            }
            Mutation::PersistKey { table, key } => self.set_key_expiry(*table, key, None),
        };
        Ok(affected)
    }

    fn set_key_expiry(
        &mut self,
        table: AggregateTable,
        key: &str,
        expire_at: Option<DateTime<Utc>>,
    ) -> u64 {
        fn update<'a>(rows: impl Iterator<Item = &'a mut Option<DateTime<Utc>>>, at: Option<DateTime<Utc>>) -> u64 {
            rows.fold(0, |n, slot| {
                *slot = at;
                n + 1
            })
        }

        match table {
            AggregateTable::Set => update(
                self.sets.iter_mut().filter(|r| r.key == key).map(|r| &mut r.expire_at),
                expire_at,
            ),
            AggregateTable::List => update(
                self.lists.iter_mut().filter(|r| r.key == key).map(|r| &mut r.expire_at),
                expire_at,
            ),
            AggregateTable::Hash => update(
                self.hashes.iter_mut().filter(|r| r.key == key).map(|r| &mut r.expire_at),
                expire_at,
            ),
        }
    }
}

fn retain_counting<T>(rows: &mut Vec<T>, mut keep: impl FnMut(&T) -> bool) -> u64 {
    let before = rows.len();
    rows.retain(|r| keep(r));
    (before - rows.len()) as u64
}

fn expires_at(operation: &str, now: DateTime<Utc>, expire_in: Duration) -> Result<DateTime<Utc>, StoreError> {
    chrono::Duration::from_std(expire_in)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| {
            StoreError::database(operation, Some("22008"), format!("expiry {expire_in:?} out of range"))
        })
}

type FaultRule = Arc<dyn Fn(&Mutation) -> bool + Send + Sync>;

/// In-memory job storage tables.
///
/// Intended for tests/dev. Every transaction holds the table lock from
/// `begin` until commit or rollback, so transactions are serialized whatever
/// isolation level is requested. Statements run against a private copy that
/// replaces the tables only on commit.
///
/// Clones share the same tables, so each clone behaves like a separate
/// session on one database.
#[derive(Clone)]
pub struct InMemoryStore {
    tables: Arc<Mutex<StoreSnapshot>>,
    faults: Arc<RwLock<Vec<FaultRule>>>,
    schema: Arc<str>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_schema(crate::config::DEFAULT_SCHEMA_NAME)
    }

    pub fn with_schema(schema: impl Into<String>) -> Self {
        Self {
            tables: Arc::new(Mutex::new(StoreSnapshot::default())),
            faults: Arc::new(RwLock::new(Vec::new())),
            schema: Arc::from(schema.into()),
        }
    }

    /// Make every statement matching `rule` fail with a database error.
    ///
    /// A poisoned rule list is still used.
    pub fn fail_when(&self, rule: impl Fn(&Mutation) -> bool + Send + Sync + 'static) {
        self.faults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(rule));
    }

    pub fn clear_faults(&self) {
        self.faults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        self.tables.lock().await.clone()
    }

    /// Insert an empty job row and return its id.
    pub async fn create_job(&self) -> JobId {
        let mut tables = self.tables.lock().await;
        let id = JobId::new(tables.next_id());
        tables.jobs.push(JobRow {
            id,
            state_id: None,
            state_name: None,
            expire_at: None,
        });
        id
    }
}

fn check_faults(faults: &RwLock<Vec<FaultRule>>, mutation: &Mutation) -> Result<(), StoreError> {
    let rules = faults.read().unwrap_or_else(PoisonError::into_inner);
    if rules.iter().any(|rule| (**rule)(mutation)) {
        return Err(StoreError::database(
            mutation.kind(),
            Some("P0001"),
            format!("injected fault for '{}'", mutation.target()),
        ));
    }
    Ok(())
}

#[async_trait]
impl StoreSession for InMemoryStore {
    fn schema_name(&self) -> &str {
        &self.schema
    }

    fn describe(&self) -> String {
        format!("In-memory store, Schema: {}", self.schema)
    }

    async fn execute(&self, mutation: &Mutation) -> Result<u64, StoreError> {
        check_faults(&self.faults, mutation)?;
        let mut tables = self.tables.lock().await;
        tables.apply(mutation, Utc::now())
    }

    async fn begin(
        &self,
        _isolation: IsolationLevel,
    ) -> Result<Box<dyn SessionTransaction>, StoreError> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryTransaction {
            guard,
            working,
            faults: self.faults.clone(),
        }))
    }
}

struct InMemoryTransaction {
    guard: OwnedMutexGuard<StoreSnapshot>,
    working: StoreSnapshot,
    faults: Arc<RwLock<Vec<FaultRule>>>,
}

#[async_trait]
impl SessionTransaction for InMemoryTransaction {
    async fn execute(&mut self, mutation: &Mutation) -> Result<u64, StoreError> {
        check_faults(&self.faults, mutation)?;
        self.working.apply(mutation, Utc::now())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTransaction {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
