//! Parameterized mutation descriptors.
//!
//! A [`Mutation`] names one logical statement together with its operands. The
//! gateways interpret it: [`PostgresStore`](super::PostgresStore) renders SQL
//! against the configured schema, [`InMemoryStore`](super::InMemoryStore)
//! applies it to its tables. Keeping statements as data lets a write
//! transaction buffer and inspect them before anything touches the store.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use jobstore_core::JobId;

/// Aggregate tables whose rows can be expired or persisted by key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateTable {
    Set,
    List,
    Hash,
}

impl AggregateTable {
    /// Table name inside the storage schema.
    pub fn table_name(&self) -> &'static str {
        match self {
            AggregateTable::Set => "set",
            AggregateTable::List => "list",
            AggregateTable::Hash => "hash",
        }
    }
}

/// A job state transition recorded in the `state` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub name: String,
    pub reason: Option<String>,
    /// Serialized as a JSON object into `state.data`.
    pub data: BTreeMap<String, String>,
}

impl JobState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: None,
            data: BTreeMap::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// One parameterized statement against the job storage tables.
///
/// Every variant reports the number of rows it affected when executed.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Insert a lock row for `resource` only if none exists.
    InsertLock { resource: String, update_count: i32 },
    /// Flip the resource's lock counter from 0 to 1.
    ClaimLock { resource: String },
    /// Delete the resource's lock row.
    DeleteLock { resource: String },

    ExpireJob { job_id: JobId, expire_in: Duration },
    PersistJob { job_id: JobId },
    /// Insert a state row and make it the job's current state.
    SetJobState { job_id: JobId, state: JobState },
    /// Insert a state row without touching the job's current state.
    AddJobState { job_id: JobId, state: JobState },
    /// Append a job to a queue table row (used by the default job queue).
    EnqueueJob { queue: String, job_id: JobId },

    /// Append a signed delta row; the counter value is the sum of all deltas.
    InsertCounter {
        key: String,
        delta: i64,
        expire_in: Option<Duration>,
    },

    /// Update the score of (key, value) or insert the pair if it is missing.
    UpsertSetMember { key: String, value: String, score: f64 },
    RemoveSetMember { key: String, value: String },
    RemoveSet { key: String },

    InsertListValue { key: String, value: String },
    RemoveListValue { key: String, value: String },
    /// Delete list rows whose rank (ascending insertion id) is outside the inclusive window.
    TrimList {
        key: String,
        keep_starting_from: usize,
        keep_ending_at: usize,
    },

    /// Update the value of (key, field) or insert the field if it is missing.
    UpsertHashField {
        key: String,
        field: String,
        value: String,
    },
    RemoveHash { key: String },

    ExpireKey {
        table: AggregateTable,
        key: String,
        expire_in: Duration,
    },
    PersistKey { table: AggregateTable, key: String },
}

impl Mutation {
    /// Short statement name used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::InsertLock { .. } => "insert_lock",
            Mutation::ClaimLock { .. } => "claim_lock",
            Mutation::DeleteLock { .. } => "delete_lock",
            Mutation::ExpireJob { .. } => "expire_job",
            Mutation::PersistJob { .. } => "persist_job",
            Mutation::SetJobState { .. } => "set_job_state",
            Mutation::AddJobState { .. } => "add_job_state",
            Mutation::EnqueueJob { .. } => "enqueue_job",
            Mutation::InsertCounter { .. } => "insert_counter",
            Mutation::UpsertSetMember { .. } => "upsert_set_member",
            Mutation::RemoveSetMember { .. } => "remove_set_member",
            Mutation::RemoveSet { .. } => "remove_set",
            Mutation::InsertListValue { .. } => "insert_list_value",
            Mutation::RemoveListValue { .. } => "remove_list_value",
            Mutation::TrimList { .. } => "trim_list",
            Mutation::UpsertHashField { .. } => "upsert_hash_field",
            Mutation::RemoveHash { .. } => "remove_hash",
            Mutation::ExpireKey { .. } => "expire_key",
            Mutation::PersistKey { .. } => "persist_key",
        }
    }

    /// The resource, key, queue or job the statement addresses.
    pub fn target(&self) -> String {
        match self {
            Mutation::InsertLock { resource, .. }
            | Mutation::ClaimLock { resource }
            | Mutation::DeleteLock { resource } => resource.clone(),
            Mutation::ExpireJob { job_id, .. }
            | Mutation::PersistJob { job_id }
            | Mutation::SetJobState { job_id, .. }
            | Mutation::AddJobState { job_id, .. } => format!("job:{job_id}"),
            Mutation::EnqueueJob { queue, .. } => queue.clone(),
            Mutation::InsertCounter { key, .. }
            | Mutation::UpsertSetMember { key, .. }
            | Mutation::RemoveSetMember { key, .. }
            | Mutation::RemoveSet { key }
            | Mutation::InsertListValue { key, .. }
            | Mutation::RemoveListValue { key, .. }
            | Mutation::TrimList { key, .. }
            | Mutation::UpsertHashField { key, .. }
            | Mutation::RemoveHash { key }
            | Mutation::ExpireKey { key, .. }
            | Mutation::PersistKey { key, .. } => key.clone(),
        }
    }
}
