//! Job storage on a shared relational store: distributed locks, write-only
//! transactions and the queue providers they push jobs through.

pub mod config;
pub mod lock;
pub mod queue;
pub mod storage;
pub mod store;
pub mod transaction;

pub use config::StorageOptions;
pub use lock::{DistributedLock, LockError, LockPolicy, LockState};
pub use queue::{JobQueue, JobQueueProvider, QueueProviderCollection};
pub use storage::JobStorage;
pub use store::{InMemoryStore, PostgresStore, StoreError, StoreSession};
pub use transaction::{CommitError, QueuedOperation, WriteOnlyTransaction};

#[cfg(test)]
mod integration_tests;
