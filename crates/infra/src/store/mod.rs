//! Store gateway: sessions, transactions and the statements they run.

pub mod gateway;
pub mod in_memory;
pub mod mutation;
pub mod postgres;

pub use gateway::{IsolationLevel, SessionTransaction, StoreError, StoreSession};
pub use in_memory::{InMemoryStore, StoreSnapshot};
pub use mutation::{AggregateTable, JobState, Mutation};
pub use postgres::PostgresStore;
