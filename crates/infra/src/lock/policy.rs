//! Lock acquisition policies.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use jobstore_core::DomainError;

use crate::store::{IsolationLevel, Mutation, StoreError, StoreSession};

/// How a single acquisition attempt claims the lock row.
///
/// | Policy | Attempt | Success signal |
/// |--------|---------|----------------|
/// | `TransactionalInsert` | repeatable-read transaction inserting the row if absent | insert affected a row |
/// | `InsertThenClaim` | best-effort insert of a zero row, then `updatecount` 0 → 1 | update affected a row |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// Check-and-insert inside one native database transaction.
    #[default]
    TransactionalInsert,
    /// Insert without a transaction (duplicate-insert races tolerated), then
    /// flip the row's counter from 0 to 1.
    InsertThenClaim,
}

impl LockPolicy {
    /// Run one acquisition attempt.
    ///
    /// `Ok(false)` means the lock is held elsewhere. Errors are attempt
    /// faults; the retry loop treats them like `Ok(false)`.
    pub(crate) async fn attempt<S>(&self, session: &S, resource: &str) -> Result<bool, StoreError>
    where
        S: StoreSession + ?Sized,
    {
        match self {
            LockPolicy::TransactionalInsert => {
                let mut tx = session.begin(IsolationLevel::RepeatableRead).await?;
                let inserted = tx
                    .execute(&Mutation::InsertLock {
                        resource: resource.to_string(),
                        update_count: 1,
                    })
                    .await?;
                if inserted > 0 {
                    tx.commit().await?;
                    Ok(true)
                } else {
                    tx.rollback().await?;
                    Ok(false)
                }
            }
            LockPolicy::InsertThenClaim => {
                let insert = Mutation::InsertLock {
                    resource: resource.to_string(),
                    update_count: 0,
                };
                if let Err(err) = session.execute(&insert).await {
                    debug!(resource, error = %err, "lock row insert raced, claiming anyway");
                }

                let claimed = session
                    .execute(&Mutation::ClaimLock {
                        resource: resource.to_string(),
                    })
                    .await?;
                Ok(claimed > 0)
            }
        }
    }
}

impl FromStr for LockPolicy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transactional_insert" | "transactional" => Ok(LockPolicy::TransactionalInsert),
            "insert_then_claim" | "update_count" => Ok(LockPolicy::InsertThenClaim),
            other => Err(DomainError::validation(format!("unknown lock policy '{other}'"))),
        }
    }
}
