//! Persistent job queues and the providers that select them.
//!
//! A write transaction does not know how a queue stores its jobs. At commit
//! time it asks the [`QueueProviderCollection`] for the provider registered
//! for the queue name (falling back to the default provider) and lets that
//! provider's [`JobQueue`] enqueue the job inside the commit's transaction.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use jobstore_core::{DomainError, DomainResult, JobId, ensure_not_blank};

use crate::store::{Mutation, SessionTransaction, StoreError};

/// A persistent queue implementation.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue `job_id` on `queue` inside the caller's transaction.
    async fn enqueue(
        &self,
        tx: &mut dyn SessionTransaction,
        queue: &str,
        job_id: JobId,
    ) -> Result<(), StoreError>;
}

/// Factory for the queue used by a set of queue names.
pub trait JobQueueProvider: Send + Sync {
    fn job_queue(&self) -> Arc<dyn JobQueue>;
}

/// Queue stored in the `jobqueue` table of the job storage itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct TableJobQueue;

#[async_trait]
impl JobQueue for TableJobQueue {
    async fn enqueue(
        &self,
        tx: &mut dyn SessionTransaction,
        queue: &str,
        job_id: JobId,
    ) -> Result<(), StoreError> {
        tx.execute(&Mutation::EnqueueJob {
            queue: queue.to_string(),
            job_id,
        })
        .await?;
        Ok(())
    }
}

/// Provider of [`TableJobQueue`]; the default for every queue.
#[derive(Debug, Default, Clone)]
pub struct TableJobQueueProvider;

impl JobQueueProvider for TableJobQueueProvider {
    fn job_queue(&self) -> Arc<dyn JobQueue> {
        Arc::new(TableJobQueue)
    }
}

/// Queue name → provider registry with a default provider.
pub struct QueueProviderCollection {
    default_provider: Arc<dyn JobQueueProvider>,
    providers: Vec<Arc<dyn JobQueueProvider>>,
    by_queue: HashMap<String, Arc<dyn JobQueueProvider>>,
}

impl std::fmt::Debug for QueueProviderCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut queues: Vec<_> = self.by_queue.keys().collect();
        queues.sort();
        f.debug_struct("QueueProviderCollection")
            .field("providers", &self.providers.len())
            .field("queues", &queues)
            .finish()
    }
}

impl Default for QueueProviderCollection {
    fn default() -> Self {
        Self::new(Arc::new(TableJobQueueProvider))
    }
}

impl QueueProviderCollection {
    pub fn new(default_provider: Arc<dyn JobQueueProvider>) -> Self {
        Self {
            providers: vec![default_provider.clone()],
            default_provider,
            by_queue: HashMap::new(),
        }
    }

    /// Route `queues` to `provider`. A queue can be routed only once.
    pub fn add<Q>(&mut self, provider: Arc<dyn JobQueueProvider>, queues: Q) -> DomainResult<()>
    where
        Q: IntoIterator,
        Q::Item: Into<String>,
    {
        let queues: Vec<String> = queues.into_iter().map(Into::into).collect();
        for queue in &queues {
            ensure_not_blank("queue", queue)?;
            if self.by_queue.contains_key(queue) {
                return Err(DomainError::validation(format!(
                    "queue '{queue}' already has a provider"
                )));
            }
        }

        for queue in queues {
            self.by_queue.insert(queue, provider.clone());
        }
        self.providers.push(provider);
        Ok(())
    }

    /// Provider for `queue`, or the default provider.
    pub fn provider_for(&self, queue: &str) -> &Arc<dyn JobQueueProvider> {
        self.by_queue.get(queue).unwrap_or(&self.default_provider)
    }

    /// Every registered provider, default first.
    pub fn providers(&self) -> impl Iterator<Item = &Arc<dyn JobQueueProvider>> {
        self.providers.iter()
    }
}
