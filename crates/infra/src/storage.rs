//! Job storage façade.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use jobstore_core::DomainResult;

use crate::config::StorageOptions;
use crate::lock::{DistributedLock, LockError};
use crate::queue::QueueProviderCollection;
use crate::store::StoreSession;
use crate::transaction::WriteOnlyTransaction;

/// Entry point for workers: hands out write transactions and distributed
/// locks bound to one store session.
pub struct JobStorage<S: StoreSession + Clone> {
    session: S,
    options: StorageOptions,
    queue_providers: Arc<QueueProviderCollection>,
}

impl<S: StoreSession + Clone> JobStorage<S> {
    pub fn new(session: S, options: StorageOptions) -> DomainResult<Self> {
        options.validate()?;
        Ok(Self {
            session,
            options,
            queue_providers: Arc::new(QueueProviderCollection::default()),
        })
    }

    pub fn with_queue_providers(mut self, providers: QueueProviderCollection) -> Self {
        self.queue_providers = Arc::new(providers);
        self
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    pub fn queue_providers(&self) -> &QueueProviderCollection {
        &self.queue_providers
    }

    pub fn write_transaction(&self) -> WriteOnlyTransaction<S> {
        WriteOnlyTransaction::new(self.session.clone(), self.queue_providers.clone())
    }

    /// Acquire `resource` with the configured timeout and policy.
    pub async fn acquire_distributed_lock(
        &self,
        resource: impl Into<String>,
    ) -> Result<DistributedLock<S>, LockError> {
        self.acquire_distributed_lock_with_timeout(resource, self.options.distributed_lock_timeout)
            .await
    }

    pub async fn acquire_distributed_lock_with_timeout(
        &self,
        resource: impl Into<String>,
        timeout: Duration,
    ) -> Result<DistributedLock<S>, LockError> {
        DistributedLock::acquire(
            self.session.clone(),
            resource,
            timeout,
            self.options.lock_policy,
        )
        .await
    }

    pub fn log_options(&self) {
        tracing::info!(storage = %self, "using job storage");
        self.options.log_options();
    }
}

impl<S: StoreSession + Clone> fmt::Display for JobStorage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.session.describe())
    }
}
