use jobstore_core::JobId;

use crate::store::Mutation;

/// One step buffered by a [`WriteOnlyTransaction`](super::WriteOnlyTransaction).
#[derive(Debug, Clone, PartialEq)]
pub enum QueuedOperation {
    /// A statement run as-is inside the commit transaction.
    Mutation(Mutation),
    /// A queue push, resolved to the queue's provider at commit time.
    AddToQueue { queue: String, job_id: JobId },
}

impl QueuedOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            QueuedOperation::Mutation(mutation) => mutation.kind(),
            QueuedOperation::AddToQueue { .. } => "add_to_queue",
        }
    }

    /// The key, queue or job the operation addresses.
    pub fn target(&self) -> String {
        match self {
            QueuedOperation::Mutation(mutation) => mutation.target(),
            QueuedOperation::AddToQueue { queue, .. } => queue.clone(),
        }
    }
}

impl From<Mutation> for QueuedOperation {
    fn from(mutation: Mutation) -> Self {
        QueuedOperation::Mutation(mutation)
    }
}
