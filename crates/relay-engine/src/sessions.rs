use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use relay_core::ids::SessionId;
use relay_core::provider::CompletionProvider;

use crate::backoff::BackoffPolicy;
use crate::queue::{ProgressReporter, TaskQueue};

/// Session id → the queue currently running that session's batch.
pub struct SessionQueues {
    queues: DashMap<SessionId, Arc<TaskQueue>>,
    provider: Arc<dyn CompletionProvider>,
    reporter: Arc<dyn ProgressReporter>,
    policy: BackoffPolicy,
}

impl SessionQueues {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        reporter: Arc<dyn ProgressReporter>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            queues: DashMap::new(),
            provider,
            reporter,
            policy,
        }
    }

    /// Create a fresh queue for the session. An existing queue is replaced;
    /// it keeps running but stops reporting progress and is no longer
    /// reachable through the manager.
    pub fn create(&self, session_id: &SessionId) -> Arc<TaskQueue> {
        let queue = Arc::new(TaskQueue::new(
            session_id.clone(),
            self.provider.clone(),
            self.reporter.clone(),
            self.policy,
        ));
        if let Some(previous) = self.queues.insert(session_id.clone(), queue.clone()) {
            previous.mark_replaced();
            info!(session_id = %session_id, "replaced active queue");
        }
        queue
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<TaskQueue>> {
        self.queues.get(session_id).map(|q| q.clone())
    }

    pub fn remove(&self, session_id: &SessionId) -> bool {
        self.queues.remove(session_id).is_some()
    }

    /// Remove the session's queue only if it is still `queue`.
    pub fn release(&self, session_id: &SessionId, queue: &Arc<TaskQueue>) -> bool {
        let removed = self
            .queues
            .remove_if(session_id, |_, current| Arc::ptr_eq(current, queue))
            .is_some();
        if !removed {
            debug!(session_id = %session_id, "queue already replaced, leaving successor");
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.queues.len()
    }
}
