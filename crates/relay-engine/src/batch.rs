use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument};

use relay_core::ids::SessionId;
use relay_core::provider::CompletionProvider;

use crate::backoff::BackoffPolicy;
use crate::error::EngineError;
use crate::queue::TaskQueue;
use crate::sessions::SessionQueues;
use crate::sink::{EventSinkRegistry, SinkStream};
use crate::task::TaskResult;

/// One `{query, body}` pair from a batch request.
#[derive(Clone, Debug, Deserialize)]
pub struct BatchQuery {
    pub query: String,
    #[serde(default)]
    pub body: Value,
}

/// Entry point for stream connects and batch submissions.
#[derive(Clone)]
pub struct BatchOrchestrator {
    sinks: EventSinkRegistry,
    queues: Arc<SessionQueues>,
}

/// Tears down the session's queue and stream however the batch ends,
/// including when the request future is dropped. A batch that was replaced
/// leaves both to its successor.
struct BatchCleanup<'a> {
    orchestrator: &'a BatchOrchestrator,
    queue: Arc<TaskQueue>,
}

impl Drop for BatchCleanup<'_> {
    fn drop(&mut self) {
        let session_id = self.queue.session_id();
        if self.orchestrator.queues.release(session_id, &self.queue) {
            self.orchestrator.sinks.deregister(session_id);
        }
    }
}

impl BatchOrchestrator {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        sinks: EventSinkRegistry,
        policy: BackoffPolicy,
    ) -> Self {
        let queues = SessionQueues::new(provider, Arc::new(sinks.clone()), policy);
        Self {
            sinks,
            queues: Arc::new(queues),
        }
    }

    pub fn sinks(&self) -> &EventSinkRegistry {
        &self.sinks
    }

    pub fn queues(&self) -> &SessionQueues {
        &self.queues
    }

    pub fn handle_stream_connect(&self, session_id: Option<&str>) -> Result<SinkStream, EngineError> {
        let session_id = SessionId::from_client(session_id).ok_or(EngineError::MissingSessionId)?;
        Ok(self.sinks.open(session_id))
    }

    /// Run a batch to completion and return one result per query, in order.
    #[instrument(skip_all, fields(session_id = session_id.unwrap_or_default(), queries = queries.len()))]
    pub async fn handle_batch(
        &self,
        session_id: Option<&str>,
        queries: Vec<BatchQuery>,
    ) -> Result<Vec<TaskResult>, EngineError> {
        let session_id = SessionId::from_client(session_id).ok_or(EngineError::MissingSessionId)?;
        if queries.is_empty() {
            return Err(EngineError::EmptyBatch);
        }

        let queue = self.queues.create(&session_id);
        let _cleanup = BatchCleanup {
            orchestrator: self,
            queue: queue.clone(),
        };

        for BatchQuery { query, body } in queries {
            queue.add_query(query, body)?;
        }

        let resolved = queue.run().await?;
        info!(session_id = %session_id, resolved = resolved.len(), "batch complete");
        Ok(resolved.into_iter().map(|task| task.result).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use relay_llm::{MockProvider, MockResponse};
    use serde_json::json;
    use std::time::Duration;

    fn orchestrator(provider: MockProvider) -> BatchOrchestrator {
        BatchOrchestrator::new(
            Arc::new(provider),
            EventSinkRegistry::default(),
            BackoffPolicy::default(),
        )
    }

    fn queries(names: &[&str]) -> Vec<BatchQuery> {
        names
            .iter()
            .map(|q| BatchQuery {
                query: q.to_string(),
                body: json!({"q": q}),
            })
            .collect()
    }

    #[tokio::test]
    async fn missing_session_creates_nothing() {
        let orch = orchestrator(MockProvider::echo());

        let err = orch.handle_batch(None, queries(&["a"])).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingSessionId));
        let err = orch.handle_batch(Some("  "), queries(&["a"])).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingSessionId));
        assert_eq!(orch.queues().active_count(), 0);
    }

    #[tokio::test]
    async fn missing_session_rejected_before_empty_batch() {
        let orch = orchestrator(MockProvider::echo());
        let err = orch.handle_batch(None, Vec::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingSessionId));
    }

    #[tokio::test]
    async fn empty_batch_rejected() {
        let orch = orchestrator(MockProvider::echo());
        let err = orch.handle_batch(Some("s1"), Vec::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::EmptyBatch));
        assert_eq!(orch.queues().active_count(), 0);
    }

    #[test]
    fn stream_connect_requires_session() {
        let orch = orchestrator(MockProvider::echo());
        assert!(matches!(
            orch.handle_stream_connect(None),
            Err(EngineError::MissingSessionId)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_streams_progress_and_cleans_up() {
        let orch = orchestrator(MockProvider::echo());
        let stream = orch.handle_stream_connect(Some("s1")).unwrap();

        let results = orch.handle_batch(Some("s1"), queries(&["a", "b"])).await.unwrap();

        assert_eq!(
            results,
            vec![
                TaskResult::Success(json!({"echo": {"q": "a"}})),
                TaskResult::Success(json!({"echo": {"q": "b"}})),
            ]
        );
        assert_eq!(orch.queues().active_count(), 0);
        assert!(!orch.sinks().is_open(&SessionId::from_raw("s1")));

        let frames: Vec<serde_json::Value> = stream
            .map(|f| serde_json::from_str(&f).unwrap())
            .collect()
            .await;
        assert_eq!(
            frames,
            vec![
                json!({"type": "connected"}),
                json!({"completed": 1, "total": 2, "lastCompleted": "a"}),
                json!({"completed": 2, "total": 2, "lastCompleted": "b"}),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn batch_without_stream_still_completes() {
        let orch = orchestrator(MockProvider::new(
            (0..4).map(|_| MockResponse::server_error(500)).collect(),
        ));

        let results = orch.handle_batch(Some("s1"), queries(&["a"])).await.unwrap();
        assert_eq!(
            results,
            vec![TaskResult::Failure {
                error: "Perplexity API error: 500".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_batch_still_cleans_up() {
        let orch = orchestrator(MockProvider::new(vec![MockResponse::delayed(
            Duration::from_secs(60),
            MockResponse::ok(json!({})),
        )]));
        let _stream = orch.handle_stream_connect(Some("s1")).unwrap();

        let batch = orch.handle_batch(Some("s1"), queries(&["a"]));
        let timed_out = tokio::time::timeout(Duration::from_secs(5), batch).await;
        assert!(timed_out.is_err());

        assert_eq!(orch.queues().active_count(), 0);
        assert!(!orch.sinks().is_open(&SessionId::from_raw("s1")));
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_batch_leaves_successor_stream_alone() {
        let orch = orchestrator(MockProvider::echo());
        let _first_stream = orch.handle_stream_connect(Some("s1")).unwrap();

        let old = tokio::spawn({
            let orch = orch.clone();
            async move { orch.handle_batch(Some("s1"), queries(&["old"])).await }
        });
        tokio::time::sleep(Duration::from_millis(500)).await;

        let new = tokio::spawn({
            let orch = orch.clone();
            async move { orch.handle_batch(Some("s1"), queries(&["new"])).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stream = orch.handle_stream_connect(Some("s1")).unwrap();

        // The old batch finishes first and must not touch the new batch's state.
        let old_results = old.await.unwrap().unwrap();
        assert!(old_results[0].is_success());
        assert_eq!(orch.queues().active_count(), 1);
        assert!(orch.sinks().is_open(&SessionId::from_raw("s1")));

        let new_results = new.await.unwrap().unwrap();
        assert_eq!(new_results, vec![TaskResult::Success(json!({"echo": {"q": "new"}}))]);
        assert_eq!(orch.queues().active_count(), 0);

        let frames: Vec<serde_json::Value> = stream
            .map(|f| serde_json::from_str(&f).unwrap())
            .collect()
            .await;
        assert_eq!(
            frames,
            vec![
                json!({"type": "connected"}),
                json!({"completed": 1, "total": 1, "lastCompleted": "new"}),
            ]
        );
    }
}
