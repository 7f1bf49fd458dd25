use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// Structured log for one session's queue.
///
/// Every record carries `session_id` and `event`. `request` records also carry
/// the milliseconds elapsed since the previous request in the same session,
/// which makes the backoff spacing visible in the logs.
#[derive(Debug)]
pub struct SessionLog {
    session_id: String,
    last_request: Mutex<Option<Instant>>,
}

impl SessionLog {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            last_request: Mutex::new(None),
        }
    }

    pub fn queue_start(&self, queue_size: usize) {
        info!(session_id = %self.session_id, event = "queue_start", queue_size);
    }

    pub fn process_task(&self, task_id: &str, query: &str, retry_count: u32, remaining: usize) {
        info!(
            session_id = %self.session_id,
            event = "process_task",
            task_id,
            query,
            retry_count,
            remaining_queue = remaining
        );
    }

    /// Record an outbound request. Returns the gap since the previous one.
    pub fn request(&self, task_id: &str, query: &str, delay_ms: u64) -> Option<u64> {
        let now = Instant::now();
        let since_last = self
            .last_request
            .lock()
            .replace(now)
            .map(|prev| now.duration_since(prev).as_millis() as u64);

        match since_last {
            Some(since_last_request_ms) => info!(
                session_id = %self.session_id,
                event = "request",
                task_id,
                query,
                delay_ms,
                since_last_request_ms
            ),
            None => info!(
                session_id = %self.session_id,
                event = "request",
                task_id,
                query,
                delay_ms
            ),
        }
        since_last
    }

    pub fn task_success(&self, task_id: &str, retry_count: u32) {
        info!(session_id = %self.session_id, event = "task_success", task_id, retry_count);
    }

    pub fn task_error(&self, task_id: &str, retry_count: u32, error: &str) {
        warn!(
            session_id = %self.session_id,
            event = "task_error",
            task_id,
            retry_count,
            error
        );
    }

    pub fn task_retry(&self, task_id: &str, new_retry_count: u32, max_retries: u32) {
        info!(
            session_id = %self.session_id,
            event = "task_retry",
            task_id,
            new_retry_count,
            max_retries
        );
    }

    pub fn task_max_retries(&self, task_id: &str, error: &str) {
        warn!(session_id = %self.session_id, event = "task_max_retries", task_id, error);
    }

    pub fn queue_complete(&self, total_processed: usize, success_count: usize, error_count: usize) {
        info!(
            session_id = %self.session_id,
            event = "queue_complete",
            total_processed,
            success_count,
            error_count
        );
    }

    pub fn sse_emit(&self, event_kind: &str) {
        info!(session_id = %self.session_id, event = "sse_emit", event_kind);
    }

    pub fn sse_error(&self, error: &str) {
        warn!(session_id = %self.session_id, event = "sse_error", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing::field::{Field, Visit};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    type Captured = Arc<Mutex<Vec<Vec<(String, String)>>>>;

    struct CaptureLayer(Captured);

    struct FieldVisitor(Vec<(String, String)>);

    impl Visit for FieldVisitor {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            self.0
                .push((field.name().to_string(), format!("{value:?}").trim_matches('"').to_string()));
        }

        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.push((field.name().to_string(), value.to_string()));
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for CaptureLayer {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let mut visitor = FieldVisitor(Vec::new());
            event.record(&mut visitor);
            self.0.lock().push(visitor.0);
        }
    }

    fn field<'a>(record: &'a [(String, String)], name: &str) -> Option<&'a str> {
        record
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn records_carry_session_and_event() {
        let captured: Captured = Arc::default();
        let subscriber = tracing_subscriber::registry().with(CaptureLayer(captured.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let log = SessionLog::new("sess-a");
            log.queue_start(2);
            log.task_max_retries("task_1", "Perplexity API error: 500");
        });

        let records = captured.lock();
        assert_eq!(records.len(), 2);
        assert_eq!(field(&records[0], "session_id"), Some("sess-a"));
        assert_eq!(field(&records[0], "event"), Some("queue_start"));
        assert_eq!(field(&records[0], "queue_size"), Some("2"));
        assert_eq!(field(&records[1], "event"), Some("task_max_retries"));
        assert_eq!(field(&records[1], "task_id"), Some("task_1"));
    }

    #[tokio::test(start_paused = true)]
    async fn request_tracks_gap_since_previous() {
        let log = SessionLog::new("sess-b");
        assert_eq!(log.request("t1", "q1", 1000), None);

        tokio::time::advance(Duration::from_millis(2000)).await;
        assert_eq!(log.request("t2", "q2", 2000), Some(2000));

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(log.request("t3", "q3", 1000), Some(1000));
    }
}
