use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use relay_core::events::ProgressEvent;
use relay_core::ids::{SessionId, TaskId};
use relay_core::provider::CompletionProvider;
use relay_telemetry::SessionLog;

use crate::backoff::BackoffPolicy;
use crate::error::EngineError;
use crate::sink::EmitOutcome;
use crate::task::{QueryTask, ResolvedTask, TaskResult};

/// Receives a progress update each time a task resolves.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, session_id: &SessionId, progress: ProgressEvent) -> EmitOutcome;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    Created,
    Running,
    Drained,
}

struct QueueInner {
    pending: VecDeque<QueryTask>,
    in_flight: HashSet<TaskId>,
    results: HashMap<TaskId, TaskResult>,
    /// Submission order, for assembling the final result list.
    order: Vec<(TaskId, String)>,
    state: QueueState,
    /// Set once a newer batch owns the session; progress is no longer reported.
    replaced: bool,
}

impl QueueInner {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: HashSet::new(),
            results: HashMap::new(),
            order: Vec::new(),
            state: QueueState::Created,
            replaced: false,
        }
    }

    fn begin(&mut self, id: &TaskId) -> Result<(), EngineError> {
        if !self.in_flight.insert(id.clone()) {
            return Err(EngineError::Internal(format!("task {id} is already in flight")));
        }
        Ok(())
    }

    fn record(&mut self, id: &TaskId, result: TaskResult) -> Result<(), EngineError> {
        if self.results.contains_key(id) {
            return Err(EngineError::Internal(format!("task {id} already has a result")));
        }
        self.results.insert(id.clone(), result);
        Ok(())
    }

    fn progress(&self, last_completed: &str) -> ProgressEvent {
        let completed = self.results.len();
        ProgressEvent {
            completed,
            total: completed + self.pending.len(),
            last_completed: last_completed.to_owned(),
        }
    }
}

/// Sequential runner for one session's batch.
///
/// Tasks run one at a time in FIFO order. Every attempt waits
/// `policy.delay_for(retries)` first; a failed task goes back to the front of
/// the pending list until it runs out of retries, at which point its error is
/// recorded as its result. One task failing never stops the others.
pub struct TaskQueue {
    session_id: SessionId,
    provider: Arc<dyn CompletionProvider>,
    reporter: Arc<dyn ProgressReporter>,
    policy: BackoffPolicy,
    log: SessionLog,
    inner: Mutex<QueueInner>,
}

impl TaskQueue {
    pub fn new(
        session_id: SessionId,
        provider: Arc<dyn CompletionProvider>,
        reporter: Arc<dyn ProgressReporter>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            log: SessionLog::new(session_id.as_str()),
            session_id,
            provider,
            reporter,
            policy,
            inner: Mutex::new(QueueInner::new()),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> QueueState {
        self.inner.lock().state
    }

    /// Detach this queue from the session's stream. It still runs to
    /// completion but stops reporting progress.
    pub fn mark_replaced(&self) {
        self.inner.lock().replaced = true;
    }

    pub fn is_replaced(&self) -> bool {
        self.inner.lock().replaced
    }

    pub fn add_query(&self, query: impl Into<String>, body: Value) -> Result<TaskId, EngineError> {
        let mut inner = self.inner.lock();
        if inner.state == QueueState::Drained {
            return Err(EngineError::QueueDrained);
        }
        let task = QueryTask::new(query, body);
        let id = task.id.clone();
        inner.order.push((id.clone(), task.query.clone()));
        inner.pending.push_back(task);
        Ok(id)
    }

    /// Drive the queue until every task has resolved. Results come back in
    /// submission order.
    pub async fn run(&self) -> Result<Vec<ResolvedTask>, EngineError> {
        let queue_size = {
            let mut inner = self.inner.lock();
            match inner.state {
                QueueState::Created => inner.state = QueueState::Running,
                QueueState::Running => return Err(EngineError::QueueAlreadyRunning),
                QueueState::Drained => return Err(EngineError::QueueDrained),
            }
            inner.pending.len()
        };
        self.log.queue_start(queue_size);

        while let Some((task, remaining)) = self.next_task()? {
            self.log
                .process_task(task.id.as_str(), &task.query, task.retries, remaining);
            self.attempt(task).await?;
        }

        Ok(self.finish())
    }

    /// Pop the next task and mark it in flight, or drain the queue.
    fn next_task(&self) -> Result<Option<(QueryTask, usize)>, EngineError> {
        let mut inner = self.inner.lock();
        let Some(task) = inner.pending.pop_front() else {
            inner.state = QueueState::Drained;
            return Ok(None);
        };
        inner.begin(&task.id)?;
        let remaining = inner.pending.len();
        Ok(Some((task, remaining)))
    }

    async fn attempt(&self, mut task: QueryTask) -> Result<(), EngineError> {
        let delay = self.policy.delay_for(task.retries);
        tokio::time::sleep(delay).await;

        self.log
            .request(task.id.as_str(), &task.query, delay.as_millis() as u64);

        match self.provider.complete(&task.body).await {
            Ok(payload) => {
                let progress = {
                    let mut inner = self.inner.lock();
                    inner.in_flight.remove(&task.id);
                    inner.record(&task.id, TaskResult::Success(payload))?;
                    inner.progress(&task.query)
                };
                self.log.task_success(task.id.as_str(), task.retries);
                self.report(progress);
            }
            Err(err) => {
                let message = err.to_string();
                self.log
                    .task_error(task.id.as_str(), task.retries, &message);

                let exhausted = {
                    let mut inner = self.inner.lock();
                    inner.in_flight.remove(&task.id);
                    if self.policy.should_retry(task.retries) {
                        task.retries += 1;
                        self.log
                            .task_retry(task.id.as_str(), task.retries, self.policy.max_retries);
                        inner.pending.push_front(task);
                        None
                    } else {
                        inner.record(&task.id, TaskResult::Failure { error: message.clone() })?;
                        Some((inner.progress(&task.query), task))
                    }
                };

                if let Some((progress, task)) = exhausted {
                    self.log.task_max_retries(task.id.as_str(), &message);
                    self.report(progress);
                }
            }
        }
        Ok(())
    }

    fn report(&self, progress: ProgressEvent) {
        if self.is_replaced() {
            debug!(
                session_id = %self.session_id,
                completed = progress.completed,
                "queue replaced, progress not reported"
            );
            return;
        }
        match self.reporter.report(&self.session_id, progress) {
            EmitOutcome::Delivered => self.log.sse_emit("progress"),
            EmitOutcome::Dropped => self.log.sse_error("stream buffer full"),
            EmitOutcome::Closed => self.log.sse_error("stream closed"),
            EmitOutcome::NoSink => {}
        }
    }

    fn finish(&self) -> Vec<ResolvedTask> {
        let inner = self.inner.lock();
        let resolved: Vec<ResolvedTask> = inner
            .order
            .iter()
            .filter_map(|(id, query)| {
                inner.results.get(id).map(|result| ResolvedTask {
                    id: id.clone(),
                    query: query.clone(),
                    result: result.clone(),
                })
            })
            .collect();

        let success_count = resolved.iter().filter(|r| r.result.is_success()).count();
        self.log
            .queue_complete(resolved.len(), success_count, resolved.len() - success_count);
        resolved
    }
}
