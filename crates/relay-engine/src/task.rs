use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_core::ids::TaskId;

/// One query in a batch. `retries` is only touched by the queue's run loop.
#[derive(Clone, Debug)]
pub struct QueryTask {
    pub id: TaskId,
    pub query: String,
    pub body: Value,
    pub retries: u32,
}

impl QueryTask {
    pub fn new(query: impl Into<String>, body: Value) -> Self {
        Self {
            id: TaskId::new(),
            query: query.into(),
            body,
            retries: 0,
        }
    }
}

/// Terminal outcome of a task. On the wire a success is the upstream payload
/// verbatim and a failure is `{"error": "..."}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskResult {
    Failure { error: String },
    Success(Value),
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedTask {
    pub id: TaskId,
    pub query: String,
    pub result: TaskResult,
}
