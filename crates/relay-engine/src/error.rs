#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Session ID required")]
    MissingSessionId,

    #[error("batch must contain at least one query")]
    EmptyBatch,

    #[error("queue is already running")]
    QueueAlreadyRunning,

    #[error("queue has already drained")]
    QueueDrained,

    #[error("{0}")]
    Internal(String),
}
