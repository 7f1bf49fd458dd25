use serde::{Deserialize, Serialize};

/// Stream housekeeping frames. Always carry a `type` field so clients can
/// tell them apart from progress updates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlEvent {
    Connected,
    KeepAlive,
}

/// Progress for a running batch, emitted once per resolved task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub completed: usize,
    pub total: usize,
    pub last_completed: String,
}

/// Anything written to an event sink.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SinkEvent {
    Control(ControlEvent),
    Progress(ProgressEvent),
}

impl SinkEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Control(ControlEvent::Connected) => "connected",
            Self::Control(ControlEvent::KeepAlive) => "keep-alive",
            Self::Progress(_) => "progress",
        }
    }
}

impl From<ControlEvent> for SinkEvent {
    fn from(event: ControlEvent) -> Self {
        Self::Control(event)
    }
}

impl From<ProgressEvent> for SinkEvent {
    fn from(event: ProgressEvent) -> Self {
        Self::Progress(event)
    }
}
