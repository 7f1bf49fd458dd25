pub mod errors;
pub mod events;
pub mod ids;
pub mod provider;

pub use errors::GatewayError;
pub use events::{ControlEvent, ProgressEvent, SinkEvent};
pub use ids::{SessionId, TaskId};
pub use provider::CompletionProvider;
