use async_trait::async_trait;
use serde_json::Value;

use crate::errors::GatewayError;

/// A downstream completion API. The request body and the response are opaque
/// JSON; the relay never interprets them.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, body: &Value) -> Result<Value, GatewayError>;
}
