use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use relay_core::errors::GatewayError;
use relay_core::provider::CompletionProvider;

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Return this JSON payload.
    Json(Value),
    /// Fail the call.
    Error(GatewayError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn ok(value: Value) -> Self {
        Self::Json(value)
    }

    /// Convenience: a 500 from the named upstream.
    pub fn server_error(status: u16) -> Self {
        Self::Error(GatewayError::from_status("Perplexity", status, String::new()))
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence and
/// records every request body it receives.
///
/// Once the script runs out it either echoes the body back (`echo`) or fails.
#[derive(Debug, Default)]
pub struct MockProvider {
    script: Mutex<VecDeque<MockResponse>>,
    calls: Mutex<Vec<Value>>,
    echo_when_exhausted: bool,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
            echo_when_exhausted: false,
        }
    }

    /// Answers every call with `{"echo": <body>}`.
    pub fn echo() -> Self {
        Self::new(Vec::new()).echo_when_exhausted()
    }

    pub fn echo_when_exhausted(mut self) -> Self {
        self.echo_when_exhausted = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Request bodies in call order.
    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CompletionProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, body: &Value) -> Result<Value, GatewayError> {
        let idx = {
            let mut calls = self.calls.lock();
            calls.push(body.clone());
            calls.len() - 1
        };

        let next = self.script.lock().pop_front();
        let mut response = match next {
            Some(response) => response,
            None if self.echo_when_exhausted => return Ok(json!({ "echo": body })),
            None => {
                return Err(GatewayError::InvalidResponse(format!(
                    "MockProvider: no response configured for call {idx}"
                )))
            }
        };

        loop {
            match response {
                MockResponse::Json(value) => return Ok(value),
                MockResponse::Error(err) => return Err(err),
                MockResponse::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    response = *inner;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_script_in_order_and_logs_calls() {
        let mock = MockProvider::new(vec![
            MockResponse::ok(json!({"n": 1})),
            MockResponse::server_error(500),
        ]);

        assert_eq!(mock.complete(&json!({"q": "a"})).await.unwrap(), json!({"n": 1}));
        let err = mock.complete(&json!({"q": "b"})).await.unwrap_err();
        assert_eq!(err.to_string(), "Perplexity API error: 500");

        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.calls(), vec![json!({"q": "a"}), json!({"q": "b"})]);
    }

    #[tokio::test]
    async fn exhausted_script_fails_without_echo() {
        let mock = MockProvider::new(vec![]);
        let err = mock.complete(&json!({})).await.unwrap_err();
        assert!(err.to_string().contains("no response configured for call 0"));
    }

    #[tokio::test]
    async fn echo_reflects_body() {
        let mock = MockProvider::echo();
        let out = mock.complete(&json!({"q": "x"})).await.unwrap();
        assert_eq!(out, json!({"echo": {"q": "x"}}));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_waits_before_responding() {
        let mock = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_millis(500),
            MockResponse::ok(json!(true)),
        )]);

        let start = tokio::time::Instant::now();
        assert_eq!(mock.complete(&json!({})).await.unwrap(), json!(true));
        assert!(start.elapsed() >= Duration::from_millis(500));
    }
}
