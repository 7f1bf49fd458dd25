use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, instrument};

use relay_core::errors::GatewayError;
use relay_core::provider::CompletionProvider;

pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
pub const PERPLEXITY_API_URL: &str = "https://api.perplexity.ai/chat/completions";

const ANTHROPIC_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// How a provider authenticates outbound requests.
#[derive(Clone, Debug)]
pub enum ProviderAuth {
    /// `x-api-key` plus the pinned `anthropic-version` header.
    AnthropicKey(SecretString),
    /// `Authorization: Bearer <token>`.
    Bearer(SecretString),
}

/// Forwards opaque JSON bodies to a single upstream endpoint.
#[derive(Clone, Debug)]
pub struct HttpCompletionProvider {
    client: Client,
    name: String,
    url: String,
    auth: ProviderAuth,
}

impl HttpCompletionProvider {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        auth: ProviderAuth,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::NetworkError(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            name: name.into(),
            url: url.into(),
            auth,
        })
    }

    /// Provider A: the Anthropic Messages API.
    pub fn anthropic(api_key: SecretString) -> Result<Self, GatewayError> {
        Self::new("Anthropic", ANTHROPIC_API_URL, ProviderAuth::AnthropicKey(api_key))
    }

    /// Provider B: Perplexity chat completions.
    pub fn perplexity(api_key: SecretString) -> Result<Self, GatewayError> {
        Self::new("Perplexity", PERPLEXITY_API_URL, ProviderAuth::Bearer(api_key))
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn build_request(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self.client.post(&self.url);

        match &self.auth {
            ProviderAuth::AnthropicKey(key) => {
                req = req.header("x-api-key", key.expose_secret());
                req = req.header("anthropic-version", ANTHROPIC_VERSION);
            }
            ProviderAuth::Bearer(token) => {
                req = req.header("Authorization", format!("Bearer {}", token.expose_secret()));
            }
        }

        req.header("accept", "application/json").json(body)
    }
}

fn classify_send_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::NetworkError(e.to_string())
    }
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, body), fields(provider = %self.name))]
    async fn complete(&self, body: &Value) -> Result<Value, GatewayError> {
        let resp = self
            .build_request(body)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "upstream rejected request");
            return Err(GatewayError::from_status(&self.name, status.as_u16(), text));
        }

        let bytes = resp.bytes().await.map_err(classify_send_error)?;
        serde_json::from_slice(&bytes).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }
}
