use std::time::Duration;

use secrecy::SecretString;

use relay_engine::sink::{DEFAULT_SINK_BUFFER, KEEP_ALIVE_INTERVAL};
use relay_engine::BackoffPolicy;
use relay_llm::provider::{ANTHROPIC_API_URL, PERPLEXITY_API_URL};

pub const DEFAULT_PORT: u16 = 5001;
pub const DEFAULT_ALLOWED_ORIGINS: [&str; 2] = ["http://localhost:3000", "http://127.0.0.1:3000"];

/// Fixed-window request limit applied per client address on `/api/*`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(15 * 60),
        }
    }
}

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub anthropic_api_key: SecretString,
    pub perplexity_api_key: SecretString,
    pub anthropic_url: String,
    pub perplexity_url: String,
    /// CORS allow-list used outside production.
    pub allowed_origins: Vec<String>,
    /// The only allowed origin in production.
    pub frontend_url: Option<String>,
    /// Masks internal error messages and narrows CORS to `frontend_url`.
    pub production: bool,
    pub rate_limit: RateLimitConfig,
    pub backoff: BackoffPolicy,
    pub keep_alive_interval: Duration,
    pub sink_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            anthropic_api_key: SecretString::from(""),
            perplexity_api_key: SecretString::from(""),
            anthropic_url: ANTHROPIC_API_URL.to_string(),
            perplexity_url: PERPLEXITY_API_URL.to_string(),
            allowed_origins: DEFAULT_ALLOWED_ORIGINS.iter().map(|s| s.to_string()).collect(),
            frontend_url: None,
            production: false,
            rate_limit: RateLimitConfig::default(),
            backoff: BackoffPolicy::default(),
            keep_alive_interval: KEEP_ALIVE_INTERVAL,
            sink_buffer: DEFAULT_SINK_BUFFER,
        }
    }
}

impl ServerConfig {
    /// Origins the CORS layer accepts.
    pub fn cors_origins(&self) -> Vec<String> {
        if self.production {
            self.frontend_url.iter().cloned().collect()
        } else {
            self.allowed_origins.clone()
        }
    }
}
