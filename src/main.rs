use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use tracing::Level;

use relay_server::{RateLimitConfig, ServerConfig};
use relay_telemetry::TelemetryConfig;

/// Relay for batched completion queries with live progress streams.
#[derive(Debug, Parser)]
#[command(name = "relay", version)]
struct Args {
    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 5001)]
    port: u16,

    #[arg(long, env = "ANTHROPIC_API_KEY", default_value = "", hide_env_values = true)]
    anthropic_api_key: String,

    #[arg(long, env = "PERPLEXITY_API_KEY", default_value = "", hide_env_values = true)]
    perplexity_api_key: String,

    /// The only CORS origin allowed in production.
    #[arg(long, env = "FRONTEND_URL")]
    frontend_url: Option<String>,

    /// Set to `production` to mask internal errors and restrict CORS.
    #[arg(long = "env", env = "RELAY_ENV", default_value = "development")]
    environment: String,

    /// CORS allow-list outside production.
    #[arg(
        long,
        env = "ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:3000,http://127.0.0.1:3000"
    )]
    allowed_origins: Vec<String>,

    /// Requests allowed per client per window on /api routes.
    #[arg(long, env = "RATE_LIMIT_MAX", default_value_t = 100)]
    rate_limit_max: u32,

    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value_t = 900)]
    rate_limit_window_secs: u64,

    /// Default log level; RUST_LOG takes precedence.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,
}

impl Args {
    fn production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            anthropic_api_key: SecretString::from(self.anthropic_api_key.clone()),
            perplexity_api_key: SecretString::from(self.perplexity_api_key.clone()),
            allowed_origins: self
                .allowed_origins
                .iter()
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            frontend_url: self.frontend_url.clone(),
            production: self.production(),
            rate_limit: RateLimitConfig {
                max_requests: self.rate_limit_max,
                window: Duration::from_secs(self.rate_limit_window_secs),
            },
            ..Default::default()
        }
    }

    fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: self.log_level,
            module_levels: Vec::new(),
            json: self.production(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    relay_telemetry::init_telemetry(&args.telemetry_config())?;

    if args.anthropic_api_key.is_empty() {
        tracing::warn!("ANTHROPIC_API_KEY is not set; /api/anthropic requests will be rejected upstream");
    }
    if args.perplexity_api_key.is_empty() {
        tracing::warn!("PERPLEXITY_API_KEY is not set; /api/perplexity requests will be rejected upstream");
    }

    let handle = relay_server::start(args.server_config())
        .await
        .context("failed to start server")?;

    tracing::info!(port = handle.port, "relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
