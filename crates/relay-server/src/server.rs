use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::header::{ACCEPT, CONTENT_TYPE, REFERRER_POLICY, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS};
use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::{get, post};
use axum::{middleware, Router};
use tokio::sync::oneshot;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use relay_core::provider::CompletionProvider;
use relay_engine::{BatchOrchestrator, EventSinkRegistry};
use relay_llm::HttpCompletionProvider;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::handlers;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: BatchOrchestrator,
    pub anthropic: Arc<dyn CompletionProvider>,
    pub perplexity: Arc<dyn CompletionProvider>,
    pub limiter: Arc<RateLimiter>,
    pub production: bool,
}

impl AppState {
    /// Wire the given providers into fresh registries. Batches go to `perplexity`.
    pub fn new(
        config: &ServerConfig,
        anthropic: Arc<dyn CompletionProvider>,
        perplexity: Arc<dyn CompletionProvider>,
    ) -> Self {
        let sinks = EventSinkRegistry::new(config.keep_alive_interval, config.sink_buffer);
        Self {
            orchestrator: BatchOrchestrator::new(perplexity.clone(), sinks, config.backoff),
            anthropic,
            perplexity,
            limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            production: config.production,
        }
    }

    /// Build HTTP providers from the configured keys and URLs.
    pub fn from_config(config: &ServerConfig) -> Result<Self, ServerError> {
        let anthropic = HttpCompletionProvider::anthropic(config.anthropic_api_key.clone())?
            .with_url(config.anthropic_url.clone());
        let perplexity = HttpCompletionProvider::perplexity(config.perplexity_api_key.clone())?
            .with_url(config.perplexity_url.clone());
        Ok(Self::new(config, Arc::new(anthropic), Arc::new(perplexity)))
    }
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins()
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE, ACCEPT, HeaderName::from_static("x-session-id")])
        .allow_credentials(true)
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    let api = Router::new()
        .route("/api/anthropic", post(handlers::anthropic))
        .route("/api/perplexity", post(handlers::perplexity))
        .route("/api/perplexity/stream", get(handlers::stream))
        .route("/api/perplexity/batch", post(handlers::batch))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware));

    Router::new()
        .merge(api)
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(cors_layer(config))
        .layer(SetResponseHeaderLayer::if_not_present(
            X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            X_FRAME_OPTIONS,
            HeaderValue::from_static("SAMEORIGIN"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(TraceLayer::new_for_http())
}

/// Create and start the server with HTTP providers. Returns a handle to shut it down.
pub async fn start(config: ServerConfig) -> Result<ServerHandle, ServerError> {
    let state = AppState::from_config(&config)?;
    start_with_state(config, state).await
}

/// Start the server with pre-built state.
pub async fn start_with_state(config: ServerConfig, state: AppState) -> Result<ServerHandle, ServerError> {
    let router = build_router(state.clone(), &config);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), production = config.production, "relay server started");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let service = router.into_make_service_with_connect_info::<SocketAddr>();
        let result = axum::serve(listener, service)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        state,
        shutdown: Some(shutdown_tx),
        server,
    })
}

/// Handle returned by `start()`. Dropping it leaves the server running.
pub struct ServerHandle {
    pub port: u16,
    state: AppState,
    shutdown: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.server).await;
    }
}
