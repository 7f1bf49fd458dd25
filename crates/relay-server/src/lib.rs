pub mod config;
pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod server;

pub use config::{RateLimitConfig, ServerConfig};
pub use error::{ApiError, ServerError};
pub use server::{build_router, start, start_with_state, AppState, ServerHandle};
