/// Failures reported by a completion provider for a single downstream call.
///
/// Every status-derived variant renders as `"<Provider> API error: <status>"`.
/// The queue retries every variant the same way; the classification only
/// feeds logging and the passthrough error responses.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("{provider} API error: {status}")]
    AuthenticationFailed {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("{provider} API error: {status}")]
    InvalidRequest {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("{provider} API error: {status}")]
    RateLimited {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("{provider} API error: {status}")]
    ServerError {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("request timed out")]
    Timeout,
}

impl GatewayError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed { .. } => "authentication_failed",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Timeout => "timeout",
        }
    }

    /// Classify a non-success HTTP status from `provider`.
    pub fn from_status(provider: &str, status: u16, body: String) -> Self {
        let provider = provider.to_owned();
        match status {
            401 | 403 => Self::AuthenticationFailed { provider, status, body },
            400 | 404 | 422 => Self::InvalidRequest { provider, status, body },
            429 => Self::RateLimited { provider, status, body },
            _ => Self::ServerError { provider, status, body },
        }
    }

    /// The message with the upstream response body appended, as
    /// `"<Provider> API error: <status> - <body>"`.
    pub fn detail(&self) -> String {
        match self {
            Self::AuthenticationFailed { body, .. }
            | Self::InvalidRequest { body, .. }
            | Self::RateLimited { body, .. }
            | Self::ServerError { body, .. }
                if !body.is_empty() =>
            {
                format!("{self} - {body}")
            }
            _ => self.to_string(),
        }
    }
}
