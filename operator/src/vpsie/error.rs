/// Classified errors surfaced by the VPSie API client. Downstream code
/// matches on the kind, never on message strings.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VpsieError {
    #[error("resource not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("rate limited by the provider")]
    RateLimited,

    #[error("server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("client error ({status}): {message}")]
    ClientError { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("request timed out")]
    Timeout,
}

impl VpsieError {
    /// Returns true for error classes where a retry with backoff is
    /// expected to eventually succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VpsieError::RateLimited
                | VpsieError::ServerError { .. }
                | VpsieError::Network(_)
                | VpsieError::CircuitOpen
                | VpsieError::Timeout
        )
    }

    /// Stable label identifying the error class, suitable for metric
    /// label values.
    pub fn kind(&self) -> &'static str {
        match self {
            VpsieError::NotFound => "not_found",
            VpsieError::Unauthorized => "unauthorized",
            VpsieError::Forbidden => "forbidden",
            VpsieError::RateLimited => "rate_limited",
            VpsieError::ServerError { .. } => "server_error",
            VpsieError::ClientError { .. } => "client_error",
            VpsieError::Network(_) => "network",
            VpsieError::CircuitOpen => "circuit_open",
            VpsieError::Timeout => "timeout",
        }
    }

    /// Classifies a non-2xx HTTP response status.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 => VpsieError::Unauthorized,
            403 => VpsieError::Forbidden,
            404 => VpsieError::NotFound,
            429 => VpsieError::RateLimited,
            400..=499 => VpsieError::ClientError { status, message },
            _ => VpsieError::ServerError { status, message },
        }
    }
}

impl From<reqwest::Error> for VpsieError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            VpsieError::Timeout
        } else {
            VpsieError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_classify_into_the_taxonomy() {
        assert!(matches!(VpsieError::from_status(401, String::new()), VpsieError::Unauthorized));
        assert!(matches!(VpsieError::from_status(403, String::new()), VpsieError::Forbidden));
        assert!(matches!(VpsieError::from_status(404, String::new()), VpsieError::NotFound));
        assert!(matches!(VpsieError::from_status(429, String::new()), VpsieError::RateLimited));
        assert!(matches!(
            VpsieError::from_status(422, String::new()),
            VpsieError::ClientError { status: 422, .. }
        ));
        assert!(matches!(
            VpsieError::from_status(503, String::new()),
            VpsieError::ServerError { status: 503, .. }
        ));
    }

    #[test]
    fn transient_classes_are_retryable() {
        assert!(VpsieError::RateLimited.is_transient());
        assert!(VpsieError::CircuitOpen.is_transient());
        assert!(VpsieError::Timeout.is_transient());
        assert!(VpsieError::Network("reset".into()).is_transient());
        assert!(!VpsieError::NotFound.is_transient());
        assert!(!VpsieError::Unauthorized.is_transient());
    }
}
