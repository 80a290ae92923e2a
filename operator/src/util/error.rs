use crate::vpsie::VpsieError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    KubeError {
        #[from]
        source: kube::Error,
    },

    #[error("VPSie API error: {source}")]
    VpsieError {
        #[from]
        source: VpsieError,
    },

    #[error("Invalid user input: {0}")]
    UserInputError(String),

    #[error("Transient error: {0}")]
    TransientError(String),

    #[error("Fatal error: {0}")]
    FatalError(String),

    #[error("Eviction blocked by a disruption budget: {0}")]
    PdbBlocked(String),

    #[error("Drain of node {node} failed: {reason}")]
    DrainFailed { node: String, reason: String },

    #[error("Failed to parse DateTime: {source}")]
    ChronoError {
        #[from]
        source: chrono::ParseError,
    },

    #[error("Json error: {source}")]
    JsonError {
        #[from]
        source: serde_json::Error,
    },

    #[error("Parse duration: {source}")]
    ParseDurationError {
        #[from]
        source: parse_duration::parse::Error,
    },
}

impl Error {
    /// Returns true when a retry with backoff is worthwhile: the cloud
    /// taxonomy's transient classes, resource-store conflicts, and
    /// anything explicitly marked transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::VpsieError { source } => source.is_transient(),
            Error::TransientError(_) => true,
            Error::KubeError { source } => is_conflict(source),
            _ => false,
        }
    }
}

/// Returns true if the kube error is an optimistic-concurrency conflict
/// (HTTP 409). A conflict is a signal to re-read and requeue, never a
/// reason to overwrite.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Returns true if the kube error is a 404.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
