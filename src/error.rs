/// Error taxonomy for the dispatch path
use thiserror::Error;

/// Failure of a single forwarded call to a backend
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ForwardError {
    /// The call did not complete within the node's timeout
    #[error("backend request timed out")]
    Timeout,
    /// Connection or protocol level failure
    #[error("backend request failed: {0}")]
    Io(String),
}

/// Errors produced while planning or executing a dispatch
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// No API matches the request
    #[error("no api matches the request")]
    NoRouteMatch,
    /// Cluster missing or without an eligible server
    #[error("no live server in cluster {cluster}")]
    NoLiveServer { cluster: u64 },
    /// Transport failure talking to the backend
    #[error(transparent)]
    Upstream(#[from] ForwardError),
    /// Backend answered with an error status
    #[error("backend responded with status {0}")]
    BackendStatus(u16),
    /// Routing rule expression could not be evaluated
    #[error("routing rule {rule} evaluation failed: {reason}")]
    RuleEvaluation { rule: u64, reason: String },
}

impl DispatchError {
    /// HTTP status surfaced to the caller for this error
    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::NoRouteMatch => 404,
            DispatchError::NoLiveServer { .. } => 503,
            DispatchError::Upstream(ForwardError::Timeout) => 504,
            DispatchError::Upstream(ForwardError::Io(_)) => 502,
            DispatchError::BackendStatus(status) => *status,
            DispatchError::RuleEvaluation { .. } => 500,
        }
    }
}
