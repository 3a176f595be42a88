use thiserror::Error;

/// Error taxonomy for the relay hub and node agent.
///
/// Every I/O path returns `Result<_, RelayError>`; request handlers convert
/// errors into routed error responses instead of propagating panics.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Registration rejected: {0}")]
    Registration(String),

    #[error("No nodes available to serve the request")]
    NoCapacity,

    #[error("Dispatch timed out after {deadline_ms}ms (call {call_id})")]
    DispatchTimeout { call_id: String, deadline_ms: u64 },

    #[error("Node {operator} disconnected with call in flight")]
    NodeDisconnected { operator: String },

    #[error("Upstream RPC error: {0}")]
    Upstream(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Whether a failed operation is worth retrying (agent reconnect loop,
    /// stats fallback). Auth and registration rejections are final.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, RelayError::Auth(_) | RelayError::Registration(_) | RelayError::Config(_))
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Internal(format!("serialization: {}", err))
    }
}
