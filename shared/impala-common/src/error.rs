//! Error types for the Impala row client

use thiserror::Error;

/// Result alias used across the client crates
pub type ImpalaResult<T> = Result<T, ImpalaError>;

/// Impala client errors
///
/// Cloneable so a single outcome can be handed to every waiter of a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImpalaError {
    /// Connection or socket broken mid-operation; the connection is recycled
    #[error("Transport error: {0}")]
    Transport(String),

    /// The engine rejected a statement; the connection stays usable
    #[error("Server error: {0}")]
    Server(String),

    /// Row type and result/schema disagree, or no codec exists for a type
    #[error("Schema error: {0}")]
    Schema(String),

    /// A message carried a lease id that is not the connection's current lease
    #[error("Lease rejected: {0}")]
    LeaseRejected(String),

    /// A bounded wait elapsed without a reply
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller supplied an unusable request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The component that should answer is gone
    #[error("Client shut down: {0}")]
    Shutdown(String),
}

/// Server messages that mean a range partition is already in place.
const PARTITION_RACE_MARKERS: &[&str] = &["already exists", "overlap", "conflicts with existing"];

impl ImpalaError {
    /// Transport failures are the only errors that recycle a connection
    pub fn is_transport(&self) -> bool {
        matches!(self, ImpalaError::Transport(_))
    }

    /// Server rejection raised when a concurrent bootstrap created the same range first
    pub fn is_partition_race(&self) -> bool {
        match self {
            ImpalaError::Server(message) => {
                let message = message.to_lowercase();
                PARTITION_RACE_MARKERS
                    .iter()
                    .any(|marker| message.contains(marker))
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ImpalaError {
    fn from(err: serde_json::Error) -> Self {
        ImpalaError::Config(err.to_string())
    }
}

impl From<anyhow::Error> for ImpalaError {
    fn from(err: anyhow::Error) -> Self {
        ImpalaError::Config(format!("{:#}", err))
    }
}

impl From<std::env::VarError> for ImpalaError {
    fn from(err: std::env::VarError) -> Self {
        ImpalaError::Config(err.to_string())
    }
}
