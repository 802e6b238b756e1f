//! Error types for the chat relay.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Storage failures from the chat store or the queue journal.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failures talking to the assist service.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Upstream returned status {status}: {snippet}")]
    Status { status: u16, snippet: String },

    #[error("Upstream attempt timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Upstream transport failure: {reason}")]
    Transport { reason: String },

    #[error("Invalid upstream response: {reason}")]
    InvalidResponse { reason: String },
}

impl UpstreamError {
    /// HTTP-equivalent status for this failure.
    pub fn status(&self) -> u16 {
        match self {
            Self::Status { status, .. } => *status,
            Self::Timeout { .. } => 504,
            Self::Transport { .. } | Self::InvalidResponse { .. } => 502,
        }
    }
}

/// Malformed enqueue requests. These never become jobs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message is required for action 1")]
    MessageRequired,

    #[error("unsupported action {0}")]
    UnsupportedAction(i64),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} exceeded its deadline of {deadline:?}")]
    DeadlineExceeded { id: Uuid, deadline: Duration },
}

/// Authentication failures.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Unauthorized")]
    Unauthorized,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_mapping() {
        let err = UpstreamError::Status {
            status: 503,
            snippet: "busy".into(),
        };
        assert_eq!(err.status(), 503);
        assert_eq!(
            UpstreamError::Timeout {
                after: Duration::from_secs(1)
            }
            .status(),
            504
        );
        assert_eq!(
            UpstreamError::Transport {
                reason: "refused".into()
            }
            .status(),
            502
        );
    }

    #[test]
    fn storage_error_converts_to_top_level() {
        let err: Error = DatabaseError::Query("boom".into()).into();
        assert_eq!(err.to_string(), "Database error: Query failed: boom");
    }
}
