//! Error types for the session worker.

use std::time::Duration;

/// Top-level error type for the worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration section {section}: {reason}")]
    ParseError { section: String, reason: String },
}

/// Errors talking to the coordinator's task and record API.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Coordinator returned status {status} for {method}: {body}")]
    UnexpectedStatus {
        method: String,
        status: u16,
        body: String,
    },

    #[error("Coordinator rejected {method}: {message}")]
    Api { method: String, message: String },

    #[error("Failed to decode response for {method}: {reason}")]
    Decode { method: String, reason: String },

    #[error("Login failed for user {user}: {reason}")]
    Login { user: String, reason: String },

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },
}

/// Errors reported by a remote collection store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout while communicating with the store")]
    Timeout,

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store session expired")]
    SessionExpired,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Local IO error on {path}: {source}")]
    LocalIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{operation} failed after {attempts} attempts")]
    RetriesExhausted { operation: String, attempts: u32 },
}

impl StoreError {
    /// Errors worth tearing the session down and trying again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout | Self::Unavailable(_) | Self::SessionExpired
        )
    }

    /// The "object or collection absent" branch, which callers treat as a value.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StoreError::Timeout
        } else if e.is_connect() || e.is_request() || e.is_body() {
            StoreError::Network(e.to_string())
        } else if e.is_decode() {
            StoreError::Protocol(e.to_string())
        } else {
            StoreError::Network(e.to_string())
        }
    }
}

/// Failures that abort a whole tree copy.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Local directory {0} does not exist")]
    LocalRootMissing(String),

    #[error("Collection {0} could not be created or reached")]
    CollectionUnavailable(String),

    #[error("Collection could not be created for {collection} because of: {source}")]
    Store {
        collection: String,
        #[source]
        source: StoreError,
    },
}

/// Errors raised while processing a single task.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Unknown action {0}")]
    UnknownAction(String),

    #[error("Task {task_id} is missing argument '{name}'")]
    MissingArgument { task_id: String, name: String },

    #[error("Task {task_id} has invalid argument '{name}': {reason}")]
    InvalidArgument {
        task_id: String,
        name: String,
        reason: String,
    },

    #[error("Coordinator request failed: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StoreError::Network("reset".into()).is_transient());
        assert!(StoreError::Timeout.is_transient());
        assert!(StoreError::Unavailable("503".into()).is_transient());
        assert!(StoreError::SessionExpired.is_transient());

        assert!(!StoreError::NotFound("/zone/x".into()).is_transient());
        assert!(!StoreError::PermissionDenied("/zone/x".into()).is_transient());
        assert!(!StoreError::InvalidPath("x".into()).is_transient());
    }

    #[test]
    fn not_found_is_its_own_branch() {
        assert!(StoreError::NotFound("/zone/x".into()).is_not_found());
        assert!(!StoreError::Timeout.is_not_found());
    }

    #[test]
    fn unknown_action_message() {
        let e = TaskError::UnknownAction("bogus".into());
        assert_eq!(e.to_string(), "Unknown action bogus");
    }
}
