// src/errors.rs

use std::time::Duration;

use serde_json::Error as SerdeError;
use thiserror::Error;

use crate::broker::QueueState;

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("connection is already started")]
    AlreadyStarted,

    #[error("connection is not started")]
    NotStarted,

    #[error("connection is not established")]
    NotEstablished,

    #[error("initial connection failed after {retries} attempts")]
    MaxRetriesExceeded { retries: u32 },

    #[error("subscription {consumer_tag} could not be disposed after {attempts} attempts")]
    DisposeRetriesExceeded { consumer_tag: String, attempts: u32 },

    #[error("queue {queue} is {state:?}, expected open")]
    InvalidQueueState { queue: String, state: QueueState },

    #[error("invalid message: {0}")]
    MessageValidation(String),

    #[error("request {correlation_id} timed out after {timeout:?}")]
    RequestTimedOut {
        correlation_id: String,
        timeout: Duration,
    },

    #[error("remote {name}: {message}")]
    RemoteError { name: String, message: String },

    #[error("message serialization error: {0}")]
    Serialization(#[from] SerdeError),

    #[error("broker transport error: {0}")]
    Transport(String),
}

// Custom Result type for messenger operations
pub type Result<T> = std::result::Result<T, MessengerError>;

impl MessengerError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        MessengerError::MessageValidation(message.into())
    }

    /// Terminal errors are never worth another teardown attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessengerError::InvalidQueueState { .. } | MessengerError::DisposeRetriesExceeded { .. }
        )
    }
}

impl From<crate::broker::TransportError> for MessengerError {
    fn from(error: crate::broker::TransportError) -> Self {
        MessengerError::Transport(error.to_string())
    }
}
