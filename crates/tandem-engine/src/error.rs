//! Engine error types

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("log client error: {0}")]
    Client(#[from] tandem_client::Error),

    #[error(
        "partition count mismatch: event topic {event_topic} has {event_partitions}, \
         state topic {state_topic} has {state_partitions}"
    )]
    PartitionCountMismatch {
        event_topic: String,
        event_partitions: u32,
        state_topic: String,
        state_partitions: u32,
    },

    #[error("metadata lookup failed: {0}")]
    Metadata(#[from] tandem_client::BackendError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("engine task failed: {0}")]
    TaskFailed(String),
}

impl EngineError {
    /// Check if this error must tear down the engine
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Client(e) => e.is_fatal(),
            EngineError::Codec(_) => false,
            _ => true,
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        EngineError::TaskFailed(e.to_string())
    }
}

/// Failure raised by a [`StateAndEventProcessor`](crate::StateAndEventProcessor).
///
/// The event is not committed and will be delivered again.
#[derive(Debug, Clone, Error)]
#[error("processor failed: {message}")]
pub struct ProcessorError {
    pub message: String,
}

impl ProcessorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
