use thiserror::Error;

/// Failure reported by the messaging collaborator behind a [`LogConsumer`]
/// or [`LogProducer`].
///
/// Only the classification is owned here: transport-level retries happen
/// inside the collaborator, the wrappers in this crate decide whether a
/// failure is worth another attempt.
///
/// [`LogConsumer`]: crate::backend::LogConsumer
/// [`LogProducer`]: crate::backend::LogProducer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("client closed")]
    Closed,
}

impl BackendError {
    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout(_) | BackendError::Interrupted(_) | BackendError::Broker(_)
        )
    }
}

/// Errors surfaced by [`ConsumerClient`](crate::ConsumerClient) and
/// [`ProducerClient`](crate::ProducerClient).
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("{operation} failed: {source}")]
    Fatal {
        operation: &'static str,
        #[source]
        source: BackendError,
    },

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error("{operation} failed transiently: {source}")]
    Transient {
        operation: &'static str,
        #[source]
        source: BackendError,
    },
}

impl Error {
    /// Classify a backend failure for a non-retried operation.
    pub fn classify(operation: &'static str, source: BackendError) -> Self {
        if source.is_retriable() {
            Error::Transient { operation, source }
        } else {
            Error::Fatal { operation, source }
        }
    }

    /// Fatal errors must tear down the owning subscription.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Transient { .. })
    }

    /// The backend failure that caused this error.
    pub fn backend_error(&self) -> &BackendError {
        match self {
            Error::Fatal { source, .. }
            | Error::RetriesExhausted { source, .. }
            | Error::Transient { source, .. } => source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_errors() {
        assert!(BackendError::Timeout("commit".into()).is_retriable());
        assert!(BackendError::Interrupted("poll".into()).is_retriable());
        assert!(BackendError::Broker("coordinator not available".into()).is_retriable());
        assert!(!BackendError::IllegalState("already subscribed".into()).is_retriable());
        assert!(!BackendError::InvalidArgument("bad offset".into()).is_retriable());
        assert!(!BackendError::Authorization("denied".into()).is_retriable());
        assert!(!BackendError::Closed.is_retriable());
    }

    #[test]
    fn test_classify() {
        let err = Error::classify("seek", BackendError::Timeout("slow".into()));
        assert!(!err.is_fatal());

        let err = Error::classify("seek", BackendError::IllegalState("not assigned".into()));
        assert!(err.is_fatal());
        assert_eq!(
            err.backend_error(),
            &BackendError::IllegalState("not assigned".into())
        );
    }

    #[test]
    fn test_retries_exhausted_is_fatal() {
        let err = Error::RetriesExhausted {
            operation: "commit",
            attempts: 4,
            source: BackendError::Timeout("request timed out".into()),
        };
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "commit failed after 4 attempts: timeout: request timed out"
        );
    }
}
