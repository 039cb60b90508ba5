use std::{sync::Arc, time::Duration};

/// Error type for this crate.
///
/// The type is [`Clone`] so that a single failed round trip can be reported to every
/// pending handle of a [`Pipeline`](crate::Pipeline).
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmissionError {
    /// Redis error (network failure or an error reply from the server).
    #[error("redis error: {0}")]
    Redis(Arc<redis::RedisError>),

    /// The round trip to Redis did not complete within the configured timeout.
    ///
    /// The outcome is unknown: the scripts may or may not have been applied.
    #[error("redis round trip timed out after {0:?}")]
    Timeout(Duration),

    /// Scripts kept disappearing from the Redis script cache after reloading them.
    #[error("scripts still missing after {attempts} attempts")]
    TooManyRetries {
        /// Number of attempts made before giving up.
        attempts: usize,
    },

    /// Redis answered with a reply whose shape does not match what was sent.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid limit, prefix or request id. Raised before contacting Redis.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The script reply for a single key could not be decoded.
    #[error("unexpected reply for key {key}: {reason}")]
    UnexpectedReply {
        /// Key whose reply was malformed.
        key: String,
        /// What was wrong with the reply.
        reason: String,
    },

    /// A pending pipeline result was read before the pipeline was executed.
    #[error("pipeline result is not resolved")]
    Unresolved,
}

impl From<redis::RedisError> for AdmissionError {
    fn from(err: redis::RedisError) -> Self {
        Self::Redis(Arc::new(err))
    }
}

impl AdmissionError {
    /// Whether Redis rejected an invocation because the script is not in its cache.
    pub(crate) fn is_missing_script(&self) -> bool {
        match self {
            Self::Redis(err) => {
                err.kind() == redis::ErrorKind::Server(redis::ServerErrorKind::NoScript)
            }
            _ => false,
        }
    }
}
