use std::error::Error as StdError;

use thiserror::Error;

/// The error kinds a Rotif broker can surface, matching the taxonomy in
/// spec.md §7: transport, script, validation, handler and poison-message
/// errors. Deduplication rejections are deliberately not an error variant —
/// they are an observable `PublishOutcome::Duplicate`.
#[derive(Debug, Error)]
pub enum RotifError {
    #[error("transport error: {0}")]
    Transport(#[from] redis::RedisError),

    #[error("script error: {message}")]
    Script { message: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("message handler failed: {0}")]
    Handler(#[source] Box<dyn StdError + Send + Sync>),

    #[error("message {message_id} exceeded {attempts} attempt(s) and was moved to the dead-letter queue")]
    Poison { message_id: String, attempts: u32 },
}

pub type RotifResult<T> = Result<T, RotifError>;
