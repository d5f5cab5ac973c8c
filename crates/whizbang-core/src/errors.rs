//! Error types for `whizbang-core`.
//!
//! Grounded on `control-plane-api/src/envelope.rs`'s `Rejection`: a small
//! `thiserror` enum at the public boundary so callers can match on failure
//! kind, with `#[from]`/`#[source]` wiring the underlying `sqlx`/`serde_json`
//! errors in directly instead of a hand-written `Display` impl.

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("database error")]
    Database(#[from] sqlx::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),
}
