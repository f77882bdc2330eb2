use thiserror::Error;

/// The error taxonomy exposed to callers.
///
/// Most of these never reach a caller directly (see the crate-level docs on
/// propagation policy): `ConnectFailed` drives reconnection, `Timeout` is
/// recorded in a [`crate::PublishOutcome`] or completes a blocking query
/// with a partial result, `VerificationFailed`/`DecodeError` are logged and
/// silently dropped. Only `DuplicateSubscription`, `InvalidUrl` (for a
/// publish that can't resolve any relay), and `Disposed` surface as an
/// `Err` from a public operation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("timed out waiting for a response")]
    Timeout,

    #[error("subscription id already in use: {0}")]
    DuplicateSubscription(String),

    #[error("invalid relay url: {0}")]
    InvalidUrl(String),

    #[error("pool is disposed")]
    Disposed,

    #[error("event verification failed: {0}")]
    VerificationFailed(String),

    #[error("could not decode relay message: {0}")]
    DecodeError(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
