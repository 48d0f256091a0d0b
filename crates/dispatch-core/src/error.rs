//! Error taxonomy for the dispatch core. Transient/infrastructure failures
//! (DB, network) live in `dispatch-server`'s own error type; everything here
//! is a pure-logic failure the caller can act on without retrying.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
