//! Relay Error Types
//!
//! One error enum covers the relay's fallible seams: broker calls and
//! persistence calls. Handlers decide per call site whether a failure
//! closes the session or just drops the frame (see the session module).

use thiserror::Error;

/// Errors surfaced by the relay's collaborators.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Broker connection, declaration, publish, or consume failure.
    #[error("broker error: {0}")]
    Bus(String),

    /// Persistence collaborator failure.
    #[error("storage error: {0}")]
    Store(String),
}

impl From<lapin::Error> for RelayError {
    fn from(err: lapin::Error) -> Self {
        RelayError::Bus(err.to_string())
    }
}
