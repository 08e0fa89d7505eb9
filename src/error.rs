use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// No track to load, or the pipeline/radio could not be brought up.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("cannot {operation} while {state}")]
    InvalidTransition {
        operation: &'static str,
        state: &'static str,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage fault: {0}")]
    StorageFault(String),

    #[error("track store is empty")]
    Empty,
}

impl Error {
    pub fn invalid(operation: &'static str, state: &'static str) -> Self {
        Self::InvalidTransition { operation, state }
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
