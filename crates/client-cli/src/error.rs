use shared::ValidationError;
use thiserror::Error;

use crate::api::ApiError;

/// What a run or scheduler operation reports back to the caller.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Rejected locally, nothing was sent
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Non-2xx status, network failure or undecodable body
    #[error("{0}")]
    Transport(String),

    /// The service answered but reported failure
    #[error("{0}")]
    Service(String),
}

impl From<ApiError> for ClientError {
    fn from(err: ApiError) -> Self {
        ClientError::Transport(err.to_string())
    }
}

impl ClientError {
    pub fn is_validation(&self) -> bool {
        matches!(self, ClientError::Validation(_))
    }
}
