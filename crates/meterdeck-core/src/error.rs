use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("request cancelled")]
    Cancelled,
    #[error("unauthorized: credential rejected by gateway")]
    Unauthorized,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected http status {0}")]
    UnexpectedStatus(u16),
    #[error("unexpected response format: {0}")]
    Format(String),
    #[error("command rejected: {0}")]
    Rejected(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ControlError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ControlError::Cancelled)
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ControlError::Unauthorized)
    }

    /// Short machine-readable code used in notices and log fields.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::Cancelled => "cancelled",
            ControlError::Unauthorized => "unauthorized",
            ControlError::Transport(_) => "transport",
            ControlError::UnexpectedStatus(_) => "http_status",
            ControlError::Format(_) => "format",
            ControlError::Rejected(_) => "rejected",
            ControlError::InvalidRequest(_) => "invalid_request",
        }
    }
}
