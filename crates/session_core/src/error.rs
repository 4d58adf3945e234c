use shared::error::ErrorList;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("backend rejected request: {0}")]
    Application(ErrorList),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("request aborted: superseded by a newer session operation")]
    Cancelled,
    #[error("No token found")]
    NoToken,
    #[error("User logged out")]
    LoggedOut,
}

impl SessionError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SessionError::Cancelled)
    }

    pub fn errors(&self) -> Option<&ErrorList> {
        match self {
            SessionError::Application(errors) => Some(errors),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(value: reqwest::Error) -> Self {
        SessionError::Transport(value.to_string())
    }
}
