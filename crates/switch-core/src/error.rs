use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("switch request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("switch connection is disconnected")]
    Disconnected,

    #[error("switch rejected the request: {0}")]
    Rejected(String),

    #[error("io error talking to switch: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed control channel response: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, SwitchError>;
