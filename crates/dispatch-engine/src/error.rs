//! Structured error kinds and the retry policy callers key off of.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("global channel pool is full")]
    GlobalFull,

    #[error("trunk '{0}' channel pool is full")]
    TrunkFull(String),

    #[error("phone {0} is blacklisted for this project")]
    Blacklisted(String),

    #[error("unknown project {0}")]
    UnknownProject(i64),

    #[error("no active trunk available for project {0}")]
    NoTrunkAvailable(i64),

    #[error("client ip {0} is not authorized for this project")]
    IpNotAuthorized(String),

    #[error("invalid phone number: {0}")]
    InvalidPhone(String),

    #[error("switch error: {0}")]
    Switch(#[from] apicall_switch_core::SwitchError),

    #[error("originate request failed: {0}")]
    OriginateFailed(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("orchestration error: {0}")]
    Orchestration(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn orchestration(msg: impl Into<String>) -> Self {
        EngineError::Orchestration(msg.into())
    }

    /// Whether a caller (campaign layer) should consider this failure
    /// retryable (admission and infrastructure hiccups) versus terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::GlobalFull
                | EngineError::TrunkFull(_)
                | EngineError::Switch(_)
                | EngineError::Database(_)
        )
    }
}
