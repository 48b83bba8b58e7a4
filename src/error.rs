//! Error types for kledger

use thiserror::Error;

/// Coarse classification of a [`ChainError`], used by the transports to pick
/// a wire code and status without matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MissingParameter,
    InvalidParameter,
    AuthFailed,
    AddressNotFound,
    BlockNotFound,
    WebhookNotFound,
    InsufficientFunds,
    MiningDisabled,
    Storage,
    Config,
}

impl ErrorKind {
    /// Wire code reported in `{ok:false, error}` bodies.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::MissingParameter => "missing_parameter",
            ErrorKind::InvalidParameter => "invalid_parameter",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::AddressNotFound => "address_not_found",
            ErrorKind::BlockNotFound => "block_not_found",
            ErrorKind::WebhookNotFound => "webhook_not_found",
            ErrorKind::InsufficientFunds => "insufficient_funds",
            ErrorKind::MiningDisabled => "mining_disabled",
            ErrorKind::Storage | ErrorKind::Config => "server_error",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("Authentication failed")]
    AuthFailed,
    #[error("Address not found: {0}")]
    AddressNotFound(String),
    #[error("Block not found at height {0}")]
    BlockNotFound(u64),
    #[error("Webhook not found: {0}")]
    WebhookNotFound(u64),
    #[error("Insufficient funds in {0}")]
    InsufficientFunds(String),
    #[error("Mining is disabled")]
    MiningDisabled,
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Config error: {0}")]
    ConfigError(String),
}

impl ChainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::MissingParameter(_) => ErrorKind::MissingParameter,
            ChainError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            ChainError::AuthFailed => ErrorKind::AuthFailed,
            ChainError::AddressNotFound(_) => ErrorKind::AddressNotFound,
            ChainError::BlockNotFound(_) => ErrorKind::BlockNotFound,
            ChainError::WebhookNotFound(_) => ErrorKind::WebhookNotFound,
            ChainError::InsufficientFunds(_) => ErrorKind::InsufficientFunds,
            ChainError::MiningDisabled => ErrorKind::MiningDisabled,
            ChainError::DatabaseError(_) | ChainError::IoError(_) => ErrorKind::Storage,
            ChainError::ConfigError(_) => ErrorKind::Config,
        }
    }

    /// Name of the offending request field, for parameter errors.
    pub fn parameter(&self) -> Option<&'static str> {
        match self {
            ChainError::MissingParameter(p) | ChainError::InvalidParameter(p) => Some(p),
            _ => None,
        }
    }

    /// `{ok:false, error, parameter?}` as sent to HTTP and websocket clients.
    pub fn body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({ "ok": false, "error": self.kind().code() });
        if let Some(parameter) = self.parameter() {
            body["parameter"] = serde_json::Value::from(parameter);
        }
        body
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

impl From<toml::de::Error> for ChainError {
    fn from(err: toml::de::Error) -> Self {
        ChainError::ConfigError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
