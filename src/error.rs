use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("failed to connect to Telegram: {0}")]
    Connection(String),
    #[error("flood wait, retry after {0:?}")]
    FloodWait(Duration),
    #[error("authorization required: {0}")]
    AuthRequired(String),
    #[error("rpc call failed: {0}")]
    Rpc(String),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(#[from] redis::RedisError),
    #[error("consumer group error: {0}")]
    ConsumerGroup(String),
    #[error("malformed stream entry {id}: {message}")]
    MalformedEntry { id: String, message: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(String),
}

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("put object failed for key {key}: {message}")]
    Put { key: String, message: String },
    #[error("head object failed for key {key}: {message}")]
    Head { key: String, message: String },
    #[error("get object failed for key {key}: {message}")]
    Get { key: String, message: String },
}

/// Result of an operation that can legitimately need a retry-after delay (flood wait),
/// fail in a way the caller's normal retry loop should absorb (transient), or fail in a
/// way that only a dead-letter path can handle (permanent). Stands in for exception-driven
/// control flow: callers match on this instead of branching on an exception hierarchy.
#[derive(Debug)]
pub enum Outcome<T> {
    Ok(T),
    FloodWait(Duration),
    Transient(anyhow::Error),
    Permanent(anyhow::Error),
}

impl<T> Outcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn into_result(self) -> anyhow::Result<T> {
        match self {
            Outcome::Ok(v) => Ok(v),
            Outcome::FloodWait(d) => Err(anyhow::anyhow!("flood wait: {d:?}")),
            Outcome::Transient(e) => Err(e.context("transient failure")),
            Outcome::Permanent(e) => Err(e.context("permanent failure")),
        }
    }
}
