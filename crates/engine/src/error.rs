use std::time::Duration;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("broker unreachable at {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },
    #[error("timed out after {timeout:?} connecting to {endpoint}")]
    ConnectTimeout { endpoint: String, timeout: Duration },
    #[error("broker not initialized")]
    NotInitialized,
    #[error("topic already exists: {0}")]
    TopicAlreadyExists(String),
    #[error("topic not found: {0}")]
    TopicNotFound(String),
    #[error("partition not found: topic={topic} partition={partition}")]
    PartitionNotFound { topic: String, partition: u32 },
    #[error("invalid topic name: {0:?}")]
    InvalidTopicName(String),
    #[error("invalid topic config: {0}")]
    InvalidConfig(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("stream failed: {0}")]
    Stream(String),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl BrokerError {
    /// True for failures that mean the broker itself is gone, as opposed to a
    /// bad request against a live broker.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectTimeout { .. } | Self::NotInitialized
        )
    }
}
