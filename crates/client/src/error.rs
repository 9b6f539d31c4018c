use townhall_engine::BrokerError;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("message is empty")]
    EmptyMessage,
    #[error("message must be about the game")]
    OffTopic,
    #[error("relay request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay returned {status}: {message}")]
    Relay { status: u16, message: String },
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
}
