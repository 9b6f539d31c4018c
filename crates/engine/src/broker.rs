use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use regex::Regex;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::LazyLock;
use townhall_protocol::{Offset, Record, RecordMetadata, TopicConfig, TopicSpec};

/// Records from one partition, in log order. Dropping the stream releases
/// the consumer on the broker side.
pub type RecordStream = BoxStream<'static, Result<Record>>;

/// Producer/consumer surface every broker backend provides.
#[async_trait]
pub trait Broker: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Creates `name`. Fails with [`BrokerError::TopicAlreadyExists`] when it
    /// is already there.
    async fn create_topic(&self, name: &str, config: &TopicConfig) -> Result<()>;

    async fn topics(&self) -> Result<Vec<TopicSpec>>;

    async fn send(&self, topic: &str, key: &str, value: &str) -> Result<RecordMetadata>;

    async fn stream(&self, topic: &str, partition: u32, offset: Offset) -> Result<RecordStream>;
}

static TOPIC_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,62}$").expect("topic name regex"));

pub fn validate_topic_name(name: &str) -> Result<()> {
    if TOPIC_NAME.is_match(name) {
        Ok(())
    } else {
        Err(BrokerError::InvalidTopicName(name.to_string()))
    }
}

/// Upper bound on partitions per topic. Partition logs are allocated up front.
pub const MAX_PARTITIONS: u32 = 1024;

pub fn validate_topic_config(config: &TopicConfig) -> Result<()> {
    if config.partitions == 0 {
        return Err(BrokerError::InvalidConfig(
            "partitions must be at least 1".to_string(),
        ));
    }
    if config.partitions > MAX_PARTITIONS {
        return Err(BrokerError::InvalidConfig(format!(
            "partitions must be at most {MAX_PARTITIONS}, got {}",
            config.partitions
        )));
    }
    if config.replication_factor == 0 {
        return Err(BrokerError::InvalidConfig(
            "replication_factor must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// `host:port` of a broker node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

pub const DEFAULT_BROKER_PORT: u16 = 9003;

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}:{}{}", self.host, self.port, path)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_BROKER_PORT)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::new(v4.ip().to_string(), v4.port()),
            SocketAddr::V6(v6) => Self::new(format!("[{}]", v6.ip()), v6.port()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = String;

    /// Accepts `host:port` or a bare host, which gets the default port.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let s = s
            .strip_prefix("http://")
            .or_else(|| s.strip_prefix("ws://"))
            .unwrap_or(s)
            .trim_end_matches('/');
        if s.is_empty() {
            return Err("empty endpoint".to_string());
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port in endpoint {s:?}"))?;
                Ok(Self::new(host, port))
            }
            Some(_) => Err(format!("missing host in endpoint {s:?}")),
            None => Ok(Self::new(s, DEFAULT_BROKER_PORT)),
        }
    }
}
