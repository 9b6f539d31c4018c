//! Connection manager shared by the relay and the client adapters.
//!
//! A [`StreamingService`] is built once per process and handed around by
//! `Arc`. [`Producer`] and [`Consumer`] handles keep a reference to it, so a
//! handle taken before the broker is reachable starts working as soon as a
//! later [`StreamingService::initialize`] succeeds. Until then sends are
//! skipped and streams are empty.
use crate::broker::{Broker, Endpoint, RecordStream};
use crate::error::{BrokerError, Result};
use crate::remote::RemoteBroker;
use futures_util::{stream, StreamExt};
use parking_lot::RwLock;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use townhall_protocol::{Offset, Record, RecordMetadata, TopicConfig};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where [`StreamingService::initialize`] gets its broker from.
#[derive(Clone)]
pub enum Backend {
    /// A broker node at the endpoint passed to `initialize`.
    Remote,
    /// A broker already living in this process; the endpoint is ignored.
    InProcess(Arc<dyn Broker>),
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote => f.write_str("Remote"),
            Self::InProcess(b) => write!(f, "InProcess({})", b.kind()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicStatus {
    Created,
    Existing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Appended(RecordMetadata),
    /// The service was not connected; nothing was sent.
    Skipped,
}

/// Attempts and linear backoff for startup connection.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

pub struct StreamingService {
    backend: Backend,
    connect_timeout: Duration,
    broker: RwLock<Option<Arc<dyn Broker>>>,
}

impl StreamingService {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            broker: RwLock::new(None),
        }
    }

    pub fn in_process(broker: Arc<dyn Broker>) -> Self {
        Self::new(Backend::InProcess(broker))
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub async fn initialize(&self, endpoint: &Endpoint) -> Result<()> {
        let broker: Arc<dyn Broker> = match &self.backend {
            Backend::Remote => {
                let connect = RemoteBroker::connect(endpoint, self.connect_timeout);
                let remote = tokio::time::timeout(self.connect_timeout, connect)
                    .await
                    .map_err(|_| BrokerError::ConnectTimeout {
                        endpoint: endpoint.to_string(),
                        timeout: self.connect_timeout,
                    })??;
                Arc::new(remote)
            }
            Backend::InProcess(broker) => broker.clone(),
        };
        tracing::info!(backend = broker.kind(), %endpoint, "connected to broker");
        *self.broker.write() = Some(broker);
        Ok(())
    }

    /// Retries [`Self::initialize`], sleeping `backoff * attempt` between
    /// tries, and returns the last error once the budget is spent.
    pub async fn initialize_with_retry(&self, endpoint: &Endpoint, policy: RetryPolicy) -> Result<()> {
        let attempts = policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.initialize(endpoint).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < attempts => {
                    tracing::warn!(attempt, attempts, error = %err, "broker connection failed, retrying");
                    tokio::time::sleep(policy.backoff * attempt).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.broker.read().is_some()
    }

    /// Drops the broker connection. Handles go back to no-ops.
    pub fn disconnect(&self) {
        if self.broker.write().take().is_some() {
            tracing::info!("disconnected from broker");
        }
    }

    pub fn broker(&self) -> Option<Arc<dyn Broker>> {
        self.broker.read().clone()
    }

    pub async fn ensure_topic(&self, name: &str, config: &TopicConfig) -> Result<TopicStatus> {
        let broker = self.broker().ok_or(BrokerError::NotInitialized)?;
        match broker.create_topic(name, config).await {
            Ok(()) => {
                tracing::info!(topic = name, "created topic");
                Ok(TopicStatus::Created)
            }
            Err(BrokerError::TopicAlreadyExists(_)) => {
                tracing::info!(topic = name, "using existing topic");
                Ok(TopicStatus::Existing)
            }
            Err(err) => Err(err),
        }
    }

    pub fn producer(self: &Arc<Self>, topic: impl Into<String>) -> Producer {
        Producer {
            service: self.clone(),
            topic: topic.into(),
        }
    }

    pub fn consumer(self: &Arc<Self>, topic: impl Into<String>, partition: u32) -> Consumer {
        Consumer {
            service: self.clone(),
            topic: topic.into(),
            partition,
        }
    }
}

#[derive(Clone)]
pub struct Producer {
    service: Arc<StreamingService>,
    topic: String,
}

impl Producer {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_ready(&self) -> bool {
        self.service.is_initialized()
    }

    pub async fn send(&self, key: &str, value: &str) -> Result<Delivery> {
        let Some(broker) = self.service.broker() else {
            tracing::debug!(topic = %self.topic, "send skipped, broker not initialized");
            return Ok(Delivery::Skipped);
        };
        let meta = broker.send(&self.topic, key, value).await?;
        Ok(Delivery::Appended(meta))
    }
}

#[derive(Clone)]
pub struct Consumer {
    service: Arc<StreamingService>,
    topic: String,
    partition: u32,
}

impl Consumer {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn is_ready(&self) -> bool {
        self.service.is_initialized()
    }

    /// Records from `offset` onward. Empty when the service is not connected.
    pub async fn stream(&self, offset: Offset) -> Result<RecordStream> {
        let Some(broker) = self.service.broker() else {
            tracing::debug!(topic = %self.topic, "stream skipped, broker not initialized");
            return Ok(stream::empty().boxed());
        };
        broker.stream(&self.topic, self.partition, offset).await
    }

    /// Calls `on_record` for each record until it breaks or the stream ends.
    /// The next record is not pulled until the callback returns.
    pub async fn for_each<F>(&self, offset: Offset, mut on_record: F) -> Result<()>
    where
        F: FnMut(Record) -> ControlFlow<()>,
    {
        let mut records = self.stream(offset).await?;
        while let Some(record) = records.next().await {
            if on_record(record?).is_break() {
                break;
            }
        }
        Ok(())
    }
}
