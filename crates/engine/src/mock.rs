use crate::broker::{Broker, RecordStream};
use crate::error::Result;
use async_trait::async_trait;
use futures_util::stream;
use futures_util::StreamExt;
use townhall_protocol::{Offset, RecordMetadata, TopicConfig, TopicSpec};

/// Offline stand-in: logs every call and delivers nothing.
///
/// Streams stay open forever without yielding, so consumers built on it never
/// see a record. Use [`crate::LocalBroker::memory`] when delivery matters.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockBroker;

impl MockBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for MockBroker {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn create_topic(&self, name: &str, config: &TopicConfig) -> Result<()> {
        tracing::info!(topic = name, partitions = config.partitions, "mock broker: create topic");
        Ok(())
    }

    async fn topics(&self) -> Result<Vec<TopicSpec>> {
        Ok(Vec::new())
    }

    async fn send(&self, topic: &str, key: &str, value: &str) -> Result<RecordMetadata> {
        tracing::info!(topic, key, value, "mock broker: message sent");
        Ok(RecordMetadata {
            partition: 0,
            offset: 0,
        })
    }

    async fn stream(&self, topic: &str, partition: u32, offset: Offset) -> Result<RecordStream> {
        tracing::info!(topic, partition, %offset, "mock broker: consumer created");
        Ok(stream::pending().boxed())
    }
}
