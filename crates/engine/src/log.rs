// Partition log storage behind the in-process broker.
use crate::broker::validate_topic_config;
use crate::error::{BrokerError, Result};
use std::collections::BTreeMap;
use townhall_protocol::{Record, TopicConfig, TopicSpec};

/// Append-only storage for partitioned topics.
///
/// Callers serialize access and validate topic/partition before `append` and
/// `read_from`; stores only guarantee consecutive offsets per partition.
pub trait LogStore: Send {
    fn create_topic(&mut self, name: &str, config: &TopicConfig) -> Result<()>;

    fn topic(&self, name: &str) -> Result<Option<TopicConfig>>;

    fn topics(&self) -> Result<Vec<TopicSpec>>;

    fn append(
        &mut self,
        topic: &str,
        partition: u32,
        key: &str,
        value: &str,
        timestamp_ms: i64,
    ) -> Result<u64>;

    /// Every record with offset >= `from`, in order.
    fn read_from(&self, topic: &str, partition: u32, from: u64) -> Result<Vec<Record>>;

    /// Offset the next append to this partition will get.
    fn next_offset(&self, topic: &str, partition: u32) -> Result<u64>;
}

#[derive(Debug)]
struct MemoryTopic {
    config: TopicConfig,
    partitions: Vec<Vec<Record>>,
}

/// Volatile store; records live as long as the broker.
#[derive(Debug, Default)]
pub struct MemoryLog {
    topics: BTreeMap<String, MemoryTopic>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, topic: &str, partition: u32) -> Result<&Vec<Record>> {
        let t = self
            .topics
            .get(topic)
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?;
        t.partitions
            .get(partition as usize)
            .ok_or_else(|| BrokerError::PartitionNotFound {
                topic: topic.to_string(),
                partition,
            })
    }
}

impl LogStore for MemoryLog {
    fn create_topic(&mut self, name: &str, config: &TopicConfig) -> Result<()> {
        validate_topic_config(config)?;
        if self.topics.contains_key(name) {
            return Err(BrokerError::TopicAlreadyExists(name.to_string()));
        }
        self.topics.insert(
            name.to_string(),
            MemoryTopic {
                config: *config,
                partitions: vec![Vec::new(); config.partitions as usize],
            },
        );
        Ok(())
    }

    fn topic(&self, name: &str) -> Result<Option<TopicConfig>> {
        Ok(self.topics.get(name).map(|t| t.config))
    }

    fn topics(&self) -> Result<Vec<TopicSpec>> {
        Ok(self
            .topics
            .iter()
            .map(|(name, t)| TopicSpec {
                name: name.clone(),
                config: t.config,
            })
            .collect())
    }

    fn append(
        &mut self,
        topic: &str,
        partition: u32,
        key: &str,
        value: &str,
        timestamp_ms: i64,
    ) -> Result<u64> {
        let log = self
            .topics
            .get_mut(topic)
            .and_then(|t| t.partitions.get_mut(partition as usize))
            .ok_or_else(|| BrokerError::PartitionNotFound {
                topic: topic.to_string(),
                partition,
            })?;
        let offset = log.len() as u64;
        log.push(Record {
            topic: topic.to_string(),
            partition,
            offset,
            key: key.to_string(),
            value: value.to_string(),
            timestamp_ms,
        });
        Ok(offset)
    }

    fn read_from(&self, topic: &str, partition: u32, from: u64) -> Result<Vec<Record>> {
        let log = self.partition(topic, partition)?;
        let start = usize::try_from(from).unwrap_or(usize::MAX).min(log.len());
        Ok(log[start..].to_vec())
    }

    fn next_offset(&self, topic: &str, partition: u32) -> Result<u64> {
        Ok(self.partition(topic, partition)?.len() as u64)
    }
}
