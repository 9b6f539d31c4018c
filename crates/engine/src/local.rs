// In-process broker: a LogStore plus live fan-out to subscribers.
use crate::broker::{validate_topic_config, validate_topic_name, Broker, RecordStream};
use crate::error::{BrokerError, Result};
use crate::log::{LogStore, MemoryLog};
use crate::sqlite::SqliteLog;
use async_trait::async_trait;
use futures_util::Stream;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use townhall_protocol::{now_ms, Offset, Record, RecordMetadata, TopicConfig, TopicSpec};

type PartitionKey = (String, u32);

struct Inner {
    store: Box<dyn LogStore>,
    subscribers: HashMap<PartitionKey, HashMap<u64, mpsc::UnboundedSender<Record>>>,
    round_robin: u32,
}

impl Inner {
    fn topic_config(&self, topic: &str) -> Result<TopicConfig> {
        self.store
            .topic(topic)?
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))
    }

    fn fan_out(&mut self, record: &Record) {
        let key = (record.topic.clone(), record.partition);
        if let Some(subs) = self.subscribers.get_mut(&key) {
            // Receivers that went away are pruned here as well as by their guard.
            subs.retain(|_, tx| tx.send(record.clone()).is_ok());
            if subs.is_empty() {
                self.subscribers.remove(&key);
            }
        }
    }

    fn pick_partition(&mut self, key: &str, partitions: u32) -> u32 {
        if partitions <= 1 {
            return 0;
        }
        if key.is_empty() {
            let partition = self.round_robin % partitions;
            self.round_robin = self.round_robin.wrapping_add(1);
            return partition;
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % u64::from(partitions)) as u32
    }
}

/// Broker that lives inside this process.
///
/// Appends and subscriptions take the same lock, so a subscriber sees the
/// backlog and then the live tail with no gap and no duplicate. Store access
/// runs on the blocking pool since `SqliteLog` hits disk.
pub struct LocalBroker {
    inner: Arc<Mutex<Inner>>,
    next_subscriber: AtomicU64,
    kind: &'static str,
}

impl LocalBroker {
    pub fn new(store: Box<dyn LogStore>, kind: &'static str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                store,
                subscribers: HashMap::new(),
                round_robin: 0,
            })),
            next_subscriber: AtomicU64::new(1),
            kind,
        }
    }

    pub fn memory() -> Self {
        Self::new(Box::new(MemoryLog::new()), "memory")
    }

    pub fn sqlite(db_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::new(Box::new(SqliteLog::open(db_path)?), "sqlite"))
    }

    /// Live subscribers currently attached to `topic`/`partition`.
    pub fn subscriber_count(&self, topic: &str, partition: u32) -> usize {
        self.inner
            .lock()
            .subscribers
            .get(&(topic.to_string(), partition))
            .map_or(0, HashMap::len)
    }

    /// Runs `f` with the lock held on tokio's blocking pool.
    async fn with_inner<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Inner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock();
            f(&mut guard)
        })
        .await
        .map_err(|err| BrokerError::Send(format!("storage task failed: {err}")))?
    }
}

#[async_trait]
impl Broker for LocalBroker {
    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn create_topic(&self, name: &str, config: &TopicConfig) -> Result<()> {
        validate_topic_name(name)?;
        validate_topic_config(config)?;
        let (topic, cfg) = (name.to_string(), *config);
        self.with_inner(move |inner| inner.store.create_topic(&topic, &cfg))
            .await?;
        tracing::debug!(topic = name, partitions = config.partitions, "topic created");
        Ok(())
    }

    async fn topics(&self) -> Result<Vec<TopicSpec>> {
        self.with_inner(|inner| inner.store.topics()).await
    }

    async fn send(&self, topic: &str, key: &str, value: &str) -> Result<RecordMetadata> {
        let (topic, key, value) = (topic.to_string(), key.to_string(), value.to_string());
        self.with_inner(move |inner| {
            let config = inner.topic_config(&topic)?;
            let partition = inner.pick_partition(&key, config.partitions);
            let timestamp_ms = now_ms();
            let offset = inner
                .store
                .append(&topic, partition, &key, &value, timestamp_ms)?;
            let record = Record {
                topic,
                partition,
                offset,
                key,
                value,
                timestamp_ms,
            };
            inner.fan_out(&record);
            Ok(RecordMetadata { partition, offset })
        })
        .await
    }

    async fn stream(&self, topic: &str, partition: u32, offset: Offset) -> Result<RecordStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let key = (topic.to_string(), partition);

        let subscribe_key = key.clone();
        let (start, backlog) = self
            .with_inner(move |inner| {
                let (topic, partition) = (subscribe_key.0.as_str(), subscribe_key.1);
                let config = inner.topic_config(topic)?;
                if partition >= config.partitions {
                    return Err(BrokerError::PartitionNotFound {
                        topic: topic.to_string(),
                        partition,
                    });
                }
                let tail = inner.store.next_offset(topic, partition)?;
                let start = match offset {
                    Offset::Beginning => 0,
                    Offset::End => tail,
                    Offset::Absolute(n) => n,
                };
                let backlog = if start < tail {
                    inner.store.read_from(topic, partition, start)?
                } else {
                    Vec::new()
                };
                inner.subscribers.entry(subscribe_key).or_default().insert(id, tx);
                Ok((start, backlog))
            })
            .await?;

        tracing::debug!(topic, partition, %offset, start, backlog = backlog.len(), "consumer attached");
        Ok(Box::pin(Subscription {
            backlog: backlog.into(),
            rx,
            min_offset: start,
            _guard: SubscriptionGuard {
                inner: Arc::downgrade(&self.inner),
                key,
                id,
            },
        }))
    }
}

struct SubscriptionGuard {
    inner: Weak<Mutex<Inner>>,
    key: PartitionKey,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut inner = inner.lock();
        if let Some(subs) = inner.subscribers.get_mut(&self.key) {
            subs.remove(&self.id);
            if subs.is_empty() {
                inner.subscribers.remove(&self.key);
            }
        }
        tracing::debug!(topic = %self.key.0, partition = self.key.1, "consumer released");
    }
}

struct Subscription {
    backlog: VecDeque<Record>,
    rx: mpsc::UnboundedReceiver<Record>,
    // Absolute offsets past the tail skip live records until the log catches up.
    min_offset: u64,
    _guard: SubscriptionGuard,
}

impl Stream for Subscription {
    type Item = Result<Record>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(record) = this.backlog.pop_front() {
            return Poll::Ready(Some(Ok(record)));
        }
        loop {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(record)) if record.offset < this.min_offset => continue,
                Poll::Ready(Some(record)) => return Poll::Ready(Some(Ok(record))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
