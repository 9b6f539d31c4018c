use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::Arc;
use townhall_engine::{Backend, Consumer, Delivery, Endpoint, Producer, StreamingService};
use townhall_protocol::{topics, ConstructionUpdate, Offset, ResourceUpdate, TopicConfig};

/// Typed publish/subscribe over the construction and resource topics.
///
/// Streams always start at offset 0 so a new subscriber sees the full
/// history. Records that do not decode are logged and skipped.
pub struct UpdatesFeed {
    service: Arc<StreamingService>,
    construction: Producer,
    resources: Producer,
}

impl UpdatesFeed {
    pub async fn connect(backend: Backend, endpoint: &Endpoint) -> Result<Self> {
        let service = Arc::new(StreamingService::new(backend));
        service.initialize(endpoint).await?;
        Self::from_service(service).await
    }

    /// Uses an already initialized service and ensures both topics exist.
    pub async fn from_service(service: Arc<StreamingService>) -> Result<Self> {
        for topic in [topics::CONSTRUCTION_UPDATES, topics::RESOURCE_UPDATES] {
            service.ensure_topic(topic, &TopicConfig::default()).await?;
        }
        Ok(Self {
            construction: service.producer(topics::CONSTRUCTION_UPDATES),
            resources: service.producer(topics::RESOURCE_UPDATES),
            service,
        })
    }

    pub async fn publish_construction_update(&self, update: &ConstructionUpdate) -> Result<Delivery> {
        publish(&self.construction, update).await
    }

    pub async fn publish_resource_update(&self, update: &ResourceUpdate) -> Result<Delivery> {
        publish(&self.resources, update).await
    }

    pub async fn stream_construction_updates<F>(&self, on_update: F) -> Result<()>
    where
        F: FnMut(ConstructionUpdate) -> ControlFlow<()>,
    {
        let consumer = self.service.consumer(topics::CONSTRUCTION_UPDATES, 0);
        stream_typed(&consumer, on_update).await
    }

    pub async fn stream_resource_updates<F>(&self, on_update: F) -> Result<()>
    where
        F: FnMut(ResourceUpdate) -> ControlFlow<()>,
    {
        let consumer = self.service.consumer(topics::RESOURCE_UPDATES, 0);
        stream_typed(&consumer, on_update).await
    }

    pub fn disconnect(&self) {
        self.service.disconnect();
    }
}

async fn publish<T: Serialize>(producer: &Producer, update: &T) -> Result<Delivery> {
    let value = serde_json::to_string(update)?;
    Ok(producer.send("", &value).await?)
}

async fn stream_typed<T, F>(consumer: &Consumer, mut on_update: F) -> Result<()>
where
    T: DeserializeOwned,
    F: FnMut(T) -> ControlFlow<()>,
{
    let topic = consumer.topic().to_string();
    consumer
        .for_each(Offset::Absolute(0), |record| match record.decode::<T>() {
            Ok(update) => on_update(update),
            Err(err) => {
                tracing::warn!(%topic, offset = record.offset, error = %err, "skipping malformed update");
                ControlFlow::Continue(())
            }
        })
        .await?;
    Ok(())
}
