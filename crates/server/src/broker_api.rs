// Broker node API served by `townhall-server broker`; `RemoteBroker` is its client.
use crate::error::ApiError;
use crate::relay::pump;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use townhall_engine::Broker;
use townhall_protocol::{Offset, ProduceRequest, Record, RecordMetadata, TopicConfig, TopicSpec};

#[derive(Clone)]
pub struct BrokerState {
    pub broker: Arc<dyn Broker>,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub offset: Offset,
}

pub async fn list_topics(State(state): State<BrokerState>) -> Result<Json<Vec<TopicSpec>>, ApiError> {
    Ok(Json(state.broker.topics().await?))
}

pub async fn create_topic(
    State(state): State<BrokerState>,
    Path(name): Path<String>,
    Json(config): Json<TopicConfig>,
) -> Result<StatusCode, ApiError> {
    state.broker.create_topic(&name, &config).await?;
    tracing::info!(topic = %name, partitions = config.partitions, "topic created");
    Ok(StatusCode::CREATED)
}

pub async fn produce(
    State(state): State<BrokerState>,
    Path(name): Path<String>,
    Json(req): Json<ProduceRequest>,
) -> Result<Json<RecordMetadata>, ApiError> {
    let meta = state.broker.send(&name, &req.key, &req.value).await?;
    tracing::debug!(topic = %name, partition = meta.partition, offset = meta.offset, "record appended");
    Ok(Json(meta))
}

fn record_frame(record: &Record) -> Option<String> {
    match serde_json::to_string(record) {
        Ok(text) => Some(text),
        Err(err) => {
            tracing::warn!(topic = %record.topic, offset = record.offset, error = %err, "skipping unserializable record");
            None
        }
    }
}

/// Opens the consumer before upgrading so a missing topic or partition is an
/// HTTP error the client can decode.
pub async fn stream_partition(
    State(state): State<BrokerState>,
    Path((name, partition)): Path<(String, u32)>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let records = state.broker.stream(&name, partition, query.offset).await?;
    tracing::debug!(topic = %name, partition, offset = %query.offset, "remote consumer attached");
    Ok(ws.on_upgrade(move |socket| async move {
        let exit = pump(socket, records, |record| record_frame(&record)).await;
        tracing::debug!(topic = %name, partition, ?exit, "remote consumer detached");
    }))
}
