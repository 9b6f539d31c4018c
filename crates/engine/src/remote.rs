// Client for a broker node's HTTP/WebSocket API.
use crate::broker::{validate_topic_name, Broker, Endpoint, RecordStream};
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use reqwest::StatusCode;
use std::time::Duration;
use tokio_tungstenite::tungstenite::{self, Message};
use townhall_protocol::{
    ErrorBody, Offset, ProduceRequest, Record, RecordMetadata, TopicConfig, TopicSpec,
};

/// Broker reached over the network at an [`Endpoint`].
#[derive(Debug, Clone)]
pub struct RemoteBroker {
    endpoint: Endpoint,
    http: reqwest::Client,
}

impl RemoteBroker {
    /// Opens a client and checks that the node answers `/health`.
    pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| connection_error(endpoint, e))?;
        let resp = http
            .get(endpoint.http_url("/health"))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| connection_error(endpoint, e))?;
        if !resp.status().is_success() {
            return Err(BrokerError::Connection {
                endpoint: endpoint.to_string(),
                reason: format!("health check returned {}", resp.status()),
            });
        }
        tracing::debug!(%endpoint, "remote broker reachable");
        Ok(Self {
            endpoint: endpoint.clone(),
            http,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn request_error(&self, err: reqwest::Error) -> BrokerError {
        if err.is_connect() || err.is_timeout() {
            connection_error(&self.endpoint, err)
        } else {
            BrokerError::Send(err.to_string())
        }
    }
}

fn connection_error(endpoint: &Endpoint, err: impl std::fmt::Display) -> BrokerError {
    BrokerError::Connection {
        endpoint: endpoint.to_string(),
        reason: err.to_string(),
    }
}

/// Maps a broker node error response back onto [`BrokerError`].
fn decode_error(status: StatusCode, body: &str, topic: &str, partition: Option<u32>) -> BrokerError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .map(|b| b.error.clone())
        .unwrap_or_else(|| format!("broker returned {status}"));
    let code = parsed.and_then(|b| b.code).unwrap_or_default();
    match (status, code.as_str()) {
        (_, "topic_exists") | (StatusCode::CONFLICT, _) => {
            BrokerError::TopicAlreadyExists(topic.to_string())
        }
        (_, "partition_not_found") => BrokerError::PartitionNotFound {
            topic: topic.to_string(),
            partition: partition.unwrap_or_default(),
        },
        (_, "topic_not_found") | (StatusCode::NOT_FOUND, _) => {
            BrokerError::TopicNotFound(topic.to_string())
        }
        (_, "invalid_topic_name") => BrokerError::InvalidTopicName(topic.to_string()),
        (_, "invalid_config") | (StatusCode::BAD_REQUEST, _) => BrokerError::InvalidConfig(message),
        _ => BrokerError::Send(message),
    }
}

#[async_trait]
impl Broker for RemoteBroker {
    fn kind(&self) -> &'static str {
        "remote"
    }

    async fn create_topic(&self, name: &str, config: &TopicConfig) -> Result<()> {
        validate_topic_name(name)?;
        let resp = self
            .http
            .put(self.endpoint.http_url(&format!("/topics/{name}")))
            .json(config)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(decode_error(status, &body, name, None))
    }

    async fn topics(&self) -> Result<Vec<TopicSpec>> {
        let resp = self
            .http
            .get(self.endpoint.http_url("/topics"))
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(decode_error(status, &body, "", None));
        }
        resp.json()
            .await
            .map_err(|e| BrokerError::Send(format!("decode topic list: {e}")))
    }

    async fn send(&self, topic: &str, key: &str, value: &str) -> Result<RecordMetadata> {
        validate_topic_name(topic)?;
        let resp = self
            .http
            .post(self.endpoint.http_url(&format!("/topics/{topic}/records")))
            .json(&ProduceRequest {
                key: key.to_string(),
                value: value.to_string(),
            })
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(decode_error(status, &body, topic, None));
        }
        resp.json()
            .await
            .map_err(|e| BrokerError::Send(format!("decode record metadata: {e}")))
    }

    async fn stream(&self, topic: &str, partition: u32, offset: Offset) -> Result<RecordStream> {
        validate_topic_name(topic)?;
        let url = self.endpoint.ws_url(&format!(
            "/topics/{topic}/partitions/{partition}/stream?offset={offset}"
        ));
        let (ws, _resp) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(pair) => pair,
            Err(tungstenite::Error::Http(resp)) => {
                let body = resp
                    .body()
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                return Err(decode_error(resp.status(), &body, topic, Some(partition)));
            }
            Err(e @ tungstenite::Error::Io(_)) => {
                return Err(connection_error(&self.endpoint, e));
            }
            Err(e) => return Err(BrokerError::Stream(e.to_string())),
        };
        tracing::debug!(topic, partition, %offset, endpoint = %self.endpoint, "remote consumer attached");

        // The socket is the consumer: dropping the stream closes it and the
        // node releases its side.
        let records = stream::unfold(Some(ws), |state| async move {
            let mut ws = state?;
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let item = serde_json::from_str::<Record>(text.as_str())
                            .map_err(BrokerError::from);
                        return Some((item, Some(ws)));
                    }
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Some((Err(BrokerError::Stream(e.to_string())), None)),
                }
            }
        });
        Ok(records.boxed())
    }
}
