//! Clients for the relay: [`RelayClient`] posts messages over HTTP and
//! [`RelayFeed`] listens on the relay WebSocket.
use crate::error::{ClientError, Result};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use townhall_protocol::{ChatMessage, ErrorBody};

#[derive(Debug, Clone)]
pub struct RelayClient {
    base_url: String,
    http: reqwest::Client,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn send_message(&self, msg: &ChatMessage) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/send-message", self.base_url))
            .json(msg)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(body);
        Err(ClientError::Relay {
            status: status.as_u16(),
            message,
        })
    }
}

/// Linear backoff: the n-th retry waits `base_delay * n`.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedExit {
    /// [`FeedHandle::disconnect`] was called or the handle dropped.
    Disconnected,
    /// Reconnect budget spent.
    GaveUp,
}

/// Relay WebSocket listener with per-`type` dispatch.
///
/// Frames are JSON objects; listeners registered for the frame's `type`
/// receive its `data` field, or the whole frame when there is none.
#[derive(Clone)]
pub struct RelayFeed {
    url: String,
    policy: ReconnectPolicy,
    listeners: Arc<Mutex<HashMap<String, Vec<(ListenerId, Listener)>>>>,
    next_id: Arc<AtomicU64>,
}

impl RelayFeed {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            policy: ReconnectPolicy::default(),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn subscribe<F>(&self, kind: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .entry(kind.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, kind: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(list) = listeners.get_mut(kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(l, _)| *l != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(kind);
        }
        removed
    }

    /// Routes one text frame; returns how many listeners ran.
    pub fn dispatch(&self, text: &str) -> usize {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring non-JSON relay frame");
                return 0;
            }
        };
        let Some(kind) = frame.get("type").and_then(Value::as_str) else {
            tracing::debug!("relay frame without type");
            return 0;
        };
        let payload = frame.get("data").unwrap_or(&frame);
        // Snapshot so listeners may (un)subscribe while running.
        let targets: Vec<Listener> = self
            .listeners
            .lock()
            .get(kind)
            .map(|list| list.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();
        for listener in &targets {
            listener(payload);
        }
        targets.len()
    }

    pub fn spawn(&self) -> FeedHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.clone().run(stop_rx));
        FeedHandle { stop: stop_tx, task }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) -> FeedExit {
        let mut attempts = 0;
        loop {
            match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((mut ws, _)) => {
                    attempts = 0;
                    tracing::info!(url = %self.url, "relay feed connected");
                    loop {
                        tokio::select! {
                            _ = stop.changed() => {
                                let _ = ws.close(None).await;
                                return FeedExit::Disconnected;
                            }
                            frame = ws.next() => match frame {
                                Some(Ok(Message::Text(text))) => {
                                    self.dispatch(text.as_str());
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(err)) => {
                                    tracing::warn!(error = %err, "relay feed read failed");
                                    break;
                                }
                            },
                        }
                    }
                    tracing::info!(url = %self.url, "relay feed closed");
                }
                Err(err) => {
                    tracing::warn!(url = %self.url, error = %err, "relay feed connect failed");
                }
            }

            if attempts >= self.policy.max_attempts {
                tracing::error!(url = %self.url, attempts, "max reconnection attempts reached");
                return FeedExit::GaveUp;
            }
            attempts += 1;
            let delay = self.policy.delay(attempts);
            tracing::info!(attempt = attempts, ?delay, "reconnecting to relay");
            tokio::select! {
                _ = stop.changed() => return FeedExit::Disconnected,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

pub struct FeedHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<FeedExit>,
}

impl FeedHandle {
    /// Stops the feed and waits for the socket to close.
    pub async fn disconnect(self) -> FeedExit {
        let _ = self.stop.send(true);
        self.join().await
    }

    pub async fn join(self) -> FeedExit {
        self.task.await.unwrap_or(FeedExit::Disconnected)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
