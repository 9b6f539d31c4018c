//! Chat rooms that talk to the broker directly instead of going through the
//! relay.
//!
//! A [`ChatRoom`] consumes its topic from the beginning into a local list and
//! produces straight into it. When the broker cannot be reached the room
//! falls back to [`MockBroker`]: sends are logged and only show up locally.
use crate::error::{ClientError, Result};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;
use tokio::task::JoinHandle;
use townhall_engine::{Backend, Endpoint, MockBroker, Producer, StreamingService};
use townhall_protocol::{now_iso8601, now_ms, topics, ChatMessage, Offset, TopicConfig};

const GAME_KEYWORDS: &[&str] = &[
    "game", "quest", "mission", "city", "score", "level", "player", "team", "governance",
    "crisis", "dashboard", "vote", "build", "resource", "strategy", "move", "turn", "win",
    "lose", "play", "objective", "challenge", "event", "action", "collaborate", "ally",
    "opponent", "round", "progress", "upgrade", "reward", "achievement", "leaderboard",
    "competition", "scenario", "simulation", "urban", "district", "civic", "onboarding",
    "proposal", "construction", "infrastructure", "environment", "policy", "community",
    "discussion", "notification", "townhall", "chat",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Room {
    /// Per-city room, `city-{id}-chat`.
    City(u64),
    /// The shared `townhall-chat` room.
    Townhall,
}

impl Room {
    pub fn topic(&self) -> String {
        match self {
            Self::City(id) => topics::city_chat(*id),
            Self::Townhall => topics::TOWNHALL_CHAT.to_string(),
        }
    }

    fn default_sender(&self) -> String {
        match self {
            Self::City(_) => "Player".to_string(),
            Self::Townhall => format!("Player-{}", random_base36(6)),
        }
    }
}

/// Keyword filter: a message passes when it mentions at least one keyword,
/// case-insensitively.
#[derive(Debug, Clone)]
pub struct Moderation {
    keywords: Vec<String>,
}

impl Moderation {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn game_topics() -> Self {
        Self::new(GAME_KEYWORDS)
    }

    pub fn allows(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.keywords.iter().any(|k| lower.contains(k.as_str()))
    }
}

pub struct ChatRoom {
    room: Room,
    topic: String,
    sender: String,
    service: Arc<StreamingService>,
    producer: Producer,
    messages: Arc<Mutex<Vec<ChatMessage>>>,
    moderation: Option<Moderation>,
    mocked: bool,
    consumer_task: JoinHandle<()>,
}

impl ChatRoom {
    pub async fn join(backend: Backend, endpoint: &Endpoint, room: Room) -> Result<Self> {
        let mut service = Arc::new(StreamingService::new(backend));
        let mut mocked = false;
        if let Err(err) = service.initialize(endpoint).await {
            tracing::warn!(%endpoint, error = %err, "broker unreachable, chat falls back to mock broker");
            service = Arc::new(StreamingService::in_process(Arc::new(MockBroker::new())));
            service.initialize(endpoint).await?;
            mocked = true;
        }

        let topic = room.topic();
        service.ensure_topic(&topic, &TopicConfig::default()).await?;

        let messages = Arc::new(Mutex::new(Vec::new()));
        let mut records = service.consumer(topic.clone(), 0).stream(Offset::Beginning).await?;
        let sink = messages.clone();
        let task_topic = topic.clone();
        let consumer_task = tokio::spawn(async move {
            while let Some(next) = records.next().await {
                match next.map(|r| r.decode::<ChatMessage>()) {
                    Ok(Ok(msg)) => push_unique(&sink, msg),
                    Ok(Err(err)) => {
                        tracing::warn!(topic = %task_topic, error = %err, "skipping malformed chat record");
                    }
                    Err(err) => {
                        tracing::error!(topic = %task_topic, error = %err, "chat stream failed");
                        break;
                    }
                }
            }
        });

        tracing::info!(%topic, mocked, "joined chat room");
        Ok(Self {
            room,
            sender: room.default_sender(),
            producer: service.producer(topic.clone()),
            topic,
            service,
            messages,
            moderation: None,
            mocked,
            consumer_task,
        })
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn with_moderation(mut self, moderation: Moderation) -> Self {
        self.moderation = Some(moderation);
        self
    }

    pub fn room(&self) -> Room {
        self.room
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// True when the broker was unreachable and sends only go to the log.
    pub fn is_mocked(&self) -> bool {
        self.mocked
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().clone()
    }

    /// Produces the message and shows it locally once the broker accepted it,
    /// or right away on a mock or disconnected room where the send is
    /// skipped. The copy that comes back on the stream is dropped by id.
    pub async fn send(&self, content: &str) -> Result<ChatMessage> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        if let Some(moderation) = &self.moderation {
            if !moderation.allows(content) {
                return Err(ClientError::OffTopic);
            }
        }

        let msg = ChatMessage {
            id: Some(format!("{}{}", now_ms(), random_base36(9))),
            kind: None,
            sender: Some(self.sender.clone()),
            message: Some(content.to_string()),
            timestamp: Some(now_iso8601()),
        };
        let value = serde_json::to_string(&msg)?;
        self.producer.send("", &value).await?;
        push_unique(&self.messages, msg.clone());
        Ok(msg)
    }

    pub fn leave(self) {}
}

impl Drop for ChatRoom {
    fn drop(&mut self) {
        self.consumer_task.abort();
        self.service.disconnect();
    }
}

fn push_unique(messages: &Mutex<Vec<ChatMessage>>, msg: ChatMessage) {
    let mut messages = messages.lock();
    if msg.id.is_some() && messages.iter().any(|m| m.id == msg.id) {
        return;
    }
    messages.push(msg);
}

fn random_base36(len: usize) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_i64(now_ms());
    let mut n = hasher.finish();
    (0..len)
        .map(|_| {
            let c = ALPHABET[(n % 36) as usize] as char;
            n /= 36;
            c
        })
        .collect()
}
