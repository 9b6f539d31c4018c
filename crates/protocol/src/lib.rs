use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use time::macros::format_description;
use time::OffsetDateTime;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
pub fn now_iso8601() -> String {
    let format =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");
    OffsetDateTime::now_utc()
        .format(format)
        .unwrap_or_else(|_| "1970-01-01T00:00:00.000Z".to_string())
}

/// A chat line as it travels through the topic log.
///
/// Every field is optional on input: the relay accepts partial bodies and
/// fills `id`/`timestamp`. Numbers and booleans are kept as their JSON text,
/// so a `Date.now()` id arrives as `"1700000000000"`. Absent fields are left
/// out of the JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(
        default,
        rename = "type",
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(
        default,
        alias = "content",
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

impl ChatMessage {
    pub fn new(sender: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sender: Some(sender.into()),
            message: Some(message.into()),
            ..Self::default()
        }
        .with_defaults()
    }

    /// Fill `id` with the current Unix millis and `timestamp` with now.
    pub fn with_defaults(mut self) -> Self {
        if self.id.as_deref().map_or(true, str::is_empty) {
            self.id = Some(now_ms().to_string());
        }
        if self.timestamp.as_deref().map_or(true, str::is_empty) {
            self.timestamp = Some(now_iso8601());
        }
        self
    }

    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }
}

/// Body of `POST /send-message`.
pub type SendMessageRequest = ChatMessage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub success: bool,
}

impl SendMessageResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"error\":{:?}}}", self.error))
    }
}

/// Position a consumer binds to when its stream starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Offset {
    Beginning,
    End,
    Absolute(u64),
}

impl Default for Offset {
    fn default() -> Self {
        Self::End
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Beginning => f.write_str("beginning"),
            Self::End => f.write_str("end"),
            Self::Absolute(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOffsetError(String);

impl fmt::Display for ParseOffsetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid offset: {:?}", self.0)
    }
}

impl std::error::Error for ParseOffsetError {}

impl FromStr for Offset {
    type Err = ParseOffsetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "beginning" | "start" => Ok(Self::Beginning),
            "end" | "latest" => Ok(Self::End),
            other => other
                .parse::<u64>()
                .map(Self::Absolute)
                .map_err(|_| ParseOffsetError(s.to_string())),
        }
    }
}

impl Serialize for Offset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Offset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Index(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Index(n) => Ok(Self::Absolute(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    #[serde(default = "default_one")]
    pub partitions: u32,
    #[serde(default = "default_one")]
    pub replication_factor: u32,
    #[serde(default = "default_true")]
    pub ignore_rack_assignment: bool,
}

fn default_one() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            partitions: 1,
            replication_factor: 1,
            ignore_rack_assignment: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSpec {
    pub name: String,
    pub config: TopicConfig,
}

/// One entry of a partition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    #[serde(default)]
    pub key: String,
    pub value: String,
    pub timestamp_ms: i64,
}

impl Record {
    pub fn value_str(&self) -> &str {
        &self.value
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub partition: u32,
    pub offset: u64,
}

/// Body of the broker node's append endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceRequest {
    #[serde(default)]
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstructionStatus {
    Pending,
    Approved,
    Rejected,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceBundle {
    pub materials: f64,
    pub labor: f64,
    pub energy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstructionUpdate {
    pub token_id: u64,
    pub status: ConstructionStatus,
    pub progress: f64,
    pub estimated_completion: String,
    pub resources: ResourceBundle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Materials,
    Labor,
    Energy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUpdate {
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    pub amount: f64,
    pub source: String,
    pub timestamp: String,
}

/// Envelope relay listeners dispatch on. Frames without `data` are handed
/// to listeners whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

pub mod topics {
    pub const CHAT_MESSAGES: &str = "chat-messages";
    pub const TOWNHALL_CHAT: &str = "townhall-chat";
    pub const CONSTRUCTION_UPDATES: &str = "construction-updates";
    pub const RESOURCE_UPDATES: &str = "resource-updates";

    pub fn city_chat(city_id: u64) -> String {
        format!("city-{city_id}-chat")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_message_gets_numeric_id_and_iso_timestamp() {
        let msg: ChatMessage =
            serde_json::from_str(r#"{"type":"chat","sender":"Alice","message":"hello"}"#).unwrap();
        let msg = msg.with_defaults();
        assert!(msg.id().chars().all(|c| c.is_ascii_digit()));
        let ts = msg.timestamp.as_deref().unwrap();
        assert_eq!(ts.len(), "2024-01-01T00:00:00.000Z".len());
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[10..11], "T");
    }

    #[test]
    fn caller_supplied_id_and_timestamp_are_kept() {
        let msg = ChatMessage {
            id: Some("abc".into()),
            timestamp: Some("2020-02-02T00:00:00.000Z".into()),
            ..ChatMessage::default()
        }
        .with_defaults();
        assert_eq!(msg.id(), "abc");
        assert_eq!(msg.timestamp.as_deref(), Some("2020-02-02T00:00:00.000Z"));
    }

    #[test]
    fn content_alias_and_absent_fields() {
        let msg: ChatMessage =
            serde_json::from_str(r#"{"id":"1","sender":"Player","content":"hi"}"#).unwrap();
        assert_eq!(msg.message.as_deref(), Some("hi"));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({"id":"1","sender":"Player","message":"hi"}));
    }

    #[test]
    fn scalar_fields_are_kept_as_text() {
        let msg: ChatMessage = serde_json::from_str(
            r#"{"id":1700000000000,"sender":"Bob","message":42,"type":null,"timestamp":true}"#,
        )
        .unwrap();
        assert_eq!(msg.id(), "1700000000000");
        assert_eq!(msg.message.as_deref(), Some("42"));
        assert_eq!(msg.kind, None);
        assert_eq!(msg.timestamp.as_deref(), Some("true"));

        let nested: ChatMessage = serde_json::from_str(r#"{"message":{"text":"hi"}}"#).unwrap();
        assert_eq!(nested.message.as_deref(), Some(r#"{"text":"hi"}"#));
    }

    #[test]
    fn offsets_parse_symbolic_and_numeric() {
        assert_eq!("beginning".parse::<Offset>().unwrap(), Offset::Beginning);
        assert_eq!("latest".parse::<Offset>().unwrap(), Offset::End);
        assert_eq!("END".parse::<Offset>().unwrap(), Offset::End);
        assert_eq!("42".parse::<Offset>().unwrap(), Offset::Absolute(42));
        assert!("-1".parse::<Offset>().is_err());
        let from_json: Offset = serde_json::from_str("7").unwrap();
        assert_eq!(from_json, Offset::Absolute(7));
        assert_eq!(serde_json::to_string(&Offset::Beginning).unwrap(), "\"beginning\"");
    }

    #[test]
    fn construction_update_uses_camel_case() {
        let update = ConstructionUpdate {
            token_id: 3,
            status: ConstructionStatus::Approved,
            progress: 0.5,
            estimated_completion: "2025-01-01T00:00:00.000Z".into(),
            resources: ResourceBundle {
                materials: 1.0,
                labor: 2.0,
                energy: 3.0,
            },
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["tokenId"], 3);
        assert_eq!(json["status"], "approved");
        assert!(json.get("estimatedCompletion").is_some());
    }

    #[test]
    fn city_topic_names() {
        assert_eq!(topics::city_chat(12), "city-12-chat");
    }
}
