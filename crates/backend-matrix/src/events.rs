//! Room event decoding.
//!
//! Events arrive as loosely-typed JSON. Decoding reads the common envelope
//! first, then parses `content` into the variant named by the `type` tag.
//! Anything unrecognized, or with content that fails to parse, becomes
//! [`EventKind::Unknown`] instead of failing the batch.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

pub const HTML_FORMAT: &str = "org.matrix.custom.html";

/// Common envelope shared by every room event.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub origin_server_ts: u64,
    #[serde(default)]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: Value,
}

impl RawEvent {
    /// Read one envelope. A field of the wrong shape falls back to its
    /// default instead of rejecting the event.
    pub fn from_value(value: Value) -> Self {
        match Self::deserialize(&value) {
            Ok(raw) => raw,
            Err(err) => {
                let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_owned);
                let raw = Self {
                    event_type: text("type").unwrap_or_default(),
                    event_id: text("event_id").unwrap_or_default(),
                    sender: text("sender").unwrap_or_default(),
                    origin_server_ts: value
                        .get("origin_server_ts")
                        .and_then(Value::as_u64)
                        .unwrap_or_default(),
                    state_key: text("state_key"),
                    content: value.get("content").cloned().unwrap_or_default(),
                };
                debug!(event_type = %raw.event_type, event_id = %raw.event_id, error = %err, "malformed event envelope");
                raw
            }
        }
    }
}

/// Decode an `events` array one entry at a time so a single malformed event
/// cannot fail the whole batch.
pub(crate) fn lenient_events<'de, D>(deserializer: D) -> Result<Vec<RawEvent>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Option::<Vec<Value>>::deserialize(deserializer)?;
    Ok(values
        .unwrap_or_default()
        .into_iter()
        .map(RawEvent::from_value)
        .collect())
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoomEvent {
    pub event_id: String,
    pub sender: String,
    pub origin_server_ts: u64,
    pub state_key: Option<String>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Message(MessageContent),
    Reaction(Relation),
    Member(MemberContent),
    Name(NameContent),
    CanonicalAlias(CanonicalAliasContent),
    Create(CreateContent),
    Topic(TopicContent),
    Unknown { event_type: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageContent {
    #[serde(flatten)]
    pub body: MessageBody,
    #[serde(rename = "m.relates_to", default)]
    pub relates_to: Option<Relation>,
    #[serde(rename = "m.mentions", default)]
    pub mentions: Option<Mentions>,
}

impl MessageContent {
    pub fn relation_type(&self) -> Option<&str> {
        self.relates_to
            .as_ref()
            .and_then(|relation| relation.rel_type.as_deref())
    }

    /// Thread root when this message belongs to a thread.
    pub fn thread_root(&self) -> Option<&str> {
        self.relates_to
            .as_ref()
            .filter(|relation| relation.rel_type.as_deref() == Some("m.thread"))
            .and_then(|relation| relation.event_id.as_deref())
    }

    pub fn is_edit(&self) -> bool {
        self.relation_type() == Some("m.replace")
    }
}

/// Message content, discriminated by `msgtype`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "msgtype")]
pub enum MessageBody {
    #[serde(rename = "m.text")]
    Text(TextContent),
    #[serde(rename = "m.notice")]
    Notice(TextContent),
    #[serde(rename = "m.emote")]
    Emote(TextContent),
    #[serde(rename = "m.image")]
    Image(ImageContent),
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TextContent {
    pub body: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub formatted_body: Option<String>,
}

impl TextContent {
    pub fn html(&self) -> Option<&str> {
        match self.format.as_deref() {
            Some(HTML_FORMAT) => self.formatted_body.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImageContent {
    /// Caption or file name.
    pub body: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Relation {
    #[serde(default)]
    pub rel_type: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
    /// Annotation key for reactions.
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Mentions {
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(default)]
    pub room: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Join,
    Invite,
    Leave,
    Ban,
    Knock,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MemberContent {
    pub membership: Membership,
    #[serde(default)]
    pub displayname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NameContent {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CanonicalAliasContent {
    #[serde(default)]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CreateContent {
    #[serde(default)]
    pub creator: Option<String>,
    #[serde(rename = "type", default)]
    pub room_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TopicContent {
    #[serde(default)]
    pub topic: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReactionContent {
    #[serde(rename = "m.relates_to")]
    relates_to: Relation,
}

impl RoomEvent {
    pub fn decode(raw: RawEvent) -> Self {
        let RawEvent {
            event_type,
            event_id,
            sender,
            origin_server_ts,
            state_key,
            content,
        } = raw;

        let kind = match event_type.as_str() {
            "m.room.message" => parse(&event_type, content).map(EventKind::Message),
            "m.reaction" => parse::<ReactionContent>(&event_type, content)
                .filter(|reaction| reaction.relates_to.rel_type.as_deref() == Some("m.annotation"))
                .map(|reaction| EventKind::Reaction(reaction.relates_to)),
            "m.room.member" => parse(&event_type, content).map(EventKind::Member),
            "m.room.name" => parse(&event_type, content).map(EventKind::Name),
            "m.room.canonical_alias" => parse(&event_type, content).map(EventKind::CanonicalAlias),
            "m.room.create" => parse(&event_type, content).map(EventKind::Create),
            "m.room.topic" => parse(&event_type, content).map(EventKind::Topic),
            _ => None,
        }
        .unwrap_or(EventKind::Unknown { event_type });

        Self {
            event_id,
            sender,
            origin_server_ts,
            state_key,
            kind,
        }
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }
}

fn parse<T: serde::de::DeserializeOwned>(event_type: &str, content: Value) -> Option<T> {
    match serde_json::from_value(content) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            debug!(event_type, error = %err, "undecodable event content");
            None
        }
    }
}
