use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionHandle;

/// MIME key for the HTML rendering in [`Message::formatted_bodies`].
pub const MIME_HTML: &str = "text/html";

/// Roster presence. Binary on purpose: there is no away/idle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Presence {
    #[default]
    Online,
    Offline,
}

/// One member of a channel snapshot.
///
/// Scoped to the snapshot it came from; the same person in two channels is two
/// `User` values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct User {
    pub id: String,
    pub provider: String,
    pub alias: String,
    pub display_name: String,
    pub presence: Presence,
    pub is_self: bool,
}

impl User {
    /// Best label for listing this user to humans.
    pub fn label(&self) -> &str {
        if !self.display_name.is_empty() {
            &self.display_name
        } else if !self.alias.is_empty() {
            &self.alias
        } else {
            &self.id
        }
    }
}

/// Complete snapshot of one channel, including its full current roster.
///
/// Equality compares the roster as a set of user IDs, so `[A, B] == [B, A]`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Channel {
    pub id: String,
    pub alias: String,
    pub display_name: String,
    pub users: Vec<User>,
}

impl Channel {
    /// User IDs of the roster as an unordered set.
    pub fn member_ids(&self) -> BTreeSet<&str> {
        self.users.iter().map(|user| user.id.as_str()).collect()
    }

    /// Whether both snapshots list the same members, ignoring order.
    pub fn same_members(&self, other: &Channel) -> bool {
        self.member_ids() == other.member_ids()
    }

    /// Whether `name` refers to this channel by id, alias or display name.
    pub fn matches_name(&self, name: &str) -> bool {
        self.id == name
            || self.alias.eq_ignore_ascii_case(name)
            || self.display_name.eq_ignore_ascii_case(name)
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.alias == other.alias
            && self.display_name == other.display_name
            && self.same_members(other)
    }
}

impl Eq for Channel {}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AttachmentKind {
    #[default]
    Unknown,
    Image,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub name: String,
    pub uri: String,
}

impl Attachment {
    pub fn image(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            kind: AttachmentKind::Image,
            name: name.into(),
            uri: uri.into(),
        }
    }
}

/// One inbound or outbound chat message.
///
/// Built once by the protocol client that received it and never mutated
/// afterwards. `connection` is a weak back-reference used only to call back
/// into the originating connection.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Backend-native id; empty when the backend assigns none.
    pub id: String,
    pub provider: String,
    pub provider_instance: String,
    pub author_id: String,
    pub author_alias: String,
    pub author_display_name: String,
    /// Plain-text body.
    pub body: String,
    /// Alternate renderings keyed by MIME type, for example [`MIME_HTML`].
    pub formatted_bodies: BTreeMap<String, String>,
    pub channel_id: String,
    /// Milliseconds since the Unix epoch.
    pub time_sent_ms: u64,
    /// Thread root id; empty when the message is not threaded.
    pub threading_id: String,
    pub attachments: Vec<Attachment>,
    pub connection: ConnectionHandle,
    pub is_from_self: bool,
    pub is_mentioning_self: bool,
    pub is_private: bool,
}

impl Message {
    /// Start an outgoing message with a plain-text body.
    pub fn outgoing(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_formatted(mut self, mime: impl Into<String>, body: impl Into<String>) -> Self {
        self.formatted_bodies.insert(mime.into(), body.into());
        self
    }

    pub fn formatted(&self, mime: &str) -> Option<&str> {
        self.formatted_bodies.get(mime).map(String::as_str)
    }

    /// Best label for the author.
    pub fn author_label(&self) -> &str {
        if !self.author_display_name.is_empty() {
            &self.author_display_name
        } else if !self.author_alias.is_empty() {
            &self.author_alias
        } else {
            &self.author_id
        }
    }

    pub fn is_threaded(&self) -> bool {
        !self.threading_id.is_empty()
    }
}

/// A reaction on an earlier message.
#[derive(Debug, Clone, Default)]
pub struct Reaction {
    pub id: String,
    pub provider: String,
    pub provider_instance: String,
    pub author_id: String,
    pub author_alias: String,
    pub author_display_name: String,
    pub channel_id: String,
    /// The reacted-to message.
    pub message_id: String,
    /// Normalized emoji/string key.
    pub reaction: String,
    pub time_sent_ms: u64,
    pub connection: ConnectionHandle,
    pub is_from_self: bool,
    pub is_private: bool,
}

impl Reaction {
    pub fn outgoing(message_id: impl Into<String>, reaction: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            reaction: reaction.into(),
            ..Self::default()
        }
    }

    pub fn author_label(&self) -> &str {
        if !self.author_display_name.is_empty() {
            &self.author_display_name
        } else if !self.author_alias.is_empty() {
            &self.author_alias
        } else {
            &self.author_id
        }
    }
}
