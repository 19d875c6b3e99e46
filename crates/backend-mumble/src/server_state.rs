use std::collections::BTreeMap;

use backend_core::{Channel, Presence, User};

use crate::proto;

/// Id of the root channel every server has.
pub const ROOT_CHANNEL_ID: u32 = 0;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelEntry {
    pub id: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub description: String,
    pub position: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserEntry {
    pub session: u32,
    pub name: String,
    /// Registered account id; `None` for anonymous users.
    pub user_id: Option<u32>,
    pub channel_id: u32,
}

/// Server-imposed message limits announced through `ServerConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerLimits {
    pub allow_html: bool,
    pub message_length: Option<u32>,
    pub image_message_length: Option<u32>,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            allow_html: true,
            message_length: None,
            image_message_length: None,
        }
    }
}

/// Client-side mirror of the server's channel tree and connected users.
///
/// Fed by the incremental state frames; [`ServerState::snapshot`] turns the
/// mirror into full `Channel` values.
#[derive(Debug, Default)]
pub struct ServerState {
    channels: BTreeMap<u32, ChannelEntry>,
    users: BTreeMap<u32, UserEntry>,
    own_session: Option<u32>,
    limits: ServerLimits,
}

impl ServerState {
    /// Merge a `ChannelState` frame. Returns whether anything changed.
    pub fn apply_channel_state(&mut self, state: &proto::ChannelState) -> bool {
        let Some(id) = state.channel_id else {
            return false;
        };
        let inserted = !self.channels.contains_key(&id);
        let entry = self.channels.entry(id).or_insert_with(|| ChannelEntry {
            id,
            ..ChannelEntry::default()
        });
        let before = entry.clone();

        if let Some(parent) = state.parent {
            entry.parent = Some(parent);
        }
        if let Some(name) = &state.name {
            entry.name.clone_from(name);
        }
        if let Some(description) = &state.description {
            entry.description.clone_from(description);
        }
        if let Some(position) = state.position {
            entry.position = position;
        }

        inserted || *entry != before
    }

    pub fn remove_channel(&mut self, id: u32) -> bool {
        self.channels.remove(&id).is_some()
    }

    /// Merge a `UserState` frame. Returns whether anything changed.
    pub fn apply_user_state(&mut self, state: &proto::UserState) -> bool {
        let Some(session) = state.session else {
            return false;
        };
        let inserted = !self.users.contains_key(&session);
        let entry = self.users.entry(session).or_insert_with(|| UserEntry {
            session,
            channel_id: ROOT_CHANNEL_ID,
            ..UserEntry::default()
        });
        let before = entry.clone();

        if let Some(name) = &state.name {
            entry.name.clone_from(name);
        }
        if let Some(user_id) = state.user_id {
            entry.user_id = Some(user_id);
        }
        if let Some(channel_id) = state.channel_id {
            entry.channel_id = channel_id;
        }

        inserted || *entry != before
    }

    pub fn remove_user(&mut self, session: u32) -> bool {
        self.users.remove(&session).is_some()
    }

    pub fn set_own_session(&mut self, session: u32) {
        self.own_session = Some(session);
    }

    pub fn own_session(&self) -> Option<u32> {
        self.own_session
    }

    pub fn own_user(&self) -> Option<&UserEntry> {
        self.own_session.and_then(|session| self.users.get(&session))
    }

    pub fn user(&self, session: u32) -> Option<&UserEntry> {
        self.users.get(&session)
    }

    pub fn channel(&self, id: u32) -> Option<&ChannelEntry> {
        self.channels.get(&id)
    }

    pub fn limits(&self) -> ServerLimits {
        self.limits
    }

    pub fn apply_server_config(&mut self, config: &proto::ServerConfig) {
        if let Some(allow_html) = config.allow_html {
            self.limits.allow_html = allow_html;
        }
        if config.message_length.is_some() {
            self.limits.message_length = config.message_length.filter(|len| *len > 0);
        }
        if config.image_message_length.is_some() {
            self.limits.image_message_length =
                config.image_message_length.filter(|len| *len > 0);
        }
    }

    /// Slash-separated names from the root down to `id`, e.g. `Root/Games`.
    pub fn channel_path(&self, id: u32) -> String {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(entry) = self.channels.get(&current) else {
                break;
            };
            names.push(entry.name.as_str());
            cursor = entry.parent.filter(|parent| *parent != current);
            if names.len() > self.channels.len() {
                break;
            }
        }
        names.reverse();
        names.join("/")
    }

    /// Resolve a channel by numeric id, full path, or name (case-insensitive).
    pub fn find_channel(&self, name: &str) -> Option<u32> {
        let name = name.trim();
        if let Ok(id) = name.parse::<u32>()
            && self.channels.contains_key(&id)
        {
            return Some(id);
        }
        self.channels
            .keys()
            .copied()
            .find(|id| self.channel_path(*id).eq_ignore_ascii_case(name))
            .or_else(|| {
                self.channels
                    .values()
                    .find(|entry| entry.name.eq_ignore_ascii_case(name))
                    .map(|entry| entry.id)
            })
    }

    /// Full snapshot of every known channel with its current roster.
    pub fn snapshot(&self, provider: &str) -> Vec<Channel> {
        self.channels
            .values()
            .map(|entry| {
                let mut users: Vec<User> = self
                    .users
                    .values()
                    .filter(|user| user.channel_id == entry.id && !user.name.is_empty())
                    .map(|user| User {
                        id: user.name.clone(),
                        provider: provider.to_owned(),
                        alias: user.name.clone(),
                        display_name: user.name.clone(),
                        presence: Presence::Online,
                        is_self: Some(user.session) == self.own_session,
                    })
                    .collect();
                users.sort_by(|a, b| a.id.cmp(&b.id));

                Channel {
                    id: entry.id.to_string(),
                    alias: entry.name.clone(),
                    display_name: self.channel_path(entry.id),
                    users,
                }
            })
            .collect()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
