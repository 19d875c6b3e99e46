//! Projection of room state events into channel snapshots.

use std::collections::BTreeMap;

use backend_core::{Channel, Presence, User, display_name_list};

use crate::events::{EventKind, Membership, RoomEvent};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Member {
    membership: Option<Membership>,
    display_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RoomState {
    name: Option<String>,
    canonical_alias: Option<String>,
    topic: Option<String>,
    members: BTreeMap<String, Member>,
}

/// Joined rooms and the state facts needed to describe them.
#[derive(Debug, Default)]
pub struct RoomDirectory {
    provider: String,
    own_user_id: String,
    rooms: BTreeMap<String, RoomState>,
}

impl RoomDirectory {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Self::default()
        }
    }

    pub fn set_own_user_id(&mut self, user_id: impl Into<String>) {
        self.own_user_id = user_id.into();
    }

    pub fn own_user_id(&self) -> &str {
        &self.own_user_id
    }

    /// Track a joined room. Returns whether it was new.
    pub fn ensure_room(&mut self, room_id: &str) -> bool {
        if self.rooms.contains_key(room_id) {
            return false;
        }
        self.rooms.insert(room_id.to_owned(), RoomState::default());
        true
    }

    /// Forget every room ahead of a full-state sync. Returns whether any
    /// room was tracked.
    pub fn clear_rooms(&mut self) -> bool {
        let had_rooms = !self.rooms.is_empty();
        self.rooms.clear();
        had_rooms
    }

    pub fn remove_room(&mut self, room_id: &str) -> bool {
        self.rooms.remove(room_id).is_some()
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn room_ids(&self) -> impl Iterator<Item = &str> {
        self.rooms.keys().map(String::as_str)
    }

    /// Fold one state event into the room. Returns whether the projection
    /// changed.
    pub fn apply(&mut self, room_id: &str, event: &RoomEvent) -> bool {
        let inserted = self.ensure_room(room_id);
        let Some(room) = self.rooms.get_mut(room_id) else {
            return inserted;
        };
        let before = room.clone();

        match (&event.kind, event.state_key.as_deref()) {
            (EventKind::Member(member), Some(user_id)) if !user_id.is_empty() => {
                let entry = room.members.entry(user_id.to_owned()).or_default();
                entry.membership = Some(member.membership);
                entry.display_name = member
                    .displayname
                    .clone()
                    .filter(|name| !name.trim().is_empty());
            }
            (EventKind::Name(name), Some(_)) => {
                room.name = name.name.clone().filter(|name| !name.is_empty());
            }
            (EventKind::CanonicalAlias(alias), Some(_)) => {
                room.canonical_alias = alias.alias.clone().filter(|alias| !alias.is_empty());
            }
            (EventKind::Topic(topic), Some(_)) => {
                room.topic = topic.topic.clone();
            }
            _ => {}
        }

        inserted || *room != before
    }

    pub fn topic(&self, room_id: &str) -> Option<&str> {
        self.rooms.get(room_id)?.topic.as_deref()
    }

    /// Best human label for `user_id` in `room_id`.
    pub fn member_display_name(&self, room_id: &str, user_id: &str) -> String {
        self.rooms
            .get(room_id)
            .and_then(|room| room.members.get(user_id))
            .and_then(|member| member.display_name.clone())
            .unwrap_or_else(|| localpart(user_id).to_owned())
    }

    /// Rooms with exactly one other joined member and no name or alias.
    pub fn is_direct(&self, room_id: &str) -> bool {
        self.rooms.get(room_id).is_some_and(|room| {
            room.name.is_none()
                && room.canonical_alias.is_none()
                && joined(room).count() == 2
        })
    }

    /// Resolve a room by id, canonical alias or display name.
    pub fn find(&self, name: &str) -> Option<String> {
        if self.rooms.contains_key(name) {
            return Some(name.to_owned());
        }
        self.rooms
            .keys()
            .filter_map(|room_id| self.channel(room_id))
            .find(|channel| channel.matches_name(name))
            .map(|channel| channel.id)
    }

    pub fn channel(&self, room_id: &str) -> Option<Channel> {
        let room = self.rooms.get(room_id)?;
        let users: Vec<User> = joined(room)
            .map(|(user_id, member)| User {
                id: user_id.clone(),
                provider: self.provider.clone(),
                alias: localpart(user_id).to_owned(),
                display_name: member
                    .display_name
                    .clone()
                    .unwrap_or_else(|| localpart(user_id).to_owned()),
                presence: Presence::Online,
                is_self: *user_id == self.own_user_id,
            })
            .collect();

        let display_name = room
            .name
            .clone()
            .or_else(|| room.canonical_alias.clone())
            .or_else(|| {
                let others: Vec<&str> = users
                    .iter()
                    .filter(|user| !user.is_self)
                    .map(User::label)
                    .collect();
                (!others.is_empty()).then(|| display_name_list(others))
            })
            .unwrap_or_else(|| room_id.to_owned());

        Some(Channel {
            id: room_id.to_owned(),
            alias: room
                .canonical_alias
                .clone()
                .unwrap_or_else(|| room_id.to_owned()),
            display_name,
            users,
        })
    }

    pub fn snapshot(&self) -> Vec<Channel> {
        self.rooms
            .keys()
            .filter_map(|room_id| self.channel(room_id))
            .collect()
    }
}

fn joined(room: &RoomState) -> impl Iterator<Item = (&String, &Member)> {
    room.members
        .iter()
        .filter(|(_, member)| member.membership == Some(Membership::Join))
}

/// `@alice:example.org` → `alice`.
pub fn localpart(user_id: &str) -> &str {
    let trimmed = user_id.strip_prefix('@').unwrap_or(user_id);
    trimmed.split(':').next().unwrap_or(trimmed)
}

/// Server part of a room or user id: `!abc:example.org` → `example.org`.
pub fn server_name(id: &str) -> Option<&str> {
    id.split_once(':').map(|(_, server)| server)
}

#[cfg(test)]
mod tests {
    use crate::events::{CanonicalAliasContent, MemberContent, NameContent};

    use super::*;

    fn state(kind: EventKind, state_key: &str) -> RoomEvent {
        RoomEvent {
            event_id: String::new(),
            sender: String::new(),
            origin_server_ts: 0,
            state_key: Some(state_key.to_owned()),
            kind,
        }
    }

    fn member(user_id: &str, membership: Membership, name: Option<&str>) -> RoomEvent {
        state(
            EventKind::Member(MemberContent {
                membership,
                displayname: name.map(str::to_owned),
            }),
            user_id,
        )
    }

    fn directory() -> RoomDirectory {
        let mut directory = RoomDirectory::new("matrix");
        directory.set_own_user_id("@bot:example.org");
        directory
    }

    #[test]
    fn projects_joined_members_only() {
        let mut rooms = directory();
        let room = "!r:example.org";
        assert!(rooms.apply(room, &member("@alice:example.org", Membership::Join, Some("Alice"))));
        assert!(rooms.apply(room, &member("@bot:example.org", Membership::Join, None)));
        assert!(rooms.apply(room, &member("@carol:example.org", Membership::Invite, None)));

        let channel = rooms.channel(room).expect("channel");
        let ids: Vec<&str> = channel.users.iter().map(|user| user.id.as_str()).collect();
        assert_eq!(ids, vec!["@alice:example.org", "@bot:example.org"]);
        assert_eq!(channel.users[0].display_name, "Alice");
        assert_eq!(channel.users[1].alias, "bot");
        assert!(channel.users[1].is_self);
        assert_eq!(channel.display_name, "Alice");
        assert!(rooms.is_direct(room));

        assert!(rooms.apply(room, &member("@alice:example.org", Membership::Leave, None)));
        assert_eq!(rooms.channel(room).expect("channel").users.len(), 1);
    }

    #[test]
    fn names_rooms_from_state() {
        let mut rooms = directory();
        let room = "!r:example.org";
        rooms.apply(
            room,
            &state(
                EventKind::CanonicalAlias(CanonicalAliasContent {
                    alias: Some("#lobby:example.org".to_owned()),
                }),
                "",
            ),
        );
        let channel = rooms.channel(room).expect("channel");
        assert_eq!(channel.alias, "#lobby:example.org");
        assert_eq!(channel.display_name, "#lobby:example.org");

        assert!(rooms.apply(
            room,
            &state(
                EventKind::Name(NameContent {
                    name: Some("Lobby".to_owned())
                }),
                ""
            )
        ));
        assert_eq!(rooms.channel(room).expect("channel").display_name, "Lobby");
        assert_eq!(rooms.find("lobby").as_deref(), Some(room));
        assert_eq!(rooms.find("#lobby:example.org").as_deref(), Some(room));
        assert_eq!(rooms.find(room).as_deref(), Some(room));
        assert_eq!(rooms.find("elsewhere"), None);
    }

    #[test]
    fn repeated_state_is_not_a_change() {
        let mut rooms = directory();
        let room = "!r:example.org";
        let event = member("@alice:example.org", Membership::Join, Some("Alice"));
        assert!(rooms.apply(room, &event));
        assert!(!rooms.apply(room, &event));
        assert!(!rooms.ensure_room(room));
        assert!(rooms.remove_room(room));
        assert!(rooms.snapshot().is_empty());
    }

    #[test]
    fn clearing_keeps_own_identity() {
        let mut rooms = directory();
        rooms.apply("!r:example.org", &member("@alice:example.org", Membership::Join, None));

        assert!(rooms.clear_rooms());
        assert!(!rooms.clear_rooms());
        assert!(rooms.snapshot().is_empty());
        assert_eq!(rooms.own_user_id(), "@bot:example.org");
    }

    #[test]
    fn splits_identifiers() {
        assert_eq!(localpart("@alice:example.org"), "alice");
        assert_eq!(localpart("alice"), "alice");
        assert_eq!(server_name("!abc:example.org"), Some("example.org"));
        assert_eq!(server_name("!abc"), None);
    }
}
