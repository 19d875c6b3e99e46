//! Matrix client-server API client implementing [`backend_core::Connection`].
//!
//! A session logs in, runs one full-state sync (auto-joining invites), then
//! long-polls `/sync` forever, always continuing from the previous
//! `next_batch`. Room state from every poll is folded into the channel
//! projection.

mod api;
mod events;
mod rooms;

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError, RwLock, Weak},
    time::Duration,
};

use async_trait::async_trait;
use backend_core::{
    Attachment, AttachmentKind, BackendError, BackendErrorCategory, Channel, Connection,
    ConnectionEvents, ConnectionHandle, ConnectionState, ConnectionStateMachine, MIME_HTML,
    Message, Reaction, escape_html, mentions_name, normalize_reaction_key,
};
use serde_json::{Map, Value, json};
use tracing::{debug, info, trace, warn};

pub use api::{MatrixApi, SyncResponse};
pub use events::{EventKind, HTML_FORMAT, MessageBody, RawEvent, RoomEvent};
pub use rooms::{RoomDirectory, localpart, server_name};

/// Provider name reported on every message and user.
pub const PROVIDER: &str = "matrix";
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);
/// Headroom between the server-side wait and the client-side HTTP deadline.
pub const HTTP_TIMEOUT_MARGIN: Duration = Duration::from_secs(30);
const DEFAULT_DEVICE_DISPLAY_NAME: &str = "Chat Gateway";
const EDIT_PREFIX: &str = "* ";

#[derive(Debug, Clone)]
pub struct MatrixConfig {
    /// Instance id used as the connection id.
    pub instance_id: String,
    pub homeserver: String,
    /// Full user id or localpart.
    pub user: String,
    pub password: String,
    pub device_name: String,
    /// Server-side wait window of each `/sync` poll.
    pub poll_timeout: Duration,
    /// Client-side deadline for every HTTP call; must exceed `poll_timeout`.
    pub http_timeout: Duration,
    pub auto_join: bool,
    /// Server names whose invites are accepted; empty accepts all.
    pub auto_join_servers: Vec<String>,
}

impl MatrixConfig {
    pub fn new(
        instance_id: impl Into<String>,
        homeserver: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            homeserver: homeserver.into(),
            user: user.into(),
            password: password.into(),
            device_name: DEFAULT_DEVICE_DISPLAY_NAME.to_owned(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            http_timeout: DEFAULT_POLL_TIMEOUT + HTTP_TIMEOUT_MARGIN,
            auto_join: true,
            auto_join_servers: Vec::new(),
        }
    }

    /// Whether an invite to `room_id` should be accepted.
    pub fn accepts_invite(&self, room_id: &str) -> bool {
        if !self.auto_join {
            return false;
        }
        if self.auto_join_servers.is_empty() {
            return true;
        }
        server_name(room_id).is_some_and(|server| {
            self.auto_join_servers
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(server))
        })
    }
}

/// Inbound items produced while folding one sync response.
enum Inbound {
    Message(Message),
    Reaction(Reaction),
}

pub struct MatrixConnection {
    config: MatrixConfig,
    self_ref: Weak<MatrixConnection>,
    lifecycle: ConnectionStateMachine,
    events: ConnectionEvents,
    api: MatrixApi,
    rooms: Mutex<RoomDirectory>,
    channels: RwLock<Vec<Channel>>,
    next_batch: Mutex<Option<String>>,
}

impl MatrixConnection {
    pub fn new(config: MatrixConfig) -> Result<Arc<Self>, BackendError> {
        if config.http_timeout <= config.poll_timeout {
            return Err(BackendError::new(
                BackendErrorCategory::Config,
                "invalid_http_timeout",
                format!(
                    "http timeout {:?} must exceed poll timeout {:?}",
                    config.http_timeout, config.poll_timeout
                ),
            ));
        }
        let api = MatrixApi::new(&config.homeserver, config.http_timeout)?;

        Ok(Arc::new_cyclic(|self_ref| Self {
            config,
            self_ref: self_ref.clone(),
            lifecycle: ConnectionStateMachine::default(),
            events: ConnectionEvents::default(),
            api,
            rooms: Mutex::new(RoomDirectory::new(PROVIDER)),
            channels: RwLock::new(Vec::new()),
            next_batch: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &MatrixConfig {
        &self.config
    }

    /// Continuation token of the last completed sync.
    pub fn next_batch(&self) -> Option<String> {
        self.next_batch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn run_session(&self) -> Result<(), BackendError> {
        self.lifecycle.transition(ConnectionState::Authenticating)?;
        let mut resume = self.next_batch();
        if !self.api.has_access_token() || self.user_id().is_none() {
            let login = self
                .api
                .login(&self.config.user, &self.config.password, &self.config.device_name)
                .await?;
            info!(
                connection = %self.id(),
                user_id = %login.user_id,
                device_id = login.device_id.as_deref().unwrap_or_default(),
                "logged in"
            );
            self.rooms().set_own_user_id(login.user_id);
            resume = None;
        }

        self.lifecycle.transition(ConnectionState::Syncing)?;
        debug!(connection = %self.id(), since = resume.as_deref().unwrap_or_default(), "full-state sync");
        let initial = self.api.sync(resume.as_deref(), Duration::ZERO, true).await?;
        self.set_next_batch(&initial.next_batch);
        self.rooms().clear_rooms();
        let (_, missed) = self.fold_sync(initial, resume.is_some()).await;

        self.lifecycle.transition(ConnectionState::Connected)?;
        info!(
            connection = %self.id(),
            rooms = self.rooms().room_ids().count(),
            missed = missed.len(),
            "initial sync complete"
        );
        self.events.emit_connected(self.id()).await;
        self.publish_channels().await;
        self.emit_inbound(missed).await;

        loop {
            let since = self.next_batch().unwrap_or_default();
            let response = self
                .api
                .sync(Some(&since), self.config.poll_timeout, false)
                .await?;
            trace!(connection = %self.id(), since = %since, next_batch = %response.next_batch, "poll returned");
            self.set_next_batch(&response.next_batch);
            let (changed, inbound) = self.fold_sync(response, true).await;
            self.emit_inbound(inbound).await;
            if changed {
                self.publish_channels().await;
            }
        }
    }

    fn set_next_batch(&self, token: &str) {
        *self
            .next_batch
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.to_owned());
    }

    /// Fold a sync response into the room projection and accept invites.
    /// Returns whether the channel projection changed, plus the inbound
    /// items to raise when `surface` is set.
    async fn fold_sync(&self, response: SyncResponse, surface: bool) -> (bool, Vec<Inbound>) {
        let SyncResponse { rooms: sync, .. } = response;
        let mut inbound = Vec::new();
        let mut changed = false;

        {
            let mut rooms = self.rooms();
            for room_id in sync.leave.keys() {
                changed |= rooms.remove_room(room_id);
            }
            for (room_id, joined) in sync.join {
                changed |= rooms.ensure_room(&room_id);
                for raw in joined.state.events {
                    changed |= rooms.apply(&room_id, &RoomEvent::decode(raw));
                }
                for raw in joined.timeline.events {
                    let event = RoomEvent::decode(raw);
                    if event.is_state() {
                        changed |= rooms.apply(&room_id, &event);
                    } else if surface {
                        inbound.extend(self.inbound(&rooms, &room_id, event));
                    }
                }
            }
        }

        for room_id in sync.invite.keys() {
            changed |= self.accept_invite(room_id).await;
        }

        (changed, inbound)
    }

    async fn emit_inbound(&self, inbound: Vec<Inbound>) {
        for item in inbound {
            match item {
                Inbound::Message(message) => self.events.emit_message(&message).await,
                Inbound::Reaction(reaction) => self.events.emit_reaction(&reaction).await,
            }
        }
    }

    fn ensure_connected(&self) -> Result<(), BackendError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BackendError::not_connected(self.id()))
        }
    }

    async fn accept_invite(&self, room_id: &str) -> bool {
        if !self.config.accepts_invite(room_id) {
            debug!(connection = %self.id(), room_id, "ignoring invite");
            return false;
        }
        match self.api.join_room(room_id).await {
            Ok(joined) => {
                info!(connection = %self.id(), room_id = %joined, "joined invited room");
                self.rooms().ensure_room(&joined)
            }
            Err(err) => {
                warn!(connection = %self.id(), room_id, error = %err, "failed to join invited room");
                false
            }
        }
    }

    fn inbound(&self, rooms: &RoomDirectory, room_id: &str, event: RoomEvent) -> Option<Inbound> {
        let own_user_id = rooms.own_user_id();
        let author_display_name = rooms.member_display_name(room_id, &event.sender);

        match event.kind {
            EventKind::Message(content) => {
                if content.is_edit() {
                    debug!(connection = %self.id(), room_id, event_id = %event.event_id, "dropping edit");
                    return None;
                }
                let threading_id = content.thread_root().unwrap_or_default().to_owned();
                let mentioned = content
                    .mentions
                    .as_ref()
                    .is_some_and(|mentions| mentions.user_ids.iter().any(|id| id == own_user_id));

                let mut formatted_bodies = BTreeMap::new();
                let (body, attachments) = match content.body {
                    MessageBody::Text(text) | MessageBody::Notice(text) => {
                        if let Some(html) = text.html() {
                            formatted_bodies.insert(MIME_HTML.to_owned(), html.to_owned());
                        }
                        (text.body, Vec::new())
                    }
                    MessageBody::Emote(text) => {
                        (format!("* {author_display_name} {}", text.body), Vec::new())
                    }
                    MessageBody::Image(image) => {
                        let uri = image
                            .url
                            .as_deref()
                            .and_then(|url| self.api.download_url(url))
                            .unwrap_or_default();
                        let attachment = Attachment::image(image.body.clone(), uri);
                        (image.body, vec![attachment])
                    }
                    MessageBody::Unsupported => {
                        debug!(connection = %self.id(), room_id, event_id = %event.event_id, "dropping unsupported message type");
                        return None;
                    }
                };

                let own_name = rooms.member_display_name(room_id, own_user_id);
                Some(Inbound::Message(Message {
                    id: event.event_id,
                    provider: PROVIDER.to_owned(),
                    provider_instance: self.config.instance_id.clone(),
                    author_alias: localpart(&event.sender).to_owned(),
                    author_display_name,
                    is_from_self: event.sender == own_user_id,
                    author_id: event.sender,
                    is_mentioning_self: mentioned
                        || mentions_name(&body, &own_name)
                        || mentions_name(&body, own_user_id),
                    body,
                    formatted_bodies,
                    channel_id: room_id.to_owned(),
                    time_sent_ms: event.origin_server_ts,
                    threading_id,
                    attachments,
                    connection: self.handle(),
                    is_private: rooms.is_direct(room_id),
                }))
            }
            EventKind::Reaction(relation) => Some(Inbound::Reaction(Reaction {
                id: event.event_id,
                provider: PROVIDER.to_owned(),
                provider_instance: self.config.instance_id.clone(),
                author_alias: localpart(&event.sender).to_owned(),
                author_display_name,
                is_from_self: event.sender == own_user_id,
                author_id: event.sender,
                channel_id: room_id.to_owned(),
                message_id: relation.event_id.unwrap_or_default(),
                reaction: normalize_reaction_key(relation.key.as_deref().unwrap_or_default()),
                time_sent_ms: event.origin_server_ts,
                connection: self.handle(),
                is_private: rooms.is_direct(room_id),
            })),
            EventKind::Unknown { event_type } => {
                trace!(connection = %self.id(), room_id, event_type, "ignoring event");
                None
            }
            _ => None,
        }
    }

    async fn publish_channels(&self) {
        let snapshot = self.rooms().snapshot();
        *self.channels.write().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        self.events.emit_channels_updated(self.id(), &snapshot).await;
    }

    fn handle(&self) -> ConnectionHandle {
        let weak: Weak<dyn Connection> = self.self_ref.clone();
        ConnectionHandle::new(weak)
    }

    fn rooms(&self) -> std::sync::MutexGuard<'_, RoomDirectory> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connection for MatrixConnection {
    fn id(&self) -> &str {
        &self.config.instance_id
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    fn user_id(&self) -> Option<String> {
        let rooms = self.rooms();
        let user_id = rooms.own_user_id();
        (!user_id.is_empty()).then(|| user_id.to_owned())
    }

    fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    fn channels(&self) -> Vec<Channel> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn events(&self) -> &ConnectionEvents {
        &self.events
    }

    async fn start(&self) -> Result<(), BackendError> {
        let result = self.run_session().await;
        self.lifecycle.disconnect();
        if let Err(err) = &result {
            if matches!(err.code.as_str(), "M_UNKNOWN_TOKEN" | "M_MISSING_TOKEN") {
                self.api.clear_access_token();
            }
            info!(connection = %self.id(), error = %err, "session ended");
        }
        result
    }

    async fn send_message(
        &self,
        channel_id: &str,
        message: &Message,
    ) -> Result<String, BackendError> {
        self.ensure_connected()?;
        let mut content = message_content(message);
        if message.is_threaded() {
            content.insert(
                "m.relates_to".to_owned(),
                json!({
                    "rel_type": "m.thread",
                    "event_id": message.threading_id,
                    "is_falling_back": true,
                    "m.in_reply_to": {"event_id": message.threading_id},
                }),
            );
        }
        self.api
            .send_event(channel_id, "m.room.message", &Value::Object(content))
            .await
    }

    async fn update_message(
        &self,
        channel_id: &str,
        message_id: &str,
        message: &Message,
    ) -> Result<String, BackendError> {
        self.ensure_connected()?;
        let new_content = message_content(message);
        let mut content = Map::new();
        content.insert("msgtype".to_owned(), json!("m.text"));
        content.insert(
            "body".to_owned(),
            json!(format!("{EDIT_PREFIX}{}", rendered_body(message))),
        );
        if let Some(html) = new_content.get("formatted_body").and_then(Value::as_str) {
            content.insert("format".to_owned(), json!(HTML_FORMAT));
            content.insert(
                "formatted_body".to_owned(),
                json!(format!("{EDIT_PREFIX}{html}")),
            );
        }
        content.insert("m.new_content".to_owned(), Value::Object(new_content));
        content.insert(
            "m.relates_to".to_owned(),
            json!({"rel_type": "m.replace", "event_id": message_id}),
        );

        self.api
            .send_event(channel_id, "m.room.message", &Value::Object(content))
            .await
    }

    async fn send_reaction(
        &self,
        channel_id: &str,
        reaction: &Reaction,
    ) -> Result<String, BackendError> {
        self.ensure_connected()?;
        let content = json!({
            "m.relates_to": {
                "rel_type": "m.annotation",
                "event_id": reaction.message_id,
                "key": reaction.reaction,
            }
        });
        self.api.send_event(channel_id, "m.reaction", &content).await
    }

    async fn channel_id_from_name(&self, name: &str) -> Result<String, BackendError> {
        let name = name.trim();
        if name.starts_with('!') {
            return Ok(name.to_owned());
        }
        if let Some(room_id) = self.rooms().find(name) {
            return Ok(room_id);
        }
        if name.starts_with('#') {
            return self.api.resolve_alias(name).await;
        }
        Err(BackendError::not_found("room", name))
    }

    async fn set_channel_topic(&self, channel_id: &str, topic: &str) -> Result<(), BackendError> {
        if self.rooms().topic(channel_id) == Some(topic) {
            return Ok(());
        }
        self.api
            .set_state(channel_id, "m.room.topic", "", &json!({"topic": topic}))
            .await
            .map(|_| ())
    }
}

/// Plain body with attachment links appended.
fn rendered_body(message: &Message) -> String {
    let mut body = message.body.clone();
    for attachment in &message.attachments {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str(&attachment.uri);
    }
    body
}

fn message_content(message: &Message) -> Map<String, Value> {
    let mut content = Map::new();
    content.insert("msgtype".to_owned(), json!("m.text"));
    content.insert("body".to_owned(), json!(rendered_body(message)));

    let html = message.formatted(MIME_HTML).map(str::to_owned).or_else(|| {
        (!message.attachments.is_empty()).then(|| {
            escape_html(&message.body).replace('\n', "<br>")
        })
    });
    if let Some(mut html) = html {
        for attachment in &message.attachments {
            let uri = escape_html(&attachment.uri);
            let label = if attachment.kind == AttachmentKind::Image && !attachment.name.is_empty() {
                escape_html(&attachment.name)
            } else {
                uri.clone()
            };
            if !html.is_empty() {
                html.push_str("<br>");
            }
            html.push_str(&format!("<a href=\"{uri}\">{label}</a>"));
        }
        content.insert("format".to_owned(), json!(HTML_FORMAT));
        content.insert("formatted_body".to_owned(), json!(html));
    }
    content
}
