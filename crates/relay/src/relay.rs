//! Cross-posting and attendance between configured channel pairings.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use backend_core::{
    BackendError, Channel, Connection, ConnectionHandle, MIME_HTML, Message, Reaction, User,
    escape_html,
};
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    attendance::{AttendanceStep, AttendanceTracker},
    pipeline::{HandlerOutcome, MessageHandler},
};

pub const DEFAULT_PREFIX: &str = "[{author}] ";
/// Relayed message ids remembered per pairing for reaction forwarding.
pub const RELAYED_ID_CAPACITY: usize = 256;

/// One directed source → destination mapping.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelayPairing {
    pub from_connection: String,
    /// Channel name, alias or id on the source connection.
    pub from_channel: String,
    pub to_connection: String,
    pub to_channel: String,
    /// Prepended to relayed bodies. `{author}` and `{provider}` are
    /// substituted.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_true")]
    pub relay_chat: bool,
    #[serde(default = "default_true")]
    pub attendance: bool,
}

impl RelayPairing {
    pub fn new(
        from_connection: impl Into<String>,
        from_channel: impl Into<String>,
        to_connection: impl Into<String>,
        to_channel: impl Into<String>,
    ) -> Self {
        Self {
            from_connection: from_connection.into(),
            from_channel: from_channel.into(),
            to_connection: to_connection.into(),
            to_channel: to_channel.into(),
            prefix: default_prefix(),
            relay_chat: true,
            attendance: true,
        }
    }

    fn render_prefix(&self, message: &Message) -> String {
        self.prefix
            .replace("{author}", message.author_label())
            .replace("{provider}", &message.provider)
    }
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_owned()
}

fn default_true() -> bool {
    true
}

/// Source → destination ids of relayed messages, oldest evicted first.
#[derive(Debug, Default)]
struct RelayedIds {
    entries: VecDeque<(String, String)>,
}

impl RelayedIds {
    fn record(&mut self, source: &str, destination: &str) {
        if source.is_empty() || destination.is_empty() {
            return;
        }
        if self.entries.len() == RELAYED_ID_CAPACITY {
            self.entries.pop_front();
        }
        self.entries
            .push_back((source.to_owned(), destination.to_owned()));
    }

    fn destination(&self, source: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(from, _)| from == source)
            .map(|(_, to)| to.as_str())
    }
}

#[derive(Debug)]
struct PairingState {
    from_channel_id: Option<String>,
    to_channel_id: Option<String>,
    attendance: AttendanceTracker,
    relayed: RelayedIds,
}

struct Pairing {
    config: RelayPairing,
    state: Mutex<PairingState>,
}

/// Resolved endpoints of a pairing whose both sides are live.
struct Route {
    from_channel_id: String,
    to: Arc<dyn Connection>,
    to_channel_id: String,
}

/// Pipeline participant that relays chat and tracks attendance.
///
/// Each pairing holds its own async lock, so events from different
/// connections touching the same pairing are applied one at a time.
pub struct RelayHandler {
    connections: BTreeMap<String, ConnectionHandle>,
    pairings: Vec<Pairing>,
}

impl RelayHandler {
    /// Pairings naming an unknown connection are rejected.
    pub fn new(
        connections: &[Arc<dyn Connection>],
        pairings: Vec<RelayPairing>,
    ) -> Result<Self, BackendError> {
        let connections: BTreeMap<String, ConnectionHandle> = connections
            .iter()
            .map(|connection| {
                (
                    connection.id().to_owned(),
                    ConnectionHandle::new(Arc::downgrade(connection)),
                )
            })
            .collect();

        let pairings = pairings
            .into_iter()
            .map(|config| {
                for id in [&config.from_connection, &config.to_connection] {
                    if !connections.contains_key(id) {
                        return Err(BackendError::not_found("connection", id));
                    }
                }
                Ok(Pairing {
                    state: Mutex::new(PairingState {
                        from_channel_id: None,
                        to_channel_id: None,
                        attendance: AttendanceTracker::new(config.from_channel.clone()),
                        relayed: RelayedIds::default(),
                    }),
                    config,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            connections,
            pairings,
        })
    }

    fn connection(&self, id: &str) -> Option<Arc<dyn Connection>> {
        self.connections.get(id).and_then(ConnectionHandle::upgrade)
    }

    /// Endpoints of a pairing once both sides are connected and resolved.
    fn route(&self, pairing: &Pairing, state: &PairingState) -> Option<Route> {
        let from = self.connection(&pairing.config.from_connection)?;
        let to = self.connection(&pairing.config.to_connection)?;
        if !from.is_connected() || !to.is_connected() {
            return None;
        }
        Some(Route {
            from_channel_id: state.from_channel_id.clone()?,
            to,
            to_channel_id: state.to_channel_id.clone()?,
        })
    }

    async fn resolve(&self, pairing: &Pairing, connection_id: &str) {
        let Some(connection) = self.connection(connection_id) else {
            return;
        };
        let mut state = pairing.state.lock().await;

        for (is_source, endpoint, channel) in [
            (true, &pairing.config.from_connection, &pairing.config.from_channel),
            (false, &pairing.config.to_connection, &pairing.config.to_channel),
        ] {
            if endpoint != connection_id {
                continue;
            }
            match connection.channel_id_from_name(channel).await {
                Ok(channel_id) => {
                    debug!(connection = %connection_id, channel = %channel, channel_id = %channel_id, "resolved relay channel");
                    if is_source {
                        state.from_channel_id = Some(channel_id);
                    } else {
                        state.to_channel_id = Some(channel_id);
                    }
                }
                Err(err) => {
                    warn!(connection = %connection_id, channel = %channel, error = %err, "relay channel not resolvable");
                }
            }
        }

        let Some(route) = self.route(pairing, &state) else {
            return;
        };
        info!(
            from = %pairing.config.from_connection,
            to = %pairing.config.to_connection,
            "relay pairing active"
        );

        if pairing.config.attendance
            && let Some(source) = self.connection(&pairing.config.from_connection)
        {
            let users = roster_of(&source.channels(), &route.from_channel_id);
            run_attendance(&mut state, &route, &users).await;
        }
    }

    async fn relay_message(&self, pairing: &Pairing, message: &Message) -> Result<(), BackendError> {
        let mut state = pairing.state.lock().await;
        let Some(route) = self.route(pairing, &state) else {
            return Ok(());
        };
        if route.from_channel_id != message.channel_id {
            return Ok(());
        }

        let prefix = pairing.config.render_prefix(message);
        let mut outgoing = Message::outgoing(format!("{prefix}{}", message.body))
            .with_attachments(message.attachments.clone());
        outgoing.provider = message.provider.clone();
        outgoing.provider_instance = message.provider_instance.clone();
        if let Some(html) = message.formatted(MIME_HTML) {
            outgoing = outgoing.with_formatted(MIME_HTML, format!("{}{html}", escape_html(&prefix)));
        }

        let relayed_id = route.to.send_message(&route.to_channel_id, &outgoing).await?;
        debug!(
            from = %pairing.config.from_connection,
            to = %pairing.config.to_connection,
            source_id = %message.id,
            relayed_id = %relayed_id,
            "relayed message"
        );
        state.relayed.record(&message.id, &relayed_id);
        Ok(())
    }

    async fn relay_reaction(&self, pairing: &Pairing, reaction: &Reaction) -> Result<(), BackendError> {
        let state = pairing.state.lock().await;
        let Some(route) = self.route(pairing, &state) else {
            return Ok(());
        };
        if route.from_channel_id != reaction.channel_id {
            return Ok(());
        }
        let Some(target) = state.relayed.destination(&reaction.message_id) else {
            debug!(message_id = %reaction.message_id, "reaction on a message that was not relayed");
            return Ok(());
        };

        route
            .to
            .send_reaction(
                &route.to_channel_id,
                &Reaction::outgoing(target, reaction.reaction.clone()),
            )
            .await?;
        Ok(())
    }
}

fn roster_of(channels: &[Channel], channel_id: &str) -> Vec<User> {
    channels
        .iter()
        .find(|channel| channel.id == channel_id)
        .map(|channel| channel.users.clone())
        .unwrap_or_default()
}

/// Execute planned attendance steps in order, committing each one only after
/// the destination accepted it.
async fn run_attendance(state: &mut PairingState, route: &Route, users: &[User]) {
    let now = Utc::now();
    for step in state.attendance.plan(users, now) {
        let result = match &step {
            AttendanceStep::Start { text } | AttendanceStep::Summarize { text } => {
                route
                    .to
                    .send_message(&route.to_channel_id, &Message::outgoing(text.clone()))
                    .await
            }
            AttendanceStep::Update { message_id, text }
            | AttendanceStep::MarkHistorical { message_id, text } => {
                route
                    .to
                    .update_message(&route.to_channel_id, message_id, &Message::outgoing(text.clone()))
                    .await
            }
        };

        match result {
            Ok(posted_id) => state.attendance.commit(&step, users, &posted_id, now),
            Err(err) => {
                warn!(
                    to = %route.to.id(),
                    channel_id = %route.to_channel_id,
                    error = %err,
                    "attendance update failed; will retry on next roster change"
                );
                return;
            }
        }
    }
}

#[async_trait]
impl MessageHandler for RelayHandler {
    fn name(&self) -> &str {
        "relay"
    }

    async fn handle(&self, message: &Message) -> Result<HandlerOutcome, BackendError> {
        if message.is_from_self || message.is_private {
            return Ok(HandlerOutcome::Continue);
        }

        let mut first_error = None;
        for pairing in &self.pairings {
            if !pairing.config.relay_chat
                || pairing.config.from_connection != message.provider_instance
            {
                continue;
            }
            if let Err(err) = self.relay_message(pairing, message).await {
                warn!(to = %pairing.config.to_connection, error = %err, "relay send failed");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(HandlerOutcome::Continue),
        }
    }

    async fn on_connected(&self, connection_id: &str) -> Result<(), BackendError> {
        for pairing in &self.pairings {
            if pairing.config.from_connection == connection_id
                || pairing.config.to_connection == connection_id
            {
                self.resolve(pairing, connection_id).await;
            }
        }
        Ok(())
    }

    async fn on_channels_updated(
        &self,
        connection_id: &str,
        channels: &[Channel],
    ) -> Result<(), BackendError> {
        for pairing in &self.pairings {
            if !pairing.config.attendance || pairing.config.from_connection != connection_id {
                continue;
            }
            let mut state = pairing.state.lock().await;
            let Some(route) = self.route(pairing, &state) else {
                continue;
            };
            let users = roster_of(channels, &route.from_channel_id);
            run_attendance(&mut state, &route, &users).await;
        }
        Ok(())
    }

    async fn on_reaction(&self, reaction: &Reaction) -> Result<(), BackendError> {
        if reaction.is_from_self || reaction.is_private {
            return Ok(());
        }
        for pairing in &self.pairings {
            if pairing.config.relay_chat
                && pairing.config.from_connection == reaction.provider_instance
            {
                self.relay_reaction(pairing, reaction).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    };

    use backend_core::{
        Attachment, BackendErrorCategory, ConnectionEvents, ConnectionState, Presence,
    };

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Send { channel: String, body: String },
        Update { channel: String, id: String, body: String },
        React { channel: String, message_id: String, key: String },
    }

    struct FakeConnection {
        id: String,
        connected: AtomicBool,
        fail: AtomicBool,
        channels: StdMutex<Vec<Channel>>,
        calls: StdMutex<Vec<Call>>,
        sent: AtomicU32,
        events: ConnectionEvents,
        last_message: StdMutex<Option<Message>>,
    }

    impl FakeConnection {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_owned(),
                connected: AtomicBool::new(true),
                fail: AtomicBool::new(false),
                channels: StdMutex::new(Vec::new()),
                calls: StdMutex::new(Vec::new()),
                sent: AtomicU32::new(0),
                events: ConnectionEvents::default(),
                last_message: StdMutex::new(None),
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().expect("lock").clone()
        }

        fn record(&self, call: Call, message: Option<&Message>) -> Result<String, BackendError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(BackendError::network("io_error", "broken pipe"));
            }
            self.calls.lock().expect("lock").push(call);
            if let Some(message) = message {
                *self.last_message.lock().expect("lock") = Some(message.clone());
            }
            Ok(format!("{}-{}", self.id, self.sent.fetch_add(1, Ordering::SeqCst)))
        }
    }

    #[async_trait]
    impl Connection for FakeConnection {
        fn id(&self) -> &str {
            &self.id
        }

        fn provider(&self) -> &str {
            "fake"
        }

        fn user_id(&self) -> Option<String> {
            Some("gateway".to_owned())
        }

        fn state(&self) -> ConnectionState {
            if self.connected.load(Ordering::SeqCst) {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            }
        }

        fn channels(&self) -> Vec<Channel> {
            self.channels.lock().expect("lock").clone()
        }

        fn events(&self) -> &ConnectionEvents {
            &self.events
        }

        async fn start(&self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn send_message(&self, channel_id: &str, message: &Message) -> Result<String, BackendError> {
            self.record(
                Call::Send {
                    channel: channel_id.to_owned(),
                    body: message.body.clone(),
                },
                Some(message),
            )
        }

        async fn update_message(
            &self,
            channel_id: &str,
            message_id: &str,
            message: &Message,
        ) -> Result<String, BackendError> {
            self.record(
                Call::Update {
                    channel: channel_id.to_owned(),
                    id: message_id.to_owned(),
                    body: message.body.clone(),
                },
                Some(message),
            )
        }

        async fn send_reaction(&self, channel_id: &str, reaction: &Reaction) -> Result<String, BackendError> {
            self.record(
                Call::React {
                    channel: channel_id.to_owned(),
                    message_id: reaction.message_id.clone(),
                    key: reaction.reaction.clone(),
                },
                None,
            )
        }

        async fn channel_id_from_name(&self, name: &str) -> Result<String, BackendError> {
            match name {
                "Lobby" => Ok("1".to_owned()),
                "#bridge:example.org" => Ok("!bridge:example.org".to_owned()),
                _ => Err(BackendError::not_found("channel", name)),
            }
        }

        async fn set_channel_topic(&self, _channel_id: &str, _topic: &str) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn user(id: &str, name: &str) -> User {
        User {
            id: id.to_owned(),
            provider: "fake".to_owned(),
            alias: name.to_lowercase(),
            display_name: name.to_owned(),
            presence: Presence::Online,
            is_self: false,
        }
    }

    fn lobby(users: Vec<User>) -> Vec<Channel> {
        vec![Channel {
            id: "1".to_owned(),
            alias: "Lobby".to_owned(),
            display_name: "Root/Lobby".to_owned(),
            users,
        }]
    }

    struct Fixture {
        voice: Arc<FakeConnection>,
        chat: Arc<FakeConnection>,
        relay: RelayHandler,
    }

    async fn fixture(pairing: RelayPairing) -> Fixture {
        let voice = FakeConnection::new("voice");
        let chat = FakeConnection::new("chat");
        let connections: Vec<Arc<dyn Connection>> = vec![voice.clone(), chat.clone()];
        let relay = RelayHandler::new(&connections, vec![pairing]).expect("relay");
        relay.on_connected("voice").await.expect("connected");
        relay.on_connected("chat").await.expect("connected");
        Fixture { voice, chat, relay }
    }

    fn pairing() -> RelayPairing {
        RelayPairing::new("voice", "Lobby", "chat", "#bridge:example.org")
    }

    fn incoming(body: &str) -> Message {
        Message {
            id: "m1".to_owned(),
            provider: "mumble".to_owned(),
            provider_instance: "voice".to_owned(),
            author_display_name: "Alice".to_owned(),
            body: body.to_owned(),
            channel_id: "1".to_owned(),
            ..Message::default()
        }
    }

    const BRIDGE: &str = "!bridge:example.org";

    #[tokio::test]
    async fn attendance_lifecycle_posts_edits_and_summarizes() {
        let Fixture { voice: _voice, chat, relay } = fixture(pairing()).await;
        let (alice, bob) = (user("a", "Alice"), user("b", "Bob"));

        for users in [
            vec![],
            vec![alice.clone()],
            vec![alice.clone(), bob.clone()],
            vec![],
        ] {
            relay
                .on_channels_updated("voice", &lobby(users))
                .await
                .expect("update");
        }

        let calls = chat.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(
            calls[0],
            Call::Send {
                channel: BRIDGE.to_owned(),
                body: "Online in Lobby: Alice".to_owned()
            }
        );
        assert_eq!(
            calls[1],
            Call::Update {
                channel: BRIDGE.to_owned(),
                id: "chat-0".to_owned(),
                body: "Online in Lobby: Alice, Bob".to_owned()
            }
        );
        assert_eq!(
            calls[2],
            Call::Update {
                channel: BRIDGE.to_owned(),
                id: "chat-0".to_owned(),
                body: "Was online in Lobby: Alice, Bob".to_owned()
            }
        );
        let Call::Send { body, .. } = &calls[3] else {
            panic!("expected summary post, got {:?}", calls[3]);
        };
        assert!(body.starts_with("Session in Lobby lasted "), "{body}");
        assert!(body.ends_with("Attended by: Alice, Bob"), "{body}");
    }

    #[tokio::test]
    async fn repeated_roster_is_a_single_call() {
        let Fixture { voice: _voice, chat, relay } = fixture(pairing()).await;
        let (alice, bob) = (user("a", "Alice"), user("b", "Bob"));

        relay
            .on_channels_updated("voice", &lobby(vec![alice.clone(), bob.clone()]))
            .await
            .expect("update");
        relay
            .on_channels_updated("voice", &lobby(vec![bob, alice]))
            .await
            .expect("update");

        assert_eq!(chat.calls().len(), 1);
    }

    #[tokio::test]
    async fn failed_posts_are_retried_on_the_next_snapshot() {
        let Fixture { voice: _voice, chat, relay } = fixture(pairing()).await;
        let roster = lobby(vec![user("a", "Alice")]);

        chat.fail.store(true, Ordering::SeqCst);
        relay.on_channels_updated("voice", &roster).await.expect("update");
        assert!(chat.calls().is_empty());

        chat.fail.store(false, Ordering::SeqCst);
        relay.on_channels_updated("voice", &roster).await.expect("update");
        assert_eq!(chat.calls().len(), 1);
    }

    #[tokio::test]
    async fn roster_present_at_activation_starts_a_session() {
        let voice = FakeConnection::new("voice");
        let chat = FakeConnection::new("chat");
        *voice.channels.lock().expect("lock") = lobby(vec![user("a", "Alice")]);
        let connections: Vec<Arc<dyn Connection>> = vec![voice.clone(), chat.clone()];
        let relay = RelayHandler::new(&connections, vec![pairing()]).expect("relay");

        relay.on_connected("voice").await.expect("connected");
        assert!(chat.calls().is_empty(), "destination not resolved yet");
        relay.on_connected("chat").await.expect("connected");

        assert_eq!(chat.calls().len(), 1);
    }

    #[tokio::test]
    async fn relays_chat_with_prefix_and_attachments() {
        let Fixture { voice: _voice, chat, relay } = fixture(pairing()).await;
        let message = incoming("hello <all>")
            .with_formatted(MIME_HTML, "hello &lt;all&gt;")
            .with_attachments(vec![Attachment::image("cat.png", "https://example.org/cat.png")]);

        let outcome = relay.handle(&message).await.expect("relay");

        assert_eq!(outcome, HandlerOutcome::Continue);
        assert_eq!(
            chat.calls(),
            vec![Call::Send {
                channel: BRIDGE.to_owned(),
                body: "[Alice] hello <all>".to_owned()
            }]
        );
        let sent = chat.last_message.lock().expect("lock").clone().expect("sent");
        assert_eq!(sent.formatted(MIME_HTML), Some("[Alice] hello &lt;all&gt;"));
        assert_eq!(sent.attachments, message.attachments);
    }

    #[tokio::test]
    async fn never_relays_own_or_foreign_channel_messages() {
        let Fixture { voice: _voice, chat, relay } = fixture(pairing()).await;

        let mut own = incoming("echo");
        own.is_from_self = true;
        relay.handle(&own).await.expect("own");

        let mut elsewhere = incoming("elsewhere");
        elsewhere.channel_id = "2".to_owned();
        relay.handle(&elsewhere).await.expect("elsewhere");

        assert!(chat.calls().is_empty());
    }

    #[tokio::test]
    async fn private_messages_stay_private() {
        let Fixture { voice: _voice, chat, relay } = fixture(pairing()).await;

        let mut direct = incoming("secret dm to the gateway");
        direct.is_private = true;
        relay.handle(&direct).await.expect("private");

        assert!(chat.calls().is_empty());
    }

    #[tokio::test]
    async fn private_reactions_are_not_forwarded() {
        let Fixture { voice: _voice, chat, relay } = fixture(pairing()).await;
        relay.handle(&incoming("hi")).await.expect("relay");

        let mut reaction = Reaction::outgoing("m1", "👍");
        reaction.provider_instance = "voice".to_owned();
        reaction.channel_id = "1".to_owned();
        reaction.is_private = true;
        relay.on_reaction(&reaction).await.expect("reaction");

        assert_eq!(chat.calls().len(), 1, "only the relayed message");
    }

    #[tokio::test]
    async fn inactive_pairing_drops_chat() {
        let Fixture { voice: _voice, chat, relay } = fixture(pairing()).await;
        chat.connected.store(false, Ordering::SeqCst);

        relay.handle(&incoming("hi")).await.expect("inactive");

        assert!(chat.calls().is_empty());
    }

    #[tokio::test]
    async fn send_failures_surface_to_the_dispatcher() {
        let Fixture { voice: _voice, chat, relay } = fixture(pairing()).await;
        chat.fail.store(true, Ordering::SeqCst);

        let err = relay.handle(&incoming("hi")).await.expect_err("send fails");
        assert_eq!(err.category, BackendErrorCategory::Network);
    }

    #[tokio::test]
    async fn forwards_reactions_on_relayed_messages() {
        let Fixture { voice: _voice, chat, relay } = fixture(pairing()).await;
        relay.handle(&incoming("hi")).await.expect("relay");

        let mut reaction = Reaction::outgoing("m1", "👍");
        reaction.provider_instance = "voice".to_owned();
        reaction.channel_id = "1".to_owned();
        relay.on_reaction(&reaction).await.expect("reaction");

        let mut unknown = reaction.clone();
        unknown.message_id = "never-relayed".to_owned();
        relay.on_reaction(&unknown).await.expect("reaction");

        assert_eq!(
            chat.calls()[1..],
            [Call::React {
                channel: BRIDGE.to_owned(),
                message_id: "chat-0".to_owned(),
                key: "👍".to_owned()
            }]
        );
    }

    #[test]
    fn rejects_pairings_with_unknown_connections() {
        let voice = FakeConnection::new("voice");
        let connections: Vec<Arc<dyn Connection>> = vec![voice];
        let err = RelayHandler::new(&connections, vec![pairing()])
            .err()
            .expect("chat is unknown");
        assert_eq!(err.category, BackendErrorCategory::NotFound);
    }

    #[test]
    fn relayed_id_log_is_bounded() {
        let mut log = RelayedIds::default();
        for n in 0..=RELAYED_ID_CAPACITY {
            log.record(&format!("s{n}"), &format!("d{n}"));
        }
        assert_eq!(log.destination("s0"), None);
        assert_eq!(
            log.destination(&format!("s{RELAYED_ID_CAPACITY}")),
            Some(format!("d{RELAYED_ID_CAPACITY}").as_str())
        );
        log.record("", "d");
        assert_eq!(log.entries.len(), RELAYED_ID_CAPACITY);
    }

    #[test]
    fn pairings_deserialize_with_defaults() {
        let pairing: RelayPairing = serde_json::from_str(
            r#"{"from_connection":"voice","from_channel":"Lobby","to_connection":"chat","to_channel":"!r:x"}"#,
        )
        .expect("pairing");
        assert_eq!(pairing.prefix, DEFAULT_PREFIX);
        assert!(pairing.relay_chat && pairing.attendance);
    }
}
