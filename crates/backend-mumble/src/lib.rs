//! Mumble control-channel client implementing [`backend_core::Connection`].
//!
//! One session is a TLS stream carrying length-prefixed protobuf frames. The
//! read loop runs on the task that called [`Connection::start`]; a keepalive
//! task pings on its own timer, and every write goes through one writer lock.

mod frame;
mod markup;
mod proto;
mod server_state;
mod tls;

use std::{
    sync::{Arc, Mutex, PoisonError, RwLock, Weak},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use backend_core::{
    AttachmentKind, BackendError, BackendErrorCategory, Channel, Connection, ConnectionEvents,
    ConnectionHandle, ConnectionState, ConnectionStateMachine, MIME_HTML, Message, Reaction,
    escape_html, mentions_name,
};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    task::JoinHandle,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

pub use frame::{FrameCodec, FrameError, MessageKind, RawFrame};
pub use markup::{PREVIEW_MAX_DIMENSION, RenderedAttachment, render_preview};
pub use server_state::{ServerLimits, ServerState};
pub use tls::TlsOptions;

/// Provider name reported on every message and user.
pub const PROVIDER: &str = "mumble";
pub const DEFAULT_PORT: u16 = 64738;
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);

const CLIENT_RELEASE: &str = concat!("chat-gateway ", env!("CARGO_PKG_VERSION"));
const PROTOCOL_VERSION: (u32, u32, u32) = (1, 4, 0);
const IMAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct MumbleConfig {
    /// Instance id used as the connection id.
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    /// Access tokens granting entry to token-protected channels.
    pub tokens: Vec<String>,
    /// Channel (name or path) to move into after the initial sync.
    pub channel: Option<String>,
    pub ping_interval: Duration,
    pub tls: TlsOptions,
}

impl MumbleConfig {
    pub fn new(
        instance_id: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            host: host.into(),
            port: DEFAULT_PORT,
            username: username.into(),
            password: None,
            tokens: Vec::new(),
            channel: None,
            ping_interval: DEFAULT_PING_INTERVAL,
            tls: TlsOptions::default(),
        }
    }
}

type FrameSink = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, FrameCodec>;

pub struct MumbleConnection {
    config: MumbleConfig,
    self_ref: Weak<MumbleConnection>,
    lifecycle: ConnectionStateMachine,
    events: ConnectionEvents,
    server: Mutex<ServerState>,
    channels: RwLock<Vec<Channel>>,
    writer: tokio::sync::Mutex<Option<FrameSink>>,
    http: reqwest::Client,
}

impl MumbleConnection {
    pub fn new(config: MumbleConfig) -> Result<Arc<Self>, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(IMAGE_FETCH_TIMEOUT)
            .build()
            .map_err(|err| {
                BackendError::new(
                    BackendErrorCategory::Config,
                    "http_client_build_failed",
                    err.to_string(),
                )
            })?;

        Ok(Arc::new_cyclic(|self_ref| Self {
            config,
            self_ref: self_ref.clone(),
            lifecycle: ConnectionStateMachine::default(),
            events: ConnectionEvents::default(),
            server: Mutex::new(ServerState::default()),
            channels: RwLock::new(Vec::new()),
            writer: tokio::sync::Mutex::new(None),
            http,
        }))
    }

    pub fn config(&self) -> &MumbleConfig {
        &self.config
    }

    pub fn limits(&self) -> ServerLimits {
        self.server().limits()
    }

    /// Move the gateway's own user into `channel_id`.
    pub async fn join_channel(&self, channel_id: &str) -> Result<(), BackendError> {
        let channel = parse_channel_id(channel_id)?;
        let session = self
            .server()
            .own_session()
            .ok_or_else(|| BackendError::not_connected(self.id()))?;
        self.send_frame(RawFrame::from_message(
            MessageKind::UserState,
            &proto::UserState {
                session: Some(session),
                channel_id: Some(channel),
                ..proto::UserState::default()
            },
        ))
        .await
    }

    async fn connect_tls(&self) -> Result<(), BackendError> {
        self.lifecycle.transition(ConnectionState::Handshaking)?;
        info!(
            connection = %self.config.instance_id,
            host = %self.config.host,
            port = self.config.port,
            "connecting"
        );

        let connector = tls::build_connector(&self.config.tls)?;
        let server_name = tls::server_name(&self.config.host)?;
        let tcp = TcpStream::connect((self.config.host.as_str(), self.config.port)).await?;
        tcp.set_nodelay(true)?;
        let stream = connector.connect(server_name, tcp).await.map_err(|err| {
            BackendError::protocol("tls_handshake_failed", err.to_string())
        })?;

        self.run_stream(stream).await
    }

    /// Authenticate over an already-established stream and run the read loop
    /// until the stream fails.
    async fn run_stream<S>(&self, stream: S) -> Result<(), BackendError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let sink: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
        *self.writer.lock().await = Some(FramedWrite::new(sink, FrameCodec::default()));

        self.lifecycle.transition(ConnectionState::Authenticating)?;
        self.send_frame(version_frame()).await?;
        self.send_frame(RawFrame::from_message(
            MessageKind::Authenticate,
            &proto::Authenticate {
                username: Some(self.config.username.clone()),
                password: self.config.password.clone(),
                tokens: self.config.tokens.clone(),
                opus: Some(true),
                client_type: Some(1),
                ..proto::Authenticate::default()
            },
        ))
        .await?;
        self.lifecycle.transition(ConnectionState::Syncing)?;

        let _keepalive = AbortOnDrop(self.spawn_keepalive());
        let mut frames = FramedRead::new(read_half, FrameCodec::default());
        loop {
            let frame = match frames.next().await {
                Some(frame) => frame?,
                None => {
                    return Err(BackendError::network(
                        "connection_closed",
                        "server closed the connection",
                    ));
                }
            };
            self.handle_frame(frame).await?;
        }
    }

    fn spawn_keepalive(&self) -> JoinHandle<()> {
        let connection = self.self_ref.clone();
        let period = self.config.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(connection) = connection.upgrade() else {
                    break;
                };
                if let Err(err) = connection.send_ping().await {
                    debug!(connection = %connection.id(), error = %err, "keepalive stopped");
                    break;
                }
            }
        })
    }

    async fn send_ping(&self) -> Result<(), BackendError> {
        trace!(connection = %self.id(), "sending ping");
        self.send_frame(RawFrame::from_message(
            MessageKind::Ping,
            &proto::Ping {
                timestamp: Some(now_ms()),
                ..proto::Ping::default()
            },
        ))
        .await
    }

    async fn send_frame(&self, frame: RawFrame) -> Result<(), BackendError> {
        let mut writer = self.writer.lock().await;
        let sink = writer
            .as_mut()
            .ok_or_else(|| BackendError::not_connected(self.id()))?;
        sink.send(frame).await.map_err(BackendError::from)
    }

    async fn handle_frame(&self, frame: RawFrame) -> Result<(), BackendError> {
        let Some(kind) = frame.known_kind() else {
            trace!(connection = %self.id(), kind = frame.kind, "skipping unknown frame type");
            return Ok(());
        };

        match kind {
            MessageKind::ServerSync => self.on_server_sync(frame.decode()?).await,
            MessageKind::Reject => {
                let reject: proto::Reject = frame.decode()?;
                Err(BackendError::new(
                    BackendErrorCategory::Auth,
                    reject.code(),
                    reject
                        .reason
                        .unwrap_or_else(|| "server rejected the connection".to_owned()),
                ))
            }
            MessageKind::ChannelState => {
                let state: proto::ChannelState = frame.decode()?;
                let changed = self.server().apply_channel_state(&state);
                self.publish_if(changed).await;
                Ok(())
            }
            MessageKind::ChannelRemove => {
                let remove: proto::ChannelRemove = frame.decode()?;
                let changed = self.server().remove_channel(remove.channel_id);
                self.publish_if(changed).await;
                Ok(())
            }
            MessageKind::UserState => {
                let state: proto::UserState = frame.decode()?;
                let changed = self.server().apply_user_state(&state);
                self.publish_if(changed).await;
                Ok(())
            }
            MessageKind::UserRemove => {
                let remove: proto::UserRemove = frame.decode()?;
                let changed = self.server().remove_user(remove.session);
                self.publish_if(changed).await;
                Ok(())
            }
            MessageKind::TextMessage => {
                self.on_text_message(frame.decode()?).await;
                Ok(())
            }
            MessageKind::ServerConfig => {
                let config: proto::ServerConfig = frame.decode()?;
                self.server().apply_server_config(&config);
                debug!(connection = %self.id(), limits = ?self.limits(), "server limits updated");
                Ok(())
            }
            MessageKind::PermissionDenied => {
                let denied: proto::PermissionDenied = frame.decode()?;
                warn!(
                    connection = %self.id(),
                    channel_id = ?denied.channel_id,
                    reason = denied.reason.as_deref().unwrap_or_default(),
                    "permission denied"
                );
                Ok(())
            }
            other => {
                trace!(connection = %self.id(), kind = ?other, "ignoring frame");
                Ok(())
            }
        }
    }

    async fn on_server_sync(&self, sync: proto::ServerSync) -> Result<(), BackendError> {
        let session = sync.session.ok_or_else(|| {
            BackendError::protocol("server_sync_without_session", "ServerSync carried no session")
        })?;
        self.server().set_own_session(session);

        if self.lifecycle.state() == ConnectionState::Connected {
            debug!(connection = %self.id(), session, "repeated server sync");
            return Ok(());
        }

        self.lifecycle.transition(ConnectionState::Connected)?;
        info!(connection = %self.id(), session, "connected");
        self.rebuild_channels();
        self.events.emit_connected(self.id()).await;
        self.publish_channels().await;

        if let Some(name) = self.config.channel.clone() {
            let joined = match self.channel_id_from_name(&name).await {
                Ok(channel_id) => self.join_channel(&channel_id).await,
                Err(err) => Err(err),
            };
            if let Err(err) = joined {
                warn!(connection = %self.id(), channel = %name, error = %err, "failed to join configured channel");
            }
        }
        Ok(())
    }

    async fn on_text_message(&self, text: proto::TextMessage) {
        let (author, own_name, own_channel, own_session) = {
            let server = self.server();
            let author = text.actor.and_then(|session| server.user(session).cloned());
            let own = server.own_user();
            (
                author,
                own.map(|user| user.name.clone())
                    .unwrap_or_else(|| self.config.username.clone()),
                own.map(|user| user.channel_id),
                server.own_session(),
            )
        };

        let is_private = !text.session.is_empty();
        let channel_id = text
            .channel_id
            .first()
            .or(text.tree_id.first())
            .copied()
            .or(author.as_ref().map(|user| user.channel_id).filter(|_| is_private))
            .or(own_channel);
        let Some(channel_id) = channel_id else {
            debug!(connection = %self.id(), "dropping text message without a channel");
            return;
        };

        let (body, attachments) = markup::parse_incoming(&text.message);
        let author_name = author.as_ref().map(|user| user.name.clone()).unwrap_or_default();
        let message = Message {
            id: String::new(),
            provider: PROVIDER.to_owned(),
            provider_instance: self.config.instance_id.clone(),
            author_id: author_name.clone(),
            author_alias: author_name.clone(),
            author_display_name: author_name,
            is_mentioning_self: mentions_name(&body, &own_name),
            body,
            formatted_bodies: [(MIME_HTML.to_owned(), text.message)].into(),
            channel_id: channel_id.to_string(),
            time_sent_ms: now_ms(),
            threading_id: String::new(),
            attachments,
            connection: self.handle(),
            is_from_self: text.actor.is_some() && text.actor == own_session,
            is_private,
        };

        debug!(
            connection = %self.id(),
            channel_id = %message.channel_id,
            author = %message.author_id,
            private = message.is_private,
            "text message received"
        );
        self.events.emit_message(&message).await;
    }

    fn rebuild_channels(&self) -> Vec<Channel> {
        let snapshot = self.server().snapshot(PROVIDER);
        *self.channels.write().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        snapshot
    }

    /// Rebuild the snapshot after a mutation. Listeners are only told once the
    /// initial sync is complete, so they never see a half-populated tree.
    async fn publish_if(&self, changed: bool) {
        if !changed {
            return;
        }
        if self.lifecycle.state() == ConnectionState::Connected {
            self.publish_channels().await;
        } else {
            self.rebuild_channels();
        }
    }

    async fn publish_channels(&self) {
        let snapshot = self.rebuild_channels();
        self.events
            .emit_channels_updated(self.id(), &snapshot)
            .await;
    }

    async fn send_text(&self, channel_id: &str, html: String) -> Result<(), BackendError> {
        self.ensure_connected()?;
        let channel = parse_channel_id(channel_id)?;
        if let Some(limit) = self.limits().message_length
            && html.len() > limit as usize
        {
            warn!(connection = %self.id(), len = html.len(), limit, "message exceeds server length limit");
        }

        self.send_frame(RawFrame::from_message(
            MessageKind::TextMessage,
            &proto::TextMessage {
                channel_id: vec![channel],
                message: html,
                ..proto::TextMessage::default()
            },
        ))
        .await
    }

    async fn render_message(&self, message: &Message) -> String {
        let limits = self.limits();
        let mut attachments = Vec::with_capacity(message.attachments.len());
        for attachment in &message.attachments {
            let preview = if attachment.kind == AttachmentKind::Image && limits.allow_html {
                markup::fetch_preview(&self.http, &attachment.uri, limits.image_message_length)
                    .await
            } else {
                None
            };
            attachments.push(RenderedAttachment {
                name: attachment.name.clone(),
                uri: attachment.uri.clone(),
                preview,
            });
        }
        markup::render_outgoing(&message.body, &attachments)
    }

    fn ensure_connected(&self) -> Result<(), BackendError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BackendError::not_connected(self.id()))
        }
    }

    async fn teardown(&self) {
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        self.server().clear();
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.lifecycle.disconnect();
    }

    fn handle(&self) -> ConnectionHandle {
        let weak: Weak<dyn Connection> = self.self_ref.clone();
        ConnectionHandle::new(weak)
    }

    fn server(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.server.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connection for MumbleConnection {
    fn id(&self) -> &str {
        &self.config.instance_id
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    fn user_id(&self) -> Option<String> {
        self.server().own_user().map(|user| user.name.clone())
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
        let result = self.connect_tls().await;
        self.teardown().await;
        if let Err(err) = &result {
            info!(connection = %self.id(), error = %err, "session ended");
        }
        result
    }

    async fn send_message(
        &self,
        channel_id: &str,
        message: &Message,
    ) -> Result<String, BackendError> {
        let html = self.render_message(message).await;
        self.send_text(channel_id, html).await?;
        Ok(String::new())
    }

    /// The protocol has no edits: the new text is posted as a fresh message.
    async fn update_message(
        &self,
        channel_id: &str,
        _message_id: &str,
        message: &Message,
    ) -> Result<String, BackendError> {
        self.send_message(channel_id, message).await
    }

    /// The protocol has no reactions: posts a short italic notice instead.
    async fn send_reaction(
        &self,
        channel_id: &str,
        reaction: &Reaction,
    ) -> Result<String, BackendError> {
        let author = reaction.author_label();
        let text = if author.is_empty() {
            format!("reacted {}", reaction.reaction)
        } else {
            format!("{author} reacted {}", reaction.reaction)
        };
        self.send_text(channel_id, format!("<i>{}</i>", escape_html(&text)))
            .await?;
        Ok(String::new())
    }

    async fn channel_id_from_name(&self, name: &str) -> Result<String, BackendError> {
        self.server()
            .find_channel(name)
            .map(|id| id.to_string())
            .ok_or_else(|| BackendError::not_found("channel", name))
    }

    async fn set_channel_topic(&self, channel_id: &str, topic: &str) -> Result<(), BackendError> {
        self.ensure_connected()?;
        let channel = parse_channel_id(channel_id)?;
        self.send_frame(RawFrame::from_message(
            MessageKind::ChannelState,
            &proto::ChannelState {
                channel_id: Some(channel),
                description: Some(markup::render_text(topic)),
                ..proto::ChannelState::default()
            },
        ))
        .await
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn version_frame() -> RawFrame {
    let (major, minor, patch) = PROTOCOL_VERSION;
    RawFrame::from_message(
        MessageKind::Version,
        &proto::Version {
            version_v1: Some(proto::version_v1(major, minor, patch)),
            version_v2: Some(proto::version_v2(
                major.into(),
                minor.into(),
                patch.into(),
            )),
            release: Some(CLIENT_RELEASE.to_owned()),
            os: Some(std::env::consts::OS.to_owned()),
            os_version: Some(std::env::consts::ARCH.to_owned()),
        },
    )
}

fn parse_channel_id(channel_id: &str) -> Result<u32, BackendError> {
    channel_id.parse().map_err(|_| {
        BackendError::new(
            BackendErrorCategory::Config,
            "invalid_channel_id",
            format!("not a channel id: {channel_id}"),
        )
    })
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use backend_core::ConnectionListener;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        connected: StdMutex<Vec<String>>,
        messages: StdMutex<Vec<Message>>,
        snapshots: StdMutex<Vec<Vec<Channel>>>,
    }

    #[async_trait]
    impl ConnectionListener for Recorder {
        async fn on_connected(&self, connection_id: &str) {
            self.connected
                .lock()
                .expect("lock")
                .push(connection_id.to_owned());
        }

        async fn on_message(&self, message: &Message) {
            self.messages.lock().expect("lock").push(message.clone());
        }

        async fn on_channels_updated(&self, _connection_id: &str, channels: &[Channel]) {
            self.snapshots.lock().expect("lock").push(channels.to_vec());
        }
    }

    struct FakeServer {
        reader: FramedRead<ReadHalf<DuplexStream>, FrameCodec>,
        writer: FramedWrite<WriteHalf<DuplexStream>, FrameCodec>,
    }

    impl FakeServer {
        fn new(stream: DuplexStream) -> Self {
            let (read, write) = tokio::io::split(stream);
            Self {
                reader: FramedRead::new(read, FrameCodec::default()),
                writer: FramedWrite::new(write, FrameCodec::default()),
            }
        }

        async fn next(&mut self) -> RawFrame {
            self.reader
                .next()
                .await
                .expect("client frame")
                .expect("valid frame")
        }

        async fn send<M: prost::Message>(&mut self, kind: MessageKind, message: &M) {
            self.writer
                .send(RawFrame::from_message(kind, message))
                .await
                .expect("server send");
        }

        async fn handshake(&mut self) -> proto::Authenticate {
            let version = self.next().await;
            assert_eq!(version.known_kind(), Some(MessageKind::Version));
            let auth = self.next().await;
            assert_eq!(auth.known_kind(), Some(MessageKind::Authenticate));
            auth.decode().expect("authenticate payload")
        }

        async fn sync_lobby(&mut self) {
            for (id, parent, name) in [(0, None, "Root"), (1, Some(0), "Lobby")] {
                self.send(
                    MessageKind::ChannelState,
                    &proto::ChannelState {
                        channel_id: Some(id),
                        parent,
                        name: Some(name.to_owned()),
                        ..proto::ChannelState::default()
                    },
                )
                .await;
            }
            for (session, name, channel) in [(7, "alice", 1), (9, "gateway", 0)] {
                self.send(
                    MessageKind::UserState,
                    &proto::UserState {
                        session: Some(session),
                        name: Some(name.to_owned()),
                        channel_id: Some(channel),
                        ..proto::UserState::default()
                    },
                )
                .await;
            }
            self.send(
                MessageKind::ServerSync,
                &proto::ServerSync {
                    session: Some(9),
                    ..proto::ServerSync::default()
                },
            )
            .await;
        }
    }

    fn test_connection() -> (Arc<MumbleConnection>, Arc<Recorder>) {
        let mut config = MumbleConfig::new("mumble-test", "localhost", "gateway");
        config.password = Some("secret".to_owned());
        config.ping_interval = Duration::from_secs(3600);
        let connection = MumbleConnection::new(config).expect("connection");
        let recorder = Arc::new(Recorder::default());
        connection.events().subscribe(recorder.clone());
        (connection, recorder)
    }

    async fn wait_connected(connection: &MumbleConnection) {
        let mut state = connection.lifecycle.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|state| *state == ConnectionState::Connected),
        )
        .await
        .expect("connected in time")
        .expect("state channel open");
    }

    #[tokio::test]
    async fn session_connects_and_surfaces_messages() {
        let (connection, recorder) = test_connection();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(async move {
            let mut server = FakeServer::new(server_io);
            let auth = server.handshake().await;
            assert_eq!(auth.username.as_deref(), Some("gateway"));
            assert_eq!(auth.password.as_deref(), Some("secret"));

            server.sync_lobby().await;
            server
                .send(
                    MessageKind::TextMessage,
                    &proto::TextMessage {
                        actor: Some(7),
                        channel_id: vec![1],
                        message: "hi <b>gateway</b> &amp; all".to_owned(),
                        ..proto::TextMessage::default()
                    },
                )
                .await;
            server
                .send(
                    MessageKind::UserRemove,
                    &proto::UserRemove {
                        session: 7,
                        ..proto::UserRemove::default()
                    },
                )
                .await;
        });

        let err = connection
            .run_stream(client_io)
            .await
            .expect_err("session ends when the server hangs up");
        assert_eq!(err.code, "connection_closed");
        server.await.expect("server task");

        assert_eq!(*recorder.connected.lock().expect("lock"), vec!["mumble-test"]);

        let messages = recorder.messages.lock().expect("lock");
        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(message.body, "hi gateway & all");
        assert_eq!(message.author_id, "alice");
        assert_eq!(message.channel_id, "1");
        assert_eq!(message.provider_instance, "mumble-test");
        assert!(message.is_mentioning_self);
        assert!(!message.is_from_self);
        assert!(!message.is_private);
        assert_eq!(
            message.formatted(MIME_HTML),
            Some("hi <b>gateway</b> &amp; all")
        );
        assert_eq!(
            message.connection.upgrade().map(|c| c.id().to_owned()),
            Some("mumble-test".to_owned())
        );

        let snapshots = recorder.snapshots.lock().expect("lock");
        assert_eq!(snapshots.len(), 2, "one snapshot at sync, one for the removal");
        let lobby = |snapshot: &Vec<Channel>| {
            snapshot
                .iter()
                .find(|channel| channel.id == "1")
                .map(|channel| channel.users.len())
        };
        assert_eq!(lobby(&snapshots[0]), Some(1));
        assert_eq!(lobby(&snapshots[1]), Some(0));
        assert_eq!(snapshots[1].len(), 2);
    }

    #[tokio::test]
    async fn outgoing_messages_are_escaped_text_frames() {
        let (connection, _recorder) = test_connection();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(async move {
            let mut server = FakeServer::new(server_io);
            server.handshake().await;
            server.sync_lobby().await;

            let text = server.next().await;
            assert_eq!(text.known_kind(), Some(MessageKind::TextMessage));
            let text: proto::TextMessage = text.decode().expect("text payload");
            assert_eq!(text.channel_id, vec![1]);
            assert_eq!(text.message, "a &lt; b<br>second line");

            let topic = server.next().await;
            assert_eq!(topic.known_kind(), Some(MessageKind::ChannelState));
            let topic: proto::ChannelState = topic.decode().expect("channel payload");
            assert_eq!(topic.channel_id, Some(1));
            assert_eq!(topic.description.as_deref(), Some("Weekly &amp; sync"));
        });

        let session = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.run_stream(client_io).await })
        };
        wait_connected(&connection).await;

        assert_eq!(
            connection
                .channel_id_from_name("lobby")
                .await
                .expect("resolve"),
            "1"
        );
        let id = connection
            .send_message("1", &Message::outgoing("a < b\nsecond line"))
            .await
            .expect("send");
        assert!(id.is_empty());
        connection
            .set_channel_topic("1", "Weekly & sync")
            .await
            .expect("topic");

        server.await.expect("server task");
        let ended = session.await.expect("session task");
        assert!(ended.is_err());
    }

    #[tokio::test]
    async fn reject_aborts_with_auth_error() {
        let (connection, recorder) = test_connection();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(async move {
            let mut server = FakeServer::new(server_io);
            server.handshake().await;
            server
                .send(
                    MessageKind::Reject,
                    &proto::Reject {
                        reject_type: Some(3),
                        reason: Some("Wrong password".to_owned()),
                    },
                )
                .await;
            server
        });

        let err = connection
            .run_stream(client_io)
            .await
            .expect_err("reject ends the session");
        assert_eq!(err.category, BackendErrorCategory::Auth);
        assert_eq!(err.code, "wrong_user_password");
        assert_eq!(err.message, "Wrong password");
        assert!(recorder.connected.lock().expect("lock").is_empty());
        drop(server.await.expect("server task"));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_on_its_own_timer() {
        let mut config = MumbleConfig::new("mumble-test", "localhost", "gateway");
        config.ping_interval = Duration::from_secs(15);
        let connection = MumbleConnection::new(config).expect("connection");
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let session = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.run_stream(client_io).await })
        };

        let mut server = FakeServer::new(server_io);
        server.handshake().await;
        server.sync_lobby().await;

        let started = tokio::time::Instant::now();
        let ping = server.next().await;
        assert_eq!(ping.known_kind(), Some(MessageKind::Ping));
        assert!(started.elapsed() >= Duration::from_secs(15));
        let ping: proto::Ping = ping.decode().expect("ping payload");
        assert!(ping.timestamp.is_some());

        drop(server);
        assert!(session.await.expect("session task").is_err());
    }

    #[tokio::test]
    async fn operations_need_a_live_session() {
        let (connection, _recorder) = test_connection();
        let err = connection
            .send_message("1", &Message::outgoing("hello"))
            .await
            .expect_err("not connected");
        assert_eq!(err.code, "not_connected");

        let err = connection
            .channel_id_from_name("Lobby")
            .await
            .expect_err("no channels yet");
        assert_eq!(err.category, BackendErrorCategory::NotFound);
    }

    #[tokio::test]
    #[ignore = "requires a reachable Mumble server; set MUMBLE_TEST_HOST"]
    async fn live_server_reaches_connected() {
        let Ok(host) = std::env::var("MUMBLE_TEST_HOST") else {
            return;
        };
        let mut config = MumbleConfig::new("live", host, "gateway-test");
        config.tls.accept_invalid_certs = true;
        let connection = MumbleConnection::new(config).expect("connection");
        let session = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.start().await })
        };
        wait_connected(&connection).await;
        assert!(!connection.channels().is_empty());
        session.abort();
    }
}
