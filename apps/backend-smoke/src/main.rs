//! Connect one backend and log what it reports until interrupted.
//!
//! `SMOKE_BACKEND=mumble` reads `MUMBLE_HOST`, `MUMBLE_USER`, optional
//! `MUMBLE_PASSWORD`, `MUMBLE_CHANNEL` and `MUMBLE_ACCEPT_INVALID_CERTS=1`.
//! `SMOKE_BACKEND=matrix` reads `MATRIX_HOMESERVER`, `MATRIX_USER` and
//! `MATRIX_PASSWORD`.

use std::{env, process::ExitCode, sync::Arc};

use async_trait::async_trait;
use backend_core::{Channel, Connection, ConnectionListener, Message, Reaction};
use backend_matrix::{MatrixConfig, MatrixConnection};
use backend_mumble::{MumbleConfig, MumbleConnection};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

struct LogListener;

#[async_trait]
impl ConnectionListener for LogListener {
    async fn on_connected(&self, connection_id: &str) {
        info!(connection = %connection_id, "connected");
    }

    async fn on_message(&self, message: &Message) {
        info!(
            connection = %message.provider_instance,
            channel_id = %message.channel_id,
            author = message.author_label(),
            private = message.is_private,
            mention = message.is_mentioning_self,
            attachments = message.attachments.len(),
            "{}",
            message.body
        );
    }

    async fn on_reaction(&self, reaction: &Reaction) {
        info!(
            connection = %reaction.provider_instance,
            message_id = %reaction.message_id,
            author = reaction.author_label(),
            reaction = %reaction.reaction,
            "reaction"
        );
    }

    async fn on_channels_updated(&self, connection_id: &str, channels: &[Channel]) {
        for channel in channels {
            let users: Vec<&str> = channel.users.iter().map(|user| user.label()).collect();
            info!(
                connection = %connection_id,
                channel_id = %channel.id,
                name = %channel.display_name,
                users = ?users,
                "channel"
            );
        }
    }
}

fn required(key: &str) -> Result<String, String> {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| format!("{key} is required"))
}

fn connection_from_env() -> Result<Arc<dyn Connection>, String> {
    let backend = env::var("SMOKE_BACKEND").unwrap_or_else(|_| "mumble".to_owned());
    match backend.as_str() {
        "mumble" => {
            let mut config =
                MumbleConfig::new("smoke", required("MUMBLE_HOST")?, required("MUMBLE_USER")?);
            config.password = env::var("MUMBLE_PASSWORD").ok();
            config.channel = env::var("MUMBLE_CHANNEL").ok();
            config.tls.accept_invalid_certs =
                env::var("MUMBLE_ACCEPT_INVALID_CERTS").is_ok_and(|value| value == "1");
            Ok(MumbleConnection::new(config).map_err(|err| err.to_string())?)
        }
        "matrix" => {
            let config = MatrixConfig::new(
                "smoke",
                required("MATRIX_HOMESERVER")?,
                required("MATRIX_USER")?,
                required("MATRIX_PASSWORD")?,
            );
            Ok(MatrixConnection::new(config).map_err(|err| err.to_string())?)
        }
        other => Err(format!("unknown SMOKE_BACKEND '{other}'")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let connection = match connection_from_env() {
        Ok(connection) => connection,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };
    connection.events().subscribe(Arc::new(LogListener));

    tokio::select! {
        result = connection.start() => {
            if let Err(err) = result {
                error!(error = %err, "session ended");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            ExitCode::SUCCESS
        }
    }
}
