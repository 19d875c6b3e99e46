//! Environment and document backed runtime configuration for `gateway`.
//!
//! `GATEWAY_CONFIG` names a JSON document listing connections and relay
//! pairings. Secrets in that document may be written as `"env:NAME"` and are
//! resolved through the same lookup as the environment itself.

use std::{collections::BTreeSet, env, fs, io, path::PathBuf, time::Duration};

use backend_core::RetryPolicy;
use backend_matrix::{HTTP_TIMEOUT_MARGIN, MatrixConfig};
use backend_mumble::{MumbleConfig, TlsOptions};
use relay::RelayPairing;
use serde::Deserialize;
use thiserror::Error;

const ENV_SECRET_PREFIX: &str = "env:";
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_DELAY_SECS: u64 = 300;

/// Fully resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub connections: Vec<ConnectionConfig>,
    pub relays: Vec<RelayPairing>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub enum ConnectionConfig {
    Mumble(MumbleConfig),
    Matrix(MatrixConfig),
}

impl ConnectionConfig {
    pub fn id(&self) -> &str {
        match self {
            Self::Mumble(config) => &config.instance_id,
            Self::Matrix(config) => &config.instance_id,
        }
    }
}

/// Errors produced while loading runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required {key}")]
    Missing { key: String },
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed config document: {0}")]
    Document(#[from] serde_json::Error),
}

impl ConfigError {
    fn invalid(key: impl Into<String>, value: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Document {
    connections: Vec<ConnectionEntry>,
    #[serde(default)]
    relays: Vec<RelayPairing>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum ConnectionEntry {
    Mumble(MumbleEntry),
    Matrix(MatrixEntry),
}

#[derive(Debug, Deserialize)]
struct MumbleEntry {
    id: String,
    host: String,
    port: Option<u16>,
    username: String,
    password: Option<String>,
    #[serde(default)]
    tokens: Vec<String>,
    channel: Option<String>,
    ping_interval_secs: Option<u64>,
    #[serde(default)]
    accept_invalid_certs: bool,
    ca_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct MatrixEntry {
    id: String,
    homeserver: String,
    user: String,
    password: String,
    device_name: Option<String>,
    poll_timeout_secs: Option<u64>,
    http_timeout_secs: Option<u64>,
    auto_join: Option<bool>,
    #[serde(default)]
    auto_join_servers: Vec<String>,
}

impl GatewayConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let path = optional_trimmed_env("GATEWAY_CONFIG", &mut lookup)
            .map(PathBuf::from)
            .ok_or_else(|| ConfigError::Missing {
                key: "GATEWAY_CONFIG".to_owned(),
            })?;
        let document = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_document(&document, lookup)
    }

    fn from_document<F>(document: &str, mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let retry_max_delay_secs = parse_optional_u64("GATEWAY_RETRY_MAX_DELAY_SECS", &mut lookup)?
            .unwrap_or(DEFAULT_RETRY_MAX_DELAY_SECS);
        if retry_max_delay_secs == 0 {
            return Err(ConfigError::invalid(
                "GATEWAY_RETRY_MAX_DELAY_SECS",
                0,
                "must be at least 1",
            ));
        }
        let retry_max_attempts =
            parse_optional_u64("GATEWAY_RETRY_MAX_ATTEMPTS", &mut lookup)?
                .map(|attempts| {
                    u32::try_from(attempts).map_err(|err| {
                        ConfigError::invalid("GATEWAY_RETRY_MAX_ATTEMPTS", attempts, err.to_string())
                    })
                })
                .transpose()?;
        let retry = RetryPolicy::new(
            DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_secs.saturating_mul(1_000),
        )
        .with_max_retries(retry_max_attempts);

        let document: Document = serde_json::from_str(document)?;

        let mut ids = BTreeSet::new();
        let mut connections = Vec::with_capacity(document.connections.len());
        for entry in document.connections {
            let connection = match entry {
                ConnectionEntry::Mumble(entry) => mumble_config(entry, &mut lookup)?,
                ConnectionEntry::Matrix(entry) => matrix_config(entry, &mut lookup)?,
            };
            if connection.id().trim().is_empty() {
                return Err(ConfigError::invalid("connections[].id", "", "must not be empty"));
            }
            if !ids.insert(connection.id().to_owned()) {
                return Err(ConfigError::invalid(
                    "connections[].id",
                    connection.id(),
                    "duplicate connection id",
                ));
            }
            connections.push(connection);
        }

        for pairing in &document.relays {
            for id in [&pairing.from_connection, &pairing.to_connection] {
                if !ids.contains(id) {
                    return Err(ConfigError::invalid(
                        "relays[]",
                        id,
                        "references an unknown connection",
                    ));
                }
            }
        }

        Ok(Self {
            connections,
            relays: document.relays,
            retry,
        })
    }
}

fn mumble_config<F>(entry: MumbleEntry, lookup: &mut F) -> Result<ConnectionConfig, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let key = |field: &str| format!("connections.{}.{field}", entry.id);

    let mut config = MumbleConfig::new(entry.id.clone(), entry.host.trim(), entry.username.trim());
    if config.host.is_empty() {
        return Err(ConfigError::invalid(key("host"), "", "must not be empty"));
    }
    if let Some(port) = entry.port {
        if port == 0 {
            return Err(ConfigError::invalid(key("port"), port, "must be non-zero"));
        }
        config.port = port;
    }
    if let Some(secs) = entry.ping_interval_secs {
        if secs == 0 {
            return Err(ConfigError::invalid(key("ping_interval_secs"), secs, "must be at least 1"));
        }
        config.ping_interval = Duration::from_secs(secs);
    }
    config.password = entry
        .password
        .map(|password| resolve_secret(&key("password"), &password, lookup))
        .transpose()?;
    config.tokens = entry.tokens;
    config.channel = entry.channel.filter(|channel| !channel.trim().is_empty());
    config.tls = TlsOptions {
        accept_invalid_certs: entry.accept_invalid_certs,
        ca_file: entry.ca_file,
    };
    Ok(ConnectionConfig::Mumble(config))
}

fn matrix_config<F>(entry: MatrixEntry, lookup: &mut F) -> Result<ConnectionConfig, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let key = |field: &str| format!("connections.{}.{field}", entry.id);

    let password = resolve_secret(&key("password"), &entry.password, lookup)?;
    let mut config = MatrixConfig::new(
        entry.id.clone(),
        entry.homeserver.trim(),
        entry.user.trim(),
        password,
    );
    if let Some(device_name) = entry.device_name {
        config.device_name = device_name;
    }
    if let Some(secs) = entry.poll_timeout_secs {
        if secs == 0 {
            return Err(ConfigError::invalid(key("poll_timeout_secs"), secs, "must be at least 1"));
        }
        config.poll_timeout = Duration::from_secs(secs);
    }
    config.http_timeout = match entry.http_timeout_secs {
        Some(secs) => Duration::from_secs(secs),
        None => config.poll_timeout + HTTP_TIMEOUT_MARGIN,
    };
    if config.http_timeout <= config.poll_timeout {
        return Err(ConfigError::invalid(
            key("http_timeout_secs"),
            config.http_timeout.as_secs(),
            "must exceed poll_timeout_secs",
        ));
    }
    if let Some(auto_join) = entry.auto_join {
        config.auto_join = auto_join;
    }
    config.auto_join_servers = entry.auto_join_servers;
    Ok(ConnectionConfig::Matrix(config))
}

/// Resolve `env:NAME` references; literal values pass through.
fn resolve_secret<F>(key: &str, value: &str, lookup: &mut F) -> Result<String, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(name) = value.strip_prefix(ENV_SECRET_PREFIX) else {
        return Ok(value.to_owned());
    };
    lookup(name.trim()).ok_or_else(|| {
        ConfigError::invalid(key, value, format!("environment variable {} is not set", name.trim()))
    })
}

fn optional_trimmed_env<F>(key: &str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u64<F>(key: &str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::invalid(key, value, err.to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const DOCUMENT: &str = r##"{
        "connections": [
            {"kind": "mumble", "id": "voice", "host": "voice.example.org", "username": "gateway",
             "password": "env:VOICE_PASSWORD", "channel": "Lobby"},
            {"kind": "matrix", "id": "chat", "homeserver": "https://matrix.example.org",
             "user": "@gateway:example.org", "password": "hunter2", "poll_timeout_secs": 20,
             "auto_join_servers": ["example.org"]}
        ],
        "relays": [
            {"from_connection": "voice", "from_channel": "Lobby",
             "to_connection": "chat", "to_channel": "#bridge:example.org", "prefix": "<{author}> "}
        ]
    }"##;

    fn config_from(
        document: &str,
        pairs: &[(&str, &str)],
    ) -> Result<GatewayConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        GatewayConfig::from_document(document, |key| map.get(key).cloned())
    }

    #[test]
    fn parses_connections_relays_and_defaults() {
        let cfg = config_from(DOCUMENT, &[("VOICE_PASSWORD", "s3cret")]).expect("config should parse");

        assert_eq!(cfg.connections.len(), 2);
        let ConnectionConfig::Mumble(voice) = &cfg.connections[0] else {
            panic!("expected mumble connection");
        };
        assert_eq!(voice.port, backend_mumble::DEFAULT_PORT);
        assert_eq!(voice.ping_interval, backend_mumble::DEFAULT_PING_INTERVAL);
        assert_eq!(voice.password.as_deref(), Some("s3cret"));
        assert_eq!(voice.channel.as_deref(), Some("Lobby"));
        assert!(!voice.tls.accept_invalid_certs);

        let ConnectionConfig::Matrix(chat) = &cfg.connections[1] else {
            panic!("expected matrix connection");
        };
        assert_eq!(chat.poll_timeout, Duration::from_secs(20));
        assert_eq!(chat.http_timeout, Duration::from_secs(50));
        assert_eq!(chat.password, "hunter2");
        assert!(chat.auto_join);

        assert_eq!(cfg.relays[0].prefix, "<{author}> ");
        assert_eq!(cfg.retry.max_delay_ms(), 300_000);
        assert_eq!(cfg.retry.max_retries(), None);
    }

    #[test]
    fn parses_retry_tuning() {
        let cfg = config_from(
            DOCUMENT,
            &[
                ("VOICE_PASSWORD", "x"),
                ("GATEWAY_RETRY_MAX_DELAY_SECS", "60"),
                ("GATEWAY_RETRY_MAX_ATTEMPTS", "5"),
            ],
        )
        .expect("config should parse");
        assert_eq!(cfg.retry.max_delay_ms(), 60_000);
        assert_eq!(cfg.retry.max_retries(), Some(5));
    }

    #[test]
    fn unresolved_secret_reference_is_an_error() {
        let err = config_from(DOCUMENT, &[]).expect_err("secret is missing");
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "connections.voice.password"
        ));
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let err = config_from(DOCUMENT, &[("GATEWAY_RETRY_MAX_DELAY_SECS", "soon")])
            .expect_err("invalid delay should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "GATEWAY_RETRY_MAX_DELAY_SECS"
        ));
    }

    #[test]
    fn rejects_http_timeout_inside_poll_window() {
        let document = r#"{"connections": [{"kind": "matrix", "id": "chat",
            "homeserver": "https://m.example.org", "user": "bot", "password": "pw",
            "poll_timeout_secs": 30, "http_timeout_secs": 30}]}"#;
        let err = config_from(document, &[]).expect_err("timeout too short");
        assert!(err.to_string().contains("http_timeout_secs"), "{err}");
    }

    #[test]
    fn rejects_duplicate_ids_and_dangling_relays() {
        let duplicate = r#"{"connections": [
            {"kind": "mumble", "id": "a", "host": "h", "username": "u"},
            {"kind": "mumble", "id": "a", "host": "h", "username": "u"}]}"#;
        assert!(config_from(duplicate, &[]).is_err());

        let dangling = r#"{"connections": [{"kind": "mumble", "id": "a", "host": "h", "username": "u"}],
            "relays": [{"from_connection": "a", "from_channel": "x", "to_connection": "b", "to_channel": "y"}]}"#;
        let err = config_from(dangling, &[]).expect_err("unknown relay target");
        assert!(err.to_string().contains("unknown connection"), "{err}");
    }

    #[test]
    fn rejects_unknown_connection_kinds() {
        let document = r#"{"connections": [{"kind": "irc", "id": "a"}]}"#;
        assert!(matches!(
            config_from(document, &[]),
            Err(ConfigError::Document(_))
        ));
    }

    #[test]
    fn config_path_is_required() {
        let err = GatewayConfig::from_lookup(|_| None).expect_err("no path");
        assert!(matches!(err, ConfigError::Missing { .. }));
    }
}
