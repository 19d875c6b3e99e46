//! Thin wrapper over the client-server API v3 endpoints the gateway uses.

use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
    time::Duration,
};

use backend_core::{BackendError, BackendErrorCategory, classify_http_status};
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use url::Url;
use uuid::Uuid;

use crate::events::{RawEvent, lenient_events};

const CLIENT_PREFIX: [&str; 3] = ["_matrix", "client", "v3"];

/// Keeps the initial full-state sync small: state is complete, timelines are
/// cut to the latest event.
const INITIAL_SYNC_FILTER: &str = r#"{"room":{"timeline":{"limit":1}}}"#;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoginResponse {
    pub user_id: String,
    pub access_token: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: SyncRooms,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncRooms {
    #[serde(default)]
    pub join: BTreeMap<String, JoinedRoom>,
    #[serde(default)]
    pub invite: BTreeMap<String, InvitedRoom>,
    #[serde(default)]
    pub leave: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinedRoom {
    #[serde(default)]
    pub state: EventBatch,
    #[serde(default)]
    pub timeline: Timeline,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvitedRoom {
    #[serde(default)]
    pub invite_state: EventBatch,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventBatch {
    #[serde(default, deserialize_with = "lenient_events")]
    pub events: Vec<RawEvent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Timeline {
    #[serde(default, deserialize_with = "lenient_events")]
    pub events: Vec<RawEvent>,
    #[serde(default)]
    pub limited: bool,
}

/// Structured error body returned by the homeserver.
#[derive(Debug, Clone, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errcode: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    retry_after_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EventIdResponse {
    event_id: String,
}

#[derive(Debug, Deserialize)]
struct RoomIdResponse {
    room_id: String,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    #[serde(rename = "type")]
    login_type: &'static str,
    identifier: LoginIdentifier<'a>,
    password: &'a str,
    initial_device_display_name: &'a str,
}

#[derive(Debug, Serialize)]
struct LoginIdentifier<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    user: &'a str,
}

#[derive(Debug)]
pub struct MatrixApi {
    http: reqwest::Client,
    homeserver: Url,
    access_token: RwLock<Option<String>>,
}

impl MatrixApi {
    pub fn new(homeserver: &str, request_timeout: Duration) -> Result<Self, BackendError> {
        let homeserver = Url::parse(homeserver).map_err(|err| {
            BackendError::new(
                BackendErrorCategory::Config,
                "invalid_homeserver_url",
                format!("invalid homeserver url '{homeserver}': {err}"),
            )
        })?;
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| {
                BackendError::new(
                    BackendErrorCategory::Config,
                    "client_build_error",
                    err.to_string(),
                )
            })?;

        Ok(Self {
            http,
            homeserver,
            access_token: RwLock::new(None),
        })
    }

    pub fn has_access_token(&self) -> bool {
        self.token().is_some()
    }

    /// Forget the access token so the next session logs in again.
    pub fn clear_access_token(&self) {
        *self
            .access_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Password login; the returned token is kept for later calls.
    pub async fn login(
        &self,
        user: &str,
        password: &str,
        device_name: &str,
    ) -> Result<LoginResponse, BackendError> {
        let request = LoginRequest {
            login_type: "m.login.password",
            identifier: LoginIdentifier {
                kind: "m.id.user",
                user,
            },
            password,
            initial_device_display_name: device_name,
        };
        let response: LoginResponse = self
            .send(self.http.post(self.endpoint(&["login"])?).json(&request))
            .await?;

        *self
            .access_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(response.access_token.clone());
        Ok(response)
    }

    /// One sync call. Without `since` the timeline is cut by the initial
    /// filter; `full_state` asks for complete room state either way.
    pub async fn sync(
        &self,
        since: Option<&str>,
        timeout: Duration,
        full_state: bool,
    ) -> Result<SyncResponse, BackendError> {
        let mut url = self.endpoint(&["sync"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("timeout", &timeout.as_millis().to_string());
            match since {
                Some(since) => {
                    query.append_pair("since", since);
                }
                None => {
                    query.append_pair("filter", INITIAL_SYNC_FILTER);
                }
            }
            if full_state {
                query.append_pair("full_state", "true");
            }
        }
        self.send(self.authed(Method::GET, url)?).await
    }

    /// Join a room by id or alias and return the joined room id.
    pub async fn join_room(&self, room: &str) -> Result<String, BackendError> {
        let url = self.endpoint(&["join", room])?;
        let response: RoomIdResponse = self
            .send(self.authed(Method::POST, url)?.json(&json!({})))
            .await?;
        Ok(response.room_id)
    }

    /// Send a timeline event with a fresh transaction id and return its id.
    pub async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<String, BackendError> {
        let txn_id = Uuid::new_v4().simple().to_string();
        let url = self.endpoint(&["rooms", room_id, "send", event_type, &txn_id])?;
        let response: EventIdResponse = self
            .send(self.authed(Method::PUT, url)?.json(content))
            .await?;
        Ok(response.event_id)
    }

    pub async fn set_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<String, BackendError> {
        let url = self.endpoint(&["rooms", room_id, "state", event_type, state_key])?;
        let response: EventIdResponse = self
            .send(self.authed(Method::PUT, url)?.json(content))
            .await?;
        Ok(response.event_id)
    }

    /// Resolve `#alias:server` to a room id through the room directory.
    pub async fn resolve_alias(&self, alias: &str) -> Result<String, BackendError> {
        let url = self.endpoint(&["directory", "room", alias])?;
        let response: RoomIdResponse = self.send(self.authed(Method::GET, url)?).await?;
        Ok(response.room_id)
    }

    /// Public download URL for an `mxc://server/media` content URI.
    pub fn download_url(&self, content_uri: &str) -> Option<String> {
        let (server, media_id) = content_uri.strip_prefix("mxc://")?.split_once('/')?;
        if server.is_empty() || media_id.is_empty() {
            return None;
        }
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .ok()?
            .pop_if_empty()
            .extend(["_matrix", "media", "v3", "download", server, media_id]);
        Some(url.to_string())
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .map_err(|()| {
                BackendError::new(
                    BackendErrorCategory::Config,
                    "invalid_homeserver_url",
                    format!("homeserver url cannot be a base: {}", self.homeserver),
                )
            })?
            .pop_if_empty()
            .extend(CLIENT_PREFIX)
            .extend(segments);
        Ok(url)
    }

    fn token(&self) -> Option<String> {
        self.access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn authed(&self, method: Method, url: Url) -> Result<RequestBuilder, BackendError> {
        let token = self.token().ok_or_else(|| {
            BackendError::new(
                BackendErrorCategory::Auth,
                "not_logged_in",
                "no access token; log in first",
            )
        })?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, BackendError> {
        let response = request.send().await.map_err(map_transport_error)?;
        if !response.status().is_success() {
            return Err(map_error_response(response).await);
        }
        response.json::<T>().await.map_err(|err| {
            BackendError::new(
                BackendErrorCategory::Serialization,
                "invalid_response_body",
                err.to_string(),
            )
        })
    }
}

fn map_transport_error(err: reqwest::Error) -> BackendError {
    let code = if err.is_timeout() {
        "http_timeout"
    } else if err.is_connect() {
        "http_connect_failed"
    } else {
        "http_request_failed"
    };
    BackendError::network(code, err.to_string())
}

async fn map_error_response(response: Response) -> BackendError {
    let status = response.status().as_u16();
    let body: ErrorBody = response.json().await.unwrap_or_default();
    map_error_body(status, body)
}

fn map_error_body(status: u16, body: ErrorBody) -> BackendError {
    let errcode = body.errcode.unwrap_or_else(|| format!("http_{status}"));
    let category = match errcode.as_str() {
        "M_LIMIT_EXCEEDED" => BackendErrorCategory::RateLimited,
        "M_FORBIDDEN" | "M_UNKNOWN_TOKEN" | "M_MISSING_TOKEN" | "M_USER_DEACTIVATED" => {
            BackendErrorCategory::Auth
        }
        "M_NOT_FOUND" => BackendErrorCategory::NotFound,
        _ => classify_http_status(status),
    };
    let message = body
        .error
        .unwrap_or_else(|| format!("homeserver responded with status {status}"));

    let mapped = BackendError::new(category, errcode, message);
    match body.retry_after_ms {
        Some(delay) => mapped.with_retry_after(Duration::from_millis(delay)),
        None => mapped,
    }
}
