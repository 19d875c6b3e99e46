//! Core gateway contract shared by every backend connection and the relay
//! pipeline.
//!
//! This crate defines the canonical chat model, the connection contract and
//! its listener hub, the connection lifecycle model, and the retry/error
//! helpers every protocol client builds on.

/// Connection listener registry and synchronous event fan-out.
pub mod channel;
/// The capability contract every backend connection implements.
pub mod connection;
/// Stable backend error types and HTTP classification helpers.
pub mod error;
/// Roster comparison and text normalization helpers.
pub mod normalization;
/// Exponential backoff policy and the retry wrapper for connect loops.
pub mod retry;
/// Connection lifecycle state machine.
pub mod state_machine;
/// Canonical message/channel/user model.
pub mod types;

pub use channel::{ConnectionEvents, ConnectionListener};
pub use connection::{Connection, ConnectionHandle};
pub use error::{BackendError, BackendErrorCategory, classify_http_status};
pub use normalization::{
    display_name_list, escape_html, mentions_name, normalize_reaction_key, plain_text_from_html,
    roster_ids, same_roster,
};
pub use retry::{RetryAttempt, RetryHint, RetryPolicy, run_with_retry};
pub use state_machine::{ConnectionState, ConnectionStateMachine};
pub use types::{
    Attachment, AttachmentKind, Channel, MIME_HTML, Message, Presence, Reaction, User,
};
