//! Message pipeline, relay pairings and attendance tracking.
//!
//! The [`Dispatcher`] subscribes to every connection's event hub and runs
//! its handler chain on the emitting connection's task. [`RelayHandler`] is
//! the handler that cross-posts chat between paired channels and keeps an
//! attendance message in sync with the source channel's roster.

pub mod attendance;
pub mod pipeline;
pub mod relay;

pub use attendance::{AttendancePhase, AttendanceStep, AttendanceTracker, format_duration};
pub use pipeline::{Dispatcher, HandlerOutcome, MessageHandler};
pub use relay::{DEFAULT_PREFIX, RelayHandler, RelayPairing};
