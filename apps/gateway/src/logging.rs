//! Tracing bootstrap for the gateway process.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str =
    "info,gateway=debug,backend_mumble=debug,backend_matrix=debug,relay=debug";

/// Install the global fmt subscriber.
///
/// Filter precedence:
/// 1) `RUST_LOG`
/// 2) `GATEWAY_LOG`
/// 3) built-in default
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_env_filter(filter_from_lookup(|key| env::var(key).ok()))
        .try_init();
}

fn filter_from_lookup<F>(mut lookup: F) -> EnvFilter
where
    F: FnMut(&str) -> Option<String>,
{
    for key in [EnvFilter::DEFAULT_ENV, "GATEWAY_LOG"] {
        if let Some(value) = lookup(key).filter(|value| !value.trim().is_empty())
            && let Ok(filter) = EnvFilter::try_new(value)
        {
            return filter;
        }
    }
    EnvFilter::new(DEFAULT_FILTER)
}
