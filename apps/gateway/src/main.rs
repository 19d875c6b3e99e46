//! Chat gateway: connects every configured backend, keeps each session alive
//! with exponential backoff and runs the relay pipeline over their events.

mod config;
mod logging;

use std::{process::ExitCode, sync::Arc};

use backend_core::{BackendError, Connection, RetryPolicy, run_with_retry};
use backend_matrix::MatrixConnection;
use backend_mumble::MumbleConnection;
use config::{ConnectionConfig, GatewayConfig};
use relay::{Dispatcher, MessageHandler, RelayHandler};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    info!("starting gateway");

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let connections = match build_connections(&config.connections) {
        Ok(connections) => connections,
        Err(err) => {
            error!(error = %err, "failed to construct connections");
            return ExitCode::FAILURE;
        }
    };

    let relay = match RelayHandler::new(&connections, config.relays.clone()) {
        Ok(relay) => relay,
        Err(err) => {
            error!(error = %err, "invalid relay pairings");
            return ExitCode::FAILURE;
        }
    };
    let handlers: Vec<Arc<dyn MessageHandler>> = vec![Arc::new(relay)];
    let dispatcher = Dispatcher::new(handlers);
    dispatcher.attach(&connections);
    info!(
        connections = connections.len(),
        relays = config.relays.len(),
        "pipeline ready"
    );

    let mut sessions = JoinSet::new();
    for connection in &connections {
        sessions.spawn(supervise(connection.clone(), config.retry));
    }

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "failed to listen for shutdown signal");
                }
                info!("shutting down");
                return ExitCode::SUCCESS;
            }
            finished = sessions.join_next() => match finished {
                Some(Ok((id, Ok(())))) => info!(connection = %id, "session finished"),
                Some(Ok((id, Err(err)))) => error!(connection = %id, error = %err, "gave up reconnecting"),
                Some(Err(err)) => error!(error = %err, "session task failed"),
                None => {
                    warn!("no sessions left");
                    return ExitCode::FAILURE;
                }
            },
        }
    }
}

fn build_connections(
    configs: &[ConnectionConfig],
) -> Result<Vec<Arc<dyn Connection>>, BackendError> {
    configs
        .iter()
        .map(|config| {
            let connection: Arc<dyn Connection> = match config {
                ConnectionConfig::Mumble(config) => MumbleConnection::new(config.clone())?,
                ConnectionConfig::Matrix(config) => MatrixConnection::new(config.clone())?,
            };
            info!(connection = %connection.id(), provider = connection.provider(), "connection configured");
            Ok(connection)
        })
        .collect()
}

/// Run sessions of one connection until it finishes cleanly or the retry
/// budget is spent.
async fn supervise(
    connection: Arc<dyn Connection>,
    policy: RetryPolicy,
) -> (String, Result<(), BackendError>) {
    let id = connection.id().to_owned();
    let result = run_with_retry(
        &policy,
        || {
            let connection = connection.clone();
            async move { connection.start().await }
        },
        |err: &BackendError, attempt| {
            if err.is_transient() {
                warn!(connection = %id, error = %err, attempt = attempt.attempt, delay_ms = attempt.delay.as_millis() as u64, "session failed; reconnecting");
            } else {
                error!(connection = %id, error = %err, attempt = attempt.attempt, delay_ms = attempt.delay.as_millis() as u64, "session failed with non-transient error; reconnecting");
            }
        },
    )
    .await;
    (id, result)
}
