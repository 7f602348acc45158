mod connection;
mod transport;

use connection::{ConnectionConfig, ConnectionManager};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = ConnectionConfig::from_env()?;

    let max_retries = config.max_retries;
    let manager = ConnectionManager::new(config);

    info!("Feed client starting");
    info!("  Address: {}", manager.address());
    info!("  Max retries: {}", max_retries);

    let mut status = manager.status_watch();
    let mut progress = manager.progress_watch();
    let mut updates = manager.subscribe();

    // Each stdin line is a JSON message to send, or a `:` control command
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    error!("Connection manager closed");
                    break;
                }
                let current = *status.borrow_and_update();
                info!("Connection status: {}", current);
            }
            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *progress.borrow_and_update();
                debug!("  {:?}", current);
                if current.lifecycle.is_terminal() {
                    warn!("Connection ended ({:?}); not retrying", current.lifecycle);
                    break;
                }
            }
            update = updates.recv() => match update {
                Ok(update) => {
                    info!(key = %update.key, "Update: {}", update.data);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Fell behind; {} updates skipped (snapshot still has them)", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => handle_line(&manager, &line).await,
                Ok(None) => stdin_open = false,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
            _ = &mut ctrl_c => {
                info!("Interrupted; shutting down");
                break;
            }
        }
    }

    manager.shutdown();
    let pending = manager.updates().await;
    info!("{} records updated this run", pending.len());
    for (key, data) in pending.iter() {
        debug!("  {} => {}", key, data);
    }
    manager.join().await;

    Ok(())
}

async fn handle_line(manager: &ConnectionManager, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    if let Some(command) = line.strip_prefix(':') {
        control(manager, command);
        return;
    }

    let message = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(e) => {
            warn!("Not sending invalid JSON: {}", e);
            return;
        }
    };

    match manager.send(message).await {
        Ok(()) => debug!("Sent: {}", line),
        Err(e) => error!("Cannot send message: {}", e),
    }
}

/// Operator commands: `:online`, `:offline` and `:status`
fn control(manager: &ConnectionManager, command: &str) {
    let connectivity = manager.connectivity();
    match command.trim() {
        "online" => connectivity.set_online(true),
        "offline" => connectivity.set_online(false),
        "status" => {
            let progress = manager.progress();
            info!(
                "status={} lifecycle={:?} attempts={} missed={} online={}",
                manager.status(),
                progress.lifecycle,
                progress.attempts,
                progress.missed_heartbeats,
                connectivity.is_online()
            );
        }
        other => warn!("Unknown command :{}", other),
    }
}
