//! The bridge service: connect, consume the configured topic, stop on signal.

use std::io;

use bytes::Bytes;
use janus_mqtt::{BridgeError, MqttBridge};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Failed to install signal handlers: {0}")]
    Signal(#[from] io::Error),
}

/// Runs the bridge until SIGINT, SIGQUIT or SIGTERM.
///
/// # Errors
/// Fails if the bridge cannot be built, the broker stays unreachable for the
/// whole retry budget, or the configured topic cannot be subscribed.
pub async fn run(config: janus_mqtt::Config) -> Result<(), ServiceError> {
    let bridge = MqttBridge::new(config)?;

    bridge.connect().await?;

    let messages = bridge.subscribe_topic().await?;
    info!("Listening on topic {}", bridge.config().topic);
    let consumer = spawn_consumer(messages);

    let signal = wait_signal().await?;
    info!("Received {signal}, initiating graceful shutdown...");

    if let Err(e) = bridge.unsubscribe_topic().await {
        warn!("Failed to unsubscribe from {}: {}", bridge.config().topic, e);
    }
    bridge.disconnect().await?;

    match consumer.await {
        Ok(count) => info!("Processed {count} message(s)"),
        Err(e) => warn!("Consumer task ended abnormally: {e}"),
    }

    Ok(())
}

/// Logs every payload until the stream ends. Resolves to the message count.
pub fn spawn_consumer(mut messages: mpsc::Receiver<Bytes>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut count = 0usize;
        while let Some(payload) = messages.recv().await {
            count += 1;
            debug!("received message: {}", String::from_utf8_lossy(&payload));
        }
        debug!("Message stream closed");
        count
    })
}

#[cfg(unix)]
async fn wait_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = quit.recv() => "SIGQUIT",
        _ = terminate.recv() => "SIGTERM",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn wait_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}
