//! Reaction to transport events: loss, restoration, and inbound messages.
//!
//! The coordinator runs as a single task consuming [`TransportEvent`]s:
//!
//! - `ConnectionLost`: mark the registry for replay and report
//!   `LostPendingReconnect`. The transport reconnects on its own.
//! - `Connected`: if a replay is pending, re-issue a subscribe for every
//!   registered topic (in lexical order) while holding the bridge lock, then
//!   report `Connected`. Acknowledgements are awaited off the event path.
//! - `Message`: route to the handlers whose filter matches. Handlers run
//!   after the lock is released.

use std::{sync::Arc, time::Duration};

use rumqttc::QoS;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    registry::SubscriptionRegistry,
    state::{ConnectionState, StateTracker},
    transport::{AckToken, InboundMessage, Transport, TransportEvent},
};

/// Registry plus the replay flag, guarded together by the bridge lock.
#[derive(Debug, Default)]
pub struct Subscriptions {
    pub registry: SubscriptionRegistry,
    /// Set on connection loss (and on explicit disconnect with live
    /// subscriptions); cleared once a replay has been issued.
    pub reconnect_pending: bool,
}

pub struct ReconnectCoordinator {
    transport: Arc<dyn Transport>,
    subscriptions: Arc<Mutex<Subscriptions>>,
    state: Arc<StateTracker>,
    subscribe_qos: QoS,
    ack_timeout: Duration,
}

impl ReconnectCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        subscriptions: Arc<Mutex<Subscriptions>>,
        state: Arc<StateTracker>,
        subscribe_qos: QoS,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            subscriptions,
            state,
            subscribe_qos,
            ack_timeout,
        }
    }

    /// Runs the coordinator on its own task until `shutdown` fires or the
    /// event channel closes.
    pub fn spawn(
        self,
        events: mpsc::Receiver<TransportEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(events, shutdown))
    }

    pub async fn run(self, mut events: mpsc::Receiver<TransportEvent>, shutdown: CancellationToken) {
        debug!("Reconnect coordinator started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        debug!("Reconnect coordinator stopped");
    }

    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionLost(reason) => self.on_connection_lost(&reason).await,
            TransportEvent::Connected => self.on_connected().await,
            TransportEvent::Message(message) => self.on_message(&message).await,
        }
    }

    async fn on_connection_lost(&self, reason: &str) {
        self.subscriptions.lock().await.reconnect_pending = true;
        self.state.set(ConnectionState::LostPendingReconnect);
        warn!("failed mqtt disconnected {reason}. Reconnecting...");
    }

    async fn on_connected(&self) {
        info!("connected to MQTT");

        let acks = {
            let mut subscriptions = self.subscriptions.lock().await;
            if !subscriptions.reconnect_pending {
                return;
            }

            let snapshot = subscriptions.registry.snapshot();
            info!("Resubscribing to {} topic(s)", snapshot.len());

            let mut acks = Vec::with_capacity(snapshot.len());
            for (topic, _handler) in snapshot {
                match self.transport.subscribe(&topic, self.subscribe_qos).await {
                    Ok(token) => acks.push((topic, token)),
                    Err(e) => error!("failed to resubscribe to {topic}: {e}"),
                }
            }

            subscriptions.reconnect_pending = false;
            acks
        };

        self.state.set(ConnectionState::Connected);

        if !acks.is_empty() {
            tokio::spawn(await_replay(acks, self.ack_timeout));
        }
    }

    async fn on_message(&self, message: &InboundMessage) {
        let handlers = self
            .subscriptions
            .lock()
            .await
            .registry
            .matching(&message.topic);

        if handlers.is_empty() {
            error!("received message on unknown topic {}", message.topic);
            return;
        }

        for handler in handlers {
            handler.handle(message).await;
        }
    }
}

/// Logs the outcome of every replayed subscribe.
async fn await_replay(acks: Vec<(String, AckToken)>, timeout: Duration) {
    for (topic, token) in acks {
        match token.wait(&topic, timeout).await {
            Ok(()) => debug!("Resubscribed to {topic}"),
            Err(e) => error!("failed to resubscribe to {topic}: {e}"),
        }
    }
}
