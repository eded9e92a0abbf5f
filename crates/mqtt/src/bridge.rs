//! The bridge: the public face of this crate.
//!
//! `MqttBridge` ties the pieces together:
//!
//! ```text
//!              ┌──────────────── MqttBridge ────────────────┐
//! connect() ──>│ ConnectionManager ──> Transport            │
//! subscribe()─>│ Mutex<Subscriptions> ──> Transport         │
//!              │        ▲                     │ events      │
//!              │        └── ReconnectCoordinator <┘          │
//!              └────────────────────────────────────────────┘
//!                                 │ payloads
//!                                 ▼
//!                       mpsc::Receiver<Bytes>
//! ```
//!
//! Subscribe and unsubscribe requests are issued while holding the bridge
//! lock, so they cannot interleave with a replay. Their acknowledgements are
//! awaited after the lock is released.
//!
//! # Example
//!
//! ```ignore
//! let bridge = MqttBridge::new(config)?;
//! bridge.connect().await?;
//!
//! let mut messages = bridge.subscribe_topic().await?;
//! while let Some(payload) = messages.recv().await {
//!     tracing::debug!("payload: {:?}", payload);
//! }
//! ```

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use validator::Validate;

use crate::{
    config::Config,
    connection::ConnectionManager,
    coordinator::{ReconnectCoordinator, Subscriptions},
    dispatcher::{channel_subscription, MessageHandler, RetainedFilter},
    error::BridgeError,
    registry::{CancelAction, Subscription},
    state::{ConnectionState, StateTracker},
    transport::{MqttTransport, Transport, TransportEvent},
};

pub struct MqttBridge {
    config: Config,
    transport: Arc<dyn Transport>,
    connection: ConnectionManager,
    subscriptions: Arc<Mutex<Subscriptions>>,
    state: Arc<StateTracker>,

    /// Handed to the coordinator task on the first `connect()`.
    events: StdMutex<Option<mpsc::Receiver<TransportEvent>>>,

    shutdown: CancellationToken,
}

impl MqttBridge {
    /// Validates `config` and builds a bridge over rumqttc.
    ///
    /// No network activity happens until [`MqttBridge::connect`].
    pub fn new(config: Config) -> Result<Self, BridgeError> {
        config.validate()?;
        let (transport, events) = MqttTransport::new(&config)?;
        Self::with_transport(config, Arc::new(transport), events)
    }

    /// Builds a bridge over any [`Transport`] and its event channel.
    pub fn with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;

        let state = Arc::new(StateTracker::new());
        let connection = ConnectionManager::new(
            Arc::clone(&transport),
            config.tuning.clone(),
            Arc::clone(&state),
        );

        Ok(Self {
            config,
            transport,
            connection,
            subscriptions: Arc::new(Mutex::new(Subscriptions::default())),
            state,
            events: StdMutex::new(Some(events)),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// A receiver that observes every state transition.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Topics currently registered, in replay order.
    pub async fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions.lock().await.registry.topics()
    }

    fn start_coordinator(&self) {
        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(events) = events {
            let tuning = &self.config.tuning;
            ReconnectCoordinator::new(
                Arc::clone(&self.transport),
                Arc::clone(&self.subscriptions),
                Arc::clone(&self.state),
                tuning.subscribe_qos(),
                tuning.ack_timeout(),
            )
            .spawn(events, self.shutdown.child_token());
        }
    }

    /// Connects with the configured retry budget.
    ///
    /// If subscriptions survived an earlier `disconnect()`, they are replayed
    /// once the connection is up.
    ///
    /// # Errors
    /// `BridgeError::ConnectExhausted` when every attempt failed. The bridge
    /// cannot do anything useful without a broker; callers normally abort.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        self.start_coordinator();
        let replay_pending = self.subscriptions.lock().await.reconnect_pending;
        if replay_pending {
            // The coordinator reports Connected once the replay is issued.
            self.connection.connect_pending_replay().await
        } else {
            self.connection.connect().await
        }
    }

    /// Closes the connection. Registered subscriptions are kept and replayed
    /// by the next `connect()`. Always succeeds.
    pub async fn disconnect(&self) -> Result<(), BridgeError> {
        {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions.reconnect_pending = !subscriptions.registry.is_empty();
        }
        self.connection.disconnect().await
    }

    /// Registers `handler` for `topic` and subscribes on the broker.
    ///
    /// The handler never sees retained messages. Once the broker accepts, a
    /// subscription previously registered for the same topic is dropped and
    /// its cancel action runs. If the broker refuses (or does not answer in
    /// time) the previous subscription is put back and `cancel` runs.
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        cancel: Option<CancelAction>,
    ) -> Result<(), BridgeError> {
        let qos = self.config.tuning.subscribe_qos();
        let wrapped = RetainedFilter::wrap(handler);

        let (issued, replaced) = {
            let mut subscriptions = self.subscriptions.lock().await;
            let entry = Subscription::new(Arc::clone(&wrapped), cancel);
            let replaced = subscriptions.registry.add(topic, entry);
            (self.transport.subscribe(topic, qos).await, replaced)
        };

        let outcome = match issued {
            Ok(token) => token.wait(topic, self.config.tuning.ack_timeout()).await,
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(()) => {
                if let Some(replaced) = replaced {
                    debug!("Replaced subscription for {topic}");
                    replaced.cancel();
                }
                info!("Subscribed to topic: {topic}");
            }
            Err(e) => {
                warn!("Failed to subscribe to topic {topic}: {e}");
                let mut subscriptions = self.subscriptions.lock().await;
                if subscriptions.registry.is_current(topic, &wrapped) {
                    let rejected = match replaced {
                        Some(previous) => subscriptions.registry.add(topic, previous),
                        None => subscriptions.registry.remove(topic),
                    };
                    if let Some(rejected) = rejected {
                        rejected.cancel();
                    }
                } else if let Some(replaced) = replaced {
                    // Superseded while waiting; nothing to restore.
                    replaced.cancel();
                }
            }
        }

        outcome
    }

    /// Removes the subscription for `topic`, runs its cancel action and
    /// unsubscribes on the broker.
    ///
    /// The broker is asked to unsubscribe even when nothing is registered, so
    /// a subscription it holds from a failed or late-acknowledged subscribe
    /// can still be removed. A cancel action never runs twice.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), BridgeError> {
        let issued = {
            let mut subscriptions = self.subscriptions.lock().await;
            match subscriptions.registry.remove(topic) {
                Some(removed) => removed.cancel(),
                None => debug!("No subscription registered for {topic}"),
            }
            self.transport.unsubscribe(topic).await
        };

        issued?
            .wait(topic, self.config.tuning.ack_timeout())
            .await?;
        info!("Unsubscribed from topic: {topic}");
        Ok(())
    }

    /// Subscribes the configured topic and returns its payload stream.
    ///
    /// The stream holds up to `buffer_size` payloads; when it is full,
    /// delivery waits for the consumer. It ends after `unsubscribe_topic()`.
    pub async fn subscribe_topic(&self) -> Result<mpsc::Receiver<Bytes>, BridgeError> {
        let (handler, cancel, messages) = channel_subscription(self.config.tuning.buffer_size);
        self.subscribe(&self.config.topic, handler, Some(cancel))
            .await?;
        Ok(messages)
    }

    /// Unsubscribes the configured topic and closes its payload stream.
    pub async fn unsubscribe_topic(&self) -> Result<(), BridgeError> {
        self.unsubscribe(&self.config.topic).await
    }

    /// Publishes `payload` on `topic` with the configured publish QoS.
    ///
    /// Waits at most `publish_timeout` for the request to be queued. If that
    /// is not enough the call returns `Ok` and the publish completes (or
    /// fails) in the background.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<(), BridgeError> {
        let tuning = &self.config.tuning;
        let qos = tuning.publish_qos();
        let transport = Arc::clone(&self.transport);
        let owned_topic = topic.to_string();
        let payload = payload.into();

        let publish = tokio::spawn(async move {
            let result = transport.publish(&owned_topic, qos, payload).await;
            if let Err(e) = &result {
                debug!("Publish to {owned_topic} failed: {e}");
            }
            result
        });

        match tokio::time::timeout(tuning.publish_timeout(), publish).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(BridgeError::Unavailable(format!("publish task failed: {e}"))),
            Err(_) => {
                debug!(
                    "Publish to {topic} not confirmed within {:?}",
                    tuning.publish_timeout()
                );
                Ok(())
            }
        }
    }
}

impl Drop for MqttBridge {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
