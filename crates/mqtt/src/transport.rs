//! Transport layer between the bridge and the broker.
//!
//! The bridge talks to the broker only through the [`Transport`] trait and
//! learns about the connection through [`TransportEvent`]s delivered on an
//! mpsc channel. [`MqttTransport`] implements both on top of rumqttc.
//!
//! # Architecture
//!
//! ```text
//! MqttBridge / ReconnectCoordinator
//!     │  subscribe / unsubscribe / publish          ▲ TransportEvent
//!     ▼                                             │
//! MqttTransport ── AsyncClient ──> request channel ─┤
//!                                                   │
//! driver task ── EventLoop::poll() ─────────────────┘
//!     │  ConnAck / SubAck / UnsubAck / Publish
//!     ▼
//! AckRouter (pkid correlation)
//! ```
//!
//! After a successful [`Transport::connect`] a driver task owns the
//! `EventLoop`. When polling fails the driver reports `ConnectionLost` once,
//! fails the acknowledgements that were in flight, moves on to the next broker
//! and keeps polling (rumqttc reconnects on the next poll) with the configured
//! retry delay between tries. The first `ConnAck` after a loss is reported as
//! `Connected`.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    mqttbytes::valid_filter, AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event,
    EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck, SubscribeReasonCode,
};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{client::ClientBuilder, config::Config, error::BridgeError};

/// Capacity of the transport event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    /// Set by the broker when the message is replayed from its retained store.
    pub retain: bool,
    pub qos: QoS,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain,
            qos: QoS::AtMostOnce,
        }
    }
}

/// Notifications from the transport to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The broker accepted the connection (first connect or after a loss).
    Connected,
    /// The connection dropped. The transport keeps trying to restore it.
    ConnectionLost(String),
    Message(InboundMessage),
}

/// Pending outcome of a subscribe or unsubscribe request.
///
/// Requests are issued first and acknowledged later, so callers can issue
/// while holding a lock and wait after releasing it.
#[derive(Debug)]
pub struct AckToken {
    rx: oneshot::Receiver<Result<(), BridgeError>>,
}

impl AckToken {
    /// A token paired with the sender that resolves it.
    pub fn pending() -> (oneshot::Sender<Result<(), BridgeError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A token that is already resolved.
    pub fn ready(result: Result<(), BridgeError>) -> Self {
        let (tx, token) = Self::pending();
        let _ = tx.send(result);
        token
    }

    /// Waits for the acknowledgement of the request for `topic`.
    ///
    /// # Errors
    /// - `AckTimeout` when nothing arrives within `timeout`
    /// - `Unavailable` when the transport dropped the request
    /// - whatever failure the transport resolved the token with
    pub async fn wait(self, topic: &str, timeout: Duration) -> Result<(), BridgeError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::Unavailable(format!(
                "acknowledgement for topic '{topic}' was dropped"
            ))),
            Err(_) => Err(BridgeError::AckTimeout {
                topic: topic.to_string(),
                timeout,
            }),
        }
    }
}

/// Operations the bridge needs from a broker connection.
///
/// Implementations must deliver [`TransportEvent`]s on the channel handed to
/// the bridge, and must report `Connected` after every successful `connect`
/// and after every automatic restoration.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// One connection attempt. Returns once the broker accepted or refused.
    async fn connect(&self) -> Result<(), BridgeError>;

    /// Graceful close. Waits up to `grace` for in-flight work, then stops.
    async fn disconnect(&self, grace: Duration);

    /// Issues a subscribe. The token resolves with the broker's verdict.
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<AckToken, BridgeError>;

    /// Issues an unsubscribe. The token resolves with the broker's verdict.
    async fn unsubscribe(&self, topic: &str) -> Result<AckToken, BridgeError>;

    /// Queues a publish.
    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), BridgeError>;
}

struct PendingAck {
    topic: String,
    tx: oneshot::Sender<Result<(), BridgeError>>,
}

impl PendingAck {
    fn resolve(self, result: Result<(), BridgeError>) {
        if self.tx.send(result).is_err() {
            trace!("Acknowledgement for topic {} no longer awaited", self.topic);
        }
    }
}

#[derive(Default)]
struct AckTable {
    /// Issued but not yet written; rumqttc assigns the pkid on write.
    queued_subscribes: VecDeque<PendingAck>,
    queued_unsubscribes: VecDeque<PendingAck>,
    /// Written and waiting for SubAck/UnsubAck, by pkid.
    inflight_subscribes: HashMap<u16, PendingAck>,
    inflight_unsubscribes: HashMap<u16, PendingAck>,
}

/// Correlates subscribe/unsubscribe requests with their acknowledgements.
///
/// rumqttc reports requests in the order they were queued, so each kind keeps
/// a FIFO of issued requests that is matched against `Outgoing` events to
/// learn the packet id.
#[derive(Default)]
struct AckRouter {
    table: StdMutex<AckTable>,
}

impl AckRouter {
    fn table(&self) -> std::sync::MutexGuard<'_, AckTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issues a request and queues its acknowledgement, atomically with
    /// respect to other requests of any kind.
    fn issue_subscribe(
        &self,
        topic: &str,
        issue: impl FnOnce() -> Result<(), ClientError>,
    ) -> Result<AckToken, BridgeError> {
        let mut table = self.table();
        issue()?;
        let (tx, token) = AckToken::pending();
        table.queued_subscribes.push_back(PendingAck {
            topic: topic.to_string(),
            tx,
        });
        Ok(token)
    }

    fn issue_unsubscribe(
        &self,
        topic: &str,
        issue: impl FnOnce() -> Result<(), ClientError>,
    ) -> Result<AckToken, BridgeError> {
        let mut table = self.table();
        issue()?;
        let (tx, token) = AckToken::pending();
        table.queued_unsubscribes.push_back(PendingAck {
            topic: topic.to_string(),
            tx,
        });
        Ok(token)
    }

    fn on_outgoing_subscribe(&self, pkid: u16) {
        let mut table = self.table();
        match table.queued_subscribes.pop_front() {
            Some(pending) => {
                table.inflight_subscribes.insert(pkid, pending);
            }
            None => trace!("Subscribe pkid {pkid} was not issued through the bridge"),
        }
    }

    fn on_outgoing_unsubscribe(&self, pkid: u16) {
        let mut table = self.table();
        match table.queued_unsubscribes.pop_front() {
            Some(pending) => {
                table.inflight_unsubscribes.insert(pkid, pending);
            }
            None => trace!("Unsubscribe pkid {pkid} was not issued through the bridge"),
        }
    }

    fn on_suback(&self, ack: &SubAck) {
        let Some(pending) = self.table().inflight_subscribes.remove(&ack.pkid) else {
            trace!("SubAck for unknown pkid {}", ack.pkid);
            return;
        };

        let rejected = ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure));

        if rejected {
            let topic = pending.topic.clone();
            pending.resolve(Err(BridgeError::Acknowledgement {
                topic,
                reason: "broker returned failure reason code".into(),
            }));
        } else {
            pending.resolve(Ok(()));
        }
    }

    fn on_unsuback(&self, pkid: u16) {
        match self.table().inflight_unsubscribes.remove(&pkid) {
            Some(pending) => pending.resolve(Ok(())),
            None => trace!("UnsubAck for unknown pkid {pkid}"),
        }
    }

    /// Fails every request that was written to the old connection.
    ///
    /// Queued requests stay: rumqttc writes them once the connection is back.
    fn fail_inflight(&self, reason: &str) {
        let drained: Vec<PendingAck> = {
            let mut table = self.table();
            let subs = table.inflight_subscribes.drain().map(|(_, p)| p).collect::<Vec<_>>();
            let unsubs = table.inflight_unsubscribes.drain().map(|(_, p)| p);
            subs.into_iter().chain(unsubs).collect()
        };

        for pending in drained {
            pending.resolve(Err(BridgeError::Unavailable(reason.to_string())));
        }
    }

    /// Fails every outstanding request.
    fn fail_all(&self, reason: &str) {
        let drained: Vec<PendingAck> = {
            let mut table = self.table();
            let mut drained: Vec<PendingAck> = table.queued_subscribes.drain(..).collect();
            drained.extend(table.queued_unsubscribes.drain(..));
            drained.extend(table.inflight_subscribes.drain().map(|(_, p)| p));
            drained.extend(table.inflight_unsubscribes.drain().map(|(_, p)| p));
            drained
        };

        for pending in drained {
            pending.resolve(Err(BridgeError::Unavailable(reason.to_string())));
        }
    }
}

/// State shared between the transport handle and its driver task.
struct DriverShared {
    brokers: Vec<MqttOptions>,
    current: AtomicUsize,
    events_tx: mpsc::Sender<TransportEvent>,
    acks: AckRouter,
    retry_delay: Duration,
    running: AtomicBool,
    disconnecting: AtomicBool,
}

impl DriverShared {
    async fn emit(&self, event: TransportEvent) {
        if self.events_tx.send(event).await.is_err() {
            debug!("Transport event receiver dropped");
        }
    }

    fn broker_label(&self, index: usize) -> String {
        self.brokers
            .get(index)
            .map(|opts| {
                let (host, port) = opts.broker_address();
                format!("{host}:{port}")
            })
            .unwrap_or_default()
    }

    /// Handles bookkeeping packets and turns publishes into events.
    fn route(&self, event: Event) -> Option<TransportEvent> {
        match event {
            Event::Incoming(Packet::Publish(publish)) => {
                trace!("Received publish on topic {}", publish.topic);
                Some(TransportEvent::Message(InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                    retain: publish.retain,
                    qos: publish.qos,
                }))
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                self.acks.on_suback(&ack);
                None
            }
            Event::Incoming(Packet::UnsubAck(ack)) => {
                self.acks.on_unsuback(ack.pkid);
                None
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by broker");
                None
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                self.acks.on_outgoing_subscribe(pkid);
                None
            }
            Event::Outgoing(Outgoing::Unsubscribe(pkid)) => {
                self.acks.on_outgoing_unsubscribe(pkid);
                None
            }
            other => {
                trace!("MQTT event: {:?}", other);
                None
            }
        }
    }

    /// Tries every broker once, starting with the current one.
    async fn establish(&self, event_loop: &mut EventLoop) -> Result<(), BridgeError> {
        let count = self.brokers.len();
        let start = self.current.load(Ordering::Acquire);
        let mut last_error = None;

        for offset in 0..count {
            let index = (start + offset) % count;
            event_loop.clean();
            event_loop.mqtt_options = self.brokers[index].clone();

            match self.await_connack(event_loop).await {
                Ok(()) => {
                    self.current.store(index, Ordering::Release);
                    info!("Connection established with {}", self.broker_label(index));
                    return Ok(());
                }
                Err(e) => {
                    debug!("Broker {} unavailable: {}", self.broker_label(index), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BridgeError::Unavailable("no broker configured".into())))
    }

    async fn await_connack(&self, event_loop: &mut EventLoop) -> Result<(), BridgeError> {
        loop {
            match event_loop.poll().await? {
                Event::Incoming(Packet::ConnAck(_)) => return Ok(()),
                event => {
                    if let Some(event) = self.route(event) {
                        self.emit(event).await;
                    }
                }
            }
        }
    }

    /// Points the event loop at the next broker, if there is more than one.
    fn rotate(&self, event_loop: &mut EventLoop) {
        let count = self.brokers.len();
        if count < 2 {
            return;
        }
        let next = (self.current.load(Ordering::Acquire) + 1) % count;
        self.current.store(next, Ordering::Release);
        event_loop.mqtt_options = self.brokers[next].clone();
        info!("Failing over to broker {}", self.broker_label(next));
    }
}

/// Sends `event` unless shutdown is requested first. Returns false on shutdown.
async fn emit_or_shutdown(
    shared: &DriverShared,
    shutdown: &CancellationToken,
    event: TransportEvent,
) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = shared.emit(event) => true,
    }
}

/// Polls the event loop until shutdown, then hands it back.
async fn drive(
    mut event_loop: EventLoop,
    shared: Arc<DriverShared>,
    shutdown: CancellationToken,
) -> EventLoop {
    let mut online = true;

    loop {
        let polled = tokio::select! {
            _ = shutdown.cancelled() => break,
            polled = event_loop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                online = true;
                info!(
                    "Connection restored with {}",
                    shared.broker_label(shared.current.load(Ordering::Acquire))
                );
                if !emit_or_shutdown(&shared, &shutdown, TransportEvent::Connected).await {
                    break;
                }
            }
            Ok(event) => {
                if let Some(event) = shared.route(event) {
                    if !emit_or_shutdown(&shared, &shutdown, event).await {
                        break;
                    }
                }
            }
            Err(e) => {
                if shared.disconnecting.load(Ordering::Acquire) {
                    // Closed on purpose. Polling again would reconnect.
                    shutdown.cancelled().await;
                    break;
                }

                shared.acks.fail_inflight("connection lost");
                let reason = root_cause(&e);

                match classify_connection_error(&e) {
                    Disposition::Permanent => error!("Broker rejected the connection: {reason}"),
                    Disposition::Transient => debug!("Connection error: {reason}"),
                }

                if online {
                    online = false;
                    if !emit_or_shutdown(&shared, &shutdown, TransportEvent::ConnectionLost(reason))
                        .await
                    {
                        break;
                    }
                }

                shared.rotate(&mut event_loop);

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(shared.retry_delay) => {}
                }
            }
        }
    }

    debug!("Event loop driver stopped");
    event_loop
}

enum Slot {
    Idle(EventLoop),
    Running(Driver),
    Vacant,
}

struct Driver {
    handle: JoinHandle<EventLoop>,
    shutdown: CancellationToken,
}

/// rumqttc-backed [`Transport`] with broker failover.
pub struct MqttTransport {
    client: AsyncClient,
    slot: Mutex<Slot>,
    shared: Arc<DriverShared>,
}

impl MqttTransport {
    /// Builds the client and returns the transport with its event receiver.
    ///
    /// Nothing touches the network until [`Transport::connect`].
    pub fn new(config: &Config) -> Result<(Self, mpsc::Receiver<TransportEvent>), BridgeError> {
        let (client, event_loop, brokers) = ClientBuilder::from_config(config)?.build()?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let shared = Arc::new(DriverShared {
            brokers,
            current: AtomicUsize::new(0),
            events_tx,
            acks: AckRouter::default(),
            retry_delay: config.tuning.connect_retry_delay(),
            running: AtomicBool::new(false),
            disconnecting: AtomicBool::new(false),
        });

        let transport = Self {
            client,
            slot: Mutex::new(Slot::Idle(event_loop)),
            shared,
        };

        Ok((transport, events_rx))
    }

    fn ensure_running(&self) -> Result<(), BridgeError> {
        if self.shared.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BridgeError::Unavailable("not connected".into()))
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<(), BridgeError> {
        let mut slot = self.slot.lock().await;

        let mut event_loop = match std::mem::replace(&mut *slot, Slot::Vacant) {
            Slot::Running(driver) if !driver.handle.is_finished() => {
                *slot = Slot::Running(driver);
                debug!("Event loop driver already running");
                return Ok(());
            }
            Slot::Running(driver) => driver.handle.await.map_err(|e| {
                BridgeError::Unavailable(format!("event loop driver failed: {e}"))
            })?,
            Slot::Idle(event_loop) => event_loop,
            Slot::Vacant => return Err(BridgeError::Unavailable("event loop is gone".into())),
        };

        if let Err(e) = self.shared.establish(&mut event_loop).await {
            *slot = Slot::Idle(event_loop);
            return Err(e);
        }

        self.shared.disconnecting.store(false, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(drive(event_loop, self.shared.clone(), shutdown.clone()));
        *slot = Slot::Running(Driver { handle, shutdown });
        drop(slot);

        self.shared.emit(TransportEvent::Connected).await;
        Ok(())
    }

    async fn disconnect(&self, grace: Duration) {
        let mut slot = self.slot.lock().await;

        let driver = match std::mem::replace(&mut *slot, Slot::Vacant) {
            Slot::Running(driver) => driver,
            other => {
                *slot = other;
                return;
            }
        };

        self.shared.disconnecting.store(true, Ordering::Release);
        if let Err(e) = self.client.try_disconnect() {
            warn!("Error sending disconnect packet: {:?}", e);
        }
        tokio::time::sleep(grace).await;

        driver.shutdown.cancel();
        self.shared.running.store(false, Ordering::Release);

        match driver.handle.await {
            Ok(event_loop) => *slot = Slot::Idle(event_loop),
            Err(e) => warn!("Event loop driver ended abnormally: {e}"),
        }

        self.shared.acks.fail_all("disconnected");
        info!("Disconnected from MQTT broker");
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<AckToken, BridgeError> {
        if !valid_filter(topic) {
            return Err(BridgeError::Acknowledgement {
                topic: topic.to_string(),
                reason: "invalid topic filter".into(),
            });
        }
        self.ensure_running()?;
        self.shared
            .acks
            .issue_subscribe(topic, || self.client.try_subscribe(topic, qos))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<AckToken, BridgeError> {
        self.ensure_running()?;
        self.shared
            .acks
            .issue_unsubscribe(topic, || self.client.try_unsubscribe(topic))
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), BridgeError> {
        self.ensure_running()?;
        self.client.publish_bytes(topic, qos, false, payload).await?;
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.try_lock() {
            if let Slot::Running(driver) = std::mem::replace(&mut *slot, Slot::Vacant) {
                driver.shutdown.cancel();
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Retrying will not help until configuration changes.
    Permanent,
    /// Network hiccup, broker restart and the like.
    Transient,
}

/// Decides how loudly a failed poll is reported. The driver retries either way.
fn classify_connection_error(err: &ConnectionError) -> Disposition {
    use Disposition::*;

    match err {
        ConnectionError::Tls(_) => Permanent,
        ConnectionError::MqttState(_) => Transient,
        ConnectionError::NotConnAck(_) => Permanent,
        ConnectionError::Io(e) => match e.kind() {
            std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::InvalidData => Permanent,
            _ => Transient,
        },
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Transient,
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized => Permanent,
            _ => Transient,
        },
        #[allow(unreachable_patterns)]
        _ => Transient,
    }
}

/// Innermost message of an error chain, without surrounding quotes.
fn root_cause(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}
