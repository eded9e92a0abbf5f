//! Scripted in-memory transport for unit tests.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use tokio::sync::mpsc;

use crate::{
    error::BridgeError,
    transport::{AckToken, InboundMessage, Transport, TransportEvent, EVENT_CHANNEL_CAPACITY},
};

#[derive(Default)]
struct Recorded {
    connect_script: VecDeque<Result<(), String>>,
    connect_delay: Duration,
    subscribes: Vec<String>,
    unsubscribes: Vec<String>,
    publishes: Vec<(String, Bytes)>,
    rejected: HashSet<String>,
    unavailable: bool,
}

pub(crate) struct MockTransport {
    recorded: Mutex<Recorded>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl MockTransport {
    pub(crate) fn new() -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Arc::new(Self {
            recorded: Mutex::new(Recorded::default()),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            events_tx,
        });
        (transport, events_rx)
    }

    /// Outcomes for the next connect calls. Unscripted calls succeed.
    pub(crate) fn script_connects(&self, outcomes: impl IntoIterator<Item = Result<(), String>>) {
        self.recorded.lock().unwrap().connect_script.extend(outcomes);
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        self.recorded.lock().unwrap().connect_delay = delay;
    }

    /// Subscribes to `topic` are acknowledged with a failure.
    pub(crate) fn reject(&self, topic: &str) {
        self.recorded.lock().unwrap().rejected.insert(topic.to_string());
    }

    /// Requests fail to be issued, as when the client is offline.
    pub(crate) fn set_unavailable(&self, unavailable: bool) {
        self.recorded.lock().unwrap().unavailable = unavailable;
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnect_calls(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribed(&self) -> Vec<String> {
        self.recorded.lock().unwrap().subscribes.clone()
    }

    pub(crate) fn unsubscribed(&self) -> Vec<String> {
        self.recorded.lock().unwrap().unsubscribes.clone()
    }

    pub(crate) fn published(&self) -> Vec<(String, Bytes)> {
        self.recorded.lock().unwrap().publishes.clone()
    }

    pub(crate) async fn emit(&self, event: TransportEvent) {
        self.events_tx.send(event).await.unwrap();
    }

    pub(crate) async fn lose_connection(&self) {
        self.emit(TransportEvent::ConnectionLost("connection reset by peer".into()))
            .await;
    }

    pub(crate) async fn restore_connection(&self) {
        self.emit(TransportEvent::Connected).await;
    }

    pub(crate) async fn deliver(&self, topic: &str, payload: &'static [u8], retain: bool) {
        self.emit(TransportEvent::Message(InboundMessage::new(
            topic, payload, retain,
        )))
        .await;
    }

    fn check_available(&self) -> Result<(), BridgeError> {
        if self.recorded.lock().unwrap().unavailable {
            Err(BridgeError::Unavailable("not connected".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), BridgeError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let (delay, outcome) = {
            let mut recorded = self.recorded.lock().unwrap();
            (
                recorded.connect_delay,
                recorded.connect_script.pop_front().unwrap_or(Ok(())),
            )
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match outcome {
            Ok(()) => {
                let _ = self.events_tx.send(TransportEvent::Connected).await;
                Ok(())
            }
            Err(reason) => Err(BridgeError::Unavailable(reason)),
        }
    }

    async fn disconnect(&self, _grace: Duration) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<AckToken, BridgeError> {
        self.check_available()?;
        let mut recorded = self.recorded.lock().unwrap();
        recorded.subscribes.push(topic.to_string());

        if recorded.rejected.contains(topic) {
            return Ok(AckToken::ready(Err(BridgeError::Acknowledgement {
                topic: topic.to_string(),
                reason: "not authorized".into(),
            })));
        }
        Ok(AckToken::ready(Ok(())))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<AckToken, BridgeError> {
        self.check_available()?;
        self.recorded
            .lock()
            .unwrap()
            .unsubscribes
            .push(topic.to_string());
        Ok(AckToken::ready(Ok(())))
    }

    async fn publish(&self, topic: &str, _qos: QoS, payload: Bytes) -> Result<(), BridgeError> {
        self.check_available()?;
        self.recorded
            .lock()
            .unwrap()
            .publishes
            .push((topic.to_string(), payload));
        Ok(())
    }
}
