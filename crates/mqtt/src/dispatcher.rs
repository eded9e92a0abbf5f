//! Delivery of inbound messages to consumers.
//!
//! Every subscription owns a [`MessageHandler`]. The bridge wraps each handler
//! in a [`RetainedFilter`] before registering it, so messages the broker
//! replays from its retained store never reach consumers: after a reconnect
//! the broker would otherwise re-deliver state the consumer already saw.
//!
//! [`ChannelHandler`] is the handler behind `subscribe_topic()`: it forwards
//! payloads into a bounded mpsc channel. A full channel makes delivery wait,
//! which in turn stops the event loop from reading more messages.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{registry::CancelAction, transport::InboundMessage};

/// Consumer of messages for one subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage);
}

/// Adapts a plain closure into a handler.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&InboundMessage) + Send + Sync,
{
    async fn handle(&self, message: &InboundMessage) {
        (self.f)(message)
    }
}

/// Wraps a closure as a shareable handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(&InboundMessage) + Send + Sync + 'static,
{
    Arc::new(FnHandler { f })
}

/// Drops retained messages and forwards everything else.
pub struct RetainedFilter {
    inner: Arc<dyn MessageHandler>,
}

impl RetainedFilter {
    pub fn new(inner: Arc<dyn MessageHandler>) -> Self {
        Self { inner }
    }

    pub fn wrap(inner: Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler> {
        Arc::new(Self::new(inner))
    }
}

#[async_trait]
impl MessageHandler for RetainedFilter {
    async fn handle(&self, message: &InboundMessage) {
        if message.retain {
            debug!("received retained message topic: {}", message.topic);
            return;
        }
        self.inner.handle(message).await
    }
}

/// Pushes payloads into a bounded channel until closed.
pub struct ChannelHandler {
    tx: StdMutex<Option<mpsc::Sender<Bytes>>>,
    closed: CancellationToken,
}

impl ChannelHandler {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx: StdMutex::new(Some(tx)),
            closed: CancellationToken::new(),
        }
    }

    /// Closes the stream. Buffered payloads stay readable; a push that is
    /// waiting for room is abandoned.
    pub fn close(&self) {
        self.closed.cancel();
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .cloned()
    }
}

#[async_trait]
impl MessageHandler for ChannelHandler {
    async fn handle(&self, message: &InboundMessage) {
        let Some(tx) = self.sender() else {
            debug!("Channel for {} closed, dropping message", message.topic);
            return;
        };

        tokio::select! {
            _ = self.closed.cancelled() => {
                debug!("Channel for {} closed while waiting for room", message.topic);
            }
            sent = tx.send(message.payload.clone()) => {
                if sent.is_err() {
                    debug!("Receiver for {} dropped, discarding message", message.topic);
                }
            }
        }
    }
}

/// Builds a channel-backed handler, the action that closes it, and the
/// receiving end handed to the consumer.
pub fn channel_subscription(
    capacity: usize,
) -> (Arc<ChannelHandler>, CancelAction, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handler = Arc::new(ChannelHandler::new(tx));
    let closer = Arc::clone(&handler);
    let cancel: CancelAction = Box::new(move || closer.close());
    (handler, cancel, rx)
}
