//! Connection state of the bridge.
//!
//! The state is published through a `tokio::sync::watch` channel so that
//! applications can follow transitions without polling:
//!
//! ```text
//! Disconnected ──connect()──> Connecting ──(success)──> Connected
//!      ▲                          │                        │
//!      │                  (budget exhausted)        (transport lost)
//!      │                          │                        ▼
//!      └────────── disconnect() ──┴──────────── LostPendingReconnect
//!                                                          │
//!                                          (transport restored + replay)
//!                                                          ▼
//!                                                      Connected
//! ```

use std::fmt;

use tokio::sync::watch;
use tracing::info;

/// Current state of the broker connection as seen by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection. Initial state, and the state after an explicit
    /// disconnect or an exhausted connect budget.
    Disconnected,

    /// `connect()` is running its retry loop.
    Connecting,

    /// Connected, and a subscribe has been issued for every registered
    /// subscription.
    Connected,

    /// The transport reported connection loss. Subscriptions will be replayed
    /// once the transport reports the connection restored.
    LostPendingReconnect,
}

impl ConnectionState {
    /// Short identifier for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::LostPendingReconnect => "LostPendingReconnect",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// True while the bridge expects a connection to come (back) up.
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::LostPendingReconnect
        )
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner of the state channel, shared by the components that move the state.
#[derive(Debug)]
pub struct StateTracker {
    tx: watch::Sender<ConnectionState>,
}

impl StateTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Publishes `state` if it differs from the current one.
    pub fn set(&self, state: ConnectionState) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        if changed {
            info!("Connection state changed to: {}", state);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}
