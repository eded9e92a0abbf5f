//! # janus-mqtt: MQTT bridge client with subscription recovery
//!
//! An async MQTT client built on `rumqttc` that keeps a durable connection to
//! a broker and survives network loss without losing its subscriptions:
//!
//! - **Bounded-retry connect**: a fixed number of attempts with a constant
//!   pause in between, then a hard error
//! - **Broker failover**: every configured broker is tried in order
//! - **Subscription recovery**: after the transport reconnects, every
//!   registered topic is subscribed again
//! - **Retained-message filtering**: messages the broker replays from its
//!   retained store are dropped before they reach consumers
//! - **Bounded delivery**: payloads flow to consumers through a bounded
//!   channel; a slow consumer slows the event loop instead of growing memory
//!
//! # Quick Start
//!
//! ```ignore
//! use janus_mqtt::{Config, MqttBridge};
//!
//! #[tokio::main]
//! async fn main() -> janus_mqtt::Result<()> {
//!     let config = Config {
//!         brokers: vec!["tcp://localhost:1883".into()],
//!         topic: "telemetry/#".into(),
//!         ..Default::default()
//!     };
//!
//!     let bridge = MqttBridge::new(config)?;
//!     bridge.connect().await?;
//!
//!     let mut messages = bridge.subscribe_topic().await?;
//!     while let Some(payload) = messages.recv().await {
//!         println!("{} bytes", payload.len());
//!     }
//!
//!     bridge.disconnect().await
//! }
//! ```
//!
//! # Connection lifecycle
//!
//! ```text
//! Disconnected ──connect()──> Connecting ──> Connected
//!                                 │             │ transport lost
//!                      budget exhausted         ▼
//!                                 │      LostPendingReconnect
//!                                 ▼             │ transport restored, replay
//!                           Disconnected        ▼
//!                                           Connected
//! ```
//!
//! Observe transitions with [`MqttBridge::state_receiver`].
//!
//! # Testing
//!
//! The bridge talks to the broker only through the [`Transport`] trait, so
//! tests can drive it with an in-memory implementation via
//! [`MqttBridge::with_transport`].

pub mod bridge;
pub mod client;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod retry;
pub mod state;
pub mod transport;

#[cfg(test)]
mod mock;

pub use bridge::MqttBridge;
pub use config::{BrokerAddr, Config, TlsConfig, Tuning};
pub use dispatcher::{handler_fn, MessageHandler};
pub use error::BridgeError;
pub use registry::CancelAction;
pub use state::ConnectionState;
pub use transport::{AckToken, InboundMessage, Transport, TransportEvent};

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
