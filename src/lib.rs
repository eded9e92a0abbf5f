//! janus: MQTT bridge service
//!
//! Keeps a durable connection to an MQTT broker, subscribes to one configured
//! topic, and hands the payloads to a consumer. Connection loss is absorbed:
//! the subscriptions are restored as soon as the broker is reachable again.
//!
//! ## Modules
//!
//! * `config`: TOML configuration (logger and MQTT sections), validated with
//!   the `validator` crate. Located through `JANUS_CONFIG` or
//!   `/etc/janus/config.toml`.
//!
//! * `logger`: `tracing` subscriber setup: console output (compact, pretty,
//!   JSON) and optional systemd journald.
//!
//! * `service`: the run loop: connect, consume, shut down on signal.
//!
//! The MQTT engine itself lives in the `janus-mqtt` crate.

pub mod config;
pub mod logger;
pub mod service;
