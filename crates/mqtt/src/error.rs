//! Error handling for the MQTT bridge.
//!
//! `BridgeError` is the single error type returned by every fallible operation
//! in this crate. Variants fall into three groups:
//!
//! **Startup errors** (surface to the caller, usually fatal):
//! - `ClientSetup`, `ConfigError`, `Io`: the client could not be built
//! - `ConnectExhausted`: every connection attempt in the retry budget failed
//!
//! **Request errors** (surface synchronously to the caller of subscribe/unsubscribe):
//! - `Acknowledgement`: broker or client-local validation rejected the request
//! - `AckTimeout`: no acknowledgement arrived in time
//! - `ClientTransfer`: the request could not be queued on the transport
//!
//! **Transport errors** (absorbed by the reconnect path, logged, and only
//! returned when they end a connect attempt):
//! - `ClientConnection`, `Unavailable`
//!
//! Transient connection loss after a successful connect is never returned as an
//! error: it is handled by the reconnect coordinator and logged at warn level.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The MQTT client could not be initialised (bad broker address, unreadable
    /// TLS material, ...). Fix the configuration and restart.
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// Configuration failed validation.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// All connection attempts failed. Carries the last failure.
    ///
    /// The bridge cannot operate without a broker; callers are expected to
    /// abort startup.
    #[error("could not connect to MQTT after {attempts} attempts: {source}")]
    ConnectExhausted {
        attempts: u32,
        #[source]
        source: Box<BridgeError>,
    },

    /// The broker (or local validation) reported failure for a subscribe or
    /// unsubscribe request.
    #[error("request for topic '{topic}' was rejected: {reason}")]
    Acknowledgement { topic: String, reason: String },

    /// The broker did not acknowledge a subscribe or unsubscribe request.
    #[error("no acknowledgement for topic '{topic}' within {timeout:?}")]
    AckTimeout { topic: String, timeout: Duration },

    /// The request could not be handed to the transport (event loop gone,
    /// request channel closed).
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// Network-level failure reported by the rumqttc event loop.
    ///
    /// Boxed to keep the enum small.
    #[error("Client connection error: {0}")]
    ClientConnection(#[from] Box<rumqttc::ConnectionError>),

    /// The transport is not in a state to serve the request.
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    /// File I/O failed (TLS certificate loading).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rumqttc::ConnectionError> for BridgeError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        BridgeError::ClientConnection(Box::new(err))
    }
}

impl BridgeError {
    /// Whether this error means the connect retry budget is spent.
    pub fn is_connect_exhausted(&self) -> bool {
        matches!(self, BridgeError::ConnectExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_connect_exhausted_wraps_last_failure() {
        let err = BridgeError::ConnectExhausted {
            attempts: 10,
            source: Box::new(BridgeError::Unavailable("connection refused".into())),
        };

        assert!(err.is_connect_exhausted());
        assert!(err.to_string().contains("10 attempts"));
        assert!(err.to_string().contains("connection refused"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_acknowledgement_display() {
        let err = BridgeError::Acknowledgement {
            topic: "telemetry/#".into(),
            reason: "not authorized".into(),
        };
        assert_eq!(
            err.to_string(),
            "request for topic 'telemetry/#' was rejected: not authorized"
        );
        assert!(!err.is_connect_exhausted());
    }

    #[test]
    fn test_ack_timeout_display() {
        let err = BridgeError::AckTimeout {
            topic: "a/b".into(),
            timeout: Duration::from_millis(250),
        };
        assert!(err.to_string().contains("'a/b'"));
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "ca.crt not found");
        let err: BridgeError = io_err.into();
        assert!(err.to_string().contains("ca.crt not found"));
    }

    #[test]
    fn test_from_connection_error_is_boxed() {
        let conn_err = rumqttc::ConnectionError::NetworkTimeout;
        let err: BridgeError = conn_err.into();
        assert!(matches!(err, BridgeError::ClientConnection(_)));
    }
}
