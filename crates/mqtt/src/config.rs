//! Configuration for the MQTT bridge.
//!
//! All types deserialize with serde (TOML in practice) and validate with the
//! `validator` crate, so a bad configuration fails when it is loaded rather
//! than when the first connection is attempted.
//!
//! # Example
//!
//! ```toml
//! brokers = ["tcp://mqtt-a:1883", "tcp://mqtt-b:1883"]
//! username = "bridge"
//! password = "secret"
//! topic = "telemetry/#"
//! batch_size = 1
//!
//! [tls]
//! ca_cert_path = "/etc/janus/ca.pem"
//!
//! [tuning]
//! connect_retries = 10
//! connect_retry_delay_ms = 1000
//! buffer_size = 10
//! ```

use std::{path::Path, time::Duration};

use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::BridgeError;

/// Bridge configuration. Immutable once the bridge is constructed.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Broker addresses, tried in order as failover targets.
    ///
    /// Accepted forms: `host`, `host:port`, `tcp://host:port`,
    /// `mqtt://host:port`, `ssl://host:port`, `tls://host:port`,
    /// `mqtts://host:port`. Secure schemes default to port 8883, the others
    /// to 1883.
    #[validate(
        length(min = 1, message = "At least one broker address is required"),
        custom(function = "validate_brokers")
    )]
    pub brokers: Vec<String>,

    /// Broker username. Empty means anonymous.
    pub username: String,

    /// Broker password. Only sent when `username` is not empty.
    pub password: String,

    /// The topic filter served by `subscribe_topic()` / `unsubscribe_topic()`.
    #[validate(length(min = 1, max = 65535, message = "Topic must not be empty"))]
    pub topic: String,

    /// Optional TLS material. When present, every broker is reached over TLS.
    #[validate(nested)]
    pub tls: Option<TlsConfig>,

    /// Batching hint. Accepted for compatibility, not used by message flow.
    pub batch_size: usize,

    /// Fixed client identifier. When empty, one is generated from
    /// `client_id_prefix` and the current UTC time.
    #[validate(length(max = 64, message = "Client ID must not exceed 64 characters"))]
    pub client_id: String,

    /// Prefix for generated client identifiers.
    #[validate(length(min = 1, max = 40))]
    pub client_id_prefix: String,

    /// Keep-alive interval in seconds.
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    /// Request a clean session. The bridge restores subscriptions itself, so
    /// a clean session is the normal choice.
    pub clean_session: bool,

    /// Capacity of rumqttc's outgoing request queue.
    #[validate(range(min = 1, max = 1000))]
    pub request_channel_capacity: usize,

    /// Retry, timeout, QoS and buffering knobs.
    #[validate(nested)]
    pub tuning: Tuning,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            brokers: vec!["localhost:1883".to_string()],
            username: String::new(),
            password: String::new(),
            topic: "#".to_string(),
            tls: None,
            batch_size: 1,
            client_id: String::new(),
            client_id_prefix: "janus-mqtt".to_string(),
            keep_alive: 30,
            clean_session: true,
            request_channel_capacity: 10,
            tuning: Tuning::default(),
        }
    }
}

impl Config {
    /// Parses every configured broker address.
    pub fn broker_addrs(&self) -> Result<Vec<BrokerAddr>, BridgeError> {
        self.brokers
            .iter()
            .map(|broker| {
                BrokerAddr::parse(broker).map_err(|reason| {
                    BridgeError::ClientSetup(format!("invalid broker '{broker}': {reason}"))
                })
            })
            .collect()
    }

    /// Returns the configured client id, or generates `<prefix>-<YYYYmmddHHMMSS>`.
    pub fn resolve_client_id(&self) -> String {
        if !self.client_id.is_empty() {
            return self.client_id.clone();
        }

        let stamp = time::format_description::parse("[year][month][day][hour][minute][second]")
            .ok()
            .and_then(|format| time::OffsetDateTime::now_utc().format(&format).ok())
            .unwrap_or_else(|| time::OffsetDateTime::now_utc().unix_timestamp().to_string());
        format!("{}-{}", self.client_id_prefix, stamp)
    }
}

/// Process-wide defaults that the original deployment tuned at build time.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Tuning {
    /// QoS used by `publish()`.
    #[validate(range(max = 2, message = "Invalid QoS value, must be 0, 1, or 2"))]
    pub publish_qos: u8,

    /// QoS used for every subscribe, including replays.
    #[validate(range(max = 2, message = "Invalid QoS value, must be 0, 1, or 2"))]
    pub subscribe_qos: u8,

    /// How long `publish()` waits for the request to be queued before
    /// returning without checking the outcome.
    pub publish_timeout_ms: u64,

    /// Capacity of the per-subscription payload channel.
    #[validate(range(min = 1, max = 65536))]
    pub buffer_size: usize,

    /// Total connection attempts made by `connect()`.
    #[validate(range(min = 1, max = 1000))]
    pub connect_retries: u32,

    /// Pause between connection attempts. Also used by the transport between
    /// its own reconnection attempts after a loss.
    pub connect_retry_delay_ms: u64,

    /// After this long an attempt is reported as slow. The attempt keeps
    /// running; the timeout only produces a warning.
    pub connect_attempt_timeout_ms: u64,

    /// Grace period given to in-flight acknowledgements on disconnect.
    pub disconnect_grace_ms: u64,

    /// Upper bound on waiting for a subscribe/unsubscribe acknowledgement.
    #[validate(range(min = 1))]
    pub ack_timeout_ms: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            publish_qos: 0,
            subscribe_qos: 0,
            publish_timeout_ms: 50,
            buffer_size: 10,
            connect_retries: 10,
            connect_retry_delay_ms: 1_000,
            connect_attempt_timeout_ms: 1_000,
            disconnect_grace_ms: 100,
            ack_timeout_ms: 10_000,
        }
    }
}

impl Tuning {
    pub fn publish_qos(&self) -> QoS {
        qos_from_level(self.publish_qos)
    }

    pub fn subscribe_qos(&self) -> QoS {
        qos_from_level(self.subscribe_qos)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn connect_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_attempt_timeout_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Maps a validated 0..=2 level to rumqttc's QoS.
fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// A parsed broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddr {
    pub host: String,
    pub port: u16,
    /// Scheme asked for TLS (`ssl://`, `tls://`, `mqtts://`).
    pub secure: bool,
}

impl BrokerAddr {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let (secure, rest) = match raw.split_once("://") {
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "tcp" | "mqtt" => (false, rest),
                "ssl" | "tls" | "mqtts" => (true, rest),
                other => return Err(format!("unsupported scheme '{other}'")),
            },
            None => (false, raw),
        };
        let rest = rest.trim_end_matches('/');
        let default_port = if secure { 8883 } else { 1883 };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            // [v6]:port
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| "unterminated IPv6 address".to_string())?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port)?,
                None if tail.is_empty() => default_port,
                None => return Err(format!("unexpected trailing '{tail}'")),
            };
            (host.to_string(), port)
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), parse_port(port)?),
                None => (rest.to_string(), default_port),
            }
        };

        if host.is_empty() {
            return Err("missing host".to_string());
        }

        Ok(BrokerAddr { host, port, secure })
    }
}

fn parse_port(port: &str) -> Result<u16, String> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("invalid port '{port}'")),
        Ok(port) => Ok(port),
    }
}

#[allow(clippy::ptr_arg)]
fn validate_brokers(brokers: &Vec<String>) -> Result<(), ValidationError> {
    for broker in brokers {
        if let Err(reason) = BrokerAddr::parse(broker) {
            return Err(ValidationError::new("invalid_broker")
                .with_message(format!("Invalid broker '{broker}': {reason}").into()));
        }
    }
    Ok(())
}

/// TLS material, as paths to PEM files.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsConfig {
    /// CA certificate used to verify the broker. Required for TLS.
    #[validate(custom(
        function = "validate_optional_file_exists",
        message = "CA certificate file does not exist"
    ))]
    pub ca_cert_path: Option<String>,

    /// Client certificate for mutual TLS. Requires `client_key_path`.
    #[validate(custom(
        function = "validate_optional_file_exists",
        message = "Client certificate file does not exist"
    ))]
    pub client_cert_path: Option<String>,

    /// Unencrypted client private key for mutual TLS.
    #[validate(custom(
        function = "validate_optional_file_exists",
        message = "Client key file does not exist"
    ))]
    pub client_key_path: Option<String>,
}

impl TlsConfig {
    pub fn new(
        ca_cert_path: impl Into<String>,
        client_cert_path: impl Into<String>,
        client_key_path: impl Into<String>,
    ) -> Self {
        TlsConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            client_cert_path: Some(client_cert_path.into()),
            client_key_path: Some(client_key_path.into()),
        }
    }

    pub fn with_ca_only(ca_cert_path: impl Into<String>) -> Self {
        TlsConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            client_cert_path: None,
            client_key_path: None,
        }
    }

    /// Both client certificate and key are configured.
    pub fn has_client_auth(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.ca_cert_path.is_some()
    }

    /// Checks the combination of paths and that each file is readable.
    pub fn validate_config(&self) -> Result<(), ValidationError> {
        let Some(ca) = self.ca_cert_path.as_deref() else {
            return Err(ValidationError::new("missing_ca_cert")
                .with_message("CA certificate path is required".into()));
        };
        validate_file_path(ca)?;

        match (
            self.client_cert_path.as_deref(),
            self.client_key_path.as_deref(),
        ) {
            (Some(cert), Some(key)) => {
                validate_file_path(cert)?;
                validate_file_path(key)?;
            }
            (None, None) => {}
            _ => {
                return Err(ValidationError::new("incomplete_client_auth").with_message(
                    "Both client certificate and key must be provided or neither".into(),
                ));
            }
        }

        Ok(())
    }
}

fn validate_optional_file_exists(path: &str) -> Result<(), ValidationError> {
    validate_file_path(path)
}

fn validate_file_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }

    let path_obj = Path::new(path);

    if !path_obj.exists() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }

    if !path_obj.is_file() {
        return Err(ValidationError::new("not_a_file")
            .with_message(format!("Path is not a file: {path}").into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tuning.connect_retries, 10);
        assert_eq!(config.tuning.buffer_size, 10);
        assert_eq!(config.tuning.connect_retry_delay(), Duration::from_secs(1));
        assert_eq!(config.tuning.disconnect_grace(), Duration::from_millis(100));
        assert_eq!(config.tuning.publish_timeout(), Duration::from_millis(50));
        assert_eq!(config.tuning.subscribe_qos(), QoS::AtMostOnce);
    }

    #[test]
    fn test_empty_brokers_rejected() {
        let config = Config {
            brokers: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_broker_rejected() {
        let config = Config {
            brokers: vec!["ws://broker:80".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(config.broker_addrs().is_err());
    }

    #[test]
    fn test_empty_topic_rejected() {
        let config = Config {
            topic: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_qos_rejected() {
        let mut config = Config::default();
        config.tuning.subscribe_qos = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_retries_rejected() {
        let mut config = Config::default();
        config.tuning.connect_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_broker_forms() {
        assert_eq!(
            BrokerAddr::parse("localhost:1883").unwrap(),
            BrokerAddr {
                host: "localhost".into(),
                port: 1883,
                secure: false
            }
        );
        assert_eq!(BrokerAddr::parse("tcp://mqtt.local").unwrap().port, 1883);
        let secure = BrokerAddr::parse("ssl://mqtt.example.com").unwrap();
        assert!(secure.secure);
        assert_eq!(secure.port, 8883);
        assert_eq!(BrokerAddr::parse("mqtts://h:9000").unwrap().port, 9000);
        let v6 = BrokerAddr::parse("[::1]:1884").unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.port, 1884);
    }

    #[test]
    fn test_parse_broker_errors() {
        assert!(BrokerAddr::parse("").is_err());
        assert!(BrokerAddr::parse("host:0").is_err());
        assert!(BrokerAddr::parse("host:notaport").is_err());
        assert!(BrokerAddr::parse("ws://host").is_err());
        assert!(BrokerAddr::parse("[::1").is_err());
    }

    #[test]
    fn test_generated_client_id_uses_prefix() {
        let config = Config::default();
        let id = config.resolve_client_id();
        assert!(id.starts_with("janus-mqtt-"));
        assert_eq!(id.len(), "janus-mqtt-".len() + 14);
    }

    #[test]
    fn test_explicit_client_id_wins() {
        let config = Config {
            client_id: "bridge-01".into(),
            ..Default::default()
        };
        assert_eq!(config.resolve_client_id(), "bridge-01");
    }

    #[test]
    fn test_deserialize_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            brokers = ["tcp://a:1883", "tcp://b:1883"]
            topic = "telemetry/#"

            [tuning]
            buffer_size = 32
            "#,
        )
        .unwrap();

        assert_eq!(config.brokers.len(), 2);
        assert_eq!(config.topic, "telemetry/#");
        assert_eq!(config.tuning.buffer_size, 32);
        assert_eq!(config.tuning.connect_retries, 10);
        assert!(config.clean_session);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tls_ca_only_valid() {
        let dir = TempDir::new().unwrap();
        let ca = dir.path().join("ca.crt");
        File::create(&ca)
            .unwrap()
            .write_all(b"ca certificate content")
            .unwrap();

        let tls = TlsConfig::with_ca_only(ca.to_string_lossy());
        assert!(tls.is_enabled());
        assert!(!tls.has_client_auth());
        assert!(tls.validate_config().is_ok());
        assert!(tls.validate().is_ok());
    }

    #[test]
    fn test_tls_incomplete_client_auth() {
        let dir = TempDir::new().unwrap();
        let ca = dir.path().join("ca.crt");
        let cert = dir.path().join("client.crt");
        File::create(&ca).unwrap().write_all(b"ca").unwrap();
        File::create(&cert).unwrap().write_all(b"cert").unwrap();

        let tls = TlsConfig {
            ca_cert_path: Some(ca.to_string_lossy().into_owned()),
            client_cert_path: Some(cert.to_string_lossy().into_owned()),
            client_key_path: None,
        };
        assert!(tls.validate_config().is_err());
    }

    #[test]
    fn test_tls_missing_file() {
        let tls = TlsConfig::with_ca_only("/nonexistent/ca.crt");
        assert!(tls.validate_config().is_err());
        assert!(tls.validate().is_err());
    }
}
