//! MQTT client construction.
//!
//! `ClientBuilder` turns a validated [`Config`] into rumqttc's `AsyncClient`
//! and `EventLoop`, plus one `MqttOptions` per configured broker. The transport
//! swaps those options into the event loop to fail over between brokers.
//!
//! ```ignore
//! let (client, event_loop, brokers) = ClientBuilder::from_config(&config)?.build()?;
//! ```

use std::{fs, time::Duration};

use rumqttc::{AsyncClient, EventLoop, MqttOptions, TlsConfiguration, Transport};

use crate::{
    config::{BrokerAddr, Config, TlsConfig},
    error::BridgeError,
};

/// Builder for the rumqttc client pair and per-broker options.
///
/// The builder is consumed by `build()`. The returned `AsyncClient` is cheap
/// to clone; the `EventLoop` must be polled by exactly one task.
pub struct ClientBuilder {
    brokers: Vec<BrokerAddr>,
    client_id: String,
    credentials: Option<(String, String)>,
    keep_alive: Duration,
    clean_session: bool,

    /// Capacity of the request channel between `AsyncClient` and `EventLoop`.
    cap: usize,

    tls_config: Option<TlsConfig>,
}

impl ClientBuilder {
    /// A builder for a single plain-TCP broker with library defaults.
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16, cap: usize) -> Self {
        Self {
            brokers: vec![BrokerAddr {
                host: host.into(),
                port,
                secure: false,
            }],
            client_id: client_id.into(),
            credentials: None,
            keep_alive: Duration::from_secs(30),
            clean_session: true,
            cap,
            tls_config: None,
        }
    }

    /// Creates a builder from a configuration (usually loaded from TOML).
    ///
    /// # Errors
    /// `BridgeError::ClientSetup` when a broker address does not parse.
    pub fn from_config(config: &Config) -> Result<Self, BridgeError> {
        let brokers = config.broker_addrs()?;

        let credentials = if config.username.is_empty() {
            None
        } else {
            Some((config.username.clone(), config.password.clone()))
        };

        let tls_config = config.tls.as_ref().filter(|tls| tls.is_enabled()).cloned();

        Ok(Self {
            brokers,
            client_id: config.resolve_client_id(),
            credentials,
            keep_alive: Duration::from_secs(config.keep_alive),
            clean_session: config.clean_session,
            cap: config.request_channel_capacity,
            tls_config,
        })
    }

    /// Configures mutual TLS for every broker.
    pub fn with_tls(
        mut self,
        ca_cert_path: impl Into<String>,
        client_cert_path: impl Into<String>,
        client_key_path: impl Into<String>,
    ) -> Self {
        self.tls_config = Some(TlsConfig::new(ca_cert_path, client_cert_path, client_key_path));
        self
    }

    /// Configures server-verified TLS for every broker.
    pub fn with_tls_ca_only(mut self, ca_cert_path: impl Into<String>) -> Self {
        self.tls_config = Some(TlsConfig::with_ca_only(ca_cert_path));
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    pub fn keep_alive(mut self, secs: u64) -> Self {
        self.keep_alive = Duration::from_secs(secs);
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn load_file(path: &str) -> Result<Vec<u8>, BridgeError> {
        Ok(fs::read(path)?)
    }

    /// Loads the PEM material into a rumqttc TLS transport.
    fn build_tls_transport(tls_config: &TlsConfig) -> Result<Transport, BridgeError> {
        tls_config
            .validate_config()
            .map_err(|e| BridgeError::ClientSetup(format!("Invalid TLS configuration: {e}")))?;

        let ca_path = tls_config
            .ca_cert_path
            .as_deref()
            .ok_or_else(|| BridgeError::ClientSetup("TLS configuration is not set".into()))?;
        let ca = Self::load_file(ca_path)?;

        let client_auth = match (
            tls_config.client_cert_path.as_deref(),
            tls_config.client_key_path.as_deref(),
        ) {
            (Some(cert), Some(key)) => Some((Self::load_file(cert)?, Self::load_file(key)?)),
            _ => None,
        };

        Ok(Transport::Tls(TlsConfiguration::Simple {
            ca,
            client_auth,
            alpn: None,
        }))
    }

    fn options_for(&self, broker: &BrokerAddr, tls: Option<&Transport>) -> Result<MqttOptions, BridgeError> {
        let mut opts = MqttOptions::new(self.client_id.clone(), broker.host.clone(), broker.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_session(self.clean_session);

        if let Some((username, password)) = &self.credentials {
            opts.set_credentials(username.clone(), password.clone());
        }

        match tls {
            Some(transport) => {
                opts.set_transport(transport.clone());
            }
            None if broker.secure => {
                return Err(BridgeError::ClientSetup(format!(
                    "broker {}:{} requires TLS but no CA certificate is configured",
                    broker.host, broker.port
                )));
            }
            None => {
                opts.set_transport(Transport::Tcp);
            }
        }

        Ok(opts)
    }

    /// Builds the client pair and the options for every broker, in order.
    ///
    /// The event loop starts out pointed at the first broker.
    pub fn build(self) -> Result<(AsyncClient, EventLoop, Vec<MqttOptions>), BridgeError> {
        let tls = self
            .tls_config
            .as_ref()
            .map(Self::build_tls_transport)
            .transpose()?;

        let options = self
            .brokers
            .iter()
            .map(|broker| self.options_for(broker, tls.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let first = options
            .first()
            .cloned()
            .ok_or_else(|| BridgeError::ClientSetup("no broker configured".into()))?;

        let (client, event_loop) = AsyncClient::new(first, self.cap);

        Ok((client, event_loop, options))
    }
}
