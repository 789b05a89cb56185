//! Client configuration.
//!
//! [`ClientConfig`] is built programmatically or from an `mqtt://` URL.
//! [`MqttConnection`] is the YAML connection section shared by every client
//! of an application; each client adds its own id.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{Connect, Properties, MAX_PACKET_SIZE};

/// Default plain-text broker port.
pub const DEFAULT_PORT: u16 = 1883;

/// Default TLS broker port.
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client ID.
    pub client_id: String,
    /// Clean start flag. When false, the broker keeps the session between
    /// connections.
    pub clean_start: bool,
    /// Bound on establishing the stream and receiving CONNACK.
    pub connect_timeout: Duration,
    /// Bound on each acknowledgment wait (PUBCOMP, SUBACK).
    pub ack_timeout: Duration,
    /// Keep alive interval in seconds. Zero disables keep alive.
    pub keep_alive: u16,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<Vec<u8>>,
    /// Session expiry interval in seconds.
    /// - None: use broker default
    /// - Some(0): session ends immediately on disconnect
    /// - Some(0xFFFFFFFF): session never expires
    pub session_expiry: Option<u32>,
    /// Largest inbound frame accepted.
    pub max_packet_size: usize,
    /// Send PINGREQ at `keep_alive / 2` intervals.
    pub auto_keepalive: bool,
    /// Connect over TLS (requires the `tls` feature).
    pub tls: bool,
}

impl ClientConfig {
    /// Create a new client config.
    pub fn new(host: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            client_id: client_id.into(),
            clean_start: true,
            connect_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(10),
            keep_alive: 60,
            username: None,
            password: None,
            session_expiry: None,
            max_packet_size: MAX_PACKET_SIZE,
            auto_keepalive: true,
            tls: false,
        }
    }

    /// Build a config from `mqtt://[user[:pass]@]host[:port]`.
    ///
    /// `mqtts://` and `ssl://` select TLS and default to port 8883.
    pub fn from_url(addr: &str, client_id: impl Into<String>) -> Result<Self> {
        let url = url::Url::parse(addr)
            .map_err(|e| Error::InvalidConfig(format!("invalid broker url {:?}: {}", addr, e)))?;

        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" | "tls" => true,
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unsupported url scheme {:?}",
                    other
                )));
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidConfig(format!("broker url {:?} has no host", addr)))?;
        let port = url
            .port()
            .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });

        let mut config = ClientConfig::new(host, client_id).with_port(port).with_tls(tls);
        if !url.username().is_empty() {
            config.username = Some(url.username().to_string());
            config.password = url.password().map(|p| p.as_bytes().to_vec());
        }
        Ok(config)
    }

    /// Set the broker port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep alive interval.
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean start flag.
    pub fn with_clean_start(mut self, clean: bool) -> Self {
        self.clean_start = clean;
        self
    }

    /// Set session expiry interval.
    pub fn with_session_expiry(mut self, seconds: u32) -> Self {
        self.session_expiry = Some(seconds);
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the acknowledgment timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Enable or disable automatic keep-alive.
    pub fn with_auto_keepalive(mut self, enabled: bool) -> Self {
        self.auto_keepalive = enabled;
        self
    }

    /// Connect over TLS.
    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }

    /// `host:port` of the broker.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check the configuration for values that can never connect.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::InvalidConfig("empty host".into()));
        }
        if self.port == 0 {
            return Err(Error::InvalidConfig("port must not be zero".into()));
        }
        if self.client_id.is_empty() && !self.clean_start {
            return Err(Error::InvalidConfig(
                "a persistent session needs a client id".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::InvalidConfig("connect timeout must not be zero".into()));
        }
        if self.ack_timeout.is_zero() {
            return Err(Error::InvalidConfig("ack timeout must not be zero".into()));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(Error::InvalidConfig("password without username".into()));
        }
        if self.tls && !cfg!(feature = "tls") {
            return Err(Error::InvalidConfig(
                "TLS requested but the tls feature is disabled".into(),
            ));
        }
        Ok(())
    }

    /// CONNECT packet for this configuration.
    pub(crate) fn connect_packet(&self) -> Connect {
        Connect {
            client_id: self.client_id.clone(),
            keep_alive: self.keep_alive,
            clean_start: self.clean_start,
            username: self.username.clone(),
            password: self.password.clone().map(Into::into),
            properties: Properties {
                session_expiry_interval: self.session_expiry,
                maximum_packet_size: u32::try_from(self.max_packet_size).ok(),
                ..Default::default()
            },
        }
    }
}

/// Connection section shared by the clients of an application.
///
/// ```yaml
/// host: broker.local
/// port: 1883
/// timeout_ms: 5000
/// username: robot
/// password: secret
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MqttConnection {
    /// Broker host.
    pub host: String,

    /// Broker port (optional, defaults to 1883).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Connect and acknowledgment timeout in milliseconds (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Username (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Connect over TLS (optional).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tls: bool,
}

impl MqttConnection {
    /// Parse a connection section from YAML.
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    /// Load a connection section from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&data)
    }

    /// Client configuration for `client_id` with a persistent session.
    pub fn client_config(&self, client_id: impl Into<String>) -> ClientConfig {
        let mut config = ClientConfig::new(&self.host, client_id)
            .with_port(self.port.unwrap_or(if self.tls {
                DEFAULT_TLS_PORT
            } else {
                DEFAULT_PORT
            }))
            .with_clean_start(false)
            .with_tls(self.tls);

        if let Some(ms) = self.timeout_ms {
            let timeout = Duration::from_millis(ms);
            config = config
                .with_connect_timeout(timeout)
                .with_ack_timeout(timeout);
        }

        if let Some(username) = &self.username {
            config.username = Some(username.clone());
            config.password = self.password.as_ref().map(|p| p.as_bytes().to_vec());
        }

        config
    }
}
