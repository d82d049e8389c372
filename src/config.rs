//! Device endpoint and connection configuration.
//!
//! With the `serde` feature a [`DeviceConfig`] can be loaded from YAML;
//! durations are written in `humantime` notation:
//!
//! ```yaml
//! host: 192.168.6.137
//! port: 8899
//! unit_id: 1
//! cache_ttl: 30s
//! connection:
//!   retry_count: 3
//!   retry_delay: 1s
//!   connection_timeout: 10s
//! ```

use crate::protocol::{DEFAULT_PORT, DEFAULT_UNIT_ID};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cannot read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "serde")]
    #[error("Invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Configuration is missing a host")]
    MissingHost,
    #[error("Invalid endpoint '{0}', expected host[:port[:unit_id]]")]
    InvalidEndpoint(String),
}

/// Address of one device: gateway host, TCP port and Modbus unit id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
        }
    }

    /// Stable identifier of the device, `host:port`.
    pub fn unique_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.unit_id)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Parses `host`, `host:port` or `host:port:unit_id`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidEndpoint(s.to_string());
        let mut parts = s.trim().split(':');
        let host = parts.next().filter(|host| !host.is_empty()).ok_or_else(invalid)?;
        let port = match parts.next() {
            Some(port) => port.parse().map_err(|_| invalid())?,
            None => DEFAULT_PORT,
        };
        let unit_id = match parts.next() {
            Some(unit_id) => unit_id.parse().map_err(|_| invalid())?,
            None => DEFAULT_UNIT_ID,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Endpoint::new(host, port, unit_id))
    }
}

/// Retry and timeout bounds of the Modbus connection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ConnectionConfig {
    /// Connection attempts per request.
    pub retry_count: u32,
    /// Pause between two connection attempts.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub retry_delay: Duration,
    /// Budget for all connection attempts of one request.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub connection_timeout: Duration,
    /// Timeout of a single Modbus request on an open connection.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub io_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct DeviceConfig {
    pub host: String,
    #[cfg_attr(feature = "serde", serde(default = "default_port"))]
    pub port: u16,
    #[cfg_attr(feature = "serde", serde(default = "default_unit_id"))]
    pub unit_id: u8,
    /// How long a block read is served from cache.
    #[cfg_attr(
        feature = "serde",
        serde(default = "default_cache_ttl", with = "humantime_serde")
    )]
    pub cache_ttl: Duration,
    /// Refresh period used by polling callers.
    #[cfg_attr(
        feature = "serde",
        serde(default = "default_poll_interval", with = "humantime_serde")
    )]
    pub poll_interval: Duration,
    #[cfg_attr(feature = "serde", serde(default))]
    pub connection: ConnectionConfig,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_unit_id() -> u8 {
    DEFAULT_UNIT_ID
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

impl DeviceConfig {
    /// A configuration for `host` with every other setting at its default.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            unit_id: default_unit_id(),
            cache_ttl: default_cache_ttl(),
            poll_interval: default_poll_interval(),
            connection: ConnectionConfig::default(),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port, self.unit_id)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.host.trim().is_empty() {
            return Err(Error::MissingHost);
        }
        Ok(())
    }

    #[cfg(feature = "serde")]
    pub fn from_yaml_str(yaml: &str) -> Result<Self, Error> {
        let config: DeviceConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "serde")]
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        log::debug!("Loading config file from {path:?}");
        let file = std::fs::File::open(path)?;
        let config: DeviceConfig = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }
}

impl From<Endpoint> for DeviceConfig {
    fn from(endpoint: Endpoint) -> Self {
        Self {
            port: endpoint.port,
            unit_id: endpoint.unit_id,
            ..DeviceConfig::new(endpoint.host)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults() {
        let config = DeviceConfig::new("10.0.0.5");
        assert_eq!(config.port, 8899);
        assert_eq!(config.unit_id, 1);
        assert_eq!(config.cache_ttl, Duration::from_secs(30));
        assert_eq!(config.connection.retry_count, 3);
        assert_eq!(config.endpoint().to_string(), "10.0.0.5:8899:1");
        assert_eq!(config.endpoint().unique_id(), "10.0.0.5:8899");
    }

    #[test]
    fn endpoint_from_str() {
        assert_eq!(
            "gateway".parse::<Endpoint>().unwrap(),
            Endpoint::new("gateway", 8899, 1)
        );
        assert_eq!(
            "10.0.0.5:502:7".parse::<Endpoint>().unwrap(),
            Endpoint::new("10.0.0.5", 502, 7)
        );
        assert_matches!("".parse::<Endpoint>(), Err(Error::InvalidEndpoint(..)));
        assert_matches!("host:port".parse::<Endpoint>(), Err(Error::InvalidEndpoint(..)));
        assert_matches!("h:1:2:3".parse::<Endpoint>(), Err(Error::InvalidEndpoint(..)));
    }

    #[test]
    fn empty_host_is_rejected() {
        assert_matches!(DeviceConfig::new("  ").validate(), Err(Error::MissingHost));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn from_yaml() {
        let config = DeviceConfig::from_yaml_str(
            "host: 192.168.6.137\ncache_ttl: 5s\nconnection:\n  retry_delay: 200ms\n",
        )
        .unwrap();
        assert_eq!(config.host, "192.168.6.137");
        assert_eq!(config.port, 8899);
        assert_eq!(config.cache_ttl, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.connection.retry_delay, Duration::from_millis(200));
        assert_eq!(config.connection.retry_count, 3);

        assert_matches!(DeviceConfig::from_yaml_str("port: 502\n"), Err(Error::Yaml(..)));
        assert_matches!(
            DeviceConfig::from_yaml_str("host: ''\n"),
            Err(Error::MissingHost)
        );
    }
}
