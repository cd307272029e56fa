//! Gateway configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config:
//!
//! ```
//! use loconet_gateway::config::GatewayConfig;
//!
//! let config = GatewayConfig::from_json_str(r#"{ "port": 1234, "device": "/dev/ttyUSB0" }"#).unwrap();
//! assert_eq!(config.port, 1234);
//! assert_eq!(config.max_connections, 4);
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::interface::DEFAULT_BAUD_RATE;
use crate::writer::{WriterConfig, DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_PENDING_LINES};

/// Default TCP port ("loco" on a phone keypad).
pub const DEFAULT_PORT: u16 = 5626;

/// Default bind address.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default concurrent client limit.
pub const DEFAULT_MAX_CONNECTIONS: usize = 4;

/// Default framer poll interval when no wakeup arrives.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Settings for one gateway instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// IP address to bind.
    pub host: String,
    /// TCP port to listen on.
    pub port: u16,
    /// Clients beyond this wait until a session ends.
    pub max_connections: usize,
    /// How long a SEND waits for its echo.
    pub echo_timeout_ms: u64,
    /// Framer fallback poll interval.
    pub poll_interval_ms: u64,
    /// Per-client writer queue capacity.
    pub channel_capacity: usize,
    /// Per-client backpressure threshold.
    pub max_pending_lines: usize,
    /// How long a line may wait on a slow client.
    pub backpressure_timeout_ms: u64,
    /// Product name in the VERSION line.
    pub product: String,
    /// Version in the VERSION line.
    pub version: String,
    /// Serial device of the LocoBuffer-USB.
    pub device: Option<String>,
    pub baud_rate: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            echo_timeout_ms: 2000,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_pending_lines: DEFAULT_MAX_PENDING_LINES,
            backpressure_timeout_ms: 5000,
            product: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            device: None,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl GatewayConfig {
    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(GatewayError::Config("max_connections must be at least 1".into()));
        }
        if self.echo_timeout_ms == 0 {
            return Err(GatewayError::Config("echo_timeout_ms must be positive".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(GatewayError::Config("poll_interval_ms must be positive".into()));
        }
        if self.channel_capacity == 0 || self.max_pending_lines == 0 {
            return Err(GatewayError::Config("writer queue sizes must be positive".into()));
        }
        if self.product.split_whitespace().count() != 1 {
            return Err(GatewayError::Config("product must be a single word".into()));
        }
        self.listen_addr()?;
        Ok(())
    }

    /// Socket address to bind.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse::<SocketAddr>()
            .or_else(|_| format!("[{}]:{}", self.host, self.port).parse::<SocketAddr>())
            .map_err(|_| GatewayError::Config(format!("invalid host {:?}", self.host)))
    }

    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Writer settings for each client connection.
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_lines: self.max_pending_lines,
            channel_capacity: self.channel_capacity,
            backpressure_timeout: Duration::from_millis(self.backpressure_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.port, 5626);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.echo_timeout(), Duration::from_secs(2));
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.baud_rate, 57_600);
        assert_eq!(config.product, "loconet-gateway");
        assert!(config.device.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_json_is_default() {
        let config = GatewayConfig::from_json_str("{}").unwrap();
        assert_eq!(config, GatewayConfig::default());
    }

    #[test]
    fn test_partial_json_overrides() {
        let config = GatewayConfig::from_json_str(
            r#"{ "host": "0.0.0.0", "echo_timeout_ms": 500, "device": "/dev/ttyUSB0" }"#,
        )
        .unwrap();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.echo_timeout(), Duration::from_millis(500));
        assert_eq!(config.device.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = GatewayConfig::from_json_str(r#"{ "prot": 1 }"#);
        assert!(matches!(result, Err(GatewayError::Json(_))));
    }

    #[test]
    fn test_validation_errors() {
        for json in [
            r#"{ "max_connections": 0 }"#,
            r#"{ "echo_timeout_ms": 0 }"#,
            r#"{ "product": "two words" }"#,
            r#"{ "host": "not a host" }"#,
        ] {
            let result = GatewayConfig::from_json_str(json);
            assert!(matches!(result, Err(GatewayError::Config(_))), "{}", json);
        }
    }

    #[test]
    fn test_listen_addr_ipv6() {
        let config = GatewayConfig {
            host: "::1".to_string(),
            ..Default::default()
        };
        assert_eq!(config.listen_addr().unwrap().to_string(), "[::1]:5626");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "port": 15626, "max_connections": 8 }}"#).unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, 15626);
        assert_eq!(config.max_connections, 8);
    }

    #[test]
    fn test_writer_config_mapping() {
        let config = GatewayConfig {
            backpressure_timeout_ms: 250,
            channel_capacity: 16,
            max_pending_lines: 32,
            ..Default::default()
        };
        let writer = config.writer_config();
        assert_eq!(writer.backpressure_timeout, Duration::from_millis(250));
        assert_eq!(writer.channel_capacity, 16);
        assert_eq!(writer.max_pending_lines, 32);
    }
}
