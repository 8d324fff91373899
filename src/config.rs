//! Broker and client configuration.
//!
//! Both processes take an explicit config struct at entry; the only
//! environment override is the broker port (`IPI_ECS_DDS_PORT`), honored on
//! both sides so a whole deployment can be repointed with one variable.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::magics::{DEFAULT_OP_TIMEOUT, ENV_DDS_PORT, SERVER_PORT};

/// Broker process configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BrokerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: SERVER_PORT }
    }
}

impl BrokerConfig {
    /// Default config with the `IPI_ECS_DDS_PORT` override applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var(ENV_DDS_PORT) {
            if let Ok(port) = port.parse::<u16>() {
                self.port = port;
            }
        }
    }

    /// `host:port` bind string.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Client runtime configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ClientConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Delay between reconnect attempts after a lost connection.
    pub reconnect_delay: Duration,
    /// Deadline applied by `wait` helpers on remote operations.
    pub op_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: SERVER_PORT,
            reconnect_delay: Duration::from_secs(1),
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Default config pointing at `host`, with the port env override applied.
    pub fn for_host(host: impl Into<String>) -> Self {
        let mut config = Self { host: host.into(), ..Self::default() };
        if let Ok(port) = std::env::var(ENV_DDS_PORT) {
            if let Ok(port) = port.parse::<u16>() {
                config.port = port;
            }
        }
        config
    }

    /// `host:port` connect string.
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_broker_config_uses_wire_constant_port() {
        let config = BrokerConfig::default();
        assert_eq!(config.port, SERVER_PORT);
        assert_eq!(config.bind_addr(), format!("0.0.0.0:{SERVER_PORT}"));
    }

    #[test]
    fn default_client_config_targets_loopback() {
        let config = ClientConfig::default();
        assert_eq!(config.broker_addr(), format!("127.0.0.1:{SERVER_PORT}"));
        assert_eq!(config.op_timeout, DEFAULT_OP_TIMEOUT);
    }
}
