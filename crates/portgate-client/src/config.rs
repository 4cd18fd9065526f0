//! Agent configuration

use crate::error::AgentError;
use crate::reconnect::ReconnectConfig;
use portgate_proto::Protocol;
use std::time::Duration;

/// Everything the agent needs to bring a tunnel up.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay control address, `host:port`.
    pub relay_addr: String,
    pub auth_token: String,
    pub protocol: Protocol,
    /// Local service the tunnel fronts.
    pub local_host: String,
    pub local_port: u16,
    /// Ask the relay for this public port. Best effort.
    pub preferred_port: Option<u16>,
    /// How long a relayed request may take against the local service.
    pub request_timeout: Duration,
    /// How long to wait for the relay's registration reply.
    pub register_timeout: Duration,
    pub ping_interval: Duration,
    pub metrics_interval: Duration,
    pub reconnect: ReconnectConfig,
}

impl AgentConfig {
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    pub fn local_target(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay_addr: String::new(),
            auth_token: String::new(),
            protocol: Protocol::Http,
            local_host: "localhost".to_string(),
            local_port: 0,
            preferred_port: None,
            request_timeout: Duration::from_secs(30),
            register_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(25),
            metrics_interval: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Builder for AgentConfig
#[derive(Default)]
pub struct AgentConfigBuilder {
    config: AgentConfig,
}

impl AgentConfigBuilder {
    pub fn relay_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.relay_addr = addr.into();
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.config.auth_token = token.into();
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.config.local_host = host.into();
        self
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.config.local_port = port;
        self
    }

    pub fn preferred_port(mut self, port: Option<u16>) -> Self {
        self.config.preferred_port = port;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn build(self) -> Result<AgentConfig, AgentError> {
        let config = self.config;
        if config.relay_addr.is_empty() || !config.relay_addr.contains(':') {
            return Err(AgentError::Config(
                "relay_addr must be host:port".to_string(),
            ));
        }
        if config.auth_token.is_empty() {
            return Err(AgentError::Config("auth_token is required".to_string()));
        }
        if config.local_port == 0 {
            return Err(AgentError::Config("local_port is required".to_string()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_happy_path() {
        let config = AgentConfig::builder()
            .relay_addr("relay.example.com:7000")
            .auth_token("tok")
            .protocol(Protocol::Tcp)
            .local_port(5432)
            .preferred_port(Some(30022))
            .build()
            .unwrap();

        assert_eq!(config.local_target(), "localhost:5432");
        assert_eq!(config.preferred_port, Some(30022));
        assert_eq!(config.protocol, Protocol::Tcp);
    }

    #[test]
    fn test_builder_requires_relay_addr() {
        let result = AgentConfig::builder()
            .auth_token("tok")
            .local_port(3000)
            .build();
        assert!(matches!(result, Err(AgentError::Config(_))));

        let result = AgentConfig::builder()
            .relay_addr("no-port-here")
            .auth_token("tok")
            .local_port(3000)
            .build();
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[test]
    fn test_builder_requires_token_and_port() {
        let result = AgentConfig::builder()
            .relay_addr("127.0.0.1:7000")
            .local_port(3000)
            .build();
        assert!(matches!(result, Err(AgentError::Config(_))));

        let result = AgentConfig::builder()
            .relay_addr("127.0.0.1:7000")
            .auth_token("tok")
            .build();
        assert!(matches!(result, Err(AgentError::Config(_))));
    }
}
