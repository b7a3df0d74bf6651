use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Configuration for a gateway instance.
///
/// Covers the broker endpoint, the diagnostic console listener, and the
/// capacity/timing knobs of the control plane. All fields have defaults
/// matching the reference deployment; use [`GatewayConfig::builder`] to
/// override selected fields with validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Topic prefix for broker publishes; sensor data goes to `<base_topic>/<node_id>`
    pub base_topic: String,
    /// Broker hostname or IP address
    pub broker_host: String,
    /// Broker port
    pub broker_port: u16,
    /// Listen address for the interactive console
    pub console_addr: SocketAddr,
    /// Prefix for generated broker client ids
    pub client_id_prefix: String,
    /// Maximum number of node records kept in the registry
    pub registry_capacity: usize,
    /// Maximum number of sensor messages buffered while the broker is down
    pub buffer_capacity: usize,
    /// Deadline for an outstanding ping before it is abandoned
    pub ping_timeout_ms: u64,
    /// Interval between status log lines
    pub status_interval_secs: u64,
    /// Interval between self-announcement publishes
    pub announce_interval_secs: u64,
    /// Interval between broker connectivity checks
    pub broker_check_secs: u64,
    /// Connection attempts per broker check before giving up until the next check
    pub reconnect_attempts: u32,
    /// Delay between broker connection attempts
    pub reconnect_delay_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_topic: "sensors".to_string(),
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            console_addr: "0.0.0.0:4050".parse().unwrap(),
            client_id_prefix: "gateway".to_string(),
            registry_capacity: 20,
            buffer_capacity: 10,
            ping_timeout_ms: 5000,
            status_interval_secs: 30,
            announce_interval_secs: 60,
            broker_check_secs: 5,
            reconnect_attempts: 3,
            reconnect_delay_secs: 5,
        }
    }
}

impl GatewayConfig {
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }
}

/// Builder pattern implementation for constructing GatewayConfig instances.
///
/// Unset fields fall back to the defaults; `build()` validates the result.
#[derive(Debug, Default)]
pub struct GatewayConfigBuilder {
    base_topic: Option<String>,
    broker_host: Option<String>,
    broker_port: Option<u16>,
    console_addr: Option<SocketAddr>,
    client_id_prefix: Option<String>,
    registry_capacity: Option<usize>,
    buffer_capacity: Option<usize>,
    ping_timeout_ms: Option<u64>,
    status_interval_secs: Option<u64>,
    announce_interval_secs: Option<u64>,
    broker_check_secs: Option<u64>,
    reconnect_attempts: Option<u32>,
    reconnect_delay_secs: Option<u64>,
}

impl GatewayConfigBuilder {
    pub fn base_topic(mut self, v: impl Into<String>) -> Self {
        self.base_topic = Some(v.into());
        self
    }
    pub fn broker_host(mut self, v: impl Into<String>) -> Self {
        self.broker_host = Some(v.into());
        self
    }
    pub fn broker_port(mut self, v: u16) -> Self {
        self.broker_port = Some(v);
        self
    }
    pub fn console_addr(mut self, v: SocketAddr) -> Self {
        self.console_addr = Some(v);
        self
    }
    pub fn client_id_prefix(mut self, v: impl Into<String>) -> Self {
        self.client_id_prefix = Some(v.into());
        self
    }
    pub fn registry_capacity(mut self, v: usize) -> Self {
        self.registry_capacity = Some(v);
        self
    }
    pub fn buffer_capacity(mut self, v: usize) -> Self {
        self.buffer_capacity = Some(v);
        self
    }
    pub fn ping_timeout_ms(mut self, v: u64) -> Self {
        self.ping_timeout_ms = Some(v);
        self
    }
    pub fn status_interval_secs(mut self, v: u64) -> Self {
        self.status_interval_secs = Some(v);
        self
    }
    pub fn announce_interval_secs(mut self, v: u64) -> Self {
        self.announce_interval_secs = Some(v);
        self
    }
    pub fn broker_check_secs(mut self, v: u64) -> Self {
        self.broker_check_secs = Some(v);
        self
    }
    pub fn reconnect_attempts(mut self, v: u32) -> Self {
        self.reconnect_attempts = Some(v);
        self
    }
    pub fn reconnect_delay_secs(mut self, v: u64) -> Self {
        self.reconnect_delay_secs = Some(v);
        self
    }

    pub fn build(self) -> Result<GatewayConfig> {
        let defaults = GatewayConfig::default();
        let config = GatewayConfig {
            base_topic: self.base_topic.unwrap_or(defaults.base_topic),
            broker_host: self.broker_host.unwrap_or(defaults.broker_host),
            broker_port: self.broker_port.unwrap_or(defaults.broker_port),
            console_addr: self.console_addr.unwrap_or(defaults.console_addr),
            client_id_prefix: self.client_id_prefix.unwrap_or(defaults.client_id_prefix),
            registry_capacity: self.registry_capacity.unwrap_or(defaults.registry_capacity),
            buffer_capacity: self.buffer_capacity.unwrap_or(defaults.buffer_capacity),
            ping_timeout_ms: self.ping_timeout_ms.unwrap_or(defaults.ping_timeout_ms),
            status_interval_secs: self
                .status_interval_secs
                .unwrap_or(defaults.status_interval_secs),
            announce_interval_secs: self
                .announce_interval_secs
                .unwrap_or(defaults.announce_interval_secs),
            broker_check_secs: self.broker_check_secs.unwrap_or(defaults.broker_check_secs),
            reconnect_attempts: self
                .reconnect_attempts
                .unwrap_or(defaults.reconnect_attempts),
            reconnect_delay_secs: self
                .reconnect_delay_secs
                .unwrap_or(defaults.reconnect_delay_secs),
        };

        if config.base_topic.trim().is_empty() {
            return Err(GatewayError::InvalidConfig("base_topic is empty".into()));
        }
        if config.base_topic.ends_with('/') {
            return Err(GatewayError::InvalidConfig(
                "base_topic must not end with '/'".into(),
            ));
        }
        if config.registry_capacity == 0 {
            return Err(GatewayError::InvalidConfig(
                "registry_capacity must be at least 1".into(),
            ));
        }
        if config.buffer_capacity == 0 {
            return Err(GatewayError::InvalidConfig(
                "buffer_capacity must be at least 1".into(),
            ));
        }
        if config.ping_timeout_ms == 0 {
            return Err(GatewayError::InvalidConfig(
                "ping_timeout_ms must be at least 1".into(),
            ));
        }
        if config.status_interval_secs == 0 {
            return Err(GatewayError::InvalidConfig(
                "status_interval_secs must be at least 1".into(),
            ));
        }
        if config.announce_interval_secs == 0 {
            return Err(GatewayError::InvalidConfig(
                "announce_interval_secs must be at least 1".into(),
            ));
        }
        if config.broker_check_secs == 0 {
            return Err(GatewayError::InvalidConfig(
                "broker_check_secs must be at least 1".into(),
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_match_reference_deployment() {
        let config = GatewayConfig::builder().build().unwrap();
        assert_eq!(config.buffer_capacity, 10);
        assert_eq!(config.registry_capacity, 20);
        assert_eq!(config.ping_timeout_ms, 5000);
        assert_eq!(config.reconnect_attempts, 3);
    }

    #[test]
    fn builder_rejects_empty_base_topic() {
        let err = GatewayConfig::builder().base_topic("  ").build().unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
    }

    #[test]
    fn builder_rejects_zero_buffer_capacity() {
        let err = GatewayConfig::builder().buffer_capacity(0).build().unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
    }

    #[test]
    fn builder_rejects_zero_intervals() {
        // Zero periods would panic the run loop's interval timers.
        for result in [
            GatewayConfig::builder().status_interval_secs(0).build(),
            GatewayConfig::builder().announce_interval_secs(0).build(),
            GatewayConfig::builder().broker_check_secs(0).build(),
        ] {
            assert!(matches!(result.unwrap_err(), GatewayError::InvalidConfig(_)));
        }
    }

    #[test]
    fn builder_overrides_selected_fields() {
        let config = GatewayConfig::builder()
            .base_topic("plant/floor3")
            .broker_port(1884)
            .build()
            .unwrap();
        assert_eq!(config.base_topic, "plant/floor3");
        assert_eq!(config.broker_port, 1884);
        assert_eq!(config.broker_host, "127.0.0.1");
    }
}
