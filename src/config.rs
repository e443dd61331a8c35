use crate::error::{BridgeError, Result};
use crate::types::VolumeLevel;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Static bridge configuration, supplied once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Broker host name or address
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,

    /// Prefix of all zone topics
    pub base_topic: String,
    /// Bridge availability topic, carries the last will
    pub availability_topic: String,
    pub qos: u8,

    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,

    pub debounce_ms: u64,
    pub liveness_window_secs: u64,
    pub liveness_check_secs: u64,
    pub command_timeout_ms: u64,

    pub volume_min: VolumeLevel,
    pub volume_max: VolumeLevel,

    /// Input display names in amplifier order (`Source 1`, `Source 2`, ...)
    pub sources: Vec<String>,

    /// Capacity of the notification channel
    pub event_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: format!("ampbridge-{}", uuid::Uuid::new_v4().simple()),
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            base_topic: "ampbridge/zones".to_string(),
            availability_topic: "ampbridge/bridge/status".to_string(),
            qos: 1,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 60_000,
            debounce_ms: 2_000,
            liveness_window_secs: 300,
            liveness_check_secs: 30,
            command_timeout_ms: 5_000,
            volume_min: 0,
            volume_max: 100,
            sources: Vec::new(),
            event_buffer: 256,
        }
    }
}

impl BridgeConfig {
    /// Configuration for a broker with every other setting at its default
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Set broker credentials
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the advertised source names
    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    /// Parse and validate a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(invalid("host must not be empty"));
        }
        if self.client_id.is_empty() {
            return Err(invalid("client_id must not be empty"));
        }
        if self.base_topic.is_empty() || self.base_topic.contains(['+', '#']) {
            return Err(invalid("base_topic must be a plain topic prefix"));
        }
        if self.availability_topic.is_empty() || self.availability_topic.contains(['+', '#']) {
            return Err(invalid("availability_topic must be a plain topic"));
        }
        if self.qos > 2 {
            return Err(invalid("qos must be 0, 1 or 2"));
        }
        if self.volume_min >= self.volume_max {
            return Err(invalid("volume_min must be below volume_max"));
        }
        if self.reconnect_base_ms == 0 || self.reconnect_base_ms > self.reconnect_cap_ms {
            return Err(invalid(
                "reconnect_base_ms must be non-zero and not exceed reconnect_cap_ms",
            ));
        }
        if self.command_timeout_ms == 0 {
            return Err(invalid("command_timeout_ms must be non-zero"));
        }
        if self.liveness_window_secs == 0 || self.liveness_check_secs == 0 {
            return Err(invalid("liveness durations must be non-zero"));
        }
        if self.keep_alive_secs < 5 {
            return Err(invalid("keep_alive_secs must be at least 5"));
        }
        if self.event_buffer == 0 {
            return Err(invalid("event_buffer must be non-zero"));
        }
        if self.sources.iter().any(|s| s.trim().is_empty()) {
            return Err(invalid("source names must not be empty"));
        }
        Ok(())
    }

    pub fn mqtt_qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_cap_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn liveness_check(&self) -> Duration {
        Duration::from_secs(self.liveness_check_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn invalid(reason: &str) -> BridgeError {
    BridgeError::InvalidConfig(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BridgeConfig::default();
        config.validate().unwrap();
        assert!(config.client_id.starts_with("ampbridge-"));
        assert_eq!(config.debounce(), Duration::from_secs(2));
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.liveness_window(), Duration::from_secs(300));
        assert_eq!(config.mqtt_qos(), QoS::AtLeastOnce);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = BridgeConfig::from_json_str(
            r#"{ "host": "192.168.1.233", "port": 1885, "username": "ha", "password": "pw",
                 "sources": ["Echo", "Server", "TV"] }"#,
        )
        .unwrap();
        assert_eq!(config.host, "192.168.1.233");
        assert_eq!(config.port, 1885);
        assert_eq!(config.username.as_deref(), Some("ha"));
        assert_eq!(config.sources.len(), 3);
        assert_eq!(config.base_topic, "ampbridge/zones");
        assert_eq!(config.reconnect_cap(), Duration::from_secs(60));
    }

    #[test]
    fn rejects_inverted_volume_bounds() {
        let err =
            BridgeConfig::from_json_str(r#"{ "volume_min": 80, "volume_max": 20 }"#).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_wildcard_base_topic() {
        let mut config = BridgeConfig::new("broker", 1883);
        config.base_topic = "ampbridge/#".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_backoff_base_above_cap() {
        let mut config = BridgeConfig::new("broker", 1883);
        config.reconnect_base_ms = 120_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_json_is_a_json_error() {
        let err = BridgeConfig::from_json_str("{ host: ").unwrap_err();
        assert!(matches!(err, BridgeError::Json(_)));
    }
}
