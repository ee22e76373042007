//! Registry configuration.
//!
//! Loaded from YAML; every field has a default so a partial file works:
//!
//! ```yaml
//! broker_id: edge-1
//! session_dups: false
//! offline_qos0: false
//! max_session_expiry: 86400
//! allowed_versions: ["3.1.1", "5.0"]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::MAX_PACKET_SIZE;
use crate::error::{Error, Result};
use crate::types::{EXPIRY_NEVER, ProtocolVersion, QoS};

/// Default handshake timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 2;
/// Default Receive Maximum (MQTT 5.0).
pub const DEFAULT_RECEIVE_MAX: u16 = 65535;
/// Default Topic Alias Maximum (MQTT 5.0).
pub const DEFAULT_MAX_TOPIC_ALIAS: u16 = 65535;
/// Default keep alive in seconds.
pub const DEFAULT_KEEP_ALIVE: u16 = 60;

/// Registry options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Broker identifier used in `$SYS` topics.
    pub broker_id: String,
    /// Protocol versions accepted in CONNECT.
    pub allowed_versions: Vec<ProtocolVersion>,
    /// Handshake timeout in seconds.
    pub connect_timeout: u64,
    /// Let a second connection with the same client id take the session over.
    /// When false the newcomer is rejected.
    pub session_dups: bool,
    /// Persist QoS 0 messages of offline durable sessions.
    pub offline_qos0: bool,
    /// Upper bound for client requested session expiry, in seconds.
    pub max_session_expiry: u32,
    pub max_packet_size: u32,
    pub receive_max: u16,
    pub max_topic_alias: u16,
    pub max_qos: u8,
    pub retain_available: bool,
    pub wildcard_subscriptions: bool,
    pub shared_subscriptions: bool,
    pub subscription_identifiers: bool,
    pub keep_alive: u16,
    /// Override the client keep alive with `keep_alive`.
    pub force_keep_alive: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            broker_id: "mqttd".to_string(),
            allowed_versions: ProtocolVersion::ALL.to_vec(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            session_dups: true,
            offline_qos0: true,
            max_session_expiry: EXPIRY_NEVER,
            max_packet_size: MAX_PACKET_SIZE,
            receive_max: DEFAULT_RECEIVE_MAX,
            max_topic_alias: DEFAULT_MAX_TOPIC_ALIAS,
            max_qos: 2,
            retain_available: true,
            wildcard_subscriptions: true,
            shared_subscriptions: true,
            subscription_identifiers: true,
            keep_alive: DEFAULT_KEEP_ALIVE,
            force_keep_alive: false,
        }
    }
}

impl Options {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse options from YAML.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let options: Options = serde_yaml::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    /// Read options from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Check option consistency.
    pub fn validate(&self) -> Result<()> {
        if self.allowed_versions.is_empty() {
            return Err(Error::InvalidConfig("allowed_versions is empty".into()));
        }
        if self.max_qos > 2 {
            return Err(Error::InvalidConfig(format!("max_qos {} > 2", self.max_qos)));
        }
        if self.receive_max == 0 {
            return Err(Error::InvalidConfig("receive_max must be positive".into()));
        }
        if self.max_packet_size == 0 || self.max_packet_size > MAX_PACKET_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max_packet_size {} out of range",
                self.max_packet_size
            )));
        }
        Ok(())
    }

    pub fn version_allowed(&self, version: ProtocolVersion) -> bool {
        self.allowed_versions.contains(&version)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn max_qos(&self) -> QoS {
        QoS::from_u8(self.max_qos).unwrap_or(QoS::ExactlyOnce)
    }

    /// Set broker identifier.
    pub fn broker_id(mut self, id: impl Into<String>) -> Self {
        self.broker_id = id.into();
        self
    }

    /// Restrict accepted protocol versions.
    pub fn allowed_versions(mut self, versions: &[ProtocolVersion]) -> Self {
        self.allowed_versions = versions.to_vec();
        self
    }

    /// Allow or reject duplicate client ids.
    pub fn session_dups(mut self, allowed: bool) -> Self {
        self.session_dups = allowed;
        self
    }

    /// Persist QoS 0 messages for offline sessions.
    pub fn offline_qos0(mut self, enabled: bool) -> Self {
        self.offline_qos0 = enabled;
        self
    }

    /// Clamp session expiry requests.
    pub fn max_session_expiry(mut self, secs: u32) -> Self {
        self.max_session_expiry = secs;
        self
    }

    /// Set maximum topic aliases per client.
    pub fn max_topic_alias(mut self, max: u16) -> Self {
        self.max_topic_alias = max;
        self
    }

    /// Enable or disable shared subscriptions.
    pub fn shared_subscriptions(mut self, enabled: bool) -> Self {
        self.shared_subscriptions = enabled;
        self
    }

    /// Set handshake timeout in seconds.
    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout = secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert!(options.session_dups);
        assert!(options.offline_qos0);
        assert_eq!(options.receive_max, 65535);
        assert_eq!(options.max_topic_alias, 65535);
        assert_eq!(options.max_packet_size, 268_435_455);
        assert_eq!(options.max_session_expiry, u32::MAX);
        assert!(options.version_allowed(ProtocolVersion::V31));
    }

    #[test]
    fn test_from_yaml_partial() {
        let options = Options::from_yaml(
            "broker_id: edge-1\nsession_dups: false\nallowed_versions: [\"3.1.1\", \"5.0\"]\n",
        )
        .unwrap();
        assert_eq!(options.broker_id, "edge-1");
        assert!(!options.session_dups);
        assert!(options.offline_qos0);
        assert!(!options.version_allowed(ProtocolVersion::V31));
        assert!(options.version_allowed(ProtocolVersion::V5));
    }

    #[test]
    fn test_from_yaml_invalid() {
        assert!(Options::from_yaml("max_qos: 3\n").is_err());
        assert!(Options::from_yaml("allowed_versions: []\n").is_err());
        assert!(Options::from_yaml("receive_max: -1\n").is_err());
    }

    #[test]
    fn test_builder() {
        let options = Options::new().session_dups(false).offline_qos0(false).max_topic_alias(2);
        assert!(!options.session_dups);
        assert!(!options.offline_qos0);
        assert_eq!(options.max_topic_alias, 2);
    }
}
