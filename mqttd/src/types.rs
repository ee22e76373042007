//! Common types for mqttd.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// MQTT protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// MQTT 3.1 (protocol level 3)
    #[serde(rename = "3.1")]
    V31,
    /// MQTT 3.1.1 (protocol level 4)
    #[serde(rename = "3.1.1")]
    V311,
    /// MQTT 5.0 (protocol level 5)
    #[default]
    #[serde(rename = "5.0")]
    V5,
}

impl ProtocolVersion {
    /// All versions the broker knows how to speak.
    pub const ALL: [ProtocolVersion; 3] =
        [ProtocolVersion::V31, ProtocolVersion::V311, ProtocolVersion::V5];

    /// Protocol level byte carried in CONNECT.
    pub fn level(self) -> u8 {
        match self {
            ProtocolVersion::V31 => 3,
            ProtocolVersion::V311 => 4,
            ProtocolVersion::V5 => 5,
        }
    }

    /// Parse a protocol level byte.
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            3 => Some(ProtocolVersion::V31),
            4 => Some(ProtocolVersion::V311),
            5 => Some(ProtocolVersion::V5),
            _ => None,
        }
    }

    pub fn is_v5(self) -> bool {
        self == ProtocolVersion::V5
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolVersion::V31 => write!(f, "MQTT 3.1"),
            ProtocolVersion::V311 => write!(f, "MQTT 3.1.1"),
            ProtocolVersion::V5 => write!(f, "MQTT 5.0"),
        }
    }
}

/// Quality of Service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum QoS {
    /// At most once delivery (fire and forget).
    #[default]
    AtMostOnce = 0,
    /// At least once delivery.
    AtLeastOnce = 1,
    /// Exactly once delivery.
    ExactlyOnce = 2,
}

impl QoS {
    /// Parse the two low bits of a QoS byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

impl From<rumqttc::mqttbytes::QoS> for QoS {
    fn from(qos: rumqttc::mqttbytes::QoS) -> Self {
        match qos {
            rumqttc::mqttbytes::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::mqttbytes::QoS::AtLeastOnce => QoS::AtLeastOnce,
            rumqttc::mqttbytes::QoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

impl From<QoS> for rumqttc::mqttbytes::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::mqttbytes::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::mqttbytes::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::mqttbytes::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::v5::mqttbytes::QoS> for QoS {
    fn from(qos: rumqttc::v5::mqttbytes::QoS) -> Self {
        match qos {
            rumqttc::v5::mqttbytes::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::v5::mqttbytes::QoS::AtLeastOnce => QoS::AtLeastOnce,
            rumqttc::v5::mqttbytes::QoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

impl From<QoS> for rumqttc::v5::mqttbytes::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::v5::mqttbytes::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::v5::mqttbytes::QoS::ExactlyOnce,
        }
    }
}

/// Subscription options byte as carried in SUBSCRIBE.
///
/// Bits 0-1 hold the maximum QoS, bit 2 no-local, bit 3 retain-as-published
/// and bits 4-5 the retain handling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SubscriptionOptions(pub u8);

impl SubscriptionOptions {
    const NO_LOCAL: u8 = 0x04;
    const RETAIN_AS_PUBLISHED: u8 = 0x08;

    pub fn new(qos: QoS) -> Self {
        Self(qos as u8)
    }

    pub fn qos(self) -> QoS {
        QoS::from_u8(self.0 & 0x03).unwrap_or(QoS::ExactlyOnce)
    }

    pub fn no_local(self) -> bool {
        self.0 & Self::NO_LOCAL != 0
    }

    pub fn retain_as_published(self) -> bool {
        self.0 & Self::RETAIN_AS_PUBLISHED != 0
    }

    /// 0: send on subscribe, 1: send only for new subscriptions, 2: never send.
    pub fn retain_handling(self) -> u8 {
        (self.0 >> 4) & 0x03
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.0 = (self.0 & !0x03) | qos as u8;
        self
    }

    pub fn with_no_local(mut self, no_local: bool) -> Self {
        if no_local {
            self.0 |= Self::NO_LOCAL;
        } else {
            self.0 &= !Self::NO_LOCAL;
        }
        self
    }

    pub fn with_retain_as_published(mut self, rap: bool) -> Self {
        if rap {
            self.0 |= Self::RETAIN_AS_PUBLISHED;
        } else {
            self.0 &= !Self::RETAIN_AS_PUBLISHED;
        }
        self
    }

    pub fn with_retain_handling(mut self, mode: u8) -> Self {
        self.0 = (self.0 & !0x30) | ((mode & 0x03) << 4);
        self
    }
}

/// Application message.
///
/// Used both for inbound publishes coming from a client and for outbound
/// deliveries queued on a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    /// Topic name. Empty when the outbound packet relies on a topic alias.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Packet identifier; zero for QoS 0.
    pub packet_id: u16,
    /// Delivery identifier of the publishing subscriber (used for no-local).
    pub publish_id: u64,
    /// Absolute message expiry.
    pub expire_at: Option<DateTime<Utc>>,
    /// Outbound topic alias (MQTT 5.0).
    pub topic_alias: Option<u16>,
    /// Matching subscription identifiers (MQTT 5.0).
    pub subscription_ids: Vec<u32>,
}

impl Publish {
    /// Create a new QoS 0 message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            packet_id: 0,
            publish_id: 0,
            expire_at: None,
            topic_alias: None,
            subscription_ids: Vec::new(),
        }
    }

    /// Set QoS.
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set retain flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Set packet identifier.
    pub fn with_packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = packet_id;
        self
    }

    /// Set absolute expiry.
    pub fn with_expire_at(mut self, at: DateTime<Utc>) -> Self {
        self.expire_at = Some(at);
        self
    }

    /// Whether the message expiry has passed at `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_some_and(|at| at <= now)
    }

    /// Remaining time-to-live in whole seconds, rounded up.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<u32> {
        let at = self.expire_at?;
        let ms = (at - now).num_milliseconds().max(0) as u64;
        Some(u32::try_from(ms.div_ceil(1000)).unwrap_or(u32::MAX))
    }
}

/// Will message negotiated in CONNECT.
#[derive(Debug, Clone, PartialEq)]
pub struct Will {
    pub message: Publish,
    /// Will delay interval in seconds (MQTT 5.0).
    pub delay: u32,
}

/// Session expiry interval meaning "never expire".
pub const EXPIRY_NEVER: u32 = u32::MAX;

/// Maximum number of outstanding packet identifiers.
pub const MAX_PACKET_ID: u16 = u16::MAX;
