//! Broker-side packet model and reason codes.
//!
//! The session and the outbound pipeline only deal with these types; the
//! [`Codec`](crate::codec::Codec) maps them to and from the wire.

use crate::types::{ProtocolVersion, Publish, QoS, SubscriptionOptions};

/// Result or reason code carried by acknowledgments and DISCONNECT.
///
/// MQTT 3.x and 5.0 reuse the same numeric values for unrelated meanings
/// (0x04 is "bad username or password" in a 3.x CONNACK and "disconnect with
/// will message" in a 5.0 DISCONNECT), so each meaning gets its own variant
/// and callers go through the version-gated constructors below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    Success,
    GrantedQoS1,
    GrantedQoS2,
    DisconnectWithWill,
    NoMatchingSubscribers,
    NoSubscriptionExisted,

    // MQTT 3.x CONNACK return codes.
    RefusedProtocolVersion,
    RefusedIdentifierRejected,
    RefusedServerUnavailable,
    RefusedBadUsernameOrPassword,
    RefusedNotAuthorized,
    // MQTT 3.x SUBACK failure.
    QosFailure,

    // MQTT 5.0 error codes.
    UnspecifiedError,
    MalformedPacket,
    ProtocolError,
    ImplementationSpecificError,
    UnsupportedProtocolVersion,
    InvalidClientId,
    BadUserNameOrPassword,
    NotAuthorized,
    ServerUnavailable,
    ServerBusy,
    ServerShuttingDown,
    BadAuthenticationMethod,
    KeepAliveTimeout,
    SessionTakenOver,
    TopicFilterInvalid,
    TopicNameInvalid,
    PacketIdInUse,
    PacketIdNotFound,
    ReceiveMaximumExceeded,
    PacketTooLarge,
    QuotaExceeded,
    SharedSubscriptionsNotSupported,
    SubscriptionIdsNotSupported,
    WildcardSubscriptionsNotSupported,
}

impl ReasonCode {
    /// Numeric value on the wire.
    pub fn value(self) -> u8 {
        use ReasonCode::*;
        match self {
            Success => 0x00,
            GrantedQoS1 => 0x01,
            GrantedQoS2 => 0x02,
            DisconnectWithWill => 0x04,
            NoMatchingSubscribers => 0x10,
            NoSubscriptionExisted => 0x11,
            RefusedProtocolVersion => 0x01,
            RefusedIdentifierRejected => 0x02,
            RefusedServerUnavailable => 0x03,
            RefusedBadUsernameOrPassword => 0x04,
            RefusedNotAuthorized => 0x05,
            QosFailure => 0x80,
            UnspecifiedError => 0x80,
            MalformedPacket => 0x81,
            ProtocolError => 0x82,
            ImplementationSpecificError => 0x83,
            UnsupportedProtocolVersion => 0x84,
            InvalidClientId => 0x85,
            BadUserNameOrPassword => 0x86,
            NotAuthorized => 0x87,
            ServerUnavailable => 0x88,
            ServerBusy => 0x89,
            ServerShuttingDown => 0x8B,
            BadAuthenticationMethod => 0x8C,
            KeepAliveTimeout => 0x8D,
            SessionTakenOver => 0x8E,
            TopicFilterInvalid => 0x8F,
            TopicNameInvalid => 0x90,
            PacketIdInUse => 0x91,
            PacketIdNotFound => 0x92,
            ReceiveMaximumExceeded => 0x93,
            PacketTooLarge => 0x95,
            QuotaExceeded => 0x97,
            SharedSubscriptionsNotSupported => 0x9E,
            SubscriptionIdsNotSupported => 0xA1,
            WildcardSubscriptionsNotSupported => 0xA2,
        }
    }

    /// Whether the code reports a failure.
    pub fn is_error(self) -> bool {
        !matches!(
            self,
            ReasonCode::Success
                | ReasonCode::GrantedQoS1
                | ReasonCode::GrantedQoS2
                | ReasonCode::DisconnectWithWill
                | ReasonCode::NoMatchingSubscribers
                | ReasonCode::NoSubscriptionExisted
        )
    }

    /// Granted QoS result for SUBACK.
    pub fn granted(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => ReasonCode::Success,
            QoS::AtLeastOnce => ReasonCode::GrantedQoS1,
            QoS::ExactlyOnce => ReasonCode::GrantedQoS2,
        }
    }

    /// CONNACK code for rejected credentials.
    pub fn bad_credentials(version: ProtocolVersion) -> Self {
        if version.is_v5() {
            ReasonCode::BadUserNameOrPassword
        } else {
            ReasonCode::RefusedBadUsernameOrPassword
        }
    }

    /// CONNACK code for a rejected or conflicting client identifier.
    pub fn identifier_rejected(version: ProtocolVersion) -> Self {
        if version.is_v5() {
            ReasonCode::InvalidClientId
        } else {
            ReasonCode::RefusedIdentifierRejected
        }
    }

    /// CONNACK code for a protocol version outside the allowed set.
    pub fn unsupported_version(version: ProtocolVersion) -> Self {
        if version.is_v5() {
            ReasonCode::UnsupportedProtocolVersion
        } else {
            ReasonCode::RefusedProtocolVersion
        }
    }

    /// CONNACK code for a server-side failure.
    pub fn server_unavailable(version: ProtocolVersion) -> Self {
        if version.is_v5() {
            ReasonCode::ServerUnavailable
        } else {
            ReasonCode::RefusedServerUnavailable
        }
    }

    /// SUBACK/UNSUBACK code for an ACL denial.
    pub fn not_authorized(version: ProtocolVersion) -> Self {
        if version.is_v5() {
            ReasonCode::NotAuthorized
        } else {
            ReasonCode::QosFailure
        }
    }

    /// Interpret the reason byte of an inbound DISCONNECT.
    ///
    /// Only MQTT 5.0 carries a reason; 0x04 there means "disconnect with will
    /// message" and never "bad username or password".
    pub fn from_disconnect(version: ProtocolVersion, value: u8) -> Self {
        if !version.is_v5() {
            return ReasonCode::Success;
        }
        match value {
            0x00 => ReasonCode::Success,
            0x04 => ReasonCode::DisconnectWithWill,
            0x81 => ReasonCode::MalformedPacket,
            0x82 => ReasonCode::ProtocolError,
            0x83 => ReasonCode::ImplementationSpecificError,
            0x87 => ReasonCode::NotAuthorized,
            0x89 => ReasonCode::ServerBusy,
            0x8B => ReasonCode::ServerShuttingDown,
            0x8D => ReasonCode::KeepAliveTimeout,
            0x8E => ReasonCode::SessionTakenOver,
            0x93 => ReasonCode::ReceiveMaximumExceeded,
            0x95 => ReasonCode::PacketTooLarge,
            0x97 => ReasonCode::QuotaExceeded,
            _ => ReasonCode::UnspecifiedError,
        }
    }
}

/// CONNACK properties advertised to MQTT 5.0 clients.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnAckProperties {
    pub session_expiry: Option<u32>,
    pub receive_max: Option<u16>,
    pub max_qos: Option<u8>,
    pub retain_available: Option<bool>,
    pub max_packet_size: Option<u32>,
    pub assigned_client_id: Option<String>,
    pub topic_alias_max: Option<u16>,
    pub wildcard_available: Option<bool>,
    pub subscription_ids_available: Option<bool>,
    pub shared_available: Option<bool>,
    pub server_keep_alive: Option<u16>,
}

/// CONNACK.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ReasonCode,
    pub properties: Option<ConnAckProperties>,
}

/// Packets the broker writes to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck { packet_id: u16, reason: ReasonCode },
    PubRec { packet_id: u16, reason: ReasonCode },
    PubRel { packet_id: u16, reason: ReasonCode },
    PubComp { packet_id: u16, reason: ReasonCode },
    SubAck { packet_id: u16, codes: Vec<ReasonCode> },
    UnsubAck { packet_id: u16, codes: Vec<ReasonCode> },
    PingResp,
    Disconnect { reason: ReasonCode },
}

impl Packet {
    /// Short packet name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck { .. } => "PUBACK",
            Packet::PubRec { .. } => "PUBREC",
            Packet::PubRel { .. } => "PUBREL",
            Packet::PubComp { .. } => "PUBCOMP",
            Packet::SubAck { .. } => "SUBACK",
            Packet::UnsubAck { .. } => "UNSUBACK",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect { .. } => "DISCONNECT",
        }
    }

    /// Packet identifier, when the packet carries one.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(p) if p.qos != QoS::AtMostOnce => Some(p.packet_id),
            Packet::PubAck { packet_id, .. }
            | Packet::PubRec { packet_id, .. }
            | Packet::PubRel { packet_id, .. }
            | Packet::PubComp { packet_id, .. }
            | Packet::SubAck { packet_id, .. }
            | Packet::UnsubAck { packet_id, .. } => Some(*packet_id),
            _ => None,
        }
    }
}

/// Inbound SUBSCRIBE, already decoded by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub subscription_id: Option<u32>,
    pub topics: Vec<(String, SubscriptionOptions)>,
}

/// Inbound UNSUBSCRIBE.
#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// Inbound DISCONNECT.
#[derive(Debug, Clone, PartialEq)]
pub struct Disconnect {
    pub reason: ReasonCode,
    /// Session expiry override (MQTT 5.0).
    pub session_expiry: Option<u32>,
}
