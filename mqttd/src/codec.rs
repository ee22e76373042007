//! Packet codec.
//!
//! Maps broker packets to MQTT 3.1/3.1.1 (v4) and MQTT 5.0 (v5) wire frames,
//! reusing rumqttc's `mqttbytes` implementation for the byte layout.

use bytes::{Bytes, BytesMut};
use chrono::Utc;

use crate::error::{Error, Result};
use crate::packet::{ConnAck, ConnAckProperties, Packet, ReasonCode};
use crate::types::{ProtocolVersion, Publish, QoS};

/// Maximum packet size allowed by the protocol (256MB - 1).
pub const MAX_PACKET_SIZE: u32 = 268_435_455;

/// Encodes, decodes and sizes protocol packets.
pub trait Codec: Send + Sync {
    /// Encode a packet into a complete wire frame.
    fn encode(&self, version: ProtocolVersion, packet: &Packet) -> Result<Bytes>;

    /// Decode one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete frame.
    fn decode(&self, version: ProtocolVersion, buf: &mut BytesMut) -> Result<Option<Packet>>;

    /// Encoded size of a packet in bytes.
    fn size(&self, version: ProtocolVersion, packet: &Packet) -> Result<usize> {
        Ok(self.encode(version, packet)?.len())
    }
}

/// Default codec backed by rumqttc.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec;

impl Codec for WireCodec {
    fn encode(&self, version: ProtocolVersion, packet: &Packet) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        if version.is_v5() {
            let packet = v5::from_packet(packet);
            buf.reserve(packet.size());
            packet.write(&mut buf, Some(MAX_PACKET_SIZE))?;
        } else {
            let packet = v4::from_packet(packet);
            buf.reserve(packet.size());
            packet.write(&mut buf, MAX_PACKET_SIZE as usize)?;
        }
        Ok(buf.freeze())
    }

    fn decode(&self, version: ProtocolVersion, buf: &mut BytesMut) -> Result<Option<Packet>> {
        if buf.is_empty() {
            return Ok(None);
        }
        if version.is_v5() {
            match v5::Packet::read(buf, Some(MAX_PACKET_SIZE)) {
                Ok(packet) => v5::to_packet(packet).map(Some),
                Err(rumqttc::v5::mqttbytes::Error::InsufficientBytes(_)) => Ok(None),
                Err(e) => Err(e.into()),
            }
        } else {
            match v4::Packet::read(buf, MAX_PACKET_SIZE as usize) {
                Ok(packet) => v4::to_packet(packet).map(Some),
                Err(rumqttc::mqttbytes::Error::InsufficientBytes(_)) => Ok(None),
                Err(e) => Err(e.into()),
            }
        }
    }
}

/// Decode a single complete frame, failing if it is truncated.
pub(crate) fn decode_frame(
    codec: &dyn Codec,
    version: ProtocolVersion,
    data: &[u8],
) -> Result<Packet> {
    let mut buf = BytesMut::from(data);
    codec
        .decode(version, &mut buf)?
        .ok_or_else(|| Error::Codec("truncated packet".into()))
}

// ============================================================================
// V4 (MQTT 3.1 / 3.1.1)
// ============================================================================

mod v4 {
    use super::{Error, QoS, ReasonCode, Result};
    pub use rumqttc::mqttbytes::v4::*;

    pub fn from_packet(packet: &super::Packet) -> Packet {
        match packet {
            super::Packet::ConnAck(ack) => {
                Packet::ConnAck(ConnAck::new(connect_code(ack.code), ack.session_present))
            }
            super::Packet::Publish(p) => {
                let mut publish = Publish::new(p.topic.as_str(), p.qos.into(), p.payload.to_vec());
                publish.dup = p.dup;
                publish.retain = p.retain;
                publish.pkid = p.packet_id;
                Packet::Publish(publish)
            }
            super::Packet::PubAck { packet_id, .. } => Packet::PubAck(PubAck::new(*packet_id)),
            super::Packet::PubRec { packet_id, .. } => Packet::PubRec(PubRec::new(*packet_id)),
            super::Packet::PubRel { packet_id, .. } => Packet::PubRel(PubRel::new(*packet_id)),
            super::Packet::PubComp { packet_id, .. } => Packet::PubComp(PubComp::new(*packet_id)),
            super::Packet::SubAck { packet_id, codes } => {
                let codes = codes
                    .iter()
                    .map(|code| match code {
                        ReasonCode::Success => SubscribeReasonCode::Success(QoS::AtMostOnce.into()),
                        ReasonCode::GrantedQoS1 => {
                            SubscribeReasonCode::Success(QoS::AtLeastOnce.into())
                        }
                        ReasonCode::GrantedQoS2 => {
                            SubscribeReasonCode::Success(QoS::ExactlyOnce.into())
                        }
                        _ => SubscribeReasonCode::Failure,
                    })
                    .collect();
                Packet::SubAck(SubAck::new(*packet_id, codes))
            }
            super::Packet::UnsubAck { packet_id, .. } => Packet::UnsubAck(UnsubAck::new(*packet_id)),
            super::Packet::PingResp => Packet::PingResp,
            super::Packet::Disconnect { .. } => Packet::Disconnect,
        }
    }

    pub fn to_packet(packet: Packet) -> Result<super::Packet> {
        let out = match packet {
            Packet::ConnAck(ack) => super::Packet::ConnAck(super::ConnAck {
                session_present: ack.session_present,
                code: match ack.code {
                    ConnectReturnCode::Success => ReasonCode::Success,
                    ConnectReturnCode::RefusedProtocolVersion => ReasonCode::RefusedProtocolVersion,
                    ConnectReturnCode::BadClientId => ReasonCode::RefusedIdentifierRejected,
                    ConnectReturnCode::ServiceUnavailable => ReasonCode::RefusedServerUnavailable,
                    ConnectReturnCode::BadUserNamePassword => {
                        ReasonCode::RefusedBadUsernameOrPassword
                    }
                    ConnectReturnCode::NotAuthorized => ReasonCode::RefusedNotAuthorized,
                },
                properties: None,
            }),
            Packet::Publish(p) => {
                let mut publish = super::Publish::new(p.topic, p.payload)
                    .with_qos(p.qos.into())
                    .with_retain(p.retain)
                    .with_packet_id(p.pkid);
                publish.dup = p.dup;
                super::Packet::Publish(publish)
            }
            Packet::PubAck(ack) => super::Packet::PubAck {
                packet_id: ack.pkid,
                reason: ReasonCode::Success,
            },
            Packet::PubRec(rec) => super::Packet::PubRec {
                packet_id: rec.pkid,
                reason: ReasonCode::Success,
            },
            Packet::PubRel(rel) => super::Packet::PubRel {
                packet_id: rel.pkid,
                reason: ReasonCode::Success,
            },
            Packet::PubComp(comp) => super::Packet::PubComp {
                packet_id: comp.pkid,
                reason: ReasonCode::Success,
            },
            Packet::SubAck(ack) => super::Packet::SubAck {
                packet_id: ack.pkid,
                codes: ack
                    .return_codes
                    .into_iter()
                    .map(|code| match code {
                        SubscribeReasonCode::Success(qos) => ReasonCode::granted(qos.into()),
                        SubscribeReasonCode::Failure => ReasonCode::QosFailure,
                    })
                    .collect(),
            },
            Packet::UnsubAck(ack) => super::Packet::UnsubAck {
                packet_id: ack.pkid,
                codes: Vec::new(),
            },
            Packet::PingResp => super::Packet::PingResp,
            Packet::Disconnect => super::Packet::Disconnect {
                reason: ReasonCode::Success,
            },
            other => {
                return Err(Error::Codec(format!("unexpected v4 packet: {:?}", other)));
            }
        };
        Ok(out)
    }

    fn connect_code(code: ReasonCode) -> ConnectReturnCode {
        match code {
            ReasonCode::Success => ConnectReturnCode::Success,
            ReasonCode::RefusedProtocolVersion => ConnectReturnCode::RefusedProtocolVersion,
            ReasonCode::RefusedIdentifierRejected => ConnectReturnCode::BadClientId,
            ReasonCode::RefusedBadUsernameOrPassword => ConnectReturnCode::BadUserNamePassword,
            ReasonCode::RefusedNotAuthorized => ConnectReturnCode::NotAuthorized,
            _ => ConnectReturnCode::ServiceUnavailable,
        }
    }
}

// ============================================================================
// V5 (MQTT 5.0)
// ============================================================================

mod v5 {
    use super::{Bytes, Error, QoS, ReasonCode, Result, Utc};
    pub use rumqttc::v5::mqttbytes::v5::*;

    pub fn from_packet(packet: &super::Packet) -> Packet {
        match packet {
            super::Packet::ConnAck(ack) => Packet::ConnAck(ConnAck {
                session_present: ack.session_present,
                code: connect_code(ack.code),
                properties: ack.properties.as_ref().map(connack_properties),
            }),
            super::Packet::Publish(p) => Packet::Publish(publish(p)),
            super::Packet::PubAck { packet_id, reason } => Packet::PubAck(PubAck {
                pkid: *packet_id,
                reason: match reason {
                    ReasonCode::Success => PubAckReason::Success,
                    ReasonCode::NoMatchingSubscribers => PubAckReason::NoMatchingSubscribers,
                    ReasonCode::NotAuthorized => PubAckReason::NotAuthorized,
                    ReasonCode::TopicNameInvalid => PubAckReason::TopicNameInvalid,
                    ReasonCode::PacketIdInUse => PubAckReason::PacketIdentifierInUse,
                    ReasonCode::QuotaExceeded => PubAckReason::QuotaExceeded,
                    _ => PubAckReason::UnspecifiedError,
                },
                properties: None,
            }),
            super::Packet::PubRec { packet_id, reason } => Packet::PubRec(PubRec {
                pkid: *packet_id,
                reason: match reason {
                    ReasonCode::Success => PubRecReason::Success,
                    ReasonCode::NoMatchingSubscribers => PubRecReason::NoMatchingSubscribers,
                    ReasonCode::NotAuthorized => PubRecReason::NotAuthorized,
                    ReasonCode::TopicNameInvalid => PubRecReason::TopicNameInvalid,
                    ReasonCode::PacketIdInUse => PubRecReason::PacketIdentifierInUse,
                    ReasonCode::QuotaExceeded => PubRecReason::QuotaExceeded,
                    _ => PubRecReason::UnspecifiedError,
                },
                properties: None,
            }),
            super::Packet::PubRel { packet_id, reason } => Packet::PubRel(PubRel {
                pkid: *packet_id,
                reason: match reason {
                    ReasonCode::PacketIdNotFound => PubRelReason::PacketIdentifierNotFound,
                    _ => PubRelReason::Success,
                },
                properties: None,
            }),
            super::Packet::PubComp { packet_id, reason } => Packet::PubComp(PubComp {
                pkid: *packet_id,
                reason: match reason {
                    ReasonCode::PacketIdNotFound => PubCompReason::PacketIdentifierNotFound,
                    _ => PubCompReason::Success,
                },
                properties: None,
            }),
            super::Packet::SubAck { packet_id, codes } => Packet::SubAck(SubAck {
                pkid: *packet_id,
                return_codes: codes
                    .iter()
                    .map(|code| match code {
                        ReasonCode::Success => SubscribeReasonCode::Success(QoS::AtMostOnce.into()),
                        ReasonCode::GrantedQoS1 => {
                            SubscribeReasonCode::Success(QoS::AtLeastOnce.into())
                        }
                        ReasonCode::GrantedQoS2 => {
                            SubscribeReasonCode::Success(QoS::ExactlyOnce.into())
                        }
                        ReasonCode::NotAuthorized => SubscribeReasonCode::NotAuthorized,
                        _ => SubscribeReasonCode::Unspecified,
                    })
                    .collect(),
                properties: None,
            }),
            super::Packet::UnsubAck { packet_id, codes } => Packet::UnsubAck(UnsubAck {
                pkid: *packet_id,
                reasons: codes
                    .iter()
                    .map(|code| match code {
                        ReasonCode::Success => UnsubAckReason::Success,
                        ReasonCode::NoSubscriptionExisted => UnsubAckReason::NoSubscriptionExisted,
                        ReasonCode::NotAuthorized => UnsubAckReason::NotAuthorized,
                        _ => UnsubAckReason::UnspecifiedError,
                    })
                    .collect(),
                properties: None,
            }),
            super::Packet::PingResp => Packet::PingResp(PingResp),
            super::Packet::Disconnect { reason } => Packet::Disconnect(Disconnect {
                reason_code: disconnect_code(*reason),
                properties: None,
            }),
        }
    }

    fn publish(p: &super::Publish) -> Publish {
        let mut properties = PublishProperties::default();
        let mut has_properties = false;
        if let Some(ttl) = p.remaining_ttl(Utc::now()) {
            properties.message_expiry_interval = Some(ttl);
            has_properties = true;
        }
        if let Some(alias) = p.topic_alias {
            properties.topic_alias = Some(alias);
            has_properties = true;
        }
        if !p.subscription_ids.is_empty() {
            properties.subscription_identifiers =
                p.subscription_ids.iter().map(|id| *id as usize).collect();
            has_properties = true;
        }
        Publish {
            dup: p.dup,
            qos: p.qos.into(),
            retain: p.retain,
            topic: Bytes::copy_from_slice(p.topic.as_bytes()),
            pkid: p.packet_id,
            payload: p.payload.clone(),
            properties: has_properties.then_some(properties),
        }
    }

    fn connack_properties(props: &super::ConnAckProperties) -> ConnAckProperties {
        let flag = |v: Option<bool>| v.map(u8::from);
        ConnAckProperties {
            session_expiry_interval: props.session_expiry,
            receive_max: props.receive_max,
            max_qos: props.max_qos,
            retain_available: flag(props.retain_available),
            max_packet_size: props.max_packet_size,
            assigned_client_identifier: props.assigned_client_id.clone(),
            topic_alias_max: props.topic_alias_max,
            reason_string: None,
            user_properties: Vec::new(),
            wildcard_subscription_available: flag(props.wildcard_available),
            subscription_identifiers_available: flag(props.subscription_ids_available),
            shared_subscription_available: flag(props.shared_available),
            server_keep_alive: props.server_keep_alive,
            response_information: None,
            server_reference: None,
            authentication_method: None,
            authentication_data: None,
        }
    }

    pub fn to_packet(packet: Packet) -> Result<super::Packet> {
        let out = match packet {
            Packet::ConnAck(ack) => super::Packet::ConnAck(super::ConnAck {
                session_present: ack.session_present,
                code: match ack.code {
                    ConnectReturnCode::Success => ReasonCode::Success,
                    ConnectReturnCode::UnsupportedProtocolVersion => {
                        ReasonCode::UnsupportedProtocolVersion
                    }
                    ConnectReturnCode::ClientIdentifierNotValid => ReasonCode::InvalidClientId,
                    ConnectReturnCode::BadUserNamePassword => ReasonCode::BadUserNameOrPassword,
                    ConnectReturnCode::NotAuthorized => ReasonCode::NotAuthorized,
                    ConnectReturnCode::ServerUnavailable => ReasonCode::ServerUnavailable,
                    ConnectReturnCode::ServerBusy => ReasonCode::ServerBusy,
                    ConnectReturnCode::BadAuthenticationMethod => {
                        ReasonCode::BadAuthenticationMethod
                    }
                    ConnectReturnCode::ProtocolError => ReasonCode::ProtocolError,
                    _ => ReasonCode::UnspecifiedError,
                },
                properties: ack.properties.map(|p| super::ConnAckProperties {
                    session_expiry: p.session_expiry_interval,
                    receive_max: p.receive_max,
                    max_qos: p.max_qos,
                    retain_available: p.retain_available.map(|v| v != 0),
                    max_packet_size: p.max_packet_size,
                    assigned_client_id: p.assigned_client_identifier,
                    topic_alias_max: p.topic_alias_max,
                    wildcard_available: p.wildcard_subscription_available.map(|v| v != 0),
                    subscription_ids_available: p
                        .subscription_identifiers_available
                        .map(|v| v != 0),
                    shared_available: p.shared_subscription_available.map(|v| v != 0),
                    server_keep_alive: p.server_keep_alive,
                }),
            }),
            Packet::Publish(p) => {
                let topic = String::from_utf8(p.topic.to_vec())
                    .map_err(|e| Error::Codec(format!("topic is not utf-8: {}", e)))?;
                let mut publish = super::Publish::new(topic, p.payload)
                    .with_qos(p.qos.into())
                    .with_retain(p.retain)
                    .with_packet_id(p.pkid);
                publish.dup = p.dup;
                if let Some(props) = p.properties {
                    publish.topic_alias = props.topic_alias;
                    publish.expire_at = props
                        .message_expiry_interval
                        .map(|secs| Utc::now() + chrono::Duration::seconds(i64::from(secs)));
                    publish.subscription_ids = props
                        .subscription_identifiers
                        .into_iter()
                        .map(|id| id as u32)
                        .collect();
                }
                super::Packet::Publish(publish)
            }
            Packet::PubAck(ack) => super::Packet::PubAck {
                packet_id: ack.pkid,
                reason: match ack.reason {
                    PubAckReason::Success => ReasonCode::Success,
                    PubAckReason::NoMatchingSubscribers => ReasonCode::NoMatchingSubscribers,
                    PubAckReason::NotAuthorized => ReasonCode::NotAuthorized,
                    _ => ReasonCode::UnspecifiedError,
                },
            },
            Packet::PubRec(rec) => super::Packet::PubRec {
                packet_id: rec.pkid,
                reason: match rec.reason {
                    PubRecReason::Success => ReasonCode::Success,
                    PubRecReason::NoMatchingSubscribers => ReasonCode::NoMatchingSubscribers,
                    PubRecReason::NotAuthorized => ReasonCode::NotAuthorized,
                    _ => ReasonCode::UnspecifiedError,
                },
            },
            Packet::PubRel(rel) => super::Packet::PubRel {
                packet_id: rel.pkid,
                reason: match rel.reason {
                    PubRelReason::PacketIdentifierNotFound => ReasonCode::PacketIdNotFound,
                    _ => ReasonCode::Success,
                },
            },
            Packet::PubComp(comp) => super::Packet::PubComp {
                packet_id: comp.pkid,
                reason: match comp.reason {
                    PubCompReason::PacketIdentifierNotFound => ReasonCode::PacketIdNotFound,
                    _ => ReasonCode::Success,
                },
            },
            Packet::SubAck(ack) => super::Packet::SubAck {
                packet_id: ack.pkid,
                codes: ack
                    .return_codes
                    .into_iter()
                    .map(|code| match code {
                        SubscribeReasonCode::Success(qos) => ReasonCode::granted(qos.into()),
                        SubscribeReasonCode::NotAuthorized => ReasonCode::NotAuthorized,
                        _ => ReasonCode::UnspecifiedError,
                    })
                    .collect(),
            },
            Packet::UnsubAck(ack) => super::Packet::UnsubAck {
                packet_id: ack.pkid,
                codes: ack
                    .reasons
                    .into_iter()
                    .map(|reason| match reason {
                        UnsubAckReason::Success => ReasonCode::Success,
                        UnsubAckReason::NoSubscriptionExisted => ReasonCode::NoSubscriptionExisted,
                        UnsubAckReason::NotAuthorized => ReasonCode::NotAuthorized,
                        _ => ReasonCode::UnspecifiedError,
                    })
                    .collect(),
            },
            Packet::PingResp(_) => super::Packet::PingResp,
            Packet::Disconnect(d) => super::Packet::Disconnect {
                reason: match d.reason_code {
                    DisconnectReasonCode::NormalDisconnection => ReasonCode::Success,
                    DisconnectReasonCode::DisconnectWithWillMessage => {
                        ReasonCode::DisconnectWithWill
                    }
                    DisconnectReasonCode::ProtocolError => ReasonCode::ProtocolError,
                    DisconnectReasonCode::NotAuthorized => ReasonCode::NotAuthorized,
                    DisconnectReasonCode::ServerShuttingDown => ReasonCode::ServerShuttingDown,
                    DisconnectReasonCode::KeepAliveTimeout => ReasonCode::KeepAliveTimeout,
                    DisconnectReasonCode::SessionTakenOver => ReasonCode::SessionTakenOver,
                    DisconnectReasonCode::PacketTooLarge => ReasonCode::PacketTooLarge,
                    _ => ReasonCode::UnspecifiedError,
                },
            },
            other => {
                return Err(Error::Codec(format!("unexpected v5 packet: {:?}", other)));
            }
        };
        Ok(out)
    }

    fn connect_code(code: ReasonCode) -> ConnectReturnCode {
        match code {
            ReasonCode::Success => ConnectReturnCode::Success,
            ReasonCode::UnsupportedProtocolVersion => ConnectReturnCode::UnsupportedProtocolVersion,
            ReasonCode::InvalidClientId => ConnectReturnCode::ClientIdentifierNotValid,
            ReasonCode::BadUserNameOrPassword => ConnectReturnCode::BadUserNamePassword,
            ReasonCode::NotAuthorized => ConnectReturnCode::NotAuthorized,
            ReasonCode::ServerUnavailable => ConnectReturnCode::ServerUnavailable,
            ReasonCode::ServerBusy => ConnectReturnCode::ServerBusy,
            ReasonCode::BadAuthenticationMethod => ConnectReturnCode::BadAuthenticationMethod,
            ReasonCode::ProtocolError => ConnectReturnCode::ProtocolError,
            _ => ConnectReturnCode::UnspecifiedError,
        }
    }

    fn disconnect_code(code: ReasonCode) -> DisconnectReasonCode {
        match code {
            ReasonCode::Success => DisconnectReasonCode::NormalDisconnection,
            ReasonCode::DisconnectWithWill => DisconnectReasonCode::DisconnectWithWillMessage,
            ReasonCode::MalformedPacket => DisconnectReasonCode::MalformedPacket,
            ReasonCode::ProtocolError => DisconnectReasonCode::ProtocolError,
            ReasonCode::NotAuthorized => DisconnectReasonCode::NotAuthorized,
            ReasonCode::ServerBusy => DisconnectReasonCode::ServerBusy,
            ReasonCode::ServerShuttingDown => DisconnectReasonCode::ServerShuttingDown,
            ReasonCode::KeepAliveTimeout => DisconnectReasonCode::KeepAliveTimeout,
            ReasonCode::SessionTakenOver => DisconnectReasonCode::SessionTakenOver,
            ReasonCode::PacketTooLarge => DisconnectReasonCode::PacketTooLarge,
            ReasonCode::QuotaExceeded => DisconnectReasonCode::QuotaExceeded,
            ReasonCode::ReceiveMaximumExceeded => DisconnectReasonCode::ReceiveMaximumExceeded,
            _ => DisconnectReasonCode::UnspecifiedError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(version: ProtocolVersion, packet: Packet) -> Packet {
        let codec = WireCodec;
        let bytes = codec.encode(version, &packet).unwrap();
        decode_frame(&codec, version, &bytes).unwrap()
    }

    #[test]
    fn test_publish_v4() {
        let publish = Publish::new("a/b", &b"hello"[..])
            .with_qos(QoS::AtLeastOnce)
            .with_packet_id(7);
        match roundtrip(ProtocolVersion::V311, Packet::Publish(publish)) {
            Packet::Publish(p) => {
                assert_eq!(p.topic, "a/b");
                assert_eq!(p.payload.as_ref(), b"hello");
                assert_eq!(p.packet_id, 7);
                assert_eq!(p.qos, QoS::AtLeastOnce);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_publish_v5_alias_without_topic() {
        let mut publish = Publish::new("", &b"x"[..]);
        publish.topic_alias = Some(3);
        match roundtrip(ProtocolVersion::V5, Packet::Publish(publish)) {
            Packet::Publish(p) => {
                assert!(p.topic.is_empty());
                assert_eq!(p.topic_alias, Some(3));
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_connack_v4_bad_credentials() {
        let ack = Packet::ConnAck(ConnAck {
            session_present: false,
            code: ReasonCode::RefusedBadUsernameOrPassword,
            properties: None,
        });
        let bytes = WireCodec.encode(ProtocolVersion::V311, &ack).unwrap();
        assert_eq!(bytes.as_ref(), &[0x20, 0x02, 0x00, 0x04]);
    }

    #[test]
    fn test_connack_v5_properties() {
        let ack = Packet::ConnAck(ConnAck {
            session_present: true,
            code: ReasonCode::Success,
            properties: Some(ConnAckProperties {
                session_expiry: Some(300),
                receive_max: Some(20),
                retain_available: Some(false),
                assigned_client_id: Some("auto-1".into()),
                topic_alias_max: Some(10),
                ..Default::default()
            }),
        });
        assert_eq!(roundtrip(ProtocolVersion::V5, ack.clone()), ack);
    }

    #[test]
    fn test_decode_partial_frame() {
        let bytes = WireCodec
            .encode(ProtocolVersion::V5, &Packet::PubAck { packet_id: 1, reason: ReasonCode::Success })
            .unwrap();
        let mut buf = BytesMut::from(&bytes[..bytes.len() - 1]);
        assert!(WireCodec.decode(ProtocolVersion::V5, &mut buf).unwrap().is_none());
    }

    #[test]
    fn test_suback_v5() {
        let packet = Packet::SubAck {
            packet_id: 9,
            codes: vec![ReasonCode::GrantedQoS1, ReasonCode::NotAuthorized],
        };
        assert_eq!(roundtrip(ProtocolVersion::V5, packet.clone()), packet);
    }
}
