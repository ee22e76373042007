//! Subscription sets and their persisted blob format.
//!
//! Blob layout:
//!
//! ```text
//! [1 byte protocol level]
//! { [2 byte topic length][topic bytes][1 byte options][4 byte subscription id] }*
//! ```
//!
//! All integers are big-endian. Entries repeat until the buffer is exhausted.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::{ProtocolVersion, SubscriptionOptions};

/// One subscription of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub options: SubscriptionOptions,
    /// Subscription identifier (MQTT 5.0), zero if unset.
    pub id: u32,
}

/// Topic filter to subscription map that keeps insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscriptions {
    entries: Vec<(String, Subscription)>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the subscription for `topic`. Returns true if it is new.
    pub fn insert(&mut self, topic: impl Into<String>, sub: Subscription) -> bool {
        let topic = topic.into();
        match self.entries.iter_mut().find(|(t, _)| *t == topic) {
            Some((_, existing)) => {
                *existing = sub;
                false
            }
            None => {
                self.entries.push((topic, sub));
                true
            }
        }
    }

    pub fn remove(&mut self, topic: &str) -> Option<Subscription> {
        let idx = self.entries.iter().position(|(t, _)| t == topic)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn get(&self, topic: &str) -> Option<&Subscription> {
        self.entries.iter().find(|(t, _)| t == topic).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Subscription)> {
        self.entries.iter().map(|(t, s)| (t.as_str(), s))
    }
}

impl FromIterator<(String, Subscription)> for Subscriptions {
    fn from_iter<I: IntoIterator<Item = (String, Subscription)>>(iter: I) -> Self {
        let mut subs = Subscriptions::new();
        for (topic, sub) in iter {
            subs.insert(topic, sub);
        }
        subs
    }
}

/// Serialize a subscription set.
pub fn encode(version: ProtocolVersion, subs: &Subscriptions) -> Result<Bytes> {
    let size = 1 + subs
        .entries
        .iter()
        .map(|(t, _)| 2 + t.len() + 1 + 4)
        .sum::<usize>();
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u8(version.level());
    for (topic, sub) in &subs.entries {
        let len = u16::try_from(topic.len())
            .map_err(|_| Error::Subscriptions(format!("topic too long: {} bytes", topic.len())))?;
        buf.put_u16(len);
        buf.put_slice(topic.as_bytes());
        buf.put_u8(sub.options.0);
        buf.put_u32(sub.id);
    }
    Ok(buf.freeze())
}

/// Parse a subscription blob.
pub fn decode(mut data: &[u8]) -> Result<(ProtocolVersion, Subscriptions)> {
    if !data.has_remaining() {
        return Err(Error::Subscriptions("empty buffer".into()));
    }
    let level = data.get_u8();
    let version = ProtocolVersion::from_level(level)
        .ok_or_else(|| Error::Subscriptions(format!("unknown protocol level {}", level)))?;

    let mut subs = Subscriptions::new();
    while data.has_remaining() {
        if data.remaining() < 2 {
            return Err(Error::Subscriptions("truncated topic length".into()));
        }
        let len = usize::from(data.get_u16());
        if data.remaining() < len + 5 {
            return Err(Error::Subscriptions("truncated entry".into()));
        }
        let topic = std::str::from_utf8(&data[..len])
            .map_err(|e| Error::Subscriptions(format!("topic is not utf-8: {}", e)))?
            .to_string();
        data.advance(len);
        let options = SubscriptionOptions(data.get_u8());
        let id = data.get_u32();
        if !subs.insert(topic, Subscription { options, id }) {
            return Err(Error::Subscriptions("duplicate topic".into()));
        }
    }
    Ok((version, subs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QoS;

    fn sub(qos: QoS, id: u32) -> Subscription {
        Subscription {
            options: SubscriptionOptions::new(qos),
            id,
        }
    }

    #[test]
    fn test_blob_layout() {
        let mut subs = Subscriptions::new();
        subs.insert("a/b", sub(QoS::AtLeastOnce, 0x01020304));
        let blob = encode(ProtocolVersion::V5, &subs).unwrap();
        assert_eq!(
            blob.as_ref(),
            &[5, 0, 3, b'a', b'/', b'b', 1, 1, 2, 3, 4]
        );
    }

    #[test]
    fn test_blob_roundtrip_preserves_order() {
        let mut subs = Subscriptions::new();
        subs.insert("z/#", sub(QoS::ExactlyOnce, 7));
        subs.insert("a/+", sub(QoS::AtMostOnce, 0));
        subs.insert(
            "$share/g/t",
            Subscription {
                options: SubscriptionOptions::new(QoS::AtLeastOnce).with_retain_handling(2),
                id: u32::MAX,
            },
        );
        let blob = encode(ProtocolVersion::V311, &subs).unwrap();
        let (version, decoded) = decode(&blob).unwrap();
        assert_eq!(version, ProtocolVersion::V311);
        assert_eq!(decoded, subs);
        assert_eq!(encode(version, &decoded).unwrap(), blob);
    }

    #[test]
    fn test_blob_empty_set_and_max_topic() {
        let empty = encode(ProtocolVersion::V5, &Subscriptions::new()).unwrap();
        assert_eq!(empty.as_ref(), &[5]);
        assert!(decode(&empty).unwrap().1.is_empty());

        let long = "t".repeat(u16::MAX as usize);
        let mut subs = Subscriptions::new();
        subs.insert(long.clone(), sub(QoS::AtMostOnce, 1));
        let blob = encode(ProtocolVersion::V5, &subs).unwrap();
        let (_, decoded) = decode(&blob).unwrap();
        assert_eq!(decoded.get(&long), Some(&sub(QoS::AtMostOnce, 1)));

        subs.insert("t".repeat(u16::MAX as usize + 1), sub(QoS::AtMostOnce, 1));
        assert!(encode(ProtocolVersion::V5, &subs).is_err());
    }

    #[test]
    fn test_decode_rejects_corrupt_blobs() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[9]).is_err());
        assert!(decode(&[5, 0]).is_err());
        assert!(decode(&[5, 0, 3, b'a']).is_err());
        assert!(decode(&[5, 0, 1, b'a', 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut subs = Subscriptions::new();
        assert!(subs.insert("a", sub(QoS::AtMostOnce, 1)));
        assert!(subs.insert("b", sub(QoS::AtMostOnce, 2)));
        assert!(!subs.insert("a", sub(QoS::ExactlyOnce, 3)));
        let topics: Vec<_> = subs.iter().map(|(t, _)| t).collect();
        assert_eq!(topics, vec!["a", "b"]);
        assert_eq!(subs.remove("a").map(|s| s.id), Some(3));
        assert_eq!(subs.len(), 1);
    }
}
