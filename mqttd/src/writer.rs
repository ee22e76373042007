//! Outbound pipeline.
//!
//! Every byte written to a client goes through one [`Writer`]. Producers push
//! into three queues (control, QoS 0, QoS 1/2); a delivery task drains them
//! one cycle at a time and exits as soon as a cycle finds nothing to send.
//! The next producer restarts it.
//!
//! A cycle writes all queued control packets, then at most one QoS 1/2
//! publish if the flow window has quota, then at most one QoS 0 publish.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::codec::{self, Codec};
use crate::connection::{BoxedSink, Connection};
use crate::error::{Error, Result};
use crate::flow::FlowWindow;
use crate::metrics::Metrics;
use crate::packet::{Packet, ReasonCode};
use crate::persistence::{PersistedPacket, PersistedPackets, Persistence};
use crate::types::{MAX_PACKET_ID, ProtocolVersion, Publish, QoS};

/// Per-connection pipeline settings.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub id: String,
    pub version: ProtocolVersion,
    /// Client Receive Maximum.
    pub quota: u16,
    /// Client Maximum Packet Size.
    pub max_packet_size: u32,
    /// Topic aliases the client accepts; 0 disables aliasing.
    pub topic_alias_max: u16,
    /// Snapshot QoS 0 messages on stop.
    pub offline_qos0: bool,
}

/// Collaborators a writer talks to.
#[derive(Clone)]
pub struct WriterDeps {
    pub codec: Arc<dyn Codec>,
    pub conn: Arc<dyn Connection>,
    pub persistence: Arc<dyn Persistence>,
    pub metrics: Arc<dyn Metrics>,
}

/// Outbound pipeline of one connection.
pub struct Writer {
    inner: Arc<Inner>,
}

struct Inner {
    config: WriterConfig,
    deps: WriterDeps,
    sink: tokio::sync::Mutex<BoxedSink>,
    queues: Mutex<Queues>,
    flow: FlowWindow,
    running: AtomicBool,
    alive: AtomicBool,
    tracker: TaskTracker,
    seq: AtomicU64,
}

#[derive(Default)]
struct Queues {
    control: VecDeque<Packet>,
    qos0: VecDeque<Publish>,
    qos12: VecDeque<Outbound>,
    in_flight: HashMap<u16, InFlight>,
    aliases: TopicAliases,
}

/// Entry of the QoS 1/2 queue.
enum Outbound {
    /// Needs a packet identifier from the flow window.
    Fresh(Publish),
    /// Restored from persistence with its identifier already re-claimed.
    Replay(Packet),
}

struct InFlight {
    seq: u64,
    packet: Packet,
}

/// Topic to alias table with a high-water mark.
#[derive(Default)]
struct TopicAliases {
    max: u16,
    next: u16,
    by_topic: HashMap<String, u16>,
    by_alias: HashMap<u16, String>,
}

impl TopicAliases {
    fn new(max: u16) -> Self {
        Self {
            max,
            ..Default::default()
        }
    }

    /// Alias for `topic` and whether the client already knows it.
    ///
    /// A new alias is only recorded by [`commit`](Self::commit), once the
    /// packet announcing it is on its way to the client.
    fn assign(&self, topic: &str) -> Option<(u16, bool)> {
        if self.max == 0 || topic.is_empty() {
            return None;
        }
        if let Some(alias) = self.by_topic.get(topic) {
            return Some((*alias, true));
        }
        let alias = if self.next < self.max {
            self.next + 1
        } else {
            rand::thread_rng().gen_range(1..=self.max)
        };
        Some((alias, false))
    }

    fn commit(&mut self, topic: &str, alias: u16) {
        self.next = self.next.max(alias);
        if let Some(old) = self.by_alias.insert(alias, topic.to_string()) {
            self.by_topic.remove(&old);
        }
        self.by_topic.insert(topic.to_string(), alias);
    }
}

impl Writer {
    pub fn new(config: WriterConfig, deps: WriterDeps, sink: BoxedSink) -> Self {
        let aliases = if config.version.is_v5() {
            TopicAliases::new(config.topic_alias_max)
        } else {
            TopicAliases::new(0)
        };
        let flow = FlowWindow::new(config.quota);
        Self {
            inner: Arc::new(Inner {
                config,
                deps,
                sink: tokio::sync::Mutex::new(sink),
                queues: Mutex::new(Queues {
                    aliases,
                    ..Default::default()
                }),
                flow,
                running: AtomicBool::new(false),
                alive: AtomicBool::new(true),
                tracker: TaskTracker::new(),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Load persisted packets (when restoring a session) and start delivering.
    pub fn start(&self, restore: bool) {
        if restore {
            self.inner.load_persisted();
        }
        self.inner.kick();
    }

    /// Pick up packets persisted after the writer started.
    pub fn reload(&self) {
        self.inner.load_persisted();
        self.inner.kick();
    }

    /// Wait until everything queued so far has been written.
    pub async fn flush(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    /// Queue a control packet.
    pub fn send(&self, packet: Packet) -> Result<()> {
        if !self.inner.alive.load(Ordering::Acquire) {
            return Err(Error::WriterStopped);
        }
        self.inner.queues.lock().control.push_back(packet);
        self.inner.kick();
        Ok(())
    }

    /// Queue an application message.
    pub fn publish(&self, mut publish: Publish) -> Result<()> {
        if !self.inner.alive.load(Ordering::Acquire) {
            return Err(Error::WriterStopped);
        }
        publish.packet_id = 0;
        publish.topic_alias = None;
        {
            let mut queues = self.inner.queues.lock();
            if publish.qos == QoS::AtMostOnce {
                queues.qos0.push_back(publish);
            } else {
                queues.qos12.push_back(Outbound::Fresh(publish));
            }
        }
        self.inner.kick();
        Ok(())
    }

    /// PUBACK from the client.
    pub fn ack(&self, packet_id: u16) -> bool {
        let removed = {
            let mut queues = self.inner.queues.lock();
            let awaiting = matches!(
                queues.in_flight.get(&packet_id),
                Some(InFlight { packet: Packet::Publish(p), .. }) if p.qos == QoS::AtLeastOnce
            );
            awaiting && queues.in_flight.remove(&packet_id).is_some()
        };
        if removed {
            self.inner.flow.release(packet_id);
            self.inner.kick();
        } else {
            debug!("Client {} acked unknown packet {}", self.inner.config.id, packet_id);
        }
        removed
    }

    /// PUBREC from the client. Answers with PUBREL.
    pub fn received(&self, packet_id: u16) -> bool {
        let known = {
            let mut queues = self.inner.queues.lock();
            let known = match queues.in_flight.get_mut(&packet_id) {
                Some(entry) => {
                    let upgrade =
                        matches!(&entry.packet, Packet::Publish(p) if p.qos == QoS::ExactlyOnce);
                    if upgrade {
                        entry.packet = Packet::PubRel {
                            packet_id,
                            reason: ReasonCode::Success,
                        };
                    }
                    upgrade || matches!(entry.packet, Packet::PubRel { .. })
                }
                None => false,
            };
            let reason = if known {
                ReasonCode::Success
            } else {
                ReasonCode::PacketIdNotFound
            };
            queues.control.push_back(Packet::PubRel { packet_id, reason });
            known
        };
        self.inner.kick();
        known
    }

    /// PUBCOMP from the client.
    pub fn completed(&self, packet_id: u16) -> bool {
        let removed = {
            let mut queues = self.inner.queues.lock();
            let awaiting = matches!(
                queues.in_flight.get(&packet_id),
                Some(InFlight { packet: Packet::PubRel { .. }, .. })
            );
            awaiting && queues.in_flight.remove(&packet_id).is_some()
        };
        if removed {
            self.inner.flow.release(packet_id);
            self.inner.kick();
        }
        removed
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Number of packets awaiting acknowledgment.
    pub fn in_flight(&self) -> usize {
        self.inner.queues.lock().in_flight.len()
    }

    /// Number of queued packets per class, as (control, qos0, qos12).
    pub fn queued(&self) -> (usize, usize, usize) {
        let queues = self.inner.queues.lock();
        (queues.control.len(), queues.qos0.len(), queues.qos12.len())
    }

    /// Stop delivering, wait for the running cycle and snapshot what is left.
    pub async fn stop(&self) -> PersistedPackets {
        self.inner.alive.store(false, Ordering::Release);
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        if let Err(e) = self.inner.sink.lock().await.shutdown().await {
            trace!("Client {} sink shutdown: {}", self.inner.config.id, e);
        }
        self.inner.snapshot()
    }
}

impl Inner {
    fn kick(self: &Arc<Self>) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let inner = Arc::clone(self);
            self.tracker.spawn(async move { inner.routine().await });
        }
    }

    async fn routine(self: Arc<Self>) {
        loop {
            let frames = self.pop_packets();
            if frames.is_empty() {
                self.running.store(false, Ordering::Release);
                // A producer may have queued work after the pop but before
                // `running` was cleared; its kick was coalesced into us.
                if self.has_work()
                    && self
                        .running
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    continue;
                }
                return;
            }
            if let Err(e) = self.write(frames).await {
                warn!("Client {} write failed: {}", self.config.id, e);
                self.alive.store(false, Ordering::Release);
                self.running.store(false, Ordering::Release);
                self.deps.conn.stop(ReasonCode::UnspecifiedError);
                return;
            }
        }
    }

    fn has_work(&self) -> bool {
        if !self.alive.load(Ordering::Acquire) {
            return false;
        }
        let queues = self.queues.lock();
        !queues.control.is_empty()
            || !queues.qos0.is_empty()
            || matches!(queues.qos12.front(), Some(Outbound::Replay(_)))
            || (!queues.qos12.is_empty() && self.flow.quota_available())
    }

    /// One delivery cycle worth of encoded frames.
    fn pop_packets(&self) -> Vec<(&'static str, Bytes)> {
        let mut frames = Vec::new();
        let mut queues = self.queues.lock();
        if !self.alive.load(Ordering::Acquire) {
            return frames;
        }
        let now = Utc::now();

        while let Some(packet) = queues.control.pop_front() {
            if let Some(frame) = self.encode(&packet) {
                frames.push((packet.kind(), frame));
            }
        }

        while let Some(front) = queues.qos12.front() {
            if matches!(front, Outbound::Fresh(_)) && !self.flow.quota_available() {
                break;
            }
            let Some(entry) = queues.qos12.pop_front() else {
                break;
            };
            let packet = match entry {
                Outbound::Fresh(publish) => {
                    if publish.expired(now) {
                        trace!("Client {} dropped expired message on {}", self.config.id, publish.topic);
                        continue;
                    }
                    let Some(id) = self.flow.acquire() else {
                        queues.qos12.push_front(Outbound::Fresh(publish));
                        break;
                    };
                    Packet::Publish(publish.with_packet_id(id))
                }
                Outbound::Replay(packet) => {
                    if let Packet::Publish(p) = &packet
                        && p.expired(now)
                    {
                        self.flow.release(p.packet_id);
                        continue;
                    }
                    packet
                }
            };

            let Some(id) = packet.packet_id() else {
                continue;
            };
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let (outgoing, announced) = match &packet {
                Packet::Publish(p) => {
                    let (p, announced) = alias(&queues.aliases, p.clone());
                    (Packet::Publish(p), announced)
                }
                other => (other.clone(), None),
            };
            queues.in_flight.insert(id, InFlight { seq, packet });
            match self.encode(&outgoing) {
                Some(frame) => {
                    if let (Packet::Publish(p), Some(alias)) = (&outgoing, announced) {
                        queues.aliases.commit(&p.topic, alias);
                    }
                    frames.push((outgoing.kind(), frame));
                }
                None => {
                    queues.in_flight.remove(&id);
                    self.flow.release(id);
                }
            }
            break;
        }

        while let Some(publish) = queues.qos0.pop_front() {
            if publish.expired(now) {
                continue;
            }
            let (publish, announced) = alias(&queues.aliases, publish);
            let outgoing = Packet::Publish(publish);
            if let Some(frame) = self.encode(&outgoing) {
                if let (Packet::Publish(p), Some(alias)) = (&outgoing, announced) {
                    queues.aliases.commit(&p.topic, alias);
                }
                frames.push((outgoing.kind(), frame));
            }
            break;
        }

        frames
    }

    /// Encode a packet, dropping it if it exceeds the client's maximum size.
    fn encode(&self, packet: &Packet) -> Option<Bytes> {
        match self.deps.codec.encode(self.config.version, packet) {
            Ok(frame) if frame.len() > self.config.max_packet_size as usize => {
                debug!(
                    "Client {} dropped {}: {}",
                    self.config.id,
                    packet.kind(),
                    Error::PacketTooLarge {
                        size: frame.len(),
                        max: self.config.max_packet_size
                    }
                );
                None
            }
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("Client {} failed to encode {}: {}", self.config.id, packet.kind(), e);
                None
            }
        }
    }

    async fn write(&self, frames: Vec<(&'static str, Bytes)>) -> Result<()> {
        let mut sink = self.sink.lock().await;
        let mut total = 0;
        for (_, frame) in &frames {
            sink.write_all(frame).await?;
            total += frame.len();
        }
        sink.flush().await?;
        drop(sink);

        for (kind, _) in &frames {
            self.deps.metrics.packet_sent(*kind);
        }
        self.deps.metrics.bytes_sent(&self.config.id, total);
        Ok(())
    }

    fn load_persisted(&self) {
        let id = &self.config.id;
        let persistence = &self.deps.persistence;
        let mut budget = usize::from(MAX_PACKET_ID);
        let mut queues = self.queues.lock();

        // Unacknowledged first so their identifiers are taken before any new allocation.
        let result = persistence.packets_for_each_unack(id, &mut |entry| {
            if budget == 0 {
                return false;
            }
            match self.decode(entry) {
                Some(packet) => match packet.packet_id() {
                    Some(pid) if self.flow.re_acquire(pid) => {
                        queues.qos12.push_back(Outbound::Replay(packet));
                        budget -= 1;
                    }
                    // Identifier already taken by live traffic: send it again under a new one.
                    Some(_) if matches!(packet, Packet::Publish(_)) => {
                        if let Packet::Publish(mut p) = packet {
                            p.dup = true;
                            queues.qos12.push_back(Outbound::Fresh(p));
                            budget -= 1;
                        }
                    }
                    _ => warn!("Client {} dropped restored packet with bad id", id),
                },
                None => warn!("Client {} dropped undecodable unacked packet", id),
            }
            true
        });
        if let Err(e) = result {
            warn!("Client {} failed to load unacked packets: {}", id, e);
        }

        let result = persistence.packets_for_each_qos12(id, &mut |entry| {
            if budget == 0 {
                return false;
            }
            if let Some(Packet::Publish(p)) = self.decode(entry) {
                queues.qos12.push_back(Outbound::Fresh(p.with_packet_id(0)));
                budget -= 1;
            }
            true
        });
        if let Err(e) = result {
            warn!("Client {} failed to load queued packets: {}", id, e);
        }

        let result = persistence.packets_for_each_qos0(id, &mut |entry| {
            if budget == 0 {
                return false;
            }
            if let Some(Packet::Publish(p)) = self.decode(entry) {
                queues.qos0.push_back(p);
                budget -= 1;
            }
            true
        });
        if let Err(e) = result {
            warn!("Client {} failed to load queued QoS 0 packets: {}", id, e);
        }

        debug!(
            "Client {} restored {} unacked, {} queued, {} QoS 0 packets",
            id,
            self.flow.in_flight(),
            queues.qos12.len(),
            queues.qos0.len()
        );
    }

    fn decode(&self, entry: &PersistedPacket) -> Option<Packet> {
        match codec::decode_frame(self.deps.codec.as_ref(), self.config.version, &entry.data) {
            Ok(Packet::Publish(mut p)) => {
                p.expire_at = entry.expire_at;
                p.topic_alias = None;
                Some(Packet::Publish(p))
            }
            Ok(packet @ Packet::PubRel { .. }) => Some(packet),
            Ok(other) => {
                warn!("Client {} restored unexpected {}", self.config.id, other.kind());
                None
            }
            Err(e) => {
                warn!("Client {} failed to decode persisted packet: {}", self.config.id, e);
                None
            }
        }
    }

    fn persisted(&self, packet: &Packet) -> Option<PersistedPacket> {
        match persisted_packet(self.deps.codec.as_ref(), self.config.version, packet) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Client {} failed to persist {}: {}", self.config.id, packet.kind(), e);
                None
            }
        }
    }

    fn snapshot(&self) -> PersistedPackets {
        let mut queues = self.queues.lock();
        let now = Utc::now();
        let mut out = PersistedPackets::default();

        let mut in_flight: Vec<InFlight> = queues.in_flight.drain().map(|(_, e)| e).collect();
        in_flight.sort_by_key(|e| e.seq);
        for entry in in_flight {
            let packet = match entry.packet {
                Packet::Publish(mut p) => {
                    p.dup = true;
                    Packet::Publish(p)
                }
                other => other,
            };
            out.unack.extend(self.persisted(&packet));
        }

        for entry in queues.qos12.drain(..) {
            match entry {
                Outbound::Replay(packet) => out.unack.extend(self.persisted(&packet)),
                Outbound::Fresh(p) if !p.expired(now) => {
                    out.qos12.extend(self.persisted(&Packet::Publish(p)))
                }
                Outbound::Fresh(_) => {}
            }
        }

        let qos0: Vec<Publish> = queues.qos0.drain(..).collect();
        if self.config.offline_qos0 {
            for p in qos0.into_iter().filter(|p| !p.expired(now)) {
                out.qos0.extend(self.persisted(&Packet::Publish(p)));
            }
        }
        queues.control.clear();
        out
    }
}

/// Apply the topic alias to an outbound publish. Returns the alias it
/// announces for the first time, to be committed once the frame is accepted.
fn alias(aliases: &TopicAliases, mut publish: Publish) -> (Publish, Option<u16>) {
    match aliases.assign(&publish.topic) {
        Some((alias, true)) => {
            publish.topic_alias = Some(alias);
            publish.topic.clear();
            (publish, None)
        }
        Some((alias, false)) => {
            publish.topic_alias = Some(alias);
            (publish, Some(alias))
        }
        None => (publish, None),
    }
}

/// Encode a packet in its persisted form.
///
/// QoS 1/2 publishes that were never assigned an identifier are written
/// with a placeholder one; restore hands them a fresh identifier.
pub(crate) fn persisted_packet(
    codec: &dyn Codec,
    version: ProtocolVersion,
    packet: &Packet,
) -> Result<PersistedPacket> {
    let (data, expire_at) = match packet {
        Packet::Publish(p) if p.qos != QoS::AtMostOnce && p.packet_id == 0 => {
            let placeholder = Packet::Publish(p.clone().with_packet_id(1));
            (codec.encode(version, &placeholder)?, p.expire_at)
        }
        Packet::Publish(p) => (codec.encode(version, packet)?, p.expire_at),
        _ => (codec.encode(version, packet)?, None),
    };
    Ok(PersistedPacket {
        data: data.to_vec(),
        expire_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assign(aliases: &mut TopicAliases, topic: &str) -> Option<(u16, bool)> {
        let assigned = aliases.assign(topic);
        if let Some((alias, false)) = assigned {
            aliases.commit(topic, alias);
        }
        assigned
    }

    #[test]
    fn test_alias_allocation_and_reuse() {
        let mut aliases = TopicAliases::new(2);
        assert_eq!(assign(&mut aliases, "a"), Some((1, false)));
        assert_eq!(assign(&mut aliases, "b"), Some((2, false)));
        assert_eq!(assign(&mut aliases, "a"), Some((1, true)));

        // table full: a random existing alias is handed to the new topic
        let (alias, known) = assign(&mut aliases, "c").unwrap();
        assert!(!known);
        assert!(alias == 1 || alias == 2);
        assert_eq!(aliases.by_topic.len(), 2);
        assert_eq!(aliases.by_alias.get(&alias).map(String::as_str), Some("c"));
        assert_eq!(assign(&mut aliases, "c"), Some((alias, true)));
    }

    #[test]
    fn test_alias_uncommitted_stays_unknown() {
        let mut aliases = TopicAliases::new(4);
        assert_eq!(aliases.assign("t/1"), Some((1, false)));
        // the announcing packet was dropped
        assert_eq!(aliases.assign("t/1"), Some((1, false)));
        assert!(aliases.by_topic.is_empty());

        aliases.commit("t/1", 1);
        assert_eq!(aliases.assign("t/2"), Some((2, false)));
        assert_eq!(aliases.assign("t/1"), Some((1, true)));
    }

    #[test]
    fn test_alias_disabled() {
        let aliases = TopicAliases::new(0);
        assert_eq!(aliases.assign("a"), None);
    }
}
