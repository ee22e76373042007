//! Per-connection session.
//!
//! A [`Session`] turns packets decoded by the transport into router calls
//! and acknowledgments, and runs the disconnect sequence when the network
//! connection closes. It lives from the handshake until that sequence ends;
//! whatever must survive the connection (subscriber, queued packets,
//! expiry timer) is handed to the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, Once};
use tracing::{debug, info, warn};

use crate::auth::{Access, Permissions};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::expiry::{Expiry, ExpiryConfig};
use crate::packet::{ConnAck, Disconnect, Packet, ReasonCode, Subscribe, Unsubscribe};
use crate::persistence::PersistedPackets;
use crate::router::{PublishCallback, Subscriber, TopicRouter};
use crate::subscriptions::Subscription;
use crate::topic::{has_wildcard, parse_shared_topic};
use crate::types::{ProtocolVersion, Publish, QoS, Will};
use crate::writer::Writer;

/// Registry side of a session.
pub(crate) trait SessionEvents: Send + Sync {
    /// The network connection of `id` closed.
    fn connection_closed(&self, id: &str, reason: ReasonCode);

    /// Last step of the disconnect sequence. Runs container bookkeeping.
    fn session_offline(&self, session: &Arc<Session>, offline: Offline);

    /// An expiry timer ran out.
    fn session_timer(&self, expiry: &Arc<Expiry>);

    /// A message reached a session whose pipeline already stopped.
    fn offline_publish(&self, id: &str, version: ProtocolVersion, publish: Publish);
}

/// Outcome of the disconnect sequence.
pub(crate) struct Offline {
    pub(crate) reason: ReasonCode,
    /// Queued packets survive the connection.
    pub(crate) durable: bool,
    pub(crate) keep_subscriber: bool,
    pub(crate) packets: PersistedPackets,
    pub(crate) expiry: Option<ExpiryConfig>,
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    Connecting = 0,
    Active = 1,
    Disconnecting = 2,
    Offline = 3,
}

impl SessionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionStatus::Connecting,
            1 => SessionStatus::Active,
            2 => SessionStatus::Disconnecting,
            _ => SessionStatus::Offline,
        }
    }
}

/// Broker capabilities a session enforces.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub(crate) max_qos: QoS,
    pub(crate) retain: bool,
    pub(crate) wildcard: bool,
    pub(crate) shared: bool,
    pub(crate) subscription_ids: bool,
}

pub(crate) struct SessionConfig {
    pub(crate) id: String,
    pub(crate) version: ProtocolVersion,
    pub(crate) username: String,
    pub(crate) clean_start: bool,
    pub(crate) expire_in: u32,
    pub(crate) will: Option<Will>,
    pub(crate) limits: Limits,
    pub(crate) conn: Arc<dyn Connection>,
    pub(crate) permissions: Arc<dyn Permissions>,
    pub(crate) router: Arc<dyn TopicRouter>,
    pub(crate) events: Weak<dyn SessionEvents>,
}

struct State {
    will: Option<Will>,
    expire_in: u32,
    /// Inbound QoS 2 messages waiting for PUBREL.
    pending: HashMap<u16, Publish>,
}

/// One client connection bound to a client id.
pub struct Session {
    id: String,
    version: ProtocolVersion,
    username: String,
    clean_start: bool,
    created_at: DateTime<Utc>,
    limits: Limits,
    conn: Arc<dyn Connection>,
    permissions: Arc<dyn Permissions>,
    router: Arc<dyn TopicRouter>,
    events: Weak<dyn SessionEvents>,
    writer: Writer,
    subscriber: Mutex<Option<Arc<dyn Subscriber>>>,
    state: Mutex<State>,
    status: AtomicU8,
    closing: AtomicBool,
    stop_once: Once,
}

impl Session {
    pub(crate) fn new(config: SessionConfig, writer: Writer) -> Arc<Self> {
        Arc::new(Self {
            id: config.id,
            version: config.version,
            username: config.username,
            clean_start: config.clean_start,
            created_at: Utc::now(),
            limits: config.limits,
            conn: config.conn,
            permissions: config.permissions,
            router: config.router,
            events: config.events,
            writer,
            subscriber: Mutex::new(None),
            state: Mutex::new(State {
                will: config.will,
                expire_in: config.expire_in,
                pending: HashMap::new(),
            }),
            status: AtomicU8::new(SessionStatus::Connecting as u8),
            closing: AtomicBool::new(false),
            stop_once: Once::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.status() == SessionStatus::Active
    }

    /// Negotiated session expiry interval in seconds.
    pub fn expire_in(&self) -> u32 {
        self.state.lock().expire_in
    }

    /// Packets sent to the client and not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.writer.in_flight()
    }

    pub(crate) fn writer(&self) -> &Writer {
        &self.writer
    }

    pub(crate) fn set_subscriber(&self, subscriber: Arc<dyn Subscriber>) {
        *self.subscriber.lock() = Some(subscriber);
    }

    fn subscriber(&self) -> Option<Arc<dyn Subscriber>> {
        self.subscriber.lock().clone()
    }

    /// Send CONNACK and start delivering.
    ///
    /// Fails without touching the client or the subscriber if the session
    /// was stopped during the handshake.
    pub(crate) fn start(self: &Arc<Self>, ack: ConnAck) -> Result<()> {
        // Set before the pipeline loads persisted packets; a session taken
        // over from concurrently stores its packets and then checks this.
        if self
            .status
            .compare_exchange(
                SessionStatus::Connecting as u8,
                SessionStatus::Active as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            debug!("Client {} stopped before it started", self.id);
            return Err(Error::ConnectionClosed);
        }
        self.writer.send(Packet::ConnAck(ack))?;
        self.writer.start(!self.clean_start);
        if let Some(subscriber) = self.subscriber() {
            subscriber.online(self.publish_callback());
        }
        Ok(())
    }

    /// Refuse the connection after the session was created.
    pub(crate) async fn reject(&self, code: ReasonCode) {
        self.closing.store(true, Ordering::SeqCst);
        let ack = ConnAck {
            session_present: false,
            code,
            properties: None,
        };
        if self.writer.send(Packet::ConnAck(ack)).is_ok() {
            self.writer.flush().await;
        }
        self.writer.stop().await;
        self.status.store(SessionStatus::Offline as u8, Ordering::SeqCst);
        self.stop_once.call_once(|| self.conn.stop(code));
    }

    fn publish_callback(self: &Arc<Self>) -> PublishCallback {
        let session = Arc::downgrade(self);
        Arc::new(move |publish: Publish| {
            let Some(session) = session.upgrade() else {
                return;
            };
            match session.writer.publish(publish.clone()) {
                Ok(()) => {}
                Err(Error::WriterStopped) => {
                    if let Some(events) = session.events.upgrade() {
                        events.offline_publish(&session.id, session.version, publish);
                    }
                }
                Err(e) => warn!("Client {} dropped message on {}: {}", session.id, publish.topic, e),
            }
        })
    }

    /// Close the connection. Only the first call reaches the transport.
    pub fn stop(&self, reason: ReasonCode) {
        let _ = self
            .status
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |status| {
                match SessionStatus::from_u8(status) {
                    SessionStatus::Connecting | SessionStatus::Active => {
                        Some(SessionStatus::Disconnecting as u8)
                    }
                    _ => None,
                }
            });
        self.stop_once.call_once(|| {
            debug!("Client {} stopping: {:?}", self.id, reason);
            self.conn.stop(reason);
        });
    }

    /// PUBLISH from the client.
    pub fn signal_publish(&self, mut publish: Publish) -> Result<()> {
        let packet_id = publish.packet_id;
        if !self
            .permissions
            .acl(&self.id, &self.username, &publish.topic, Access::Write)
            .allowed()
        {
            debug!("Client {} may not publish to {}", self.id, publish.topic);
            let reason = ReasonCode::NotAuthorized;
            return match publish.qos {
                QoS::AtMostOnce => Ok(()),
                QoS::AtLeastOnce => self.writer.send(Packet::PubAck { packet_id, reason }),
                QoS::ExactlyOnce => self.writer.send(Packet::PubRec { packet_id, reason }),
            };
        }

        if let Some(subscriber) = self.subscriber() {
            publish.publish_id = subscriber.hash();
        }

        match publish.qos {
            QoS::AtMostOnce => {
                self.route(publish);
                Ok(())
            }
            QoS::AtLeastOnce => {
                self.route(publish);
                self.writer.send(Packet::PubAck {
                    packet_id,
                    reason: ReasonCode::Success,
                })
            }
            QoS::ExactlyOnce => {
                // A retransmission while PUBREL is outstanding is not routed twice.
                self.state.lock().pending.entry(packet_id).or_insert(publish);
                self.writer.send(Packet::PubRec {
                    packet_id,
                    reason: ReasonCode::Success,
                })
            }
        }
    }

    /// PUBREL from the client: release a held QoS 2 message.
    pub fn signal_pubrel(&self, packet_id: u16) -> Result<()> {
        let held = self.state.lock().pending.remove(&packet_id);
        let reason = match held {
            Some(publish) => {
                self.route(publish);
                ReasonCode::Success
            }
            None => ReasonCode::PacketIdNotFound,
        };
        self.writer.send(Packet::PubComp { packet_id, reason })
    }

    /// PUBACK from the client.
    pub fn signal_puback(&self, packet_id: u16) {
        self.writer.ack(packet_id);
    }

    /// PUBREC from the client.
    pub fn signal_pubrec(&self, packet_id: u16) {
        self.writer.received(packet_id);
    }

    /// PUBCOMP from the client.
    pub fn signal_pubcomp(&self, packet_id: u16) {
        self.writer.completed(packet_id);
    }

    pub fn signal_ping(&self) -> Result<()> {
        self.writer.send(Packet::PingResp)
    }

    fn route(&self, publish: Publish) {
        if publish.retain
            && self.limits.retain
            && let Err(e) = self.router.retain(&publish)
        {
            warn!("Client {} failed to retain {}: {}", self.id, publish.topic, e);
        }
        if let Err(e) = self.router.publish(&publish) {
            warn!("Client {} failed to publish {}: {}", self.id, publish.topic, e);
        }
    }

    /// SUBSCRIBE from the client.
    ///
    /// Option conflicts reject the whole request with
    /// [`Error::Protocol`]; ACL denials only fail their own topic.
    pub fn signal_subscribe(&self, subscribe: Subscribe) -> Result<()> {
        for (filter, options) in &subscribe.topics {
            if parse_shared_topic(filter).is_some() {
                if options.no_local() {
                    return Err(Error::Protocol(ReasonCode::ProtocolError));
                }
                if !self.limits.shared {
                    return Err(Error::Protocol(ReasonCode::SharedSubscriptionsNotSupported));
                }
            }
        }
        if subscribe.subscription_id.is_some() && !self.limits.subscription_ids {
            return Err(Error::Protocol(ReasonCode::SubscriptionIdsNotSupported));
        }

        let id = subscribe.subscription_id.unwrap_or(0);
        let subscriber = self.subscriber();
        let mut codes = Vec::with_capacity(subscribe.topics.len());
        let mut retained = Vec::new();

        for (filter, options) in &subscribe.topics {
            let code = if !self
                .permissions
                .acl(&self.id, &self.username, filter, Access::Read)
                .allowed()
            {
                ReasonCode::not_authorized(self.version)
            } else if !self.limits.wildcard && has_wildcard(filter) {
                if self.version.is_v5() {
                    ReasonCode::WildcardSubscriptionsNotSupported
                } else {
                    ReasonCode::QosFailure
                }
            } else if let Some(subscriber) = &subscriber {
                let options = options.with_qos(options.qos().min(self.limits.max_qos));
                match subscriber.subscribe(filter, Subscription { options, id }) {
                    Ok((granted, messages)) => {
                        retained.extend(messages);
                        ReasonCode::granted(granted)
                    }
                    Err(e) => {
                        warn!("Client {} subscribe {} failed: {}", self.id, filter, e);
                        ReasonCode::QosFailure
                    }
                }
            } else {
                ReasonCode::QosFailure
            };
            info!("Client {} subscribe {}: {:?}", self.id, filter, code);
            codes.push(code);
        }

        self.writer.send(Packet::SubAck {
            packet_id: subscribe.packet_id,
            codes,
        })?;

        for mut publish in retained {
            publish.retain = true;
            if let Err(e) = self.writer.publish(publish) {
                debug!("Client {} retained delivery skipped: {}", self.id, e);
            }
        }
        Ok(())
    }

    /// UNSUBSCRIBE from the client.
    pub fn signal_unsubscribe(&self, unsubscribe: Unsubscribe) -> Result<()> {
        let subscriber = self.subscriber();
        let codes = unsubscribe
            .topics
            .iter()
            .map(|filter| {
                if !self
                    .permissions
                    .acl(&self.id, &self.username, filter, Access::Read)
                    .allowed()
                {
                    return ReasonCode::not_authorized(self.version);
                }
                match subscriber.as_ref().map(|s| s.unsubscribe(filter)) {
                    Some(Ok(true)) => ReasonCode::Success,
                    Some(Ok(false)) | None => ReasonCode::NoSubscriptionExisted,
                    Some(Err(e)) => {
                        warn!("Client {} unsubscribe {} failed: {}", self.id, filter, e);
                        ReasonCode::NoSubscriptionExisted
                    }
                }
            })
            .collect();
        self.writer.send(Packet::UnsubAck {
            packet_id: unsubscribe.packet_id,
            codes,
        })
    }

    /// DISCONNECT from the client.
    pub fn signal_disconnect(&self, disconnect: Disconnect) -> Result<()> {
        let mut state = self.state.lock();
        if !self.version.is_v5() {
            state.will = None;
            return Ok(());
        }
        if disconnect.reason != ReasonCode::DisconnectWithWill && !disconnect.reason.is_error() {
            state.will = None;
        }
        if let Some(expire_in) = disconnect.session_expiry {
            if state.expire_in == 0 && expire_in != 0 {
                return Err(Error::Protocol(ReasonCode::ProtocolError));
            }
            state.expire_in = expire_in;
        }
        Ok(())
    }

    /// The transport's read side ended. Runs the disconnect sequence once.
    pub async fn signal_connection_close(self: &Arc<Self>, reason: ReasonCode) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.status.store(SessionStatus::Disconnecting as u8, Ordering::SeqCst);

        let (will, expire_in) = {
            let mut state = self.state.lock();
            state.pending.clear();
            (state.will.take(), state.expire_in)
        };
        // Zero expiry ends the session with the connection.
        let durable = expire_in != 0;

        let will_delay = will.as_ref().map_or(0, |w| w.delay);
        let will = match will {
            Some(w) if w.delay == 0 => {
                self.publish_will(&w.message);
                None
            }
            other => other,
        };

        let events = self.events.upgrade();
        if let Some(events) = &events {
            events.connection_closed(&self.id, reason);
        }

        let packets = self.writer.stop().await;
        let subscriber = self.subscriber.lock().take();
        let keep_subscriber =
            (durable && subscriber.is_some_and(|s| s.has_subscriptions())) || will_delay > 0;

        let expiry = (reason != ReasonCode::SessionTakenOver && (will_delay > 0 || expire_in > 0))
            .then(|| ExpiryConfig {
                id: self.id.clone(),
                since: Utc::now(),
                will: will.map(|w| w.message),
                will_delay,
                expire_in,
            });

        info!("Client {} disconnected: {:?}", self.id, reason);
        if let Some(events) = &events {
            events.session_offline(
                self,
                Offline {
                    reason,
                    durable,
                    keep_subscriber,
                    packets,
                    expiry,
                },
            );
        }

        self.stop_once.call_once(|| {});
        self.status.store(SessionStatus::Offline as u8, Ordering::SeqCst);
    }

    fn publish_will(&self, will: &Publish) {
        debug!("Client {} publishing will on {}", self.id, will.topic);
        if will.retain
            && self.limits.retain
            && let Err(e) = self.router.retain(will)
        {
            warn!("Client {} failed to retain will: {}", self.id, e);
        }
        if let Err(e) = self.router.publish(will) {
            warn!("Client {} failed to publish will: {}", self.id, e);
        }
    }
}
