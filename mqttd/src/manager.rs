//! Session registry.
//!
//! The [`Manager`] accepts handshakes, resolves client id conflicts and keeps
//! one [`Container`] per client id in a concurrent map. A container outlives
//! its sessions while anything of the client is kept (subscriber, expiry
//! timer) and is evicted once nothing is.
//!
//! Lock order: a container lock may be taken before a map shard lock, never
//! after one. Map lookups clone the container handle and release the shard
//! before locking.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::auth::Permissions;
use crate::codec::{Codec, MAX_PACKET_SIZE, WireCodec};
use crate::config::{DEFAULT_RECEIVE_MAX, Options};
use crate::connection::{
    BoxedSink, ConnectParams, Connection, ConnectionOptions, Handshake, Incoming,
};
use crate::container::{Container, Slot};
use crate::error::{Error, Result};
use crate::expiry::{Expiry, ExpiryConfig};
use crate::metrics::{ClientInfo, Metrics, NoopMetrics, RemoveCause};
use crate::packet::{ConnAck, ConnAckProperties, Packet, ReasonCode};
use crate::persistence::{MemoryPersistence, Persistence, SessionBase, SessionState};
use crate::router::{OfflinePublish, Subscriber, SubscriberConfig, TopicRouter};
use crate::session::{Limits, Offline, Session, SessionConfig, SessionEvents};
use crate::subscriptions;
use crate::sync::Gauge;
use crate::types::{EXPIRY_NEVER, ProtocolVersion, Publish, QoS};
use crate::writer::{self, Writer, WriterConfig, WriterDeps};

/// Called when a client id that already has an active session connects
/// again. Arguments are the client id and whether the newcomer takes over.
pub type DuplicateCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Builder for [`Manager`].
pub struct ManagerBuilder {
    options: Options,
    router: Option<Arc<dyn TopicRouter>>,
    persistence: Option<Arc<dyn Persistence>>,
    metrics: Option<Arc<dyn Metrics>>,
    codec: Option<Arc<dyn Codec>>,
    on_duplicate: Option<DuplicateCallback>,
}

impl ManagerBuilder {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            router: None,
            persistence: None,
            metrics: None,
            codec: None,
            on_duplicate: None,
        }
    }

    /// Set the topic router. Required.
    pub fn router(mut self, router: Arc<dyn TopicRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Set the persistence backend (default: in memory).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the metrics sink (default: discard).
    pub fn metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set the packet codec (default: [`WireCodec`]).
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Set the duplicate client id callback.
    pub fn on_duplicate<F: Fn(&str, bool) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_duplicate = Some(Arc::new(f));
        self
    }

    /// Build the manager and restore persisted sessions.
    ///
    /// Must be called from within a tokio runtime: restored expiry timers
    /// are spawned right away.
    pub fn build(self) -> Result<Manager> {
        self.options.validate()?;
        let router = self
            .router
            .ok_or_else(|| Error::InvalidConfig("topic router is required".into()))?;
        let persistence = self
            .persistence
            .unwrap_or_else(|| Arc::new(MemoryPersistence::new()));
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        let codec = self.codec.unwrap_or_else(|| Arc::new(WireCodec));

        let registry = Arc::new_cyclic(|this| Registry {
            options: self.options,
            router,
            persistence,
            metrics,
            codec,
            on_duplicate: self.on_duplicate,
            sessions: DashMap::new(),
            active: Gauge::new(),
            expiring: Gauge::new(),
            quit: CancellationToken::new(),
            this: this.clone(),
        });
        let restored = registry.restore()?;
        if restored > 0 {
            info!("Restored {} persisted sessions", restored);
        }
        Ok(Manager { inner: registry })
    }
}

/// Session registry.
pub struct Manager {
    inner: Arc<Registry>,
}

struct Registry {
    options: Options,
    router: Arc<dyn TopicRouter>,
    persistence: Arc<dyn Persistence>,
    metrics: Arc<dyn Metrics>,
    codec: Arc<dyn Codec>,
    on_duplicate: Option<DuplicateCallback>,
    sessions: DashMap<String, Arc<Container>>,
    /// Sessions attached to a live connection.
    active: Gauge,
    /// Armed expiry timers.
    expiring: Gauge,
    quit: CancellationToken,
    this: Weak<Registry>,
}

impl Manager {
    pub fn builder(options: Options) -> ManagerBuilder {
        ManagerBuilder::new(options)
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Run the handshake of a freshly accepted connection.
    ///
    /// On success the session is active and the transport routes inbound
    /// packets to it. Refused connections get a CONNACK with the reason and
    /// are stopped; the error carries the same reason.
    pub async fn on_connection(
        &self,
        incoming: Incoming,
        permissions: Arc<dyn Permissions>,
    ) -> Result<Arc<Session>> {
        let conn = Arc::clone(&incoming.conn);
        match AssertUnwindSafe(self.inner.accept(incoming, permissions))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                error!("Connection handling panicked");
                conn.stop(ReasonCode::UnspecifiedError);
                Err(Error::Internal("connection handling panicked".into()))
            }
        }
    }

    /// Active session of a client id.
    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        let container = self.inner.container(id)?;
        let session = container.slot.lock().session.clone();
        session
    }

    /// Whether the registry holds anything for a client id.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.sessions.contains_key(id)
    }

    /// Sessions attached to a live connection.
    pub fn active_sessions(&self) -> u64 {
        self.inner.active.get()
    }

    /// Armed expiry timers.
    pub fn pending_expiries(&self) -> u64 {
        self.inner.expiring.get()
    }

    #[cfg(test)]
    pub(crate) fn containers(&self) -> &DashMap<String, Arc<Container>> {
        &self.inner.sessions
    }

    /// Stop accepting, disconnect every session and persist pending timers.
    ///
    /// Returns once all sessions went offline and no timer is armed. The
    /// transport must report each close through
    /// [`Session::signal_connection_close`].
    pub async fn stop(&self) {
        let registry = &self.inner;
        registry.quit.cancel();

        for (_, container) in registry.containers() {
            let session = container.slot.lock().session.clone();
            if let Some(session) = session {
                session.stop(ReasonCode::ServerShuttingDown);
            }
        }
        registry.active.wait_zero().await;

        for (id, container) in registry.containers() {
            let expiry = container.slot.lock().expiry.take();
            if let Some(expiry) = expiry
                && expiry.cancel()
            {
                let state = expiry.persisted_state(registry.codec.as_ref());
                if let Err(e) = registry.persistence.expiry_store(&id, state) {
                    warn!("Session {} expiry not persisted: {}", id, e);
                }
                registry.expiring.dec();
                registry.metrics.session_removed(&id, RemoveCause::Shutdown);
            }
        }
        registry.expiring.wait_zero().await;
        info!("Session manager stopped");
    }

    /// [`stop`](Self::stop), then persist every subscriber's subscriptions
    /// and empty the registry.
    pub async fn shutdown(&self) {
        self.stop().await;
        let registry = &self.inner;
        for (id, container) in registry.containers() {
            let (subscriber, version) = {
                let mut slot = container.slot.lock();
                (slot.subscriber.take(), slot.version)
            };
            let Some(subscriber) = subscriber else {
                continue;
            };
            let subs = subscriber.subscriptions();
            if !subs.is_empty() {
                match subscriptions::encode(version, &subs) {
                    Ok(blob) => {
                        if let Err(e) = registry.persistence.subscriptions_store(&id, &blob) {
                            warn!("Session {} subscriptions not persisted: {}", id, e);
                        }
                    }
                    Err(e) => warn!("Session {} subscriptions not encoded: {}", id, e),
                }
            }
            subscriber.offline(true);
        }
        registry.sessions.clear();
    }
}

impl Registry {
    fn events(&self) -> Weak<dyn SessionEvents> {
        self.this.clone()
    }

    fn container(&self, id: &str) -> Option<Arc<Container>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn containers(&self) -> Vec<(String, Arc<Container>)> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    fn new_subscriber(&self, id: &str, version: ProtocolVersion) -> Arc<dyn Subscriber> {
        let this = self.this.clone();
        let offline_publish: OfflinePublish = Arc::new(move |id: &str, publish: Publish| {
            if let Some(registry) = this.upgrade() {
                registry.persist_publish(id, version, publish);
            }
        });
        self.router.subscriber(SubscriberConfig {
            id: id.to_string(),
            version,
            offline_publish,
        })
    }

    /// Store a message routed to an offline session.
    fn persist_publish(&self, id: &str, version: ProtocolVersion, mut publish: Publish) {
        if publish.expired(Utc::now()) {
            trace!("Client {} offline message on {} expired", id, publish.topic);
            return;
        }
        if publish.qos == QoS::AtMostOnce && !self.options.offline_qos0 {
            return;
        }
        publish.packet_id = 0;
        publish.topic_alias = None;
        let qos = publish.qos;
        let entry = match writer::persisted_packet(self.codec.as_ref(), version, &Packet::Publish(publish)) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Client {} offline message not encoded: {}", id, e);
                return;
            }
        };
        let result = if qos == QoS::AtMostOnce {
            self.persistence.packet_store_qos0(id, entry)
        } else {
            self.persistence.packet_store_qos12(id, entry)
        };
        if let Err(e) = result {
            warn!("Client {} offline message not persisted: {}", id, e);
        }
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    async fn accept(
        &self,
        incoming: Incoming,
        permissions: Arc<dyn Permissions>,
    ) -> Result<Arc<Session>> {
        let Incoming {
            conn,
            mut sink,
            mut handshake,
        } = incoming;

        let mut params = match self.handshake(&conn, &mut handshake).await? {
            Handshake::Connect(params) => params,
            Handshake::Auth(auth) => {
                // Enhanced authentication only exists in MQTT 5.0.
                warn!("Connection rejected: unsupported auth method {}", auth.method);
                return self
                    .refuse(&mut sink, &conn, ProtocolVersion::V5, ReasonCode::BadAuthenticationMethod)
                    .await;
            }
            Handshake::Error(e) => {
                debug!("Handshake failed: {}", e);
                conn.stop(ReasonCode::MalformedPacket);
                return Err(e);
            }
        };
        let version = params.version;

        if !self.options.version_allowed(version) {
            warn!("Client {} rejected: {} not allowed", params.id, version);
            return self
                .refuse(&mut sink, &conn, version, ReasonCode::unsupported_version(version))
                .await;
        }

        if let Some(method) = &params.auth_method {
            warn!("Client {} rejected: unsupported auth method {}", params.id, method);
            let code = if version.is_v5() {
                ReasonCode::BadAuthenticationMethod
            } else {
                ReasonCode::server_unavailable(version)
            };
            return self.refuse(&mut sink, &conn, version, code).await;
        }

        let mut assigned = false;
        if params.id.is_empty() {
            if !params.clean_start {
                warn!("Client without id asked to resume a session");
                return self
                    .refuse(&mut sink, &conn, version, ReasonCode::identifier_rejected(version))
                    .await;
            }
            params.id = assign_client_id();
            assigned = true;
        }

        let username = params.username.clone().unwrap_or_default();
        let password = params.password.clone().unwrap_or_default();
        if !permissions.password(&params.id, &username, &password).allowed() {
            warn!("Client {} rejected: bad credentials for {:?}", params.id, username);
            return self
                .refuse(&mut sink, &conn, version, ReasonCode::bad_credentials(version))
                .await;
        }

        if self.quit.is_cancelled() {
            return self
                .refuse(&mut sink, &conn, version, ReasonCode::server_unavailable(version))
                .await;
        }

        let expire_in = self.expire_in(&params);
        let session = self.new_session(&params, username, expire_in, conn.clone(), sink, permissions);

        let present = match self.attach(&session, &params) {
            Ok(present) => present,
            Err(code) => {
                session.reject(code).await;
                return Err(Error::ConnectionRefused(code));
            }
        };

        let ack = ConnAck {
            session_present: present,
            code: ReasonCode::Success,
            properties: version
                .is_v5()
                .then(|| self.connack_properties(&params, expire_in, assigned)),
        };
        let keep_alive = if self.options.force_keep_alive {
            self.options.keep_alive
        } else {
            params.keep_alive
        };
        conn.set_options(&ConnectionOptions {
            keep_alive,
            max_rx_packet_size: self.options.max_packet_size,
            max_rx_topic_alias: self.options.max_topic_alias,
            rx_quota: self.options.receive_max,
        });

        if let Err(e) = self.start(&session, ack) {
            warn!("Client {} failed to start: {}", params.id, e);
            session.stop(ReasonCode::UnspecifiedError);
            return Err(e);
        }

        self.metrics.client_connected(&ClientInfo {
            id: &params.id,
            username: session.username(),
            addr: conn.remote_addr(),
            version,
            keep_alive,
            clean_start: params.clean_start,
            session_present: present,
        });
        self.metrics.session_created(&params.id, present);
        info!(
            "Client {} connected ({}, session present: {})",
            params.id, version, present
        );
        Ok(session)
    }

    /// Start `session` unless a newer connection took its slot since
    /// [`attach`](Self::attach).
    fn start(&self, session: &Arc<Session>, ack: ConnAck) -> Result<()> {
        let container = self
            .container(session.id())
            .ok_or(Error::ConnectionRefused(ReasonCode::SessionTakenOver))?;
        let slot = container.slot.lock();
        if !slot.owned_by(session) {
            return Err(Error::ConnectionRefused(ReasonCode::SessionTakenOver));
        }
        session.start(ack)
    }

    /// Wait for the first handshake step.
    async fn handshake(
        &self,
        conn: &Arc<dyn Connection>,
        handshake: &mut mpsc::Receiver<Handshake>,
    ) -> Result<Handshake> {
        match tokio::time::timeout(self.options.connect_timeout(), handshake.recv()).await {
            Ok(Some(step)) => Ok(step),
            Ok(None) => Err(Error::ConnectionClosed),
            Err(_) => {
                debug!("Handshake timed out");
                conn.stop(ReasonCode::UnspecifiedError);
                Err(Error::Timeout("waiting for CONNECT".into()))
            }
        }
    }

    /// Answer with an error CONNACK and close.
    async fn refuse(
        &self,
        sink: &mut BoxedSink,
        conn: &Arc<dyn Connection>,
        version: ProtocolVersion,
        code: ReasonCode,
    ) -> Result<Arc<Session>> {
        let ack = Packet::ConnAck(ConnAck {
            session_present: false,
            code,
            properties: None,
        });
        match self.codec.encode(version, &ack) {
            Ok(frame) => {
                let written: std::io::Result<()> = async {
                    sink.write_all(&frame).await?;
                    sink.flush().await?;
                    sink.shutdown().await
                }
                .await;
                if let Err(e) = written {
                    debug!("CONNACK not delivered: {}", e);
                }
            }
            Err(e) => warn!("CONNACK not encoded: {}", e),
        }
        conn.stop(code);
        Err(Error::ConnectionRefused(code))
    }

    fn expire_in(&self, params: &ConnectParams) -> u32 {
        let requested = if params.version.is_v5() {
            params.expire_in.unwrap_or(0)
        } else if params.clean_start {
            0
        } else {
            EXPIRY_NEVER
        };
        requested.min(self.options.max_session_expiry)
    }

    fn new_session(
        &self,
        params: &ConnectParams,
        username: String,
        expire_in: u32,
        conn: Arc<dyn Connection>,
        sink: BoxedSink,
        permissions: Arc<dyn Permissions>,
    ) -> Arc<Session> {
        let version = params.version;
        let writer = Writer::new(
            WriterConfig {
                id: params.id.clone(),
                version,
                quota: params.receive_max.unwrap_or(DEFAULT_RECEIVE_MAX),
                max_packet_size: params.max_packet_size.unwrap_or(MAX_PACKET_SIZE),
                topic_alias_max: params
                    .topic_alias_max
                    .unwrap_or(0)
                    .min(self.options.max_topic_alias),
                offline_qos0: self.options.offline_qos0,
            },
            WriterDeps {
                codec: Arc::clone(&self.codec),
                conn: Arc::clone(&conn),
                persistence: Arc::clone(&self.persistence),
                metrics: Arc::clone(&self.metrics),
            },
            sink,
        );

        // Will delay only exists in MQTT 5.0.
        let will = params.will.clone().map(|mut will| {
            if !version.is_v5() {
                will.delay = 0;
            }
            will
        });

        Session::new(
            SessionConfig {
                id: params.id.clone(),
                version,
                username,
                clean_start: params.clean_start,
                expire_in,
                will,
                limits: Limits {
                    max_qos: self.options.max_qos(),
                    retain: self.options.retain_available,
                    wildcard: self.options.wildcard_subscriptions,
                    shared: self.options.shared_subscriptions,
                    subscription_ids: self.options.subscription_identifiers,
                },
                conn,
                permissions,
                router: Arc::clone(&self.router),
                events: self.events(),
            },
            writer,
        )
    }

    fn connack_properties(
        &self,
        params: &ConnectParams,
        expire_in: u32,
        assigned: bool,
    ) -> ConnAckProperties {
        let options = &self.options;
        ConnAckProperties {
            session_expiry: (params.expire_in.unwrap_or(0) != expire_in).then_some(expire_in),
            receive_max: (options.receive_max < DEFAULT_RECEIVE_MAX).then_some(options.receive_max),
            max_qos: (options.max_qos < 2).then_some(options.max_qos),
            retain_available: Some(options.retain_available),
            max_packet_size: (options.max_packet_size < MAX_PACKET_SIZE)
                .then_some(options.max_packet_size),
            assigned_client_id: assigned.then(|| params.id.clone()),
            topic_alias_max: (options.max_topic_alias > 0).then_some(options.max_topic_alias),
            wildcard_available: Some(options.wildcard_subscriptions),
            subscription_ids_available: Some(options.subscription_identifiers),
            shared_available: Some(options.shared_subscriptions),
            server_keep_alive: options.force_keep_alive.then_some(options.keep_alive),
        }
    }

    // ========================================================================
    // Takeover
    // ========================================================================

    /// Bind `session` to the container of its client id.
    ///
    /// Returns whether a persisted session existed, or the CONNACK reason
    /// refusing the connection.
    fn attach(
        &self,
        session: &Arc<Session>,
        params: &ConnectParams,
    ) -> std::result::Result<bool, ReasonCode> {
        let id = session.id();
        let version = session.version();

        let fresh = Arc::new(Container::default());
        let mut fresh_slot = fresh.slot.lock();
        let existing = match self.sessions.entry(id.to_string()) {
            Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&fresh));
                None
            }
        };
        let Some(current) = existing else {
            return Ok(self.install(session, params, &mut fresh_slot));
        };
        drop(fresh_slot);

        let mut slot = current.slot.lock();
        slot.removable = false;

        if let Some(active) = slot.session.clone() {
            let allowed = self.options.session_dups;
            if let Some(on_duplicate) = &self.on_duplicate {
                on_duplicate(id, allowed);
            }
            if !allowed {
                slot.removable = true;
                warn!("Client {} rejected: client id already connected", id);
                return Err(ReasonCode::identifier_rejected(version));
            }
            info!("Client {} takes over its session", id);
            active.stop(ReasonCode::SessionTakenOver);
        }

        if let Some(expiry) = slot.expiry.take() {
            if expiry.cancel() {
                self.expiring.dec();
                debug!("Session {} expiry cancelled by reconnect", id);
            }
            if let Err(e) = self.persistence.expiry_delete(id) {
                debug!("Session {} expiry record not deleted: {}", id, e);
            }
        }

        if slot.removed {
            // Evicted between lookup and lock; start over with a new entry.
            drop(slot);
            let fresh = Arc::new(Container::default());
            let mut fresh_slot = fresh.slot.lock();
            return match self.sessions.entry(id.to_string()) {
                Entry::Occupied(_) => {
                    warn!("Client {} rejected: lost race for client id", id);
                    Err(ReasonCode::identifier_rejected(version))
                }
                Entry::Vacant(entry) => {
                    entry.insert(Arc::clone(&fresh));
                    Ok(self.install(session, params, &mut fresh_slot))
                }
            };
        }

        let present = self.install(session, params, &mut slot);
        slot.removable = true;
        Ok(present)
    }

    /// Make `session` the owner of `slot`. Returns session present.
    fn install(&self, session: &Arc<Session>, params: &ConnectParams, slot: &mut Slot) -> bool {
        let id = session.id();
        let version = session.version();

        let subscriber = match slot.subscriber.take() {
            Some(existing) if !params.clean_start => existing,
            Some(existing) => {
                existing.offline(true);
                self.new_subscriber(id, version)
            }
            None => self.new_subscriber(id, version),
        };

        let present = self.persistence.exists(id);
        if params.clean_start && present {
            if let Err(e) = self.persistence.delete(id) {
                warn!("Session {} not wiped: {}", id, e);
            }
        }
        if params.clean_start || !present {
            let base = SessionBase {
                timestamp: Utc::now(),
                version,
            };
            if let Err(e) = self.persistence.create(id, base) {
                warn!("Session {} not persisted: {}", id, e);
            }
        }

        session.set_subscriber(Arc::clone(&subscriber));
        slot.subscriber = Some(subscriber);
        slot.version = version;
        slot.clean_start = params.clean_start;
        slot.session = Some(Arc::clone(session));
        self.active.inc();
        present
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    fn restore(&self) -> Result<usize> {
        debug!("Loading {} persisted sessions", self.persistence.count());
        let mut restored = 0;
        let mut corrupt = Vec::new();
        self.persistence.load_for_each(&self.quit, &mut |id, state| {
            match self.restore_one(id, state) {
                Ok(true) => restored += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Session {} not restored: {}", id, e);
                    corrupt.push(id.to_string());
                }
            }
        })?;
        for id in corrupt {
            if let Err(e) = self.persistence.delete(&id) {
                warn!("Session {} not deleted: {}", id, e);
            }
        }
        Ok(restored)
    }

    fn restore_one(&self, id: &str, state: SessionState) -> Result<bool> {
        for problem in &state.errors {
            warn!("Session {} storage problem: {}", id, problem);
        }
        let subscriptions = state
            .subscriptions
            .as_deref()
            .map(subscriptions::decode)
            .transpose()?
            .filter(|(_, subs)| !subs.is_empty());
        let expiry = state
            .expiry
            .map(|s| ExpiryConfig::from_state(id, s, self.codec.as_ref()))
            .transpose()?;
        if subscriptions.is_none() && expiry.is_none() {
            return Ok(false);
        }

        let version = subscriptions
            .as_ref()
            .map_or(state.base.version, |(version, _)| *version);
        let container = Arc::new(Container::default());
        let mut slot = container.slot.lock();
        slot.version = version;

        if let Some((_, subs)) = subscriptions {
            let subscriber = self.new_subscriber(id, version);
            for (filter, sub) in subs.iter() {
                if let Err(e) = subscriber.subscribe(filter, *sub) {
                    warn!("Session {} subscription {} not restored: {}", id, filter, e);
                }
            }
            subscriber.offline(false);
            slot.subscriber = Some(subscriber);
        }

        if let Some(config) = expiry {
            let expiry = Expiry::new(config);
            expiry.start(Arc::clone(&self.router), self.events());
            self.expiring.inc();
            slot.expiry = Some(expiry);
        }

        self.sessions.insert(id.to_string(), Arc::clone(&container));
        Ok(true)
    }
}

impl SessionEvents for Registry {
    fn connection_closed(&self, id: &str, reason: ReasonCode) {
        self.metrics.client_disconnected(id, reason);
    }

    fn session_offline(&self, session: &Arc<Session>, offline: Offline) {
        let id = session.id();
        let mut evicted = false;

        match self.container(id) {
            Some(container) => {
                let mut slot = container.slot.lock();
                if slot.owned_by(session) {
                    evicted = self.release(id, &container, &mut slot, offline);
                } else if slot.clean_start {
                    debug!("Client {} taken over with clean start, packets discarded", id);
                } else if offline.durable && !offline.packets.is_empty() {
                    // Taken over: queued packets go to the new owner.
                    if let Err(e) = self.persistence.packets_store(id, offline.packets) {
                        warn!("Client {} packets not persisted: {}", id, e);
                    }
                    if let Some(current) = &slot.session
                        && current.is_active()
                    {
                        current.writer().reload();
                    }
                }
            }
            None => {
                if offline.durable
                    && let Err(e) = self.persistence.packets_store(id, offline.packets)
                {
                    warn!("Client {} packets not persisted: {}", id, e);
                }
            }
        }

        self.active.dec();
        if evicted {
            self.metrics.session_removed(id, RemoveCause::Clean);
        }
    }

    fn session_timer(&self, expiry: &Arc<Expiry>) {
        let id = expiry.id();
        let mut evicted = false;
        if let Some(container) = self.container(id) {
            let mut slot = container.slot.lock();
            if slot
                .expiry
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, expiry))
            {
                slot.expiry = None;
                if let Some(subscriber) = slot.subscriber.take() {
                    subscriber.offline(true);
                }
                if slot.is_vacant() && slot.removable {
                    self.sessions
                        .remove_if(id, |_, c| Arc::ptr_eq(c, &container));
                    slot.removed = true;
                }
                if let Err(e) = self.persistence.delete(id) {
                    warn!("Session {} not deleted: {}", id, e);
                }
                evicted = true;
            }
        }
        self.expiring.dec();
        if evicted {
            self.metrics.session_removed(id, RemoveCause::Expired);
        }
    }

    fn offline_publish(&self, id: &str, version: ProtocolVersion, publish: Publish) {
        self.persist_publish(id, version, publish);
    }
}

impl Registry {
    /// Offline bookkeeping for the owning session. Returns true if the
    /// container was evicted.
    fn release(&self, id: &str, container: &Arc<Container>, slot: &mut Slot, offline: Offline) -> bool {
        slot.session = None;

        if let Some(subscriber) = &slot.subscriber {
            subscriber.offline(!offline.keep_subscriber);
        }
        if !offline.keep_subscriber {
            slot.subscriber = None;
        }

        let result = if offline.durable {
            self.persistence.packets_store(id, offline.packets)
        } else {
            self.persistence.packets_delete(id)
        };
        if let Err(e) = result {
            warn!("Client {} packets not persisted: {}", id, e);
        }

        let ends = !offline.durable && offline.expiry.is_none();
        if let Some(config) = offline.expiry {
            let expiry = Expiry::new(config);
            if self.quit.is_cancelled() {
                let state = expiry.persisted_state(self.codec.as_ref());
                if let Err(e) = self.persistence.expiry_store(id, state) {
                    warn!("Session {} expiry not persisted: {}", id, e);
                }
            } else {
                debug!("Session {} expiry armed ({:?})", id, offline.reason);
                expiry.start(Arc::clone(&self.router), self.events());
                self.expiring.inc();
                slot.expiry = Some(expiry);
            }
        }

        if ends && let Err(e) = self.persistence.delete(id) {
            warn!("Session {} not deleted: {}", id, e);
        }

        if slot.is_vacant() && slot.removable {
            self.sessions.remove_if(id, |_, c| Arc::ptr_eq(c, container));
            slot.removed = true;
            return true;
        }
        false
    }
}

fn assign_client_id() -> String {
    format!("mqttd-{}", hex::encode(rand::random::<[u8; 8]>()))
}
