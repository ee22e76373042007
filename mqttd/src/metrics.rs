//! Operational metrics.
//!
//! [`SysEvents`] publishes client lifecycle events under
//! `$SYS/brokers/{broker}/clients/{clientid}/...`. The payload format is
//! compatible with EMQX:
//! https://docs.emqx.com/en/emqx/latest/observability/mqtt-system-topics.html

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use crate::packet::ReasonCode;
use crate::router::TopicRouter;
use crate::types::{ProtocolVersion, Publish};

/// Connected client details.
#[derive(Debug, Clone)]
pub struct ClientInfo<'a> {
    pub id: &'a str,
    pub username: &'a str,
    pub addr: Option<SocketAddr>,
    pub version: ProtocolVersion,
    pub keep_alive: u16,
    pub clean_start: bool,
    pub session_present: bool,
}

/// Why a session left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveCause {
    /// Disconnected without anything to keep.
    Clean,
    /// Expiry timer fired.
    Expired,
    /// Broker stopped while the expiry timer was pending. The timer is
    /// persisted and resumes on restart.
    Shutdown,
}

impl RemoveCause {
    pub fn as_str(self) -> &'static str {
        match self {
            RemoveCause::Clean => "clean",
            RemoveCause::Expired => "expired",
            RemoveCause::Shutdown => "shutdown",
        }
    }
}

/// Metrics sink. Every method defaults to a no-op.
pub trait Metrics: Send + Sync {
    fn client_connected(&self, _info: &ClientInfo<'_>) {}
    fn client_disconnected(&self, _id: &str, _reason: ReasonCode) {}
    fn session_created(&self, _id: &str, _restored: bool) {}
    fn session_removed(&self, _id: &str, _cause: RemoveCause) {}
    fn packet_sent(&self, _kind: &'static str) {}
    fn bytes_sent(&self, _id: &str, _n: usize) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

/// Publishes `$SYS` events through the router.
pub struct SysEvents {
    broker_id: String,
    router: Arc<dyn TopicRouter>,
}

impl SysEvents {
    pub fn new(broker_id: impl Into<String>, router: Arc<dyn TopicRouter>) -> Self {
        Self {
            broker_id: broker_id.into(),
            router,
        }
    }

    fn emit<T: Serialize>(&self, client_id: &str, event: &str, payload: &T) {
        let topic = format!("$SYS/brokers/{}/clients/{}/{}", self.broker_id, client_id, event);
        // serde_json keeps client supplied strings from breaking the payload
        let payload = match serde_json::to_vec(payload) {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to serialize $SYS {} event for {}: {}", event, client_id, e);
                return;
            }
        };
        if let Err(e) = self.router.publish(&Publish::new(topic, Bytes::from(payload))) {
            warn!("Failed to publish $SYS {} event for {}: {}", event, client_id, e);
        }
    }
}

impl Metrics for SysEvents {
    fn client_connected(&self, info: &ClientInfo<'_>) {
        let event = SysConnectedEvent {
            clientid: info.id,
            username: info.username,
            ipaddress: info.addr.map(|a| a.ip().to_string()).unwrap_or_default(),
            proto_ver: info.version.level(),
            keepalive: info.keep_alive,
            clean_start: info.clean_start,
            connected_at: Utc::now().timestamp_millis(),
        };
        self.emit(info.id, "connected", &event);
    }

    fn client_disconnected(&self, id: &str, reason: ReasonCode) {
        let event = SysDisconnectedEvent {
            clientid: id,
            reason: format!("{:?}", reason),
            disconnected_at: Utc::now().timestamp_millis(),
        };
        self.emit(id, "disconnected", &event);
    }

    fn session_removed(&self, id: &str, cause: RemoveCause) {
        let event = SysSessionEvent {
            clientid: id,
            reason: cause.as_str(),
            ts: Utc::now().timestamp_millis(),
        };
        self.emit(id, "session_terminated", &event);
    }
}

/// $SYS client connected event payload.
#[derive(Serialize)]
struct SysConnectedEvent<'a> {
    clientid: &'a str,
    username: &'a str,
    ipaddress: String,
    proto_ver: u8,
    keepalive: u16,
    clean_start: bool,
    connected_at: i64,
}

/// $SYS client disconnected event payload.
#[derive(Serialize)]
struct SysDisconnectedEvent<'a> {
    clientid: &'a str,
    reason: String,
    disconnected_at: i64,
}

#[derive(Serialize)]
struct SysSessionEvent<'a> {
    clientid: &'a str,
    reason: &'a str,
    ts: i64,
}
