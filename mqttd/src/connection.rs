//! Transport collaborator.
//!
//! The listener layer decodes CONNECT/AUTH itself and hands the registry an
//! [`Incoming`] connection: a handshake channel, the write half of the byte
//! stream and a [`Connection`] control handle.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::packet::ReasonCode;
use crate::types::{ProtocolVersion, Will};

/// Write half of a client connection.
pub type BoxedSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Control handle of one network connection.
pub trait Connection: Send + Sync {
    /// Peer address, if known.
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Close the connection.
    ///
    /// The transport must report the close back through
    /// [`Session::signal_connection_close`](crate::Session::signal_connection_close)
    /// once its read loop has ended.
    fn stop(&self, reason: ReasonCode);

    /// Apply negotiated limits to the read side.
    fn set_options(&self, _options: &ConnectionOptions) {}
}

/// Limits the read side enforces after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub keep_alive: u16,
    pub max_rx_packet_size: u32,
    pub max_rx_topic_alias: u16,
    pub rx_quota: u16,
}

/// Parameters decoded from CONNECT.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectParams {
    pub id: String,
    pub version: ProtocolVersion,
    pub clean_start: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<Will>,
    /// Session Expiry Interval property (MQTT 5.0).
    pub expire_in: Option<u32>,
    /// Receive Maximum property (MQTT 5.0).
    pub receive_max: Option<u16>,
    /// Maximum Packet Size property (MQTT 5.0).
    pub max_packet_size: Option<u32>,
    /// Topic Alias Maximum property (MQTT 5.0).
    pub topic_alias_max: Option<u16>,
    /// Authentication Method property (MQTT 5.0).
    pub auth_method: Option<String>,
}

impl ConnectParams {
    pub fn new(id: impl Into<String>, version: ProtocolVersion) -> Self {
        Self {
            id: id.into(),
            version,
            clean_start: true,
            keep_alive: 60,
            username: None,
            password: None,
            will: None,
            expire_in: None,
            receive_max: None,
            max_packet_size: None,
            topic_alias_max: None,
            auth_method: None,
        }
    }

    pub fn clean_start(mut self, clean: bool) -> Self {
        self.clean_start = clean;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<Bytes>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    pub fn expire_in(mut self, secs: u32) -> Self {
        self.expire_in = Some(secs);
        self
    }

    pub fn receive_max(mut self, max: u16) -> Self {
        self.receive_max = Some(max);
        self
    }

    pub fn max_packet_size(mut self, max: u32) -> Self {
        self.max_packet_size = Some(max);
        self
    }

    pub fn topic_alias_max(mut self, max: u16) -> Self {
        self.topic_alias_max = Some(max);
        self
    }

    pub fn auth_method(mut self, method: impl Into<String>) -> Self {
        self.auth_method = Some(method.into());
        self
    }
}

/// Enhanced authentication exchange (MQTT 5.0 AUTH).
#[derive(Debug, Clone, PartialEq)]
pub struct AuthParams {
    pub method: String,
    pub data: Bytes,
}

/// One step of the connection handshake.
#[derive(Debug)]
pub enum Handshake {
    Connect(ConnectParams),
    Auth(AuthParams),
    Error(Error),
}

/// A freshly accepted connection.
pub struct Incoming {
    pub conn: Arc<dyn Connection>,
    pub sink: BoxedSink,
    pub handshake: mpsc::Receiver<Handshake>,
}
