//! MQTT broker core: session registry, takeover and delivery.
//!
//! This crate owns everything between a decoded CONNECT and the topic router:
//!
//! - **Registry**: one slot per client id, with takeover of live sessions
//!   and rejection of duplicates when configured
//! - **Sessions**: inbound packet handling, ACL checks and the disconnect
//!   sequence (will, expiry, queued packets)
//! - **Outbound pipeline**: QoS 1/2 flow window, topic aliases, offline
//!   queues and replay after reconnect
//! - **Expiry**: delayed wills and session expiry timers that survive restarts
//!
//! Routing, persistence, credentials and the network transport are
//! collaborators behind traits ([`TopicRouter`], [`Persistence`],
//! [`Permissions`], [`Connection`]).
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use giztoy_mqttd::{AllowAll, Incoming, Manager, Options, TopicRouter};
//!
//! async fn serve(router: Arc<dyn TopicRouter>, incoming: Incoming) -> giztoy_mqttd::Result<()> {
//!     let manager = Manager::builder(Options::default()).router(router).build()?;
//!     let session = manager.on_connection(incoming, Arc::new(AllowAll)).await?;
//!     println!("{} connected", session.id());
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
mod container;
mod error;
mod expiry;
pub mod flow;
mod manager;
pub mod metrics;
pub mod packet;
pub mod persistence;
pub mod router;
mod session;
pub mod subscriptions;
mod sync;
pub mod topic;
mod types;
pub mod writer;

pub use auth::{Access, AllowAll, AuthManager, AuthStatus, Permissions};
pub use codec::{Codec, WireCodec};
pub use config::Options;
pub use connection::{ConnectParams, Connection, Handshake, Incoming};
pub use error::{Error, PersistenceError, PersistenceResult, Result};
pub use manager::{DuplicateCallback, Manager, ManagerBuilder};
pub use metrics::{Metrics, NoopMetrics, SysEvents};
pub use packet::{Packet, ReasonCode};
pub use persistence::{MemoryPersistence, Persistence};
pub use router::{Subscriber, TopicRouter};
pub use session::{Session, SessionStatus};
pub use sync::Gauge;
pub use types::{EXPIRY_NEVER, MAX_PACKET_ID, ProtocolVersion, Publish, QoS, SubscriptionOptions, Will};
