//! Topic router collaborator.
//!
//! Topic matching, fan-out and retained storage live behind these traits.
//! A session owns exactly one [`Subscriber`] handle created by the router.

use std::sync::Arc;

use crate::error::Result;
use crate::subscriptions::{Subscription, Subscriptions};
use crate::types::{ProtocolVersion, Publish, QoS};

/// Delivers messages to an online session.
pub type PublishCallback = Arc<dyn Fn(Publish) + Send + Sync>;

/// Receives messages for a session whose subscriber is offline.
/// Arguments are the client id and the message.
pub type OfflinePublish = Arc<dyn Fn(&str, Publish) + Send + Sync>;

/// Parameters for creating a subscriber.
#[derive(Clone)]
pub struct SubscriberConfig {
    pub id: String,
    pub version: ProtocolVersion,
    pub offline_publish: OfflinePublish,
}

/// A client's view of the routing engine.
pub trait Subscriber: Send + Sync {
    /// Delivery identifier stamped on messages this client publishes.
    fn hash(&self) -> u64;

    /// Register a topic filter.
    ///
    /// Returns the granted QoS and retained messages matching the filter.
    fn subscribe(&self, filter: &str, sub: Subscription) -> Result<(QoS, Vec<Publish>)>;

    /// Remove a topic filter. Returns false if the filter was not subscribed.
    fn unsubscribe(&self, filter: &str) -> Result<bool>;

    fn has_subscriptions(&self) -> bool;

    /// Current subscription set.
    fn subscriptions(&self) -> Subscriptions;

    /// Start delivering matched messages through `publish`.
    fn online(&self, publish: PublishCallback);

    /// Stop live delivery. With `discard` the subscriber is torn down and its
    /// subscriptions dropped; otherwise matched messages go to the offline
    /// callback.
    fn offline(&self, discard: bool);
}

/// Routing engine.
pub trait TopicRouter: Send + Sync {
    /// Create a subscriber for a client.
    fn subscriber(&self, config: SubscriberConfig) -> Arc<dyn Subscriber>;

    /// Fan a message out to matching subscribers.
    fn publish(&self, publish: &Publish) -> Result<()>;

    /// Store or clear (empty payload) the retained message of a topic.
    fn retain(&self, publish: &Publish) -> Result<()>;
}
