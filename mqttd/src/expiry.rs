//! Session expiry timer.
//!
//! Armed when a session goes offline with a delayed will or a nonzero
//! expiry interval. It publishes the will once the will delay elapses and
//! evicts the session once the expiry interval elapses. A reconnect cancels
//! it; cancel and expiry race on one flag and only the winner acts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{self, Codec};
use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::persistence::{ExpiryState, PersistedWill};
use crate::router::TopicRouter;
use crate::session::SessionEvents;
use crate::types::{EXPIRY_NEVER, ProtocolVersion, Publish, QoS};

/// What an expiry timer is armed with.
#[derive(Debug, Clone)]
pub(crate) struct ExpiryConfig {
    pub(crate) id: String,
    /// When the session went offline.
    pub(crate) since: DateTime<Utc>,
    pub(crate) will: Option<Publish>,
    pub(crate) will_delay: u32,
    pub(crate) expire_in: u32,
}

impl ExpiryConfig {
    /// Rebuild a configuration from its persisted form.
    pub(crate) fn from_state(id: &str, state: ExpiryState, codec: &dyn Codec) -> Result<Self> {
        let (will, will_delay) = match state.will {
            Some(w) => match codec::decode_frame(codec, ProtocolVersion::V5, &w.data)? {
                Packet::Publish(p) => (Some(p.with_packet_id(0)), w.delay),
                other => {
                    return Err(Error::Codec(format!("persisted will is a {}", other.kind())));
                }
            },
            None => (None, 0),
        };
        Ok(Self {
            id: id.to_string(),
            since: state.since,
            will,
            will_delay,
            expire_in: state.expire_in,
        })
    }
}

pub(crate) struct Expiry {
    config: ExpiryConfig,
    will: Mutex<Option<Publish>>,
    resolved: AtomicBool,
    cancel: CancellationToken,
}

impl Expiry {
    pub(crate) fn new(mut config: ExpiryConfig) -> Arc<Self> {
        let will = config.will.take();
        Arc::new(Self {
            config,
            will: Mutex::new(will),
            resolved: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.config.id
    }

    /// Spawn the timer task.
    pub(crate) fn start(self: &Arc<Self>, router: Arc<dyn TopicRouter>, events: Weak<dyn SessionEvents>) {
        let expiry = Arc::clone(self);
        tokio::spawn(async move { expiry.run(router, events).await });
    }

    /// Cancel the timer. Returns true if this call won the race against expiry.
    pub(crate) fn cancel(&self) -> bool {
        let won = {
            // Taken together with the will so a cancelled timer never publishes.
            let _will = self.will.lock();
            self.resolved
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        };
        self.cancel.cancel();
        won
    }

    /// Persistable form of the timer, for broker shutdown.
    pub(crate) fn persisted_state(&self, codec: &dyn Codec) -> ExpiryState {
        let will = self.will.lock().clone().and_then(|will| {
            // v5 carries the message expiry; QoS 1/2 frames need a nonzero id.
            let will = if will.qos == QoS::AtMostOnce {
                will
            } else {
                will.with_packet_id(1)
            };
            match codec.encode(ProtocolVersion::V5, &Packet::Publish(will)) {
                Ok(data) => Some(PersistedWill {
                    delay: self.config.will_delay,
                    data: data.to_vec(),
                }),
                Err(e) => {
                    warn!("Client {} will not persisted: {}", self.config.id, e);
                    None
                }
            }
        });
        ExpiryState {
            since: self.config.since,
            expire_in: self.config.expire_in,
            will,
        }
    }

    async fn run(self: Arc<Self>, router: Arc<dyn TopicRouter>, events: Weak<dyn SessionEvents>) {
        let elapsed = (Utc::now() - self.config.since).to_std().unwrap_or(Duration::ZERO);
        let start = Instant::now();
        let has_will = self.will.lock().is_some();
        let (will_at, expire_at) =
            deadlines(has_will, self.config.will_delay, self.config.expire_in);

        if let Some(secs) = will_at {
            let wake = start + Duration::from_secs(secs).saturating_sub(elapsed);
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep_until(wake) => {}
            }
            self.publish_will(router.as_ref());
        }

        let Some(secs) = expire_at else {
            // Never expires; wait for a reconnect or shutdown to cancel us.
            return;
        };
        let wake = start + Duration::from_secs(secs).saturating_sub(elapsed);
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = sleep_until(wake) => {}
        }

        if self
            .resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!("Session {} expired", self.config.id);
            if let Some(events) = events.upgrade() {
                events.session_timer(&self);
            }
        }
    }

    fn publish_will(&self, router: &dyn TopicRouter) {
        let will = {
            let mut will = self.will.lock();
            if self.resolved.load(Ordering::Acquire) {
                None
            } else {
                will.take()
            }
        };
        let Some(will) = will else { return };
        debug!("Client {} publishing delayed will on {}", self.config.id, will.topic);
        if will.retain
            && let Err(e) = router.retain(&will)
        {
            warn!("Client {} failed to retain will: {}", self.config.id, e);
        }
        if let Err(e) = router.publish(&will) {
            warn!("Client {} failed to publish will: {}", self.config.id, e);
        }
    }
}

/// Seconds after going offline at which the will is published and the
/// session expires.
///
/// The will fires no later than the session ends, except that a session
/// with zero expiry stays until its delayed will is out. The session never
/// ends before its will.
fn deadlines(has_will: bool, will_delay: u32, expire_in: u32) -> (Option<u64>, Option<u64>) {
    let will_at = has_will.then(|| {
        if expire_in == 0 {
            u64::from(will_delay)
        } else {
            u64::from(will_delay.min(expire_in))
        }
    });
    let expire_at =
        (expire_in != EXPIRY_NEVER).then(|| u64::from(expire_in).max(will_at.unwrap_or(0)));
    (will_at, expire_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadlines() {
        assert_eq!(deadlines(false, 0, 30), (None, Some(30)));
        assert_eq!(deadlines(true, 10, 30), (Some(10), Some(30)));
        // will delay beyond expiry is cut short by the session ending
        assert_eq!(deadlines(true, 60, 30), (Some(30), Some(30)));
        // zero expiry waits for the delayed will
        assert_eq!(deadlines(true, 5, 0), (Some(5), Some(5)));
        assert_eq!(deadlines(true, 5, EXPIRY_NEVER), (Some(5), None));
        assert_eq!(deadlines(false, 0, EXPIRY_NEVER), (None, None));
    }

    #[test]
    fn test_cancel_is_one_shot() {
        let expiry = Expiry::new(ExpiryConfig {
            id: "c1".into(),
            since: Utc::now(),
            will: None,
            will_delay: 0,
            expire_in: 30,
        });
        assert!(expiry.cancel());
        assert!(!expiry.cancel());
    }

    #[test]
    fn test_persisted_state_roundtrip() {
        let codec = crate::codec::WireCodec;
        let will = Publish::new("last/will", "bye").with_qos(QoS::AtLeastOnce);
        let since = Utc::now();
        let expiry = Expiry::new(ExpiryConfig {
            id: "c1".into(),
            since,
            will: Some(will),
            will_delay: 5,
            expire_in: 30,
        });
        let state = expiry.persisted_state(&codec);
        assert_eq!(state.since, since);
        assert_eq!(state.expire_in, 30);

        let config = ExpiryConfig::from_state("c1", state, &codec).unwrap();
        let will = config.will.unwrap();
        assert_eq!(will.topic, "last/will");
        assert_eq!(&will.payload[..], b"bye");
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert_eq!(will.packet_id, 0);
        assert_eq!(config.will_delay, 5);
    }
}
