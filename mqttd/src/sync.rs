//! Counters that can be awaited.

use tokio::sync::watch;

/// Counter whose zero crossing can be awaited, used to drain active
/// sessions and pending expiry timers on shutdown.
#[derive(Debug)]
pub struct Gauge {
    tx: watch::Sender<u64>,
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

impl Gauge {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    pub fn inc(&self) {
        self.tx.send_modify(|v| *v += 1);
    }

    /// Decrement, saturating at zero.
    pub fn dec(&self) {
        self.tx.send_modify(|v| *v = v.saturating_sub(1));
    }

    pub fn get(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Wait until the counter reads zero.
    pub async fn wait_zero(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|v| *v == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_saturating() {
        let gauge = Gauge::new();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[tokio::test]
    async fn test_wait_zero() {
        let gauge = Arc::new(Gauge::new());
        gauge.inc();
        let g = gauge.clone();
        let waiter = tokio::spawn(async move { g.wait_zero().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        gauge.dec();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
