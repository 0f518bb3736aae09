//! A polled source of a single network-quality enum, consumed by the
//! Bandwidth & QoS Allocator. The actual metric computation behind the
//! enum is external to this crate; a trivial constant implementation is
//! provided for tests and as a default.

use async_trait::async_trait;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NetworkCondition {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl NetworkCondition {
    /// Scalar multiplier applied to a transfer's allocated bandwidth.
    pub fn multiplier(self) -> f64 {
        match self {
            NetworkCondition::Excellent => 1.0,
            NetworkCondition::Good => 0.8,
            NetworkCondition::Fair => 0.6,
            NetworkCondition::Poor => 0.4,
            NetworkCondition::Critical => 0.2,
        }
    }

    pub fn is_degraded(self) -> bool {
        matches!(self, NetworkCondition::Poor | NetworkCondition::Critical)
    }
}

/// Polled network-quality source with change notification.
#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    fn current(&self) -> NetworkCondition;

    /// Awaits the next change in condition; a default implementation that
    /// never changes should resolve immediately on first call and then
    /// pend forever, which callers should race against a timeout.
    async fn changed(&self) -> NetworkCondition;
}

/// A monitor pinned to one condition for the lifetime of the process;
/// useful for tests and as a default when no platform monitor is wired in.
pub struct ConstantNetworkMonitor {
    condition: NetworkCondition,
}

impl ConstantNetworkMonitor {
    pub fn new(condition: NetworkCondition) -> Self {
        Self { condition }
    }
}

#[async_trait]
impl NetworkMonitor for ConstantNetworkMonitor {
    fn current(&self) -> NetworkCondition {
        self.condition
    }

    async fn changed(&self) -> NetworkCondition {
        std::future::pending::<()>().await;
        self.condition
    }
}

/// A monitor whose condition can be pushed by a test or a platform-specific
/// sampler via a `watch` channel.
pub struct WatchNetworkMonitor {
    rx: watch::Receiver<NetworkCondition>,
}

impl WatchNetworkMonitor {
    pub fn new(initial: NetworkCondition) -> (watch::Sender<NetworkCondition>, Self) {
        let (tx, rx) = watch::channel(initial);
        (tx, Self { rx })
    }
}

#[async_trait]
impl NetworkMonitor for WatchNetworkMonitor {
    fn current(&self) -> NetworkCondition {
        *self.rx.borrow()
    }

    async fn changed(&self) -> NetworkCondition {
        let mut rx = self.rx.clone();
        let _ = rx.changed().await;
        let condition = *rx.borrow();
        condition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipliers_match_the_contract() {
        assert_eq!(NetworkCondition::Excellent.multiplier(), 1.0);
        assert_eq!(NetworkCondition::Critical.multiplier(), 0.2);
    }

    #[tokio::test]
    async fn watch_monitor_reports_pushed_updates() {
        let (tx, monitor) = WatchNetworkMonitor::new(NetworkCondition::Excellent);
        assert_eq!(monitor.current(), NetworkCondition::Excellent);
        tx.send(NetworkCondition::Poor).unwrap();
        let updated = monitor.changed().await;
        assert_eq!(updated, NetworkCondition::Poor);
    }
}
