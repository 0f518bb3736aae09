//! Weighted, priority-aware bandwidth budget shared across active
//! transfers, with adaptive reaction to observed network condition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::interval;

use crate::network::NetworkMonitor;
use crate::types::{Priority, TransferId};

pub type Result<T> = std::result::Result<T, BandwidthError>;

#[derive(Error, Debug)]
pub enum BandwidthError {
    #[error("transfer not registered with the allocator: {0}")]
    NotRegistered(TransferId),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Optional per-transfer clamps on its rebalanced allocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationClamp {
    pub min_bytes_per_sec: Option<u64>,
    pub max_bytes_per_sec: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    priority: Priority,
    clamp: AllocationClamp,
    allocated_bytes_per_sec: u64,
    /// Applied on top of the priority-weighted share inside `rebalance`, so
    /// a congestion throttle survives the next rebalance instead of being
    /// overwritten by it. 1.0 outside of degraded network conditions.
    congestion_multiplier: f64,
}

/// One answer to a byte request: transient, consumed immediately by the
/// caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthGrant {
    pub allowed_bytes: u64,
    pub throttle_delay: Duration,
}

#[derive(Debug, Clone, Copy)]
pub enum QosEvent {
    Rebalanced,
    CongestionDetected,
}

struct State {
    registrations: HashMap<TransferId, Registration>,
}

/// Maintains a global bytes-per-second budget, divides it by priority
/// weight across every registered transfer, and answers byte requests
/// scaled by the current network condition.
pub struct BandwidthAllocator {
    total_budget: u64,
    minimum_allowed_bytes: u64,
    max_throttle_delay: Duration,
    state: RwLock<State>,
    monitor: Arc<dyn NetworkMonitor>,
    events: tokio::sync::broadcast::Sender<QosEvent>,
}

impl BandwidthAllocator {
    pub fn new(
        total_budget: u64,
        minimum_allowed_bytes: u64,
        max_throttle_delay: Duration,
        monitor: Arc<dyn NetworkMonitor>,
    ) -> Self {
        let (events, _rx) = tokio::sync::broadcast::channel(256);
        Self {
            total_budget,
            minimum_allowed_bytes,
            max_throttle_delay,
            state: RwLock::new(State {
                registrations: HashMap::new(),
            }),
            monitor,
            events,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<QosEvent> {
        self.events.subscribe()
    }

    pub async fn register(&self, transfer_id: TransferId, priority: Priority, clamp: AllocationClamp) {
        {
            let mut state = self.state.write().await;
            state.registrations.insert(
                transfer_id,
                Registration {
                    priority,
                    clamp,
                    allocated_bytes_per_sec: 0,
                    congestion_multiplier: 1.0,
                },
            );
        }
        self.rebalance().await;
    }

    pub async fn unregister(&self, transfer_id: TransferId) {
        {
            let mut state = self.state.write().await;
            state.registrations.remove(&transfer_id);
        }
        self.rebalance().await;
    }

    pub async fn change_priority(&self, transfer_id: TransferId, priority: Priority) -> Result<()> {
        {
            let mut state = self.state.write().await;
            let registration = state
                .registrations
                .get_mut(&transfer_id)
                .ok_or(BandwidthError::NotRegistered(transfer_id))?;
            registration.priority = priority;
        }
        self.rebalance().await;
        Ok(())
    }

    /// Recomputes each registered transfer's share of the total budget,
    /// proportional to its priority weight, clamped to its optional
    /// min/max. Serialized under the single state lock.
    async fn rebalance(&self) {
        let mut state = self.state.write().await;
        let total_weight: f64 = state.registrations.values().map(|r| r.priority.weight()).sum();
        if total_weight > 0.0 {
            let budget = self.total_budget as f64;
            for registration in state.registrations.values_mut() {
                let share = budget * registration.priority.weight() / total_weight * registration.congestion_multiplier;
                let mut allocated = share as u64;
                if let Some(min) = registration.clamp.min_bytes_per_sec {
                    allocated = allocated.max(min);
                }
                if let Some(max) = registration.clamp.max_bytes_per_sec {
                    allocated = allocated.min(max);
                }
                registration.allocated_bytes_per_sec = allocated;
            }
        }
        drop(state);
        log::debug!("bandwidth allocator rebalanced");
        let _ = self.events.send(QosEvent::Rebalanced);
    }

    pub async fn allocation_for(&self, transfer_id: TransferId) -> Result<u64> {
        self.state
            .read()
            .await
            .registrations
            .get(&transfer_id)
            .map(|r| r.allocated_bytes_per_sec)
            .ok_or(BandwidthError::NotRegistered(transfer_id))
    }

    /// Answers a byte request for `transfer_id`, scaling the transfer's
    /// current allocation by the network condition multiplier and never
    /// granting fewer than `minimum_allowed_bytes`.
    pub async fn request(&self, transfer_id: TransferId, requested_bytes: u64) -> Result<BandwidthGrant> {
        let allocated = self.allocation_for(transfer_id).await?;
        let multiplier = self.monitor.current().multiplier();
        let scaled = ((allocated as f64) * multiplier).floor() as u64;
        let allowed_bytes = requested_bytes.min(scaled).max(self.minimum_allowed_bytes.min(requested_bytes));

        let throttle_delay = if allocated == 0 || requested_bytes <= allowed_bytes {
            Duration::ZERO
        } else {
            let delay_ms = ((requested_bytes - allowed_bytes) as f64) * 1000.0 / (allocated as f64);
            Duration::from_millis(delay_ms.max(0.0) as u64).min(self.max_throttle_delay)
        };

        Ok(BandwidthGrant {
            allowed_bytes,
            throttle_delay,
        })
    }

    /// Runs one adaptation pass: on Poor/Critical network condition, applies
    /// a standing halving multiplier to every Background/Low transfer's
    /// share before the next rebalance, so the throttle isn't immediately
    /// overwritten by it. Clears the multiplier again once conditions
    /// recover.
    pub async fn adapt(&self) {
        let condition = self.monitor.current();
        let degraded = condition.is_degraded();
        {
            let mut state = self.state.write().await;
            for registration in state.registrations.values_mut() {
                if matches!(registration.priority, Priority::Background | Priority::Low) {
                    registration.congestion_multiplier = if degraded { 0.5 } else { 1.0 };
                }
            }
        }
        if degraded {
            log::warn!("network condition degraded ({condition:?}), throttling background/low transfers");
            let _ = self.events.send(QosEvent::CongestionDetected);
        }
        self.rebalance().await;
    }

    /// Spawns the periodic adaptation task.
    pub fn spawn_adaptation_task(self: &Arc<Self>, adaptation_interval: Duration) -> tokio::task::JoinHandle<()> {
        let allocator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(adaptation_interval);
            loop {
                ticker.tick().await;
                allocator.adapt().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ConstantNetworkMonitor;
    use crate::network::NetworkCondition;

    fn excellent_allocator(total_budget: u64) -> BandwidthAllocator {
        BandwidthAllocator::new(
            total_budget,
            1024,
            Duration::from_secs(5),
            Arc::new(ConstantNetworkMonitor::new(NetworkCondition::Excellent)),
        )
    }

    #[tokio::test]
    async fn single_transfer_gets_the_whole_budget() {
        let allocator = excellent_allocator(1_000_000);
        let id = uuid::Uuid::new_v4();
        allocator.register(id, Priority::Normal, AllocationClamp::default()).await;
        assert_eq!(allocator.allocation_for(id).await.unwrap(), 1_000_000);
    }

    #[tokio::test]
    async fn weighted_rebalance_matches_priority_ratio() {
        let allocator = excellent_allocator(1_000_000);
        let normal = uuid::Uuid::new_v4();
        let background = uuid::Uuid::new_v4();
        allocator.register(normal, Priority::Normal, AllocationClamp::default()).await;
        allocator.register(background, Priority::Background, AllocationClamp::default()).await;

        let normal_alloc = allocator.allocation_for(normal).await.unwrap() as f64;
        let background_alloc = allocator.allocation_for(background).await.unwrap() as f64;
        let ratio = normal_alloc / background_alloc;
        assert!((ratio - 4.0).abs() < 0.01 * 4.0, "ratio was {ratio}");
    }

    #[tokio::test]
    async fn request_never_exceeds_allocation_and_respects_floor() {
        let allocator = excellent_allocator(10_000);
        let id = uuid::Uuid::new_v4();
        allocator.register(id, Priority::Normal, AllocationClamp::default()).await;
        let grant = allocator.request(id, 50_000).await.unwrap();
        assert!(grant.allowed_bytes <= 10_000);
        assert!(grant.allowed_bytes >= 1024);
        assert!(grant.throttle_delay > Duration::ZERO);
    }

    #[tokio::test]
    async fn degraded_condition_halves_background_allocation() {
        let allocator = BandwidthAllocator::new(
            1_000_000,
            1024,
            Duration::from_secs(5),
            Arc::new(ConstantNetworkMonitor::new(NetworkCondition::Poor)),
        );
        let background = uuid::Uuid::new_v4();
        allocator.register(background, Priority::Background, AllocationClamp::default()).await;
        let before = allocator.allocation_for(background).await.unwrap();
        allocator.adapt().await;
        let after = allocator.allocation_for(background).await.unwrap();
        assert!(after <= before);
    }

    #[tokio::test]
    async fn clamp_bounds_the_allocation() {
        let allocator = excellent_allocator(1_000_000);
        let id = uuid::Uuid::new_v4();
        allocator
            .register(
                id,
                Priority::Critical,
                AllocationClamp { min_bytes_per_sec: None, max_bytes_per_sec: Some(5_000) },
            )
            .await;
        assert_eq!(allocator.allocation_for(id).await.unwrap(), 5_000);
    }
}
