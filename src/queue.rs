//! Admits queued transfer requests into the engine in priority order,
//! respecting a dependency DAG, a pluggable resource gate, and a hard cap on
//! simultaneously active transfers.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::interval;

use crate::events::{EventSink, TransferEvent};
use crate::types::{Priority, ResourceDemand, TransferId, TransferRequest};

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue item not found: {0}")]
    NotFound(TransferId),

    #[error("transfer {0} is already queued")]
    AlreadyQueued(TransferId),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

const DEPENDENCY_RETRY_DELAY: Duration = Duration::from_secs(1);
const RESOURCE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Whether a transfer's declared dependencies have all reached a terminal
/// success state. The queue has no notion of session state itself; the
/// engine wires a concrete oracle in.
#[async_trait]
pub trait DependencyOracle: Send + Sync {
    async fn is_satisfied(&self, dependencies: &HashSet<TransferId>) -> bool;
}

/// Always reports dependencies as satisfied; used when a caller doesn't
/// need dependency gating.
pub struct AlwaysSatisfied;

#[async_trait]
impl DependencyOracle for AlwaysSatisfied {
    async fn is_satisfied(&self, _dependencies: &HashSet<TransferId>) -> bool {
        true
    }
}

/// A set of completed transfer ids the engine maintains as sessions finish;
/// dependencies are satisfied once every id they name is in the set.
#[derive(Default)]
pub struct CompletedTransferSet {
    completed: RwLock<HashSet<TransferId>>,
}

impl CompletedTransferSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn mark_completed(&self, transfer_id: TransferId) {
        self.completed.write().await.insert(transfer_id);
    }
}

#[async_trait]
impl DependencyOracle for CompletedTransferSet {
    async fn is_satisfied(&self, dependencies: &HashSet<TransferId>) -> bool {
        if dependencies.is_empty() {
            return true;
        }
        let completed = self.completed.read().await;
        dependencies.iter().all(|dep| completed.contains(dep))
    }
}

/// Whether there is enough bandwidth/memory headroom to admit a transfer
/// with the given demand right now.
#[async_trait]
pub trait ResourceGate: Send + Sync {
    async fn can_admit(&self, demand: ResourceDemand) -> bool;
}

/// Imposes no resource constraint; admission is gated only by dependencies
/// and the concurrent-transfer cap.
pub struct UnboundedResources;

#[async_trait]
impl ResourceGate for UnboundedResources {
    async fn can_admit(&self, _demand: ResourceDemand) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueItemState {
    Pending,
    Admitted,
    Cancelled,
}

#[derive(Debug, Clone)]
struct QueuedItem {
    request: TransferRequest,
    queued_at: SystemTime,
    next_eligible_at: SystemTime,
    state: QueueItemState,
}

#[derive(Debug, Clone)]
struct HeapEntry {
    transfer_id: TransferId,
    priority: Priority,
    queued_at: SystemTime,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.transfer_id == other.transfer_id
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.queued_at.cmp(&self.queued_at),
            ordering => ordering,
        }
    }
}

/// One admitted transfer: the scheduler hands this back along with the
/// semaphore permit the caller must hold for the transfer's lifetime and
/// release (via [`QueueScheduler::release`]) once the session reaches a
/// terminal state.
#[derive(Debug)]
pub struct AdmittedTransfer {
    pub request: TransferRequest,
}

pub struct QueueScheduler {
    items: RwLock<HashMap<TransferId, QueuedItem>>,
    heap: Mutex<BinaryHeap<HeapEntry>>,
    max_concurrent: usize,
    concurrency: Arc<Semaphore>,
    active_permits: Mutex<HashMap<TransferId, OwnedSemaphorePermit>>,
    admitted_tx: mpsc::UnboundedSender<AdmittedTransfer>,
    events: Arc<EventSink>,
    dependencies: Arc<dyn DependencyOracle>,
    resources: Arc<dyn ResourceGate>,
}

impl QueueScheduler {
    pub fn new(
        max_concurrent: usize,
        events: Arc<EventSink>,
        dependencies: Arc<dyn DependencyOracle>,
        resources: Arc<dyn ResourceGate>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<AdmittedTransfer>) {
        let (admitted_tx, admitted_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            items: RwLock::new(HashMap::new()),
            heap: Mutex::new(BinaryHeap::new()),
            max_concurrent,
            concurrency: Arc::new(Semaphore::new(max_concurrent)),
            active_permits: Mutex::new(HashMap::new()),
            admitted_tx,
            events,
            dependencies,
            resources,
        });
        (scheduler, admitted_rx)
    }

    pub async fn enqueue(&self, request: TransferRequest) -> Result<TransferId> {
        let transfer_id = request.transfer_id;
        let mut items = self.items.write().await;
        if items.contains_key(&transfer_id) {
            return Err(QueueError::AlreadyQueued(transfer_id));
        }
        let now = SystemTime::now();
        let eligible_at = request.scheduled_for.unwrap_or(now);
        items.insert(
            transfer_id,
            QueuedItem {
                request: request.clone(),
                queued_at: now,
                next_eligible_at: eligible_at,
                state: QueueItemState::Pending,
            },
        );
        drop(items);

        self.heap.lock().await.push(HeapEntry {
            transfer_id,
            priority: request.priority,
            queued_at: now,
        });
        self.events.emit(TransferEvent::TransferQueued { transfer_id });
        log::info!("queued transfer {transfer_id} at priority {:?}", request.priority);
        Ok(transfer_id)
    }

    pub async fn cancel(&self, transfer_id: TransferId) -> Result<()> {
        let mut items = self.items.write().await;
        let item = items.get_mut(&transfer_id).ok_or(QueueError::NotFound(transfer_id))?;
        item.state = QueueItemState::Cancelled;
        drop(items);

        if let Some(permit) = self.active_permits.lock().await.remove(&transfer_id) {
            drop(permit);
        }
        Ok(())
    }

    /// Re-ranks an already-queued, not-yet-admitted transfer. The heap
    /// entry is left stale (its ordering no longer matches) until the next
    /// tick's drain-and-rebuild pass picks up the corrected priority from
    /// `items`.
    pub async fn change_priority(&self, transfer_id: TransferId, priority: Priority) -> Result<()> {
        let mut items = self.items.write().await;
        let item = items.get_mut(&transfer_id).ok_or(QueueError::NotFound(transfer_id))?;
        item.request.priority = priority;
        Ok(())
    }

    pub async fn pending_count(&self) -> usize {
        self.items
            .read()
            .await
            .values()
            .filter(|i| i.state == QueueItemState::Pending)
            .count()
    }

    pub async fn active_count(&self) -> usize {
        self.active_permits.lock().await.len()
    }

    /// Releases the concurrency slot held for a transfer that has reached a
    /// terminal state, and removes its bookkeeping entry.
    pub async fn release(&self, transfer_id: TransferId) {
        self.active_permits.lock().await.remove(&transfer_id);
        self.items.write().await.remove(&transfer_id);
    }

    /// Runs one admission pass: drains the heap, evaluates every entry
    /// against the five-step pipeline (drop cancelled, dependency gate,
    /// resource gate, concurrency slot, admit), and rebuilds the heap from
    /// whatever wasn't admitted or dropped.
    pub async fn tick(&self) {
        let drained: Vec<HeapEntry> = {
            let mut heap = self.heap.lock().await;
            std::iter::from_fn(|| heap.pop()).collect()
        };
        if drained.is_empty() {
            return;
        }

        let now = SystemTime::now();
        let mut survivors = Vec::with_capacity(drained.len());

        for entry in drained {
            let snapshot = {
                let items = self.items.read().await;
                items.get(&entry.transfer_id).cloned()
            };
            let Some(snapshot) = snapshot else { continue };

            if snapshot.state == QueueItemState::Cancelled {
                self.items.write().await.remove(&entry.transfer_id);
                continue;
            }
            if snapshot.state != QueueItemState::Pending {
                continue;
            }
            // Rebuild the heap entry from the current snapshot rather than
            // reusing the stale one that was popped: a priority change made
            // between ticks must be reflected the next time this item is
            // ordered against its siblings.
            let current_entry = HeapEntry {
                transfer_id: entry.transfer_id,
                priority: snapshot.request.priority,
                queued_at: entry.queued_at,
            };

            if snapshot.next_eligible_at > now {
                survivors.push(current_entry);
                continue;
            }

            if !self.dependencies.is_satisfied(&snapshot.request.dependencies).await {
                self.reschedule(entry.transfer_id, now + DEPENDENCY_RETRY_DELAY).await;
                survivors.push(current_entry);
                continue;
            }

            if !self.resources.can_admit(snapshot.request.resource_demand).await {
                self.reschedule(entry.transfer_id, now + RESOURCE_RETRY_DELAY).await;
                survivors.push(current_entry);
                continue;
            }

            match Arc::clone(&self.concurrency).try_acquire_owned() {
                Ok(permit) => {
                    self.active_permits.lock().await.insert(entry.transfer_id, permit);
                    {
                        let mut items = self.items.write().await;
                        if let Some(item) = items.get_mut(&entry.transfer_id) {
                            item.state = QueueItemState::Admitted;
                        }
                    }
                    let _ = self.admitted_tx.send(AdmittedTransfer { request: snapshot.request });
                    log::info!("admitted transfer {} ({} of {} slots in use)", entry.transfer_id, self.active_count().await, self.max_concurrent);
                }
                Err(_) => {
                    survivors.push(current_entry);
                }
            }
        }

        let mut heap = self.heap.lock().await;
        for entry in survivors {
            heap.push(entry);
        }
    }

    async fn reschedule(&self, transfer_id: TransferId, eligible_at: SystemTime) {
        let mut items = self.items.write().await;
        if let Some(item) = items.get_mut(&transfer_id) {
            item.next_eligible_at = eligible_at;
        }
    }

    /// Spawns the periodic admission ticker.
    pub fn spawn_ticker(self: &Arc<Self>, tick_interval: Duration) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(tick_interval);
            loop {
                ticker.tick().await;
                scheduler.tick().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, TransferRequest};

    fn request(priority: Priority) -> TransferRequest {
        TransferRequest::new(Direction::Download, "f.bin", 1024, "/tmp/f.bin", "peer-1").with_priority(priority)
    }

    #[tokio::test]
    async fn admits_in_priority_order_within_concurrency_cap() {
        let (scheduler, mut rx) = QueueScheduler::new(
            1,
            Arc::new(EventSink::default()),
            Arc::new(AlwaysSatisfied),
            Arc::new(UnboundedResources),
        );
        let low = request(Priority::Low);
        let critical = request(Priority::Critical);
        let low_id = low.transfer_id;
        let critical_id = critical.transfer_id;
        scheduler.enqueue(low).await.unwrap();
        scheduler.enqueue(critical).await.unwrap();

        scheduler.tick().await;
        let first = rx.recv().await.unwrap();
        assert_eq!(first.request.transfer_id, critical_id);
        assert_eq!(scheduler.active_count().await, 1);
        assert_eq!(scheduler.pending_count().await, 1);

        scheduler.release(critical_id).await;
        scheduler.tick().await;
        let second = rx.recv().await.unwrap();
        assert_eq!(second.request.transfer_id, low_id);
    }

    #[tokio::test]
    async fn unmet_dependency_blocks_admission() {
        struct NeverSatisfied;
        #[async_trait]
        impl DependencyOracle for NeverSatisfied {
            async fn is_satisfied(&self, deps: &HashSet<TransferId>) -> bool {
                deps.is_empty()
            }
        }

        let (scheduler, mut rx) = QueueScheduler::new(
            4,
            Arc::new(EventSink::default()),
            Arc::new(NeverSatisfied),
            Arc::new(UnboundedResources),
        );
        let dependency = uuid::Uuid::new_v4();
        let gated = request(Priority::Normal).with_dependency(dependency);
        scheduler.enqueue(gated).await.unwrap();
        scheduler.tick().await;

        assert_eq!(scheduler.active_count().await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancelled_item_is_dropped_not_admitted() {
        let (scheduler, mut rx) = QueueScheduler::new(
            4,
            Arc::new(EventSink::default()),
            Arc::new(AlwaysSatisfied),
            Arc::new(UnboundedResources),
        );
        let req = request(Priority::Normal);
        let id = req.transfer_id;
        scheduler.enqueue(req).await.unwrap();
        scheduler.cancel(id).await.unwrap();
        scheduler.tick().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.pending_count().await, 0);
    }

    #[tokio::test]
    async fn resource_gate_defers_admission() {
        struct NeverAvailable;
        #[async_trait]
        impl ResourceGate for NeverAvailable {
            async fn can_admit(&self, _demand: ResourceDemand) -> bool {
                false
            }
        }

        let (scheduler, mut rx) = QueueScheduler::new(
            4,
            Arc::new(EventSink::default()),
            Arc::new(AlwaysSatisfied),
            Arc::new(NeverAvailable),
        );
        scheduler.enqueue(request(Priority::Normal)).await.unwrap();
        scheduler.tick().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.pending_count().await, 1);
    }
}
