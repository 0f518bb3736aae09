//! Shared identifiers and closed enumerations used across the transfer core.

use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one transfer request end to end, from queueing through
/// completion or cancellation.
pub type TransferId = Uuid;

/// Identifies a long-lived logical channel owned by the Connection Supervisor.
pub type ConnectionId = Uuid;

/// Opaque peer address as understood by the transport collaborator.
pub type PeerId = String;

/// Zero-based index of a chunk within a transfer.
pub type ChunkIndex = u64;

pub fn current_timestamp() -> SystemTime {
    SystemTime::now()
}

/// Direction of a transfer relative to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Upload,
    Download,
}

/// Scheduling priority. Higher weight receives a larger share of the
/// bandwidth budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Background,
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Background,
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];

    /// The relative weight used by the Bandwidth & QoS Allocator when
    /// dividing the total budget across active transfers.
    pub fn weight(self) -> f64 {
        match self {
            Priority::Background => 0.5,
            Priority::Low => 1.0,
            Priority::Normal => 2.0,
            Priority::High => 4.0,
            Priority::Critical => 8.0,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// State of a single chunk within a session's bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Retrying,
}

/// Lifecycle state of a whole transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Initializing,
    Active,
    Completing,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl TransferStatus {
    /// Whether this status can no longer transition (the session has
    /// reached a final disposition).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }

    /// Validates a state transition against the machine in the Transfer
    /// Session Engine: Initializing -> Active -> {Completing -> Completed |
    /// Failed | Cancelled | Paused -> Active}.
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Initializing, Active)
                | (Active, Completing)
                | (Active, Failed)
                | (Active, Cancelled)
                | (Active, Paused)
                | (Paused, Active)
                | (Paused, Cancelled)
                | (Completing, Completed)
                | (Completing, Failed)
                | (_, Cancelled)
        )
    }
}

/// A declarative description of work to be done, built by the caller and
/// immutable once queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub transfer_id: TransferId,
    pub direction: Direction,
    pub file_name: String,
    pub total_size: u64,
    /// For uploads, the local source path; for downloads, the destination
    /// path the assembler writes into.
    pub local_path: String,
    pub remote_endpoint: PeerId,
    pub chunk_size: Option<u64>,
    pub metadata: HashMap<String, String>,
    pub priority: Priority,
    pub scheduled_for: Option<SystemTime>,
    pub dependencies: HashSet<TransferId>,
    pub resource_demand: ResourceDemand,
}

impl TransferRequest {
    pub fn new(
        direction: Direction,
        file_name: impl Into<String>,
        total_size: u64,
        local_path: impl Into<String>,
        remote_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            transfer_id: Uuid::new_v4(),
            direction,
            file_name: file_name.into(),
            total_size,
            local_path: local_path.into(),
            remote_endpoint: remote_endpoint.into(),
            chunk_size: None,
            metadata: HashMap::new(),
            priority: Priority::default(),
            scheduled_for: None,
            dependencies: HashSet::new(),
            resource_demand: ResourceDemand::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, dependency: TransferId) -> Self {
        self.dependencies.insert(dependency);
        self
    }
}

/// Resources a transfer is expected to occupy once admitted, checked by the
/// Scheduler's admission pipeline.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceDemand {
    pub bandwidth_bytes_per_sec: u64,
    pub memory_bytes: u64,
}

/// Picks a chunk size for a new session from the file's total size, per the
/// Transfer Session Engine's chunk-size policy.
pub fn default_chunk_size(total_size: u64, base_size: u64) -> u64 {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    if total_size > GIB {
        8 * MIB
    } else if total_size < MIB {
        (base_size).min(16 * KIB)
    } else if total_size < 100 * MIB {
        base_size
    } else {
        (2 * base_size).min(128 * KIB)
    }
}
