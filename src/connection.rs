//! Long-lived logical channels to peers: lifecycle state machine,
//! heartbeats, latency tracking, and graceful teardown.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::time::interval;

use crate::types::{ConnectionId, PeerId};

pub type Result<T> = std::result::Result<T, ConnectionError>;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connection not found: {0}")]
    NotFound(ConnectionId),

    #[error("heartbeat send failed for connection {0}")]
    HeartbeatSendFailed(ConnectionId),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Terminating,
    Failed,
}

/// One sample in a connection's latency ring.
const LATENCY_RING_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub struct Connection {
    pub connection_id: ConnectionId,
    pub peer_id: PeerId,
    pub remote_endpoint: String,
    pub local_endpoint: String,
    pub state: ConnectionState,
    pub established_at: SystemTime,
    pub last_heartbeat: SystemTime,
    pub last_activity: SystemTime,
    pub latency_history: VecDeque<Duration>,
    pub heartbeat_sequence: u64,
    pub metadata: HashMap<String, String>,
}

impl Connection {
    fn new(connection_id: ConnectionId, peer_id: PeerId, remote_endpoint: String, local_endpoint: String) -> Self {
        let now = SystemTime::now();
        Self {
            connection_id,
            peer_id,
            remote_endpoint,
            local_endpoint,
            state: ConnectionState::Connecting,
            established_at: now,
            last_heartbeat: now,
            last_activity: now,
            latency_history: VecDeque::with_capacity(LATENCY_RING_SIZE),
            heartbeat_sequence: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn mean_latency(&self) -> Option<Duration> {
        if self.latency_history.is_empty() {
            return None;
        }
        let total: Duration = self.latency_history.iter().sum();
        Some(total / self.latency_history.len() as u32)
    }

    fn record_latency(&mut self, sample: Duration) {
        if self.latency_history.len() == LATENCY_RING_SIZE {
            self.latency_history.pop_front();
        }
        self.latency_history.push_back(sample);
    }

    /// Whether this connection is healthy per the supervisor's definition:
    /// Connected, with both heartbeat and activity inside their timeouts.
    pub fn is_healthy(&self, heartbeat_timeout: Duration, inactivity_timeout: Duration) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        let now = SystemTime::now();
        let heartbeat_ok = now
            .duration_since(self.last_heartbeat)
            .map(|age| age <= heartbeat_timeout)
            .unwrap_or(false);
        let activity_ok = now
            .duration_since(self.last_activity)
            .map(|age| age <= inactivity_timeout)
            .unwrap_or(false);
        heartbeat_ok && activity_ok
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Established(ConnectionId),
    Lost { connection_id: ConnectionId, reason: String },
    Terminated { connection_id: ConnectionId, reason: String },
    HeartbeatReceived { connection_id: ConnectionId, sequence: u64, latency: Option<Duration> },
}

/// Supervises every live connection: establishment, heartbeats, liveness
/// checks, and a periodic sweep that terminates stale connections.
pub struct ConnectionSupervisor {
    connections: Arc<RwLock<HashMap<ConnectionId, Connection>>>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    inactivity_timeout: Duration,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionSupervisor {
    pub fn new(heartbeat_interval: Duration, heartbeat_timeout: Duration, inactivity_timeout: Duration) -> Self {
        let (events, _rx) = broadcast::channel(1024);
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            heartbeat_interval,
            heartbeat_timeout,
            inactivity_timeout,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Establishes a new connection, immediately marking it Connected (the
    /// transport-level handshake is assumed to have already happened by the
    /// time this is called).
    pub async fn establish(&self, peer_id: PeerId, remote_endpoint: String, local_endpoint: String) -> ConnectionId {
        let connection_id = uuid::Uuid::new_v4();
        let mut connection = Connection::new(connection_id, peer_id, remote_endpoint, local_endpoint);
        connection.state = ConnectionState::Connected;
        self.connections.write().await.insert(connection_id, connection);
        log::info!("connection {connection_id} established");
        let _ = self.events.send(ConnectionEvent::Established(connection_id));
        connection_id
    }

    /// Gracefully terminates a connection with the given reason.
    pub async fn terminate(&self, connection_id: ConnectionId, reason: &str) -> Result<()> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&connection_id)
            .ok_or(ConnectionError::NotFound(connection_id))?;
        connection.state = ConnectionState::Terminating;
        log::info!("connection {connection_id} terminating: {reason}");
        connections.remove(&connection_id);
        let _ = self.events.send(ConnectionEvent::Terminated {
            connection_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Records an inbound heartbeat acknowledgement, feeding its round-trip
    /// time into the latency ring.
    pub async fn process_heartbeat(&self, connection_id: ConnectionId, rtt: Option<Duration>) -> Result<()> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&connection_id)
            .ok_or(ConnectionError::NotFound(connection_id))?;
        connection.last_heartbeat = SystemTime::now();
        connection.heartbeat_sequence += 1;
        if let Some(rtt) = rtt {
            connection.record_latency(rtt);
        }
        let sequence = connection.heartbeat_sequence;
        let _ = self.events.send(ConnectionEvent::HeartbeatReceived {
            connection_id,
            sequence,
            latency: rtt,
        });
        Ok(())
    }

    pub async fn update_activity(&self, connection_id: ConnectionId) -> Result<()> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&connection_id)
            .ok_or(ConnectionError::NotFound(connection_id))?;
        connection.last_activity = SystemTime::now();
        Ok(())
    }

    pub async fn healthy(&self, connection_id: ConnectionId) -> Result<bool> {
        let connections = self.connections.read().await;
        let connection = connections
            .get(&connection_id)
            .ok_or(ConnectionError::NotFound(connection_id))?;
        Ok(connection.is_healthy(self.heartbeat_timeout, self.inactivity_timeout))
    }

    pub async fn snapshot(&self, connection_id: ConnectionId) -> Result<Connection> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .cloned()
            .ok_or(ConnectionError::NotFound(connection_id))
    }

    /// Marks a send failure: the connection drops to Disconnected and a
    /// loss event fires.
    pub async fn mark_send_failure(&self, connection_id: ConnectionId) -> Result<()> {
        let mut connections = self.connections.write().await;
        let connection = connections
            .get_mut(&connection_id)
            .ok_or(ConnectionError::NotFound(connection_id))?;
        connection.state = ConnectionState::Disconnected;
        let _ = self.events.send(ConnectionEvent::Lost {
            connection_id,
            reason: "heartbeat send failed".to_string(),
        });
        Err(ConnectionError::HeartbeatSendFailed(connection_id))
    }

    /// Sweeps all connections, transitioning unhealthy ones to Terminating
    /// and tearing them down gracefully. Intended to be driven by a
    /// `tokio::spawn`ed interval task.
    pub async fn sweep(&self) {
        let stale: Vec<ConnectionId> = {
            let connections = self.connections.read().await;
            connections
                .values()
                .filter(|c| !c.is_healthy(self.heartbeat_timeout, self.inactivity_timeout))
                .map(|c| c.connection_id)
                .collect()
        };
        for connection_id in stale {
            log::warn!("connection {connection_id} failed health check, tearing down");
            let _ = self.terminate(connection_id, "health check failed").await;
        }
    }

    /// Terminates every connection with a uniform shutdown reason. Intended
    /// to be called once, at process shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<ConnectionId> = self.connections.read().await.keys().copied().collect();
        for connection_id in ids {
            let _ = self.terminate(connection_id, "System shutdown").await;
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Spawns the periodic sweeper as a background task, returning its
    /// handle so callers can abort it on shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(supervisor.heartbeat_interval);
            loop {
                ticker.tick().await;
                supervisor.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn establish_marks_connected_and_healthy() {
        let supervisor = ConnectionSupervisor::new(
            Duration::from_secs(30),
            Duration::from_secs(90),
            Duration::from_secs(600),
        );
        let id = supervisor.establish("peer-1".into(), "10.0.0.2:1234".into(), "10.0.0.1:5678".into()).await;
        assert!(supervisor.healthy(id).await.unwrap());
    }

    #[tokio::test]
    async fn heartbeat_updates_sequence_and_latency() {
        let supervisor = ConnectionSupervisor::new(
            Duration::from_secs(30),
            Duration::from_secs(90),
            Duration::from_secs(600),
        );
        let id = supervisor.establish("peer-1".into(), "a".into(), "b".into()).await;
        supervisor.process_heartbeat(id, Some(Duration::from_millis(40))).await.unwrap();
        supervisor.process_heartbeat(id, Some(Duration::from_millis(60))).await.unwrap();
        let snapshot = supervisor.snapshot(id).await.unwrap();
        assert_eq!(snapshot.heartbeat_sequence, 2);
        assert_eq!(snapshot.mean_latency(), Some(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn stale_connection_is_swept_to_terminated() {
        let supervisor = ConnectionSupervisor::new(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_secs(600),
        );
        let id = supervisor.establish("peer-1".into(), "a".into(), "b".into()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        supervisor.sweep().await;
        assert!(supervisor.snapshot(id).await.is_err());
    }

    #[tokio::test]
    async fn send_failure_transitions_to_disconnected_and_errors() {
        let supervisor = ConnectionSupervisor::new(
            Duration::from_secs(30),
            Duration::from_secs(90),
            Duration::from_secs(600),
        );
        let id = supervisor.establish("peer-1".into(), "a".into(), "b".into()).await;
        let result = supervisor.mark_send_failure(id).await;
        assert!(result.is_err());
        assert!(!supervisor.healthy(id).await.unwrap());
    }
}
