//! # Connection Registry
//!
//! Tracks every open admin push channel and fans envelopes out to them.
//!
//! ## Broadcast Pass
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         broadcast(envelope)                             │
//! │                                                                         │
//! │  1. Snapshot    DashMap ──► Vec<Arc<Connection>>   (no lock held after) │
//! │                                                                         │
//! │  2. Write       join_all ─┬─► conn #1  send_timeout ──► Delivered      │
//! │                           ├─► conn #2  send_timeout ──► Failed ─┐      │
//! │                           └─► conn #3  closed flag  ──► Skipped │      │
//! │                                                                 │      │
//! │  3. Purge       unregister(#2) in the same pass ◄───────────────┘      │
//! │                                                                         │
//! │  Result: BroadcastReport { delivered: 1, dropped: [#2], skipped: 1 }   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each connection owns a bounded queue read by its push stream. A write
//! that finds the receiver gone, or that cannot enqueue before the write
//! deadline, is a failed write: the connection is removed and the pass
//! carries on. One stalled console never delays the others.
//!
//! Registrations that land while a pass is running may miss that envelope.
//! Connections removed while a pass is running are marked closed and are
//! not written to. Once [`ConnectionRegistry::close_all`] has run, the
//! registry refuses new registrations.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use herald_core::EventEnvelope;

use crate::error::{BusError, BusResult};

/// Default per-connection write deadline.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of envelopes buffered per connection.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

// =============================================================================
// Identity
// =============================================================================

/// Process-unique connection identifier, assigned in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Result of writing one envelope to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    Delivered,
    Failed,
    Skipped,
}

/// One open push channel.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    session_id: String,
    sender: mpsc::Sender<Arc<EventEnvelope>>,
    last_write_ok: AtomicBool,
    closed: AtomicBool,
    connected_at: DateTime<Utc>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether the most recent write to this connection succeeded.
    pub fn last_write_ok(&self) -> bool {
        self.last_write_ok.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Enqueues an envelope, waiting at most `deadline` for queue space.
    pub(crate) async fn write(
        &self,
        envelope: Arc<EventEnvelope>,
        deadline: Duration,
    ) -> WriteOutcome {
        if self.is_closed() {
            return WriteOutcome::Skipped;
        }

        let ok = match self.sender.send_timeout(envelope, deadline).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(
                    connection_id = %self.id,
                    session_id = %self.session_id,
                    deadline_ms = deadline.as_millis() as u64,
                    "Write deadline elapsed"
                );
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                debug!(connection_id = %self.id, "Push stream already closed");
                false
            }
        };

        self.last_write_ok.store(ok, Ordering::Release);
        if ok {
            WriteOutcome::Delivered
        } else {
            WriteOutcome::Failed
        }
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            session_id: self.session_id.clone(),
            connected_at: self.connected_at,
            last_write_ok: self.last_write_ok(),
        }
    }
}

/// Diagnostic snapshot of a registered connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_write_ok: bool,
}

// =============================================================================
// Broadcast Report
// =============================================================================

/// Outcome of one broadcast pass. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Connections the envelope was enqueued on.
    pub delivered: usize,
    /// Connections removed because their write failed.
    pub dropped: Vec<ConnectionId>,
    /// Connections that closed mid-pass and were not written.
    pub skipped: usize,
}

impl BroadcastReport {
    /// Connections that were part of the snapshot.
    pub fn attempted(&self) -> usize {
        self.delivered + self.dropped.len() + self.skipped
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Set of open push channels.
///
/// Shared as `Arc<ConnectionRegistry>` between the HTTP handlers that
/// register channels and the [`EventBus`](crate::bus::EventBus) that
/// broadcasts to them.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    next_id: AtomicU64,
    write_timeout: Duration,
    queue_capacity: usize,
    closing: AtomicBool,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_TIMEOUT, DEFAULT_QUEUE_CAPACITY)
    }
}

impl ConnectionRegistry {
    pub fn new(write_timeout: Duration, queue_capacity: usize) -> Self {
        ConnectionRegistry {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            write_timeout,
            queue_capacity: queue_capacity.max(1),
            closing: AtomicBool::new(false),
        }
    }

    /// Adds a connection for an admitted session.
    ///
    /// Returns the registration handle (dropping it unregisters) and the
    /// receiving end of the connection's queue. Fails with
    /// [`BusError::ShuttingDown`] once the registry is closing.
    pub fn register(
        self: &Arc<Self>,
        session_id: impl Into<String>,
    ) -> BusResult<(RegistrationHandle, mpsc::Receiver<Arc<EventEnvelope>>)> {
        if self.is_closing() {
            return Err(BusError::ShuttingDown);
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.queue_capacity);

        let connection = Arc::new(Connection {
            id,
            session_id: session_id.into(),
            sender,
            last_write_ok: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            connected_at: Utc::now(),
        });

        info!(
            connection_id = %id,
            session_id = %connection.session_id,
            "Connection registered"
        );
        self.connections.insert(id, connection);

        let handle = RegistrationHandle {
            id,
            registry: Arc::clone(self),
        };

        // close_all may have swept the map between the check above and the
        // insert; dropping the handle removes the straggler.
        if self.is_closing() {
            return Err(BusError::ShuttingDown);
        }
        Ok((handle, receiver))
    }

    /// Removes a connection. Returns false if it was already gone.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some((_, connection)) => {
                connection.closed.store(true, Ordering::Release);
                info!(
                    connection_id = %id,
                    session_id = %connection.session_id,
                    "Connection unregistered"
                );
                true
            }
            None => false,
        }
    }

    /// Delivers an envelope to every registered connection.
    pub async fn broadcast(&self, envelope: Arc<EventEnvelope>) -> BroadcastReport {
        let targets: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        if targets.is_empty() {
            debug!(event_type = %envelope.event_type, "No connections, event dropped");
            return BroadcastReport::default();
        }

        let writes = targets.iter().map(|connection| {
            let envelope = Arc::clone(&envelope);
            async move {
                let outcome = connection.write(envelope, self.write_timeout).await;
                if outcome == WriteOutcome::Failed {
                    self.unregister(connection.id);
                }
                (connection.id, outcome)
            }
        });

        let mut report = BroadcastReport::default();
        for (id, outcome) in join_all(writes).await {
            match outcome {
                WriteOutcome::Delivered => report.delivered += 1,
                WriteOutcome::Failed => report.dropped.push(id),
                WriteOutcome::Skipped => report.skipped += 1,
            }
        }

        debug!(
            event_type = %envelope.event_type,
            delivered = report.delivered,
            dropped = report.dropped.len(),
            skipped = report.skipped,
            "Broadcast complete"
        );
        report
    }

    /// Removes every connection, ending their push streams, and refuses
    /// any later registration. Used on shutdown.
    pub fn close_all(&self) -> usize {
        self.closing.store(true, Ordering::SeqCst);
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter(|id| self.unregister(*id)).count()
    }

    /// Whether [`close_all`](Self::close_all) has been called.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Sessions with at least one open channel.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.value().session_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Snapshot of every registered connection, oldest first.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    #[cfg(test)]
    fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }
}

// =============================================================================
// Registration Handle
// =============================================================================

/// Keeps a connection registered for as long as it lives.
#[derive(Debug)]
pub struct RegistrationHandle {
    id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
}

impl RegistrationHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Removes the connection now. Safe to call more than once.
    pub fn unregister(&self) -> bool {
        self.registry.unregister(self.id)
    }
}

impl Drop for RegistrationHandle {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::EventType;

    fn registry() -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::default())
    }

    fn envelope(event_type: EventType) -> Arc<EventEnvelope> {
        Arc::new(EventEnvelope::new(event_type))
    }

    #[tokio::test]
    async fn test_every_connection_receives_once() {
        let registry = registry();
        let (_h1, mut rx1) = registry.register("admin-a").unwrap();
        let (_h2, mut rx2) = registry.register("admin-b").unwrap();
        let (_h3, mut rx3) = registry.register("admin-c").unwrap();

        let sent = envelope(EventType::NewOrder);
        let report = registry.broadcast(Arc::clone(&sent)).await;

        assert_eq!(report.delivered, 3);
        assert!(report.dropped.is_empty());
        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            assert_eq!(*rx.recv().await.unwrap(), *sent);
            assert!(rx.try_recv().is_err());
        }
        assert_eq!(registry.connection_count(), 3);
    }

    #[tokio::test]
    async fn test_failed_write_is_purged_and_others_still_receive() {
        let registry = registry();
        let (_alive, mut alive_rx) = registry.register("admin-a").unwrap();
        let (dead, dead_rx) = registry.register("admin-b").unwrap();
        drop(dead_rx);

        let report = registry.broadcast(envelope(EventType::OrderUpdated)).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, vec![dead.id()]);
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(
            alive_rx.recv().await.unwrap().event_type,
            EventType::OrderUpdated
        );

        // The purged connection is not written again.
        let report = registry.broadcast(envelope(EventType::StatsUpdated)).await;
        assert_eq!(report.attempted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_connection_times_out() {
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_millis(50), 1));
        let (stalled, _stalled_rx) = registry.register("admin-slow").unwrap();
        let (_fast, mut fast_rx) = registry.register("admin-fast").unwrap();

        // Fill the stalled connection's queue; nobody reads it.
        registry.broadcast(envelope(EventType::NewMessage)).await;
        fast_rx.recv().await.unwrap();

        let report = registry.broadcast(envelope(EventType::NewMessage)).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, vec![stalled.id()]);
        assert_eq!(registry.session_ids(), vec!["admin-fast".to_string()]);
    }

    #[tokio::test]
    async fn test_no_connections_is_a_silent_drop() {
        let registry = registry();
        let report = registry.broadcast(envelope(EventType::NewMessage)).await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = registry();
        let (handle, _rx) = registry.register("admin-a").unwrap();

        assert!(handle.unregister());
        assert!(!handle.unregister());
        assert!(!registry.unregister(handle.id()));
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_handle_unregisters() {
        let registry = registry();
        let (handle, _rx) = registry.register("admin-a").unwrap();
        assert_eq!(registry.connection_count(), 1);

        drop(handle);
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_connection_is_skipped() {
        let registry = registry();
        let (handle, _rx) = registry.register("admin-a").unwrap();
        let connection = registry.get(handle.id()).unwrap();

        handle.unregister();
        let outcome = connection
            .write(envelope(EventType::NewOrder), DEFAULT_WRITE_TIMEOUT)
            .await;

        assert_eq!(outcome, WriteOutcome::Skipped);
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_close_all_ends_queues() {
        let registry = registry();
        let (_h1, mut rx1) = registry.register("admin-a").unwrap();
        let (_h2, mut rx2) = registry.register("admin-b").unwrap();

        assert_eq!(registry.close_all(), 2);
        assert_eq!(registry.connection_count(), 0);
        assert!(rx1.recv().await.is_none());
        assert!(rx2.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_register_refused_once_closing() {
        let registry = registry();
        let (_handle, _rx) = registry.register("admin-a").unwrap();

        registry.close_all();

        assert!(registry.is_closing());
        assert!(matches!(
            registry.register("admin-b"),
            Err(BusError::ShuttingDown)
        ));
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_broadcast_during_registration_churn() {
        let registry = Arc::new(ConnectionRegistry::new(DEFAULT_WRITE_TIMEOUT, 256));
        let (stable, mut stable_rx) = registry.register("admin-stable").unwrap();

        let churn = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for i in 0..200 {
                    let (handle, rx) = registry.register(format!("admin-{}", i)).unwrap();
                    tokio::task::yield_now().await;
                    if i % 2 == 0 {
                        // Reader gone first: a racing write fails and purges it.
                        drop(rx);
                        tokio::task::yield_now().await;
                    }
                    drop(handle);
                }
            })
        };

        let mut reports = Vec::new();
        for _ in 0..100 {
            reports.push(registry.broadcast(envelope(EventType::StatsUpdated)).await);
            tokio::task::yield_now().await;
        }
        churn.await.unwrap();

        // The long-lived connection saw every envelope exactly once.
        for _ in 0..100 {
            assert_eq!(stable_rx.recv().await.unwrap().event_type, EventType::StatsUpdated);
        }
        assert!(stable_rx.try_recv().is_err());

        // A dropped connection is purged in the pass that failed it and never
        // shows up again.
        let mut dropped: Vec<ConnectionId> =
            reports.iter().flat_map(|r| r.dropped.iter().copied()).collect();
        assert!(!dropped.contains(&stable.id()));
        let total = dropped.len();
        dropped.sort();
        dropped.dedup();
        assert_eq!(dropped.len(), total);

        assert!(reports.iter().all(|r| r.delivered >= 1));
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.session_ids(), vec!["admin-stable".to_string()]);
    }

    #[tokio::test]
    async fn test_connection_snapshots() {
        let registry = registry();
        let (first, _rx1) = registry.register("admin-b").unwrap();
        let (second, _rx2) = registry.register("admin-a").unwrap();
        let (_third, _rx3) = registry.register("admin-a").unwrap();

        assert!(first.id() < second.id());
        assert_eq!(registry.session_ids(), vec!["admin-a", "admin-b"]);

        let infos = registry.connections();
        assert_eq!(infos.len(), 3);
        assert_eq!(infos[0].id, first.id());
        assert!(infos.iter().all(|info| info.last_write_ok));
    }
}
