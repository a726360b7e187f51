//! Process-local registry of attached relayer streams.
//!
//! One live `ClusterConnection` per cluster id. The registry holds the
//! only shared reference; the owning session detaches through
//! `unregister`, which removes the entry only when the stored handle is
//! the caller's own (a displaced session must not evict its successor).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use metrics::gauge;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use uuid::Uuid;

use crate::error::ControlError;
use crate::models::now_ms;
use crate::proto::relayer::ControlFrame;

pub struct ClusterConnection {
    pub cluster_id: Uuid,
    pub organization_id: Uuid,
    pub attached_at: i64,
    sender: mpsc::Sender<Result<ControlFrame, Status>>,
    cancel: CancellationToken,
    last_heartbeat: AtomicI64,
    last_activity: AtomicI64,
}

impl ClusterConnection {
    pub fn new(
        cluster_id: Uuid,
        organization_id: Uuid,
        sender: mpsc::Sender<Result<ControlFrame, Status>>,
    ) -> Arc<Self> {
        let now = now_ms();
        Arc::new(Self {
            cluster_id,
            organization_id,
            attached_at: now,
            sender,
            cancel: CancellationToken::new(),
            last_heartbeat: AtomicI64::new(now),
            last_activity: AtomicI64::new(now),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Write a frame to the outbound channel, bounded by `timeout`. A
    /// full channel past the deadline or a gone receiver is a stream
    /// write failure.
    pub async fn send(&self, frame: ControlFrame, timeout: Duration) -> Result<(), ControlError> {
        match tokio::time::timeout(timeout, self.sender.send(Ok(frame))).await {
            Ok(Ok(())) => {
                self.mark_activity();
                Ok(())
            }
            Ok(Err(_)) => Err(ControlError::StreamIo("stream closed".into())),
            Err(_) => Err(ControlError::StreamIo("stream write timed out".into())),
        }
    }

    /// Close the stream with a final status and cancel both loops. The
    /// status write is best effort: a full channel just drops it.
    pub fn close(&self, reason: ControlError) {
        let status: Status = reason.into();
        let _ = self.sender.try_send(Err(status));
        self.cancel.cancel();
    }

    pub fn touch_heartbeat(&self) {
        let now = now_ms();
        self.last_heartbeat.store(now, Ordering::Relaxed);
        self.last_activity.store(now, Ordering::Relaxed);
    }

    pub fn mark_activity(&self) {
        self.last_activity.store(now_ms(), Ordering::Relaxed);
    }

    pub fn heartbeat_ms(&self) -> i64 {
        self.last_heartbeat.load(Ordering::Relaxed)
    }

    pub fn activity_ms(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<Uuid, Arc<ClusterConnection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic insert-or-replace. Returns the displaced handle, which the
    /// caller must close.
    pub fn register(&self, conn: Arc<ClusterConnection>) -> Option<Arc<ClusterConnection>> {
        let mut map = self.inner.lock();
        let prev = map.insert(conn.cluster_id, conn.clone());
        if let Some(ref prev) = prev {
            // Re-registering the identical handle would make the
            // single-writer discipline unsound; that is a bug worth
            // dying for.
            assert!(
                !Arc::ptr_eq(prev, &conn),
                "cluster connection registered twice: {}",
                conn.cluster_id
            );
        }
        gauge!("relayer_sessions").set(map.len() as f64);
        prev
    }

    /// Remove only when `handle` is the stored connection. A session
    /// that was displaced finds its successor here and leaves it alone.
    pub fn unregister(&self, cluster_id: Uuid, handle: &Arc<ClusterConnection>) -> bool {
        let mut map = self.inner.lock();
        match map.get(&cluster_id) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                map.remove(&cluster_id);
                gauge!("relayer_sessions").set(map.len() as f64);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, cluster_id: Uuid) -> Option<Arc<ClusterConnection>> {
        self.inner.lock().get(&cluster_id).cloned()
    }

    /// Record a heartbeat. Returns false when no stream is attached.
    pub fn touch(&self, cluster_id: Uuid) -> bool {
        match self.inner.lock().get(&cluster_id) {
            Some(conn) => {
                conn.touch_heartbeat();
                true
            }
            None => false,
        }
    }

    /// `(cluster_id, last_heartbeat_ms)` for every attached stream.
    pub fn snapshot(&self) -> Vec<(Uuid, i64)> {
        self.inner
            .lock()
            .iter()
            .map(|(id, conn)| (*id, conn.heartbeat_ms()))
            .collect()
    }

    /// Live connections for an organization (registration fan-out).
    pub fn connections_for_org(&self, organization_id: Uuid) -> Vec<Arc<ClusterConnection>> {
        self.inner
            .lock()
            .values()
            .filter(|c| c.organization_id == organization_id)
            .cloned()
            .collect()
    }

    /// Remove and return every connection (shutdown).
    pub fn drain(&self) -> Vec<Arc<ClusterConnection>> {
        let mut map = self.inner.lock();
        let conns = map.drain().map(|(_, c)| c).collect();
        gauge!("relayer_sessions").set(0.0);
        conns
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(cluster_id: Uuid) -> Arc<ClusterConnection> {
        let (tx, _rx) = mpsc::channel(1);
        ClusterConnection::new(cluster_id, Uuid::new_v4(), tx)
    }

    #[test]
    fn register_replaces_and_returns_prev() {
        let registry = ConnectionRegistry::new();
        let cluster = Uuid::new_v4();
        let first = conn(cluster);
        let second = conn(cluster);

        assert!(registry.register(first.clone()).is_none());
        let prev = registry.register(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&prev, &first));

        // Exactly one connection per cluster id, and it is the newer one.
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.lookup(cluster).unwrap(), &second));
    }

    #[test]
    fn unregister_requires_handle_identity() {
        let registry = ConnectionRegistry::new();
        let cluster = Uuid::new_v4();
        let displaced = conn(cluster);
        let successor = conn(cluster);

        registry.register(displaced.clone());
        registry.register(successor.clone());

        // The slow teardown of the displaced session must not evict the
        // fresh attach.
        assert!(!registry.unregister(cluster, &displaced));
        assert!(registry.lookup(cluster).is_some());

        assert!(registry.unregister(cluster, &successor));
        assert!(registry.lookup(cluster).is_none());

        // Detaching an already-gone handle is a no-op.
        assert!(!registry.unregister(cluster, &successor));
    }

    #[test]
    fn touch_updates_snapshot() {
        let registry = ConnectionRegistry::new();
        let cluster = Uuid::new_v4();
        let c = conn(cluster);
        registry.register(c.clone());

        let before = registry.snapshot()[0].1;
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(registry.touch(cluster));
        let after = registry.snapshot()[0].1;
        assert!(after >= before);

        assert!(!registry.touch(Uuid::new_v4()));
    }

    #[test]
    fn drain_empties_registry() {
        let registry = ConnectionRegistry::new();
        registry.register(conn(Uuid::new_v4()));
        registry.register(conn(Uuid::new_v4()));
        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn connections_for_org_filters() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let org = Uuid::new_v4();
        let mine = ClusterConnection::new(Uuid::new_v4(), org, tx);
        registry.register(mine.clone());
        registry.register(conn(Uuid::new_v4()));

        let found = registry.connections_for_org(org);
        assert_eq!(found.len(), 1);
        assert!(Arc::ptr_eq(&found[0], &mine));
    }

    #[tokio::test]
    async fn send_fails_when_receiver_gone() {
        let (tx, rx) = mpsc::channel(1);
        let c = ClusterConnection::new(Uuid::new_v4(), Uuid::new_v4(), tx);
        drop(rx);
        let err = c
            .send(ControlFrame { frame: None }, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::StreamIo(_)));
    }

    #[tokio::test]
    async fn close_cancels_and_delivers_status() {
        let (tx, mut rx) = mpsc::channel(4);
        let c = ClusterConnection::new(Uuid::new_v4(), Uuid::new_v4(), tx);
        let token = c.cancel_token();
        c.close(ControlError::Replaced);
        assert!(token.is_cancelled());
        match rx.recv().await {
            Some(Err(status)) => assert_eq!(status.code(), tonic::Code::AlreadyExists),
            other => panic!("expected close status, got {other:?}"),
        }
    }
}
