//! Per-(organization, cluster) dispatch queues.
//!
//! Ordering within a queue is priority class first (high > normal > low),
//! FIFO within a class. Delivery between enqueue and stream write is
//! at-least-once: a message dequeued but not written comes back via
//! `requeue_front`, at the head of its class.
//!
//! Two backings: Redis (three lists per key; survives control-plane
//! restart) and an in-memory heap for deployments without Redis. The
//! in-memory queue is NOT durable; queued dispatches die with the
//! process.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::ControlError;
use crate::models::{Priority, QueueMessage};

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Non-blocking append. `QueueFull` once the per-cluster depth cap
    /// (when configured) is reached.
    async fn enqueue(
        &self,
        org: Uuid,
        cluster: Uuid,
        msg: QueueMessage,
    ) -> Result<(), ControlError>;

    /// Block up to `wait_up_to` for the next message; `None` on timeout.
    /// Single consumer per `(org, cluster)` key.
    async fn dequeue(
        &self,
        org: Uuid,
        cluster: Uuid,
        wait_up_to: Duration,
    ) -> Result<Option<QueueMessage>, ControlError>;

    /// Return a dequeued-but-unwritten message to the head of its
    /// priority class. Never bounded by the depth cap.
    async fn requeue_front(
        &self,
        org: Uuid,
        cluster: Uuid,
        msg: QueueMessage,
    ) -> Result<(), ControlError>;

    /// Stop the queue: wakes blocked consumers. Messages already queued
    /// stay in place (and, for the Redis backing, on the server).
    fn close(&self);
}

// ---- in-memory backing ----

struct Entry {
    msg: QueueMessage,
    rank: u8,
    seq: i64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest
        // (rank, seq) pops first.
        (other.rank, other.seq).cmp(&(self.rank, self.seq))
    }
}

struct Lane {
    heap: std::collections::BinaryHeap<Entry>,
    next_seq: i64,
    front_seq: i64,
    notify: Arc<Notify>,
}

impl Default for Lane {
    fn default() -> Self {
        Self {
            heap: std::collections::BinaryHeap::new(),
            next_seq: 1,
            front_seq: 0,
            notify: Arc::new(Notify::new()),
        }
    }
}

struct MemoryInner {
    lanes: HashMap<(Uuid, Uuid), Lane>,
    closed: bool,
}

/// Process-local queue. Not durable: a restart loses queued dispatches.
pub struct MemoryWorkQueue {
    inner: Mutex<MemoryInner>,
    depth_limit: usize,
}

impl MemoryWorkQueue {
    /// `depth_limit = 0` means unbounded.
    pub fn new(depth_limit: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                lanes: HashMap::new(),
                closed: false,
            }),
            depth_limit,
        }
    }

    fn push(&self, key: (Uuid, Uuid), msg: QueueMessage, front: bool) -> Result<(), ControlError> {
        let mut inner = self.inner.lock();
        let lane = inner.lanes.entry(key).or_default();
        if !front && self.depth_limit > 0 && lane.heap.len() >= self.depth_limit {
            return Err(ControlError::QueueFull(key.1.to_string()));
        }
        let rank = msg.priority().rank();
        let seq = if front {
            lane.front_seq -= 1;
            lane.front_seq
        } else {
            let seq = lane.next_seq;
            lane.next_seq += 1;
            seq
        };
        lane.heap.push(Entry { msg, rank, seq });
        let notify = lane.notify.clone();
        drop(inner);
        notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(
        &self,
        org: Uuid,
        cluster: Uuid,
        msg: QueueMessage,
    ) -> Result<(), ControlError> {
        let priority = msg.priority();
        self.push((org, cluster), msg, false)?;
        counter!("work_queue_enqueued_total", "priority" => priority.as_str()).increment(1);
        Ok(())
    }

    async fn dequeue(
        &self,
        org: Uuid,
        cluster: Uuid,
        wait_up_to: Duration,
    ) -> Result<Option<QueueMessage>, ControlError> {
        let key = (org, cluster);
        let deadline = Instant::now() + wait_up_to;
        loop {
            let notify = {
                let mut inner = self.inner.lock();
                let closed = inner.closed;
                let lane = inner.lanes.entry(key).or_default();
                if let Some(entry) = lane.heap.pop() {
                    return Ok(Some(entry.msg));
                }
                if closed {
                    return Ok(None);
                }
                lane.notify.clone()
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, notify.notified()).await;
        }
    }

    async fn requeue_front(
        &self,
        org: Uuid,
        cluster: Uuid,
        msg: QueueMessage,
    ) -> Result<(), ControlError> {
        let priority = msg.priority();
        self.push((org, cluster), msg, true)?;
        counter!("work_queue_requeued_total", "priority" => priority.as_str()).increment(1);
        Ok(())
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        for lane in inner.lanes.values() {
            lane.notify.notify_waiters();
        }
    }
}

// ---- Redis backing ----

/// Redis-backed queue: three lists per `(org, cluster)` key, one per
/// priority class. BLPOP's key ordering yields priority-then-FIFO, RPUSH
/// appends within a class, LPUSH is the head-of-class requeue. Queued
/// dispatches survive a control-plane restart.
pub struct RedisWorkQueue {
    pool: deadpool_redis::Pool,
    depth_limit: usize,
}

impl RedisWorkQueue {
    pub fn new(pool: deadpool_redis::Pool, depth_limit: usize) -> Self {
        Self { pool, depth_limit }
    }

    fn list_key(org: Uuid, cluster: Uuid, priority: Priority) -> String {
        format!("ferry:queue:{}:{}:{}", org, cluster, priority.as_str())
    }

    fn list_keys(org: Uuid, cluster: Uuid) -> [String; 3] {
        [
            Self::list_key(org, cluster, Priority::High),
            Self::list_key(org, cluster, Priority::Normal),
            Self::list_key(org, cluster, Priority::Low),
        ]
    }

    async fn push(
        &self,
        org: Uuid,
        cluster: Uuid,
        msg: &QueueMessage,
        front: bool,
    ) -> Result<(), ControlError> {
        let payload = serde_json::to_vec(msg)
            .context("failed to encode queue message")
            .map_err(ControlError::internal)?;
        let mut conn = self
            .pool
            .get()
            .await
            .context("failed to get Redis connection")
            .map_err(ControlError::internal)?;

        if !front && self.depth_limit > 0 {
            let mut depth = 0i64;
            for key in Self::list_keys(org, cluster) {
                let len: i64 = redis::cmd("LLEN")
                    .arg(&key)
                    .query_async(&mut conn)
                    .await
                    .context("failed to measure queue depth")
                    .map_err(ControlError::internal)?;
                depth += len;
            }
            if depth >= self.depth_limit as i64 {
                return Err(ControlError::QueueFull(cluster.to_string()));
            }
        }

        let key = Self::list_key(org, cluster, msg.priority());
        let op = if front { "LPUSH" } else { "RPUSH" };
        let _: i64 = redis::cmd(op)
            .arg(&key)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .context("failed to push queue message")
            .map_err(ControlError::internal)?;
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn enqueue(
        &self,
        org: Uuid,
        cluster: Uuid,
        msg: QueueMessage,
    ) -> Result<(), ControlError> {
        let priority = msg.priority();
        self.push(org, cluster, &msg, false).await?;
        counter!("work_queue_enqueued_total", "priority" => priority.as_str()).increment(1);
        Ok(())
    }

    async fn dequeue(
        &self,
        org: Uuid,
        cluster: Uuid,
        wait_up_to: Duration,
    ) -> Result<Option<QueueMessage>, ControlError> {
        let mut conn = self
            .pool
            .get()
            .await
            .context("failed to get Redis connection")
            .map_err(ControlError::internal)?;
        let keys = Self::list_keys(org, cluster);
        let popped: Option<(String, Vec<u8>)> = redis::cmd("BLPOP")
            .arg(&keys[0])
            .arg(&keys[1])
            .arg(&keys[2])
            .arg(wait_up_to.as_secs_f64())
            .query_async(&mut conn)
            .await
            .context("failed to pop queue message")
            .map_err(ControlError::internal)?;
        match popped {
            Some((_key, payload)) => {
                let msg = serde_json::from_slice(&payload)
                    .context("failed to decode queue message")
                    .map_err(ControlError::internal)?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    async fn requeue_front(
        &self,
        org: Uuid,
        cluster: Uuid,
        msg: QueueMessage,
    ) -> Result<(), ControlError> {
        let priority = msg.priority();
        self.push(org, cluster, &msg, true).await?;
        counter!("work_queue_requeued_total", "priority" => priority.as_str()).increment(1);
        Ok(())
    }

    fn close(&self) {
        // Lists live on the Redis server; nothing to release here.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work(name: &str, priority: Priority) -> QueueMessage {
        QueueMessage::Work {
            execution_id: Uuid::new_v4(),
            agent_name: name.into(),
            input_json: "{}".into(),
            priority,
        }
    }

    fn agent_name(msg: &QueueMessage) -> String {
        match msg {
            QueueMessage::Work { agent_name, .. } => agent_name.clone(),
            QueueMessage::Registration { agent_name, .. } => agent_name.clone(),
        }
    }

    #[tokio::test]
    async fn priority_classes_drain_in_order() {
        let queue = MemoryWorkQueue::new(0);
        let org = Uuid::new_v4();
        let cluster = Uuid::new_v4();

        queue
            .enqueue(org, cluster, work("a", Priority::Low))
            .await
            .unwrap();
        queue
            .enqueue(org, cluster, work("b", Priority::High))
            .await
            .unwrap();
        queue
            .enqueue(org, cluster, work("c", Priority::Normal))
            .await
            .unwrap();

        let first = queue
            .dequeue(org, cluster, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let second = queue
            .dequeue(org, cluster, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let third = queue
            .dequeue(org, cluster, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(agent_name(&first), "b");
        assert_eq!(agent_name(&second), "c");
        assert_eq!(agent_name(&third), "a");
    }

    #[tokio::test]
    async fn fifo_within_class_under_interleave() {
        let queue = MemoryWorkQueue::new(0);
        let org = Uuid::new_v4();
        let cluster = Uuid::new_v4();

        // 10 high and 10 normal, interleaved.
        for i in 0..10 {
            queue
                .enqueue(org, cluster, work(&format!("h{i}"), Priority::High))
                .await
                .unwrap();
            queue
                .enqueue(org, cluster, work(&format!("n{i}"), Priority::Normal))
                .await
                .unwrap();
        }

        for i in 0..10 {
            let msg = queue
                .dequeue(org, cluster, Duration::from_millis(10))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(agent_name(&msg), format!("h{i}"));
        }
        for i in 0..10 {
            let msg = queue
                .dequeue(org, cluster, Duration::from_millis(10))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(agent_name(&msg), format!("n{i}"));
        }
    }

    #[tokio::test]
    async fn requeue_front_lands_ahead_of_its_class() {
        let queue = MemoryWorkQueue::new(0);
        let org = Uuid::new_v4();
        let cluster = Uuid::new_v4();

        queue
            .enqueue(org, cluster, work("first", Priority::Normal))
            .await
            .unwrap();
        queue
            .enqueue(org, cluster, work("second", Priority::Normal))
            .await
            .unwrap();
        queue
            .enqueue(org, cluster, work("urgent", Priority::High))
            .await
            .unwrap();

        let taken = queue
            .dequeue(org, cluster, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(agent_name(&taken), "urgent");

        // Write failed; the message goes back to the head of high.
        queue.requeue_front(org, cluster, taken).await.unwrap();

        let redelivered = queue
            .dequeue(org, cluster, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(agent_name(&redelivered), "urgent");
        let next = queue
            .dequeue(org, cluster, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(agent_name(&next), "first");
    }

    #[tokio::test]
    async fn dequeue_times_out_empty() {
        let queue = MemoryWorkQueue::new(0);
        let started = std::time::Instant::now();
        let msg = queue
            .dequeue(Uuid::new_v4(), Uuid::new_v4(), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(msg.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn depth_cap_rejects_but_requeue_bypasses() {
        let queue = MemoryWorkQueue::new(2);
        let org = Uuid::new_v4();
        let cluster = Uuid::new_v4();

        queue
            .enqueue(org, cluster, work("a", Priority::Normal))
            .await
            .unwrap();
        queue
            .enqueue(org, cluster, work("b", Priority::Normal))
            .await
            .unwrap();
        let err = queue
            .enqueue(org, cluster, work("c", Priority::Normal))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::QueueFull(_)));

        // A dequeued message must always be returnable.
        let taken = queue
            .dequeue(org, cluster, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        queue
            .enqueue(org, cluster, work("d", Priority::Normal))
            .await
            .unwrap();
        queue.requeue_front(org, cluster, taken).await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_wakes_blocked_consumer() {
        let queue = Arc::new(MemoryWorkQueue::new(0));
        let org = Uuid::new_v4();
        let cluster = Uuid::new_v4();

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(org, cluster, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue
            .enqueue(org, cluster, work("wake", Priority::Normal))
            .await
            .unwrap();
        let msg = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(agent_name(&msg), "wake");
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let queue = Arc::new(MemoryWorkQueue::new(0));
        let org = Uuid::new_v4();
        let cluster = Uuid::new_v4();

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(org, cluster, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        let msg = consumer.await.unwrap().unwrap();
        assert!(msg.is_none());
    }

    #[tokio::test]
    async fn queues_are_isolated_per_cluster() {
        let queue = MemoryWorkQueue::new(0);
        let org = Uuid::new_v4();
        let cluster_a = Uuid::new_v4();
        let cluster_b = Uuid::new_v4();

        queue
            .enqueue(org, cluster_a, work("for-a", Priority::Normal))
            .await
            .unwrap();
        assert!(
            queue
                .dequeue(org, cluster_b, Duration::from_millis(10))
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            queue
                .dequeue(org, cluster_a, Duration::from_millis(10))
                .await
                .unwrap()
                .is_some()
        );
    }
}
