//! Execution lifecycle events for the downstream workflow engine.
//!
//! The outbox row is written in the same transaction as the terminal
//! execution update, so the event exists iff the transition happened
//! (at least once from the consumer's perspective). The Redis publish is
//! a best-effort wake-up for push consumers; the outbox is the contract.

use deadpool_postgres::Transaction;
use serde_json::json;
use uuid::Uuid;

use crate::models::now_ms;

pub const LIFECYCLE_CHANNEL: &str = "ferry.lifecycle";

pub const EXECUTION_COMPLETED: &str = "execution.completed";
pub const EXECUTION_FAILED: &str = "execution.failed";

#[derive(Clone, Default)]
pub struct EventPublisher {
    redis: Option<deadpool_redis::Pool>,
}

impl EventPublisher {
    pub fn new(redis: Option<deadpool_redis::Pool>) -> Self {
        Self { redis }
    }

    /// Write the outbox row inside the caller's transaction.
    pub async fn record(
        &self,
        txn: &Transaction<'_>,
        organization_id: Uuid,
        execution_id: Uuid,
        kind: &str,
        payload: &serde_json::Value,
    ) -> anyhow::Result<()> {
        txn.execute(
            r#"
            INSERT INTO lifecycle_events (organization_id, execution_id, kind, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
            &[&organization_id, &execution_id, &kind, payload, &now_ms()],
        )
        .await?;
        Ok(())
    }

    /// Fire-and-forget notification after the transaction committed.
    pub fn notify(&self, organization_id: Uuid, execution_id: Uuid, kind: &str) {
        let Some(pool) = self.redis.clone() else {
            return;
        };
        let kind = kind.to_string();
        tokio::spawn(async move {
            let payload = json!({
                "kind": kind,
                "organizationId": organization_id,
                "executionId": execution_id,
            })
            .to_string();
            let result = async {
                let mut conn = pool.get().await?;
                let _: i64 = redis::cmd("PUBLISH")
                    .arg(LIFECYCLE_CHANNEL)
                    .arg(payload)
                    .query_async(&mut conn)
                    .await?;
                Ok::<_, anyhow::Error>(())
            }
            .await;
            if let Err(e) = result {
                tracing::warn!(?e, kind, %execution_id, "lifecycle publish failed");
            }
        });
    }
}
