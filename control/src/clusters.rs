//! Cluster row persistence.

use anyhow::{Context, Result};
use deadpool_postgres::Pool;
use uuid::Uuid;

use crate::models::{Cluster, ClusterStatus, now_ms};

pub async fn get_cluster(pool: &Pool, id: Uuid) -> Result<Option<Cluster>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_opt(
            r#"
            SELECT id, organization_id, name, status, secret_hash,
                   relayer_version, last_heartbeat, created_at
            FROM clusters
            WHERE id = $1
            "#,
            &[&id],
        )
        .await
        .context("failed to query cluster")?;
    row.map(|r| Cluster::from_row(&r)).transpose()
}

pub async fn find_by_name(pool: &Pool, organization_id: Uuid, name: &str) -> Result<Option<Cluster>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_opt(
            r#"
            SELECT id, organization_id, name, status, secret_hash,
                   relayer_version, last_heartbeat, created_at
            FROM clusters
            WHERE organization_id = $1 AND name = $2
            "#,
            &[&organization_id, &name],
        )
        .await
        .context("failed to query cluster by name")?;
    row.map(|r| Cluster::from_row(&r)).transpose()
}

/// Insert a PENDING cluster row at registration time. `None` means a
/// concurrent registration won the `(organization, name)` slot; the
/// caller must fall back to the stored row (and must not hand out the
/// secret it generated for the losing insert).
pub async fn create_cluster(
    pool: &Pool,
    organization_id: Uuid,
    name: &str,
    secret_hash: &str,
    relayer_version: &str,
    capabilities: &[String],
) -> Result<Option<Cluster>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let id = Uuid::new_v4();
    let caps = serde_json::json!(capabilities);
    let row = client
        .query_opt(
            r#"
            INSERT INTO clusters
                (id, organization_id, name, status, secret_hash, relayer_version, capabilities, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (organization_id, name) DO NOTHING
            RETURNING id, organization_id, name, status, secret_hash,
                      relayer_version, last_heartbeat, created_at
            "#,
            &[
                &id,
                &organization_id,
                &name,
                &ClusterStatus::Pending.as_str(),
                &secret_hash,
                &relayer_version,
                &caps,
                &now_ms(),
            ],
        )
        .await
        .context("failed to insert cluster")?;
    row.map(|r| Cluster::from_row(&r)).transpose()
}

pub async fn set_status(pool: &Pool, id: Uuid, status: ClusterStatus) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;
    client
        .execute(
            "UPDATE clusters SET status = $2 WHERE id = $1",
            &[&id, &status.as_str()],
        )
        .await
        .context("failed to update cluster status")?;
    Ok(())
}

/// Activate on stream attach, stamping the heartbeat.
pub async fn mark_active(pool: &Pool, id: Uuid, relayer_version: Option<&str>) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;
    client
        .execute(
            r#"
            UPDATE clusters
            SET status = $2, last_heartbeat = $3,
                relayer_version = COALESCE($4, relayer_version)
            WHERE id = $1
            "#,
            &[
                &id,
                &ClusterStatus::Active.as_str(),
                &now_ms(),
                &relayer_version,
            ],
        )
        .await
        .context("failed to activate cluster")?;
    Ok(())
}

pub async fn touch_heartbeat(pool: &Pool, id: Uuid) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;
    client
        .execute(
            "UPDATE clusters SET last_heartbeat = $2 WHERE id = $1",
            &[&id, &now_ms()],
        )
        .await
        .context("failed to update cluster heartbeat")?;
    Ok(())
}

/// Pick the dispatch target for an organization: the ACTIVE cluster with
/// the freshest heartbeat. The choice is persisted on the execution row,
/// which is what makes it stable for that execution's lifetime.
pub async fn select_active_cluster(pool: &Pool, organization_id: Uuid) -> Result<Option<Uuid>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let row = client
        .query_opt(
            r#"
            SELECT id FROM clusters
            WHERE organization_id = $1 AND status = $2
            ORDER BY last_heartbeat DESC NULLS LAST, created_at ASC
            LIMIT 1
            "#,
            &[&organization_id, &ClusterStatus::Active.as_str()],
        )
        .await
        .context("failed to select cluster")?;
    Ok(row.map(|r| r.get("id")))
}

/// Clusters still ACTIVE in storage whose heartbeat is older than the
/// cutoff. Used by the health monitor to reconcile rows whose stream
/// vanished without a clean detach.
pub async fn stale_active_clusters(pool: &Pool, cutoff_ms: i64) -> Result<Vec<Uuid>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let rows = client
        .query(
            r#"
            SELECT id FROM clusters
            WHERE status = $1
              AND (last_heartbeat IS NULL OR last_heartbeat < $2)
            "#,
            &[&ClusterStatus::Active.as_str(), &cutoff_ms],
        )
        .await
        .context("failed to query stale clusters")?;
    Ok(rows.iter().map(|r| r.get("id")).collect())
}
