use anyhow::{Context, Result};
use deadpool_postgres::Pool;

/// Initialize the database schema, creating tables if they don't exist.
pub async fn init_schema(pool: &Pool) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS organizations (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                created_at BIGINT NOT NULL
            )
            "#,
            &[],
        )
        .await
        .context("failed to create organizations table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                id UUID PRIMARY KEY,
                organization_id UUID NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
                key_prefix TEXT NOT NULL,
                key_hash TEXT NOT NULL,
                rate_limit INT NOT NULL DEFAULT 0,
                created_at BIGINT NOT NULL,
                revoked_at BIGINT,
                expires_at BIGINT
            )
            "#,
            &[],
        )
        .await
        .context("failed to create api_keys table")?;

    client
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_api_keys_prefix ON api_keys (key_prefix)",
            &[],
        )
        .await
        .context("failed to create api key prefix index")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS clusters (
                id UUID PRIMARY KEY,
                organization_id UUID NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                secret_hash TEXT NOT NULL,
                relayer_version TEXT,
                capabilities JSONB,
                last_heartbeat BIGINT,
                created_at BIGINT NOT NULL,
                UNIQUE (organization_id, name)
            )
            "#,
            &[],
        )
        .await
        .context("failed to create clusters table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id UUID PRIMARY KEY,
                organization_id UUID NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                image TEXT NOT NULL,
                resources JSONB NOT NULL DEFAULT '{}'::jsonb,
                retry_policy JSONB NOT NULL DEFAULT '{}'::jsonb,
                environment JSONB NOT NULL DEFAULT '{}'::jsonb,
                use_agent_sandbox BOOLEAN NOT NULL DEFAULT FALSE,
                warm_pool_size INT NOT NULL DEFAULT 0,
                network_policy TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                config_hash TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                UNIQUE (organization_id, name)
            )
            "#,
            &[],
        )
        .await
        .context("failed to create agents table")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id UUID PRIMARY KEY,
                organization_id UUID NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
                agent_id UUID NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                cluster_id UUID,
                status TEXT NOT NULL,
                input JSONB NOT NULL,
                result JSONB,
                error TEXT,
                duration_ms BIGINT,
                attempt INT NOT NULL DEFAULT 1,
                created_at BIGINT NOT NULL,
                queued_at BIGINT,
                started_at BIGINT,
                completed_at BIGINT
            )
            "#,
            &[],
        )
        .await
        .context("failed to create executions table")?;

    client
        .execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_executions_org_created
            ON executions (organization_id, created_at)
            "#,
            &[],
        )
        .await
        .context("failed to create executions index")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS logs (
                id BIGSERIAL PRIMARY KEY,
                organization_id UUID NOT NULL,
                execution_id UUID NOT NULL,
                timestamp_ms BIGINT NOT NULL,
                level TEXT NOT NULL DEFAULT '',
                message TEXT NOT NULL
            )
            "#,
            &[],
        )
        .await
        .context("failed to create logs table")?;

    client
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_logs_org_ts ON logs (organization_id, timestamp_ms)",
            &[],
        )
        .await
        .context("failed to create logs index")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS metric_points (
                id BIGSERIAL PRIMARY KEY,
                organization_id UUID NOT NULL,
                execution_id UUID NOT NULL,
                timestamp_ms BIGINT NOT NULL,
                name TEXT NOT NULL,
                value DOUBLE PRECISION NOT NULL,
                labels JSONB
            )
            "#,
            &[],
        )
        .await
        .context("failed to create metric_points table")?;

    client
        .execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_metric_points_org_ts
            ON metric_points (organization_id, timestamp_ms)
            "#,
            &[],
        )
        .await
        .context("failed to create metric_points index")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS traces (
                id BIGSERIAL PRIMARY KEY,
                organization_id UUID NOT NULL,
                execution_id UUID NOT NULL,
                trace_id TEXT NOT NULL,
                span_id TEXT NOT NULL,
                parent_span_id TEXT,
                name TEXT NOT NULL,
                start_ms BIGINT NOT NULL,
                end_ms BIGINT NOT NULL,
                attributes JSONB
            )
            "#,
            &[],
        )
        .await
        .context("failed to create traces table")?;

    client
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_traces_org_start ON traces (organization_id, start_ms)",
            &[],
        )
        .await
        .context("failed to create traces index")?;

    // At-least-once contract with the downstream workflow engine: the
    // outbox row is written in the same transaction as the terminal
    // execution update.
    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS lifecycle_events (
                id BIGSERIAL PRIMARY KEY,
                organization_id UUID NOT NULL,
                execution_id UUID NOT NULL,
                kind TEXT NOT NULL,
                payload JSONB NOT NULL,
                created_at BIGINT NOT NULL
            )
            "#,
            &[],
        )
        .await
        .context("failed to create lifecycle_events table")?;

    tracing::info!("database schema initialized");
    Ok(())
}
