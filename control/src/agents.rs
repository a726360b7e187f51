//! Agent records and their propagation to relayers.
//!
//! An agent upsert with an unchanged `(name, config_hash)` is a no-op;
//! otherwise every connected cluster of the organization receives a
//! registration push, and a freshly attached stream gets a full replay
//! of the org's active agents.

use anyhow::{Context, Result};
use deadpool_postgres::Pool;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ControlError;
use crate::models::{Agent, AgentStatus, now_ms};
use crate::state::AppState;

const AGENT_COLUMNS: &str = "id, organization_id, name, image, resources, retry_policy, \
     environment, use_agent_sandbox, warm_pool_size, network_policy, status, config_hash, \
     created_at, updated_at";

/// Desired agent configuration as submitted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub image: String,
    #[serde(default = "empty_object")]
    pub resources: serde_json::Value,
    #[serde(default = "empty_object", rename = "retryPolicy")]
    pub retry_policy: serde_json::Value,
    #[serde(default = "empty_object")]
    pub environment: serde_json::Value,
    #[serde(default, rename = "useAgentSandbox")]
    pub use_agent_sandbox: bool,
    #[serde(default, rename = "warmPoolSize")]
    pub warm_pool_size: i32,
    #[serde(default, rename = "networkPolicy")]
    pub network_policy: String,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

impl AgentSpec {
    /// Deterministic digest of the configuration; equal specs hash
    /// equal, which is what makes re-registration a detectable no-op.
    pub fn config_hash(&self) -> String {
        let canonical = serde_json::to_string(self).expect("agent spec serializes");
        Uuid::new_v5(&Uuid::NAMESPACE_OID, canonical.as_bytes())
            .simple()
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertAction {
    Created,
    Updated,
    Unchanged,
}

impl UpsertAction {
    pub fn as_str(self) -> &'static str {
        match self {
            UpsertAction::Created => "created",
            UpsertAction::Updated => "updated",
            UpsertAction::Unchanged => "unchanged",
        }
    }
}

pub async fn get_agent_by_name(
    pool: &Pool,
    organization_id: Uuid,
    name: &str,
) -> Result<Option<Agent>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let stmt =
        format!("SELECT {AGENT_COLUMNS} FROM agents WHERE organization_id = $1 AND name = $2");
    let row = client
        .query_opt(stmt.as_str(), &[&organization_id, &name])
        .await
        .context("failed to query agent")?;
    row.map(|r| Agent::from_row(&r)).transpose()
}

pub async fn list_active_agents(pool: &Pool, organization_id: Uuid) -> Result<Vec<Agent>> {
    let client = pool.get().await.context("failed to get db connection")?;
    let stmt = format!(
        "SELECT {AGENT_COLUMNS} FROM agents WHERE organization_id = $1 AND status = $2 ORDER BY name"
    );
    let rows = client
        .query(stmt.as_str(), &[&organization_id, &AgentStatus::Active.as_str()])
        .await
        .context("failed to list agents")?;
    rows.iter().map(Agent::from_row).collect()
}

/// Applied from `agent_registration_status` frames, scoped to the
/// reporting session's organization.
pub async fn set_agent_status(
    pool: &Pool,
    organization_id: Uuid,
    name: &str,
    status: AgentStatus,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;
    let updated = client
        .execute(
            r#"
            UPDATE agents SET status = $3, updated_at = $4
            WHERE organization_id = $1 AND name = $2
            "#,
            &[&organization_id, &name, &status.as_str(), &now_ms()],
        )
        .await
        .context("failed to update agent status")?;
    Ok(updated == 1)
}

/// Create or update an agent, then push the registration to every
/// connected cluster of the org. Identical configuration short-circuits
/// as `Unchanged` with no write and no push.
pub async fn upsert_agent(
    state: &AppState,
    organization_id: Uuid,
    spec: AgentSpec,
) -> Result<(Agent, UpsertAction), ControlError> {
    let config_hash = spec.config_hash();

    let existing = get_agent_by_name(&state.pool, organization_id, &spec.name)
        .await
        .map_err(ControlError::internal)?;
    if let Some(agent) = &existing {
        if agent.config_hash == config_hash {
            return Ok((agent.clone(), UpsertAction::Unchanged));
        }
    }
    let action = if existing.is_some() {
        UpsertAction::Updated
    } else {
        UpsertAction::Created
    };

    let client = state
        .pool
        .get()
        .await
        .context("failed to get db connection")
        .map_err(ControlError::internal)?;
    let now = now_ms();
    let stmt = format!(
        r#"
        INSERT INTO agents
            (id, organization_id, name, image, resources, retry_policy, environment,
             use_agent_sandbox, warm_pool_size, network_policy, status, config_hash,
             created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
        ON CONFLICT (organization_id, name) DO UPDATE SET
            image = EXCLUDED.image,
            resources = EXCLUDED.resources,
            retry_policy = EXCLUDED.retry_policy,
            environment = EXCLUDED.environment,
            use_agent_sandbox = EXCLUDED.use_agent_sandbox,
            warm_pool_size = EXCLUDED.warm_pool_size,
            network_policy = EXCLUDED.network_policy,
            config_hash = EXCLUDED.config_hash,
            updated_at = EXCLUDED.updated_at
        RETURNING {AGENT_COLUMNS}
        "#
    );
    let row = client
        .query_one(
            stmt.as_str(),
            &[
                &Uuid::new_v4(),
                &organization_id,
                &spec.name,
                &spec.image,
                &spec.resources,
                &spec.retry_policy,
                &spec.environment,
                &spec.use_agent_sandbox,
                &spec.warm_pool_size,
                &spec.network_policy,
                &AgentStatus::Active.as_str(),
                &config_hash,
                &now,
            ],
        )
        .await
        .context("failed to upsert agent")
        .map_err(ControlError::internal)?;
    let agent = Agent::from_row(&row).map_err(ControlError::internal)?;

    push_registration(state, &agent).await;

    Ok((agent, action))
}

/// Fan the registration out to every connected cluster of the org. A
/// full queue is logged and skipped; the relayer will catch up on its
/// next attach replay.
async fn push_registration(state: &AppState, agent: &Agent) {
    for conn in state.registry.connections_for_org(agent.organization_id) {
        let msg = agent.registration_message();
        if let Err(e) = state
            .queue
            .enqueue(agent.organization_id, conn.cluster_id, msg)
            .await
        {
            tracing::warn!(
                ?e,
                agent = %agent.name,
                cluster_id = %conn.cluster_id,
                "failed to enqueue agent registration"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, image: &str) -> AgentSpec {
        AgentSpec {
            name: name.into(),
            image: image.into(),
            resources: serde_json::json!({"cpu": "500m"}),
            retry_policy: serde_json::json!({"maxAttempts": 3}),
            environment: serde_json::json!({}),
            use_agent_sandbox: false,
            warm_pool_size: 0,
            network_policy: String::new(),
        }
    }

    #[test]
    fn config_hash_is_deterministic() {
        let a = spec("summarize", "registry.example/summarize:v1");
        let b = spec("summarize", "registry.example/summarize:v1");
        assert_eq!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn config_hash_tracks_changes() {
        let a = spec("summarize", "registry.example/summarize:v1");
        let b = spec("summarize", "registry.example/summarize:v2");
        assert_ne!(a.config_hash(), b.config_hash());

        let mut c = spec("summarize", "registry.example/summarize:v1");
        c.warm_pool_size = 2;
        assert_ne!(a.config_hash(), c.config_hash());
    }

    #[test]
    fn spec_defaults_from_minimal_json() {
        let spec: AgentSpec =
            serde_json::from_str(r#"{"name":"summarize","image":"img:v1"}"#).unwrap();
        assert_eq!(spec.resources, serde_json::json!({}));
        assert_eq!(spec.warm_pool_size, 0);
        assert!(!spec.use_agent_sandbox);
    }
}
