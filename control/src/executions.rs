//! Execution lifecycle: creation, the status state machine, and the
//! enqueue entry point used by the HTTP layer.
//!
//! Transitions are enforced by guarded UPDATEs: an inbound frame that
//! does not match the expected current status touches zero rows and is
//! ignored, which is what makes replays and out-of-order frames
//! harmless. Terminal states never change again.

use anyhow::{Context, Result};
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::agents;
use crate::clusters;
use crate::error::ControlError;
use crate::events::{EXECUTION_COMPLETED, EXECUTION_FAILED};
use crate::models::{Agent, AgentStatus, Execution, ExecutionStatus, Priority, QueueMessage, now_ms};
use crate::state::AppState;

/// Inbound status phases as reported by relayers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPhase {
    Starting,
    Running,
    Completed,
    Failed,
}

impl StatusPhase {
    /// Wire mapping; 0 (unspecified) and unknown values are rejected.
    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            1 => Some(StatusPhase::Starting),
            2 => Some(StatusPhase::Running),
            3 => Some(StatusPhase::Completed),
            4 => Some(StatusPhase::Failed),
            _ => None,
        }
    }
}

/// The allowed edges. `None` means the frame must be ignored.
pub fn next_status(current: ExecutionStatus, phase: StatusPhase) -> Option<ExecutionStatus> {
    use ExecutionStatus::*;
    match (current, phase) {
        (Queued, StatusPhase::Starting | StatusPhase::Running) => Some(Running),
        (Running, StatusPhase::Completed) => Some(Completed),
        (Running, StatusPhase::Failed) => Some(Failed),
        _ => None,
    }
}

const EXECUTION_COLUMNS: &str = "id, organization_id, agent_id, cluster_id, status, input, \
     result, error, duration_ms, attempt, created_at, queued_at, started_at, completed_at";

pub async fn create_execution(
    state: &AppState,
    organization_id: Uuid,
    agent_id: Uuid,
    input: &Value,
) -> Result<Execution> {
    let client = state
        .pool
        .get()
        .await
        .context("failed to get db connection")?;
    let id = Uuid::new_v4();
    let stmt = format!(
        r#"
        INSERT INTO executions (id, organization_id, agent_id, status, input, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {EXECUTION_COLUMNS}
        "#
    );
    let row = client
        .query_one(
            stmt.as_str(),
            &[
                &id,
                &organization_id,
                &agent_id,
                &ExecutionStatus::Pending.as_str(),
                input,
                &now_ms(),
            ],
        )
        .await
        .context("failed to insert execution")?;
    Execution::from_row(&row)
}

pub async fn get_execution(
    state: &AppState,
    organization_id: Uuid,
    id: Uuid,
) -> Result<Option<Execution>> {
    let client = state
        .pool
        .get()
        .await
        .context("failed to get db connection")?;
    let stmt =
        format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1 AND organization_id = $2");
    let row = client
        .query_opt(stmt.as_str(), &[&id, &organization_id])
        .await
        .context("failed to query execution")?;
    row.map(|r| Execution::from_row(&r)).transpose()
}

/// The org owning an execution; the dispatcher's tenant check.
pub async fn execution_org(state: &AppState, id: Uuid) -> Result<Option<Uuid>> {
    let client = state
        .pool
        .get()
        .await
        .context("failed to get db connection")?;
    let row = client
        .query_opt(
            "SELECT organization_id FROM executions WHERE id = $1",
            &[&id],
        )
        .await
        .context("failed to query execution org")?;
    Ok(row.map(|r| r.get("organization_id")))
}

async fn mark_queued(state: &AppState, id: Uuid, cluster_id: Uuid) -> Result<bool> {
    let client = state
        .pool
        .get()
        .await
        .context("failed to get db connection")?;
    let updated = client
        .execute(
            r#"
            UPDATE executions
            SET status = $3, cluster_id = $2, queued_at = $4
            WHERE id = $1 AND status = $5
            "#,
            &[
                &id,
                &cluster_id,
                &ExecutionStatus::Queued.as_str(),
                &now_ms(),
                &ExecutionStatus::Pending.as_str(),
            ],
        )
        .await
        .context("failed to mark execution queued")?;
    Ok(updated == 1)
}

async fn revert_to_pending(state: &AppState, id: Uuid) -> Result<()> {
    let client = state
        .pool
        .get()
        .await
        .context("failed to get db connection")?;
    client
        .execute(
            r#"
            UPDATE executions
            SET status = $2, cluster_id = NULL, queued_at = NULL
            WHERE id = $1 AND status = $3
            "#,
            &[
                &id,
                &ExecutionStatus::Pending.as_str(),
                &ExecutionStatus::Queued.as_str(),
            ],
        )
        .await
        .context("failed to revert execution to pending")?;
    Ok(())
}

/// QUEUED → RUNNING. Returns false when the frame was a replay or out
/// of order (already RUNNING, terminal, or still PENDING).
pub async fn record_running(
    state: &AppState,
    organization_id: Uuid,
    execution_id: Uuid,
) -> Result<bool> {
    let client = state
        .pool
        .get()
        .await
        .context("failed to get db connection")?;
    let updated = client
        .execute(
            r#"
            UPDATE executions
            SET status = $3, started_at = $4
            WHERE id = $1 AND organization_id = $2 AND status = $5
            "#,
            &[
                &execution_id,
                &organization_id,
                &ExecutionStatus::Running.as_str(),
                &now_ms(),
                &ExecutionStatus::Queued.as_str(),
            ],
        )
        .await
        .context("failed to mark execution running")?;
    Ok(updated == 1)
}

/// RUNNING → COMPLETED, with the lifecycle event in the same
/// transaction. Replays touch zero rows and write no event.
pub async fn record_completed(
    state: &AppState,
    organization_id: Uuid,
    execution_id: Uuid,
    result: &Value,
    duration_ms: i64,
) -> Result<bool> {
    let mut client = state
        .pool
        .get()
        .await
        .context("failed to get db connection")?;
    let txn = client
        .transaction()
        .await
        .context("failed to begin transaction")?;
    let updated = txn
        .execute(
            r#"
            UPDATE executions
            SET status = $3, result = $4, duration_ms = $5, completed_at = $6
            WHERE id = $1 AND organization_id = $2 AND status = $7
            "#,
            &[
                &execution_id,
                &organization_id,
                &ExecutionStatus::Completed.as_str(),
                result,
                &duration_ms,
                &now_ms(),
                &ExecutionStatus::Running.as_str(),
            ],
        )
        .await
        .context("failed to mark execution completed")?;
    if updated == 0 {
        return Ok(false);
    }
    let payload = serde_json::json!({
        "executionId": execution_id,
        "result": result,
        "durationMs": duration_ms,
    });
    state
        .events
        .record(&txn, organization_id, execution_id, EXECUTION_COMPLETED, &payload)
        .await
        .context("failed to record lifecycle event")?;
    txn.commit().await.context("failed to commit completion")?;
    state
        .events
        .notify(organization_id, execution_id, EXECUTION_COMPLETED);
    counter!("executions_completed_total").increment(1);
    Ok(true)
}

/// RUNNING → FAILED, same discipline as completion.
pub async fn record_failed(
    state: &AppState,
    organization_id: Uuid,
    execution_id: Uuid,
    error: &str,
) -> Result<bool> {
    let mut client = state
        .pool
        .get()
        .await
        .context("failed to get db connection")?;
    let txn = client
        .transaction()
        .await
        .context("failed to begin transaction")?;
    let updated = txn
        .execute(
            r#"
            UPDATE executions
            SET status = $3, error = $4, completed_at = $5
            WHERE id = $1 AND organization_id = $2 AND status = $6
            "#,
            &[
                &execution_id,
                &organization_id,
                &ExecutionStatus::Failed.as_str(),
                &error,
                &now_ms(),
                &ExecutionStatus::Running.as_str(),
            ],
        )
        .await
        .context("failed to mark execution failed")?;
    if updated == 0 {
        return Ok(false);
    }
    let payload = serde_json::json!({
        "executionId": execution_id,
        "error": error,
    });
    state
        .events
        .record(&txn, organization_id, execution_id, EXECUTION_FAILED, &payload)
        .await
        .context("failed to record lifecycle event")?;
    txn.commit().await.context("failed to commit failure")?;
    state
        .events
        .notify(organization_id, execution_id, EXECUTION_FAILED);
    counter!("executions_failed_total").increment(1);
    Ok(true)
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    #[serde(rename = "executionId")]
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
}

/// The single entry point the HTTP layer calls to run an agent.
///
/// With no ACTIVE cluster the execution is accepted but stays PENDING.
/// A full queue surfaces as `QueueFull` and the row stays PENDING.
pub async fn submit_execution(
    state: &AppState,
    organization_id: Uuid,
    agent_name: &str,
    input: Value,
    priority: Priority,
) -> Result<SubmitOutcome, ControlError> {
    let agent = resolve_active_agent(state, organization_id, agent_name).await?;

    let execution = create_execution(state, organization_id, agent.id, &input)
        .await
        .map_err(ControlError::internal)?;
    counter!("executions_submitted_total").increment(1);

    let Some(cluster_id) = clusters::select_active_cluster(&state.pool, organization_id)
        .await
        .map_err(ControlError::internal)?
    else {
        tracing::info!(
            execution_id = %execution.id,
            agent = agent_name,
            "no active cluster; execution accepted as pending"
        );
        return Ok(SubmitOutcome {
            execution_id: execution.id,
            status: ExecutionStatus::Pending,
        });
    };

    // Stamp QUEUED before the enqueue so a relayer can never observe a
    // work item whose row still says PENDING; roll back if the queue
    // refuses the message.
    if !mark_queued(state, execution.id, cluster_id)
        .await
        .map_err(ControlError::internal)?
    {
        return Err(ControlError::internal(anyhow::anyhow!(
            "freshly created execution {} was not PENDING",
            execution.id
        )));
    }

    let msg = QueueMessage::Work {
        execution_id: execution.id,
        agent_name: agent.name.clone(),
        input_json: input.to_string(),
        priority,
    };
    if let Err(e) = state.queue.enqueue(organization_id, cluster_id, msg).await {
        if let Err(revert) = revert_to_pending(state, execution.id).await {
            tracing::error!(?revert, execution_id = %execution.id, "failed to revert execution");
        }
        return Err(e);
    }

    Ok(SubmitOutcome {
        execution_id: execution.id,
        status: ExecutionStatus::Queued,
    })
}

async fn resolve_active_agent(
    state: &AppState,
    organization_id: Uuid,
    agent_name: &str,
) -> Result<Agent, ControlError> {
    let agent = agents::get_agent_by_name(&state.pool, organization_id, agent_name)
        .await
        .map_err(ControlError::internal)?
        .ok_or_else(|| ControlError::NotFound(format!("agent {agent_name} not found")))?;
    if agent.status != AgentStatus::Active {
        return Err(ControlError::Conflict(format!(
            "agent {agent_name} is not active"
        )));
    }
    Ok(agent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_wire_mapping() {
        assert_eq!(StatusPhase::from_wire(1), Some(StatusPhase::Starting));
        assert_eq!(StatusPhase::from_wire(2), Some(StatusPhase::Running));
        assert_eq!(StatusPhase::from_wire(3), Some(StatusPhase::Completed));
        assert_eq!(StatusPhase::from_wire(4), Some(StatusPhase::Failed));
        assert_eq!(StatusPhase::from_wire(0), None);
        assert_eq!(StatusPhase::from_wire(99), None);
    }

    #[test]
    fn allowed_edges() {
        use ExecutionStatus::*;
        assert_eq!(next_status(Queued, StatusPhase::Starting), Some(Running));
        assert_eq!(next_status(Queued, StatusPhase::Running), Some(Running));
        assert_eq!(next_status(Running, StatusPhase::Completed), Some(Completed));
        assert_eq!(next_status(Running, StatusPhase::Failed), Some(Failed));
    }

    #[test]
    fn terminal_states_are_sticky() {
        use ExecutionStatus::*;
        for phase in [
            StatusPhase::Starting,
            StatusPhase::Running,
            StatusPhase::Completed,
            StatusPhase::Failed,
        ] {
            assert_eq!(next_status(Completed, phase), None);
            assert_eq!(next_status(Failed, phase), None);
        }
    }

    #[test]
    fn no_backwards_or_skipping_edges() {
        use ExecutionStatus::*;
        // A status frame can never move a PENDING execution: work was
        // never dispatched.
        assert_eq!(next_status(Pending, StatusPhase::Running), None);
        assert_eq!(next_status(Pending, StatusPhase::Completed), None);
        // Terminal reports require an observed RUNNING.
        assert_eq!(next_status(Queued, StatusPhase::Completed), None);
        assert_eq!(next_status(Queued, StatusPhase::Failed), None);
        // Replayed RUNNING is a no-op.
        assert_eq!(next_status(Running, StatusPhase::Starting), None);
        assert_eq!(next_status(Running, StatusPhase::Running), None);
    }
}
