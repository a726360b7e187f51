//! Demultiplexes inbound stream frames into handlers.
//!
//! Handler failures never reach the receive loop: the offending frame is
//! logged and dropped, the session keeps running. Telemetry batches are
//! bounded and tenant-checked before anything is written; a batch whose
//! execution does not belong to the session's organization is discarded.

use anyhow::{Context, Result};
use metrics::counter;
use uuid::Uuid;

use crate::agents;
use crate::executions::{self, StatusPhase};
use crate::models::AgentStatus;
use crate::proto::relayer as pb;
use crate::proto::relayer::relayer_frame::Frame;
use crate::state::AppState;

/// Per-frame caps; oversize frames are rejected outright.
pub const MAX_LOG_LINES: usize = 10_000;
pub const MAX_METRIC_POINTS: usize = 5_000;
pub const MAX_SPANS: usize = 1_000;

pub struct InboundDispatcher {
    state: AppState,
}

impl InboundDispatcher {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Route one non-heartbeat frame. Never fails the caller.
    pub async fn dispatch(&self, organization_id: Uuid, cluster_id: Uuid, frame: Frame) {
        let result = match frame {
            Frame::ExecutionStatus(status) => {
                self.handle_execution_status(organization_id, status).await
            }
            Frame::LogBatch(batch) => self.handle_log_batch(organization_id, batch).await,
            Frame::MetricBatch(batch) => self.handle_metric_batch(organization_id, batch).await,
            Frame::TraceBatch(batch) => self.handle_trace_batch(organization_id, batch).await,
            Frame::AgentRegistrationStatus(status) => {
                self.handle_agent_registration_status(organization_id, status)
                    .await
            }
            Frame::Heartbeat(_) => Ok(()), // handled by the receive loop
        };
        if let Err(e) = result {
            counter!("inbound_frames_dropped_total").increment(1);
            tracing::warn!(?e, %organization_id, %cluster_id, "inbound frame dropped");
        }
    }

    async fn handle_execution_status(
        &self,
        organization_id: Uuid,
        status: pb::ExecutionStatus,
    ) -> Result<()> {
        let execution_id: Uuid = status
            .execution_id
            .parse()
            .context("unparseable execution id in status frame")?;
        let Some(phase) = StatusPhase::from_wire(status.phase) else {
            anyhow::bail!("unknown status phase {}", status.phase);
        };

        let applied = match phase {
            StatusPhase::Starting | StatusPhase::Running => {
                executions::record_running(&self.state, organization_id, execution_id).await?
            }
            StatusPhase::Completed => {
                let result = parse_json_or_string(&status.result_json);
                executions::record_completed(
                    &self.state,
                    organization_id,
                    execution_id,
                    &result,
                    status.duration_ms,
                )
                .await?
            }
            StatusPhase::Failed => {
                executions::record_failed(&self.state, organization_id, execution_id, &status.error)
                    .await?
            }
        };

        if applied {
            counter!("execution_status_applied_total").increment(1);
        } else {
            // Replay, out-of-order, or another tenant's execution id:
            // all idempotently ignored.
            tracing::debug!(%execution_id, ?phase, "execution status frame ignored");
        }
        Ok(())
    }

    async fn handle_log_batch(&self, organization_id: Uuid, batch: pb::LogBatch) -> Result<()> {
        if batch.lines.len() > MAX_LOG_LINES {
            anyhow::bail!(
                "log batch of {} lines exceeds cap {}",
                batch.lines.len(),
                MAX_LOG_LINES
            );
        }
        let Some(execution_id) = self
            .resolve_tenant_execution(organization_id, &batch.execution_id)
            .await?
        else {
            return Ok(());
        };
        if batch.lines.is_empty() {
            return Ok(());
        }

        let mut timestamps = Vec::with_capacity(batch.lines.len());
        let mut levels = Vec::with_capacity(batch.lines.len());
        let mut messages = Vec::with_capacity(batch.lines.len());
        for line in &batch.lines {
            timestamps.push(line.timestamp_ms);
            levels.push(line.level.clone());
            messages.push(line.message.clone());
        }

        let client = self
            .state
            .pool
            .get()
            .await
            .context("failed to get db connection")?;
        client
            .execute(
                r#"
                INSERT INTO logs (organization_id, execution_id, timestamp_ms, level, message)
                SELECT $1, $2, t.ts, t.level, t.message
                FROM UNNEST($3::bigint[], $4::text[], $5::text[]) AS t(ts, level, message)
                "#,
                &[
                    &organization_id,
                    &execution_id,
                    &timestamps,
                    &levels,
                    &messages,
                ],
            )
            .await
            .context("failed to insert log batch")?;
        counter!("log_lines_ingested_total").increment(batch.lines.len() as u64);
        Ok(())
    }

    async fn handle_metric_batch(
        &self,
        organization_id: Uuid,
        batch: pb::MetricBatch,
    ) -> Result<()> {
        if batch.points.len() > MAX_METRIC_POINTS {
            anyhow::bail!(
                "metric batch of {} points exceeds cap {}",
                batch.points.len(),
                MAX_METRIC_POINTS
            );
        }
        let Some(execution_id) = self
            .resolve_tenant_execution(organization_id, &batch.execution_id)
            .await?
        else {
            return Ok(());
        };
        if batch.points.is_empty() {
            return Ok(());
        }

        let mut timestamps = Vec::with_capacity(batch.points.len());
        let mut names = Vec::with_capacity(batch.points.len());
        let mut values = Vec::with_capacity(batch.points.len());
        let mut labels = Vec::with_capacity(batch.points.len());
        for point in &batch.points {
            timestamps.push(point.timestamp_ms);
            names.push(point.name.clone());
            values.push(point.value);
            labels.push(parse_json_or_string(&point.labels_json));
        }

        let client = self
            .state
            .pool
            .get()
            .await
            .context("failed to get db connection")?;
        client
            .execute(
                r#"
                INSERT INTO metric_points (organization_id, execution_id, timestamp_ms, name, value, labels)
                SELECT $1, $2, t.ts, t.name, t.value, t.labels
                FROM UNNEST($3::bigint[], $4::text[], $5::double precision[], $6::jsonb[])
                    AS t(ts, name, value, labels)
                "#,
                &[
                    &organization_id,
                    &execution_id,
                    &timestamps,
                    &names,
                    &values,
                    &labels,
                ],
            )
            .await
            .context("failed to insert metric batch")?;
        counter!("metric_points_ingested_total").increment(batch.points.len() as u64);
        Ok(())
    }

    async fn handle_trace_batch(&self, organization_id: Uuid, batch: pb::TraceBatch) -> Result<()> {
        if batch.spans.len() > MAX_SPANS {
            anyhow::bail!(
                "trace batch of {} spans exceeds cap {}",
                batch.spans.len(),
                MAX_SPANS
            );
        }
        let Some(execution_id) = self
            .resolve_tenant_execution(organization_id, &batch.execution_id)
            .await?
        else {
            return Ok(());
        };
        if batch.spans.is_empty() {
            return Ok(());
        }

        let mut trace_ids = Vec::with_capacity(batch.spans.len());
        let mut span_ids = Vec::with_capacity(batch.spans.len());
        let mut parents = Vec::with_capacity(batch.spans.len());
        let mut names = Vec::with_capacity(batch.spans.len());
        let mut starts = Vec::with_capacity(batch.spans.len());
        let mut ends = Vec::with_capacity(batch.spans.len());
        let mut attrs = Vec::with_capacity(batch.spans.len());
        for span in &batch.spans {
            trace_ids.push(span.trace_id.clone());
            span_ids.push(span.span_id.clone());
            parents.push(span.parent_span_id.clone());
            names.push(span.name.clone());
            starts.push(span.start_ms);
            ends.push(span.end_ms);
            attrs.push(parse_json_or_string(&span.attributes_json));
        }

        let client = self
            .state
            .pool
            .get()
            .await
            .context("failed to get db connection")?;
        client
            .execute(
                r#"
                INSERT INTO traces
                    (organization_id, execution_id, trace_id, span_id, parent_span_id,
                     name, start_ms, end_ms, attributes)
                SELECT $1, $2, t.trace_id, t.span_id, t.parent, t.name, t.start_ms, t.end_ms, t.attrs
                FROM UNNEST($3::text[], $4::text[], $5::text[], $6::text[],
                            $7::bigint[], $8::bigint[], $9::jsonb[])
                    AS t(trace_id, span_id, parent, name, start_ms, end_ms, attrs)
                "#,
                &[
                    &organization_id,
                    &execution_id,
                    &trace_ids,
                    &span_ids,
                    &parents,
                    &names,
                    &starts,
                    &ends,
                    &attrs,
                ],
            )
            .await
            .context("failed to insert trace batch")?;
        counter!("spans_ingested_total").increment(batch.spans.len() as u64);
        Ok(())
    }

    async fn handle_agent_registration_status(
        &self,
        organization_id: Uuid,
        status: pb::AgentRegistrationStatus,
    ) -> Result<()> {
        let agent_status = if status.success {
            AgentStatus::Active
        } else {
            AgentStatus::Failed
        };
        let updated = agents::set_agent_status(
            &self.state.pool,
            organization_id,
            &status.agent_name,
            agent_status,
        )
        .await?;
        if !updated {
            tracing::warn!(
                agent = %status.agent_name,
                "registration status for unknown agent ignored"
            );
        } else if !status.success {
            tracing::warn!(
                agent = %status.agent_name,
                message = %status.message,
                "relayer reported failed agent registration"
            );
        }
        Ok(())
    }

    /// Resolve a batch's execution id within the session's organization.
    /// `None` means the batch must be dropped: unparseable id, unknown
    /// execution, or an execution owned by another tenant.
    async fn resolve_tenant_execution(
        &self,
        organization_id: Uuid,
        raw_execution_id: &str,
    ) -> Result<Option<Uuid>> {
        let Ok(execution_id) = raw_execution_id.parse::<Uuid>() else {
            counter!("telemetry_batches_dropped_total", "reason" => "bad_id").increment(1);
            tracing::warn!(raw_execution_id, "telemetry batch with unparseable execution id");
            return Ok(None);
        };
        match executions::execution_org(&self.state, execution_id).await? {
            Some(owner) if owner == organization_id => Ok(Some(execution_id)),
            Some(_) => {
                counter!("telemetry_batches_dropped_total", "reason" => "cross_tenant")
                    .increment(1);
                tracing::warn!(
                    %execution_id,
                    "telemetry batch for another tenant's execution dropped"
                );
                Ok(None)
            }
            None => {
                counter!("telemetry_batches_dropped_total", "reason" => "unknown_execution")
                    .increment(1);
                tracing::warn!(%execution_id, "telemetry batch for unknown execution dropped");
                Ok(None)
            }
        }
    }
}

/// Relayers send JSON payloads as strings; anything unparseable is kept
/// verbatim as a JSON string rather than lost.
pub fn parse_json_or_string(raw: &str) -> serde_json::Value {
    if raw.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_payloads_parse_or_wrap() {
        assert_eq!(
            parse_json_or_string(r#"{"ok":true}"#),
            serde_json::json!({"ok": true})
        );
        assert_eq!(parse_json_or_string(""), serde_json::Value::Null);
        assert_eq!(
            parse_json_or_string("not json"),
            serde_json::Value::String("not json".into())
        );
    }

    #[test]
    fn batch_caps_match_protocol_limits() {
        assert_eq!(MAX_LOG_LINES, 10_000);
        assert_eq!(MAX_METRIC_POINTS, 5_000);
        assert_eq!(MAX_SPANS, 1_000);
    }
}
