//! The relayer gRPC service: registration, stream attach, and the
//! per-session send/receive loops.
//!
//! A session owns its stream and outbound channel; the registry holds
//! the only shared handle. Detach is cooperative: closing the connection
//! cancels both loops, which observe the token at their next suspension
//! point (the bounded dequeue, the stream read, the channel write).

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use metrics::counter;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status, Streaming};
use uuid::Uuid;

use crate::clusters;
use crate::dispatcher::InboundDispatcher;
use crate::error::ControlError;
use crate::models::{ClusterStatus, QueueMessage};
use crate::proto::relayer::relayer_frame::Frame;
use crate::proto::relayer::relayer_server::Relayer;
use crate::proto::relayer::{
    AgentRegistration, ControlFrame, RegisterClusterRequest, RegisterClusterResponse, RelayerFrame,
    WorkItem, control_frame,
};
use crate::registry::ClusterConnection;
use crate::state::AppState;

pub struct RelayerService {
    state: AppState,
}

impl RelayerService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl Relayer for RelayerService {
    async fn register_cluster(
        &self,
        request: Request<RegisterClusterRequest>,
    ) -> Result<Response<RegisterClusterResponse>, Status> {
        let api_key = metadata_value(request.metadata(), "x-api-key");
        let req = request.into_inner();
        let api_key = match api_key {
            Some(key) => key,
            None => req.api_key.clone(),
        };

        let identity = self.state.credentials.verify_api_key(&api_key).await?;
        let org = identity.organization_id;

        if req.cluster_name.is_empty() {
            return Err(Status::invalid_argument("cluster_name is required"));
        }

        // Find-or-create by (organization, name). The plaintext secret
        // exists only in the response of the creating call.
        if let Some(cluster) = clusters::find_by_name(&self.state.pool, org, &req.cluster_name)
            .await
            .map_err(|e| Status::from(ControlError::internal(e)))?
        {
            tracing::info!(%org, cluster_id = %cluster.id, name = %req.cluster_name,
                "cluster re-registered");
            return Ok(Response::new(RegisterClusterResponse {
                success: true,
                cluster_id: cluster.id.to_string(),
                message: "cluster already registered; existing secret remains valid".into(),
                config_json: self.relayer_config(None),
            }));
        }

        let (secret_plaintext, secret_hash) = self
            .state
            .credentials
            .generate_cluster_secret()
            .await
            .map_err(|e| Status::from(ControlError::internal(e)))?;
        let Some(cluster) = clusters::create_cluster(
            &self.state.pool,
            org,
            &req.cluster_name,
            &secret_hash,
            &req.relayer_version,
            &req.capabilities,
        )
        .await
        .map_err(|e| Status::from(ControlError::internal(e)))?
        else {
            // Lost a registration race: the stored row's secret is the
            // valid one, and the plaintext generated here dies with this
            // call.
            let existing = clusters::find_by_name(&self.state.pool, org, &req.cluster_name)
                .await
                .map_err(|e| Status::from(ControlError::internal(e)))?
                .ok_or_else(|| Status::internal("cluster vanished during registration"))?;
            return Ok(Response::new(RegisterClusterResponse {
                success: true,
                cluster_id: existing.id.to_string(),
                message: "cluster already registered; existing secret remains valid".into(),
                config_json: self.relayer_config(None),
            }));
        };

        tracing::info!(%org, cluster_id = %cluster.id, name = %req.cluster_name,
            relayer_version = %req.relayer_version, "cluster registered");
        counter!("clusters_registered_total").increment(1);

        Ok(Response::new(RegisterClusterResponse {
            success: true,
            cluster_id: cluster.id.to_string(),
            message: "cluster registered; persist the cluster secret, it is not shown again".into(),
            config_json: self.relayer_config(Some(&secret_plaintext)),
        }))
    }

    type StreamWorkStream = Pin<Box<dyn Stream<Item = Result<ControlFrame, Status>> + Send>>;

    async fn stream_work(
        &self,
        request: Request<Streaming<RelayerFrame>>,
    ) -> Result<Response<Self::StreamWorkStream>, Status> {
        let cluster_id = metadata_value(request.metadata(), "cluster-id")
            .and_then(|v| v.parse::<Uuid>().ok())
            .ok_or_else(|| Status::unauthenticated("cluster-id metadata missing or invalid"))?;
        let secret = metadata_value(request.metadata(), "x-cluster-secret")
            .ok_or_else(|| Status::unauthenticated("x-cluster-secret metadata missing"))?;

        let identity = self
            .state
            .credentials
            .verify_cluster_secret(cluster_id, &secret)
            .await?;
        let org = identity.organization_id;

        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(self.state.config.send_channel_capacity);
        let conn = ClusterConnection::new(cluster_id, org, tx);

        // A second attach for the same cluster displaces the first; the
        // predecessor's in-flight message comes back via its send loop's
        // requeue path.
        if let Some(prev) = self.state.registry.register(conn.clone()) {
            tracing::info!(%cluster_id, "displacing previous session");
            prev.close(ControlError::Replaced);
        }

        clusters::mark_active(&self.state.pool, cluster_id, None)
            .await
            .map_err(|e| {
                // The stream must not run against a row we failed to
                // activate; undo the registration.
                self.state.registry.unregister(cluster_id, &conn);
                Status::from(ControlError::internal(e))
            })?;

        tracing::info!(%org, %cluster_id, "relayer stream attached");
        counter!("relayer_streams_attached_total").increment(1);

        self.state
            .sessions
            .spawn(run_session(self.state.clone(), conn, inbound));

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

impl RelayerService {
    fn relayer_config(&self, cluster_secret: Option<&str>) -> String {
        let mut config = json!({
            "heartbeatIntervalMs": self.state.config.heartbeat_interval_ms,
            "logLevel": "info",
        });
        if let Some(secret) = cluster_secret {
            config["clusterSecret"] = json!(secret);
        }
        config.to_string()
    }
}

fn metadata_value(md: &MetadataMap, key: &str) -> Option<String> {
    md.get(key)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Drive one attached session: replay agent registrations, run both
/// loops until either ends, then drain.
async fn run_session(state: AppState, conn: Arc<ClusterConnection>, inbound: Streaming<RelayerFrame>) {
    if let Err(e) = replay_agent_registrations(&state, &conn).await {
        tracing::warn!(?e, cluster_id = %conn.cluster_id, "agent registration replay failed");
    }

    let send = send_loop(state.clone(), conn.clone());
    let recv = recv_loop(state.clone(), conn.clone(), inbound);
    tokio::pin!(send);
    tokio::pin!(recv);

    let cancel = conn.cancel_token();
    tokio::select! {
        result = &mut send => {
            log_loop_exit("send", &conn, result);
            cancel.cancel();
            let _ = recv.await;
        }
        result = &mut recv => {
            log_loop_exit("receive", &conn, result);
            cancel.cancel();
            if let Err(e) = send.await {
                tracing::debug!(?e, cluster_id = %conn.cluster_id, "send loop ended during drain");
            }
        }
    }

    detach(&state, &conn).await;
}

fn log_loop_exit(which: &str, conn: &ClusterConnection, result: Result<(), ControlError>) {
    match result {
        Ok(()) => tracing::debug!(cluster_id = %conn.cluster_id, "{which} loop ended"),
        Err(e) => tracing::warn!(?e, cluster_id = %conn.cluster_id, "{which} loop failed"),
    }
}

/// Push registrations of all active agents to a freshly attached stream
/// so the relayer converges on the org's agent set. Re-delivery is
/// harmless: relayers treat an unchanged config hash as a no-op.
async fn replay_agent_registrations(state: &AppState, conn: &ClusterConnection) -> anyhow::Result<()> {
    let agents = crate::agents::list_active_agents(&state.pool, conn.organization_id).await?;
    for agent in agents {
        if let Err(e) = state
            .queue
            .enqueue(
                conn.organization_id,
                conn.cluster_id,
                agent.registration_message(),
            )
            .await
        {
            tracing::warn!(?e, agent = %agent.name, "failed to queue registration replay");
        }
    }
    Ok(())
}

/// Dequeue with a bounded wait, translate to the wire frame, write with
/// a bounded timeout. A message that was dequeued but not written is
/// always returned to the head of its priority class.
async fn send_loop(state: AppState, conn: Arc<ClusterConnection>) -> Result<(), ControlError> {
    let cancel = conn.cancel_token();
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        // The bounded wait is the cancellation observation point; a
        // `None` here is an idle keepalive cycle, not an error.
        let msg = state
            .queue
            .dequeue(conn.organization_id, conn.cluster_id, state.config.dequeue_wait)
            .await?;
        let Some(msg) = msg else {
            continue;
        };

        if cancel.is_cancelled() {
            requeue(&state, &conn, msg).await;
            return Ok(());
        }

        let frame = control_frame_for(&msg);
        match conn.send(frame, state.config.send_timeout).await {
            Ok(()) => {
                if cancel.is_cancelled() {
                    // A close status raced this write and may precede it
                    // on the channel; requeue rather than risk a silent
                    // drop. At-least-once permits the duplicate.
                    requeue(&state, &conn, msg).await;
                    return Ok(());
                }
                counter!("work_frames_sent_total").increment(1);
            }
            Err(e) => {
                requeue(&state, &conn, msg).await;
                return Err(e);
            }
        }
    }
}

async fn requeue(state: &AppState, conn: &ClusterConnection, msg: QueueMessage) {
    if let Err(e) = state
        .queue
        .requeue_front(conn.organization_id, conn.cluster_id, msg)
        .await
    {
        // The message is lost for this process; the row is still QUEUED
        // and shows up in reconciliation.
        tracing::error!(?e, cluster_id = %conn.cluster_id, "failed to re-enqueue in-flight message");
    }
}

fn control_frame_for(msg: &QueueMessage) -> ControlFrame {
    match msg {
        QueueMessage::Work {
            execution_id,
            agent_name,
            input_json,
            priority,
        } => ControlFrame {
            frame: Some(control_frame::Frame::WorkItem(WorkItem {
                execution_id: execution_id.to_string(),
                agent_name: agent_name.clone(),
                input_json: input_json.clone(),
                priority: priority.wire(),
            })),
        },
        QueueMessage::Registration {
            agent_id,
            agent_name,
            image,
            resources_json,
            retry_policy_json,
            environment_json,
            use_agent_sandbox,
            warm_pool_size,
            network_policy,
            config_hash,
        } => ControlFrame {
            frame: Some(control_frame::Frame::AgentRegistration(AgentRegistration {
                id: agent_id.to_string(),
                name: agent_name.clone(),
                image: image.clone(),
                resources_json: resources_json.clone(),
                retry_policy_json: retry_policy_json.clone(),
                use_agent_sandbox: *use_agent_sandbox,
                warm_pool_size: *warm_pool_size,
                network_policy: network_policy.clone(),
                environment_variables_json: environment_json.clone(),
                config_hash: config_hash.clone(),
            })),
        },
    }
}

/// Read inbound frames until the stream ends or the session is
/// cancelled. Heartbeats touch the registry inline; everything else goes
/// through the dispatcher, which contains handler failures.
async fn recv_loop(
    state: AppState,
    conn: Arc<ClusterConnection>,
    mut inbound: Streaming<RelayerFrame>,
) -> Result<(), ControlError> {
    let cancel = conn.cancel_token();
    let dispatcher = InboundDispatcher::new(state.clone());
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = inbound.message() => next,
        };
        match next {
            Ok(Some(frame)) => {
                conn.mark_activity();
                let Some(frame) = frame.frame else {
                    continue;
                };
                match frame {
                    Frame::Heartbeat(_) => {
                        state.registry.touch(conn.cluster_id);
                        counter!("heartbeats_received_total").increment(1);
                        // Storage write off the hot path; a failure is
                        // logged, never fatal to the session.
                        let pool = state.pool.clone();
                        let cluster_id = conn.cluster_id;
                        tokio::spawn(async move {
                            if let Err(e) = clusters::touch_heartbeat(&pool, cluster_id).await {
                                tracing::warn!(?e, %cluster_id, "heartbeat persistence failed");
                            }
                        });
                    }
                    other => {
                        dispatcher
                            .dispatch(conn.organization_id, conn.cluster_id, other)
                            .await;
                    }
                }
            }
            Ok(None) => return Ok(()),
            Err(status) => {
                return Err(ControlError::StreamIo(format!(
                    "stream read failed: {status}"
                )));
            }
        }
    }
}

/// Drain/detach: release the registry slot (no-op when displaced) and
/// mark the cluster INACTIVE only when no successor owns it.
async fn detach(state: &AppState, conn: &Arc<ClusterConnection>) {
    let removed = state.registry.unregister(conn.cluster_id, conn);
    if removed && state.registry.lookup(conn.cluster_id).is_none() {
        if let Err(e) =
            clusters::set_status(&state.pool, conn.cluster_id, ClusterStatus::Inactive).await
        {
            tracing::warn!(?e, cluster_id = %conn.cluster_id, "failed to deactivate cluster");
        }
    }
    counter!("relayer_streams_detached_total").increment(1);
    tracing::info!(cluster_id = %conn.cluster_id, displaced = !removed, "relayer stream detached");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;

    #[test]
    fn work_message_maps_to_work_item_frame() {
        let execution_id = Uuid::new_v4();
        let msg = QueueMessage::Work {
            execution_id,
            agent_name: "summarize".into(),
            input_json: r#"{"text":"hi"}"#.into(),
            priority: Priority::Normal,
        };
        match control_frame_for(&msg).frame {
            Some(control_frame::Frame::WorkItem(item)) => {
                assert_eq!(item.execution_id, execution_id.to_string());
                assert_eq!(item.agent_name, "summarize");
                assert_eq!(item.priority, 2);
            }
            other => panic!("expected work item frame, got {other:?}"),
        }
    }

    #[test]
    fn registration_message_maps_to_registration_frame() {
        let agent_id = Uuid::new_v4();
        let msg = QueueMessage::Registration {
            agent_id,
            agent_name: "summarize".into(),
            image: "registry.example/summarize:v1".into(),
            resources_json: "{}".into(),
            retry_policy_json: "{}".into(),
            environment_json: "{}".into(),
            use_agent_sandbox: true,
            warm_pool_size: 2,
            network_policy: "restricted".into(),
            config_hash: "abc".into(),
        };
        match control_frame_for(&msg).frame {
            Some(control_frame::Frame::AgentRegistration(reg)) => {
                assert_eq!(reg.id, agent_id.to_string());
                assert_eq!(reg.warm_pool_size, 2);
                assert!(reg.use_agent_sandbox);
                assert_eq!(reg.config_hash, "abc");
            }
            other => panic!("expected registration frame, got {other:?}"),
        }
    }
}
