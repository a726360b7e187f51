//! Internal HTTP surface: execution submission and reads, agent upserts,
//! liveness probes. Authenticated per request with an organization API
//! key; the org scope comes from the key, never from the payload.

use anyhow::anyhow;
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use ferry_common::rate_limit::middleware::{RateLimitKey, RateLimitLayer};
use ferry_common::rate_limit::RateLimiter;
use ferry_common::response;
use serde::Deserialize;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::agents::{self, AgentSpec, UpsertAction};
use crate::credentials::ApiKeyIdentity;
use crate::error::ControlError;
use crate::executions;
use crate::models::{ExecutionStatus, Priority};
use crate::state::AppState;

pub fn router(state: AppState, limiter: Option<RateLimiter>) -> Router {
    let mut protected = Router::new()
        .route("/v1/executions", post(submit_execution))
        .route("/v1/executions/{id}", get(get_execution))
        .route("/v1/agents", put(put_agent));
    if let Some(limiter) = limiter {
        // Inside the auth layer so the per-key accounting id is set.
        protected = protected.layer(RateLimitLayer::new(limiter));
    }
    let protected = protected.layer(middleware::from_fn_with_state(state.clone(), authenticate));

    let public = Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(health));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    public.merge(protected).layer(cors).with_state(state)
}

async fn health() -> impl IntoResponse {
    "OK"
}

async fn authenticate(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let Some(api_key) = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
    else {
        return response::unauthorized(anyhow!("x-api-key header missing"));
    };

    match state.credentials.verify_api_key(&api_key).await {
        Ok(identity) => {
            req.extensions_mut()
                .insert(RateLimitKey(format!("key:{}", identity.key_id)));
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        Err(_) => response::unauthorized(anyhow!("invalid API key")),
    }
}

fn error_response(e: ControlError) -> Response {
    let code = e.http_status();
    response::err_resp(anyhow!(e), code)
}

#[derive(Debug, Deserialize)]
struct SubmitExecutionRequest {
    agent: String,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    priority: Priority,
}

/// POST /v1/executions. 200 once QUEUED; 202 when accepted but still
/// PENDING (no ACTIVE cluster); 429 when the cluster queue is full.
async fn submit_execution(
    State(state): State<AppState>,
    axum::Extension(identity): axum::Extension<ApiKeyIdentity>,
    Json(req): Json<SubmitExecutionRequest>,
) -> Response {
    match executions::submit_execution(
        &state,
        identity.organization_id,
        &req.agent,
        req.input,
        req.priority,
    )
    .await
    {
        Ok(outcome) => {
            let code = match outcome.status {
                ExecutionStatus::Pending => StatusCode::ACCEPTED,
                _ => StatusCode::OK,
            };
            (code, Json(outcome)).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// GET /v1/executions/{id}, scoped to the caller's organization.
async fn get_execution(
    State(state): State<AppState>,
    axum::Extension(identity): axum::Extension<ApiKeyIdentity>,
    Path(id): Path<Uuid>,
) -> Response {
    match executions::get_execution(&state, identity.organization_id, id).await {
        Ok(Some(execution)) => Json(execution).into_response(),
        Ok(None) => response::not_found(anyhow!("execution {id} not found")),
        Err(e) => error_response(ControlError::internal(e)),
    }
}

/// PUT /v1/agents: create or update; unchanged configs are a no-op.
async fn put_agent(
    State(state): State<AppState>,
    axum::Extension(identity): axum::Extension<ApiKeyIdentity>,
    Json(spec): Json<AgentSpec>,
) -> Response {
    match agents::upsert_agent(&state, identity.organization_id, spec).await {
        Ok((agent, action)) => {
            let code = match action {
                UpsertAction::Created => StatusCode::CREATED,
                UpsertAction::Updated | UpsertAction::Unchanged => StatusCode::OK,
            };
            (
                code,
                Json(serde_json::json!({
                    "action": action.as_str(),
                    "agent": agent,
                })),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}
