//! Route handlers.

use std::collections::BTreeMap;
use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use switchboard_core::model::UserContext;
use switchboard_core::orchestrator::TurnRequest;
use switchboard_core::tools::{BreakerState, ToolInvoker, ToolOutcome};
use switchboard_core::GatewayError;

use crate::error::ApiError;
use crate::state::SharedState;

type EventStream = BoxStream<'static, Result<Event, Infallible>>;
type SseResponse = Sse<KeepAliveStream<EventStream>>;

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/query", post(post_query).get(get_query))
        .route("/api/mcp/{server}/{tool}", get(mcp_get).post(mcp_post))
        .route("/api/confirm/{id}", post(confirm))
        .route("/api/revoke", post(revoke))
        .route("/health", get(health))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Authentication plumbing
// ---------------------------------------------------------------------------

fn bearer_from_headers(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or_else(|| ApiError(GatewayError::auth("missing bearer token")))
}

/// Validate the token and open this request's audit correlation.
async fn authenticate(
    state: &SharedState,
    token: &str,
) -> Result<(UserContext, String), ApiError> {
    let correlation_id = Uuid::new_v4().to_string();
    match state.validator.validate(token, &state.revocations).await {
        Ok(ctx) => {
            state
                .audit
                .record(&correlation_id, "auth_ok", Some(&ctx.subject), Value::Null);
            Ok((ctx, correlation_id))
        }
        Err(e) => {
            state.audit.record(
                &correlation_id,
                "auth_reject",
                None,
                json!({ "error": format!("{:?}", e) }),
            );
            Err(e.into())
        }
    }
}

// ---------------------------------------------------------------------------
// Streamed query
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct QueryBody {
    pub query: String,
}

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    pub q: String,
    pub token: String,
    /// Pagination cursor from an earlier truncated result; handed to the
    /// model as context so it can resume where that result stopped.
    pub cursor: Option<String>,
}

pub async fn post_query(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<QueryBody>,
) -> Result<SseResponse, ApiError> {
    let token = bearer_from_headers(&headers)?;
    let (ctx, correlation_id) = authenticate(&state, &token).await?;
    run_query(state, ctx, correlation_id, &body.query)
}

/// Header-less streaming clients pass the token as a query parameter.
/// This is the only endpoint that accepts token-in-URL; nothing in this
/// handler (or its tracing) may log the request query string.
pub async fn get_query(
    State(state): State<SharedState>,
    Query(params): Query<QueryParams>,
) -> Result<SseResponse, ApiError> {
    let (ctx, correlation_id) = authenticate(&state, &params.token).await?;
    let raw = match &params.cursor {
        Some(cursor) => format!("{} (continue from result cursor {})", params.q, cursor),
        None => params.q.clone(),
    };
    run_query(state, ctx, correlation_id, &raw)
}

fn run_query(
    state: SharedState,
    ctx: UserContext,
    correlation_id: String,
    raw_query: &str,
) -> Result<SseResponse, ApiError> {
    let contained = match state.filter.screen_input(raw_query) {
        Ok(c) => c,
        Err(e) => {
            if let GatewayError::Abuse { detail, stage, .. } = &e {
                state.audit.record(
                    &correlation_id,
                    "filter_reject",
                    Some(&ctx.subject),
                    json!({ "stage": stage, "detail": detail }),
                );
            }
            return Err(e.into());
        }
    };

    let servers = state.router.resolve(&ctx.roles);
    state.audit.record(
        &correlation_id,
        "query_accepted",
        Some(&ctx.subject),
        json!({ "servers": servers.iter().map(|s| s.name.clone()).collect::<Vec<_>>() }),
    );

    let events = state.orchestrator.stream_turn(TurnRequest {
        ctx,
        contained,
        servers,
        correlation_id,
    });

    // One event per SSE data line, closed by the sentinel.
    let stream: EventStream = events
        .map(|ev| {
            let json = serde_json::to_string(&ev).unwrap_or_else(|_| "{}".to_string());
            Ok(Event::default().data(json))
        })
        .chain(futures::stream::once(async {
            Ok(Event::default().data("[DONE]"))
        }))
        .boxed();

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ---------------------------------------------------------------------------
// Direct tool invocation
// ---------------------------------------------------------------------------

pub async fn mcp_get(
    State(state): State<SharedState>,
    Path((server, tool)): Path<(String, String)>,
    headers: HeaderMap,
    Query(args): Query<BTreeMap<String, String>>,
) -> Result<Response, ApiError> {
    let token = bearer_from_headers(&headers)?;
    let (ctx, correlation_id) = authenticate(&state, &token).await?;
    let arguments = Value::Object(
        args.into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect(),
    );
    direct_invoke(state, ctx, correlation_id, server, tool, arguments).await
}

pub async fn mcp_post(
    State(state): State<SharedState>,
    Path((server, tool)): Path<(String, String)>,
    headers: HeaderMap,
    Json(arguments): Json<Value>,
) -> Result<Response, ApiError> {
    let token = bearer_from_headers(&headers)?;
    let (ctx, correlation_id) = authenticate(&state, &token).await?;
    direct_invoke(state, ctx, correlation_id, server, tool, arguments).await
}

async fn direct_invoke(
    state: SharedState,
    ctx: UserContext,
    correlation_id: String,
    server: String,
    tool: String,
    arguments: Value,
) -> Result<Response, ApiError> {
    let descriptor = match state.router.authorize(&ctx, &server) {
        Ok(d) => d,
        Err(e) => {
            state.audit.record(
                &correlation_id,
                "authz_reject",
                Some(&ctx.subject),
                json!({ "server": server }),
            );
            return Err(e.into());
        }
    };

    state.audit.record(
        &correlation_id,
        "tool_call",
        Some(&ctx.subject),
        json!({ "server": server, "tool": tool, "direct": true }),
    );

    let outcome = state.tools.invoke(&ctx, &descriptor, &tool, &arguments).await;
    match outcome {
        ToolOutcome::Success {
            data,
            truncated,
            cursor,
        } => Ok(Json(json!({
            "status": "ok",
            "data": data,
            "truncated": truncated,
            "cursor": cursor,
        }))
        .into_response()),
        ToolOutcome::NeedsConfirmation { summary, action } => {
            let deferred = switchboard_core::model::DeferredAction {
                server: server.clone(),
                tool: action.tool,
                arguments: action.arguments,
            };
            let pending =
                state
                    .confirmations
                    .create(&ctx.subject, &summary, deferred, Utc::now())?;
            state.audit.record(
                &correlation_id,
                "confirmation_created",
                Some(&ctx.subject),
                json!({ "id": pending.id, "server": server, "tool": tool }),
            );
            Ok(Json(json!({
                "status": "pending_confirmation",
                "id": pending.id,
                "summary": pending.summary,
                "expires_at": pending.expires_at,
            }))
            .into_response())
        }
        // Downstream structured errors pass through unmodified.
        ToolOutcome::Failed {
            code,
            message,
            remediation,
        } => Ok(Json(json!({
            "status": "error",
            "code": code,
            "message": message,
            "remediation": remediation,
        }))
        .into_response()),
        ToolOutcome::Unavailable { message } => {
            Err(GatewayError::degraded(server, message).into())
        }
    }
}

// ---------------------------------------------------------------------------
// Confirmation resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ConfirmBody {
    pub approved: bool,
}

pub async fn confirm(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ConfirmBody>,
) -> Result<Json<Value>, ApiError> {
    let token = bearer_from_headers(&headers)?;
    let (ctx, correlation_id) = authenticate(&state, &token).await?;

    // The claim is the race winner-take-all step; whoever gets here
    // second finds nothing.
    let claimed = match state.confirmations.claim(&id, &ctx.subject, Utc::now()) {
        Ok(c) => c,
        Err(e) => {
            state.audit.record(
                &correlation_id,
                "confirmation_reject",
                Some(&ctx.subject),
                json!({ "id": id, "error": format!("{:?}", e) }),
            );
            return Err(e.into());
        }
    };

    if !body.approved {
        state.audit.record(
            &correlation_id,
            "confirmation_denied",
            Some(&ctx.subject),
            json!({ "id": id }),
        );
        return Ok(Json(json!({ "status": "cancelled", "id": id })));
    }

    // Approved: execute the deferred action exactly once. Roles are
    // re-checked — an authorization lost since creation voids the action.
    let descriptor = state.router.authorize(&ctx, &claimed.action.server)?;
    let mut arguments = claimed.action.arguments.clone();
    if let Some(obj) = arguments.as_object_mut() {
        obj.insert("confirmed".to_string(), json!(true));
    }

    state.audit.record(
        &correlation_id,
        "confirmation_approved",
        Some(&ctx.subject),
        json!({ "id": id, "server": claimed.action.server, "tool": claimed.action.tool }),
    );

    let outcome = state
        .tools
        .invoke(&ctx, &descriptor, &claimed.action.tool, &arguments)
        .await;
    match outcome {
        ToolOutcome::Success { data, .. } => {
            Ok(Json(json!({ "status": "executed", "id": id, "result": data })))
        }
        ToolOutcome::Failed {
            code,
            message,
            remediation,
        } => Ok(Json(json!({
            "status": "error",
            "id": id,
            "code": code,
            "message": message,
            "remediation": remediation,
        }))),
        ToolOutcome::NeedsConfirmation { .. } => {
            // The confirmed flag should have satisfied the server; treat a
            // second deferral as a downstream contract violation.
            Ok(Json(json!({
                "status": "error",
                "id": id,
                "code": "unexpected_pending",
                "message": "the server deferred an already-confirmed action",
            })))
        }
        ToolOutcome::Unavailable { message } => {
            Err(GatewayError::degraded(claimed.action.server, message).into())
        }
    }
}

// ---------------------------------------------------------------------------
// Revocation (admin)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RevokeBody {
    pub jti: String,
    /// Defaults to 24 h — the longest token lifetime the deployment
    /// issues.
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn revoke(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<RevokeBody>,
) -> Result<Json<Value>, ApiError> {
    let token = bearer_from_headers(&headers)?;
    let (ctx, correlation_id) = authenticate(&state, &token).await?;

    if !ctx.has_role(&state.config.all_access_role) {
        state.audit.record(
            &correlation_id,
            "revoke_reject",
            Some(&ctx.subject),
            json!({ "jti": body.jti }),
        );
        return Err(GatewayError::forbidden("revocation-admin").into());
    }

    let now = Utc::now();
    let expires_at = body.expires_at.unwrap_or(now + Duration::hours(24));
    state
        .store
        .insert_revocation(&body.jti, now, expires_at)
        .map_err(|e| GatewayError::Store(e.to_string()))?;

    state.audit.record(
        &correlation_id,
        "token_revoked",
        Some(&ctx.subject),
        json!({ "jti": body.jti }),
    );

    Ok(Json(json!({ "status": "ok" })))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub async fn health(State(state): State<SharedState>) -> Response {
    let store_ok = state.store.ping().is_ok();
    let keyset_ok = state.validator.keyset_available();
    let revocation_ok = state.revocations.is_healthy();
    let breakers = state.tools.breaker_states();
    let all_circuits_open =
        !breakers.is_empty() && breakers.values().all(|s| *s == BreakerState::Open);

    // Degraded past threshold: no control store, no key set, or nothing
    // left to route to.
    let degraded = !store_ok || !keyset_ok || all_circuits_open;

    let body = json!({
        "status": if degraded { "degraded" } else { "ok" },
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "dependencies": {
            "control_store": if store_ok { "ok" } else { "unreachable" },
            "key_set": if keyset_ok { "ok" } else { "unreachable" },
            "revocation_cache": if revocation_ok { "fresh" } else { "stale" },
            "servers": breakers,
        }
    });

    let status = if degraded {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };
    (status, Json(body)).into_response()
}
