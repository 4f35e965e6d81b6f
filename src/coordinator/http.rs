//! HTTP surface of the coordinator
//!
//! Thin translation layer: each route parses its body, runs the matching
//! state operation (through the replicator for mutations), and renders the
//! result as pretty-printed JSON. Cluster routes are guarded by the shared
//! `x-skyclaw-token`; `/v1/public/*` is guarded by scoped API keys and gets
//! permissive CORS for browser clients.

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode, Uri},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::common::canonical::request_hash;
use crate::common::config::{ApiKeyConfig, CoordinatorConfig};
use crate::common::utils::now;
use crate::common::{Error, Result};
use crate::coordinator::model::{JobPayload, JobRequirement, Snapshot};
use crate::coordinator::peers::PeerSet;
use crate::coordinator::replicate::Replicator;
use crate::coordinator::state::{
    CoordinatorState, JobCompletion, ServiceReport, ServiceSpec,
};

/// Shared coordinator state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub node_id: String,
    pub state: Arc<Mutex<CoordinatorState>>,
    pub peers: Arc<Mutex<PeerSet>>,
    pub replicator: Arc<Replicator>,
    pub config: Arc<CoordinatorConfig>,
}

/// Creates the HTTP router with all coordinator endpoints
pub fn create_router(app: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/state", get(full_state))
        .route("/v1/replicate/snapshot", post(replicate_snapshot))
        .route("/v1/network/peers", get(network_peers))
        .route("/v1/network/join", post(network_join))
        .route("/v1/hosts/register", post(register_host))
        .route("/v1/hosts/:id/heartbeat", post(heartbeat))
        .route("/v1/hosts/:id/claim", post(claim_job))
        .route("/v1/hosts/:id/services/claim", post(claim_service))
        .route("/v1/jobs", post(enqueue_job))
        .route("/v1/jobs/:id/complete", post(complete_job))
        .route("/v1/services", post(deploy_service).get(list_services))
        .route("/v1/services/:id", get(get_service))
        .route("/v1/services/:id/report", post(report_service))
        .route(
            "/v1/public/jobs",
            post(public_submit_job).options(public_preflight),
        )
        .route(
            "/v1/public/jobs/:id",
            get(public_get_job).options(public_preflight),
        )
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(app.clone(), token_auth))
        .with_state(app)
}

// === Responses ===

fn raw_json_response(status: StatusCode, body: String) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("static response parts")
}

/// Pretty-printed JSON, the wire format for every endpoint
fn json_response(status: StatusCode, value: &Value) -> Response {
    let body = serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string());
    raw_json_response(status, body)
}

fn error_response(error: &Error) -> Response {
    json_response(error.to_http_status(), &json!({ "error": error.to_string() }))
}

fn ok_or_error(result: Result<Value>) -> Response {
    match result {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(e) => error_response(&e),
    }
}

async fn not_found() -> Response {
    error_response(&Error::NotFound("unknown route".into()))
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Value) -> Result<T> {
    serde_json::from_value(body.clone())
        .map_err(|e| Error::BadRequest(format!("invalid request body: {}", e)))
}

fn body_value(body: Option<Json<Value>>) -> Value {
    body.map(|Json(value)| value).unwrap_or_else(|| json!({}))
}

// === Auth ===

/// Shared-token guard for every non-public route
async fn token_auth(State(app): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path();
    if path.starts_with("/v1/public/") {
        return next.run(request).await;
    }
    if let Some(expected) = &app.config.auth_token {
        let provided = request
            .headers()
            .get("x-skyclaw-token")
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            return error_response(&Error::Unauthorized(
                "missing or invalid x-skyclaw-token".into(),
            ));
        }
    }
    next.run(request).await
}

/// Resolve the API key for a public request from `Authorization: Bearer` or
/// `x-api-key`
fn public_key_for<'a>(
    config: &'a CoordinatorConfig,
    headers: &HeaderMap,
) -> Result<&'a ApiKeyConfig> {
    if config.api_keys.is_empty() {
        return Err(Error::PublicApiDisabled);
    }
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
        .ok_or_else(|| Error::Unauthorized("missing API key".into()))?;
    config
        .api_keys
        .iter()
        .find(|k| k.key == presented)
        .ok_or_else(|| Error::Unauthorized("unknown API key".into()))
}

fn cors_origin(config: &CoordinatorConfig) -> String {
    config
        .public_cors_origin
        .clone()
        .unwrap_or_else(|| "*".to_string())
}

fn with_cors(mut response: Response, origin: &str) -> Response {
    let headers = response.headers_mut();
    if let Ok(value) = origin.parse() {
        headers.insert("access-control-allow-origin", value);
    }
    headers.insert(
        "access-control-allow-methods",
        "GET, POST, OPTIONS".parse().expect("static header"),
    );
    headers.insert(
        "access-control-allow-headers",
        "authorization, content-type, x-api-key, x-idempotency-key"
            .parse()
            .expect("static header"),
    );
    response
}

// === Idempotency ===

/// Run a mutation under the idempotency ledger. Without a key the mutation
/// runs plain; with one, a matching replay returns the stored response and a
/// body mismatch is a conflict. The record is written only after the
/// mutation (including its replication) succeeded.
async fn run_idempotent<F, Fut>(
    app: &AppState,
    route: &str,
    headers: &HeaderMap,
    body: &Value,
    run: F,
) -> Response
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value>>,
{
    let key = headers
        .get("x-idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let Some(key) = key else {
        return ok_or_error(run().await);
    };

    let hash = request_hash(route, body);
    let existing = app
        .state
        .lock()
        .expect("state lock")
        .get_idempotency(route, &key);
    match existing {
        Err(e) => return error_response(&e),
        Ok(Some(record)) if record.expires_at > now() => {
            if record.request_hash != hash {
                return error_response(&Error::Conflict("idempotency key reuse conflict".into()));
            }
            let status = StatusCode::from_u16(record.status_code).unwrap_or(StatusCode::OK);
            return raw_json_response(status, record.response_json);
        }
        Ok(_) => {}
    }

    match run().await {
        Ok(value) => {
            let body = serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string());
            let saved = app.state.lock().expect("state lock").save_idempotency(
                route,
                &key,
                &hash,
                StatusCode::OK.as_u16(),
                body.clone(),
                app.config.idempotency_ttl_ms,
            );
            if let Err(e) = saved {
                tracing::warn!("failed to persist idempotency record: {}", e);
            }
            raw_json_response(StatusCode::OK, body)
        }
        Err(e) => error_response(&e),
    }
}

// === Cluster handlers ===

async fn health(State(app): State<AppState>) -> Response {
    json_response(StatusCode::OK, &json!({ "ok": true, "nodeId": app.node_id }))
}

async fn full_state(State(app): State<AppState>) -> Response {
    let snapshot = app.state.lock().expect("state lock").snapshot();
    ok_or_error(snapshot.and_then(|s| Ok(serde_json::to_value(s)?)))
}

async fn replicate_snapshot(
    State(app): State<AppState>,
    body: Option<Json<Value>>,
) -> Response {
    let body = body_value(body);
    let result = parse_body::<Snapshot>(&body).and_then(|snapshot| {
        let changed = app
            .state
            .lock()
            .expect("state lock")
            .merge_snapshot(&snapshot)?;
        Ok(json!({ "ok": true, "changed": changed, "nodeId": app.node_id }))
    });
    ok_or_error(result)
}

async fn network_peers(State(app): State<AppState>) -> Response {
    let peers = app.peers.lock().expect("peer set lock");
    json_response(
        StatusCode::OK,
        &json!({
            "nodeId": app.node_id,
            "self": peers.self_url(),
            "peers": peers.list(),
        }),
    )
}

#[derive(Deserialize)]
struct JoinRequest {
    url: String,
}

async fn network_join(State(app): State<AppState>, body: Option<Json<Value>>) -> Response {
    let body = body_value(body);
    let result = parse_body::<JoinRequest>(&body).map(|join| {
        let mut peers = app.peers.lock().expect("peer set lock");
        let added = peers.add(&join.url);
        if added {
            tracing::info!("peer joined: {}", join.url);
        }
        json!({ "ok": true, "added": added, "peers": peers.list() })
    });
    ok_or_error(result)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterHostRequest {
    #[serde(default)]
    host_id: Option<String>,
    name: String,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    max_parallel: Option<u32>,
}

async fn register_host(
    State(app): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let body = body_value(body);
    run_idempotent(&app, uri.path(), &headers, &body, || async {
        let req: RegisterHostRequest = parse_body(&body)?;
        let host = app
            .replicator
            .mutate(move |state| {
                state.register_host(
                    req.host_id,
                    req.name,
                    req.capabilities,
                    req.max_parallel.unwrap_or(1),
                )
            })
            .await?;
        Ok(json!({ "host": host }))
    })
    .await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatRequest {
    #[serde(default)]
    active_leases: Option<u32>,
}

async fn heartbeat(
    State(app): State<AppState>,
    Path(host_id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let body = body_value(body);
    run_idempotent(&app, uri.path(), &headers, &body, || async {
        let req: HeartbeatRequest = parse_body(&body)?;
        let host = app
            .replicator
            .mutate(move |state| state.heartbeat(&host_id, req.active_leases))
            .await?;
        Ok(json!({ "host": host }))
    })
    .await
}

async fn claim_job(
    State(app): State<AppState>,
    Path(host_id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let body = body_value(body);
    run_idempotent(&app, uri.path(), &headers, &body, || async {
        let job = app
            .replicator
            .mutate(move |state| state.claim_job(&host_id))
            .await?;
        Ok(json!({ "job": job }))
    })
    .await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueJobRequest {
    payload: JobPayload,
    #[serde(default)]
    requirement: Option<JobRequirement>,
    #[serde(default)]
    submitted_by: Option<String>,
}

async fn enqueue_job(
    State(app): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let body = body_value(body);
    run_idempotent(&app, uri.path(), &headers, &body, || async {
        let req: EnqueueJobRequest = parse_body(&body)?;
        let job = app
            .replicator
            .mutate(move |state| state.enqueue_job(req.payload, req.requirement, req.submitted_by))
            .await?;
        Ok(json!({ "job": job }))
    })
    .await
}

async fn complete_job(
    State(app): State<AppState>,
    Path(job_id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let body = body_value(body);
    run_idempotent(&app, uri.path(), &headers, &body, || async {
        let completion: JobCompletion = parse_body(&body)?;
        let job = app
            .replicator
            .mutate(move |state| state.complete_job(&job_id, completion))
            .await?;
        Ok(json!({ "job": job }))
    })
    .await
}

async fn deploy_service(
    State(app): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let body = body_value(body);
    run_idempotent(&app, uri.path(), &headers, &body, || async {
        let spec: ServiceSpec = parse_body(&body)?;
        let service = app
            .replicator
            .mutate(move |state| state.deploy_service(spec))
            .await?;
        Ok(json!({ "service": service }))
    })
    .await
}

async fn list_services(State(app): State<AppState>) -> Response {
    let services = app.state.lock().expect("state lock").list_services();
    json_response(StatusCode::OK, &json!({ "services": services }))
}

async fn get_service(State(app): State<AppState>, Path(service_id): Path<String>) -> Response {
    let state = app.state.lock().expect("state lock");
    match state.get_service(&service_id) {
        Some(service) => json_response(StatusCode::OK, &json!({ "service": service })),
        None => error_response(&Error::NotFound(format!("unknown service: {}", service_id))),
    }
}

async fn claim_service(
    State(app): State<AppState>,
    Path(host_id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let body = body_value(body);
    run_idempotent(&app, uri.path(), &headers, &body, || async {
        let service = app
            .replicator
            .mutate(move |state| state.claim_service(&host_id))
            .await?;
        Ok(json!({ "service": service }))
    })
    .await
}

async fn report_service(
    State(app): State<AppState>,
    Path(service_id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let body = body_value(body);
    run_idempotent(&app, uri.path(), &headers, &body, || async {
        let report: ServiceReport = parse_body(&body)?;
        let service = app
            .replicator
            .mutate(move |state| state.report_service(&service_id, report))
            .await?;
        Ok(json!({ "service": service }))
    })
    .await
}

// === Public API ===

async fn public_preflight(State(app): State<AppState>) -> Response {
    let response = Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())
        .expect("static response parts");
    with_cors(response, &cors_origin(&app.config))
}

/// Drop `submittedBy` from a `{ "job": ... }` envelope; tenants do not see
/// their internal identity label
fn strip_submitted_by(mut envelope: Value) -> Value {
    if let Some(job) = envelope.get_mut("job").and_then(|j| j.as_object_mut()) {
        job.remove("submittedBy");
    }
    envelope
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicJobRequest {
    payload: JobPayload,
    #[serde(default)]
    requirement: Option<JobRequirement>,
}

fn validate_public_request(key: &ApiKeyConfig, req: &PublicJobRequest) -> Result<()> {
    if matches!(req.payload, JobPayload::Shell { .. }) && !key.allow_shell {
        return Err(Error::Forbidden("shell payloads are not allowed for this key".into()));
    }
    if let Some(requirement) = &req.requirement {
        for capability in &requirement.required_capabilities {
            let trimmed = capability.trim();
            if !trimmed.is_empty() && !key.allowed_capabilities.iter().any(|c| c == trimmed) {
                return Err(Error::Forbidden(format!(
                    "capability not allowed for this key: {}",
                    trimmed
                )));
            }
        }
    }
    Ok(())
}

async fn public_submit_job(
    State(app): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Response {
    let origin = cors_origin(&app.config);
    let key = match public_key_for(&app.config, &headers) {
        Ok(key) => key.clone(),
        Err(e) => return with_cors(error_response(&e), &origin),
    };
    let body = body_value(body);
    let response = run_idempotent(&app, uri.path(), &headers, &body, || async {
        let req: PublicJobRequest = parse_body(&body)?;
        validate_public_request(&key, &req)?;
        let submitter = key.submitter();
        let job = app
            .replicator
            .mutate(move |state| {
                state.enqueue_job(req.payload, req.requirement, Some(submitter))
            })
            .await?;
        Ok(strip_submitted_by(json!({ "job": job })))
    })
    .await;
    with_cors(response, &origin)
}

async fn public_get_job(
    State(app): State<AppState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let origin = cors_origin(&app.config);
    let key = match public_key_for(&app.config, &headers) {
        Ok(key) => key.clone(),
        Err(e) => return with_cors(error_response(&e), &origin),
    };
    let submitter = key.submitter();
    let state = app.state.lock().expect("state lock");
    let response = match state.get_job(&job_id) {
        // strict tenant isolation: someone else's job looks like no job
        Some(job) if job.submitted_by.as_deref() == Some(submitter.as_str()) => {
            json_response(StatusCode::OK, &strip_submitted_by(json!({ "job": job })))
        }
        _ => error_response(&Error::NotFound(format!("unknown job: {}", job_id))),
    };
    drop(state);
    with_cors(response, &origin)
}
