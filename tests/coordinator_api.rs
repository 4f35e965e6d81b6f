//! HTTP-level integration tests for a single coordinator

use serde_json::{json, Value};
use skyclaw::common::config::{ApiKeyConfig, CoordinatorConfig};
use skyclaw::coordinator::http::create_router;
use skyclaw::coordinator::Coordinator;
use tempfile::TempDir;

const TOKEN: &str = "cluster-secret";
const API_KEY: &str = "sk-public-test";

/// Bind a coordinator on an ephemeral port; returns its base URL
async fn spawn_coordinator(mut config: CoordinatorConfig) -> (String, TempDir) {
    let dir = TempDir::new().unwrap();
    config.db_path = dir.path().join("coord.db");
    let app = Coordinator::build_app(&config).unwrap();
    let router = create_router(app);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}", addr), dir)
}

fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        auth_token: Some(TOKEN.to_string()),
        min_replicas: 1,
        api_keys: vec![ApiKeyConfig {
            key: API_KEY.to_string(),
            label: Some("acme".to_string()),
            allowed_capabilities: vec!["openclaw".to_string()],
            allow_shell: false,
        }],
        ..Default::default()
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn post(base: &str, path: &str, body: Value) -> (u16, Value) {
    let resp = client()
        .post(format!("{}{}", base, path))
        .header("x-skyclaw-token", TOKEN)
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    (status, body)
}

async fn get(base: &str, path: &str) -> (u16, Value) {
    let resp = client()
        .get(format!("{}{}", base, path))
        .header("x-skyclaw-token", TOKEN)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_token_guard() {
    let (base, _dir) = spawn_coordinator(test_config()).await;

    let resp = client()
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    let (status, body) = get(&base, "/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["ok"], true);
    assert!(body["nodeId"].is_string());
}

#[tokio::test]
async fn test_job_lifecycle_over_http() {
    let (base, _dir) = spawn_coordinator(test_config()).await;

    let (status, body) = post(
        &base,
        "/v1/hosts/register",
        json!({ "name": "openclaw-a", "capabilities": ["shell", "openclaw"], "maxParallel": 2 }),
    )
    .await;
    assert_eq!(status, 200);
    let host_id = body["host"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["host"]["activeLeases"], 0);

    let (status, body) = post(
        &base,
        "/v1/jobs",
        json!({
            "payload": { "kind": "openclaw-run", "args": ["run"] },
            "requirement": { "requiredCapabilities": ["openclaw"] }
        }),
    )
    .await;
    assert_eq!(status, 200);
    let job_id = body["job"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["job"]["status"], "queued");

    let (status, body) = post(&base, &format!("/v1/hosts/{}/claim", host_id), json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["job"]["id"], job_id.as_str());
    assert_eq!(body["job"]["status"], "leased");
    assert_eq!(body["job"]["assignedHostId"], host_id.as_str());
    assert_eq!(body["job"]["attempts"], 1);

    let (status, body) = post(
        &base,
        &format!("/v1/jobs/{}/complete", job_id),
        json!({
            "hostId": host_id,
            "success": true,
            "durationMs": 42,
            "exitCode": 0,
            "stdout": "ok\n",
            "stderr": ""
        }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["job"]["status"], "completed");
    assert_eq!(body["job"]["result"]["stdout"], "ok\n");

    let (status, body) = get(&base, "/v1/state").await;
    assert_eq!(status, 200);
    assert_eq!(body["hosts"][0]["activeLeases"], 0);
    assert_eq!(body["jobs"][0]["status"], "completed");
}

#[tokio::test]
async fn test_completion_requires_the_assigned_host() {
    let (base, _dir) = spawn_coordinator(test_config()).await;

    let (_, body) = post(
        &base,
        "/v1/hosts/register",
        json!({ "name": "a", "capabilities": ["shell"] }),
    )
    .await;
    let owner = body["host"]["id"].as_str().unwrap().to_string();
    let (_, body) = post(
        &base,
        "/v1/hosts/register",
        json!({ "name": "b", "capabilities": ["shell"] }),
    )
    .await;
    let thief = body["host"]["id"].as_str().unwrap().to_string();

    let (_, body) = post(
        &base,
        "/v1/jobs",
        json!({
            "payload": { "kind": "shell", "command": "true" },
            "requirement": { "requiredCapabilities": ["shell"] }
        }),
    )
    .await;
    let job_id = body["job"]["id"].as_str().unwrap().to_string();
    post(&base, &format!("/v1/hosts/{}/claim", owner), json!({})).await;

    let (status, body) = post(
        &base,
        &format!("/v1/jobs/{}/complete", job_id),
        json!({ "hostId": thief, "success": true }),
    )
    .await;
    assert_eq!(status, 500);
    assert!(body["error"].as_str().unwrap().contains("assigned"));
}

#[tokio::test]
async fn test_idempotency_replay_and_conflict() {
    let (base, _dir) = spawn_coordinator(test_config()).await;
    let body = json!({ "payload": { "kind": "openclaw-run", "args": ["run"] } });

    let submit = |body: Value| {
        let base = base.clone();
        async move {
            let resp = client()
                .post(format!("{}/v1/jobs", base))
                .header("x-skyclaw-token", TOKEN)
                .header("x-idempotency-key", "req-1")
                .json(&body)
                .send()
                .await
                .unwrap();
            let status = resp.status().as_u16();
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            (status, body)
        }
    };

    let (status, first) = submit(body.clone()).await;
    assert_eq!(status, 200);
    let (status, replay) = submit(body.clone()).await;
    assert_eq!(status, 200);
    // byte-identical replay, no second job
    assert_eq!(first, replay);
    let (_, state) = get(&base, "/v1/state").await;
    assert_eq!(state["jobs"].as_array().unwrap().len(), 1);

    // same key, different body
    let (status, body) = submit(json!({ "payload": { "kind": "openclaw-run", "args": ["other"] } })).await;
    assert_eq!(status, 409);
    assert!(body["error"].as_str().unwrap().contains("idempotency"));
}

#[tokio::test]
async fn test_service_lifecycle_over_http() {
    let (base, _dir) = spawn_coordinator(test_config()).await;

    let (_, body) = post(
        &base,
        "/v1/hosts/register",
        json!({ "name": "svc-host", "capabilities": ["service-host"] }),
    )
    .await;
    let host_id = body["host"]["id"].as_str().unwrap().to_string();

    let (status, body) = post(
        &base,
        "/v1/services",
        json!({ "name": "api", "command": "serve", "args": ["--port", "9000"] }),
    )
    .await;
    assert_eq!(status, 200);
    let service_id = body["service"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["service"]["status"], "pending");
    assert_eq!(body["service"]["requiredCapabilities"][0], "service-host");

    let (status, body) = post(
        &base,
        &format!("/v1/hosts/{}/services/claim", host_id),
        json!({}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["service"]["id"], service_id.as_str());

    let (status, body) = post(
        &base,
        &format!("/v1/services/{}/report", service_id),
        json!({ "hostId": host_id, "status": "running", "endpoint": "http://10.0.0.5:9000/" }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["service"]["status"], "running");
    assert_eq!(
        body["service"]["assignments"][0]["endpoint"],
        "http://10.0.0.5:9000"
    );

    let (status, body) = get(&base, "/v1/services").await;
    assert_eq!(status, 200);
    assert_eq!(body["services"].as_array().unwrap().len(), 1);

    let (status, _) = get(&base, &format!("/v1/services/{}", service_id)).await;
    assert_eq!(status, 200);
    let (status, _) = get(&base, "/v1/services/svc_missing").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_public_surface() {
    let (base, _dir) = spawn_coordinator(test_config()).await;

    // no key
    let resp = client()
        .post(format!("{}/v1/public/jobs", base))
        .json(&json!({ "payload": { "kind": "openclaw-run", "args": [] } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    // shell payload without allowShell
    let resp = client()
        .post(format!("{}/v1/public/jobs", base))
        .bearer_auth(API_KEY)
        .json(&json!({ "payload": { "kind": "shell", "command": "true" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);

    // capability outside the key's scope
    let resp = client()
        .post(format!("{}/v1/public/jobs", base))
        .bearer_auth(API_KEY)
        .json(&json!({
            "payload": { "kind": "openclaw-run", "args": [] },
            "requirement": { "requiredCapabilities": ["shell"] }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);

    // a valid submission; the tenant label never leaks
    let resp = client()
        .post(format!("{}/v1/public/jobs", base))
        .bearer_auth(API_KEY)
        .json(&json!({ "payload": { "kind": "openclaw-run", "args": ["run"] } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert!(resp
        .headers()
        .get("access-control-allow-origin")
        .is_some());
    let body: Value = resp.json().await.unwrap();
    let job_id = body["job"]["id"].as_str().unwrap().to_string();
    assert!(body["job"].get("submittedBy").is_none());

    // readable with the submitting key, via x-api-key as well
    let resp = client()
        .get(format!("{}/v1/public/jobs/{}", base, job_id))
        .header("x-api-key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    // other tenants see a 404
    let resp = client()
        .get(format!("{}/v1/public/jobs/{}", base, job_id))
        .bearer_auth("sk-other")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    // internal view still records the submitter
    let (_, state) = get(&base, "/v1/state").await;
    assert_eq!(state["jobs"][0]["submittedBy"], "public:acme");
}

#[tokio::test]
async fn test_public_tenant_isolation() {
    let mut config = test_config();
    config.api_keys.push(ApiKeyConfig {
        key: "sk-other-tenant".to_string(),
        label: Some("rival".to_string()),
        allowed_capabilities: vec!["openclaw".to_string()],
        allow_shell: false,
    });
    let (base, _dir) = spawn_coordinator(config).await;

    let resp = client()
        .post(format!("{}/v1/public/jobs", base))
        .bearer_auth(API_KEY)
        .json(&json!({ "payload": { "kind": "openclaw-run", "args": [] } }))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    let job_id = body["job"]["id"].as_str().unwrap().to_string();

    let resp = client()
        .get(format!("{}/v1/public/jobs/{}", base, job_id))
        .bearer_auth("sk-other-tenant")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

#[tokio::test]
async fn test_public_disabled_without_keys() {
    let mut config = test_config();
    config.api_keys.clear();
    let (base, _dir) = spawn_coordinator(config).await;

    let resp = client()
        .post(format!("{}/v1/public/jobs", base))
        .bearer_auth(API_KEY)
        .json(&json!({ "payload": { "kind": "openclaw-run", "args": [] } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 503);
}

#[tokio::test]
async fn test_public_preflight() {
    let (base, _dir) = spawn_coordinator(test_config()).await;
    let resp = client()
        .request(reqwest::Method::OPTIONS, format!("{}/v1/public/jobs", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 204);
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .unwrap()
            .to_str()
            .unwrap(),
        "*"
    );
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (base, _dir) = spawn_coordinator(test_config()).await;
    let (status, _) = get(&base, "/v1/nonsense").await;
    assert_eq!(status, 404);
}
