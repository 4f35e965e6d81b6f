//! Gateway server: service polling, health probing, reverse proxy

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::Response,
    routing::any,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{GatewayConfig, Result};
use crate::coordinator::model::Service;
use crate::gateway::registry::EndpointRegistry;

pub struct Gateway {
    config: GatewayConfig,
}

#[derive(Clone)]
struct GatewayState {
    registry: Arc<EndpointRegistry>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ServiceListResponse {
    #[serde(default)]
    services: Vec<Service>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting gateway");
        tracing::info!("  Bind: {}", self.config.bind);
        tracing::info!("  Coordinators: {}", self.config.coordinators.join(", "));

        let registry = Arc::new(EndpointRegistry::new(Duration::from_secs(
            self.config.cooldown_secs,
        )));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        start_poll_loop(registry.clone(), client.clone(), &self.config);
        start_probe_loop(registry.clone(), client.clone(), &self.config);

        let state = GatewayState {
            registry,
            client,
        };
        let router = Router::new()
            .route("/svc/:service", any(proxy_root))
            .route("/svc/:service/*rest", any(proxy_path))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(self.config.bind.as_str()).await?;
        tracing::info!("✓ Gateway ready");
        axum::serve(listener, router).await?;
        Ok(())
    }
}

/// Poll `/v1/services` from the first coordinator that answers
fn start_poll_loop(registry: Arc<EndpointRegistry>, client: reqwest::Client, config: &GatewayConfig) {
    let coordinators: Vec<String> = config
        .coordinators
        .iter()
        .map(|c| c.trim_end_matches('/').to_string())
        .collect();
    let token = config.auth_token.clone();
    let interval = Duration::from_secs(config.poll_interval_secs.max(1));
    tokio::spawn(async move {
        let mut cursor = 0usize;
        loop {
            tokio::time::sleep(interval).await;
            if coordinators.is_empty() {
                continue;
            }
            for offset in 0..coordinators.len() {
                let index = (cursor + offset) % coordinators.len();
                let url = format!("{}/v1/services", coordinators[index]);
                let mut request = client.get(&url);
                if let Some(token) = &token {
                    request = request.header("x-skyclaw-token", token);
                }
                match request.send().await {
                    Ok(resp) if resp.status().is_success() => {
                        match resp.json::<ServiceListResponse>().await {
                            Ok(list) => {
                                registry.update(&list.services);
                                cursor = index;
                            }
                            Err(e) => tracing::warn!("bad service list from {}: {}", url, e),
                        }
                        break;
                    }
                    Ok(resp) => {
                        tracing::debug!("coordinator {} refused service list: {}", url, resp.status())
                    }
                    Err(e) => tracing::debug!("coordinator {} unreachable: {}", url, e),
                }
            }
        }
    });
}

/// Probe `/health` on every routed endpoint; eject failures for the cooldown
fn start_probe_loop(registry: Arc<EndpointRegistry>, client: reqwest::Client, config: &GatewayConfig) {
    let interval = Duration::from_secs(config.probe_interval_secs.max(1));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            for endpoint in registry.endpoints() {
                let url = format!("{}/health", endpoint);
                match client.get(&url).send().await {
                    Ok(resp) if resp.status().is_success() => registry.mark_healthy(&endpoint),
                    Ok(resp) => {
                        tracing::warn!("endpoint {} unhealthy: {}", endpoint, resp.status());
                        registry.eject(&endpoint);
                    }
                    Err(e) => {
                        tracing::warn!("endpoint {} unreachable: {}", endpoint, e);
                        registry.eject(&endpoint);
                    }
                }
            }
        }
    });
}

async fn proxy_root(
    State(state): State<GatewayState>,
    Path(service): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy(state, service, String::new(), method, uri, headers, body).await
}

async fn proxy_path(
    State(state): State<GatewayState>,
    Path((service, rest)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy(state, service, rest, method, uri, headers, body).await
}

fn is_idempotent(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

fn gateway_error(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(format!("{{\n  \"error\": \"{}\"\n}}", message)))
        .expect("static response parts")
}

async fn proxy(
    state: GatewayState,
    service: String,
    rest: String,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // non-idempotent methods get exactly one upstream attempt
    let max_attempts = if is_idempotent(&method) { 3 } else { 1 };

    for _attempt in 0..max_attempts {
        let Some(endpoint) = state.registry.select(&service) else {
            return gateway_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "no healthy endpoint for service",
            );
        };
        let mut url = format!("{}/{}", endpoint, rest);
        if let Some(query) = uri.query() {
            url.push('?');
            url.push_str(query);
        }

        let reqwest_method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
            Ok(m) => m,
            Err(_) => return gateway_error(StatusCode::BAD_REQUEST, "unsupported method"),
        };
        let mut request = state.client.request(reqwest_method, &url).body(body.clone());
        for (name, value) in &headers {
            if matches!(name.as_str(), "host" | "content-length") {
                continue;
            }
            if let Ok(value) = value.to_str() {
                request = request.header(name.as_str(), value);
            }
        }

        match request.send().await {
            Ok(resp) if resp.status().as_u16() < 500 => {
                return forward_response(resp).await;
            }
            Ok(resp) => {
                tracing::warn!("upstream {} answered {}", endpoint, resp.status());
                state.registry.eject(&endpoint);
                if !is_idempotent(&method) {
                    return forward_response(resp).await;
                }
            }
            Err(e) => {
                tracing::warn!("upstream {} failed: {}", endpoint, e);
                state.registry.eject(&endpoint);
                if !is_idempotent(&method) {
                    return gateway_error(StatusCode::BAD_GATEWAY, "upstream request failed");
                }
            }
        }
    }
    gateway_error(StatusCode::BAD_GATEWAY, "all upstream attempts failed")
}

async fn forward_response(resp: reqwest::Response) -> Response {
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    if let Some(content_type) = resp.headers().get(header::CONTENT_TYPE) {
        if let Ok(value) = content_type.to_str() {
            builder = builder.header(header::CONTENT_TYPE, value);
        }
    }
    let body = resp.bytes().await.unwrap_or_default();
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| gateway_error(StatusCode::BAD_GATEWAY, "bad upstream response"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotent_methods() {
        assert!(is_idempotent(&Method::GET));
        assert!(is_idempotent(&Method::HEAD));
        assert!(is_idempotent(&Method::OPTIONS));
        assert!(!is_idempotent(&Method::POST));
        assert!(!is_idempotent(&Method::DELETE));
    }
}
