//! Coordinator server wiring and background loops

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::utils::mint_id;
use crate::common::{CoordinatorConfig, Result};
use crate::coordinator::http::{create_router, AppState};
use crate::coordinator::model::Snapshot;
use crate::coordinator::peers::PeerSet;
use crate::coordinator::replicate::{ReplicationPolicy, Replicator};
use crate::coordinator::state::CoordinatorState;
use crate::coordinator::store::Store;

const LEASE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const IDEMPOTENCY_GC_INTERVAL: Duration = Duration::from_secs(60);

pub struct Coordinator {
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self { config }
    }

    /// Open the store and assemble the shared handler state
    pub fn build_app(config: &CoordinatorConfig) -> Result<AppState> {
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| mint_id("node"));
        let store = Store::open(&config.db_path)?;
        let state = Arc::new(Mutex::new(CoordinatorState::open(
            node_id.clone(),
            config.lease_ms,
            store,
        )?));
        let peers = Arc::new(Mutex::new(PeerSet::new(
            config.public_url.as_deref(),
            &config.peer_urls,
        )));
        let replicator = Arc::new(Replicator::new(
            state.clone(),
            peers.clone(),
            ReplicationPolicy::new(config.min_replicas),
            config.auth_token.clone(),
        ));
        Ok(AppState {
            node_id,
            state,
            peers,
            replicator,
            config: Arc::new(config.clone()),
        })
    }

    pub async fn serve(self) -> Result<()> {
        self.config.validate()?;
        let app = Self::build_app(&self.config)?;

        tracing::info!("Starting coordinator: {}", app.node_id);
        tracing::info!("  HTTP API: {}:{}", self.config.host, self.config.port);
        tracing::info!("  DB path: {}", self.config.db_path.display());
        tracing::info!("  Min replicas: {}", self.config.min_replicas);
        tracing::info!("  Seed peers: {}", app.peers.lock().expect("peer set lock").len());

        start_background_tasks(app.clone(), &self.config);

        let router = create_router(app);
        let listener =
            tokio::net::TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        tracing::info!("✓ Coordinator ready");
        axum::serve(listener, router).await?;
        Ok(())
    }
}

/// Spawn the lease sweeper, idempotency GC and peer sync/discovery loops
pub fn start_background_tasks(
    app: AppState,
    config: &CoordinatorConfig,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    {
        let state = app.state.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(LEASE_SWEEP_INTERVAL).await;
                let requeued = state.lock().expect("state lock").requeue_expired_leases();
                match requeued {
                    Ok(0) => {}
                    Ok(count) => tracing::info!("requeued {} expired leases", count),
                    Err(e) => tracing::warn!("lease sweep failed: {}", e),
                }
            }
        }));
    }

    {
        let state = app.state.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(IDEMPOTENCY_GC_INTERVAL).await;
                match state.lock().expect("state lock").gc_idempotency() {
                    Ok(0) => {}
                    Ok(count) => tracing::debug!("removed {} expired idempotency records", count),
                    Err(e) => tracing::warn!("idempotency GC failed: {}", e),
                }
            }
        }));
    }

    {
        let interval = Duration::from_millis(config.peer_sync_interval_ms.max(100));
        let discovery = config.peer_discovery_enabled;
        let token = config.auth_token.clone();
        handles.push(tokio::spawn(async move {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new());
            loop {
                tokio::time::sleep(interval).await;
                sync_peers(&app, &client, token.as_deref()).await;
                if discovery {
                    discover_peers(&app, &client, token.as_deref()).await;
                }
            }
        }));
    }

    handles
}

fn authed(
    request: reqwest::RequestBuilder,
    token: Option<&str>,
) -> reqwest::RequestBuilder {
    match token {
        Some(token) => request.header("x-skyclaw-token", token),
        None => request,
    }
}

/// Pull each peer's full state and merge it; peer failures are dropped
async fn sync_peers(app: &AppState, client: &reqwest::Client, token: Option<&str>) {
    let peer_urls = app.peers.lock().expect("peer set lock").list();
    for peer in peer_urls {
        let url = format!("{}/v1/state", peer);
        let snapshot: Snapshot = match authed(client.get(&url), token).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::debug!("peer {} sent a bad snapshot: {}", peer, e);
                    continue;
                }
            },
            Ok(resp) => {
                tracing::debug!("peer {} sync rejected: {}", peer, resp.status());
                continue;
            }
            Err(e) => {
                tracing::debug!("peer {} unreachable: {}", peer, e);
                continue;
            }
        };
        let merged = app
            .state
            .lock()
            .expect("state lock")
            .merge_snapshot(&snapshot);
        match merged {
            Ok(true) => tracing::debug!("adopted state from peer {}", peer),
            Ok(false) => {}
            Err(e) => tracing::warn!("merge from peer {} failed: {}", peer, e),
        }
    }
}

#[derive(serde::Deserialize)]
struct PeerListResponse {
    #[serde(default)]
    peers: Vec<String>,
}

/// Learn new peers from each peer's list, then announce ourselves
async fn discover_peers(app: &AppState, client: &reqwest::Client, token: Option<&str>) {
    let peer_urls = app.peers.lock().expect("peer set lock").list();
    let self_url = app
        .peers
        .lock()
        .expect("peer set lock")
        .self_url()
        .map(str::to_string);

    for peer in &peer_urls {
        let url = format!("{}/v1/network/peers", peer);
        if let Ok(resp) = authed(client.get(&url), token).send().await {
            if let Ok(list) = resp.json::<PeerListResponse>().await {
                let mut peers = app.peers.lock().expect("peer set lock");
                for discovered in list.peers {
                    if peers.add(&discovered) {
                        tracing::info!("discovered peer: {}", discovered);
                    }
                }
            }
        }
    }

    if let Some(self_url) = self_url {
        for peer in &peer_urls {
            let url = format!("{}/v1/network/join", peer);
            let body = serde_json::json!({ "url": self_url });
            if let Err(e) = authed(client.post(&url), token).json(&body).send().await {
                tracing::debug!("join announce to {} failed: {}", peer, e);
            }
        }
    }
}
