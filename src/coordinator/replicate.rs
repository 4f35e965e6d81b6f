//! Quorum replication around state mutations
//!
//! Every mutating operation runs through [Replicator::mutate]:
//! checkpoint → apply → snapshot fan-out → commit, or rollback when the
//! write cannot reach enough peers. This buys at-least-N replication at
//! write time without a consensus log; the periodic sync loop converges
//! whatever the fan-out missed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::{Error, Result};
use crate::coordinator::model::Snapshot;
use crate::coordinator::peers::PeerSet;
use crate::coordinator::state::CoordinatorState;

/// How many peer acks a mutation needs before it may commit
#[derive(Debug, Clone, Copy)]
pub struct ReplicationPolicy {
    min_replicas: u32,
}

impl ReplicationPolicy {
    /// `min_replicas` counts this node; it is clamped to at least 1
    pub fn new(min_replicas: u32) -> Self {
        Self {
            min_replicas: min_replicas.max(1),
        }
    }

    pub fn required_peer_acks(&self) -> usize {
        (self.min_replicas - 1) as usize
    }

    /// Fail fast when the known peer set cannot possibly satisfy the quorum
    pub fn check_capacity(&self, known_peers: usize) -> Result<()> {
        let needed = self.required_peer_acks();
        if known_peers < needed {
            return Err(Error::InsufficientPeers {
                needed,
                available: known_peers,
            });
        }
        Ok(())
    }
}

/// Wraps the state mutex with the checkpoint/fan-out/rollback discipline
pub struct Replicator {
    state: Arc<Mutex<CoordinatorState>>,
    peers: Arc<Mutex<PeerSet>>,
    policy: ReplicationPolicy,
    client: reqwest::Client,
    auth_token: Option<String>,
}

impl Replicator {
    pub fn new(
        state: Arc<Mutex<CoordinatorState>>,
        peers: Arc<Mutex<PeerSet>>,
        policy: ReplicationPolicy,
        auth_token: Option<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            state,
            peers,
            policy,
            client,
            auth_token,
        }
    }

    pub fn state(&self) -> &Arc<Mutex<CoordinatorState>> {
        &self.state
    }

    pub fn peers(&self) -> &Arc<Mutex<PeerSet>> {
        &self.peers
    }

    /// Run a state mutation under the quorum write discipline.
    ///
    /// The mutation itself is synchronous and runs under the state lock; the
    /// snapshot push happens after the lock is released, so request handling
    /// never awaits while holding state.
    pub async fn mutate<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut CoordinatorState) -> Result<T>,
    {
        let required = self.policy.required_peer_acks();
        let peer_urls = self.peers.lock().expect("peer set lock").list();
        self.policy.check_capacity(peer_urls.len())?;

        let (checkpoint, value, snapshot) = {
            let mut state = self.state.lock().expect("state lock");
            let checkpoint = state.checkpoint();
            match op(&mut state).and_then(|value| Ok((value, state.snapshot()?))) {
                Ok((value, snapshot)) => (checkpoint, value, snapshot),
                Err(e) => {
                    state.restore(&checkpoint)?;
                    return Err(e);
                }
            }
        };

        if !peer_urls.is_empty() {
            let acks = self.push_snapshot(&peer_urls, &snapshot).await;
            if acks < required {
                tracing::warn!(
                    "replication target not met ({}/{} acks), rolling back",
                    acks,
                    required
                );
                self.state
                    .lock()
                    .expect("state lock")
                    .restore(&checkpoint)?;
                return Err(Error::ReplicationUnmet { acks, required });
            }
        }

        Ok(value)
    }

    /// POST the snapshot to every peer in parallel; 2xx counts as an ack
    async fn push_snapshot(&self, peer_urls: &[String], snapshot: &Snapshot) -> usize {
        let body = match serde_json::to_value(snapshot) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("failed to serialize snapshot: {}", e);
                return 0;
            }
        };

        let mut handles = Vec::with_capacity(peer_urls.len());
        for peer in peer_urls {
            let client = self.client.clone();
            let token = self.auth_token.clone();
            let url = format!("{}/v1/replicate/snapshot", peer);
            let body = body.clone();
            handles.push(tokio::spawn(async move {
                let mut request = client.post(&url).json(&body);
                if let Some(token) = token {
                    request = request.header("x-skyclaw-token", token);
                }
                match request.send().await {
                    Ok(resp) if resp.status().is_success() => true,
                    Ok(resp) => {
                        tracing::debug!("peer {} rejected snapshot: {}", url, resp.status());
                        false
                    }
                    Err(e) => {
                        tracing::debug!("peer {} unreachable: {}", url, e);
                        false
                    }
                }
            }));
        }

        let mut acks = 0;
        for handle in handles {
            if handle.await.unwrap_or(false) {
                acks += 1;
            }
        }
        acks
    }
}
