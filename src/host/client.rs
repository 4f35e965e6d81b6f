//! HTTP client for the coordinator cluster with round-robin failover
//!
//! Every call walks the coordinator list starting from the last node that
//! answered, so a dead coordinator costs one timeout and then stays skipped
//! until the cursor wraps back around.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::common::{Error, Result};
use crate::coordinator::model::{Host, Job, Service};
use crate::coordinator::state::{JobCompletion, ServiceReport};

pub struct CoordinatorClient {
    client: reqwest::Client,
    coordinators: Vec<String>,
    auth_token: Option<String>,
    last_good: AtomicUsize,
}

#[derive(Deserialize)]
struct HostEnvelope {
    host: Host,
}

#[derive(Deserialize)]
struct JobEnvelope {
    job: Option<Job>,
}

#[derive(Deserialize)]
struct ServiceEnvelope {
    service: Option<Service>,
}

impl CoordinatorClient {
    pub fn new(coordinators: Vec<String>, auth_token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            coordinators: coordinators
                .into_iter()
                .map(|c| c.trim_end_matches('/').to_string())
                .collect(),
            auth_token,
            last_good: AtomicUsize::new(0),
        }
    }

    /// POST `body` to `path` on the first coordinator that answers
    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        if self.coordinators.is_empty() {
            return Err(Error::InvalidConfig("no coordinators configured".into()));
        }
        let start = self.last_good.load(Ordering::Relaxed);
        let mut last_error = None;
        for offset in 0..self.coordinators.len() {
            let index = (start + offset) % self.coordinators.len();
            let url = format!("{}{}", self.coordinators[index], path);
            let mut request = self.client.post(&url).json(body);
            if let Some(token) = &self.auth_token {
                request = request.header("x-skyclaw-token", token);
            }
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    self.last_good.store(index, Ordering::Relaxed);
                    return resp
                        .json::<T>()
                        .await
                        .map_err(|e| Error::Http(format!("bad response from {}: {}", url, e)));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let detail = resp.text().await.unwrap_or_default();
                    // a definite application-level answer; do not retry elsewhere
                    return Err(Error::Http(format!("{} from {}: {}", status, url, detail)));
                }
                Err(e) => {
                    tracing::debug!("coordinator {} unreachable: {}", url, e);
                    last_error = Some(e);
                }
            }
        }
        Err(Error::Http(format!(
            "no coordinator reachable: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    pub async fn register(
        &self,
        host_id: Option<&str>,
        name: &str,
        capabilities: &[String],
        max_parallel: u32,
    ) -> Result<Host> {
        let body = serde_json::json!({
            "hostId": host_id,
            "name": name,
            "capabilities": capabilities,
            "maxParallel": max_parallel,
        });
        let envelope: HostEnvelope = self.post("/v1/hosts/register", &body).await?;
        Ok(envelope.host)
    }

    pub async fn heartbeat(&self, host_id: &str, active_leases: u32) -> Result<Host> {
        let body = serde_json::json!({ "activeLeases": active_leases });
        let envelope: HostEnvelope = self
            .post(&format!("/v1/hosts/{}/heartbeat", host_id), &body)
            .await?;
        Ok(envelope.host)
    }

    pub async fn claim_job(&self, host_id: &str) -> Result<Option<Job>> {
        let envelope: JobEnvelope = self
            .post(&format!("/v1/hosts/{}/claim", host_id), &serde_json::json!({}))
            .await?;
        Ok(envelope.job)
    }

    pub async fn complete_job(&self, job_id: &str, completion: &JobCompletion) -> Result<Job> {
        let body = serde_json::to_value(completion)?;
        let envelope: JobEnvelope = self
            .post(&format!("/v1/jobs/{}/complete", job_id), &body)
            .await?;
        envelope
            .job
            .ok_or_else(|| Error::Http("complete returned no job".into()))
    }

    pub async fn claim_service(&self, host_id: &str) -> Result<Option<Service>> {
        let envelope: ServiceEnvelope = self
            .post(
                &format!("/v1/hosts/{}/services/claim", host_id),
                &serde_json::json!({}),
            )
            .await?;
        Ok(envelope.service)
    }

    pub async fn report_service(&self, service_id: &str, report: &ServiceReport) -> Result<Service> {
        let body = serde_json::to_value(report)?;
        let envelope: ServiceEnvelope = self
            .post(&format!("/v1/services/{}/report", service_id), &body)
            .await?;
        envelope
            .service
            .ok_or_else(|| Error::Http("report returned no service".into()))
    }
}
