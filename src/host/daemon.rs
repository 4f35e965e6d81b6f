//! Host daemon loops: register, heartbeat, claim, execute, report

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};

use crate::common::{HostConfig, Result};
use crate::coordinator::model::{AssignmentStatus, Service};
use crate::coordinator::state::{JobCompletion, ServiceReport};
use crate::host::client::CoordinatorClient;
use crate::host::executor::{self, ExecutionOutcome};

pub struct HostDaemon {
    config: HostConfig,
}

impl HostDaemon {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        let config = Arc::new(self.config);
        let client = Arc::new(CoordinatorClient::new(
            config.coordinators.clone(),
            config.auth_token.clone(),
        ));

        tracing::info!("Starting host daemon: {}", config.name);
        tracing::info!("  Coordinators: {}", config.coordinators.join(", "));
        tracing::info!("  Capabilities: {}", config.capabilities.join(", "));
        tracing::info!("  Max parallel: {}", config.max_parallel);

        let poll = Duration::from_secs(config.poll_interval_secs.max(1));
        let host = loop {
            match client
                .register(
                    config.host_id.as_deref(),
                    &config.name,
                    &config.capabilities,
                    config.max_parallel,
                )
                .await
            {
                Ok(host) => break host,
                Err(e) => {
                    tracing::warn!("registration failed, retrying: {}", e);
                    tokio::time::sleep(poll).await;
                }
            }
        };
        let host_id = host.id.clone();
        tracing::info!("✓ Registered as {}", host_id);

        let active = Arc::new(AtomicU32::new(0));

        // heartbeat loop
        {
            let client = client.clone();
            let host_id = host_id.clone();
            let active = active.clone();
            let interval = Duration::from_secs(config.heartbeat_interval_secs.max(1));
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if let Err(e) = client
                        .heartbeat(&host_id, active.load(Ordering::Relaxed))
                        .await
                    {
                        tracing::warn!("heartbeat failed: {}", e);
                    }
                }
            });
        }

        // service manager loop
        {
            let client = client.clone();
            let config = config.clone();
            let host_id = host_id.clone();
            tokio::spawn(async move {
                service_loop(client, config, host_id).await;
            });
        }

        // claim loop
        loop {
            tokio::time::sleep(poll).await;
            if active.load(Ordering::Relaxed) >= config.max_parallel {
                continue;
            }
            let job = match client.claim_job(&host_id).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("claim failed: {}", e);
                    continue;
                }
            };

            tracing::info!("claimed job {} (attempt {})", job.id, job.attempts);
            active.fetch_add(1, Ordering::Relaxed);
            let client = client.clone();
            let config = config.clone();
            let host_id = host_id.clone();
            let active = active.clone();
            tokio::spawn(async move {
                let outcome = executor::execute(&job.payload, &config).await;
                report_completion(&client, &job.id, &host_id, outcome).await;
                active.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

async fn report_completion(
    client: &CoordinatorClient,
    job_id: &str,
    host_id: &str,
    outcome: ExecutionOutcome,
) {
    let completion = JobCompletion {
        host_id: host_id.to_string(),
        success: outcome.success,
        duration_ms: outcome.duration_ms,
        exit_code: outcome.exit_code,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        error: outcome.error,
    };
    match client.complete_job(job_id, &completion).await {
        Ok(job) => tracing::info!("job {} finished: {}", job.id, job.status),
        // a lost lease shows up here; the job was requeued elsewhere
        Err(e) => tracing::warn!("completion of {} rejected: {}", job_id, e),
    }
}

/// Claim service slots, keep their processes alive, report state changes
async fn service_loop(client: Arc<CoordinatorClient>, config: Arc<HostConfig>, host_id: String) {
    let poll = Duration::from_secs(config.poll_interval_secs.max(1));
    let mut running: HashMap<String, Child> = HashMap::new();
    let mut next_port = config.service_port_base;

    loop {
        tokio::time::sleep(poll).await;

        // reap exited service processes
        let mut exited = Vec::new();
        for (service_id, child) in running.iter_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                exited.push((service_id.clone(), status));
            }
        }
        for (service_id, status) in exited {
            running.remove(&service_id);
            tracing::warn!("service {} exited: {}", service_id, status);
            let report = ServiceReport {
                host_id: host_id.clone(),
                status: AssignmentStatus::Failed,
                endpoint: None,
                error: Some(format!("process exited: {}", status)),
            };
            if let Err(e) = client.report_service(&service_id, &report).await {
                tracing::warn!("failed to report exit of {}: {}", service_id, e);
            }
        }

        let service = match client.claim_service(&host_id).await {
            Ok(Some(service)) => service,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("service claim failed: {}", e);
                continue;
            }
        };
        if running.contains_key(&service.id) {
            continue;
        }
        let ours = service
            .assignments
            .iter()
            .find(|a| a.host_id == host_id)
            .map(|a| a.status);
        if ours == Some(AssignmentStatus::Failed) || ours.is_none() {
            continue;
        }

        let port = next_port;
        next_port = next_port.wrapping_add(1).max(config.service_port_base);
        match spawn_service(&service, port) {
            Ok(child) => {
                let endpoint = format!("http://{}:{}", config.advertise_host, port);
                tracing::info!("service {} started at {}", service.name, endpoint);
                running.insert(service.id.clone(), child);
                let report = ServiceReport {
                    host_id: host_id.clone(),
                    status: AssignmentStatus::Running,
                    endpoint: Some(endpoint),
                    error: None,
                };
                if let Err(e) = client.report_service(&service.id, &report).await {
                    tracing::warn!("failed to report start of {}: {}", service.id, e);
                }
            }
            Err(e) => {
                tracing::warn!("service {} failed to start: {}", service.name, e);
                let report = ServiceReport {
                    host_id: host_id.clone(),
                    status: AssignmentStatus::Failed,
                    endpoint: None,
                    error: Some(e.to_string()),
                };
                if let Err(e) = client.report_service(&service.id, &report).await {
                    tracing::warn!("failed to report failure of {}: {}", service.id, e);
                }
            }
        }
    }
}

fn spawn_service(service: &Service, port: u16) -> Result<Child> {
    let mut command = Command::new(&service.command);
    command
        .args(&service.args)
        .envs(&service.env)
        .env("PORT", port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if let Some(cwd) = &service.cwd {
        command.current_dir(cwd);
    }
    Ok(command.spawn()?)
}
