//! Authoritative coordinator state: queue + registry with lease bookkeeping
//!
//! All operations are strictly synchronous: the in-memory mutation, the lease
//! accounting, the version bump and the durable write complete before the
//! call returns. Callers serialize access through a single mutex, so a
//! [CoordinatorState::checkpoint] taken before a mutation is an exact
//! pre-image for rollback.
//!
//! Versioning: one monotonic counter feeds every entity create/update. The
//! counter survives restarts (`max(persisted)+1`) and ratchets forward on
//! snapshot merge, which keeps the last-writer-wins merge order total across
//! peers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::common::utils::{
    capabilities_satisfied, mint_id, normalize_capabilities, normalize_endpoint, now,
};
use crate::common::{Error, Result};
use crate::coordinator::model::{
    should_adopt, AssignmentStatus, Host, IdempotencyRecord, Job, JobPayload, JobRequirement,
    JobResult, JobStatus, Service, ServiceAssignment, ServiceStatus, Snapshot,
};
use crate::coordinator::store::Store;

/// Completion report for a leased job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompletion {
    pub host_id: String,
    pub success: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Status report for a service assignment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReport {
    pub host_id: String,
    pub status: AssignmentStatus,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Fields accepted when deploying a service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub replicas: Option<u32>,
    #[serde(default)]
    pub required_capabilities: Option<Vec<String>>,
}

/// In-memory authoritative state plus its durable mirror
pub struct CoordinatorState {
    node_id: String,
    lease_ms: u64,
    next_version: u64,
    hosts: HashMap<String, Host>,
    jobs: HashMap<String, Job>,
    services: HashMap<String, Service>,
    store: Store,
}

impl CoordinatorState {
    /// Open the durable store and recover queue state from it
    pub fn open(node_id: String, lease_ms: u64, store: Store) -> Result<Self> {
        let (hosts, jobs, services) = store.load_all()?;
        let max_version = hosts
            .iter()
            .map(|h| h.version)
            .chain(jobs.iter().map(|j| j.version))
            .chain(services.iter().map(|s| s.version))
            .max()
            .unwrap_or(0);
        Ok(Self {
            node_id,
            lease_ms,
            next_version: max_version + 1,
            hosts: hosts.into_iter().map(|h| (h.id.clone(), h)).collect(),
            jobs: jobs.into_iter().map(|j| (j.id.clone(), j)).collect(),
            services: services.into_iter().map(|s| (s.id.clone(), s)).collect(),
            store,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn bump_version(&mut self) -> u64 {
        let version = self.next_version;
        self.next_version += 1;
        version
    }

    // === Hosts ===

    /// Register a host, idempotent on id. An existing host keeps its
    /// `registered_at` and `active_leases`; identity fields are refreshed.
    pub fn register_host(
        &mut self,
        host_id: Option<String>,
        name: String,
        capabilities: Vec<String>,
        max_parallel: u32,
    ) -> Result<Host> {
        let ts = now();
        let capabilities = normalize_capabilities(&capabilities);
        let max_parallel = max_parallel.max(1);
        let id = match host_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => mint_id("host"),
        };
        let version = self.bump_version();
        let host = match self.hosts.get(&id) {
            Some(existing) => Host {
                id: id.clone(),
                name,
                capabilities,
                max_parallel,
                active_leases: existing.active_leases,
                registered_at: existing.registered_at,
                last_seen_at: ts,
                version,
                updated_by: self.node_id.clone(),
                extra: existing.extra.clone(),
            },
            None => Host {
                id: id.clone(),
                name,
                capabilities,
                max_parallel,
                active_leases: 0,
                registered_at: ts,
                last_seen_at: ts,
                version,
                updated_by: self.node_id.clone(),
                extra: serde_json::Map::new(),
            },
        };
        self.store.upsert_host(&host)?;
        self.hosts.insert(id, host.clone());
        Ok(host)
    }

    /// Record a heartbeat; overwrites `active_leases` only when supplied
    pub fn heartbeat(&mut self, host_id: &str, active_leases: Option<u32>) -> Result<Host> {
        let version = self.bump_version();
        let node_id = self.node_id.clone();
        let host = self
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| Error::state(format!("unknown host: {}", host_id)))?;
        host.last_seen_at = now();
        if let Some(count) = active_leases {
            host.active_leases = count;
        }
        host.version = version;
        host.updated_by = node_id;
        let host = host.clone();
        self.store.upsert_host(&host)?;
        Ok(host)
    }

    // === Jobs ===

    pub fn enqueue_job(
        &mut self,
        payload: JobPayload,
        requirement: Option<JobRequirement>,
        submitted_by: Option<String>,
    ) -> Result<Job> {
        let ts = now();
        let requirement = JobRequirement {
            required_capabilities: normalize_capabilities(
                &requirement.unwrap_or_default().required_capabilities,
            ),
        };
        let submitted_by = submitted_by
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let job = Job {
            id: mint_id("job"),
            created_at: ts,
            status: JobStatus::Queued,
            attempts: 0,
            assigned_host_id: None,
            lease_expires_at: None,
            payload,
            requirement,
            submitted_by,
            result: None,
            error: None,
            updated_at: ts,
            version: self.bump_version(),
            updated_by: self.node_id.clone(),
            extra: serde_json::Map::new(),
        };
        self.store.upsert_job(&job)?;
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    pub fn get_job(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    /// Lease the oldest queued job whose requirements this host satisfies.
    /// Returns `None` when the host is at capacity or nothing matches.
    pub fn claim_job(&mut self, host_id: &str) -> Result<Option<Job>> {
        self.requeue_expired_leases()?;

        let host = self
            .hosts
            .get(host_id)
            .ok_or_else(|| Error::state(format!("unknown host: {}", host_id)))?;
        if host.active_leases >= host.max_parallel {
            return Ok(None);
        }
        let capabilities = host.capabilities.clone();

        let mut candidates: Vec<(&DateTime<Utc>, &String)> = self
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Queued
                    && capabilities_satisfied(&j.requirement.required_capabilities, &capabilities)
            })
            .map(|j| (&j.created_at, &j.id))
            .collect();
        candidates.sort();
        let job_id = match candidates.first() {
            Some((_, id)) => (*id).clone(),
            None => return Ok(None),
        };

        let ts = now();
        let job_version = self.bump_version();
        let host_version = self.bump_version();
        let node_id = self.node_id.clone();

        let job = self.jobs.get_mut(&job_id).expect("candidate job exists");
        job.status = JobStatus::Leased;
        job.assigned_host_id = Some(host_id.to_string());
        job.attempts += 1;
        job.lease_expires_at = Some(ts + Duration::milliseconds(self.lease_ms as i64));
        job.updated_at = ts;
        job.version = job_version;
        job.updated_by = node_id.clone();
        let job = job.clone();

        let host = self.hosts.get_mut(host_id).expect("host checked above");
        host.active_leases += 1;
        host.last_seen_at = ts;
        host.version = host_version;
        host.updated_by = node_id;
        let host = host.clone();

        self.store.upsert_job(&job)?;
        self.store.upsert_host(&host)?;
        Ok(Some(job))
    }

    /// Finish a leased job. Only the currently assigned host may complete.
    pub fn complete_job(&mut self, job_id: &str, completion: JobCompletion) -> Result<Job> {
        if !self.hosts.contains_key(&completion.host_id) {
            return Err(Error::state(format!("unknown host: {}", completion.host_id)));
        }
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| Error::state(format!("unknown job: {}", job_id)))?;
        match &job.assigned_host_id {
            Some(assigned) if *assigned == completion.host_id => {}
            Some(assigned) => {
                return Err(Error::state(format!(
                    "job {} is assigned to {}",
                    job_id, assigned
                )))
            }
            None => return Err(Error::state(format!("job {} is not assigned", job_id))),
        }
        if job.status != JobStatus::Leased {
            return Err(Error::state(format!(
                "job {} is not leased (status: {})",
                job_id, job.status
            )));
        }

        let ts = now();
        let job_version = self.bump_version();
        let host_version = self.bump_version();
        let node_id = self.node_id.clone();

        let job = self.jobs.get_mut(job_id).expect("job checked above");
        job.status = if completion.success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        job.result = Some(JobResult {
            finished_at: ts,
            duration_ms: completion.duration_ms,
            exit_code: completion.exit_code,
            stdout: completion.stdout,
            stderr: completion.stderr,
        });
        job.error = completion.error;
        job.lease_expires_at = None;
        job.updated_at = ts;
        job.version = job_version;
        job.updated_by = node_id.clone();
        let job = job.clone();

        let host = self
            .hosts
            .get_mut(&completion.host_id)
            .expect("host checked above");
        host.active_leases = host.active_leases.saturating_sub(1);
        host.last_seen_at = ts;
        host.version = host_version;
        host.updated_by = node_id;
        let host = host.clone();

        self.store.upsert_job(&job)?;
        self.store.upsert_host(&host)?;
        Ok(job)
    }

    /// Return expired leases to the queue; attempts are preserved and the
    /// previously assigned host gets its lease count back.
    pub fn requeue_expired_leases(&mut self) -> Result<usize> {
        let ts = now();
        let expired: Vec<String> = self
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Leased
                    && j.lease_expires_at.map(|at| at <= ts).unwrap_or(false)
            })
            .map(|j| j.id.clone())
            .collect();

        for job_id in &expired {
            let job_version = self.bump_version();
            let node_id = self.node_id.clone();
            let job = self.jobs.get_mut(job_id).expect("expired job exists");
            let previous_host = job.assigned_host_id.take();
            job.status = JobStatus::Queued;
            job.lease_expires_at = None;
            job.updated_at = ts;
            job.version = job_version;
            job.updated_by = node_id.clone();
            let job = job.clone();
            self.store.upsert_job(&job)?;

            if let Some(host_id) = previous_host {
                if self.hosts.contains_key(&host_id) {
                    let host_version = self.bump_version();
                    let host = self.hosts.get_mut(&host_id).expect("host checked above");
                    host.active_leases = host.active_leases.saturating_sub(1);
                    host.version = host_version;
                    host.updated_by = node_id;
                    let host = host.clone();
                    self.store.upsert_host(&host)?;
                }
            }
        }
        Ok(expired.len())
    }

    // === Services ===

    pub fn deploy_service(&mut self, spec: ServiceSpec) -> Result<Service> {
        let ts = now();
        let required_capabilities = match spec.required_capabilities {
            Some(caps) => normalize_capabilities(&caps),
            None => vec!["service-host".to_string()],
        };
        let service = Service {
            id: mint_id("svc"),
            name: spec.name,
            command: spec.command,
            args: spec.args,
            cwd: spec.cwd,
            env: spec.env,
            replicas: spec.replicas.unwrap_or(1).max(1),
            required_capabilities,
            status: ServiceStatus::Pending,
            assignments: vec![],
            created_at: ts,
            updated_at: ts,
            version: self.bump_version(),
            updated_by: self.node_id.clone(),
            extra: serde_json::Map::new(),
        };
        self.store.upsert_service(&service)?;
        self.services.insert(service.id.clone(), service.clone());
        Ok(service)
    }

    pub fn list_services(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self.services.values().cloned().collect();
        services.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        services
    }

    pub fn get_service(&self, service_id: &str) -> Option<&Service> {
        self.services.get(service_id)
    }

    /// Offer the host a service slot. A host with a live assignment gets the
    /// same service back; a service with spare replica capacity gets a fresh
    /// pending assignment. A failed prior assignment skips the service.
    pub fn claim_service(&mut self, host_id: &str) -> Result<Option<Service>> {
        let host = self
            .hosts
            .get(host_id)
            .ok_or_else(|| Error::state(format!("unknown host: {}", host_id)))?;
        let capabilities = host.capabilities.clone();

        let ordered: Vec<String> = self.list_services().into_iter().map(|s| s.id).collect();
        for service_id in ordered {
            let service = self.services.get(&service_id).expect("listed service exists");
            if !capabilities_satisfied(&service.required_capabilities, &capabilities) {
                continue;
            }
            if let Some(existing) = service.assignments.iter().find(|a| a.host_id == host_id) {
                if existing.status == AssignmentStatus::Failed {
                    continue;
                }
                return Ok(Some(service.clone()));
            }
            if service.assignments.len() >= service.replicas as usize {
                continue;
            }

            let ts = now();
            let version = self.bump_version();
            let node_id = self.node_id.clone();
            let service = self
                .services
                .get_mut(&service_id)
                .expect("listed service exists");
            service.assignments.push(ServiceAssignment {
                host_id: host_id.to_string(),
                status: AssignmentStatus::Pending,
                endpoint: None,
                error: None,
                started_at: None,
                updated_at: ts,
            });
            service.status = service.derive_status();
            service.updated_at = ts;
            service.version = version;
            service.updated_by = node_id;
            let service = service.clone();
            self.store.upsert_service(&service)?;
            return Ok(Some(service));
        }
        Ok(None)
    }

    /// Apply a host's status report for its assignment
    pub fn report_service(&mut self, service_id: &str, report: ServiceReport) -> Result<Service> {
        let ts = now();
        let version = self.bump_version();
        let node_id = self.node_id.clone();
        let service = self
            .services
            .get_mut(service_id)
            .ok_or_else(|| Error::state(format!("unknown service: {}", service_id)))?;
        let assignment = service
            .assignments
            .iter_mut()
            .find(|a| a.host_id == report.host_id)
            .ok_or_else(|| {
                Error::state(format!(
                    "service {} has no assignment for host {}",
                    service_id, report.host_id
                ))
            })?;

        if report.status == AssignmentStatus::Running && assignment.started_at.is_none() {
            assignment.started_at = Some(ts);
        }
        assignment.status = report.status;
        assignment.endpoint = report.endpoint.map(|e| normalize_endpoint(&e));
        assignment.error = report.error;
        assignment.updated_at = ts;

        service.status = service.derive_status();
        service.updated_at = ts;
        service.version = version;
        service.updated_by = node_id;
        let service = service.clone();
        self.store.upsert_service(&service)?;
        Ok(service)
    }

    // === Snapshots ===

    /// Observable state, expired leases requeued first
    pub fn snapshot(&mut self) -> Result<Snapshot> {
        self.requeue_expired_leases()?;
        Ok(self.checkpoint())
    }

    /// Deep copy of state with no side effects, for rollback
    pub fn checkpoint(&self) -> Snapshot {
        let mut hosts: Vec<Host> = self.hosts.values().cloned().collect();
        hosts.sort_by(|a, b| a.id.cmp(&b.id));
        let mut jobs: Vec<Job> = self.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        let mut services: Vec<Service> = self.services.values().cloned().collect();
        services.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Snapshot {
            node_id: self.node_id.clone(),
            hosts,
            jobs,
            services,
        }
    }

    /// Replace all state (memory and durable mirror) with the snapshot
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.store
            .replace_all(&snapshot.hosts, &snapshot.jobs, &snapshot.services)?;
        self.hosts = snapshot
            .hosts
            .iter()
            .map(|h| (h.id.clone(), h.clone()))
            .collect();
        self.jobs = snapshot
            .jobs
            .iter()
            .map(|j| (j.id.clone(), j.clone()))
            .collect();
        self.services = snapshot
            .services
            .iter()
            .map(|s| (s.id.clone(), s.clone()))
            .collect();
        let max_version = self
            .hosts
            .values()
            .map(|h| h.version)
            .chain(self.jobs.values().map(|j| j.version))
            .chain(self.services.values().map(|s| s.version))
            .max()
            .unwrap_or(0);
        self.next_version = max_version + 1;
        Ok(())
    }

    /// Adopt every entity the last-writer-wins order prefers; returns whether
    /// anything changed. Idempotent: re-merging the same snapshot is a no-op.
    pub fn merge_snapshot(&mut self, snapshot: &Snapshot) -> Result<bool> {
        let mut changed = false;
        let mut max_adopted = 0u64;

        for incoming in &snapshot.hosts {
            let adopt = match self.hosts.get(&incoming.id) {
                Some(local) => should_adopt(local.merge_key(), incoming.merge_key()),
                None => true,
            };
            if adopt {
                self.store.upsert_host(incoming)?;
                self.hosts.insert(incoming.id.clone(), incoming.clone());
                max_adopted = max_adopted.max(incoming.version);
                changed = true;
            }
        }
        for incoming in &snapshot.jobs {
            let adopt = match self.jobs.get(&incoming.id) {
                Some(local) => should_adopt(local.merge_key(), incoming.merge_key()),
                None => true,
            };
            if adopt {
                self.store.upsert_job(incoming)?;
                self.jobs.insert(incoming.id.clone(), incoming.clone());
                max_adopted = max_adopted.max(incoming.version);
                changed = true;
            }
        }
        for incoming in &snapshot.services {
            let adopt = match self.services.get(&incoming.id) {
                Some(local) => should_adopt(local.merge_key(), incoming.merge_key()),
                None => true,
            };
            if adopt {
                self.store.upsert_service(incoming)?;
                self.services.insert(incoming.id.clone(), incoming.clone());
                max_adopted = max_adopted.max(incoming.version);
                changed = true;
            }
        }

        if max_adopted >= self.next_version {
            self.next_version = max_adopted + 1;
        }
        Ok(changed)
    }

    // === Idempotency ledger passthrough ===

    pub fn get_idempotency(&self, route: &str, key: &str) -> Result<Option<IdempotencyRecord>> {
        self.store.get_idempotency(route, key)
    }

    pub fn save_idempotency(
        &self,
        route: &str,
        key: &str,
        request_hash: &str,
        status_code: u16,
        response_json: String,
        ttl_ms: u64,
    ) -> Result<()> {
        let created_at = now();
        self.store.put_idempotency(&IdempotencyRecord {
            route: route.to_string(),
            key: key.to_string(),
            request_hash: request_hash.to_string(),
            status_code,
            response_json,
            created_at,
            expires_at: created_at + Duration::milliseconds(ttl_ms as i64),
        })
    }

    pub fn gc_idempotency(&self) -> Result<usize> {
        self.store.delete_expired_idempotency(now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_state(lease_ms: u64) -> (tempfile::TempDir, CoordinatorState) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("state.db")).unwrap();
        let state = CoordinatorState::open("node-a".into(), lease_ms, store).unwrap();
        (dir, state)
    }

    fn openclaw_payload() -> JobPayload {
        JobPayload::OpenclawRun {
            args: vec!["run".into()],
            openclaw_dir: None,
            env: Default::default(),
            timeout_ms: None,
        }
    }

    fn shell_payload(command: &str) -> JobPayload {
        JobPayload::Shell {
            command: command.into(),
            args: vec![],
            cwd: None,
            env: Default::default(),
            timeout_ms: None,
        }
    }

    fn requirement(caps: &[&str]) -> Option<JobRequirement> {
        Some(JobRequirement {
            required_capabilities: caps.iter().map(|c| c.to_string()).collect(),
        })
    }

    #[test]
    fn test_register_and_claim() {
        let (_dir, mut state) = open_state(60_000);
        let host = state
            .register_host(
                None,
                "openclaw-a".into(),
                vec!["shell".into(), "openclaw".into()],
                2,
            )
            .unwrap();
        assert!(host.id.starts_with("host_"));

        state
            .enqueue_job(openclaw_payload(), requirement(&["openclaw"]), None)
            .unwrap();

        let claimed = state.claim_job(&host.id).unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Leased);
        assert_eq!(claimed.assigned_host_id.as_deref(), Some(host.id.as_str()));
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.lease_expires_at.unwrap() > claimed.created_at);
    }

    #[test]
    fn test_register_is_idempotent_on_id() {
        let (_dir, mut state) = open_state(60_000);
        let first = state
            .register_host(Some("h1".into()), "a".into(), vec!["shell".into()], 1)
            .unwrap();
        state
            .enqueue_job(shell_payload("true"), requirement(&["shell"]), None)
            .unwrap();
        state.claim_job("h1").unwrap().unwrap();

        let again = state
            .register_host(Some("h1".into()), "a-renamed".into(), vec![], 4)
            .unwrap();
        assert_eq!(again.registered_at, first.registered_at);
        assert_eq!(again.active_leases, 1);
        assert_eq!(again.name, "a-renamed");
        assert!(again.version > first.version);
    }

    #[test]
    fn test_claim_respects_capabilities_and_order() {
        let (_dir, mut state) = open_state(60_000);
        let host = state
            .register_host(Some("h1".into()), "h".into(), vec!["shell".into()], 4)
            .unwrap();
        let gpu_job = state
            .enqueue_job(shell_payload("train"), requirement(&["gpu"]), None)
            .unwrap();
        let first_shell = state
            .enqueue_job(shell_payload("one"), requirement(&["shell"]), None)
            .unwrap();
        let _second_shell = state
            .enqueue_job(shell_payload("two"), requirement(&["shell"]), None)
            .unwrap();

        // oldest matching job wins; the gpu job is skipped
        let claimed = state.claim_job(&host.id).unwrap().unwrap();
        assert_eq!(claimed.id, first_shell.id);
        assert_eq!(state.get_job(&gpu_job.id).unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn test_claim_honors_max_parallel() {
        let (_dir, mut state) = open_state(60_000);
        let host = state
            .register_host(Some("h1".into()), "h".into(), vec!["shell".into()], 1)
            .unwrap();
        state
            .enqueue_job(shell_payload("one"), requirement(&["shell"]), None)
            .unwrap();
        state
            .enqueue_job(shell_payload("two"), requirement(&["shell"]), None)
            .unwrap();

        assert!(state.claim_job(&host.id).unwrap().is_some());
        assert!(state.claim_job(&host.id).unwrap().is_none());
    }

    #[test]
    fn test_claim_unknown_host_is_an_error() {
        let (_dir, mut state) = open_state(60_000);
        assert!(state.claim_job("nope").is_err());
    }

    #[test]
    fn test_lease_expiry_requeues_and_reclaims() {
        let (_dir, mut state) = open_state(10);
        let host = state
            .register_host(Some("h1".into()), "h".into(), vec!["shell".into()], 1)
            .unwrap();
        let job = state
            .enqueue_job(shell_payload("sleepy"), requirement(&["shell"]), None)
            .unwrap();

        let claimed = state.claim_job(&host.id).unwrap().unwrap();
        assert_eq!(claimed.id, job.id);

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(state.requeue_expired_leases().unwrap(), 1);
        let requeued = state.get_job(&job.id).unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert!(requeued.assigned_host_id.is_none());
        assert!(requeued.lease_expires_at.is_none());

        let reclaimed = state.claim_job(&host.id).unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.attempts, 2);
    }

    #[test]
    fn test_unexpired_lease_is_not_requeued() {
        let (_dir, mut state) = open_state(60_000);
        let host = state
            .register_host(Some("h1".into()), "h".into(), vec!["shell".into()], 1)
            .unwrap();
        state
            .enqueue_job(shell_payload("busy"), requirement(&["shell"]), None)
            .unwrap();
        state.claim_job(&host.id).unwrap().unwrap();
        assert_eq!(state.requeue_expired_leases().unwrap(), 0);
    }

    #[test]
    fn test_complete_job() {
        let (_dir, mut state) = open_state(60_000);
        let host = state
            .register_host(Some("h1".into()), "h".into(), vec!["shell".into()], 1)
            .unwrap();
        let job = state
            .enqueue_job(shell_payload("ok"), requirement(&["shell"]), None)
            .unwrap();
        state.claim_job(&host.id).unwrap().unwrap();

        let done = state
            .complete_job(
                &job.id,
                JobCompletion {
                    host_id: host.id.clone(),
                    success: true,
                    duration_ms: 42,
                    exit_code: Some(0),
                    stdout: "ok\n".into(),
                    stderr: "".into(),
                    error: None,
                },
            )
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result.as_ref().unwrap().stdout, "ok\n");
        assert!(done.lease_expires_at.is_none());
        assert_eq!(state.hosts.get(&host.id).unwrap().active_leases, 0);
    }

    #[test]
    fn test_complete_rejects_wrong_host_and_bad_transition() {
        let (_dir, mut state) = open_state(60_000);
        let owner = state
            .register_host(Some("h1".into()), "h".into(), vec!["shell".into()], 1)
            .unwrap();
        let thief = state
            .register_host(Some("h2".into()), "h".into(), vec!["shell".into()], 1)
            .unwrap();
        let job = state
            .enqueue_job(shell_payload("x"), requirement(&["shell"]), None)
            .unwrap();
        state.claim_job(&owner.id).unwrap().unwrap();

        let completion = |host_id: &str| JobCompletion {
            host_id: host_id.into(),
            success: false,
            duration_ms: 1,
            exit_code: Some(1),
            stdout: String::new(),
            stderr: String::new(),
            error: None,
        };
        assert!(state.complete_job(&job.id, completion(&thief.id)).is_err());
        state.complete_job(&job.id, completion(&owner.id)).unwrap();
        // already finished: no longer leased
        assert!(state.complete_job(&job.id, completion(&owner.id)).is_err());
    }

    #[test]
    fn test_heartbeat_updates_leases_only_when_given() {
        let (_dir, mut state) = open_state(60_000);
        let host = state
            .register_host(Some("h1".into()), "h".into(), vec![], 1)
            .unwrap();
        let after = state.heartbeat(&host.id, Some(3)).unwrap();
        assert_eq!(after.active_leases, 3);
        let after = state.heartbeat(&host.id, None).unwrap();
        assert_eq!(after.active_leases, 3);
        assert!(state.heartbeat("nope", None).is_err());
    }

    #[test]
    fn test_service_deploy_claim_report() {
        let (_dir, mut state) = open_state(60_000);
        let host = state
            .register_host(Some("h1".into()), "h".into(), vec!["service-host".into()], 1)
            .unwrap();
        let service = state
            .deploy_service(ServiceSpec {
                name: "api".into(),
                command: "serve".into(),
                args: vec!["--port".into(), "9000".into()],
                cwd: None,
                env: Default::default(),
                replicas: Some(1),
                required_capabilities: None,
            })
            .unwrap();
        assert_eq!(service.status, ServiceStatus::Pending);
        assert_eq!(service.required_capabilities, vec!["service-host"]);

        let claimed = state.claim_service(&host.id).unwrap().unwrap();
        assert_eq!(claimed.id, service.id);
        assert_eq!(claimed.assignments.len(), 1);
        assert_eq!(claimed.assignments[0].status, AssignmentStatus::Pending);

        // claiming again returns the same service without a second slot
        let again = state.claim_service(&host.id).unwrap().unwrap();
        assert_eq!(again.assignments.len(), 1);

        let reported = state
            .report_service(
                &service.id,
                ServiceReport {
                    host_id: host.id.clone(),
                    status: AssignmentStatus::Running,
                    endpoint: Some("http://10.0.0.9:9000/".into()),
                    error: None,
                },
            )
            .unwrap();
        assert_eq!(reported.status, ServiceStatus::Running);
        assert_eq!(
            reported.assignments[0].endpoint.as_deref(),
            Some("http://10.0.0.9:9000")
        );
        assert!(reported.assignments[0].started_at.is_some());
    }

    #[test]
    fn test_service_full_and_failed_assignment_skips() {
        let (_dir, mut state) = open_state(60_000);
        let a = state
            .register_host(Some("h1".into()), "a".into(), vec!["service-host".into()], 1)
            .unwrap();
        let b = state
            .register_host(Some("h2".into()), "b".into(), vec!["service-host".into()], 1)
            .unwrap();
        let service = state
            .deploy_service(ServiceSpec {
                name: "api".into(),
                command: "serve".into(),
                args: vec![],
                cwd: None,
                env: Default::default(),
                replicas: Some(1),
                required_capabilities: None,
            })
            .unwrap();

        state.claim_service(&a.id).unwrap().unwrap();
        // replica capacity exhausted
        assert!(state.claim_service(&b.id).unwrap().is_none());

        state
            .report_service(
                &service.id,
                ServiceReport {
                    host_id: a.id.clone(),
                    status: AssignmentStatus::Failed,
                    endpoint: None,
                    error: Some("crashed".into()),
                },
            )
            .unwrap();
        // a failed assignment skips this service for the same host
        assert!(state.claim_service(&a.id).unwrap().is_none());
        assert_eq!(
            state.get_service(&service.id).unwrap().status,
            ServiceStatus::Failed
        );
    }

    #[test]
    fn test_merge_convergence() {
        let (_dir_a, mut a) = open_state(60_000);
        let (_dir_b, mut b) = open_state(60_000);
        a.register_host(Some("h1".into()), "h".into(), vec!["shell".into()], 1)
            .unwrap();
        a.enqueue_job(shell_payload("x"), requirement(&["shell"]), None)
            .unwrap();

        let snapshot = a.snapshot().unwrap();
        assert!(b.merge_snapshot(&snapshot).unwrap());
        let merged = b.snapshot().unwrap();
        assert_eq!(merged.hosts.len(), 1);
        assert_eq!(merged.jobs.len(), 1);
        // idempotent: second merge adopts nothing
        assert!(!b.merge_snapshot(&snapshot).unwrap());
    }

    #[test]
    fn test_merge_prefers_higher_version() {
        let (_dir_a, mut a) = open_state(60_000);
        let (_dir_b, mut b) = open_state(60_000);
        a.register_host(Some("h1".into()), "old".into(), vec![], 1)
            .unwrap();
        b.merge_snapshot(&a.snapshot().unwrap()).unwrap();

        // b advances the host past a's version
        b.register_host(Some("h1".into()), "new".into(), vec![], 2)
            .unwrap();
        // merging a's stale snapshot back must not regress
        assert!(!a.snapshot().unwrap().hosts.is_empty());
        b.merge_snapshot(&a.snapshot().unwrap()).unwrap();
        let merged = b.checkpoint();
        assert_eq!(merged.hosts[0].name, "new");
    }

    #[test]
    fn test_checkpoint_restore_round_trip() {
        let (_dir, mut state) = open_state(60_000);
        let empty = state.checkpoint();
        state
            .register_host(Some("h1".into()), "h".into(), vec![], 1)
            .unwrap();
        state
            .enqueue_job(shell_payload("x"), None, None)
            .unwrap();

        state.restore(&empty).unwrap();
        let after = state.snapshot().unwrap();
        assert!(after.hosts.is_empty());
        assert!(after.jobs.is_empty());

        // the durable mirror was replaced too
        let (hosts, jobs, _) = state.store.load_all().unwrap();
        assert!(hosts.is_empty() && jobs.is_empty());
    }

    #[test]
    fn test_restore_then_mutate_keeps_versions_monotonic() {
        let (_dir, mut state) = open_state(60_000);
        state
            .register_host(Some("h1".into()), "h".into(), vec![], 1)
            .unwrap();
        let checkpoint = state.checkpoint();
        state
            .register_host(Some("h2".into()), "h".into(), vec![], 1)
            .unwrap();
        state.restore(&checkpoint).unwrap();
        let next = state
            .register_host(Some("h3".into()), "h".into(), vec![], 1)
            .unwrap();
        assert!(next.version > checkpoint.hosts[0].version);
    }

    #[test]
    fn test_versions_strictly_increase_and_are_unique() {
        let (_dir, mut state) = open_state(60_000);
        let host = state
            .register_host(Some("h1".into()), "h".into(), vec!["shell".into()], 4)
            .unwrap();
        let job = state
            .enqueue_job(shell_payload("x"), requirement(&["shell"]), None)
            .unwrap();
        let claimed = state.claim_job(&host.id).unwrap().unwrap();
        let done = state
            .complete_job(
                &job.id,
                JobCompletion {
                    host_id: host.id.clone(),
                    success: true,
                    duration_ms: 1,
                    exit_code: Some(0),
                    stdout: String::new(),
                    stderr: String::new(),
                    error: None,
                },
            )
            .unwrap();

        let mut versions = vec![host.version, job.version, claimed.version, done.version];
        versions.extend(state.hosts.values().map(|h| h.version));
        versions.sort_unstable();
        let before = versions.len();
        versions.dedup();
        assert_eq!(versions.len(), before);
        assert!(job.version > host.version);
        assert!(claimed.version > job.version);
        assert!(done.version > claimed.version);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");
        let job_id;
        let last_version;
        {
            let store = Store::open(&path).unwrap();
            let mut state = CoordinatorState::open("node-a".into(), 60_000, store).unwrap();
            state
                .register_host(Some("h1".into()), "h".into(), vec!["shell".into()], 1)
                .unwrap();
            let job = state
                .enqueue_job(shell_payload("x"), requirement(&["shell"]), None)
                .unwrap();
            job_id = job.id;
            last_version = job.version;
        }

        let store = Store::open(&path).unwrap();
        let mut state = CoordinatorState::open("node-a".into(), 60_000, store).unwrap();
        assert_eq!(state.get_job(&job_id).unwrap().status, JobStatus::Queued);
        let claimed = state.claim_job("h1").unwrap().unwrap();
        assert!(claimed.version > last_version);
    }

    #[test]
    fn test_submitted_by_is_trimmed() {
        let (_dir, mut state) = open_state(60_000);
        let job = state
            .enqueue_job(shell_payload("x"), None, Some("  ".into()))
            .unwrap();
        assert!(job.submitted_by.is_none());
        let job = state
            .enqueue_job(shell_payload("x"), None, Some(" public:acme ".into()))
            .unwrap();
        assert_eq!(job.submitted_by.as_deref(), Some("public:acme"));
    }
}
