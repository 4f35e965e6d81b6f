//! Cluster data model: hosts, jobs, services, snapshots
//!
//! All entities serialize as camelCase JSON; this is the wire format for the
//! HTTP API, the replication snapshot, and the `json` column of the durable
//! store. Unknown fields ride along in a flattened map so records written by
//! a newer peer survive a persist/replicate cycle on an older one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A registered worker process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: String,
    pub name: String,
    /// Normalized: trimmed, de-duplicated, sorted
    pub capabilities: Vec<String>,
    pub max_parallel: u32,
    pub active_leases: u32,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub version: u64,
    pub updated_by: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Leased,
    Completed,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Leased => write!(f, "leased"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What a job runs on the host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobPayload {
    #[serde(rename_all = "camelCase")]
    Shell {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    OpenclawRun {
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        openclaw_dir: Option<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobRequirement {
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

/// Outcome reported by the executing host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_host_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub payload: JobPayload,
    #[serde(default)]
    pub requirement: JobRequirement,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
    pub updated_by: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Pending,
    Running,
    Failed,
}

/// Assignment status doubles as the value hosts report back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    Pending,
    Running,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAssignment {
    pub host_id: String,
    pub status: AssignmentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A long-lived process deployed across hosts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub replicas: u32,
    pub required_capabilities: Vec<String>,
    pub status: ServiceStatus,
    #[serde(default)]
    pub assignments: Vec<ServiceAssignment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
    pub updated_by: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Service {
    /// Derived status: running beats pending beats failed
    pub fn derive_status(&self) -> ServiceStatus {
        if self
            .assignments
            .iter()
            .any(|a| a.status == AssignmentStatus::Running)
        {
            ServiceStatus::Running
        } else if self
            .assignments
            .iter()
            .any(|a| a.status == AssignmentStatus::Pending)
        {
            ServiceStatus::Pending
        } else {
            ServiceStatus::Failed
        }
    }
}

/// Full observable state, as shipped between peers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub node_id: String,
    pub hosts: Vec<Host>,
    pub jobs: Vec<Job>,
    pub services: Vec<Service>,
}

/// Cached response for a replayed mutation
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    pub route: String,
    pub key: String,
    pub request_hash: String,
    pub status_code: u16,
    pub response_json: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Last-writer-wins ordering used by snapshot merge: higher version wins,
/// ties broken by updatedAt then updatedBy. Total across peers because every
/// local mutation consumes a strictly increasing version.
pub fn should_adopt(
    local: (u64, DateTime<Utc>, &str),
    incoming: (u64, DateTime<Utc>, &str),
) -> bool {
    if incoming.0 != local.0 {
        return incoming.0 > local.0;
    }
    if incoming.1 != local.1 {
        return incoming.1 > local.1;
    }
    incoming.2 > local.2
}

impl Host {
    pub fn merge_key(&self) -> (u64, DateTime<Utc>, &str) {
        (self.version, self.last_seen_at, &self.updated_by)
    }
}

impl Job {
    pub fn merge_key(&self) -> (u64, DateTime<Utc>, &str) {
        (self.version, self.updated_at, &self.updated_by)
    }
}

impl Service {
    pub fn merge_key(&self) -> (u64, DateTime<Utc>, &str) {
        (self.version, self.updated_at, &self.updated_by)
    }
}
