//! Durable mirror of coordinator state, backed by SQLite
//!
//! Stores:
//! - Host, job and service rows (full entity JSON in a `json` column)
//! - The idempotency ledger, keyed by `(route, key)`
//!
//! Every state mutation writes its touched rows here before returning, so a
//! restarted coordinator recovers the exact queue it crashed with.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::common::Result;
use crate::coordinator::model::{Host, IdempotencyRecord, Job, Service};

/// Durable store
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create the store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS hosts (
              id TEXT PRIMARY KEY,
              json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS jobs (
              id TEXT PRIMARY KEY,
              created_at TEXT NOT NULL,
              json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
            CREATE TABLE IF NOT EXISTS services (
              id TEXT PRIMARY KEY,
              created_at TEXT NOT NULL,
              json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS idempotency (
              route TEXT NOT NULL,
              key TEXT NOT NULL,
              request_hash TEXT NOT NULL,
              status_code INTEGER NOT NULL,
              response_json TEXT NOT NULL,
              created_at TEXT NOT NULL,
              expires_at TEXT NOT NULL,
              PRIMARY KEY (route, key)
            );
            CREATE INDEX IF NOT EXISTS idx_idempotency_expires_at ON idempotency(expires_at);
            "#,
        )?;
        Ok(Self { conn })
    }

    // === Entity rows ===

    pub fn upsert_host(&self, host: &Host) -> Result<()> {
        let json = serde_json::to_string(host)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO hosts (id, json) VALUES (?1, ?2)",
            params![host.id, json],
        )?;
        Ok(())
    }

    pub fn upsert_job(&self, job: &Job) -> Result<()> {
        let json = serde_json::to_string(job)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO jobs (id, created_at, json) VALUES (?1, ?2, ?3)",
            params![job.id, job.created_at.to_rfc3339(), json],
        )?;
        Ok(())
    }

    pub fn upsert_service(&self, service: &Service) -> Result<()> {
        let json = serde_json::to_string(service)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO services (id, created_at, json) VALUES (?1, ?2, ?3)",
            params![service.id, service.created_at.to_rfc3339(), json],
        )?;
        Ok(())
    }

    /// Load all entity rows, for crash recovery on open
    pub fn load_all(&self) -> Result<(Vec<Host>, Vec<Job>, Vec<Service>)> {
        let mut hosts = Vec::new();
        let mut stmt = self.conn.prepare("SELECT json FROM hosts")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for row in rows {
            hosts.push(serde_json::from_str(&row?)?);
        }

        let mut jobs = Vec::new();
        let mut stmt = self
            .conn
            .prepare("SELECT json FROM jobs ORDER BY created_at")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for row in rows {
            jobs.push(serde_json::from_str(&row?)?);
        }

        let mut services = Vec::new();
        let mut stmt = self
            .conn
            .prepare("SELECT json FROM services ORDER BY created_at")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for row in rows {
            services.push(serde_json::from_str(&row?)?);
        }

        Ok((hosts, jobs, services))
    }

    /// Transactionally replace every entity row; used by checkpoint restore
    pub fn replace_all(&mut self, hosts: &[Host], jobs: &[Job], services: &[Service]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM hosts", [])?;
        tx.execute("DELETE FROM jobs", [])?;
        tx.execute("DELETE FROM services", [])?;
        for host in hosts {
            tx.execute(
                "INSERT INTO hosts (id, json) VALUES (?1, ?2)",
                params![host.id, serde_json::to_string(host)?],
            )?;
        }
        for job in jobs {
            tx.execute(
                "INSERT INTO jobs (id, created_at, json) VALUES (?1, ?2, ?3)",
                params![job.id, job.created_at.to_rfc3339(), serde_json::to_string(job)?],
            )?;
        }
        for service in services {
            tx.execute(
                "INSERT INTO services (id, created_at, json) VALUES (?1, ?2, ?3)",
                params![
                    service.id,
                    service.created_at.to_rfc3339(),
                    serde_json::to_string(service)?
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // === Idempotency ledger ===

    pub fn get_idempotency(&self, route: &str, key: &str) -> Result<Option<IdempotencyRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT request_hash, status_code, response_json, created_at, expires_at
             FROM idempotency WHERE route = ?1 AND key = ?2",
        )?;
        let row = stmt
            .query_row(params![route, key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u16>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .optional()?;
        match row {
            Some((request_hash, status_code, response_json, created_at, expires_at)) => {
                Ok(Some(IdempotencyRecord {
                    route: route.to_string(),
                    key: key.to_string(),
                    request_hash,
                    status_code,
                    response_json,
                    created_at: parse_ts(&created_at)?,
                    expires_at: parse_ts(&expires_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn put_idempotency(&self, record: &IdempotencyRecord) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO idempotency
             (route, key, request_hash, status_code, response_json, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.route,
                record.key,
                record.request_hash,
                record.status_code,
                record.response_json,
                record.created_at.to_rfc3339(),
                record.expires_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Delete ledger rows whose expiry has passed; returns the count removed
    pub fn delete_expired_idempotency(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM idempotency WHERE expires_at <= ?1",
            params![now.to_rfc3339()],
        )?;
        Ok(removed)
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| crate::Error::Internal(format!("bad timestamp in store: {}", e)))
}
