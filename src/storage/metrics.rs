//! Metrics repository: per-service windows, active services, trace lookups.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rusqlite::{params, Row};
use tracing::{debug, info};

use crate::detect::MetricSample;
use crate::storage::{decode_time, encode_time, Pool, StorageError};

/// Most rows returned for a single service window.
pub const WINDOW_ROW_LIMIT: i64 = 1000;
/// Services seen within this many hours count as active.
const ACTIVE_HOURS: i64 = 24;

#[async_trait]
pub trait MetricsRepository: Send + Sync {
    /// Samples for `service` from the last `minutes`, newest first.
    async fn fetch_by_service(&self, service: &str, minutes: i64) -> Result<Vec<MetricSample>, StorageError>;

    /// Distinct services that reported recently, ordered by name.
    async fn active_services(&self) -> Result<Vec<String>, StorageError>;

    /// Every sample carrying `trace_id`, oldest first.
    async fn fetch_by_trace(&self, trace_id: &str) -> Result<Vec<MetricSample>, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;
}

const SAMPLE_COLUMNS: &str = "id, service, trace_id, method, path, timestamp, response_time_ms,
     status_code, request_count, error_count, response_size_bytes, created_at";

struct RawSample {
    id: String,
    service: String,
    trace_id: Option<String>,
    method: Option<String>,
    path: Option<String>,
    timestamp: String,
    response_time_ms: f64,
    status_code: i64,
    request_count: i64,
    error_count: i64,
    response_size_bytes: Option<i64>,
    created_at: String,
}

impl RawSample {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            service: row.get(1)?,
            trace_id: row.get(2)?,
            method: row.get(3)?,
            path: row.get(4)?,
            timestamp: row.get(5)?,
            response_time_ms: row.get(6)?,
            status_code: row.get(7)?,
            request_count: row.get(8)?,
            error_count: row.get(9)?,
            response_size_bytes: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    fn into_sample(self) -> Result<MetricSample, StorageError> {
        Ok(MetricSample {
            timestamp: decode_time(&self.timestamp)?,
            created_at: decode_time(&self.created_at)?,
            id: self.id,
            service: self.service,
            trace_id: self.trace_id,
            method: self.method,
            path: self.path,
            response_time_ms: self.response_time_ms,
            status_code: self.status_code,
            request_count: self.request_count,
            error_count: self.error_count,
            response_size_bytes: self.response_size_bytes,
        })
    }
}

#[derive(Clone)]
pub struct SqliteMetricsRepository {
    pool: Pool,
    excluded_services: Vec<String>,
}

impl SqliteMetricsRepository {
    pub fn new(pool: Pool, excluded_services: Vec<String>) -> Self {
        Self { pool, excluded_services }
    }

    /// Store samples, replacing any with the same id.
    pub async fn insert_samples(&self, samples: Vec<MetricSample>) -> Result<usize, StorageError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<usize, StorageError> {
            let mut conn = pool.get()?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO metrics (
                        id, service, trace_id, method, path, timestamp, response_time_ms,
                        status_code, request_count, error_count, response_size_bytes, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                )?;
                for s in &samples {
                    stmt.execute(params![
                        s.id,
                        s.service,
                        s.trace_id,
                        s.method,
                        s.path,
                        encode_time(&s.timestamp),
                        s.response_time_ms,
                        s.status_code,
                        s.request_count,
                        s.error_count,
                        s.response_size_bytes,
                        encode_time(&s.created_at),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(samples.len())
        })
        .await?
    }

    async fn query_samples(
        &self,
        sql: String,
        args: Vec<rusqlite::types::Value>,
    ) -> Result<Vec<MetricSample>, StorageError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<MetricSample>, StorageError> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args), RawSample::from_row)?;

            let mut samples = Vec::new();
            for r in rows {
                samples.push(r?.into_sample()?);
            }
            Ok(samples)
        })
        .await?
    }
}

#[async_trait]
impl MetricsRepository for SqliteMetricsRepository {
    async fn fetch_by_service(&self, service: &str, minutes: i64) -> Result<Vec<MetricSample>, StorageError> {
        let cutoff = encode_time(&(Utc::now() - Duration::minutes(minutes)));
        let sql = format!(
            "SELECT {SAMPLE_COLUMNS} FROM metrics
             WHERE service = ?1 AND timestamp >= ?2
             ORDER BY timestamp DESC
             LIMIT {WINDOW_ROW_LIMIT}"
        );
        let samples = self
            .query_samples(sql, vec![service.to_string().into(), cutoff.into()])
            .await?;

        if minutes > 60 {
            info!(%service, samples = samples.len(), hours = minutes / 60, "backfill window fetched");
        } else {
            debug!(%service, samples = samples.len(), minutes, "window fetched");
        }
        Ok(samples)
    }

    async fn active_services(&self) -> Result<Vec<String>, StorageError> {
        let pool = self.pool.clone();
        let excluded = self.excluded_services.clone();
        let cutoff = encode_time(&(Utc::now() - Duration::hours(ACTIVE_HOURS)));

        tokio::task::spawn_blocking(move || -> Result<Vec<String>, StorageError> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT DISTINCT service FROM metrics
                 WHERE timestamp >= ?1
                 ORDER BY service",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;

            let mut services = Vec::new();
            for r in rows {
                let service = r?;
                if !excluded.contains(&service) {
                    services.push(service);
                }
            }
            debug!(count = services.len(), "active services");
            Ok(services)
        })
        .await?
    }

    async fn fetch_by_trace(&self, trace_id: &str) -> Result<Vec<MetricSample>, StorageError> {
        let sql = format!(
            "SELECT {SAMPLE_COLUMNS} FROM metrics
             WHERE trace_id = ?1
             ORDER BY timestamp ASC"
        );
        let samples = self.query_samples(sql, vec![trace_id.to_string().into()]).await?;
        debug!(%trace_id, events = samples.len(), "trace fetched");
        Ok(samples)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let conn = pool.get()?;
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await?
    }
}
