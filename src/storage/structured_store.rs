//! Structured job/metric/analysis/audit store: sqlite via `sqlx`, WAL journal
//! mode, a read-through cache in front of reads, and an audit event emitted
//! after every mutation commits.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

use crate::config::{CacheConfig, DatabaseConfig};
use crate::domain::{
    AnalysisResult, AuditEvent, AuditOperation, HealthMetric, Insight, JobStatus, MlModelRecord,
    ProcessingJob, UserProfile,
};
use crate::error::{StorageError, StorageResult};

use super::audit;
use super::cache::Cache;

/// Maximum items accepted by a single `batch_write_health_metrics` call.
/// Callers chunk larger batches themselves.
pub const BATCH_WRITE_LIMIT: usize = 25;

/// Per-table row counts removed by [`StructuredStore::delete_user_data`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UserDataDeletionCounts {
    pub health_data: u64,
    pub jobs: u64,
    pub results: u64,
    pub insights: u64,
    pub profiles: u64,
}

impl UserDataDeletionCounts {
    /// Total rows removed across every table, ambient tables included.
    pub fn total(&self) -> u64 {
        self.health_data + self.jobs + self.results + self.insights + self.profiles
    }
}

pub struct StructuredStore {
    pool: SqlitePool,
    cache: Cache,
}

impl StructuredStore {
    /// Opens (creating if needed) the sqlite database described by `config`,
    /// sets WAL mode and a busy timeout, and runs `create_tables` if
    /// `config.auto_migrate` is set.
    pub async fn connect(config: &DatabaseConfig, cache_config: &CacheConfig) -> StorageResult<Self> {
        if let Some(dir) = config.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| StorageError::other(e.to_string()))?
            .create_if_missing(true)
            .synchronous(SqliteSynchronous::Normal)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        if config.auto_migrate {
            run_migrations(&pool).await?;
            create_tables(&pool).await?;
        }

        Ok(Self {
            pool,
            cache: Cache::new(cache_config),
        })
    }

    /// Wraps an already-open pool, for callers (tests, the CLI's `migrate`
    /// subcommand) that manage the pool's lifecycle themselves.
    pub fn from_pool(pool: SqlitePool, cache: Cache) -> Self {
        Self { pool, cache }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -- health_data ------------------------------------------------------

    /// Validates and writes one chunk (≤ `BATCH_WRITE_LIMIT`) of metrics for a
    /// single upload. The caller (the upload control plane) is responsible for
    /// splitting a larger upload into chunks and retrying a failed chunk.
    pub async fn batch_write_health_metrics(
        &self,
        user_id: Uuid,
        upload_source: &str,
        metrics: &[HealthMetric],
    ) -> StorageResult<()> {
        if metrics.is_empty() {
            return Err(StorageError::validation("at least one metric is required"));
        }
        if upload_source.trim().is_empty() {
            return Err(StorageError::validation("upload_source is required"));
        }
        if metrics.len() > BATCH_WRITE_LIMIT {
            return Err(StorageError::validation(format!(
                "batch exceeds the {BATCH_WRITE_LIMIT}-item ceiling; caller must chunk"
            )));
        }

        let mut tx = self.pool.begin().await?;
        for metric in metrics {
            let payload = decimalize(serde_json::to_value(metric)?);
            sqlx::query(
                "INSERT INTO health_data (user_id, metric_id, metric_type, created_at, payload)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(user_id, metric_id) DO UPDATE SET payload = excluded.payload",
            )
            .bind(metric.user_id.to_string())
            .bind(metric.metric_id.to_string())
            .bind(metric_type_str(metric.metric_type)?)
            .bind(metric.created_at.to_rfc3339())
            .bind(serde_json::to_string(&payload)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        for metric in metrics {
            self.cache.invalidate("health_data", &metric.metric_id.to_string());
        }
        audit::record(
            &self.pool,
            AuditOperation::BatchWrite,
            "health_data",
            &format!("{user_id}:{}", metrics.len()),
            Some(user_id),
            serde_json::json!({"count": metrics.len(), "upload_source": upload_source}),
        )
        .await;
        Ok(())
    }

    /// Query by user with an optional time range, ascending by `created_at`.
    pub async fn query_health_data(
        &self,
        user_id: Uuid,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<HealthMetric>> {
        let rows = sqlx::query(
            "SELECT payload FROM health_data
             WHERE user_id = ?
               AND (? IS NULL OR created_at >= ?)
               AND (? IS NULL OR created_at <= ?)
             ORDER BY created_at ASC",
        )
        .bind(user_id.to_string())
        .bind(start.map(|t| t.to_rfc3339()))
        .bind(start.map(|t| t.to_rfc3339()))
        .bind(end.map(|t| t.to_rfc3339()))
        .bind(end.map(|t| t.to_rfc3339()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let payload: String = row.try_get("payload")?;
                let value: Value = serde_json::from_str(&payload)?;
                let metric: HealthMetric = serde_json::from_value(undecimalize(value))?;
                Ok(metric)
            })
            .collect()
    }

    // -- processing_jobs ---------------------------------------------------

    pub async fn put_processing_job(&self, job: &ProcessingJob) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO processing_jobs
                (processing_id, user_id, status, total_metrics, processed_metrics, created_at, updated_at, expires_at, error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(processing_id) DO UPDATE SET
                status = excluded.status, total_metrics = excluded.total_metrics,
                processed_metrics = excluded.processed_metrics, updated_at = excluded.updated_at,
                expires_at = excluded.expires_at, error = excluded.error",
        )
        .bind(job.processing_id.to_string())
        .bind(job.user_id.to_string())
        .bind(job.status.as_str())
        .bind(job.total_metrics)
        .bind(job.processed_metrics)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .bind(job.expires_at.to_rfc3339())
        .bind(job.error.clone())
        .execute(&self.pool)
        .await?;

        self.cache.invalidate("processing_jobs", &job.processing_id.to_string());
        audit::record(
            &self.pool,
            AuditOperation::Create,
            "processing_jobs",
            &job.processing_id.to_string(),
            Some(job.user_id),
            serde_json::json!({"status": job.status.as_str()}),
        )
        .await;
        Ok(())
    }

    pub async fn get_processing_job(&self, processing_id: Uuid) -> StorageResult<ProcessingJob> {
        let key = processing_id.to_string();
        if let Some(cached) = self.cache.get("processing_jobs", &key) {
            return Ok(serde_json::from_value(cached)?);
        }

        let row = sqlx::query("SELECT * FROM processing_jobs WHERE processing_id = ?")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found(format!("processing job {processing_id}")))?;

        let job = job_from_row(&row)?;
        self.cache.put("processing_jobs", &key, serde_json::to_value(&job)?);
        Ok(job)
    }

    pub async fn list_processing_jobs_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> StorageResult<Vec<ProcessingJob>> {
        let rows = sqlx::query(
            "SELECT * FROM processing_jobs WHERE user_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(user_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Cross-user scan used by the control plane's republish/lease sweeps.
    /// Small tables, swept infrequently; not cached.
    pub async fn list_jobs_by_status(&self, status: JobStatus) -> StorageResult<Vec<ProcessingJob>> {
        let rows = sqlx::query("SELECT * FROM processing_jobs WHERE status = ?")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Conditional update: only transitions `processing_id` from `expected` to
    /// `next` if its persisted status still equals `expected` at the time of
    /// the write ( "update (conditional)", state machine).
    pub async fn transition_job_status(
        &self,
        processing_id: Uuid,
        expected: JobStatus,
        next: JobStatus,
        processed_metrics: Option<i64>,
        error: Option<String>,
    ) -> StorageResult<()> {
        if !expected.can_transition_to(next) {
            return Err(StorageError::validation(format!(
                "illegal job transition {expected:?} -> {next:?}"
            )));
        }

        let result = sqlx::query(
            "UPDATE processing_jobs
             SET status = ?, processed_metrics = COALESCE(?, processed_metrics), error = ?, updated_at = ?
             WHERE processing_id = ? AND status = ?",
        )
        .bind(next.as_str())
        .bind(processed_metrics)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(processing_id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::validation(format!(
                "processing job {processing_id} was not in expected state {expected:?}"
            )));
        }

        self.cache.invalidate("processing_jobs", &processing_id.to_string());
        audit::record(
            &self.pool,
            AuditOperation::Update,
            "processing_jobs",
            &processing_id.to_string(),
            None,
            serde_json::json!({"from": expected.as_str(), "to": next.as_str()}),
        )
        .await;
        Ok(())
    }

    // -- analysis_results ---------------------------------------------------

    pub async fn put_analysis_result(&self, result: &AnalysisResult) -> StorageResult<()> {
        let payload = decimalize(serde_json::to_value(result)?);
        sqlx::query(
            "INSERT INTO analysis_results (user_id, processing_id, timestamp, payload)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id, processing_id) DO UPDATE SET
                timestamp = excluded.timestamp, payload = excluded.payload",
        )
        .bind(result.user_id.to_string())
        .bind(result.processing_id.to_string())
        .bind(result.timestamp.to_rfc3339())
        .bind(serde_json::to_string(&payload)?)
        .execute(&self.pool)
        .await?;

        self.cache.invalidate("analysis_results", &result.processing_id.to_string());
        audit::record(
            &self.pool,
            AuditOperation::Create,
            "analysis_results",
            &result.processing_id.to_string(),
            Some(result.user_id),
            serde_json::json!({}),
        )
        .await;
        Ok(())
    }

    /// Newest-first per user.
    pub async fn list_analysis_results(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> StorageResult<Vec<AnalysisResult>> {
        let rows = sqlx::query(
            "SELECT payload FROM analysis_results WHERE user_id = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(user_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let payload: String = row.try_get("payload")?;
                let value: Value = serde_json::from_str(&payload)?;
                Ok(serde_json::from_value(undecimalize(value))?)
            })
            .collect()
    }

    pub async fn get_latest_analysis_result(
        &self,
        user_id: Uuid,
    ) -> StorageResult<Option<AnalysisResult>> {
        Ok(self.list_analysis_results(user_id, 1).await?.into_iter().next())
    }

    // -- user_profiles ------------------------------------------------------

    pub async fn put_user_profile(&self, profile: &UserProfile) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO user_profiles (user_id, consented_at, onboarding_complete, preferred_units, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                consented_at = excluded.consented_at,
                onboarding_complete = excluded.onboarding_complete,
                preferred_units = excluded.preferred_units",
        )
        .bind(profile.user_id.to_string())
        .bind(profile.consented_at.map(|t| t.to_rfc3339()))
        .bind(profile.onboarding_complete)
        .bind(&profile.preferred_units)
        .bind(profile.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.cache.invalidate("user_profiles", &profile.user_id.to_string());
        audit::record(
            &self.pool,
            AuditOperation::Update,
            "user_profiles",
            &profile.user_id.to_string(),
            Some(profile.user_id),
            serde_json::json!({}),
        )
        .await;
        Ok(())
    }

    pub async fn get_user_profile(&self, user_id: Uuid) -> StorageResult<Option<UserProfile>> {
        let row = sqlx::query("SELECT * FROM user_profiles WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(UserProfile {
                user_id: Uuid::parse_str(&row.try_get::<String, _>("user_id")?)
                    .map_err(|e| StorageError::other(e.to_string()))?,
                consented_at: row
                    .try_get::<Option<String>, _>("consented_at")?
                    .map(|s| parse_timestamp(&s))
                    .transpose()?,
                onboarding_complete: row.try_get("onboarding_complete")?,
                preferred_units: row.try_get("preferred_units")?,
                created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            })
        })
        .transpose()
    }

    // -- ml_models ------------------------------------------------------

    pub async fn put_ml_model_record(&self, record: &MlModelRecord) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO ml_models (variant, checksum, weights_verified, loaded_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(variant) DO UPDATE SET
                checksum = excluded.checksum, weights_verified = excluded.weights_verified,
                loaded_at = excluded.loaded_at",
        )
        .bind(&record.variant)
        .bind(&record.checksum)
        .bind(record.weights_verified)
        .bind(record.loaded_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        self.cache.invalidate("ml_models", &record.variant);
        audit::record(
            &self.pool,
            AuditOperation::Update,
            "ml_models",
            &record.variant,
            None,
            serde_json::json!({"weights_verified": record.weights_verified}),
        )
        .await;
        Ok(())
    }

    pub async fn get_ml_model_record(&self, variant: &str) -> StorageResult<Option<MlModelRecord>> {
        let row = sqlx::query("SELECT * FROM ml_models WHERE variant = ?")
            .bind(variant)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(MlModelRecord {
                variant: row.try_get("variant")?,
                checksum: row.try_get("checksum")?,
                weights_verified: row.try_get("weights_verified")?,
                loaded_at: parse_timestamp(&row.try_get::<String, _>("loaded_at")?)?,
            })
        })
        .transpose()
    }

    // -- insights ------------------------------------------------------

    pub async fn put_insight(&self, insight: &Insight) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO insights (user_id, processing_id, summary, severity, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id, processing_id) DO UPDATE SET
                summary = excluded.summary, severity = excluded.severity",
        )
        .bind(insight.user_id.to_string())
        .bind(insight.processing_id.to_string())
        .bind(&insight.summary)
        .bind(&insight.severity)
        .bind(insight.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        audit::record(
            &self.pool,
            AuditOperation::Create,
            "insights",
            &insight.processing_id.to_string(),
            Some(insight.user_id),
            serde_json::json!({}),
        )
        .await;
        Ok(())
    }

    pub async fn list_insights(&self, user_id: Uuid) -> StorageResult<Vec<Insight>> {
        let rows = sqlx::query(
            "SELECT * FROM insights WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(Insight {
                    user_id: Uuid::parse_str(&row.try_get::<String, _>("user_id")?)
                        .map_err(|e| StorageError::other(e.to_string()))?,
                    processing_id: Uuid::parse_str(&row.try_get::<String, _>("processing_id")?)
                        .map_err(|e| StorageError::other(e.to_string()))?,
                    summary: row.try_get("summary")?,
                    severity: row.try_get("severity")?,
                    created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
                })
            })
            .collect()
    }

    /// Reads back the audit trail for one `(table, item_id)` pair, oldest
    /// first. Used by tests and operator tooling; not on any hot read path.
    pub async fn query_audit_events_for_item(
        &self,
        table: &str,
        item_id: &str,
    ) -> StorageResult<Vec<AuditEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM audit_logs WHERE table_name = ? AND item_id = ? ORDER BY timestamp ASC",
        )
        .bind(table)
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let operation = parse_audit_operation(&row.try_get::<String, _>("operation")?)?;
                Ok(AuditEvent {
                    audit_id: Uuid::parse_str(&row.try_get::<String, _>("audit_id")?)
                        .map_err(|e| StorageError::other(e.to_string()))?,
                    operation,
                    table: row.try_get("table_name")?,
                    item_id: row.try_get("item_id")?,
                    user_id: row
                        .try_get::<Option<String>, _>("user_id")?
                        .map(|u| Uuid::parse_str(&u))
                        .transpose()
                        .map_err(|e| StorageError::other(e.to_string()))?,
                    timestamp: parse_timestamp(&row.try_get::<String, _>("timestamp")?)?,
                    metadata: serde_json::from_str(&row.try_get::<String, _>("metadata")?)?,
                })
            })
            .collect()
    }

    // -- right-to-erasure ------------------------------------------------------

    /// Deletes every row owned by `user_id` across the per-user tables,
    /// broken down per table so callers can report the jobs/results share of
    /// the erasure separately from ambient rows (health metrics, insights,
    /// the profile row). Does not itself emit an audit event — erasure spans
    /// this store and the blob store, so the caller owns the single,
    /// cross-store audit event (see `control_plane::erase_user_data`).
    pub async fn delete_user_data(&self, user_id: Uuid) -> StorageResult<UserDataDeletionCounts> {
        let uid = user_id.to_string();
        let mut counts = UserDataDeletionCounts::default();
        let mut tx = self.pool.begin().await?;
        for table in ["health_data", "processing_jobs", "analysis_results", "insights", "user_profiles"] {
            let result = sqlx::query(&format!("DELETE FROM {table} WHERE user_id = ?"))
                .bind(&uid)
                .execute(&mut *tx)
                .await?;
            let rows = result.rows_affected();
            match table {
                "health_data" => counts.health_data = rows,
                "processing_jobs" => counts.jobs = rows,
                "analysis_results" => counts.results = rows,
                "insights" => counts.insights = rows,
                "user_profiles" => counts.profiles = rows,
                _ => unreachable!(),
            }
        }
        tx.commit().await?;
        Ok(counts)
    }

    // -- health -------------------------------------------------------------

    /// Snapshots the database to `dest` via `VACUUM INTO`, which sqlite runs
    /// atomically against the live pool without requiring a separate lock.
    pub async fn backup_database(&self, dest: &std::path::Path) -> StorageResult<()> {
        let dest_str = dest
            .to_str()
            .ok_or_else(|| StorageError::other("backup destination path is not valid UTF-8"))?;
        sqlx::query("VACUUM INTO ?")
            .bind(dest_str)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn health_check(&self) -> StorageResult<StoreHealth> {
        let start = std::time::Instant::now();
        let row: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        let latency_ms = start.elapsed().as_millis() as u64;
        let job_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM processing_jobs")
            .fetch_one(&self.pool)
            .await
            .unwrap_or((0,));
        Ok(StoreHealth {
            connected: row.0 == 1,
            latency_ms,
            processing_job_count: job_count.0,
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreHealth {
    pub connected: bool,
    pub latency_ms: u64,
    pub processing_job_count: i64,
}

/// The indexed `metric_type` column uses the same snake_case representation as
/// the serialized payload's `metric_type` field, rather than `MetricType`'s
/// `Debug` output, so the two stay comparable in ad-hoc queries.
fn metric_type_str(metric_type: crate::domain::MetricType) -> StorageResult<String> {
    Ok(serde_json::to_value(metric_type)?
        .as_str()
        .ok_or_else(|| StorageError::other("metric_type did not serialize to a string"))?
        .to_string())
}

fn parse_timestamp(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::other(format!("bad timestamp {s}: {e}")))
}

fn parse_audit_operation(s: &str) -> StorageResult<AuditOperation> {
    match s {
        "CREATE" => Ok(AuditOperation::Create),
        "READ" => Ok(AuditOperation::Read),
        "UPDATE" => Ok(AuditOperation::Update),
        "DELETE" => Ok(AuditOperation::Delete),
        "BATCH_WRITE" => Ok(AuditOperation::BatchWrite),
        "PIPELINE_STARTED" => Ok(AuditOperation::PipelineStarted),
        "PIPELINE_COMPLETED" => Ok(AuditOperation::PipelineCompleted),
        "PIPELINE_FAILED" => Ok(AuditOperation::PipelineFailed),
        "PIPELINE_REPLAY_SUPPRESSED" => Ok(AuditOperation::PipelineReplaySuppressed),
        "ORPHAN_BLOB" => Ok(AuditOperation::OrphanBlob),
        other => Err(StorageError::other(format!("unknown audit operation {other}"))),
    }
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<ProcessingJob> {
    Ok(ProcessingJob {
        processing_id: Uuid::parse_str(&row.try_get::<String, _>("processing_id")?)
            .map_err(|e| StorageError::other(e.to_string()))?,
        user_id: Uuid::parse_str(&row.try_get::<String, _>("user_id")?)
            .map_err(|e| StorageError::other(e.to_string()))?,
        status: JobStatus::parse(&row.try_get::<String, _>("status")?)
            .ok_or_else(|| StorageError::other("unrecognized job status in row"))?,
        total_metrics: row.try_get("total_metrics")?,
        processed_metrics: row.try_get("processed_metrics")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
        expires_at: parse_timestamp(&row.try_get::<String, _>("expires_at")?)?,
        error: row.try_get("error")?,
    })
}

/// Recursively converts non-integer JSON numbers into a tagged decimal string
/// before a structured-store write, avoiding float drift across
/// serialize/deserialize round trips. Reversed by `undecimalize` on read.
fn decimalize(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                Value::Number(n)
            } else if let Some(f) = n.as_f64() {
                let mut obj = serde_json::Map::new();
                obj.insert("__decimal__".to_string(), Value::String(format!("{f}")));
                Value::Object(obj)
            } else {
                Value::Number(n)
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(decimalize).collect()),
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, decimalize(v))).collect())
        }
        other => other,
    }
}

fn undecimalize(value: Value) -> Value {
    match value {
        Value::Object(map) if map.len() == 1 && map.contains_key("__decimal__") => map
            .get("__decimal__")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<f64>().ok())
            .map(|f| serde_json::json!(f))
            .unwrap_or(Value::Object(map)),
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, undecimalize(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(undecimalize).collect()),
        other => other,
    }
}

/// Runs the versioned migration set under `migrations/`. These cover the
/// tables present from the first release of this schema; tables added since
/// are managed directly by `create_tables` instead, so both run together.
pub async fn run_migrations(pool: &SqlitePool) -> StorageResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StorageError::other(e.to_string()))
}

/// Idempotent schema setup, used both by the `migrate` CLI subcommand and by
/// `connect` when `auto_migrate` is set.
pub async fn create_tables(pool: &SqlitePool) -> StorageResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS health_data (
            user_id TEXT NOT NULL,
            metric_id TEXT NOT NULL,
            metric_type TEXT NOT NULL,
            created_at TEXT NOT NULL,
            payload TEXT NOT NULL,
            PRIMARY KEY (user_id, metric_id)
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_health_data_user_created ON health_data(user_id, created_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS processing_jobs (
            processing_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            status TEXT NOT NULL,
            total_metrics INTEGER NOT NULL,
            processed_metrics INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            error TEXT
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_processing_jobs_user ON processing_jobs(user_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_processing_jobs_status ON processing_jobs(status)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS analysis_results (
            user_id TEXT NOT NULL,
            processing_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            payload TEXT NOT NULL,
            PRIMARY KEY (user_id, processing_id)
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_analysis_results_user_ts ON analysis_results(user_id, timestamp)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS audit_logs (
            audit_id TEXT PRIMARY KEY,
            operation TEXT NOT NULL,
            table_name TEXT NOT NULL,
            item_id TEXT NOT NULL,
            user_id TEXT,
            timestamp TEXT NOT NULL,
            metadata TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_logs_timestamp ON audit_logs(timestamp)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS user_profiles (
            user_id TEXT PRIMARY KEY,
            consented_at TEXT,
            onboarding_complete INTEGER NOT NULL,
            preferred_units TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS ml_models (
            variant TEXT PRIMARY KEY,
            checksum TEXT NOT NULL,
            weights_verified INTEGER NOT NULL,
            loaded_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS insights (
            user_id TEXT NOT NULL,
            processing_id TEXT NOT NULL,
            summary TEXT NOT NULL,
            severity TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (user_id, processing_id)
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActivityData, MetricPayload, MetricType};
    use chrono::Utc;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashMap;

    async fn store() -> StructuredStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        create_tables(&pool).await.unwrap();
        StructuredStore::from_pool(pool, Cache::disabled())
    }

    fn metric(user_id: Uuid) -> HealthMetric {
        HealthMetric {
            metric_id: Uuid::new_v4(),
            user_id,
            metric_type: MetricType::StepCount,
            created_at: Utc::now(),
            device_id: None,
            payload: MetricPayload::Activity(ActivityData { value: 512.0 }),
            raw: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn decimalize_round_trips_floats_without_drift() {
        let original = serde_json::json!({"score": 0.95, "nested": {"value": 1.23}, "list": [1.1, 2]});
        let stored = decimalize(original.clone());
        assert_eq!(stored["score"]["__decimal__"], "0.95");
        assert_eq!(stored["list"][1], serde_json::json!(2));
        assert_eq!(undecimalize(stored), original);
    }

    #[tokio::test]
    async fn batch_write_rejects_oversized_chunks() {
        let store = store().await;
        let user_id = Uuid::new_v4();
        let metrics: Vec<HealthMetric> = (0..26).map(|_| metric(user_id)).collect();
        let err = store
            .batch_write_health_metrics(user_id, "apple_watch", &metrics)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    #[tokio::test]
    async fn writes_and_queries_health_data_for_a_user() {
        let store = store().await;
        let user_id = Uuid::new_v4();
        let metrics = vec![metric(user_id), metric(user_id)];
        store
            .batch_write_health_metrics(user_id, "apple_watch", &metrics)
            .await
            .unwrap();
        let fetched = store.query_health_data(user_id, None, None).await.unwrap();
        assert_eq!(fetched.len(), 2);
    }

    #[tokio::test]
    async fn job_lifecycle_put_get_transition() {
        let store = store().await;
        let job = ProcessingJob::new(Uuid::new_v4(), Uuid::new_v4(), 10, 30);
        store.put_processing_job(&job).await.unwrap();

        let fetched = store.get_processing_job(job.processing_id).await.unwrap();
        assert_eq!(fetched.status, JobStatus::Received);

        store
            .transition_job_status(job.processing_id, JobStatus::Received, JobStatus::Processing, None, None)
            .await
            .unwrap();
        let updated = store.get_processing_job(job.processing_id).await.unwrap();
        assert_eq!(updated.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn conditional_transition_rejects_stale_expected_state() {
        let store = store().await;
        let job = ProcessingJob::new(Uuid::new_v4(), Uuid::new_v4(), 10, 30);
        store.put_processing_job(&job).await.unwrap();
        store
            .transition_job_status(job.processing_id, JobStatus::Received, JobStatus::Processing, None, None)
            .await
            .unwrap();

        let result = store
            .transition_job_status(job.processing_id, JobStatus::Received, JobStatus::Processing, None, None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn list_jobs_by_status_scans_across_users() {
        let store = store().await;
        let received = ProcessingJob::new(Uuid::new_v4(), Uuid::new_v4(), 1, 30);
        let mut processing = ProcessingJob::new(Uuid::new_v4(), Uuid::new_v4(), 1, 30);
        processing.status = JobStatus::Processing;
        store.put_processing_job(&received).await.unwrap();
        store.put_processing_job(&processing).await.unwrap();

        let found = store.list_jobs_by_status(JobStatus::Received).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].processing_id, received.processing_id);
    }

    #[tokio::test]
    async fn get_missing_job_is_not_found() {
        let store = store().await;
        let err = store.get_processing_job(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_user_data_removes_every_owned_row() {
        let store = store().await;
        let user_id = Uuid::new_v4();
        let job = ProcessingJob::new(Uuid::new_v4(), user_id, 1, 30);
        store.put_processing_job(&job).await.unwrap();
        store
            .batch_write_health_metrics(user_id, "apple_watch", &[metric(user_id)])
            .await
            .unwrap();

        let deleted = store.delete_user_data(user_id).await.unwrap();
        assert!(deleted.total() >= 2);
        assert_eq!(deleted.jobs, 1);
        assert!(store.query_health_data(user_id, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_migrations_is_idempotent_alongside_create_tables() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        create_tables(&pool).await.unwrap();
        // Running both layers twice must not error on the `IF NOT EXISTS` forms.
        run_migrations(&pool).await.unwrap();
        create_tables(&pool).await.unwrap();

        let job = ProcessingJob::new(Uuid::new_v4(), Uuid::new_v4(), 1, 30);
        let store = StructuredStore::from_pool(pool, Cache::disabled());
        store.put_processing_job(&job).await.unwrap();
        assert!(store.get_processing_job(job.processing_id).await.is_ok());
    }

    #[tokio::test]
    async fn backup_database_writes_a_restorable_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = dir.path().join("source.db");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&format!("sqlite:{}?mode=rwc", db_path.display()))
            .await
            .unwrap();
        create_tables(&pool).await.unwrap();
        let store = StructuredStore::from_pool(pool, Cache::disabled());
        let job = ProcessingJob::new(Uuid::new_v4(), Uuid::new_v4(), 1, 30);
        store.put_processing_job(&job).await.unwrap();

        let backup_path = dir.path().join("backup.db");
        store.backup_database(&backup_path).await.unwrap();
        assert!(backup_path.exists());

        let backup_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&format!("sqlite:{}?mode=ro", backup_path.display()))
            .await
            .unwrap();
        let restored = StructuredStore::from_pool(backup_pool, Cache::disabled());
        let fetched = restored.get_processing_job(job.processing_id).await.unwrap();
        assert_eq!(fetched.processing_id, job.processing_id);
    }
}
