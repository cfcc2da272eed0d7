//! Audit emission: every mutation against the structured store emits an
//! `AuditEvent` after the mutation commits. Emission failures are logged
//! through a dedicated `tracing` target (`"audit"`) and never fail the
//! primary mutation.

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::{AuditEvent, AuditOperation};
use crate::error::StorageResult;

/// Persists one audit event. Called after a mutation's transaction commits; a
/// failure here is logged at the `"audit"` target, not propagated.
pub async fn record(
    pool: &SqlitePool,
    operation: AuditOperation,
    table: &str,
    item_id: &str,
    user_id: Option<Uuid>,
    metadata: serde_json::Value,
) {
    let event = AuditEvent::new(operation, table, item_id, user_id, metadata);
    if let Err(e) = insert(pool, &event).await {
        tracing::error!(
            target: "audit",
            audit_id = %event.audit_id,
            table,
            item_id,
            error = %e,
            "failed to persist audit event"
        );
    } else {
        tracing::info!(
            target: "audit",
            audit_id = %event.audit_id,
            operation = operation.as_str(),
            table,
            item_id,
            "audit event recorded"
        );
    }
}

async fn insert(pool: &SqlitePool, event: &AuditEvent) -> StorageResult<()> {
    sqlx::query(
        "INSERT INTO audit_logs (audit_id, operation, table_name, item_id, user_id, timestamp, metadata)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(event.audit_id.to_string())
    .bind(event.operation.as_str())
    .bind(&event.table)
    .bind(&event.item_id)
    .bind(event.user_id.map(|u| u.to_string()))
    .bind(event.timestamp.to_rfc3339())
    .bind(serde_json::to_string(&event.metadata)?)
    .execute(pool)
    .await?;
    Ok(())
}

/// Retention sweep: deletes audit rows older than `cutoff`. Returns the number
/// of rows removed.
pub async fn sweep_retention(
    pool: &SqlitePool,
    cutoff: chrono::DateTime<chrono::Utc>,
) -> StorageResult<u64> {
    let result = sqlx::query("DELETE FROM audit_logs WHERE timestamp < ?")
        .bind(cutoff.to_rfc3339())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::structured_store::create_tables;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        create_tables(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn record_persists_a_row() {
        let pool = memory_pool().await;
        record(
            &pool,
            AuditOperation::Create,
            "processing_jobs",
            "job-1",
            Some(Uuid::new_v4()),
            serde_json::json!({"status": "received"}),
        )
        .await;
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_logs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn retention_sweep_removes_old_rows_only() {
        let pool = memory_pool().await;
        record(
            &pool,
            AuditOperation::Create,
            "processing_jobs",
            "old",
            None,
            serde_json::json!({}),
        )
        .await;
        let cutoff = chrono::Utc::now() + chrono::Duration::days(1);
        let removed = sweep_retention(&pool, cutoff).await.unwrap();
        assert_eq!(removed, 1);
        let removed_again = sweep_retention(&pool, cutoff).await.unwrap();
        assert_eq!(removed_again, 0);
    }
}
