use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit operation kinds. `PIPELINE_*` covers the pipeline-specific lifecycle
/// events the worker emits in addition to the generic CRUD kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOperation {
    Create,
    Read,
    Update,
    Delete,
    BatchWrite,
    PipelineStarted,
    PipelineCompleted,
    PipelineFailed,
    PipelineReplaySuppressed,
    OrphanBlob,
}

impl AuditOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditOperation::Create => "CREATE",
            AuditOperation::Read => "READ",
            AuditOperation::Update => "UPDATE",
            AuditOperation::Delete => "DELETE",
            AuditOperation::BatchWrite => "BATCH_WRITE",
            AuditOperation::PipelineStarted => "PIPELINE_STARTED",
            AuditOperation::PipelineCompleted => "PIPELINE_COMPLETED",
            AuditOperation::PipelineFailed => "PIPELINE_FAILED",
            AuditOperation::PipelineReplaySuppressed => "PIPELINE_REPLAY_SUPPRESSED",
            AuditOperation::OrphanBlob => "ORPHAN_BLOB",
        }
    }
}

/// Append-only, tamper-evident audit record. Never mutated or deleted except by
/// the retention sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub audit_id: Uuid,
    pub operation: AuditOperation,
    pub table: String,
    pub item_id: String,
    pub user_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        operation: AuditOperation,
        table: impl Into<String>,
        item_id: impl Into<String>,
        user_id: Option<Uuid>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            audit_id: Uuid::new_v4(),
            operation,
            table: table.into(),
            item_id: item_id.into(),
            user_id,
            timestamp: Utc::now(),
            metadata,
        }
    }
}
