use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// ProcessingJob state machine: `received -> processing -> {completed, failed,
/// cancelled}`. The terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Received,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the state machine permits `self -> next`. `(Processing,
    /// Received)` is the orphan-reclaim path: the lease sweep rewinds a job
    /// whose worker died mid-flight so a fresh worker can claim it through the
    /// normal `Received -> Processing` edge.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Received, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Received, Cancelled)
                | (Processing, Received)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Received => "received",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(JobStatus::Received),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

/// The persistent record tracking one upload's journey through validation,
/// storage, queueing, and analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub processing_id: Uuid,
    pub user_id: Uuid,
    pub status: JobStatus,
    pub total_metrics: i64,
    pub processed_metrics: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl ProcessingJob {
    pub fn new(processing_id: Uuid, user_id: Uuid, total_metrics: i64, expiry_days: i64) -> Self {
        let now = Utc::now();
        Self {
            processing_id,
            user_id,
            status: JobStatus::Received,
            total_metrics,
            processed_metrics: 0,
            created_at: now,
            updated_at: now,
            expires_at: now + chrono::Duration::days(expiry_days),
            error: None,
        }
    }

    /// A `processing` job whose lease has expired is orphaned and may be
    /// re-claimed.
    pub fn is_orphaned(&self, lease_seconds: i64, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && (now - self.updated_at) > chrono::Duration::seconds(lease_seconds)
    }

    /// A `received` job older than 60s whose publish may have been lost and
    /// should be re-published by the sweep.
    pub fn needs_republish(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Received && (now - self.created_at) > chrono::Duration::seconds(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        assert!(JobStatus::Received.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Received.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Received));
    }

    #[test]
    fn terminal_states_are_absorbing() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Received.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn orphan_detection_respects_lease() {
        let mut job = ProcessingJob::new(Uuid::new_v4(), Uuid::new_v4(), 10, 30);
        job.status = JobStatus::Processing;
        job.updated_at = Utc::now() - chrono::Duration::seconds(700);
        assert!(job.is_orphaned(600, Utc::now()));
        job.updated_at = Utc::now();
        assert!(!job.is_orphaned(600, Utc::now()));
    }
}
