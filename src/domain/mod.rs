//! Core data model: health metrics, uploads, processing jobs, analysis results,
//! audit events, and the supplemental tables the ambient stack adds (user
//! profiles, ml-model records, insights). Polymorphic metric payloads are a
//! sealed sum type rather than a struct of optional fields, so "exactly one
//! variant populated" is a compiler-checked invariant, not a runtime one.

mod analysis;
mod audit;
mod job;
mod metric;
mod supplemental;
mod upload;

pub use analysis::{ActigraphySummary, AnalysisResult, NamedFeature, SleepFeatures};
pub use audit::{AuditEvent, AuditOperation};
pub use job::{JobStatus, ProcessingJob};
pub use metric::{
    ActivityData, BiometricData, HealthMetric, MentalHealthData, MetricPayload, MetricType,
    SleepData,
};
pub use supplemental::{Insight, MlModelRecord, UserProfile};
pub use upload::{RawBlobDocument, Upload};
