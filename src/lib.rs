//! Wearable health telemetry ingestion and multi-modal analysis pipeline.
//! Module layout mirrors the component boundaries: `domain` is the shared data
//! model, `storage` holds the two persistence leaves (structured store and raw
//! blob store), `pipeline` is the analysis core, `control_plane` is the
//! ingestion front door, `worker` drives the pipeline off the job queue, and
//! `http` exposes the control plane over REST.

pub mod config;
pub mod control_plane;
pub mod domain;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod storage;
pub mod worker;
