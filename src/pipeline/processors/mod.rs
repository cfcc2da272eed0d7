//! Per-modality feature extraction. Each processor takes a slice of metric
//! references from one [`super::router::ModalityBuckets`] bucket and returns
//! its feature representation. None of these ever error: an empty bucket
//! produces a zero vector or zero-valued struct, never a failure, since "no
//! data of this modality" is routine rather than exceptional.

pub mod activity;
pub mod cardio;
pub mod respiratory;
pub mod sleep;
pub mod stats;
