//! Storage layer: the structured store and the raw blob store, the two leaf
//! components the upload control plane and worker tier sit on top of.

pub mod audit;
pub mod blob_store;
pub mod cache;
pub mod structured_store;

pub use blob_store::{BlobStore, DataType, FsBlobStore, ObjectListing, ObjectMetadata, StorageClass};
pub use cache::Cache;
pub use structured_store::{StoreHealth, StructuredStore, UserDataDeletionCounts, BATCH_WRITE_LIMIT};
