//! Environment-driven configuration. Typed config structs with a `from_env()`
//! constructor, sensible defaults, and platform-aware path resolution for
//! on-disk state (the sqlite file, the model weight cache). Each `from_env()`
//! starts from an optional TOML file layer (read once, process-wide, via the
//! `config` crate's builder) and lets individual environment variables
//! override it field by field.

use std::path::PathBuf;

use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::pipeline::pat::PatVariant;

/// Lowest-precedence settings layer, loaded once from an optional TOML file.
/// Every field is optional: a config file may set as few or as many keys as
/// it likes, and an absent file is not an error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    database_url: Option<String>,
    data_table_name: Option<String>,
    db_max_connections: Option<u32>,
    blob_store_root: Option<String>,
    healthkit_raw_bucket: Option<String>,
    region: Option<String>,
    pat_model_size: Option<String>,
    pat_model_path: Option<String>,
    pat_signature_key: Option<String>,
    max_metrics_per_upload: Option<usize>,
    job_lease_seconds: Option<u64>,
    job_timeout_seconds: Option<u64>,
    max_worker_concurrency: Option<usize>,
    enable_caching: Option<bool>,
    cache_ttl_seconds: Option<u64>,
    host: Option<String>,
    port: Option<u16>,
}

/// The path checked for the optional TOML file: `CLARITY_CONFIG_FILE` if set,
/// otherwise `clarity-pat.toml` in the current directory.
fn config_file_stem() -> String {
    std::env::var("CLARITY_CONFIG_FILE").unwrap_or_else(|_| "clarity-pat".to_string())
}

/// Loaded once per process. A missing or unparsable file yields field-by-field
/// defaults rather than failing boot — the file layer is strictly additive.
static FILE_SETTINGS: Lazy<FileSettings> = Lazy::new(|| {
    config::Config::builder()
        .add_source(config::File::with_name(&config_file_stem()).required(false))
        .build()
        .and_then(|c| c.try_deserialize())
        .unwrap_or_default()
});

/// Top-level application configuration, assembled once at process boot and
/// threaded explicitly into the store client, the pipeline, and the HTTP router
/// rather than read from globals at call sites.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub blob_store: BlobStoreConfig,
    pub pat: PatConfig,
    pub control_plane: ControlPlaneConfig,
    pub cache: CacheConfig,
    pub http: HttpConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database: DatabaseConfig::from_env(),
            blob_store: BlobStoreConfig::from_env(),
            pat: PatConfig::from_env(),
            control_plane: ControlPlaneConfig::from_env(),
            cache: CacheConfig::from_env(),
            http: HttpConfig::from_env(),
        }
    }
}

/// Structured-store configuration: a sqlite file under WAL journal mode.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub path: PathBuf,
    pub auto_migrate: bool,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = default_data_dir().join("clarity-pat.db");
        Self {
            url: format!("sqlite:{}?mode=rwc", path.display()),
            path,
            auto_migrate: true,
            max_connections: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(url) = FILE_SETTINGS.database_url.clone() {
            if let Some(stripped) = url.strip_prefix("sqlite:") {
                cfg.path = PathBuf::from(stripped.split('?').next().unwrap_or(stripped));
            }
            cfg.url = url;
        }
        if let Some(v) = &FILE_SETTINGS.data_table_name {
            cfg.path = cfg.path.with_file_name(format!("{v}.db"));
        }
        if let Some(n) = FILE_SETTINGS.db_max_connections {
            cfg.max_connections = n;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            if let Some(stripped) = url.strip_prefix("sqlite:") {
                cfg.path = PathBuf::from(stripped.split('?').next().unwrap_or(stripped));
            }
            cfg.url = url;
        }
        if let Ok(v) = std::env::var("DATA_TABLE_NAME") {
            // DATA_TABLE_NAME names the structured-store root table; the
            // sqlite backend uses one physical table per logical table and
            // this only changes the root prefix used for all of them.
            cfg.path = cfg.path.with_file_name(format!("{v}.db"));
        }
        if let Ok(v) = std::env::var("DB_AUTO_MIGRATE") {
            cfg.auto_migrate = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("DB_MAX_CONN") {
            if let Ok(n) = v.parse() {
                cfg.max_connections = n;
            }
        }
        cfg
    }
}

/// Raw blob store configuration.
#[derive(Debug, Clone)]
pub struct BlobStoreConfig {
    pub root: PathBuf,
    pub bucket: String,
    pub region: String,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            root: default_data_dir().join("blobs"),
            bucket: "healthkit-raw-data".to_string(),
            region: "us-east-1".to_string(),
        }
    }
}

impl BlobStoreConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = &FILE_SETTINGS.healthkit_raw_bucket {
            cfg.bucket = v.clone();
        }
        if let Some(v) = &FILE_SETTINGS.region {
            cfg.region = v.clone();
        }
        if let Some(v) = &FILE_SETTINGS.blob_store_root {
            cfg.root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("HEALTHKIT_RAW_BUCKET") {
            cfg.bucket = v;
        }
        if let Ok(v) = std::env::var("REGION") {
            cfg.region = v;
        }
        if let Ok(v) = std::env::var("BLOB_STORE_ROOT") {
            cfg.root = PathBuf::from(v);
        }
        cfg
    }
}

/// PAT transformer configuration.
#[derive(Debug, Clone)]
pub struct PatConfig {
    pub variant: PatVariant,
    pub weights_path: Option<PathBuf>,
    pub allowed_base_dirs: Vec<PathBuf>,
    pub signature_key: Vec<u8>,
}

impl Default for PatConfig {
    fn default() -> Self {
        let models_dir = PathBuf::from("models");
        let cache_dir = default_data_dir().join("pat-cache");
        Self {
            variant: PatVariant::Medium,
            weights_path: None,
            allowed_base_dirs: vec![models_dir, cache_dir, PathBuf::from("/usr/share/clarity-pat")],
            signature_key: b"clarity-pat-default-signing-key".to_vec(),
        }
    }
}

impl PatConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = &FILE_SETTINGS.pat_model_size {
            if let Some(variant) = PatVariant::from_str_lenient(v) {
                cfg.variant = variant;
            }
        }
        if let Some(v) = &FILE_SETTINGS.pat_model_path {
            cfg.weights_path = Some(PathBuf::from(v));
        }
        if let Some(v) = &FILE_SETTINGS.pat_signature_key {
            cfg.signature_key = v.clone().into_bytes();
        }
        if let Ok(v) = std::env::var("PAT_MODEL_SIZE") {
            if let Some(variant) = PatVariant::from_str_lenient(&v) {
                cfg.variant = variant;
            }
        }
        if let Ok(v) = std::env::var("PAT_MODEL_PATH") {
            cfg.weights_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("PAT_SIGNATURE_KEY") {
            cfg.signature_key = v.into_bytes();
        }
        cfg
    }
}

/// Upload control plane configuration.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub max_metrics_per_upload: usize,
    pub job_lease_seconds: u64,
    pub job_timeout_seconds: u64,
    pub max_worker_concurrency: usize,
    pub job_expiry_days: i64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            max_metrics_per_upload: 10_000,
            job_lease_seconds: 600,
            job_timeout_seconds: 300,
            max_worker_concurrency: 4,
            job_expiry_days: 30,
        }
    }
}

impl ControlPlaneConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(n) = FILE_SETTINGS.max_metrics_per_upload {
            cfg.max_metrics_per_upload = n;
        }
        if let Some(n) = FILE_SETTINGS.job_lease_seconds {
            cfg.job_lease_seconds = n;
        }
        if let Some(n) = FILE_SETTINGS.job_timeout_seconds {
            cfg.job_timeout_seconds = n;
        }
        if let Some(n) = FILE_SETTINGS.max_worker_concurrency {
            cfg.max_worker_concurrency = n;
        }
        if let Ok(v) = std::env::var("MAX_METRICS_PER_UPLOAD") {
            if let Ok(n) = v.parse() {
                cfg.max_metrics_per_upload = n;
            }
        }
        if let Ok(v) = std::env::var("JOB_LEASE_SECONDS") {
            if let Ok(n) = v.parse() {
                cfg.job_lease_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("JOB_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse() {
                cfg.job_timeout_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("MAX_WORKER_CONCURRENCY") {
            if let Ok(n) = v.parse() {
                cfg.max_worker_concurrency = n;
            }
        }
        cfg
    }
}

/// In-process read-through cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 300,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = FILE_SETTINGS.enable_caching {
            cfg.enabled = v;
        }
        if let Some(n) = FILE_SETTINGS.cache_ttl_seconds {
            cfg.ttl_seconds = n;
        }
        if let Ok(v) = std::env::var("ENABLE_CACHING") {
            cfg.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("CACHE_TTL_SECONDS") {
            if let Ok(n) = v.parse() {
                cfg.ttl_seconds = n;
            }
        }
        cfg
    }
}

/// HTTP binding configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

impl HttpConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = &FILE_SETTINGS.host {
            cfg.host = v.clone();
        }
        if let Some(n) = FILE_SETTINGS.port {
            cfg.port = n;
        }
        if let Ok(v) = std::env::var("HOST") {
            cfg.host = v;
        }
        if let Ok(v) = std::env::var("PORT") {
            if let Ok(n) = v.parse() {
                cfg.port = n;
            }
        }
        cfg
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Platform-aware default directory for on-disk state: `XDG_DATA_HOME` ->
/// `$HOME/.local/share` -> a dev-local fallback.
fn default_data_dir() -> PathBuf {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(data_home).join("clarity-pat");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".local").join("share").join("clarity-pat");
    }
    PathBuf::from("./data")
}

/// Print help for every recognized environment key, for operators.
pub fn print_env_help() {
    println!(
        r#"
clarity-pat-core Environment Variables
=======================================

REGION                     storage/queue/provider region
HEALTHKIT_RAW_BUCKET       raw blob bucket name
DATA_TABLE_NAME            structured-store root table name
PAT_MODEL_SIZE             small|medium|large
PAT_MODEL_PATH             override weight path (sanitized against an allow-list)
MAX_METRICS_PER_UPLOAD     ceiling (default 10000)
JOB_LEASE_SECONDS          orphan-job reclaim threshold (default 600)
CACHE_TTL_SECONDS          structured-store read cache TTL (default 300)
ENABLE_CACHING             true|false (default true)
DATABASE_URL               sqlite connection string (default sqlite:<data-dir>/clarity-pat.db)
HOST, PORT                 HTTP bind address (default 127.0.0.1:3000)
MAX_WORKER_CONCURRENCY     worker-tier semaphore size (default 4)
JOB_TIMEOUT_SECONDS        per-job wall-clock cap (default 300)
RUST_LOG                   tracing-subscriber env-filter directive
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_config_defaults() {
        let cfg = DatabaseConfig::default();
        assert!(cfg.auto_migrate);
        assert_eq!(cfg.max_connections, 5);
    }

    #[test]
    fn control_plane_config_from_env_overrides_default() {
        std::env::set_var("MAX_METRICS_PER_UPLOAD", "42");
        let cfg = ControlPlaneConfig::from_env();
        assert_eq!(cfg.max_metrics_per_upload, 42);
        std::env::remove_var("MAX_METRICS_PER_UPLOAD");
    }
}
