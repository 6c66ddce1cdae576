//! Built-in store types and their configuration documents.
//!
//! Options beyond the ones listed on each config struct are ignored, as is
//! the `type` field itself.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use cabs_backend::{BucketStore, FileStore, MemBucket, SqliteStore};
use cabs_compose::{
    LoggingStore, LruStore, ReplicaConfig, ReplicaStore, TransformStore, ZstdCodec,
    DEFAULT_ANCHOR, DEFAULT_LEVEL, DEFAULT_MAX_QUEUE,
};
use cabs_store::{BlobStore, Context, MemStore};

use crate::error::{RegistryError, RegistryResult};
use crate::registry::{Registry, StoreFactory};

fn decode<T: DeserializeOwned>(kind: &str, config: &Value) -> RegistryResult<T> {
    T::deserialize(config).map_err(|e| RegistryError::invalid(kind, e))
}

fn positive(kind: &str, field: &str, value: u64) -> RegistryResult<NonZeroUsize> {
    usize::try_from(value)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| RegistryError::invalid(kind, format!("{field} must be a positive integer")))
}

/// `{"type": "file", "root": "<dir>"}`
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    pub root: PathBuf,
}

/// `{"type": "sqlite", "path": "<file>"}`; `":memory:"` opens a private
/// in-memory database.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    pub path: PathBuf,
}

/// `{"type": "replica", "sync": [...], "async": [...], "max_queue": n}`
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaSettings {
    pub sync: Vec<Value>,
    #[serde(rename = "async", default)]
    pub async_members: Vec<Value>,
    #[serde(default = "default_max_queue")]
    pub max_queue: u64,
}

fn default_max_queue() -> u64 {
    DEFAULT_MAX_QUEUE as u64
}

/// `{"type": "lru", "nested": {...}, "size": n}`
#[derive(Debug, Clone, Deserialize)]
pub struct LruConfig {
    pub nested: Value,
    pub size: u64,
}

/// `{"type": "transform", "nested": {...}, "anchor": "<name>", "level": n}`
#[derive(Debug, Clone, Deserialize)]
pub struct TransformConfig {
    pub nested: Value,
    #[serde(default = "default_anchor")]
    pub anchor: String,
    #[serde(default = "default_level")]
    pub level: u32,
}

fn default_anchor() -> String {
    DEFAULT_ANCHOR.to_string()
}

fn default_level() -> u32 {
    DEFAULT_LEVEL as u32
}

/// zstd's strongest standard level.
const MAX_LEVEL: u32 = 22;

/// `{"type": "logging", "nested": {...}, "label": "<text>"}`
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub nested: Value,
    #[serde(default)]
    pub label: Option<String>,
}

pub struct MemFactory;

#[async_trait]
impl StoreFactory for MemFactory {
    async fn open(
        &self,
        _registry: &Registry,
        _ctx: &Context,
        _config: &Value,
    ) -> RegistryResult<Arc<dyn BlobStore>> {
        Ok(Arc::new(MemStore::new()))
    }
}

pub struct FileFactory;

#[async_trait]
impl StoreFactory for FileFactory {
    async fn open(
        &self,
        _registry: &Registry,
        _ctx: &Context,
        config: &Value,
    ) -> RegistryResult<Arc<dyn BlobStore>> {
        let config: FileConfig = decode("file", config)?;
        Ok(Arc::new(FileStore::open(&config.root)?))
    }
}

pub struct SqliteFactory;

#[async_trait]
impl StoreFactory for SqliteFactory {
    async fn open(
        &self,
        _registry: &Registry,
        _ctx: &Context,
        config: &Value,
    ) -> RegistryResult<Arc<dyn BlobStore>> {
        let config: SqliteConfig = decode("sqlite", config)?;
        Ok(Arc::new(SqliteStore::open(&config.path)?))
    }
}

pub struct MemBucketFactory;

#[async_trait]
impl StoreFactory for MemBucketFactory {
    async fn open(
        &self,
        _registry: &Registry,
        _ctx: &Context,
        _config: &Value,
    ) -> RegistryResult<Arc<dyn BlobStore>> {
        Ok(Arc::new(BucketStore::new(MemBucket::new())))
    }
}

pub struct ReplicaFactory;

#[async_trait]
impl StoreFactory for ReplicaFactory {
    async fn open(
        &self,
        registry: &Registry,
        ctx: &Context,
        config: &Value,
    ) -> RegistryResult<Arc<dyn BlobStore>> {
        let config: ReplicaSettings = decode("replica", config)?;
        if config.sync.is_empty() {
            return Err(RegistryError::invalid(
                "replica",
                "sync must list at least one store",
            ));
        }
        let max_queue = positive("replica", "max_queue", config.max_queue)?.get();

        let mut sync = Vec::with_capacity(config.sync.len());
        for member in &config.sync {
            sync.push(registry.open(ctx, member).await?);
        }
        let mut async_members = Vec::with_capacity(config.async_members.len());
        for member in &config.async_members {
            async_members.push(registry.open(ctx, member).await?);
        }
        let store = ReplicaStore::new(ctx, sync, async_members, ReplicaConfig { max_queue })?;
        Ok(Arc::new(store))
    }
}

pub struct LruFactory;

#[async_trait]
impl StoreFactory for LruFactory {
    async fn open(
        &self,
        registry: &Registry,
        ctx: &Context,
        config: &Value,
    ) -> RegistryResult<Arc<dyn BlobStore>> {
        let config: LruConfig = decode("lru", config)?;
        let size = positive("lru", "size", config.size)?;
        let nested = registry.open(ctx, &config.nested).await?;
        Ok(Arc::new(LruStore::new(nested, size)))
    }
}

pub struct TransformFactory;

#[async_trait]
impl StoreFactory for TransformFactory {
    async fn open(
        &self,
        registry: &Registry,
        ctx: &Context,
        config: &Value,
    ) -> RegistryResult<Arc<dyn BlobStore>> {
        let config: TransformConfig = decode("transform", config)?;
        if !(1..=MAX_LEVEL).contains(&config.level) {
            return Err(RegistryError::invalid(
                "transform",
                format!("level must be between 1 and {MAX_LEVEL}"),
            ));
        }
        if config.anchor.is_empty() {
            return Err(RegistryError::invalid("transform", "anchor must not be empty"));
        }
        let nested = registry.open(ctx, &config.nested).await?;
        let codec = ZstdCodec::new(config.level as i32);
        Ok(Arc::new(TransformStore::new(
            nested,
            Box::new(codec),
            config.anchor,
        )?))
    }
}

pub struct LoggingFactory;

#[async_trait]
impl StoreFactory for LoggingFactory {
    async fn open(
        &self,
        registry: &Registry,
        ctx: &Context,
        config: &Value,
    ) -> RegistryResult<Arc<dyn BlobStore>> {
        let config: LoggingConfig = decode("logging", config)?;
        let label = match config.label {
            Some(label) => label,
            None => config
                .nested
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("store")
                .to_string(),
        };
        let nested = registry.open(ctx, &config.nested).await?;
        Ok(Arc::new(LoggingStore::new(nested, label)))
    }
}
