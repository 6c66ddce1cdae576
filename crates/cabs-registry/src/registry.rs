use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tracing::debug;

use cabs_store::{BlobStore, Context};

use crate::error::{RegistryError, RegistryResult};
use crate::factories;

/// Builds a store from its configuration document.
///
/// Composite factories open their nested configurations through the
/// `registry` they are handed, so a stack of stores is described by one
/// nested document.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn open(
        &self,
        registry: &Registry,
        ctx: &Context,
        config: &Value,
    ) -> RegistryResult<Arc<dyn BlobStore>>;
}

/// Maps store type names to factories.
#[derive(Default, Clone)]
pub struct Registry {
    factories: HashMap<String, Arc<dyn StoreFactory>>,
}

impl Registry {
    /// A registry with no types.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in store type.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register("mem", factories::MemFactory)
            .register("file", factories::FileFactory)
            .register("sqlite", factories::SqliteFactory)
            .register("membucket", factories::MemBucketFactory)
            .register("replica", factories::ReplicaFactory)
            .register("lru", factories::LruFactory)
            .register("transform", factories::TransformFactory)
            .register("logging", factories::LoggingFactory);
        registry
    }

    /// Register `factory` under `kind`, replacing any previous factory.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        factory: impl StoreFactory + 'static,
    ) -> &mut Self {
        self.factories.insert(kind.into(), Arc::new(factory));
        self
    }

    /// Registered type names, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Open the store described by `config`, dispatching on its `type`.
    pub fn open<'a>(
        &'a self,
        ctx: &'a Context,
        config: &'a Value,
    ) -> BoxFuture<'a, RegistryResult<Arc<dyn BlobStore>>> {
        async move {
            let kind = match config.get("type") {
                None => return Err(RegistryError::MissingType),
                Some(Value::String(kind)) => kind.as_str(),
                Some(_) => return Err(RegistryError::invalid("store", "\"type\" must be a string")),
            };
            let factory = self
                .factories
                .get(kind)
                .ok_or_else(|| RegistryError::UnknownType(kind.to_string()))?;
            debug!(kind, "opening store");
            factory.open(self, ctx, config).await
        }
        .boxed()
    }

    /// Parse `text` as a configuration document and open it.
    pub async fn open_json(&self, ctx: &Context, text: &str) -> RegistryResult<Arc<dyn BlobStore>> {
        let config: Value = serde_json::from_str(text)?;
        self.open(ctx, &config).await
    }
}

static DEFAULT: OnceLock<Registry> = OnceLock::new();

/// The process-wide registry.
///
/// Holds the built-in types unless [`install_default`] ran first.
pub fn default_registry() -> &'static Registry {
    DEFAULT.get_or_init(Registry::with_defaults)
}

/// Make `registry` the process-wide registry.
///
/// Only the first call before any use of [`default_registry`] succeeds; the
/// registry is read-only afterwards. A rejected registry is handed back.
pub fn install_default(registry: Registry) -> Result<(), Registry> {
    DEFAULT.set(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cabs_store::MemStore;
    use cabs_types::{Blob, Ref};
    use serde_json::json;

    #[tokio::test]
    async fn dispatches_on_type() {
        let ctx = Context::background();
        let store = Registry::with_defaults()
            .open(&ctx, &json!({"type": "mem"}))
            .await
            .unwrap();
        let (r, _) = store.put(&ctx, Blob::from_static(b"hi")).await.unwrap();
        assert_eq!(r, Ref::of(b"hi"));
    }

    #[tokio::test]
    async fn type_errors_are_config_errors() {
        let ctx = Context::background();
        let registry = Registry::with_defaults();

        let err = registry.open(&ctx, &json!({})).await.err().unwrap();
        assert!(matches!(err, RegistryError::MissingType));
        assert!(err.is_config());

        let err = registry.open(&ctx, &json!({"type": "tape"})).await.err().unwrap();
        assert!(matches!(err, RegistryError::UnknownType(ref k) if k == "tape"));

        let err = registry.open(&ctx, &json!({"type": 7})).await.err().unwrap();
        assert!(matches!(err, RegistryError::InvalidConfig { .. }));

        let err = registry.open_json(&ctx, "{not json").await.err().unwrap();
        assert!(matches!(err, RegistryError::Json(_)));
        assert!(err.is_config());
    }

    struct Fixed(Arc<MemStore>);

    #[async_trait]
    impl StoreFactory for Fixed {
        async fn open(
            &self,
            _registry: &Registry,
            _ctx: &Context,
            _config: &Value,
        ) -> RegistryResult<Arc<dyn BlobStore>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn custom_factories_compose_with_builtins() {
        let ctx = Context::background();
        let shared = Arc::new(MemStore::new());
        let mut registry = Registry::with_defaults();
        registry.register("shared", Fixed(shared.clone()));
        assert!(registry.kinds().contains(&"shared"));

        let store = registry
            .open(&ctx, &json!({"type": "logging", "nested": {"type": "shared"}}))
            .await
            .unwrap();
        store.put(&ctx, Blob::from_static(b"through")).await.unwrap();
        assert_eq!(shared.len(), 1);
    }

    #[test]
    fn defaults_are_all_registered() {
        assert_eq!(
            Registry::with_defaults().kinds(),
            vec!["file", "logging", "lru", "mem", "membucket", "replica", "sqlite", "transform"]
        );
        assert!(default_registry().kinds().contains(&"mem"));
    }
}
