//! LRU cache layer in front of any store.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use cabs_store::{AnchorMapStore, AnchorStore, BlobStore, Context, RefStream, StoreResult};
use cabs_types::{Blob, Ref};

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads answered from the cache.
    pub hits: u64,
    /// Reads that fell through to the nested store.
    pub misses: u64,
    /// Blobs currently cached.
    pub len: usize,
}

/// A store with a fixed-capacity, least-recently-used blob cache.
///
/// Reads consult the cache first and populate it on a miss. Writes pass
/// through and, once they succeed, populate the cache. Enumeration and
/// anchors go straight to the nested store.
pub struct LruStore {
    nested: Arc<dyn BlobStore>,
    cache: Mutex<LruCache<Ref, Blob>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LruStore {
    /// Cache up to `size` blobs in front of `nested`.
    pub fn new(nested: Arc<dyn BlobStore>, size: NonZeroUsize) -> Self {
        Self {
            nested,
            cache: Mutex::new(LruCache::new(size)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len: self.cache.lock().len(),
        }
    }
}

#[async_trait]
impl BlobStore for LruStore {
    async fn get(&self, ctx: &Context, r: &Ref) -> StoreResult<Blob> {
        let cached = self.cache.lock().get(r).cloned();
        if let Some(blob) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(blob);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let blob = self.nested.get(ctx, r).await?;
        self.cache.lock().put(*r, blob.clone());
        Ok(blob)
    }

    async fn put(&self, ctx: &Context, blob: Blob) -> StoreResult<(Ref, bool)> {
        let (r, added) = self.nested.put(ctx, blob.clone()).await?;
        self.cache.lock().put(r, blob);
        Ok((r, added))
    }

    fn list_refs<'a>(&'a self, ctx: &'a Context, start: Ref) -> RefStream<'a> {
        self.nested.list_refs(ctx, start)
    }

    fn anchors(&self) -> Option<&dyn AnchorStore> {
        self.nested.anchors()
    }

    fn anchor_map(&self) -> Option<&dyn AnchorMapStore> {
        self.nested.anchor_map()
    }

    async fn close(&self, ctx: &Context) -> StoreResult<()> {
        self.cache.lock().clear();
        self.nested.close(ctx).await
    }
}
