use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use cabs_types::{Anchor, Blob, Ref, Timestamp};

use crate::context::Context;
use crate::error::{StoreError, StoreResult};

/// An ordered stream of refs produced by [`BlobStore::list_refs`].
pub type RefStream<'a> = BoxStream<'a, StoreResult<Ref>>;

/// An ordered stream of anchor entries produced by [`AnchorStore::list_anchors`].
pub type AnchorStream<'a> = BoxStream<'a, StoreResult<Anchor>>;

/// Content-addressed blob store.
///
/// All implementations must satisfy these invariants:
/// - `get(put(b)) == b`. Blobs are immutable once written and never removed.
/// - `put` is idempotent: the same blob always yields the same ref.
/// - `list_refs` visits every stored ref greater than `start` exactly once,
///   in ascending ref order, absent concurrent writes.
/// - Driver-native errors are translated into [`StoreError`] kinds.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read the blob whose hash is `r`.
    ///
    /// Returns [`StoreError::NotFound`] if it is not stored.
    async fn get(&self, ctx: &Context, r: &Ref) -> StoreResult<Blob>;

    /// Store `blob` if absent and return its ref.
    ///
    /// The flag is `true` iff this call caused the insertion. Under racing
    /// writers more than one caller may observe `false`.
    async fn put(&self, ctx: &Context, blob: Blob) -> StoreResult<(Ref, bool)>;

    /// Stream every stored ref strictly greater than `start`, in ref order.
    ///
    /// Passing [`Ref::zero`] streams everything. The stream is restartable by
    /// calling again with the last ref seen, but it is not a consistent
    /// snapshot against concurrent writes.
    fn list_refs<'a>(&'a self, ctx: &'a Context, start: Ref) -> RefStream<'a>;

    /// The history-per-name anchor capability, if this store has one.
    fn anchors(&self) -> Option<&dyn AnchorStore> {
        None
    }

    /// The map-root anchor capability, if this store has one.
    fn anchor_map(&self) -> Option<&dyn AnchorMapStore> {
        None
    }

    /// Release resources held by the store.
    ///
    /// Plain drivers have nothing to do. Composite stores shut down their
    /// workers and close the stores they wrap.
    async fn close(&self, _ctx: &Context) -> StoreResult<()> {
        Ok(())
    }
}

/// Named, timestamped ref history.
///
/// For each name the store keeps a set of `(at, ref)` entries, unique per
/// `(name, at)`.
#[async_trait]
pub trait AnchorStore: Send + Sync {
    /// The ref of the entry with the greatest `at <= at` for `name`.
    ///
    /// Returns [`StoreError::AnchorNotFound`] if there is none.
    async fn get_anchor(&self, ctx: &Context, name: &str, at: Timestamp) -> StoreResult<Ref>;

    /// Record `(name, at, target)`.
    ///
    /// If an entry for `(name, at)` already exists the call succeeds and the
    /// existing entry is kept.
    async fn put_anchor(
        &self,
        ctx: &Context,
        name: &str,
        target: Ref,
        at: Timestamp,
    ) -> StoreResult<()>;

    /// Stream every entry whose name is strictly greater than `start`,
    /// ordered by name, then by time ascending.
    fn list_anchors<'a>(&'a self, ctx: &'a Context, start: &'a str) -> AnchorStream<'a>;
}

/// A store that keeps its whole anchor collection as one persistent map,
/// addressed by a root ref held in a one-slot register.
///
/// The map itself lives in the store's blobs; see [`crate::anchor_map`] for
/// the read-modify-write helpers and the history view built on top.
#[async_trait]
pub trait AnchorMapStore: BlobStore {
    /// The current root of the anchor map.
    ///
    /// Returns [`StoreError::NoAnchorMap`] if no root has been installed.
    async fn anchor_map_ref(&self, ctx: &Context) -> StoreResult<Ref>;

    /// Install `new` as the root if the current root is `expected`
    /// (`None` meaning no root is installed).
    ///
    /// Returns [`StoreError::Conflict`] when the precondition fails.
    async fn swap_anchor_map_ref(
        &self,
        ctx: &Context,
        expected: Option<Ref>,
        new: Ref,
    ) -> StoreResult<()>;
}

/// Look up an anchor through `store`'s anchor capability.
pub async fn get_anchor(
    store: &dyn BlobStore,
    ctx: &Context,
    name: &str,
    at: Timestamp,
) -> StoreResult<Ref> {
    let anchors = store.anchors().ok_or(StoreError::NotAnchorStore)?;
    anchors.get_anchor(ctx, name, at).await
}

/// Record an anchor through `store`'s anchor capability.
pub async fn put_anchor(
    store: &dyn BlobStore,
    ctx: &Context,
    name: &str,
    target: Ref,
    at: Timestamp,
) -> StoreResult<()> {
    let anchors = store.anchors().ok_or(StoreError::NotAnchorStore)?;
    anchors.put_anchor(ctx, name, target, at).await
}

/// List anchors through `store`'s anchor capability.
///
/// Stores without the capability yield a single `NotAnchorStore` error.
pub fn list_anchors<'a>(
    store: &'a dyn BlobStore,
    ctx: &'a Context,
    start: &'a str,
) -> AnchorStream<'a> {
    match store.anchors() {
        Some(anchors) => anchors.list_anchors(ctx, start),
        None => stream::once(async { Err(StoreError::NotAnchorStore) }).boxed(),
    }
}

#[async_trait]
impl<T: BlobStore + ?Sized> BlobStore for Arc<T> {
    async fn get(&self, ctx: &Context, r: &Ref) -> StoreResult<Blob> {
        (**self).get(ctx, r).await
    }

    async fn put(&self, ctx: &Context, blob: Blob) -> StoreResult<(Ref, bool)> {
        (**self).put(ctx, blob).await
    }

    fn list_refs<'a>(&'a self, ctx: &'a Context, start: Ref) -> RefStream<'a> {
        (**self).list_refs(ctx, start)
    }

    fn anchors(&self) -> Option<&dyn AnchorStore> {
        (**self).anchors()
    }

    fn anchor_map(&self) -> Option<&dyn AnchorMapStore> {
        (**self).anchor_map()
    }

    async fn close(&self, ctx: &Context) -> StoreResult<()> {
        (**self).close(ctx).await
    }
}
