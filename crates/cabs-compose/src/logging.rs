//! A pass-through store that traces every contract operation.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use tracing::debug;

use cabs_store::{
    AnchorMapStore, AnchorStore, AnchorStream, BlobStore, Context, RefStream, StoreError,
    StoreResult,
};
use cabs_types::{Blob, Ref, Timestamp};

/// Emits one `debug!` event per operation, tagged with `label`, then
/// forwards to the nested store. Capabilities mirror the nested store's.
pub struct LoggingStore {
    nested: Arc<dyn BlobStore>,
    label: String,
}

impl LoggingStore {
    pub fn new(nested: Arc<dyn BlobStore>, label: impl Into<String>) -> Self {
        Self {
            nested,
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn nested_anchors(&self) -> StoreResult<&dyn AnchorStore> {
        self.nested.anchors().ok_or(StoreError::NotAnchorStore)
    }

    fn nested_map(&self) -> StoreResult<&dyn AnchorMapStore> {
        self.nested.anchor_map().ok_or(StoreError::NotAnchorStore)
    }
}

fn outcome<T>(result: &StoreResult<T>) -> String {
    match result {
        Ok(_) => "ok".to_string(),
        Err(e) => e.to_string(),
    }
}

#[async_trait]
impl BlobStore for LoggingStore {
    async fn get(&self, ctx: &Context, r: &Ref) -> StoreResult<Blob> {
        let result = self.nested.get(ctx, r).await;
        debug!(
            label = %self.label,
            r = %r,
            size = result.as_ref().map(|b| b.len()).unwrap_or(0),
            outcome = %outcome(&result),
            "get"
        );
        result
    }

    async fn put(&self, ctx: &Context, blob: Blob) -> StoreResult<(Ref, bool)> {
        let size = blob.len();
        let result = self.nested.put(ctx, blob).await;
        match &result {
            Ok((r, added)) => debug!(label = %self.label, r = %r, size, added, "put"),
            Err(e) => debug!(label = %self.label, size, error = %e, "put"),
        }
        result
    }

    fn list_refs<'a>(&'a self, ctx: &'a Context, start: Ref) -> RefStream<'a> {
        debug!(label = %self.label, start = %start, "list_refs");
        self.nested
            .list_refs(ctx, start)
            .inspect_err(move |e| debug!(label = %self.label, error = %e, "list_refs failed"))
            .boxed()
    }

    fn anchors(&self) -> Option<&dyn AnchorStore> {
        self.nested.anchors().map(|_| self as &dyn AnchorStore)
    }

    fn anchor_map(&self) -> Option<&dyn AnchorMapStore> {
        self.nested.anchor_map().map(|_| self as &dyn AnchorMapStore)
    }

    async fn close(&self, ctx: &Context) -> StoreResult<()> {
        let result = self.nested.close(ctx).await;
        debug!(label = %self.label, outcome = %outcome(&result), "close");
        result
    }
}

#[async_trait]
impl AnchorStore for LoggingStore {
    async fn get_anchor(&self, ctx: &Context, name: &str, at: Timestamp) -> StoreResult<Ref> {
        let result = self.nested_anchors()?.get_anchor(ctx, name, at).await;
        debug!(
            label = %self.label,
            name,
            at = %at.to_rfc3339(),
            outcome = %outcome(&result),
            "get_anchor"
        );
        result
    }

    async fn put_anchor(
        &self,
        ctx: &Context,
        name: &str,
        target: Ref,
        at: Timestamp,
    ) -> StoreResult<()> {
        let result = self
            .nested_anchors()?
            .put_anchor(ctx, name, target, at)
            .await;
        debug!(
            label = %self.label,
            name,
            target = %target,
            at = %at.to_rfc3339(),
            outcome = %outcome(&result),
            "put_anchor"
        );
        result
    }

    fn list_anchors<'a>(&'a self, ctx: &'a Context, start: &'a str) -> AnchorStream<'a> {
        debug!(label = %self.label, start, "list_anchors");
        cabs_store::list_anchors(self.nested.as_ref(), ctx, start)
            .inspect_err(move |e| debug!(label = %self.label, error = %e, "list_anchors failed"))
            .boxed()
    }
}

#[async_trait]
impl AnchorMapStore for LoggingStore {
    async fn anchor_map_ref(&self, ctx: &Context) -> StoreResult<Ref> {
        let result = self.nested_map()?.anchor_map_ref(ctx).await;
        debug!(label = %self.label, outcome = %outcome(&result), "anchor_map_ref");
        result
    }

    async fn swap_anchor_map_ref(
        &self,
        ctx: &Context,
        expected: Option<Ref>,
        new: Ref,
    ) -> StoreResult<()> {
        let result = self
            .nested_map()?
            .swap_anchor_map_ref(ctx, expected, new)
            .await;
        debug!(
            label = %self.label,
            new = %new,
            outcome = %outcome(&result),
            "swap_anchor_map_ref"
        );
        result
    }
}
