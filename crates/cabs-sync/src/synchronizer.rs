use std::sync::Arc;

use futures::future::try_join_all;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use tracing::{debug, info};

use cabs_store::{AnchorStore, BlobStore, Context, StoreError, StoreResult};
use cabs_types::{Ref, Timestamp};

use crate::error::{SyncError, SyncResult};
use crate::types::SyncReport;

type KeyedStream<'a, K, V> = BoxStream<'a, StoreResult<(K, V)>>;

/// The current head of every enumeration in a k-way merge.
struct Frontier<'a, K, V> {
    streams: Vec<KeyedStream<'a, K, V>>,
    heads: Vec<Option<(K, V)>>,
}

/// The least head and the indexes of the streams positioned on it.
struct Step<K, V> {
    key: K,
    value: V,
    havers: Vec<usize>,
    needers: Vec<usize>,
}

impl<'a, K: Ord + Clone, V: Clone> Frontier<'a, K, V> {
    async fn start(streams: Vec<KeyedStream<'a, K, V>>) -> StoreResult<Self> {
        let mut frontier = Self {
            heads: streams.iter().map(|_| None).collect(),
            streams,
        };
        let all: Vec<usize> = (0..frontier.streams.len()).collect();
        frontier.advance(&all).await?;
        Ok(frontier)
    }

    fn least(&self) -> Option<Step<K, V>> {
        let (key, value) = self.heads.iter().flatten().min_by(|a, b| a.0.cmp(&b.0))?.clone();
        let (havers, needers): (Vec<usize>, Vec<usize>) = (0..self.heads.len())
            .partition(|&i| matches!(&self.heads[i], Some((k, _)) if *k == key));
        Some(Step {
            key,
            value,
            havers,
            needers,
        })
    }

    async fn advance(&mut self, which: &[usize]) -> StoreResult<()> {
        let advancing = self
            .streams
            .iter_mut()
            .zip(self.heads.iter_mut())
            .enumerate()
            .filter(|(i, _)| which.contains(i))
            .map(|(_, (stream, head))| async move {
                *head = stream.try_next().await?;
                Ok::<_, StoreError>(())
            });
        try_join_all(advancing).await?;
        Ok(())
    }
}

/// Bring `stores` to the same set of refs.
///
/// Each ref missing from some store is read from the first store that has
/// it and written to every store that lacks it.
pub async fn sync_stores(ctx: &Context, stores: &[Arc<dyn BlobStore>]) -> SyncResult<SyncReport> {
    if stores.len() < 2 {
        return Err(SyncError::TooFewStores(stores.len()));
    }
    let streams = stores
        .iter()
        .map(|s| s.list_refs(ctx, Ref::zero()).map_ok(|r| (r, ())).boxed())
        .collect();
    let mut frontier = Frontier::start(streams).await?;
    let mut report = SyncReport::new(stores.len());

    while let Some(step) = frontier.least() {
        ctx.check()?;
        report.refs += 1;
        if !step.needers.is_empty() {
            let blob = stores[step.havers[0]].get(ctx, &step.key).await?;
            let puts = step
                .needers
                .iter()
                .map(|&i| stores[i].put(ctx, blob.clone()));
            try_join_all(puts).await?;
            for &i in &step.needers {
                report.stores[i].refs_copied += 1;
            }
            debug!(r = %step.key, from = step.havers[0], to = ?step.needers, "ref copied");
        }
        frontier.advance(&step.havers).await?;
    }

    info!(
        stores = stores.len(),
        refs = report.refs,
        copied = report.refs_copied(),
        "refs synchronized"
    );
    Ok(report)
}

/// Bring `stores` to the same set of anchor entries.
///
/// Entries are matched by `(name, at)`. Every store must have the anchor
/// capability.
pub async fn sync_anchors(
    ctx: &Context,
    stores: &[Arc<dyn BlobStore>],
) -> SyncResult<SyncReport> {
    if stores.len() < 2 {
        return Err(SyncError::TooFewStores(stores.len()));
    }
    let anchors: Vec<&dyn AnchorStore> = stores
        .iter()
        .enumerate()
        .map(|(index, s)| s.anchors().ok_or(SyncError::NotAnchorStore { index }))
        .collect::<SyncResult<_>>()?;
    let streams = anchors
        .iter()
        .map(|a| {
            a.list_anchors(ctx, "")
                .map_ok(|anchor| ((anchor.name, anchor.at), anchor.target))
                .boxed()
        })
        .collect();
    let mut frontier: Frontier<'_, (String, Timestamp), Ref> = Frontier::start(streams).await?;
    let mut report = SyncReport::new(stores.len());

    while let Some(step) = frontier.least() {
        ctx.check()?;
        report.anchors += 1;
        let (name, at) = &step.key;
        if !step.needers.is_empty() {
            let puts = step
                .needers
                .iter()
                .map(|&i| anchors[i].put_anchor(ctx, name, step.value, *at));
            try_join_all(puts).await?;
            for &i in &step.needers {
                report.stores[i].anchors_copied += 1;
            }
            debug!(name = %name, at = %at.to_rfc3339(), to = ?step.needers, "anchor copied");
        }
        frontier.advance(&step.havers).await?;
    }

    info!(
        stores = stores.len(),
        anchors = report.anchors,
        copied = report.anchors_copied(),
        "anchors synchronized"
    );
    Ok(report)
}

/// [`sync_stores`], then [`sync_anchors`] when every store has anchors.
pub async fn sync_all(ctx: &Context, stores: &[Arc<dyn BlobStore>]) -> SyncResult<SyncReport> {
    let mut report = sync_stores(ctx, stores).await?;
    if stores.iter().all(|s| s.anchors().is_some()) {
        report.absorb(sync_anchors(ctx, stores).await?);
    }
    Ok(report)
}
