//! Replication across synchronous and asynchronous members.
//!
//! A put writes every synchronous member before returning, then queues the
//! blob for each asynchronous member. Each asynchronous member is fed by its
//! own worker task over a bounded channel; a full channel blocks the put.
//! The first worker failure is latched before the failing worker releases
//! its queue; a supervisor task then stops the other workers. From then on
//! every operation fails with that error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use futures::stream::{self, FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cabs_store::cursor::merge_refs;
use cabs_store::{
    AnchorStore, AnchorStream, BlobStore, Context, RefStream, StoreError, StoreResult,
};
use cabs_types::{Blob, Ref, Timestamp};

/// Default bound of each asynchronous member's queue.
pub const DEFAULT_MAX_QUEUE: usize = 64;

/// Tuning for a [`ReplicaStore`].
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Blobs buffered per asynchronous member before puts block.
    pub max_queue: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            max_queue: DEFAULT_MAX_QUEUE,
        }
    }
}

type Poison = Arc<Mutex<Option<Arc<StoreError>>>>;

/// Record `e` unless an earlier failure is already latched; returns the
/// latched error.
fn latch(poison: &Poison, e: StoreError) -> Arc<StoreError> {
    Arc::clone(poison.lock().get_or_insert_with(|| Arc::new(e)))
}

/// A store replicated over synchronous and asynchronous members.
///
/// Reads race the synchronous members and take the first blob returned.
/// Enumeration merges the synchronous members' ref streams. Asynchronous
/// members receive blobs only; anchors are served by the synchronous
/// members.
pub struct ReplicaStore {
    sync: Vec<Arc<dyn BlobStore>>,
    async_members: Vec<Arc<dyn BlobStore>>,
    queues: Mutex<Vec<mpsc::Sender<Blob>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    poison: Poison,
    closed: AtomicBool,
}

impl ReplicaStore {
    /// Build a replica and start one worker per asynchronous member.
    ///
    /// Workers live until the store is closed or dropped, or until `ctx` is
    /// cancelled. Dropping the store drops the queues, so workers drain what
    /// is buffered and exit. Must be called within a tokio runtime.
    pub fn new(
        ctx: &Context,
        sync: Vec<Arc<dyn BlobStore>>,
        async_members: Vec<Arc<dyn BlobStore>>,
        config: ReplicaConfig,
    ) -> StoreResult<Self> {
        if sync.is_empty() {
            return Err(StoreError::Fatal(
                "replica needs at least one synchronous member".into(),
            ));
        }
        if config.max_queue == 0 {
            return Err(StoreError::Fatal("replica max_queue must be at least 1".into()));
        }

        let workers_ctx = ctx.child();
        let poison: Poison = Arc::new(Mutex::new(None));
        let (err_tx, err_rx) = mpsc::channel(async_members.len().max(1));
        let mut queues = Vec::with_capacity(async_members.len());
        let mut tasks = Vec::with_capacity(async_members.len() + 1);

        for (index, member) in async_members.iter().enumerate() {
            let (tx, rx) = mpsc::channel(config.max_queue);
            queues.push(tx);
            tasks.push(tokio::spawn(run_worker(
                workers_ctx.clone(),
                index,
                Arc::clone(member),
                rx,
                err_tx.clone(),
                Arc::clone(&poison),
            )));
        }
        drop(err_tx);
        tasks.push(tokio::spawn(supervise(
            workers_ctx,
            err_rx,
            Arc::clone(&poison),
        )));

        info!(
            sync = sync.len(),
            r#async = async_members.len(),
            max_queue = config.max_queue,
            "replica store started"
        );
        Ok(Self {
            sync,
            async_members,
            queues: Mutex::new(queues),
            tasks: Mutex::new(tasks),
            poison,
            closed: AtomicBool::new(false),
        })
    }

    /// The latched asynchronous failure, if any.
    pub fn poisoned(&self) -> Option<Arc<StoreError>> {
        self.poison.lock().clone()
    }

    fn check(&self) -> StoreResult<()> {
        if let Some(e) = &*self.poison.lock() {
            return Err(StoreError::Poisoned(Arc::clone(e)));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Fatal("replica store is closed".into()));
        }
        Ok(())
    }

    fn anchor_members(&self) -> impl Iterator<Item = &dyn AnchorStore> {
        self.sync.iter().filter_map(|s| s.anchors())
    }

    fn first_anchor_member(&self) -> StoreResult<&dyn AnchorStore> {
        self.anchor_members().next().ok_or(StoreError::NotAnchorStore)
    }
}

async fn run_worker(
    ctx: Context,
    index: usize,
    member: Arc<dyn BlobStore>,
    mut queue: mpsc::Receiver<Blob>,
    errors: mpsc::Sender<Arc<StoreError>>,
    poison: Poison,
) {
    debug!(worker = index, "replica worker started");
    loop {
        let blob = tokio::select! {
            biased;
            _ = ctx.done() => break,
            next = queue.recv() => match next {
                Some(blob) => blob,
                None => break,
            },
        };
        if let Err(e) = member.put(&ctx, blob).await {
            if !ctx.is_done() {
                warn!(worker = index, error = %e, "asynchronous replica write failed");
                // Latched while `queue` is still open, so a put that finds
                // it closed also finds the poison.
                let e = latch(&poison, e);
                let _ = errors.send(e).await;
            }
            break;
        }
    }
    debug!(worker = index, "replica worker stopped");
}

/// Latch the first worker error and stop the remaining workers.
async fn supervise(ctx: Context, mut errors: mpsc::Receiver<Arc<StoreError>>, poison: Poison) {
    if let Some(e) = errors.recv().await {
        warn!(error = %e, "replica store poisoned");
        poison.lock().get_or_insert(e);
        ctx.cancel();
    }
}

#[async_trait]
impl BlobStore for ReplicaStore {
    async fn get(&self, ctx: &Context, r: &Ref) -> StoreResult<Blob> {
        self.check()?;
        ctx.check()?;
        let mut pending: FuturesUnordered<_> = self.sync.iter().map(|s| s.get(ctx, r)).collect();
        let mut first_err = None;
        while let Some(result) = pending.next().await {
            match result {
                Ok(blob) => return Ok(blob),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        Err(first_err.unwrap_or(StoreError::NotFound(*r)))
    }

    async fn put(&self, ctx: &Context, blob: Blob) -> StoreResult<(Ref, bool)> {
        self.check()?;
        ctx.check()?;
        let results = try_join_all(self.sync.iter().map(|s| s.put(ctx, blob.clone()))).await?;
        let (r, added) = results
            .first()
            .copied()
            .ok_or_else(|| StoreError::Fatal("replica has no synchronous members".into()))?;

        let queues = self.queues.lock().clone();
        for (index, queue) in queues.iter().enumerate() {
            ctx.check()?;
            tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                sent = queue.send(blob.clone()) => {
                    if sent.is_err() {
                        self.check()?;
                        return Err(StoreError::Fatal(format!("replica worker {index} stopped")));
                    }
                }
            }
        }
        Ok((r, added))
    }

    fn list_refs<'a>(&'a self, ctx: &'a Context, start: Ref) -> RefStream<'a> {
        if let Err(e) = self.check() {
            return stream::once(async move { Err(e) }).boxed();
        }
        let streams = self.sync.iter().map(|s| s.list_refs(ctx, start)).collect();
        merge_refs(ctx, streams)
    }

    fn anchors(&self) -> Option<&dyn AnchorStore> {
        self.anchor_members().next()?;
        Some(self)
    }

    /// Stop the workers once their queues drain, then close every member.
    ///
    /// Returns the latched failure if a worker failed.
    async fn close(&self, ctx: &Context) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        drop(std::mem::take(&mut *self.queues.lock()));
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            ctx.run(async move {
                task.await
                    .map_err(|e| StoreError::Fatal(format!("replica task failed: {e}")))
            })
            .await?;
        }
        let mut first_err = None;
        for member in self.sync.iter().chain(self.async_members.iter()) {
            if let Err(e) = member.close(ctx).await {
                first_err.get_or_insert(e);
            }
        }
        if let Some(e) = self.poisoned() {
            return Err(StoreError::Poisoned(e));
        }
        debug!("replica store closed");
        first_err.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl AnchorStore for ReplicaStore {
    async fn get_anchor(&self, ctx: &Context, name: &str, at: Timestamp) -> StoreResult<Ref> {
        self.check()?;
        self.first_anchor_member()?.get_anchor(ctx, name, at).await
    }

    async fn put_anchor(
        &self,
        ctx: &Context,
        name: &str,
        target: Ref,
        at: Timestamp,
    ) -> StoreResult<()> {
        self.check()?;
        self.first_anchor_member()?;
        try_join_all(
            self.anchor_members()
                .map(|a| a.put_anchor(ctx, name, target, at)),
        )
        .await?;
        Ok(())
    }

    fn list_anchors<'a>(&'a self, ctx: &'a Context, start: &'a str) -> AnchorStream<'a> {
        match self.check().and_then(|_| self.first_anchor_member()) {
            Ok(anchors) => anchors.list_anchors(ctx, start),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cabs_store::cursor::collect_refs;
    use cabs_store::{ErrorKind, MemStore};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn set(words: &[&str]) -> BTreeSet<Ref> {
        words.iter().map(|w| Ref::of(w.as_bytes())).collect()
    }

    async fn ref_set(store: &dyn BlobStore) -> BTreeSet<Ref> {
        let ctx = Context::background();
        collect_refs(store.list_refs(&ctx, Ref::zero()))
            .await
            .unwrap()
            .into_iter()
            .collect()
    }

    /// Accepts reads, rejects every write.
    struct BrokenStore;

    #[async_trait]
    impl BlobStore for BrokenStore {
        async fn get(&self, _ctx: &Context, r: &Ref) -> StoreResult<Blob> {
            Err(StoreError::NotFound(*r))
        }

        async fn put(&self, _ctx: &Context, _blob: Blob) -> StoreResult<(Ref, bool)> {
            Err(StoreError::Fatal("disk on fire".into()))
        }

        fn list_refs<'a>(&'a self, _ctx: &'a Context, _start: Ref) -> RefStream<'a> {
            stream::empty().boxed()
        }
    }

    /// Writes that never finish.
    struct StuckStore;

    #[async_trait]
    impl BlobStore for StuckStore {
        async fn get(&self, _ctx: &Context, r: &Ref) -> StoreResult<Blob> {
            Err(StoreError::NotFound(*r))
        }

        async fn put(&self, ctx: &Context, _blob: Blob) -> StoreResult<(Ref, bool)> {
            Err(ctx.done().await)
        }

        fn list_refs<'a>(&'a self, _ctx: &'a Context, _start: Ref) -> RefStream<'a> {
            stream::empty().boxed()
        }
    }

    #[tokio::test]
    async fn fan_in_over_sync_members() {
        let ctx = Context::background();
        let m1 = Arc::new(MemStore::new());
        let m2 = Arc::new(MemStore::new());
        m1.put(&ctx, Blob::from_static(b"foo")).await.unwrap();
        m2.put(&ctx, Blob::from_static(b"bar")).await.unwrap();

        let replica = ReplicaStore::new(
            &ctx,
            vec![m1.clone(), m2.clone()],
            Vec::new(),
            ReplicaConfig::default(),
        )
        .unwrap();
        replica.put(&ctx, Blob::from_static(b"baz")).await.unwrap();

        assert_eq!(ref_set(&replica).await, set(&["foo", "bar", "baz"]));
        assert_eq!(ref_set(m1.as_ref()).await, set(&["foo", "baz"]));
        assert_eq!(ref_set(m2.as_ref()).await, set(&["bar", "baz"]));

        let listed = collect_refs(replica.list_refs(&ctx, Ref::zero())).await.unwrap();
        assert!(listed.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn get_takes_any_member() {
        let ctx = Context::background();
        let m1 = Arc::new(MemStore::new());
        let m2 = Arc::new(MemStore::new());
        let (r, _) = m2.put(&ctx, Blob::from_static(b"only here")).await.unwrap();
        let replica =
            ReplicaStore::new(&ctx, vec![m1, m2], Vec::new(), ReplicaConfig::default()).unwrap();
        assert_eq!(replica.get(&ctx, &r).await.unwrap(), Blob::from_static(b"only here"));
        assert!(replica
            .get(&ctx, &Ref::of(b"nowhere"))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn async_members_catch_up_by_close() {
        let ctx = Context::background();
        let primary = Arc::new(MemStore::new());
        let mirror = Arc::new(MemStore::new());
        let replica = ReplicaStore::new(
            &ctx,
            vec![primary.clone()],
            vec![mirror.clone()],
            ReplicaConfig { max_queue: 2 },
        )
        .unwrap();
        for w in ["abc", "def", "ghi", "jkl", "mno"] {
            replica.put(&ctx, Blob::from(w)).await.unwrap();
        }
        replica.close(&ctx).await.unwrap();
        assert_eq!(ref_set(mirror.as_ref()).await, ref_set(primary.as_ref()).await);
        assert!(replica.put(&ctx, Blob::from_static(b"late")).await.is_err());
    }

    #[tokio::test]
    async fn async_failure_is_sticky() {
        let ctx = Context::background();
        let primary = Arc::new(MemStore::new());
        let replica = ReplicaStore::new(
            &ctx,
            vec![primary.clone()],
            vec![Arc::new(BrokenStore)],
            ReplicaConfig::default(),
        )
        .unwrap();
        let (r, _) = replica.put(&ctx, Blob::from_static(b"x")).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while replica.poisoned().is_none() {
            assert!(tokio::time::Instant::now() < deadline, "replica never poisoned");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = replica.get(&ctx, &r).await.unwrap_err();
        assert!(matches!(err, StoreError::Poisoned(_)));
        assert!(err.to_string().contains("disk on fire"));
        assert!(replica.put(&ctx, Blob::from_static(b"y")).await.is_err());
        assert!(collect_refs(replica.list_refs(&ctx, Ref::zero())).await.is_err());
        assert!(replica.close(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn put_after_worker_death_is_poisoned() {
        let ctx = Context::background();
        let replica = ReplicaStore::new(
            &ctx,
            vec![Arc::new(MemStore::new())],
            vec![Arc::new(BrokenStore)],
            ReplicaConfig { max_queue: 1 },
        )
        .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut i = 0u32;
        let err = loop {
            match replica.put(&ctx, Blob::from(i.to_be_bytes().to_vec())).await {
                Ok(_) => {
                    assert!(tokio::time::Instant::now() < deadline, "puts never failed");
                    tokio::task::yield_now().await;
                    i += 1;
                }
                Err(e) => break e,
            }
        };
        assert!(matches!(err, StoreError::Poisoned(_)), "{err}");
        assert!(err.to_string().contains("disk on fire"));
    }

    #[tokio::test]
    async fn full_queue_blocks_until_cancelled() {
        let ctx = Context::background();
        let replica = ReplicaStore::new(
            &ctx,
            vec![Arc::new(MemStore::new())],
            vec![Arc::new(StuckStore)],
            ReplicaConfig { max_queue: 1 },
        )
        .unwrap();
        let put_ctx = ctx.with_timeout(Duration::from_millis(100));
        let mut outcome = Ok((Ref::zero(), false));
        for i in 0..4u8 {
            outcome = replica.put(&put_ctx, Blob::from(vec![i])).await;
            if outcome.is_err() {
                break;
            }
        }
        let err = outcome.unwrap_err();
        assert!(err.is(ErrorKind::Cancelled));
        ctx.cancel();
    }

    #[tokio::test]
    async fn anchors_go_to_sync_members() {
        let ctx = Context::background();
        let m1 = Arc::new(MemStore::new());
        let m2 = Arc::new(MemStore::new());
        let replica = ReplicaStore::new(
            &ctx,
            vec![m1.clone(), m2.clone()],
            Vec::new(),
            ReplicaConfig::default(),
        )
        .unwrap();
        let t = cabs_types::parse_timestamp("2020-01-01T00:00:00Z").unwrap();
        let r = Ref::of(b"target");
        cabs_store::put_anchor(&replica, &ctx, "name", r, t).await.unwrap();
        assert_eq!(m1.get_anchor(&ctx, "name", t).await.unwrap(), r);
        assert_eq!(m2.get_anchor(&ctx, "name", t).await.unwrap(), r);
        assert_eq!(cabs_store::get_anchor(&replica, &ctx, "name", t).await.unwrap(), r);
    }

    #[tokio::test]
    async fn rejects_bad_configuration() {
        let ctx = Context::background();
        assert!(ReplicaStore::new(&ctx, Vec::new(), Vec::new(), ReplicaConfig::default()).is_err());
        assert!(ReplicaStore::new(
            &ctx,
            vec![Arc::new(MemStore::new())],
            Vec::new(),
            ReplicaConfig { max_queue: 0 },
        )
        .is_err());
    }
}
