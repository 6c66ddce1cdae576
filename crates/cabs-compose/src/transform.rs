//! Transparent blob transformation (compression) over an anchor store.
//!
//! Each blob is encoded and stored under the hash of its encoded body. A
//! persistent map from original ref to storage ref is kept in the nested
//! store itself; its root is the target of a designated anchor. The newest
//! entry of that anchor is the current map.
//!
//! # Invariants
//!
//! - When encoding does not shrink a blob, the blob is stored unchanged and
//!   its storage ref equals its original ref.
//! - Reads verify that the decoded body hashes to the requested ref.
//! - Updates to the map are serialized by one async mutex, held across the
//!   nested store I/O of the update.
//! - A new root is stamped strictly after the newest entry of the anchor,
//!   whoever wrote it, and a put only reports success once its root is the
//!   one lookups resolve to.
//! - On map-root stores the anchor's older entries are dropped as each new
//!   root lands; history stores keep them.

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::Duration;
use futures::TryStreamExt;
use tokio::sync::Mutex;
use tracing::debug;

use cabs_store::{
    anchor_map, get_anchor, pmap, AnchorStore, AnchorStream, BlobStore, Context, RefStream,
    StoreError, StoreResult,
};
use cabs_types::{max_time, time, Blob, Ref, Timestamp};

/// Anchor holding the refs-map root when none is configured.
pub const DEFAULT_ANCHOR: &str = "cabs:transform-refs";

/// Default zstd compression level.
pub const DEFAULT_LEVEL: i32 = 3;

/// A reversible transformation of blob bodies.
pub trait Codec: Send + Sync {
    fn encode(&self, data: &[u8]) -> StoreResult<Vec<u8>>;
    fn decode(&self, data: &[u8]) -> StoreResult<Vec<u8>>;
    fn name(&self) -> &'static str;
}

/// zstd compression.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self::new(DEFAULT_LEVEL)
    }
}

impl Codec for ZstdCodec {
    fn encode(&self, data: &[u8]) -> StoreResult<Vec<u8>> {
        zstd::encode_all(data, self.level)
            .map_err(|e| StoreError::Fatal(format!("zstd encode: {e}")))
    }

    fn decode(&self, data: &[u8]) -> StoreResult<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| StoreError::Fatal(format!("zstd decode: {e}")))
    }

    fn name(&self) -> &'static str {
        "zstd"
    }
}

/// Newest refs-map entry this store has written or observed.
#[derive(Default)]
struct Writer {
    last: Option<(Timestamp, Ref)>,
}

/// A store that encodes blobs before handing them to a nested anchor store.
pub struct TransformStore {
    nested: Arc<dyn BlobStore>,
    codec: Box<dyn Codec>,
    anchor: String,
    writer: Mutex<Writer>,
}

impl TransformStore {
    /// Wrap `nested`, keeping the refs-map root under `anchor`.
    ///
    /// Fails with [`StoreError::NotAnchorStore`] if `nested` has no anchor
    /// capability. The anchor name must not be empty, since an empty name
    /// is never listed.
    pub fn new(
        nested: Arc<dyn BlobStore>,
        codec: Box<dyn Codec>,
        anchor: impl Into<String>,
    ) -> StoreResult<Self> {
        if nested.anchors().is_none() {
            return Err(StoreError::NotAnchorStore);
        }
        let anchor = anchor.into();
        if anchor.is_empty() {
            return Err(StoreError::Fatal("refs-map anchor name is empty".into()));
        }
        Ok(Self {
            nested,
            codec,
            anchor,
            writer: Mutex::new(Writer::default()),
        })
    }

    pub fn anchor(&self) -> &str {
        &self.anchor
    }

    /// Current refs-map root, if any blob has been stored.
    async fn root(&self, ctx: &Context) -> StoreResult<Option<Ref>> {
        match get_anchor(self.nested.as_ref(), ctx, &self.anchor, max_time()).await {
            Ok(root) => Ok(Some(root)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The newest entry of the refs-map anchor, with its stamp.
    async fn latest_entry(&self, ctx: &Context) -> StoreResult<Option<(Timestamp, Ref)>> {
        if let Some(map) = self.nested.anchor_map() {
            return anchor_map::latest_anchor(map, ctx, &self.anchor).await;
        }
        // Every name between the anchor minus its last character and the
        // anchor itself shares that prefix, so the scan stays local.
        let mut below = self.anchor.clone();
        below.pop();
        let mut entries = cabs_store::list_anchors(self.nested.as_ref(), ctx, &below);
        let mut latest = None;
        while let Some(entry) = entries.try_next().await? {
            if entry.name > self.anchor {
                break;
            }
            if entry.name == self.anchor {
                latest = Some((entry.at, entry.target));
            }
        }
        Ok(latest)
    }

    /// Make `root` the current map as of `at`.
    async fn record_root(&self, ctx: &Context, root: Ref, at: Timestamp) -> StoreResult<()> {
        match self.nested.anchor_map() {
            Some(map) => anchor_map::supersede_anchor(map, ctx, &self.anchor, root, at).await,
            None => cabs_store::put_anchor(self.nested.as_ref(), ctx, &self.anchor, root, at).await,
        }
    }

    /// Encode `blob` and store it, or store it raw when encoding does not
    /// shrink it. Returns the storage ref.
    async fn store_body(&self, ctx: &Context, blob: &Blob) -> StoreResult<Ref> {
        let encoded = self.codec.encode(blob)?;
        let body = if encoded.len() >= blob.len() {
            blob.clone()
        } else {
            Blob::from(encoded)
        };
        Ok(self.nested.put(ctx, body).await?.0)
    }

    async fn storage_ref(&self, ctx: &Context, r: &Ref) -> StoreResult<Option<Ref>> {
        let Some(root) = self.root(ctx).await? else {
            return Ok(None);
        };
        match pmap::get(self.nested.as_ref(), ctx, &root, r.as_bytes()).await? {
            Some(value) => Ok(Some(Ref::from_slice(&value)?)),
            None => Ok(None),
        }
    }
}

/// A stamp later than both the clock and `last`.
fn next_stamp(last: Option<Timestamp>) -> Timestamp {
    let now = time::now();
    match last {
        Some(last) if last >= now => last + Duration::nanoseconds(1),
        _ => now,
    }
}

#[async_trait]
impl BlobStore for TransformStore {
    async fn get(&self, ctx: &Context, r: &Ref) -> StoreResult<Blob> {
        let storage = self
            .storage_ref(ctx, r)
            .await?
            .ok_or(StoreError::NotFound(*r))?;
        let body = self.nested.get(ctx, &storage).await?;
        if storage == *r {
            return Ok(body);
        }
        let decoded = self.codec.decode(&body)?;
        if Ref::of(&decoded) != *r {
            return Err(StoreError::Fatal(format!(
                "{} body under {} does not hash to {}",
                self.codec.name(),
                storage.short_hex(),
                r.short_hex()
            )));
        }
        Ok(Blob::from(decoded))
    }

    async fn put(&self, ctx: &Context, blob: Blob) -> StoreResult<(Ref, bool)> {
        let r = Ref::of(&blob);
        let mut writer = self.writer.lock().await;
        let mut storage = None;

        loop {
            ctx.check()?;
            let current = self.root(ctx).await?;
            if current != writer.last.map(|(_, root)| root) {
                // First use, or another writer moved the map.
                writer.last = self.latest_entry(ctx).await?;
            }
            let base = match current {
                Some(root) => {
                    if pmap::get(self.nested.as_ref(), ctx, &root, r.as_bytes())
                        .await?
                        .is_some()
                    {
                        return Ok((r, false));
                    }
                    root
                }
                None => pmap::empty(self.nested.as_ref(), ctx).await?,
            };

            let stored = match storage {
                Some(stored) => stored,
                None => {
                    let stored = self.store_body(ctx, &blob).await?;
                    debug!(r = %r, storage = %stored, codec = self.codec.name(), "blob stored");
                    *storage.insert(stored)
                }
            };

            let root = pmap::insert(
                self.nested.as_ref(),
                ctx,
                &base,
                r.as_bytes(),
                stored.as_bytes().to_vec(),
            )
            .await?;
            let at = next_stamp(writer.last.map(|(at, _)| at));
            self.record_root(ctx, root, at).await?;
            writer.last = Some((at, root));
            if self.root(ctx).await? == Some(root) {
                return Ok((r, true));
            }
            debug!(anchor = %self.anchor, "refs map moved during update, retrying");
        }
    }

    fn list_refs<'a>(&'a self, ctx: &'a Context, start: Ref) -> RefStream<'a> {
        Box::pin(try_stream! {
            if let Some(root) = self.root(ctx).await? {
                let mut entries =
                    pmap::stream_after(self.nested.as_ref(), ctx, root, start.as_bytes().to_vec());
                while let Some((key, _)) = entries.try_next().await? {
                    yield Ref::from_slice(&key)?;
                }
            }
        })
    }

    fn anchors(&self) -> Option<&dyn AnchorStore> {
        Some(self)
    }

    async fn close(&self, ctx: &Context) -> StoreResult<()> {
        self.nested.close(ctx).await
    }
}

/// Anchors pass through to the nested store; the refs-map anchor is hidden
/// from listings.
#[async_trait]
impl AnchorStore for TransformStore {
    async fn get_anchor(&self, ctx: &Context, name: &str, at: Timestamp) -> StoreResult<Ref> {
        get_anchor(self.nested.as_ref(), ctx, name, at).await
    }

    async fn put_anchor(
        &self,
        ctx: &Context,
        name: &str,
        target: Ref,
        at: Timestamp,
    ) -> StoreResult<()> {
        cabs_store::put_anchor(self.nested.as_ref(), ctx, name, target, at).await
    }

    fn list_anchors<'a>(&'a self, ctx: &'a Context, start: &'a str) -> AnchorStream<'a> {
        Box::pin(try_stream! {
            let mut anchors = cabs_store::list_anchors(self.nested.as_ref(), ctx, start);
            while let Some(anchor) = anchors.try_next().await? {
                if anchor.name != self.anchor {
                    yield anchor;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cabs_backend::FileStore;
    use cabs_store::cursor::collect_refs;
    use cabs_store::MemStore;

    fn setup() -> (Arc<MemStore>, TransformStore) {
        let nested = Arc::new(MemStore::new());
        let store =
            TransformStore::new(nested.clone(), Box::new(ZstdCodec::default()), DEFAULT_ANCHOR)
                .unwrap();
        (nested, store)
    }

    #[tokio::test]
    async fn compressible_blobs_are_stored_encoded() {
        let ctx = Context::background();
        let (nested, store) = setup();
        let body = Blob::from("abcd".repeat(1000));
        let (r, added) = store.put(&ctx, body.clone()).await.unwrap();
        assert!(added);
        assert_eq!(r, Ref::of(&body));

        // The original ref is not stored in the nested store.
        assert!(nested.get(&ctx, &r).await.unwrap_err().is_not_found());
        assert!(nested.total_bytes() < body.len() as u64);
        assert_eq!(store.get(&ctx, &r).await.unwrap(), body);
    }

    #[tokio::test]
    async fn incompressible_blobs_are_stored_raw() {
        let ctx = Context::background();
        let (nested, store) = setup();
        let body = Blob::from_static(b"x");
        let (r, _) = store.put(&ctx, body.clone()).await.unwrap();
        assert_eq!(nested.get(&ctx, &r).await.unwrap(), body);
        assert_eq!(store.get(&ctx, &r).await.unwrap(), body);
    }

    #[tokio::test]
    async fn repeat_put_is_not_added() {
        let ctx = Context::background();
        let (_, store) = setup();
        let body = Blob::from("yy".repeat(100));
        assert!(store.put(&ctx, body.clone()).await.unwrap().1);
        assert!(!store.put(&ctx, body).await.unwrap().1);
        assert!(store
            .get(&ctx, &Ref::of(b"absent"))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn lists_original_refs_only() {
        let ctx = Context::background();
        let (_, store) = setup();
        let mut expected = Vec::new();
        for i in 0..50u32 {
            let (r, _) = store.put(&ctx, Blob::from(i.to_string().repeat(40))).await.unwrap();
            expected.push(r);
        }
        expected.sort();
        let all = collect_refs(store.list_refs(&ctx, Ref::zero())).await.unwrap();
        assert_eq!(all, expected);
        let rest = collect_refs(store.list_refs(&ctx, expected[9])).await.unwrap();
        assert_eq!(rest, expected[10..]);
    }

    #[tokio::test]
    async fn map_survives_a_new_wrapper() {
        let ctx = Context::background();
        let (nested, store) = setup();
        let body = Blob::from("persist".repeat(50));
        let (r, _) = store.put(&ctx, body.clone()).await.unwrap();

        let reopened =
            TransformStore::new(nested, Box::new(ZstdCodec::new(1)), DEFAULT_ANCHOR).unwrap();
        assert_eq!(reopened.get(&ctx, &r).await.unwrap(), body);
    }

    #[tokio::test]
    async fn later_stamped_root_does_not_hide_new_puts() {
        let ctx = Context::background();
        let (nested, store) = setup();
        let first = Blob::from("first".repeat(20));
        let (first_ref, _) = store.put(&ctx, first.clone()).await.unwrap();

        // The current root also appears five minutes ahead of the clock.
        let root = nested.get_anchor(&ctx, DEFAULT_ANCHOR, max_time()).await.unwrap();
        let ahead = time::now() + Duration::minutes(5);
        nested.put_anchor(&ctx, DEFAULT_ANCHOR, root, ahead).await.unwrap();

        let reopened =
            TransformStore::new(nested.clone(), Box::new(ZstdCodec::default()), DEFAULT_ANCHOR)
                .unwrap();
        let second = Blob::from("second".repeat(20));
        let (second_ref, added) = reopened.put(&ctx, second.clone()).await.unwrap();
        assert!(added);
        assert_eq!(reopened.get(&ctx, &second_ref).await.unwrap(), second);
        assert_eq!(reopened.get(&ctx, &first_ref).await.unwrap(), first);
        assert_eq!(store.get(&ctx, &second_ref).await.unwrap(), second);
    }

    #[tokio::test]
    async fn interleaved_wrappers_keep_each_others_blobs() {
        let ctx = Context::background();
        let (nested, one) = setup();
        let other =
            TransformStore::new(nested.clone(), Box::new(ZstdCodec::default()), DEFAULT_ANCHOR)
                .unwrap();
        let mut refs = Vec::new();
        for i in 0..10u32 {
            let writer = if i % 2 == 0 { &one } else { &other };
            let (r, added) = writer.put(&ctx, Blob::from(i.to_string().repeat(30))).await.unwrap();
            assert!(added);
            refs.push(r);
        }
        for (i, r) in refs.iter().enumerate() {
            let body = Blob::from(i.to_string().repeat(30));
            assert_eq!(one.get(&ctx, r).await.unwrap(), body);
            assert_eq!(other.get(&ctx, r).await.unwrap(), body);
        }
        refs.sort();
        assert_eq!(collect_refs(one.list_refs(&ctx, Ref::zero())).await.unwrap(), refs);
    }

    #[tokio::test]
    async fn map_root_store_keeps_one_refs_entry() {
        let ctx = Context::background();
        let dir = tempfile::tempdir().unwrap();
        let nested: Arc<dyn BlobStore> = Arc::new(FileStore::open(dir.path()).unwrap());
        let store =
            TransformStore::new(nested.clone(), Box::new(ZstdCodec::default()), DEFAULT_ANCHOR)
                .unwrap();
        let mut refs = Vec::new();
        for i in 0..40u32 {
            refs.push(store.put(&ctx, Blob::from(i.to_string().repeat(30))).await.unwrap().0);
        }

        let entries: Vec<_> = cabs_store::list_anchors(nested.as_ref(), &ctx, "")
            .try_collect()
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, DEFAULT_ANCHOR);
        for r in &refs {
            store.get(&ctx, r).await.unwrap();
        }
    }

    #[test]
    fn empty_anchor_name_is_rejected() {
        let nested: Arc<dyn BlobStore> = Arc::new(MemStore::new());
        assert!(TransformStore::new(nested, Box::new(ZstdCodec::default()), "").is_err());
    }

    #[tokio::test]
    async fn refs_map_anchor_is_hidden() {
        let ctx = Context::background();
        let (_, store) = setup();
        store.put(&ctx, Blob::from_static(b"blob")).await.unwrap();
        let t = time::now();
        store
            .put_anchor(&ctx, "user", Ref::of(b"target"), t)
            .await
            .unwrap();
        let listed: Vec<_> = store.list_anchors(&ctx, "").try_collect().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "user");
        assert_eq!(store.get_anchor(&ctx, "user", t).await.unwrap(), Ref::of(b"target"));
    }

    #[test]
    fn requires_anchor_capability() {
        let nested: Arc<dyn BlobStore> = Arc::new(NoAnchors(MemStore::new()));
        let err = TransformStore::new(nested, Box::new(ZstdCodec::default()), DEFAULT_ANCHOR)
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::NotAnchorStore));
    }

    #[test]
    fn stamps_strictly_increase() {
        let far = time::now() + Duration::days(1);
        assert_eq!(next_stamp(Some(far)), far + Duration::nanoseconds(1));
        assert!(next_stamp(None) <= time::now());
    }

    struct NoAnchors(MemStore);

    #[async_trait]
    impl BlobStore for NoAnchors {
        async fn get(&self, ctx: &Context, r: &Ref) -> StoreResult<Blob> {
            self.0.get(ctx, r).await
        }

        async fn put(&self, ctx: &Context, blob: Blob) -> StoreResult<(Ref, bool)> {
            self.0.put(ctx, blob).await
        }

        fn list_refs<'a>(&'a self, ctx: &'a Context, start: Ref) -> RefStream<'a> {
            self.0.list_refs(ctx, start)
        }
    }
}
