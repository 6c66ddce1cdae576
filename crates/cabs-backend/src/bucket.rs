use std::collections::BTreeMap;
use std::ops::Bound;

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use parking_lot::RwLock;

use cabs_store::cursor::hex_prefixes;
use cabs_store::history::{
    anchor_key_prefix, decode_anchor_key, decode_blob_key, encode_anchor_key, encode_blob_key,
    ANCHOR_KEY_PREFIX, BLOB_KEY_PREFIX,
};
use cabs_store::{
    AnchorStore, AnchorStream, BlobStore, Context, RefStream, StoreError, StoreResult,
};
use cabs_types::{Anchor, Blob, Ref, Timestamp};

/// A stream of object keys in lexical order.
pub type KeyStream<'a> = BoxStream<'a, StoreResult<String>>;

/// The minimal surface of a cloud object bucket.
///
/// Buckets cannot seek to an arbitrary key; they can only list the keys under
/// a prefix, in lexical order.
#[async_trait]
pub trait ObjectBucket: Send + Sync {
    /// Read the object at `key`, or `None` if absent.
    async fn read(&self, ctx: &Context, key: &str) -> StoreResult<Option<Bytes>>;

    /// Create the object at `key` unless it exists. Returns `true` if this
    /// call created it.
    async fn write_if_absent(&self, ctx: &Context, key: &str, data: Bytes) -> StoreResult<bool>;

    /// Every key starting with `prefix`, in lexical order.
    fn list<'a>(&'a self, ctx: &'a Context, prefix: &'a str) -> KeyStream<'a>;
}

/// In-memory [`ObjectBucket`], mainly for tests.
#[derive(Default)]
pub struct MemBucket {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl MemBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects in the bucket.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectBucket for MemBucket {
    async fn read(&self, ctx: &Context, key: &str) -> StoreResult<Option<Bytes>> {
        ctx.check()?;
        Ok(self.objects.read().get(key).cloned())
    }

    async fn write_if_absent(&self, ctx: &Context, key: &str, data: Bytes) -> StoreResult<bool> {
        ctx.check()?;
        let mut objects = self.objects.write();
        if objects.contains_key(key) {
            return Ok(false);
        }
        objects.insert(key.to_string(), data);
        Ok(true)
    }

    fn list<'a>(&'a self, ctx: &'a Context, prefix: &'a str) -> KeyStream<'a> {
        if let Err(e) = ctx.check() {
            return stream::once(async move { Err(e) }).boxed();
        }
        let keys: Vec<String> = self
            .objects
            .read()
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        stream::iter(keys.into_iter().map(Ok)).boxed()
    }
}

/// A store over an [`ObjectBucket`].
///
/// Blobs live at `b:<hex>`. Each anchor entry is its own object at
/// `a:<hex(name)>:<inverted time>` holding the 32-byte target, so listing a
/// name's prefix yields its history newest first. Range scans are
/// synthesized from prefix listings.
pub struct BucketStore<B> {
    bucket: B,
}

impl<B: ObjectBucket> BucketStore<B> {
    pub fn new(bucket: B) -> Self {
        Self { bucket }
    }

    pub fn bucket(&self) -> &B {
        &self.bucket
    }
}

#[async_trait]
impl<B: ObjectBucket> BlobStore for BucketStore<B> {
    async fn get(&self, ctx: &Context, r: &Ref) -> StoreResult<Blob> {
        self.bucket
            .read(ctx, &encode_blob_key(r))
            .await?
            .ok_or(StoreError::NotFound(*r))
    }

    async fn put(&self, ctx: &Context, blob: Blob) -> StoreResult<(Ref, bool)> {
        let r = Ref::of(&blob);
        let added = self
            .bucket
            .write_if_absent(ctx, &encode_blob_key(&r), blob)
            .await?;
        Ok((r, added))
    }

    fn list_refs<'a>(&'a self, ctx: &'a Context, start: Ref) -> RefStream<'a> {
        Box::pin(try_stream! {
            let prefixes = if start.is_zero() {
                vec![String::new()]
            } else {
                hex_prefixes(&start.to_hex())?
            };
            for prefix in prefixes {
                ctx.check()?;
                let key_prefix = format!("{BLOB_KEY_PREFIX}{prefix}");
                let mut keys = self.bucket.list(ctx, &key_prefix);
                while let Some(key) = keys.try_next().await? {
                    let r = decode_blob_key(&key)?;
                    if r > start {
                        yield r;
                    }
                }
            }
        })
    }

    fn anchors(&self) -> Option<&dyn AnchorStore> {
        Some(self)
    }
}

#[async_trait]
impl<B: ObjectBucket> AnchorStore for BucketStore<B> {
    async fn get_anchor(&self, ctx: &Context, name: &str, at: Timestamp) -> StoreResult<Ref> {
        let prefix = anchor_key_prefix(name);
        let mut keys = self.bucket.list(ctx, &prefix);
        // Newest first: the first entry at or before `at` wins.
        while let Some(key) = keys.try_next().await? {
            let (_, entry_at) = decode_anchor_key(&key)?;
            if entry_at <= at {
                let body = self.bucket.read(ctx, &key).await?.ok_or_else(|| {
                    StoreError::Transient(format!("anchor object {key} vanished"))
                })?;
                return Ok(Ref::from_slice(&body)?);
            }
        }
        Err(StoreError::AnchorNotFound {
            name: name.to_string(),
            at,
        })
    }

    async fn put_anchor(
        &self,
        ctx: &Context,
        name: &str,
        target: Ref,
        at: Timestamp,
    ) -> StoreResult<()> {
        let key = encode_anchor_key(name, at)?;
        let body = Bytes::copy_from_slice(target.as_bytes());
        self.bucket.write_if_absent(ctx, &key, body).await?;
        Ok(())
    }

    fn list_anchors<'a>(&'a self, ctx: &'a Context, start: &'a str) -> AnchorStream<'a> {
        Box::pin(try_stream! {
            // `:` sorts after every hex digit, so a name's extensions are
            // listed before the name itself and each history comes newest
            // first. Names sharing a first byte are contiguous in the
            // listing; each such run is sorted, then emitted.
            let mut run: Vec<(String, Timestamp, String)> = Vec::new();
            let mut run_byte = None;
            let mut keys = self.bucket.list(ctx, ANCHOR_KEY_PREFIX);
            loop {
                let key = keys.try_next().await?;
                let decoded = match &key {
                    Some(key) => Some(decode_anchor_key(key)?),
                    None => None,
                };
                let byte = decoded
                    .as_ref()
                    .and_then(|(name, _)| name.as_bytes().first().copied());
                if decoded.is_none() || byte != run_byte {
                    run.sort();
                    for (name, at, key) in run.drain(..) {
                        ctx.check()?;
                        if let Some(body) = self.bucket.read(ctx, &key).await? {
                            yield Anchor::new(name, at, Ref::from_slice(&body)?);
                        }
                    }
                    run_byte = byte;
                }
                let (Some(key), Some((name, at))) = (key, decoded) else {
                    break;
                };
                if name.as_str() > start {
                    run.push((name, at, key));
                }
            }
        })
    }
}
