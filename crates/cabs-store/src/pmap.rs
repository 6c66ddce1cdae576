//! Persistent, copy-on-write B-tree whose nodes are blobs.
//!
//! A map is identified by the ref of its root node. Every insert writes the
//! nodes along the changed path and returns a new root; old roots remain
//! readable. Keys and values are arbitrary byte strings, ordered bytewise.

use async_stream::try_stream;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, TryStreamExt};
use serde::{Deserialize, Serialize};

use cabs_types::{Blob, Ref};

use crate::context::Context;
use crate::error::{StoreError, StoreResult};
use crate::traits::BlobStore;

/// Maximum entries in one node before it splits.
pub const MAX_NODE_ENTRIES: usize = 32;

const NODE_MAGIC: &[u8; 4] = b"cpm1";

/// Key/value pairs as returned by [`entries_after`].
pub type Entries = Vec<(Vec<u8>, Vec<u8>)>;

/// Key/value pairs in key order, as produced by [`stream_after`].
pub type EntryStream<'a> = BoxStream<'a, StoreResult<(Vec<u8>, Vec<u8>)>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    /// Sorted key/value pairs.
    Leaf(Vec<(Vec<u8>, Vec<u8>)>),
    /// Children with the least key each one holds, sorted by that key.
    Branch(Vec<(Vec<u8>, Ref)>),
}

impl Node {
    fn first_key(&self) -> Vec<u8> {
        match self {
            Node::Leaf(entries) => entries.first().map(|(k, _)| k.clone()),
            Node::Branch(children) => children.first().map(|(k, _)| k.clone()),
        }
        .unwrap_or_default()
    }

    fn encode(&self) -> StoreResult<Blob> {
        let mut buf = NODE_MAGIC.to_vec();
        bincode::serialize_into(&mut buf, self).map_err(StoreError::serialization)?;
        Ok(Blob::from(buf))
    }

    fn decode(r: &Ref, bytes: &[u8]) -> StoreResult<Self> {
        let body = bytes
            .strip_prefix(NODE_MAGIC.as_slice())
            .ok_or_else(|| StoreError::WrongType(format!("{r} is not a map node")))?;
        bincode::deserialize(body)
            .map_err(|e| StoreError::WrongType(format!("{r} is not a map node: {e}")))
    }
}

/// Index of the child of a branch that may hold `key`.
fn child_index(children: &[(Vec<u8>, Ref)], key: &[u8]) -> usize {
    children
        .partition_point(|(k, _)| k.as_slice() <= key)
        .saturating_sub(1)
}

async fn load<S: BlobStore + ?Sized>(store: &S, ctx: &Context, r: &Ref) -> StoreResult<Node> {
    let bytes = store.get(ctx, r).await?;
    Node::decode(r, &bytes)
}

async fn save<S: BlobStore + ?Sized>(store: &S, ctx: &Context, node: &Node) -> StoreResult<Ref> {
    let (r, _) = store.put(ctx, node.encode()?).await?;
    Ok(r)
}

/// Store an empty map and return its root.
pub async fn empty<S: BlobStore + ?Sized>(store: &S, ctx: &Context) -> StoreResult<Ref> {
    save(store, ctx, &Node::Leaf(Vec::new())).await
}

/// Look up `key` in the map rooted at `root`.
pub async fn get<S: BlobStore + ?Sized>(
    store: &S,
    ctx: &Context,
    root: &Ref,
    key: &[u8],
) -> StoreResult<Option<Vec<u8>>> {
    let mut node = load(store, ctx, root).await?;
    loop {
        match node {
            Node::Leaf(entries) => {
                return Ok(entries
                    .binary_search_by(|(k, _)| k.as_slice().cmp(key))
                    .ok()
                    .map(|i| entries[i].1.clone()));
            }
            Node::Branch(children) => {
                if children.is_empty() {
                    return Ok(None);
                }
                let child = children[child_index(&children, key)].1;
                node = load(store, ctx, &child).await?;
            }
        }
    }
}

/// Set `key` to `value` in the map rooted at `root`, returning the new root.
///
/// An existing value for `key` is replaced.
pub async fn insert<S: BlobStore + ?Sized>(
    store: &S,
    ctx: &Context,
    root: &Ref,
    key: &[u8],
    value: Vec<u8>,
) -> StoreResult<Ref> {
    let mut parts = insert_at(store, ctx, *root, key.to_vec(), value).await?;
    if parts.len() == 1 {
        return Ok(parts.remove(0).1);
    }
    save(store, ctx, &Node::Branch(parts)).await
}

/// Insert below `at`. Returns the one or two nodes that replace it, each
/// with its least key.
fn insert_at<'a, S: BlobStore + ?Sized>(
    store: &'a S,
    ctx: &'a Context,
    at: Ref,
    key: Vec<u8>,
    value: Vec<u8>,
) -> BoxFuture<'a, StoreResult<Vec<(Vec<u8>, Ref)>>> {
    async move {
        ctx.check()?;
        let node = match load(store, ctx, &at).await? {
            Node::Leaf(mut entries) => {
                match entries.binary_search_by(|(k, _)| k.as_slice().cmp(&key)) {
                    Ok(i) => entries[i].1 = value,
                    Err(i) => entries.insert(i, (key, value)),
                }
                Node::Leaf(entries)
            }
            Node::Branch(mut children) if !children.is_empty() => {
                let i = child_index(&children, &key);
                let replaced = insert_at(store, ctx, children[i].1, key, value).await?;
                children.splice(i..=i, replaced);
                Node::Branch(children)
            }
            Node::Branch(_) => Node::Leaf(vec![(key, value)]),
        };
        let halves = match node {
            Node::Leaf(mut entries) if entries.len() > MAX_NODE_ENTRIES => {
                let upper = entries.split_off(entries.len() / 2);
                vec![Node::Leaf(entries), Node::Leaf(upper)]
            }
            Node::Branch(mut children) if children.len() > MAX_NODE_ENTRIES => {
                let upper = children.split_off(children.len() / 2);
                vec![Node::Branch(children), Node::Branch(upper)]
            }
            node => vec![node],
        };
        let mut out = Vec::with_capacity(halves.len());
        for node in &halves {
            out.push((node.first_key(), save(store, ctx, node).await?));
        }
        Ok(out)
    }
    .boxed()
}

/// Stream every entry whose key is strictly greater than `start`, in key
/// order, loading one node at a time.
pub fn stream_after<'a, S: BlobStore + ?Sized>(
    store: &'a S,
    ctx: &'a Context,
    root: Ref,
    start: Vec<u8>,
) -> EntryStream<'a> {
    Box::pin(try_stream! {
        // Subtrees still to visit, leftmost on top.
        let mut pending = vec![root];
        while let Some(at) = pending.pop() {
            ctx.check()?;
            match load(store, ctx, &at).await? {
                Node::Leaf(entries) => {
                    for (k, v) in entries {
                        if k > start {
                            yield (k, v);
                        }
                    }
                }
                Node::Branch(children) => {
                    // Children left of this one hold only keys <= start.
                    let first = child_index(&children, &start);
                    pending.extend(children.iter().skip(first).rev().map(|(_, r)| *r));
                }
            }
        }
    })
}

/// Every entry whose key is strictly greater than `start`, in key order.
pub async fn entries_after<S: BlobStore + ?Sized>(
    store: &S,
    ctx: &Context,
    root: &Ref,
    start: &[u8],
) -> StoreResult<Entries> {
    stream_after(store, ctx, *root, start.to_vec()).try_collect().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemStore;
    use futures::StreamExt;

    fn key(i: u32) -> Vec<u8> {
        format!("key-{i:05}").into_bytes()
    }

    #[tokio::test]
    async fn empty_map_has_nothing() {
        let store = MemStore::new();
        let ctx = Context::background();
        let root = empty(&store, &ctx).await.unwrap();
        assert_eq!(get(&store, &ctx, &root, b"x").await.unwrap(), None);
        assert!(entries_after(&store, &ctx, &root, b"").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn insert_replace_and_persistence() {
        let store = MemStore::new();
        let ctx = Context::background();
        let r0 = empty(&store, &ctx).await.unwrap();
        let r1 = insert(&store, &ctx, &r0, b"k", b"v1".to_vec()).await.unwrap();
        let r2 = insert(&store, &ctx, &r1, b"k", b"v2".to_vec()).await.unwrap();

        assert_eq!(get(&store, &ctx, &r1, b"k").await.unwrap(), Some(b"v1".to_vec()));
        assert_eq!(get(&store, &ctx, &r2, b"k").await.unwrap(), Some(b"v2".to_vec()));
        assert_eq!(get(&store, &ctx, &r0, b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn splits_and_stays_ordered() {
        let store = MemStore::new();
        let ctx = Context::background();
        let mut root = empty(&store, &ctx).await.unwrap();
        // Insert in a scrambled order so splits happen on both sides.
        let n = 500u32;
        for i in (0..n).map(|i| (i * 7919) % n) {
            root = insert(&store, &ctx, &root, &key(i), i.to_be_bytes().to_vec())
                .await
                .unwrap();
        }
        for i in [0, 1, 31, 32, 33, 250, 499] {
            let v = get(&store, &ctx, &root, &key(i)).await.unwrap();
            assert_eq!(v, Some(i.to_be_bytes().to_vec()));
        }
        assert_eq!(get(&store, &ctx, &root, b"key-99999").await.unwrap(), None);

        let all = entries_after(&store, &ctx, &root, b"").await.unwrap();
        assert_eq!(all.len(), n as usize);
        assert!(all.windows(2).all(|w| w[0].0 < w[1].0));

        let tail = entries_after(&store, &ctx, &root, &key(489)).await.unwrap();
        let keys: Vec<_> = tail.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, (490..n).map(key).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn key_below_every_child_goes_first() {
        let store = MemStore::new();
        let ctx = Context::background();
        let mut root = empty(&store, &ctx).await.unwrap();
        for i in 100..200 {
            root = insert(&store, &ctx, &root, &key(i), vec![]).await.unwrap();
        }
        root = insert(&store, &ctx, &root, &key(1), vec![1]).await.unwrap();
        assert_eq!(get(&store, &ctx, &root, &key(1)).await.unwrap(), Some(vec![1]));
        let all = entries_after(&store, &ctx, &root, b"").await.unwrap();
        assert_eq!(all[0].0, key(1));
        assert_eq!(all.len(), 101);
    }

    #[tokio::test]
    async fn stream_yields_before_reading_the_whole_map() {
        let store = MemStore::new();
        let ctx = Context::background();
        let mut root = empty(&store, &ctx).await.unwrap();
        for i in 0..300 {
            root = insert(&store, &ctx, &root, &key(i), vec![]).await.unwrap();
        }
        let first: Vec<_> = stream_after(&store, &ctx, root, key(41))
            .take(3)
            .map_ok(|(k, _)| k)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(first, vec![key(42), key(43), key(44)]);

        // A cancelled context stops the walk at the next node.
        let cancelled = ctx.child();
        cancelled.cancel();
        let mut stream = stream_after(&store, &cancelled, root, Vec::new());
        assert!(stream.try_next().await.unwrap_err().is(crate::error::ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn foreign_blob_is_wrong_type() {
        let store = MemStore::new();
        let ctx = Context::background();
        let (r, _) = store.put(&ctx, Blob::from_static(b"not a node")).await.unwrap();
        let err = get(&store, &ctx, &r, b"k").await.unwrap_err();
        assert!(err.is(crate::error::ErrorKind::WrongType));
    }
}
