use std::collections::BTreeMap;
use std::ops::Bound;

use async_stream::try_stream;
use async_trait::async_trait;
use parking_lot::RwLock;

use cabs_types::{Anchor, Blob, Ref, Timestamp};

use crate::context::Context;
use crate::error::{StoreError, StoreResult};
use crate::history::resolve_descending;
use crate::traits::{AnchorStore, AnchorStream, BlobStore, RefStream};

/// In-memory store backed by sorted maps.
///
/// Intended for tests, caches and embedding. Blobs and anchor histories are
/// held behind `RwLock`s; enumeration seeks the next key on each step and
/// never holds a lock across a yield.
#[derive(Default)]
pub struct MemStore {
    blobs: RwLock<BTreeMap<Ref, Blob>>,
    anchors: RwLock<BTreeMap<String, BTreeMap<Timestamp, Ref>>>,
}

impl MemStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently stored.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Returns `true` if no blobs are stored.
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Total bytes across all stored blobs.
    pub fn total_bytes(&self) -> u64 {
        self.blobs.read().values().map(|b| b.len() as u64).sum()
    }

    fn next_ref(&self, after: &Ref) -> Option<Ref> {
        self.blobs
            .read()
            .range((Bound::Excluded(*after), Bound::Unbounded))
            .next()
            .map(|(r, _)| *r)
    }

    fn next_history(&self, after: &str) -> Option<(String, Vec<(Timestamp, Ref)>)> {
        let anchors = self.anchors.read();
        let (name, history) = anchors
            .range::<str, _>((Bound::Excluded(after), Bound::Unbounded))
            .next()?;
        Some((
            name.clone(),
            history.iter().map(|(at, r)| (*at, *r)).collect(),
        ))
    }
}

#[async_trait]
impl BlobStore for MemStore {
    async fn get(&self, ctx: &Context, r: &Ref) -> StoreResult<Blob> {
        ctx.check()?;
        self.blobs
            .read()
            .get(r)
            .cloned()
            .ok_or(StoreError::NotFound(*r))
    }

    async fn put(&self, ctx: &Context, blob: Blob) -> StoreResult<(Ref, bool)> {
        ctx.check()?;
        let r = Ref::of(&blob);
        let mut blobs = self.blobs.write();
        if blobs.contains_key(&r) {
            return Ok((r, false));
        }
        blobs.insert(r, blob);
        Ok((r, true))
    }

    fn list_refs<'a>(&'a self, ctx: &'a Context, start: Ref) -> RefStream<'a> {
        Box::pin(try_stream! {
            let mut cursor = start;
            loop {
                ctx.check()?;
                let Some(r) = self.next_ref(&cursor) else {
                    break;
                };
                yield r;
                cursor = r;
            }
        })
    }

    fn anchors(&self) -> Option<&dyn AnchorStore> {
        Some(self)
    }
}

#[async_trait]
impl AnchorStore for MemStore {
    async fn get_anchor(&self, ctx: &Context, name: &str, at: Timestamp) -> StoreResult<Ref> {
        ctx.check()?;
        let anchors = self.anchors.read();
        anchors
            .get(name)
            .and_then(|h| resolve_descending(h.range(..=at).rev().map(|(t, r)| (*t, *r)), at))
            .ok_or_else(|| StoreError::AnchorNotFound {
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
        ctx.check()?;
        self.anchors
            .write()
            .entry(name.to_string())
            .or_default()
            .entry(at)
            .or_insert(target);
        Ok(())
    }

    fn list_anchors<'a>(&'a self, ctx: &'a Context, start: &'a str) -> AnchorStream<'a> {
        Box::pin(try_stream! {
            let mut cursor = start.to_string();
            loop {
                ctx.check()?;
                let Some((name, history)) = self.next_history(&cursor) else {
                    break;
                };
                for (at, target) in history {
                    yield Anchor::new(name.clone(), at, target);
                }
                cursor = name;
            }
        })
    }
}
