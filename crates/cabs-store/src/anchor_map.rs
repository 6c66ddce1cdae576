//! Map-root anchors.
//!
//! A map-root store keeps every anchor history in one persistent map
//! ([`crate::pmap`]) keyed by name, whose root ref sits in a compare-and-set
//! register. This module provides the read-modify-write loop over that
//! register and the history-per-name view on top of it, so a map-root store
//! can answer the same queries as an [`AnchorStore`](crate::AnchorStore).

use std::future::Future;
use std::time::Duration;

use async_stream::try_stream;
use futures::TryStreamExt;
use rand::Rng;
use tracing::debug;

use cabs_types::time::{from_nanos, to_nanos};
use cabs_types::{Anchor, Ref, Timestamp};

use crate::context::Context;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::history::resolve_ascending;
use crate::pmap;
use crate::traits::{AnchorMapStore, AnchorStream};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// One name's history as stored in the map: `(nanos, ref)` sorted by time.
type History = Vec<(i64, Ref)>;

fn decode_history(name: &str, bytes: &[u8]) -> StoreResult<History> {
    bincode::deserialize(bytes)
        .map_err(|e| StoreError::WrongType(format!("anchor history for {name:?}: {e}")))
}

fn encode_history(history: &History) -> StoreResult<Vec<u8>> {
    bincode::serialize(history).map_err(StoreError::serialization)
}

/// The current root, or `None` if no map has been installed.
pub async fn current_root<S>(store: &S, ctx: &Context) -> StoreResult<Option<Ref>>
where
    S: AnchorMapStore + ?Sized,
{
    match store.anchor_map_ref(ctx).await {
        Ok(r) => Ok(Some(r)),
        Err(e) if e.is(ErrorKind::NoAnchorMap) => Ok(None),
        Err(e) => Err(e),
    }
}

/// One read-modify-write round on the anchor-map root.
///
/// Reads the current root (`None` if unset), computes the replacement with
/// `f` and installs it only if the root is unchanged. Returns
/// [`StoreError::Conflict`] if another writer got there first.
pub async fn update_anchor_map<S, F, Fut>(store: &S, ctx: &Context, f: F) -> StoreResult<Ref>
where
    S: AnchorMapStore + ?Sized,
    F: FnOnce(Option<Ref>) -> Fut,
    Fut: Future<Output = StoreResult<Ref>>,
{
    ctx.check()?;
    let old = current_root(store, ctx).await?;
    let new = f(old).await?;
    if old != Some(new) {
        store.swap_anchor_map_ref(ctx, old, new).await?;
    }
    Ok(new)
}

/// [`update_anchor_map`], retried on conflict.
///
/// Backs off exponentially from 10ms to 1s with jitter, until the update
/// lands or the context is done.
pub async fn update_anchor_map_with_retry<S, F, Fut>(
    store: &S,
    ctx: &Context,
    mut f: F,
) -> StoreResult<Ref>
where
    S: AnchorMapStore + ?Sized,
    F: FnMut(Option<Ref>) -> Fut,
    Fut: Future<Output = StoreResult<Ref>>,
{
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match update_anchor_map(store, ctx, &mut f).await {
            Err(e) if e.is(ErrorKind::Conflict) => {
                let wait = backoff.mul_f64(rand::thread_rng().gen_range(0.5..1.5));
                debug!(?wait, "anchor map update conflicted, retrying");
                ctx.run(async {
                    tokio::time::sleep(wait).await;
                    Ok(())
                })
                .await?;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            other => return other,
        }
    }
}

/// Resolve `name` at `at` against the map.
pub async fn get_anchor<S>(store: &S, ctx: &Context, name: &str, at: Timestamp) -> StoreResult<Ref>
where
    S: AnchorMapStore + ?Sized,
{
    let not_found = || StoreError::AnchorNotFound {
        name: name.to_string(),
        at,
    };
    let Some(root) = current_root(store, ctx).await? else {
        return Err(not_found());
    };
    let Some(bytes) = pmap::get(store, ctx, &root, name.as_bytes()).await? else {
        return Err(not_found());
    };
    let history = decode_history(name, &bytes)?;
    resolve_ascending(history.into_iter().map(|(n, r)| (from_nanos(n), r)), at)
        .ok_or_else(not_found)
}

/// Record `(name, at, target)` in the map.
///
/// An existing entry at `(name, at)` is kept and the call succeeds.
pub async fn put_anchor<S>(
    store: &S,
    ctx: &Context,
    name: &str,
    target: Ref,
    at: Timestamp,
) -> StoreResult<()>
where
    S: AnchorMapStore + ?Sized,
{
    let nanos = to_nanos(&at)?;
    update_anchor_map_with_retry(store, ctx, move |old| async move {
        let root = match old {
            Some(r) => r,
            None => pmap::empty(store, ctx).await?,
        };
        let mut history = match pmap::get(store, ctx, &root, name.as_bytes()).await? {
            Some(bytes) => decode_history(name, &bytes)?,
            None => History::new(),
        };
        match history.binary_search_by_key(&nanos, |(n, _)| *n) {
            Ok(_) => Ok(root),
            Err(i) => {
                history.insert(i, (nanos, target));
                pmap::insert(store, ctx, &root, name.as_bytes(), encode_history(&history)?).await
            }
        }
    })
    .await?;
    Ok(())
}

/// The newest entry recorded for `name`, if any.
pub async fn latest_anchor<S>(
    store: &S,
    ctx: &Context,
    name: &str,
) -> StoreResult<Option<(Timestamp, Ref)>>
where
    S: AnchorMapStore + ?Sized,
{
    let Some(root) = current_root(store, ctx).await? else {
        return Ok(None);
    };
    let Some(bytes) = pmap::get(store, ctx, &root, name.as_bytes()).await? else {
        return Ok(None);
    };
    let history = decode_history(name, &bytes)?;
    Ok(history.last().map(|&(nanos, r)| (from_nanos(nanos), r)))
}

/// Record `(name, at, target)` and drop the entries of `name` older than
/// `at`, in one update of the map.
///
/// Entries newer than `at` are kept, so the newest entry still wins
/// lookups at later times. The history stays as short as the number of
/// writers racing on it instead of growing with every update.
pub async fn supersede_anchor<S>(
    store: &S,
    ctx: &Context,
    name: &str,
    target: Ref,
    at: Timestamp,
) -> StoreResult<()>
where
    S: AnchorMapStore + ?Sized,
{
    let nanos = to_nanos(&at)?;
    update_anchor_map_with_retry(store, ctx, move |old| async move {
        let root = match old {
            Some(r) => r,
            None => pmap::empty(store, ctx).await?,
        };
        let mut history = match pmap::get(store, ctx, &root, name.as_bytes()).await? {
            Some(bytes) => decode_history(name, &bytes)?,
            None => History::new(),
        };
        history.retain(|&(n, _)| n >= nanos);
        if history.first().map(|&(n, _)| n) != Some(nanos) {
            history.insert(0, (nanos, target));
        }
        pmap::insert(store, ctx, &root, name.as_bytes(), encode_history(&history)?).await
    })
    .await?;
    Ok(())
}

/// Every entry with a name strictly greater than `start`, ordered by name
/// then time.
pub fn list_anchors<'a, S>(store: &'a S, ctx: &'a Context, start: &'a str) -> AnchorStream<'a>
where
    S: AnchorMapStore + ?Sized,
{
    Box::pin(try_stream! {
        if let Some(root) = current_root(store, ctx).await? {
            let mut entries = pmap::stream_after(store, ctx, root, start.as_bytes().to_vec());
            while let Some((key, value)) = entries.try_next().await? {
                let name = String::from_utf8(key)
                    .map_err(|e| StoreError::WrongType(format!("anchor name: {e}")))?;
                for (nanos, target) in decode_history(&name, &value)? {
                    yield Anchor::new(name.clone(), from_nanos(nanos), target);
                }
            }
        }
    })
}
