//! Ordered enumeration helpers.
//!
//! Stores fall into three classes by how they scan: range-capable stores
//! (SQL, sorted maps) seek `ref > start` directly; prefix-capable stores
//! (object buckets) synthesize the range with [`hex_prefixes`]; the file tree
//! binary-searches each directory level with [`seek`]. Whatever the class,
//! the result is a [`RefStream`], and [`merge_refs`] combines several of
//! them into one.

use futures::future::try_join_all;
use futures::TryStreamExt;

use async_stream::try_stream;
use cabs_types::{Ref, TypeError};

use crate::context::Context;
use crate::error::{StoreError, StoreResult};
use crate::traits::RefStream;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// The hex prefixes covering every hex string of the same length that is
/// strictly greater than `start`, in ascending order.
///
/// Walks from the last digit toward the first: for position `i`, emits
/// `start[..i]` followed by each digit greater than `start[i]`.
///
/// ```
/// # use cabs_store::cursor::hex_prefixes;
/// let p = hex_prefixes("e6f").unwrap();
/// assert_eq!(p, ["e7", "e8", "e9", "ea", "eb", "ec", "ed", "ee", "ef", "f"]);
/// ```
pub fn hex_prefixes(start: &str) -> Result<Vec<String>, TypeError> {
    let bytes = start.as_bytes();
    let mut out = Vec::new();
    for i in (0..bytes.len()).rev() {
        let pos = HEX_DIGITS
            .iter()
            .position(|&d| d == bytes[i])
            .ok_or_else(|| TypeError::InvalidHex(start.to_string()))?;
        for &digit in &HEX_DIGITS[pos + 1..] {
            let mut prefix = String::with_capacity(i + 1);
            prefix.push_str(&start[..i]);
            prefix.push(digit as char);
            out.push(prefix);
        }
    }
    Ok(out)
}

/// Index of the first name in sorted `names` that is `>= prefix`.
pub fn seek<S: AsRef<str>>(names: &[S], prefix: &str) -> usize {
    names.partition_point(|n| n.as_ref() < prefix)
}

/// Returns `true` if `name` is a run of `len` lowercase hex digits.
pub fn is_hex_name(name: &str, len: usize) -> bool {
    name.len() == len && name.bytes().all(|b| HEX_DIGITS.contains(&b))
}

/// K-way merge of ordered ref streams into one ordered, duplicate-free
/// stream.
///
/// Each round emits the least current head and then advances every stream
/// whose head equals it. The merged stream ends when all inputs are
/// exhausted, and fails with the first error any input yields.
pub fn merge_refs<'a>(ctx: &'a Context, mut streams: Vec<RefStream<'a>>) -> RefStream<'a> {
    Box::pin(try_stream! {
        let mut heads: Vec<Option<Ref>> =
            try_join_all(streams.iter_mut().map(|s| s.try_next())).await?;
        loop {
            ctx.check()?;
            let Some(least) = heads.iter().flatten().min().copied() else {
                break;
            };
            yield least;
            let advancing = streams
                .iter_mut()
                .zip(heads.iter_mut())
                .filter(|(_, head)| **head == Some(least))
                .map(|(stream, head)| async move {
                    *head = stream.try_next().await?;
                    Ok::<_, StoreError>(())
                });
            try_join_all(advancing).await?;
        }
    })
}

/// Callback form of enumeration.
///
/// Invokes `f` for each ref in order. An error from `f` ends the walk and is
/// returned unchanged, so callers can stop early with a sentinel of their own
/// error type.
pub async fn each_ref<E, F>(mut stream: RefStream<'_>, mut f: F) -> Result<(), E>
where
    E: From<StoreError>,
    F: FnMut(Ref) -> Result<(), E>,
{
    while let Some(r) = stream.try_next().await? {
        f(r)?;
    }
    Ok(())
}

/// Drain a ref stream into a vector.
pub async fn collect_refs(stream: RefStream<'_>) -> StoreResult<Vec<Ref>> {
    stream.try_collect().await
}
