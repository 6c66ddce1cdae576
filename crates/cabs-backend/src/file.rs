use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_stream::try_stream;
use async_trait::async_trait;
use fs2::FileExt;
use tracing::{debug, info};
use uuid::Uuid;

use cabs_store::cursor::{is_hex_name, seek};
use cabs_store::{
    anchor_map, AnchorMapStore, AnchorStore, AnchorStream, BlobStore, Context, RefStream,
    StoreError, StoreResult,
};
use cabs_types::{Blob, Ref, Timestamp, REF_HEX_LEN, REF_LEN};

// Top-level names under the store root.
const BLOBS_DIRECTORY: &str = "blobs";
const STAGING_DIRECTORY: &str = "tmp";
const ANCHOR_MAP_REF_FILE: &str = "anchor-map-ref";
const REGISTER_LOCK_FILE: &str = "register.lock";

/// Staging files older than this are leftovers of an interrupted write.
const STALE_STAGING: Duration = Duration::from_secs(60 * 60);

/// A store that keeps each blob as a file in a local directory tree.
///
/// A blob with hex `h0h1h2h3...` lives at `blobs/h0h1/h0h1h2h3/<hex>`. Writes
/// go to a staging file under `tmp/` and are renamed into place. Anchors use
/// the map-root shape: the root ref is a 32-byte register file, swapped
/// while holding an exclusive OS lock on `register.lock`, so handles in
/// other processes see the same compare-and-set.
pub struct FileStore {
    root: Arc<Path>,
}

impl FileStore {
    /// Open or create a store rooted at `root`.
    ///
    /// Staging files left over from an interrupted write are removed once
    /// they are an hour old; younger ones may belong to another handle.
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root.join(BLOBS_DIRECTORY))?;
        fs::create_dir_all(root.join(STAGING_DIRECTORY))?;
        let now = SystemTime::now();
        for entry in fs::read_dir(root.join(STAGING_DIRECTORY))? {
            let entry = entry?;
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if age.is_some_and(|age| age >= STALE_STAGING) {
                // Another handle may have swept it first.
                match fs::remove_file(entry.path()) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                    _ => {}
                }
            }
        }
        info!(root = %root.display(), "opened file store");
        Ok(Self {
            root: Arc::from(root),
        })
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run blocking filesystem work off the async runtime.
    async fn blocking<T, F>(&self, ctx: &Context, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> StoreResult<T> + Send + 'static,
    {
        ctx.check()?;
        let root = Arc::clone(&self.root);
        ctx.run(async move {
            tokio::task::spawn_blocking(move || f(&root))
                .await
                .map_err(|e| StoreError::Fatal(format!("blocking task failed: {e}")))?
        })
        .await
    }
}

fn blob_path(root: &Path, r: &Ref) -> PathBuf {
    let hex = r.to_hex();
    root.join(BLOBS_DIRECTORY)
        .join(&hex[..2])
        .join(&hex[..4])
        .join(&hex)
}

/// Write `data` to a fresh staging file, then move it to `dest`.
fn write_atomic(root: &Path, dest: &Path, data: &[u8]) -> io::Result<()> {
    let staging = root
        .join(STAGING_DIRECTORY)
        .join(Uuid::now_v7().as_hyphenated().to_string());
    let mut file = File::create(&staging)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&staging, dest).inspect_err(|_| {
        let _ = fs::remove_file(&staging);
    })
}

/// Sorted names in `dir` that are `len` hex digits and start with `prefix`.
/// A missing directory lists as empty.
fn sorted_hex_names(dir: &Path, len: usize, prefix: &str) -> StoreResult<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if is_hex_name(name, len) && name.starts_with(prefix) {
                names.push(name.to_string());
            }
        }
    }
    names.sort_unstable();
    Ok(names)
}

/// Run `f` holding an exclusive lock on the register lock file.
///
/// The lock is an OS advisory lock, so it excludes other handles on the
/// same directory whether they live in this process or another one.
fn with_register_lock<T>(root: &Path, f: impl FnOnce() -> StoreResult<T>) -> StoreResult<T> {
    let lock_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(root.join(REGISTER_LOCK_FILE))?;
    FileExt::lock_exclusive(&lock_file)?;
    let result = f();
    // Closing the file releases the lock.
    drop(lock_file);
    result
}

fn read_register(root: &Path) -> StoreResult<Option<Ref>> {
    match fs::read(root.join(ANCHOR_MAP_REF_FILE)) {
        Ok(bytes) if bytes.len() == REF_LEN => Ok(Some(Ref::from_slice(&bytes)?)),
        Ok(bytes) => Err(StoreError::Fatal(format!(
            "anchor map register holds {} bytes, expected {REF_LEN}",
            bytes.len()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl BlobStore for FileStore {
    async fn get(&self, ctx: &Context, r: &Ref) -> StoreResult<Blob> {
        let r = *r;
        self.blocking(ctx, move |root| match fs::read(blob_path(root, &r)) {
            Ok(data) => Ok(Blob::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(r)),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn put(&self, ctx: &Context, blob: Blob) -> StoreResult<(Ref, bool)> {
        let r = Ref::of(&blob);
        let added = self
            .blocking(ctx, move |root| {
                let path = blob_path(root, &r);
                if path.exists() {
                    return Ok(false);
                }
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)?;
                }
                write_atomic(root, &path, &blob)?;
                Ok(true)
            })
            .await?;
        if added {
            debug!(r = %r, "stored blob");
        }
        Ok((r, added))
    }

    fn list_refs<'a>(&'a self, ctx: &'a Context, start: Ref) -> RefStream<'a> {
        Box::pin(try_stream! {
            let start_hex = start.to_hex();
            let top = self
                .blocking(ctx, |root| sorted_hex_names(&root.join(BLOBS_DIRECTORY), 2, ""))
                .await?;
            for d1 in &top[seek(&top, &start_hex[..2])..] {
                let dir1 = PathBuf::from(BLOBS_DIRECTORY).join(d1);
                let prefix1 = d1.clone();
                let mids = self
                    .blocking(ctx, {
                        let dir1 = dir1.clone();
                        move |root| sorted_hex_names(&root.join(dir1), 4, &prefix1)
                    })
                    .await?;
                let from = if *d1 == start_hex[..2] { seek(&mids, &start_hex[..4]) } else { 0 };
                for d2 in &mids[from..] {
                    let dir2 = dir1.join(d2);
                    let prefix2 = d2.clone();
                    let files = self
                        .blocking(ctx, move |root| {
                            sorted_hex_names(&root.join(dir2), REF_HEX_LEN, &prefix2)
                        })
                        .await?;
                    let from = if *d2 == start_hex[..4] { seek(&files, &start_hex) } else { 0 };
                    for name in &files[from..] {
                        ctx.check()?;
                        if *name > start_hex {
                            yield Ref::from_hex(name)?;
                        }
                    }
                }
            }
        })
    }

    fn anchors(&self) -> Option<&dyn AnchorStore> {
        Some(self)
    }

    fn anchor_map(&self) -> Option<&dyn AnchorMapStore> {
        Some(self)
    }
}

#[async_trait]
impl AnchorMapStore for FileStore {
    async fn anchor_map_ref(&self, ctx: &Context) -> StoreResult<Ref> {
        self.blocking(ctx, |root| read_register(root)?.ok_or(StoreError::NoAnchorMap))
            .await
    }

    async fn swap_anchor_map_ref(
        &self,
        ctx: &Context,
        expected: Option<Ref>,
        new: Ref,
    ) -> StoreResult<()> {
        self.blocking(ctx, move |root| {
            with_register_lock(root, || {
                let current = read_register(root)?;
                if current != expected {
                    return Err(StoreError::Conflict(format!(
                        "anchor map root is {current:?}, expected {expected:?}"
                    )));
                }
                write_atomic(root, &root.join(ANCHOR_MAP_REF_FILE), new.as_bytes())?;
                Ok(())
            })
        })
        .await
    }
}

#[async_trait]
impl AnchorStore for FileStore {
    async fn get_anchor(&self, ctx: &Context, name: &str, at: Timestamp) -> StoreResult<Ref> {
        anchor_map::get_anchor(self, ctx, name, at).await
    }

    async fn put_anchor(
        &self,
        ctx: &Context,
        name: &str,
        target: Ref,
        at: Timestamp,
    ) -> StoreResult<()> {
        anchor_map::put_anchor(self, ctx, name, target, at).await
    }

    fn list_anchors<'a>(&'a self, ctx: &'a Context, start: &'a str) -> AnchorStream<'a> {
        anchor_map::list_anchors(self, ctx, start)
    }
}
