use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::info;

use cabs_store::{
    AnchorStore, AnchorStream, BlobStore, Context, RefStream, StoreError, StoreResult,
};
use cabs_types::time::{from_nanos, saturating_nanos, to_nanos};
use cabs_types::{Anchor, Blob, Ref, Timestamp};

/// Rows fetched per enumeration query.
const PAGE_SIZE: usize = 256;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A store backed by a SQLite database.
///
/// Range-capable: enumeration seeks `ref > ?` directly, paging by keyset.
/// Anchors use the history-per-name shape with an `(name, at)` primary key.
pub struct SqliteStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a store at `path`. `":memory:"` opens a private
    /// in-memory database.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let connection = if path == Path::new(":memory:") {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(classify)?;
        connection.busy_timeout(BUSY_TIMEOUT).map_err(classify)?;
        connection
            .execute_batch(
                r#"
                    CREATE TABLE IF NOT EXISTS blobs (
                        ref BLOB PRIMARY KEY,
                        data BLOB NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS anchors (
                        name TEXT NOT NULL,
                        at INTEGER NOT NULL,
                        ref BLOB NOT NULL,
                        PRIMARY KEY (name, at)
                    );
                "#,
            )
            .map_err(classify)?;
        info!(path = %path.display(), "opened sqlite store");
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_connection<T, F>(&self, ctx: &Context, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        ctx.check()?;
        let connection = Arc::clone(&self.connection);
        ctx.run(async move {
            tokio::task::spawn_blocking(move || f(&connection.lock()).map_err(classify))
                .await
                .map_err(|e| StoreError::Fatal(format!("blocking task failed: {e}")))?
        })
        .await
    }
}

/// Busy and locked databases may clear up; everything else will not.
fn classify(e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            StoreError::Transient(e.to_string())
        }
        _ => StoreError::Fatal(e.to_string()),
    }
}

fn ref_column(bytes: Vec<u8>, column: usize) -> rusqlite::Result<Ref> {
    Ref::from_slice(&bytes)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Blob, Box::new(e)))
}

#[async_trait]
impl BlobStore for SqliteStore {
    async fn get(&self, ctx: &Context, r: &Ref) -> StoreResult<Blob> {
        let key = *r;
        let data: Option<Vec<u8>> = self
            .with_connection(ctx, move |conn| {
                conn.query_row(
                    "SELECT data FROM blobs WHERE ref = ?1",
                    params![&key.as_bytes()[..]],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        data.map(Blob::from).ok_or(StoreError::NotFound(key))
    }

    async fn put(&self, ctx: &Context, blob: Blob) -> StoreResult<(Ref, bool)> {
        let r = Ref::of(&blob);
        let inserted = self
            .with_connection(ctx, move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO blobs (ref, data) VALUES (?1, ?2)",
                    params![&r.as_bytes()[..], &blob[..]],
                )
            })
            .await?;
        Ok((r, inserted == 1))
    }

    fn list_refs<'a>(&'a self, ctx: &'a Context, start: Ref) -> RefStream<'a> {
        Box::pin(try_stream! {
            let mut cursor = start;
            loop {
                let page = self
                    .with_connection(ctx, move |conn| {
                        let mut stmt = conn.prepare_cached(
                            "SELECT ref FROM blobs WHERE ref > ?1 ORDER BY ref LIMIT ?2",
                        )?;
                        let rows = stmt.query_map(
                            params![&cursor.as_bytes()[..], PAGE_SIZE as i64],
                            |row| ref_column(row.get(0)?, 0),
                        )?;
                        rows.collect::<rusqlite::Result<Vec<Ref>>>()
                    })
                    .await?;
                let full = page.len() == PAGE_SIZE;
                for r in page {
                    yield r;
                    cursor = r;
                }
                if !full {
                    break;
                }
            }
        })
    }

    fn anchors(&self) -> Option<&dyn AnchorStore> {
        Some(self)
    }
}

#[async_trait]
impl AnchorStore for SqliteStore {
    async fn get_anchor(&self, ctx: &Context, name: &str, at: Timestamp) -> StoreResult<Ref> {
        let key = name.to_string();
        let nanos = saturating_nanos(&at);
        let found = self
            .with_connection(ctx, move |conn| {
                conn.query_row(
                    "SELECT ref FROM anchors WHERE name = ?1 AND at <= ?2 \
                     ORDER BY at DESC LIMIT 1",
                    params![key, nanos],
                    |row| ref_column(row.get(0)?, 0),
                )
                .optional()
            })
            .await?;
        found.ok_or_else(|| StoreError::AnchorNotFound {
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
        let name = name.to_string();
        let nanos = to_nanos(&at)?;
        self.with_connection(ctx, move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO anchors (name, at, ref) VALUES (?1, ?2, ?3)",
                params![name, nanos, &target.as_bytes()[..]],
            )
        })
        .await?;
        Ok(())
    }

    fn list_anchors<'a>(&'a self, ctx: &'a Context, start: &'a str) -> AnchorStream<'a> {
        Box::pin(try_stream! {
            // Keyset cursor: names after `start`, then (name, at) after the
            // last row seen.
            let mut cursor: (String, Option<i64>) = (start.to_string(), None);
            loop {
                let (name, after) = cursor.clone();
                let page = self
                    .with_connection(ctx, move |conn| {
                        let mut stmt = match after {
                            None => conn.prepare_cached(
                                "SELECT name, at, ref FROM anchors WHERE name > ?1 \
                                 ORDER BY name, at LIMIT ?3",
                            )?,
                            Some(_) => conn.prepare_cached(
                                "SELECT name, at, ref FROM anchors WHERE (name, at) > (?1, ?2) \
                                 ORDER BY name, at LIMIT ?3",
                            )?,
                        };
                        let rows = stmt.query_map(
                            params![name, after.unwrap_or(i64::MIN), PAGE_SIZE as i64],
                            |row| {
                                Ok((
                                    row.get::<_, String>(0)?,
                                    row.get::<_, i64>(1)?,
                                    ref_column(row.get(2)?, 2)?,
                                ))
                            },
                        )?;
                        rows.collect::<rusqlite::Result<Vec<_>>>()
                    })
                    .await?;
                let full = page.len() == PAGE_SIZE;
                for (name, nanos, target) in page {
                    yield Anchor::new(name.clone(), from_nanos(nanos), target);
                    cursor = (name, Some(nanos));
                }
                if !full {
                    break;
                }
            }
        })
    }
}
