//! The engine handle: root layout, database lifecycle, HEAD management, and
//! the snapshot/version model shared by the commit, query, and checkout
//! paths.
//!
//! On-disk layout under the configured root:
//!
//! ```text
//! <root>/
//!   .moku/
//!     moku.db           relational metadata
//!     blobs/<xx>/<id>   content-addressed blobs
//!     HEAD              current version ID, no trailing newline
//!   <file_path>/        working tree per snapshot file path
//!     .page_body
//!     .page_headers.json
//! ```

pub mod checkout;
pub mod commit;
pub mod integrity;
pub mod query;
pub mod schema;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::{Mutex, MutexGuard};

use crate::blob::BlobStore;
use crate::config::EngineConfig;
use crate::errors::{MokuError, Result};
use crate::fsutil;
use crate::headers::Headers;
use crate::scoring::Assessor;

pub use commit::{CommitOptions, CommitResult};

/// Directory holding engine metadata under the root.
const META_DIR: &str = ".moku";
/// Metadata database file name.
const DB_FILENAME: &str = "moku.db";
/// HEAD pointer file name.
const HEAD_FILENAME: &str = "HEAD";

/// One fetched document handed to the engine by a fetcher.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub url: String,
    pub status_code: u16,
    pub body: Bytes,
    /// Raw response headers, any casing; normalized at commit.
    pub headers: HashMap<String, Vec<String>>,
    /// Capture time; the commit timestamp is used when absent.
    pub created_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn new(
        url: impl Into<String>,
        status_code: u16,
        body: impl Into<Bytes>,
        headers: HashMap<String, Vec<String>>,
    ) -> Self {
        Self {
            url: url.into(),
            status_code,
            body: body.into(),
            headers,
            created_at: None,
        }
    }
}

/// A committed snapshot as returned by the query API, with body bytes
/// materialized from the blob store and headers deserialized.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub id: String,
    pub url: String,
    pub file_path: String,
    pub status_code: u16,
    pub blob_id: String,
    pub headers: Headers,
    pub created_at: DateTime<Utc>,
    pub body: Vec<u8>,
}

/// A version row: an atomic commit grouping one or more snapshots.
#[derive(Debug, Clone)]
pub struct Version {
    pub id: String,
    pub parent_id: Option<String>,
    pub message: String,
    pub author: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Opaque engine handle owning the root directory, the metadata database,
/// and the blob store. One handle per root; callers close it explicitly.
pub struct Engine {
    root: PathBuf,
    meta_dir: PathBuf,
    db: Mutex<Connection>,
    blobs: BlobStore,
    config: EngineConfig,
    assessor: Option<Arc<dyn Assessor>>,
}

impl Engine {
    /// Open (creating if needed) an engine rooted at `config.storage_path`.
    ///
    /// Applies pragmas and migrations, binds the project ID when configured,
    /// and warns if HEAD points at an unknown version (resolution happens on
    /// read, see [`Engine::head`]).
    pub async fn open(config: EngineConfig) -> Result<Engine> {
        let root = config.storage_path.clone();
        let meta_dir = root.join(META_DIR);
        fsutil::ensure_dir(&meta_dir)?;
        let blobs = BlobStore::open(meta_dir.join("blobs"))?;

        let conn = Connection::open(meta_dir.join(DB_FILENAME))?;
        schema::apply_pragmas(&conn)?;
        schema::migrate(&conn)?;

        if let Some(project_id) = &config.project_id {
            bind_project_id(&conn, project_id, config.force_project_id)?;
        }

        let engine = Engine {
            root,
            meta_dir,
            db: Mutex::new(conn),
            blobs,
            config,
            assessor: None,
        };

        if let Some(head) = engine.read_head_file() {
            let conn = engine.db.lock().await;
            if !version_exists(&conn, &head)? {
                tracing::warn!("HEAD points at unknown version {head}; will resolve by scan");
            }
        }

        Ok(engine)
    }

    /// Install an assessor for the scoring pipeline.
    pub fn with_assessor(mut self, assessor: Arc<dyn Assessor>) -> Self {
        self.assessor = Some(assessor);
        self
    }

    /// Close the engine, checkpointing the WAL best-effort.
    pub async fn close(self) -> Result<()> {
        let conn = self.db.into_inner();
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            tracing::warn!("WAL checkpoint on close failed: {e}");
        }
        conn.close()
            .map_err(|(_, e)| MokuError::Storage(format!("close database: {e}")))?;
        Ok(())
    }

    /// Engine root directory (working-tree parent).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Effective configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current version ID.
    ///
    /// If the HEAD file is missing or points at an unknown version, the
    /// highest-timestamp version is used instead; the file itself is only
    /// rewritten by the next commit or checkout.
    pub async fn head(&self) -> Result<Option<String>> {
        let conn = self.db.lock().await;
        self.resolve_head(&conn)
    }

    pub(crate) fn resolve_head(&self, conn: &Connection) -> Result<Option<String>> {
        if let Some(id) = self.read_head_file() {
            if version_exists(conn, &id)? {
                return Ok(Some(id));
            }
            tracing::warn!("HEAD points at unknown version {id}; falling back to newest version");
        }
        let newest = conn
            .query_row(
                "SELECT id FROM versions ORDER BY timestamp DESC, id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(newest)
    }

    fn read_head_file(&self) -> Option<String> {
        match fs::read_to_string(self.head_path()) {
            Ok(content) => {
                let id = content.trim().to_string();
                (!id.is_empty()).then_some(id)
            }
            Err(_) => None,
        }
    }

    /// Atomically point HEAD at `version_id`.
    pub(crate) fn write_head(&self, version_id: &str) -> Result<()> {
        fsutil::atomic_write(&self.head_path(), version_id.as_bytes())
    }

    fn head_path(&self) -> PathBuf {
        self.meta_dir.join(HEAD_FILENAME)
    }

    pub(crate) async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().await
    }

    pub(crate) fn blob_store(&self) -> &BlobStore {
        &self.blobs
    }

    pub(crate) fn assessor(&self) -> Option<&Arc<dyn Assessor>> {
        self.assessor.as_ref()
    }
}

/// Enforce the project binding stored in `meta`.
fn bind_project_id(conn: &Connection, project_id: &str, force: bool) -> Result<()> {
    if project_id.is_empty() {
        return Err(MokuError::ProjectIdEmpty);
    }
    match schema::meta_get(conn, "project_id")? {
        None => schema::meta_set(conn, "project_id", project_id),
        Some(existing) if existing == project_id => Ok(()),
        Some(existing) => {
            if force {
                tracing::warn!("rebinding root from project `{existing}` to `{project_id}`");
                schema::meta_set(conn, "project_id", project_id)
            } else {
                Err(MokuError::ProjectIdMismatch {
                    existing,
                    requested: project_id.to_string(),
                })
            }
        }
    }
}

pub(crate) fn version_exists(conn: &Connection, id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM versions WHERE id = ?1", [id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

/// Parse an RFC 3339 timestamp stored in the database.
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| MokuError::Storage(format!("bad timestamp `{raw}`: {e}")))
}

/// Serialize a timestamp for storage.
pub(crate) fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
