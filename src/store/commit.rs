//! Transactional snapshot ingest: single and batch commit.
//!
//! A commit stores every body blob first (content addressing makes those
//! writes safe to retry), then performs all metadata writes in one
//! transaction: version row, snapshot rows, membership rows, and the
//! best-effort diff row against the parent version. Working-tree files and
//! the HEAD pointer are written after the transaction commits; failures
//! there are logged, never fatal. The database stays the authority and the
//! tree can be re-materialized via checkout.

use bytes::Bytes;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::canonical;
use crate::diff::{CombinedDiff, MultiFileDiff, diff_combined};
use crate::errors::{MokuError, Result};
use crate::headers::{Headers, normalize};

use super::{Engine, Snapshot, format_timestamp};

/// Per-commit options.
#[derive(Debug, Clone)]
pub struct CommitOptions {
    pub author: Option<String>,
    pub cancel: CancellationToken,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self {
            author: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Outcome of committing one snapshot. Batch commits return one result per
/// snapshot, all sharing the same version. The head body bytes, blob ID and
/// cached diff are carried so a scoring pass can run without re-reading.
#[derive(Debug, Clone)]
pub struct CommitResult {
    pub version_id: String,
    pub parent_version_id: Option<String>,
    pub snapshot_id: String,
    /// Canonical URL of the committed snapshot.
    pub url: String,
    pub file_path: String,
    pub blob_id: String,
    pub body: Bytes,
    /// Diff cache row created by this commit, when one was.
    pub diff_id: Option<String>,
    /// Combined diff JSON for this snapshot's file, when computed.
    pub diff_json: Option<String>,
}

/// A snapshot with its derived identity, ready for the transaction.
struct Prepared {
    snapshot: Snapshot,
    canonical_url: String,
    file_path: String,
    blob_id: String,
    snapshot_id: String,
    headers: Headers,
}

impl Engine {
    /// Commit one snapshot as a new version on top of HEAD.
    pub async fn commit(&self, snapshot: Snapshot, message: &str) -> Result<CommitResult> {
        self.commit_with(snapshot, message, CommitOptions::default())
            .await
    }

    /// Commit one snapshot with explicit options.
    pub async fn commit_with(
        &self,
        snapshot: Snapshot,
        message: &str,
        options: CommitOptions,
    ) -> Result<CommitResult> {
        let mut results = self.commit_batch(vec![snapshot], message, options).await?;
        Ok(results.remove(0))
    }

    /// Commit a batch of snapshots as one new version.
    ///
    /// All metadata writes happen in a single transaction: either every
    /// snapshot, the version, and its diffs become visible together, or none
    /// do. An unparseable URL aborts the whole batch before any metadata is
    /// touched.
    pub async fn commit_batch(
        &self,
        snapshots: Vec<Snapshot>,
        message: &str,
        options: CommitOptions,
    ) -> Result<Vec<CommitResult>> {
        if message.trim().is_empty() {
            return Err(MokuError::InvalidInput("empty commit message".to_string()));
        }
        if snapshots.is_empty() {
            return Err(MokuError::InvalidInput("empty snapshot batch".to_string()));
        }

        // Canonicalize every URL up front; a bad URL must abort the batch
        // before any blob or metadata write.
        let mut prepared = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let canonical_url = canonical::canonicalize(&snapshot.url, &self.config().canonicalize)?;
            let file_path = canonical::file_path_for(&canonical_url)?;
            let headers = normalize(
                snapshot
                    .headers
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.iter().map(|s| s.as_str()))),
                self.config().redact_sensitive_headers,
            );
            prepared.push(Prepared {
                snapshot,
                canonical_url,
                file_path,
                blob_id: String::new(),
                snapshot_id: Uuid::new_v4().to_string(),
                headers,
            });
        }

        // Blob writes precede the transaction; content addressing makes them
        // idempotent, so an abandoned batch leaves only unreachable blobs.
        for item in prepared.iter_mut() {
            if options.cancel.is_cancelled() {
                return Err(MokuError::Cancelled);
            }
            item.blob_id = self.blob_store().put(&item.snapshot.body)?;
        }

        let version_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut conn = self.conn().await;
        let parent_id = self.resolve_head(&conn)?;

        let tx = conn.transaction()?;
        if options.cancel.is_cancelled() {
            return Err(MokuError::Cancelled);
        }

        tx.execute(
            "INSERT INTO versions (id, parent_id, message, author, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                version_id,
                parent_id,
                message,
                options.author,
                format_timestamp(&now)
            ],
        )?;

        for item in prepared.iter() {
            if options.cancel.is_cancelled() {
                return Err(MokuError::Cancelled);
            }
            let created_at = item.snapshot.created_at.unwrap_or(now);
            tx.execute(
                "INSERT INTO snapshots (id, status_code, url, file_path, blob_id, headers_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    item.snapshot_id,
                    item.snapshot.status_code,
                    item.canonical_url,
                    item.file_path,
                    item.blob_id,
                    serde_json::to_string(&item.headers)?,
                    format_timestamp(&created_at)
                ],
            )?;
            tx.execute(
                "INSERT INTO version_snapshots (version_id, snapshot_id) VALUES (?1, ?2)",
                params![version_id, item.snapshot_id],
            )?;
        }

        // Diff against the parent is best-effort: a failure here is logged
        // and the commit still succeeds.
        let mut diff_id = None;
        let mut file_diffs = MultiFileDiff::new();
        if let Some(parent) = &parent_id {
            for item in prepared.iter() {
                match self.diff_against_parent(&tx, parent, item) {
                    Ok(combined) => {
                        file_diffs.insert(item.file_path.clone(), combined);
                    }
                    Err(e) => {
                        tracing::warn!(
                            "diff for {} against parent {parent} failed: {e}",
                            item.file_path
                        );
                    }
                }
            }
            if !file_diffs.is_empty() {
                match insert_diff_row(&tx, parent, &version_id, &file_diffs, &now) {
                    Ok(id) => diff_id = Some(id),
                    Err(e) => tracing::warn!("caching diff for version {version_id} failed: {e}"),
                }
            }
        }

        tx.commit()?;
        drop(conn);

        // Working-tree materialization and the HEAD update follow the
        // transaction; both are best-effort.
        for item in prepared.iter() {
            if let Err(e) = self.write_worktree_files(
                &item.file_path,
                &item.snapshot.body,
                &item.headers,
                item.snapshot.status_code,
            ) {
                tracing::warn!("working-tree write for {} failed: {e}", item.file_path);
            }
        }
        if let Err(e) = self.write_head(&version_id) {
            tracing::warn!("HEAD update to {version_id} failed: {e}");
        }

        let results = prepared
            .into_iter()
            .map(|item| {
                let diff_json = file_diffs
                    .get(&item.file_path)
                    .and_then(|d| serde_json::to_string(d).ok());
                CommitResult {
                    version_id: version_id.clone(),
                    parent_version_id: parent_id.clone(),
                    snapshot_id: item.snapshot_id,
                    url: item.canonical_url,
                    file_path: item.file_path,
                    blob_id: item.blob_id,
                    body: item.snapshot.body,
                    diff_id: diff_id.clone(),
                    diff_json,
                }
            })
            .collect();
        Ok(results)
    }

    /// Combined diff of one prepared snapshot against the parent version's
    /// snapshot of the same file path, or against an empty base when the
    /// parent does not carry that file.
    fn diff_against_parent(
        &self,
        conn: &Connection,
        parent_id: &str,
        item: &Prepared,
    ) -> Result<CombinedDiff> {
        let base: Option<(String, String)> = conn
            .query_row(
                "SELECT s.blob_id, s.headers_json FROM snapshots s
                 JOIN version_snapshots vs ON vs.snapshot_id = s.id
                 WHERE vs.version_id = ?1 AND s.file_path = ?2
                 ORDER BY s.created_at DESC LIMIT 1",
                params![parent_id, item.file_path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (base_id, base_body, base_headers) = match base {
            Some((blob_id, headers_json)) => {
                let body = self.blob_store().get(&blob_id)?;
                let headers: Headers = serde_json::from_str(&headers_json)?;
                (blob_id, body, headers)
            }
            None => (String::new(), Vec::new(), Headers::new()),
        };

        Ok(diff_combined(
            &base_id,
            &base_body,
            &base_headers,
            &item.blob_id,
            &item.snapshot.body,
            &item.headers,
        ))
    }
}

/// Insert the diff cache row for a version pair. Single-file versions store
/// the combined diff object itself; multi-file versions store the aggregate
/// keyed by file path.
pub(crate) fn insert_diff_row(
    conn: &Connection,
    base_version_id: &str,
    head_version_id: &str,
    file_diffs: &MultiFileDiff,
    now: &chrono::DateTime<Utc>,
) -> Result<String> {
    let diff_json = match file_diffs.values().next() {
        Some(single) if file_diffs.len() == 1 => serde_json::to_string(single)?,
        _ => serde_json::to_string(file_diffs)?,
    };
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO diffs (id, base_version_id, head_version_id, diff_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id,
            base_version_id,
            head_version_id,
            diff_json,
            format_timestamp(now)
        ],
    )?;
    Ok(id)
}
