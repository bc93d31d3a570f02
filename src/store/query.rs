//! Read-side API: snapshots, versions, parent lookup, and diffs.
//!
//! Snapshots come back fully populated: body bytes re-read (and verified)
//! from the blob store, headers deserialized. Diffs are served from the
//! cache when a commit already computed them and are computed lazily (and
//! cached) otherwise.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::canonical;
use crate::diff::{CombinedDiff, MultiFileDiff, diff_combined};
use crate::errors::{MokuError, Result};
use crate::headers::Headers;

use super::{Engine, StoredSnapshot, Version, commit, parse_timestamp, version_exists};

impl Engine {
    /// Fetch one version row.
    pub async fn get_version(&self, version_id: &str) -> Result<Version> {
        let conn = self.conn().await;
        conn.query_row(
            "SELECT id, parent_id, message, author, timestamp FROM versions WHERE id = ?1",
            params![version_id],
            version_from_row,
        )
        .optional()?
        .ok_or_else(|| MokuError::NotFound(format!("version {version_id}")))
    }

    /// Parent version ID, or "" for the initial commit.
    pub async fn get_parent_version_id(&self, version_id: &str) -> Result<String> {
        let conn = self.conn().await;
        let parent: Option<Option<String>> = conn
            .query_row(
                "SELECT parent_id FROM versions WHERE id = ?1",
                params![version_id],
                |row| row.get(0),
            )
            .optional()?;
        match parent {
            Some(parent) => Ok(parent.unwrap_or_default()),
            None => Err(MokuError::NotFound(format!("version {version_id}"))),
        }
    }

    /// Versions newest-first. A non-positive `limit` defaults to 10.
    pub async fn list_versions(&self, limit: i64) -> Result<Vec<Version>> {
        let limit = if limit <= 0 { 10 } else { limit };
        let conn = self.conn().await;
        let mut stmt = conn.prepare(
            "SELECT id, parent_id, message, author, timestamp FROM versions
             ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let versions = stmt
            .query_map(params![limit], version_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    /// Fetch one snapshot by ID, body materialized.
    pub async fn get_snapshot(&self, snapshot_id: &str) -> Result<StoredSnapshot> {
        let row = {
            let conn = self.conn().await;
            conn.query_row(
                &format!("{SNAPSHOT_SELECT} WHERE id = ?1"),
                params![snapshot_id],
                snapshot_row,
            )
            .optional()?
        };
        let row = row.ok_or_else(|| MokuError::NotFound(format!("snapshot {snapshot_id}")))?;
        self.materialize(row)
    }

    /// All snapshots belonging to a version, ordered by file path.
    pub async fn get_snapshots(&self, version_id: &str) -> Result<Vec<StoredSnapshot>> {
        let rows = {
            let conn = self.conn().await;
            if !version_exists(&conn, version_id)? {
                return Err(MokuError::NotFound(format!("version {version_id}")));
            }
            let mut stmt = conn.prepare(
                "SELECT s.id, s.status_code, s.url, s.file_path, s.blob_id, s.headers_json, s.created_at
                 FROM snapshots s
                 JOIN version_snapshots vs ON vs.snapshot_id = s.id
                 WHERE vs.version_id = ?1
                 ORDER BY s.file_path",
            )?;
            stmt.query_map(params![version_id], snapshot_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        rows.into_iter().map(|row| self.materialize(row)).collect()
    }

    /// Latest snapshot recorded for a URL (canonicalized before lookup).
    pub async fn get_snapshot_by_url(&self, url: &str) -> Result<StoredSnapshot> {
        let canonical_url = canonical::canonicalize(url, &self.config().canonicalize)?;
        let row = {
            let conn = self.conn().await;
            conn.query_row(
                &format!("{SNAPSHOT_SELECT} WHERE url = ?1 ORDER BY created_at DESC, id LIMIT 1"),
                params![canonical_url],
                snapshot_row,
            )
            .optional()?
        };
        let row = row.ok_or_else(|| MokuError::NotFound(format!("snapshot for {canonical_url}")))?;
        self.materialize(row)
    }

    /// Snapshot of a URL as recorded inside one specific version.
    pub async fn get_snapshot_by_url_and_version(
        &self,
        url: &str,
        version_id: &str,
    ) -> Result<StoredSnapshot> {
        let canonical_url = canonical::canonicalize(url, &self.config().canonicalize)?;
        let row = {
            let conn = self.conn().await;
            conn.query_row(
                "SELECT s.id, s.status_code, s.url, s.file_path, s.blob_id, s.headers_json, s.created_at
                 FROM snapshots s
                 JOIN version_snapshots vs ON vs.snapshot_id = s.id
                 WHERE s.url = ?1 AND vs.version_id = ?2
                 ORDER BY s.created_at DESC LIMIT 1",
                params![canonical_url, version_id],
                snapshot_row,
            )
            .optional()?
        };
        let row = row.ok_or_else(|| {
            MokuError::NotFound(format!("snapshot for {canonical_url} in version {version_id}"))
        })?;
        self.materialize(row)
    }

    /// Diff between two versions as JSON.
    ///
    /// Served from the cache when present; otherwise computed from the head
    /// version's snapshots (matched to the base version by file path, or an
    /// empty base when `base_id` is ""), cached, and returned.
    pub async fn diff(&self, base_id: &str, head_id: &str) -> Result<serde_json::Value> {
        {
            let conn = self.conn().await;
            if !version_exists(&conn, head_id)? {
                return Err(MokuError::NotFound(format!("version {head_id}")));
            }
            if !base_id.is_empty() && !version_exists(&conn, base_id)? {
                return Err(MokuError::NotFound(format!("version {base_id}")));
            }
            if let Some(cached) = cached_diff(&conn, base_id, head_id)? {
                return Ok(serde_json::from_str(&cached)?);
            }
        }

        let head_snapshots = self.get_snapshots(head_id).await?;
        let mut file_diffs = MultiFileDiff::new();
        for head in &head_snapshots {
            let base = if base_id.is_empty() {
                None
            } else {
                match self
                    .get_snapshot_by_url_and_version(&head.url, base_id)
                    .await
                {
                    Ok(snapshot) => Some(snapshot),
                    Err(MokuError::NotFound(_)) => None,
                    Err(e) => return Err(e),
                }
            };
            let combined = match &base {
                Some(base) => diff_combined(
                    &base.blob_id,
                    &base.body,
                    &base.headers,
                    &head.blob_id,
                    &head.body,
                    &head.headers,
                ),
                None => diff_combined(
                    "",
                    &[],
                    &Headers::new(),
                    &head.blob_id,
                    &head.body,
                    &head.headers,
                ),
            };
            file_diffs.insert(head.file_path.clone(), combined);
        }

        let value = if file_diffs.len() == 1 {
            match file_diffs.values().next() {
                Some(single) => serde_json::to_value(single)?,
                None => serde_json::to_value(&file_diffs)?,
            }
        } else {
            serde_json::to_value(&file_diffs)?
        };

        let conn = self.conn().await;
        if let Err(e) = commit::insert_diff_row(&conn, base_id, head_id, &file_diffs, &Utc::now()) {
            tracing::warn!("caching diff ({base_id}, {head_id}) failed: {e}");
        }
        Ok(value)
    }

    /// Combined body+headers diff for one specific snapshot pair. An empty
    /// `base_snapshot_id` diffs the head snapshot against an empty base.
    pub async fn diff_snapshots(
        &self,
        base_snapshot_id: &str,
        head_snapshot_id: &str,
    ) -> Result<CombinedDiff> {
        let head = self.get_snapshot(head_snapshot_id).await?;
        if base_snapshot_id.is_empty() {
            return Ok(diff_combined(
                "",
                &[],
                &Headers::new(),
                &head.blob_id,
                &head.body,
                &head.headers,
            ));
        }
        let base = self.get_snapshot(base_snapshot_id).await?;
        Ok(diff_combined(
            &base.blob_id,
            &base.body,
            &base.headers,
            &head.blob_id,
            &head.body,
            &head.headers,
        ))
    }

    /// Load body bytes for a snapshot row and assemble the public form.
    fn materialize(&self, row: SnapshotRow) -> Result<StoredSnapshot> {
        let body = self.blob_store().get(&row.blob_id)?;
        let headers: Headers = serde_json::from_str(&row.headers_json)?;
        Ok(StoredSnapshot {
            id: row.id,
            url: row.url,
            file_path: row.file_path,
            status_code: row.status_code,
            blob_id: row.blob_id,
            headers,
            created_at: parse_timestamp(&row.created_at)?,
            body,
        })
    }
}

const SNAPSHOT_SELECT: &str =
    "SELECT id, status_code, url, file_path, blob_id, headers_json, created_at FROM snapshots";

/// Raw snapshot row before blob materialization.
struct SnapshotRow {
    id: String,
    status_code: u16,
    url: String,
    file_path: String,
    blob_id: String,
    headers_json: String,
    created_at: String,
}

fn snapshot_row(row: &Row<'_>) -> rusqlite::Result<SnapshotRow> {
    Ok(SnapshotRow {
        id: row.get(0)?,
        status_code: row.get(1)?,
        url: row.get(2)?,
        file_path: row.get(3)?,
        blob_id: row.get(4)?,
        headers_json: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<Version> {
    let timestamp: String = row.get(4)?;
    Ok(Version {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        message: row.get(2)?,
        author: row.get(3)?,
        timestamp: chrono::DateTime::parse_from_rfc3339(&timestamp)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default(),
    })
}

fn cached_diff(conn: &Connection, base_id: &str, head_id: &str) -> Result<Option<String>> {
    let cached = conn
        .query_row(
            "SELECT diff_json FROM diffs
             WHERE base_version_id = ?1 AND head_version_id = ?2
             ORDER BY created_at DESC LIMIT 1",
            params![base_id, head_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(cached)
}
