//! Working-tree materialization.
//!
//! Checkout reads every (file_path, blob) membership of a version and writes
//! the convenience files under the engine root: `.page_body` with the raw
//! bytes and `.page_headers.json` with the normalized headers plus a
//! synthetic `Status-Code` entry. Blobs are never modified. HEAD is updated
//! last, through the atomic primitive.

use rusqlite::params;

use crate::errors::{MokuError, Result};
use crate::fsutil;
use crate::headers::Headers;

use super::{Engine, version_exists};

/// Body file name inside each working-tree directory.
const BODY_FILENAME: &str = ".page_body";
/// Headers file name inside each working-tree directory.
const HEADERS_FILENAME: &str = ".page_headers.json";

impl Engine {
    /// Materialize `version_id` into the working tree and point HEAD at it.
    pub async fn checkout(&self, version_id: &str) -> Result<()> {
        let members: Vec<(String, String, String, u16)> = {
            let conn = self.conn().await;
            if !version_exists(&conn, version_id)? {
                return Err(MokuError::NotFound(format!("version {version_id}")));
            }
            let mut stmt = conn.prepare(
                "SELECT s.file_path, s.blob_id, s.headers_json, s.status_code
                 FROM snapshots s
                 JOIN version_snapshots vs ON vs.snapshot_id = s.id
                 WHERE vs.version_id = ?1
                 ORDER BY s.file_path",
            )?;
            stmt.query_map(params![version_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
        };

        for (file_path, blob_id, headers_json, status_code) in members {
            let body = self.blob_store().get(&blob_id)?;
            let headers: Headers = serde_json::from_str(&headers_json)?;
            self.write_worktree_files(&file_path, &body, &headers, status_code)?;
        }

        self.write_head(version_id)
    }

    /// Write the two convenience files for one snapshot under
    /// `{root}/{file_path}/`, both via the atomic primitive.
    pub(crate) fn write_worktree_files(
        &self,
        file_path: &str,
        body: &[u8],
        headers: &Headers,
        status_code: u16,
    ) -> Result<()> {
        let dir = self.root().join(file_path);
        fsutil::atomic_write(&dir.join(BODY_FILENAME), body)?;

        let mut doc = serde_json::Map::new();
        for (name, values) in headers {
            doc.insert(name.clone(), serde_json::json!(values));
        }
        doc.insert(
            "Status-Code".to_string(),
            serde_json::json!([status_code.to_string()]),
        );
        let pretty = serde_json::to_vec_pretty(&serde_json::Value::Object(doc))?;
        fsutil::atomic_write(&dir.join(HEADERS_FILENAME), &pretty)
    }
}
