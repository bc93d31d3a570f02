//! Storage integrity verification.
//!
//! An fsck-style pass over the catalog: every snapshot's blob must exist and
//! re-hash to its ID, every version's parent must exist, and every snapshot
//! must be owned by at least one version. The pass only reads; repairing is
//! left to the operator (re-commit or restore the blob file).

use crate::errors::{MokuError, Result};

use super::Engine;

/// One blob problem found by [`Engine::verify_storage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobIssue {
    pub snapshot_id: String,
    pub blob_id: String,
}

/// Outcome of an integrity pass.
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub snapshots_checked: usize,
    pub blobs_verified: usize,
    /// Snapshots whose blob file is absent.
    pub missing_blobs: Vec<BlobIssue>,
    /// Snapshots whose blob content no longer hashes to its ID.
    pub corrupt_blobs: Vec<BlobIssue>,
    /// Versions whose parent ID is not in the catalog.
    pub dangling_parents: Vec<String>,
    /// Snapshots not referenced by any version.
    pub unowned_snapshots: Vec<String>,
}

impl IntegrityReport {
    /// True when the pass found nothing wrong.
    pub fn is_clean(&self) -> bool {
        self.missing_blobs.is_empty()
            && self.corrupt_blobs.is_empty()
            && self.dangling_parents.is_empty()
            && self.unowned_snapshots.is_empty()
    }
}

impl Engine {
    /// Verify catalog ↔ blob-store consistency.
    pub async fn verify_storage(&self) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();

        let snapshot_blobs: Vec<(String, String)> = {
            let conn = self.conn().await;
            let mut stmt = conn.prepare("SELECT id, blob_id FROM snapshots ORDER BY created_at")?;
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        for (snapshot_id, blob_id) in snapshot_blobs {
            report.snapshots_checked += 1;
            match self.blob_store().get(&blob_id) {
                Ok(_) => report.blobs_verified += 1,
                Err(MokuError::NotFound(_)) => {
                    report.missing_blobs.push(BlobIssue { snapshot_id, blob_id });
                }
                Err(MokuError::Integrity(_)) => {
                    report.corrupt_blobs.push(BlobIssue { snapshot_id, blob_id });
                }
                Err(e) => return Err(e),
            }
        }

        let conn = self.conn().await;
        let mut stmt = conn.prepare(
            "SELECT v.id FROM versions v
             WHERE v.parent_id IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM versions p WHERE p.id = v.parent_id)",
        )?;
        report.dangling_parents = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT s.id FROM snapshots s
             WHERE NOT EXISTS (SELECT 1 FROM version_snapshots vs WHERE vs.snapshot_id = s.id)",
        )?;
        report.unowned_snapshots = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if !report.is_clean() {
            tracing::warn!(
                "integrity pass found {} missing and {} corrupt blobs, {} dangling parents, {} unowned snapshots",
                report.missing_blobs.len(),
                report.corrupt_blobs.len(),
                report.dangling_parents.len(),
                report.unowned_snapshots.len()
            );
        }
        Ok(report)
    }
}
