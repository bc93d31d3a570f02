//! Security scoring and diff attribution.
//!
//! The engine does not score pages itself; it drives an [`Assessor`] port
//! under a bounded timeout, persists the explainable result (score row plus
//! one evidence row per item and one location row per evidence location),
//! and attributes each unit of score change to specific diff chunks. Scoring
//! is optional: without an installed assessor the pass is a no-op.

pub mod attribution;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::diff::{CombinedDiff, DiffChunk, MultiFileDiff};
use crate::errors::{MokuError, Result};
use crate::headers::Headers;
use crate::store::{CommitResult, Engine, format_timestamp, parse_timestamp};

/// Severity bucket of one evidence item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
    /// Catch-all for severities this engine version does not know.
    Unknown,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
            Severity::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Severity {
    fn from(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "low" => Severity::Low,
            "medium" => Severity::Medium,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Unknown,
        }
    }
}

impl Serialize for Severity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Severity::from(raw.as_str()))
    }
}

/// Structured pointer into a snapshot body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceLocation {
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub xpath: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    /// Byte range `[byte_start, byte_end)` into the body.
    #[serde(default)]
    pub byte_start: Option<usize>,
    #[serde(default)]
    pub byte_end: Option<usize>,
    /// 1-based inclusive line range.
    #[serde(default)]
    pub line_start: Option<usize>,
    #[serde(default)]
    pub line_end: Option<usize>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub note: Option<String>,
}

/// One rule match reported by the assessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    /// Stable ID, unique within one score result.
    pub id: String,
    pub key: String,
    pub rule_id: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub raw_value: Option<String>,
    #[serde(default)]
    pub locations: Vec<EvidenceLocation>,
}

/// Assessor output for one version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreResult {
    /// Score in [0, 1].
    pub score: f64,
    /// Score normalized to [0, 100].
    pub normalized_score: i64,
    /// Assessor-level confidence in [0, 1].
    pub confidence: f64,
    /// Scoring-algorithm version string.
    pub algo_version: String,
    #[serde(default)]
    pub evidence: Vec<EvidenceItem>,
    #[serde(default)]
    pub matched_rules: Vec<String>,
    #[serde(default)]
    pub features: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub produced_at: DateTime<Utc>,
}

/// Options passed through to the assessor and governing the scoring pass.
#[derive(Debug, Clone)]
pub struct ScoreOptions {
    /// Ask the assessor to attach evidence locations.
    pub request_locations: bool,
    /// Prefer a cheaper scoring path.
    pub lightweight: bool,
    /// Bound on one assessor invocation.
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl Default for ScoreOptions {
    fn default() -> Self {
        Self {
            request_locations: true,
            lightweight: false,
            timeout: Duration::from_secs(12),
            cancel: CancellationToken::new(),
        }
    }
}

/// Scoring port. Implementations must not perform network I/O.
#[async_trait]
pub trait Assessor: Send + Sync {
    /// Score an HTML (or HTML-ish) body. `source_tag` identifies the
    /// document for the assessor's own bookkeeping, typically the URL.
    async fn score_html(
        &self,
        body: &[u8],
        source_tag: &str,
        options: &ScoreOptions,
    ) -> Result<ScoreResult>;

    /// Score a full response. The default delegates to [`Self::score_html`].
    async fn score_response(
        &self,
        body: &[u8],
        headers: &Headers,
        status_code: u16,
        source_tag: &str,
        options: &ScoreOptions,
    ) -> Result<ScoreResult> {
        let _ = (headers, status_code);
        self.score_html(body, source_tag, options).await
    }

    /// Extract evidence only. The default runs a full scoring pass.
    async fn extract_evidence(
        &self,
        body: &[u8],
        source_tag: &str,
        options: &ScoreOptions,
    ) -> Result<Vec<EvidenceItem>> {
        Ok(self.score_html(body, source_tag, options).await?.evidence)
    }
}

/// A persisted score row, evidence included.
#[derive(Debug, Clone)]
pub struct StoredScore {
    pub version_id: String,
    pub score: f64,
    pub normalized_score: i64,
    pub confidence: f64,
    pub algo_version: String,
    pub evidence: Vec<EvidenceItem>,
    pub matched_rules: Vec<String>,
    pub features: serde_json::Value,
    pub metadata: serde_json::Value,
    pub produced_at: DateTime<Utc>,
}

/// A persisted attribution row.
#[derive(Debug, Clone)]
pub struct AttributionRecord {
    pub id: i64,
    pub version_id: String,
    pub diff_id: Option<String>,
    pub evidence_id: String,
    pub location_row_id: Option<i64>,
    /// Index into the evidence item's location list, -1 for the global row.
    pub location_index: i64,
    /// Index into the body-diff chunk list, -1 when no chunk matched.
    pub chunk_index: i64,
    pub weight: f64,
    pub contribution_pct: f64,
}

impl Engine {
    /// Run the scoring pass for one commit result.
    ///
    /// No-op returning `Ok(None)` when no assessor is installed. On success
    /// the score row, evidence rows, and attributions are replaced for the
    /// version in one transaction; a failed pass leaves prior rows intact.
    pub async fn score_commit(
        &self,
        commit: &CommitResult,
        options: &ScoreOptions,
    ) -> Result<Option<StoredScore>> {
        let Some(assessor) = self.assessor() else {
            tracing::debug!("no assessor installed; skipping scoring");
            return Ok(None);
        };
        let assessor = Arc::clone(assessor);

        let body: Bytes = if commit.body.is_empty() {
            Bytes::from(self.blob_store().get(&commit.blob_id)?)
        } else {
            commit.body.clone()
        };

        let score = tokio::select! {
            _ = options.cancel.cancelled() => return Err(MokuError::Cancelled),
            outcome = tokio::time::timeout(
                options.timeout,
                assessor.score_html(&body, &commit.url, options),
            ) => match outcome {
                Err(_) => {
                    return Err(MokuError::ScoringFailed(format!(
                        "assessor timed out after {:?}",
                        options.timeout
                    )));
                }
                Ok(Err(e)) => return Err(MokuError::ScoringFailed(e.to_string())),
                Ok(Ok(score)) => score,
            },
        };

        let chunks = match commit.parent_version_id.as_deref() {
            Some(_) => self.load_diff_chunks(commit).await?,
            None => None,
        };
        let attributions = chunks
            .as_deref()
            .map(|chunks| {
                attribution::compute_attributions(&score.evidence, score.confidence, &body, chunks)
            })
            .unwrap_or_default();

        if options.cancel.is_cancelled() {
            return Err(MokuError::Cancelled);
        }

        let now = Utc::now();
        {
            let mut conn = self.conn().await;
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT OR REPLACE INTO score_results
                 (version_id, score, normalized_score, confidence, algo_version,
                  matched_rules_json, features_json, meta_json, produced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    commit.version_id,
                    score.score,
                    score.normalized_score,
                    score.confidence,
                    score.algo_version,
                    serde_json::to_string(&score.matched_rules)?,
                    serde_json::to_string(&score.features)?,
                    serde_json::to_string(&score.metadata)?,
                    format_timestamp(&score.produced_at)
                ],
            )?;

            // Rerunning the pass replaces the version's explainability rows
            // wholesale; the evidence_locations cascade off the items.
            tx.execute(
                "DELETE FROM diff_attributions WHERE version_id = ?1",
                params![commit.version_id],
            )?;
            tx.execute(
                "DELETE FROM evidence_items WHERE version_id = ?1",
                params![commit.version_id],
            )?;

            let mut location_rows: Vec<(String, i64, i64)> = Vec::new();
            for item in &score.evidence {
                tx.execute(
                    "INSERT INTO evidence_items
                     (version_id, evidence_id, key, rule_id, severity, description,
                      raw_value, evidence_json, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        commit.version_id,
                        item.id,
                        item.key,
                        item.rule_id,
                        item.severity.as_str(),
                        item.description,
                        item.raw_value,
                        serde_json::to_string(item)?,
                        format_timestamp(&now)
                    ],
                )?;
                let item_row_id = tx.last_insert_rowid();

                if item.locations.is_empty() {
                    tx.execute(
                        "INSERT INTO evidence_locations (item_row_id, location_index)
                         VALUES (?1, -1)",
                        params![item_row_id],
                    )?;
                    location_rows.push((item.id.clone(), -1, tx.last_insert_rowid()));
                } else {
                    for (index, location) in item.locations.iter().enumerate() {
                        tx.execute(
                            "INSERT INTO evidence_locations
                             (item_row_id, location_index, selector, xpath, node_id, file_path,
                              byte_start, byte_end, line_start, line_end, confidence, note)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                            params![
                                item_row_id,
                                index as i64,
                                location.selector,
                                location.xpath,
                                location.node_id,
                                location.file_path,
                                location.byte_start.map(|v| v as i64),
                                location.byte_end.map(|v| v as i64),
                                location.line_start.map(|v| v as i64),
                                location.line_end.map(|v| v as i64),
                                location.confidence,
                                location.note
                            ],
                        )?;
                        location_rows.push((item.id.clone(), index as i64, tx.last_insert_rowid()));
                    }
                }
            }

            for row in &attributions {
                let location_row_id = location_rows
                    .iter()
                    .find(|(id, index, _)| *id == row.evidence_id && *index == row.location_index)
                    .map(|(_, _, row_id)| *row_id);
                tx.execute(
                    "INSERT INTO diff_attributions
                     (version_id, diff_id, evidence_id, location_row_id, location_index,
                      chunk_index, weight, contribution_pct, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        commit.version_id,
                        commit.diff_id,
                        row.evidence_id,
                        location_row_id,
                        row.location_index,
                        row.chunk_index,
                        row.weight,
                        row.contribution_pct,
                        format_timestamp(&now)
                    ],
                )?;
            }

            tx.commit()?;
        }

        if let Some(parent) = &commit.parent_version_id {
            match self.get_score(parent).await? {
                Some(parent_score) => tracing::info!(
                    "version {} scored {:.3} (delta {:+.3} vs parent {parent})",
                    commit.version_id,
                    score.score,
                    score.score - parent_score.score
                ),
                None => tracing::info!(
                    "version {} scored {:.3} (parent {parent} unscored)",
                    commit.version_id,
                    score.score
                ),
            }
        }

        Ok(Some(StoredScore {
            version_id: commit.version_id.clone(),
            score: score.score,
            normalized_score: score.normalized_score,
            confidence: score.confidence,
            algo_version: score.algo_version,
            evidence: score.evidence,
            matched_rules: score.matched_rules,
            features: score.features,
            metadata: score.metadata,
            produced_at: score.produced_at,
        }))
    }

    /// Score a version detached from its original commit: the head snapshot
    /// context (body, diff) is reloaded from storage.
    pub async fn score_version(
        &self,
        version_id: &str,
        options: &ScoreOptions,
    ) -> Result<Option<StoredScore>> {
        let version = self.get_version(version_id).await?;
        let snapshots = self.get_snapshots(version_id).await?;
        let Some(snapshot) = snapshots.first() else {
            return Err(MokuError::NotFound(format!(
                "version {version_id} has no snapshots"
            )));
        };
        if snapshots.len() > 1 {
            tracing::debug!(
                "version {version_id} has {} snapshots; scoring {}",
                snapshots.len(),
                snapshot.file_path
            );
        }

        let commit = CommitResult {
            version_id: version.id,
            parent_version_id: version.parent_id,
            snapshot_id: snapshot.id.clone(),
            url: snapshot.url.clone(),
            file_path: snapshot.file_path.clone(),
            blob_id: snapshot.blob_id.clone(),
            body: Bytes::from(snapshot.body.clone()),
            diff_id: None,
            diff_json: None,
        };
        self.score_commit(&commit, options).await
    }

    /// Stored score for a version, or `None` when it was never scored.
    pub async fn get_score(&self, version_id: &str) -> Result<Option<StoredScore>> {
        let conn = self.conn().await;
        let row: Option<(f64, i64, f64, String, String, String, String, String)> = conn
            .query_row(
                "SELECT score, normalized_score, confidence, algo_version,
                        matched_rules_json, features_json, meta_json, produced_at
                 FROM score_results WHERE version_id = ?1",
                params![version_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            )
            .optional()?;
        let Some((score, normalized, confidence, algo, rules, features, meta, produced)) = row
        else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT evidence_json FROM evidence_items WHERE version_id = ?1 ORDER BY id",
        )?;
        let evidence = stmt
            .query_map(params![version_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .iter()
            .map(|json| serde_json::from_str(json))
            .collect::<std::result::Result<Vec<EvidenceItem>, _>>()?;

        Ok(Some(StoredScore {
            version_id: version_id.to_string(),
            score,
            normalized_score: normalized,
            confidence,
            algo_version: algo,
            evidence,
            matched_rules: serde_json::from_str(&rules)?,
            features: serde_json::from_str(&features)?,
            metadata: serde_json::from_str(&meta)?,
            produced_at: parse_timestamp(&produced)?,
        }))
    }

    /// Stored score for the version owning a snapshot.
    pub async fn get_score_for_snapshot(&self, snapshot_id: &str) -> Result<Option<StoredScore>> {
        let version_id: Option<String> = {
            let conn = self.conn().await;
            conn.query_row(
                "SELECT version_id FROM version_snapshots WHERE snapshot_id = ?1 LIMIT 1",
                params![snapshot_id],
                |row| row.get(0),
            )
            .optional()?
        };
        match version_id {
            Some(version_id) => self.get_score(&version_id).await,
            None => Err(MokuError::NotFound(format!("snapshot {snapshot_id}"))),
        }
    }

    /// Attribution rows for a version, in insertion order.
    pub async fn get_attributions(&self, version_id: &str) -> Result<Vec<AttributionRecord>> {
        let conn = self.conn().await;
        let mut stmt = conn.prepare(
            "SELECT id, version_id, diff_id, evidence_id, location_row_id, location_index,
                    chunk_index, weight, contribution_pct
             FROM diff_attributions WHERE version_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![version_id], |row| {
                Ok(AttributionRecord {
                    id: row.get(0)?,
                    version_id: row.get(1)?,
                    diff_id: row.get(2)?,
                    evidence_id: row.get(3)?,
                    location_row_id: row.get(4)?,
                    location_index: row.get(5)?,
                    chunk_index: row.get(6)?,
                    weight: row.get(7)?,
                    contribution_pct: row.get(8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Body-diff chunks for the commit's file, from the in-memory combined
    /// diff when the commit carried one, else from the diff cache.
    async fn load_diff_chunks(&self, commit: &CommitResult) -> Result<Option<Vec<DiffChunk>>> {
        if let Some(json) = &commit.diff_json {
            let combined: CombinedDiff = serde_json::from_str(json)?;
            return Ok(Some(combined.body_diff.chunks));
        }
        let Some(parent) = &commit.parent_version_id else {
            return Ok(None);
        };

        let stored: Option<String> = {
            let conn = self.conn().await;
            conn.query_row(
                "SELECT diff_json FROM diffs
                 WHERE base_version_id = ?1 AND head_version_id = ?2
                 ORDER BY created_at DESC LIMIT 1",
                params![parent, commit.version_id],
                |row| row.get(0),
            )
            .optional()?
        };
        let Some(json) = stored else {
            return Ok(None);
        };

        // Single-file rows hold the combined diff itself; multi-file rows
        // hold the aggregate keyed by file path.
        if let Ok(combined) = serde_json::from_str::<CombinedDiff>(&json) {
            return Ok(Some(combined.body_diff.chunks));
        }
        let aggregate: MultiFileDiff = serde_json::from_str(&json)?;
        Ok(aggregate
            .get(&commit.file_path)
            .map(|combined| combined.body_diff.chunks.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::{EvidenceItem, EvidenceLocation, Severity};

    /// Severity parses leniently and serializes lowercase.
    #[test]
    fn severity_string_forms() {
        assert_eq!(Severity::from("CRITICAL"), Severity::Critical);
        assert_eq!(Severity::from("medium"), Severity::Medium);
        assert_eq!(Severity::from("weird"), Severity::Unknown);
        assert_eq!(serde_json::to_value(Severity::High).unwrap(), "high");
        let back: Severity = serde_json::from_value(serde_json::json!("low")).unwrap();
        assert_eq!(back, Severity::Low);
        let unknown: Severity = serde_json::from_value(serde_json::json!("future-tier")).unwrap();
        assert_eq!(unknown, Severity::Unknown);
    }

    /// Evidence items round-trip through the audit JSON stored per row.
    #[test]
    fn evidence_item_json_roundtrip() {
        let item = EvidenceItem {
            id: "ev-9".to_string(),
            key: "eval-call".to_string(),
            rule_id: "R42".to_string(),
            severity: Severity::High,
            description: "eval() observed in inline script".to_string(),
            raw_value: Some("eval(atob(...))".to_string()),
            locations: vec![EvidenceLocation {
                selector: Some("script".to_string()),
                byte_start: Some(120),
                byte_end: Some(180),
                confidence: Some(0.9),
                ..Default::default()
            }],
        };
        let json = serde_json::to_string(&item).unwrap();
        let back: EvidenceItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }

    /// Locations omitted from the wire form default to empty.
    #[test]
    fn evidence_item_minimal_json() {
        let back: EvidenceItem = serde_json::from_value(serde_json::json!({
            "id": "ev-1",
            "key": "k",
            "rule_id": "R1",
            "severity": "low",
            "description": "d"
        }))
        .unwrap();
        assert!(back.locations.is_empty());
        assert!(back.raw_value.is_none());
    }
}
