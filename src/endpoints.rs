//! Endpoint index: discovered URLs and their fetch lifecycle.
//!
//! The canonical form is the unique key. `add_endpoints` deduplicates via
//! `INSERT OR IGNORE` and reports which canonicals were actually new;
//! re-adding a known URL only bumps `last_discovered_at`. Status moves
//! through new → pending → fetched/failed; failure reasons live inside the
//! JSON `meta` column. Batch variants update many rows inside one
//! transaction.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, Transaction, params};
use url::Url;
use uuid::Uuid;

use crate::canonical;
use crate::errors::{MokuError, Result};
use crate::store::{Engine, format_timestamp, parse_timestamp};

/// Endpoint fetch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    New,
    Pending,
    Fetched,
    Failed,
}

impl EndpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointStatus::New => "new",
            EndpointStatus::Pending => "pending",
            EndpointStatus::Fetched => "fetched",
            EndpointStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for EndpointStatus {
    type Err = MokuError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(EndpointStatus::New),
            "pending" => Ok(EndpointStatus::Pending),
            "fetched" => Ok(EndpointStatus::Fetched),
            "failed" => Ok(EndpointStatus::Failed),
            other => Err(MokuError::InvalidInput(format!(
                "unknown endpoint status `{other}`"
            ))),
        }
    }
}

/// One discovered URL with its fetch bookkeeping.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: String,
    pub raw_url: String,
    pub canonical_url: String,
    pub host: String,
    pub path: String,
    pub first_discovered_at: DateTime<Utc>,
    pub last_discovered_at: DateTime<Utc>,
    pub last_fetched_version: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub status: EndpointStatus,
    pub discovery_source: Option<String>,
    pub meta: serde_json::Value,
}

impl Engine {
    /// Register raw URLs discovered from `source`.
    ///
    /// Returns the canonical forms that were new to the index, in input
    /// order. Unparseable URLs are logged and skipped; the rest of the batch
    /// proceeds.
    pub async fn add_endpoints(&self, raw_urls: &[String], source: &str) -> Result<Vec<String>> {
        let now = format_timestamp(&Utc::now());
        let mut created = Vec::new();

        let mut conn = self.conn().await;
        let tx = conn.transaction()?;
        for raw in raw_urls {
            let canonical_url = match canonical::canonicalize(raw, &self.config().canonicalize) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("skipping undiscoverable endpoint `{raw}`: {e}");
                    continue;
                }
            };
            let (host, path) = host_and_path(&canonical_url);

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO endpoints
                 (id, raw_url, canonical_url, host, path, first_discovered_at,
                  last_discovered_at, status, discovery_source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 'new', ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    raw,
                    canonical_url,
                    host,
                    path,
                    now,
                    source
                ],
            )?;
            if inserted == 1 {
                created.push(canonical_url);
            } else {
                tx.execute(
                    "UPDATE endpoints SET last_discovered_at = ?1 WHERE canonical_url = ?2",
                    params![now, canonical_url],
                )?;
            }
        }
        tx.commit()?;
        Ok(created)
    }

    /// Mark one endpoint pending.
    pub async fn mark_pending(&self, canonical_url: &str) -> Result<()> {
        let conn = self.conn().await;
        let updated = conn.execute(
            "UPDATE endpoints SET status = 'pending' WHERE canonical_url = ?1",
            params![canonical_url],
        )?;
        if updated == 0 {
            return Err(MokuError::NotFound(format!("endpoint {canonical_url}")));
        }
        Ok(())
    }

    /// Mark many endpoints pending in one transaction. Unknown canonicals
    /// are ignored.
    pub async fn mark_pending_batch(&self, canonical_urls: &[String]) -> Result<()> {
        let mut conn = self.conn().await;
        let tx = conn.transaction()?;
        for canonical_url in canonical_urls {
            tx.execute(
                "UPDATE endpoints SET status = 'pending' WHERE canonical_url = ?1",
                params![canonical_url],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Mark one endpoint fetched into `version_id`.
    pub async fn mark_fetched(
        &self,
        canonical_url: &str,
        version_id: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn().await;
        let tx = conn.transaction()?;
        let updated = mark_fetched_tx(&tx, canonical_url, version_id, &fetched_at)?;
        tx.commit()?;
        if updated == 0 {
            return Err(MokuError::NotFound(format!("endpoint {canonical_url}")));
        }
        Ok(())
    }

    /// Mark many endpoints fetched into the same version, one transaction.
    pub async fn mark_fetched_batch(
        &self,
        canonical_urls: &[String],
        version_id: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn().await;
        let tx = conn.transaction()?;
        for canonical_url in canonical_urls {
            mark_fetched_tx(&tx, canonical_url, version_id, &fetched_at)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Mark one endpoint failed, recording the reason in `meta`.
    pub async fn mark_failed(&self, canonical_url: &str, reason: &str) -> Result<()> {
        let now = format_timestamp(&Utc::now());
        let mut conn = self.conn().await;
        let tx = conn.transaction()?;

        let meta: Option<String> = tx
            .query_row(
                "SELECT meta FROM endpoints WHERE canonical_url = ?1",
                params![canonical_url],
                |row| row.get(0),
            )
            .optional()?;
        let Some(meta) = meta else {
            return Err(MokuError::NotFound(format!("endpoint {canonical_url}")));
        };

        let mut doc: serde_json::Value =
            serde_json::from_str(&meta).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(map) = doc.as_object_mut() {
            map.insert("failure_reason".to_string(), serde_json::json!(reason));
            map.insert("failed_at".to_string(), serde_json::json!(now));
        }

        tx.execute(
            "UPDATE endpoints SET status = 'failed', meta = ?1 WHERE canonical_url = ?2",
            params![serde_json::to_string(&doc)?, canonical_url],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Endpoints newest-first by last discovery, optionally filtered by
    /// status. A non-positive `limit` defaults to 10.
    pub async fn list_endpoints(
        &self,
        status: Option<EndpointStatus>,
        limit: i64,
    ) -> Result<Vec<Endpoint>> {
        let limit = if limit <= 0 { 10 } else { limit };
        let conn = self.conn().await;
        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "{ENDPOINT_SELECT} WHERE status = ?1
                     ORDER BY last_discovered_at DESC, id LIMIT ?2"
                ))?;
                stmt.query_map(params![status.as_str(), limit], endpoint_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{ENDPOINT_SELECT} ORDER BY last_discovered_at DESC, id LIMIT ?1"
                ))?;
                stmt.query_map(params![limit], endpoint_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        rows.into_iter().map(Endpoint::try_from).collect()
    }
}

const ENDPOINT_SELECT: &str = "SELECT id, raw_url, canonical_url, host, path, \
     first_discovered_at, last_discovered_at, last_fetched_version, last_fetched_at, \
     status, discovery_source, meta FROM endpoints";

fn mark_fetched_tx(
    tx: &Transaction<'_>,
    canonical_url: &str,
    version_id: &str,
    fetched_at: &DateTime<Utc>,
) -> Result<usize> {
    let updated = tx.execute(
        "UPDATE endpoints SET status = 'fetched', last_fetched_version = ?1,
         last_fetched_at = ?2 WHERE canonical_url = ?3",
        params![version_id, format_timestamp(fetched_at), canonical_url],
    )?;
    Ok(updated)
}

fn host_and_path(canonical_url: &str) -> (String, String) {
    match Url::parse(canonical_url) {
        Ok(url) => (
            url.host_str().unwrap_or_default().to_string(),
            url.path().to_string(),
        ),
        Err(_) => (String::new(), String::new()),
    }
}

/// Raw endpoint row before timestamp/status parsing.
struct EndpointRow {
    id: String,
    raw_url: String,
    canonical_url: String,
    host: String,
    path: String,
    first_discovered_at: String,
    last_discovered_at: String,
    last_fetched_version: Option<String>,
    last_fetched_at: Option<String>,
    status: String,
    discovery_source: Option<String>,
    meta: String,
}

fn endpoint_row(row: &Row<'_>) -> rusqlite::Result<EndpointRow> {
    Ok(EndpointRow {
        id: row.get(0)?,
        raw_url: row.get(1)?,
        canonical_url: row.get(2)?,
        host: row.get(3)?,
        path: row.get(4)?,
        first_discovered_at: row.get(5)?,
        last_discovered_at: row.get(6)?,
        last_fetched_version: row.get(7)?,
        last_fetched_at: row.get(8)?,
        status: row.get(9)?,
        discovery_source: row.get(10)?,
        meta: row.get(11)?,
    })
}

impl TryFrom<EndpointRow> for Endpoint {
    type Error = MokuError;

    fn try_from(row: EndpointRow) -> Result<Endpoint> {
        Ok(Endpoint {
            id: row.id,
            raw_url: row.raw_url,
            canonical_url: row.canonical_url,
            host: row.host,
            path: row.path,
            first_discovered_at: parse_timestamp(&row.first_discovered_at)?,
            last_discovered_at: parse_timestamp(&row.last_discovered_at)?,
            last_fetched_version: row.last_fetched_version,
            last_fetched_at: row
                .last_fetched_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            status: row.status.parse()?,
            discovery_source: row.discovery_source,
            meta: serde_json::from_str(&row.meta).unwrap_or_else(|_| serde_json::json!({})),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{EndpointStatus, host_and_path};
    use crate::errors::MokuError;

    /// Status strings round-trip through as_str/FromStr.
    #[test]
    fn status_roundtrip() {
        for status in [
            EndpointStatus::New,
            EndpointStatus::Pending,
            EndpointStatus::Fetched,
            EndpointStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<EndpointStatus>().unwrap(), status);
        }
        assert!(matches!(
            "bogus".parse::<EndpointStatus>(),
            Err(MokuError::InvalidInput(_))
        ));
    }

    /// Host and path are split out of the canonical form for indexing.
    #[test]
    fn host_path_split() {
        let (host, path) = host_and_path("https://example.com/a/b?q=1");
        assert_eq!(host, "example.com");
        assert_eq!(path, "/a/b");
    }
}
