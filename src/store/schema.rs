//! SQLite schema, pragmas, and migrations for the metadata catalog.
//!
//! The schema version lives in `meta` under the `schema_version` key.
//! Migrations apply in order on open; each version is one DDL batch.

use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 1;

/// Apply connection pragmas. Must run before any DDL so auto_vacuum takes
/// effect on a fresh database file.
pub fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA auto_vacuum = INCREMENTAL;
         PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA cache_size = -64000;
         PRAGMA temp_store = MEMORY;",
    )?;
    Ok(())
}

/// Read a value from the `meta` table.
pub fn meta_get(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(value)
}

/// Insert or replace a value in the `meta` table.
pub fn meta_set(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn current_version(conn: &Connection) -> Result<i64> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;
    Ok(meta_get(conn, "schema_version")?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

/// Apply all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    let current = current_version(conn)?;
    if current >= SCHEMA_VERSION {
        return Ok(());
    }
    for version in (current + 1)..=SCHEMA_VERSION {
        tracing::info!("applying schema migration to version {version}");
        match version {
            1 => migrate_v1(conn)?,
            _ => unreachable!("unknown schema version {version}"),
        }
        meta_set(conn, "schema_version", &version.to_string())?;
    }
    Ok(())
}

/// Initial schema: snapshots, versions and their membership relation, diff
/// cache, scoring output, and the endpoint index.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE snapshots (
            id TEXT PRIMARY KEY,
            status_code INTEGER NOT NULL,
            url TEXT NOT NULL,
            file_path TEXT NOT NULL,
            blob_id TEXT NOT NULL,
            headers_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX idx_snapshots_url ON snapshots(url);
        CREATE INDEX idx_snapshots_blob ON snapshots(blob_id);
        CREATE INDEX idx_snapshots_created ON snapshots(created_at);

        CREATE TABLE versions (
            id TEXT PRIMARY KEY,
            parent_id TEXT REFERENCES versions(id),
            message TEXT NOT NULL,
            author TEXT,
            timestamp TEXT NOT NULL
        );

        CREATE INDEX idx_versions_parent ON versions(parent_id);
        CREATE INDEX idx_versions_timestamp ON versions(timestamp);

        CREATE TABLE version_snapshots (
            version_id TEXT NOT NULL REFERENCES versions(id) ON DELETE CASCADE,
            snapshot_id TEXT NOT NULL REFERENCES snapshots(id) ON DELETE CASCADE,
            PRIMARY KEY (version_id, snapshot_id)
        );

        CREATE INDEX idx_version_snapshots_snapshot ON version_snapshots(snapshot_id);

        CREATE TABLE diffs (
            id TEXT PRIMARY KEY,
            base_version_id TEXT NOT NULL,
            head_version_id TEXT NOT NULL,
            diff_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX idx_diffs_pair ON diffs(base_version_id, head_version_id);

        CREATE TABLE score_results (
            version_id TEXT PRIMARY KEY REFERENCES versions(id) ON DELETE CASCADE,
            score REAL NOT NULL,
            normalized_score INTEGER NOT NULL,
            confidence REAL NOT NULL,
            algo_version TEXT NOT NULL,
            matched_rules_json TEXT NOT NULL,
            features_json TEXT NOT NULL,
            meta_json TEXT NOT NULL,
            produced_at TEXT NOT NULL
        );

        CREATE TABLE evidence_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version_id TEXT NOT NULL REFERENCES versions(id) ON DELETE CASCADE,
            evidence_id TEXT NOT NULL,
            key TEXT NOT NULL,
            rule_id TEXT NOT NULL,
            severity TEXT NOT NULL,
            description TEXT NOT NULL,
            raw_value TEXT,
            evidence_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX idx_evidence_items_version ON evidence_items(version_id);

        CREATE TABLE evidence_locations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            item_row_id INTEGER NOT NULL REFERENCES evidence_items(id) ON DELETE CASCADE,
            location_index INTEGER NOT NULL,
            selector TEXT,
            xpath TEXT,
            node_id TEXT,
            file_path TEXT,
            byte_start INTEGER,
            byte_end INTEGER,
            line_start INTEGER,
            line_end INTEGER,
            confidence REAL,
            note TEXT
        );

        CREATE INDEX idx_evidence_locations_item ON evidence_locations(item_row_id);

        CREATE TABLE diff_attributions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version_id TEXT NOT NULL REFERENCES versions(id) ON DELETE CASCADE,
            diff_id TEXT,
            evidence_id TEXT NOT NULL,
            location_row_id INTEGER REFERENCES evidence_locations(id),
            location_index INTEGER NOT NULL,
            chunk_index INTEGER NOT NULL,
            weight REAL NOT NULL,
            contribution_pct REAL NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX idx_diff_attributions_version ON diff_attributions(version_id);

        CREATE TABLE endpoints (
            id TEXT PRIMARY KEY,
            raw_url TEXT NOT NULL,
            canonical_url TEXT NOT NULL UNIQUE,
            host TEXT NOT NULL,
            path TEXT NOT NULL,
            first_discovered_at TEXT NOT NULL,
            last_discovered_at TEXT NOT NULL,
            last_fetched_version TEXT,
            last_fetched_at TEXT,
            status TEXT NOT NULL DEFAULT 'new',
            discovery_source TEXT,
            meta TEXT NOT NULL DEFAULT '{}'
        );

        CREATE INDEX idx_endpoints_host ON endpoints(host);
        CREATE INDEX idx_endpoints_status ON endpoints(status);
        ",
    )?;
    Ok(())
}
