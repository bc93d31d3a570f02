//! Engine, canonicalizer, and ingest configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration. `storage_path` is the engine root under
/// which `.moku/` and the working tree live.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineConfig {
    pub storage_path: PathBuf,
    /// When set, the engine writes this into `meta` on open and refuses to
    /// open a root bound to a different project unless `force_project_id`.
    pub project_id: Option<String>,
    pub force_project_id: bool,
    pub redact_sensitive_headers: bool,
    /// Reserved.
    pub max_history: Option<usize>,
    /// Reserved.
    pub id_prefix: Option<String>,
    pub canonicalize: CanonicalizeOptions,
    pub ingest: IngestConfig,
}

impl EngineConfig {
    /// Configuration with defaults for everything except the root directory.
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            project_id: None,
            force_project_id: false,
            redact_sensitive_headers: true,
            max_history: None,
            id_prefix: None,
            canonicalize: CanonicalizeOptions::default(),
            ingest: IngestConfig::default(),
        }
    }
}

/// URL canonicalization policy.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CanonicalizeOptions {
    /// Scheme applied when the input has none.
    pub default_scheme: String,
    pub strip_trailing_slash: bool,
    pub drop_tracking_params: bool,
    /// Tracking parameters listed here survive `drop_tracking_params`.
    pub tracking_param_allowlist: Vec<String>,
}

impl Default for CanonicalizeOptions {
    fn default() -> Self {
        Self {
            default_scheme: "https".to_string(),
            strip_trailing_slash: true,
            drop_tracking_params: true,
            tracking_param_allowlist: Vec::new(),
        }
    }
}

/// Fetch→commit pipeline tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IngestConfig {
    /// Upper bound on concurrently running fetches.
    pub max_concurrency: usize,
    /// Snapshots grouped into one version per batch commit.
    pub commit_size: usize,
    /// Bound on a single assessor invocation.
    #[serde(with = "duration_secs")]
    pub score_timeout: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            commit_size: 16,
            score_timeout: Duration::from_secs(12),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
