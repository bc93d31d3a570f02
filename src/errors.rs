//! Error types for the Moku engine.
//!
//! This module defines a unified error enumeration used across blob storage,
//! URL canonicalization, commit/checkout paths, queries, scoring, and the
//! ingest pipeline. It integrates with `thiserror` to provide rich `Display`
//! implementations and error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - Storage failures during a commit are fatal for that commit; diff
//!   computation, working-tree writes, HEAD updates, and scoring are
//!   best-effort and are logged instead of surfaced.

use thiserror::Error;

/// Unified error enumeration for the Moku engine.
///
/// - Used across blob I/O, canonicalization, commits, queries and scoring.
/// - Implements `std::error::Error` via `thiserror`.
#[derive(Error, Debug)]
pub enum MokuError {
    /// Caller-supplied input was rejected (nil snapshot, empty message,
    /// empty batch).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// URL could not be canonicalized.
    #[error("The `{0}` is not a valid URL: {1}")]
    InvalidUrl(String, String),

    /// Blob content did not hash to its claimed ID on read.
    #[error("Blob `{0}` failed integrity verification")]
    Integrity(String),

    /// Version, snapshot, diff, or endpoint not present.
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O or transaction failure that is fatal for the operation.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O error from the filesystem layer.
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    /// Error from the metadata database.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON encoding or decoding failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The engine root is bound to a different project ID and force was not
    /// requested.
    #[error("Root is bound to project `{existing}`, refusing to open as `{requested}`")]
    ProjectIdMismatch {
        existing: String,
        requested: String,
    },

    /// Attempted to bind an empty project ID to the engine root.
    #[error("Project ID must not be empty")]
    ProjectIdEmpty,

    /// The assessor returned an error or exceeded its timeout.
    #[error("Scoring failed: {0}")]
    ScoringFailed(String),

    /// The operation was cancelled before completion.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MokuError>;
