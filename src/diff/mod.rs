//! Body, header, and combined diff generation.
//!
//! The body diff is a Myers word-level diff over the two bodies as UTF-8,
//! post-processed into merged added/removed runs (equal runs are omitted, so
//! chunk boundaries stay human-meaningful). The header diff compares two
//! normalized header maps into added/removed/changed sets plus the list of
//! redacted names, which never leak into the other three. The combined diff
//! pairs both per file; a multi-file version aggregates combined diffs keyed
//! by file path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use similar::{Algorithm, ChangeTag, TextDiff};

use crate::headers::{Headers, REDACTED};

/// One added or removed run in a body diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffChunk {
    #[serde(rename = "type")]
    pub kind: ChunkKind,
    pub content: String,
}

/// Chunk polarity. Equal runs are never emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Added,
    Removed,
}

/// Body diff between two blobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyDiff {
    pub base_id: String,
    pub head_id: String,
    pub chunks: Vec<DiffChunk>,
}

/// Value transition for a header present on both sides with different lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderValueChange {
    pub from: Vec<String>,
    pub to: Vec<String>,
}

/// Header diff between two normalized header maps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderDiff {
    pub added: BTreeMap<String, Vec<String>>,
    pub removed: BTreeMap<String, Vec<String>>,
    pub changed: BTreeMap<String, HeaderValueChange>,
    pub redacted: Vec<String>,
}

/// Combined per-file diff: one body diff plus one header diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedDiff {
    pub body_diff: BodyDiff,
    pub headers_diff: HeaderDiff,
}

/// Aggregate diff for a multi-file version, keyed by file path.
pub type MultiFileDiff = BTreeMap<String, CombinedDiff>;

/// Compute the body diff between two byte sequences treated as UTF-8.
///
/// Output is deterministic for identical inputs. An empty `base_id` denotes
/// a diff against an empty base, which yields a single added chunk covering
/// the whole head body.
pub fn diff_body(base_id: &str, base: &[u8], head_id: &str, head: &[u8]) -> BodyDiff {
    let base_text = String::from_utf8_lossy(base);
    let head_text = String::from_utf8_lossy(head);

    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .diff_words(&base_text, &head_text);

    let mut chunks = Vec::new();
    let mut removed = String::new();
    let mut added = String::new();
    // Whitespace-only equal runs are held back: if another change follows,
    // they join the surrounding runs instead of splitting them.
    let mut pending_ws = String::new();

    let mut flush = |removed: &mut String, added: &mut String, chunks: &mut Vec<DiffChunk>| {
        if !removed.is_empty() {
            chunks.push(DiffChunk {
                kind: ChunkKind::Removed,
                content: std::mem::take(removed),
            });
        }
        if !added.is_empty() {
            chunks.push(DiffChunk {
                kind: ChunkKind::Added,
                content: std::mem::take(added),
            });
        }
    };

    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Equal => {
                if change.value().trim().is_empty() {
                    pending_ws.push_str(change.value());
                } else {
                    pending_ws.clear();
                    flush(&mut removed, &mut added, &mut chunks);
                }
            }
            tag @ (ChangeTag::Delete | ChangeTag::Insert) => {
                if !pending_ws.is_empty() {
                    if !removed.is_empty() {
                        removed.push_str(&pending_ws);
                    }
                    if !added.is_empty() {
                        added.push_str(&pending_ws);
                    }
                    pending_ws.clear();
                }
                if tag == ChangeTag::Delete {
                    removed.push_str(change.value());
                } else {
                    added.push_str(change.value());
                }
            }
        }
    }
    flush(&mut removed, &mut added, &mut chunks);

    BodyDiff {
        base_id: base_id.to_string(),
        head_id: head_id.to_string(),
        chunks,
    }
}

/// Compare two normalized header maps.
///
/// Names whose stored value is `[REDACTED]` on either side are reported only
/// in `redacted`, never in `added`/`removed`/`changed`.
pub fn diff_headers(base: &Headers, head: &Headers) -> HeaderDiff {
    let mut out = HeaderDiff::default();

    let is_redacted =
        |values: Option<&Vec<String>>| values.is_some_and(|v| v.len() == 1 && v[0] == REDACTED);

    let mut names: Vec<&String> = base.keys().chain(head.keys()).collect();
    names.sort();
    names.dedup();

    for name in names {
        let base_values = base.get(name);
        let head_values = head.get(name);

        if is_redacted(base_values) || is_redacted(head_values) {
            out.redacted.push(name.clone());
            continue;
        }

        match (base_values, head_values) {
            (None, Some(values)) => {
                out.added.insert(name.clone(), values.clone());
            }
            (Some(values), None) => {
                out.removed.insert(name.clone(), values.clone());
            }
            (Some(from), Some(to)) if from != to => {
                out.changed.insert(
                    name.clone(),
                    HeaderValueChange {
                        from: from.clone(),
                        to: to.clone(),
                    },
                );
            }
            _ => {}
        }
    }

    out
}

/// Combined per-file diff pairing the body diff with the header diff.
pub fn diff_combined(
    base_id: &str,
    base_body: &[u8],
    base_headers: &Headers,
    head_id: &str,
    head_body: &[u8],
    head_headers: &Headers,
) -> CombinedDiff {
    CombinedDiff {
        body_diff: diff_body(base_id, base_body, head_id, head_body),
        headers_diff: diff_headers(base_headers, head_headers),
    }
}

#[cfg(test)]
mod tests {
    use super::{ChunkKind, diff_body, diff_combined, diff_headers};
    use crate::headers::{Headers, REDACTED};

    fn headers(pairs: &[(&str, &[&str])]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    /// A one-word change yields one removed and one added chunk.
    #[test]
    fn single_word_change() {
        let diff = diff_body("b1", b"Version 1", "h1", b"Version 2");
        assert_eq!(diff.chunks.len(), 2);
        assert_eq!(diff.chunks[0].kind, ChunkKind::Removed);
        assert!(diff.chunks[0].content.contains('1'));
        assert_eq!(diff.chunks[1].kind, ChunkKind::Added);
        assert!(diff.chunks[1].content.contains('2'));
    }

    /// Identical bodies produce no chunks.
    #[test]
    fn equal_bodies_no_chunks() {
        let diff = diff_body("a", b"same content here", "b", b"same content here");
        assert!(diff.chunks.is_empty());
    }

    /// An empty base yields one added chunk covering the whole head body.
    #[test]
    fn empty_base_single_added_chunk() {
        let diff = diff_body("", b"", "h", b"<html>fresh page</html>");
        assert_eq!(diff.chunks.len(), 1);
        assert_eq!(diff.chunks[0].kind, ChunkKind::Added);
        assert_eq!(diff.chunks[0].content, "<html>fresh page</html>");
    }

    /// Adjacent changed words merge into a single run per polarity.
    #[test]
    fn adjacent_runs_merge() {
        let diff = diff_body("a", b"keep alpha beta keep", "b", b"keep gamma delta keep");
        assert_eq!(diff.chunks.len(), 2);
        assert_eq!(diff.chunks[0].content, "alpha beta");
        assert_eq!(diff.chunks[1].content, "gamma delta");
    }

    /// Identical inputs produce identical chunk sequences across calls.
    #[test]
    fn deterministic_output() {
        let a = diff_body("x", b"one two three", "y", b"one 2 three four");
        let b = diff_body("x", b"one two three", "y", b"one 2 three four");
        assert_eq!(a, b);
    }

    /// Added/removed/changed are populated per the rename-and-change case.
    #[test]
    fn header_diff_shapes() {
        let base = headers(&[
            ("content-type", &["text/html"] as &[&str]),
            ("server", &["nginx/1.20"]),
        ]);
        let head = headers(&[
            ("content-type", &["application/json"] as &[&str]),
            ("cache-control", &["no-cache"]),
        ]);
        let diff = diff_headers(&base, &head);

        assert_eq!(diff.added["cache-control"], vec!["no-cache".to_string()]);
        assert_eq!(diff.removed["server"], vec!["nginx/1.20".to_string()]);
        let change = &diff.changed["content-type"];
        assert_eq!(change.from, vec!["text/html".to_string()]);
        assert_eq!(change.to, vec!["application/json".to_string()]);
        assert!(diff.redacted.is_empty());
    }

    /// Diffing a map against itself is empty apart from redacted names.
    #[test]
    fn header_diff_self_is_empty() {
        let h = headers(&[
            ("content-type", &["text/html"] as &[&str]),
            ("authorization", &[REDACTED]),
        ]);
        let diff = diff_headers(&h, &h);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        assert!(diff.changed.is_empty());
        assert_eq!(diff.redacted, vec!["authorization".to_string()]);
    }

    /// Redacted names never appear in added/removed/changed, even when only
    /// one side carries them.
    #[test]
    fn redacted_never_leaks() {
        let base = headers(&[("cookie", &[REDACTED] as &[&str])]);
        let head = headers(&[("authorization", &[REDACTED] as &[&str])]);
        let diff = diff_headers(&base, &head);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        assert!(diff.changed.is_empty());
        assert_eq!(
            diff.redacted,
            vec!["authorization".to_string(), "cookie".to_string()]
        );
    }

    /// The combined diff serializes to the documented JSON shape.
    #[test]
    fn combined_json_shape() {
        let base_headers = headers(&[("server", &["nginx"] as &[&str])]);
        let head_headers = headers(&[("server", &["caddy"] as &[&str])]);
        let combined = diff_combined(
            "base-blob",
            b"old body",
            &base_headers,
            "head-blob",
            b"new body",
            &head_headers,
        );

        let json = serde_json::to_value(&combined).unwrap();
        assert_eq!(json["body_diff"]["base_id"], "base-blob");
        assert_eq!(json["body_diff"]["head_id"], "head-blob");
        assert_eq!(json["body_diff"]["chunks"][0]["type"], "removed");
        assert_eq!(json["body_diff"]["chunks"][0]["content"], "old");
        assert_eq!(json["body_diff"]["chunks"][1]["type"], "added");
        assert_eq!(json["body_diff"]["chunks"][1]["content"], "new");
        assert_eq!(json["headers_diff"]["changed"]["server"]["from"][0], "nginx");
        assert_eq!(json["headers_diff"]["changed"]["server"]["to"][0], "caddy");
        assert_eq!(json["headers_diff"]["redacted"], serde_json::json!([]));
    }
}
