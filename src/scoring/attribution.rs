//! Evidence-location → diff-chunk mapping and contribution weighting.
//!
//! For each evidence location the mapper tries, in order: the CSS selector
//! against the head body (when it parses as HTML), the byte range, then the
//! line range. Each strategy extracts a snippet, case-folds and trims it,
//! and returns the first body-diff chunk whose folded content contains it.
//! A location that matches nothing attributes globally (chunk index -1);
//! that is not an error.

use scraper::{Html, Selector};

use crate::diff::DiffChunk;

use super::{EvidenceItem, EvidenceLocation, Severity};

/// Severity weights: critical 5, high 3, medium 2, low/unknown 1.
pub fn severity_weight(severity: Severity) -> f64 {
    match severity {
        Severity::Critical => 5.0,
        Severity::High => 3.0,
        Severity::Medium => 2.0,
        Severity::Low | Severity::Unknown => 1.0,
    }
}

/// One attribution row before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribution {
    pub evidence_id: String,
    /// Index into the evidence item's location list, -1 for the global row.
    pub location_index: i64,
    /// Matched body-diff chunk, -1 when nothing matched.
    pub chunk_index: i64,
    pub weight: f64,
    pub contribution_pct: f64,
}

/// Compute attribution rows for all evidence of one score result.
///
/// `confidence` is the assessor-level confidence; per-location confidences
/// split each item's base weight. Percentages are normalized over the full
/// row set so they sum to 100 whenever any evidence exists.
pub fn compute_attributions(
    evidence: &[EvidenceItem],
    confidence: f64,
    head_body: &[u8],
    chunks: &[DiffChunk],
) -> Vec<Attribution> {
    let mut rows = Vec::new();

    for item in evidence {
        let mut base = severity_weight(item.severity) * confidence;
        if base <= 0.0 {
            base = 1.0;
        }

        if item.locations.is_empty() {
            rows.push(Attribution {
                evidence_id: item.id.clone(),
                location_index: -1,
                chunk_index: -1,
                weight: base,
                contribution_pct: 0.0,
            });
            continue;
        }

        let mut confidences: Vec<f64> = item
            .locations
            .iter()
            .map(|location| location.confidence.unwrap_or(1.0))
            .collect();
        if confidences.iter().sum::<f64>() <= 0.0 {
            confidences = vec![1.0; confidences.len()];
        }
        let sum: f64 = confidences.iter().sum();

        for (index, (location, conf)) in item.locations.iter().zip(&confidences).enumerate() {
            rows.push(Attribution {
                evidence_id: item.id.clone(),
                location_index: index as i64,
                chunk_index: locate_chunk(location, head_body, chunks),
                weight: base * conf / sum,
                contribution_pct: 0.0,
            });
        }
    }

    let total: f64 = rows.iter().map(|row| row.weight).sum();
    if total > 0.0 {
        for row in &mut rows {
            row.contribution_pct = row.weight / total * 100.0;
        }
    }
    rows
}

/// Map one location to a body-diff chunk index, -1 when nothing matches.
pub fn locate_chunk(location: &EvidenceLocation, head_body: &[u8], chunks: &[DiffChunk]) -> i64 {
    if let Some(selector) = &location.selector {
        if let Some(index) = match_selector(selector, head_body, chunks) {
            return index;
        }
    }

    if let (Some(start), Some(end)) = (location.byte_start, location.byte_end) {
        let len = head_body.len();
        let start = start.min(len);
        let end = end.min(len);
        if start < end {
            let snippet = String::from_utf8_lossy(&head_body[start..end]);
            if let Some(index) = find_chunk(&snippet, chunks) {
                return index;
            }
        }
    }

    if let (Some(start), Some(end)) = (location.line_start, location.line_end) {
        if start >= 1 && end >= start {
            let text = String::from_utf8_lossy(head_body);
            let snippet = text
                .lines()
                .skip(start - 1)
                .take(end - start + 1)
                .collect::<Vec<_>>()
                .join("\n");
            if let Some(index) = find_chunk(&snippet, chunks) {
                return index;
            }
        }
    }

    -1
}

/// Selector strategy: select the first matching node, take its inner HTML
/// (text content when empty), and search the chunks for it. Bodies that are
/// not HTML simply fail to match.
fn match_selector(selector: &str, head_body: &[u8], chunks: &[DiffChunk]) -> Option<i64> {
    let selector = Selector::parse(selector).ok()?;
    let document = Html::parse_document(&String::from_utf8_lossy(head_body));
    let element = document.select(&selector).next()?;
    let inner = element.inner_html();
    let snippet = if inner.trim().is_empty() {
        element.text().collect::<String>()
    } else {
        inner
    };
    find_chunk(&snippet, chunks)
}

/// Case-folded, trimmed containment search over chunk contents.
fn find_chunk(snippet: &str, chunks: &[DiffChunk]) -> Option<i64> {
    let needle = snippet.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    chunks
        .iter()
        .position(|chunk| chunk.content.to_lowercase().contains(&needle))
        .map(|index| index as i64)
}

#[cfg(test)]
mod tests {
    use super::{Attribution, compute_attributions, locate_chunk, severity_weight};
    use crate::diff::{ChunkKind, DiffChunk};
    use crate::scoring::{EvidenceItem, EvidenceLocation, Severity};

    fn chunks(contents: &[&str]) -> Vec<DiffChunk> {
        contents
            .iter()
            .map(|content| DiffChunk {
                kind: ChunkKind::Added,
                content: content.to_string(),
            })
            .collect()
    }

    fn item(id: &str, severity: Severity, locations: Vec<EvidenceLocation>) -> EvidenceItem {
        EvidenceItem {
            id: id.to_string(),
            key: format!("{id}-key"),
            rule_id: format!("rule-{id}"),
            severity,
            description: "test evidence".to_string(),
            raw_value: None,
            locations,
        }
    }

    /// Severity map per the weighting scheme.
    #[test]
    fn severity_weights() {
        assert_eq!(severity_weight(Severity::Critical), 5.0);
        assert_eq!(severity_weight(Severity::High), 3.0);
        assert_eq!(severity_weight(Severity::Medium), 2.0);
        assert_eq!(severity_weight(Severity::Low), 1.0);
        assert_eq!(severity_weight(Severity::Unknown), 1.0);
    }

    /// A CSS selector resolves to the chunk containing the node's inner HTML.
    #[test]
    fn selector_matches_chunk() {
        let body = b"<html><body><div id=\"alert\">Eval Detected</div><p>other</p></body></html>";
        let location = EvidenceLocation {
            selector: Some("#alert".to_string()),
            ..Default::default()
        };
        let chunks = chunks(&["unrelated text", "new: eval detected here"]);
        assert_eq!(locate_chunk(&location, body, &chunks), 1);
    }

    /// Byte ranges clamp to the body and fall back when the selector misses.
    #[test]
    fn byte_range_fallback() {
        let body = b"0123456789 SECRET tail";
        let location = EvidenceLocation {
            selector: Some("#does-not-exist".to_string()),
            byte_start: Some(11),
            byte_end: Some(17),
            ..Default::default()
        };
        let chunks = chunks(&["nothing", "found secret value"]);
        assert_eq!(locate_chunk(&location, body, &chunks), 1);
    }

    /// Out-of-range byte offsets are clamped, not errors.
    #[test]
    fn byte_range_clamped() {
        let body = b"short";
        let location = EvidenceLocation {
            byte_start: Some(2),
            byte_end: Some(10_000),
            ..Default::default()
        };
        let chunks = chunks(&["zzz", "has ort inside"]);
        assert_eq!(locate_chunk(&location, body, &chunks), 1);
    }

    /// 1-based inclusive line ranges extract the right lines.
    #[test]
    fn line_range_match() {
        let body = b"line one\nMARKER HERE\nline three";
        let location = EvidenceLocation {
            line_start: Some(2),
            line_end: Some(2),
            ..Default::default()
        };
        let chunks = chunks(&["something", "added marker here today"]);
        assert_eq!(locate_chunk(&location, body, &chunks), 1);
    }

    /// A location that matches nothing attributes globally.
    #[test]
    fn no_match_is_global() {
        let location = EvidenceLocation {
            selector: Some(".missing".to_string()),
            byte_start: Some(0),
            byte_end: Some(4),
            ..Default::default()
        };
        assert_eq!(locate_chunk(&location, b"abcdef", &chunks(&["zzz"])), -1);
    }

    /// Location-less evidence yields one global row at the base weight.
    #[test]
    fn global_row_for_locationless_item() {
        let rows = compute_attributions(
            &[item("e1", Severity::High, vec![])],
            0.8,
            b"",
            &chunks(&["x"]),
        );
        assert_eq!(
            rows,
            vec![Attribution {
                evidence_id: "e1".to_string(),
                location_index: -1,
                chunk_index: -1,
                weight: 3.0 * 0.8,
                contribution_pct: 100.0,
            }]
        );
    }

    /// Two locations with confidences 1.0 and 0.5 split the base weight 2:1
    /// and percentages sum to 100.
    #[test]
    fn confidence_split_two_to_one() {
        let body = b"<p>alpha</p><p>beta</p>";
        let locations = vec![
            EvidenceLocation {
                byte_start: Some(3),
                byte_end: Some(8),
                confidence: Some(1.0),
                ..Default::default()
            },
            EvidenceLocation {
                byte_start: Some(15),
                byte_end: Some(19),
                confidence: Some(0.5),
                ..Default::default()
            },
        ];
        let chunks = chunks(&["added alpha", "added beta"]);
        let rows = compute_attributions(
            &[item("e1", Severity::Medium, locations)],
            1.0,
            body,
            &chunks,
        );

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].chunk_index, 0);
        assert_eq!(rows[1].chunk_index, 1);
        assert!((rows[0].weight / rows[1].weight - 2.0).abs() < 1e-9);
        let pct_sum: f64 = rows.iter().map(|r| r.contribution_pct).sum();
        assert!((pct_sum - 100.0).abs() < 1e-9);
    }

    /// All-zero location confidences are treated as all ones.
    #[test]
    fn zero_confidences_fall_back_to_uniform() {
        let locations = vec![
            EvidenceLocation {
                confidence: Some(0.0),
                ..Default::default()
            },
            EvidenceLocation {
                confidence: Some(0.0),
                ..Default::default()
            },
        ];
        let rows = compute_attributions(
            &[item("e1", Severity::Low, locations)],
            1.0,
            b"",
            &[],
        );
        assert_eq!(rows.len(), 2);
        assert!((rows[0].weight - rows[1].weight).abs() < 1e-9);
        assert!((rows[0].contribution_pct - 50.0).abs() < 1e-9);
    }

    /// A non-positive base weight falls back to 1.
    #[test]
    fn nonpositive_base_defaults_to_one() {
        let rows = compute_attributions(
            &[item("e1", Severity::Critical, vec![])],
            0.0,
            b"",
            &[],
        );
        assert_eq!(rows[0].weight, 1.0);
    }

    /// Percentages across multiple items sum to 100.
    #[test]
    fn percentages_sum_across_items() {
        let rows = compute_attributions(
            &[
                item("e1", Severity::Critical, vec![]),
                item("e2", Severity::Low, vec![]),
            ],
            1.0,
            b"",
            &[],
        );
        let pct_sum: f64 = rows.iter().map(|r| r.contribution_pct).sum();
        assert!((pct_sum - 100.0).abs() < 1e-9);
        assert!(rows[0].contribution_pct > rows[1].contribution_pct);
    }

    /// No evidence yields no rows.
    #[test]
    fn empty_evidence_empty_rows() {
        assert!(compute_attributions(&[], 1.0, b"", &[]).is_empty());
    }
}
