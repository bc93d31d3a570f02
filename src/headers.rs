//! HTTP header normalization.
//!
//! Normalization is pure: names are lowercased, values trimmed and emptied
//! out, value lists sorted except for order-sensitive names, and sensitive
//! names collapsed to a single `[REDACTED]` value when redaction is enabled.
//! Normalizing twice yields the same result as normalizing once.

use std::collections::BTreeMap;

/// Normalized headers: lowercase name to ordered value list. `BTreeMap`
/// keeps serialization deterministic.
pub type Headers = BTreeMap<String, Vec<String>>;

/// Replacement value for sensitive headers.
pub const REDACTED: &str = "[REDACTED]";

/// Names whose value order carries meaning and must be preserved.
const ORDER_SENSITIVE: &[&str] = &["set-cookie", "www-authenticate", "proxy-authenticate"];

/// Names whose values are credentials or session material.
const SENSITIVE: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "proxy-authorization",
    "www-authenticate",
    "proxy-authenticate",
    "x-api-key",
    "x-auth-token",
];

/// Whether `name` (already lowercased) keeps its original value order.
pub fn is_order_sensitive(name: &str) -> bool {
    ORDER_SENSITIVE.contains(&name)
}

/// Whether `name` (already lowercased) is redacted when redaction is on.
pub fn is_sensitive(name: &str) -> bool {
    SENSITIVE.contains(&name)
}

/// Normalize a raw header mapping.
///
/// Names that differ only in case are merged; their values concatenate in
/// iteration order before sorting applies.
pub fn normalize<'a, I, V>(raw: I, redact: bool) -> Headers
where
    I: IntoIterator<Item = (&'a str, V)>,
    V: IntoIterator<Item = &'a str>,
{
    let mut out: Headers = BTreeMap::new();
    for (name, values) in raw {
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() {
            continue;
        }
        let entry = out.entry(name).or_default();
        for value in values {
            let value = value.trim();
            if !value.is_empty() {
                entry.push(value.to_string());
            }
        }
    }

    out.retain(|_, values| !values.is_empty());

    for (name, values) in out.iter_mut() {
        if redact && is_sensitive(name) {
            *values = vec![REDACTED.to_string()];
        } else if !is_order_sensitive(name) {
            values.sort();
        }
    }

    out
}

/// Normalize an already-normalized map (idempotence helper for re-reads of
/// stored headers).
pub fn renormalize(headers: &Headers, redact: bool) -> Headers {
    normalize(
        headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.iter().map(|s| s.as_str()))),
        redact,
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use quickcheck::quickcheck;

    use super::{Headers, REDACTED, normalize, renormalize};

    fn norm(pairs: &[(&str, &[&str])], redact: bool) -> Headers {
        normalize(
            pairs.iter().map(|(k, v)| (*k, v.iter().copied())),
            redact,
        )
    }

    /// Names are lowercased and values trimmed; empties disappear.
    #[test]
    fn lowercase_trim_drop_empty() {
        let got = norm(
            &[
                ("Content-Type", &["  text/html  "] as &[&str]),
                ("X-Empty", &["", "   "]),
            ],
            true,
        );
        let mut want: Headers = BTreeMap::new();
        want.insert("content-type".into(), vec!["text/html".into()]);
        assert_eq!(got, want);
    }

    /// Insignificant value order is sorted; set-cookie order is preserved.
    #[test]
    fn sorting_and_order_sensitivity() {
        let got = norm(
            &[
                ("Accept", &["text/plain", "application/json"] as &[&str]),
                ("Set-Cookie", &["z=1", "a=2"]),
            ],
            false,
        );
        assert_eq!(
            got["accept"],
            vec!["application/json".to_string(), "text/plain".to_string()]
        );
        assert_eq!(got["set-cookie"], vec!["z=1".to_string(), "a=2".to_string()]);
    }

    /// Sensitive names collapse to a single [REDACTED] value.
    #[test]
    fn redaction_on() {
        let got = norm(
            &[
                ("Authorization", &["Bearer xyz"] as &[&str]),
                ("Cookie", &["s=1", "t=2"]),
            ],
            true,
        );
        assert_eq!(got["authorization"], vec![REDACTED.to_string()]);
        assert_eq!(got["cookie"], vec![REDACTED.to_string()]);
    }

    /// Redaction can be disabled.
    #[test]
    fn redaction_off() {
        let got = norm(&[("Authorization", &["Bearer xyz"] as &[&str])], false);
        assert_eq!(got["authorization"], vec!["Bearer xyz".to_string()]);
    }

    /// Case-differing duplicate names are merged before sorting.
    #[test]
    fn duplicate_names_merge() {
        let got = norm(
            &[
                ("Accept", &["text/plain"] as &[&str]),
                ("accept", &["application/json"]),
            ],
            true,
        );
        assert_eq!(
            got["accept"],
            vec!["application/json".to_string(), "text/plain".to_string()]
        );
    }

    quickcheck! {
        /// normalize(normalize(h)) == normalize(h) for arbitrary inputs,
        /// with and without redaction.
        fn idempotent(raw: Vec<(String, Vec<String>)>, redact: bool) -> bool {
            let once = normalize(
                raw.iter().map(|(k, v)| (k.as_str(), v.iter().map(|s| s.as_str()))),
                redact,
            );
            renormalize(&once, redact) == once
        }
    }
}
