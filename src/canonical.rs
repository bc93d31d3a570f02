//! URL canonicalization.
//!
//! Produces the stable key used for snapshot and endpoint deduplication:
//! lowercase scheme and host, default port stripped, dot segments resolved,
//! fragment dropped, tracking parameters removed (honoring an allowlist),
//! remaining query parameters sorted lexicographically by key, and the
//! trailing slash optionally stripped. Inputs without a scheme get the
//! configured default.

use url::Url;

use crate::config::CanonicalizeOptions;
use crate::errors::{MokuError, Result};

/// Query parameters dropped when `drop_tracking_params` is enabled, in
/// addition to any `utm_*` key.
const TRACKING_PARAMS: &[&str] = &[
    "gclid", "fbclid", "msclkid", "dclid", "yclid", "igshid", "mc_cid", "mc_eid", "_ga",
];

fn is_tracking_param(key: &str, opts: &CanonicalizeOptions) -> bool {
    if opts
        .tracking_param_allowlist
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(key))
    {
        return false;
    }
    let lower = key.to_ascii_lowercase();
    lower.starts_with("utm_") || TRACKING_PARAMS.contains(&lower.as_str())
}

/// Canonicalize `raw` under `opts`.
///
/// Fails with `InvalidUrl` on empty input or parse failure.
pub fn canonicalize(raw: &str, opts: &CanonicalizeOptions) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(MokuError::InvalidUrl(
            raw.to_string(),
            "empty input".to_string(),
        ));
    }

    // Scheme-less inputs like "example.com/path" get the configured default.
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{}://{}", opts.default_scheme, trimmed)
    };

    // Url::parse lowercases scheme and host, strips default ports for known
    // schemes, and resolves `.`/`..` path segments.
    let mut url = Url::parse(&with_scheme)
        .map_err(|e| MokuError::InvalidUrl(raw.to_string(), e.to_string()))?;

    url.set_fragment(None);

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut kept: Vec<(String, String)> = pairs
        .into_iter()
        .filter(|(k, _)| !(opts.drop_tracking_params && is_tracking_param(k, opts)))
        .collect();
    // Stable sort: duplicate keys keep their original value order.
    kept.sort_by(|a, b| a.0.cmp(&b.0));

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    if opts.strip_trailing_slash {
        let path = url.path();
        // The root path keeps its slash; everything else loses trailing ones.
        if path != "/" && path.ends_with('/') {
            let trimmed = path.trim_end_matches('/').to_string();
            url.set_path(&trimmed);
        }
    }

    Ok(url.to_string())
}

/// Derive the working-tree file path for a canonical URL: the URL path with
/// leading/trailing slashes removed, "" for the root. Dot segments are
/// filtered again here so the returned path can never escape the engine
/// root.
pub fn file_path_for(canonical_url: &str) -> Result<String> {
    let url = Url::parse(canonical_url)
        .map_err(|e| MokuError::InvalidUrl(canonical_url.to_string(), e.to_string()))?;
    let segments: Vec<&str> = url
        .path()
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .collect();
    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::{canonicalize, file_path_for};
    use crate::config::CanonicalizeOptions;
    use crate::errors::MokuError;

    fn opts() -> CanonicalizeOptions {
        CanonicalizeOptions::default()
    }

    /// Host and scheme are lowercased, default port and fragment dropped,
    /// query sorted, trailing slash stripped.
    #[test]
    fn full_normalization() {
        let got = canonicalize("HTTP://Example.COM:80/bar/?b=2&a=1#frag", &opts()).unwrap();
        assert_eq!(got, "http://example.com/bar?a=1&b=2");
    }

    /// An already-canonical URL maps to itself.
    #[test]
    fn canonical_fixed_point() {
        let url = "http://example.com/bar?a=1&b=2";
        assert_eq!(canonicalize(url, &opts()).unwrap(), url);
    }

    /// Default https port is stripped, non-default ports survive.
    #[test]
    fn port_handling() {
        assert_eq!(
            canonicalize("https://example.com:443/x", &opts()).unwrap(),
            "https://example.com/x"
        );
        assert_eq!(
            canonicalize("https://example.com:8443/x", &opts()).unwrap(),
            "https://example.com:8443/x"
        );
    }

    /// Dot segments are resolved before the key is formed.
    #[test]
    fn dot_segments_resolved() {
        assert_eq!(
            canonicalize("https://example.com/a/b/../c/./d", &opts()).unwrap(),
            "https://example.com/a/c/d"
        );
    }

    /// utm_* and known click IDs are dropped; the allowlist overrides.
    #[test]
    fn tracking_params() {
        assert_eq!(
            canonicalize(
                "https://example.com/p?utm_source=tw&id=5&gclid=XYZ",
                &opts()
            )
            .unwrap(),
            "https://example.com/p?id=5"
        );

        let mut allow = opts();
        allow.tracking_param_allowlist = vec!["utm_source".to_string()];
        assert_eq!(
            canonicalize("https://example.com/p?utm_source=tw&utm_medium=m", &allow).unwrap(),
            "https://example.com/p?utm_source=tw"
        );
    }

    /// Disabling drop_tracking_params keeps everything (still sorted).
    #[test]
    fn tracking_drop_disabled() {
        let mut o = opts();
        o.drop_tracking_params = false;
        assert_eq!(
            canonicalize("https://example.com/p?utm_b=2&a=1", &o).unwrap(),
            "https://example.com/p?a=1&utm_b=2"
        );
    }

    /// Scheme-less input gets the configured default scheme.
    #[test]
    fn default_scheme_applied() {
        assert_eq!(
            canonicalize("example.com/foo", &opts()).unwrap(),
            "https://example.com/foo"
        );
        let mut http = opts();
        http.default_scheme = "http".to_string();
        assert_eq!(
            canonicalize("example.com", &http).unwrap(),
            "http://example.com/"
        );
    }

    /// The root path keeps its slash even with stripping enabled.
    #[test]
    fn root_slash_kept() {
        assert_eq!(
            canonicalize("https://example.com/", &opts()).unwrap(),
            "https://example.com/"
        );
    }

    /// Empty and unparseable inputs fail with InvalidUrl.
    #[test]
    fn invalid_inputs() {
        assert!(matches!(
            canonicalize("", &opts()),
            Err(MokuError::InvalidUrl(..))
        ));
        assert!(matches!(
            canonicalize("http://", &opts()),
            Err(MokuError::InvalidUrl(..))
        ));
    }

    /// file_path is the slash-trimmed path, "" for the root.
    #[test]
    fn file_paths() {
        assert_eq!(file_path_for("https://example.com/").unwrap(), "");
        assert_eq!(file_path_for("https://example.com/a/b").unwrap(), "a/b");
        assert_eq!(file_path_for("https://example.com/a/b?q=1").unwrap(), "a/b");
    }
}
