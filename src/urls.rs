//! Candidate URL extraction from free text.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

const DEFAULT_SCHEME: &str = "http://";

/// Characters that commonly trail a URL in prose without belonging to it.
const TRAILING_PUNCTUATION: &[char] = &[
    '.', ',', ';', ':', '!', '?', ')', ']', '}', '\'', '"', '>',
];

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:[a-z][a-z0-9+.\-]*://|www\.)[^\s<>"'`]+"#)
        .expect("url pattern is valid")
});

/// Extracts scheme-qualified URLs and bare `www.` hosts from `text`.
///
/// Results are deduplicated and keep first-seen order. Bare hosts get
/// `http://` prepended.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for candidate in URL_RE.find_iter(text) {
        let Some(url) = normalize(candidate.as_str()) else {
            continue;
        };
        if seen.insert(url.clone()) {
            urls.push(url);
        }
    }

    urls
}

fn normalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim_end_matches(TRAILING_PUNCTUATION);

    let url = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{DEFAULT_SCHEME}{trimmed}")
    };

    // Reject a bare scheme or a bare "www." with nothing after it.
    let (_, rest) = url.split_once("://")?;
    let host = rest
        .strip_prefix("www.")
        .or_else(|| rest.strip_prefix("WWW."))
        .unwrap_or(rest);
    if host.is_empty() {
        return None;
    }

    Some(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_input_yields_nothing() {
        assert!(extract_urls("").is_empty());
        assert!(extract_urls("   \n\t").is_empty());
        assert!(extract_urls("no links here, just words.").is_empty());
    }

    #[test]
    fn test_scheme_qualified_urls() {
        assert_eq!(
            extract_urls("see http://evil.test/x and https://ok.example/path?q=1"),
            vec!["http://evil.test/x", "https://ok.example/path?q=1"]
        );
    }

    #[test]
    fn test_bare_www_hosts_get_default_scheme() {
        assert_eq!(
            extract_urls("visit www.example.com/deals today"),
            vec!["http://www.example.com/deals"]
        );
    }

    #[test]
    fn test_trailing_punctuation_is_stripped() {
        assert_eq!(
            extract_urls("Go to (http://a.test/page). Or http://b.test, or www.c.test!"),
            vec!["http://a.test/page", "http://b.test", "http://www.c.test"]
        );
    }

    #[test]
    fn test_duplicates_keep_first_position() {
        assert_eq!(
            extract_urls("http://b.test http://a.test http://b.test www.a.test http://a.test"),
            vec!["http://b.test", "http://a.test", "http://www.a.test"]
        );
    }

    #[test]
    fn test_empty_hosts_are_skipped() {
        assert!(extract_urls("http:// and www. alone").is_empty());
    }

    #[test]
    fn test_other_schemes_are_kept() {
        assert_eq!(
            extract_urls("ftp://files.test/a.zip"),
            vec!["ftp://files.test/a.zip"]
        );
    }
}
