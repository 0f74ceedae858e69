//! Hostname normalization
//!
//! Every hostname that reaches the store, the blacklist set or a cache key
//! goes through [`normalize_host`] first, so `WWW.Reddit.com.` and
//! `www.reddit.com` are the same policy subject.

use crate::error::{PolicyError, Result};

/// Canonical form of a hostname: trimmed, ASCII-lowercased, trailing dot removed.
///
/// Empty names and names containing whitespace, `/` or the blacklist
/// delimiter `,` are rejected.
pub fn normalize_host(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);

    if trimmed.is_empty()
        || trimmed
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == ',')
    {
        return Err(PolicyError::InvalidHost(raw.to_string()));
    }

    Ok(trimmed.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("example.com", "example.com")]
    #[case("WWW.Reddit.COM", "www.reddit.com")]
    #[case("  news.ycombinator.com  ", "news.ycombinator.com")]
    #[case("facebook.com.", "facebook.com")]
    #[case("[::1]", "[::1]")]
    fn test_normalize_accepts(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalize_host(raw).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case(".")]
    #[case("a.example,b.example")]
    #[case("evil.example/path")]
    #[case("two words")]
    fn test_normalize_rejects(#[case] raw: &str) {
        assert!(matches!(normalize_host(raw), Err(PolicyError::InvalidHost(_))));
    }
}
