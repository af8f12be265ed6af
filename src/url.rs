/// Canonical form of a contribution URL.
///
/// A contribution URL may point at the object itself
/// (`https://github.com/<repo>/pull/<id>`) or at an event on it
/// (`https://github.com/<repo>/pull/<id>#issuecomment-<id>`). Stripping the
/// fragment yields one canonical URL per object, so distinct-counting over
/// it collapses every comment/review on the same pull request to one.
pub fn canonical_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string()
        }
        // Not an absolute URL; truncate at the first '#' directly.
        Err(_) => raw.split('#').next().unwrap_or(raw).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_fragment() {
        assert_eq!(
            canonical_url("https://github.com/x/y/pull/1#issuecomment-9"),
            "https://github.com/x/y/pull/1"
        );
    }

    #[test]
    fn test_no_fragment_unchanged() {
        assert_eq!(
            canonical_url("https://github.com/x/y/pull/1"),
            "https://github.com/x/y/pull/1"
        );
    }

    #[test]
    fn test_idempotent() {
        for raw in [
            "https://github.com/x/y/pull/1#issuecomment-9",
            "https://github.com/x/y/pull/1",
            "not a url#frag",
            "",
        ] {
            let once = canonical_url(raw);
            assert_eq!(canonical_url(&once), once);
        }
    }

    #[test]
    fn test_non_url_truncates_at_hash() {
        assert_eq!(canonical_url("not a url#frag"), "not a url");
        assert_eq!(canonical_url(""), "");
    }

    #[test]
    fn test_review_thread_fragment() {
        assert_eq!(
            canonical_url("https://github.com/x/y/pull/42#discussion_r100"),
            canonical_url("https://github.com/x/y/pull/42#pullrequestreview-7")
        );
    }
}
