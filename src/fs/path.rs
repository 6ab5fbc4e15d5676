//! The virtual path model: a '/'-separated path maps onto the three tier
//! Swift namespace (account → container → object).

/// Splits a virtual path into its `(container, object)` pair.
///
/// Leading and trailing slashes are trimmed and empty segments collapsed,
/// then the remainder is split once on '/'. No container means the account
/// root; no object means a container level path.
pub fn split(path: &str) -> (Option<String>, Option<String>) {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return (None, None);
    }
    let container = segments[0].to_string();
    if segments.len() == 1 {
        (Some(container), None)
    } else {
        (Some(container), Some(segments[1..].join("/")))
    }
}

/// Joins a `(container, object)` pair back into the canonical form
/// `/container[/object]`. The account root is `/`.
pub fn join(container: Option<&str>, object: Option<&str>) -> String {
    let mut path = String::from("/");
    if let Some(container) = container {
        path.push_str(container);
        if let Some(object) = object {
            path.push('/');
            path.push_str(object);
        }
    }
    path
}

/// Canonicalizes a virtual path: `join(split(p))`.
pub fn canonical(path: &str) -> String {
    let (container, object) = split(path);
    join(container.as_deref(), object.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn splits_account_container_object() {
        assert_eq!(split(""), (None, None));
        assert_eq!(split("/"), (None, None));
        assert_eq!(split("c"), (Some("c".to_string()), None));
        assert_eq!(split("/c/"), (Some("c".to_string()), None));
        assert_eq!(
            split("/c/a/b.dat"),
            (Some("c".to_string()), Some("a/b.dat".to_string()))
        );
    }

    #[test]
    fn collapses_repeated_slashes() {
        assert_eq!(
            split("//c///a//b"),
            (Some("c".to_string()), Some("a/b".to_string()))
        );
    }

    #[test]
    fn join_yields_canonical_form() {
        assert_eq!(join(None, None), "/");
        assert_eq!(join(Some("c"), None), "/c");
        assert_eq!(join(Some("c"), Some("a/b")), "/c/a/b");
    }

    #[test]
    fn split_then_join_roundtrips() {
        for path in ["/", "", "c", "/c", "c/", "/c/o", "c//o/", "//a/b/c//"] {
            let once = canonical(path);
            assert_eq!(canonical(&once), once, "canonical must be idempotent");
        }
        assert_eq!(canonical("c//o/"), "/c/o");
        assert_eq!(canonical("//a/b/c//"), "/a/b/c");
    }

    #[test]
    fn keeps_utf8_segments() {
        assert_eq!(
            split("/контейнер/объект"),
            (
                Some("контейнер".to_string()),
                Some("объект".to_string())
            )
        );
    }
}
