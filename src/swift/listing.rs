//! Wire types for the JSON listing responses (`format=json`).

use serde::Deserialize;

/// One entry of an account listing: a container and its usage counters.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerEntry {
    /// Container name.
    pub name: String,
    /// Number of objects in the container.
    #[serde(default)]
    pub count: u64,
    /// Total bytes used by the container.
    #[serde(default)]
    pub bytes: u64,
}

/// One entry of a container listing. Plain objects carry `name` plus the
/// usual metadata; delimiter collapsing instead produces a `subdir` stub
/// whose only field is the prefix string.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectEntry {
    /// Object name, absent on subdir stubs.
    pub name: Option<String>,
    /// Pseudo directory prefix, present only on subdir stubs.
    pub subdir: Option<String>,
    /// Object size in bytes.
    #[serde(default)]
    pub bytes: u64,
    /// Content type as stored on the object.
    pub content_type: Option<String>,
    /// Last modification timestamp as reported by the backend.
    pub last_modified: Option<String>,
    /// Entity tag of the stored object.
    pub hash: Option<String>,
}

impl ObjectEntry {
    /// Whether this entry is a subdir stub produced by delimiter collapsing.
    pub fn is_subdir(&self) -> bool {
        self.subdir.is_some()
    }

    /// The full backend name of the entry, whichever field carries it.
    pub fn full_name(&self) -> &str {
        self.subdir.as_deref().or(self.name.as_deref()).unwrap_or("")
    }

    /// Last path segment with any trailing '/' stripped; this is the name a
    /// directory listing shows.
    pub fn formatted_name(&self) -> String {
        format_name(self.full_name())
    }
}

pub(crate) fn format_name(full: &str) -> String {
    let trimmed = full.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((_, base)) => base.to_string(),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_object_entries() {
        let json = r#"[
            {"name": "a/b.dat", "bytes": 12, "content_type": "text/plain",
             "last_modified": "2014-01-15T16:41:49.390270",
             "hash": "0f343b0931126a20f133d67c2b018a3b"},
            {"subdir": "a/b/"}
        ]"#;
        let entries: Vec<ObjectEntry> = serde_json::from_str(json).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].is_subdir());
        assert_eq!(entries[0].formatted_name(), "b.dat");
        assert_eq!(entries[0].bytes, 12);
        assert!(entries[1].is_subdir());
        assert_eq!(entries[1].full_name(), "a/b/");
        assert_eq!(entries[1].formatted_name(), "b");
    }

    #[test]
    fn parses_account_entries() {
        let json = r#"[{"name": "photos", "count": 2, "bytes": 2048}]"#;
        let entries: Vec<ContainerEntry> = serde_json::from_str(json).unwrap();
        assert_eq!(entries[0].name, "photos");
        assert_eq!(entries[0].bytes, 2048);
    }

    #[test]
    fn formatted_name_keeps_utf8() {
        assert_eq!(format_name("container/π/ø/"), "ø");
        assert_eq!(format_name("plain"), "plain");
    }
}
