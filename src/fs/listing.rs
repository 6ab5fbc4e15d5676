//! Paginated account/container listings collapsed into one directory view.

use crate::fs::stat::{swift_stat, SwiftStat, DIRECTORY_CONTENT_TYPE};
use crate::swift::{ListingQuery, Result, SwiftConnection};
use std::collections::BTreeMap;

/// One entry of a collapsed directory listing, keyed by its formatted name
/// (last path segment, trailing '/' stripped).
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Full backend name of the entry.
    pub full_name: String,
    /// Size in bytes; zero for containers and subdir stubs.
    pub size: u64,
    /// Content type; subdir stubs and containers are `application/directory`.
    pub content_type: String,
    /// Backend modification timestamp, when reported.
    pub last_modified: Option<String>,
    /// Entity tag, when reported.
    pub etag: Option<String>,
}

impl DirEntry {
    /// The synthetic stat of this entry, derivable without another round-trip.
    pub fn stat(&self) -> SwiftStat {
        swift_stat(
            Some(self.content_type.as_str()),
            self.size,
            self.last_modified.as_deref(),
        )
    }
}

/// Returns the full collapsed listing for an account or container level
/// path, ordered by name. Works for account, container and object prefix
/// listings.
pub async fn get_full_listing(
    conn: &SwiftConnection,
    container: Option<&str>,
    object: Option<&str>,
) -> Result<BTreeMap<String, DirEntry>> {
    match container {
        Some(container) => get_container_listing(conn, container, object).await,
        None => get_account_listing(conn).await,
    }
}

/// Pages through the account listing, advancing the marker to the last seen
/// name until the backend returns an empty page. Containers appear as
/// directories.
pub async fn get_account_listing(conn: &SwiftConnection) -> Result<BTreeMap<String, DirEntry>> {
    let mut entries = BTreeMap::new();
    let mut marker: Option<String> = None;
    loop {
        let query = ListingQuery {
            marker: marker.clone(),
            ..Default::default()
        };
        let page = conn.get_account(&query).await?;
        if page.is_empty() {
            return Ok(entries);
        }
        for container in page {
            marker = Some(container.name.clone());
            entries.insert(
                container.name.clone(),
                DirEntry {
                    full_name: container.name,
                    size: container.bytes,
                    content_type: DIRECTORY_CONTENT_TYPE.to_string(),
                    last_modified: None,
                    etag: None,
                },
            );
        }
    }
}

/// Pages through a container listing with `delimiter=/` and, below a pseudo
/// directory, `prefix=<object>/`. Subdir stubs come back as directory
/// entries named by the stub string.
pub async fn get_container_listing(
    conn: &SwiftConnection,
    container: &str,
    object: Option<&str>,
) -> Result<BTreeMap<String, DirEntry>> {
    let prefix = object.map(|o| format!("{}/", o));
    let mut entries = BTreeMap::new();
    let mut marker: Option<String> = None;
    loop {
        let query = ListingQuery {
            marker: marker.clone(),
            prefix: prefix.clone(),
            delimiter: Some('/'),
            ..Default::default()
        };
        let page = conn.get_container(container, &query).await?;
        if page.is_empty() {
            return Ok(entries);
        }
        for entry in page {
            marker = Some(entry.full_name().to_string());
            let content_type = if entry.is_subdir() {
                DIRECTORY_CONTENT_TYPE.to_string()
            } else {
                entry
                    .content_type
                    .clone()
                    .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string())
            };
            let key = entry.formatted_name();
            if key.is_empty() {
                // A marker object named exactly like the prefix lists as its
                // own child with an empty remainder; it is not a dir entry.
                continue;
            }
            entries.insert(
                key,
                DirEntry {
                    full_name: entry.full_name().to_string(),
                    size: entry.bytes,
                    content_type,
                    last_modified: entry.last_modified.clone(),
                    etag: entry.hash.clone(),
                },
            );
        }
    }
}
