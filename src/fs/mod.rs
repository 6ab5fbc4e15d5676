//! The virtual-filesystem projection: hierarchical paths mapped onto the
//! account → container → object model, with pseudo directories.
//!
//! Each operation issues the smallest possible backend sequence. Error kinds
//! pass through so the FTP and SFTP surfaces can apply their own mappings;
//! nothing is swallowed here except where an operation is defined to retry.

pub mod listing;
pub mod path;
pub mod stat;

pub use listing::{get_full_listing, DirEntry};
pub use stat::{swift_stat, SwiftStat, DIRECTORY_CONTENT_TYPE};

use crate::swift::{
    Error, ErrorKind, Headers, ListingQuery, RequestBody, Result, SwiftBody, SwiftConnection,
};
use crate::transfer::{DownloadReceiver, UploadSender};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Parsed attributes of one backend entity (account, container or object),
/// the raw material for a synthetic stat.
#[derive(Debug, Clone)]
pub struct EntityProps {
    /// Content type; directories are `application/directory`.
    pub content_type: String,
    /// Size in bytes.
    pub size: u64,
    /// Backend modification timestamp, when reported.
    pub last_modified: Option<String>,
    /// Entity tag, when reported.
    pub etag: Option<String>,
}

impl EntityProps {
    /// Props of a synthesized pseudo directory.
    pub fn directory() -> Self {
        EntityProps {
            content_type: DIRECTORY_CONTENT_TYPE.to_string(),
            size: 0,
            last_modified: None,
            etag: None,
        }
    }

    fn from_object_headers(headers: &Headers) -> Self {
        EntityProps {
            content_type: headers
                .get("content-type")
                .cloned()
                .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string()),
            size: headers
                .get("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            last_modified: headers.get("last-modified").cloned(),
            etag: headers.get("etag").cloned(),
        }
    }

    fn from_container_headers(headers: &Headers) -> Self {
        EntityProps {
            content_type: DIRECTORY_CONTENT_TYPE.to_string(),
            size: headers
                .get("x-container-bytes-used")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            last_modified: None,
            etag: None,
        }
    }

    fn from_account_headers(headers: &Headers) -> Self {
        EntityProps {
            content_type: DIRECTORY_CONTENT_TYPE.to_string(),
            size: headers
                .get("x-account-bytes-used")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            last_modified: None,
            etag: None,
        }
    }

    /// Whether these props describe a directory-like entity.
    pub fn is_dir(&self) -> bool {
        self.content_type == DIRECTORY_CONTENT_TYPE
    }

    /// The synthetic stat for these props.
    pub fn stat(&self) -> SwiftStat {
        swift_stat(
            Some(self.content_type.as_str()),
            self.size,
            self.last_modified.as_deref(),
        )
    }
}

/// Treats one authenticated Swift connection as a filesystem.
#[derive(Debug, Clone)]
pub struct SwiftFilesystem {
    conn: Arc<SwiftConnection>,
}

impl SwiftFilesystem {
    /// Binds a filesystem view to a connection.
    pub fn new(conn: Arc<SwiftConnection>) -> Self {
        SwiftFilesystem { conn }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Arc<SwiftConnection> {
        &self.conn
    }

    /// Attributes of any path. For object paths that 404, a one-entry
    /// prefix listing decides between a synthetic directory and NotFound,
    /// so pseudo directories that exist only as prefixes still stat.
    pub async fn get_attrs(&self, vpath: &str) -> Result<EntityProps> {
        let (container, object) = path::split(vpath);
        match (container, object) {
            (Some(container), Some(object)) => {
                match self.conn.head_object(&container, &object).await {
                    Ok(headers) => Ok(EntityProps::from_object_headers(&headers)),
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        let query = ListingQuery {
                            prefix: Some(format!("{}/", object)),
                            limit: Some(1),
                            ..Default::default()
                        };
                        let children = self.conn.get_container(&container, &query).await?;
                        if children.is_empty() {
                            Err(Error::from(ErrorKind::NotFound))
                        } else {
                            Ok(EntityProps::directory())
                        }
                    }
                    Err(e) => Err(e),
                }
            }
            (Some(container), None) => {
                let headers = self.conn.head_container(&container).await?;
                Ok(EntityProps::from_container_headers(&headers))
            }
            (None, _) => {
                let headers = self.conn.head_account().await?;
                Ok(EntityProps::from_account_headers(&headers))
            }
        }
    }

    /// Full collapsed listing of an account or container level path.
    pub async fn list(&self, vpath: &str) -> Result<BTreeMap<String, DirEntry>> {
        let (container, object) = path::split(vpath);
        get_full_listing(&self.conn, container.as_deref(), object.as_deref()).await
    }

    /// Creates a directory: a container at the first level, otherwise a
    /// zero-length `application/directory` object.
    pub async fn make_directory(&self, vpath: &str) -> Result<()> {
        let (container, object) = path::split(vpath);
        match (container, object) {
            (Some(container), Some(object)) => {
                let headers = vec![(
                    "Content-Type".to_string(),
                    DIRECTORY_CONTENT_TYPE.to_string(),
                )];
                self.conn
                    .put_object(&container, &object, &headers, RequestBody::Empty)
                    .await?;
                Ok(())
            }
            (Some(container), None) => self.conn.put_container(&container, &[]).await,
            (None, _) => Err(Error::from(ErrorKind::NotImplemented)),
        }
    }

    /// Removes a directory object or a container. Deleting a container that
    /// just emptied can race replication, so a Conflict waits two seconds
    /// and retries once; a second Conflict surfaces.
    pub async fn remove_directory(&self, vpath: &str) -> Result<()> {
        let (container, object) = path::split(vpath);
        match (container, object) {
            (Some(container), Some(object)) => self.conn.delete_object(&container, &object).await,
            (Some(container), None) => {
                match self.conn.delete_container(&container).await {
                    Err(e) if e.kind() == ErrorKind::Conflict => {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        self.conn.delete_container(&container).await
                    }
                    other => other,
                }
            }
            (None, _) => Err(Error::from(ErrorKind::NotImplemented)),
        }
    }

    /// Deletes an object. Container and account level paths are invalid
    /// here. NotFound surfaces; the SFTP surface swallows it (clients retry
    /// deletes) while FTP reports it, by design.
    pub async fn remove_file(&self, vpath: &str) -> Result<()> {
        let (container, object) = path::split(vpath);
        match (container, object) {
            (Some(container), Some(object)) => self.conn.delete_object(&container, &object).await,
            _ => Err(Error::from(ErrorKind::NotImplemented)),
        }
    }

    /// Renames an object via server-side copy plus delete. Containers can
    /// only be "renamed" destructively (DELETE + PUT, metadata is lost) and
    /// anything with children is refused: the backend has no recursive
    /// rename.
    pub async fn rename(&self, oldpath: &str, newpath: &str) -> Result<()> {
        let (container, object) = path::split(oldpath);
        let (new_container, new_object) = path::split(newpath);
        let (container, new_container) = match (container, new_container) {
            (Some(container), Some(new_container)) => (container, new_container),
            _ => return Err(Error::from(ErrorKind::NotImplemented)),
        };

        if object.is_none() && new_object.is_none() {
            if container == new_container {
                return Ok(());
            }
            warn!(
                from = %container,
                to = %new_container,
                "container rename recreates the container; container metadata is lost"
            );
            self.conn.delete_container(&container).await?;
            self.conn.put_container(&new_container, &[]).await?;
            return Ok(());
        }

        let object = object.unwrap_or_default();
        let new_object = new_object.unwrap_or_default();

        let exists = match self.conn.head_object(&container, &object).await {
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };

        let query = ListingQuery {
            prefix: Some(format!("{}/", object)),
            limit: Some(1),
            ..Default::default()
        };
        let children = self.conn.get_container(&container, &query).await?;
        if !children.is_empty() {
            // A pseudo directory with children: no recursive rename.
            return Err(Error::from(ErrorKind::NotImplemented));
        }
        if !exists {
            return Err(Error::from(ErrorKind::NotFound));
        }

        let copy_from = vec![(
            "X-Copy-From".to_string(),
            format!("{}/{}", container, object),
        )];
        self.conn
            .put_object(&new_container, &new_object, &copy_from, RequestBody::Empty)
            .await?;
        self.conn.delete_object(&container, &object).await
    }

    /// HEADs an object, confirming it exists and yielding its props.
    /// Container and account level paths are directories, not files.
    pub async fn check_file(&self, vpath: &str) -> Result<EntityProps> {
        let (container, object) = path::split(vpath);
        match (container, object) {
            (Some(container), Some(object)) => {
                let headers = self.conn.head_object(&container, &object).await?;
                Ok(EntityProps::from_object_headers(&headers))
            }
            _ => Err(Error::from(ErrorKind::IsADirectory)),
        }
    }

    /// Creates a zero-byte object.
    pub async fn touch_file(&self, vpath: &str) -> Result<()> {
        let (container, object) = path::split(vpath);
        match (container, object) {
            (Some(container), Some(object)) => {
                self.conn
                    .put_object(&container, &object, &[], RequestBody::Empty)
                    .await?;
                Ok(())
            }
            _ => Err(Error::from(ErrorKind::IsADirectory)),
        }
    }

    /// Starts a streaming GET of an object. A non-zero offset becomes a
    /// `Range: bytes=<offset>-` header; the stream owns the connection's
    /// throttle slot until it completes.
    pub async fn start_download_body(&self, vpath: &str, offset: u64) -> Result<SwiftBody> {
        let (container, object) = path::split(vpath);
        let (container, object) = match (container, object) {
            (Some(container), Some(object)) => (container, object),
            _ => return Err(Error::from(ErrorKind::IsADirectory)),
        };
        let mut headers = Vec::new();
        if offset > 0 {
            headers.push(("Range".to_string(), format!("bytes={}-", offset)));
        }
        let response = self.conn.get_object(&container, &object, &headers).await?;
        Ok(response.into_stream())
    }

    /// Starts a buffered download for pull-oriented reads. `size` is the
    /// object's total size, normally taken from the preceding
    /// [`check_file`](Self::check_file).
    pub async fn start_file_download(
        &self,
        vpath: &str,
        offset: u64,
        size: u64,
    ) -> Result<DownloadReceiver> {
        let body = self.start_download_body(vpath, offset).await?;
        Ok(DownloadReceiver::spawn(body, size))
    }

    /// Prepares an upload into an object. The PUT starts lazily on the
    /// first write. Writing to a container or the account root is not a
    /// thing.
    pub fn start_file_upload(&self, vpath: &str) -> Result<UploadSender> {
        let (container, object) = path::split(vpath);
        match (container, object) {
            (Some(container), Some(object)) => Ok(UploadSender::new(
                Arc::clone(&self.conn),
                &container,
                &object,
            )),
            _ => Err(Error::from(ErrorKind::NotImplemented)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn object_props_from_head() {
        let props = EntityProps::from_object_headers(&headers(&[
            ("content-length", "1024"),
            ("content-type", "image/png"),
            ("last-modified", "Wed, 15 Jan 2014 16:41:49 GMT"),
            ("etag", "abc123"),
        ]));
        assert_eq!(props.size, 1024);
        assert_eq!(props.content_type, "image/png");
        assert!(!props.is_dir());
        assert_eq!(props.etag.as_deref(), Some("abc123"));
        assert!(props.stat().size == 1024);
    }

    #[test]
    fn directory_object_props_stat_as_directory() {
        let props = EntityProps::from_object_headers(&headers(&[
            ("content-length", "0"),
            ("content-type", "application/directory"),
        ]));
        assert!(props.is_dir());
        assert!(props.stat().is_dir());
    }

    #[test]
    fn container_and_account_props_are_directories() {
        let container = EntityProps::from_container_headers(&headers(&[
            ("x-container-bytes-used", "2048"),
            ("x-container-object-count", "3"),
        ]));
        assert!(container.is_dir());
        assert_eq!(container.size, 2048);

        let account = EntityProps::from_account_headers(&headers(&[
            ("x-account-bytes-used", "4096"),
            ("x-account-container-count", "2"),
        ]));
        assert!(account.is_dir());
        assert_eq!(account.size, 4096);
    }

    #[test]
    fn synthetic_directory_props() {
        let props = EntityProps::directory();
        let stat = props.stat();
        assert!(stat.is_dir());
        assert_eq!(stat.size, 0);
        assert_eq!(stat.mode & 0o777, 0o700);
    }
}
