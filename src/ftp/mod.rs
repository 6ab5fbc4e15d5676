//! The FTP surface: a libunftp storage backend over the filesystem
//! projection.
//!
//! libunftp owns the wire protocol (LIST argument stripping, PASV/data
//! socket lifecycle, REST bookkeeping); this backend translates each verb
//! into projection calls and maps error kinds onto FTP reply codes.

use crate::auth::{SwiftAuthDb, SwiftUser};
use crate::config::Config;
use crate::fs::stat::NOBODY;
use crate::fs::EntityProps;
use crate::metrics;
use crate::swift::{ErrorKind as SwiftErrorKind, RequestBody};
use crate::transfer::{into_async_read, IdleTimeoutStream, IDLE_CHUNK_TIMEOUT};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use hyper::Body;
use libunftp::notification::{DataEvent, DataListener, EventMeta, PresenceEvent, PresenceListener};
use libunftp::storage::{Error, ErrorKind, Fileinfo, Metadata, StorageBackend, FEATURE_RESTART, FEATURE_SITEMD5};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::info;

/// Synthetic metadata for a backend entity.
#[derive(Debug, Clone)]
pub struct SwiftMetadata {
    len: u64,
    is_dir: bool,
    modified: SystemTime,
}

impl From<&EntityProps> for SwiftMetadata {
    fn from(props: &EntityProps) -> Self {
        let stat = props.stat();
        SwiftMetadata {
            len: stat.size,
            is_dir: stat.is_dir(),
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(stat.mtime_unix()),
        }
    }
}

impl Metadata for SwiftMetadata {
    fn len(&self) -> u64 {
        self.len
    }

    fn is_dir(&self) -> bool {
        self.is_dir
    }

    fn is_file(&self) -> bool {
        !self.is_dir
    }

    fn is_symlink(&self) -> bool {
        false
    }

    fn modified(&self) -> libunftp::storage::Result<SystemTime> {
        Ok(self.modified)
    }

    fn gid(&self) -> u32 {
        NOBODY
    }

    fn uid(&self) -> u32 {
        NOBODY
    }
}

fn map_error(error: crate::swift::Error) -> Error {
    let kind = match error.kind() {
        SwiftErrorKind::NotFound => ErrorKind::PermanentFileNotAvailable,
        // 502: the verb exists but cannot be applied to this argument.
        SwiftErrorKind::Conflict | SwiftErrorKind::NotImplemented => ErrorKind::CommandNotImplemented,
        SwiftErrorKind::UnAuthenticated | SwiftErrorKind::UnAuthorized => ErrorKind::PermissionDenied,
        SwiftErrorKind::IsADirectory | SwiftErrorKind::IsNotADirectory => {
            ErrorKind::PermanentFileNotAvailable
        }
        SwiftErrorKind::ConnectionLost | SwiftErrorKind::Timeout => ErrorKind::ConnectionClosed,
        _ => ErrorKind::LocalError,
    };
    Error::new(kind, error)
}

fn vpath<P: AsRef<Path>>(path: P) -> String {
    path.as_ref().to_string_lossy().to_string()
}

/// The libunftp storage backend bound to whichever user each call carries.
#[derive(Debug)]
pub struct SwiftBackend;

impl SwiftBackend {
    /// Creates the backend. All state lives on the authenticated user.
    pub fn new() -> Self {
        SwiftBackend
    }
}

impl Default for SwiftBackend {
    fn default() -> Self {
        SwiftBackend::new()
    }
}

#[async_trait]
impl StorageBackend<SwiftUser> for SwiftBackend {
    type Metadata = SwiftMetadata;

    fn supported_features(&self) -> u32 {
        FEATURE_RESTART | FEATURE_SITEMD5
    }

    #[tracing_attributes::instrument(level = "info", skip(self, user), fields(user = %user))]
    async fn metadata<P: AsRef<Path> + Send + Debug>(
        &self,
        user: &SwiftUser,
        path: P,
    ) -> libunftp::storage::Result<Self::Metadata> {
        metrics::count_command("stat");
        let props = user.fs.get_attrs(&vpath(path)).await.map_err(map_error)?;
        Ok(SwiftMetadata::from(&props))
    }

    async fn md5<P: AsRef<Path> + Send + Debug>(
        &self,
        user: &SwiftUser,
        path: P,
    ) -> libunftp::storage::Result<String> {
        // The backend's entity tag is surfaced, never recomputed.
        let props = user.fs.check_file(&vpath(path)).await.map_err(map_error)?;
        props
            .etag
            .ok_or_else(|| Error::from(ErrorKind::CommandNotImplemented))
    }

    #[tracing_attributes::instrument(level = "info", skip(self, user), fields(user = %user))]
    async fn list<P: AsRef<Path> + Send + Debug>(
        &self,
        user: &SwiftUser,
        path: P,
    ) -> libunftp::storage::Result<Vec<Fileinfo<PathBuf, Self::Metadata>>>
    where
        <Self as StorageBackend<SwiftUser>>::Metadata: Metadata,
    {
        metrics::count_command("list");
        let entries = user.fs.list(&vpath(path)).await.map_err(map_error)?;
        Ok(entries
            .into_iter()
            .map(|(name, entry)| {
                let stat = entry.stat();
                Fileinfo {
                    path: PathBuf::from(name),
                    metadata: SwiftMetadata {
                        len: stat.size,
                        is_dir: stat.is_dir(),
                        modified: SystemTime::UNIX_EPOCH
                            + Duration::from_secs(stat.mtime_unix()),
                    },
                }
            })
            .collect())
    }

    #[tracing_attributes::instrument(level = "info", skip(self, user), fields(user = %user))]
    async fn get<P: AsRef<Path> + Send + Debug>(
        &self,
        user: &SwiftUser,
        path: P,
        start_pos: u64,
    ) -> libunftp::storage::Result<Box<dyn tokio::io::AsyncRead + Send + Sync + Unpin>> {
        metrics::count_command("openForReading");
        let path = vpath(path);
        // Pre-flight: the object must exist before the data channel opens.
        user.fs.check_file(&path).await.map_err(map_error)?;
        let body = user
            .fs
            .start_download_body(&path, start_pos)
            .await
            .map_err(map_error)?;
        Ok(into_async_read(IdleTimeoutStream::new(
            body,
            IDLE_CHUNK_TIMEOUT,
        )))
    }

    async fn put<P: AsRef<Path> + Send + Debug, R: tokio::io::AsyncRead + Send + Sync + Unpin + 'static>(
        &self,
        user: &SwiftUser,
        input: R,
        path: P,
        _start_pos: u64,
    ) -> libunftp::storage::Result<u64> {
        metrics::count_command("openForWriting");
        let path = vpath(path);
        let (container, object) = crate::fs::path::split(&path);
        let (container, object) = match (container, object) {
            (Some(container), Some(object)) => (container, object),
            // Uploads to the account root or a bare container are refused.
            _ => return Err(Error::from(ErrorKind::CommandNotImplemented)),
        };

        let written = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&written);
        let reader = tokio::io::BufReader::with_capacity(4096, input);
        let stream = FramedRead::new(reader, BytesCodec::new()).map_ok(move |chunk| {
            let chunk: Bytes = chunk.freeze();
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            metrics::count("transfer.ingress_bytes", chunk.len() as u64);
            chunk
        });

        user.fs
            .connection()
            .put_object(&container, &object, &[], RequestBody::Stream(Body::wrap_stream(stream)))
            .await
            .map_err(map_error)?;
        Ok(written.load(Ordering::Relaxed))
    }

    #[tracing_attributes::instrument(level = "info", skip(self, user), fields(user = %user))]
    async fn del<P: AsRef<Path> + Send + Debug>(
        &self,
        user: &SwiftUser,
        path: P,
    ) -> libunftp::storage::Result<()> {
        metrics::count_command("removeFile");
        // FTP surfaces NotFound on delete; only the SFTP surface swallows it.
        user.fs.remove_file(&vpath(path)).await.map_err(map_error)
    }

    #[tracing_attributes::instrument(level = "info", skip(self, user), fields(user = %user))]
    async fn mkd<P: AsRef<Path> + Send + Debug>(
        &self,
        user: &SwiftUser,
        path: P,
    ) -> libunftp::storage::Result<()> {
        metrics::count_command("makeDirectory");
        user.fs.make_directory(&vpath(path)).await.map_err(map_error)
    }

    #[tracing_attributes::instrument(level = "info", skip(self, user), fields(user = %user))]
    async fn rmd<P: AsRef<Path> + Send + Debug>(
        &self,
        user: &SwiftUser,
        path: P,
    ) -> libunftp::storage::Result<()> {
        metrics::count_command("removeDirectory");
        match user.fs.remove_directory(&vpath(path)).await {
            Ok(()) => Ok(()),
            // Removing a directory that is already gone is not an error.
            Err(e) if e.kind() == SwiftErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_error(e)),
        }
    }

    #[tracing_attributes::instrument(level = "info", skip(self, user), fields(user = %user))]
    async fn rename<P: AsRef<Path> + Send + Debug>(
        &self,
        user: &SwiftUser,
        from: P,
        to: P,
    ) -> libunftp::storage::Result<()> {
        metrics::count_command("rename");
        user.fs
            .rename(&vpath(from), &vpath(to))
            .await
            .map_err(|e| match e.kind() {
                SwiftErrorKind::NotFound => Error::from(ErrorKind::PermanentFileNotAvailable),
                _ => map_error(e),
            })
    }

    #[tracing_attributes::instrument(level = "info", skip(self, user), fields(user = %user))]
    async fn cwd<P: AsRef<Path> + Send + Debug>(
        &self,
        user: &SwiftUser,
        path: P,
    ) -> libunftp::storage::Result<()> {
        metrics::count_command("access");
        let path = vpath(path);
        match user.fs.get_attrs(&path).await {
            Ok(props) if props.is_dir() => Ok(()),
            Ok(_) => Err(Error::from(ErrorKind::PermanentFileNotAvailable)),
            Err(e) if e.kind() == SwiftErrorKind::NotFound => {
                // Containers must exist before anything is uploaded into
                // them; deeper pseudo directories don't have to.
                let (_, object) = crate::fs::path::split(&path);
                if object.is_some() {
                    Ok(())
                } else {
                    Err(Error::from(ErrorKind::PermanentFileNotAvailable))
                }
            }
            Err(e) => Err(map_error(e)),
        }
    }
}

/// Keeps the per-user session count in step with login/logout events.
#[derive(Debug)]
pub struct SessionCounter {
    sessions: Arc<crate::auth::SessionTracker>,
}

#[async_trait]
impl PresenceListener for SessionCounter {
    async fn receive_presence_event(&self, event: PresenceEvent, meta: EventMeta) {
        match event {
            PresenceEvent::LoggedIn => {
                metrics::count("num_clients", 1);
                info!(
                    user = %meta.username,
                    active = self.sessions.active(&meta.username),
                    cap = self.sessions.cap(),
                    "user connected"
                );
            }
            PresenceEvent::LoggedOut => {
                self.sessions.release(&meta.username);
                metrics::count_command("logout");
                info!(
                    user = %meta.username,
                    active = self.sessions.active(&meta.username),
                    cap = self.sessions.cap(),
                    "user disconnected"
                );
            }
        }
    }
}

/// Counts transferred bytes per completed data command.
#[derive(Debug)]
pub struct DataMetrics;

#[async_trait]
impl DataListener for DataMetrics {
    async fn receive_data_event(&self, event: DataEvent, _meta: EventMeta) {
        if let DataEvent::Got { bytes, .. } = event {
            metrics::count("transfer.egress_bytes", bytes);
        }
    }
}

/// Assembles and runs the FTP service.
pub async fn serve(config: Config, authdb: Arc<SwiftAuthDb>) -> Result<(), libunftp::ServerError> {
    let sessions = authdb.sessions();
    let greeting: &'static str = Box::leak(config.welcome_message.clone().into_boxed_str());

    let server = libunftp::Server::with_authenticator(Box::new(SwiftBackend::new), authdb)
        .greeting(greeting)
        .notify_presence(SessionCounter { sessions })
        .notify_data(DataMetrics);

    info!(address = %config.bind_address(), "starting FTP service");
    server.listen(config.bind_address()).await
}
