//! Per-connection SSH handler and the SFTP protocol session behind it.

use crate::auth::{SessionTracker, SwiftAuthDb, SwiftUser};
use crate::fs::stat::SwiftStat;
use crate::fs::{path as vpath, EntityProps};
use crate::metrics;
use crate::swift::ErrorKind as SwiftErrorKind;
use crate::transfer::{DownloadReceiver, UploadSender};
use async_trait::async_trait;
use bytes::Bytes;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, Disconnect, MethodSet};
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One SSH connection. Sessions opening a shell are disconnected; the only
/// supported channel use is the `sftp` subsystem.
pub struct SshHandler {
    authdb: Arc<SwiftAuthDb>,
    sessions: Arc<SessionTracker>,
    user: Option<Arc<SwiftUser>>,
    counted_username: Option<String>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl SshHandler {
    pub(crate) fn new(authdb: Arc<SwiftAuthDb>) -> Self {
        let sessions = authdb.sessions();
        SshHandler {
            authdb,
            sessions,
            user: None,
            counted_username: None,
            channels: HashMap::new(),
        }
    }
}

impl Drop for SshHandler {
    fn drop(&mut self) {
        // Connection gone, free the user's session slot.
        if let Some(username) = self.counted_username.take() {
            self.sessions.release(&username);
        }
    }
}

#[async_trait]
impl russh::server::Handler for SshHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.authdb.login(user, password).await {
            Ok(swift_user) => {
                if !self.sessions.try_acquire(user) {
                    warn!(
                        user,
                        active = self.sessions.active(user),
                        cap = self.sessions.cap(),
                        "too many connections for user"
                    );
                    return Ok(Auth::Reject {
                        proceed_with_methods: None,
                    });
                }
                self.counted_username = Some(user.to_string());
                metrics::count_command("login");
                info!(
                    user,
                    active = self.sessions.active(user),
                    cap = self.sessions.cap(),
                    "user connected"
                );
                self.user = Some(Arc::new(swift_user));
                Ok(Auth::Accept)
            }
            Err(e) => {
                debug!(user, "authentication failed: {}", e);
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &russh_keys::key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::PASSWORD),
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // No shells here; drop the connection right away.
        session.channel_failure(channel_id);
        session.disconnect(Disconnect::ByApplication, "shell access is not supported", "");
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel_id);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            debug!(subsystem = name, "unsupported subsystem");
            session.channel_failure(channel_id);
            return Ok(());
        }
        let user = match &self.user {
            Some(user) => Arc::clone(user),
            None => {
                session.channel_failure(channel_id);
                return Ok(());
            }
        };
        let channel = match self.channels.remove(&channel_id) {
            Some(channel) => channel,
            None => {
                session.channel_failure(channel_id);
                return Ok(());
            }
        };
        session.channel_success(channel_id);
        tokio::spawn(russh_sftp::server::run(
            channel.into_stream(),
            SftpSession::new(user),
        ));
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel_id);
        Ok(())
    }
}

struct FileHandle {
    path: String,
    props: EntityProps,
    download: Option<DownloadReceiver>,
    upload: Option<UploadSender>,
}

struct DirHandle {
    files: Vec<File>,
    served: bool,
}

/// The SFTP protocol session for one authenticated user.
pub struct SftpSession {
    user: Arc<SwiftUser>,
    version: Option<u32>,
    next_handle: u64,
    files: HashMap<String, FileHandle>,
    dirs: HashMap<String, DirHandle>,
}

impl SftpSession {
    /// Creates a session bound to an authenticated user.
    pub fn new(user: Arc<SwiftUser>) -> Self {
        SftpSession {
            user,
            version: None,
            next_handle: 0,
            files: HashMap::new(),
            dirs: HashMap::new(),
        }
    }

    fn log_command(&self, command: &str, args: &str) {
        metrics::count_command(command);
        // Arguments are truncated so a hostile path cannot flood the log.
        let args: String = args.chars().take(256).collect();
        info!(user = %self.user.username, "cmd: {}({})", command, args);
    }

    fn allocate_handle(&mut self) -> String {
        self.next_handle += 1;
        self.next_handle.to_string()
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

fn failure_status(id: u32, message: &str) -> Status {
    Status {
        id,
        status_code: StatusCode::Failure,
        error_message: message.to_string(),
        language_tag: "en-US".to_string(),
    }
}

fn status_for(kind: SwiftErrorKind) -> StatusCode {
    match kind {
        SwiftErrorKind::NotFound => StatusCode::NoSuchFile,
        SwiftErrorKind::UnAuthenticated | SwiftErrorKind::UnAuthorized => {
            StatusCode::PermissionDenied
        }
        SwiftErrorKind::ConnectionLost | SwiftErrorKind::Timeout => StatusCode::ConnectionLost,
        SwiftErrorKind::NotImplemented => StatusCode::OpUnsupported,
        _ => StatusCode::Failure,
    }
}

fn attrs_from_stat(stat: SwiftStat) -> FileAttributes {
    FileAttributes {
        size: Some(stat.size),
        uid: Some(stat.uid),
        gid: Some(stat.gid),
        permissions: Some(stat.mode),
        atime: Some(stat.mtime_unix() as u32),
        mtime: Some(stat.mtime_unix() as u32),
        ..Default::default()
    }
}

fn directory_attrs() -> FileAttributes {
    attrs_from_stat(EntityProps::directory().stat())
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        if self.version.is_some() {
            return Err(StatusCode::ConnectionLost);
        }
        self.version = Some(version);
        self.log_command("gotVersion", &format!("{}, {:?}", version, extensions));
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        self.log_command("openFile", &format!("{}, {:?}", filename, pflags));
        let path = vpath::canonical(&filename);

        let props = match self.user.fs.check_file(&path).await {
            Ok(props) => props,
            Err(e) if e.kind() == SwiftErrorKind::NotFound => {
                if pflags.intersects(OpenFlags::CREATE | OpenFlags::TRUNCATE) {
                    // Bring the object into existence so a stat between
                    // open and the first write sees it.
                    match self.user.fs.touch_file(&path).await {
                        Ok(()) => EntityProps {
                            content_type: mime::APPLICATION_OCTET_STREAM.to_string(),
                            size: 0,
                            last_modified: None,
                            etag: None,
                        },
                        // The enclosing container does not exist.
                        Err(e) if e.kind() == SwiftErrorKind::NotFound => {
                            return Err(StatusCode::Failure);
                        }
                        Err(e) => return Err(status_for(e.kind())),
                    }
                } else {
                    return Err(StatusCode::NoSuchFile);
                }
            }
            Err(e) if e.kind() == SwiftErrorKind::IsADirectory => {
                return Err(StatusCode::Failure);
            }
            Err(e) => return Err(status_for(e.kind())),
        };

        let handle = self.allocate_handle();
        self.files.insert(
            handle.clone(),
            FileHandle {
                path,
                props,
                download: None,
                upload: None,
            },
        );
        Ok(Handle { id, handle })
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let (path, size, needs_start) = match self.files.get(&handle) {
            Some(file) => (file.path.clone(), file.props.size, file.download.is_none()),
            None => return Err(StatusCode::Failure),
        };
        if needs_start {
            // The download starts at the offset of the first read, which is
            // how resumed transfers express their range.
            let receiver = self
                .user
                .fs
                .start_file_download(&path, offset, size)
                .await
                .map_err(|e| status_for(e.kind()))?;
            if let Some(file) = self.files.get_mut(&handle) {
                file.download = Some(receiver);
            }
        }
        let download = self
            .files
            .get(&handle)
            .and_then(|file| file.download.as_ref())
            .ok_or(StatusCode::Failure)?;
        match download.read(offset, len).await {
            Ok(Some(data)) => Ok(Data {
                id,
                data: data.to_vec(),
            }),
            Ok(None) => Err(StatusCode::Eof),
            Err(e) => Err(status_for(e.kind())),
        }
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        _offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let user = Arc::clone(&self.user);
        let file = match self.files.get_mut(&handle) {
            Some(file) => file,
            None => return Err(StatusCode::Failure),
        };
        if file.upload.is_none() {
            file.upload = Some(
                user.fs
                    .start_file_upload(&file.path)
                    .map_err(|e| status_for(e.kind()))?,
            );
        }
        let upload = match file.upload.as_mut() {
            Some(upload) => upload,
            None => return Err(StatusCode::Failure),
        };
        match upload.write(Bytes::from(data)).await {
            Ok(_) => Ok(ok_status(id)),
            Err(e) => Err(status_for(e.kind())),
        }
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        if self.dirs.remove(&handle).is_some() {
            return Ok(ok_status(id));
        }
        let file = match self.files.remove(&handle) {
            Some(file) => file,
            None => return Err(StatusCode::Failure),
        };
        if let Some(upload) = file.upload {
            match upload.close().await {
                Ok(_) => Ok(ok_status(id)),
                Err(e) if e.kind() == SwiftErrorKind::NotFound => {
                    Ok(failure_status(id, "Container Doesn't Exist"))
                }
                Err(e) => Err(status_for(e.kind())),
            }
        } else {
            Ok(ok_status(id))
        }
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        self.log_command("openDirectory", &path);
        let canonical = vpath::canonical(&path);
        let listing = self
            .user
            .fs
            .list(&canonical)
            .await
            .map_err(|e| status_for(e.kind()))?;

        // Plenty of clients expect "." and ".." to be present.
        let mut files = vec![
            File::new(".", directory_attrs()),
            File::new("..", directory_attrs()),
        ];
        for (name, entry) in listing {
            files.push(File::new(name, attrs_from_stat(entry.stat())));
        }

        let handle = self.allocate_handle();
        self.dirs.insert(
            handle.clone(),
            DirHandle {
                files,
                served: false,
            },
        );
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let dir = match self.dirs.get_mut(&handle) {
            Some(dir) => dir,
            None => return Err(StatusCode::Failure),
        };
        if dir.served {
            return Err(StatusCode::Eof);
        }
        dir.served = true;
        Ok(Name {
            id,
            files: std::mem::take(&mut dir.files),
        })
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        self.log_command("removeFile", &filename);
        let path = vpath::canonical(&filename);
        match self.user.fs.remove_file(&path).await {
            Ok(()) => Ok(ok_status(id)),
            // SFTP clients retry deletes; a missing object is success here.
            Err(e) if e.kind() == SwiftErrorKind::NotFound => Ok(ok_status(id)),
            Err(e) => Err(status_for(e.kind())),
        }
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        self.log_command("makeDirectory", &path);
        let canonical = vpath::canonical(&path);
        match self.user.fs.make_directory(&canonical).await {
            Ok(()) => Ok(ok_status(id)),
            Err(e) if e.kind() == SwiftErrorKind::NotFound => Err(StatusCode::NoSuchFile),
            Err(e) => Err(status_for(e.kind())),
        }
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        self.log_command("removeDirectory", &path);
        let canonical = vpath::canonical(&path);
        match self.user.fs.remove_directory(&canonical).await {
            Ok(()) => Ok(ok_status(id)),
            Err(e) if e.kind() == SwiftErrorKind::NotFound => Ok(ok_status(id)),
            Err(e) if e.kind() == SwiftErrorKind::Conflict => {
                Ok(failure_status(id, "Directory Not Empty"))
            }
            Err(e) => Err(status_for(e.kind())),
        }
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        self.log_command("renameFile", &format!("{}, {}", oldpath, newpath));
        let old = vpath::canonical(&oldpath);
        let new = vpath::canonical(&newpath);
        match self.user.fs.rename(&old, &new).await {
            Ok(()) => Ok(ok_status(id)),
            Err(e) if e.kind() == SwiftErrorKind::NotFound => Err(StatusCode::NoSuchFile),
            Err(e) if e.kind() == SwiftErrorKind::Conflict => Err(StatusCode::OpUnsupported),
            Err(e) => Err(status_for(e.kind())),
        }
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        self.log_command("getAttrs", &path);
        let canonical = vpath::canonical(&path);
        match self.user.fs.get_attrs(&canonical).await {
            Ok(props) => Ok(Attrs {
                id,
                attrs: attrs_from_stat(props.stat()),
            }),
            Err(e) => Err(status_for(e.kind())),
        }
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        // No symlinks in the projection, lstat is stat.
        self.stat(id, path).await
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        match self.files.get(&handle) {
            Some(file) => Ok(Attrs {
                id,
                attrs: attrs_from_stat(file.props.stat()),
            }),
            None => Err(StatusCode::Failure),
        }
    }

    async fn setstat(
        &mut self,
        id: u32,
        _path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        // Attributes are synthetic; accept and ignore.
        Ok(ok_status(id))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        _handle: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        Ok(ok_status(id))
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        self.log_command("realPath", &path);
        let canonical = vpath::canonical(&path);
        Ok(Name {
            id,
            files: vec![File::new(canonical, FileAttributes::default())],
        })
    }
}
