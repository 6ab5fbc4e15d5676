use crate::BoxError;
use derive_more::Display;
use thiserror::Error;

/// The error returned by the Swift client and everything layered on top of
/// it. The `ErrorKind` determines what is ultimately sent to the FTP or SFTP
/// client, so callers should pick kinds carefully.
#[derive(Debug, Error)]
#[error("swift error: {kind}")]
pub struct Error {
    kind: ErrorKind,
    #[source]
    source: Option<BoxError>,
}

impl Error {
    /// Creates a new error wrapping an underlying cause.
    pub fn new<E>(kind: ErrorKind, source: E) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            kind,
            source: Some(source.into()),
        }
    }

    /// The classification of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error { kind, source: None }
    }
}

/// Classification of backend and projection failures.
///
/// The first group maps directly from backend HTTP statuses; the second
/// group is produced by the filesystem projection when the shape of a path
/// doesn't fit the requested operation.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum ErrorKind {
    /// The backend returned 404 for the entity the operation addressed.
    #[display(fmt = "not found")]
    NotFound,
    /// The backend returned 401 even after one token refresh.
    #[display(fmt = "unauthenticated")]
    UnAuthenticated,
    /// The backend returned 403.
    #[display(fmt = "unauthorized")]
    UnAuthorized,
    /// The backend returned 409, e.g. deleting a non-empty container.
    #[display(fmt = "conflict")]
    Conflict,
    /// The backend answered with a 3xx redirect, which the gateway never
    /// follows.
    #[display(fmt = "redirect ({})", _0)]
    Redirect(u16),
    /// Any other backend status >= 400.
    #[display(fmt = "request error ({})", _0)]
    RequestError(u16),
    /// The backend connection died before the response completed.
    #[display(fmt = "connection lost")]
    ConnectionLost,
    /// No data arrived from the backend within the idle window.
    #[display(fmt = "timeout")]
    Timeout,
    /// A file operation addressed a container or the account root.
    #[display(fmt = "is a directory")]
    IsADirectory,
    /// A directory operation addressed a plain object.
    #[display(fmt = "is not a directory")]
    IsNotADirectory,
    /// The operation cannot be expressed against the backend, e.g. a
    /// recursive rename.
    #[display(fmt = "not implemented")]
    NotImplemented,
    /// A local failure in the gateway itself, e.g. a malformed request or
    /// an undecodable listing body.
    #[display(fmt = "local error")]
    LocalError,
}

/// Classifies a backend HTTP status code. 2xx yields `Ok(())`; everything
/// else the corresponding `ErrorKind`.
pub fn check_status(status: u16) -> std::result::Result<(), ErrorKind> {
    match status {
        200..=299 => Ok(()),
        404 => Err(ErrorKind::NotFound),
        401 => Err(ErrorKind::UnAuthenticated),
        403 => Err(ErrorKind::UnAuthorized),
        409 => Err(ErrorKind::Conflict),
        300..=399 => Err(ErrorKind::Redirect(status)),
        other => Err(ErrorKind::RequestError(other)),
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
