//! Synthetic POSIX-like attributes for backend entities.
//!
//! Swift has no file modes, owners or inode times, so the gateway derives a
//! stable synthetic stat from what a HEAD or listing reports: directories
//! (containers, the account, `application/directory` objects, subdir stubs)
//! get `0o700 | S_IFDIR`, everything else `0o600 | S_IFREG`, and ownership
//! is the fixed nobody/nobody pair. No extra backend round-trip is ever
//! needed to stat an already listed entity.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Content type marking an object as a pseudo directory.
pub const DIRECTORY_CONTENT_TYPE: &str = "application/directory";

/// Directory file-type bit.
pub const S_IFDIR: u32 = 0o040000;
/// Regular-file file-type bit.
pub const S_IFREG: u32 = 0o100000;

/// The numeric uid/gid reported for every entity.
pub const NOBODY: u32 = 65535;

/// The synthetic stat of a container, object or the account root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwiftStat {
    /// Size in bytes; 0 for directories without a byte count.
    pub size: u64,
    /// Mode including the file-type bit.
    pub mode: u32,
    /// Owner uid (always nobody).
    pub uid: u32,
    /// Owner gid (always nobody).
    pub gid: u32,
    /// Modification time; also reported as atime and ctime.
    pub mtime: DateTime<Utc>,
}

impl SwiftStat {
    /// Whether the directory bit is set.
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFDIR == S_IFDIR
    }

    /// mtime as a unix timestamp, clamped at zero.
    pub fn mtime_unix(&self) -> u64 {
        self.mtime.timestamp().max(0) as u64
    }
}

/// Derives a stat from listing/head fields. A missing or unparseable
/// `last_modified` falls back to the current UTC time.
pub fn swift_stat(content_type: Option<&str>, bytes: u64, last_modified: Option<&str>) -> SwiftStat {
    let mtime = last_modified
        .and_then(parse_datetime)
        .unwrap_or_else(Utc::now);
    let mode = if content_type == Some(DIRECTORY_CONTENT_TYPE) {
        0o700 | S_IFDIR
    } else {
        0o600 | S_IFREG
    };
    SwiftStat {
        size: bytes,
        mode,
        uid: NOBODY,
        gid: NOBODY,
        mtime,
    }
}

// The backend reports RFC 1123 dates on heads and ISO 8601 (with or without
// fractions) in JSON listings; a few older proxies emit space-separated or
// date-only forms.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

/// Tries the known backend datetime formats; `None` when nothing matches.
pub fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in DATE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}
