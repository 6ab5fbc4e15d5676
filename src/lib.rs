#![deny(clippy::all)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

//! swftp is an FTP and SFTP gateway in front of OpenStack Swift compatible
//! object storage.
//!
//! Each authenticated session sees a virtual filesystem whose first level
//! entries are the user's storage containers and whose deeper entries are
//! objects. Every filesystem operation is translated into one or more
//! backend HTTP requests; object bytes are streamed in both directions
//! without touching local disk.
//!
//! The FTP wire protocol is provided by [libunftp](https://crates.io/crates/libunftp)
//! and the SSH/SFTP wire protocol by [russh](https://crates.io/crates/russh) plus
//! [russh-sftp](https://crates.io/crates/russh-sftp); this crate contributes the
//! Swift client core, the filesystem projection and the streaming transfer
//! engine in between.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use swftp::auth::SwiftAuthDb;
//! use swftp::config::Config;
//!
//! #[tokio::main]
//! pub async fn main() {
//!     let config = Config::defaults("ftp");
//!     let authdb = Arc::new(SwiftAuthDb::new(&config));
//!     swftp::ftp::serve(config, authdb).await.unwrap();
//! }
//! ```

pub mod auth;
pub mod config;
pub mod fs;
pub mod ftp;
pub mod metrics;
pub mod sftp;
pub mod stats;
pub mod swift;
pub mod transfer;

/// The version reported in the backend user agent string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

lazy_static::lazy_static! {
    /// User agent sent on every backend request.
    pub static ref USER_AGENT: String = format!("SwFTP v{}", VERSION);
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
