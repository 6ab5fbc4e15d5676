//! Swift-backed authentication and per-user session accounting.
//!
//! A login performs exactly one authentication round-trip against the
//! backend on a fresh per-login connection pool, builds the ordered
//! throttle (per-session semaphore first, process-wide semaphore second)
//! and binds the resulting connection to the session.

use crate::config::Config;
use crate::fs::SwiftFilesystem;
use crate::metrics;
use crate::swift::{Error, ErrorKind, SwiftConnection, Throttle, UrlRewrite};
use async_trait::async_trait;
use dashmap::DashMap;
use libunftp::auth::{AuthenticationError, Authenticator, Credentials, UserDetail};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// One authenticated gateway user: the name for logging plus the filesystem
/// projection bound to their backend connection.
#[derive(Debug)]
pub struct SwiftUser {
    /// The username given at login.
    pub username: String,
    /// The filesystem projection over this user's connection.
    pub fs: SwiftFilesystem,
}

impl fmt::Display for SwiftUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.username)
    }
}

impl UserDetail for SwiftUser {}

/// Process-wide count of active sessions per username. Entries are removed
/// when they drop to zero so the map cannot grow without bound.
#[derive(Debug)]
pub struct SessionTracker {
    sessions: DashMap<String, usize>,
    cap: usize,
}

impl SessionTracker {
    /// Creates a tracker; `cap` of zero means unlimited.
    pub fn new(cap: usize) -> Self {
        SessionTracker {
            sessions: DashMap::new(),
            cap,
        }
    }

    /// The configured per-user cap.
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Claims a session slot for the user. `false` means the cap is already
    /// reached and the connection must be refused.
    pub fn try_acquire(&self, username: &str) -> bool {
        let mut entry = self.sessions.entry(username.to_string()).or_insert(0);
        if self.cap != 0 && *entry >= self.cap {
            return false;
        }
        *entry += 1;
        true
    }

    /// Releases a session slot, cleaning up the map entry at zero.
    pub fn release(&self, username: &str) {
        if let Some(mut entry) = self.sessions.get_mut(username) {
            *entry = entry.saturating_sub(1);
            drop(entry);
        }
        self.sessions.remove_if(username, |_, count| *count == 0);
    }

    /// Active sessions for one user.
    pub fn active(&self, username: &str) -> usize {
        self.sessions.get(username).map(|e| *e).unwrap_or(0)
    }

    /// Active sessions across all users.
    pub fn total_active(&self) -> usize {
        self.sessions.iter().map(|e| *e.value()).sum()
    }

    /// A snapshot of the per-user counts, for runtime dumps.
    pub fn snapshot(&self) -> Vec<(String, usize)> {
        self.sessions
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}

/// Authenticates gateway logins against the backend and hands out bound
/// connections.
#[derive(Debug)]
pub struct SwiftAuthDb {
    auth_url: String,
    global_lock: Option<Arc<Semaphore>>,
    per_session: usize,
    timeout: Duration,
    extra_headers: Vec<(String, String)>,
    rewrite: UrlRewrite,
    sessions: Arc<SessionTracker>,
}

impl SwiftAuthDb {
    /// Builds the authenticator from a service config.
    pub fn new(config: &Config) -> Self {
        let global_lock = if config.num_persistent_connections > 0 {
            Some(Arc::new(Semaphore::new(config.num_persistent_connections)))
        } else {
            None
        };
        SwiftAuthDb {
            auth_url: config.auth_url.clone(),
            global_lock,
            per_session: config.num_connections_per_session,
            timeout: Duration::from_secs(config.connection_timeout),
            extra_headers: config.extra_headers.clone(),
            rewrite: UrlRewrite {
                scheme: config.rewrite_storage_scheme.clone(),
                netloc: config.rewrite_storage_netloc.clone(),
            },
            sessions: Arc::new(SessionTracker::new(config.sessions_per_user)),
        }
    }

    /// The shared session tracker.
    pub fn sessions(&self) -> Arc<SessionTracker> {
        Arc::clone(&self.sessions)
    }

    /// Exchanges credentials for an authenticated user. Exactly one backend
    /// auth round-trip; emits the `auth.succeed`/`auth.fail` counters.
    pub async fn login(&self, username: &str, api_key: &str) -> Result<SwiftUser, Error> {
        // Fresh pool per login. The pool only keeps connections alive when
        // the session may issue concurrent requests at all.
        let http = SwiftConnection::default_http_client(self.timeout, self.per_session);

        let mut locks = Vec::new();
        if self.per_session > 0 {
            locks.push(Arc::new(Semaphore::new(self.per_session)));
        }
        if let Some(global) = &self.global_lock {
            locks.push(Arc::clone(global));
        }

        let conn = SwiftConnection::new(http, &self.auth_url, username, api_key)
            .with_throttle(Throttle::new(locks))
            .with_extra_headers(self.extra_headers.clone())
            .with_rewrite(self.rewrite.clone());

        match conn.authenticate().await {
            Ok(()) => {
                metrics::count("auth.succeed", 1);
                Ok(SwiftUser {
                    username: username.to_string(),
                    fs: SwiftFilesystem::new(Arc::new(conn)),
                })
            }
            Err(e) => {
                metrics::count("auth.fail", 1);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Authenticator<SwiftUser> for SwiftAuthDb {
    async fn authenticate(
        &self,
        username: &str,
        creds: &Credentials,
    ) -> Result<SwiftUser, AuthenticationError> {
        let password = creds
            .password
            .as_deref()
            .ok_or(AuthenticationError::BadPassword)?;

        let user = self.login(username, password).await.map_err(|e| {
            match e.kind() {
                ErrorKind::UnAuthenticated | ErrorKind::UnAuthorized => {
                    AuthenticationError::BadPassword
                }
                _ => AuthenticationError::with_source("swift authentication failed", e),
            }
        })?;

        if !self.sessions.try_acquire(username) {
            tracing::warn!(
                user = username,
                active = self.sessions.active(username),
                cap = self.sessions.cap(),
                "too many connections for user"
            );
            return Err(AuthenticationError::new("too many connections for user"));
        }
        metrics::count_command("login");
        Ok(user)
    }
}
