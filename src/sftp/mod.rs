//! The SFTP surface: a russh server whose `sftp` subsystem is served by a
//! [`russh-sftp`](https://crates.io/crates/russh-sftp) handler over the
//! filesystem projection.

mod handler;

pub use handler::SftpSession;

use crate::auth::SwiftAuthDb;
use crate::config::Config;
use crate::metrics;
use handler::SshHandler;
use russh::MethodSet;
use russh::SshId;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// The SSH version banner sent to clients.
pub const SERVER_ID: &str = "SSH-2.0-SwFTP";

/// Failures while starting the SFTP service.
#[derive(Debug, Error)]
pub enum SftpServerError {
    /// The listening socket could not be bound or accepted on.
    #[error("sftp io error: {0}")]
    Io(#[from] std::io::Error),
    /// The host key could not be loaded.
    #[error("cannot load host key: {0}")]
    HostKey(#[from] russh_keys::Error),
}

/// The SFTP gateway service.
#[derive(Debug)]
pub struct SftpServer {
    config: Config,
    authdb: Arc<SwiftAuthDb>,
}

impl SftpServer {
    /// Creates the service from its config and authenticator.
    pub fn new(config: Config, authdb: Arc<SwiftAuthDb>) -> Self {
        SftpServer { config, authdb }
    }

    /// Binds the listener and accepts connections until the process ends.
    pub async fn run(self) -> Result<(), SftpServerError> {
        let key = russh_keys::load_secret_key(&self.config.priv_key, None)?;

        if !self.config.ciphers.is_empty()
            || !self.config.macs.is_empty()
            || !self.config.compressions.is_empty()
        {
            // russh negotiates from its own vetted algorithm set; the
            // configured allow-lists are surfaced for operators comparing
            // against older deployments.
            info!(
                ciphers = ?self.config.ciphers,
                macs = ?self.config.macs,
                compressions = ?self.config.compressions,
                "configured SSH algorithm lists (negotiation uses the built-in set)"
            );
        }

        let ssh_config = russh::server::Config {
            server_id: SshId::Standard(SERVER_ID.to_string()),
            methods: MethodSet::PASSWORD,
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys: vec![key],
            ..Default::default()
        };
        let ssh_config = Arc::new(ssh_config);

        let listener = TcpListener::bind(self.config.bind_address()).await?;
        info!(address = %self.config.bind_address(), "starting SFTP service");

        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    debug!(peer = %peer, "new SSH connection");
                    metrics::count("num_clients", 1);
                    let ssh_config = Arc::clone(&ssh_config);
                    let handler = SshHandler::new(Arc::clone(&self.authdb));
                    tokio::spawn(async move {
                        match russh::server::run_stream(ssh_config, socket, handler).await {
                            Ok(session) => {
                                if let Err(e) = session.await {
                                    debug!(peer = %peer, "SSH session ended: {:?}", e);
                                }
                            }
                            Err(e) => debug!(peer = %peer, "SSH handshake failed: {:?}", e),
                        }
                    });
                }
                Err(e) => warn!("failed to accept SSH connection: {}", e),
            }
        }
    }
}
