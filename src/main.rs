//! The swftp binary: one executable serving either the FTP or the SFTP
//! gateway, selected by subcommand.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use swftp::auth::{SessionTracker, SwiftAuthDb};
use swftp::config::{Config, Overrides};
use swftp::{metrics, stats};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "swftp", version, about = "FTP/SFTP gateway for OpenStack Swift")]
struct Cli {
    /// Location of the swftp config file.
    #[arg(short, long)]
    config_file: Option<PathBuf>,

    /// Backend auth URL, overriding the config file.
    #[arg(short, long)]
    auth_url: Option<String>,

    /// IP to bind to.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind to.
    #[arg(short, long)]
    port: Option<u16>,

    /// SFTP host private key location.
    #[arg(long)]
    priv_key: Option<PathBuf>,

    /// SFTP host public key location.
    #[arg(long)]
    pub_key: Option<PathBuf>,

    /// Make the server more talkative.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Serve the FTP gateway.
    Ftp,
    /// Serve the SFTP gateway.
    Sftp,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let section = match cli.command {
        Command::Ftp => "ftp",
        Command::Sftp => "sftp",
    };

    let overrides = Overrides {
        auth_url: cli.auth_url.clone(),
        host: cli.host.clone(),
        port: cli.port,
        priv_key: cli.priv_key.clone(),
        pub_key: cli.pub_key.clone(),
        verbose: cli.verbose,
    };
    let config = Config::load(section, cli.config_file.as_deref(), &overrides)?;

    init_logging(config.verbose);
    info!(version = swftp::VERSION, service = section, "starting SwFTP");

    let authdb = Arc::new(SwiftAuthDb::new(&config));

    metrics::spawn_sampler();
    if let Some(stats_host) = config.stats_host.clone() {
        let sessions = authdb.sessions();
        let stats_port = config.stats_port;
        tokio::spawn(async move {
            if let Err(e) = stats::serve(stats_host, stats_port, sessions).await {
                error!("stats endpoint failed: {}", e);
            }
        });
    }
    spawn_runtime_dump(authdb.sessions());

    match cli.command {
        Command::Ftp => swftp::ftp::serve(config, authdb).await?,
        Command::Sftp => swftp::sftp::SftpServer::new(config, authdb).run().await?,
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "swftp=debug,libunftp=info"
    } else {
        "swftp=info,libunftp=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// SIGUSR1 dumps session/counter summaries; SIGUSR2 additionally dumps the
// per-user session counts.
fn spawn_runtime_dump(sessions: Arc<SessionTracker>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("cannot install SIGUSR1 handler: {}", e);
                return;
            }
        };
        let mut usr2 = match signal(SignalKind::user_defined2()) {
            Ok(stream) => stream,
            Err(e) => {
                error!("cannot install SIGUSR2 handler: {}", e);
                return;
            }
        };
        loop {
            tokio::select! {
                _ = usr1.recv() => dump_runtime_info(&sessions, false),
                _ = usr2.recv() => dump_runtime_info(&sessions, true),
            }
        }
    });
}

fn dump_runtime_info(sessions: &SessionTracker, detailed: bool) {
    let totals = metrics::totals();
    info!(
        active_sessions = sessions.total_active(),
        counters = totals.len(),
        "[Sessions: {}] [Counters: {}]",
        sessions.total_active(),
        totals.len()
    );
    if detailed {
        for (username, count) in sessions.snapshot() {
            info!("session[{}]: {}", username, count);
        }
        for (name, total) in totals {
            info!("counter[{}]: {}", name, total);
        }
    }
}
