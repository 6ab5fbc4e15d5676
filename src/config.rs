//! Gateway configuration: a single INI style file with an `[ftp]` or
//! `[sftp]` section, plus command line overrides.

use configparser::ini::Ini;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Paths tried when no config file is given on the command line.
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["/etc/swftp/swftp.conf", "~/.swftp.cfg"];

/// A configuration loading failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read or parsed.
    #[error("cannot read config file: {0}")]
    Read(String),
    /// A value did not parse as the expected type.
    #[error("invalid value for {key}: {value}")]
    Invalid {
        /// The offending key.
        key: String,
        /// The value as found in the file.
        value: String,
    },
}

/// Effective settings for one gateway service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Which section these settings came from: `ftp` or `sftp`.
    pub section: String,
    /// Backend auth endpoint.
    pub auth_url: String,
    /// Listening interface.
    pub host: String,
    /// Listening port.
    pub port: u16,
    /// SFTP host private key path.
    pub priv_key: PathBuf,
    /// SFTP host public key path.
    pub pub_key: PathBuf,
    /// Process-wide backend concurrency cap; 0 disables the lock.
    pub num_persistent_connections: usize,
    /// Per-session backend concurrency cap; 0 disables the lock and
    /// connection reuse.
    pub num_connections_per_session: usize,
    /// Idle timeout for pooled backend connections, in seconds.
    pub connection_timeout: u64,
    /// Max concurrent sessions per username; 0 means unlimited.
    pub sessions_per_user: usize,
    /// Headers injected on every backend request.
    pub extra_headers: Vec<(String, String)>,
    /// FTP banner text.
    pub welcome_message: String,
    /// Optional storage URL scheme replacement applied after auth.
    pub rewrite_storage_scheme: Option<String>,
    /// Optional storage URL netloc replacement applied after auth.
    pub rewrite_storage_netloc: Option<String>,
    /// SSH cipher allow-list (informational, see the SFTP module).
    pub ciphers: Vec<String>,
    /// SSH MAC allow-list (informational).
    pub macs: Vec<String>,
    /// SSH compression allow-list (informational).
    pub compressions: Vec<String>,
    /// Interface for the JSON stats endpoint; unset disables it.
    pub stats_host: Option<String>,
    /// Port for the JSON stats endpoint.
    pub stats_port: u16,
    /// Request-level logging.
    pub verbose: bool,
}

/// Command line overrides, applied after the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Overrides `auth_url`.
    pub auth_url: Option<String>,
    /// Overrides `host`.
    pub host: Option<String>,
    /// Overrides `port`.
    pub port: Option<u16>,
    /// Overrides `priv_key`.
    pub priv_key: Option<PathBuf>,
    /// Overrides `pub_key`.
    pub pub_key: Option<PathBuf>,
    /// Forces verbose logging on.
    pub verbose: bool,
}

impl Config {
    /// The built-in defaults for a section, matching the shipped sample
    /// config.
    pub fn defaults(section: &str) -> Config {
        let sftp = section == "sftp";
        Config {
            section: section.to_string(),
            auth_url: "http://127.0.0.1:8080/auth/v1.0".to_string(),
            host: "0.0.0.0".to_string(),
            port: if sftp { 5022 } else { 5021 },
            priv_key: PathBuf::from("/etc/swftp/id_rsa"),
            pub_key: PathBuf::from("/etc/swftp/id_rsa.pub"),
            num_persistent_connections: 100,
            num_connections_per_session: 10,
            connection_timeout: 240,
            sessions_per_user: 10,
            extra_headers: Vec::new(),
            welcome_message: "Welcome to SwFTP - an FTP interface for Openstack Swift".to_string(),
            rewrite_storage_scheme: None,
            rewrite_storage_netloc: None,
            ciphers: Vec::new(),
            macs: Vec::new(),
            compressions: Vec::new(),
            stats_host: None,
            stats_port: if sftp { 38022 } else { 38021 },
            verbose: false,
        }
    }

    /// Loads the section from the given file (or the default paths) and
    /// applies overrides.
    pub fn load(
        section: &str,
        config_path: Option<&Path>,
        overrides: &Overrides,
    ) -> Result<Config, ConfigError> {
        let mut ini = Ini::new();
        match config_path {
            Some(path) => {
                ini.load(path.to_string_lossy().as_ref())
                    .map_err(ConfigError::Read)?;
            }
            None => {
                for candidate in DEFAULT_CONFIG_PATHS {
                    let path = expand_home(candidate);
                    if path.exists() {
                        ini.load(path.to_string_lossy().as_ref())
                            .map_err(ConfigError::Read)?;
                    }
                }
            }
        }

        let mut config = Config::defaults(section);
        let get = |key: &str| ini.get(section, key);

        if let Some(value) = get("auth_url") {
            config.auth_url = value;
        }
        if let Some(value) = get("host") {
            config.host = value;
        }
        if let Some(value) = get("port") {
            config.port = parse(&value, "port")?;
        }
        if let Some(value) = get("priv_key") {
            config.priv_key = PathBuf::from(value);
        }
        if let Some(value) = get("pub_key") {
            config.pub_key = PathBuf::from(value);
        }
        if let Some(value) = get("num_persistent_connections") {
            config.num_persistent_connections = parse(&value, "num_persistent_connections")?;
        }
        if let Some(value) = get("num_connections_per_session") {
            config.num_connections_per_session = parse(&value, "num_connections_per_session")?;
        }
        if let Some(value) = get("connection_timeout") {
            config.connection_timeout = parse(&value, "connection_timeout")?;
        }
        if let Some(value) = get("sessions_per_user") {
            config.sessions_per_user = parse(&value, "sessions_per_user")?;
        }
        if let Some(value) = get("extra_headers") {
            config.extra_headers = parse_key_value_config(&value);
        }
        if let Some(value) = get("welcome_message") {
            config.welcome_message = value;
        }
        if let Some(value) = get("rewrite_storage_scheme") {
            config.rewrite_storage_scheme = non_empty(value);
        }
        if let Some(value) = get("rewrite_storage_netloc") {
            config.rewrite_storage_netloc = non_empty(value);
        }
        if let Some(value) = get("ciphers") {
            config.ciphers = parse_list(&value);
        }
        if let Some(value) = get("macs") {
            config.macs = parse_list(&value);
        }
        if let Some(value) = get("compressions") {
            config.compressions = parse_list(&value);
        }
        if let Some(value) = get("stats_host") {
            config.stats_host = non_empty(value);
        }
        if let Some(value) = get("stats_port") {
            config.stats_port = parse(&value, "stats_port")?;
        }
        if let Some(value) = get("verbose") {
            config.verbose = matches!(value.to_lowercase().as_str(), "true" | "yes" | "1" | "on");
        }

        if let Some(auth_url) = &overrides.auth_url {
            config.auth_url = auth_url.clone();
        }
        if let Some(host) = &overrides.host {
            config.host = host.clone();
        }
        if let Some(port) = overrides.port {
            config.port = port;
        }
        if let Some(priv_key) = &overrides.priv_key {
            config.priv_key = priv_key.clone();
        }
        if let Some(pub_key) = &overrides.pub_key {
            config.pub_key = pub_key.clone();
        }
        if overrides.verbose {
            config.verbose = true;
        }

        Ok(config)
    }

    /// The socket address this service listens on.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Parses the `extra_headers` format: a comma separated list of `key: value`
/// pairs.
pub fn parse_key_value_config(value: &str) -> Vec<(String, String)> {
    value
        .split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once(':')?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn defaults_differ_per_section() {
        let ftp = Config::defaults("ftp");
        let sftp = Config::defaults("sftp");
        assert_eq!(ftp.port, 5021);
        assert_eq!(sftp.port, 5022);
        assert_eq!(ftp.auth_url, "http://127.0.0.1:8080/auth/v1.0");
        assert_eq!(sftp.sessions_per_user, 10);
    }

    #[test]
    fn parses_extra_headers() {
        assert_eq!(
            parse_key_value_config("X-One: 1, X-Two: two"),
            vec![
                ("X-One".to_string(), "1".to_string()),
                ("X-Two".to_string(), "two".to_string()),
            ]
        );
        assert_eq!(parse_key_value_config(""), vec![]);
        assert_eq!(parse_key_value_config("no-colon"), vec![]);
    }

    #[test]
    fn loads_file_and_applies_overrides() {
        let mut file = tempfile_in_env();
        writeln!(
            file.1,
            "[sftp]\nport = 2022\nauth_url = http://auth.internal/v1.0\n\
             extra_headers = X-Forwarded-Proto: https\nverbose = true\n\
             rewrite_storage_netloc = proxy:8080\n"
        )
        .unwrap();

        let overrides = Overrides {
            port: Some(2222),
            ..Default::default()
        };
        let config = Config::load("sftp", Some(&file.0), &overrides).unwrap();
        assert_eq!(config.auth_url, "http://auth.internal/v1.0");
        assert_eq!(config.port, 2222, "CLI override wins over the file");
        assert!(config.verbose);
        assert_eq!(
            config.extra_headers,
            vec![("X-Forwarded-Proto".to_string(), "https".to_string())]
        );
        assert_eq!(config.rewrite_storage_netloc.as_deref(), Some("proxy:8080"));
        assert_eq!(config.bind_address(), "0.0.0.0:2222");
    }

    #[test]
    fn rejects_bad_numbers() {
        let mut file = tempfile_in_env();
        writeln!(file.1, "[ftp]\nport = not-a-port\n").unwrap();
        let err = Config::load("ftp", Some(&file.0), &Overrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    fn tempfile_in_env() -> (PathBuf, std::fs::File) {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "swftp-config-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
