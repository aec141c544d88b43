//! Server configuration: TOML file + CLI overrides.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub relay: RelaySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// Source address for outbound `direct-tcpip` dials.
    #[serde(default)]
    pub peer_ip: Option<IpAddr>,
    #[serde(default = "default_host_key")]
    pub host_key: String,
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            bind_port: default_bind_port(),
            peer_ip: None,
            host_key: default_host_key(),
            inactivity_timeout_secs: default_inactivity_timeout(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_agent_user")]
    pub agent_user: String,
    #[serde(default)]
    pub authorized_keys: Option<String>,
    /// Failed client logins tolerated per peer IP within the window.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            agent_user: default_agent_user(),
            authorized_keys: None,
            max_attempts: default_max_attempts(),
            window_secs: default_window_secs(),
        }
    }
}

/// `[relay]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            dial_timeout_secs: default_dial_timeout(),
        }
    }
}

fn default_bind_ip() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_bind_port() -> u16 {
    2222
}
fn default_host_key() -> String {
    "~/.sshtun/host_key".to_string()
}
fn default_inactivity_timeout() -> u64 {
    3600
}
fn default_agent_user() -> String {
    sshtun_core::auth::DEFAULT_AGENT_USER.to_string()
}
fn default_max_attempts() -> u32 {
    10
}
fn default_window_secs() -> u64 {
    60
}
fn default_dial_timeout() -> u64 {
    10
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind_ip: Option<IpAddr>,
    pub bind_port: Option<u16>,
    pub peer_ip: Option<IpAddr>,
    pub host_key: Option<String>,
    pub authorized_keys: Option<String>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_ip: IpAddr,
    pub bind_port: u16,
    pub peer_ip: Option<IpAddr>,
    pub host_key: PathBuf,
    pub inactivity_timeout: Duration,
    pub agent_user: String,
    pub authorized_keys: Option<PathBuf>,
    pub max_attempts: u32,
    pub window_secs: u64,
    pub dial_timeout: Duration,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// A missing file means defaults; an unreadable or invalid one is an error.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)
                        .with_context(|| format!("cannot read {}", expanded.display()))?;
                    toml::from_str::<ConfigFile>(&content)
                        .with_context(|| format!("config parse error in {}", expanded.display()))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let ConfigFile {
            server,
            auth,
            relay,
        } = file_config;

        let host_key = overrides.host_key.unwrap_or(server.host_key);
        let authorized_keys = overrides.authorized_keys.or(auth.authorized_keys);

        Ok(Self {
            bind_ip: overrides.bind_ip.unwrap_or(server.bind_ip),
            bind_port: overrides.bind_port.unwrap_or(server.bind_port),
            peer_ip: overrides.peer_ip.or(server.peer_ip),
            host_key: expand_tilde_str(&host_key),
            inactivity_timeout: Duration::from_secs(server.inactivity_timeout_secs),
            agent_user: auth.agent_user,
            authorized_keys: authorized_keys.as_deref().map(expand_tilde_str),
            max_attempts: auth.max_attempts,
            window_secs: auth.window_secs,
            dial_timeout: Duration::from_secs(relay.dial_timeout_secs),
        })
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig::load(Some(&dir.path().join("absent.toml")), Overrides::default())
            .unwrap();
        assert_eq!(cfg.bind_ip, IpAddr::from([0, 0, 0, 0]));
        assert_eq!(cfg.bind_port, 2222);
        assert_eq!(cfg.peer_ip, None);
        assert_eq!(cfg.agent_user, "server");
        assert_eq!(cfg.authorized_keys, None);
        assert_eq!(cfg.max_attempts, 10);
        assert_eq!(cfg.window_secs, 60);
        assert_eq!(cfg.dial_timeout, Duration::from_secs(10));
        assert_eq!(cfg.inactivity_timeout, Duration::from_secs(3600));
        assert!(cfg.host_key.ends_with(".sshtun/host_key"));
    }

    #[test]
    fn file_values_are_used() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[server]
bind_ip = "127.0.0.1"
bind_port = 2022
peer_ip = "10.0.0.5"
host_key = "/etc/sshtun/host_key"

[auth]
agent_user = "agent"
authorized_keys = "/etc/sshtun/authorized_keys"
max_attempts = 3

[relay]
dial_timeout_secs = 2
"#
        )
        .unwrap();

        let cfg = ServerConfig::load(Some(file.path()), Overrides::default()).unwrap();
        assert_eq!(cfg.bind_ip, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(cfg.bind_port, 2022);
        assert_eq!(cfg.peer_ip, Some(IpAddr::from([10, 0, 0, 5])));
        assert_eq!(cfg.host_key, PathBuf::from("/etc/sshtun/host_key"));
        assert_eq!(cfg.agent_user, "agent");
        assert_eq!(
            cfg.authorized_keys,
            Some(PathBuf::from("/etc/sshtun/authorized_keys"))
        );
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.window_secs, 60);
        assert_eq!(cfg.dial_timeout, Duration::from_secs(2));
    }

    #[test]
    fn cli_overrides_win() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[server]\nbind_port = 2022\npeer_ip = \"10.0.0.5\"\n").unwrap();

        let overrides = Overrides {
            bind_port: Some(4000),
            peer_ip: Some(IpAddr::from([192, 0, 2, 1])),
            host_key: Some("/tmp/key".into()),
            ..Overrides::default()
        };
        let cfg = ServerConfig::load(Some(file.path()), overrides).unwrap();
        assert_eq!(cfg.bind_port, 4000);
        assert_eq!(cfg.peer_ip, Some(IpAddr::from([192, 0, 2, 1])));
        assert_eq!(cfg.host_key, PathBuf::from("/tmp/key"));
    }

    #[test]
    fn invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[server]\nbind_port = \"not a port\"\n").unwrap();
        assert!(ServerConfig::load(Some(file.path()), Overrides::default()).is_err());
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/x/y"), home.join("x/y"));
        }
        assert_eq!(expand_tilde_str("/abs/path"), PathBuf::from("/abs/path"));
    }
}
