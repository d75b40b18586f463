//! Configuration resolution for tunnelcast.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Config file (TOML, passed with `--config` or `TUNNELCAST_CONFIG`)
//! 3. Environment variables (see [`ENV_KEYS`])
//! 4. CLI arguments (highest priority, applied by the binary)
//!
//! The resolved [`LaunchConfig`] is assembled once at startup and handed to
//! each component explicitly; nothing reads the process environment later.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::address::TunnelAddress;
use crate::error::{Error, Result};
use crate::policy::AcquirePolicy;

/// Environment keys recognised by [`apply_env_overrides`].
pub const ENV_KEYS: &[&str] = &[
    "TUNNELCAST_PORT",
    "TUNNELCAST_DASHBOARD_CMD",
    "TUNNELCAST_DASHBOARD_DIR",
    "TUNNELCAST_STARTUP_PAUSE_SECS",
    "TUNNELCAST_CLOUDFLARED_BIN",
    "TUNNELCAST_TUNNEL_TOKEN",
    "TUNNELCAST_TUNNEL_URL",
    "TUNNELCAST_TUNNEL_LOG",
    "TUNNELCAST_SSH_KEY",
    "TUNNELCAST_SSH_PASSPHRASE",
    "TUNNELCAST_SSH_PASSPHRASE_FILE",
    "TUNNELCAST_SITE_REPO",
    "TUNNELCAST_SITE_ASSET",
    "TUNNELCAST_SITE_VAR",
    "TUNNELCAST_GIT_REMOTE",
    "TUNNELCAST_GIT_BRANCH",
    "TUNNELCAST_LOG_FILE",
    "TUNNELCAST_LOG_LEVEL",
    "TUNNELCAST_LOG_JSON",
];

/// Complete launcher configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchConfig {
    pub dashboard: DashboardConfig,
    pub tunnel: TunnelConfig,
    pub ssh: SshConfig,
    pub publish: PublishConfig,
    pub acquire: AcquireConfig,
    pub log: LogConfig,
}

/// The supervised dashboard process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DashboardConfig {
    /// TCP port the dashboard binds on localhost.
    pub port: u16,
    /// Program and arguments.
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Pause between launching the dashboard and launching the tunnel.
    pub startup_pause_secs: u64,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            port: 8050,
            command: vec!["python3".into(), "-m".into(), "dashboard".into()],
            working_dir: None,
            startup_pause_secs: 3,
        }
    }
}

/// The cloudflared tunnel client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelConfig {
    /// Explicit cloudflared executable; resolved from PATH when unset.
    pub cloudflared_bin: Option<PathBuf>,
    /// Credential of a pre-provisioned stable tunnel.
    pub token: Option<String>,
    /// Public address of the stable tunnel, when known.
    pub url: Option<String>,
    /// Raw tunnel output file, truncated at every launch.
    pub output_log: Option<PathBuf>,
    /// Seconds to wait after SIGTERM before killing a tunnel process.
    pub terminate_timeout_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            cloudflared_bin: None,
            token: None,
            url: None,
            output_log: None,
            terminate_timeout_secs: 5,
        }
    }
}

impl TunnelConfig {
    /// Stable-tunnel token, ignoring blank values.
    pub fn stable_token(&self) -> Option<&str> {
        self.token.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    /// Operator-configured address of the stable tunnel.
    pub fn stable_address(&self) -> Option<TunnelAddress> {
        self.url.as_deref().and_then(TunnelAddress::configured)
    }
}

/// Deploy key used by git when publishing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    pub key: Option<PathBuf>,
    pub passphrase: Option<String>,
    pub passphrase_file: Option<PathBuf>,
}

impl SshConfig {
    /// Configured key, or `~/.ssh/id_ed25519` when it exists.
    pub fn key_path(&self) -> Option<PathBuf> {
        if let Some(key) = &self.key {
            return Some(key.clone());
        }
        dirs::home_dir()
            .map(|home| home.join(".ssh").join("id_ed25519"))
            .filter(|p| p.exists())
    }

    /// Passphrase for the key, read from the passphrase file when not given
    /// directly. A single trailing newline is stripped from file contents.
    pub fn passphrase(&self) -> Result<Option<String>> {
        if let Some(pass) = self.passphrase.as_ref().filter(|p| !p.is_empty()) {
            return Ok(Some(pass.clone()));
        }
        let Some(path) = &self.passphrase_file else {
            return Ok(None);
        };
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read passphrase file {}: {}",
                path.display(),
                e
            ))
        })?;
        let pass = raw
            .strip_suffix('\n')
            .map_or(raw.as_str(), |s| s.strip_suffix('\r').unwrap_or(s));
        Ok(Some(pass.to_string()).filter(|p| !p.is_empty()))
    }
}

/// Static site checkout that receives the public address.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublishConfig {
    /// Git checkout of the site; publication is disabled when unset.
    pub repo: Option<PathBuf>,
    /// Asset path relative to `repo`.
    pub asset: PathBuf,
    /// Identifier of the `<identifier> = "<URL>";` line.
    pub identifier: String,
    pub remote: String,
    pub branch: String,
    /// Push rounds (each preceded by a rebase-pull) before giving up.
    pub push_attempts: u32,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            repo: None,
            asset: PathBuf::from("index.html"),
            identifier: "DASHBOARD_URL".to_string(),
            remote: "origin".to_string(),
            branch: "main".to_string(),
            push_attempts: 2,
        }
    }
}

/// Acquisition timings; see [`AcquirePolicy`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AcquireConfig {
    pub max_attempts: u32,
    pub poll_interval_secs: u64,
    pub polls_per_attempt: u32,
    pub backoff_secs: u64,
    pub diagnostic_lines: usize,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        let policy = AcquirePolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            poll_interval_secs: policy.poll_interval.as_secs(),
            polls_per_attempt: policy.polls_per_attempt,
            backoff_secs: policy.backoff.as_secs(),
            diagnostic_lines: policy.diagnostic_lines,
        }
    }
}

impl AcquireConfig {
    pub const fn policy(&self) -> AcquirePolicy {
        AcquirePolicy {
            max_attempts: self.max_attempts,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            polls_per_attempt: self.polls_per_attempt,
            backoff: Duration::from_secs(self.backoff_secs),
            diagnostic_lines: self.diagnostic_lines,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
    /// Append-only log destination.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl LaunchConfig {
    /// Validate the configuration. Returns an error on invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.dashboard.port == 0 {
            return Err(Error::Config("dashboard port must not be 0".into()));
        }
        if self.dashboard.command.is_empty() {
            return Err(Error::Config("dashboard command must not be empty".into()));
        }
        if self.publish.identifier.trim().is_empty() {
            return Err(Error::Config("asset identifier must not be empty".into()));
        }
        if self.publish.push_attempts == 0 {
            return Err(Error::Config("push_attempts must be at least 1".into()));
        }
        if self.acquire.max_attempts == 0 || self.acquire.polls_per_attempt == 0 {
            return Err(Error::Config(
                "max_attempts and polls_per_attempt must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution from the process
/// environment.
pub fn load_config(file: Option<&Path>) -> Result<LaunchConfig> {
    let mut config = match file {
        Some(path) => load_config_file(path)?,
        None => LaunchConfig::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

fn load_config_file(path: &Path) -> Result<LaunchConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    parse_config(&content)
        .map_err(|e| Error::Config(format!("Failed to parse config file {}: {}", path.display(), e)))
}

/// Parse a TOML configuration document on top of the defaults.
pub fn parse_config(content: &str) -> Result<LaunchConfig> {
    Ok(toml::from_str(content)?)
}

/// Apply the recognised [`ENV_KEYS`] found through `lookup`.
///
/// Blank values count as unset.
pub fn apply_env_overrides<F>(config: &mut LaunchConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(val) = get("TUNNELCAST_PORT") {
        config.dashboard.port = parse_number("TUNNELCAST_PORT", &val)?;
    }
    if let Some(val) = get("TUNNELCAST_DASHBOARD_CMD") {
        config.dashboard.command = val.split_whitespace().map(String::from).collect();
    }
    if let Some(val) = get("TUNNELCAST_DASHBOARD_DIR") {
        config.dashboard.working_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = get("TUNNELCAST_STARTUP_PAUSE_SECS") {
        config.dashboard.startup_pause_secs = parse_number("TUNNELCAST_STARTUP_PAUSE_SECS", &val)?;
    }
    if let Some(val) = get("TUNNELCAST_CLOUDFLARED_BIN") {
        config.tunnel.cloudflared_bin = Some(PathBuf::from(val));
    }
    if let Some(val) = get("TUNNELCAST_TUNNEL_TOKEN") {
        config.tunnel.token = Some(val);
    }
    if let Some(val) = get("TUNNELCAST_TUNNEL_URL") {
        config.tunnel.url = Some(val);
    }
    if let Some(val) = get("TUNNELCAST_TUNNEL_LOG") {
        config.tunnel.output_log = Some(PathBuf::from(val));
    }
    if let Some(val) = get("TUNNELCAST_SSH_KEY") {
        config.ssh.key = Some(PathBuf::from(val));
    }
    if let Some(val) = get("TUNNELCAST_SSH_PASSPHRASE") {
        config.ssh.passphrase = Some(val);
    }
    if let Some(val) = get("TUNNELCAST_SSH_PASSPHRASE_FILE") {
        config.ssh.passphrase_file = Some(PathBuf::from(val));
    }
    if let Some(val) = get("TUNNELCAST_SITE_REPO") {
        config.publish.repo = Some(PathBuf::from(val));
    }
    if let Some(val) = get("TUNNELCAST_SITE_ASSET") {
        config.publish.asset = PathBuf::from(val);
    }
    if let Some(val) = get("TUNNELCAST_SITE_VAR") {
        config.publish.identifier = val;
    }
    if let Some(val) = get("TUNNELCAST_GIT_REMOTE") {
        config.publish.remote = val;
    }
    if let Some(val) = get("TUNNELCAST_GIT_BRANCH") {
        config.publish.branch = val;
    }
    if let Some(val) = get("TUNNELCAST_LOG_FILE") {
        config.log.file = Some(PathBuf::from(val));
    }
    if let Some(val) = get("TUNNELCAST_LOG_LEVEL") {
        config.log.level = val;
    }
    if let Some(val) = get("TUNNELCAST_LOG_JSON") {
        config.log.json = parse_flag("TUNNELCAST_LOG_JSON", &val)?;
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(key: &str, val: &str) -> Result<T> {
    val.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: expected a number, got {val:?}")))
}

fn parse_flag(key: &str, val: &str) -> Result<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{key}: expected a boolean, got {val:?}"))),
    }
}
