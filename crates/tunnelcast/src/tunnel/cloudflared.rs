//! cloudflared process launching.

use std::path::PathBuf;
use std::time::Duration;

use tempfile::NamedTempFile;
use tracing::warn;
use tunnelcast_core::config::TunnelConfig;

use super::{TunnelLauncher, TunnelProcess};
use crate::process::{ManagedProcess, OutputBuffer, ProcessError, ProcessSpec};

/// How cloudflared is asked to expose the dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelMode {
    /// Quick tunnel: a fresh `*.trycloudflare.com` address on every launch.
    Ephemeral { port: u16 },
    /// Pre-provisioned tunnel bound to a token; its address is known out of
    /// band.
    Stable { token: String },
}

impl TunnelMode {
    /// Stable when a token is configured, ephemeral otherwise.
    pub fn from_config(config: &TunnelConfig, port: u16) -> Self {
        config.stable_token().map_or(Self::Ephemeral { port }, |token| Self::Stable {
            token: token.to_string(),
        })
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ephemeral { .. } => "ephemeral",
            Self::Stable { .. } => "stable",
        }
    }

    pub fn args(&self) -> Vec<String> {
        match self {
            Self::Ephemeral { port } => vec![
                "tunnel".into(),
                "--no-autoupdate".into(),
                "--url".into(),
                format!("http://localhost:{port}"),
            ],
            Self::Stable { .. } => vec!["tunnel".into(), "--no-autoupdate".into(), "run".into()],
        }
    }

    /// The token travels through the environment so it never shows up in
    /// process listings or logged argument vectors.
    pub fn envs(&self) -> Vec<(String, String)> {
        match self {
            Self::Ephemeral { .. } => Vec::new(),
            Self::Stable { token } => vec![("TUNNEL_TOKEN".to_string(), token.clone())],
        }
    }
}

/// Launches cloudflared with its combined output written to a file and
/// followed, so the process does not depend on the launcher staying alive.
#[derive(Debug, Clone)]
pub struct CloudflaredLauncher {
    bin: PathBuf,
    mode: TunnelMode,
    output_log: Option<PathBuf>,
    terminate_timeout: Duration,
}

impl CloudflaredLauncher {
    pub fn new(bin: PathBuf, mode: TunnelMode, config: &TunnelConfig) -> Self {
        Self {
            bin,
            mode,
            output_log: config.output_log.clone(),
            terminate_timeout: Duration::from_secs(config.terminate_timeout_secs),
        }
    }

    /// Where cloudflared writes its output: the configured log, or a
    /// per-run file that is unlinked once the child holds it open.
    fn output_target(&self) -> Option<(PathBuf, Option<NamedTempFile>)> {
        if let Some(path) = &self.output_log {
            return Some((path.clone(), None));
        }
        match tempfile::Builder::new()
            .prefix("tunnelcast-tunnel-")
            .suffix(".log")
            .tempfile()
        {
            Ok(file) => Some((file.path().to_path_buf(), Some(file))),
            Err(e) => {
                warn!(error = %e, "cannot create tunnel output file; piping output instead");
                None
            }
        }
    }

    fn spawn(&self, output: &OutputBuffer) -> Result<ManagedProcess, ProcessError> {
        let mut spec = ProcessSpec::new(self.bin.clone())
            .args(self.mode.args())
            .terminate_timeout(self.terminate_timeout);
        spec.envs = self.mode.envs();

        // The per-run file only has to exist until the child has opened it.
        let Some((path, _scratch)) = self.output_target() else {
            return ManagedProcess::spawn(&spec, "tunnel", Some(output.clone()));
        };
        let file_spec = spec.clone().output_file(&path);
        match ManagedProcess::spawn(&file_spec, "tunnel", Some(output.clone())) {
            Err(ProcessError::OutputFile { path, reason }) => {
                warn!(
                    path = %path.display(),
                    %reason,
                    "cannot open tunnel output file; piping output instead"
                );
                ManagedProcess::spawn(&spec, "tunnel", Some(output.clone()))
            }
            spawned => spawned,
        }
    }
}

impl TunnelLauncher for CloudflaredLauncher {
    type Process = CloudflaredProcess;

    fn launch(&mut self, attempt: u32) -> CloudflaredProcess {
        let output = OutputBuffer::new();
        let process = match self.spawn(&output) {
            Ok(process) => Some(process),
            Err(e) => {
                warn!(attempt, error = %e, "failed to launch cloudflared; attempt will time out");
                None
            }
        };
        CloudflaredProcess { process, output }
    }
}

/// A launched (or failed-to-launch) cloudflared instance.
#[derive(Debug)]
pub struct CloudflaredProcess {
    process: Option<ManagedProcess>,
    output: OutputBuffer,
}

impl CloudflaredProcess {
    pub const fn is_running(&self) -> bool {
        self.process.is_some()
    }

    /// Stop retaining output and hand over the process so it can outlive the
    /// acquisition.
    pub fn into_detached(self) -> Option<ManagedProcess> {
        self.output.release();
        self.process
    }
}

impl TunnelProcess for CloudflaredProcess {
    fn output(&self) -> String {
        self.output.snapshot()
    }

    async fn terminate(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.terminate().await;
        }
    }
}
