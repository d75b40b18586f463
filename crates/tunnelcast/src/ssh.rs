//! Deploy-key unlocking for the publication step.
//!
//! Instead of exporting agent variables into the launcher's own environment,
//! the result is a [`GitAuth`] value whose variables are passed to every git
//! invocation explicitly.

use std::path::Path;

use tracing::{debug, info, warn};
use tunnelcast_core::config::SshConfig;

use crate::cmd::try_cmd;

/// Environment handed to git so it authenticates with the deploy key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitAuth {
    envs: Vec<(String, String)>,
    /// Agent started for this run, stopped by [`GitAuth::stop_agent`].
    agent: Option<AgentEnv>,
}

impl GitAuth {
    /// Git uses whatever credentials it finds on its own.
    pub fn ambient() -> Self {
        Self::default()
    }

    pub fn envs(&self) -> &[(String, String)] {
        &self.envs
    }

    fn with_key(key: &Path) -> Self {
        Self {
            envs: vec![("GIT_SSH_COMMAND".to_string(), ssh_command(key))],
            agent: None,
        }
    }

    fn attach_agent(&mut self, agent: AgentEnv) {
        self.envs.extend(agent.envs());
        self.agent = Some(agent);
    }

    /// Kill the agent started by [`unlock_key`], if any. The key is only
    /// needed for the publication step.
    pub async fn stop_agent(&self) {
        let Some(agent) = &self.agent else {
            return;
        };
        match try_cmd("ssh-agent", &["-k"], None, &agent.envs()).await {
            Ok(out) if out.success => debug!(agent_pid = %agent.pid, "ssh-agent stopped"),
            Ok(out) => warn!(agent_pid = %agent.pid, stderr = %out.stderr, "ssh-agent -k failed"),
            Err(e) => warn!(agent_pid = %agent.pid, error = %e, "failed to stop ssh-agent"),
        }
    }
}

fn ssh_command(key: &Path) -> String {
    let quoted = key.display().to_string().replace('\'', r"'\''");
    format!("ssh -i '{quoted}' -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new")
}

/// Variables printed by `ssh-agent -s`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEnv {
    pub auth_sock: String,
    pub pid: String,
}

impl AgentEnv {
    fn envs(&self) -> Vec<(String, String)> {
        vec![
            ("SSH_AUTH_SOCK".to_string(), self.auth_sock.clone()),
            ("SSH_AGENT_PID".to_string(), self.pid.clone()),
        ]
    }
}

/// Parse the Bourne-shell output of `ssh-agent -s`:
///
/// ```text
/// SSH_AUTH_SOCK=/tmp/ssh-XXXX/agent.123; export SSH_AUTH_SOCK;
/// SSH_AGENT_PID=124; export SSH_AGENT_PID;
/// ```
pub fn parse_agent_output(text: &str) -> Option<AgentEnv> {
    let mut auth_sock = None;
    let mut pid = None;
    for statement in text.split([';', '\n']) {
        if let Some((key, value)) = statement.trim().split_once('=') {
            match key {
                "SSH_AUTH_SOCK" => auth_sock = Some(value.to_string()),
                "SSH_AGENT_PID" => pid = Some(value.to_string()),
                _ => {}
            }
        }
    }
    Some(AgentEnv {
        auth_sock: auth_sock?,
        pid: pid?,
    })
}

/// Prepare git authentication from the configured deploy key.
///
/// A passphrase-protected key is loaded into a fresh `ssh-agent`. Every
/// failure degrades to fewer credentials; publication then fails (and is
/// logged) at push time rather than aborting the launch.
pub async fn unlock_key(config: &SshConfig) -> GitAuth {
    let Some(key) = config.key_path() else {
        info!("no deploy key configured; git uses its default credentials");
        return GitAuth::ambient();
    };
    if !key.exists() {
        warn!(key = %key.display(), "deploy key not found; git uses its default credentials");
        return GitAuth::ambient();
    }

    let mut auth = GitAuth::with_key(&key);
    let passphrase = match config.passphrase() {
        Ok(Some(pass)) => pass,
        Ok(None) => {
            debug!(key = %key.display(), "deploy key has no passphrase configured");
            return auth;
        }
        Err(e) => {
            warn!(error = %e, "cannot read deploy key passphrase; using key without agent");
            return auth;
        }
    };

    let agent = match start_agent().await {
        Ok(agent) => agent,
        Err(e) => {
            warn!(error = %e, "failed to start ssh-agent");
            return auth;
        }
    };
    match add_key(&key, &passphrase, &agent).await {
        Ok(()) => info!(key = %key.display(), agent_pid = %agent.pid, "deploy key unlocked"),
        Err(e) => warn!(key = %key.display(), error = %e, "failed to add deploy key to ssh-agent"),
    }
    auth.attach_agent(agent);
    auth
}

async fn start_agent() -> anyhow::Result<AgentEnv> {
    let out = try_cmd("ssh-agent", &["-s"], None, &[]).await?;
    if !out.success {
        anyhow::bail!("ssh-agent exited with failure: {}", out.stderr);
    }
    parse_agent_output(&out.stdout)
        .ok_or_else(|| anyhow::anyhow!("unexpected ssh-agent output: {}", out.stdout))
}

#[cfg(unix)]
async fn add_key(key: &Path, passphrase: &str, agent: &AgentEnv) -> anyhow::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    use anyhow::Context;

    // ssh-add reads the passphrase from SSH_ASKPASS when it has no terminal.
    let mut helper = tempfile::Builder::new()
        .prefix("tunnelcast-askpass-")
        .tempfile()
        .context("failed to create askpass helper")?;
    helper.write_all(b"#!/bin/sh\nprintf '%s\\n' \"$TUNNELCAST_ASKPASS\"\n")?;
    helper
        .as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o700))?;
    let helper = helper.into_temp_path();

    let mut envs = agent.envs();
    envs.extend([
        ("SSH_ASKPASS".to_string(), helper.display().to_string()),
        ("SSH_ASKPASS_REQUIRE".to_string(), "force".to_string()),
        ("DISPLAY".to_string(), ":0".to_string()),
        ("TUNNELCAST_ASKPASS".to_string(), passphrase.to_string()),
    ]);
    let key_arg = key.display().to_string();
    let out = try_cmd("ssh-add", &[key_arg.as_str()], None, &envs).await?;
    if !out.success {
        anyhow::bail!("ssh-add failed: {}", out.stderr);
    }
    Ok(())
}

#[cfg(not(unix))]
async fn add_key(_key: &Path, _passphrase: &str, _agent: &AgentEnv) -> anyhow::Result<()> {
    anyhow::bail!("passphrase-protected deploy keys are only supported on unix")
}
