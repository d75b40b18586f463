use std::path::Path;

use anyhow::{Context, Result, bail};
use tokio::process::Command;

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run a command to completion and capture its output, whatever its exit
/// status. Only a failure to start the program is an error.
pub async fn try_cmd(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    envs: &[(String, String)],
) -> Result<CmdOutput> {
    let cmd_line = format!("{program} {}", args.join(" "));
    tracing::debug!("exec: {cmd_line}");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to execute: {cmd_line}"))?;

    Ok(CmdOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Execute a command with logging. Logs the full command line at debug level
/// and a human-friendly description at info level. Returns trimmed stdout.
pub async fn run_cmd(
    description: &str,
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    envs: &[(String, String)],
) -> Result<String> {
    tracing::info!("{description}");
    let output = try_cmd(program, args, cwd, envs).await?;

    if !output.success {
        let cmd_line = format!("{program} {}", args.join(" "));
        tracing::error!("command failed: {cmd_line}\nstderr: {}", output.stderr);
        bail!("{description} failed: {}", output.stderr);
    }
    Ok(output.stdout)
}

/// Check whether a program exists on PATH.
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}
