//! Environment preparation before anything is launched.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::cmd::{command_exists, try_cmd};

const CLOUDFLARED: &str = "cloudflared";

/// Install locations checked when cloudflared is not on PATH (services
/// often run with a stripped PATH).
fn cloudflared_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".local/bin").join(CLOUDFLARED));
    }
    candidates.push(PathBuf::from("/usr/local/bin").join(CLOUDFLARED));
    candidates.push(PathBuf::from("/usr/bin").join(CLOUDFLARED));
    candidates.push(PathBuf::from("/opt/homebrew/bin").join(CLOUDFLARED));
    candidates
}

/// Resolve the cloudflared executable.
///
/// An explicitly configured path is used as-is, even when it does not exist:
/// a missing binary surfaces later as a tunnel that never prints an address.
pub fn resolve_cloudflared(configured: Option<&Path>) -> PathBuf {
    if let Some(path) = configured {
        if path.components().count() == 1 {
            if let Ok(found) = which::which(path) {
                return found;
            }
        }
        if !path.exists() {
            warn!(path = %path.display(), "configured cloudflared binary does not exist");
        }
        return path.to_path_buf();
    }

    if let Ok(found) = which::which(CLOUDFLARED) {
        debug!(path = %found.display(), "cloudflared found on PATH");
        return found;
    }
    if let Some(found) = cloudflared_candidates().into_iter().find(|p| p.exists()) {
        debug!(path = %found.display(), "cloudflared found in install location");
        return found;
    }

    warn!("cloudflared not found on PATH or in common install locations");
    PathBuf::from(CLOUDFLARED)
}

/// Evict whatever is listening on `port`. Best-effort: failures are logged
/// and ignored.
pub async fn free_port(port: u16) {
    if command_exists("fuser") {
        let target = format!("{port}/tcp");
        match try_cmd("fuser", &["-k", &target], None, &[]).await {
            Ok(out) if out.success => info!(port, "evicted previous listener"),
            Ok(_) => debug!(port, "port is free"),
            Err(e) => debug!(port, error = %e, "fuser failed"),
        }
        return;
    }

    if command_exists("lsof") {
        let target = format!("-iTCP:{port}");
        match try_cmd("lsof", &["-t", &target, "-sTCP:LISTEN"], None, &[]).await {
            Ok(out) => {
                let own = std::process::id();
                for pid in parse_pids(&out.stdout).into_iter().filter(|p| *p != own) {
                    kill_pid(pid, port);
                }
            }
            Err(e) => debug!(port, error = %e, "lsof failed"),
        }
        return;
    }

    debug!(port, "neither fuser nor lsof available; not freeing port");
}

/// Parse one pid per line, skipping anything that is not a pid.
pub fn parse_pids(text: &str) -> Vec<u32> {
    text.lines()
        .filter_map(|line| line.trim().parse().ok())
        .filter(|pid| *pid > 0)
        .collect()
}

#[cfg(unix)]
fn kill_pid(pid: u32, port: u16) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => info!(port, pid, "evicted previous listener"),
        Err(e) => debug!(port, pid, error = %e, "failed to kill previous listener"),
    }
}

#[cfg(not(unix))]
fn kill_pid(pid: u32, port: u16) {
    debug!(port, pid, "killing listeners is only supported on unix");
}
