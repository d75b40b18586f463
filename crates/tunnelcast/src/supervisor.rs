//! Final wait on the dashboard.

use std::future::Future;

use tracing::{error, info, warn};

use crate::process::{ManagedProcess, exit_code};

/// Tell systemd the launch sequence is complete (unix only, no-op elsewhere
/// or when not running under systemd).
pub fn notify_ready() {
    // `true` unsets $NOTIFY_SOCKET so later children cannot notify in our
    // name.
    #[cfg(unix)]
    if let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %e, "failed to notify systemd");
    }
}

/// Resolves when the launcher receives Ctrl+C or SIGTERM.
pub async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                None
            }
        };

    #[cfg(unix)]
    let sigterm_future = async {
        match sigterm.as_mut() {
            Some(signal) => signal.recv().await,
            None => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm_future => "SIGTERM",
    }
}

/// Wait for the dashboard and return its exit code.
///
/// The tunnel is left running when the dashboard exits on its own. A shutdown
/// signal stops both, and the dashboard's status is still what is returned.
pub async fn supervise(dashboard: ManagedProcess, tunnel: Option<ManagedProcess>) -> i32 {
    supervise_until(dashboard, tunnel, shutdown_signal()).await
}

/// [`supervise`] with an explicit shutdown trigger.
pub async fn supervise_until<F>(
    mut dashboard: ManagedProcess,
    tunnel: Option<ManagedProcess>,
    shutdown: F,
) -> i32
where
    F: Future<Output = &'static str>,
{
    info!(pid = dashboard.pid(), "waiting on dashboard");

    let waited = tokio::select! {
        status = dashboard.wait() => Some(status),
        signal = shutdown => {
            info!(signal, "received shutdown signal; stopping dashboard and tunnel");
            None
        }
    };

    match waited {
        Some(Ok(status)) => {
            let code = exit_code(status);
            info!(code, "dashboard exited");
            if let Some(tunnel) = tunnel {
                tunnel.detach();
            }
            code
        }
        Some(Err(e)) => {
            error!(error = %e, "lost track of dashboard");
            1
        }
        None => {
            if let Some(mut tunnel) = tunnel {
                tunnel.terminate().await;
            }
            let status = dashboard.terminate().await;
            status.map_or(1, exit_code)
        }
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::process::ProcessSpec;

    fn spawn(script: &str, label: &str) -> ManagedProcess {
        let spec = ProcessSpec::new("sh")
            .args(["-c", script])
            .terminate_timeout(Duration::from_secs(2));
        ManagedProcess::spawn(&spec, label, None).unwrap()
    }

    #[tokio::test]
    async fn propagates_dashboard_exit_code() {
        let dashboard = spawn("exit 3", "dashboard");
        let code = supervise_until(dashboard, None, std::future::pending()).await;
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn dashboard_exit_leaves_tunnel_running() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("tunnel-alive");
        let spec = ProcessSpec::new("sh")
            .args([
                "-c",
                &format!("echo up; sleep 1; touch {}; sleep 30", marker.display()),
            ])
            .output_file(dir.path().join("tunnel.log"));
        let tunnel = ManagedProcess::spawn(&spec, "tunnel", None).unwrap();
        let tunnel_pid = tunnel.pid().unwrap();
        let dashboard = spawn("exit 0", "dashboard");

        let code = supervise_until(dashboard, Some(tunnel), std::future::pending()).await;
        assert_eq!(code, 0);

        for _ in 0..50 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(marker.exists());

        let pid = nix::unistd::Pid::from_raw(i32::try_from(tunnel_pid).unwrap());
        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL).unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_dashboard_with_signal_status() {
        let dashboard = spawn("sleep 30", "dashboard");
        let tunnel = spawn("sleep 30", "tunnel");
        let code = supervise_until(dashboard, Some(tunnel), async { "SIGTERM" }).await;
        assert_eq!(code, 128 + 15);
    }
}
