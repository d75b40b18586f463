//! Background dashboard launcher.

use std::path::PathBuf;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{info, warn};
use tunnelcast_core::config::DashboardConfig;

use crate::process::{ManagedProcess, ProcessError, ProcessSpec};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Build the process spec for the dashboard. The port is exported as `PORT`.
pub fn dashboard_spec(config: &DashboardConfig) -> Result<ProcessSpec, ProcessError> {
    let (program, args) = config
        .command
        .split_first()
        .ok_or_else(|| ProcessError::SpawnFailed {
            program: String::new(),
            reason: "empty dashboard command".to_string(),
        })?;
    Ok(ProcessSpec::new(PathBuf::from(program))
        .args(args.iter().cloned())
        .env("PORT", config.port.to_string())
        .current_dir(config.working_dir.clone()))
}

/// Start the dashboard. This is the only launch failure that aborts a run.
pub fn launch_dashboard(config: &DashboardConfig) -> Result<ManagedProcess, ProcessError> {
    let spec = dashboard_spec(config)?;
    let process = ManagedProcess::spawn(&spec, "dashboard", None)?;
    info!(port = config.port, pid = process.pid(), "dashboard launched");
    Ok(process)
}

/// Give the dashboard time to bind its port before the tunnel points at it.
///
/// The pause is fixed; the connection check afterwards only reports.
pub async fn startup_pause(config: &DashboardConfig) {
    tokio::time::sleep(Duration::from_secs(config.startup_pause_secs)).await;
    if is_listening(config.port).await {
        info!(port = config.port, "dashboard is accepting connections");
    } else {
        warn!(
            port = config.port,
            "dashboard is not accepting connections yet; starting tunnel anyway"
        );
    }
}

/// Whether something accepts TCP connections on `127.0.0.1:port`.
pub async fn is_listening(port: u16) -> bool {
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn spec_exports_port_and_working_dir() {
        let config = DashboardConfig {
            port: 8123,
            command: vec!["python3".into(), "-m".into(), "dashboard".into()],
            working_dir: Some(PathBuf::from("/srv/dashboard")),
            startup_pause_secs: 0,
        };
        let spec = dashboard_spec(&config).unwrap();
        assert_eq!(spec.program, PathBuf::from("python3"));
        assert_eq!(spec.args, vec!["-m", "dashboard"]);
        assert!(spec.envs.contains(&("PORT".to_string(), "8123".to_string())));
        assert_eq!(spec.working_dir, Some(PathBuf::from("/srv/dashboard")));
    }

    #[test]
    fn empty_command_is_rejected() {
        let config = DashboardConfig {
            command: Vec::new(),
            ..DashboardConfig::default()
        };
        assert!(dashboard_spec(&config).is_err());
    }

    #[tokio::test]
    async fn readiness_check_detects_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_listening(port).await);
        drop(listener);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launched_dashboard_sees_its_port() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("port");
        let config = DashboardConfig {
            port: 8199,
            command: vec![
                "sh".into(),
                "-c".into(),
                format!("echo $PORT > {}", marker.display()),
            ],
            working_dir: None,
            startup_pause_secs: 0,
        };
        let mut dashboard = launch_dashboard(&config).unwrap();
        assert!(dashboard.wait().await.unwrap().success());
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "8199");
    }
}
