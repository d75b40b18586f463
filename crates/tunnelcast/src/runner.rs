//! Launch sequence.

use anyhow::Context;
use tracing::info;
use tunnelcast_core::config::LaunchConfig;

use crate::prep::{free_port, resolve_cloudflared};
use crate::publish::publish;
use crate::service::{launch_dashboard, startup_pause};
use crate::ssh::{GitAuth, unlock_key};
use crate::supervisor::{notify_ready, supervise};
use crate::tunnel::start_tunnel;

/// Run the launcher to completion and return the dashboard's exit code.
///
/// Only a dashboard that cannot be started is an error. Tunnel and
/// publication problems degrade the run to a local-only dashboard.
pub async fn run(config: LaunchConfig) -> anyhow::Result<i32> {
    let cloudflared = resolve_cloudflared(config.tunnel.cloudflared_bin.as_deref());
    free_port(config.dashboard.port).await;

    let auth = if config.publish.repo.is_some() {
        unlock_key(&config.ssh).await
    } else {
        GitAuth::ambient()
    };

    let dashboard = launch_dashboard(&config.dashboard).context("failed to launch dashboard")?;
    startup_pause(&config.dashboard).await;

    let session = start_tunnel(
        &config.tunnel,
        config.dashboard.port,
        cloudflared,
        &config.acquire.policy(),
    )
    .await;
    info!(
        mode = session.mode.as_str(),
        address = session.address.as_ref().map_or("", |a| a.as_str()),
        "tunnel phase finished"
    );

    let outcome = publish(session.address.as_ref(), &config.publish, &auth).await;
    auth.stop_agent().await;
    info!(?outcome, "publication phase finished");

    notify_ready();
    Ok(supervise(dashboard, session.process).await)
}
