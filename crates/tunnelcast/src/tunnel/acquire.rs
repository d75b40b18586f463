//! Bounded, rate-limit-aware acquisition of an ephemeral tunnel address.

use std::path::PathBuf;

use tracing::{info, warn};
use tunnelcast_core::address::{ScanOutcome, TunnelAddress, head_lines, scan};
use tunnelcast_core::config::TunnelConfig;
use tunnelcast_core::policy::AcquirePolicy;

use super::cloudflared::{CloudflaredLauncher, TunnelMode};
use super::{TunnelLauncher, TunnelProcess};
use crate::process::ManagedProcess;

/// How a single attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Found(TunnelAddress),
    /// The rate-limit marker appeared on poll number `polls`.
    RateLimited { polls: u32 },
    /// The whole poll budget passed without an address or marker.
    TimedOut,
}

/// Poll `process` output until an address or the rate-limit marker shows up,
/// or the poll budget runs out. Each poll sleeps first, then checks.
pub async fn poll_attempt<P: TunnelProcess>(process: &P, policy: &AcquirePolicy) -> AttemptOutcome {
    for poll in 1..=policy.polls_per_attempt {
        tokio::time::sleep(policy.poll_interval).await;
        match scan(&process.output()) {
            ScanOutcome::Address(address) => return AttemptOutcome::Found(address),
            ScanOutcome::RateLimited => return AttemptOutcome::RateLimited { polls: poll },
            ScanOutcome::Pending => {}
        }
    }
    AttemptOutcome::TimedOut
}

/// Result of [`acquire`].
#[derive(Debug)]
pub struct Acquisition<P> {
    pub address: Option<TunnelAddress>,
    /// The tunnel that produced `address`. `None` when acquisition failed;
    /// every other launched process has been terminated.
    pub process: Option<P>,
    /// Launches performed.
    pub attempts: u32,
}

/// Launch tunnels until one announces an address, at most
/// `policy.max_attempts` times with `policy.backoff` between attempts.
///
/// A failed attempt's process is terminated before the backoff, so at most
/// one tunnel is alive at any time.
pub async fn acquire<L: TunnelLauncher>(
    launcher: &mut L,
    policy: &AcquirePolicy,
) -> Acquisition<L::Process> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        info!(attempt, max_attempts = policy.max_attempts, "starting tunnel");
        let mut process = launcher.launch(attempt);

        match poll_attempt(&process, policy).await {
            AttemptOutcome::Found(address) => {
                info!(attempt, address = %address, "tunnel address acquired");
                return Acquisition {
                    address: Some(address),
                    process: Some(process),
                    attempts: attempt,
                };
            }
            AttemptOutcome::RateLimited { polls } => {
                warn!(attempt, polls, "tunnel provider is rate limiting; abandoning attempt");
            }
            AttemptOutcome::TimedOut => {
                warn!(
                    attempt,
                    window_secs = policy.attempt_window().as_secs(),
                    "no tunnel address within the poll window"
                );
            }
        }

        let output = process.output();
        process.terminate().await;

        if !policy.should_retry(attempt) {
            warn!(
                attempts = attempt,
                output = %head_lines(&output, policy.diagnostic_lines),
                "giving up on tunnel address; dashboard stays local only"
            );
            return Acquisition {
                address: None,
                process: None,
                attempts: attempt,
            };
        }

        info!(
            attempt,
            backoff_secs = policy.backoff.as_secs(),
            "backing off before next tunnel attempt"
        );
        tokio::time::sleep(policy.backoff).await;
    }
}

/// The tunnel left running for the rest of the run.
#[derive(Debug)]
pub struct TunnelSession {
    pub mode: TunnelMode,
    pub address: Option<TunnelAddress>,
    pub process: Option<ManagedProcess>,
}

/// Start the tunnel for `port`.
///
/// With a token the tunnel is launched once and the configured address (if
/// any) is used as-is. Otherwise the address is discovered by [`acquire`].
pub async fn start_tunnel(
    config: &TunnelConfig,
    port: u16,
    bin: PathBuf,
    policy: &AcquirePolicy,
) -> TunnelSession {
    let mode = TunnelMode::from_config(config, port);
    let mut launcher = CloudflaredLauncher::new(bin, mode.clone(), config);

    if let TunnelMode::Stable { .. } = mode {
        let process = launcher.launch(1);
        let address = config.stable_address();
        match &address {
            Some(address) => info!(address = %address, "stable tunnel started"),
            None => warn!("stable tunnel started without a configured address; nothing to publish"),
        }
        return TunnelSession {
            mode,
            address,
            process: process.into_detached(),
        };
    }

    let acquisition = acquire(&mut launcher, policy).await;
    TunnelSession {
        mode,
        address: acquisition.address,
        process: acquisition.process.and_then(|p| p.into_detached()),
    }
}
