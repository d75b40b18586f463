//! Public tunnel for the local dashboard.
//!
//! The acquisition loop only sees the narrow [`TunnelLauncher`] /
//! [`TunnelProcess`] seam, so it can be driven by synthetic output in tests.

pub mod acquire;
pub mod cloudflared;

use std::future::Future;

pub use acquire::{Acquisition, AttemptOutcome, TunnelSession, acquire, poll_attempt, start_tunnel};
pub use cloudflared::{CloudflaredLauncher, CloudflaredProcess, TunnelMode};

/// A launched tunnel whose combined output can be inspected.
pub trait TunnelProcess {
    /// Combined output captured since launch.
    fn output(&self) -> String;

    /// Stop the tunnel. Must be safe to call on a tunnel that never started.
    fn terminate(&mut self) -> impl Future<Output = ()> + Send;
}

/// Starts tunnel processes, one per acquisition attempt.
pub trait TunnelLauncher {
    type Process: TunnelProcess;

    /// Launch attempt number `attempt` (1-indexed). Launch failures are not
    /// reported here: they yield a process that never prints anything.
    fn launch(&mut self, attempt: u32) -> Self::Process;
}
