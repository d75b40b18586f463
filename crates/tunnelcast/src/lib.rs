//! `tunnelcast` launcher.
//!
//! Starts a local dashboard, exposes it through a cloudflared tunnel, embeds
//! the tunnel's public address in a static site and pushes it, then waits on
//! the dashboard for the rest of its life.

pub mod cmd;
pub mod prep;
pub mod process;
pub mod publish;
pub mod runner;
pub mod service;
pub mod ssh;
pub mod supervisor;
pub mod tunnel;
