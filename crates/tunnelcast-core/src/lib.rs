//! `tunnelcast` Core Library
//!
//! Process-free building blocks for the launcher:
//! - Tunnel address scanning of streamed tunnel output
//! - Rewriting of the published assignment line in the site asset
//! - Acquisition retry policy
//! - Configuration resolution and shared tracing setup

pub mod address;
pub mod asset;
pub mod config;
pub mod error;
pub mod policy;
pub mod tracing_init;

pub use address::{ScanOutcome, TunnelAddress};
pub use config::LaunchConfig;
pub use error::{Error, Result};
pub use policy::AcquirePolicy;
