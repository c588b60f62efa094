//! Ephemeral Kubernetes control plane for controller integration suites.
//!
//! A [suite::Suite] registers the kinds the suite works with, starts a control plane with the required custom
//! resource definitions installed, runs every test case against it and always stops it afterwards.
pub mod cli;
pub mod client;
pub mod config;
pub mod context;
pub mod control_plane;
pub mod logging;
pub mod retry;
pub mod scheme;
pub mod suite;
