//! Ephemeral control plane provisioning.
//!
//! A [Provisioner] starts a control plane with a set of custom resource definitions already installed and returns
//! the [ConnectionDescriptor] to reach it together with the [ControlPlaneHandle] owning its resources. Stopping the
//! handle consumes it.
mod certs;
mod crd;
mod descriptor;
mod envtest;
mod error;
mod existing;
mod manifest;
mod process;

pub use descriptor::{ConnectError, ConnectionDescriptor};
pub use envtest::{EnvTest, EnvTestHandle};
pub use error::{ManifestError, ProvisionError, TeardownError};
pub use existing::{ExistingCluster, ExistingClusterHandle};
pub use manifest::{load_crds, parse_crds, ManifestRef};

pub(crate) use crd::FIELD_MANAGER;
#[cfg(test)]
pub(crate) use descriptor::tests::unreachable_descriptor;

use crate::config::EnvTestConfig;
use crate::retry::PollError;
use async_trait::async_trait;
use kube::Client;

/// Starts control planes.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Starts a control plane with every definition referenced by `manifests` installed, blocking until it is ready.
    ///
    /// Resources acquired by a failed start are released before the error is returned.
    async fn start(
        &self,
        manifests: &[ManifestRef],
    ) -> Result<ProvisionedControlPlane, ProvisionError>;
}

/// Exclusive owner of the resources of a running control plane.
#[async_trait]
pub trait ControlPlaneHandle: Send + Sync + std::fmt::Debug {
    /// Releases every resource of the control plane. Failures are collected and reported together.
    async fn stop(self: Box<Self>) -> Result<(), TeardownError>;
}

#[derive(Debug)]
pub struct ProvisionedControlPlane {
    pub descriptor: ConnectionDescriptor,
    pub handle: Box<dyn ControlPlaneHandle>,
}

/// Provisioner selected by `config`: an existing cluster when `use_existing_cluster` is set, local binaries
/// otherwise.
pub fn provisioner_from_config(config: &EnvTestConfig) -> Box<dyn Provisioner> {
    if config.use_existing_cluster {
        Box::new(ExistingCluster::new(config.clone()))
    } else {
        Box::new(EnvTest::new(config.clone()))
    }
}

async fn probe_readyz(client: &Client) -> Result<(), String> {
    let request = http::Request::get("/readyz")
        .body(Vec::new())
        .map_err(|e| e.to_string())?;
    let body = client.request_text(request).await.map_err(|e| e.to_string())?;
    match body.trim() {
        "ok" => Ok(()),
        other => Err(format!("readyz answered `{other}`")),
    }
}

/// Error of the last answered attempt of a timed out poll.
fn last_poll_error(err: PollError<String>) -> String {
    err.into_last_error()
        .unwrap_or_else(|| "no answer before the deadline".to_string())
}
