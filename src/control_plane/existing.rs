use super::crd::{absent_crds, install_crds, uninstall_crds};
use super::descriptor::ConnectionDescriptor;
use super::error::{ProvisionError, TeardownError};
use super::manifest::{load_crds, ManifestRef};
use super::{last_poll_error, probe_readyz, ControlPlaneHandle, ProvisionedControlPlane, Provisioner};
use crate::config::EnvTestConfig;
use crate::retry::poll_until;
use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Client, Config};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

/// Uses an already running cluster instead of starting one. The handle owns the definitions this run created,
/// definitions the cluster already had and the cluster itself are left in place.
#[derive(Debug, Clone, Default)]
pub struct ExistingCluster {
    config: EnvTestConfig,
}

impl ExistingCluster {
    pub fn new(config: EnvTestConfig) -> Self {
        Self { config }
    }

    /// Installs `crds`, handing out ownership of the ones the cluster didn't have.
    async fn install(
        &self,
        client: Client,
        crds: &[CustomResourceDefinition],
    ) -> Result<ExistingClusterHandle, ProvisionError> {
        let created = absent_crds(&client, crds, self.config.crd_install_timeout).await?;
        let handle = ExistingClusterHandle {
            client,
            crds: created,
            stop_timeout: self.config.stop_timeout,
        };
        if let Err(err) = install_crds(
            &handle.client,
            crds,
            self.config.crd_install_timeout,
            self.config.backoff(),
        )
        .await
        {
            warn!(%err, "installing crds in the existing cluster failed, removing the ones created");
            return match handle.release().await {
                Ok(()) => Err(err),
                Err(cleanup) => Err(ProvisionError::CleanupFailed {
                    source: Box::new(err),
                    cleanup,
                }),
            };
        }
        Ok(handle)
    }

    fn read_kubeconfig(&self) -> Result<Kubeconfig, ProvisionError> {
        let kubeconfig = match &self.config.existing_cluster_kubeconfig {
            Some(path) => Kubeconfig::read_from(path)?,
            None => Kubeconfig::read()?,
        };
        Ok(kubeconfig)
    }
}

#[async_trait]
impl Provisioner for ExistingCluster {
    async fn start(
        &self,
        manifests: &[ManifestRef],
    ) -> Result<ProvisionedControlPlane, ProvisionError> {
        let crds = load_crds(manifests, self.config.error_if_crd_path_missing)?;
        let kubeconfig = self.read_kubeconfig()?;
        let config =
            Config::from_custom_kubeconfig(kubeconfig.clone(), &KubeConfigOptions::default())
                .await?;
        let mut descriptor = ConnectionDescriptor::new(config.cluster_url.to_string(), kubeconfig);
        if let Some(path) = &self.config.existing_cluster_kubeconfig {
            descriptor = descriptor.with_kubeconfig_path(path.clone());
        }

        let client = descriptor.client().await?;
        let client_ref = &client;
        poll_until(self.config.start_timeout, self.config.backoff(), || {
            probe_readyz(client_ref)
        })
        .await
        .map_err(|err| ProvisionError::ReadinessTimeout {
            component: descriptor.server().to_string(),
            timeout: self.config.start_timeout,
            last_error: last_poll_error(err),
        })?;

        let handle = self.install(client, &crds).await?;

        info!(
            server = descriptor.server(),
            crds = crds.len(),
            created = handle.crds().len(),
            "using existing cluster"
        );
        Ok(ProvisionedControlPlane {
            descriptor,
            handle: Box::new(handle),
        })
    }
}

/// Owns the definitions created in an existing cluster.
pub struct ExistingClusterHandle {
    client: Client,
    crds: Vec<String>,
    stop_timeout: Duration,
}

impl ExistingClusterHandle {
    /// Names of the definitions removed on stop.
    pub fn crds(&self) -> &[String] {
        &self.crds
    }

    async fn release(&self) -> Result<(), TeardownError> {
        uninstall_crds(&self.client, &self.crds, self.stop_timeout).await
    }
}

impl fmt::Debug for ExistingClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExistingClusterHandle")
            .field("crds", &self.crds)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ControlPlaneHandle for ExistingClusterHandle {
    async fn stop(self: Box<Self>) -> Result<(), TeardownError> {
        self.release().await?;
        info!(crds = self.crds.len(), "crds removed from the existing cluster");
        Ok(())
    }
}
