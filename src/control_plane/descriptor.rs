use kube::config::{KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::{Client, Config};
use std::path::{Path, PathBuf};
use std::sync::Once;
use tracing::{debug, warn};

#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    #[error("invalid kubeconfig: {0}")]
    Kubeconfig(#[from] KubeconfigError),

    #[error("building the kube client: {0}")]
    Client(#[from] kube::Error),
}

/// Endpoint and credentials of a running control plane.
///
/// The descriptor is only meaningful while the control plane it was created for is running. Once the control
/// plane is stopped any client built from it fails to connect.
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    server: String,
    kubeconfig: Kubeconfig,
    kubeconfig_path: Option<PathBuf>,
}

impl ConnectionDescriptor {
    pub fn new(server: impl Into<String>, kubeconfig: Kubeconfig) -> Self {
        Self {
            server: server.into(),
            kubeconfig,
            kubeconfig_path: None,
        }
    }

    pub fn with_kubeconfig_path(mut self, path: PathBuf) -> Self {
        self.kubeconfig_path = Some(path);
        self
    }

    /// The api-server url, i.e. `https://127.0.0.1:<port>`.
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn kubeconfig(&self) -> &Kubeconfig {
        &self.kubeconfig
    }

    /// Location of the kubeconfig on disk, when the provisioner wrote one.
    pub fn kubeconfig_path(&self) -> Option<&Path> {
        self.kubeconfig_path.as_deref()
    }

    /// Builds the client configuration for the current context of the kubeconfig.
    pub async fn to_config(&self) -> Result<Config, KubeconfigError> {
        Config::from_custom_kubeconfig(self.kubeconfig.clone(), &KubeConfigOptions::default())
            .await
    }

    /// Builds a new client connected to the control plane.
    pub async fn client(&self) -> Result<Client, ConnectError> {
        install_rustls_default_crypto_provider();
        let config = self.to_config().await?;
        debug!(server = %self.server, "building control plane client");
        Ok(Client::try_from(config)?)
    }
}

/// Install the default rustls crypto provider, check
/// <https://docs.rs/rustls/latest/rustls/crypto/struct.CryptoProvider.html#method.install_default> for details.
pub(crate) fn install_rustls_default_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            warn!("rustls default crypto provider was already installed for this process, this has no effect")
        }
    });
}
