use super::certs::{ControlPlaneCerts, ADMIN_USER};
use super::crd::install_crds;
use super::descriptor::ConnectionDescriptor;
use super::error::{ProvisionError, TeardownError};
use super::manifest::{load_crds, ManifestRef};
use super::process::{free_port, ControlPlaneProcess};
use super::{last_poll_error, probe_readyz, ControlPlaneHandle, ProvisionedControlPlane, Provisioner};
use crate::config::EnvTestConfig;
use crate::retry::{poll_until, Backoff};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::config::Kubeconfig;
use std::fs;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const ETCD: &str = "etcd";
const KUBE_APISERVER: &str = "kube-apiserver";
const SERVICE_CLUSTER_IP_RANGE: &str = "10.0.0.0/24";
const CLUSTER_NAME: &str = "envtest";

/// Provisions a control plane from local etcd and kube-apiserver binaries.
#[derive(Debug, Clone, Default)]
pub struct EnvTest {
    config: EnvTestConfig,
}

impl EnvTest {
    pub fn new(config: EnvTestConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EnvTestConfig {
        &self.config
    }

    fn resolve_binary(
        &self,
        name: &str,
        explicit: Option<&PathBuf>,
    ) -> Result<PathBuf, ProvisionError> {
        let path = explicit
            .cloned()
            .unwrap_or_else(|| self.config.binary_assets_dir.join(name));
        if !path.is_file() {
            return Err(ProvisionError::BinaryNotFound {
                name: name.to_string(),
                path,
            });
        }
        Ok(path)
    }

    async fn launch(
        &self,
        handle: &mut EnvTestHandle,
        binaries: Binaries,
        crds: &[CustomResourceDefinition],
    ) -> Result<ConnectionDescriptor, ProvisionError> {
        let deadline = Instant::now() + self.config.start_timeout;
        let backoff = self.config.backoff();
        let attach = self.config.attach_control_plane_output;

        let dir = tempfile::Builder::new().prefix("k8s-envtest-").tempdir()?;
        let root = dir.path().to_path_buf();
        handle.dir = Some(dir);

        let ports = Ports::allocate()?;
        let certs = ControlPlaneCerts::generate()?;
        let cert_paths = certs.write_to(&root)?;
        let etcd_data = root.join("etcd");
        fs::create_dir(&etcd_data)?;
        debug!(dir = %root.display(), etcd = ports.etcd, apiserver = ports.apiserver, "control plane resources allocated");

        let etcd_url = format!("http://127.0.0.1:{}", ports.etcd);
        let peer_url = format!("http://127.0.0.1:{}", ports.etcd_peer);
        let etcd = handle.etcd.insert(ControlPlaneProcess::spawn(
            ETCD,
            &binaries.etcd,
            [
                format!("--data-dir={}", etcd_data.display()),
                format!("--listen-client-urls={etcd_url}"),
                format!("--advertise-client-urls={etcd_url}"),
                format!("--listen-peer-urls={peer_url}"),
                format!("--initial-advertise-peer-urls={peer_url}"),
                format!("--initial-cluster=default={peer_url}"),
                "--unsafe-no-fsync=true".to_string(),
            ],
            attach,
        )?);
        let etcd_addr = SocketAddr::from(([127, 0, 0, 1], ports.etcd));
        wait_ready(etcd, remaining(deadline), backoff, || async move {
            TcpStream::connect(etcd_addr)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
        .await?;
        debug!("etcd is accepting connections");

        let server = format!("https://127.0.0.1:{}", ports.apiserver);
        let apiserver = handle.apiserver.insert(ControlPlaneProcess::spawn(
            KUBE_APISERVER,
            &binaries.kube_apiserver,
            [
                "--advertise-address=127.0.0.1".to_string(),
                "--bind-address=127.0.0.1".to_string(),
                format!("--secure-port={}", ports.apiserver),
                format!("--etcd-servers={etcd_url}"),
                format!("--cert-dir={}", root.display()),
                format!("--tls-cert-file={}", cert_paths.serving_cert.display()),
                format!("--tls-private-key-file={}", cert_paths.serving_key.display()),
                format!("--client-ca-file={}", cert_paths.ca_cert.display()),
                format!(
                    "--service-account-key-file={}",
                    cert_paths.service_account_pub.display()
                ),
                format!(
                    "--service-account-signing-key-file={}",
                    cert_paths.service_account_key.display()
                ),
                format!("--service-account-issuer={server}/"),
                format!("--service-cluster-ip-range={SERVICE_CLUSTER_IP_RANGE}"),
                "--allow-privileged=true".to_string(),
                "--authorization-mode=RBAC".to_string(),
                "--disable-admission-plugins=ServiceAccount".to_string(),
            ],
            attach,
        )?);

        let kubeconfig_path = root.join("kubeconfig");
        let kubeconfig_yaml = admin_kubeconfig(&server, &certs);
        fs::write(&kubeconfig_path, &kubeconfig_yaml)?;
        let descriptor =
            ConnectionDescriptor::new(server.as_str(), Kubeconfig::from_yaml(&kubeconfig_yaml)?)
                .with_kubeconfig_path(kubeconfig_path);

        let client = descriptor.client().await?;
        let client_ref = &client;
        wait_ready(apiserver, remaining(deadline), backoff, || {
            probe_readyz(client_ref)
        })
        .await?;
        info!(%server, "kube-apiserver is ready");

        install_crds(&client, crds, self.config.crd_install_timeout, backoff).await?;

        Ok(descriptor)
    }
}

#[async_trait]
impl Provisioner for EnvTest {
    async fn start(
        &self,
        manifests: &[ManifestRef],
    ) -> Result<ProvisionedControlPlane, ProvisionError> {
        let binaries = Binaries {
            etcd: self.resolve_binary(ETCD, self.config.etcd_binary.as_ref())?,
            kube_apiserver: self
                .resolve_binary(KUBE_APISERVER, self.config.kube_apiserver_binary.as_ref())?,
        };
        let crds = load_crds(manifests, self.config.error_if_crd_path_missing)?;

        let mut handle = EnvTestHandle::new(self.config.stop_timeout);
        match self.launch(&mut handle, binaries, &crds).await {
            Ok(descriptor) => {
                info!(server = descriptor.server(), crds = crds.len(), "control plane started");
                Ok(ProvisionedControlPlane {
                    descriptor,
                    handle: Box::new(handle),
                })
            }
            Err(err) => {
                warn!(%err, "control plane failed to start, releasing acquired resources");
                match handle.release().await {
                    Ok(()) => Err(err),
                    Err(cleanup) => Err(ProvisionError::CleanupFailed {
                        source: Box::new(err),
                        cleanup,
                    }),
                }
            }
        }
    }
}

struct Binaries {
    etcd: PathBuf,
    kube_apiserver: PathBuf,
}

struct Ports {
    etcd: u16,
    etcd_peer: u16,
    apiserver: u16,
}

impl Ports {
    fn allocate() -> Result<Self, ProvisionError> {
        Ok(Self {
            etcd: free_port()?,
            etcd_peer: free_port()?,
            apiserver: free_port()?,
        })
    }
}

/// Resources owned by a control plane started by [EnvTest].
#[derive(Debug)]
pub struct EnvTestHandle {
    apiserver: Option<ControlPlaneProcess>,
    etcd: Option<ControlPlaneProcess>,
    dir: Option<TempDir>,
    stop_timeout: Duration,
}

impl EnvTestHandle {
    fn new(stop_timeout: Duration) -> Self {
        Self {
            apiserver: None,
            etcd: None,
            dir: None,
            stop_timeout,
        }
    }

    /// Directory holding the etcd data, certificates and kubeconfig.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(|dir| dir.path())
    }

    /// Stops the api-server before etcd and removes the directory, reporting every failure.
    async fn release(&mut self) -> Result<(), TeardownError> {
        let mut errors = Vec::new();
        for process in [self.apiserver.take(), self.etcd.take()].into_iter().flatten() {
            let name = process.name().to_string();
            match process.stop(self.stop_timeout).await {
                Ok(()) => debug!(process = %name, "stopped"),
                Err(err) => errors.push(err),
            }
        }
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(source) = dir.close() {
                errors.push(TeardownError::RemoveDir { path, source });
            }
        }
        TeardownError::from_errors(errors)
    }
}

#[async_trait]
impl ControlPlaneHandle for EnvTestHandle {
    async fn stop(self: Box<Self>) -> Result<(), TeardownError> {
        let mut handle = *self;
        handle.release().await?;
        info!("control plane stopped");
        Ok(())
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Polls `probe` until it succeeds, failing early if `process` exits.
async fn wait_ready<F, Fut>(
    process: &mut ControlPlaneProcess,
    timeout: Duration,
    backoff: Backoff,
    mut probe: F,
) -> Result<(), ProvisionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    let component = process.name().to_string();
    poll_until(timeout, backoff, || {
        let running = process.ensure_running();
        let probe = probe();
        async move {
            match running {
                Err(exited) => Ok(Err(exited)),
                Ok(()) => probe.await.map(Ok),
            }
        }
    })
    .await
    .map_err(|err| ProvisionError::ReadinessTimeout {
        component,
        timeout,
        last_error: last_poll_error(err),
    })?
}

fn admin_kubeconfig(server: &str, certs: &ControlPlaneCerts) -> String {
    format!(
        r#"apiVersion: v1
kind: Config
clusters:
- name: {CLUSTER_NAME}
  cluster:
    server: {server}
    certificate-authority-data: {ca}
users:
- name: {ADMIN_USER}
  user:
    client-certificate-data: {cert}
    client-key-data: {key}
contexts:
- name: {CLUSTER_NAME}
  context:
    cluster: {CLUSTER_NAME}
    user: {ADMIN_USER}
current-context: {CLUSTER_NAME}
"#,
        ca = STANDARD.encode(&certs.ca_cert),
        cert = STANDARD.encode(&certs.client_cert),
        key = STANDARD.encode(&certs.client_key),
    )
}
