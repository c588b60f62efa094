use super::descriptor::ConnectError;
use kube::config::KubeconfigError;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    #[error("manifest path `{0}` does not exist")]
    Missing(PathBuf),

    #[error("reading manifest `{path}`: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed manifest `{path}`: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("custom resource definition in `{0}` has no name")]
    UnnamedCrd(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("`{name}` binary not found at `{path}`")]
    BinaryNotFound { name: String, path: PathBuf },

    #[error("loading schema manifests: {0}")]
    Manifest(#[from] ManifestError),

    #[error("preparing control plane files: {0}")]
    Io(#[from] std::io::Error),

    #[error("allocating a local port: {0}")]
    PortAllocation(std::io::Error),

    #[error("generating control plane certificates: {0}")]
    Certificates(#[from] rcgen::Error),

    #[error("spawning `{name}`: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },

    #[error("`{name}` exited before becoming ready: {status}")]
    ProcessExited { name: String, status: ExitStatus },

    #[error("`{component}` not ready after {timeout:?}: {last_error}")]
    ReadinessTimeout {
        component: String,
        timeout: Duration,
        last_error: String,
    },

    #[error("invalid kubeconfig: {0}")]
    Kubeconfig(#[from] KubeconfigError),

    #[error("the kube client returned an error: `{0}`")]
    Client(#[from] kube::Error),

    #[error("connecting to the control plane: {0}")]
    Connect(#[from] ConnectError),

    #[error("installing crd `{name}`: {source}")]
    CrdInstall { name: String, source: kube::Error },

    #[error("{operation} did not finish within {timeout:?}")]
    TimedOut { operation: String, timeout: Duration },

    #[error("crds not established after {timeout:?}: {last_error}")]
    CrdNotEstablished {
        timeout: Duration,
        last_error: String,
    },

    #[error("{source}; releasing the partially started control plane also failed: {cleanup}")]
    CleanupFailed {
        source: Box<ProvisionError>,
        cleanup: TeardownError,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum TeardownError {
    #[error("stopping `{name}`: {reason}")]
    StopProcess { name: String, reason: String },

    #[error("removing control plane directory `{path}`: {source}")]
    RemoveDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("uninstalling crd `{name}`: {source}")]
    UninstallCrd { name: String, source: kube::Error },

    #[error("{operation} did not finish within {timeout:?}")]
    TimedOut { operation: String, timeout: Duration },

    #[error("{} resources could not be released: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<TeardownError>),
}

impl TeardownError {
    /// Collapses the errors collected while releasing resources, if any.
    pub(crate) fn from_errors(mut errors: Vec<TeardownError>) -> Result<(), TeardownError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(TeardownError::Multiple(errors)),
        }
    }
}

fn join_errors(errors: &[TeardownError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
