use crate::logging::LoggingConfig;
use crate::retry::Backoff;
use duration_str::{deserialize_duration, deserialize_option_duration};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

pub const DEFAULT_BINARY_ASSETS_DIR: &str = "/usr/local/kubebuilder/bin";
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_CRD_INSTALL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub const ENV_BINARY_ASSETS: &str = "KUBEBUILDER_ASSETS";
pub const ENV_ETCD_BINARY: &str = "TEST_ASSET_ETCD";
pub const ENV_KUBE_APISERVER_BINARY: &str = "TEST_ASSET_KUBE_APISERVER";
pub const ENV_START_TIMEOUT: &str = "KUBEBUILDER_CONTROLPLANE_START_TIMEOUT";
pub const ENV_STOP_TIMEOUT: &str = "KUBEBUILDER_CONTROLPLANE_STOP_TIMEOUT";
pub const ENV_ATTACH_OUTPUT: &str = "KUBEBUILDER_ATTACH_CONTROL_PLANE_OUTPUT";
pub const ENV_USE_EXISTING_CLUSTER: &str = "USE_EXISTING_CLUSTER";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("reading config file `{path}`: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value `{value}` for `{name}`: {reason}")]
    InvalidEnvVar {
        name: String,
        value: String,
        reason: String,
    },
}

/// Settings of the harness. Every field has a default so an empty document is a valid configuration.
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(default)]
pub struct EnvTestConfig {
    /// Directory holding the `etcd` and `kube-apiserver` binaries.
    pub binary_assets_dir: PathBuf,
    /// Overrides the etcd binary location.
    pub etcd_binary: Option<PathBuf>,
    /// Overrides the kube-apiserver binary location.
    pub kube_apiserver_binary: Option<PathBuf>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub start_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub stop_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub crd_install_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub poll_interval: Duration,
    /// Forward the control plane stdout/stderr to the current process instead of the logs.
    pub attach_control_plane_output: bool,
    pub error_if_crd_path_missing: bool,
    /// Run the suite against the cluster of the current kubeconfig instead of local binaries.
    pub use_existing_cluster: bool,
    pub existing_cluster_kubeconfig: Option<PathBuf>,
    /// Give every test case its own namespace.
    pub namespace_per_case: bool,
    #[serde(deserialize_with = "deserialize_option_duration")]
    pub case_timeout: Option<Duration>,
    pub log: LoggingConfig,
}

impl Default for EnvTestConfig {
    fn default() -> Self {
        Self {
            binary_assets_dir: PathBuf::from(DEFAULT_BINARY_ASSETS_DIR),
            etcd_binary: None,
            kube_apiserver_binary: None,
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            crd_install_timeout: DEFAULT_CRD_INSTALL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            attach_control_plane_output: false,
            error_if_crd_path_missing: true,
            use_existing_cluster: false,
            existing_cluster_kubeconfig: None,
            namespace_per_case: true,
            case_timeout: None,
            log: LoggingConfig::default(),
        }
    }
}

impl EnvTestConfig {
    /// Defaults overridden by the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|name| env::var(name).ok())
    }

    /// Reads a YAML config file and applies the environment overrides on top of it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)?.with_overrides(|name| env::var(name).ok())
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Applies the envtest environment variables returned by `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_BINARY_ASSETS).filter(|v| !v.is_empty()) {
            self.binary_assets_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup(ENV_ETCD_BINARY).filter(|v| !v.is_empty()) {
            self.etcd_binary = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup(ENV_KUBE_APISERVER_BINARY).filter(|v| !v.is_empty()) {
            self.kube_apiserver_binary = Some(PathBuf::from(path));
        }
        if let Some(value) = lookup(ENV_START_TIMEOUT) {
            self.start_timeout = parse_duration_var(ENV_START_TIMEOUT, value)?;
        }
        if let Some(value) = lookup(ENV_STOP_TIMEOUT) {
            self.stop_timeout = parse_duration_var(ENV_STOP_TIMEOUT, value)?;
        }
        if let Some(value) = lookup(ENV_ATTACH_OUTPUT) {
            self.attach_control_plane_output = parse_bool_var(ENV_ATTACH_OUTPUT, value)?;
        }
        if let Some(value) = lookup(ENV_USE_EXISTING_CLUSTER) {
            self.use_existing_cluster = parse_bool_var(ENV_USE_EXISTING_CLUSTER, value)?;
        }
        Ok(self)
    }

    /// Backoff used while waiting for the control plane.
    pub fn backoff(&self) -> Backoff {
        Backoff::Exponential {
            initial: self.poll_interval,
            max: self.poll_interval.max(MAX_POLL_INTERVAL),
        }
    }
}

fn parse_duration_var(name: &str, value: String) -> Result<Duration, ConfigError> {
    duration_str::parse(value.as_str()).map_err(|err| ConfigError::InvalidEnvVar {
        name: name.to_string(),
        value,
        reason: err.to_string(),
    })
}

fn parse_bool_var(name: &str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" => Ok(true),
        "0" | "false" | "f" | "no" | "" => Ok(false),
        _ => Err(ConfigError::InvalidEnvVar {
            name: name.to_string(),
            value,
            reason: "expected a boolean".to_string(),
        }),
    }
}
