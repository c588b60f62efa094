use std::path::PathBuf;

use clap::Parser;

/// Starts an ephemeral control plane with the given CRDs installed and keeps it running until interrupted.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)] // Read from `Cargo.toml`
pub struct Cli {
    /// CRD manifest file or directory, can be repeated
    #[arg(long = "crd-path", value_name = "PATH")]
    crd_paths: Vec<PathBuf>,

    /// YAML config file, environment variables are applied on top of it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where to copy the admin kubeconfig of the control plane
    #[arg(long, value_name = "FILE")]
    kubeconfig_out: Option<PathBuf>,

    /// Overrides the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Parses command line arguments
    pub fn init() -> Self {
        Self::parse()
    }

    pub fn crd_paths(&self) -> &[PathBuf] {
        &self.crd_paths
    }

    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config.as_ref()
    }

    pub fn kubeconfig_out(&self) -> Option<&PathBuf> {
        self.kubeconfig_out.as_ref()
    }

    pub fn log_level(&self) -> Option<&str> {
        self.log_level.as_deref()
    }
}
