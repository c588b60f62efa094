use std::fs;
use std::path::Path;
use std::process::ExitCode;

use tracing::{error, info};

use k8s_envtest::cli::Cli;
use k8s_envtest::config::EnvTestConfig;
use k8s_envtest::control_plane::{provisioner_from_config, ConnectionDescriptor, ManifestRef};
use k8s_envtest::suite::SuiteStatus;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::init();

    let config = match cli.config_path() {
        Some(path) => EnvTestConfig::load(path),
        None => EnvTestConfig::from_env(),
    };
    let mut config = match config {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return exit_code(SuiteStatus::SetupFailed);
        }
    };
    if let Some(level) = cli.log_level() {
        config.log = config.log.with_level(level);
    }
    if let Err(err) = config.log.try_init() {
        eprintln!("{err}");
        return exit_code(SuiteStatus::SetupFailed);
    }

    let manifests: Vec<ManifestRef> = cli
        .crd_paths()
        .iter()
        .cloned()
        .map(ManifestRef::from)
        .collect();

    let provisioner = provisioner_from_config(&config);
    let control_plane = match provisioner.start(&manifests).await {
        Ok(control_plane) => control_plane,
        Err(err) => {
            error!("control plane provisioning failed: {err}");
            return exit_code(SuiteStatus::SetupFailed);
        }
    };

    let (stop_tx, mut stop_rx) = tokio::sync::mpsc::channel::<()>(1);
    let handler = ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    });

    let mut status = SuiteStatus::Passed;
    if let Err(err) = handler {
        error!("could not set signal handler: {err}");
        status = SuiteStatus::SetupFailed;
    } else if let Some(out) = cli.kubeconfig_out() {
        if let Err(err) = write_kubeconfig(&control_plane.descriptor, out) {
            error!("writing kubeconfig to `{}`: {err}", out.display());
            status = SuiteStatus::SetupFailed;
        }
    }

    if status == SuiteStatus::Passed {
        let kubeconfig = cli
            .kubeconfig_out()
            .map(|path| path.as_path())
            .or(control_plane.descriptor.kubeconfig_path())
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        info!(
            server = control_plane.descriptor.server(),
            %kubeconfig,
            "control plane running, press Ctrl-C to stop"
        );
        stop_rx.recv().await;
        info!("stopping control plane");
    }

    if let Err(err) = control_plane.handle.stop().await {
        error!("control plane teardown failed, resources may have leaked: {err}");
        return exit_code(SuiteStatus::TeardownFailed);
    }
    exit_code(status)
}

fn write_kubeconfig(
    descriptor: &ConnectionDescriptor,
    out: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    match descriptor.kubeconfig_path() {
        Some(path) => {
            fs::copy(path, out)?;
        }
        None => fs::write(out, serde_yaml::to_string(descriptor.kubeconfig())?)?,
    }
    Ok(())
}

fn exit_code(status: SuiteStatus) -> ExitCode {
    ExitCode::from(status.exit_code() as u8)
}
