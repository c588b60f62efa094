use crate::tools::logging::init_logger;
use crate::tools::types::{config_types, machine_types, Machine, MachineSpec};
use crate::tools::{is_listening, machine_crd_path, server_port};
use k8s_envtest::config::EnvTestConfig;
use k8s_envtest::suite::{CaseOutcome, Suite, SuiteStatus, TestCase};
use kube::api::PostParams;
use std::sync::{Arc, Mutex};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "needs envtest binaries"]
async fn panicking_case_does_not_skip_teardown() {
    init_logger();
    let config = EnvTestConfig::from_env().unwrap();
    let server = Arc::new(Mutex::new(None));

    let seen_server = server.clone();
    let report = Suite::from_config("machine controller", &config)
        .with_installer(machine_types())
        .with_installer(config_types())
        .with_manifest(machine_crd_path())
        .with_case(TestCase::new("creates a machine", move |ctx| {
            let seen_server = seen_server.clone();
            async move {
                *seen_server.lock().unwrap() = Some(ctx.descriptor().server().to_string());
                let namespace = ctx.namespace().ok_or("no case namespace")?;
                let api = ctx.client().namespaced_api::<Machine>(namespace)?;
                api.create(
                    &PostParams::default(),
                    &Machine::new("worker-0", MachineSpec::default()),
                )
                .await?;
                api.get("worker-0").await?;
                Ok(())
            }
        }))
        .with_case(TestCase::new("gives up", |_| async {
            let reconciled = false;
            assert!(reconciled, "machine was never reconciled");
            Ok(())
        }))
        .run()
        .await;

    assert_eq!(report.status(), SuiteStatus::Failed);
    assert_eq!(report.cases[0].outcome, CaseOutcome::Passed);
    assert_eq!(
        report.cases[1].outcome,
        CaseOutcome::Panicked("machine was never reconciled".to_string())
    );
    assert!(report.teardown_error.is_none());

    let server = server.lock().unwrap().clone().unwrap();
    assert!(!is_listening(server_port(&server)).await);
}
