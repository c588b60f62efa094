//! Suite lifecycle: scheme registration, provisioning, publishing the context, running the cases and teardown.
mod case;
mod report;

pub use case::{CaseContext, CaseError, CaseResult, TestCase};
pub use report::{CaseOutcome, CaseReport, SetupError, SuiteError, SuiteReport, SuiteStatus};

use crate::client::SchemeClient;
use crate::config::EnvTestConfig;
use crate::context::{ContextError, SharedContext, TestContext};
use crate::control_plane::{provisioner_from_config, ManifestRef, Provisioner};
use crate::scheme::{register, Scheme, SchemeInstaller};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub struct Suite {
    name: String,
    provisioner: Box<dyn Provisioner>,
    installers: Vec<Box<dyn SchemeInstaller>>,
    manifests: Vec<ManifestRef>,
    cases: Vec<TestCase>,
    namespace_per_case: bool,
    case_timeout: Option<Duration>,
}

impl Suite {
    pub fn new(name: impl Into<String>, provisioner: Box<dyn Provisioner>) -> Self {
        let defaults = EnvTestConfig::default();
        Self {
            name: name.into(),
            provisioner,
            installers: Vec::new(),
            manifests: Vec::new(),
            cases: Vec::new(),
            namespace_per_case: defaults.namespace_per_case,
            case_timeout: defaults.case_timeout,
        }
    }

    /// Suite running against the control plane selected by `config`.
    pub fn from_config(name: impl Into<String>, config: &EnvTestConfig) -> Self {
        Self::new(name, provisioner_from_config(config)).with_config(config)
    }

    /// Applies the case execution settings of `config`.
    pub fn with_config(mut self, config: &EnvTestConfig) -> Self {
        self.namespace_per_case = config.namespace_per_case;
        self.case_timeout = config.case_timeout;
        self
    }

    pub fn with_installer(mut self, installer: impl SchemeInstaller + 'static) -> Self {
        self.installers.push(Box::new(installer));
        self
    }

    pub fn with_manifest(mut self, manifest: impl Into<ManifestRef>) -> Self {
        self.manifests.push(manifest.into());
        self
    }

    pub fn with_case(mut self, case: TestCase) -> Self {
        self.cases.push(case);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the whole suite.
    ///
    /// No case runs unless registration and provisioning succeed. Once the control plane is started it is stopped
    /// exactly once, after every case finished, whatever their outcome.
    pub async fn run(self) -> SuiteReport {
        info!(suite = %self.name, cases = self.cases.len(), "starting suite");
        let mut report = SuiteReport::new(self.name.clone());
        self.execute(&mut report).await;
        report.log_summary();
        report
    }

    async fn execute(&self, report: &mut SuiteReport) {
        let mut scheme = Scheme::new();
        let installers = self
            .installers
            .iter()
            .map(|installer| &**installer as &dyn SchemeInstaller);
        if let Err(err) = register(&mut scheme, installers) {
            report.setup_error = Some(err.into());
            return;
        }
        let scheme = Arc::new(scheme);
        debug!(suite = %self.name, kinds = scheme.kinds().count(), "scheme registered");

        let provisioned = match self.provisioner.start(&self.manifests).await {
            Ok(provisioned) => provisioned,
            Err(err) => {
                report.setup_error = Some(err.into());
                return;
            }
        };

        let client = match provisioned.descriptor.client().await {
            Ok(client) => client,
            Err(err) => {
                report.setup_error = Some(err.into());
                report.teardown_error = provisioned.handle.stop().await.err();
                return;
            }
        };

        let mut shared = SharedContext::new();
        let context = match shared.publish(
            TestContext {
                descriptor: provisioned.descriptor,
                client: SchemeClient::new(client, scheme.clone()),
                scheme,
            },
            provisioned.handle,
        ) {
            Ok(context) => context,
            Err(err) => {
                report.setup_error = Some(err.into());
                return;
            }
        };

        report.cases = self.run_cases(context).await;

        match shared.tear_down().await {
            Ok(()) => {}
            Err(ContextError::Teardown(err)) => report.teardown_error = Some(err),
            Err(err) => error!(suite = %self.name, %err, "unexpected test context state at teardown"),
        }
    }

    async fn run_cases(&self, context: Arc<TestContext>) -> Vec<CaseReport> {
        let mut running = JoinSet::new();
        for (index, case) in self.cases.iter().enumerate() {
            let case = case.clone();
            let context = context.clone();
            let namespace_per_case = self.namespace_per_case;
            let timeout = self.case_timeout;
            running.spawn(async move {
                let report = run_case(case, context, namespace_per_case, timeout).await;
                (index, report)
            });
        }
        drop(context);

        let mut reports: Vec<Option<CaseReport>> = vec![None; self.cases.len()];
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((index, report)) => reports[index] = Some(report),
                Err(err) => error!(suite = %self.name, %err, "test case runner failed"),
            }
        }

        reports
            .into_iter()
            .zip(&self.cases)
            .map(|(report, case)| {
                report.unwrap_or_else(|| CaseReport {
                    name: case.name().to_string(),
                    outcome: CaseOutcome::Panicked("the case runner did not report".to_string()),
                    duration: Duration::ZERO,
                })
            })
            .collect()
    }
}

async fn run_case(
    case: TestCase,
    context: Arc<TestContext>,
    namespace_per_case: bool,
    timeout: Option<Duration>,
) -> CaseReport {
    let start = Instant::now();
    let name = case.name().to_string();
    debug!(case = %name, "running test case");

    let namespace = if namespace_per_case {
        match context.client.create_namespace(&case.namespace_prefix()).await {
            Ok(namespace) => Some(namespace),
            Err(err) => {
                return CaseReport {
                    name,
                    outcome: CaseOutcome::Failed(format!("creating the case namespace: {err}")),
                    duration: start.elapsed(),
                }
            }
        }
    } else {
        None
    };

    let mut body = tokio::spawn(case.run(CaseContext::new(context.clone(), namespace.clone())));
    let outcome = match timeout {
        None => outcome_of((&mut body).await),
        Some(limit) => match tokio::time::timeout(limit, &mut body).await {
            Ok(joined) => outcome_of(joined),
            Err(_) => {
                body.abort();
                // the case must be gone before its namespace and the control plane are
                let _ = body.await;
                CaseOutcome::TimedOut(limit)
            }
        },
    };

    if let Some(namespace) = namespace {
        if let Err(err) = context.client.delete_namespace(&namespace).await {
            warn!(case = %name, %namespace, %err, "failed deleting the case namespace");
        }
    }

    CaseReport {
        name,
        outcome,
        duration: start.elapsed(),
    }
}

fn outcome_of(joined: Result<CaseResult, tokio::task::JoinError>) -> CaseOutcome {
    match joined {
        Ok(Ok(())) => CaseOutcome::Passed,
        Ok(Err(err)) => CaseOutcome::Failed(err.to_string()),
        Err(err) if err.is_panic() => CaseOutcome::Panicked(panic_message(err.into_panic())),
        Err(err) => CaseOutcome::Failed(err.to_string()),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::tests::{CallLog, FakeProvisioner};
    use crate::scheme::tests::machine_definition;
    use crate::scheme::{MockSchemeInstaller, SchemeError, TypeGroup};
    use assert_matches::assert_matches;
    use kube::core::GroupVersionKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn provisioner(log: &CallLog, fail_start: bool, fail_stop: bool) -> Box<dyn Provisioner> {
        Box::new(FakeProvisioner {
            log: log.clone(),
            fail_start,
            fail_stop,
        })
    }

    fn isolated_off() -> EnvTestConfig {
        EnvTestConfig {
            namespace_per_case: false,
            ..Default::default()
        }
    }

    fn machines() -> TypeGroup {
        TypeGroup::new("machine.openshift.io/v1beta1").with_definition(machine_definition("machines"))
    }

    fn recording_case(name: &str, log: &CallLog) -> TestCase {
        let log = log.clone();
        let case = name.to_string();
        TestCase::new(name, move |_| {
            let log = log.clone();
            let case = case.clone();
            async move {
                log.push(format!("case {case}"));
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn runs_every_phase_in_order() {
        let log = CallLog::default();
        let report = Suite::new("machines", provisioner(&log, false, false))
            .with_config(&isolated_off())
            .with_installer(machines())
            .with_manifest("config/crds")
            .with_case(recording_case("one", &log))
            .with_case(TestCase::new("sees machines", |ctx| async move {
                let gvk = GroupVersionKind::gvk("machine.openshift.io", "v1beta1", "Machine");
                if !ctx.scheme().recognizes(&gvk) {
                    return Err("Machine is not registered".into());
                }
                Ok(())
            }))
            .run()
            .await;

        assert_eq!(report.status(), SuiteStatus::Passed);
        assert_eq!(log.calls(), vec!["start 1", "case one", "stop"]);
    }

    #[tokio::test]
    async fn registration_failure_aborts_before_provisioning() {
        let log = CallLog::default();
        let mut failing = MockSchemeInstaller::new();
        failing
            .expect_name()
            .return_const("config.openshift.io/v1".to_string());
        failing.expect_install().returning(|_| {
            Err(SchemeError::InvalidDefinition("missing plural".to_string()))
        });

        let report = Suite::new("machines", provisioner(&log, false, false))
            .with_config(&isolated_off())
            .with_installer(machines())
            .with_installer(failing)
            .with_case(recording_case("one", &log))
            .run()
            .await;

        assert_eq!(report.status(), SuiteStatus::SetupFailed);
        assert_matches!(
            &report.setup_error,
            Some(SetupError::Registration(err)) if err.group == "config.openshift.io/v1"
        );
        assert!(report.cases.is_empty());
        assert!(log.calls().is_empty());
    }

    #[tokio::test]
    async fn provisioning_failure_runs_no_case() {
        let log = CallLog::default();
        let report = Suite::new("machines", provisioner(&log, true, false))
            .with_config(&isolated_off())
            .with_case(recording_case("one", &log))
            .run()
            .await;

        assert_eq!(report.exit_code(), 2);
        assert_matches!(report.setup_error, Some(SetupError::Provision(_)));
        assert_eq!(log.calls(), vec!["start 0"]);
    }

    #[tokio::test]
    async fn panicking_case_still_tears_down() {
        let log = CallLog::default();
        let report = Suite::new("machines", provisioner(&log, false, false))
            .with_config(&isolated_off())
            .with_installer(machines())
            .with_case(TestCase::new("explodes", |_| async {
                let ready = false;
                assert!(ready, "machine never became ready");
                Ok(())
            }))
            .with_case(recording_case("survives", &log))
            .run()
            .await;

        assert_eq!(report.status(), SuiteStatus::Failed);
        assert_eq!(
            report.cases[0].outcome,
            CaseOutcome::Panicked("machine never became ready".to_string())
        );
        assert_eq!(report.cases[1].outcome, CaseOutcome::Passed);
        assert_eq!(log.calls().last().map(String::as_str), Some("stop"));
        assert_eq!(log.calls().iter().filter(|c| *c == "stop").count(), 1);
    }

    #[tokio::test]
    async fn failing_and_slow_cases_are_reported() {
        let log = CallLog::default();
        let config = EnvTestConfig {
            case_timeout: Some(Duration::from_millis(100)),
            ..isolated_off()
        };
        let report = Suite::new("machines", provisioner(&log, false, false))
            .with_config(&config)
            .with_case(TestCase::new("fails", |_| async {
                Err("machine phase is `Failed`".into())
            }))
            .with_case(TestCase::new("hangs", |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }))
            .run()
            .await;

        assert_eq!(
            report.cases[0].outcome,
            CaseOutcome::Failed("machine phase is `Failed`".to_string())
        );
        assert_eq!(
            report.cases[1].outcome,
            CaseOutcome::TimedOut(Duration::from_millis(100))
        );
        assert_eq!(log.calls(), vec!["start 0", "stop"]);
    }

    #[tokio::test]
    async fn timed_out_case_is_gone_before_teardown() {
        let log = CallLog::default();
        let config = EnvTestConfig {
            case_timeout: Some(Duration::from_millis(50)),
            ..isolated_off()
        };
        let case_log = log.clone();
        let report = Suite::new("machines", provisioner(&log, false, false))
            .with_config(&config)
            .with_case(TestCase::new("reconciles forever", move |_| {
                let log = case_log.clone();
                async move {
                    // recorded when the case is dropped
                    let _guard = DropLog(log);
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }))
            .run()
            .await;

        assert_eq!(
            report.cases[0].outcome,
            CaseOutcome::TimedOut(Duration::from_millis(50))
        );
        assert_eq!(log.calls(), vec!["start 0", "case dropped", "stop"]);
    }

    struct DropLog(CallLog);

    impl Drop for DropLog {
        fn drop(&mut self) {
            self.0.push("case dropped");
        }
    }

    #[tokio::test]
    async fn cases_run_concurrently() {
        let log = CallLog::default();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let mut suite =
            Suite::new("machines", provisioner(&log, false, false)).with_config(&isolated_off());
        for i in 0..4 {
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            suite = suite.with_case(TestCase::new(format!("case {i}"), move |_| {
                let in_flight = in_flight.clone();
                let max_in_flight = max_in_flight.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }

        let report = suite.run().await;
        assert_eq!(report.status(), SuiteStatus::Passed);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn teardown_failure_is_reported_separately() {
        let log = CallLog::default();
        let report = Suite::new("machines", provisioner(&log, false, true))
            .with_config(&isolated_off())
            .with_case(recording_case("one", &log))
            .run()
            .await;

        assert_eq!(report.status(), SuiteStatus::TeardownFailed);
        assert_eq!(report.cases[0].outcome, CaseOutcome::Passed);
        assert_matches!(report.into_result(), Err(SuiteError::Teardown { .. }));
    }

    #[tokio::test]
    async fn namespace_creation_failure_fails_the_case_only() {
        // the fake control plane is unreachable, so creating the namespace fails
        let log = CallLog::default();
        let report = Suite::new("machines", provisioner(&log, false, false))
            .with_case(recording_case("one", &log))
            .run()
            .await;

        assert_matches!(&report.cases[0].outcome, CaseOutcome::Failed(reason) if reason.contains("namespace"));
        assert_eq!(log.calls(), vec!["start 0", "stop"]);
    }
}
