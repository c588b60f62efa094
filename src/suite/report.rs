use crate::context::ContextError;
use crate::control_plane::{ConnectError, ProvisionError, TeardownError};
use crate::scheme::RegistrationError;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    #[error("scheme registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error("control plane provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("connecting to the control plane failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("publishing the test context failed: {0}")]
    Context(#[from] ContextError),
}

/// Overall result of a suite run. Each failed phase is reported with its own error.
#[derive(thiserror::Error, Debug)]
pub enum SuiteError {
    #[error("suite `{suite}` setup failed, no test case was run: {source}")]
    Setup { suite: String, source: SetupError },

    #[error("suite `{suite}`: {} test cases failed: {}", .failed.len(), .failed.join(", "))]
    Cases { suite: String, failed: Vec<String> },

    #[error("suite `{suite}` teardown failed, control plane resources may have leaked: {source}")]
    Teardown {
        suite: String,
        source: TeardownError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaseOutcome {
    Passed,
    Failed(String),
    Panicked(String),
    TimedOut(Duration),
}

impl CaseOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CaseOutcome::Passed)
    }
}

impl fmt::Display for CaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaseOutcome::Passed => write!(f, "passed"),
            CaseOutcome::Failed(reason) => write!(f, "failed: {reason}"),
            CaseOutcome::Panicked(message) => write!(f, "panicked: {message}"),
            CaseOutcome::TimedOut(timeout) => write!(f, "timed out after {timeout:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseReport {
    pub name: String,
    pub outcome: CaseOutcome,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuiteStatus {
    Passed,
    Failed,
    SetupFailed,
    TeardownFailed,
}

impl SuiteStatus {
    /// Process exit code for the status.
    pub fn exit_code(&self) -> i32 {
        match self {
            SuiteStatus::Passed => 0,
            SuiteStatus::Failed => 1,
            SuiteStatus::SetupFailed => 2,
            SuiteStatus::TeardownFailed => 3,
        }
    }
}

#[derive(Debug)]
pub struct SuiteReport {
    pub suite: String,
    pub setup_error: Option<SetupError>,
    pub cases: Vec<CaseReport>,
    pub teardown_error: Option<TeardownError>,
}

impl SuiteReport {
    pub(crate) fn new(suite: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            setup_error: None,
            cases: Vec::new(),
            teardown_error: None,
        }
    }

    /// A teardown failure takes precedence over everything else since it means resources were leaked, then setup
    /// failures, then failed cases.
    pub fn status(&self) -> SuiteStatus {
        if self.teardown_error.is_some() {
            SuiteStatus::TeardownFailed
        } else if self.setup_error.is_some() {
            SuiteStatus::SetupFailed
        } else if self.cases.iter().any(|c| !c.outcome.is_success()) {
            SuiteStatus::Failed
        } else {
            SuiteStatus::Passed
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status().exit_code()
    }

    pub fn failed_cases(&self) -> impl Iterator<Item = &CaseReport> {
        self.cases.iter().filter(|c| !c.outcome.is_success())
    }

    pub fn into_result(self) -> Result<(), SuiteError> {
        let failed: Vec<String> = self.failed_cases().map(|c| c.name.clone()).collect();
        let suite = self.suite;
        if let Some(source) = self.teardown_error {
            return Err(SuiteError::Teardown { suite, source });
        }
        if let Some(source) = self.setup_error {
            return Err(SuiteError::Setup { suite, source });
        }
        if !failed.is_empty() {
            return Err(SuiteError::Cases { suite, failed });
        }
        Ok(())
    }

    pub(crate) fn log_summary(&self) {
        for case in &self.cases {
            match &case.outcome {
                CaseOutcome::Passed => {
                    info!(suite = %self.suite, case = %case.name, duration = ?case.duration, "test case passed")
                }
                outcome => {
                    error!(suite = %self.suite, case = %case.name, duration = ?case.duration, "test case {outcome}")
                }
            }
        }
        if let Some(err) = &self.setup_error {
            error!(suite = %self.suite, "setup failed: {err}");
        }
        if let Some(err) = &self.teardown_error {
            error!(suite = %self.suite, "teardown failed: {err}");
        }

        let failed = self.failed_cases().count();
        let passed = self.cases.len() - failed;
        match self.status() {
            SuiteStatus::Passed => info!(suite = %self.suite, passed, "suite passed"),
            SuiteStatus::Failed => warn!(suite = %self.suite, passed, failed, "suite failed"),
            status => error!(suite = %self.suite, passed, failed, ?status, "suite aborted"),
        }
    }
}
