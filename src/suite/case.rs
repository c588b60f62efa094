use crate::client::SchemeClient;
use crate::context::TestContext;
use crate::control_plane::ConnectionDescriptor;
use crate::scheme::Scheme;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Error returned by a failing test case.
pub type CaseError = Box<dyn std::error::Error + Send + Sync>;

pub type CaseResult = Result<(), CaseError>;

type CaseFn = dyn Fn(CaseContext) -> BoxFuture<'static, CaseResult> + Send + Sync;

/// What a single test case receives: the shared context and, when namespaces are isolated per case, its own
/// namespace.
#[derive(Debug, Clone)]
pub struct CaseContext {
    shared: Arc<TestContext>,
    namespace: Option<String>,
}

impl CaseContext {
    pub(crate) fn new(shared: Arc<TestContext>, namespace: Option<String>) -> Self {
        Self { shared, namespace }
    }

    pub fn client(&self) -> &SchemeClient {
        &self.shared.client
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.shared.descriptor
    }

    pub fn scheme(&self) -> &Scheme {
        &self.shared.scheme
    }

    /// Namespace created for this case only.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

/// A named async test body.
#[derive(Clone)]
pub struct TestCase {
    name: String,
    body: Arc<CaseFn>,
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl TestCase {
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(CaseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CaseResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(move |ctx| body(ctx).boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn run(&self, ctx: CaseContext) -> BoxFuture<'static, CaseResult> {
        (self.body)(ctx)
    }

    /// Prefix of the namespace generated for the case, a valid DNS label.
    pub(crate) fn namespace_prefix(&self) -> String {
        let mut prefix: String = self
            .name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .take(40)
            .collect();
        prefix = prefix.trim_matches('-').to_string();
        if prefix.is_empty() {
            prefix = "case".to_string();
        }
        prefix
    }
}
