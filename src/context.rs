//! Context shared by every test case of a suite.
use crate::client::SchemeClient;
use crate::control_plane::{ConnectionDescriptor, ControlPlaneHandle, TeardownError};
use crate::scheme::Scheme;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// What a test case gets to talk to the control plane. Immutable once published.
#[derive(Clone)]
pub struct TestContext {
    pub descriptor: ConnectionDescriptor,
    pub client: SchemeClient,
    pub scheme: Arc<Scheme>,
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestContext")
            .field("server", &self.descriptor.server())
            .field("kinds", &self.scheme.kinds().count())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Ready,
    TornDown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Ready => "ready",
            LifecycleState::TornDown => "torn down",
        };
        f.write_str(state)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ContextError {
    #[error("the context can only be published once, it is already {0}")]
    AlreadyPublished(LifecycleState),

    #[error("the context cannot be torn down while {0}")]
    NotReady(LifecycleState),

    #[error("stopping the control plane: {0}")]
    Teardown(#[from] TeardownError),
}

enum Stage {
    Uninitialized,
    Ready {
        context: Arc<TestContext>,
        handle: Box<dyn ControlPlaneHandle>,
    },
    TornDown,
}

/// Owner of the [TestContext] and of the control plane behind it.
///
/// Moves through `Uninitialized -> Ready -> TornDown` exactly once. A new suite needs a new instance.
pub struct SharedContext {
    stage: Stage,
}

impl Default for SharedContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SharedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedContext")
            .field("state", &self.state())
            .finish()
    }
}

impl SharedContext {
    pub fn new() -> Self {
        Self {
            stage: Stage::Uninitialized,
        }
    }

    pub fn state(&self) -> LifecycleState {
        match self.stage {
            Stage::Uninitialized => LifecycleState::Uninitialized,
            Stage::Ready { .. } => LifecycleState::Ready,
            Stage::TornDown => LifecycleState::TornDown,
        }
    }

    /// Makes the context available to test cases. The handle is released by [SharedContext::tear_down].
    pub fn publish(
        &mut self,
        context: TestContext,
        handle: Box<dyn ControlPlaneHandle>,
    ) -> Result<Arc<TestContext>, ContextError> {
        if !matches!(self.stage, Stage::Uninitialized) {
            return Err(ContextError::AlreadyPublished(self.state()));
        }
        let context = Arc::new(context);
        self.stage = Stage::Ready {
            context: context.clone(),
            handle,
        };
        debug!(server = context.descriptor.server(), "test context published");
        Ok(context)
    }

    /// The published context, `None` before publication and after teardown.
    pub fn get(&self) -> Option<Arc<TestContext>> {
        match &self.stage {
            Stage::Ready { context, .. } => Some(context.clone()),
            _ => None,
        }
    }

    /// Stops the control plane. The context is torn down even if stopping fails.
    pub async fn tear_down(&mut self) -> Result<(), ContextError> {
        match std::mem::replace(&mut self.stage, Stage::TornDown) {
            Stage::Ready { context, handle } => {
                drop(context);
                debug!("tearing down test context");
                handle.stop().await?;
                Ok(())
            }
            previous => {
                self.stage = previous;
                Err(ContextError::NotReady(self.state()))
            }
        }
    }
}
