use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ClassifiedError;

/// Per-run context handed to every handler invocation.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: String,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            cancel,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(cancelled)` once the run has been cancelled; handlers call this
    /// around their suspension points.
    pub fn check_cancelled(&self) -> Result<(), ClassifiedError> {
        if self.cancel.is_cancelled() {
            Err(ClassifiedError::cancelled())
        } else {
            Ok(())
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}
