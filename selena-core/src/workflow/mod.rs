pub mod context;
pub mod error;
pub mod machine;
pub mod retry;

pub use context::{AttemptOutcome, AttemptRecord, Identifier, WorkflowContext};
pub use error::{FailureClass, WorkflowError, WorkflowResult};
pub use machine::{IdentifierWorkflow, WorkflowState};
pub use retry::{BackoffPolicy, RetryOutcome};
