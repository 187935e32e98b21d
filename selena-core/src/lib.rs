pub mod batch;
pub mod browser;
pub mod config;
pub mod error;
pub mod report;
pub mod verify;
pub mod workflow;

pub use batch::BatchRunner;
pub use browser::{
    BfoPortal, BrowserError, BrowserResult, LaunchOverrides, RegistryPortal, SearchOutcome,
    Session, SessionLauncher, SessionPage,
};
pub use config::{
    load_browser_config, load_selena_config, BrowserConfig, ConfigBundle, SelenaConfig,
};
pub use error::{ConfigError, Result};
pub use report::{Disposition, IdentifierRecord, RunReport, RunSummary, YearFailure};
pub use verify::{ArchiveVerifier, DownloadTask, DownloadVerifier, TaskStatus};
pub use workflow::{
    AttemptOutcome, AttemptRecord, BackoffPolicy, FailureClass, Identifier, IdentifierWorkflow,
    RetryOutcome, WorkflowContext, WorkflowError, WorkflowResult, WorkflowState,
};
