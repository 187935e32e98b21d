use std::path::PathBuf;

use thiserror::Error;

use crate::browser::BrowserError;

pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// How the retry coordinator reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Expected to resolve on retry after a delay.
    Transient,
    /// Retrying the same action cannot fix it; aborts the current year or
    /// identifier.
    Permanent,
    /// Aborts the entire run.
    Fatal,
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("stale element: {0}")]
    StaleElement(String),
    #[error("download still in progress after poll timeout: {0}")]
    SlowDownload(String),
    #[error("no search result for identifier {0}")]
    NoMatch(String),
    #[error("{candidates} exact matches for identifier {identifier}, expected exactly one")]
    AmbiguousMatch {
        identifier: String,
        candidates: usize,
    },
    #[error("required page control missing: {0}")]
    UiChanged(String),
    #[error("corrupt archive at {path}: {detail}")]
    CorruptArchive { path: PathBuf, detail: String },
    #[error("captcha challenge presented for identifier {0}")]
    CaptchaWall(String),
    #[error("retries exhausted after {attempts} attempts at step {step}")]
    RetriesExhausted { step: String, attempts: usize },
    #[error("browser session fault: {0}")]
    Session(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl WorkflowError {
    pub fn class(&self) -> FailureClass {
        match self {
            WorkflowError::ElementNotFound(_)
            | WorkflowError::Timeout(_)
            | WorkflowError::StaleElement(_)
            | WorkflowError::SlowDownload(_)
            | WorkflowError::Io { .. } => FailureClass::Transient,
            WorkflowError::NoMatch(_)
            | WorkflowError::AmbiguousMatch { .. }
            | WorkflowError::UiChanged(_)
            | WorkflowError::CorruptArchive { .. }
            | WorkflowError::CaptchaWall(_)
            | WorkflowError::RetriesExhausted { .. } => FailureClass::Permanent,
            WorkflowError::Session(_) => FailureClass::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == FailureClass::Fatal
    }
}

impl From<BrowserError> for WorkflowError {
    fn from(err: BrowserError) -> Self {
        match err {
            BrowserError::ElementNotFound(selector) => WorkflowError::ElementNotFound(selector),
            BrowserError::Timeout(what) => WorkflowError::Timeout(what),
            BrowserError::Stale(detail) => WorkflowError::StaleElement(detail),
            BrowserError::Launch(detail)
            | BrowserError::Session(detail)
            | BrowserError::Configuration(detail) => WorkflowError::Session(detail),
            BrowserError::Io(source) => WorkflowError::Io {
                path: PathBuf::new(),
                source,
            },
            BrowserError::Unexpected(detail) => WorkflowError::Session(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_taxonomy() {
        assert_eq!(
            WorkflowError::ElementNotFound("x".into()).class(),
            FailureClass::Transient
        );
        assert_eq!(
            WorkflowError::Timeout("x".into()).class(),
            FailureClass::Transient
        );
        assert_eq!(
            WorkflowError::AmbiguousMatch {
                identifier: "7707083893".into(),
                candidates: 2
            }
            .class(),
            FailureClass::Permanent
        );
        assert_eq!(
            WorkflowError::CorruptArchive {
                path: PathBuf::from("a.zip"),
                detail: "bad crc".into()
            }
            .class(),
            FailureClass::Permanent
        );
        assert_eq!(
            WorkflowError::Session("ws closed".into()).class(),
            FailureClass::Fatal
        );
    }
}
