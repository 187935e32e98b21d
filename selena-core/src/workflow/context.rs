use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Organization tax identifier (INN). Ten digits for legal entities, twelve
/// for individual entrepreneurs; only the shape is validated here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let valid_len = trimmed.len() == 10 || trimmed.len() == 12;
        if valid_len && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(trimmed.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AttemptOutcome {
    Ok,
    Failed { detail: String },
}

/// One retry attempt of one step, success or failure. Appended to the
/// context's log and mirrored to the tracing sink by the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub step: String,
    pub attempt: usize,
    pub outcome: AttemptOutcome,
    pub timestamp: DateTime<Utc>,
}

/// Mutable per-identifier state. Created when the identifier is dequeued,
/// exclusively owned by the in-flight workflow, discarded once its outcome
/// lands in the report.
#[derive(Debug)]
pub struct WorkflowContext {
    identifier: Identifier,
    output_root: PathBuf,
    current_year: Option<u16>,
    step_attempts: HashMap<String, usize>,
    attempt_log: Vec<AttemptRecord>,
}

impl WorkflowContext {
    pub fn new(identifier: Identifier, output_root: impl Into<PathBuf>) -> Self {
        Self {
            identifier,
            output_root: output_root.into(),
            current_year: None,
            step_attempts: HashMap::new(),
            attempt_log: Vec::new(),
        }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn current_year(&self) -> Option<u16> {
        self.current_year
    }

    pub fn set_current_year(&mut self, year: Option<u16>) {
        self.current_year = year;
    }

    /// Destination directory for one year's archive. Uniquely determined by
    /// (identifier, year), so destinations never collide within a run.
    pub fn year_destination(&self, year: u16) -> PathBuf {
        self.output_root
            .join(self.identifier.as_str())
            .join(year.to_string())
    }

    pub fn record_attempt(&mut self, step: &str, outcome: AttemptOutcome) -> usize {
        let counter = self.step_attempts.entry(step.to_string()).or_insert(0);
        *counter += 1;
        let attempt = *counter;
        self.attempt_log.push(AttemptRecord {
            step: step.to_string(),
            attempt,
            outcome,
            timestamp: Utc::now(),
        });
        attempt
    }

    pub fn attempts_for(&self, step: &str) -> usize {
        self.step_attempts.get(step).copied().unwrap_or(0)
    }

    pub fn attempt_log(&self) -> &[AttemptRecord] {
        &self.attempt_log
    }

    pub fn into_attempt_log(self) -> Vec<AttemptRecord> {
        self.attempt_log
    }
}
