use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::workflow::Identifier;

#[derive(Debug, Clone, Serialize)]
pub struct YearFailure {
    pub year: u16,
    pub reason: String,
}

/// Final outcome of one identifier: which years verified, which failed, and
/// the terminal error when the identifier never reached its year loop.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifierRecord {
    pub identifier: Identifier,
    pub years_ok: Vec<u16>,
    pub years_failed: Vec<YearFailure>,
    pub terminal_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Success,
    Partial,
    Failed,
}

impl IdentifierRecord {
    pub fn disposition(&self) -> Disposition {
        if self.years_ok.is_empty() {
            Disposition::Failed
        } else if self.years_failed.is_empty() && self.terminal_error.is_none() {
            Disposition::Success
        } else {
            Disposition::Partial
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub success: usize,
    pub partial: usize,
    pub failed: usize,
}

/// Append-only aggregation of per-identifier outcomes, ordered by input
/// order. No retry logic lives here.
#[derive(Debug, Serialize)]
pub struct RunReport {
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    records: Vec<IdentifierRecord>,
    aborted: Option<String>,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            records: Vec::new(),
            aborted: None,
        }
    }

    pub fn push(&mut self, record: IdentifierRecord) {
        self.records.push(record);
    }

    pub fn mark_aborted(&mut self, reason: impl Into<String>) {
        self.aborted = Some(reason.into());
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn records(&self) -> &[IdentifierRecord] {
        &self.records
    }

    pub fn aborted(&self) -> Option<&str> {
        self.aborted.as_deref()
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            total: self.records.len(),
            success: 0,
            partial: 0,
            failed: 0,
        };
        for record in &self.records {
            match record.disposition() {
                Disposition::Success => summary.success += 1,
                Disposition::Partial => summary.partial += 1,
                Disposition::Failed => summary.failed += 1,
            }
        }
        summary
    }

    pub fn render_text(&self) -> String {
        let summary = self.summary();
        let mut out = String::new();
        out.push_str("Disclosure Archive Download Report\n");
        out.push_str("==================================\n");
        out.push_str(&format!(
            "Started:  {}\n",
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        if let Some(finished) = self.finished_at {
            out.push_str(&format!(
                "Finished: {}\n",
                finished.format("%Y-%m-%d %H:%M:%S UTC")
            ));
        }
        out.push_str(&format!(
            "\nIdentifiers: {}  (success: {}, partial: {}, failed: {})\n",
            summary.total, summary.success, summary.partial, summary.failed
        ));
        if let Some(reason) = &self.aborted {
            out.push_str(&format!("\nRUN ABORTED: {reason}\n"));
        }
        out.push('\n');
        for record in &self.records {
            let mark = match record.disposition() {
                Disposition::Success => '+',
                Disposition::Partial => '~',
                Disposition::Failed => '-',
            };
            out.push_str(&format!("{mark} {}", record.identifier));
            if !record.years_ok.is_empty() {
                let years: Vec<String> =
                    record.years_ok.iter().map(|y| y.to_string()).collect();
                out.push_str(&format!("  ok: {}", years.join(", ")));
            }
            for failure in &record.years_failed {
                out.push_str(&format!("  {} failed: {}", failure.year, failure.reason));
            }
            if let Some(terminal) = &record.terminal_error {
                out.push_str(&format!("  error: {terminal}"));
            }
            out.push('\n');
        }
        out
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}
