use tracing::{debug, info};

use crate::browser::portal::{RegistryPortal, SearchOutcome};
use crate::report::{IdentifierRecord, YearFailure};
use crate::verify::{ArchiveVerifier, DownloadTask};

use super::context::{Identifier, WorkflowContext};
use super::error::{WorkflowError, WorkflowResult};
use super::retry::BackoffPolicy;

/// Interaction sequence for one identifier. Each transition is one portal
/// interaction, individually wrapped by the retry coordinator; the per-year
/// download sequence is retried as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Start,
    Searching,
    ResultsLoaded,
    OrganizationSelected,
    DownloadDialogOpen,
    YearSelected(u16),
    AllItemsSelected,
    ArchiveRequested,
    DownloadVerified,
    NextYearOrDone,
    Done,
}

fn enter(identifier: &Identifier, state: WorkflowState) {
    debug!(identifier = %identifier, state = ?state, "workflow transition");
}

pub struct IdentifierWorkflow<'a> {
    portal: &'a dyn RegistryPortal,
    verifier: &'a dyn ArchiveVerifier,
    policy: &'a BackoffPolicy,
    years: &'a [u16],
    min_archive_bytes: u64,
}

impl<'a> IdentifierWorkflow<'a> {
    pub fn new(
        portal: &'a dyn RegistryPortal,
        verifier: &'a dyn ArchiveVerifier,
        policy: &'a BackoffPolicy,
        years: &'a [u16],
        min_archive_bytes: u64,
    ) -> Self {
        Self {
            portal,
            verifier,
            policy,
            years,
            min_archive_bytes,
        }
    }

    /// Drives the identifier to completion. The record is always produced,
    /// even on a fatal session fault: whatever verified before the fault
    /// stays in it, and the fault itself is returned alongside so the caller
    /// can abort the run.
    pub async fn run(
        &self,
        ctx: &mut WorkflowContext,
    ) -> (IdentifierRecord, Option<WorkflowError>) {
        let identifier = ctx.identifier().clone();
        enter(&identifier, WorkflowState::Start);
        let mut record = IdentifierRecord {
            identifier: identifier.clone(),
            years_ok: Vec::new(),
            years_failed: Vec::new(),
            terminal_error: None,
        };

        if let Err(error) = self.navigate_to_dialog(ctx, &identifier).await {
            record.terminal_error = Some(error.to_string());
            let fatal = error.is_fatal().then_some(error);
            return (record, fatal);
        }

        for &year in self.years {
            ctx.set_current_year(Some(year));
            enter(&identifier, WorkflowState::YearSelected(year));
            match self.download_year(ctx, &identifier, year).await {
                Ok(()) => {
                    enter(&identifier, WorkflowState::DownloadVerified);
                    record.years_ok.push(year);
                }
                Err(error) if error.is_fatal() => {
                    // Earlier years already landed on disk; keep them in the
                    // record so the report stays a complete accounting.
                    record.terminal_error = Some(error.to_string());
                    ctx.set_current_year(None);
                    return (record, Some(error));
                }
                Err(error) => {
                    // Year failures are isolated; the remaining years still run.
                    record.years_failed.push(YearFailure {
                        year,
                        reason: error.to_string(),
                    });
                }
            }
            ctx.set_current_year(None);
            enter(&identifier, WorkflowState::NextYearOrDone);
        }
        enter(&identifier, WorkflowState::Done);

        info!(
            identifier = %identifier,
            ok = record.years_ok.len(),
            failed = record.years_failed.len(),
            "identifier workflow finished"
        );
        (record, None)
    }

    /// Search, exact-match selection, and dialog opening: the shared prefix
    /// before the year loop. Each interaction is its own retried step.
    async fn navigate_to_dialog(
        &self,
        ctx: &mut WorkflowContext,
        identifier: &Identifier,
    ) -> WorkflowResult<()> {
        enter(identifier, WorkflowState::Searching);
        self.policy
            .run(ctx, "search", |_| async move {
                let outcome = self.portal.search(identifier).await?;
                self.classify_search(identifier, outcome).await
            })
            .await?;

        enter(identifier, WorkflowState::ResultsLoaded);
        self.policy
            .run(ctx, "select_organization", |_| {
                self.portal.open_organization(identifier)
            })
            .await?;

        enter(identifier, WorkflowState::OrganizationSelected);
        self.policy
            .run(ctx, "open_download_dialog", |_| {
                self.portal.open_download_dialog()
            })
            .await?;
        enter(identifier, WorkflowState::DownloadDialogOpen);
        Ok(())
    }

    /// Zero rows means no registry entry, unless a captcha wall is what
    /// actually swallowed the results. Anything but exactly one exact match
    /// is ambiguous and permanent.
    async fn classify_search(
        &self,
        identifier: &Identifier,
        outcome: SearchOutcome,
    ) -> WorkflowResult<SearchOutcome> {
        if outcome.results == 0 {
            if self.portal.captcha_present().await? {
                return Err(WorkflowError::CaptchaWall(identifier.to_string()));
            }
            return Err(WorkflowError::NoMatch(identifier.to_string()));
        }
        if outcome.exact_matches != 1 {
            return Err(WorkflowError::AmbiguousMatch {
                identifier: identifier.to_string(),
                candidates: outcome.exact_matches,
            });
        }
        Ok(outcome)
    }

    /// One year's select/request/verify sequence, retried as a unit. A fresh
    /// `DownloadTask` is created per attempt so task status only ever moves
    /// forward.
    async fn download_year(
        &self,
        ctx: &mut WorkflowContext,
        identifier: &Identifier,
        year: u16,
    ) -> WorkflowResult<()> {
        let destination = ctx.year_destination(year);
        let step = format!("download_year_{year}");
        self.policy
            .run(ctx, &step, |attempt| {
                let destination = destination.clone();
                let identifier = identifier.clone();
                async move {
                    // The existing-archive check runs inside the retried
                    // unit so its failures are logged as attempts too.
                    let mut existing = DownloadTask::new(
                        identifier.clone(),
                        year,
                        destination.clone(),
                        self.min_archive_bytes,
                    );
                    if self.verifier.check_existing(&mut existing).await? {
                        return Ok(());
                    }
                    if attempt > 1 {
                        // The dialog state is unknown after a failure.
                        self.portal.open_download_dialog().await?;
                    }
                    self.portal.prepare_download(&destination).await?;
                    self.portal.select_year(year).await?;
                    enter(&identifier, WorkflowState::AllItemsSelected);
                    self.portal.select_all_items().await?;
                    self.portal.request_archive().await?;
                    enter(&identifier, WorkflowState::ArchiveRequested);
                    let mut task = DownloadTask::new(
                        identifier.clone(),
                        year,
                        destination.clone(),
                        self.min_archive_bytes,
                    );
                    self.verifier.verify(&mut task).await
                }
            })
            .await?;
        Ok(())
    }
}
