use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::browser::portal::RegistryPortal;
use crate::config::SelenaConfig;
use crate::report::{IdentifierRecord, RunReport};
use crate::verify::ArchiveVerifier;
use crate::workflow::{BackoffPolicy, Identifier, IdentifierWorkflow, WorkflowContext};

/// Processes a list of identifiers sequentially against one browser session.
/// Every input identifier ends up in the report exactly once, including the
/// ones a mid-run abort never reached.
pub struct BatchRunner<'a> {
    portal: &'a dyn RegistryPortal,
    verifier: &'a dyn ArchiveVerifier,
    config: &'a SelenaConfig,
}

impl<'a> BatchRunner<'a> {
    pub fn new(
        portal: &'a dyn RegistryPortal,
        verifier: &'a dyn ArchiveVerifier,
        config: &'a SelenaConfig,
    ) -> Self {
        Self {
            portal,
            verifier,
            config,
        }
    }

    pub async fn run(&self, identifiers: &[Identifier]) -> RunReport {
        let queue = dedupe(identifiers);
        let dropped = identifiers.len() - queue.len();
        if dropped > 0 {
            info!(dropped, "duplicate identifiers removed from the queue");
        }

        let policy = BackoffPolicy::new(self.config.retry.clone());
        let workflow = IdentifierWorkflow::new(
            self.portal,
            self.verifier,
            &policy,
            &self.config.years.targets,
            self.config.verifier.min_archive_bytes,
        );

        let mut report = RunReport::new();
        let mut pending = queue.into_iter();
        let mut first = true;
        while let Some(identifier) = pending.next() {
            if !first {
                self.pause_between_identifiers().await;
            }
            first = false;

            let mut ctx =
                WorkflowContext::new(identifier.clone(), &self.config.paths.output_root);
            let (record, fatal) = workflow.run(&mut ctx).await;
            report.push(record);
            if let Some(fatal) = fatal {
                warn!(
                    identifier = %identifier,
                    error = %fatal,
                    "run aborted by session fault"
                );
                for skipped in pending.by_ref() {
                    report.push(IdentifierRecord {
                        identifier: skipped,
                        years_ok: Vec::new(),
                        years_failed: Vec::new(),
                        terminal_error: Some("run aborted before processing".to_string()),
                    });
                }
                report.mark_aborted(fatal.to_string());
                break;
            }
        }

        report.finish();
        let summary = report.summary();
        info!(
            total = summary.total,
            success = summary.success,
            partial = summary.partial,
            failed = summary.failed,
            aborted = report.aborted().is_some(),
            "batch run finished"
        );
        report
    }

    async fn pause_between_identifiers(&self) {
        let [low, high] = self.config.pacing.identifier_delay_ms;
        if high == 0 {
            return;
        }
        let millis = rand::thread_rng().gen_range(low.min(high)..=low.max(high));
        sleep(Duration::from_millis(millis)).await;
    }
}

/// First occurrence wins; input order is otherwise preserved.
fn dedupe(identifiers: &[Identifier]) -> Vec<Identifier> {
    let mut seen = HashSet::new();
    identifiers
        .iter()
        .filter(|identifier| seen.insert((*identifier).clone()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::portal::SearchOutcome;
    use crate::config::{PacingSection, PathsSection, RetrySection, VerifierSection, YearsSection};
    use crate::report::Disposition;
    use crate::verify::{DownloadTask, TaskStatus};
    use crate::workflow::{WorkflowError, WorkflowResult};
    use async_trait::async_trait;
    use std::cell::RefCell;
    use std::path::Path;

    fn config() -> SelenaConfig {
        SelenaConfig {
            paths: PathsSection {
                output_root: "/tmp/selena-batch".into(),
                report_path: "/tmp/selena-batch/report.txt".into(),
            },
            years: YearsSection {
                targets: vec![2023, 2022],
            },
            retry: RetrySection {
                max_attempts: 2,
                base_delay_ms: 0,
                growth_factor: 2.0,
                delay_cap_ms: 0,
                jitter_ms: 0,
            },
            verifier: VerifierSection {
                poll_timeout_secs: 1,
                quiet_interval_ms: 10,
                poll_interval_ms: 10,
                min_archive_bytes: 64,
                archive_pattern: r"(?i)\.zip$".into(),
            },
            pacing: PacingSection {
                identifier_delay_ms: [0, 0],
                step_delay_ms: [0, 0],
            },
        }
    }

    fn ident(raw: &str) -> Identifier {
        Identifier::parse(raw).unwrap()
    }

    /// Scripted portal: identifiers listed in `missing` return zero results,
    /// the one in `fatal_on` kills the session on search, and
    /// `fatal_select_year` kills it mid-download for one (identifier, year).
    #[derive(Default)]
    struct ScriptedPortal {
        missing: Vec<String>,
        fatal_on: Option<String>,
        fatal_select_year: Option<(String, u16)>,
        searches: RefCell<Vec<String>>,
    }

    #[async_trait(?Send)]
    impl RegistryPortal for ScriptedPortal {
        async fn search(&self, identifier: &Identifier) -> WorkflowResult<SearchOutcome> {
            self.searches.borrow_mut().push(identifier.to_string());
            if self.fatal_on.as_deref() == Some(identifier.as_str()) {
                return Err(WorkflowError::Session("websocket closed".into()));
            }
            if self.missing.iter().any(|raw| raw == identifier.as_str()) {
                return Ok(SearchOutcome {
                    results: 0,
                    exact_matches: 0,
                });
            }
            Ok(SearchOutcome {
                results: 1,
                exact_matches: 1,
            })
        }

        async fn open_organization(&self, _identifier: &Identifier) -> WorkflowResult<()> {
            Ok(())
        }

        async fn open_download_dialog(&self) -> WorkflowResult<()> {
            Ok(())
        }

        async fn prepare_download(&self, _dir: &Path) -> WorkflowResult<()> {
            Ok(())
        }

        async fn select_year(&self, year: u16) -> WorkflowResult<()> {
            if let Some((raw, bad_year)) = &self.fatal_select_year {
                let current = self.searches.borrow().last().cloned();
                if current.as_deref() == Some(raw.as_str()) && *bad_year == year {
                    return Err(WorkflowError::Session("websocket closed".into()));
                }
            }
            Ok(())
        }

        async fn select_all_items(&self) -> WorkflowResult<()> {
            Ok(())
        }

        async fn request_archive(&self) -> WorkflowResult<()> {
            Ok(())
        }

        async fn captcha_present(&self) -> WorkflowResult<bool> {
            Ok(false)
        }
    }

    struct AlwaysVerifies;

    #[async_trait(?Send)]
    impl ArchiveVerifier for AlwaysVerifies {
        async fn check_existing(&self, _task: &mut DownloadTask) -> WorkflowResult<bool> {
            Ok(false)
        }

        async fn verify(&self, task: &mut DownloadTask) -> WorkflowResult<()> {
            task.advance(TaskStatus::Downloading);
            task.advance(TaskStatus::Verified);
            Ok(())
        }
    }

    fn run_batch(portal: &ScriptedPortal, identifiers: &[Identifier]) -> RunReport {
        let config = config();
        let verifier = AlwaysVerifies;
        let runner = BatchRunner::new(portal, &verifier, &config);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(runner.run(identifiers))
    }

    #[test]
    fn duplicates_are_processed_once_in_input_order() {
        let portal = ScriptedPortal::default();
        let report = run_batch(
            &portal,
            &[
                ident("7707083893"),
                ident("1650002570"),
                ident("7707083893"),
            ],
        );

        assert_eq!(report.records().len(), 2);
        assert_eq!(
            portal.searches.borrow().as_slice(),
            &["7707083893", "1650002570"]
        );
        assert!(report.aborted().is_none());
        assert_eq!(report.summary().success, 2);
    }

    #[test]
    fn missing_identifier_does_not_stop_the_rest() {
        let portal = ScriptedPortal {
            missing: vec!["1650002570".into()],
            ..Default::default()
        };
        let report = run_batch(&portal, &[ident("1650002570"), ident("7707083893")]);

        assert_eq!(report.records().len(), 2);
        assert_eq!(report.records()[0].disposition(), Disposition::Failed);
        assert_eq!(report.records()[1].disposition(), Disposition::Success);
    }

    #[test]
    fn session_fault_aborts_but_reports_every_identifier() {
        let portal = ScriptedPortal {
            fatal_on: Some("1650002570".into()),
            ..Default::default()
        };
        let report = run_batch(
            &portal,
            &[
                ident("7707083893"),
                ident("1650002570"),
                ident("2309123456"),
            ],
        );

        assert!(report.aborted().is_some());
        assert_eq!(report.records().len(), 3);
        assert_eq!(report.records()[0].disposition(), Disposition::Success);
        assert!(report.records()[1]
            .terminal_error
            .as_deref()
            .unwrap()
            .contains("session fault"));
        assert_eq!(
            report.records()[2].terminal_error.as_deref(),
            Some("run aborted before processing")
        );
        // The identifier after the fault was never driven through the portal.
        assert_eq!(portal.searches.borrow().len(), 2);
    }

    #[test]
    fn abort_mid_identifier_keeps_already_verified_years() {
        let portal = ScriptedPortal {
            fatal_select_year: Some(("7707083893".into(), 2022)),
            ..Default::default()
        };
        let report = run_batch(&portal, &[ident("7707083893"), ident("1650002570")]);

        assert!(report.aborted().is_some());
        let first = &report.records()[0];
        // 2023 verified before the session died and stays reported.
        assert_eq!(first.years_ok, vec![2023]);
        assert!(first
            .terminal_error
            .as_deref()
            .unwrap()
            .contains("session fault"));
        assert_eq!(
            report.records()[1].terminal_error.as_deref(),
            Some("run aborted before processing")
        );
    }
}
