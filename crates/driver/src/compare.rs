//! Reference comparison
//!
//! Turns the complete result matrix of one task into a single
//! [`TaskOutcome`]. Eq-like tasks are compared byte for byte against the
//! reference tree, fbf tasks compare their two rounds with each other and
//! load tasks only need to finish without a failure.

use reftest_common::{
    decode_snapshot, PageResult, RefLayout, Result, Task, TaskOutcome, TaskType,
    OPTIMIZED_RENDERING_DIFFERS,
};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Results of one round, indexed by 0-based page
pub type RoundResults = Vec<Option<PageResult>>;

/// Result of evaluating one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub outcome: TaskOutcome,
    /// Pages that had no reference image
    pub eq_no_snapshot: usize,
    /// 1-based pages that differed from their reference or second rendering
    pub failed_pages: Vec<usize>,
    /// 1-based pages written to the staging tree
    pub staged_pages: Vec<usize>,
}

impl TaskReport {
    fn new(outcome: TaskOutcome) -> Self {
        Self {
            outcome,
            eq_no_snapshot: 0,
            failed_pages: Vec::new(),
            staged_pages: Vec::new(),
        }
    }
}

/// Compares task results against references on disk
#[derive(Debug, Clone)]
pub struct ComparisonEngine {
    layout: RefLayout,
    /// Directory task `file` paths are relative to
    fixtures_root: PathBuf,
}

impl ComparisonEngine {
    pub fn new(layout: RefLayout, fixtures_root: impl Into<PathBuf>) -> Self {
        Self {
            layout,
            fixtures_root: fixtures_root.into(),
        }
    }

    pub fn layout(&self) -> &RefLayout {
        &self.layout
    }

    /// Evaluate a finished task. Logs exactly one `TEST-*` line for it.
    pub fn check_task(
        &self,
        browser: &str,
        task: &Task,
        rounds: &[RoundResults],
        master_mode: bool,
    ) -> TaskReport {
        if let Some(outcome) = self.precheck(browser, task, rounds) {
            return TaskReport::new(outcome);
        }

        let result = match task.kind {
            TaskType::Fbf => self.check_fbf(browser, task, rounds, master_mode),
            TaskType::Load => Ok(self.check_load(browser, task)),
            TaskType::Eq
            | TaskType::Partial
            | TaskType::Text
            | TaskType::Highlight
            | TaskType::Extract => self.check_eq(browser, task, rounds, master_mode),
        };

        result.unwrap_or_else(|e| {
            error!(
                "TEST-UNEXPECTED-FAIL | {} {} | in {} | {}",
                task.kind, task.id, browser, e
            );
            TaskReport::new(TaskOutcome::Error)
        })
    }

    /// Scan reported failures. Returns the outcome if the task must not be
    /// compared any further.
    fn precheck(&self, browser: &str, task: &Task, rounds: &[RoundResults]) -> Option<TaskOutcome> {
        let mut failed = false;
        for (round, pages) in rounds.iter().enumerate() {
            for (page, result) in pages.iter().enumerate() {
                let Some(failure) = result.as_ref().and_then(|r| r.failure.as_deref()) else {
                    continue;
                };
                if !failure.contains(OPTIMIZED_RENDERING_DIFFERS) {
                    failed = true;
                }
                warn!(
                    "{} | in {} | page{} round {} | {}",
                    task.id,
                    browser,
                    page + 1,
                    round + 1,
                    failure
                );
            }
        }

        if !failed {
            return None;
        }

        if self.fixtures_root.join(task.error_marker_path()).exists() {
            info!(
                "TEST-SKIPPED | PDF was not downloaded {} | in {}",
                task.id, browser
            );
            Some(TaskOutcome::Skipped)
        } else {
            error!("TEST-UNEXPECTED-FAIL | test failed {} | in {}", task.id, browser);
            Some(TaskOutcome::Error)
        }
    }

    fn check_eq(
        &self,
        browser: &str,
        task: &Task,
        rounds: &[RoundResults],
        master_mode: bool,
    ) -> Result<TaskReport> {
        let mut report = TaskReport::new(TaskOutcome::Passed);
        let Some(pages) = rounds.first() else {
            return Ok(report);
        };

        for (index, result) in pages.iter().enumerate() {
            let Some(result) = result else {
                continue;
            };
            let page = index + 1;

            let test_snapshot = match result.snapshot.as_deref().and_then(decode_snapshot) {
                Some(bytes) => bytes,
                None => {
                    error!("Valid snapshot was not found.");
                    Vec::new()
                }
            };

            let ref_path = self.layout.reference_path(browser, &task.id, page);
            let reference = if ref_path.exists() {
                Some(fs::read(&ref_path)?)
            } else {
                report.eq_no_snapshot += 1;
                if !master_mode {
                    warn!("WARNING: no reference snapshot {}", ref_path.display());
                }
                None
            };

            let matches = reference.as_deref() == Some(test_snapshot.as_slice());
            if let Some(reference) = &reference {
                if !matches {
                    warn!(
                        "{} {} | in {} | rendering of page {} != reference rendering",
                        task.kind, task.id, browser, page
                    );
                    self.record_eq_failure(browser, task, page, result, &test_snapshot, reference)?;
                    report.failed_pages.push(page);
                }
            }

            if master_mode && !matches {
                let baseline = result.baseline_snapshot.as_deref().and_then(decode_snapshot);
                let staged = baseline.as_deref().unwrap_or(&test_snapshot);
                write_file(&self.layout.staged_path(browser, &task.id, page), staged)?;
                report.staged_pages.push(page);
            }
        }

        if report.failed_pages.is_empty() {
            info!("TEST-PASS | {} test {} | in {}", task.kind, task.id, browser);
        } else {
            error!(
                "TEST-UNEXPECTED-FAIL | {} {} | in {} | page(s) {} != reference rendering",
                task.kind,
                task.id,
                browser,
                join_pages(&report.failed_pages)
            );
            report.outcome = TaskOutcome::EqFailure;
        }
        Ok(report)
    }

    /// Persist both images and append the three-line record to the eq log
    fn record_eq_failure(
        &self,
        browser: &str,
        task: &Task,
        page: usize,
        result: &PageResult,
        test_snapshot: &[u8],
        reference: &[u8],
    ) -> Result<()> {
        let test_path = self.layout.failed_snapshot_path(browser, &task.id, page);
        let ref_path = self.layout.failed_reference_path(browser, &task.id, page);
        write_file(&test_path, test_snapshot)?;
        write_file(&ref_path, reference)?;

        let viewport = result.viewport_string();
        let record = format!(
            "REFTEST TEST-UNEXPECTED-FAIL | {}-{}-page{} | image comparison (==)\n\
             REFTEST   IMAGE 1 (TEST){}: {}\n\
             REFTEST   IMAGE 2 (REFERENCE){}: {}\n",
            browser,
            task.id,
            page,
            viewport,
            test_path.display(),
            viewport,
            ref_path.display()
        );

        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.layout.eq_log)?;
        log.write_all(record.as_bytes())?;
        Ok(())
    }

    fn check_fbf(
        &self,
        browser: &str,
        task: &Task,
        rounds: &[RoundResults],
        master_mode: bool,
    ) -> Result<TaskReport> {
        let (Some(round0), Some(round1)) = (rounds.first(), rounds.get(1)) else {
            error!(
                "TEST-UNEXPECTED-FAIL | forward-back-forward test {} | in {} | needs two rounds, got {}",
                task.id,
                browser,
                rounds.len()
            );
            return Ok(TaskReport::new(TaskOutcome::Error));
        };
        if round0.len() != round1.len() {
            error!("round 1 and 2 sizes are different");
        }

        let mut report = TaskReport::new(TaskOutcome::Passed);
        let mut skipped = Vec::new();
        for (index, second) in round1.iter().enumerate() {
            let Some(Some(first)) = round0.get(index) else {
                continue;
            };
            let second = second.as_ref().and_then(|r| r.snapshot.as_deref());
            if first.snapshot.as_deref() == second {
                continue;
            }
            if master_mode {
                skipped.push(index + 1);
            } else {
                warn!(
                    "forward-back-forward test {} | in {} | first rendering of page {} != second",
                    task.id,
                    browser,
                    index + 1
                );
                report.failed_pages.push(index + 1);
            }
        }

        if !report.failed_pages.is_empty() {
            error!(
                "TEST-UNEXPECTED-FAIL | forward-back-forward test {} | in {} | first rendering of page(s) {} != second",
                task.id,
                browser,
                join_pages(&report.failed_pages)
            );
            report.outcome = TaskOutcome::FbfFailure;
        } else if !skipped.is_empty() {
            // Known to be flaky while making references
            info!(
                "TEST-SKIPPED | forward-back-forward test {} | in {} | page(s) {}",
                task.id,
                browser,
                join_pages(&skipped)
            );
            report.outcome = TaskOutcome::Skipped;
        } else {
            info!("TEST-PASS | forward-back-forward test {} | in {}", task.id, browser);
        }
        Ok(report)
    }

    /// Reaching this point means no page reported a failure
    fn check_load(&self, browser: &str, task: &Task) -> TaskReport {
        info!("TEST-PASS | load test {} | in {}", task.id, browser);
        TaskReport::new(TaskOutcome::Passed)
    }
}

fn join_pages(pages: &[usize]) -> String {
    pages
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(())
}
