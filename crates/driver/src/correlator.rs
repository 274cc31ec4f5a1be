//! Result correlation
//!
//! Page results arrive one request at a time and in any order. They are
//! stored by `(task, round, page)` and a task is evaluated once the runner's
//! own counters say it is complete.

use crate::session::Coordinator;
use crate::stats::StatsEntry;
use async_trait::async_trait;
use reftest_common::{
    Error, InfoMessage, PageResult, Result, TaskOutcome, TaskSubmission, UnitTestReport,
};
use reftest_web::HarnessSink;
use tracing::{debug, error, info};

/// Upper bound on a page index taken from the wire, slots are allocated up to it
const MAX_PAGE: usize = 100_000;

/// Whether a task has reported everything, judged from its final round.
///
/// `last_round` is `None` until the final round has a result. Two signals
/// from the runner are accepted, either one suffices:
/// - the last page has reported and no page before it is missing
/// - the number of reported pages equals `number_of_tasks`
///
/// Pages may arrive in any order, so the last page alone does not mean
/// the pages before it are in. Pages the runner legitimately skips (page
/// ranges) are covered by the count.
pub fn is_task_done(
    last_round: Option<&[Option<PageResult>]>,
    last_page_num: usize,
    number_of_tasks: usize,
) -> bool {
    let Some(round) = last_round else {
        return false;
    };
    let last_page_reported = last_page_num >= 1
        && round.len() >= last_page_num
        && round[..last_page_num].iter().all(Option::is_some);
    let reported = round.iter().filter(|result| result.is_some()).count();
    last_page_reported || reported == number_of_tasks
}

/// What a stored submission led to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Stored, the task is still waiting for pages
    Stored,
    /// Completed the task, which was evaluated
    Evaluated(TaskOutcome),
}

impl Coordinator {
    /// Store one page result and evaluate its task once it is complete.
    ///
    /// The session is closed when its last task has been evaluated.
    pub async fn submit_result(&self, submission: TaskSubmission) -> Result<Submitted> {
        let browser = submission.browser.clone();
        let session = self.get_session(&browser)?;

        let (submitted, finished) = {
            let mut guard = session.lock().await;
            let session = &mut *guard;
            if session.is_closed() {
                return Err(Error::InvalidSlot {
                    browser,
                    task: submission.id,
                    reason: "session is closed".to_string(),
                });
            }
            self.arm_timeout(session);

            let state = session.tasks.get_mut(&submission.id).ok_or_else(|| Error::UnknownTask {
                browser: browser.clone(),
                task: submission.id.clone(),
            })?;
            if submission.page == 0 {
                return Err(Error::InvalidSlot {
                    browser,
                    task: submission.id,
                    reason: "page numbers start at 1".to_string(),
                });
            }
            let page_bound = submission
                .last_page_num
                .max(submission.number_of_tasks)
                .min(MAX_PAGE);
            if submission.page > page_bound {
                return Err(Error::InvalidSlot {
                    browser,
                    task: submission.id,
                    reason: format!("page {} beyond page {}", submission.page, page_bound),
                });
            }
            let num_rounds = state.rounds.len();
            let Some(slots) = state.rounds.get_mut(submission.round) else {
                return Err(Error::InvalidSlot {
                    browser,
                    task: submission.id,
                    reason: format!("round {} of a {} round task", submission.round, num_rounds),
                });
            };
            if slots.len() < submission.page {
                slots.resize(submission.page, None);
            }
            let slot = &mut slots[submission.page - 1];
            if slot.is_some() {
                return Err(Error::DuplicateResult {
                    browser,
                    task: submission.id,
                    round: submission.round,
                    page: submission.page,
                });
            }
            *slot = Some(submission.page_result());
            debug!(
                "Stored {}:{}:{}:{}",
                browser, submission.id, submission.round, submission.page
            );

            if let Some(stats) = submission.stats.clone() {
                self.stats.record(StatsEntry {
                    browser: browser.clone(),
                    pdf: submission.id.clone(),
                    page: submission.page - 1,
                    round: submission.round,
                    stats,
                });
            }

            if state.evaluated
                || !is_task_done(
                    state.last_round(),
                    submission.last_page_num,
                    submission.number_of_tasks,
                )
            {
                return Ok(Submitted::Stored);
            }

            let report = self.engine.check_task(
                &browser,
                &state.task,
                &state.rounds,
                self.mode().is_master(),
            );
            state.evaluated = true;
            state.release_snapshots();

            let finished = session.record(&report);
            (Submitted::Evaluated(report.outcome), finished)
        };

        if finished {
            self.close_session(&browser).await?;
        }
        Ok(submitted)
    }

    /// Count one unit or font test report
    pub async fn record_unit_result(&self, report: UnitTestReport) -> Result<()> {
        let session = self.get_session(&report.browser)?;
        let mut session = session.lock().await;
        session.counters.num_runs += 1;

        let mut line = format!(
            "{} | {} | in {}",
            report.status, report.description, report.browser
        );
        if let Some(err) = report.error.as_deref().filter(|e| !e.is_empty()) {
            line.push_str(" | ");
            line.push_str(err);
        }

        if report.is_failure() {
            session.counters.num_errors += 1;
            error!("{}", line);
        } else {
            info!("{}", line);
        }
        Ok(())
    }
}

#[async_trait]
impl HarnessSink for Coordinator {
    async fn submit_task_results(&self, submission: TaskSubmission) -> Result<()> {
        self.submit_result(submission).await.map(|_| ())
    }

    async fn submit_unit_result(&self, report: UnitTestReport) -> Result<()> {
        self.record_unit_result(report).await
    }

    async fn info(&self, message: InfoMessage) -> Result<()> {
        info!("{}", message.message);
        Ok(())
    }

    async fn tell_me_to_quit(&self, browser: &str) -> Result<()> {
        debug!("{} asked to quit", browser);
        self.close_session(browser).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunMode;
    use crate::session::tests::{coordinator, FakeBrowser};
    use reftest_common::{encode_snapshot, Task, TaskType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn result() -> Option<PageResult> {
        Some(PageResult {
            failure: None,
            snapshot: None,
            baseline_snapshot: None,
            viewport_width: 0.0,
            viewport_height: 0.0,
            output_scale: 1.0,
        })
    }

    fn submission(browser: &str, id: &str, round: usize, page: usize, last_page: usize) -> TaskSubmission {
        TaskSubmission {
            browser: browser.to_string(),
            id: id.to_string(),
            round,
            page,
            failure: None,
            snapshot: Some(encode_snapshot(format!("{}-{}", id, page).as_bytes())),
            baseline_snapshot: None,
            viewport_width: 612.0,
            viewport_height: 792.0,
            output_scale: 1.0,
            last_page_num: last_page,
            number_of_tasks: last_page,
            stats: None,
        }
    }

    #[test]
    fn test_not_done_before_final_round() {
        assert!(!is_task_done(None, 1, 1));
        assert!(!is_task_done(None, 0, 0));
    }

    #[test]
    fn test_done_when_last_page_present() {
        // Runner miscounted, the last page still completes the task
        let round = [result(), result(), result()];
        assert!(is_task_done(Some(&round), 3, 5));
    }

    #[test]
    fn test_done_when_count_matches() {
        let round = [result(), result()];
        assert!(is_task_done(Some(&round), 5, 2));
    }

    #[test]
    fn test_conditions_may_disagree() {
        // Last page reported first, page 1 still outstanding
        let round = [None, result()];
        assert!(!is_task_done(Some(&round), 2, 2));

        // Leading pages skipped by a page range, the count completes it
        let round = [None, result()];
        assert!(is_task_done(Some(&round), 2, 1));

        // Count reached while the last page slot is still empty
        let round = [result(), result(), None];
        assert!(is_task_done(Some(&round), 3, 2));

        let round = [result(), None, None];
        assert!(!is_task_done(Some(&round), 3, 3));
    }

    #[tokio::test]
    async fn test_out_of_order_pages_evaluate_once() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(
            &dir,
            RunMode::RefTest,
            vec![
                Task::new("two", TaskType::Load, "two.pdf"),
                Task::new("other", TaskType::Load, "other.pdf"),
            ],
        );
        coordinator.create_session("firefox", None).unwrap();

        let sub = submission("firefox", "two", 0, 2, 2);
        assert_eq!(coordinator.submit_result(sub).await.unwrap(), Submitted::Stored);

        let sub = submission("firefox", "two", 0, 1, 2);
        assert_eq!(
            coordinator.submit_result(sub).await.unwrap(),
            Submitted::Evaluated(TaskOutcome::Passed)
        );

        let session = coordinator.get_session("firefox").unwrap();
        let session = session.lock().await;
        assert_eq!(session.remaining(), 1);
        assert_eq!(session.counters().num_runs, 1);
        let state = session.task("two").unwrap();
        assert!(state.evaluated);
        assert!(state.rounds[0].iter().flatten().all(|r| r.snapshot.is_none()));
    }

    #[tokio::test]
    async fn test_duplicate_slot_rejected() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(
            &dir,
            RunMode::RefTest,
            vec![Task::new("doc", TaskType::Load, "doc.pdf")],
        );
        coordinator.create_session("firefox", None).unwrap();

        let mut first = submission("firefox", "doc", 0, 1, 3);
        first.viewport_width = 100.0;
        coordinator.submit_result(first).await.unwrap();

        let second = submission("firefox", "doc", 0, 1, 3);
        assert!(matches!(
            coordinator.submit_result(second).await,
            Err(Error::DuplicateResult { page: 1, .. })
        ));

        let session = coordinator.get_session("firefox").unwrap();
        let session = session.lock().await;
        let stored = session.task("doc").unwrap().rounds[0][0].as_ref().unwrap();
        assert_eq!(stored.viewport_width, 100.0);
    }

    #[tokio::test]
    async fn test_invalid_slots_rejected() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(
            &dir,
            RunMode::RefTest,
            vec![Task::new("doc", TaskType::Load, "doc.pdf")],
        );
        coordinator.create_session("firefox", None).unwrap();

        let err = coordinator
            .submit_result(submission("firefox", "nope", 0, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTask { .. }));

        let err = coordinator
            .submit_result(submission("firefox", "doc", 1, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSlot { .. }));

        let err = coordinator
            .submit_result(submission("firefox", "doc", 0, 0, 1))
            .await
            .unwrap_err();
        assert!(err.is_protocol_violation());

        let err = coordinator
            .submit_result(submission("safari", "doc", 0, 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownSession(_)));
    }

    #[tokio::test]
    async fn test_page_beyond_last_page_rejected() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(
            &dir,
            RunMode::RefTest,
            vec![Task::new("doc", TaskType::Load, "doc.pdf")],
        );
        coordinator.create_session("firefox", None).unwrap();

        let err = coordinator
            .submit_result(submission("firefox", "doc", 0, 1usize << 60, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSlot { .. }));

        let err = coordinator
            .submit_result(submission("firefox", "doc", 0, 3, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSlot { .. }));

        let huge = submission("firefox", "doc", 0, 1usize << 60, 1usize << 60);
        let err = coordinator.submit_result(huge).await.unwrap_err();
        assert!(matches!(err, Error::InvalidSlot { .. }));

        // The session still accepts valid pages afterwards
        let submitted = coordinator
            .submit_result(submission("firefox", "doc", 0, 1, 2))
            .await
            .unwrap();
        assert_eq!(submitted, Submitted::Stored);
    }

    #[tokio::test]
    async fn test_last_task_closes_session() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(
            &dir,
            RunMode::RefTest,
            vec![Task::new("doc", TaskType::Load, "doc.pdf")],
        );
        let closes = Arc::new(AtomicUsize::new(0));
        let browser = FakeBrowser {
            name: "chrome".to_string(),
            closes: closes.clone(),
        };
        coordinator
            .create_session("chrome", Some(Box::new(browser)))
            .unwrap();

        coordinator
            .submit_result(submission("chrome", "doc", 0, 1, 1))
            .await
            .unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.open_sessions(), 0);

        // Quitting afterwards changes nothing
        coordinator.tell_me_to_quit("chrome").await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.totals().await.num_errors, 0);
    }

    #[tokio::test]
    async fn test_fbf_waits_for_second_round() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(
            &dir,
            RunMode::RefTest,
            vec![Task::new("fbf", TaskType::Fbf, "fbf.pdf").with_rounds(2)],
        );
        coordinator.create_session("firefox", None).unwrap();

        let first = coordinator
            .submit_result(submission("firefox", "fbf", 0, 1, 1))
            .await
            .unwrap();
        assert_eq!(first, Submitted::Stored);

        let second = coordinator
            .submit_result(submission("firefox", "fbf", 1, 1, 1))
            .await
            .unwrap();
        assert_eq!(second, Submitted::Evaluated(TaskOutcome::Passed));
    }

    #[tokio::test]
    async fn test_stats_collected() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(
            &dir,
            RunMode::RefTest,
            vec![Task::new("doc", TaskType::Load, "doc.pdf")],
        );
        coordinator.create_session("firefox", None).unwrap();

        let mut sub = submission("firefox", "doc", 0, 2, 2);
        sub.stats = Some(serde_json::json!({"times": []}));
        coordinator.submit_result(sub).await.unwrap();

        let entries = coordinator.stats().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].page, 1);
        assert_eq!(entries[0].pdf, "doc");
    }

    #[tokio::test]
    async fn test_unit_results_counted() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(&dir, RunMode::UnitTest, vec![]);
        coordinator.create_session("firefox", None).unwrap();

        for status in ["TEST-PASSED", "TEST-UNEXPECTED-FAIL", "TEST-PASSED"] {
            coordinator
                .submit_unit_result(UnitTestReport {
                    browser: "firefox".to_string(),
                    status: status.to_string(),
                    description: "parser".to_string(),
                    error: None,
                })
                .await
                .unwrap();
        }
        coordinator.tell_me_to_quit("firefox").await.unwrap();

        let totals = coordinator.totals().await;
        assert_eq!(totals.num_runs, 3);
        assert_eq!(totals.num_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_browser_times_out() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(
            &dir,
            RunMode::RefTest,
            vec![
                Task::new("a", TaskType::Load, "a.pdf"),
                Task::new("b", TaskType::Load, "b.pdf"),
                Task::new("c", TaskType::Load, "c.pdf"),
            ],
        );
        let closes = Arc::new(AtomicUsize::new(0));
        let browser = FakeBrowser {
            name: "firefox".to_string(),
            closes: closes.clone(),
        };
        coordinator.create_session("firefox", None).unwrap();
        coordinator
            .attach_browser("firefox", Box::new(browser))
            .await
            .unwrap();

        coordinator
            .submit_result(submission("firefox", "a", 0, 1, 1))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(600), coordinator.wait_all_closed())
            .await
            .unwrap();

        let totals = coordinator.totals().await;
        assert_eq!(totals.num_runs, 1);
        assert_eq!(totals.num_errors, 2);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let late = coordinator
            .submit_result(submission("firefox", "b", 0, 1, 1))
            .await;
        assert!(late.is_err());
    }
}
