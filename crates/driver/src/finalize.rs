//! End of run reporting and reference promotion

use crate::config::RunMode;
use crate::session::Coordinator;
use reftest_common::{Error, RefLayout, Result, SessionCounters};
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{info, warn};
use walkdir::WalkDir;

/// How a run ended overall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    NoTestsRan,
    SomeFailed,
    AllPassed,
}

/// Counters of all sessions, summed once every session has closed
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub mode: RunMode,
    pub counters: SessionCounters,
    pub runtime: Duration,
}

impl RunSummary {
    pub fn verdict(&self) -> Verdict {
        let c = &self.counters;
        if c.num_runs == 0 {
            return Verdict::NoTestsRan;
        }
        let failed = if self.mode.is_reftest() {
            c.num_errors + c.num_eq_failures + c.num_fbf_failures
        } else {
            c.num_errors
        };
        if failed > 0 {
            Verdict::SomeFailed
        } else {
            Verdict::AllPassed
        }
    }

    /// 0 only if no session reported an error
    pub fn exit_code(&self) -> i32 {
        if self.counters.num_errors == 0 {
            0
        } else {
            1
        }
    }

    /// Lines printed at the end of a run
    pub fn report_lines(&self) -> Vec<String> {
        let c = &self.counters;
        let mut lines = Vec::new();

        if !self.mode.is_reftest() {
            lines.push(format!("Run {} tests", c.num_runs));
            match self.verdict() {
                Verdict::NoTestsRan => {
                    lines.push(format!("OHNOES!  No {} tests ran!", self.mode.label()))
                }
                Verdict::SomeFailed => {
                    lines.push(format!("OHNOES!  Some {} tests failed!", self.mode.label()));
                    lines.push(format!("  {} of {} failed", c.num_errors, c.num_runs));
                }
                Verdict::AllPassed => lines.push(format!("All {} tests passed.", self.mode.label())),
            }
            return lines;
        }

        match self.verdict() {
            Verdict::NoTestsRan => lines.push("OHNOES!  No test ran!".to_string()),
            Verdict::SomeFailed => {
                lines.push("OHNOES!  Some tests failed!".to_string());
                if c.num_errors > 0 {
                    lines.push(format!("  errors: {}", c.num_errors));
                }
                if c.num_eq_failures > 0 {
                    lines.push(format!("  different ref/snapshot: {}", c.num_eq_failures));
                }
                if c.num_fbf_failures > 0 {
                    lines.push(format!(
                        "  different first/second rendering: {}",
                        c.num_fbf_failures
                    ));
                }
            }
            Verdict::AllPassed => lines.push("All regression tests passed.".to_string()),
        }
        lines.push(format!(
            "Runtime was {:.1} seconds",
            self.runtime.as_secs_f64()
        ));
        if c.num_eq_no_snapshot > 0 {
            lines.push(format!(
                "{} page(s) had no reference snapshot",
                c.num_eq_no_snapshot
            ));
        }
        lines
    }

    pub fn log(&self) {
        for line in self.report_lines() {
            info!("{}", line);
        }
    }

    /// Master mode has new references to offer and nothing blocks them
    pub fn can_promote(&self) -> bool {
        let c = &self.counters;
        self.mode.is_master()
            && (c.num_eq_failures > 0 || c.num_eq_no_snapshot > 0)
            && c.num_fatal_failures() == 0
    }
}

impl Coordinator {
    /// Sum all sessions into the run summary. Only the first call after all
    /// sessions closed gets one.
    pub async fn finalize(&self, runtime: Duration) -> Option<RunSummary> {
        if self.open_sessions() > 0 || self.finalized.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(RunSummary {
            mode: self.mode(),
            counters: self.totals().await,
            runtime,
        })
    }
}

/// Answers yes/no questions during a run
pub trait Confirmation: Send + Sync {
    fn confirm(&self, question: &str) -> bool;
}

/// Says yes without asking
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConfirm;

impl Confirmation for AutoConfirm {
    fn confirm(&self, question: &str) -> bool {
        info!("{} yes (--no-prompts)", question);
        true
    }
}

/// Asks on the terminal, anything starting with `y` is a yes
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinConfirm;

impl Confirmation for StdinConfirm {
    fn confirm(&self, question: &str) -> bool {
        print!("{} ", question);
        if std::io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        match std::io::stdin().lock().read_line(&mut answer) {
            Ok(_) => answer.trim().to_lowercase().starts_with('y'),
            Err(e) => {
                warn!("Failed to read answer: {}", e);
                false
            }
        }
    }
}

/// What happened to the staged references
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Promotion {
    /// `files` were copied into the reference tree
    Promoted { files: usize, tmp_removed: bool },
    Declined,
}

/// Copy the staging tree over the reference tree.
///
/// Without prompts the staging tree is kept; after an interactive yes it
/// is removed.
pub fn promote_references(
    layout: &RefLayout,
    auto_confirm: bool,
    prompt: &dyn Confirmation,
) -> Result<Promotion> {
    let tmp = layout.tmp_dir.display();
    let refs = layout.refs_dir.display();
    if auto_confirm {
        let files = sync_tree(&layout.tmp_dir, &layout.refs_dir)?;
        info!("Copied {} reference(s) from {} to {}", files, tmp, refs);
        return Ok(Promotion::Promoted {
            files,
            tmp_removed: false,
        });
    }

    let question = format!(
        "Some eq tests failed or didn't have snapshots. Do you want to copy {} to {}? [yn]",
        tmp, refs
    );
    if !prompt.confirm(&question) {
        info!("Leaving new references in {}", tmp);
        return Ok(Promotion::Declined);
    }

    let files = sync_tree(&layout.tmp_dir, &layout.refs_dir)?;
    std::fs::remove_dir_all(&layout.tmp_dir)?;
    info!("Moved {} reference(s) from {} to {}", files, tmp, refs);
    Ok(Promotion::Promoted {
        files,
        tmp_removed: true,
    })
}

/// Copy every file below `from` to the same relative path below `to`
fn sync_tree(from: &Path, to: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Refuse to start over a staging tree left behind by an earlier run.
///
/// In master mode the user may have it removed first.
pub fn check_stale_tmp(
    layout: &RefLayout,
    mode: RunMode,
    auto_confirm: bool,
    prompt: &dyn Confirmation,
) -> Result<()> {
    let tmp = &layout.tmp_dir;
    if !tmp.exists() {
        return Ok(());
    }

    if mode.is_master() {
        let remove = auto_confirm
            || prompt.confirm(
                "Temporary snapshot dir tmp/ is still around. tmp/ can be removed if it has nothing you need. Should tmp/ be removed? [yn]",
            );
        if remove {
            std::fs::remove_dir_all(tmp)?;
            info!("Removed {}", tmp.display());
        }
    }

    if tmp.exists() {
        return Err(Error::StaleTmpDir(tmp.display().to_string()));
    }
    Ok(())
}

/// Remove the eq log and failed snapshots of a previous run
pub fn clean_previous_results(layout: &RefLayout) -> Result<()> {
    if layout.eq_log.exists() {
        std::fs::remove_file(&layout.eq_log)?;
    }
    if layout.results_dir.exists() {
        std::fs::remove_dir_all(&layout.results_dir)?;
    }
    Ok(())
}
