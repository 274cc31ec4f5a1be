//! On-disk layout of reference, staging and result trees

use std::path::{Path, PathBuf};

/// Default directory names, relative to the working directory of a run
pub const REFS_DIR: &str = "ref";
pub const REFS_TMP_DIR: &str = "tmp";
pub const TEST_RESULT_DIR: &str = "test_snapshots";
pub const EQ_LOG: &str = "eq.log";

/// Platform name used as the first path component of every tree.
///
/// Existing reference trees use the Node-style names, so macOS maps to
/// `darwin` and Windows to `win32`.
pub fn platform_name() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

/// Resolves `(platform, browser, task, page)` to paths in each tree
#[derive(Debug, Clone)]
pub struct RefLayout {
    pub refs_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub results_dir: PathBuf,
    pub eq_log: PathBuf,
    pub platform: String,
}

impl RefLayout {
    /// Layout rooted at `base` with the default directory names
    pub fn new(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            refs_dir: base.join(REFS_DIR),
            tmp_dir: base.join(REFS_TMP_DIR),
            results_dir: base.join(TEST_RESULT_DIR),
            eq_log: base.join(EQ_LOG),
            platform: platform_name().to_string(),
        }
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    fn task_dir(&self, root: &Path, browser: &str, task_id: &str) -> PathBuf {
        root.join(&self.platform).join(browser).join(task_id)
    }

    /// `ref/<platform>/<browser>/<task>/<page>.png`, page is 1-based
    pub fn reference_path(&self, browser: &str, task_id: &str, page: usize) -> PathBuf {
        self.task_dir(&self.refs_dir, browser, task_id)
            .join(format!("{}.png", page))
    }

    /// `tmp/<platform>/<browser>/<task>/<page>.png`
    pub fn staged_path(&self, browser: &str, task_id: &str, page: usize) -> PathBuf {
        self.task_dir(&self.tmp_dir, browser, task_id)
            .join(format!("{}.png", page))
    }

    /// Test rendering persisted after a failed comparison
    pub fn failed_snapshot_path(&self, browser: &str, task_id: &str, page: usize) -> PathBuf {
        self.task_dir(&self.results_dir, browser, task_id)
            .join(format!("{}.png", page))
    }

    /// Reference copy persisted next to the failed rendering
    pub fn failed_reference_path(&self, browser: &str, task_id: &str, page: usize) -> PathBuf {
        self.task_dir(&self.results_dir, browser, task_id)
            .join(format!("{}_ref.png", page))
    }
}
