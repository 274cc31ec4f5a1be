//! Core types for reftest

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;

/// Prefix every snapshot data URL sent by the in-browser runner carries
pub const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// Failure text the runner reports when the optimized and unoptimized
/// renderings disagree. It is not fatal: comparison still runs.
pub const OPTIMIZED_RENDERING_DIFFERS: &str = "Optimized rendering differs";

/// Kind of check a task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Eq,
    Partial,
    Text,
    Highlight,
    Extract,
    Fbf,
    Load,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::Eq => write!(f, "eq"),
            TaskType::Partial => write!(f, "partial"),
            TaskType::Text => write!(f, "text"),
            TaskType::Highlight => write!(f, "highlight"),
            TaskType::Extract => write!(f, "extract"),
            TaskType::Fbf => write!(f, "fbf"),
            TaskType::Load => write!(f, "load"),
        }
    }
}

fn default_rounds() -> usize {
    1
}

/// A manifest entry. Keys the orchestrator does not interpret (checksums,
/// page ranges, download links) are kept in `extra` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TaskType,
    pub file: String,
    #[serde(default = "default_rounds")]
    pub rounds: usize,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub enable_xfa: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Task {
    pub fn new(id: impl Into<String>, kind: TaskType, file: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            file: file.into(),
            rounds: default_rounds(),
            labels: BTreeSet::new(),
            enable_xfa: false,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_rounds(mut self, rounds: usize) -> Self {
        self.rounds = rounds;
        self
    }

    pub fn with_xfa(mut self) -> Self {
        self.enable_xfa = true;
        self
    }

    /// Marker the fixture downloader leaves when a file could not be fetched
    pub fn error_marker_path(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(format!("{}.error", self.file))
    }
}

/// One page result as stored in a session slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    pub failure: Option<String>,
    pub snapshot: Option<String>,
    pub baseline_snapshot: Option<String>,
    pub viewport_width: f64,
    pub viewport_height: f64,
    pub output_scale: f64,
}

impl PageResult {
    /// Viewport descriptor used in eq log records, e.g. `(816x1056x1)`
    pub fn viewport_string(&self) -> String {
        format!(
            "({}x{}x{})",
            self.viewport_width, self.viewport_height, self.output_scale
        )
    }
}

/// Decode a `data:image/png;base64,` snapshot into raw PNG bytes.
///
/// Returns `None` when the string is not a PNG data URL or the payload is
/// not valid base64.
pub fn decode_snapshot(snapshot: &str) -> Option<Vec<u8>> {
    let payload = snapshot.strip_prefix(PNG_DATA_URL_PREFIX)?;
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .ok()
}

/// Encode PNG bytes as the data URL the runner would send
pub fn encode_snapshot(bytes: &[u8]) -> String {
    format!(
        "{}{}",
        PNG_DATA_URL_PREFIX,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// The runner reports "no failure" as `false`, `null` or omits the key.
fn deserialize_failure<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
        Some(serde_json::Value::Bool(true)) => Some("true".to_string()),
        _ => None,
    })
}

/// `POST /submit_task_results` body in reftest mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSubmission {
    pub browser: String,
    pub id: String,
    pub round: usize,
    /// 1-based page number
    pub page: usize,
    #[serde(default, deserialize_with = "deserialize_failure")]
    pub failure: Option<String>,
    #[serde(default)]
    pub snapshot: Option<String>,
    #[serde(default)]
    pub baseline_snapshot: Option<String>,
    #[serde(default)]
    pub viewport_width: f64,
    #[serde(default)]
    pub viewport_height: f64,
    #[serde(default)]
    pub output_scale: f64,
    pub last_page_num: usize,
    pub number_of_tasks: usize,
    #[serde(default)]
    pub stats: Option<serde_json::Value>,
}

impl TaskSubmission {
    /// Split off the part of the payload that is stored in the slot
    pub fn page_result(&self) -> PageResult {
        PageResult {
            failure: self.failure.clone(),
            snapshot: self.snapshot.clone(),
            baseline_snapshot: self.baseline_snapshot.clone(),
            viewport_width: self.viewport_width,
            viewport_height: self.viewport_height,
            output_scale: self.output_scale,
        }
    }
}

/// `POST /submit_task_results` body in unit/font test mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitTestReport {
    pub browser: String,
    pub status: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl UnitTestReport {
    pub fn is_failure(&self) -> bool {
        self.status == "TEST-UNEXPECTED-FAIL"
    }
}

/// `POST /info` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoMessage {
    pub message: String,
}

/// `POST /tellMeToQuit` body (the browser may also come as a query param)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuitRequest {
    #[serde(default)]
    pub browser: Option<String>,
}

/// Per-session counters, summed by the finalizer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub num_runs: usize,
    pub num_errors: usize,
    pub num_fbf_failures: usize,
    pub num_eq_failures: usize,
    pub num_eq_no_snapshot: usize,
}

impl SessionCounters {
    /// Failures that block master-mode reference promotion
    pub fn num_fatal_failures(&self) -> usize {
        self.num_errors + self.num_fbf_failures
    }
}

impl std::ops::AddAssign for SessionCounters {
    fn add_assign(&mut self, other: Self) {
        self.num_runs += other.num_runs;
        self.num_errors += other.num_errors;
        self.num_fbf_failures += other.num_fbf_failures;
        self.num_eq_failures += other.num_eq_failures;
        self.num_eq_no_snapshot += other.num_eq_no_snapshot;
    }
}

/// Final classification of one evaluated task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Passed,
    /// Failures on a fixture that was never downloaded
    Skipped,
    EqFailure,
    FbfFailure,
    Error,
}

impl TaskOutcome {
    /// Count this outcome. Exactly one failure counter moves per task.
    pub fn record(&self, counters: &mut SessionCounters) {
        counters.num_runs += 1;
        match self {
            TaskOutcome::Passed | TaskOutcome::Skipped => {}
            TaskOutcome::EqFailure => counters.num_eq_failures += 1,
            TaskOutcome::FbfFailure => counters.num_fbf_failures += 1,
            TaskOutcome::Error => counters.num_errors += 1,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TaskOutcome::EqFailure | TaskOutcome::FbfFailure | TaskOutcome::Error
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_defaults() {
        let task: Task = serde_json::from_str(
            r#"{"id": "tracemonkey", "file": "pdfs/tracemonkey.pdf", "md5": "9a19", "type": "eq"}"#,
        )
        .unwrap();
        assert_eq!(task.rounds, 1);
        assert_eq!(task.kind, TaskType::Eq);
        assert!(task.labels.is_empty());
        assert!(!task.enable_xfa);
        assert_eq!(task.extra.get("md5").and_then(|v| v.as_str()), Some("9a19"));
    }

    #[test]
    fn test_submission_failure_false_is_none() {
        let sub: TaskSubmission = serde_json::from_str(
            r#"{"browser": "firefox", "id": "a", "round": 0, "page": 2,
                "failure": false, "snapshot": "data:image/png;base64,AAAA",
                "viewportWidth": 612, "viewportHeight": 792, "outputScale": 1.5,
                "lastPageNum": 2, "numberOfTasks": 2}"#,
        )
        .unwrap();
        assert_eq!(sub.failure, None);
        assert_eq!(sub.page, 2);
        assert_eq!(sub.page_result().viewport_string(), "(612x792x1.5)");
    }

    #[test]
    fn test_submission_failure_string() {
        let sub: TaskSubmission = serde_json::from_str(
            r#"{"browser": "chrome", "id": "a", "round": 0, "page": 1,
                "failure": "render : bad XRef", "lastPageNum": 1, "numberOfTasks": 1}"#,
        )
        .unwrap();
        assert_eq!(sub.failure.as_deref(), Some("render : bad XRef"));
        assert_eq!(sub.snapshot, None);
    }

    #[test]
    fn test_snapshot_data_url() {
        let url = encode_snapshot(b"\x89PNG\r\n");
        assert!(url.starts_with(PNG_DATA_URL_PREFIX));
        assert_eq!(decode_snapshot(&url).unwrap(), b"\x89PNG\r\n");
        assert_eq!(decode_snapshot("data:image/jpeg;base64,AAAA"), None);
    }

    #[test]
    fn test_outcome_moves_one_counter() {
        let mut counters = SessionCounters::default();
        for outcome in [
            TaskOutcome::Passed,
            TaskOutcome::EqFailure,
            TaskOutcome::FbfFailure,
            TaskOutcome::Error,
            TaskOutcome::Skipped,
        ] {
            outcome.record(&mut counters);
        }
        assert_eq!(counters.num_runs, 5);
        assert_eq!(counters.num_eq_failures, 1);
        assert_eq!(counters.num_fbf_failures, 1);
        assert_eq!(counters.num_errors, 1);
        assert_eq!(counters.num_fatal_failures(), 2);
    }
}
