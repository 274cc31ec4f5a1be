//! Test manifest loading and filtering

use crate::error::{Error, Result};
use crate::types::Task;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// Filters applied to the manifest before a run
#[derive(Debug, Clone, Default)]
pub struct ManifestFilter {
    /// Explicitly requested task ids; every one of them must exist
    pub ids: Vec<String>,
    /// Keep tasks carrying this label
    pub label: Option<String>,
    /// Keep tasks with XFA enabled
    pub xfa_only: bool,
}

impl ManifestFilter {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.label.is_none() && !self.xfa_only
    }
}

/// The ordered task list of one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    tasks: Vec<Task>,
}

impl Manifest {
    /// Build a manifest from tasks, validating ids and round counts
    pub fn new(tasks: Vec<Task>) -> Result<Self> {
        let mut seen = HashSet::new();
        for task in &tasks {
            if task.id.is_empty() {
                return Err(Error::InvalidManifest("task with empty id".to_string()));
            }
            if !seen.insert(task.id.as_str()) {
                return Err(Error::InvalidManifest(format!(
                    "duplicate task id: {}",
                    task.id
                )));
            }
            if task.rounds == 0 {
                return Err(Error::InvalidManifest(format!(
                    "task {} has zero rounds",
                    task.id
                )));
            }
        }
        Ok(Self { tasks })
    }

    /// Parse a JSON array of tasks
    pub fn from_json(json: &str) -> Result<Self> {
        let tasks: Vec<Task> = serde_json::from_str(json)?;
        Self::new(tasks)
    }

    /// Load a manifest file from disk
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let manifest = Self::from_json(&content)?;
        debug!("Loaded {} task(s) from {}", manifest.len(), path.display());
        Ok(manifest)
    }

    /// Apply id/label/xfa filters.
    ///
    /// A task is kept when any filter selects it. Requested ids that match
    /// no task make the whole run invalid.
    pub fn filter(self, filter: &ManifestFilter) -> Result<Self> {
        if filter.is_empty() {
            return Ok(self);
        }

        let mut unmatched: Vec<String> = filter.ids.clone();
        let tasks: Vec<Task> = self
            .tasks
            .into_iter()
            .filter(|task| {
                if let Some(pos) = unmatched.iter().position(|id| *id == task.id) {
                    unmatched.remove(pos);
                    return true;
                }
                if let Some(label) = &filter.label {
                    if task.labels.contains(label) {
                        return true;
                    }
                }
                filter.xfa_only && task.enable_xfa
            })
            .collect();

        if !unmatched.is_empty() {
            return Err(Error::UnknownTaskIds(unmatched));
        }

        info!("Manifest filtered down to {} task(s)", tasks.len());
        Ok(Self { tasks })
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskType;

    const MANIFEST: &str = r#"[
        {"id": "tracemonkey-eq", "file": "pdfs/tracemonkey.pdf", "type": "eq", "labels": ["smoke"]},
        {"id": "tracemonkey-fbf", "file": "pdfs/tracemonkey.pdf", "type": "fbf", "rounds": 2},
        {"id": "xfa-form", "file": "pdfs/xfa.pdf", "type": "eq", "enableXfa": true},
        {"id": "issue1234", "file": "pdfs/issue1234.pdf", "type": "load", "labels": ["integration"]}
    ]"#;

    #[test]
    fn test_load_all() {
        let manifest = Manifest::from_json(MANIFEST).unwrap();
        assert_eq!(manifest.len(), 4);
        assert_eq!(manifest.get("tracemonkey-fbf").unwrap().rounds, 2);
        assert_eq!(manifest.get("issue1234").unwrap().kind, TaskType::Load);
    }

    #[test]
    fn test_empty_filter_keeps_everything() {
        let manifest = Manifest::from_json(MANIFEST).unwrap();
        let filtered = manifest.clone().filter(&ManifestFilter::default()).unwrap();
        assert_eq!(filtered, manifest);
    }

    #[test]
    fn test_filter_by_id_label_and_xfa() {
        let manifest = Manifest::from_json(MANIFEST).unwrap();

        let by_id = manifest
            .clone()
            .filter(&ManifestFilter {
                ids: vec!["tracemonkey-fbf".into()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_id.len(), 1);

        let by_label = manifest
            .clone()
            .filter(&ManifestFilter {
                label: Some("integration".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_label.tasks()[0].id, "issue1234");

        let xfa = manifest
            .filter(&ManifestFilter {
                xfa_only: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(xfa.len(), 1);
        assert_eq!(xfa.tasks()[0].id, "xfa-form");
    }

    #[test]
    fn test_unknown_ids_rejected() {
        let manifest = Manifest::from_json(MANIFEST).unwrap();
        let err = manifest
            .filter(&ManifestFilter {
                ids: vec!["tracemonkey-eq".into(), "nope".into(), "missing".into()],
                ..Default::default()
            })
            .unwrap_err();
        match err {
            Error::UnknownTaskIds(ids) => assert_eq!(ids, vec!["nope", "missing"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_ids_and_zero_rounds_rejected() {
        let dup = r#"[{"id": "a", "file": "a.pdf", "type": "eq"},
                      {"id": "a", "file": "b.pdf", "type": "load"}]"#;
        assert!(matches!(
            Manifest::from_json(dup),
            Err(Error::InvalidManifest(_))
        ));

        let zero = r#"[{"id": "a", "file": "a.pdf", "type": "fbf", "rounds": 0}]"#;
        assert!(matches!(
            Manifest::from_json(zero),
            Err(Error::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_manifest.json");
        std::fs::write(&path, MANIFEST).unwrap();
        assert_eq!(Manifest::load(&path).unwrap().len(), 4);
        assert!(matches!(
            Manifest::load(&dir.path().join("absent.json")),
            Err(Error::Io(_))
        ));
    }
}
