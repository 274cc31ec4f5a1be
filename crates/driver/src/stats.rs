//! Per-page timing statistics reported by the runner

use parking_lot::Mutex;
use reftest_common::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// One `stats` payload, tagged with where it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsEntry {
    pub browser: String,
    pub pdf: String,
    /// 0-based page index
    pub page: usize,
    pub round: usize,
    pub stats: serde_json::Value,
}

/// Collects stats entries in arrival order
#[derive(Debug, Default)]
pub struct StatsCollector {
    entries: Mutex<Vec<StatsEntry>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: StatsEntry) {
        self.entries.lock().push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<StatsEntry> {
        self.entries.lock().clone()
    }

    /// Write all entries as a JSON array
    pub fn write(&self, path: &Path) -> Result<()> {
        let entries = self.entries();
        std::fs::write(path, serde_json::to_string_pretty(&entries)?)?;
        info!("Wrote {} stats entries to {}", entries.len(), path.display());
        Ok(())
    }
}
