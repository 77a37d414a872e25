//! Audit artifacts for calculated plans
//!
//! Every successful calculation writes the raw migrate-plan array as a
//! timestamped JSON file into a configured directory for offline
//! inspection.

use crate::models::MigrationPlan;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Writes one JSON file per calculated plan
pub struct AuditWriter {
    dir: PathBuf,
}

impl AuditWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist the plan's entry array; returns the written path
    pub fn record(&self, plan: &MigrationPlan) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating audit dir {}", self.dir.display()))?;
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let path = self.dir.join(format!("migrate-plan-{stamp}.json"));
        let json = serde_json::to_vec_pretty(&plan.entries).context("serializing plan")?;
        std::fs::write(&path, json)
            .with_context(|| format!("writing audit file {}", path.display()))?;
        info!(path = %path.display(), entries = plan.entries.len(), "plan audit written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PlanEntry, PodId};

    #[test]
    fn record_writes_readable_entry_array() {
        let dir = tempfile::tempdir().unwrap();
        let writer = AuditWriter::new(dir.path());
        let plan = MigrationPlan {
            computed_at: 1700000000,
            entries: vec![PlanEntry {
                item: PodId::new("ns", "a"),
                from: "node1".into(),
                to: "node2".into(),
                priority: 1,
            }],
        };

        let path = writer.record(&plan).unwrap();
        assert!(path.exists());

        let written: Vec<PlanEntry> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, plan.entries);
    }

    #[test]
    fn record_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("audit/plans");
        let writer = AuditWriter::new(&nested);
        let plan = MigrationPlan {
            computed_at: 0,
            entries: vec![],
        };
        assert!(writer.record(&plan).is_ok());
        assert!(nested.exists());
    }
}
