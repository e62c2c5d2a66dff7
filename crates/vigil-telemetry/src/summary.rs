//! Mutable summary table: one row of current derived state per metric type

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use vigil_core::{HealthSummary, Result, SummaryKind};

/// Summary rows keyed by metric type, optionally mirrored to a JSON file
pub struct SummaryTable {
    rows: RwLock<BTreeMap<SummaryKind, HealthSummary>>,
    path: Option<PathBuf>,
}

impl SummaryTable {
    /// Table that lives only in memory
    pub fn in_memory() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            path: None,
        }
    }

    /// Table persisted at `path`, loading existing rows if present
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut rows = BTreeMap::new();

        if path.exists() {
            let content = std::fs::read(&path)?;
            let stored: Vec<HealthSummary> = serde_json::from_slice(&content)?;
            for row in stored {
                rows.insert(row.metric_type, row);
            }
            debug!("Loaded {} summary rows from {:?}", rows.len(), path);
        }

        Ok(Self {
            rows: RwLock::new(rows),
            path: Some(path),
        })
    }

    /// Overwrite the row for `kind`.
    ///
    /// Returns `false` and leaves the row alone when `at` is older than the
    /// stored `last_updated`.
    pub fn upsert(
        &self,
        kind: SummaryKind,
        value: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut rows = self.rows.write();
        if rows.get(&kind).is_some_and(|row| row.last_updated > at) {
            debug!("Ignoring stale {} summary from {}", kind.as_str(), at);
            return Ok(false);
        }
        rows.insert(
            kind,
            HealthSummary {
                metric_type: kind,
                value,
                last_updated: at,
            },
        );

        // Rewritten under the lock so the file never lags the rows
        if let Some(path) = &self.path {
            let snapshot: Vec<HealthSummary> = rows.values().cloned().collect();
            if let Err(e) = persist(path, &snapshot) {
                warn!("Failed to persist summary table to {:?}: {}", path, e);
            }
        }
        Ok(true)
    }

    pub fn get(&self, kind: SummaryKind) -> Option<HealthSummary> {
        self.rows.read().get(&kind).cloned()
    }

    pub fn all(&self) -> Vec<HealthSummary> {
        self.rows.read().values().cloned().collect()
    }
}

fn persist(path: &Path, rows: &[HealthSummary]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(rows)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_last_updated_never_goes_backwards() {
        let table = SummaryTable::in_memory();
        let now = Utc::now();

        assert!(table
            .upsert(SummaryKind::SystemHealthScore, json!({"score": 90.0}), now)
            .unwrap());
        assert!(!table
            .upsert(
                SummaryKind::SystemHealthScore,
                json!({"score": 10.0}),
                now - Duration::seconds(5)
            )
            .unwrap());

        let row = table.get(SummaryKind::SystemHealthScore).unwrap();
        assert_eq!(row.value["score"], 90.0);
        assert_eq!(row.last_updated, now);
    }

    #[test]
    fn test_rows_are_independent_per_kind() {
        let table = SummaryTable::in_memory();
        let now = Utc::now();
        table
            .upsert(SummaryKind::SystemHealthScore, json!(100), now)
            .unwrap();
        table
            .upsert(
                SummaryKind::PciComplianceStatus,
                json!("unknown"),
                now - Duration::hours(1),
            )
            .unwrap();
        assert_eq!(table.all().len(), 2);
    }

    #[test]
    fn test_persisted_rows_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("health_summary.json");

        {
            let table = SummaryTable::open(&path).unwrap();
            table
                .upsert(SummaryKind::PciComplianceStatus, json!({"status": "compliant"}), Utc::now())
                .unwrap();
        }

        let table = SummaryTable::open(&path).unwrap();
        let row = table.get(SummaryKind::PciComplianceStatus).unwrap();
        assert_eq!(row.value["status"], "compliant");
    }

    #[test]
    fn test_concurrent_upserts_persist_latest_rows() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("health_summary.json");
        let table = std::sync::Arc::new(SummaryTable::open(&path).unwrap());
        let base = Utc::now();

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let at = base + Duration::milliseconds(i * 8 + worker);
                        table
                            .upsert(SummaryKind::SystemHealthScore, json!({"worker": worker}), at)
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let in_memory = table.get(SummaryKind::SystemHealthScore).unwrap();
        assert_eq!(in_memory.last_updated, base + Duration::milliseconds(24 * 8 + 7));

        let reopened = SummaryTable::open(&path).unwrap();
        assert_eq!(reopened.get(SummaryKind::SystemHealthScore), Some(in_memory));
    }
}
