//! Metric sink persistence layer
//!
//! Provides file-based persistence for metric records with:
//! - JSON-lines format for append-only writes
//! - One file per table per calendar month
//!   (`<data_dir>/<table>/<table>_y2024m05.jsonl`)
//! - An in-memory index rebuilt from the files on open
//! - Timestamp-cutoff purges that drop or rewrite whole partition files

use crate::store::{MemoryStore, MetricStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use vigil_core::{MetricRecord, OperationClass, PartitionKey, Result, TimeWindow};

/// Configuration for metric persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Directory holding one sub-directory per table
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Flush to disk after this many records
    #[serde(default = "default_flush_interval")]
    pub flush_interval: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            flush_interval: default_flush_interval(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./telemetry")
}

fn default_flush_interval() -> usize {
    16
}

struct PartitionWriter {
    file: BufWriter<File>,
    since_flush: usize,
}

/// JSONL-backed store with monthly partition files
pub struct JsonlStore {
    config: PersistenceConfig,
    index: MemoryStore,
    writers: Mutex<HashMap<(OperationClass, PartitionKey), PartitionWriter>>,
}

impl JsonlStore {
    /// Open (or create) a store rooted at `config.data_dir`
    pub fn open(config: PersistenceConfig) -> Result<Self> {
        let store = Self {
            index: MemoryStore::new(),
            writers: Mutex::new(HashMap::new()),
            config,
        };

        let mut loaded = 0usize;
        for class in OperationClass::ALL {
            let dir = store.table_dir(class);
            std::fs::create_dir_all(&dir)?;
            for (_, path) in partition_files(&dir, class)? {
                loaded += store.load_partition(&path)?;
            }
        }

        info!(
            "Metric store opened at {:?} with {} records",
            store.config.data_dir, loaded
        );
        Ok(store)
    }

    fn table_dir(&self, class: OperationClass) -> PathBuf {
        self.config.data_dir.join(class.table())
    }

    fn partition_path(&self, class: OperationClass, key: PartitionKey) -> PathBuf {
        self.table_dir(class)
            .join(format!("{}_{}.jsonl", class.table(), key))
    }

    fn load_partition(&self, path: &Path) -> Result<usize> {
        let reader = BufReader::new(File::open(path)?);
        let mut loaded = 0;

        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<MetricRecord>(&line) {
                Ok(record) => {
                    self.index.append(record)?;
                    loaded += 1;
                }
                Err(e) => {
                    debug!("Skipping malformed metric record in {:?}: {}", path, e);
                }
            }
        }

        Ok(loaded)
    }

    /// Keep only lines at or after `cutoff`, replacing the file atomically
    fn rewrite_partition(&self, path: &Path, cutoff: DateTime<Utc>) -> Result<()> {
        let tmp_path = path.with_extension("jsonl.tmp");
        {
            let reader = BufReader::new(File::open(path)?);
            let mut out = BufWriter::new(File::create(&tmp_path)?);
            for line in reader.lines() {
                let line = line?;
                let keep = match serde_json::from_str::<MetricRecord>(&line) {
                    Ok(record) => record.timestamp() >= cutoff,
                    Err(_) => false,
                };
                if keep {
                    writeln!(out, "{}", line)?;
                }
            }
            out.flush()?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

impl MetricStore for JsonlStore {
    fn append(&self, record: MetricRecord) -> Result<()> {
        let class = record.class();
        let key = PartitionKey::from_timestamp(record.timestamp());
        let line = format!("{}\n", serde_json::to_string(&record)?);

        {
            let mut writers = self.writers.lock();
            let writer = match writers.entry((class, key)) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => {
                    let path = self.partition_path(class, key);
                    let file = OpenOptions::new().create(true).append(true).open(&path)?;
                    debug!("Opened metric partition {:?}", path);
                    e.insert(PartitionWriter {
                        file: BufWriter::new(file),
                        since_flush: 0,
                    })
                }
            };

            writer.file.write_all(line.as_bytes())?;
            writer.since_flush += 1;
            if writer.since_flush >= self.config.flush_interval {
                writer.file.flush()?;
                writer.since_flush = 0;
            }
        }

        self.index.append(record)
    }

    fn scan(&self, class: OperationClass, window: &TimeWindow) -> Result<Vec<MetricRecord>> {
        self.index.scan(class, window)
    }

    fn scan_dimension(
        &self,
        class: OperationClass,
        dimension: &str,
        window: &TimeWindow,
    ) -> Result<Vec<MetricRecord>> {
        self.index.scan_dimension(class, dimension, window)
    }

    fn scan_outcome(
        &self,
        class: OperationClass,
        success: bool,
        window: &TimeWindow,
    ) -> Result<Vec<MetricRecord>> {
        self.index.scan_outcome(class, success, window)
    }

    fn purge_before(&self, class: OperationClass, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff_key = PartitionKey::from_timestamp(cutoff);

        for (key, path) in partition_files(&self.table_dir(class), class)? {
            if key > cutoff_key {
                continue;
            }

            // Appends to this one file wait; every other partition keeps going.
            let mut writers = self.writers.lock();
            if let Some(mut writer) = writers.remove(&(class, key)) {
                writer.file.flush()?;
            }

            if key < cutoff_key {
                std::fs::remove_file(&path)?;
                info!("Removed expired metric partition: {:?}", path);
            } else {
                self.rewrite_partition(&path, cutoff)?;
                debug!("Rewrote metric partition {:?} at cutoff {}", path, cutoff);
            }
        }

        self.index.purge_before(class, cutoff)
    }

    fn count(&self, class: OperationClass) -> Result<u64> {
        self.index.count(class)
    }

    fn reset(&self) -> Result<()> {
        let mut writers = self.writers.lock();
        writers.clear();

        for class in OperationClass::ALL {
            for (_, path) in partition_files(&self.table_dir(class), class)? {
                std::fs::remove_file(&path)?;
            }
        }
        warn!("Metric store at {:?} was reset", self.config.data_dir);

        self.index.reset()
    }

    fn generation(&self) -> u64 {
        self.index.generation()
    }

    fn flush(&self) -> Result<()> {
        let mut writers = self.writers.lock();
        for writer in writers.values_mut() {
            writer.file.flush()?;
            writer.since_flush = 0;
        }
        Ok(())
    }
}

impl Drop for JsonlStore {
    fn drop(&mut self) {
        if let Err(e) = MetricStore::flush(self) {
            warn!("Failed to flush metric store on drop: {}", e);
        }
    }
}

/// Partition files of a table directory, oldest first
fn partition_files(dir: &Path, class: OperationClass) -> Result<Vec<(PartitionKey, PathBuf)>> {
    let prefix = format!("{}_", class.table());
    let mut files = Vec::new();

    if !dir.exists() {
        return Ok(files);
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.extension().is_some_and(|e| e == "jsonl") {
            continue;
        }
        let key = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix(prefix.as_str()))
            .and_then(PartitionKey::parse_suffix);
        if let Some(key) = key {
            files.push((key, path));
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;
    use vigil_core::{AuditLogMetric, KeyRotationMetric, OperationMetric};

    fn test_config(dir: &Path) -> PersistenceConfig {
        PersistenceConfig {
            data_dir: dir.to_path_buf(),
            flush_interval: 1,
        }
    }

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 8, 30, 0).unwrap()
    }

    #[test]
    fn test_write_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path());

        {
            let store = JsonlStore::open(config.clone()).unwrap();
            store
                .append(OperationMetric::new("session_check", 12.0, true).at(ts(2024, 1, 3)).into())
                .unwrap();
            store
                .append(AuditLogMetric::new("append", 512, Some(4), 3.0, true).at(ts(2024, 2, 9)).into())
                .unwrap();
        }

        let table_dir = temp_dir.path().join("security_operation_metrics");
        assert!(table_dir
            .join("security_operation_metrics_y2024m01.jsonl")
            .exists());

        let store = JsonlStore::open(config).unwrap();
        assert_eq!(store.count(OperationClass::SecurityOperation).unwrap(), 1);
        assert_eq!(store.count(OperationClass::AuditLog).unwrap(), 1);

        let window = TimeWindow::new(ts(2024, 2, 1), ts(2024, 3, 1));
        let audits = store.scan(OperationClass::AuditLog, &window).unwrap();
        assert_eq!(audits.len(), 1);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path());

        {
            let store = JsonlStore::open(config.clone()).unwrap();
            store
                .append(KeyRotationMetric::new("db", "a", "b", 40.0, true).at(ts(2024, 6, 1)).into())
                .unwrap();
        }

        let path = temp_dir
            .path()
            .join("key_rotation_metrics")
            .join("key_rotation_metrics_y2024m06.jsonl");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();

        let store = JsonlStore::open(config).unwrap();
        assert_eq!(store.count(OperationClass::KeyRotation).unwrap(), 1);
    }

    #[test]
    fn test_purge_removes_and_rewrites_partitions() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path());
        let cutoff = ts(2024, 4, 15);

        let store = JsonlStore::open(config.clone()).unwrap();
        for at in [ts(2024, 3, 2), ts(2024, 4, 2), ts(2024, 4, 20)] {
            store
                .append(OperationMetric::new("login", 5.0, true).at(at).into())
                .unwrap();
        }

        let purged = store
            .purge_before(OperationClass::SecurityOperation, cutoff)
            .unwrap();
        assert_eq!(purged, 2);

        let dir = temp_dir.path().join("security_operation_metrics");
        assert!(!dir.join("security_operation_metrics_y2024m03.jsonl").exists());
        assert!(dir.join("security_operation_metrics_y2024m04.jsonl").exists());

        // Writes continue into the rewritten partition
        store
            .append(
                OperationMetric::new("login", 5.0, true)
                    .at(cutoff + Duration::days(1))
                    .into(),
            )
            .unwrap();
        drop(store);

        let reopened = JsonlStore::open(config).unwrap();
        assert_eq!(reopened.count(OperationClass::SecurityOperation).unwrap(), 2);
    }

    #[test]
    fn test_reset_removes_files() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(temp_dir.path());

        let store = JsonlStore::open(config.clone()).unwrap();
        store
            .append(OperationMetric::new("login", 5.0, true).into())
            .unwrap();
        store.reset().unwrap();
        assert_eq!(store.generation(), 1);
        drop(store);

        let reopened = JsonlStore::open(config).unwrap();
        assert_eq!(reopened.count(OperationClass::SecurityOperation).unwrap(), 0);
    }
}
