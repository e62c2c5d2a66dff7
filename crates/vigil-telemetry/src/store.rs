//! Append-only metric store
//!
//! Provides:
//! - The `MetricStore` trait every backend implements
//! - `MemoryStore`, monthly partitions with time, dimension and outcome indexes
//!
//! Records are never updated in place. The only mutations are appends and
//! timestamp-cutoff purges.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use vigil_core::{MetricRecord, OperationClass, PartitionKey, Result, TimeWindow};

/// Storage backend for raw metric records
pub trait MetricStore: Send + Sync + 'static {
    /// Append one record
    fn append(&self, record: MetricRecord) -> Result<()>;

    /// All records of a class with a timestamp inside `window`, oldest first
    fn scan(&self, class: OperationClass, window: &TimeWindow) -> Result<Vec<MetricRecord>>;

    /// Records of a class matching one class-dimension value
    fn scan_dimension(
        &self,
        class: OperationClass,
        dimension: &str,
        window: &TimeWindow,
    ) -> Result<Vec<MetricRecord>>;

    /// Records of a class with the given outcome
    fn scan_outcome(
        &self,
        class: OperationClass,
        success: bool,
        window: &TimeWindow,
    ) -> Result<Vec<MetricRecord>>;

    /// Delete every record of a class with `timestamp < cutoff`
    fn purge_before(&self, class: OperationClass, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Number of stored records of a class
    fn count(&self, class: OperationClass) -> Result<u64>;

    /// Truncate every table (environment rebuild)
    fn reset(&self) -> Result<()>;

    /// Incremented on every `reset`
    fn generation(&self) -> u64;

    /// Push buffered writes to durable storage
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

type TimeKey = (DateTime<Utc>, u64);

/// One calendar month of one table
#[derive(Default)]
struct Partition {
    by_time: BTreeMap<TimeKey, Arc<MetricRecord>>,
    by_dimension: BTreeMap<(String, DateTime<Utc>, u64), Arc<MetricRecord>>,
    by_outcome: BTreeMap<(bool, DateTime<Utc>, u64), Arc<MetricRecord>>,
}

impl Partition {
    fn insert(&mut self, seq: u64, record: MetricRecord) {
        let ts = record.timestamp();
        let dimension = record.dimension();
        let success = record.success();
        let record = Arc::new(record);

        self.by_dimension
            .insert((dimension, ts, seq), Arc::clone(&record));
        self.by_outcome.insert((success, ts, seq), Arc::clone(&record));
        self.by_time.insert((ts, seq), record);
    }

    fn len(&self) -> usize {
        self.by_time.len()
    }

    /// Split off everything before `cutoff`, returning how many rows went
    fn purge_before(&mut self, cutoff: DateTime<Utc>) -> u64 {
        let kept = self.by_time.split_off(&(cutoff, 0));
        let expired = std::mem::replace(&mut self.by_time, kept);

        for ((ts, seq), record) in &expired {
            self.by_dimension.remove(&(record.dimension(), *ts, *seq));
            self.by_outcome.remove(&(record.success(), *ts, *seq));
        }

        expired.len() as u64
    }
}

/// Sequence numbers start at 1 so that `(ts, 0)` is a strict lower bound
fn time_bounds(window: &TimeWindow) -> (Bound<TimeKey>, Bound<TimeKey>) {
    (
        Bound::Included((window.start, 0)),
        Bound::Excluded((window.end, 0)),
    )
}

#[derive(Default)]
struct Table {
    partitions: RwLock<BTreeMap<PartitionKey, Arc<RwLock<Partition>>>>,
}

impl Table {
    /// Partitions overlapping a window, cloned out so the table lock is
    /// released before any partition is read
    fn overlapping(&self, window: &TimeWindow) -> Vec<Arc<RwLock<Partition>>> {
        match window.partition_range() {
            Some(range) => self
                .partitions
                .read()
                .range(range)
                .map(|(_, p)| Arc::clone(p))
                .collect(),
            None => Vec::new(),
        }
    }
}

/// In-process store with monthly partitions per table
pub struct MemoryStore {
    tables: [Table; 4],
    seq: AtomicU64,
    generation: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            tables: Default::default(),
            seq: AtomicU64::new(1),
            generation: AtomicU64::new(0),
        }
    }

    fn table(&self, class: OperationClass) -> &Table {
        match class {
            OperationClass::SecurityOperation => &self.tables[0],
            OperationClass::Encryption => &self.tables[1],
            OperationClass::AuditLog => &self.tables[2],
            OperationClass::KeyRotation => &self.tables[3],
        }
    }

    /// Partition keys currently holding rows of a class
    pub fn partition_keys(&self, class: OperationClass) -> Vec<PartitionKey> {
        self.table(class).partitions.read().keys().copied().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricStore for MemoryStore {
    fn append(&self, record: MetricRecord) -> Result<()> {
        let table = self.table(record.class());
        let key = PartitionKey::from_timestamp(record.timestamp());
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        let partition = {
            let existing = table.partitions.read().get(&key).cloned();
            match existing {
                Some(p) => p,
                None => Arc::clone(table.partitions.write().entry(key).or_default()),
            }
        };

        partition.write().insert(seq, record);
        Ok(())
    }

    fn scan(&self, class: OperationClass, window: &TimeWindow) -> Result<Vec<MetricRecord>> {
        let mut out = Vec::new();
        for partition in self.table(class).overlapping(window) {
            let partition = partition.read();
            out.extend(
                partition
                    .by_time
                    .range(time_bounds(window))
                    .map(|(_, r)| r.as_ref().clone()),
            );
        }
        Ok(out)
    }

    fn scan_dimension(
        &self,
        class: OperationClass,
        dimension: &str,
        window: &TimeWindow,
    ) -> Result<Vec<MetricRecord>> {
        let lower = (dimension.to_string(), window.start, 0);
        let upper = (dimension.to_string(), window.end, 0);

        let mut out = Vec::new();
        for partition in self.table(class).overlapping(window) {
            let partition = partition.read();
            out.extend(
                partition
                    .by_dimension
                    .range((Bound::Included(lower.clone()), Bound::Excluded(upper.clone())))
                    .map(|(_, r)| r.as_ref().clone()),
            );
        }
        Ok(out)
    }

    fn scan_outcome(
        &self,
        class: OperationClass,
        success: bool,
        window: &TimeWindow,
    ) -> Result<Vec<MetricRecord>> {
        let lower = (success, window.start, 0);
        let upper = (success, window.end, 0);

        let mut out = Vec::new();
        for partition in self.table(class).overlapping(window) {
            let partition = partition.read();
            out.extend(
                partition
                    .by_outcome
                    .range((Bound::Included(lower), Bound::Excluded(upper)))
                    .map(|(_, r)| r.as_ref().clone()),
            );
        }
        Ok(out)
    }

    fn purge_before(&self, class: OperationClass, cutoff: DateTime<Utc>) -> Result<u64> {
        let table = self.table(class);
        let cutoff_key = PartitionKey::from_timestamp(cutoff);
        let mut purged = 0u64;

        // Whole months before the cutoff month are unlinked in one step.
        let expired: Vec<PartitionKey> = table
            .partitions
            .read()
            .range(..cutoff_key)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            let removed = table.partitions.write().remove(&key);
            if let Some(partition) = removed {
                purged += partition.read().len() as u64;
            }
        }

        // The straddling month is filtered under its own lock only. It stays
        // linked even when emptied, since an append may already hold it.
        let straddling = table.partitions.read().get(&cutoff_key).cloned();
        if let Some(partition) = straddling {
            purged += partition.write().purge_before(cutoff);
        }

        Ok(purged)
    }

    fn count(&self, class: OperationClass) -> Result<u64> {
        Ok(self
            .table(class)
            .partitions
            .read()
            .values()
            .map(|p| p.read().len() as u64)
            .sum())
    }

    fn reset(&self) -> Result<()> {
        for table in &self.tables {
            table.partitions.write().clear();
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Store whose reads fail or stall on demand
#[cfg(test)]
pub(crate) struct FaultyStore {
    inner: MemoryStore,
    failing: std::sync::atomic::AtomicBool,
    read_delay_ms: AtomicU64,
}

#[cfg(test)]
impl FaultyStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            failing: std::sync::atomic::AtomicBool::new(false),
            read_delay_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn set_read_delay(&self, delay: std::time::Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn read(&self) -> Result<()> {
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(std::time::Duration::from_millis(delay));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(vigil_core::Error::internal("storage volume offline"));
        }
        Ok(())
    }
}

#[cfg(test)]
impl MetricStore for FaultyStore {
    fn append(&self, record: MetricRecord) -> Result<()> {
        self.inner.append(record)
    }

    fn scan(&self, class: OperationClass, window: &TimeWindow) -> Result<Vec<MetricRecord>> {
        self.read()?;
        self.inner.scan(class, window)
    }

    fn scan_dimension(
        &self,
        class: OperationClass,
        dimension: &str,
        window: &TimeWindow,
    ) -> Result<Vec<MetricRecord>> {
        self.read()?;
        self.inner.scan_dimension(class, dimension, window)
    }

    fn scan_outcome(
        &self,
        class: OperationClass,
        success: bool,
        window: &TimeWindow,
    ) -> Result<Vec<MetricRecord>> {
        self.read()?;
        self.inner.scan_outcome(class, success, window)
    }

    fn purge_before(&self, class: OperationClass, cutoff: DateTime<Utc>) -> Result<u64> {
        self.inner.purge_before(class, cutoff)
    }

    fn count(&self, class: OperationClass) -> Result<u64> {
        self.inner.count(class)
    }

    fn reset(&self) -> Result<()> {
        self.inner.reset()
    }

    fn generation(&self) -> u64 {
        self.inner.generation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use vigil_core::{CryptoOperation, EncryptionMetric, KeyRotationMetric, OperationMetric};

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn op(name: &str, success: bool, at: DateTime<Utc>) -> MetricRecord {
        OperationMetric::new(name, 10.0, success).at(at).into()
    }

    #[test]
    fn test_scan_spans_partitions_in_order() {
        let store = MemoryStore::new();
        store.append(op("b", true, ts(2024, 2, 3))).unwrap();
        store.append(op("a", true, ts(2024, 1, 30))).unwrap();
        store.append(op("c", true, ts(2024, 3, 1))).unwrap();

        assert_eq!(
            store.partition_keys(OperationClass::SecurityOperation),
            vec![PartitionKey::new(2024, 1), PartitionKey::new(2024, 2), PartitionKey::new(2024, 3)]
        );

        let window = TimeWindow::new(ts(2024, 1, 1), ts(2024, 3, 1));
        let names: Vec<_> = store
            .scan(OperationClass::SecurityOperation, &window)
            .unwrap()
            .iter()
            .map(|r| r.dimension())
            .collect();
        // March 1st noon is exactly the exclusive end
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_dimension_and_outcome_indexes() {
        let store = MemoryStore::new();
        let base = ts(2024, 5, 10);
        for i in 0..6 {
            let record: MetricRecord = EncryptionMetric::new(
                if i % 2 == 0 { "AES-256-GCM" } else { "ChaCha20-Poly1305" },
                256,
                CryptoOperation::Encrypt,
                128,
                5.0,
                i != 3,
            )
            .at(base + Duration::minutes(i))
            .into();
            store.append(record).unwrap();
        }

        let window = TimeWindow::last_hours(base + Duration::hours(1), 2);
        let aes = store
            .scan_dimension(OperationClass::Encryption, "AES-256-GCM/256/encrypt", &window)
            .unwrap();
        assert_eq!(aes.len(), 3);
        assert!(aes.windows(2).all(|w| w[0].timestamp() <= w[1].timestamp()));

        let failed = store
            .scan_outcome(OperationClass::Encryption, false, &window)
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].timestamp(), base + Duration::minutes(3));
    }

    #[test]
    fn test_purge_before_drops_and_filters() {
        let store = MemoryStore::new();
        let cutoff = ts(2024, 4, 15);
        store.append(op("old-month", true, ts(2024, 2, 1))).unwrap();
        store.append(op("same-month-old", true, ts(2024, 4, 1))).unwrap();
        store.append(op("same-month-new", false, ts(2024, 4, 20))).unwrap();
        store.append(op("next-month", true, ts(2024, 5, 2))).unwrap();

        let purged = store
            .purge_before(OperationClass::SecurityOperation, cutoff)
            .unwrap();
        assert_eq!(purged, 2);
        assert_eq!(store.count(OperationClass::SecurityOperation).unwrap(), 2);

        let everything = TimeWindow::before(ts(2030, 1, 1));
        let outcome = store
            .scan_outcome(OperationClass::SecurityOperation, true, &everything)
            .unwrap();
        assert_eq!(outcome.len(), 1);
        assert_eq!(outcome[0].dimension(), "next-month");

        // Nothing left to purge
        assert_eq!(
            store
                .purge_before(OperationClass::SecurityOperation, cutoff)
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_reset_bumps_generation() {
        let store = MemoryStore::new();
        store
            .append(KeyRotationMetric::new("api_key", "k1", "k2", 100.0, true).into())
            .unwrap();
        assert_eq!(store.generation(), 0);

        store.reset().unwrap();
        assert_eq!(store.generation(), 1);
        assert_eq!(store.count(OperationClass::KeyRotation).unwrap(), 0);
    }

    #[test]
    fn test_concurrent_appends_need_no_external_locking() {
        let store = Arc::new(MemoryStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let name = format!("worker-{}", t);
                        store
                            .append(OperationMetric::new(name, i as f64, true).into())
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.count(OperationClass::SecurityOperation).unwrap(), 800);
    }
}
