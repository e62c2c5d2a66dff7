//! Rolling-window aggregation over the metric store
//!
//! Everything here is a pure function of a timestamp range. There is no
//! cursor or offset state, so re-running over the same data and window
//! yields the same rollups and late records are picked up on the next run.

use crate::store::MetricStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use vigil_core::{hour_bucket, Error, MetricRecord, OperationClass, Result, TimeWindow};

/// Hourly summary of one class dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyRollup {
    pub hour: DateTime<Utc>,
    pub class: OperationClass,
    /// operation_type, key_type, or `algorithm/key_size/operation`
    pub dimension: String,
    pub count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    /// Percentage, 0–100
    pub success_rate: f64,
}

/// Whole-window view of one class, input to health scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassWindowStats {
    pub class: OperationClass,
    pub count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Operations at or under the class latency threshold
    pub within_threshold: u64,
    /// Failures inside the recent-error sub-window
    pub recent_failures: u64,
    pub avg_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub max_duration_ms: f64,
}

impl ClassWindowStats {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Fraction 0–1; 1 when empty
    pub fn success_ratio(&self) -> f64 {
        ratio(self.success_count, self.count)
    }

    /// Fraction 0–1; 1 when empty
    pub fn within_threshold_ratio(&self) -> f64 {
        ratio(self.within_threshold, self.count)
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        part as f64 / total as f64
    }
}

#[derive(Default)]
struct Accumulator {
    count: u64,
    success: u64,
    total_ms: f64,
    min_ms: f64,
    max_ms: f64,
}

impl Accumulator {
    fn add(&mut self, record: &MetricRecord) {
        let ms = record.duration_ms();
        if self.count == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.count += 1;
        self.total_ms += ms;
        if record.success() {
            self.success += 1;
        }
    }
}

/// Read-only rollup engine
#[derive(Clone)]
pub struct Aggregator {
    store: Arc<dyn MetricStore>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn MetricStore>) -> Self {
        Self { store }
    }

    fn scan(&self, class: OperationClass, window: &TimeWindow) -> Result<Vec<MetricRecord>> {
        self.store
            .scan(class, window)
            .map_err(|e| Error::aggregation(format!("{} scan failed: {}", class.table(), e)))
    }

    /// Hourly rollups for every class, ordered by hour, class, dimension
    pub fn hourly_rollups(&self, window: &TimeWindow) -> Result<Vec<HourlyRollup>> {
        let mut out = Vec::new();
        for class in OperationClass::ALL {
            out.extend(self.class_rollups(class, window)?);
        }
        out.sort_by(|a, b| {
            (a.hour, a.class, &a.dimension).cmp(&(b.hour, b.class, &b.dimension))
        });
        Ok(out)
    }

    /// Hourly rollups for one class
    pub fn class_rollups(
        &self,
        class: OperationClass,
        window: &TimeWindow,
    ) -> Result<Vec<HourlyRollup>> {
        let mut buckets: BTreeMap<(DateTime<Utc>, String), Accumulator> = BTreeMap::new();
        for record in self.scan(class, window)? {
            buckets
                .entry((hour_bucket(record.timestamp()), record.dimension()))
                .or_default()
                .add(&record);
        }

        Ok(buckets
            .into_iter()
            .map(|((hour, dimension), acc)| HourlyRollup {
                hour,
                class,
                dimension,
                count: acc.count,
                success_count: acc.success,
                failure_count: acc.count - acc.success,
                avg_duration_ms: acc.total_ms / acc.count as f64,
                min_duration_ms: acc.min_ms,
                max_duration_ms: acc.max_ms,
                success_rate: acc.success as f64 * 100.0 / acc.count as f64,
            })
            .collect())
    }

    /// Window statistics for one class against a latency threshold.
    ///
    /// `recent` bounds the failures counted as recent error volume.
    pub fn class_stats(
        &self,
        class: OperationClass,
        window: &TimeWindow,
        threshold_ms: f64,
        recent: &TimeWindow,
    ) -> Result<ClassWindowStats> {
        let records = self.scan(class, window)?;

        let mut acc = Accumulator::default();
        let mut within_threshold = 0;
        let mut recent_failures = 0;
        let mut durations = Vec::with_capacity(records.len());

        for record in &records {
            acc.add(record);
            durations.push(record.duration_ms());
            if record.duration_ms() <= threshold_ms {
                within_threshold += 1;
            }
            if !record.success() && recent.contains(record.timestamp()) {
                recent_failures += 1;
            }
        }

        Ok(ClassWindowStats {
            class,
            count: acc.count,
            success_count: acc.success,
            failure_count: acc.count - acc.success,
            within_threshold,
            recent_failures,
            avg_duration_ms: if acc.count == 0 {
                0.0
            } else {
                acc.total_ms / acc.count as f64
            },
            p95_duration_ms: percentile(&mut durations, 95.0),
            max_duration_ms: acc.max_ms,
        })
    }
}

/// Nearest-rank percentile; 0 for no samples
fn percentile(samples: &mut [f64], pct: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let index = (pct / 100.0 * (samples.len() - 1) as f64).round() as usize;
    samples[index.min(samples.len() - 1)]
}
