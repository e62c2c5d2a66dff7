//! Payment-compliance posture evaluation
//!
//! A fixed policy set is evaluated straight from the fact tables:
//! - `key_rotation`: every key type was rotated successfully within the
//!   mandated interval
//! - `audit_continuity`: security work during the window is covered by an
//!   audit log write within the gap threshold
//! - `encryption_activity`: live traffic is accompanied by successful
//!   encryption
//! - `encryption_strength`: no encryption below the minimum key size
//!
//! Until the first determinate evaluation, missing history is reported as
//! `unknown`, and without any key rotation on record no other policy can
//! settle the posture. Afterwards missing history is judged (no rotation is
//! overdue, no traffic has no gaps) so the status only returns to `unknown`
//! after a store reset. The latest successful rotation per key type is
//! remembered so retention purges of old rotation rows do not read as missed
//! rotations. That state travels in the `pci_compliance_status` summary row
//! and is picked up again when a checker starts on a persisted table.

use crate::store::MetricStore;
use crate::summary::SummaryTable;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil_core::{
    days_before, saturating_sub, Error, MetricRecord, OperationClass, Result, SummaryKind,
    TimeWindow,
};

/// Compliance policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceConfig {
    /// Maximum age of the latest successful rotation per key type
    #[serde(default = "default_rotation_interval_days")]
    pub rotation_interval_days: i64,

    /// Longest allowed distance between security work and an audit write
    #[serde(default = "default_audit_gap_minutes")]
    pub audit_gap_minutes: i64,

    /// Window in which successful encryption must appear
    #[serde(default = "default_encryption_window_hours")]
    pub encryption_window_hours: i64,

    /// Window over which traffic, audit coverage and key sizes are checked
    #[serde(default = "default_evaluation_window_hours")]
    pub evaluation_window_hours: i64,

    /// Smallest acceptable key size in bits
    #[serde(default = "default_min_key_size")]
    pub min_key_size: u32,

    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    #[serde(default = "default_compute_budget_ms")]
    pub compute_budget_ms: u64,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            rotation_interval_days: default_rotation_interval_days(),
            audit_gap_minutes: default_audit_gap_minutes(),
            encryption_window_hours: default_encryption_window_hours(),
            evaluation_window_hours: default_evaluation_window_hours(),
            min_key_size: default_min_key_size(),
            refresh_interval_secs: default_refresh_interval_secs(),
            compute_budget_ms: default_compute_budget_ms(),
        }
    }
}

fn default_rotation_interval_days() -> i64 {
    90
}

fn default_audit_gap_minutes() -> i64 {
    15
}

fn default_encryption_window_hours() -> i64 {
    24
}

fn default_evaluation_window_hours() -> i64 {
    24
}

fn default_min_key_size() -> u32 {
    128
}

fn default_refresh_interval_secs() -> u64 {
    300
}

fn default_compute_budget_ms() -> u64 {
    2_000
}

/// Tri-state compliance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Compliant,
    NonCompliant,
    Unknown,
}

impl ComplianceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compliant => "compliant",
            Self::NonCompliant => "non_compliant",
            Self::Unknown => "unknown",
        }
    }

    /// Numeric encoding for gauges
    pub fn gauge_value(&self) -> f64 {
        match self {
            Self::Compliant => 1.0,
            Self::NonCompliant => 0.0,
            Self::Unknown => -1.0,
        }
    }

    /// Any non-compliant policy wins, then any unknown one
    pub fn combine(statuses: impl IntoIterator<Item = ComplianceStatus>) -> Self {
        let mut overall = Self::Compliant;
        for status in statuses {
            match status {
                Self::NonCompliant => return Self::NonCompliant,
                Self::Unknown => overall = Self::Unknown,
                Self::Compliant => {}
            }
        }
        overall
    }

    pub fn is_determinate(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policies in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompliancePolicy {
    KeyRotation,
    AuditContinuity,
    EncryptionActivity,
    EncryptionStrength,
}

impl CompliancePolicy {
    pub const ALL: [CompliancePolicy; 4] = [
        CompliancePolicy::KeyRotation,
        CompliancePolicy::AuditContinuity,
        CompliancePolicy::EncryptionActivity,
        CompliancePolicy::EncryptionStrength,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeyRotation => "key_rotation",
            Self::AuditContinuity => "audit_continuity",
            Self::EncryptionActivity => "encryption_activity",
            Self::EncryptionStrength => "encryption_strength",
        }
    }
}

/// Outcome of one policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyResult {
    pub policy: CompliancePolicy,
    pub status: ComplianceStatus,
    pub detail: String,
}

impl PolicyResult {
    fn new(policy: CompliancePolicy, status: ComplianceStatus, detail: impl Into<String>) -> Self {
        Self {
            policy,
            status,
            detail: detail.into(),
        }
    }
}

/// Body of the compliance endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub status: ComplianceStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub details: Vec<PolicyResult>,
    pub stale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComplianceReport {
    fn unknown(last_check: Option<DateTime<Utc>>, error: Option<String>) -> Self {
        Self {
            status: ComplianceStatus::Unknown,
            last_check,
            details: Vec::new(),
            stale: last_check.is_none(),
            error,
        }
    }
}

/// Body of the `pci_compliance_status` summary row
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ComplianceSnapshot {
    #[serde(flatten)]
    report: ComplianceReport,
    #[serde(default)]
    established: bool,
    #[serde(default)]
    rotation_history: RotationHistory,
}

struct CheckerState {
    last: Option<ComplianceReport>,
    /// A determinate status has been reached since the last store reset
    established: bool,
    generation: u64,
    /// Latest successful rotation seen per key type, kept across retention
    /// purges of the rotation table
    rotations: RotationHistory,
}

/// Key type to latest successful rotation; `None` when every attempt failed
type RotationHistory = BTreeMap<String, Option<DateTime<Utc>>>;

/// Stateful compliance evaluator
pub struct ComplianceChecker {
    store: Arc<dyn MetricStore>,
    config: ComplianceConfig,
    summaries: Arc<SummaryTable>,
    state: Mutex<CheckerState>,
}

impl ComplianceChecker {
    pub fn new(
        store: Arc<dyn MetricStore>,
        config: ComplianceConfig,
        summaries: Arc<SummaryTable>,
    ) -> Self {
        let generation = store.generation();
        let state = match restore(&summaries) {
            Some(snapshot) => {
                info!(
                    status = snapshot.report.status.as_str(),
                    key_types = snapshot.rotation_history.len(),
                    "Resuming compliance state from summary table"
                );
                CheckerState {
                    last: Some(ComplianceReport {
                        stale: true,
                        ..snapshot.report
                    }),
                    established: snapshot.established,
                    generation,
                    rotations: snapshot.rotation_history,
                }
            }
            None => CheckerState {
                last: None,
                established: false,
                generation,
                rotations: BTreeMap::new(),
            },
        };

        Self {
            store,
            config,
            summaries,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &ComplianceConfig {
        &self.config
    }

    /// Evaluate every policy at `now` and commit the result
    pub fn check_at(&self, now: DateTime<Utc>) -> ComplianceReport {
        let generation = self.store.generation();
        let (established, known) = {
            let mut state = self.state.lock();
            if state.generation != generation {
                info!("Metric store was reset, compliance status returns to unknown");
                state.generation = generation;
                state.established = false;
                state.last = None;
                state.rotations.clear();
            }
            (state.established, state.rotations.clone())
        };

        let (report, rotations) = match self.evaluate(now, established, known) {
            Ok((details, rotations)) => (
                ComplianceReport {
                    status: ComplianceStatus::combine(details.iter().map(|d| d.status)),
                    last_check: Some(now),
                    details,
                    stale: false,
                    error: None,
                },
                Some(rotations),
            ),
            Err(e) => {
                warn!("Compliance evaluation failed: {}", e);
                (ComplianceReport::unknown(Some(now), Some(e.to_string())), None)
            }
        };

        self.commit(report.clone(), generation, rotations);
        report
    }

    /// Evaluate under the execution budget; a timeout serves the last result
    pub async fn refresh(self: &Arc<Self>) -> ComplianceReport {
        let budget = std::time::Duration::from_millis(self.config.compute_budget_ms);
        let checker = Arc::clone(self);
        let now = Utc::now();

        let task = tokio::task::spawn_blocking(move || checker.check_at(now));
        match tokio::time::timeout(budget, task).await {
            Ok(Ok(report)) => report,
            Ok(Err(join_err)) => {
                let error = Error::internal(join_err.to_string());
                warn!("Compliance evaluation task failed: {}", error);
                ComplianceReport::unknown(Some(now), Some(error.to_string()))
            }
            Err(_) => {
                warn!(
                    "Compliance evaluation exceeded {}ms, serving last result",
                    self.config.compute_budget_ms
                );
                let mut report = self.current();
                report.stale = true;
                report.error = Some(Error::Timeout.to_string());
                report
            }
        }
    }

    /// Last committed report
    pub fn current(&self) -> ComplianceReport {
        self.state
            .lock()
            .last
            .clone()
            .unwrap_or_else(|| ComplianceReport::unknown(None, None))
    }

    /// Run `refresh` on a fixed interval until the task is aborted
    pub fn spawn_refresh_loop(self: Arc<Self>) -> JoinHandle<()> {
        let period = std::time::Duration::from_secs(self.config.refresh_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let report = self.refresh().await;
                debug!(status = %report.status, "Compliance status refreshed");
            }
        })
    }

    fn commit(&self, report: ComplianceReport, generation: u64, rotations: Option<RotationHistory>) {
        let snapshot = {
            let mut state = self.state.lock();
            if state.generation != generation {
                debug!("Discarding compliance result computed before a store reset");
                return;
            }
            let previous = state.last.as_ref().map(|r| r.status);
            if report.status.is_determinate() {
                state.established = true;
            }
            if previous.is_some_and(|p| p != report.status) {
                info!(
                    from = previous.map(|p| p.as_str()).unwrap_or("none"),
                    to = report.status.as_str(),
                    "Compliance status changed"
                );
            }
            if let Some(rotations) = rotations {
                state.rotations = rotations;
            }
            state.last = Some(report.clone());

            ComplianceSnapshot {
                report,
                established: state.established,
                rotation_history: state.rotations.clone(),
            }
        };

        if let Some(at) = snapshot.report.last_check {
            match serde_json::to_value(&snapshot) {
                Ok(value) => {
                    if let Err(e) = self.summaries.upsert(SummaryKind::PciComplianceStatus, value, at) {
                        warn!("Failed to write compliance summary: {}", e);
                    }
                }
                Err(e) => warn!("Failed to encode compliance summary: {}", e),
            }
        }
    }

    fn scan(&self, class: OperationClass, window: &TimeWindow) -> Result<Vec<MetricRecord>> {
        self.store
            .scan(class, window)
            .map_err(|e| Error::compliance(format!("{} scan failed: {}", class.table(), e)))
    }

    fn evaluate(
        &self,
        now: DateTime<Utc>,
        established: bool,
        known: RotationHistory,
    ) -> Result<(Vec<PolicyResult>, RotationHistory)> {
        let window = TimeWindow::last_hours(now, self.config.evaluation_window_hours);
        let operations = self.scan(OperationClass::SecurityOperation, &window)?;
        let encryptions = self.scan(OperationClass::Encryption, &window)?;

        let (rotation, rotations) = self.key_rotation(now, established, known)?;
        let settled = established || rotation.status.is_determinate();
        let mut details = vec![
            rotation,
            self.audit_continuity(now, &window, &operations, &encryptions, established)?,
            self.encryption_activity(now, &operations, &encryptions, established)?,
            self.encryption_strength(&encryptions, established),
        ];

        if !settled {
            for detail in details
                .iter_mut()
                .filter(|d| d.status == ComplianceStatus::NonCompliant)
            {
                detail.status = ComplianceStatus::Unknown;
                detail.detail = format!("{} (no key rotation history yet)", detail.detail);
            }
        }
        Ok((details, rotations))
    }

    fn key_rotation(
        &self,
        now: DateTime<Utc>,
        established: bool,
        mut latest: RotationHistory,
    ) -> Result<(PolicyResult, RotationHistory)> {
        let policy = CompliancePolicy::KeyRotation;
        let history = self.scan(OperationClass::KeyRotation, &TimeWindow::before(now))?;

        for record in &history {
            if let MetricRecord::KeyRotation(rotation) = record {
                let entry = latest.entry(rotation.key_type.clone()).or_insert(None);
                if rotation.success {
                    *entry = Some(entry.map_or(rotation.timestamp, |t| t.max(rotation.timestamp)));
                }
            }
        }

        if latest.is_empty() {
            let result = if established {
                PolicyResult::new(
                    policy,
                    ComplianceStatus::NonCompliant,
                    "no key rotation on record",
                )
            } else {
                PolicyResult::new(
                    policy,
                    ComplianceStatus::Unknown,
                    "no key rotation history yet",
                )
            };
            return Ok((result, latest));
        }

        let deadline = days_before(now, self.config.rotation_interval_days);
        let overdue: Vec<&str> = latest
            .iter()
            .filter(|(_, last)| last.map_or(true, |t| t < deadline))
            .map(|(key_type, _)| key_type.as_str())
            .collect();

        let result = if overdue.is_empty() {
            PolicyResult::new(
                policy,
                ComplianceStatus::Compliant,
                format!(
                    "{} key type(s) rotated within {} days",
                    latest.len(),
                    self.config.rotation_interval_days
                ),
            )
        } else {
            PolicyResult::new(
                policy,
                ComplianceStatus::NonCompliant,
                format!("rotation overdue for: {}", overdue.join(", ")),
            )
        };
        Ok((result, latest))
    }

    fn audit_continuity(
        &self,
        now: DateTime<Utc>,
        window: &TimeWindow,
        operations: &[MetricRecord],
        encryptions: &[MetricRecord],
        established: bool,
    ) -> Result<PolicyResult> {
        let policy = CompliancePolicy::AuditContinuity;
        let gap = Duration::try_minutes(self.config.audit_gap_minutes).ok_or_else(|| {
            Error::compliance(format!(
                "audit gap of {} minutes is out of range",
                self.config.audit_gap_minutes
            ))
        })?;

        if operations.is_empty() && encryptions.is_empty() {
            return Ok(if established {
                PolicyResult::new(policy, ComplianceStatus::Compliant, "no security traffic in window")
            } else {
                PolicyResult::new(policy, ComplianceStatus::Unknown, "no security traffic yet")
            });
        }

        let audit_window = TimeWindow::new(saturating_sub(window.start, gap), now);
        let mut audits: Vec<DateTime<Utc>> = self
            .store
            .scan_outcome(OperationClass::AuditLog, true, &audit_window)
            .map_err(|e| Error::compliance(format!("audit scan failed: {}", e)))?
            .iter()
            .map(MetricRecord::timestamp)
            .collect();
        audits.sort();

        if audits.is_empty() && !established {
            return Ok(PolicyResult::new(
                policy,
                ComplianceStatus::Unknown,
                "no audit log history yet",
            ));
        }

        let mut uncovered = 0u64;
        let mut pending = 0u64;
        for ts in operations.iter().chain(encryptions).map(MetricRecord::timestamp) {
            if covered(&audits, ts, gap) {
                continue;
            }
            // the audit write may still be on its way
            if ts.checked_add_signed(gap).map_or(true, |due| due > now) {
                pending += 1;
            } else {
                uncovered += 1;
            }
        }

        let total = (operations.len() + encryptions.len()) as u64;
        Ok(if uncovered == 0 {
            PolicyResult::new(
                policy,
                ComplianceStatus::Compliant,
                format!("{} operation(s) audited, {} pending", total - pending, pending),
            )
        } else {
            PolicyResult::new(
                policy,
                ComplianceStatus::NonCompliant,
                format!(
                    "{} of {} operation(s) without an audit write within {} minutes",
                    uncovered, total, self.config.audit_gap_minutes
                ),
            )
        })
    }

    fn encryption_activity(
        &self,
        now: DateTime<Utc>,
        operations: &[MetricRecord],
        encryptions: &[MetricRecord],
        established: bool,
    ) -> Result<PolicyResult> {
        let policy = CompliancePolicy::EncryptionActivity;

        if operations.is_empty() && encryptions.is_empty() {
            return Ok(if established {
                PolicyResult::new(policy, ComplianceStatus::Compliant, "no traffic in window")
            } else {
                PolicyResult::new(policy, ComplianceStatus::Unknown, "no traffic yet")
            });
        }

        let recent = TimeWindow::last_hours(now, self.config.encryption_window_hours);
        let successful = self
            .store
            .scan_outcome(OperationClass::Encryption, true, &recent)
            .map_err(|e| Error::compliance(format!("encryption scan failed: {}", e)))?
            .len();

        Ok(if successful > 0 {
            PolicyResult::new(
                policy,
                ComplianceStatus::Compliant,
                format!(
                    "{} successful encryption(s) in the last {}h",
                    successful, self.config.encryption_window_hours
                ),
            )
        } else {
            PolicyResult::new(
                policy,
                ComplianceStatus::NonCompliant,
                format!(
                    "traffic without successful encryption in the last {}h",
                    self.config.encryption_window_hours
                ),
            )
        })
    }

    fn encryption_strength(&self, encryptions: &[MetricRecord], established: bool) -> PolicyResult {
        let policy = CompliancePolicy::EncryptionStrength;

        if encryptions.is_empty() {
            return if established {
                PolicyResult::new(policy, ComplianceStatus::Compliant, "no encryption in window")
            } else {
                PolicyResult::new(policy, ComplianceStatus::Unknown, "no encryption yet")
            };
        }

        let weak: Vec<String> = encryptions
            .iter()
            .filter_map(|record| match record {
                MetricRecord::Encryption(e) if e.key_size < self.config.min_key_size => {
                    Some(format!("{}/{}", e.algorithm, e.key_size))
                }
                _ => None,
            })
            .collect();

        if weak.is_empty() {
            PolicyResult::new(
                policy,
                ComplianceStatus::Compliant,
                format!("all keys at least {} bits", self.config.min_key_size),
            )
        } else {
            let mut kinds = weak;
            kinds.sort();
            kinds.dedup();
            PolicyResult::new(
                policy,
                ComplianceStatus::NonCompliant,
                format!("weak keys in use: {}", kinds.join(", ")),
            )
        }
    }
}

/// Whether any audit timestamp lies within `gap` of `ts`; `audits` is sorted
fn covered(audits: &[DateTime<Utc>], ts: DateTime<Utc>, gap: Duration) -> bool {
    let earliest = saturating_sub(ts, gap);
    let latest = saturating_sub(ts, -gap);
    let idx = audits.partition_point(|a| *a < earliest);
    audits.get(idx).is_some_and(|a| *a <= latest)
}

/// Snapshot left in the summary table by an earlier checker, if readable
fn restore(summaries: &SummaryTable) -> Option<ComplianceSnapshot> {
    let row = summaries.get(SummaryKind::PciComplianceStatus)?;
    match serde_json::from_value(row.value) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!("Ignoring unreadable compliance summary: {}", e);
            None
        }
    }
}
