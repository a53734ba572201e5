//! Run metrics, health checks and alerts.
//!
//! Everything here is derived from `JobRun` records and store totals, so the same
//! numbers come out of a live process and of a report over `ingestion_logs`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deckharvest_core::{JobRun, JobStatus, StoreStats};
use serde::Serialize;

use crate::JobKind;

/// Timer samples kept per key; older samples fall off the front.
const MAX_SAMPLES: usize = 256;

/// A feeding job with no run for this long counts as stale.
pub const STALE_AFTER_HOURS: f64 = 48.0;
/// Errors per run, as a percentage, above which a job alerts.
pub const ERROR_RATE_WARNING: f64 = 20.0;
pub const ERROR_RATE_CRITICAL: f64 = 50.0;
/// Normalization percentage under which the store alerts.
pub const NORMALIZATION_FLOOR: f64 = 80.0;
/// HTTP 429 responses per run above which health degrades.
pub const THROTTLE_WARNING_RATE: f64 = 1.0;

/// Operations that bring new decks in.
const FEEDING_OPERATIONS: [&str; 2] = ["incremental", "export"];

/// `name[k=v,...]` with tags in key order.
fn metric_key(name: &str, tags: &[(&str, &str)]) -> String {
    if tags.is_empty() {
        return name.to_string();
    }
    let mut tags = tags.to_vec();
    tags.sort_unstable();
    let joined = tags
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{name}[{joined}]")
}

fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 * pct).ceil() as usize).saturating_sub(1);
    sorted[idx.min(sorted.len() - 1)]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimerSummary {
    pub count: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl TimerSummary {
    fn from_samples(samples: &VecDeque<f64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.iter().copied().collect::<Vec<_>>();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Self {
            count: sorted.len(),
            min_ms: sorted[0],
            max_ms: sorted[sorted.len() - 1],
            mean_ms: sorted.iter().sum::<f64>() / sorted.len() as f64,
            p95_ms: percentile(&sorted, 0.95),
            p99_ms: percentile(&sorted, 0.99),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub timers: BTreeMap<String, TimerSummary>,
}

#[derive(Default)]
struct MetricsInner {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    timers: BTreeMap<String, VecDeque<f64>>,
}

impl MetricsInner {
    fn push_sample(&mut self, key: String, value_ms: f64) {
        let samples = self.timers.entry(key).or_default();
        if samples.len() >= MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(value_ms);
    }
}

/// Counters, gauges and duration timers keyed by metric name plus tags.
pub struct HarvestMetrics {
    started_at: DateTime<Utc>,
    inner: Mutex<MetricsInner>,
}

impl Default for HarvestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HarvestMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            inner: Mutex::new(MetricsInner::default()),
        }
    }

    /// Replay recorded runs oldest first, then set the store gauges.
    pub fn from_history(runs: &[JobRun], stats: &StoreStats) -> Self {
        let metrics = Self::new();
        let mut ordered = runs.iter().collect::<Vec<_>>();
        ordered.sort_by_key(|run| run.timestamp);
        for run in ordered {
            metrics.record_run(run);
        }
        metrics.record_store_stats(stats);
        metrics
    }

    pub fn increment(&self, name: &str, tags: &[(&str, &str)], value: u64) {
        self.update(|inner| {
            let counter = inner.counters.entry(metric_key(name, tags)).or_insert(0);
            *counter = counter.saturating_add(value);
        });
    }

    pub fn gauge(&self, name: &str, tags: &[(&str, &str)], value: f64) {
        self.update(|inner| {
            inner.gauges.insert(metric_key(name, tags), value);
        });
    }

    pub fn record_duration(&self, name: &str, tags: &[(&str, &str)], duration: Duration) {
        let value_ms = duration.as_secs_f64() * 1000.0;
        self.update(|inner| inner.push_sample(metric_key(name, tags), value_ms));
    }

    pub fn record_run(&self, run: &JobRun) {
        let job = [
            ("source", run.source_name.as_str()),
            ("operation", run.operation.as_str()),
        ];
        let with_status = [job[0], job[1], ("status", run.status.as_str())];
        self.increment("job_runs_total", &with_status, 1);
        self.increment("decks_processed_total", &job, run.decks_processed);
        self.increment("cards_processed_total", &job, run.cards_processed);
        self.increment("job_errors_total", &job, run.errors_count);
        self.increment("http_429_total", &[job[0]], run.http_429_count);
        self.record_duration("job_duration", &job, run.duration);
    }

    pub fn record_store_stats(&self, stats: &StoreStats) {
        self.gauge("decks_stored", &[], stats.total_decks as f64);
        self.gauge("cards_stored", &[], stats.total_cards as f64);
        self.gauge("cards_normalized", &[], stats.normalized_cards as f64);
        self.gauge("unmapped_names", &[], stats.unmapped_unique_names as f64);
        self.gauge("normalization_percent", &[], stats.normalization_percentage());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Utc::now();
        let uptime_seconds = (now - self.started_at).num_seconds();
        match self.inner.lock() {
            Ok(inner) => MetricsSnapshot {
                timestamp: now,
                uptime_seconds,
                counters: inner.counters.clone(),
                gauges: inner.gauges.clone(),
                timers: inner
                    .timers
                    .iter()
                    .map(|(key, samples)| (key.clone(), TimerSummary::from_samples(samples)))
                    .collect(),
            },
            Err(_) => MetricsSnapshot {
                timestamp: now,
                uptime_seconds,
                counters: BTreeMap::new(),
                gauges: BTreeMap::new(),
                timers: BTreeMap::new(),
            },
        }
    }

    fn update<F>(&self, update: F)
    where
        F: FnOnce(&mut MetricsInner),
    {
        if let Ok(mut inner) = self.inner.lock() {
            update(&mut inner);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobHealth {
    pub job: &'static str,
    pub status: HealthStatus,
    pub last_status: Option<JobStatus>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub jobs: Vec<JobHealth>,
    pub runs_considered: usize,
    pub http_429_total: u64,
    /// 429 responses per recorded run.
    pub http_429_rate: f64,
    pub normalization_percentage: f64,
    pub notes: Vec<String>,
}

fn hours_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_seconds() as f64 / 3600.0
}

fn job_health(kind: JobKind, runs: &[JobRun], now: DateTime<Utc>) -> JobHealth {
    let last = runs
        .iter()
        .filter(|run| {
            run.source_name == kind.source_name() && run.operation == kind.operation()
        })
        .max_by_key(|run| run.timestamp);
    let Some(last) = last else {
        return JobHealth {
            job: kind.as_str(),
            status: HealthStatus::Warning,
            last_status: None,
            last_run_at: None,
            note: Some("no recorded run".into()),
        };
    };

    let age = hours_between(last.timestamp, now);
    let (status, note) = match last.status {
        JobStatus::Error => (
            HealthStatus::Unhealthy,
            Some(last.message.clone().unwrap_or_else(|| "last run failed".into())),
        ),
        JobStatus::Skipped => (HealthStatus::Healthy, Some("source disabled".into())),
        _ if age > STALE_AFTER_HOURS => (
            HealthStatus::Warning,
            Some(format!("last run {age:.1} hours ago")),
        ),
        JobStatus::Partial => (
            HealthStatus::Warning,
            Some(format!("{} unit errors on last run", last.errors_count)),
        ),
        JobStatus::Success => (HealthStatus::Healthy, None),
    };
    JobHealth {
        job: kind.as_str(),
        status,
        last_status: Some(last.status),
        last_run_at: Some(last.timestamp),
        note,
    }
}

/// Health of every job from its latest run, plus the throttling and normalization rates.
pub fn health_report(runs: &[JobRun], stats: &StoreStats, now: DateTime<Utc>) -> HealthReport {
    let jobs = JobKind::ALL
        .iter()
        .map(|kind| job_health(*kind, runs, now))
        .collect::<Vec<_>>();
    let http_429_total = runs.iter().map(|run| run.http_429_count).sum::<u64>();
    let http_429_rate = if runs.is_empty() {
        0.0
    } else {
        http_429_total as f64 / runs.len() as f64
    };
    let normalization_percentage = stats.normalization_percentage();

    let mut status = jobs
        .iter()
        .map(|job| job.status)
        .max()
        .unwrap_or(HealthStatus::Healthy);
    let mut notes = Vec::new();
    if http_429_rate > THROTTLE_WARNING_RATE {
        status = status.max(HealthStatus::Warning);
        notes.push(format!("{http_429_rate:.2} rate-limit responses per run"));
    }
    if stats.total_cards > 0 && normalization_percentage < NORMALIZATION_FLOOR {
        status = status.max(HealthStatus::Warning);
        notes.push(format!("normalization at {normalization_percentage:.1}%"));
    }

    HealthReport {
        timestamp: now,
        status,
        jobs,
        runs_considered: runs.len(),
        http_429_total,
        http_429_rate,
        normalization_percentage,
        notes,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighErrorRate,
    StaleData,
    LowNormalization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::HighErrorRate => "high_error_rate",
            AlertKind::StaleData => "stale_data",
            AlertKind::LowNormalization => "low_normalization",
        }
    }
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
}

/// Issues worth attention: error-heavy jobs within `window`, sources that stopped
/// feeding decks, and a low normalization rate.
pub fn alerts(
    runs: &[JobRun],
    stats: &StoreStats,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> Vec<Alert> {
    let mut out = Vec::new();

    let since = now - window;
    let mut per_job: BTreeMap<(&str, &str), (u64, u64)> = BTreeMap::new();
    for run in runs.iter().filter(|run| run.timestamp > since) {
        let entry = per_job
            .entry((run.source_name.as_str(), run.operation.as_str()))
            .or_default();
        entry.0 += run.errors_count;
        entry.1 += 1;
    }
    for ((source, operation), (errors, total)) in per_job {
        let rate = errors as f64 / total as f64 * 100.0;
        if rate <= ERROR_RATE_WARNING {
            continue;
        }
        out.push(Alert {
            kind: AlertKind::HighErrorRate,
            severity: if rate >= ERROR_RATE_CRITICAL {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            },
            message: format!(
                "{source}.{operation} has {rate:.1}% error rate ({errors} errors over {total} runs)"
            ),
        });
    }

    let mut last_feed: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
    for run in runs
        .iter()
        .filter(|run| FEEDING_OPERATIONS.contains(&run.operation.as_str()))
    {
        let last = last_feed.entry(run.source_name.as_str()).or_insert(run.timestamp);
        *last = (*last).max(run.timestamp);
    }
    for (source, last) in last_feed {
        let hours = hours_between(last, now);
        if hours > STALE_AFTER_HOURS {
            out.push(Alert {
                kind: AlertKind::StaleData,
                severity: AlertSeverity::Warning,
                message: format!("{source} has not fed decks in {hours:.1} hours"),
            });
        }
    }

    let normalization = stats.normalization_percentage();
    if stats.total_cards > 0 && normalization < NORMALIZATION_FLOOR {
        out.push(Alert {
            kind: AlertKind::LowNormalization,
            severity: AlertSeverity::Warning,
            message: format!(
                "card normalization rate is {normalization:.1}% (floor {NORMALIZATION_FLOOR:.0}%)"
            ),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn run_at(
        kind: JobKind,
        status: JobStatus,
        errors: u64,
        hours_ago: i64,
        now: DateTime<Utc>,
    ) -> JobRun {
        JobRun {
            run_id: Uuid::new_v4(),
            source_name: kind.source_name().to_string(),
            operation: kind.operation().to_string(),
            status,
            decks_processed: 10,
            cards_processed: 1000,
            errors_count: errors,
            http_429_count: 0,
            duration: Duration::from_millis(100),
            message: None,
            timestamp: now - chrono::Duration::hours(hours_ago),
        }
    }

    fn stats(total: u64, normalized: u64) -> StoreStats {
        StoreStats {
            total_decks: 10,
            total_cards: total,
            normalized_cards: normalized,
            unmapped_unique_names: 0,
        }
    }

    fn close(actual: f64, expected: f64) -> bool {
        (actual - expected).abs() < 1e-6
    }

    fn all_fresh(now: DateTime<Utc>) -> Vec<JobRun> {
        JobKind::ALL
            .iter()
            .map(|kind| run_at(*kind, JobStatus::Success, 0, 1, now))
            .collect()
    }

    #[test]
    fn timers_report_percentiles() {
        let metrics = HarvestMetrics::new();
        for ms in 1..=100u64 {
            metrics.record_duration("job_duration", &[], Duration::from_millis(ms));
        }
        let snap = metrics.snapshot();
        let timer = snap.timers["job_duration"];
        assert_eq!(timer.count, 100);
        assert!(close(timer.min_ms, 1.0));
        assert!(close(timer.max_ms, 100.0));
        assert!(close(timer.mean_ms, 50.5));
        assert!(close(timer.p95_ms, 95.0));
        assert!(close(timer.p99_ms, 99.0));
    }

    #[test]
    fn timer_window_drops_the_oldest_samples() {
        let metrics = HarvestMetrics::new();
        for ms in 0..(MAX_SAMPLES as u64 + 10) {
            metrics.record_duration("t", &[], Duration::from_millis(ms));
        }
        let timer = metrics.snapshot().timers["t"];
        assert_eq!(timer.count, MAX_SAMPLES);
        assert!(close(timer.min_ms, 10.0));
    }

    #[test]
    fn history_replays_into_tagged_counters_and_gauges() {
        let now = Utc::now();
        let mut throttled = run_at(JobKind::ArchidektIncremental, JobStatus::Partial, 2, 3, now);
        throttled.http_429_count = 4;
        let runs = vec![
            run_at(JobKind::ArchidektIncremental, JobStatus::Success, 0, 1, now),
            throttled,
        ];

        let snap = HarvestMetrics::from_history(&runs, &stats(200, 150)).snapshot();
        let job = "operation=incremental,source=archidekt";
        assert_eq!(snap.counters[&format!("decks_processed_total[{job}]")], 20);
        assert_eq!(snap.counters[&format!("job_errors_total[{job}]")], 2);
        assert_eq!(
            snap.counters["job_runs_total[operation=incremental,source=archidekt,status=partial]"],
            1
        );
        assert_eq!(snap.counters["http_429_total[source=archidekt]"], 4);
        assert_eq!(snap.timers[&format!("job_duration[{job}]")].count, 2);
        assert_eq!(snap.gauges["normalization_percent"], 75.0);
        assert_eq!(snap.gauges["cards_stored"], 200.0);
    }

    #[test]
    fn fresh_successful_runs_are_healthy() {
        let now = Utc::now();
        let report = health_report(&all_fresh(now), &stats(100, 95), now);
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.jobs.len(), JobKind::ALL.len());
        assert_eq!(report.http_429_rate, 0.0);
        assert!(report.notes.is_empty());
    }

    #[test]
    fn failed_latest_run_makes_the_report_unhealthy() {
        let now = Utc::now();
        let mut runs = all_fresh(now);
        let mut failed = run_at(JobKind::Normalization, JobStatus::Error, 1, 0, now);
        failed.message = Some("reference host offline".into());
        runs.push(failed);

        let report = health_report(&runs, &stats(100, 95), now);
        assert_eq!(report.status, HealthStatus::Unhealthy);
        let sweep = report.jobs.iter().find(|j| j.job == "normalization").unwrap();
        assert_eq!(sweep.last_status, Some(JobStatus::Error));
        assert_eq!(sweep.note.as_deref(), Some("reference host offline"));
    }

    #[test]
    fn throttling_and_missing_jobs_degrade_to_warning() {
        let now = Utc::now();
        let mut runs = vec![run_at(JobKind::ArchidektIncremental, JobStatus::Success, 0, 1, now)];
        runs[0].http_429_count = 3;

        let report = health_report(&runs, &stats(0, 0), now);
        assert_eq!(report.status, HealthStatus::Warning);
        assert_eq!(report.http_429_total, 3);
        assert_eq!(report.http_429_rate, 3.0);
        let export = report.jobs.iter().find(|j| j.job == "moxfield-export").unwrap();
        assert_eq!(export.last_run_at, None);
        assert_eq!(export.status, HealthStatus::Warning);
    }

    #[test]
    fn error_heavy_jobs_alert_with_graded_severity() {
        let now = Utc::now();
        let runs = vec![
            run_at(JobKind::MoxfieldExport, JobStatus::Partial, 1, 1, now),
            run_at(JobKind::MoxfieldExport, JobStatus::Success, 0, 2, now),
            run_at(JobKind::MoxfieldExport, JobStatus::Success, 0, 3, now),
            run_at(JobKind::ArchidektIncremental, JobStatus::Error, 3, 1, now),
            run_at(JobKind::ArchidektIncremental, JobStatus::Partial, 1, 2, now),
            run_at(JobKind::Normalization, JobStatus::Partial, 9, 24 * 30, now),
        ];

        let found = alerts(&runs, &stats(100, 100), now, chrono::Duration::days(7));
        let rates = found
            .iter()
            .filter(|a| a.kind == AlertKind::HighErrorRate)
            .collect::<Vec<_>>();
        assert_eq!(rates.len(), 2);
        assert_eq!(rates[0].severity, AlertSeverity::Critical);
        assert!(rates[0].message.starts_with("archidekt.incremental has 200.0%"));
        assert_eq!(rates[1].severity, AlertSeverity::Warning);
        assert!(rates[1].message.starts_with("moxfield.export has 33.3%"));
    }

    #[test]
    fn stale_feeds_and_low_normalization_alert() {
        let now = Utc::now();
        let runs = vec![
            run_at(JobKind::ArchidektIncremental, JobStatus::Success, 0, 72, now),
            run_at(JobKind::MoxfieldExport, JobStatus::Success, 0, 2, now),
            run_at(JobKind::MoxfieldDiscovery, JobStatus::Success, 0, 100, now),
        ];

        let found = alerts(&runs, &stats(100, 50), now, chrono::Duration::days(7));
        let kinds = found.iter().map(|a| a.kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![AlertKind::StaleData, AlertKind::LowNormalization]);
        assert!(found[0].message.starts_with("archidekt"));

        assert!(alerts(&[], &stats(0, 0), now, chrono::Duration::days(7)).is_empty());
    }
}
