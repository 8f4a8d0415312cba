//! Execution metrics.
//!
//! Tracks:
//! - Request counts per outcome, per preset and per credential
//! - Backend attempts and end-to-end latency
//! - Today's leaderboard of users and groups by successful generations
//!
//! Counters are also emitted through the `metrics` facade so any installed
//! recorder (Prometheus, statsd, ...) sees them.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;

use crate::clock::Clock;
use crate::error::ErrorKind;
use crate::middleware::store::CredentialId;

/// What one completed request looked like.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// `None` when the request was rejected before a preset was chosen.
    pub preset: Option<String>,
    pub credential: Option<CredentialId>,
    pub fingerprint: Option<String>,
    pub attempts: u32,
    /// `Ok` on success, otherwise the terminal error kind.
    pub outcome: Result<(), ErrorKind>,
    pub latency: Duration,
    pub user_id: String,
    pub group_id: Option<String>,
}

impl ExecutionReport {
    pub fn outcome_label(&self) -> &'static str {
        match self.outcome {
            Ok(()) => "success",
            Err(kind) => kind.as_str(),
        }
    }
}

/// Totals across all requests.
#[derive(Debug, Clone, Serialize, Default)]
pub struct StatsSnapshot {
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_failed: u64,
    pub attempts_total: u64,
    pub latency_avg_ms: u64,
    pub by_outcome: BTreeMap<String, u64>,
}

/// Breakdown for one preset.
#[derive(Debug, Clone, Serialize)]
pub struct PresetMetrics {
    pub preset: String,
    pub requests_total: u64,
    pub requests_failed: u64,
    pub attempts_total: u64,
}

/// Breakdown for one credential, identified by id and fingerprint only.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialMetrics {
    pub preset: String,
    pub credential: CredentialId,
    pub fingerprint: String,
    pub successes: u64,
    pub failures: u64,
}

/// One leaderboard row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankEntry {
    pub id: String,
    pub count: u64,
}

#[derive(Debug, Default)]
struct PresetCounters {
    requests_total: AtomicU64,
    requests_failed: AtomicU64,
    attempts_total: AtomicU64,
}

#[derive(Debug)]
struct CredentialCounters {
    fingerprint: String,
    successes: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug)]
struct DailyBoard {
    day: NaiveDate,
    users: HashMap<String, u64>,
    groups: HashMap<String, u64>,
}

/// In-process execution statistics.
pub struct ExecutionStats {
    clock: Arc<dyn Clock>,
    requests_total: AtomicU64,
    requests_success: AtomicU64,
    requests_failed: AtomicU64,
    attempts_total: AtomicU64,
    latency_sum_ms: AtomicU64,
    by_outcome: RwLock<HashMap<&'static str, Arc<AtomicU64>>>,
    presets: RwLock<HashMap<String, Arc<PresetCounters>>>,
    credentials: RwLock<HashMap<(String, CredentialId), Arc<CredentialCounters>>>,
    daily: Mutex<DailyBoard>,
}

impl ExecutionStats {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let day = clock.today();
        Self {
            clock,
            requests_total: AtomicU64::new(0),
            requests_success: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            attempts_total: AtomicU64::new(0),
            latency_sum_ms: AtomicU64::new(0),
            by_outcome: RwLock::new(HashMap::new()),
            presets: RwLock::new(HashMap::new()),
            credentials: RwLock::new(HashMap::new()),
            daily: Mutex::new(DailyBoard {
                day,
                users: HashMap::new(),
                groups: HashMap::new(),
            }),
        }
    }

    /// Record one completed request.
    pub fn record(&self, report: &ExecutionReport) {
        let outcome = report.outcome_label();
        let success = report.outcome.is_ok();

        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.requests_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.attempts_total
            .fetch_add(u64::from(report.attempts), Ordering::Relaxed);
        self.latency_sum_ms
            .fetch_add(report.latency.as_millis() as u64, Ordering::Relaxed);
        get_or_insert(&self.by_outcome, &outcome, || Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::Relaxed);

        let preset_label = report.preset.clone().unwrap_or_else(|| "none".to_string());
        metrics::counter!(
            "imagegate_requests_total",
            "preset" => preset_label.clone(),
            "outcome" => outcome
        )
        .increment(1);
        metrics::counter!("imagegate_attempts_total", "preset" => preset_label)
            .increment(u64::from(report.attempts));
        metrics::histogram!("imagegate_request_latency_seconds").record(report.latency.as_secs_f64());

        if let Some(preset) = &report.preset {
            let counters = get_or_insert(&self.presets, preset.as_str(), Default::default);
            counters.requests_total.fetch_add(1, Ordering::Relaxed);
            if !success {
                counters.requests_failed.fetch_add(1, Ordering::Relaxed);
            }
            counters
                .attempts_total
                .fetch_add(u64::from(report.attempts), Ordering::Relaxed);

            if let Some(credential) = report.credential {
                let key = (preset.clone(), credential);
                let fingerprint = report.fingerprint.clone().unwrap_or_default();
                let counters = get_or_insert(&self.credentials, &key, || {
                    Arc::new(CredentialCounters {
                        fingerprint,
                        successes: AtomicU64::new(0),
                        failures: AtomicU64::new(0),
                    })
                });
                if success {
                    counters.successes.fetch_add(1, Ordering::Relaxed);
                } else {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if success {
            let mut board = self.board();
            *board.users.entry(report.user_id.clone()).or_default() += 1;
            if let Some(group) = &report.group_id {
                *board.groups.entry(group.clone()).or_default() += 1;
            }
        }
    }

    fn board(&self) -> std::sync::MutexGuard<'_, DailyBoard> {
        let today = self.clock.today();
        let mut board = self.daily.lock().unwrap_or_else(|e| e.into_inner());
        if board.day != today {
            board.day = today;
            board.users.clear();
            board.groups.clear();
        }
        board
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let requests_total = self.requests_total.load(Ordering::Relaxed);
        let latency_sum = self.latency_sum_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            requests_total,
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            attempts_total: self.attempts_total.load(Ordering::Relaxed),
            latency_avg_ms: latency_sum.checked_div(requests_total).unwrap_or(0),
            by_outcome: self
                .by_outcome
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .map(|(k, v)| (k.to_string(), v.load(Ordering::Relaxed)))
                .collect(),
        }
    }

    /// Per-preset breakdown, sorted by preset name.
    pub fn preset_metrics(&self) -> Vec<PresetMetrics> {
        let mut rows: Vec<PresetMetrics> = self
            .presets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(preset, c)| PresetMetrics {
                preset: preset.clone(),
                requests_total: c.requests_total.load(Ordering::Relaxed),
                requests_failed: c.requests_failed.load(Ordering::Relaxed),
                attempts_total: c.attempts_total.load(Ordering::Relaxed),
            })
            .collect();
        rows.sort_by(|a, b| a.preset.cmp(&b.preset));
        rows
    }

    /// Per-credential breakdown, sorted by preset then credential.
    pub fn credential_metrics(&self) -> Vec<CredentialMetrics> {
        let mut rows: Vec<CredentialMetrics> = self
            .credentials
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|((preset, credential), c)| CredentialMetrics {
                preset: preset.clone(),
                credential: *credential,
                fingerprint: c.fingerprint.clone(),
                successes: c.successes.load(Ordering::Relaxed),
                failures: c.failures.load(Ordering::Relaxed),
            })
            .collect();
        rows.sort_by(|a, b| (&a.preset, a.credential).cmp(&(&b.preset, b.credential)));
        rows
    }

    /// Today's top `n` users by successful generations.
    pub fn top_users(&self, n: usize) -> Vec<RankEntry> {
        rank(&self.board().users, n)
    }

    /// Today's top `n` groups by successful generations.
    pub fn top_groups(&self, n: usize) -> Vec<RankEntry> {
        rank(&self.board().groups, n)
    }
}

fn rank(counts: &HashMap<String, u64>, n: usize) -> Vec<RankEntry> {
    let mut rows: Vec<RankEntry> = counts
        .iter()
        .map(|(id, count)| RankEntry {
            id: id.clone(),
            count: *count,
        })
        .collect();
    rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.id.cmp(&b.id)));
    rows.truncate(n);
    rows
}

fn get_or_insert<K, Q, V, F>(map: &RwLock<HashMap<K, Arc<V>>>, key: &Q, make: F) -> Arc<V>
where
    K: std::hash::Hash + Eq + std::borrow::Borrow<Q>,
    Q: std::hash::Hash + Eq + ToOwned<Owned = K> + ?Sized,
    F: FnOnce() -> Arc<V>,
{
    if let Some(existing) = map.read().unwrap_or_else(|e| e.into_inner()).get(key) {
        return Arc::clone(existing);
    }
    let mut map = map.write().unwrap_or_else(|e| e.into_inner());
    Arc::clone(map.entry(key.to_owned()).or_insert_with(make))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn report(preset: Option<&str>, outcome: Result<(), ErrorKind>, user: &str) -> ExecutionReport {
        ExecutionReport {
            preset: preset.map(str::to_string),
            credential: preset.map(|_| CredentialId::from_raw(1)),
            fingerprint: Some("abc123".to_string()),
            attempts: 2,
            outcome,
            latency: Duration::from_millis(100),
            user_id: user.to_string(),
            group_id: Some("g1".to_string()),
        }
    }

    #[test]
    fn totals_and_breakdowns() {
        let stats = ExecutionStats::new(Arc::new(ManualClock::default()));
        stats.record(&report(Some("main"), Ok(()), "u1"));
        stats.record(&report(Some("main"), Err(ErrorKind::BackendTransient), "u1"));
        stats.record(&report(None, Err(ErrorKind::RateLimited), "u2"));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests_total, 3);
        assert_eq!(snapshot.requests_success, 1);
        assert_eq!(snapshot.requests_failed, 2);
        assert_eq!(snapshot.latency_avg_ms, 100);
        assert_eq!(snapshot.by_outcome.get("rate_limited"), Some(&1));

        let presets = stats.preset_metrics();
        assert_eq!(presets.len(), 1);
        assert_eq!(presets[0].requests_total, 2);
        assert_eq!(presets[0].attempts_total, 4);

        let credentials = stats.credential_metrics();
        assert_eq!(credentials[0].successes, 1);
        assert_eq!(credentials[0].failures, 1);
        assert_eq!(credentials[0].fingerprint, "abc123");
    }

    #[test]
    fn leaderboard_counts_successes_and_resets_daily() {
        let clock = Arc::new(ManualClock::default());
        let stats = ExecutionStats::new(clock.clone());
        stats.record(&report(Some("main"), Ok(()), "u1"));
        stats.record(&report(Some("main"), Ok(()), "u2"));
        stats.record(&report(Some("main"), Ok(()), "u2"));
        stats.record(&report(Some("main"), Err(ErrorKind::BackendTransient), "u1"));

        assert_eq!(
            stats.top_users(1),
            vec![RankEntry {
                id: "u2".to_string(),
                count: 2
            }]
        );
        assert_eq!(stats.top_groups(5)[0].count, 3);

        clock.set_today(clock.today().succ_opt().unwrap());
        assert!(stats.top_users(5).is_empty());
    }
}
