//! Performance Monitor
//!
//! Observability for provider calls:
//! - Per-request records (start, end, outcome)
//! - Per-model aggregates (requests, successes, latency, tokens, error kinds)
//! - Latency histograms with p50/p90/p99
//!
//! Derived values (`success_rate`, `avg_latency`, ...) are computed from the
//! counters on every read and are 0 when their denominator is 0.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::types::ErrorKind;

// ============================================================================
// Configuration
// ============================================================================

/// Monitor retention settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// How long sealed request records are kept
    pub retention: Duration,

    /// Open records older than this are sealed as timeouts
    pub stale_after: Duration,

    /// Run cleanup every N completed requests
    pub cleanup_every: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(3600),
            stale_after: Duration::from_secs(300),
            cleanup_every: 100,
        }
    }
}

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// A histogram for tracking latency distributions
#[derive(Clone, Debug)]
pub struct Histogram {
    /// Bucket upper bounds (in the unit being measured)
    buckets: Vec<f64>,
    /// Count per bucket
    counts: Vec<u64>,
    /// Total count
    total: u64,
}

impl Histogram {
    /// Create a new histogram with the given bucket boundaries
    #[must_use]
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = vec![0; buckets.len()];
        Self {
            buckets,
            counts,
            total: 0,
        }
    }

    /// Create with default latency buckets (in milliseconds)
    #[must_use]
    pub fn latency_default() -> Self {
        Self::new(vec![
            10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
            60000.0, 120_000.0,
        ])
    }

    /// Record a value; values past the last bound land in the last bucket
    pub fn record(&mut self, value: f64) {
        let idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len().saturating_sub(1));
        if let Some(count) = self.counts.get_mut(idx) {
            *count += 1;
            self.total += 1;
        }
    }

    /// Add another histogram with the same bounds into this one
    fn merge(&mut self, other: &Self) {
        if self.buckets != other.buckets {
            return;
        }
        for (mine, theirs) in self.counts.iter_mut().zip(&other.counts) {
            *mine += theirs;
        }
        self.total += other.total;
    }

    /// Upper bound of the bucket containing the `p` quantile
    #[must_use]
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;

        for (bound, &count) in self.buckets.iter().zip(&self.counts) {
            cumulative += count;
            if cumulative >= target {
                return *bound;
            }
        }

        self.buckets.last().copied().unwrap_or(0.0)
    }

    /// Summary quantiles
    #[must_use]
    pub fn summary(&self) -> LatencySummary {
        LatencySummary {
            p50: self.percentile(0.5),
            p90: self.percentile(0.9),
            p99: self.percentile(0.99),
        }
    }
}

/// Latency quantiles in milliseconds (bucket upper bounds)
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    /// Median
    pub p50: f64,
    /// 90th percentile
    pub p90: f64,
    /// 99th percentile
    pub p99: f64,
}

// ============================================================================
// Aggregates
// ============================================================================

#[derive(Clone, Debug)]
struct ModelAggregate {
    requests: u64,
    successes: u64,
    total_latency: f64,
    total_tokens: u64,
    errors: BTreeMap<ErrorKind, u64>,
    latency_ms: Histogram,
}

impl Default for ModelAggregate {
    fn default() -> Self {
        Self {
            requests: 0,
            successes: 0,
            total_latency: 0.0,
            total_tokens: 0,
            errors: BTreeMap::new(),
            latency_ms: Histogram::latency_default(),
        }
    }
}

impl ModelAggregate {
    fn record(&mut self, latency: Duration, success: bool, error: Option<ErrorKind>) {
        self.requests += 1;
        self.total_latency += latency.as_secs_f64();
        self.latency_ms.record(latency.as_secs_f64() * 1000.0);
        if success {
            self.successes += 1;
        } else {
            let kind = error.unwrap_or(ErrorKind::UnexpectedError);
            *self.errors.entry(kind).or_insert(0) += 1;
        }
    }

    fn merge(&mut self, other: &Self) {
        self.requests += other.requests;
        self.successes += other.successes;
        self.total_latency += other.total_latency;
        self.total_tokens += other.total_tokens;
        for (kind, count) in &other.errors {
            *self.errors.entry(*kind).or_insert(0) += count;
        }
        self.latency_ms.merge(&other.latency_ms);
    }

    #[allow(clippy::cast_precision_loss)]
    fn snapshot(&self) -> MetricsSnapshot {
        let ratio = |num: f64, den: u64| if den == 0 { 0.0 } else { num / den as f64 };
        MetricsSnapshot {
            requests: self.requests,
            successes: self.successes,
            failures: self.requests - self.successes,
            success_rate: ratio(self.successes as f64, self.requests),
            avg_latency: ratio(self.total_latency, self.requests),
            total_tokens: self.total_tokens,
            avg_tokens_per_request: ratio(self.total_tokens as f64, self.successes),
            errors: self.errors.clone(),
            latency_ms: self.latency_ms.summary(),
        }
    }
}

/// Aggregate metrics for one model or for all of them
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Completed requests
    pub requests: u64,
    /// Successful requests
    pub successes: u64,
    /// Failed requests
    pub failures: u64,
    /// `successes / requests`
    pub success_rate: f64,
    /// Mean latency in seconds
    pub avg_latency: f64,
    /// Tokens reported by providers
    pub total_tokens: u64,
    /// `total_tokens / successes`
    pub avg_tokens_per_request: f64,
    /// Failures by kind
    pub errors: BTreeMap<ErrorKind, u64>,
    /// Latency quantiles
    pub latency_ms: LatencySummary,
}

/// Overall metrics plus a per-model breakdown
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    /// Across every model
    pub overall: MetricsSnapshot,
    /// Keyed by model identifier
    pub models: BTreeMap<String, MetricsSnapshot>,
}

// ============================================================================
// Request Records
// ============================================================================

#[derive(Clone, Debug)]
struct RequestRecord {
    model: String,
    started: Instant,
    ended: Option<Instant>,
    success: Option<bool>,
    error: Option<ErrorKind>,
}

// ============================================================================
// Performance Monitor
// ============================================================================

/// Records request outcomes and aggregates them per model
#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    config: MonitorConfig,
    records: Mutex<HashMap<String, RequestRecord>>,
    aggregates: RwLock<HashMap<String, ModelAggregate>>,
    completions: Mutex<u64>,
}

impl PerformanceMonitor {
    /// Create a monitor
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Fresh request id
    #[must_use]
    pub fn new_request_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Open a record for a call to `model`
    pub fn start_request(&self, request_id: impl Into<String>, model: &str) {
        let request_id = request_id.into();
        tracing::trace!(request_id = %request_id, model = %model, "Request started");
        self.records.lock().insert(
            request_id,
            RequestRecord {
                model: model.to_string(),
                started: Instant::now(),
                ended: None,
                success: None,
                error: None,
            },
        );
    }

    /// Seal a record and fold it into the model's aggregate
    ///
    /// Returns the measured latency, or `None` for unknown or already sealed ids.
    pub fn end_request(
        &self,
        request_id: &str,
        success: bool,
        error: Option<ErrorKind>,
    ) -> Option<Duration> {
        let now = Instant::now();
        let (model, latency) = {
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(request_id) else {
                tracing::warn!(request_id = %request_id, "end_request for unknown request");
                return None;
            };
            if record.ended.is_some() {
                return None;
            }
            record.ended = Some(now);
            record.success = Some(success);
            record.error = if success { None } else { error };
            (record.model.clone(), now.saturating_duration_since(record.started))
        };

        self.aggregates
            .write()
            .entry(model)
            .or_default()
            .record(latency, success, error);

        let due = {
            let mut completions = self.completions.lock();
            *completions += 1;
            self.config.cleanup_every > 0 && *completions % self.config.cleanup_every == 0
        };
        if due {
            self.cleanup();
        }

        Some(latency)
    }

    /// Add provider-reported tokens to a model's total
    pub fn record_tokens(&self, model: &str, tokens: u64) {
        let mut aggregates = self.aggregates.write();
        let aggregate = aggregates.entry(model.to_string()).or_default();
        aggregate.total_tokens = aggregate.total_tokens.saturating_add(tokens);
    }

    /// Overall metrics and either one model's or every model's breakdown
    #[must_use]
    pub fn get_metrics(&self, model: Option<&str>) -> PerformanceReport {
        let aggregates = self.aggregates.read();

        let mut overall = ModelAggregate::default();
        for aggregate in aggregates.values() {
            overall.merge(aggregate);
        }

        let models = match model {
            Some(model) => {
                let snapshot = aggregates
                    .get(model)
                    .map(ModelAggregate::snapshot)
                    .unwrap_or_default();
                BTreeMap::from([(model.to_string(), snapshot)])
            }
            None => aggregates
                .iter()
                .map(|(name, aggregate)| (name.clone(), aggregate.snapshot()))
                .collect(),
        };

        PerformanceReport {
            overall: overall.snapshot(),
            models,
        }
    }

    /// Requests started but not yet sealed
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.records
            .lock()
            .values()
            .filter(|r| r.ended.is_none())
            .count()
    }

    /// Records still held, sealed or not
    #[must_use]
    pub fn retained_records(&self) -> usize {
        self.records.lock().len()
    }

    /// Seal open records older than `max_age` as timeouts
    pub fn cleanup_stale_requests(&self, max_age: Duration) -> usize {
        let stale: Vec<String> = {
            let now = Instant::now();
            self.records
                .lock()
                .iter()
                .filter(|(_, r)| r.ended.is_none() && now.saturating_duration_since(r.started) > max_age)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in &stale {
            tracing::warn!(request_id = %id, "Sealing stale request as timed out");
            self.end_request(id, false, Some(ErrorKind::Timeout));
        }
        stale.len()
    }

    /// Drop sealed records past retention and seal stale open ones
    pub fn cleanup(&self) {
        let now = Instant::now();
        let retention = self.config.retention;
        let purged = {
            let mut records = self.records.lock();
            let before = records.len();
            records.retain(|_, r| {
                r.ended
                    .map_or(true, |ended| now.saturating_duration_since(ended) <= retention)
            });
            before - records.len()
        };
        let sealed = self.cleanup_stale_requests(self.config.stale_after);
        if purged > 0 || sealed > 0 {
            tracing::debug!(purged, sealed, "Monitor cleanup");
        }
    }
}
