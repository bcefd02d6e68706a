//! Gateway metrics: counters, per-provider histograms, and a Prometheus
//! text exposition renderer for `/api/metrics`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

const MAX_PROVIDER_SERIES: usize = 128;

#[derive(Debug, Default)]
struct MetricsInner {
    requests_submitted: u64,
    requests_completed: u64,
    requests_failed: u64,
    requests_cancelled: u64,
    requests_timed_out: u64,
    cache_hits: u64,
    cache_misses: u64,
    retries: u64,
    fallbacks: u64,
    rate_limited: u64,
    queue_full: u64,
    coalesced: u64,

    completed_by_provider: HashMap<String, u64>,
    failed_by_provider: HashMap<String, u64>,
    latency_by_provider: HashMap<String, DurationHistogram>,
    queue_wait: DurationHistogram,
}

#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<MetricsInner>,
}

/// Point-in-time values the registry cannot own: provider in-flight counts
/// and the queue depth, sampled by the caller at render time.
#[derive(Clone, Debug, Default)]
pub struct GaugeSnapshot {
    pub in_flight_by_provider: Vec<(String, u64)>,
    pub queue_depth: u64,
}

impl Metrics {
    pub fn record_submitted(&self) {
        let mut inner = self.lock();
        inner.requests_submitted = inner.requests_submitted.saturating_add(1);
    }

    pub fn record_completed(&self, provider: &str, latency: Duration) {
        let mut inner = self.lock();
        inner.requests_completed = inner.requests_completed.saturating_add(1);
        bump_limited(
            &mut inner.completed_by_provider,
            provider,
            MAX_PROVIDER_SERIES,
        );
        if let Some(hist) = entry_limited(
            &mut inner.latency_by_provider,
            provider,
            MAX_PROVIDER_SERIES,
        ) {
            hist.observe(latency);
        }
    }

    pub fn record_failed(&self, provider: &str) {
        let mut inner = self.lock();
        inner.requests_failed = inner.requests_failed.saturating_add(1);
        bump_limited(&mut inner.failed_by_provider, provider, MAX_PROVIDER_SERIES);
    }

    pub fn record_cancelled(&self) {
        let mut inner = self.lock();
        inner.requests_cancelled = inner.requests_cancelled.saturating_add(1);
    }

    pub fn record_timed_out(&self) {
        let mut inner = self.lock();
        inner.requests_timed_out = inner.requests_timed_out.saturating_add(1);
    }

    pub fn record_cache_hit(&self) {
        let mut inner = self.lock();
        inner.cache_hits = inner.cache_hits.saturating_add(1);
    }

    pub fn record_cache_miss(&self) {
        let mut inner = self.lock();
        inner.cache_misses = inner.cache_misses.saturating_add(1);
    }

    pub fn record_retry(&self) {
        let mut inner = self.lock();
        inner.retries = inner.retries.saturating_add(1);
    }

    pub fn record_fallback(&self) {
        let mut inner = self.lock();
        inner.fallbacks = inner.fallbacks.saturating_add(1);
    }

    pub fn record_rate_limited(&self) {
        let mut inner = self.lock();
        inner.rate_limited = inner.rate_limited.saturating_add(1);
    }

    pub fn record_queue_full(&self) {
        let mut inner = self.lock();
        inner.queue_full = inner.queue_full.saturating_add(1);
    }

    pub fn record_coalesced(&self) {
        let mut inner = self.lock();
        inner.coalesced = inner.coalesced.saturating_add(1);
    }

    pub fn observe_queue_wait(&self, wait: Duration) {
        let mut inner = self.lock();
        inner.queue_wait.observe(wait);
    }

    pub fn render(&self, gauges: &GaugeSnapshot) -> String {
        let inner = self.lock();
        let mut out = String::new();

        for (name, help, value) in [
            (
                "switchyard_requests_submitted_total",
                "Requests accepted at intake.",
                inner.requests_submitted,
            ),
            (
                "switchyard_requests_completed_total",
                "Requests that reached completed.",
                inner.requests_completed,
            ),
            (
                "switchyard_requests_failed_total",
                "Requests that reached failed.",
                inner.requests_failed,
            ),
            (
                "switchyard_requests_cancelled_total",
                "Requests cancelled by callers.",
                inner.requests_cancelled,
            ),
            (
                "switchyard_requests_timed_out_total",
                "Requests that exceeded their deadline.",
                inner.requests_timed_out,
            ),
            (
                "switchyard_cache_hits_total",
                "Intake cache hits.",
                inner.cache_hits,
            ),
            (
                "switchyard_cache_misses_total",
                "Intake cache misses.",
                inner.cache_misses,
            ),
            (
                "switchyard_retries_total",
                "Backend attempts retried after a retryable failure.",
                inner.retries,
            ),
            (
                "switchyard_fallbacks_total",
                "Requests moved to a fallback provider.",
                inner.fallbacks,
            ),
            (
                "switchyard_rate_limited_total",
                "Intake requests denied by the rate limiter.",
                inner.rate_limited,
            ),
            (
                "switchyard_queue_full_total",
                "Intake requests rejected because the queue was full.",
                inner.queue_full,
            ),
            (
                "switchyard_coalesced_total",
                "Requests served as single-flight waiters.",
                inner.coalesced,
            ),
        ] {
            out.push_str(&format!("# HELP {name} {help}\n"));
            out.push_str(&format!("# TYPE {name} counter\n"));
            out.push_str(&format!("{name} {value}\n"));
        }

        write_counter_map(
            &mut out,
            "switchyard_requests_completed_by_provider_total",
            "Completed requests grouped by serving provider.",
            "provider",
            &inner.completed_by_provider,
        );
        write_counter_map(
            &mut out,
            "switchyard_requests_failed_by_provider_total",
            "Failed requests grouped by last attempted provider.",
            "provider",
            &inner.failed_by_provider,
        );

        write_histogram_map(
            &mut out,
            "switchyard_request_duration_seconds",
            "Backend latency of completed requests.",
            "provider",
            &inner.latency_by_provider,
        );
        write_histogram(
            &mut out,
            "switchyard_queue_wait_seconds",
            "Time between submission and worker pickup.",
            &inner.queue_wait,
        );

        out.push_str("# HELP switchyard_queue_depth Queued requests awaiting dispatch.\n");
        out.push_str("# TYPE switchyard_queue_depth gauge\n");
        out.push_str(&format!("switchyard_queue_depth {}\n", gauges.queue_depth));

        out.push_str("# HELP switchyard_in_flight In-flight requests per provider.\n");
        out.push_str("# TYPE switchyard_in_flight gauge\n");
        let mut in_flight: Vec<_> = gauges.in_flight_by_provider.iter().collect();
        in_flight.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (provider, value) in in_flight {
            out.push_str(&format!(
                "switchyard_in_flight{{provider=\"{}\"}} {value}\n",
                escape_label_value(provider)
            ));
        }

        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsInner> {
        self.inner.lock().expect("metrics lock")
    }
}

const OVERFLOW_SERIES_LABEL: &str = "__overflow__";

/// Cardinality-bounded map access: past `max_series` distinct keys, new
/// keys share one overflow series so aggregate counts stay correct.
fn entry_limited<'a, T: Default>(
    map: &'a mut HashMap<String, T>,
    key: &str,
    max_series: usize,
) -> Option<&'a mut T> {
    if max_series == 0 {
        return None;
    }

    if map.contains_key(key) {
        return map.get_mut(key);
    }

    if map.len() < max_series {
        return Some(map.entry(key.to_string()).or_default());
    }

    if map.contains_key(OVERFLOW_SERIES_LABEL) {
        return map.get_mut(OVERFLOW_SERIES_LABEL);
    }

    Some(map.entry(OVERFLOW_SERIES_LABEL.to_string()).or_default())
}

fn bump_limited(map: &mut HashMap<String, u64>, key: &str, max_series: usize) {
    if let Some(entry) = entry_limited(map, key, max_series) {
        *entry = entry.saturating_add(1);
    }
}

#[derive(Clone, Debug)]
struct DurationHistogram {
    buckets: [f64; 11],
    bucket_counts: [u64; 11],
    sum_seconds: f64,
    count: u64,
}

impl Default for DurationHistogram {
    fn default() -> Self {
        Self {
            buckets: [
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
            bucket_counts: [0; 11],
            sum_seconds: 0.0,
            count: 0,
        }
    }
}

impl DurationHistogram {
    fn observe(&mut self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        self.sum_seconds += seconds;
        self.count = self.count.saturating_add(1);
        for (idx, bound) in self.buckets.iter().enumerate() {
            if seconds <= *bound {
                self.bucket_counts[idx] = self.bucket_counts[idx].saturating_add(1);
            }
        }
    }
}

fn write_counter_map(
    out: &mut String,
    metric: &str,
    help: &str,
    label: &str,
    map: &HashMap<String, u64>,
) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} counter\n"));
    let mut entries: Vec<(&String, &u64)> = map.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (value, count) in entries {
        out.push_str(&format!(
            "{metric}{{{label}=\"{}\"}} {count}\n",
            escape_label_value(value)
        ));
    }
}

fn write_histogram(out: &mut String, metric: &str, help: &str, hist: &DurationHistogram) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} histogram\n"));
    for (idx, bound) in hist.buckets.iter().enumerate() {
        out.push_str(&format!(
            "{metric}_bucket{{le=\"{bound}\"}} {}\n",
            hist.bucket_counts[idx]
        ));
    }
    out.push_str(&format!("{metric}_bucket{{le=\"+Inf\"}} {}\n", hist.count));
    out.push_str(&format!("{metric}_sum {}\n", hist.sum_seconds));
    out.push_str(&format!("{metric}_count {}\n", hist.count));
}

fn write_histogram_map(
    out: &mut String,
    metric: &str,
    help: &str,
    label: &str,
    map: &HashMap<String, DurationHistogram>,
) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} histogram\n"));
    let mut entries: Vec<(&String, &DurationHistogram)> = map.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (value, hist) in entries {
        let value = escape_label_value(value);
        for (idx, bound) in hist.buckets.iter().enumerate() {
            out.push_str(&format!(
                "{metric}_bucket{{{label}=\"{value}\",le=\"{bound}\"}} {}\n",
                hist.bucket_counts[idx]
            ));
        }
        out.push_str(&format!(
            "{metric}_bucket{{{label}=\"{value}\",le=\"+Inf\"}} {}\n",
            hist.count
        ));
        out.push_str(&format!("{metric}_sum{{{label}=\"{value}\"}} {}\n", hist.sum_seconds));
        out.push_str(&format!("{metric}_count{{{label}=\"{value}\"}} {}\n", hist.count));
    }
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::new();
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}
