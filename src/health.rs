//! Per-provider health tracking: a rolling window of probe results drives
//! ok/degraded/down transitions, with a degraded probation window after a
//! provider comes back from down.

use std::collections::VecDeque;

use crate::config::HealthConfig;
use crate::types::ProviderHealth;

#[derive(Clone, Copy, Debug)]
pub struct ProbeSample {
    pub ok: bool,
    pub latency_ms: u64,
}

#[derive(Debug)]
pub struct ProviderRuntime {
    health: ProviderHealth,
    window: VecDeque<ProbeSample>,
    consecutive_failures: u32,
    last_ping_ms: u64,
    probation_until_ms: u64,
}

impl Default for ProviderRuntime {
    fn default() -> Self {
        Self {
            health: ProviderHealth::Unknown,
            window: VecDeque::new(),
            consecutive_failures: 0,
            last_ping_ms: 0,
            probation_until_ms: 0,
        }
    }
}

impl ProviderRuntime {
    pub fn health(&self) -> ProviderHealth {
        self.health
    }

    pub fn last_ping_ms(&self) -> u64 {
        self.last_ping_ms
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let ok = self.window.iter().filter(|sample| sample.ok).count();
        ok as f64 / self.window.len() as f64
    }

    pub fn avg_latency_ms(&self) -> f64 {
        let successes: Vec<u64> = self
            .window
            .iter()
            .filter(|sample| sample.ok)
            .map(|sample| sample.latency_ms)
            .collect();
        if successes.is_empty() {
            return 0.0;
        }
        successes.iter().sum::<u64>() as f64 / successes.len() as f64
    }

    fn median_latency_ms(&self) -> u64 {
        let mut successes: Vec<u64> = self
            .window
            .iter()
            .filter(|sample| sample.ok)
            .map(|sample| sample.latency_ms)
            .collect();
        if successes.is_empty() {
            return 0;
        }
        successes.sort_unstable();
        successes[successes.len() / 2]
    }

    /// Record one probe and re-evaluate. Returns `Some((from, to))` when the
    /// provider's health changed.
    pub fn record_probe(
        &mut self,
        sample: ProbeSample,
        settings: &HealthConfig,
        now_ms: u64,
    ) -> Option<(ProviderHealth, ProviderHealth)> {
        let was_down = self.health == ProviderHealth::Down;
        self.last_ping_ms = now_ms;
        self.window.push_back(sample);
        while self.window.len() > settings.window.max(1) {
            self.window.pop_front();
        }
        if sample.ok {
            if was_down {
                // One success lifts a down provider into probation, not ok.
                self.probation_until_ms =
                    now_ms.saturating_add(settings.interval_s.saturating_mul(2000));
            }
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }

        let next = self.evaluate(settings, now_ms);
        if next != self.health {
            let previous = self.health;
            self.health = next;
            return Some((previous, next));
        }
        None
    }

    fn evaluate(&self, settings: &HealthConfig, now_ms: u64) -> ProviderHealth {
        if self.consecutive_failures >= settings.down_after_failures.max(1) {
            return ProviderHealth::Down;
        }
        if self.window.is_empty() {
            return ProviderHealth::Unknown;
        }
        if now_ms < self.probation_until_ms {
            return ProviderHealth::Degraded;
        }
        if self.success_rate() < settings.success_threshold {
            return ProviderHealth::Degraded;
        }
        if let Some(budget) = settings.latency_budget_ms {
            if self.median_latency_ms() > budget {
                return ProviderHealth::Degraded;
            }
        }
        if self.window.iter().all(|sample| sample.ok) {
            return ProviderHealth::Ok;
        }
        ProviderHealth::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> HealthConfig {
        HealthConfig {
            interval_s: 10,
            window: 5,
            success_threshold: 0.7,
            down_after_failures: 3,
            latency_budget_ms: None,
        }
    }

    fn ok(latency_ms: u64) -> ProbeSample {
        ProbeSample {
            ok: true,
            latency_ms,
        }
    }

    fn fail() -> ProbeSample {
        ProbeSample {
            ok: false,
            latency_ms: 0,
        }
    }

    #[test]
    fn all_successes_reach_ok() {
        let mut runtime = ProviderRuntime::default();
        let settings = settings();
        let change = runtime.record_probe(ok(10), &settings, 1000);
        assert_eq!(change, Some((ProviderHealth::Unknown, ProviderHealth::Ok)));
        for t in 2..6 {
            runtime.record_probe(ok(10), &settings, t * 1000);
        }
        assert_eq!(runtime.health(), ProviderHealth::Ok);
        assert_eq!(runtime.success_rate(), 1.0);
    }

    #[test]
    fn consecutive_failures_mark_down() {
        let mut runtime = ProviderRuntime::default();
        let settings = settings();
        runtime.record_probe(ok(10), &settings, 1000);
        runtime.record_probe(fail(), &settings, 2000);
        runtime.record_probe(fail(), &settings, 3000);
        let change = runtime.record_probe(fail(), &settings, 4000);
        assert_eq!(runtime.health(), ProviderHealth::Down);
        assert!(change.is_some());
    }

    #[test]
    fn recovery_passes_through_probation() {
        let mut runtime = ProviderRuntime::default();
        let settings = settings();
        for t in 1..4 {
            runtime.record_probe(fail(), &settings, t * 1000);
        }
        assert_eq!(runtime.health(), ProviderHealth::Down);

        // First success after down: degraded probation, not ok.
        let change = runtime.record_probe(ok(10), &settings, 5000);
        assert_eq!(change, Some((ProviderHealth::Down, ProviderHealth::Degraded)));

        // Probation lasts 2 * interval_s; still degraded inside it even with
        // a clean window.
        for t in 6..10 {
            runtime.record_probe(ok(10), &settings, t * 1000);
        }
        assert_eq!(runtime.health(), ProviderHealth::Degraded);

        // Past probation with an all-ok window: back to ok.
        runtime.record_probe(ok(10), &settings, 26_000);
        assert_eq!(runtime.health(), ProviderHealth::Ok);
    }

    #[test]
    fn low_success_ratio_degrades() {
        let mut runtime = ProviderRuntime::default();
        let settings = settings();
        // 3/5 ok = 0.6 < 0.7, but never 3 consecutive failures.
        runtime.record_probe(ok(10), &settings, 1000);
        runtime.record_probe(fail(), &settings, 2000);
        runtime.record_probe(ok(10), &settings, 3000);
        runtime.record_probe(fail(), &settings, 4000);
        runtime.record_probe(ok(10), &settings, 5000);
        assert_eq!(runtime.health(), ProviderHealth::Degraded);
    }

    #[test]
    fn slow_medians_degrade_when_budgeted() {
        let mut runtime = ProviderRuntime::default();
        let settings = HealthConfig {
            latency_budget_ms: Some(100),
            ..settings()
        };
        for t in 1..6 {
            runtime.record_probe(ok(500), &settings, t * 1000);
        }
        assert_eq!(runtime.health(), ProviderHealth::Degraded);
    }

    #[test]
    fn window_is_bounded() {
        let mut runtime = ProviderRuntime::default();
        let settings = settings();
        for t in 1..20 {
            runtime.record_probe(ok(10), &settings, t * 1000);
        }
        assert!(runtime.window.len() <= settings.window);
    }
}
