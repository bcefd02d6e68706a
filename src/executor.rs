//! Retry and fallback executor. Walks the provider chain (preferred first,
//! then its fallback chain), retrying retryable failures with jittered
//! exponential backoff, all without ever exceeding the request deadline.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{Backend, BackendResult, ExecContext};
use crate::config::RetryConfig;
use crate::events::EventBus;
use crate::metrics::Metrics;
use crate::store::SqliteStore;
use crate::types::{BackendKind, ErrorKind, GatewayEvent, RequestRecord, TokenUsage};

#[derive(Clone)]
pub struct ChainStep {
    pub provider: String,
    pub backend: Arc<dyn Backend>,
}

#[derive(Clone, Debug)]
pub enum ExecOutcome {
    Success {
        text: String,
        thinking: Option<String>,
        tokens: TokenUsage,
        cost_usd: f64,
        provider: String,
        backend: BackendKind,
    },
    Failure {
        kind: ErrorKind,
        message: String,
        provider: String,
    },
}

pub async fn execute_chain(
    request: &RequestRecord,
    chain: &[ChainStep],
    retry: &RetryConfig,
    ctx: &ExecContext,
    store: &SqliteStore,
    events: &EventBus,
    metrics: &Metrics,
) -> ExecOutcome {
    let mut last_failure = (
        ErrorKind::PermanentBackend,
        "no providers were available to serve the request".to_string(),
        request.provider.clone(),
    );
    let max_attempts = if retry.enabled {
        retry.max_attempts.max(1)
    } else {
        1
    };

    for (index, step) in chain.iter().enumerate() {
        if index > 0 {
            metrics.record_fallback();
            tracing::warn!(
                request_id = %request.id,
                from = %chain[index - 1].provider,
                to = %step.provider,
                "falling back to next provider"
            );
        }

        let mut attempt = 0u32;
        'attempts: while attempt < max_attempts {
            attempt += 1;
            if ctx.cancel.is_cancelled() {
                return cancelled(&step.provider);
            }
            if ctx.expired() {
                return timed_out(&step.provider);
            }
            if let Err(err) = store.bump_attempts(&request.id).await {
                tracing::error!(request_id = %request.id, error = %err, "attempt bookkeeping failed");
                return ExecOutcome::Failure {
                    kind: ErrorKind::StorageUnavailable,
                    message: "state store rejected the attempt record".to_string(),
                    provider: step.provider.clone(),
                };
            }
            events.publish(&GatewayEvent::BackendExecuting {
                request_id: request.id.clone(),
                provider: step.provider.clone(),
                backend: step.backend.kind(),
                attempt,
                command: step.backend.describe_call(request),
            });

            let result = step.backend.execute(request, ctx).await;
            if ctx.cancel.is_cancelled() {
                return cancelled(&step.provider);
            }

            match result {
                BackendResult::Success {
                    text,
                    thinking,
                    tokens,
                    cost_usd,
                } => {
                    return ExecOutcome::Success {
                        text,
                        thinking,
                        tokens,
                        cost_usd,
                        provider: step.provider.clone(),
                        backend: step.backend.kind(),
                    };
                }
                BackendResult::AuthRequired { hint_url } => {
                    let message = match hint_url {
                        Some(url) => format!("provider requires authentication: {url}"),
                        None => "provider requires authentication".to_string(),
                    };
                    last_failure = (ErrorKind::AuthRequired, message, step.provider.clone());
                    break 'attempts;
                }
                BackendResult::Permanent { message } => {
                    tracing::info!(
                        request_id = %request.id,
                        provider = %step.provider,
                        "permanent backend failure"
                    );
                    last_failure = (ErrorKind::PermanentBackend, message, step.provider.clone());
                    break 'attempts;
                }
                BackendResult::RateLimited { retry_after_s } => {
                    last_failure = (
                        ErrorKind::RateLimited,
                        "provider rate limited the request".to_string(),
                        step.provider.clone(),
                    );
                    if attempt >= max_attempts {
                        break 'attempts;
                    }
                    let wait = Duration::from_secs(
                        retry_after_s.unwrap_or(retry.base_backoff_ms / 1000 + 1),
                    );
                    if !sleep_within_deadline(wait, ctx).await {
                        return timed_out(&step.provider);
                    }
                    metrics.record_retry();
                }
                BackendResult::Transient { message } => {
                    tracing::warn!(
                        request_id = %request.id,
                        provider = %step.provider,
                        attempt,
                        "transient backend failure"
                    );
                    last_failure = (ErrorKind::TransientBackend, message, step.provider.clone());
                    if ctx.expired() {
                        return timed_out(&step.provider);
                    }
                    if attempt >= max_attempts {
                        break 'attempts;
                    }
                    let wait = backoff_delay(retry, attempt);
                    if !sleep_within_deadline(wait, ctx).await {
                        return timed_out(&step.provider);
                    }
                    metrics.record_retry();
                }
            }
        }
    }

    let (kind, message, provider) = last_failure;
    ExecOutcome::Failure {
        kind,
        message,
        provider,
    }
}

/// base * 2^(attempt-1), jittered +/-25% when enabled.
fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base_ms = retry.base_backoff_ms.max(1) as f64 * 2f64.powi(exponent as i32);
    let jittered = if retry.jitter {
        base_ms * (0.75 + rand::random::<f64>() * 0.5)
    } else {
        base_ms
    };
    Duration::from_millis(jittered as u64)
}

/// Sleep for `wait` bounded by the deadline and the cancel signal. Returns
/// false when the deadline expired (or would expire) instead of sleeping on.
async fn sleep_within_deadline(wait: Duration, ctx: &ExecContext) -> bool {
    let remaining = ctx.remaining();
    if remaining.is_zero() {
        return false;
    }
    let bounded = wait.min(remaining);
    tokio::select! {
        _ = ctx.cancel.cancelled() => true,
        _ = tokio::time::sleep(bounded) => !(wait > remaining),
    }
}

fn cancelled(provider: &str) -> ExecOutcome {
    ExecOutcome::Failure {
        kind: ErrorKind::Cancelled,
        message: "request cancelled".to_string(),
        provider: provider.to_string(),
    }
}

fn timed_out(provider: &str) -> ExecOutcome {
    ExecOutcome::Failure {
        kind: ErrorKind::TimedOut,
        message: "request exceeded its deadline".to_string(),
        provider: provider.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use crate::backend::HealthProbe;
    use crate::types::{now_millis, RequestStatus};

    struct ScriptedBackend {
        calls: AtomicU32,
        script: Vec<BackendResult>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<BackendResult>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                script,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn execute(&self, _request: &RequestRecord, _ctx: &ExecContext) -> BackendResult {
            let index = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            self.script
                .get(index.min(self.script.len().saturating_sub(1)))
                .cloned()
                .unwrap_or(BackendResult::Permanent {
                    message: "script exhausted".to_string(),
                })
        }

        async fn health_check(&self, _ctx: &ExecContext) -> HealthProbe {
            HealthProbe::Ok
        }

        fn kind(&self) -> BackendKind {
            BackendKind::HttpApi
        }
    }

    fn success(text: &str) -> BackendResult {
        BackendResult::Success {
            text: text.to_string(),
            thinking: None,
            tokens: TokenUsage::new(1, 1),
            cost_usd: 0.0,
        }
    }

    fn transient() -> BackendResult {
        BackendResult::Transient {
            message: "boom".to_string(),
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            enabled: true,
            max_attempts,
            base_backoff_ms: 1,
            jitter: false,
        }
    }

    fn request() -> RequestRecord {
        let now = now_millis();
        RequestRecord {
            id: "r1".to_string(),
            provider: "p1".to_string(),
            model: None,
            agent: None,
            prompt: "hello".to_string(),
            priority: 0,
            status: RequestStatus::Processing,
            attempts: 0,
            fingerprint: "fp".to_string(),
            bypass_cache: false,
            api_key_id: None,
            parent_id: None,
            worker: None,
            submitted_at_ms: now,
            deadline_ms: now + 30_000,
            updated_at_ms: now,
        }
    }

    fn ctx(deadline_in: Duration) -> ExecContext {
        ExecContext::new(Instant::now() + deadline_in, CancellationToken::new())
    }

    async fn store_with_request() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("gateway.sqlite"));
        store.init().await.expect("init");
        store.put_request(&request()).await.expect("put");
        (dir, store)
    }

    fn step(name: &str, backend: Arc<ScriptedBackend>) -> ChainStep {
        ChainStep {
            provider: name.to_string(),
            backend,
        }
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let (_dir, store) = store_with_request().await;
        let backend = ScriptedBackend::new(vec![transient(), transient(), success("ok")]);
        let outcome = execute_chain(
            &request(),
            &[step("p1", backend.clone())],
            &fast_retry(3),
            &ctx(Duration::from_secs(10)),
            &store,
            &EventBus::default(),
            &Metrics::default(),
        )
        .await;

        assert!(matches!(outcome, ExecOutcome::Success { ref text, .. } if text == "ok"));
        assert_eq!(backend.calls(), 3);
        let stored = store.get_request("r1").await.unwrap().unwrap();
        assert_eq!(stored.attempts, 3);
    }

    #[tokio::test]
    async fn exhausted_retries_report_the_last_classification() {
        let (_dir, store) = store_with_request().await;
        let backend = ScriptedBackend::new(vec![transient()]);
        let outcome = execute_chain(
            &request(),
            &[step("p1", backend.clone())],
            &fast_retry(3),
            &ctx(Duration::from_secs(10)),
            &store,
            &EventBus::default(),
            &Metrics::default(),
        )
        .await;

        match outcome {
            ExecOutcome::Failure { kind, provider, .. } => {
                assert_eq!(kind, ErrorKind::TransientBackend);
                assert_eq!(provider, "p1");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn permanent_failures_skip_to_the_fallback() {
        let (_dir, store) = store_with_request().await;
        let primary = ScriptedBackend::new(vec![BackendResult::Permanent {
            message: "rejected".to_string(),
        }]);
        let fallback = ScriptedBackend::new(vec![success("rescued")]);
        let outcome = execute_chain(
            &request(),
            &[step("p1", primary.clone()), step("p2", fallback.clone())],
            &fast_retry(3),
            &ctx(Duration::from_secs(10)),
            &store,
            &EventBus::default(),
            &Metrics::default(),
        )
        .await;

        match outcome {
            ExecOutcome::Success { provider, text, .. } => {
                assert_eq!(provider, "p2");
                assert_eq!(text, "rescued");
            }
            other => panic!("expected success, got {other:?}"),
        }
        // Permanent errors are not retried on the same provider.
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn auth_required_moves_on_and_survives_as_final_kind() {
        let (_dir, store) = store_with_request().await;
        let primary = ScriptedBackend::new(vec![BackendResult::AuthRequired {
            hint_url: Some("https://login.example.com".to_string()),
        }]);
        let outcome = execute_chain(
            &request(),
            &[step("p1", primary)],
            &fast_retry(3),
            &ctx(Duration::from_secs(10)),
            &store,
            &EventBus::default(),
            &Metrics::default(),
        )
        .await;

        match outcome {
            ExecOutcome::Failure { kind, message, .. } => {
                assert_eq!(kind, ErrorKind::AuthRequired);
                assert!(message.contains("https://login.example.com"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_expiry_mid_backoff_times_out() {
        let (_dir, store) = store_with_request().await;
        let backend = ScriptedBackend::new(vec![transient()]);
        let retry = RetryConfig {
            enabled: true,
            max_attempts: 5,
            base_backoff_ms: 60_000,
            jitter: false,
        };
        let outcome = execute_chain(
            &request(),
            &[step("p1", backend)],
            &retry,
            &ctx(Duration::from_millis(50)),
            &store,
            &EventBus::default(),
            &Metrics::default(),
        )
        .await;

        assert!(matches!(
            outcome,
            ExecOutcome::Failure {
                kind: ErrorKind::TimedOut,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn every_attempt_announces_the_provider_called() {
        let (_dir, store) = store_with_request().await;
        let events = EventBus::default();
        let mut sub = events.subscribe(std::collections::HashSet::from([
            crate::events::Channel::Cli,
        ]));
        let primary = ScriptedBackend::new(vec![BackendResult::Permanent {
            message: "no".to_string(),
        }]);
        let fallback = ScriptedBackend::new(vec![success("yes")]);
        execute_chain(
            &request(),
            &[step("p1", primary), step("p2", fallback)],
            &fast_retry(1),
            &ctx(Duration::from_secs(10)),
            &store,
            &events,
            &Metrics::default(),
        )
        .await;

        let mut providers = Vec::new();
        while let Ok(payload) = sub.rx.try_recv() {
            let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
            assert_eq!(value["type"], "backend_executing");
            providers.push(value["data"]["provider"].as_str().unwrap().to_string());
        }
        assert_eq!(providers, vec!["p1".to_string(), "p2".to_string()]);
    }

    #[tokio::test]
    async fn cancellation_stops_the_chain() {
        let (_dir, store) = store_with_request().await;
        let token = CancellationToken::new();
        token.cancel();
        let ctx = ExecContext::new(Instant::now() + Duration::from_secs(10), token);
        let backend = ScriptedBackend::new(vec![success("never")]);
        let outcome = execute_chain(
            &request(),
            &[step("p1", backend.clone())],
            &fast_retry(3),
            &ctx,
            &store,
            &EventBus::default(),
            &Metrics::default(),
        )
        .await;

        assert!(matches!(
            outcome,
            ExecOutcome::Failure {
                kind: ErrorKind::Cancelled,
                ..
            }
        ));
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn backoff_grows_exponentially_without_jitter() {
        let retry = RetryConfig {
            enabled: true,
            max_attempts: 4,
            base_backoff_ms: 100,
            jitter: false,
        };
        assert_eq!(backoff_delay(&retry, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&retry, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&retry, 3), Duration::from_millis(400));
    }

    #[test]
    fn jitter_stays_within_a_quarter_band() {
        let retry = RetryConfig {
            enabled: true,
            max_attempts: 4,
            base_backoff_ms: 1000,
            jitter: true,
        };
        for _ in 0..50 {
            let delay = backoff_delay(&retry, 1).as_millis() as f64;
            assert!((750.0..=1250.0).contains(&delay), "delay {delay} out of band");
        }
    }
}
