//! Gateway wiring: owns the store, cache, queue, limiter, provider handles,
//! event bus, and metrics, and implements the intake pipeline that ties
//! them together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::backend::{self, Backend};
use crate::cache::CacheManager;
use crate::config::{GatewayConfig, ProviderConfig};
use crate::error::{GatewayError, Result};
use crate::events::EventBus;
use crate::executor::ChainStep;
use crate::fingerprint::fingerprint;
use crate::health::ProviderRuntime;
use crate::limits::RateLimiter;
use crate::metrics::{GaugeSnapshot, Metrics};
use crate::queue::PriorityQueue;
use crate::single_flight::{await_outcome, Flight, FlightGuard, FlightOutcome, SingleFlight};
use crate::store::SqliteStore;
use crate::types::{
    next_request_id, now_millis, preview, ErrorKind, GatewayEvent, ProviderHealth, RequestRecord,
    RequestStatus, ResponseRecord, TokenUsage,
};
use crate::worker;

const DEFAULT_WORKERS: usize = 4;

pub struct ProviderHandle {
    pub settings: ProviderConfig,
    enabled: AtomicBool,
    pub backend: Arc<dyn Backend>,
    pub semaphore: Arc<Semaphore>,
    pub runtime: Mutex<ProviderRuntime>,
}

impl ProviderHandle {
    fn from_config(settings: ProviderConfig, backend: Arc<dyn Backend>) -> Self {
        let enabled = AtomicBool::new(settings.enabled);
        let semaphore = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        Self {
            settings,
            enabled,
            backend,
            semaphore,
            runtime: Mutex::new(ProviderRuntime::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> u64 {
        let cap = self.settings.concurrency.max(1);
        cap.saturating_sub(self.semaphore.available_permits()) as u64
    }
}

#[derive(Clone, Debug, Default)]
pub struct SubmitParams {
    pub provider: String,
    pub message: String,
    pub model: Option<String>,
    pub agent: Option<String>,
    pub priority: Option<i64>,
    pub timeout_s: Option<f64>,
    pub bypass_cache: bool,
    pub stream: bool,
    pub api_key_id: Option<String>,
    pub api_key_rpm: Option<u32>,
    pub parent_id: Option<String>,
}

#[derive(Clone, Debug)]
pub enum SubmitOutcome {
    /// Served from the cache without touching the queue.
    Cached {
        request: RequestRecord,
        response: ResponseRecord,
    },
    /// Accepted; the request will reach a terminal state asynchronously.
    Queued(RequestRecord),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The request was still queued and is now cancelled.
    Removed,
    /// The request was processing; the worker has been signalled and will
    /// mark it cancelled within the grace window.
    Signalled,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct ProviderStatusView {
    pub name: String,
    pub backend_type: crate::types::BackendKind,
    pub enabled: bool,
    pub health: ProviderHealth,
    pub in_flight: u64,
    pub queue_depth: usize,
    pub avg_latency_ms: f64,
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub last_check_ms: u64,
}

pub struct Gateway {
    pub config: GatewayConfig,
    pub store: SqliteStore,
    pub cache: CacheManager,
    pub flights: SingleFlight,
    pub queue: PriorityQueue,
    pub limiter: RateLimiter,
    pub providers: HashMap<String, Arc<ProviderHandle>>,
    pub events: EventBus,
    pub metrics: Metrics,
    leaders: Mutex<HashMap<String, FlightGuard>>,
    waiters: Mutex<HashMap<String, Arc<Notify>>>,
    cancels: Mutex<HashMap<String, CancellationToken>>,
    streams: Mutex<std::collections::HashSet<String>>,
    started_at: Instant,
}

impl Gateway {
    pub async fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        let store = SqliteStore::new(&config.storage.path);
        store.init().await?;

        let mut providers = HashMap::new();
        for settings in &config.providers {
            let built = backend::build(settings)?;
            providers.insert(
                settings.name.clone(),
                Arc::new(ProviderHandle::from_config(settings.clone(), built)),
            );
        }

        let cache = CacheManager::new(store.clone(), config.cache.clone());
        let queue = PriorityQueue::new(config.queue.max_depth, config.queue.skip_ahead);
        let limiter = RateLimiter::new(config.rate_limit.clone());

        Ok(Self {
            config,
            store,
            cache,
            flights: SingleFlight::default(),
            queue,
            limiter,
            providers,
            events: EventBus::default(),
            metrics: Metrics::default(),
            leaders: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
            streams: Mutex::new(std::collections::HashSet::new()),
            started_at: Instant::now(),
        })
    }

    /// Swap in a different backend for a configured provider. Used by
    /// embedders and tests; providers themselves stay data-driven.
    pub fn register_backend(&mut self, name: &str, backend: Arc<dyn Backend>) -> bool {
        let Some(handle) = self.providers.get(name) else {
            return false;
        };
        let replacement = Arc::new(ProviderHandle::from_config(
            handle.settings.clone(),
            backend,
        ));
        self.providers.insert(name.to_string(), replacement);
        true
    }

    /// Recover interrupted work from the previous run, then start workers
    /// and the background maintenance tasks. Must be called before serving.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let recovered = self.store.startup_recovery().await?;
        for (id, provider) in &recovered {
            self.events.publish(&GatewayEvent::RequestFailed {
                request_id: id.clone(),
                provider: provider.clone(),
                error_kind: ErrorKind::Interrupted,
                message: "gateway restarted while the request was in flight".to_string(),
            });
        }
        if !recovered.is_empty() {
            tracing::warn!(
                count = recovered.len(),
                "marked in-flight requests from the previous run as interrupted"
            );
        }

        let workers = self.config.workers.unwrap_or(DEFAULT_WORKERS).max(1);
        worker::spawn_workers(Arc::clone(self), workers);
        spawn_health_monitor(Arc::clone(self));
        spawn_maintenance(Arc::clone(self));
        tracing::info!(workers, providers = self.providers.len(), "gateway started");
        Ok(())
    }

    pub fn uptime_s(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn provider_handle(&self, name: &str) -> Option<Arc<ProviderHandle>> {
        self.providers.get(name).cloned()
    }

    /// The provider chain for a request: preferred first, then its fallback
    /// chain, skipping disabled entries.
    pub fn chain_for(&self, provider: &str) -> Vec<ChainStep> {
        let mut chain = Vec::new();
        let Some(preferred) = self.providers.get(provider) else {
            return chain;
        };
        chain.push(ChainStep {
            provider: provider.to_string(),
            backend: Arc::clone(&preferred.backend),
        });
        for name in &preferred.settings.fallback_chain {
            if let Some(handle) = self.providers.get(name) {
                if handle.is_enabled() {
                    chain.push(ChainStep {
                        provider: name.clone(),
                        backend: Arc::clone(&handle.backend),
                    });
                }
            }
        }
        chain
    }

    pub async fn submit(self: &Arc<Self>, params: SubmitParams) -> Result<SubmitOutcome> {
        if params.message.trim().is_empty() {
            return Err(GatewayError::Validation {
                reason: "message must not be empty".to_string(),
            });
        }
        let handle = self
            .providers
            .get(&params.provider)
            .ok_or_else(|| GatewayError::UnknownProvider {
                name: params.provider.clone(),
            })?;
        if !handle.is_enabled() {
            return Err(GatewayError::Validation {
                reason: format!("provider {} is disabled", params.provider),
            });
        }

        let key = params
            .api_key_id
            .as_deref()
            .map(|id| (id, params.api_key_rpm));
        if let Err(denied) = self.limiter.try_acquire(key) {
            self.metrics.record_rate_limited();
            return Err(GatewayError::RateLimited {
                retry_after_s: denied.seconds,
            });
        }

        let now = now_millis();
        let timeout_ms = params
            .timeout_s
            .map(|s| (s * 1000.0) as u64)
            .unwrap_or(handle.settings.timeout_s.saturating_mul(1000));
        let print = fingerprint(
            &params.provider,
            params.model.as_deref().or(handle.settings.model.as_deref()),
            params.agent.as_deref(),
            &params.message,
        );
        let request = RequestRecord {
            id: next_request_id(),
            provider: params.provider.clone(),
            model: params.model.clone(),
            agent: params.agent.clone(),
            prompt: params.message.clone(),
            priority: params.priority.unwrap_or(handle.settings.priority),
            status: RequestStatus::Queued,
            attempts: 0,
            fingerprint: print.clone(),
            bypass_cache: params.bypass_cache,
            api_key_id: params.api_key_id.clone(),
            parent_id: params.parent_id.clone(),
            worker: None,
            submitted_at_ms: now,
            deadline_ms: now.saturating_add(timeout_ms),
            updated_at_ms: now,
        };

        self.metrics.record_submitted();
        let use_cache = self.cache.enabled() && !params.bypass_cache;

        if use_cache {
            if let Some(cached) = self.cache.get(&print).await? {
                self.metrics.record_cache_hit();
                return self.serve_from_cache(request, cached).await;
            }
            self.metrics.record_cache_miss();
        }

        if self.queue.depth() >= self.queue.max_depth() {
            self.metrics.record_queue_full();
            return Err(GatewayError::QueueFull);
        }

        if params.stream {
            self.streams
                .lock()
                .expect("streams lock")
                .insert(request.id.clone());
        }

        if use_cache {
            match self.flights.begin(&print) {
                Flight::Leader(guard) => {
                    self.persist_and_enqueue(&request, Some(guard)).await?;
                }
                Flight::Waiter(rx) => {
                    self.metrics.record_coalesced();
                    self.store.put_request(&request).await?;
                    self.events.publish(&GatewayEvent::RequestSubmitted {
                        request_id: request.id.clone(),
                        provider: request.provider.clone(),
                        preview: preview(&request.prompt),
                    });
                    self.spawn_waiter(request.clone(), rx);
                    return Ok(SubmitOutcome::Queued(request));
                }
            }
        } else {
            self.persist_and_enqueue(&request, None).await?;
        }
        Ok(SubmitOutcome::Queued(request))
    }

    async fn serve_from_cache(
        &self,
        request: RequestRecord,
        cached: crate::cache::CachedResponse,
    ) -> Result<SubmitOutcome> {
        let response = ResponseRecord {
            request_id: request.id.clone(),
            text: cached.text,
            thinking: cached.thinking,
            tokens: cached.tokens,
            latency_ms: 0,
            backend: None,
            provider_used: Some(cached.provider_used),
            error_kind: None,
            error_message: None,
            cached: true,
            completed_at_ms: now_millis(),
        };
        self.store.put_request(&request).await?;
        self.store
            .finish(
                &request.id,
                RequestStatus::Queued,
                RequestStatus::Completed,
                &response,
            )
            .await?;
        self.events.publish(&GatewayEvent::RequestSubmitted {
            request_id: request.id.clone(),
            provider: request.provider.clone(),
            preview: preview(&request.prompt),
        });
        self.events.publish(&GatewayEvent::RequestCompleted {
            request_id: request.id.clone(),
            provider: request.provider.clone(),
            latency_ms: 0,
            cached: true,
            preview: preview(&response.text),
        });
        let mut request = request;
        request.status = RequestStatus::Completed;
        Ok(SubmitOutcome::Cached { request, response })
    }

    async fn persist_and_enqueue(
        &self,
        request: &RequestRecord,
        guard: Option<FlightGuard>,
    ) -> Result<()> {
        self.store.put_request(request).await?;
        if let Some(guard) = guard {
            self.leaders
                .lock()
                .expect("leaders lock")
                .insert(request.id.clone(), guard);
        }
        if self
            .queue
            .push(
                request.id.clone(),
                request.provider.clone(),
                request.priority,
                request.submitted_at_ms,
            )
            .is_err()
        {
            // Lost the capacity race after persisting; settle the row so no
            // queued orphan survives.
            self.metrics.record_queue_full();
            self.stream_requested(&request.id);
            self.take_leader(&request.id);
            let response = failure_response(
                &request.id,
                ErrorKind::QueueFull,
                "request queue is full".to_string(),
                None,
            );
            let _ = self
                .store
                .finish(
                    &request.id,
                    RequestStatus::Queued,
                    RequestStatus::Failed,
                    &response,
                )
                .await;
            return Err(GatewayError::QueueFull);
        }
        self.events.publish(&GatewayEvent::RequestSubmitted {
            request_id: request.id.clone(),
            provider: request.provider.clone(),
            preview: preview(&request.prompt),
        });
        Ok(())
    }

    fn spawn_waiter(
        self: &Arc<Self>,
        request: RequestRecord,
        rx: tokio::sync::watch::Receiver<Option<FlightOutcome>>,
    ) {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            let store = gateway.store.clone();
            let events = &gateway.events;
            let outcome = await_outcome(rx).await;
            let now = now_millis();
            let result = match outcome {
                FlightOutcome::Success {
                    text,
                    thinking,
                    tokens,
                    provider_used,
                } => {
                    let response = ResponseRecord {
                        request_id: request.id.clone(),
                        text,
                        thinking,
                        tokens,
                        latency_ms: now.saturating_sub(request.submitted_at_ms),
                        backend: None,
                        provider_used: Some(provider_used.clone()),
                        error_kind: None,
                        error_message: None,
                        cached: true,
                        completed_at_ms: now,
                    };
                    let stored = store
                        .finish(
                            &request.id,
                            RequestStatus::Queued,
                            RequestStatus::Completed,
                            &response,
                        )
                        .await;
                    if stored.is_ok() {
                        events.publish(&GatewayEvent::RequestCompleted {
                            request_id: request.id.clone(),
                            provider: provider_used,
                            latency_ms: response.latency_ms,
                            cached: true,
                            preview: preview(&response.text),
                        });
                    }
                    stored
                }
                FlightOutcome::Failure { kind, message } => {
                    let response =
                        failure_response(&request.id, kind, message.clone(), None);
                    let stored = store
                        .finish(
                            &request.id,
                            RequestStatus::Queued,
                            kind.terminal_status(),
                            &response,
                        )
                        .await;
                    if stored.is_ok() {
                        events.publish(&GatewayEvent::RequestFailed {
                            request_id: request.id.clone(),
                            provider: request.provider.clone(),
                            error_kind: kind,
                            message,
                        });
                    }
                    stored
                }
            };
            if let Err(err) = result {
                // Typically a cancel raced in and took the row terminal.
                tracing::info!(request_id = %request.id, error = %err, "waiter settle skipped");
            }
            gateway.stream_requested(&request.id);
            gateway.notify_terminal(&request.id);
        });
    }

    /// Remove and return the single-flight leadership for a request, if it
    /// holds one.
    pub fn take_leader(&self, request_id: &str) -> Option<FlightGuard> {
        self.leaders
            .lock()
            .expect("leaders lock")
            .remove(request_id)
    }

    pub fn register_cancel_token(&self, request_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancels
            .lock()
            .expect("cancels lock")
            .insert(request_id.to_string(), token.clone());
        token
    }

    pub fn drop_cancel_token(&self, request_id: &str) {
        self.cancels.lock().expect("cancels lock").remove(request_id);
    }

    pub fn stream_requested(&self, request_id: &str) -> bool {
        self.streams
            .lock()
            .expect("streams lock")
            .remove(request_id)
    }

    pub async fn cancel(&self, id: &str) -> Result<CancelOutcome> {
        let request = self
            .store
            .get_request(id)
            .await?
            .ok_or_else(|| GatewayError::NotFound { id: id.to_string() })?;
        if request.status.is_terminal() {
            return Err(GatewayError::TerminalConflict { id: id.to_string() });
        }
        if request.status == RequestStatus::Processing {
            return self.signal_processing(id).await;
        }

        if self.queue.remove(id) {
            let response = failure_response(
                id,
                ErrorKind::Cancelled,
                "cancelled before dispatch".to_string(),
                None,
            );
            self.store
                .finish(id, RequestStatus::Queued, RequestStatus::Cancelled, &response)
                .await?;
            if let Some(guard) = self.take_leader(id) {
                guard.resolve(FlightOutcome::Failure {
                    kind: ErrorKind::Cancelled,
                    message: "coalesced leader was cancelled".to_string(),
                });
            }
            self.metrics.record_cancelled();
            self.events.publish(&GatewayEvent::RequestCancelled {
                request_id: id.to_string(),
            });
            self.notify_terminal(id);
            return Ok(CancelOutcome::Removed);
        }

        let token = self.cancels.lock().expect("cancels lock").get(id).cloned();
        if let Some(token) = token {
            token.cancel();
            return Ok(CancelOutcome::Signalled);
        }

        // Not in the queue and no worker token: a coalesced waiter, or a
        // race with pickup. Settle it directly if it is still queued.
        let response = failure_response(
            id,
            ErrorKind::Cancelled,
            "cancelled before dispatch".to_string(),
            None,
        );
        match self
            .store
            .finish(id, RequestStatus::Queued, RequestStatus::Cancelled, &response)
            .await
        {
            Ok(()) => {
                self.metrics.record_cancelled();
                self.events.publish(&GatewayEvent::RequestCancelled {
                    request_id: id.to_string(),
                });
                self.notify_terminal(id);
                Ok(CancelOutcome::Removed)
            }
            Err(crate::store::StoreError::Conflict { actual, .. })
                if actual == RequestStatus::Processing =>
            {
                self.signal_processing(id).await
            }
            Err(crate::store::StoreError::Conflict { .. }) => {
                Err(GatewayError::TerminalConflict { id: id.to_string() })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Deliver the cancel signal to a request that raced into processing.
    /// Workers register their token before committing the processing
    /// transition, so the token is normally visible on the first check;
    /// the loop covers the commit-to-map propagation and falls back to
    /// settling an ownerless row after the grace window.
    async fn signal_processing(&self, id: &str) -> Result<CancelOutcome> {
        let deadline = Instant::now() + crate::worker::CANCEL_GRACE;
        loop {
            let token = self.cancels.lock().expect("cancels lock").get(id).cloned();
            if let Some(token) = token {
                token.cancel();
                return Ok(CancelOutcome::Signalled);
            }
            let current = self
                .store
                .get_request(id)
                .await?
                .ok_or_else(|| GatewayError::NotFound { id: id.to_string() })?;
            if current.status.is_terminal() {
                return Err(GatewayError::TerminalConflict { id: id.to_string() });
            }
            if Instant::now() >= deadline {
                // No worker owns the row; settle it here so the caller is
                // never told a signal was delivered when none exists.
                let response = failure_response(
                    id,
                    ErrorKind::Cancelled,
                    "cancelled without a live worker".to_string(),
                    None,
                );
                match self
                    .store
                    .finish(
                        id,
                        RequestStatus::Processing,
                        RequestStatus::Cancelled,
                        &response,
                    )
                    .await
                {
                    Ok(()) => {
                        self.metrics.record_cancelled();
                        self.events.publish(&GatewayEvent::RequestCancelled {
                            request_id: id.to_string(),
                        });
                        self.notify_terminal(id);
                        return Ok(CancelOutcome::Removed);
                    }
                    Err(crate::store::StoreError::Conflict { .. }) => {
                        return Err(GatewayError::TerminalConflict { id: id.to_string() });
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn waiter_for(&self, id: &str) -> Arc<Notify> {
        let mut waiters = self.waiters.lock().expect("waiters lock");
        Arc::clone(
            waiters
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    pub fn notify_terminal(&self, id: &str) {
        let notify = self.waiters.lock().expect("waiters lock").remove(id);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }

    /// Block until the request reaches a terminal state, or `timeout`.
    pub async fn wait_for_terminal(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<(RequestRecord, Option<ResponseRecord>)> {
        let deadline = Instant::now() + timeout;
        loop {
            let request = self
                .store
                .get_request(id)
                .await?
                .ok_or_else(|| GatewayError::NotFound { id: id.to_string() })?;
            if request.status.is_terminal() {
                let response = self.store.get_response(id).await?;
                return Ok((request, response));
            }
            if Instant::now() >= deadline {
                return Err(GatewayError::WaitTimeout);
            }
            let notify = self.waiter_for(id);
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    return Err(GatewayError::WaitTimeout);
                }
                // Poll as a backstop against a missed notification.
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    pub fn provider_views(&self) -> Vec<ProviderStatusView> {
        let mut views: Vec<ProviderStatusView> = self
            .providers
            .values()
            .map(|handle| {
                let runtime = handle.runtime.lock().expect("runtime lock");
                ProviderStatusView {
                    name: handle.settings.name.clone(),
                    backend_type: handle.settings.backend_type,
                    enabled: handle.is_enabled(),
                    health: runtime.health(),
                    in_flight: handle.in_flight(),
                    queue_depth: self.queue.depth_for(&handle.settings.name),
                    avg_latency_ms: runtime.avg_latency_ms(),
                    success_rate: runtime.success_rate(),
                    consecutive_failures: runtime.consecutive_failures(),
                    last_check_ms: runtime.last_ping_ms(),
                }
            })
            .collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));
        views
    }

    pub fn gauges(&self) -> GaugeSnapshot {
        GaugeSnapshot {
            in_flight_by_provider: self
                .providers
                .values()
                .map(|handle| (handle.settings.name.clone(), handle.in_flight()))
                .collect(),
            queue_depth: self.queue.depth() as u64,
        }
    }

    pub fn toggle_provider(&self, name: &str) -> Option<bool> {
        let handle = self.providers.get(name)?;
        let next = !handle.is_enabled();
        handle.set_enabled(next);
        tracing::info!(provider = name, enabled = next, "provider toggled");
        Some(next)
    }
}

pub fn failure_response(
    request_id: &str,
    kind: ErrorKind,
    message: String,
    provider_used: Option<String>,
) -> ResponseRecord {
    ResponseRecord {
        request_id: request_id.to_string(),
        text: String::new(),
        thinking: None,
        tokens: TokenUsage::default(),
        latency_ms: 0,
        backend: None,
        provider_used,
        error_kind: Some(kind),
        error_message: Some(message),
        cached: false,
        completed_at_ms: now_millis(),
    }
}

fn spawn_health_monitor(gateway: Arc<Gateway>) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(gateway.config.health.interval_s.max(1));
        loop {
            tokio::time::sleep(interval).await;
            for handle in gateway.providers.values() {
                if !handle.is_enabled() {
                    continue;
                }
                let probe_started = Instant::now();
                let ctx = crate::backend::ExecContext::new(
                    probe_started + Duration::from_secs(10),
                    CancellationToken::new(),
                );
                let probe = tokio::time::timeout(
                    Duration::from_secs(10),
                    handle.backend.health_check(&ctx),
                )
                .await;
                let latency_ms = probe_started.elapsed().as_millis() as u64;
                let ok = matches!(probe, Ok(crate::backend::HealthProbe::Ok));
                let change = {
                    let mut runtime = handle.runtime.lock().expect("runtime lock");
                    runtime.record_probe(
                        crate::health::ProbeSample { ok, latency_ms },
                        &gateway.config.health,
                        now_millis(),
                    )
                };
                if let Some((from, to)) = change {
                    tracing::info!(
                        provider = %handle.settings.name,
                        from = from.as_str(),
                        to = to.as_str(),
                        "provider health changed"
                    );
                    gateway.events.publish(&GatewayEvent::ProviderHealthChanged {
                        provider: handle.settings.name.clone(),
                        from,
                        to,
                    });
                }
            }
        }
    });
}

fn spawn_maintenance(gateway: Arc<Gateway>) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(3600);
        loop {
            tokio::time::sleep(interval).await;
            match gateway
                .store
                .cleanup_old_requests(gateway.config.storage.request_ttl_hours)
                .await
            {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "pruned expired request rows");
                }
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "request cleanup failed"),
            }
            match gateway.cache.cleanup().await {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "pruned expired cache entries");
                }
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "cache cleanup failed"),
            }
        }
    });
}
