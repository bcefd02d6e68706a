//! Worker pool: pops runnable requests off the priority queue, runs the
//! retry/fallback executor under the request deadline and cancel signal,
//! and commits the terminal state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::backend::ExecContext;
use crate::executor::{execute_chain, ExecOutcome};
use crate::queue::QueuedItem;
use crate::server::{failure_response, Gateway};
use crate::single_flight::FlightOutcome;
use crate::store::StoreError;
use crate::types::{
    now_millis, preview, CostSample, ErrorKind, GatewayEvent, RequestStatus, ResponseRecord,
};

/// How long a cancelled backend gets to unwind before the worker abandons
/// the execution task.
pub const CANCEL_GRACE: Duration = Duration::from_secs(2);

const IDLE_POLL: Duration = Duration::from_millis(200);

pub fn spawn_workers(gateway: Arc<Gateway>, count: usize) {
    for worker_id in 0..count.max(1) {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            worker_loop(gateway, worker_id as u64).await;
        });
    }
}

async fn worker_loop(gateway: Arc<Gateway>, worker_id: u64) {
    loop {
        let item = gateway.queue.pop_runnable(|candidate| {
            let Some(handle) = gateway.providers.get(&candidate.provider) else {
                // Unknown providers are rejected at intake; treat a stale
                // row as runnable so it fails fast below.
                return true;
            };
            handle.is_enabled()
                && handle.semaphore.available_permits() > 0
                && gateway
                    .limiter
                    .try_acquire_provider(&candidate.provider, handle.settings.rpm)
        });
        match item {
            Some(item) => process(&gateway, item, worker_id).await,
            None => {
                tokio::select! {
                    _ = gateway.queue.wait_for_work() => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
        }
    }
}

async fn process(gateway: &Arc<Gateway>, item: QueuedItem, worker_id: u64) {
    let Ok(Some(request)) = gateway.store.get_request(&item.id).await else {
        tracing::warn!(request_id = %item.id, "queued request missing from the store");
        return;
    };
    if request.status != RequestStatus::Queued {
        // Cancelled between queue pop and pickup.
        return;
    }

    let Some(handle) = gateway.provider_handle(&request.provider) else {
        let response = failure_response(
            &request.id,
            ErrorKind::PermanentBackend,
            format!("provider {} is not configured", request.provider),
            None,
        );
        if let Err(err) = gateway
            .store
            .finish(
                &request.id,
                RequestStatus::Queued,
                RequestStatus::Failed,
                &response,
            )
            .await
        {
            tracing::error!(request_id = %request.id, error = %err, "failed to settle orphan");
        }
        gateway.notify_terminal(&request.id);
        return;
    };

    let permit = match Arc::clone(&handle.semaphore).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    // Register the cancel token before the processing commit: anyone who
    // observes this request as processing can also find and signal it.
    let token = gateway.register_cancel_token(&request.id);
    match gateway.store.mark_processing(&request.id, worker_id).await {
        Ok(()) => {}
        Err(StoreError::Conflict { .. }) => {
            gateway.drop_cancel_token(&request.id);
            return;
        }
        Err(err) => {
            tracing::error!(request_id = %request.id, error = %err, "pickup transition failed");
            gateway.drop_cancel_token(&request.id);
            return;
        }
    }

    gateway
        .metrics
        .observe_queue_wait(Duration::from_millis(
            now_millis().saturating_sub(request.submitted_at_ms),
        ));
    gateway.events.publish(&GatewayEvent::RequestProcessing {
        request_id: request.id.clone(),
        provider: request.provider.clone(),
    });

    let deadline = deadline_instant(request.deadline_ms);
    let mut ctx = ExecContext::new(deadline, token.clone());
    let mut chunk_task = None;
    if gateway.stream_requested(&request.id) {
        let (tx, task) = spawn_chunk_forwarder(gateway, &request.id);
        ctx.chunks = Some(tx);
        chunk_task = Some(task);
    }

    let chain = gateway.chain_for(&request.provider);
    let started = Instant::now();

    let exec_gateway = Arc::clone(gateway);
    let exec_request = request.clone();
    let exec_ctx = ctx.clone();
    let mut exec_task = tokio::spawn(async move {
        execute_chain(
            &exec_request,
            &chain,
            &exec_gateway.config.retry,
            &exec_ctx,
            &exec_gateway.store,
            &exec_gateway.events,
            &exec_gateway.metrics,
        )
        .await
    });

    let outcome = tokio::select! {
        joined = &mut exec_task => join_outcome(joined, &request.provider),
        _ = token.cancelled() => {
            // Cooperative unwind first; force-terminate after the grace
            // window so a cancelled transition is never delayed past it.
            match tokio::time::timeout(CANCEL_GRACE, &mut exec_task).await {
                Ok(joined) => join_outcome(joined, &request.provider),
                Err(_) => {
                    exec_task.abort();
                    ExecOutcome::Failure {
                        kind: ErrorKind::Cancelled,
                        message: "backend did not unwind within the grace window".to_string(),
                        provider: request.provider.clone(),
                    }
                }
            }
        }
    };
    let outcome = if token.is_cancelled() {
        ExecOutcome::Failure {
            kind: ErrorKind::Cancelled,
            message: "request cancelled".to_string(),
            provider: request.provider.clone(),
        }
    } else {
        outcome
    };

    // Drop our chunk sender and drain the forwarder so every stream_chunk
    // event precedes the terminal event for this request.
    ctx.chunks = None;
    if let Some(task) = chunk_task {
        let _ = task.await;
    }

    let latency_ms = started.elapsed().as_millis() as u64;
    match outcome {
        ExecOutcome::Success {
            text,
            thinking,
            tokens,
            cost_usd,
            provider,
            backend,
        } => {
            let response = ResponseRecord {
                request_id: request.id.clone(),
                text,
                thinking,
                tokens,
                latency_ms,
                backend: Some(backend),
                provider_used: Some(provider.clone()),
                error_kind: None,
                error_message: None,
                cached: false,
                completed_at_ms: now_millis(),
            };
            settle_success(gateway, &request, &provider, response).await;
        }
        ExecOutcome::Failure {
            kind,
            message,
            provider,
        } => {
            settle_failure(gateway, &request.id, &provider, kind, message, Some(latency_ms)).await;
        }
    }

    gateway.drop_cancel_token(&request.id);
    drop(permit);
    gateway.queue.wake();
}

fn join_outcome(
    joined: Result<ExecOutcome, tokio::task::JoinError>,
    provider: &str,
) -> ExecOutcome {
    joined.unwrap_or_else(|err| {
        tracing::error!(error = %err, "executor task failed");
        ExecOutcome::Failure {
            kind: ErrorKind::TransientBackend,
            message: "executor task aborted".to_string(),
            provider: provider.to_string(),
        }
    })
}

async fn settle_success(
    gateway: &Arc<Gateway>,
    request: &crate::types::RequestRecord,
    provider: &str,
    response: ResponseRecord,
) {
    // Cache before the terminal commit becomes observable: anyone who sees
    // this request completed (waiters included) must also see the entry.
    let serving_handle = gateway.provider_handle(provider);
    if !request.bypass_cache {
        let ttl_override = serving_handle
            .as_ref()
            .and_then(|handle| handle.settings.cache_ttl_s);
        if let Err(err) = gateway
            .cache
            .put(&request.fingerprint, &response, ttl_override)
            .await
        {
            tracing::error!(request_id = %request.id, error = %err, "cache write failed");
        }
    }

    let stored = gateway
        .store
        .finish(
            &request.id,
            RequestStatus::Processing,
            RequestStatus::Completed,
            &response,
        )
        .await;
    if let Err(err) = stored {
        tracing::error!(request_id = %request.id, error = %err, "failed to commit completion");
        if let Some(guard) = gateway.take_leader(&request.id) {
            guard.resolve(FlightOutcome::Failure {
                kind: ErrorKind::StorageUnavailable,
                message: "state store rejected the completion".to_string(),
            });
        }
        gateway.notify_terminal(&request.id);
        return;
    }

    if let Some(guard) = gateway.take_leader(&request.id) {
        guard.resolve(FlightOutcome::Success {
            text: response.text.clone(),
            thinking: response.thinking.clone(),
            tokens: response.tokens,
            provider_used: provider.to_string(),
        });
    }

    let cost_usd = serving_handle
        .as_ref()
        .map(|handle| {
            handle
                .settings
                .cost_per_1k
                .map(|cost| {
                    (response.tokens.input as f64 / 1000.0) * cost.input
                        + (response.tokens.output as f64 / 1000.0) * cost.output
                })
                .unwrap_or(0.0)
        })
        .unwrap_or(0.0);
    let sample = CostSample {
        provider: provider.to_string(),
        request_id: Some(request.id.clone()),
        model: request.model.clone(),
        input_tokens: response.tokens.input as u64,
        output_tokens: response.tokens.output as u64,
        cost_usd,
        ts_ms: now_millis(),
    };
    if let Err(err) = gateway.store.cost_sample_append(&sample).await {
        tracing::error!(request_id = %request.id, error = %err, "cost sample write failed");
    }

    gateway
        .metrics
        .record_completed(provider, Duration::from_millis(response.latency_ms));
    gateway.events.publish(&GatewayEvent::RequestCompleted {
        request_id: request.id.clone(),
        provider: provider.to_string(),
        latency_ms: response.latency_ms,
        cached: false,
        preview: preview(&response.text),
    });
    gateway.notify_terminal(&request.id);
}

async fn settle_failure(
    gateway: &Arc<Gateway>,
    request_id: &str,
    provider: &str,
    kind: ErrorKind,
    message: String,
    latency_ms: Option<u64>,
) {
    let mut response = failure_response(request_id, kind, message.clone(), Some(provider.to_string()));
    if let Some(latency_ms) = latency_ms {
        response.latency_ms = latency_ms;
    }
    let to = kind.terminal_status();
    let stored = gateway
        .store
        .finish(request_id, RequestStatus::Processing, to, &response)
        .await;
    if let Err(err) = stored {
        tracing::error!(request_id, error = %err, "failed to commit failure");
    }

    if let Some(guard) = gateway.take_leader(request_id) {
        guard.resolve(FlightOutcome::Failure {
            kind,
            message: message.clone(),
        });
    }

    match kind {
        ErrorKind::Cancelled => {
            gateway.metrics.record_cancelled();
            gateway.events.publish(&GatewayEvent::RequestCancelled {
                request_id: request_id.to_string(),
            });
        }
        ErrorKind::TimedOut => {
            gateway.metrics.record_timed_out();
            gateway.events.publish(&GatewayEvent::RequestFailed {
                request_id: request_id.to_string(),
                provider: provider.to_string(),
                error_kind: kind,
                message,
            });
        }
        _ => {
            gateway.metrics.record_failed(provider);
            gateway.events.publish(&GatewayEvent::RequestFailed {
                request_id: request_id.to_string(),
                provider: provider.to_string(),
                error_kind: kind,
                message,
            });
        }
    }
    gateway.notify_terminal(request_id);
}

fn deadline_instant(deadline_ms: u64) -> Instant {
    let now = now_millis();
    let remaining = deadline_ms.saturating_sub(now);
    Instant::now() + Duration::from_millis(remaining)
}

fn spawn_chunk_forwarder(
    gateway: &Arc<Gateway>,
    request_id: &str,
) -> (mpsc::Sender<String>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let gateway = Arc::clone(gateway);
    let request_id = request_id.to_string();
    let task = tokio::spawn(async move {
        let mut seq = 0u64;
        while let Some(content) = rx.recv().await {
            gateway.events.publish(&GatewayEvent::StreamChunk {
                request_id: request_id.clone(),
                seq,
                content,
            });
            seq += 1;
        }
    });
    (tx, task)
}
