//! Core data model: request/response records, lifecycle statuses, error
//! kinds, and the lifecycle events broadcast on the bus.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

/// Time-ordered unique request id. Millisecond prefix keeps lexicographic
/// order aligned with submission order; the sequence suffix disambiguates
/// ids minted within the same millisecond.
pub fn next_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("req-{:012x}-{:04x}", now_millis(), seq & 0xffff)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    AuthRequired,
    RateLimited,
    TransientBackend,
    PermanentBackend,
    TimedOut,
    Cancelled,
    Interrupted,
    QueueFull,
    StorageUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::AuthRequired => "auth_required",
            Self::RateLimited => "rate_limited",
            Self::TransientBackend => "transient_backend",
            Self::PermanentBackend => "permanent_backend",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
            Self::QueueFull => "queue_full",
            Self::StorageUnavailable => "storage_unavailable",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "validation" => Some(Self::Validation),
            "auth_required" => Some(Self::AuthRequired),
            "rate_limited" => Some(Self::RateLimited),
            "transient_backend" => Some(Self::TransientBackend),
            "permanent_backend" => Some(Self::PermanentBackend),
            "timed_out" => Some(Self::TimedOut),
            "cancelled" => Some(Self::Cancelled),
            "interrupted" => Some(Self::Interrupted),
            "queue_full" => Some(Self::QueueFull),
            "storage_unavailable" => Some(Self::StorageUnavailable),
            _ => None,
        }
    }

    /// The terminal status a request lands in when this kind is final.
    pub fn terminal_status(&self) -> RequestStatus {
        match self {
            Self::TimedOut => RequestStatus::TimedOut,
            Self::Cancelled => RequestStatus::Cancelled,
            _ => RequestStatus::Failed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    HttpApi,
    Cli,
    Terminal,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpApi => "http_api",
            Self::Cli => "cli",
            Self::Terminal => "terminal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "http_api" => Some(Self::HttpApi),
            "cli" => Some(Self::Cli),
            "terminal" => Some(Self::Terminal),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderHealth {
    Ok,
    Degraded,
    Down,
    Unknown,
}

impl ProviderHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Degraded => "degraded",
            Self::Down => "down",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
    pub total: u32,
}

impl TokenUsage {
    pub fn new(input: u32, output: u32) -> Self {
        Self {
            input,
            output,
            total: input.saturating_add(output),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub prompt: String,
    pub priority: i64,
    pub status: RequestStatus,
    pub attempts: u32,
    pub fingerprint: String,
    pub bypass_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<u64>,
    pub submitted_at_ms: u64,
    pub deadline_ms: u64,
    pub updated_at_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub request_id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub tokens: TokenUsage,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub cached: bool,
    pub completed_at_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Disabled,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// Api key as surfaced by the admin API. The secret is hashed at rest and
/// never part of this record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub name: String,
    pub status: KeyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpm: Option<u32>,
    pub created_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CostSample {
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub ts_ms: u64,
}

/// Lifecycle events broadcast to WebSocket subscribers. Serialized once per
/// publication as `{"type": ..., "data": ..., "ts_ms": ...}`.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayEvent {
    RequestSubmitted {
        request_id: String,
        provider: String,
        preview: String,
    },
    RequestProcessing {
        request_id: String,
        provider: String,
    },
    RequestCompleted {
        request_id: String,
        provider: String,
        latency_ms: u64,
        cached: bool,
        preview: String,
    },
    RequestFailed {
        request_id: String,
        provider: String,
        error_kind: ErrorKind,
        message: String,
    },
    RequestCancelled {
        request_id: String,
    },
    BackendExecuting {
        request_id: String,
        provider: String,
        backend: BackendKind,
        attempt: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
    ProviderHealthChanged {
        provider: String,
        from: ProviderHealth,
        to: ProviderHealth,
    },
    StreamChunk {
        request_id: String,
        seq: u64,
        content: String,
    },
}

/// Truncate text for event payloads and log lines.
pub fn preview(text: &str) -> String {
    const MAX: usize = 100;
    if text.chars().count() <= MAX {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX).collect();
    format!("{cut}...")
}
