//! Backend abstraction. Every upstream provider, whatever its transport,
//! is reached through the same `Backend` trait so the retry/fallback
//! executor never sees transport details.

pub mod cli;
pub mod http_api;
pub mod terminal;

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, ProviderConfig};
use crate::types::{BackendKind, RequestRecord, TokenUsage};

#[derive(Clone, Debug)]
pub enum BackendResult {
    Success {
        text: String,
        thinking: Option<String>,
        tokens: TokenUsage,
        cost_usd: f64,
    },
    AuthRequired {
        hint_url: Option<String>,
    },
    Transient {
        message: String,
    },
    Permanent {
        message: String,
    },
    RateLimited {
        retry_after_s: Option<u64>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthProbe {
    Ok,
    Degraded(String),
    Down(String),
}

/// Deadline and cancellation travel with every backend call; backends must
/// honor both cooperatively. `chunks` carries incremental output for
/// streaming-capable transports; sends are best-effort and bounded.
#[derive(Clone, Debug)]
pub struct ExecContext {
    pub deadline: Instant,
    pub cancel: CancellationToken,
    pub chunks: Option<mpsc::Sender<String>>,
}

impl ExecContext {
    pub fn new(deadline: Instant, cancel: CancellationToken) -> Self {
        Self {
            deadline,
            cancel,
            chunks: None,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn send_chunk(&self, content: String) {
        if let Some(tx) = &self.chunks {
            let _ = tx.try_send(content);
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn execute(&self, request: &RequestRecord, ctx: &ExecContext) -> BackendResult;

    async fn health_check(&self, ctx: &ExecContext) -> HealthProbe;

    fn estimated_cost(&self, _request: &RequestRecord) -> f64 {
        0.0
    }

    fn kind(&self) -> BackendKind;

    /// Human-readable description of what a call does, surfaced in
    /// `backend_executing` events. CLI backends return a command preview.
    fn describe_call(&self, _request: &RequestRecord) -> Option<String> {
        None
    }
}

/// Build the backend for a provider descriptor. Providers are data; there
/// are exactly three implementations.
pub fn build(config: &ProviderConfig) -> Result<Arc<dyn Backend>, ConfigError> {
    match config.backend_type {
        BackendKind::HttpApi => Ok(Arc::new(http_api::HttpApiBackend::from_config(config)?)),
        BackendKind::Cli => Ok(Arc::new(cli::CliBackend::from_config(config)?)),
        BackendKind::Terminal => Ok(Arc::new(terminal::TerminalBackend::from_config(config)?)),
    }
}

/// Character-class token estimate, used when the upstream does not report
/// usage: CJK code points cost 1 token per 1.5 chars, everything else 1 per
/// 4 chars.
pub fn estimate_tokens(text: &str) -> u32 {
    let mut cjk = 0usize;
    let mut other = 0usize;
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
        } else {
            other += 1;
        }
    }
    (cjk as f64 / 1.5 + other as f64 / 4.0).ceil() as u32
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF       // hiragana, katakana
        | 0x3400..=0x4DBF     // CJK extension A
        | 0x4E00..=0x9FFF     // CJK unified
        | 0xAC00..=0xD7AF     // hangul syllables
        | 0xF900..=0xFAFF     // CJK compatibility
        | 0x20000..=0x2A6DF   // CJK extension B
    )
}

pub fn strip_ansi(text: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let re = ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("ansi regex"));
    re.replace_all(text, "").into_owned()
}

const DEFAULT_AUTH_INDICATORS: &[&str] = &[
    "sign in",
    "log in",
    "login required",
    "authenticate",
    "authentication required",
    "oauth",
    "please visit",
    "device code",
    "api key not",
];

/// Scan command output for auth-prompt markers. Returns `Some(hint_url)`
/// when the output looks like a login prompt; the url is extracted when the
/// tool printed one.
pub fn detect_auth_prompt(output: &str, extra_indicators: &[String]) -> Option<Option<String>> {
    let lowered = output.to_lowercase();
    let matched = DEFAULT_AUTH_INDICATORS
        .iter()
        .any(|marker| lowered.contains(marker))
        || extra_indicators
            .iter()
            .any(|marker| !marker.is_empty() && lowered.contains(&marker.to_lowercase()));
    if !matched {
        return None;
    }
    static URL: OnceLock<Regex> = OnceLock::new();
    let re = URL.get_or_init(|| Regex::new(r#"https?://[^\s"'<>\)\]]+"#).expect("url regex"));
    Some(re.find(output).map(|m| m.as_str().to_string()))
}

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "temporarily",
    "unavailable",
    "rate limit",
    "too many requests",
    "network",
    "econnreset",
    "429",
    "502",
    "503",
    "504",
];

/// Classify a non-zero CLI exit by its diagnostics.
pub fn failure_is_transient(message: &str) -> bool {
    let lowered = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Drop progress banners CLI tools print around the actual answer.
pub fn clean_output(output: &str) -> String {
    const NOISE: &[&str] = &[
        "loading",
        "initializing",
        "connecting",
        "thinking...",
        "processing...",
    ];
    output
        .lines()
        .filter(|line| {
            let lowered = line.to_lowercase();
            !NOISE.iter().any(|marker| lowered.contains(marker))
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
