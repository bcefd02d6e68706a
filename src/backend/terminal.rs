//! Terminal backend for CLIs that require a TTY. The prompt is written into
//! a pre-attached multiplexer pane and the pane's output tail is polled
//! until the configured completion marker shows up.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{
    clean_output, detect_auth_prompt, estimate_tokens, strip_ansi, Backend, BackendResult,
    ExecContext, HealthProbe,
};
use crate::config::{ConfigError, ProviderConfig};
use crate::types::{BackendKind, RequestRecord, TokenUsage};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const CAPTURE_LINES: u32 = 200;

pub struct TerminalBackend {
    pane_id: String,
    prompt_prefix: String,
    completion_marker: String,
    auth_indicators: Vec<String>,
}

impl TerminalBackend {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ConfigError> {
        let pane_id = config.pane_id.clone().ok_or_else(|| ConfigError::Invalid {
            reason: format!("terminal provider {} is missing a pane_id", config.name),
        })?;
        let completion_marker =
            config
                .completion_marker
                .clone()
                .ok_or_else(|| ConfigError::Invalid {
                    reason: format!(
                        "terminal provider {} is missing a completion_marker",
                        config.name
                    ),
                })?;
        Ok(Self {
            pane_id,
            prompt_prefix: config.prompt_prefix.clone().unwrap_or_default(),
            completion_marker,
            auth_indicators: config.auth_indicators.clone(),
        })
    }

    async fn send_keys(&self, text: &str) -> Result<(), String> {
        run_tmux(&["send-keys", "-t", &self.pane_id, "-l", text]).await?;
        run_tmux(&["send-keys", "-t", &self.pane_id, "Enter"]).await?;
        Ok(())
    }

    async fn capture_tail(&self) -> Result<String, String> {
        let start = format!("-{CAPTURE_LINES}");
        run_tmux(&["capture-pane", "-p", "-t", &self.pane_id, "-S", &start]).await
    }

    /// Pull the response out of the pane tail: everything between the echo
    /// of our prompt line and the completion marker that followed it.
    fn extract_response(&self, tail: &str, sent_line: &str) -> Option<String> {
        let after_prompt = match tail.rfind(sent_line) {
            Some(position) => &tail[position + sent_line.len()..],
            None => tail,
        };
        let marker_at = after_prompt.find(&self.completion_marker)?;
        Some(after_prompt[..marker_at].to_string())
    }

    async fn abort_pane(&self) {
        let _ = run_tmux(&["send-keys", "-t", &self.pane_id, "C-c"]).await;
    }
}

async fn run_tmux(args: &[&str]) -> Result<String, String> {
    let output = Command::new("tmux")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| format!("tmux failed to start: {err}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("tmux {}: {}", args.first().unwrap_or(&""), stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl Backend for TerminalBackend {
    async fn execute(&self, request: &RequestRecord, ctx: &ExecContext) -> BackendResult {
        let sent_line = format!("{}{}", self.prompt_prefix, request.prompt);
        if let Err(err) = self.send_keys(&sent_line).await {
            return BackendResult::Transient {
                message: format!("failed to write prompt into pane: {err}"),
            };
        }

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    self.abort_pane().await;
                    return BackendResult::Transient {
                        message: "pane transaction aborted after cancellation".to_string(),
                    };
                }
                _ = tokio::time::sleep(POLL_INTERVAL.min(ctx.remaining().max(Duration::from_millis(1)))) => {}
            }
            if ctx.expired() {
                self.abort_pane().await;
                return BackendResult::Transient {
                    message: "pane output did not complete before the deadline".to_string(),
                };
            }

            let tail = match self.capture_tail().await {
                Ok(tail) => tail,
                Err(err) => {
                    return BackendResult::Transient {
                        message: format!("failed to capture pane output: {err}"),
                    };
                }
            };

            if let Some(hint_url) = detect_auth_prompt(&tail, &self.auth_indicators) {
                return BackendResult::AuthRequired { hint_url };
            }

            if let Some(raw) = self.extract_response(&tail, &sent_line) {
                let text = clean_output(&strip_ansi(&raw));
                ctx.send_chunk(text.clone());
                let tokens = TokenUsage::new(
                    estimate_tokens(&request.prompt),
                    estimate_tokens(&text),
                );
                return BackendResult::Success {
                    text,
                    thinking: None,
                    tokens,
                    cost_usd: 0.0,
                };
            }
        }
    }

    async fn health_check(&self, _ctx: &ExecContext) -> HealthProbe {
        match run_tmux(&["display-message", "-p", "-t", &self.pane_id, "ok"]).await {
            Ok(_) => HealthProbe::Ok,
            Err(err) => HealthProbe::Down(err),
        }
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Terminal
    }

    fn describe_call(&self, _request: &RequestRecord) -> Option<String> {
        Some(format!("tmux send-keys -t {}", self.pane_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> TerminalBackend {
        TerminalBackend {
            pane_id: "%3".to_string(),
            prompt_prefix: "> ".to_string(),
            completion_marker: "<<DONE>>".to_string(),
            auth_indicators: Vec::new(),
        }
    }

    #[test]
    fn response_is_text_between_prompt_echo_and_marker() {
        let b = backend();
        let tail = "old scrollback\n> what is 2+2\nthe answer is 4\n<<DONE>>\n";
        let extracted = b.extract_response(tail, "> what is 2+2").expect("some");
        assert_eq!(extracted.trim(), "the answer is 4");
    }

    #[test]
    fn missing_marker_means_still_running() {
        let b = backend();
        let tail = "> what is 2+2\nstill typing";
        assert!(b.extract_response(tail, "> what is 2+2").is_none());
    }

    #[test]
    fn latest_prompt_occurrence_wins() {
        let b = backend();
        let tail = "> q\nstale\n<<DONE>>\n> q\nfresh\n<<DONE>>\n";
        let extracted = b.extract_response(tail, "> q").expect("some");
        assert_eq!(extracted.trim(), "fresh");
    }
}
