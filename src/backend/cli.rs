//! CLI backend: one short-lived subprocess per attempt. The prompt goes in
//! as the final argument (or on stdin), stdout is collected line by line
//! until exit or deadline, and the output is scrubbed before it becomes the
//! response text.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::{
    clean_output, detect_auth_prompt, estimate_tokens, failure_is_transient, strip_ansi, Backend,
    BackendResult, ExecContext, HealthProbe,
};
use crate::config::{ConfigError, CostPer1k, ProviderConfig};
use crate::types::{BackendKind, RequestRecord, TokenUsage};

const PROMPT_PLACEHOLDER: &str = "{prompt}";
const KILL_GRACE: Duration = Duration::from_secs(2);

pub struct CliBackend {
    command: String,
    args_template: Vec<String>,
    env: BTreeMap<String, String>,
    prompt_on_stdin: bool,
    auth_indicators: Vec<String>,
    cost_per_1k: Option<CostPer1k>,
}

impl CliBackend {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ConfigError> {
        let command = config.command.clone().ok_or_else(|| ConfigError::Invalid {
            reason: format!("cli provider {} is missing a command", config.name),
        })?;
        Ok(Self {
            command,
            args_template: config.args_template.clone(),
            env: config.env.clone(),
            prompt_on_stdin: config.prompt_on_stdin,
            auth_indicators: config.auth_indicators.clone(),
            cost_per_1k: config.cost_per_1k,
        })
    }

    fn build_args(&self, prompt: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(self.args_template.len() + 1);
        let mut substituted = false;
        for arg in &self.args_template {
            if arg.contains(PROMPT_PLACEHOLDER) {
                args.push(arg.replace(PROMPT_PLACEHOLDER, prompt));
                substituted = true;
            } else {
                args.push(arg.clone());
            }
        }
        if !substituted && !self.prompt_on_stdin {
            args.push(prompt.to_string());
        }
        args
    }

    fn command_preview(&self, prompt: &str) -> String {
        let args = self.build_args(prompt);
        let mut parts = vec![self.command.clone()];
        parts.extend(args.into_iter().take(2));
        let mut preview = parts.join(" ");
        if preview.len() > 120 {
            preview.truncate(120);
        }
        format!("{preview} ...")
    }

    fn classify(&self, exit_ok: bool, stdout: &str, stderr: &str, tokens: TokenUsage) -> BackendResult {
        let combined = format!("{stdout}\n{stderr}");
        if let Some(hint_url) = detect_auth_prompt(&combined, &self.auth_indicators) {
            return BackendResult::AuthRequired { hint_url };
        }
        if exit_ok {
            let text = clean_output(&strip_ansi(stdout));
            let cost_usd = self
                .cost_per_1k
                .map(|cost| {
                    (tokens.input as f64 / 1000.0) * cost.input
                        + (tokens.output as f64 / 1000.0) * cost.output
                })
                .unwrap_or(0.0);
            return BackendResult::Success {
                text,
                thinking: None,
                tokens,
                cost_usd,
            };
        }
        let message = if stderr.trim().is_empty() {
            "cli exited with a non-zero status".to_string()
        } else {
            strip_ansi(stderr.trim())
        };
        if failure_is_transient(&message) {
            BackendResult::Transient { message }
        } else {
            BackendResult::Permanent { message }
        }
    }
}

#[async_trait]
impl Backend for CliBackend {
    async fn execute(&self, request: &RequestRecord, ctx: &ExecContext) -> BackendResult {
        let args = self.build_args(&request.prompt);
        let mut command = Command::new(&self.command);
        command
            .args(&args)
            .envs(&self.env)
            .stdin(if self.prompt_on_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return BackendResult::Permanent {
                    message: format!("failed to spawn {}: {err}", self.command),
                };
            }
        };

        if self.prompt_on_stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let payload = format!("{}\n", request.prompt);
                if let Err(err) = stdin.write_all(payload.as_bytes()).await {
                    let _ = child.start_kill();
                    return BackendResult::Transient {
                        message: format!("failed to write prompt to stdin: {err}"),
                    };
                }
                drop(stdin);
            }
        }

        let stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let mut collected = String::new();
        let read_stdout = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    ctx.send_chunk(line.clone());
                    collected.push_str(&line);
                    collected.push('\n');
                }
            }
        };

        let finished = tokio::select! {
            _ = ctx.cancel.cancelled() => false,
            _ = tokio::time::sleep(ctx.remaining()) => false,
            _ = read_stdout => true,
        };

        if !finished {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
            let message = if ctx.cancel.is_cancelled() {
                "cli terminated after cancellation".to_string()
            } else {
                "cli timed out before completing".to_string()
            };
            return BackendResult::Transient { message };
        }

        let status = match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                return BackendResult::Transient {
                    message: format!("failed to reap cli process: {err}"),
                };
            }
            Err(_) => {
                let _ = child.start_kill();
                return BackendResult::Transient {
                    message: "cli closed stdout but did not exit".to_string(),
                };
            }
        };

        let mut err_output = String::new();
        if let Some(stderr) = stderr.as_mut() {
            let _ = stderr.read_to_string(&mut err_output).await;
        }

        let text = clean_output(&strip_ansi(&collected));
        let tokens = TokenUsage::new(
            estimate_tokens(&request.prompt),
            estimate_tokens(&text),
        );
        self.classify(status.success(), &collected, &err_output, tokens)
    }

    async fn health_check(&self, _ctx: &ExecContext) -> HealthProbe {
        let spawned = Command::new(&self.command)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => return HealthProbe::Down(format!("cannot spawn {}: {err}", self.command)),
        };
        // Some tools do not support --version; any clean exit means the
        // binary is present and runnable.
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(_)) => HealthProbe::Ok,
            Ok(Err(err)) => HealthProbe::Down(format!("wait failed: {err}")),
            Err(_) => {
                let _ = child.start_kill();
                HealthProbe::Degraded("version probe timed out".to_string())
            }
        }
    }

    fn estimated_cost(&self, request: &RequestRecord) -> f64 {
        let Some(cost) = self.cost_per_1k else {
            return 0.0;
        };
        (estimate_tokens(&request.prompt) as f64 / 1000.0) * cost.input
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Cli
    }

    fn describe_call(&self, request: &RequestRecord) -> Option<String> {
        Some(self.command_preview(&request.prompt))
    }
}
