//! Runtime configuration: clap flags mirrored one-to-one by `CHANNEL_*`
//! environment variables, with CLI taking precedence over env over defaults.

use clap::{ArgAction, Parser, ValueEnum};

use iris_core::AckPolicy;

pub const DEFAULT_CURSOR_STATE_PATH: &str = ".iris/telegram-cursor-state.json";

fn parse_positive_f64(value: &str) -> Result<f64, String> {
    let parsed = value
        .parse::<f64>()
        .map_err(|error| format!("failed to parse number: {error}"))?;
    if !parsed.is_finite() || parsed <= 0.0 {
        return Err("value must be a finite number greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_flexible_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("'{other}' is not a boolean value")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
/// Enumerates supported `CliAckPolicy` values.
pub enum CliAckPolicy {
    Always,
    OnSuccess,
}

impl CliAckPolicy {
    pub fn into_ack_policy(self) -> AckPolicy {
        match self {
            Self::Always => AckPolicy::Always,
            Self::OnSuccess => AckPolicy::OnSuccess,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
/// Enumerates supported `OrchestratorMode` values.
pub enum OrchestratorMode {
    Default,
    Codex,
}

impl OrchestratorMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Codex => "codex",
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "iris",
    about = "Telegram-bridging chat runtime: poll, orchestrate, reply, ack",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "CHANNEL_TOKEN",
        default_value = "",
        hide_env_values = true,
        help = "Telegram bot token (required here or via CHANNEL_TOKEN)"
    )]
    pub token: String,

    #[arg(
        long,
        env = "CHANNEL_MODE",
        default_value = "poll",
        help = "Transport mode; only long polling is supported"
    )]
    pub mode: String,

    #[arg(
        long = "ack-policy",
        env = "CHANNEL_ACK_POLICY",
        value_enum,
        default_value = "always",
        help = "When to advance the delivery cursor past an update"
    )]
    pub ack_policy: CliAckPolicy,

    #[arg(
        long = "orchestrator-mode",
        env = "CHANNEL_ORCHESTRATOR_MODE",
        value_enum,
        default_value = "default",
        help = "Message orchestrator: built-in echo or the codex subprocess bridge"
    )]
    pub orchestrator_mode: OrchestratorMode,

    #[arg(
        long = "poll-interval-s",
        env = "CHANNEL_POLL_INTERVAL_S",
        default_value = "2.0",
        value_parser = parse_positive_f64,
        help = "Sleep between cycles in continuous mode, seconds"
    )]
    pub poll_interval_s: f64,

    #[arg(
        long = "allowed-chat-ids",
        env = "CHANNEL_ALLOWED_CHAT_IDS",
        default_value = "",
        help = "Comma-separated chat allowlist; empty disables the gate"
    )]
    pub allowed_chat_ids: String,

    #[arg(
        long = "live-mode",
        env = "CHANNEL_LIVE_MODE",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = parse_flexible_bool,
        help = "Live traffic guard; requires a non-empty allowlist"
    )]
    pub live_mode: bool,

    #[arg(
        long = "codex-timeout-s",
        env = "CHANNEL_CODEX_TIMEOUT_S",
        default_value = "20.0",
        value_parser = parse_positive_f64,
        help = "Per-message deadline for codex subprocess invocations, seconds"
    )]
    pub codex_timeout_s: f64,

    #[arg(
        long = "notify-on-orchestrator-error",
        env = "CHANNEL_NOTIFY_ON_ORCHESTRATOR_ERROR",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = parse_flexible_bool,
        help = "Reply with a short fallback line when the orchestrator fails"
    )]
    pub notify_on_orchestrator_error: bool,

    #[arg(
        long = "codex-session-max",
        env = "CHANNEL_CODEX_SESSION_MAX",
        default_value = "128",
        value_parser = parse_positive_usize,
        help = "Maximum live codex session workers before LRU eviction"
    )]
    pub codex_session_max: usize,

    #[arg(
        long = "codex-session-idle-ttl-s",
        env = "CHANNEL_CODEX_SESSION_IDLE_TTL_S",
        default_value = "900.0",
        value_parser = parse_positive_f64,
        help = "Idle lifetime of a codex session worker, seconds"
    )]
    pub codex_session_idle_ttl_s: f64,

    #[arg(
        long = "cursor-state-path",
        env = "CHANNEL_CURSOR_STATE_PATH",
        default_value = DEFAULT_CURSOR_STATE_PATH,
        help = "Durable cursor floor file; empty disables persistence"
    )]
    pub cursor_state_path: String,

    #[arg(
        long = "strict-cursor-state-io",
        env = "CHANNEL_STRICT_CURSOR_STATE_IO",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = parse_flexible_bool,
        help = "Promote cursor state IO failures to cycle failures"
    )]
    pub strict_cursor_state_io: bool,

    #[arg(
        long = "enable-memory-hook",
        env = "CHANNEL_ENABLE_MEMORY_HOOK",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = parse_flexible_bool,
        help = "Let the echo orchestrator append knowledge-base snippets"
    )]
    pub enable_memory_hook: bool,

    #[arg(
        long = "api-base",
        env = "CHANNEL_API_BASE",
        default_value = "https://api.telegram.org",
        help = "Upstream Bot API base URL"
    )]
    pub api_base: String,

    #[arg(long, action = ArgAction::SetTrue, help = "Run one cycle, emit its payload, exit")]
    pub once: bool,
}

/// Raised when runtime configuration cannot be validated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ConfigValidationError(pub String);

/// Validated runtime configuration consumed by the cycle loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub token: String,
    pub mode: String,
    pub ack_policy: AckPolicy,
    pub orchestrator_mode: OrchestratorMode,
    pub poll_interval_s: f64,
    pub allowed_chat_ids: Vec<String>,
    pub live_mode: bool,
    pub codex_timeout_s: f64,
    pub notify_on_orchestrator_error: bool,
    pub codex_session_max: usize,
    pub codex_session_idle_ttl_s: f64,
    pub cursor_state_path: String,
    pub strict_cursor_state_io: bool,
    pub enable_memory_hook: bool,
    pub api_base: String,
    pub once: bool,
}

pub fn resolve_runtime_config(cli: Cli) -> Result<RuntimeConfig, ConfigValidationError> {
    let token = cli.token.trim().to_string();
    if token.is_empty() {
        return Err(ConfigValidationError(
            "token must be a non-empty string (set --token or CHANNEL_TOKEN)".to_string(),
        ));
    }

    let mode = cli.mode.trim().to_string();
    if mode != "poll" {
        return Err(ConfigValidationError(format!(
            "mode must be 'poll', got '{mode}'"
        )));
    }

    let allowed_chat_ids = parse_allowlist(&cli.allowed_chat_ids)?;
    if cli.live_mode && allowed_chat_ids.is_empty() {
        return Err(ConfigValidationError(
            "allowed_chat_ids must be non-empty when live_mode is enabled".to_string(),
        ));
    }

    let api_base = cli.api_base.trim().trim_end_matches('/').to_string();
    if api_base.is_empty() {
        return Err(ConfigValidationError(
            "api_base must be a non-empty URL".to_string(),
        ));
    }

    Ok(RuntimeConfig {
        token,
        mode,
        ack_policy: cli.ack_policy.into_ack_policy(),
        orchestrator_mode: cli.orchestrator_mode,
        poll_interval_s: cli.poll_interval_s,
        allowed_chat_ids,
        live_mode: cli.live_mode,
        codex_timeout_s: cli.codex_timeout_s,
        notify_on_orchestrator_error: cli.notify_on_orchestrator_error,
        codex_session_max: cli.codex_session_max,
        codex_session_idle_ttl_s: cli.codex_session_idle_ttl_s,
        cursor_state_path: cli.cursor_state_path.trim().to_string(),
        strict_cursor_state_io: cli.strict_cursor_state_io,
        enable_memory_hook: cli.enable_memory_hook,
        api_base,
        once: cli.once,
    })
}

fn parse_allowlist(raw: &str) -> Result<Vec<String>, ConfigValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let values: Vec<String> = trimmed
        .split(',')
        .map(|part| part.trim().to_string())
        .collect();
    if values.iter().any(String::is_empty) {
        return Err(ConfigValidationError(
            "allowed_chat_ids must not contain empty values".to_string(),
        ));
    }
    Ok(values)
}
