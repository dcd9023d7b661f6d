//! Channel contract types and the adapter/orchestrator ports.
//!
//! The contracts are provider-agnostic: the Telegram adapter and any future
//! transport normalize into the same `InboundMessage`/`OutboundMessage`
//! shapes, and the service only ever talks to the two narrow ports below.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const MAX_SANITIZED_ERROR_CHARS: usize = 500;

/// Normalized inbound text message produced by a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboundMessage {
    pub update_id: String,
    pub chat_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub received_ts_ms: u64,
}

/// Outbound reply produced by an orchestrator for one inbound message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundMessage {
    pub chat_id: String,
    pub text: String,
    #[serde(default)]
    pub reply_to_message_id: Option<String>,
}

/// Structured diagnostic drained from adapters and orchestrators once per cycle.
///
/// Absent identifiers stay empty strings so the runtime mapping layer never
/// has to distinguish missing from blank.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelDiagnostic {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub update_id: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub retryable: bool,
}

#[async_trait]
/// Transport adapter port consumed by the single-cycle service.
pub trait ChannelAdapterPort: Send + Sync {
    /// Returns the next batch of normalized inbound messages in fetch order.
    async fn fetch_updates(&self) -> Result<Vec<InboundMessage>>;

    /// Delivers one outbound message.
    async fn send_message(&self, outbound: &OutboundMessage) -> Result<()>;

    /// Acknowledges update processing completion, advancing the delivery cursor.
    async fn ack_update(&self, update_id: &str) -> Result<()>;

    /// Empties and returns the adapter diagnostics buffer.
    fn drain_diagnostics(&self) -> Vec<ChannelDiagnostic> {
        Vec::new()
    }
}

#[async_trait]
/// Orchestration port: zero or one outbound message per inbound.
///
/// An `Err` marks the handle as failed for ack-policy purposes; orchestrators
/// additionally record structured diagnostics drained by the runtime layer.
pub trait OrchestratorPort: Send + Sync {
    async fn handle_message(
        &self,
        inbound: &InboundMessage,
        session_id: &str,
    ) -> Result<Option<OutboundMessage>>;

    fn drain_diagnostics(&self) -> Vec<ChannelDiagnostic> {
        Vec::new()
    }
}

pub fn validate_inbound_message(inbound: &InboundMessage) -> Result<()> {
    if inbound.update_id.trim().is_empty() {
        bail!("inbound message has empty update_id");
    }
    if inbound.chat_id.trim().is_empty() {
        bail!("inbound message has empty chat_id");
    }
    Ok(())
}

pub fn validate_outbound_message(outbound: &OutboundMessage) -> Result<()> {
    if outbound.chat_id.trim().is_empty() {
        bail!("outbound message has empty chat_id");
    }
    if outbound.text.trim().is_empty() {
        bail!("outbound message has empty text");
    }
    Ok(())
}

/// Normalizes a chat id for equality checks: numeric values compare by value
/// (`"0042"` equals `"42"`), everything else compares string-exact.
pub fn normalize_chat_id(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<i128>() {
        Ok(numeric) => Some(numeric.to_string()),
        Err(_) => Some(trimmed.to_string()),
    }
}

/// Collapses whitespace and truncates so one bad error cannot flood a payload.
pub fn sanitize_error_text(raw: &str) -> String {
    let compact = raw.split_whitespace().collect::<Vec<&str>>().join(" ");
    compact.chars().take(MAX_SANITIZED_ERROR_CHARS).collect()
}
