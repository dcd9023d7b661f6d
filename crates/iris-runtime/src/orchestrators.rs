//! Echo orchestrator and the allowlist policy gate.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use iris_core::{
    normalize_chat_id, sanitize_error_text, validate_outbound_message, ChannelDiagnostic,
    InboundMessage, OrchestratorPort, OutboundMessage,
};

/// Optional knowledge-base collaborator; only the query seam matters here.
pub trait MemoryLookup: Send + Sync {
    fn lookup_snippet(&self, query: &str) -> Option<String>;
}

/// Minimal default orchestrator: echo text with an optional memory note.
pub struct EchoOrchestrator {
    memory: Option<Arc<dyn MemoryLookup>>,
    diagnostics: Mutex<Vec<ChannelDiagnostic>>,
}

impl EchoOrchestrator {
    pub fn new() -> Self {
        Self {
            memory: None,
            diagnostics: Mutex::new(Vec::new()),
        }
    }

    pub fn with_memory_lookup(memory: Arc<dyn MemoryLookup>) -> Self {
        Self {
            memory: Some(memory),
            diagnostics: Mutex::new(Vec::new()),
        }
    }
}

impl Default for EchoOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrchestratorPort for EchoOrchestrator {
    async fn handle_message(
        &self,
        inbound: &InboundMessage,
        _session_id: &str,
    ) -> Result<Option<OutboundMessage>> {
        let mut text = format!("echo: {}", inbound.text);
        if let Some(memory) = self.memory.as_ref() {
            // Knowledge lookup is a side channel; misses and failures are silent.
            if let Some(snippet) = memory.lookup_snippet(&inbound.text) {
                let snippet = snippet.trim();
                if !snippet.is_empty() {
                    text = format!("{text}\n\nmemory: {snippet}");
                }
            }
        }

        let outbound = OutboundMessage {
            chat_id: inbound.chat_id.clone(),
            text,
            reply_to_message_id: inbound.message_id.clone(),
        };
        if let Err(error) = validate_outbound_message(&outbound) {
            let mut diagnostics = lock_or_recover(&self.diagnostics);
            diagnostics.push(ChannelDiagnostic {
                code: "orchestrator-error".to_string(),
                message: sanitize_error_text(&format!("{error:#}")),
                update_id: inbound.update_id.clone(),
                chat_id: inbound.chat_id.clone(),
                ..ChannelDiagnostic::default()
            });
            return Ok(None);
        }
        Ok(Some(outbound))
    }

    fn drain_diagnostics(&self) -> Vec<ChannelDiagnostic> {
        std::mem::take(&mut lock_or_recover(&self.diagnostics))
    }
}

/// Wrapper that drops disallowed chat ids before delegate orchestration.
///
/// An empty allowlist disables the gate entirely.
pub struct AllowlistGateOrchestrator {
    delegate: Arc<dyn OrchestratorPort>,
    allowed_chat_ids: BTreeSet<String>,
    diagnostics: Mutex<Vec<ChannelDiagnostic>>,
}

impl AllowlistGateOrchestrator {
    pub fn new(delegate: Arc<dyn OrchestratorPort>, allowed_chat_ids: &[String]) -> Self {
        let allowed_chat_ids = allowed_chat_ids
            .iter()
            .filter_map(|value| normalize_chat_id(value))
            .collect();
        Self {
            delegate,
            allowed_chat_ids,
            diagnostics: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl OrchestratorPort for AllowlistGateOrchestrator {
    async fn handle_message(
        &self,
        inbound: &InboundMessage,
        session_id: &str,
    ) -> Result<Option<OutboundMessage>> {
        if !self.allowed_chat_ids.is_empty() {
            let allowed = normalize_chat_id(&inbound.chat_id)
                .map(|chat_id| self.allowed_chat_ids.contains(&chat_id))
                .unwrap_or(false);
            if !allowed {
                let mut diagnostics = lock_or_recover(&self.diagnostics);
                diagnostics.push(ChannelDiagnostic {
                    code: "allowlist-drop".to_string(),
                    message: format!(
                        "dropped update {}: chat_id not allowlisted ({})",
                        inbound.update_id, inbound.chat_id
                    ),
                    update_id: inbound.update_id.clone(),
                    chat_id: inbound.chat_id.clone(),
                    ..ChannelDiagnostic::default()
                });
                return Ok(None);
            }
        }
        self.delegate.handle_message(inbound, session_id).await
    }

    fn drain_diagnostics(&self) -> Vec<ChannelDiagnostic> {
        let mut diagnostics = std::mem::take(&mut *lock_or_recover(&self.diagnostics));
        diagnostics.extend(self.delegate.drain_diagnostics());
        diagnostics
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
