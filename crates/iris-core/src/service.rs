//! The single-cycle service: one deterministic fetch/dispatch/send/ack pass.

use serde::{Deserialize, Serialize};

use crate::contracts::{sanitize_error_text, ChannelAdapterPort, OrchestratorPort};
use crate::session_map::session_id_for_inbound;

/// Acknowledgement policy applied to every fetched update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckPolicy {
    Always,
    OnSuccess,
}

impl AckPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::OnSuccess => "on-success",
        }
    }
}

/// Machine-readable outcome of one service cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessOnceOutcome {
    pub status: String,
    pub reason: String,
    pub fetched_count: u64,
    pub sent_count: u64,
    pub acked_count: u64,
    pub ack_skipped_count: u64,
    pub error_count: u64,
    pub errors: Vec<String>,
}

impl ProcessOnceOutcome {
    fn empty(status: &str, reason: &str) -> Self {
        Self {
            status: status.to_string(),
            reason: reason.to_string(),
            fetched_count: 0,
            sent_count: 0,
            acked_count: 0,
            ack_skipped_count: 0,
            error_count: 0,
            errors: Vec::new(),
        }
    }
}

/// Runs one deterministic fetch/process/send/ack cycle.
///
/// Safety behavior:
/// - An adapter fetch failure is returned as a failed outcome; nothing else runs.
/// - Per-update failures are collected and never abort the remaining batch.
/// - One inbound update produces at most one outbound message.
/// - Messages are processed strictly in fetch order.
pub async fn process_once(
    adapter: &dyn ChannelAdapterPort,
    orchestrator: &dyn OrchestratorPort,
    ack_policy: AckPolicy,
) -> ProcessOnceOutcome {
    let updates = match adapter.fetch_updates().await {
        Ok(updates) => updates,
        Err(error) => {
            let message = sanitize_error_text(&format!("{error:#}"));
            let mut outcome = ProcessOnceOutcome::empty("failed", "adapter-fetch-exception");
            outcome.error_count = 1;
            outcome.errors = vec![message];
            return outcome;
        }
    };

    if updates.is_empty() {
        return ProcessOnceOutcome::empty("ok", "no-updates");
    }

    let mut sent_count = 0_u64;
    let mut acked_count = 0_u64;
    let mut ack_skipped_count = 0_u64;
    let mut errors: Vec<String> = Vec::new();

    for inbound in &updates {
        let mut handle_or_send_failed = false;

        match session_id_for_inbound(inbound) {
            Ok(session_id) => match orchestrator.handle_message(inbound, &session_id).await {
                Ok(Some(outbound)) => match adapter.send_message(&outbound).await {
                    Ok(()) => sent_count = sent_count.saturating_add(1),
                    Err(error) => {
                        errors.push(format!(
                            "update {}: {}",
                            inbound.update_id,
                            sanitize_error_text(&format!("{error:#}"))
                        ));
                        handle_or_send_failed = true;
                    }
                },
                Ok(None) => {}
                Err(error) => {
                    errors.push(format!(
                        "update {}: {}",
                        inbound.update_id,
                        sanitize_error_text(&format!("{error:#}"))
                    ));
                    handle_or_send_failed = true;
                }
            },
            Err(error) => {
                errors.push(format!(
                    "update {}: {}",
                    inbound.update_id,
                    sanitize_error_text(&format!("{error:#}"))
                ));
                handle_or_send_failed = true;
            }
        }

        let should_ack = matches!(ack_policy, AckPolicy::Always) || !handle_or_send_failed;
        if should_ack {
            match adapter.ack_update(&inbound.update_id).await {
                Ok(()) => acked_count = acked_count.saturating_add(1),
                Err(error) => {
                    errors.push(format!(
                        "update {}: ack failed: {}",
                        inbound.update_id,
                        sanitize_error_text(&format!("{error:#}"))
                    ));
                }
            }
        } else {
            ack_skipped_count = ack_skipped_count.saturating_add(1);
        }
    }

    let reason = if errors.is_empty() {
        "processed"
    } else {
        "completed-with-errors"
    };
    ProcessOnceOutcome {
        status: "ok".to_string(),
        reason: reason.to_string(),
        fetched_count: u64::try_from(updates.len()).unwrap_or(u64::MAX),
        sent_count,
        acked_count,
        ack_skipped_count,
        error_count: u64::try_from(errors.len()).unwrap_or(u64::MAX),
        errors,
    }
}
