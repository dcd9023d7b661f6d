//! Channel adapter port implementation over the Telegram Bot API.
//!
//! Tracks fetch/ack bookkeeping (`seen`, `pending`, `processed`), filters
//! stale updates below the committed cursor floor, and persists the floor
//! through the durable cursor store after every mutation.

use std::collections::{BTreeSet, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use iris_core::{ChannelAdapterPort, ChannelDiagnostic, InboundMessage, OutboundMessage};

use crate::api_client::TelegramApiClient;
use crate::cursor_state::{CursorStateError, CursorStateStore};
use crate::update_parser::parse_update;

/// Telegram adapter that tracks fetch/ack state and in-process dedupe.
#[derive(Debug)]
pub struct TelegramChannelAdapter {
    api: TelegramApiClient,
    strict_cursor_state_io: bool,
    state: Mutex<AdapterState>,
}

#[derive(Debug)]
struct AdapterState {
    cursor_store: Option<CursorStateStore>,
    seen: BTreeSet<i64>,
    pending: BTreeSet<i64>,
    processed: BTreeSet<i64>,
    committed_floor: Option<i64>,
    next_offset: Option<i64>,
    diagnostics: Vec<ChannelDiagnostic>,
}

impl TelegramChannelAdapter {
    pub fn new(
        api: TelegramApiClient,
        cursor_store: Option<CursorStateStore>,
        strict_cursor_state_io: bool,
    ) -> Result<Self> {
        let mut state = AdapterState {
            cursor_store,
            seen: BTreeSet::new(),
            pending: BTreeSet::new(),
            processed: BTreeSet::new(),
            committed_floor: None,
            next_offset: None,
            diagnostics: Vec::new(),
        };

        match state.cursor_store.as_mut() {
            Some(store) => match store.load() {
                Ok(floor) => {
                    state.committed_floor = floor;
                    state.next_offset = floor;
                }
                Err(error) => {
                    let diagnostic = cursor_state_diagnostic("cursor-state-load-failed", &error);
                    if strict_cursor_state_io {
                        bail!("{}", diagnostic.message);
                    }
                    state.diagnostics.push(diagnostic);
                }
            },
            None => {
                // In-memory only; the note drains with the first cycle's
                // diagnostics and is classified as informational downstream.
                state.diagnostics.push(ChannelDiagnostic {
                    code: "cursor-persistence-disabled".to_string(),
                    message: "cursor state persistence disabled; tracking the floor in memory only"
                        .to_string(),
                    ..ChannelDiagnostic::default()
                });
            }
        }

        Ok(Self {
            api,
            strict_cursor_state_io,
            state: Mutex::new(state),
        })
    }

    /// Current committed floor, for operator inspection and tests.
    pub fn committed_floor(&self) -> Option<i64> {
        self.lock_state().committed_floor
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AdapterState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn register_batch(
        &self,
        state: &mut AdapterState,
        raw_updates: &[serde_json::Value],
    ) -> Vec<InboundMessage> {
        let mut normalized = Vec::new();
        let mut seen_in_batch: HashSet<i64> = HashSet::new();

        for raw_update in raw_updates {
            let parsed = parse_update(raw_update);
            let Some(update_id) = parsed.update_id.as_deref() else {
                continue;
            };
            let Ok(update_id) = update_id.parse::<i64>() else {
                continue;
            };

            if !seen_in_batch.insert(update_id) {
                state.processed.insert(update_id);
                continue;
            }

            if let Some(floor) = state.committed_floor {
                if update_id < floor {
                    state.processed.insert(update_id);
                    state.diagnostics.push(ChannelDiagnostic {
                        code: "stale-drop".to_string(),
                        message: format!(
                            "dropped stale update {update_id} below committed floor {floor}"
                        ),
                        update_id: update_id.to_string(),
                        chat_id: parsed
                            .inbound
                            .as_ref()
                            .map(|inbound| inbound.chat_id.clone())
                            .unwrap_or_default(),
                        ..ChannelDiagnostic::default()
                    });
                    continue;
                }
            }

            if state.seen.contains(&update_id) && !state.pending.contains(&update_id) {
                state.processed.insert(update_id);
                continue;
            }

            state.seen.insert(update_id);
            let Some(inbound) = parsed.inbound else {
                // Skipped update shapes still advance the poll offset.
                state.processed.insert(update_id);
                continue;
            };

            state.pending.insert(update_id);
            normalized.push(inbound);
        }

        normalized
    }

    // Floor rule: smallest pending id when anything is in flight, otherwise
    // one past the largest seen id, and never below the committed floor.
    fn recompute_offset(&self, state: &mut AdapterState) -> Result<()> {
        let candidate = if let Some(min_pending) = state.pending.iter().next().copied() {
            Some(min_pending)
        } else if let Some(max_seen) = state.seen.iter().next_back().copied() {
            Some(max_seen.saturating_add(1))
        } else {
            state.committed_floor
        };
        let candidate = match (candidate, state.committed_floor) {
            (Some(candidate), Some(floor)) => Some(candidate.max(floor)),
            (candidate, _) => candidate,
        };

        state.next_offset = candidate;

        let advanced = match (candidate, state.committed_floor) {
            (Some(candidate), Some(floor)) => candidate > floor,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !advanced {
            return Ok(());
        }
        let floor = candidate.unwrap_or(0);
        state.committed_floor = Some(floor);

        if let Some(store) = state.cursor_store.as_mut() {
            if let Err(error) = store.save(floor) {
                let diagnostic = cursor_state_diagnostic("cursor-state-save-failed", &error);
                let message = diagnostic.message.clone();
                state.diagnostics.push(diagnostic);
                if self.strict_cursor_state_io {
                    bail!("{message}");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelAdapterPort for TelegramChannelAdapter {
    async fn fetch_updates(&self) -> Result<Vec<InboundMessage>> {
        let offset = self.lock_state().next_offset;
        let raw_updates = self
            .api
            .get_updates(offset)
            .await
            .map_err(|error| anyhow!("fetch_updates failed: {error}"))?;

        let mut state = self.lock_state();
        let normalized = self.register_batch(&mut state, &raw_updates);
        self.recompute_offset(&mut state)?;
        Ok(normalized)
    }

    async fn send_message(&self, outbound: &OutboundMessage) -> Result<()> {
        self.api
            .send_message(
                &outbound.chat_id,
                &outbound.text,
                outbound.reply_to_message_id.as_deref(),
            )
            .await
            .map_err(|error| anyhow!("send_message failed: {error}"))?;
        Ok(())
    }

    async fn ack_update(&self, update_id: &str) -> Result<()> {
        let Ok(numeric_id) = update_id.trim().parse::<i64>() else {
            bail!("ack_update requires a numeric update_id, got '{update_id}'");
        };

        let mut state = self.lock_state();
        if !state.seen.contains(&numeric_id) && !state.processed.contains(&numeric_id) {
            bail!("ack_update received unknown update_id {numeric_id}");
        }
        state.pending.remove(&numeric_id);
        state.processed.insert(numeric_id);
        self.recompute_offset(&mut state)
    }

    fn drain_diagnostics(&self) -> Vec<ChannelDiagnostic> {
        let mut state = self.lock_state();
        std::mem::take(&mut state.diagnostics)
    }
}

fn cursor_state_diagnostic(code: &str, error: &CursorStateError) -> ChannelDiagnostic {
    ChannelDiagnostic {
        code: code.to_string(),
        message: error.to_string(),
        retryable: true,
        ..ChannelDiagnostic::default()
    }
}
