//! Best-effort failure event emission toward the heartbeat backend.
//!
//! The publication backend is an external collaborator; only its
//! "publish one event, best-effort" contract matters here. A failing or
//! absent publisher never disturbs the cycle beyond the
//! `heartbeat_emit_failures` counter and the telemetry emit state.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

pub const HEARTBEAT_EVENT_TOPIC: &str = "channel-runtime.failure";
pub const HEARTBEAT_EVENT_SEVERITY: &str = "error";

/// One diagnostic event published toward the heartbeat system.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SystemEvent {
    pub topic: String,
    pub severity: String,
    pub session_key: String,
    pub source: String,
    pub text: String,
    pub context: Value,
}

/// Port for the heartbeat/event publication backend.
pub trait SystemEventPublisher: Send + Sync {
    fn publish_system_event(&self, event: &SystemEvent) -> Result<()>;
}

/// Best-effort runtime failure emitter; failures are swallowed and reported
/// back to the caller as a bool.
#[derive(Clone)]
pub struct HeartbeatEventEmitter {
    publisher: Option<Arc<dyn SystemEventPublisher>>,
    source: String,
}

impl HeartbeatEventEmitter {
    pub fn new(publisher: Arc<dyn SystemEventPublisher>, source: &str) -> Self {
        Self {
            publisher: Some(publisher),
            source: source.to_string(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            publisher: None,
            source: "channel-runtime".to_string(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.publisher.is_some()
    }

    pub fn emit_failure(&self, session_key: &str, text: &str, context: Value) -> bool {
        let Some(publisher) = self.publisher.as_ref() else {
            return false;
        };
        let event = SystemEvent {
            topic: HEARTBEAT_EVENT_TOPIC.to_string(),
            severity: HEARTBEAT_EVENT_SEVERITY.to_string(),
            session_key: session_key.to_string(),
            source: self.source.clone(),
            text: text.to_string(),
            context,
        };
        match publisher.publish_system_event(&event) {
            Ok(()) => true,
            Err(error) => {
                tracing::debug!("heartbeat event emission failed: {error:#}");
                false
            }
        }
    }
}

/// Derives the telemetry emit state from the cycle's emission bookkeeping.
pub fn derive_heartbeat_emit_state(enabled: bool, emit_attempts: u64, emit_failures: u64) -> &'static str {
    if !enabled || emit_attempts == 0 {
        return "disabled";
    }
    if emit_failures > 0 {
        return "emit-failed";
    }
    "emitted"
}
