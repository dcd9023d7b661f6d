//! Provider-agnostic channel contracts and the single-cycle service.
//!
//! Defines the inbound/outbound message contracts, the adapter and
//! orchestrator ports, session-key mapping, and `process_once`, the
//! deterministic fetch/dispatch/send/ack kernel that every channel runtime
//! builds on.

pub mod contracts;
pub mod service;
pub mod session_map;
pub mod time_utils;

pub use contracts::{
    normalize_chat_id, sanitize_error_text, validate_inbound_message, validate_outbound_message,
    ChannelAdapterPort, ChannelDiagnostic, InboundMessage, OrchestratorPort, OutboundMessage,
};
pub use service::{process_once, AckPolicy, ProcessOnceOutcome};
pub use session_map::{session_id_for_inbound, telegram_session_id};
pub use time_utils::current_unix_timestamp_ms;
