//! Runtime composition for the iris Telegram channel.
//!
//! Wires configuration, orchestrators (echo, allowlist gate, codex
//! subprocess workers), heartbeat event emission, telemetry synthesis, and
//! the cycle loop into the `iris` binary surface.

pub mod bootstrap;
pub mod codex_orchestrator;
pub mod config;
pub mod diagnostics;
pub mod heartbeat;
pub mod orchestrators;
pub mod runner;
pub mod telemetry;

pub use bootstrap::init_tracing;
pub use codex_orchestrator::{
    CodexCommandSpec, CodexInvocationRequest, CodexOrchestrator, CodexSessionPolicy,
    ORCHESTRATOR_ERROR_FALLBACK_TEXT,
};
pub use config::{resolve_runtime_config, Cli, ConfigValidationError, OrchestratorMode, RuntimeConfig};
pub use diagnostics::{build_error_detail, dedupe_error_details, ErrorDetail, ErrorDetailContext};
pub use heartbeat::{HeartbeatEventEmitter, SystemEvent, SystemEventPublisher};
pub use orchestrators::{AllowlistGateOrchestrator, EchoOrchestrator, MemoryLookup};
pub use runner::{run_cycle, run_loop, CycleResult, DroppedUpdate, RunLoopOptions};
pub use telemetry::{build_runtime_telemetry, build_telemetry_digest, RuntimeTelemetry};
