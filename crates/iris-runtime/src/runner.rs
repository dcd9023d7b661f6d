//! Cycle composition and the outer polling loop.
//!
//! `run_cycle` wires the adapter and gated orchestrator, runs the service,
//! folds drained diagnostics into the payload (errors vs. drops), attaches
//! telemetry, and emits best-effort failure events. `run_loop` repeats that
//! forever (or once), never exiting on a cycle error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};

use iris_core::{
    process_once, sanitize_error_text, ChannelAdapterPort, ChannelDiagnostic, OrchestratorPort,
    ProcessOnceOutcome,
};
use iris_telegram::{
    CursorStateStore, TelegramApiClient, TelegramApiClientConfig, TelegramChannelAdapter,
};

use crate::codex_orchestrator::{CodexCommandSpec, CodexOrchestrator, CodexSessionPolicy};
use crate::config::{OrchestratorMode, RuntimeConfig};
use crate::diagnostics::{
    build_error_detail, dedupe_error_details, map_runtime_diagnostic, map_service_errors,
    DiagnosticOrigin, ErrorDetail, ErrorDetailSpec, ERROR_DETAIL_CATEGORY_ERROR,
    ERROR_DETAIL_SOURCE_RUNTIME,
};
use crate::heartbeat::{derive_heartbeat_emit_state, HeartbeatEventEmitter};
use crate::orchestrators::{AllowlistGateOrchestrator, EchoOrchestrator, MemoryLookup};
use crate::telemetry::{build_runtime_telemetry, build_telemetry_digest, RuntimeTelemetry};

pub const RUNTIME_FAILURE_SESSION_KEY: &str = "telegram:runtime";

/// One dropped update surfaced in the cycle payload.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DroppedUpdate {
    pub update_id: String,
    pub chat_id: String,
    pub reason: String,
}

/// Canonical per-cycle payload emitted as one line of JSON on stdout.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CycleResult {
    pub status: String,
    pub reason: String,
    pub fetched_count: u64,
    pub sent_count: u64,
    pub acked_count: u64,
    pub ack_skipped_count: u64,
    pub error_count: u64,
    pub errors: Vec<String>,
    pub error_details: Vec<ErrorDetail>,
    pub heartbeat_emit_failures: u64,
    pub dropped_count: u64,
    pub dropped_updates: Vec<DroppedUpdate>,
    pub telemetry: RuntimeTelemetry,
}

struct FailureEmission {
    emitter: Arc<HeartbeatEventEmitter>,
    started: Instant,
    attempts: u64,
    failures: u64,
}

impl FailureEmission {
    fn new(emitter: Arc<HeartbeatEventEmitter>, started: Instant) -> Self {
        Self {
            emitter,
            started,
            attempts: 0,
            failures: 0,
        }
    }

    fn emit(
        &mut self,
        text: &str,
        base_context: Value,
        fetch_total: u64,
        send_total: u64,
        drop_total: u64,
    ) -> bool {
        if self.emitter.is_enabled() {
            self.attempts = self.attempts.saturating_add(1);
        }
        let emit_state =
            derive_heartbeat_emit_state(self.emitter.is_enabled(), self.attempts, self.failures);
        let mut context = match base_context {
            Value::Object(map) => Value::Object(map),
            other => json!({ "detail": other }),
        };
        context["heartbeat"] = json!({ "emit_state": emit_state });
        context["telemetry_digest"] =
            build_telemetry_digest(fetch_total, send_total, drop_total, elapsed_ms(self.started));

        let emitted = self
            .emitter
            .emit_failure(RUNTIME_FAILURE_SESSION_KEY, text, context);
        if self.emitter.is_enabled() && !emitted {
            self.failures = self.failures.saturating_add(1);
        }
        emitted
    }

    fn emit_state(&self) -> &'static str {
        derive_heartbeat_emit_state(self.emitter.is_enabled(), self.attempts, self.failures)
    }
}

/// Builds the default runtime wiring for one configuration.
pub fn build_cycle_ports(
    config: &RuntimeConfig,
    memory: Option<Arc<dyn MemoryLookup>>,
) -> anyhow::Result<(Arc<dyn ChannelAdapterPort>, Arc<dyn OrchestratorPort>)> {
    let api_config = TelegramApiClientConfig {
        api_base: config.api_base.clone(),
        ..TelegramApiClientConfig::default()
    };
    let api = TelegramApiClient::new(&config.token, api_config)?;

    let cursor_store = if config.cursor_state_path.is_empty() {
        None
    } else {
        Some(CursorStateStore::new(&config.cursor_state_path))
    };
    let adapter =
        TelegramChannelAdapter::new(api, cursor_store, config.strict_cursor_state_io)?;

    let delegate: Arc<dyn OrchestratorPort> = match config.orchestrator_mode {
        OrchestratorMode::Codex => Arc::new(CodexOrchestrator::new(
            CodexCommandSpec::default(),
            CodexSessionPolicy {
                max_sessions: config.codex_session_max,
                idle_ttl: Duration::from_secs_f64(config.codex_session_idle_ttl_s),
            },
            Duration::from_secs_f64(config.codex_timeout_s),
            config.notify_on_orchestrator_error,
        )),
        OrchestratorMode::Default => match (config.enable_memory_hook, memory) {
            (true, Some(memory)) => Arc::new(EchoOrchestrator::with_memory_lookup(memory)),
            _ => Arc::new(EchoOrchestrator::new()),
        },
    };
    let gated = Arc::new(AllowlistGateOrchestrator::new(
        delegate,
        &config.allowed_chat_ids,
    ));
    Ok((Arc::new(adapter), gated))
}

/// Runs one cycle with default wiring built from the configuration.
pub async fn run_cycle(
    config: RuntimeConfig,
    emitter: Arc<HeartbeatEventEmitter>,
    memory: Option<Arc<dyn MemoryLookup>>,
) -> CycleResult {
    match build_cycle_ports(&config, memory) {
        Ok((adapter, orchestrator)) => {
            run_cycle_with_ports(config, adapter, orchestrator, emitter).await
        }
        Err(error) => runtime_wrapper_failure(
            emitter,
            "runtime-process-once-exception",
            sanitize_error_text(&format!("{error:#}")),
            "run_cycle",
        ),
    }
}

/// Runs one cycle against pre-wired ports (the seam the tests drive).
pub async fn run_cycle_with_ports(
    config: RuntimeConfig,
    adapter: Arc<dyn ChannelAdapterPort>,
    orchestrator: Arc<dyn OrchestratorPort>,
    emitter: Arc<HeartbeatEventEmitter>,
) -> CycleResult {
    let started = Instant::now();
    let mut emission = FailureEmission::new(emitter, started);

    let outcome = process_once(adapter.as_ref(), orchestrator.as_ref(), config.ack_policy).await;

    let mut diagnostics: Vec<(DiagnosticOrigin, ChannelDiagnostic)> = Vec::new();
    diagnostics.extend(
        orchestrator
            .drain_diagnostics()
            .into_iter()
            .map(|diagnostic| (DiagnosticOrigin::Orchestrator, diagnostic)),
    );
    diagnostics.extend(
        adapter
            .drain_diagnostics()
            .into_iter()
            .map(|diagnostic| (DiagnosticOrigin::Adapter, diagnostic)),
    );

    if outcome.status != "ok" || outcome.error_count > 0 {
        emission.emit(
            &format!("channel-runtime cycle failure: {}", outcome.reason),
            json!({
                "code": "service-cycle-error",
                "status": outcome.status.clone(),
                "reason": outcome.reason.clone(),
                "error_count": outcome.error_count,
            }),
            outcome.fetched_count,
            outcome.sent_count,
            0,
        );
    }

    let service_error_details = map_service_errors(&outcome);
    let mut diagnostic_error_details: Vec<ErrorDetail> = Vec::new();
    let mut dropped_updates: Vec<DroppedUpdate> = Vec::new();
    let mut diagnostic_errors: Vec<String> = Vec::new();

    for (origin, diagnostic) in &diagnostics {
        diagnostic_error_details.push(map_runtime_diagnostic(*origin, diagnostic));

        if diagnostic.code == "cursor-persistence-disabled" {
            // Informational note; recorded as a detail, never an error or a drop.
            continue;
        }

        if diagnostic.code == "allowlist-drop" || diagnostic.code == "stale-drop" {
            dropped_updates.push(DroppedUpdate {
                update_id: diagnostic.update_id.clone(),
                chat_id: diagnostic.chat_id.clone(),
                reason: if diagnostic.message.is_empty() {
                    format!("{} drop", diagnostic.code)
                } else {
                    diagnostic.message.clone()
                },
            });
            continue;
        }

        let message = if diagnostic.message.is_empty() {
            "unknown".to_string()
        } else {
            diagnostic.message.clone()
        };
        diagnostic_errors.push(message.clone());
        let origin_label = match origin {
            DiagnosticOrigin::Orchestrator => "orchestrator",
            DiagnosticOrigin::Adapter => "adapter",
        };
        emission.emit(
            &format!("{origin_label} failure: {message}"),
            serde_json::to_value(diagnostic).unwrap_or_else(|_| json!({})),
            outcome.fetched_count,
            outcome.sent_count,
            u64::try_from(dropped_updates.len()).unwrap_or(0),
        );
    }

    let ProcessOnceOutcome {
        status,
        mut reason,
        fetched_count,
        sent_count,
        acked_count,
        ack_skipped_count,
        mut error_count,
        mut errors,
    } = outcome;

    if !diagnostic_errors.is_empty() {
        error_count =
            error_count.saturating_add(u64::try_from(diagnostic_errors.len()).unwrap_or(0));
        errors.extend(diagnostic_errors);
        if status == "ok" {
            reason = "completed-with-errors".to_string();
        }
    }

    let dropped_count = u64::try_from(dropped_updates.len()).unwrap_or(0);
    let heartbeat_emit_failures = emission.failures;
    let telemetry = build_runtime_telemetry(
        fetched_count,
        sent_count,
        dropped_count,
        heartbeat_emit_failures,
        elapsed_ms(started),
        emission.emit_state(),
    );

    CycleResult {
        status,
        reason,
        fetched_count,
        sent_count,
        acked_count,
        ack_skipped_count,
        error_count,
        errors,
        error_details: dedupe_error_details(
            service_error_details
                .into_iter()
                .chain(diagnostic_error_details)
                .collect(),
        ),
        heartbeat_emit_failures,
        dropped_count,
        dropped_updates,
        telemetry,
    }
}

fn runtime_wrapper_failure(
    emitter: Arc<HeartbeatEventEmitter>,
    reason: &str,
    message: String,
    operation: &str,
) -> CycleResult {
    let started = Instant::now();
    let mut emission = FailureEmission::new(emitter, started);
    emission.emit(
        &format!("channel-runtime {operation} exception: {message}"),
        json!({
            "code": reason,
            "status": "failed",
            "reason": reason,
            "error_count": 1,
        }),
        0,
        0,
        0,
    );

    let detail = build_error_detail(ErrorDetailSpec {
        code: reason,
        message: &message,
        retryable: true,
        source: ERROR_DETAIL_SOURCE_RUNTIME,
        category: ERROR_DETAIL_CATEGORY_ERROR,
        layer: "runtime-wrapper",
        operation,
        ..ErrorDetailSpec::default()
    });
    let heartbeat_emit_failures = emission.failures;
    let telemetry = build_runtime_telemetry(
        0,
        0,
        0,
        heartbeat_emit_failures,
        elapsed_ms(started),
        emission.emit_state(),
    );

    CycleResult {
        status: "failed".to_string(),
        reason: reason.to_string(),
        fetched_count: 0,
        sent_count: 0,
        acked_count: 0,
        ack_skipped_count: 0,
        error_count: 1,
        errors: vec![message],
        error_details: vec![detail],
        heartbeat_emit_failures,
        dropped_count: 0,
        dropped_updates: Vec::new(),
        telemetry,
    }
}

/// Test/operator hook for bounding the continuous loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunLoopOptions {
    pub max_cycles: Option<u64>,
}

/// Runs either one cycle (`--once`) or a continuous polling loop.
///
/// Ports are built once and reused, so the cursor bookkeeping and the codex
/// session table persist across cycles; a wiring failure is reported as a
/// failed cycle and retried on the next iteration. A panic escaping a cycle
/// becomes a `runtime-loop-cycle-exception` payload instead of ending the
/// loop.
pub async fn run_loop<F>(
    config: RuntimeConfig,
    emitter: Arc<HeartbeatEventEmitter>,
    memory: Option<Arc<dyn MemoryLookup>>,
    mut on_cycle: F,
    options: RunLoopOptions,
) -> CycleResult
where
    F: FnMut(&CycleResult),
{
    let mut cycles = 0_u64;
    let mut ports: Option<(Arc<dyn ChannelAdapterPort>, Arc<dyn OrchestratorPort>)> = None;

    loop {
        cycles = cycles.saturating_add(1);

        if ports.is_none() {
            match build_cycle_ports(&config, memory.clone()) {
                Ok(built) => ports = Some(built),
                Err(error) => {
                    let last_result = runtime_wrapper_failure(
                        emitter.clone(),
                        "runtime-process-once-exception",
                        sanitize_error_text(&format!("{error:#}")),
                        "run_cycle",
                    );
                    on_cycle(&last_result);
                    if config.once {
                        return last_result;
                    }
                    if let Some(max_cycles) = options.max_cycles {
                        if cycles >= max_cycles {
                            return last_result;
                        }
                    }
                    tokio::time::sleep(Duration::from_secs_f64(config.poll_interval_s)).await;
                    continue;
                }
            }
        }

        let (adapter, orchestrator) = ports
            .as_ref()
            .map(|(adapter, orchestrator)| (adapter.clone(), orchestrator.clone()))
            .expect("ports are built above");
        let cycle_task = tokio::spawn(run_cycle_with_ports(
            config.clone(),
            adapter,
            orchestrator,
            emitter.clone(),
        ));
        let last_result = match cycle_task.await {
            Ok(result) => result,
            Err(join_error) => runtime_wrapper_failure(
                emitter.clone(),
                "runtime-loop-cycle-exception",
                sanitize_error_text(&join_error.to_string()),
                "run_loop",
            ),
        };

        on_cycle(&last_result);
        if config.once {
            return last_result;
        }
        if let Some(max_cycles) = options.max_cycles {
            if cycles >= max_cycles {
                return last_result;
            }
        }
        tokio::time::sleep(Duration::from_secs_f64(config.poll_interval_s)).await;
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::Result;
    use httpmock::prelude::*;
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::heartbeat::{SystemEvent, SystemEventPublisher};
    use iris_core::AckPolicy;

    fn runtime_config(server: &MockServer, cursor_path: &str) -> RuntimeConfig {
        RuntimeConfig {
            token: "test-token".to_string(),
            mode: "poll".to_string(),
            ack_policy: AckPolicy::Always,
            orchestrator_mode: OrchestratorMode::Default,
            poll_interval_s: 0.01,
            allowed_chat_ids: Vec::new(),
            live_mode: false,
            codex_timeout_s: 20.0,
            notify_on_orchestrator_error: false,
            codex_session_max: 128,
            codex_session_idle_ttl_s: 900.0,
            cursor_state_path: cursor_path.to_string(),
            strict_cursor_state_io: false,
            enable_memory_hook: false,
            api_base: server.base_url(),
            once: true,
        }
    }

    fn text_update(update_id: i64, chat_id: i64, text: &str) -> serde_json::Value {
        json!({
            "update_id": update_id,
            "message": {
                "message_id": update_id + 800,
                "date": 1_760_100_000_u64,
                "text": text,
                "chat": {"id": chat_id},
                "from": {"id": 7}
            }
        })
    }

    fn mock_updates(server: &MockServer, updates: Vec<serde_json::Value>) {
        server.mock(|when, then| {
            when.method(POST).path("/bottest-token/getUpdates");
            then.status(200)
                .body(json!({"ok": true, "result": updates}).to_string());
        });
    }

    struct FlakyPublisher {
        fail: bool,
        published: Mutex<Vec<SystemEvent>>,
    }

    impl SystemEventPublisher for FlakyPublisher {
        fn publish_system_event(&self, event: &SystemEvent) -> Result<()> {
            if self.fail {
                anyhow::bail!("event sink offline");
            }
            self.published
                .lock()
                .expect("published lock")
                .push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn integration_happy_path_processes_sends_acks_and_advances_cursor() {
        let temp = tempdir().expect("tempdir");
        let cursor_path = temp.path().join("cursor.json");
        let server = MockServer::start();
        mock_updates(&server, vec![text_update(100, 42, "hi")]);
        let send_mock = server.mock(|when, then| {
            when.method(POST).path("/bottest-token/sendMessage");
            then.status(200)
                .body(json!({"ok": true, "result": {"message_id": 901}}).to_string());
        });

        let mut config = runtime_config(&server, &cursor_path.display().to_string());
        config.allowed_chat_ids = vec!["42".to_string()];

        let result = run_cycle(config, Arc::new(HeartbeatEventEmitter::disabled()), None).await;
        assert_eq!(result.status, "ok");
        assert_eq!(result.reason, "processed");
        assert_eq!(result.fetched_count, 1);
        assert_eq!(result.sent_count, 1);
        assert_eq!(result.acked_count, 1);
        assert_eq!(result.error_count, 0);
        assert_eq!(result.dropped_count, 0);
        send_mock.assert();

        // Telemetry identities and the disabled emit state.
        assert_eq!(result.telemetry.counters.fetch_total, result.fetched_count);
        assert_eq!(result.telemetry.counters.send_total, result.sent_count);
        assert_eq!(result.telemetry.counters.drop_total, result.dropped_count);
        assert_eq!(result.telemetry.heartbeat.emit_state, "disabled");

        let raw = std::fs::read_to_string(&cursor_path).expect("cursor file");
        let cursor: serde_json::Value = serde_json::from_str(&raw).expect("cursor json");
        assert!(cursor["committed_floor"].as_i64().expect("floor") >= 101);
    }

    #[tokio::test]
    async fn integration_empty_fetch_reports_no_updates() {
        let server = MockServer::start();
        mock_updates(&server, Vec::new());
        let config = runtime_config(&server, "");

        let result = run_cycle(config, Arc::new(HeartbeatEventEmitter::disabled()), None).await;
        assert_eq!(result.status, "ok");
        assert_eq!(result.reason, "no-updates");
        assert_eq!(result.fetched_count, 0);
        assert_eq!(result.sent_count, 0);
        assert_eq!(result.acked_count, 0);
        assert_eq!(result.dropped_count, 0);
        assert_eq!(result.error_count, 0);

        // Running without a cursor file is not an error; the cycle carries
        // one informational detail about the in-memory floor.
        assert_eq!(result.error_details.len(), 1);
        assert_eq!(result.error_details[0].code, "cursor-persistence-disabled");
        assert_eq!(result.error_details[0].category, "drop");
    }

    #[tokio::test]
    async fn integration_fetch_failure_produces_adapter_fetch_exception_payload() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/bottest-token/getUpdates");
            then.status(404)
                .body(json!({"ok": false, "error_code": 404, "description": "Not Found"}).to_string());
        });
        let config = runtime_config(&server, "");

        let result = run_cycle(config, Arc::new(HeartbeatEventEmitter::disabled()), None).await;
        assert_eq!(result.status, "failed");
        assert_eq!(result.reason, "adapter-fetch-exception");
        assert_eq!(result.fetched_count, 0);
        assert_eq!(result.sent_count, 0);
        assert_eq!(result.acked_count, 0);
        assert_eq!(result.error_count, 1);
        assert_eq!(result.error_details[0].code, "adapter-fetch-exception");
        assert!(result.error_details[0].retryable);
        assert_eq!(result.error_details[0].context.operation, "fetch_updates");
    }

    #[tokio::test]
    async fn integration_allowlist_drop_counts_without_sending_or_erroring() {
        let server = MockServer::start();
        mock_updates(&server, vec![text_update(100, 777, "intruder")]);
        let send_mock = server.mock(|when, then| {
            when.method(POST).path("/bottest-token/sendMessage");
            then.status(200).body(json!({"ok": true, "result": {}}).to_string());
        });

        let mut config = runtime_config(&server, "");
        config.allowed_chat_ids = vec!["42".to_string()];

        let result = run_cycle(config, Arc::new(HeartbeatEventEmitter::disabled()), None).await;
        assert_eq!(result.status, "ok");
        assert_eq!(result.reason, "processed");
        assert_eq!(result.dropped_count, 1);
        assert_eq!(result.sent_count, 0);
        assert_eq!(result.error_count, 0);
        assert_eq!(result.acked_count, 1);
        assert!(result.dropped_updates[0]
            .reason
            .contains("chat_id not allowlisted"));
        assert_eq!(result.dropped_updates[0].chat_id, "777");
        assert_eq!(result.telemetry.counters.drop_total, 1);
        send_mock.assert_hits(0);

        let drop_detail = result
            .error_details
            .iter()
            .find(|detail| detail.code == "allowlist-drop")
            .expect("allowlist-drop detail");
        assert_eq!(drop_detail.category, "drop");
        assert_eq!(drop_detail.context.layer, "gate");
        assert_eq!(drop_detail.context.operation, "allowlist_check");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn integration_codex_timeout_surfaces_orchestrator_diagnostics() {
        let temp = tempdir().expect("tempdir");
        let cursor_path = temp.path().join("cursor.json");
        let server = MockServer::start();
        mock_updates(&server, vec![text_update(100, 42, "hi")]);

        let config = runtime_config(&server, &cursor_path.display().to_string());
        let api = TelegramApiClient::new(
            "test-token",
            TelegramApiClientConfig {
                api_base: server.base_url(),
                ..TelegramApiClientConfig::default()
            },
        )
        .expect("api client");
        let adapter: Arc<dyn ChannelAdapterPort> = Arc::new(
            TelegramChannelAdapter::new(api, Some(CursorStateStore::new(&cursor_path)), false)
                .expect("adapter"),
        );
        let codex = Arc::new(CodexOrchestrator::new(
            CodexCommandSpec {
                program: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), "sleep 5".to_string()],
            },
            CodexSessionPolicy::default(),
            Duration::from_millis(50),
            false,
        ));
        let orchestrator: Arc<dyn OrchestratorPort> =
            Arc::new(AllowlistGateOrchestrator::new(codex, &[]));

        let result = run_cycle_with_ports(
            config,
            adapter,
            orchestrator,
            Arc::new(HeartbeatEventEmitter::disabled()),
        )
        .await;
        assert_eq!(result.status, "ok");
        assert_eq!(result.reason, "completed-with-errors");
        assert_eq!(result.sent_count, 0);
        assert!(result.error_count >= 1);

        let timeout_detail = result
            .error_details
            .iter()
            .find(|detail| detail.code == "codex-timeout")
            .expect("codex-timeout detail");
        assert_eq!(timeout_detail.source, "orchestrator.diagnostics");
        assert_eq!(timeout_detail.context.layer, "orchestrator");
        assert_eq!(timeout_detail.context.session_id, "telegram:42");
        assert!(timeout_detail.retryable);
    }

    #[tokio::test]
    async fn integration_on_success_policy_skips_ack_when_send_fails() {
        let temp = tempdir().expect("tempdir");
        let cursor_path = temp.path().join("cursor.json");
        let server = MockServer::start();
        mock_updates(&server, vec![text_update(100, 42, "hi")]);
        server.mock(|when, then| {
            when.method(POST).path("/bottest-token/sendMessage");
            then.status(200)
                .body(json!({"ok": false, "error_code": 400, "description": "Bad Request"}).to_string());
        });

        let mut config = runtime_config(&server, &cursor_path.display().to_string());
        config.ack_policy = AckPolicy::OnSuccess;

        let result = run_cycle(config, Arc::new(HeartbeatEventEmitter::disabled()), None).await;
        assert_eq!(result.reason, "completed-with-errors");
        assert_eq!(result.sent_count, 0);
        assert_eq!(result.acked_count, 0);
        assert_eq!(result.ack_skipped_count, 1);
        assert_eq!(result.error_count, 1);

        // The unacked update keeps the floor at the pending id.
        let raw = std::fs::read_to_string(&cursor_path).expect("cursor file");
        let cursor: serde_json::Value = serde_json::from_str(&raw).expect("cursor json");
        assert_eq!(cursor["committed_floor"], 100);
    }

    #[tokio::test]
    async fn regression_failing_heartbeat_sink_never_changes_cycle_outcome() {
        let run_with_emitter = |emitter: Arc<HeartbeatEventEmitter>| async move {
            let server = MockServer::start();
            mock_updates(&server, vec![text_update(100, 42, "hi")]);
            server.mock(|when, then| {
                when.method(POST).path("/bottest-token/sendMessage");
                then.status(200)
                    .body(json!({"ok": false, "error_code": 400}).to_string());
            });
            let config = runtime_config(&server, "");
            run_cycle(config, emitter, None).await
        };

        let baseline = run_with_emitter(Arc::new(HeartbeatEventEmitter::disabled())).await;
        let flaky_publisher = Arc::new(FlakyPublisher {
            fail: true,
            published: Mutex::new(Vec::new()),
        });
        let with_failing_sink = run_with_emitter(Arc::new(HeartbeatEventEmitter::new(
            flaky_publisher,
            "channel-runtime",
        )))
        .await;

        assert_eq!(baseline.status, with_failing_sink.status);
        assert_eq!(baseline.reason, with_failing_sink.reason);
        assert_eq!(baseline.fetched_count, with_failing_sink.fetched_count);
        assert_eq!(baseline.sent_count, with_failing_sink.sent_count);
        assert_eq!(baseline.acked_count, with_failing_sink.acked_count);
        assert_eq!(baseline.error_count, with_failing_sink.error_count);

        assert_eq!(baseline.heartbeat_emit_failures, 0);
        assert_eq!(baseline.telemetry.heartbeat.emit_state, "disabled");
        assert!(with_failing_sink.heartbeat_emit_failures >= 1);
        assert_eq!(
            with_failing_sink.telemetry.heartbeat.emit_state,
            "emit-failed"
        );
    }

    #[tokio::test]
    async fn functional_working_heartbeat_sink_receives_telemetry_digest() {
        let server = MockServer::start();
        mock_updates(&server, vec![text_update(100, 42, "hi")]);
        server.mock(|when, then| {
            when.method(POST).path("/bottest-token/sendMessage");
            then.status(200)
                .body(json!({"ok": false, "error_code": 400}).to_string());
        });
        let config = runtime_config(&server, "");
        let publisher = Arc::new(FlakyPublisher {
            fail: false,
            published: Mutex::new(Vec::new()),
        });
        let emitter = Arc::new(HeartbeatEventEmitter::new(
            publisher.clone(),
            "channel-runtime",
        ));

        let result = run_cycle(config, emitter, None).await;
        assert_eq!(result.telemetry.heartbeat.emit_state, "emitted");
        assert_eq!(result.heartbeat_emit_failures, 0);

        let events = publisher.published.lock().expect("published lock");
        assert!(!events.is_empty());
        assert_eq!(events[0].session_key, RUNTIME_FAILURE_SESSION_KEY);
        let digest = &events[0].context["telemetry_digest"];
        assert_eq!(digest["fetch_total"], 1);
        assert!(digest["cycle_total_ms"].is_u64());
    }

    #[tokio::test]
    async fn functional_payload_serializes_all_contract_fields_on_one_line() {
        let server = MockServer::start();
        mock_updates(&server, Vec::new());
        let config = runtime_config(&server, "");
        let result = run_cycle(config, Arc::new(HeartbeatEventEmitter::disabled()), None).await;

        let line = serde_json::to_string(&result).expect("serialize");
        assert!(!line.contains('\n'));
        let parsed: serde_json::Value = serde_json::from_str(&line).expect("parse");
        for key in [
            "status",
            "reason",
            "fetched_count",
            "sent_count",
            "acked_count",
            "ack_skipped_count",
            "error_count",
            "errors",
            "error_details",
            "heartbeat_emit_failures",
            "dropped_count",
            "dropped_updates",
            "telemetry",
        ] {
            assert!(parsed.get(key).is_some(), "payload is missing '{key}'");
        }
        assert_eq!(parsed["telemetry"]["contract"], "tg-live.runtime.telemetry");
    }

    #[tokio::test]
    async fn functional_run_loop_once_returns_after_a_single_cycle() {
        let server = MockServer::start();
        let fetch_mock = server.mock(|when, then| {
            when.method(POST).path("/bottest-token/getUpdates");
            then.status(200)
                .body(json!({"ok": true, "result": []}).to_string());
        });
        let config = runtime_config(&server, "");

        let mut observed = Vec::new();
        let result = run_loop(
            config,
            Arc::new(HeartbeatEventEmitter::disabled()),
            None,
            |cycle| observed.push(cycle.reason.clone()),
            RunLoopOptions::default(),
        )
        .await;
        assert_eq!(result.reason, "no-updates");
        assert_eq!(observed, vec!["no-updates".to_string()]);
        fetch_mock.assert_hits(1);
    }

    #[tokio::test]
    async fn integration_run_loop_reuses_ports_so_the_session_state_survives_cycles() {
        let server = MockServer::start();
        let fetch_mock = server.mock(|when, then| {
            when.method(POST).path("/bottest-token/getUpdates");
            then.status(200)
                .body(json!({"ok": true, "result": []}).to_string());
        });
        let mut config = runtime_config(&server, "");
        config.once = false;

        let mut cycles_seen = 0_u64;
        let result = run_loop(
            config,
            Arc::new(HeartbeatEventEmitter::disabled()),
            None,
            |_cycle| cycles_seen += 1,
            RunLoopOptions {
                max_cycles: Some(3),
            },
        )
        .await;
        assert_eq!(result.status, "ok");
        assert_eq!(cycles_seen, 3);
        fetch_mock.assert_hits(3);
    }
}
