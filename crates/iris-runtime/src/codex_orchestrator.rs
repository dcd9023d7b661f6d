//! Subprocess-backed orchestrator with per-session workers.
//!
//! Every session owns one worker task with an ordered inbox, so requests
//! for the same chat execute strictly serially while sessions stay
//! independent. Workers are spawned on first use, evicted after an idle
//! TTL or when the session table exceeds capacity, and forcibly terminated
//! on timeout so the next request starts from a fresh worker.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use iris_core::{
    current_unix_timestamp_ms, sanitize_error_text, ChannelDiagnostic, InboundMessage,
    OrchestratorPort, OutboundMessage,
};

const SESSION_INBOX_CAPACITY: usize = 32;

/// Single-line reply sent when `notify_on_orchestrator_error` is enabled.
pub const ORCHESTRATOR_ERROR_FALLBACK_TEXT: &str = "orchestrator error; please retry";

/// External command invoked once per handle request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodexCommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for CodexCommandSpec {
    fn default() -> Self {
        Self {
            program: "codex".to_string(),
            args: vec!["exec".to_string()],
        }
    }
}

/// Deterministic lifecycle policy for session workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodexSessionPolicy {
    pub max_sessions: usize,
    pub idle_ttl: Duration,
}

impl Default for CodexSessionPolicy {
    fn default() -> Self {
        Self {
            max_sessions: 128,
            idle_ttl: Duration::from_secs(900),
        }
    }
}

/// Serializable stdin payload for one codex invocation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CodexInvocationRequest {
    pub session_id: String,
    pub chat_id: String,
    pub user_id: Option<String>,
    pub text: String,
    pub update_id: String,
    pub message_id: Option<String>,
}

impl CodexInvocationRequest {
    pub fn from_inbound(inbound: &InboundMessage, session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            chat_id: inbound.chat_id.clone(),
            user_id: inbound.user_id.clone(),
            text: inbound.text.clone(),
            update_id: inbound.update_id.clone(),
            message_id: inbound.message_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct CodexInvokeError {
    message: String,
}

struct SessionWorkRequest {
    request: CodexInvocationRequest,
    reply: oneshot::Sender<Result<String, CodexInvokeError>>,
}

struct SessionWorker {
    inbox: mpsc::Sender<SessionWorkRequest>,
    task: tokio::task::JoinHandle<()>,
    last_activity_unix_ms: u64,
}

/// Codex seam for subprocess-backed message orchestration.
pub struct CodexOrchestrator {
    command: Arc<CodexCommandSpec>,
    policy: CodexSessionPolicy,
    timeout: Duration,
    notify_on_error: bool,
    sessions: Mutex<HashMap<String, SessionWorker>>,
    diagnostics: Mutex<Vec<ChannelDiagnostic>>,
}

impl CodexOrchestrator {
    pub fn new(
        command: CodexCommandSpec,
        policy: CodexSessionPolicy,
        timeout: Duration,
        notify_on_error: bool,
    ) -> Self {
        Self {
            command: Arc::new(command),
            policy,
            timeout,
            notify_on_error,
            sessions: Mutex::new(HashMap::new()),
            diagnostics: Mutex::new(Vec::new()),
        }
    }

    pub fn live_session_count(&self) -> usize {
        lock_or_recover(&self.sessions).len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock_or_recover(&self.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }

    fn checkout_inbox(&self, session_id: &str) -> mpsc::Sender<SessionWorkRequest> {
        let now_unix_ms = current_unix_timestamp_ms();
        let mut sessions = lock_or_recover(&self.sessions);
        evict_idle_sessions(&mut sessions, now_unix_ms, self.policy.idle_ttl);

        if let Some(worker) = sessions.get_mut(session_id) {
            worker.last_activity_unix_ms = now_unix_ms;
            return worker.inbox.clone();
        }

        let (inbox, receiver) = mpsc::channel::<SessionWorkRequest>(SESSION_INBOX_CAPACITY);
        let task = tokio::spawn(run_session_worker(self.command.clone(), receiver));
        sessions.insert(
            session_id.to_string(),
            SessionWorker {
                inbox: inbox.clone(),
                task,
                last_activity_unix_ms: now_unix_ms,
            },
        );
        evict_over_capacity(&mut sessions, self.policy.max_sessions.max(1), session_id);
        inbox
    }

    fn touch_session(&self, session_id: &str) {
        let mut sessions = lock_or_recover(&self.sessions);
        if let Some(worker) = sessions.get_mut(session_id) {
            worker.last_activity_unix_ms = current_unix_timestamp_ms();
        }
    }

    fn terminate_session(&self, session_id: &str) {
        let mut sessions = lock_or_recover(&self.sessions);
        if let Some(worker) = sessions.remove(session_id) {
            worker.task.abort();
        }
    }

    fn failure(
        &self,
        inbound: &InboundMessage,
        session_id: &str,
        code: &str,
        message: String,
    ) -> Result<Option<OutboundMessage>> {
        let message = sanitize_error_text(&message);
        lock_or_recover(&self.diagnostics).push(ChannelDiagnostic {
            code: code.to_string(),
            message: message.clone(),
            update_id: inbound.update_id.clone(),
            chat_id: inbound.chat_id.clone(),
            session_id: session_id.to_string(),
            retryable: true,
        });

        if self.notify_on_error {
            return Ok(Some(OutboundMessage {
                chat_id: inbound.chat_id.clone(),
                text: ORCHESTRATOR_ERROR_FALLBACK_TEXT.to_string(),
                reply_to_message_id: inbound.message_id.clone(),
            }));
        }
        Err(anyhow!("{code}: {message}"))
    }
}

#[async_trait]
impl OrchestratorPort for CodexOrchestrator {
    async fn handle_message(
        &self,
        inbound: &InboundMessage,
        session_id: &str,
    ) -> Result<Option<OutboundMessage>> {
        let inbox = self.checkout_inbox(session_id);
        let request = CodexInvocationRequest::from_inbound(inbound, session_id);
        let (reply_tx, reply_rx) = oneshot::channel();

        if inbox
            .send(SessionWorkRequest {
                request,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            self.terminate_session(session_id);
            return self.failure(
                inbound,
                session_id,
                "codex-exec-failed",
                "codex session worker inbox is closed".to_string(),
            );
        }

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(Ok(text))) => {
                self.touch_session(session_id);
                Ok(Some(OutboundMessage {
                    chat_id: inbound.chat_id.clone(),
                    text,
                    reply_to_message_id: inbound.message_id.clone(),
                }))
            }
            Ok(Ok(Err(invoke_error))) => {
                self.touch_session(session_id);
                self.failure(inbound, session_id, "codex-exec-failed", invoke_error.message)
            }
            Ok(Err(_recv_error)) => self.failure(
                inbound,
                session_id,
                "codex-exec-failed",
                "codex session worker dropped the reply channel".to_string(),
            ),
            Err(_elapsed) => {
                // Kill the whole worker so the stuck subprocess dies with it;
                // the next request for this session spawns fresh.
                self.terminate_session(session_id);
                self.failure(
                    inbound,
                    session_id,
                    "codex-timeout",
                    format!(
                        "codex invocation timed out after {:.3}s",
                        self.timeout.as_secs_f64()
                    ),
                )
            }
        }
    }

    fn drain_diagnostics(&self) -> Vec<ChannelDiagnostic> {
        std::mem::take(&mut lock_or_recover(&self.diagnostics))
    }
}

async fn run_session_worker(
    command: Arc<CodexCommandSpec>,
    mut inbox: mpsc::Receiver<SessionWorkRequest>,
) {
    while let Some(work) = inbox.recv().await {
        let result = invoke_codex_subprocess(&command, &work.request).await;
        let _ = work.reply.send(result);
    }
}

async fn invoke_codex_subprocess(
    command: &CodexCommandSpec,
    request: &CodexInvocationRequest,
) -> Result<String, CodexInvokeError> {
    let payload = serde_json::to_string(request).map_err(|error| CodexInvokeError {
        message: format!("failed to encode codex request payload: {error}"),
    })?;

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|error| CodexInvokeError {
            message: format!("failed to spawn codex subprocess: {error}"),
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        // A fast-exiting child may close stdin first; the exit status below
        // is the authoritative failure signal.
        let _ = stdin.write_all(payload.as_bytes()).await;
        let _ = stdin.write_all(b"\n").await;
        let _ = stdin.shutdown().await;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|error| CodexInvokeError {
            message: format!("failed to await codex subprocess: {error}"),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(CodexInvokeError {
            message: if stderr.is_empty() {
                "codex invocation failed".to_string()
            } else {
                stderr
            },
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() {
        return Err(CodexInvokeError {
            message: "codex produced no stdout output".to_string(),
        });
    }
    Ok(stdout)
}

fn evict_idle_sessions(
    sessions: &mut HashMap<String, SessionWorker>,
    now_unix_ms: u64,
    idle_ttl: Duration,
) {
    let idle_ttl_ms = u64::try_from(idle_ttl.as_millis()).unwrap_or(u64::MAX);
    let stale_ids: Vec<String> = sessions
        .iter()
        .filter(|(_, worker)| {
            now_unix_ms.saturating_sub(worker.last_activity_unix_ms) >= idle_ttl_ms
        })
        .map(|(session_id, _)| session_id.clone())
        .collect();
    for session_id in stale_ids {
        if let Some(worker) = sessions.remove(&session_id) {
            worker.task.abort();
        }
    }
}

fn evict_over_capacity(
    sessions: &mut HashMap<String, SessionWorker>,
    max_sessions: usize,
    prefer_keep_session_id: &str,
) {
    while sessions.len() > max_sessions {
        let victim = sessions
            .iter()
            .filter(|(session_id, _)| session_id.as_str() != prefer_keep_session_id)
            .min_by_key(|(session_id, worker)| (worker.last_activity_unix_ms, session_id.clone()))
            .map(|(session_id, _)| session_id.clone());
        let Some(victim) = victim else {
            break;
        };
        if let Some(worker) = sessions.remove(&victim) {
            worker.task.abort();
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(update_id: &str, chat_id: &str, text: &str) -> InboundMessage {
        InboundMessage {
            update_id: update_id.to_string(),
            chat_id: chat_id.to_string(),
            user_id: Some("7".to_string()),
            text: text.to_string(),
            message_id: Some("900".to_string()),
            received_ts_ms: 0,
        }
    }

    #[test]
    fn unit_invocation_request_serializes_inbound_fields() {
        let request = CodexInvocationRequest::from_inbound(&inbound("100", "42", "hi"), "telegram:42");
        let payload = serde_json::to_string(&request).expect("encode");
        assert!(payload.contains("\"session_id\":\"telegram:42\""));
        assert!(payload.contains("\"chat_id\":\"42\""));
        assert!(payload.contains("\"text\":\"hi\""));
        assert!(payload.contains("\"update_id\":\"100\""));
    }

    #[cfg(unix)]
    mod subprocess {
        use super::*;

        fn sh_command(script: &str) -> CodexCommandSpec {
            CodexCommandSpec {
                program: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
            }
        }

        fn orchestrator(
            script: &str,
            timeout_ms: u64,
            notify_on_error: bool,
        ) -> CodexOrchestrator {
            CodexOrchestrator::new(
                sh_command(script),
                CodexSessionPolicy::default(),
                Duration::from_millis(timeout_ms),
                notify_on_error,
            )
        }

        #[tokio::test]
        async fn functional_codex_reply_round_trips_through_subprocess() {
            let orchestrator = orchestrator("cat >/dev/null; printf 'pong'", 5_000, false);
            let reply = orchestrator
                .handle_message(&inbound("100", "42", "ping"), "telegram:42")
                .await
                .expect("handle")
                .expect("outbound");
            assert_eq!(reply.chat_id, "42");
            assert_eq!(reply.text, "pong");
            assert_eq!(reply.reply_to_message_id.as_deref(), Some("900"));
            assert!(orchestrator.drain_diagnostics().is_empty());
            assert_eq!(orchestrator.live_session_count(), 1);
        }

        #[tokio::test]
        async fn functional_subprocess_receives_json_payload_on_stdin() {
            let orchestrator = orchestrator("payload=$(cat); printf '%s' \"$payload\"", 5_000, false);
            let reply = orchestrator
                .handle_message(&inbound("100", "42", "hi there"), "telegram:42")
                .await
                .expect("handle")
                .expect("outbound");
            assert!(reply.text.contains("\"session_id\":\"telegram:42\""));
            assert!(reply.text.contains("\"text\":\"hi there\""));
            assert!(reply.text.contains("\"update_id\":\"100\""));
        }

        #[tokio::test]
        async fn functional_timeout_terminates_worker_and_records_diagnostic() {
            let orchestrator = orchestrator("sleep 5; printf 'too late'", 100, false);
            let error = orchestrator
                .handle_message(&inbound("100", "42", "slow"), "telegram:42")
                .await
                .expect_err("timeout should fail");
            assert!(error.to_string().contains("codex-timeout"));

            let diagnostics = orchestrator.drain_diagnostics();
            assert_eq!(diagnostics.len(), 1);
            assert_eq!(diagnostics[0].code, "codex-timeout");
            assert!(diagnostics[0].retryable);
            assert_eq!(diagnostics[0].session_id, "telegram:42");
            assert_eq!(diagnostics[0].update_id, "100");
            assert_eq!(orchestrator.live_session_count(), 0);
        }

        #[tokio::test]
        async fn functional_nonzero_exit_maps_to_exec_failed_with_stderr() {
            let orchestrator = orchestrator("echo oops >&2; exit 3", 5_000, false);
            let error = orchestrator
                .handle_message(&inbound("100", "42", "hi"), "telegram:42")
                .await
                .expect_err("nonzero exit should fail");
            assert!(error.to_string().contains("codex-exec-failed"));

            let diagnostics = orchestrator.drain_diagnostics();
            assert_eq!(diagnostics[0].code, "codex-exec-failed");
            assert!(diagnostics[0].message.contains("oops"));
        }

        #[tokio::test]
        async fn regression_empty_stdout_is_an_exec_failure() {
            let orchestrator = orchestrator("cat >/dev/null; exit 0", 5_000, false);
            let error = orchestrator
                .handle_message(&inbound("100", "42", "hi"), "telegram:42")
                .await
                .expect_err("empty stdout should fail");
            assert!(error.to_string().contains("codex-exec-failed"));
            let diagnostics = orchestrator.drain_diagnostics();
            assert!(diagnostics[0].message.contains("no stdout"));
        }

        #[tokio::test]
        async fn regression_spawn_failure_is_an_exec_failure() {
            let orchestrator = CodexOrchestrator::new(
                CodexCommandSpec {
                    program: "/nonexistent/definitely-not-codex".to_string(),
                    args: Vec::new(),
                },
                CodexSessionPolicy::default(),
                Duration::from_secs(5),
                false,
            );
            let error = orchestrator
                .handle_message(&inbound("100", "42", "hi"), "telegram:42")
                .await
                .expect_err("spawn failure should fail");
            assert!(error.to_string().contains("codex-exec-failed"));
            let diagnostics = orchestrator.drain_diagnostics();
            assert!(diagnostics[0].message.contains("failed to spawn"));
        }

        #[tokio::test]
        async fn functional_fallback_notify_returns_single_line_reply() {
            let orchestrator = orchestrator("sleep 5", 100, true);
            let reply = orchestrator
                .handle_message(&inbound("100", "42", "hi"), "telegram:42")
                .await
                .expect("notify mode should not error")
                .expect("fallback outbound");
            assert_eq!(reply.text, ORCHESTRATOR_ERROR_FALLBACK_TEXT);
            assert!(!reply.text.contains('\n'));

            // Diagnostics are recorded regardless of the fallback reply.
            let diagnostics = orchestrator.drain_diagnostics();
            assert_eq!(diagnostics[0].code, "codex-timeout");
        }

        #[tokio::test]
        async fn integration_same_session_requests_execute_serially() {
            let temp = tempfile::tempdir().expect("tempdir");
            let log_path = temp.path().join("worker.log");
            let script = format!(
                "cat >/dev/null; printf 'start\\n' >> {log}; sleep 0.15; printf 'end\\n' >> {log}; printf 'ok'",
                log = log_path.display()
            );
            let orchestrator = orchestrator(&script, 5_000, false);

            let inbound_first = inbound("100", "42", "a");
            let inbound_second = inbound("101", "42", "b");
            let first = orchestrator.handle_message(&inbound_first, "telegram:42");
            let second = orchestrator.handle_message(&inbound_second, "telegram:42");
            let (first, second) = tokio::join!(first, second);
            first.expect("first handle");
            second.expect("second handle");

            let log = std::fs::read_to_string(&log_path).expect("worker log");
            let lines: Vec<&str> = log.lines().collect();
            assert_eq!(lines, vec!["start", "end", "start", "end"]);
        }

        #[tokio::test]
        async fn integration_timeout_on_one_session_does_not_block_another() {
            let script = "payload=$(cat); case \"$payload\" in *slow*) sleep 5;; esac; printf 'ok'";
            let orchestrator = orchestrator(script, 300, false);

            let inbound_slow = inbound("100", "1", "slow request");
            let inbound_fast = inbound("101", "2", "fast");
            let slow = orchestrator.handle_message(&inbound_slow, "telegram:1");
            let fast = orchestrator.handle_message(&inbound_fast, "telegram:2");
            let (slow, fast) = tokio::join!(slow, fast);

            assert!(slow.is_err());
            let reply = fast.expect("fast session succeeds").expect("outbound");
            assert_eq!(reply.text, "ok");

            let diagnostics = orchestrator.drain_diagnostics();
            assert_eq!(diagnostics.len(), 1);
            assert_eq!(diagnostics[0].code, "codex-timeout");
            assert_eq!(diagnostics[0].session_id, "telegram:1");
        }

        #[tokio::test]
        async fn functional_session_table_evicts_least_recently_active_over_capacity() {
            let orchestrator = CodexOrchestrator::new(
                sh_command("cat >/dev/null; printf 'ok'"),
                CodexSessionPolicy {
                    max_sessions: 1,
                    idle_ttl: Duration::from_secs(900),
                },
                Duration::from_secs(5),
                false,
            );

            orchestrator
                .handle_message(&inbound("100", "1", "hi"), "telegram:1")
                .await
                .expect("first session");
            orchestrator
                .handle_message(&inbound("101", "2", "hi"), "telegram:2")
                .await
                .expect("second session");

            assert_eq!(orchestrator.live_session_count(), 1);
            assert_eq!(orchestrator.session_ids(), vec!["telegram:2".to_string()]);
        }

        #[tokio::test]
        async fn functional_idle_sessions_are_evicted_after_ttl() {
            let orchestrator = CodexOrchestrator::new(
                sh_command("cat >/dev/null; printf 'ok'"),
                CodexSessionPolicy {
                    max_sessions: 8,
                    idle_ttl: Duration::from_millis(50),
                },
                Duration::from_secs(5),
                false,
            );

            orchestrator
                .handle_message(&inbound("100", "1", "hi"), "telegram:1")
                .await
                .expect("first session");
            tokio::time::sleep(Duration::from_millis(120)).await;
            orchestrator
                .handle_message(&inbound("101", "2", "hi"), "telegram:2")
                .await
                .expect("second session");

            assert_eq!(orchestrator.session_ids(), vec!["telegram:2".to_string()]);
        }
    }
}
