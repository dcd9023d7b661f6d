//! Structured error details and the mapping from legacy error strings and
//! drained diagnostics into the per-cycle `error_details` list.
//!
//! `diagnostic_id` is a stable short hash of the detail fingerprint, so
//! identical failures collapse within a cycle and de-duplicate at external
//! receivers across cycles.

use serde::Serialize;
use sha2::{Digest, Sha256};

use iris_core::{ChannelDiagnostic, ProcessOnceOutcome};

const DIAGNOSTIC_ID_HEX_CHARS: usize = 16;

pub const ERROR_DETAIL_SOURCE_SERVICE: &str = "process_once";
pub const ERROR_DETAIL_SOURCE_ORCHESTRATOR: &str = "orchestrator.diagnostics";
pub const ERROR_DETAIL_SOURCE_ADAPTER: &str = "adapter.diagnostics";
pub const ERROR_DETAIL_SOURCE_RUNTIME: &str = "runtime-wrapper";

pub const ERROR_DETAIL_CATEGORY_ERROR: &str = "error";
pub const ERROR_DETAIL_CATEGORY_DROP: &str = "drop";

/// Context identifiers attached to one error detail; absent values stay
/// empty strings.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ErrorDetailContext {
    pub update_id: String,
    pub chat_id: String,
    pub session_id: String,
    pub layer: String,
    pub operation: String,
}

/// One structured error or drop record in the cycle payload.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub context: ErrorDetailContext,
    pub source: String,
    pub category: String,
    pub diagnostic_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ErrorDetailSpec<'a> {
    pub code: &'a str,
    pub message: &'a str,
    pub retryable: bool,
    pub source: &'a str,
    pub category: &'a str,
    pub layer: &'a str,
    pub operation: &'a str,
    pub update_id: &'a str,
    pub chat_id: &'a str,
    pub session_id: &'a str,
}

pub fn build_error_detail(spec: ErrorDetailSpec<'_>) -> ErrorDetail {
    let context = ErrorDetailContext {
        update_id: spec.update_id.trim().to_string(),
        chat_id: spec.chat_id.trim().to_string(),
        session_id: spec.session_id.trim().to_string(),
        layer: spec.layer.trim().to_string(),
        operation: spec.operation.trim().to_string(),
    };
    let mut detail = ErrorDetail {
        code: spec.code.trim().to_string(),
        message: spec.message.trim().to_string(),
        retryable: spec.retryable,
        context,
        source: spec.source.trim().to_string(),
        category: spec.category.trim().to_string(),
        diagnostic_id: String::new(),
    };
    detail.diagnostic_id = diagnostic_id_for(&detail);
    detail
}

fn detail_fingerprint(detail: &ErrorDetail) -> String {
    [
        detail.code.as_str(),
        detail.message.as_str(),
        detail.context.update_id.as_str(),
        detail.context.chat_id.as_str(),
        detail.context.session_id.as_str(),
        detail.context.layer.as_str(),
        detail.context.operation.as_str(),
        detail.category.as_str(),
    ]
    .join("|")
}

fn diagnostic_id_for(detail: &ErrorDetail) -> String {
    let digest = Sha256::digest(detail_fingerprint(detail).as_bytes());
    digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>()
        .chars()
        .take(DIAGNOSTIC_ID_HEX_CHARS)
        .collect()
}

/// Collapses duplicate details (same fingerprint) into one entry, first wins.
pub fn dedupe_error_details(details: Vec<ErrorDetail>) -> Vec<ErrorDetail> {
    let mut unique = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for detail in details {
        if seen.insert(detail_fingerprint(&detail)) {
            unique.push(detail);
        }
    }
    unique
}

/// Maps the service's legacy error strings into structured details.
pub fn map_service_errors(outcome: &ProcessOnceOutcome) -> Vec<ErrorDetail> {
    if outcome.errors.is_empty() {
        return Vec::new();
    }

    if outcome.reason == "adapter-fetch-exception" {
        return outcome
            .errors
            .iter()
            .map(|message| {
                build_error_detail(ErrorDetailSpec {
                    code: "adapter-fetch-exception",
                    message,
                    retryable: true,
                    source: ERROR_DETAIL_SOURCE_SERVICE,
                    category: ERROR_DETAIL_CATEGORY_ERROR,
                    layer: "service",
                    operation: "fetch_updates",
                    ..ErrorDetailSpec::default()
                })
            })
            .collect();
    }

    outcome
        .errors
        .iter()
        .map(|message| map_service_error_message(message))
        .collect()
}

fn map_service_error_message(message: &str) -> ErrorDetail {
    if let Some((update_id, rest)) = split_update_error(message) {
        if rest.starts_with("ack failed:") {
            return build_error_detail(ErrorDetailSpec {
                code: "ack-update-failed",
                message,
                retryable: true,
                source: ERROR_DETAIL_SOURCE_SERVICE,
                category: ERROR_DETAIL_CATEGORY_ERROR,
                layer: "service",
                operation: "ack_update",
                update_id: &update_id,
                ..ErrorDetailSpec::default()
            });
        }
        let operation = infer_service_operation(rest);
        let retryable = infer_retryable_service_error(rest, operation);
        return build_error_detail(ErrorDetailSpec {
            code: "update-processing-exception",
            message,
            retryable,
            source: ERROR_DETAIL_SOURCE_SERVICE,
            category: ERROR_DETAIL_CATEGORY_ERROR,
            layer: "service",
            operation,
            update_id: &update_id,
            ..ErrorDetailSpec::default()
        });
    }

    build_error_detail(ErrorDetailSpec {
        code: "service-cycle-error",
        message,
        retryable: false,
        source: ERROR_DETAIL_SOURCE_SERVICE,
        category: ERROR_DETAIL_CATEGORY_ERROR,
        layer: "service",
        operation: "process_once",
        ..ErrorDetailSpec::default()
    })
}

fn split_update_error(message: &str) -> Option<(String, &str)> {
    let rest = message.strip_prefix("update ")?;
    let (update_id, detail) = rest.split_once(':')?;
    let update_id = update_id.trim();
    if update_id.is_empty() {
        return None;
    }
    Some((update_id.to_string(), detail.trim_start()))
}

fn infer_service_operation(message: &str) -> &'static str {
    let normalized = message.to_lowercase();
    if normalized.contains("ack failed") || normalized.contains("ack_update") {
        return "ack_update";
    }
    if normalized.contains("send_message") || normalized.contains("send failed") {
        return "send_message";
    }
    "handle_message"
}

fn infer_retryable_service_error(message: &str, operation: &str) -> bool {
    if operation == "send_message" || operation == "ack_update" {
        return true;
    }
    let normalized = message.to_lowercase();
    [
        "timeout",
        "temporar",
        "connection",
        "network",
        "unavailable",
        "too many requests",
        "rate limit",
    ]
    .iter()
    .any(|token| normalized.contains(token))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticOrigin {
    Orchestrator,
    Adapter,
}

/// Maps one drained diagnostic into an error detail. Drop-category
/// diagnostics (`allowlist-drop`, `stale-drop`) keep their own layers and
/// operations so receivers can tell policy drops from transport drops;
/// informational notes like `cursor-persistence-disabled` also carry the
/// drop category so they never count as cycle errors.
pub fn map_runtime_diagnostic(
    origin: DiagnosticOrigin,
    diagnostic: &ChannelDiagnostic,
) -> ErrorDetail {
    match origin {
        DiagnosticOrigin::Orchestrator => {
            if diagnostic.code == "allowlist-drop" {
                return build_error_detail(ErrorDetailSpec {
                    code: "allowlist-drop",
                    message: &diagnostic.message,
                    retryable: false,
                    source: ERROR_DETAIL_SOURCE_ORCHESTRATOR,
                    category: ERROR_DETAIL_CATEGORY_DROP,
                    layer: "gate",
                    operation: "allowlist_check",
                    update_id: &diagnostic.update_id,
                    chat_id: &diagnostic.chat_id,
                    ..ErrorDetailSpec::default()
                });
            }
            build_error_detail(ErrorDetailSpec {
                code: if diagnostic.code.is_empty() {
                    "orchestrator-error"
                } else {
                    diagnostic.code.as_str()
                },
                message: &diagnostic.message,
                retryable: diagnostic.retryable,
                source: ERROR_DETAIL_SOURCE_ORCHESTRATOR,
                category: ERROR_DETAIL_CATEGORY_ERROR,
                layer: "orchestrator",
                operation: "handle_message",
                update_id: &diagnostic.update_id,
                chat_id: &diagnostic.chat_id,
                session_id: &diagnostic.session_id,
            })
        }
        DiagnosticOrigin::Adapter => {
            if diagnostic.code == "stale-drop" {
                return build_error_detail(ErrorDetailSpec {
                    code: "stale-drop",
                    message: &diagnostic.message,
                    retryable: false,
                    source: ERROR_DETAIL_SOURCE_ADAPTER,
                    category: ERROR_DETAIL_CATEGORY_DROP,
                    layer: "adapter",
                    operation: "stale_filter",
                    update_id: &diagnostic.update_id,
                    chat_id: &diagnostic.chat_id,
                    ..ErrorDetailSpec::default()
                });
            }
            if diagnostic.code == "cursor-persistence-disabled" {
                return build_error_detail(ErrorDetailSpec {
                    code: "cursor-persistence-disabled",
                    message: &diagnostic.message,
                    retryable: false,
                    source: ERROR_DETAIL_SOURCE_ADAPTER,
                    category: ERROR_DETAIL_CATEGORY_DROP,
                    layer: "adapter",
                    operation: "cursor_state_load",
                    ..ErrorDetailSpec::default()
                });
            }
            let (operation, retryable) = match diagnostic.code.as_str() {
                "cursor-state-load-failed" => ("cursor_state_load", true),
                "cursor-state-save-failed" => ("cursor_state_save", true),
                _ => ("fetch_updates", diagnostic.retryable),
            };
            build_error_detail(ErrorDetailSpec {
                code: if diagnostic.code.is_empty() {
                    "adapter-diagnostic-error"
                } else {
                    diagnostic.code.as_str()
                },
                message: &diagnostic.message,
                retryable,
                source: ERROR_DETAIL_SOURCE_ADAPTER,
                category: ERROR_DETAIL_CATEGORY_ERROR,
                layer: "adapter",
                operation,
                update_id: &diagnostic.update_id,
                chat_id: &diagnostic.chat_id,
                session_id: &diagnostic.session_id,
            })
        }
    }
}
