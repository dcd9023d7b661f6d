//! Per-cycle telemetry block and the compact digest embedded in events.
//!
//! The block is additive: nulled counters stay explicit nulls with
//! placeholder strings so downstream consumers can distinguish
//! "not instrumented yet" from zero.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Value};

pub const TELEMETRY_CONTRACT: &str = "tg-live.runtime.telemetry";
pub const TELEMETRY_VERSION: &str = "2.0";

const PLACEHOLDER_RETRY_TOTAL: &str = "pending-provider-attempt-instrumentation";
const PLACEHOLDER_QUEUE_DEPTH: &str = "pending-runtime-queue-introspection";
const PLACEHOLDER_WORKER_RESTART_TOTAL: &str = "pending-supervisor-integration";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TelemetryCounters {
    pub fetch_total: u64,
    pub send_total: u64,
    pub retry_total: Option<u64>,
    pub drop_total: u64,
    pub queue_depth: Option<u64>,
    pub worker_restart_total: Option<u64>,
    pub heartbeat_emit_failures: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TelemetryTimers {
    pub cycle_total: u64,
    pub fetch: Option<u64>,
    pub send: Option<u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TelemetryHeartbeat {
    pub emit_state: String,
}

/// Public telemetry block attached to every cycle payload.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RuntimeTelemetry {
    pub contract: String,
    pub version: String,
    pub counters: TelemetryCounters,
    pub timers_ms: TelemetryTimers,
    pub heartbeat: TelemetryHeartbeat,
    pub placeholders: BTreeMap<String, String>,
}

pub fn build_runtime_telemetry(
    fetch_total: u64,
    send_total: u64,
    drop_total: u64,
    heartbeat_emit_failures: u64,
    cycle_total_ms: u64,
    heartbeat_emit_state: &str,
) -> RuntimeTelemetry {
    RuntimeTelemetry {
        contract: TELEMETRY_CONTRACT.to_string(),
        version: TELEMETRY_VERSION.to_string(),
        counters: TelemetryCounters {
            fetch_total,
            send_total,
            retry_total: None,
            drop_total,
            queue_depth: None,
            worker_restart_total: None,
            heartbeat_emit_failures,
        },
        timers_ms: TelemetryTimers {
            cycle_total: cycle_total_ms,
            fetch: None,
            send: None,
        },
        heartbeat: TelemetryHeartbeat {
            emit_state: heartbeat_emit_state.to_string(),
        },
        placeholders: telemetry_placeholders(),
    }
}

/// Compact counter subset embedded in best-effort failure events.
pub fn build_telemetry_digest(
    fetch_total: u64,
    send_total: u64,
    drop_total: u64,
    cycle_total_ms: u64,
) -> Value {
    json!({
        "fetch_total": fetch_total,
        "send_total": send_total,
        "drop_total": drop_total,
        "cycle_total_ms": cycle_total_ms,
    })
}

fn telemetry_placeholders() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("retry_total".to_string(), PLACEHOLDER_RETRY_TOTAL.to_string()),
        ("queue_depth".to_string(), PLACEHOLDER_QUEUE_DEPTH.to_string()),
        (
            "worker_restart_total".to_string(),
            PLACEHOLDER_WORKER_RESTART_TOTAL.to_string(),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn functional_telemetry_block_serializes_contract_shape() {
        let telemetry = build_runtime_telemetry(3, 2, 1, 0, 17, "emitted");
        let value = serde_json::to_value(&telemetry).expect("serialize");

        assert_eq!(value["contract"], TELEMETRY_CONTRACT);
        assert_eq!(value["version"], "2.0");
        assert_eq!(value["counters"]["fetch_total"], 3);
        assert_eq!(value["counters"]["send_total"], 2);
        assert_eq!(value["counters"]["drop_total"], 1);
        assert_eq!(value["counters"]["heartbeat_emit_failures"], 0);
        assert!(value["counters"]["retry_total"].is_null());
        assert!(value["counters"]["queue_depth"].is_null());
        assert!(value["counters"]["worker_restart_total"].is_null());
        assert_eq!(value["timers_ms"]["cycle_total"], 17);
        assert!(value["timers_ms"]["fetch"].is_null());
        assert!(value["timers_ms"]["send"].is_null());
        assert_eq!(value["heartbeat"]["emit_state"], "emitted");
        assert_eq!(
            value["placeholders"]["retry_total"],
            "pending-provider-attempt-instrumentation"
        );
        assert_eq!(
            value["placeholders"]["queue_depth"],
            "pending-runtime-queue-introspection"
        );
        assert_eq!(
            value["placeholders"]["worker_restart_total"],
            "pending-supervisor-integration"
        );
    }

    #[test]
    fn unit_telemetry_digest_carries_the_triage_counters() {
        let digest = build_telemetry_digest(5, 4, 1, 250);
        assert_eq!(digest["fetch_total"], 5);
        assert_eq!(digest["send_total"], 4);
        assert_eq!(digest["drop_total"], 1);
        assert_eq!(digest["cycle_total_ms"], 250);
    }
}
