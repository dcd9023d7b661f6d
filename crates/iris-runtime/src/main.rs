use std::sync::Arc;

use clap::Parser;
use serde_json::json;

use iris_runtime::{
    init_tracing, resolve_runtime_config, run_loop, Cli, CycleResult, HeartbeatEventEmitter,
    RunLoopOptions,
};

const EXIT_OK: i32 = 0;
const EXIT_CYCLE_FAILED: i32 = 1;
const EXIT_INVALID_CONFIG: i32 = 2;
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    init_tracing();
    std::process::exit(run_main().await);
}

async fn run_main() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            if error.use_stderr() {
                emit_invalid_config_payload(&error.to_string());
                return EXIT_INVALID_CONFIG;
            }
            // --help / --version render normally.
            let _ = error.print();
            return EXIT_OK;
        }
    };
    let config = match resolve_runtime_config(cli) {
        Ok(config) => config,
        Err(error) => {
            emit_invalid_config_payload(&error.to_string());
            return EXIT_INVALID_CONFIG;
        }
    };

    // The heartbeat backend is an external collaborator; without one wired
    // in, emission stays in the "disabled" state and cycles are unaffected.
    let emitter = Arc::new(HeartbeatEventEmitter::disabled());
    let once = config.once;

    let loop_task = run_loop(
        config,
        emitter,
        None,
        emit_cycle_payload,
        RunLoopOptions::default(),
    );

    tokio::select! {
        result = loop_task => {
            if once {
                exit_code_for_result(&result)
            } else {
                EXIT_OK
            }
        }
        _ = tokio::signal::ctrl_c() => EXIT_INTERRUPTED,
    }
}

fn emit_cycle_payload(result: &CycleResult) {
    match serde_json::to_string(result) {
        Ok(line) => println!("{line}"),
        Err(error) => tracing::warn!("failed to encode cycle payload: {error}"),
    }
}

fn emit_invalid_config_payload(error: &str) {
    let payload = json!({
        "status": "failed",
        "reason": "invalid-config",
        "error": error,
    });
    println!("{payload}");
}

fn exit_code_for_result(result: &CycleResult) -> i32 {
    if result.status.trim().eq_ignore_ascii_case("failed") {
        EXIT_CYCLE_FAILED
    } else {
        EXIT_OK
    }
}
