use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Installs the process-wide tracing subscriber (default WARN, env-tunable).
///
/// The cycle payload itself goes to stdout; tracing output stays on stderr so
/// payload consumers never see log noise.
pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}
