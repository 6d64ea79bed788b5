//! A set of utilities to enable logging configuration using tracing_subscriber.

use std::{error::Error, io::IsTerminal, sync::Once};

use tracing_subscriber::{EnvFilter, filter::LevelFilter};

static GLACIER_LOG_ENV_VAR: &str = "GLACIER_LOG";

/// Initializes a tracing subscriber for logging.
pub fn init() {
    // Since we also use this function to enable logging in tests, wrap it in `Once` to prevent
    // multiple initializations.
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let (env_filter, glacier_log_level) = env_filter_and_log_level();

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .init();

        tracing::info!("log level: {}", glacier_log_level);
    });
}

/// Renders the `source()` chain of an error, outermost first, for use as a log field.
///
/// The error itself is not included, so the usual pattern is
/// `error = %err, error_source = logging::error_source(&err)`.
pub fn error_source(err: &(dyn Error + 'static)) -> String {
    let mut sources = Vec::new();
    let mut current = err.source();
    while let Some(source) = current {
        sources.push(source.to_string());
        current = source.source();
    }
    format!("[{}]", sources.join(", "))
}

/// List of crates in the workspace.
const GLACIER_CRATES: &[&str] = &[
    "common",
    "config",
    "datasets_raw",
    "dump",
    "evm_rpc_datasets",
    "monitoring",
];

fn env_filter_and_log_level() -> (EnvFilter, String) {
    // Parse directives from RUST_LOG
    let log_filter = EnvFilter::builder().with_default_directive(LevelFilter::ERROR.into());
    let directive_string = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let mut env_filter = log_filter.parse_lossy(&directive_string);

    let log_level = std::env::var(GLACIER_LOG_ENV_VAR).unwrap_or_else(|_| "info".to_string());

    for crate_name in GLACIER_CRATES {
        // Add directives for each crate in GLACIER_CRATES, if not overriden by RUST_LOG
        if directive_string.contains(&format!("{crate_name}=")) {
            continue;
        }
        match format!("{crate_name}={log_level}").parse() {
            Ok(directive) => env_filter = env_filter.add_directive(directive),
            Err(err) => eprintln!("ignoring invalid {GLACIER_LOG_ENV_VAR} value: {err}"),
        }
    }

    (env_filter, log_level)
}
