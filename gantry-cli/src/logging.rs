//! Diagnostic logging for the `gantry` binary.
//!
//! Progress goes through [`crate::output`]; this is the `tracing` side,
//! written to stderr so it never mixes with step output on stdout.

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "warn";

/// Install the global subscriber. `-v` selects `info`, `-vv` and above `debug`;
/// otherwise `GANTRY_LOG`, then `RUST_LOG`, then `warn`.
pub fn init(verbosity: u8, json: bool) {
    let env = std::env::var("GANTRY_LOG")
        .ok()
        .or_else(|| std::env::var("RUST_LOG").ok());
    let directive = directive(verbosity, env);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        tracing::debug!("global tracing subscriber already initialized");
    }
}

fn directive(verbosity: u8, env: Option<String>) -> String {
    match verbosity {
        0 => env
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DIRECTIVE.to_string()),
        1 => "info".to_string(),
        _ => "debug".to_string(),
    }
}
