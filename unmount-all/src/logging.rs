// ABOUTME: Logging setup for the shutdown unmount helper.
// ABOUTME: Sends structured diagnostics to stderr so stdout carries only progress lines.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
