//! Logging setup, following the teacher's `tracing`/`tracing-subscriber`
//! usage. Deliberately not global mutable state beyond what `tracing`
//! itself owns (a single process-wide subscriber); every call site threads
//! its own `tracing::Span`, per the instruction in spec.md section 9 to
//! avoid porting the source's process-wide logger macros.

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Installs a global `tracing` subscriber. Call once, at process start, from
/// the `czar` or `worker` binary's `main`.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
