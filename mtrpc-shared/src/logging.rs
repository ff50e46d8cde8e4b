//! Logging initialization from `logging_settings` (spec.md §6).
//!
//! The spec's Non-goals exclude a pluggable log-handler *plugin* system
//! (`log-handler plumbing`); the server still needs structured logging, so
//! this wires `tracing-subscriber` once at startup the way the teacher's
//! `tasker_shared::logging::init_tracing` does for its server binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingSettingsConfig};

/// Initialize the global `tracing` subscriber. Safe to call once per
/// process; a second call is a no-op error from `tracing`'s global
/// dispatcher that we deliberately ignore (tests may call this more than
/// once across the suite).
pub fn init_tracing(settings: &LoggingSettingsConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.filter.clone()));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match settings.format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(false);
            registry.with(fmt_layer).try_init()
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
            registry.with(fmt_layer).try_init()
        }
    };

    if let Err(e) = result {
        // Already initialized elsewhere (e.g. a previous test in the same
        // process) — not a fault worth propagating.
        eprintln!("tracing subscriber already initialized: {e}");
    }
}
