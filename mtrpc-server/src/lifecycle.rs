//! Process lifecycle: configuration-driven signal wiring and the top-level
//! run loop.
//!
//! Grounded on spec.md §9's "Global-singleton server interface" redesign
//! flag: there is no process-wide singleton here, only an explicit value
//! built from a `ServerConfig` and driven by `serve`/`run_once`; signals are
//! wired by this module, not latched into a class the way the original's
//! `mtrpc.server` package-level state does it. `run_once` plays the role of
//! `RPCManager.init`/`go` from `mtrpc/server/threads.py`: build the topology,
//! run to completion, return whether the stop that ended it asked for a
//! restart (spec.md §6: `HUP` arms the outer loop to reconfigure).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mtrpc_shared::config::{ServerConfig, SignalAction};
use mtrpc_shared::resilience::RetryPolicy;
use mtrpc_shared::ServerResult;
use mtrpc_tree::{build_tree_with_core, CoreUnit, MethodTree, SourceSpec, SourceUnit, TreeHandle};
use tokio::signal::unix::{signal, SignalKind};

use crate::broker::BrokerFactory;
use crate::control_plane::{ControlPlane, Severity, StoppingDescriptor};
use crate::manager::{Manager, ManagerConfig};
use crate::responder::{Responder, ResponderConfig};

/// Marker prefix distinguishing a restart-triggered stop from a plain exit,
/// since both travel through the same `StoppingDescriptor.reason` string.
const RESTART_REASON_PREFIX: &str = "signal-restart:";

fn signal_kind(name: &str) -> Option<SignalKind> {
    match name.to_ascii_uppercase().as_str() {
        "TERM" | "SIGTERM" => Some(SignalKind::terminate()),
        "HUP" | "SIGHUP" => Some(SignalKind::hangup()),
        "INT" | "SIGINT" => Some(SignalKind::interrupt()),
        "USR1" | "SIGUSR1" => Some(SignalKind::user_defined1()),
        "USR2" | "SIGUSR2" => Some(SignalKind::user_defined2()),
        _ => None,
    }
}

fn retry_policy_from(try_action_attempts: u32, reconnect_interval_ms: u64) -> RetryPolicy {
    RetryPolicy {
        try_action_attempts,
        reconnect_interval: Duration::from_millis(reconnect_interval_ms),
        connect_attempts: try_action_attempts.max(1),
    }
}

/// Mount the statically-registered `system.*` unit (spec.md §4.7 plus the
/// SPEC_FULL ping/whoami supplement). spec.md §1 places application
/// procedure modules out of scope as an external collaborator, so this core
/// mounts exactly `system.*` — the one source unit it ships itself.
fn build_system_tree(mount: &str, exports: Vec<String>) -> ServerResult<(Arc<MethodTree>, TreeHandle)> {
    let core = CoreUnit::new();
    let handle = core.tree_handle();
    let spec = SourceSpec {
        mount: mount.to_string(),
        unit: Box::new(core) as Box<dyn SourceUnit>,
        exports,
        post_init_kwargs: serde_json::Map::new(),
    };
    let tree = build_tree_with_core(vec![spec], &handle)?;
    Ok((Arc::new(tree), handle))
}

/// Run one server lifetime to completion: declare topology, consume and
/// respond until a stop is requested, then drain and close (spec.md §4.4,
/// §4.5 shutdown). Returns `true` if the stop that ended it was a restart
/// request (spec.md §6 `HUP`), in which case the caller should reload
/// configuration and call this again.
pub async fn run_once(config: ServerConfig) -> ServerResult<bool> {
    let source = config.rpc_tree_init.sources.first();
    let mount = source
        .map(|s| s.mount.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "system".to_string());
    let exports = source
        .map(|s| s.exports.clone())
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| vec!["*".to_string()]);
    let (tree, _handle) = build_system_tree(&mount, exports)?;

    let (control_plane, results_rx) = ControlPlane::new();

    let responder_policy = retry_policy_from(
        config.responder_attributes.try_action_attempts,
        config.responder_attributes.reconnect_interval_ms,
    );
    let manager_policy = retry_policy_from(
        config.manager_attributes.try_action_attempts,
        config.manager_attributes.reconnect_interval_ms,
    );

    let responder = Responder::new(
        BrokerFactory::Lapin { uri: config.amqp_params.url.clone() },
        ResponderConfig {
            response_exchange: config.responder_attributes.response_exchange.clone(),
            retry_policy: responder_policy,
        },
        Arc::clone(&control_plane),
        results_rx,
    );

    let exchange_types = config.exchange_types.clone();
    let manager = Manager::new(
        BrokerFactory::Lapin { uri: config.amqp_params.url.clone() },
        ManagerConfig {
            client_id: config.amqp_params.client_id.clone(),
            prefetch_count: config.manager_attributes.prefetch_count,
            retry_policy: manager_policy,
        },
        config.bindings.clone(),
        Box::new(move |exchange: &str| exchange_types.0.get(exchange).copied().unwrap_or_default()),
        Arc::clone(&tree),
        Arc::clone(&control_plane),
        responder,
        None,
    );

    spawn_signal_handlers(
        Arc::clone(&control_plane),
        config.os_settings.signals.clone(),
        config.os_settings.stop_timeout_ms,
    );

    manager.run().await;

    let descriptor = control_plane.is_stopping().await;
    Ok(descriptor
        .map(|d| d.reason.starts_with(RESTART_REASON_PREFIX))
        .unwrap_or(false))
}

/// The outer loop spec.md §6 describes for `HUP`: reload configuration and
/// call `run_once` again as long as it keeps asking to restart.
pub async fn serve(config_path: Option<&Path>) -> ServerResult<()> {
    loop {
        let config = ServerConfig::load(config_path)?;
        mtrpc_shared::logging::init_tracing(&config.logging_settings);
        let restart = run_once(config).await?;
        if !restart {
            return Ok(());
        }
        tracing::info!("restart requested, reconfiguring and starting a fresh server lifetime");
    }
}

/// Wire each configured `os_settings.signals` entry to a stop request.
/// `SignalAction::Restart` tags the reason so `run_once`'s caller knows to
/// loop; either way a stop that is not acknowledged within `stop_timeout_ms`
/// is escalated to `force=true` so shutdown always completes eventually.
fn spawn_signal_handlers(control_plane: Arc<ControlPlane>, signals: HashMap<String, SignalAction>, stop_timeout_ms: u64) {
    for (name, action) in signals {
        let Some(kind) = signal_kind(&name) else {
            tracing::warn!(signal = %name, "unrecognized signal name in os_settings, not wired");
            continue;
        };
        let control_plane = Arc::clone(&control_plane);
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::error!(signal = %name, error = %err, "failed to install signal handler");
                    return;
                }
            };
            stream.recv().await;
            let reason = match action {
                SignalAction::Exit => format!("signal:{name}"),
                SignalAction::Restart => format!("{RESTART_REASON_PREFIX}{name}"),
            };
            tracing::info!(signal = %name, ?action, stop_timeout_ms, "signal received, requesting stop");
            control_plane
                .begin_stopping(StoppingDescriptor::new(reason, Severity::Info, false))
                .await;

            let escalate_after = Duration::from_millis(stop_timeout_ms);
            tokio::time::sleep(escalate_after).await;
            tracing::warn!(signal = %name, stop_timeout_ms, "stop timeout elapsed, forcing shutdown");
            control_plane.escalate_force().await;
        });
    }
}
