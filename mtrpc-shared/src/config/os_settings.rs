//! `os_settings` — signal-to-action wiring and the stop timeout (spec.md §6).
//!
//! Daemonization (PID files, umask, fork) is an external collaborator per
//! spec.md §1 and is not modeled here; only the signal map and timeout that
//! `mtrpc-server`'s lifecycle wiring consumes directly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    /// Stop the server and let the process exit.
    Exit,
    /// Stop the server, then reconfigure and restart it in place.
    Restart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OsSettingsConfig {
    /// Signal name (`"TERM"`, `"HUP"`, ...) to the action it triggers.
    pub signals: HashMap<String, SignalAction>,
    /// How long a stop request waits for cooperative shutdown before the
    /// caller should consider it hung.
    pub stop_timeout_ms: u64,
}

impl Default for OsSettingsConfig {
    fn default() -> Self {
        let mut signals = HashMap::new();
        signals.insert("TERM".to_string(), SignalAction::Exit);
        signals.insert("HUP".to_string(), SignalAction::Restart);
        Self {
            signals,
            stop_timeout_ms: 30_000,
        }
    }
}
