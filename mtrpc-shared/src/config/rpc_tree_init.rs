//! `rpc_tree_init` — the declarative source list the method tree is built
//! from (spec.md §4.1, §6).
//!
//! Each entry names where a statically-registered source unit (built in Rust
//! code via `mtrpc_tree::SourceUnit`, per the "reflective wrapping → explicit
//! registration" redesign in spec.md §9) mounts in the tree, which of its
//! exported names to bind, its documentation/tags, and the kwargs handed to
//! its post-init hook.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourceUnitConfig {
    /// The dotted name this unit mounts under; empty string mounts at the
    /// root.
    #[serde(default)]
    pub mount: String,
    /// Exported name entries: a local name, a dotted path naming a deeper
    /// descendant, or the wildcard token `*` (also permitted as the
    /// terminal segment of a dotted path, e.g. `sub.sub.*`).
    #[serde(default)]
    pub exports: Vec<String>,
    #[serde(default)]
    pub doc: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, serde_json::Value>,
    /// Kwargs passed to this unit's post-init hook, if it declares one.
    #[serde(default)]
    pub post_init_kwargs: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RpcTreeInitConfig {
    pub sources: Vec<SourceUnitConfig>,
}
