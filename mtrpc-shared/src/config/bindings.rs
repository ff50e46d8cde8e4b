//! `exchange_types` and `bindings` sections (spec.md §3 Binding, §6).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One `[exchange, routing_key, access_key_pattern, access_keyhole_pattern]`
/// binding (spec.md §3, §6). Bindings are configuration-time constants: one
/// binding associates one broker queue with one admission policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BindingConfig {
    pub exchange: String,
    pub routing_key: String,
    pub access_key_pattern: String,
    pub access_keyhole_pattern: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Topic,
    Direct,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_lapin_kind(self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }
}

/// `exchange_types` — exchange name to declared type, default `topic`
/// (spec.md §4.4) for any exchange not listed here.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ExchangeTypesConfig(pub HashMap<String, ExchangeKind>);
