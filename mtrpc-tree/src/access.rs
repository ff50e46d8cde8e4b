//! Access context and access-key/keyhole admission policy (spec.md §3, §4.3).

use std::collections::HashMap;

use mtrpc_shared::ServerError;
use regex::Regex;

/// Rendered `{field}` substitution source for one candidate access. Built
/// per-request from binding/delivery metadata (by `mtrpc-server`) and
/// extended per-candidate with the resolved node's fields before policy
/// evaluation (§3's `full_name`, `local_name`, `parentmod_name`,
/// `split_name`, `doc`, `tags`, `help`, `type`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessContext(pub HashMap<String, String>);

impl AccessContext {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    /// A derived context carrying this context's fields plus the given
    /// node-relative ones, without mutating the original (the same base
    /// context is reused across many candidate nodes during `list`/`help`).
    pub fn with_fields<I, K, V>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut merged = self.0.clone();
        for (k, v) in extra {
            merged.insert(k.into(), v.into());
        }
        Self(merged)
    }
}

/// A binding's `{access_key_pattern, access_keyhole_pattern}` pair
/// (spec.md §3, §6).
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    pub key_pattern: String,
    pub keyhole_pattern: String,
}

impl AccessPolicy {
    pub fn new(key_pattern: impl Into<String>, keyhole_pattern: impl Into<String>) -> Self {
        Self {
            key_pattern: key_pattern.into(),
            keyhole_pattern: keyhole_pattern.into(),
        }
    }

    /// Render both templates against `ctx`, treat the rendered keyhole as a
    /// regex, and search it within the rendered key. Unresolved `{field}`
    /// placeholders are a configuration error, never a silent denial.
    pub fn admits(&self, ctx: &AccessContext) -> Result<bool, ServerError> {
        let key = render_template(&self.key_pattern, ctx)?;
        let keyhole = render_template(&self.keyhole_pattern, ctx)?;
        let re = Regex::new(&keyhole)
            .map_err(|e| ServerError::BadAccessPattern(format!("invalid keyhole regex {keyhole:?}: {e}")))?;
        Ok(re.is_match(&key))
    }
}

/// Substitute every `{field}` placeholder in `template` with its value from
/// `ctx`. An unresolved placeholder is `BadAccessPattern`, per spec.md §4.3.
fn render_template(template: &str, ctx: &AccessContext) -> Result<String, ServerError> {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i + 1..].find('}') {
                let field = &template[i + 1..i + 1 + end];
                match ctx.get(field) {
                    Some(value) => out.push_str(value),
                    None => {
                        return Err(ServerError::BadAccessPattern(format!(
                            "unresolved placeholder {{{field}}} in pattern {template:?}"
                        )))
                    }
                }
                i = i + 1 + end + 1;
                continue;
            }
        }
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    Ok(out)
}
