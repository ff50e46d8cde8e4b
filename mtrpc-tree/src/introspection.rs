//! Core-provided `system.*` procedures (spec.md §4.7, plus the two added by
//! SPEC_FULL in the same vein as `mtrpc/server/sysmethods.py`).

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use mtrpc_proto::ProcedureError;
use serde_json::{json, Map, Value};

use crate::access::{AccessContext, AccessPolicy};
use crate::procedure::{AcceptedAccessParams, CallArgs, ParamSpec, Procedure, Signature};
use crate::tree::{build_tree, MethodTree, Node, SourceSpec, SourceUnit, UnitExport};

/// Handle to the tree a `CoreUnit`'s `list`/`help` procedures walk. Set once
/// after `build_tree` returns, since the unit must be part of the tree it
/// introspects.
pub type TreeHandle = Arc<OnceLock<MethodTree>>;

fn node_fields(full_name: &str, node: &Node) -> Vec<(&'static str, String)> {
    let local_name = full_name.rsplit('.').next().unwrap_or(full_name).to_string();
    let parentmod_name = full_name
        .rsplit_once('.')
        .map(|(parent, _)| parent.to_string())
        .unwrap_or_default();
    let split_name = full_name.replace('.', " ");
    let (doc, help, tags, kind) = match node {
        Node::Procedure(p) => (
            p.doc.clone(),
            format!("{full_name}{}\n    {}", p.signature.format(), p.doc),
            format_tags(&p.tags),
            "procedure".to_string(),
        ),
        Node::Namespace(ns) => (
            ns.doc.clone().unwrap_or_default(),
            format!("{full_name}\n    {}", ns.doc.clone().unwrap_or_default()),
            format_tags(&ns.tags),
            "namespace".to_string(),
        ),
    };
    vec![
        ("full_name", full_name.to_string()),
        ("local_name", local_name),
        ("parentmod_name", parentmod_name),
        ("split_name", split_name),
        ("doc", doc),
        ("help", help),
        ("tags", tags),
        ("type", kind),
    ]
}

fn format_tags(tags: &HashMap<String, String>) -> String {
    let mut entries: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
    entries.sort();
    entries.join(",")
}

/// Render and evaluate the access-key/keyhole pair against one candidate
/// node. Returns `Err(BadAccessPattern)` when a template references a field
/// the context does not provide — spec.md §4.3 is explicit that this is "a
/// configuration-level error, not a denial", so callers that must not mask
/// it (the primary resolve path) propagate it; `list`/`help`, which only
/// ever filter a result set, fold it into "not shown" via `unwrap_or(false)`.
fn admits(
    ctx: &AccessContext,
    key_pattern: &str,
    keyhole_pattern: &str,
    full_name: &str,
    node: &Node,
) -> Result<bool, mtrpc_shared::ServerError> {
    let extended = ctx.with_fields(node_fields(full_name, node));
    AccessPolicy::new(key_pattern, keyhole_pattern).admits(&extended)
}

/// Resolve `full_name` to a procedure, applying the same access-key/keyhole
/// check `list`/`help` apply to every candidate node. A denied or missing
/// name is indistinguishable to the caller (spec.md §4.3: hides whether the
/// name exists at all, mirroring `RPCTree.try_to_obtain`'s single
/// `RPCNotFoundError` for both cases). An unresolved placeholder in the
/// binding's own pattern is a distinct, non-maskable fault: it propagates as
/// `Err` so the caller can report `InternalServerError` instead of `NotFound`
/// (spec.md §4.6 step 4, §7).
pub fn resolve_procedure_with_access<'a>(
    tree: &'a MethodTree,
    full_name: &str,
    ctx: &AccessContext,
    key_pattern: &str,
    keyhole_pattern: &str,
) -> Result<Option<&'a crate::procedure::Procedure>, mtrpc_shared::ServerError> {
    let Some(node) = tree.resolve(full_name) else {
        return Ok(None);
    };
    let Some(procedure) = node.as_procedure() else {
        return Ok(None);
    };
    if !admits(ctx, key_pattern, keyhole_pattern, full_name, node)? {
        return Ok(None);
    }
    Ok(Some(procedure))
}

fn list_impl(tree: &MethodTree, args: &CallArgs, name: &str, deep: bool) -> Vec<String> {
    let mut out = Vec::new();
    for (full_name, node) in tree.descendants(name) {
        let admitted = admits(&args.access_context, &args.access_key_pattern, &args.access_keyhole_pattern, &full_name, node);
        if !admitted.unwrap_or(false) {
            continue;
        }
        if !deep {
            let depth_under_name = if name.is_empty() {
                full_name.matches('.').count()
            } else {
                full_name[name.len() + 1..].matches('.').count()
            };
            if depth_under_name > 0 {
                continue;
            }
        }
        let entry = match node {
            Node::Procedure(p) => format!("{full_name}{}", p.signature.format()),
            Node::Namespace(_) => full_name.clone(),
        };
        out.push(entry);
    }
    out.sort();
    out
}

fn help_impl(tree: &MethodTree, args: &CallArgs, name: &str, deep: bool) -> Vec<String> {
    let mut out = Vec::new();
    for (full_name, node) in tree.descendants(name) {
        let admitted = admits(&args.access_context, &args.access_key_pattern, &args.access_keyhole_pattern, &full_name, node);
        if !admitted.unwrap_or(false) {
            continue;
        }
        if !deep {
            let depth_under_name = if name.is_empty() {
                full_name.matches('.').count()
            } else {
                full_name[name.len() + 1..].matches('.').count()
            };
            if depth_under_name > 0 {
                continue;
            }
        }
        let fields = node_fields(&full_name, node);
        let help_text = fields
            .into_iter()
            .find(|(k, _)| *k == "help")
            .map(|(_, v)| v)
            .unwrap_or_default();
        out.push(help_text);
    }
    out
}

fn parse_list_help_args(args: &CallArgs) -> (String, bool, bool) {
    let name = args
        .positional
        .first()
        .or_else(|| args.kwargs.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let deep = args
        .positional
        .get(1)
        .or_else(|| args.kwargs.get("deep"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let as_string = args
        .positional
        .get(2)
        .or_else(|| args.kwargs.get("as_string"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    (name, deep, as_string)
}

/// The core `system` unit: `list`, `help`, `ping`, `whoami`. Construct with
/// `CoreUnit::new()`, mount it (typically at `"system"`), and call
/// `finish(tree)` once the whole tree has been built so `list`/`help` have
/// something to walk.
pub struct CoreUnit {
    tree_handle: TreeHandle,
}

impl CoreUnit {
    pub fn new() -> Self {
        Self {
            tree_handle: Arc::new(OnceLock::new()),
        }
    }

    pub fn tree_handle(&self) -> TreeHandle {
        Arc::clone(&self.tree_handle)
    }
}

impl Default for CoreUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceUnit for CoreUnit {
    fn doc(&self) -> Option<String> {
        Some("Core introspection and liveness procedures.".to_string())
    }

    fn exports(&self) -> Vec<UnitExport> {
        let list_tree = self.tree_handle();
        let help_tree = self.tree_handle();

        vec![
            UnitExport {
                local_name: "list".into(),
                procedure: Procedure::new(
                    "list",
                    Signature::new(vec![
                        ParamSpec::Optional { name: "name".into(), default: json!("") },
                        ParamSpec::Optional { name: "deep".into(), default: json!(false) },
                        ParamSpec::Optional { name: "as_string".into(), default: json!(false) },
                    ]),
                    "List accessible descendant names under `name`.",
                    HashMap::new(),
                    true,
                    AcceptedAccessParams::default(),
                    Arc::new(move |args: CallArgs| {
                        let tree_handle = Arc::clone(&list_tree);
                        Box::pin(async move {
                            let Some(tree) = tree_handle.get() else {
                                return Err(ProcedureError::InternalServerError(
                                    "system.list called before the method tree finished building".into(),
                                ));
                            };
                            let (name, deep, as_string) = parse_list_help_args(&args);
                            let names = list_impl(tree, &args, &name, deep);
                            if as_string {
                                Ok(Value::String(names.join("\n")))
                            } else {
                                Ok(Value::Array(names.into_iter().map(Value::String).collect()))
                            }
                        })
                    }),
                ),
            },
            UnitExport {
                local_name: "help".into(),
                procedure: Procedure::new(
                    "help",
                    Signature::new(vec![
                        ParamSpec::Optional { name: "name".into(), default: json!("") },
                        ParamSpec::Optional { name: "deep".into(), default: json!(false) },
                        ParamSpec::Optional { name: "as_string".into(), default: json!(false) },
                    ]),
                    "Show accessible help text for `name`.",
                    HashMap::new(),
                    true,
                    AcceptedAccessParams::default(),
                    Arc::new(move |args: CallArgs| {
                        let tree_handle = Arc::clone(&help_tree);
                        Box::pin(async move {
                            let Some(tree) = tree_handle.get() else {
                                return Err(ProcedureError::InternalServerError(
                                    "system.help called before the method tree finished building".into(),
                                ));
                            };
                            let (name, deep, as_string) = parse_list_help_args(&args);
                            let texts = help_impl(tree, &args, &name, deep);
                            if as_string {
                                Ok(Value::String(texts.join("\n\n")))
                            } else {
                                Ok(Value::Array(texts.into_iter().map(Value::String).collect()))
                            }
                        })
                    }),
                ),
            },
            UnitExport {
                local_name: "ping".into(),
                procedure: Procedure::new(
                    "ping",
                    Signature::default(),
                    "Liveness check.",
                    HashMap::new(),
                    true,
                    AcceptedAccessParams::default(),
                    Arc::new(|_args: CallArgs| Box::pin(async { Ok(json!("pong")) })),
                ),
            },
            UnitExport {
                local_name: "whoami".into(),
                procedure: Procedure::new(
                    "whoami",
                    Signature::default(),
                    "Echo the caller's resolved access context.",
                    HashMap::new(),
                    true,
                    AcceptedAccessParams::default(),
                    Arc::new(|args: CallArgs| {
                        Box::pin(async move {
                            let mut object = Map::new();
                            let mut fields: Vec<_> = args.access_context.0.iter().collect();
                            fields.sort_by(|a, b| a.0.cmp(b.0));
                            for (k, v) in fields {
                                object.insert(k.clone(), Value::String(v.clone()));
                            }
                            Ok(Value::Object(object))
                        })
                    }),
                ),
            },
        ]
    }
}

/// Build a tree from `specs`, where one of them was built from a
/// `CoreUnit`; wires `tree_handle` to the finished result so `list`/`help`
/// can walk it on their first call.
pub fn build_tree_with_core(
    specs: Vec<SourceSpec>,
    tree_handle: &TreeHandle,
) -> Result<MethodTree, mtrpc_shared::ServerError> {
    let tree = build_tree(specs)?;
    let _ = tree_handle.set(tree.clone());
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::SourceSpec;

    fn build() -> (MethodTree, TreeHandle) {
        let core = CoreUnit::new();
        let handle = core.tree_handle();
        let spec = SourceSpec {
            mount: "system".into(),
            unit: Box::new(core),
            exports: vec!["*".into()],
            post_init_kwargs: Map::new(),
        };
        let tree = build_tree_with_core(vec![spec], &handle).unwrap();
        (tree, handle)
    }

    fn open_args(name: &str, deep: bool) -> CallArgs {
        CallArgs {
            positional: vec![json!(name), json!(deep)],
            kwargs: Map::new(),
            access_context: AccessContext::new(),
            access_key_pattern: "{full_name}".into(),
            access_keyhole_pattern: ".".into(),
        }
    }

    #[test]
    fn list_includes_core_procedures_when_unrestricted() {
        let (tree, _handle) = build();
        let args = open_args("system", true);
        let names = list_impl(&tree, &args, "system", true);
        assert!(names.iter().any(|n| n.starts_with("system.ping")));
        assert!(names.iter().any(|n| n.starts_with("system.whoami")));
    }

    #[test]
    fn list_non_deep_omits_deeper_descendants() {
        let (tree, _handle) = build();
        let args = open_args("", false);
        let names = list_impl(&tree, &args, "", false);
        assert_eq!(names, vec!["system".to_string()]);
    }

    #[test]
    fn restrictive_keyhole_hides_everything() {
        let (tree, _handle) = build();
        let mut args = open_args("system", true);
        args.access_keyhole_pattern = "^nothing_matches_this$".into();
        let names = list_impl(&tree, &args, "system", true);
        assert!(names.is_empty());
    }

    #[tokio::test]
    async fn whoami_echoes_the_caller_access_context() {
        let (tree, _handle) = build();
        let mut ctx = AccessContext::new();
        ctx.insert("queue", "q1");
        let proc = tree.resolve("system.whoami").unwrap().as_procedure().unwrap();
        let result = proc
            .invoke(vec![], Map::new(), ctx, "{full_name}".into(), ".".into())
            .await
            .unwrap();
        assert_eq!(result["queue"], json!("q1"));
    }

    #[test]
    fn resolve_with_access_hides_denied_names_as_missing() {
        let (tree, _handle) = build();
        let ctx = AccessContext::new();
        let found = resolve_procedure_with_access(&tree, "system.ping", &ctx, "{full_name}", ".").unwrap();
        assert!(found.is_some());
        let denied = resolve_procedure_with_access(&tree, "system.ping", &ctx, "{full_name}", "^nothing_matches$").unwrap();
        assert!(denied.is_none());
        let missing = resolve_procedure_with_access(&tree, "system.nope", &ctx, "{full_name}", ".").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn resolve_with_access_surfaces_an_unresolved_placeholder_as_an_error() {
        let (tree, _handle) = build();
        let ctx = AccessContext::new();
        let err = resolve_procedure_with_access(&tree, "system.ping", &ctx, "{no_such_field}", ".").unwrap_err();
        assert!(matches!(err, mtrpc_shared::ServerError::BadAccessPattern(_)));
    }

    #[tokio::test]
    async fn ping_returns_pong() {
        let (tree, _handle) = build();
        let proc = tree.resolve("system.ping").unwrap().as_procedure().unwrap();
        let result = proc
            .invoke(vec![], Map::new(), AccessContext::new(), String::new(), String::new())
            .await
            .unwrap();
        assert_eq!(result, json!("pong"));
    }
}
