//! Method tree builder (spec.md §4.1): construct the immutable procedure
//! namespace from a declarative list of source units.
//!
//! The original discovers procedures by reflecting over loaded modules at
//! runtime; spec.md §9's redesign flag replaces that with an explicit
//! builder instead, so a "source unit" here is any `SourceUnit` impl that
//! declares its own exports and named child units up front.

use std::collections::{BTreeMap, HashMap, HashSet};

use mtrpc_shared::ServerError;
use serde_json::{Map, Value};

use crate::procedure::Procedure;

/// One procedure a unit is prepared to export, before the configured
/// export list decides whether it actually gets mounted.
pub struct UnitExport {
    pub local_name: String,
    pub procedure: Procedure,
}

/// A declarative source unit (spec.md §4.1). Implementors are typically
/// small structs bundling a group of related handlers, analogous to one
/// Python module in the original.
pub trait SourceUnit: Send {
    fn doc(&self) -> Option<String> {
        None
    }

    fn tags(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// The full set of procedures this unit is prepared to export. The
    /// builder filters this against the unit's configured export list.
    fn exports(&self) -> Vec<UnitExport>;

    /// Named child units, for dotted-path exports (`"child.proc"`) and
    /// wildcard recursion (`"child.*"`).
    fn children(&self) -> Vec<(String, Box<dyn SourceUnit>)> {
        Vec::new()
    }

    /// When `Some`, a wildcard export intersects with this set rather than
    /// exporting every procedure `exports()` returns — the `__all__`
    /// intersection rule from spec.md §9's resolved Open Question.
    fn public_names(&self) -> Option<HashSet<String>> {
        None
    }

    /// Invoked once after this unit's namespace node is populated
    /// (spec.md §4.1).
    #[allow(unused_variables)]
    fn post_init(&self, full_name: &str, kwargs: &Map<String, Value>) -> Result<(), ServerError> {
        Ok(())
    }
}

/// One configured source: where a unit mounts, and which of its exports
/// (by local name, dotted path, or wildcard) are actually bound.
pub struct SourceSpec {
    pub mount: String,
    pub unit: Box<dyn SourceUnit>,
    pub exports: Vec<String>,
    pub post_init_kwargs: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct NamespaceNode {
    pub doc: Option<String>,
    pub tags: HashMap<String, String>,
    pub children: BTreeMap<String, Node>,
}

#[derive(Debug, Clone)]
pub enum Node {
    Namespace(NamespaceNode),
    Procedure(Procedure),
}

impl Node {
    pub fn as_namespace(&self) -> Option<&NamespaceNode> {
        match self {
            Node::Namespace(ns) => Some(ns),
            Node::Procedure(_) => None,
        }
    }

    pub fn as_procedure(&self) -> Option<&Procedure> {
        match self {
            Node::Procedure(p) => Some(p),
            Node::Namespace(_) => None,
        }
    }
}

/// The whole hierarchical namespace, frozen after `build` returns
/// (spec.md §4, §4.1's Method Tree glossary entry).
#[derive(Debug, Clone, Default)]
pub struct MethodTree {
    pub root: NamespaceNode,
}

impl MethodTree {
    /// Resolve a dotted full name to its node, O(depth) in dotted
    /// segments (spec.md §4's glossary permits either O(depth) walk or
    /// O(1) flat index; this tree walks).
    pub fn resolve(&self, full_name: &str) -> Option<&Node> {
        if full_name.is_empty() {
            return None;
        }
        let mut children = &self.root.children;
        let segments: Vec<&str> = full_name.split('.').collect();
        for (i, seg) in segments.iter().enumerate() {
            let node = children.get(*seg)?;
            if i == segments.len() - 1 {
                return Some(node);
            }
            children = &node.as_namespace()?.children;
        }
        None
    }

    /// All descendant `(full_name, node)` pairs under `name` (empty string
    /// means the whole tree), depth-first, used by `list`/`help`.
    pub fn descendants<'a>(&'a self, name: &str) -> Vec<(String, &'a Node)> {
        let start_children = if name.is_empty() {
            &self.root.children
        } else {
            match self.resolve(name).and_then(Node::as_namespace) {
                Some(ns) => &ns.children,
                None => return Vec::new(),
            }
        };
        let mut out = Vec::new();
        let prefix = if name.is_empty() { String::new() } else { format!("{name}.") };
        collect_descendants(start_children, &prefix, &mut out);
        out
    }
}

fn collect_descendants<'a>(children: &'a BTreeMap<String, Node>, prefix: &str, out: &mut Vec<(String, &'a Node)>) {
    for (local, node) in children {
        let full = format!("{prefix}{local}");
        out.push((full.clone(), node));
        if let Node::Namespace(ns) = node {
            collect_descendants(&ns.children, &format!("{full}."), out);
        }
    }
}

/// Build the frozen tree from a set of configured source specs
/// (spec.md §4.1's build algorithm).
pub fn build_tree(specs: Vec<SourceSpec>) -> Result<MethodTree, ServerError> {
    let mut root = NamespaceNode::default();
    for spec in specs {
        let mut ancestors = HashSet::new();
        mount_unit(&mut root, &spec.mount, spec.unit.as_ref(), &spec.exports, &spec.post_init_kwargs, &mut ancestors)?;
    }
    Ok(MethodTree { root })
}

fn mount_unit(
    root: &mut NamespaceNode,
    mount: &str,
    unit: &dyn SourceUnit,
    exports: &[String],
    post_init_kwargs: &Map<String, Value>,
    ancestors: &mut HashSet<String>,
) -> Result<(), ServerError> {
    if !ancestors.insert(mount.to_string()) {
        tracing::warn!(mount, "refusing to mount unit: cycle detected");
        return Ok(());
    }

    let node = materialize_path(root, mount);
    node.doc = unit.doc();
    node.tags = unit.tags();

    let available = unit.exports();
    let children = unit.children();
    let public = unit.public_names();

    for entry in exports {
        bind_export(node, &available, &children, entry, &public, post_init_kwargs, ancestors)?;
    }

    unit.post_init(mount, post_init_kwargs)?;
    ancestors.remove(mount);
    Ok(())
}

/// spec.md §3: "name characters are restricted to `[A-Za-z0-9_.]`"; §4.1
/// Errors: "Illegal characters in exported names → configuration failure."
/// `.` only ever appears as the dotted-path separator, so each segment
/// between dots (other than the wildcard token) is checked on its own.
fn validate_export_name(entry: &str) -> Result<(), ServerError> {
    for segment in entry.split('.') {
        if segment == "*" {
            continue;
        }
        if segment.is_empty() || !segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ServerError::TreeBuild(format!(
                "illegal characters in exported name {entry:?}: segment {segment:?} must match [A-Za-z0-9_]+"
            )));
        }
    }
    Ok(())
}

fn bind_export(
    node: &mut NamespaceNode,
    available: &[UnitExport],
    children: &[(String, Box<dyn SourceUnit>)],
    entry: &str,
    public: &Option<HashSet<String>>,
    post_init_kwargs: &Map<String, Value>,
    ancestors: &mut HashSet<String>,
) -> Result<(), ServerError> {
    validate_export_name(entry)?;

    if let Some((head, rest)) = entry.split_once('.') {
        let Some((_, child_unit)) = children.iter().find(|(name, _)| name == head) else {
            tracing::warn!(export = entry, "export references unknown child unit, skipping");
            return Ok(());
        };
        let child_available = child_unit.exports();
        let child_children = child_unit.children();
        let child_public = child_unit.public_names();
        let child_node = node
            .children
            .entry(head.to_string())
            .or_insert_with(|| Node::Namespace(NamespaceNode::default()));
        let Node::Namespace(child_ns) = child_node else {
            return Err(ServerError::TreeBuild(format!(
                "export {entry:?} targets {head:?}, which is already bound as a procedure"
            )));
        };
        child_ns.doc = child_unit.doc();
        child_ns.tags = child_unit.tags();
        let child_full = head.to_string();
        if !ancestors.insert(child_full.clone()) {
            tracing::warn!(export = entry, "refusing to descend: cycle detected");
            return Ok(());
        }
        bind_export(child_ns, &child_available, &child_children, rest, &child_public, post_init_kwargs, ancestors)?;
        ancestors.remove(&child_full);
        return Ok(());
    }

    if entry == "*" {
        for export in available {
            if public.as_ref().is_some_and(|names| !names.contains(&export.local_name)) {
                continue;
            }
            insert_procedure(node, export);
        }
        return Ok(());
    }

    match available.iter().find(|e| e.local_name == entry) {
        Some(export) => insert_procedure(node, export),
        None => tracing::warn!(export = entry, "export names a missing callable, skipping"),
    }
    Ok(())
}

fn insert_procedure(node: &mut NamespaceNode, export: &UnitExport) {
    node.children
        .insert(export.local_name.clone(), Node::Procedure(export.procedure.clone()));
}

fn materialize_path<'a>(root: &'a mut NamespaceNode, mount: &str) -> &'a mut NamespaceNode {
    if mount.is_empty() {
        return root;
    }
    let mut current = root;
    for segment in mount.split('.') {
        let entry = current
            .children
            .entry(segment.to_string())
            .or_insert_with(|| Node::Namespace(NamespaceNode::default()));
        current = match entry {
            Node::Namespace(ns) => ns,
            Node::Procedure(_) => unreachable!("mount path collides with a procedure"),
        };
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedure::{AcceptedAccessParams, Signature};
    use std::sync::Arc;

    fn test_procedure(name: &str) -> Procedure {
        Procedure::new(
            name,
            Signature::default(),
            "test doc",
            HashMap::new(),
            true,
            AcceptedAccessParams::default(),
            Arc::new(|_args| Box::pin(async { Ok(Value::Null) })),
        )
    }

    struct FlatUnit;
    impl SourceUnit for FlatUnit {
        fn exports(&self) -> Vec<UnitExport> {
            vec![
                UnitExport {
                    local_name: "ping".into(),
                    procedure: test_procedure("ping"),
                },
                UnitExport {
                    local_name: "whoami".into(),
                    procedure: test_procedure("whoami"),
                },
            ]
        }
    }

    #[test]
    fn single_name_export_mounts_one_procedure() {
        let spec = SourceSpec {
            mount: "system".into(),
            unit: Box::new(FlatUnit),
            exports: vec!["ping".into()],
            post_init_kwargs: Map::new(),
        };
        let tree = build_tree(vec![spec]).unwrap();
        assert!(tree.resolve("system.ping").unwrap().as_procedure().is_some());
        assert!(tree.resolve("system.whoami").is_none());
    }

    #[test]
    fn wildcard_export_mounts_everything() {
        let spec = SourceSpec {
            mount: "system".into(),
            unit: Box::new(FlatUnit),
            exports: vec!["*".into()],
            post_init_kwargs: Map::new(),
        };
        let tree = build_tree(vec![spec]).unwrap();
        assert!(tree.resolve("system.ping").is_some());
        assert!(tree.resolve("system.whoami").is_some());
    }

    struct RestrictedUnit;
    impl SourceUnit for RestrictedUnit {
        fn exports(&self) -> Vec<UnitExport> {
            vec![
                UnitExport {
                    local_name: "a".into(),
                    procedure: test_procedure("a"),
                },
                UnitExport {
                    local_name: "b".into(),
                    procedure: test_procedure("b"),
                },
            ]
        }

        fn public_names(&self) -> Option<HashSet<String>> {
            Some(HashSet::from(["a".to_string()]))
        }
    }

    #[test]
    fn wildcard_intersects_with_declared_public_names() {
        let spec = SourceSpec {
            mount: "".into(),
            unit: Box::new(RestrictedUnit),
            exports: vec!["*".into()],
            post_init_kwargs: Map::new(),
        };
        let tree = build_tree(vec![spec]).unwrap();
        assert!(tree.resolve("a").is_some());
        assert!(tree.resolve("b").is_none());
    }

    struct ParentUnit;
    impl SourceUnit for ParentUnit {
        fn exports(&self) -> Vec<UnitExport> {
            Vec::new()
        }

        fn children(&self) -> Vec<(String, Box<dyn SourceUnit>)> {
            vec![("sub".to_string(), Box::new(FlatUnit))]
        }
    }

    #[test]
    fn dotted_path_export_recurses_into_a_child_unit() {
        let spec = SourceSpec {
            mount: "parent".into(),
            unit: Box::new(ParentUnit),
            exports: vec!["sub.ping".into()],
            post_init_kwargs: Map::new(),
        };
        let tree = build_tree(vec![spec]).unwrap();
        assert!(tree.resolve("parent.sub.ping").is_some());
        assert!(tree.resolve("parent.sub.whoami").is_none());
    }

    #[test]
    fn descendants_lists_full_dotted_names() {
        let spec = SourceSpec {
            mount: "system".into(),
            unit: Box::new(FlatUnit),
            exports: vec!["*".into()],
            post_init_kwargs: Map::new(),
        };
        let tree = build_tree(vec![spec]).unwrap();
        let names: Vec<String> = tree.descendants("").into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"system".to_string()));
        assert!(names.contains(&"system.ping".to_string()));
        assert!(names.contains(&"system.whoami".to_string()));
    }

    struct ShadowingParentUnit;
    impl SourceUnit for ShadowingParentUnit {
        fn exports(&self) -> Vec<UnitExport> {
            vec![UnitExport {
                local_name: "sub".into(),
                procedure: test_procedure("sub"),
            }]
        }

        fn children(&self) -> Vec<(String, Box<dyn SourceUnit>)> {
            vec![("sub".to_string(), Box::new(FlatUnit))]
        }
    }

    #[test]
    fn dotted_path_through_a_name_already_bound_as_a_procedure_is_a_configuration_error() {
        let spec = SourceSpec {
            mount: "parent".into(),
            unit: Box::new(ShadowingParentUnit),
            // "sub" binds the procedure first; "sub.ping" then tries to use
            // the same name as a namespace intermediate.
            exports: vec!["sub".into(), "sub.ping".into()],
            post_init_kwargs: Map::new(),
        };
        let err = build_tree(vec![spec]).unwrap_err();
        assert!(matches!(err, ServerError::TreeBuild(_)));
    }

    #[test]
    fn building_the_same_source_set_twice_yields_equal_shaped_trees() {
        let make_spec = || SourceSpec {
            mount: "system".into(),
            unit: Box::new(FlatUnit) as Box<dyn SourceUnit>,
            exports: vec!["*".into()],
            post_init_kwargs: Map::new(),
        };
        let first = build_tree(vec![make_spec()]).unwrap();
        let second = build_tree(vec![make_spec()]).unwrap();
        let first_names: Vec<String> = first.descendants("").into_iter().map(|(n, _)| n).collect();
        let second_names: Vec<String> = second.descendants("").into_iter().map(|(n, _)| n).collect();
        assert_eq!(first_names, second_names);
    }

    #[test]
    fn illegal_characters_in_an_exported_name_are_a_configuration_error() {
        let spec = SourceSpec {
            mount: "system".into(),
            unit: Box::new(FlatUnit),
            exports: vec!["bad-name".into()],
            post_init_kwargs: Map::new(),
        };
        let err = build_tree(vec![spec]).unwrap_err();
        assert!(matches!(err, ServerError::TreeBuild(_)));
    }

    #[test]
    fn illegal_characters_in_a_dotted_path_segment_are_a_configuration_error() {
        let spec = SourceSpec {
            mount: "parent".into(),
            unit: Box::new(ParentUnit),
            exports: vec!["sub.bad name".into()],
            post_init_kwargs: Map::new(),
        };
        let err = build_tree(vec![spec]).unwrap_err();
        assert!(matches!(err, ServerError::TreeBuild(_)));
    }

    #[test]
    fn missing_export_name_is_skipped_with_a_warning_not_an_error() {
        let spec = SourceSpec {
            mount: "system".into(),
            unit: Box::new(FlatUnit),
            exports: vec!["does_not_exist".into()],
            post_init_kwargs: Map::new(),
        };
        let tree = build_tree(vec![spec]).unwrap();
        assert!(tree.resolve("system.does_not_exist").is_none());
    }
}
