//! Immutable method tree, procedure wrapper and access-key policy (spec.md
//! §4.1-§4.3).

pub mod access;
pub mod introspection;
pub mod procedure;
pub mod tree;

pub use access::{AccessContext, AccessPolicy};
pub use introspection::{build_tree_with_core, resolve_procedure_with_access, CoreUnit, TreeHandle};
pub use procedure::{
    AcceptedAccessParams, CallArgs, HandlerFn, HandlerFuture, HandlerResult, ParamSpec, Procedure, Signature,
};
pub use tree::{build_tree, MethodTree, NamespaceNode, Node, SourceSpec, SourceUnit, UnitExport};
