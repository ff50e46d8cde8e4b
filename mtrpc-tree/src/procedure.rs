//! Procedure wrapper (spec.md §4.2): a uniform call/introspect surface
//! around one handler closure.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use mtrpc_proto::ProcedureError;
use serde_json::{Map, Value};

use crate::access::AccessContext;

pub type HandlerResult = Result<Value, ProcedureError>;
pub type HandlerFuture = BoxFuture<'static, HandlerResult>;
pub type HandlerFn = Arc<dyn Fn(CallArgs) -> HandlerFuture + Send + Sync>;
pub type AuthorizeFn = Arc<dyn Fn(&AccessContext) -> Result<(), ProcedureError> + Send + Sync>;

/// What a resolved procedure is invoked with. The access-related fields the
/// reserved `_access_dict` / `_access_key_patt` / `_access_keyhole_patt`
/// parameters would carry in the original are always available here;
/// `accepted_access_params` on `Procedure` governs only whether they are
/// described in the exposed signature, since a Rust closure has no
/// positional-order hazard to guard against (see DESIGN.md).
#[derive(Debug, Clone)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub access_context: AccessContext,
    pub access_key_pattern: String,
    pub access_keyhole_pattern: String,
}

/// One parameter of a procedure's public signature.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamSpec {
    Positional(String),
    Optional { name: String, default: Value },
    VarArgs(String),
    VarKwargs(String),
}

#[derive(Debug, Clone, Default)]
pub struct Signature {
    pub params: Vec<ParamSpec>,
}

impl Signature {
    pub fn new(params: Vec<ParamSpec>) -> Self {
        Self { params }
    }

    /// Render as `(a, b, c=1, *args, **kwargs)`, matching the formatted
    /// signature the original exposes via `list`/`help`.
    pub fn format(&self) -> String {
        let mut parts = Vec::with_capacity(self.params.len());
        for p in &self.params {
            match p {
                ParamSpec::Positional(name) => parts.push(name.clone()),
                ParamSpec::Optional { name, default } => parts.push(format!("{name}={default}")),
                ParamSpec::VarArgs(name) => parts.push(format!("*{name}")),
                ParamSpec::VarKwargs(name) => parts.push(format!("**{name}")),
            }
        }
        format!("({})", parts.join(", "))
    }

    fn required_positional_count(&self) -> usize {
        self.params
            .iter()
            .filter(|p| matches!(p, ParamSpec::Positional(_)))
            .count()
    }

    fn has_varargs(&self) -> bool {
        self.params.iter().any(|p| matches!(p, ParamSpec::VarArgs(_)))
    }

    fn has_varkwargs(&self) -> bool {
        self.params.iter().any(|p| matches!(p, ParamSpec::VarKwargs(_)))
    }

    fn known_keyword_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().filter_map(|p| match p {
            ParamSpec::Positional(n) | ParamSpec::Optional { name: n, .. } => Some(n.as_str()),
            _ => None,
        })
    }

    /// The argument-only validation the original performs with its
    /// "test callable" (spec.md §4.2): arity and keyword-name checks,
    /// without invoking the real handler.
    pub fn validate_call(&self, positional: &[Value], kwargs: &Map<String, Value>) -> Result<(), ProcedureError> {
        let required = self.required_positional_count();
        let max_positional = self.params.len();
        if positional.len() < required && !self.has_varargs() {
            return Err(ProcedureError::BadArguments(format!(
                "{{name}}{} takes at least {required} positional argument(s), {} given",
                self.format(),
                positional.len()
            )));
        }
        if positional.len() > max_positional && !self.has_varargs() {
            return Err(ProcedureError::BadArguments(format!(
                "{{name}}{} takes at most {max_positional} positional argument(s), {} given",
                self.format(),
                positional.len()
            )));
        }
        if !self.has_varkwargs() {
            let known: Vec<&str> = self.known_keyword_names().collect();
            for key in kwargs.keys() {
                if !known.contains(&key.as_str()) {
                    return Err(ProcedureError::BadArguments(format!(
                        "{{name}}{} got an unexpected keyword argument '{key}'",
                        self.format()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Which reserved access-related parameters a handler wants passed through
/// (spec.md §4.2's `_access_dict` / `_access_key_patt` / `_access_keyhole_patt`).
/// These never appear in `Signature` — the exposed signature excludes them
/// unconditionally, per spec.md §4 invariant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptedAccessParams {
    pub access_dict: bool,
    pub access_key_pattern: bool,
    pub access_keyhole_pattern: bool,
}

/// A wrapped callable (spec.md §4.2).
#[derive(Clone)]
pub struct Procedure {
    pub full_name: String,
    pub signature: Signature,
    pub doc: String,
    pub tags: HashMap<String, String>,
    pub read_only: bool,
    pub accepted_access_params: AcceptedAccessParams,
    pub authorize: Option<AuthorizeFn>,
    handler: HandlerFn,
}

impl std::fmt::Debug for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Procedure")
            .field("full_name", &self.full_name)
            .field("signature", &self.signature.format())
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl Procedure {
    pub fn new(
        full_name: impl Into<String>,
        signature: Signature,
        doc: impl Into<String>,
        tags: HashMap<String, String>,
        read_only: bool,
        accepted_access_params: AcceptedAccessParams,
        handler: HandlerFn,
    ) -> Self {
        let full_name = full_name.into();
        let doc = doc.into();
        warn_on_mutable_defaults(&full_name, &signature, &tags);
        Self {
            full_name,
            signature,
            doc,
            tags,
            read_only,
            accepted_access_params,
            authorize: None,
            handler,
        }
    }

    pub fn with_authorize(mut self, authorize: AuthorizeFn) -> Self {
        self.authorize = Some(authorize);
        self
    }

    /// Invocation contract (spec.md §4.2): authorize, validate, then call.
    pub async fn invoke(
        &self,
        positional: Vec<Value>,
        kwargs: Map<String, Value>,
        access_context: AccessContext,
        access_key_pattern: String,
        access_keyhole_pattern: String,
    ) -> HandlerResult {
        if let Some(authorize) = &self.authorize {
            authorize(&access_context)?;
        }
        self.signature
            .validate_call(&positional, &kwargs)
            .map_err(|e| rename_signature_error(e, &self.full_name))?;
        let args = CallArgs {
            positional,
            kwargs,
            access_context,
            access_key_pattern,
            access_keyhole_pattern,
        };
        (self.handler)(args).await
    }
}

fn rename_signature_error(err: ProcedureError, full_name: &str) -> ProcedureError {
    match err {
        ProcedureError::BadArguments(msg) => {
            ProcedureError::BadArguments(msg.replacen("{name}", full_name, 1))
        }
        other => other,
    }
}

fn warn_on_mutable_defaults(full_name: &str, signature: &Signature, tags: &HashMap<String, String>) {
    if tags.get("suppress_mutable_arg_warning").map(String::as_str) == Some("true") {
        return;
    }
    for param in &signature.params {
        if let ParamSpec::Optional { name, default } = param {
            if matches!(default, Value::Array(_) | Value::Object(_)) {
                tracing::warn!(
                    procedure = full_name,
                    parameter = name.as_str(),
                    "default value is a mutable container; shared across calls"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> HandlerFn {
        Arc::new(|_args: CallArgs| Box::pin(async { Ok(Value::Null) }))
    }

    #[test]
    fn formats_mixed_signature() {
        let sig = Signature::new(vec![
            ParamSpec::Positional("a".into()),
            ParamSpec::Optional {
                name: "b".into(),
                default: Value::from(1),
            },
            ParamSpec::VarArgs("args".into()),
            ParamSpec::VarKwargs("kwargs".into()),
        ]);
        assert_eq!(sig.format(), "(a, b=1, *args, **kwargs)");
    }

    #[test]
    fn rejects_too_few_positional_arguments() {
        let sig = Signature::new(vec![ParamSpec::Positional("a".into())]);
        let err = sig.validate_call(&[], &Map::new()).unwrap_err();
        assert!(matches!(err, ProcedureError::BadArguments(_)));
    }

    #[test]
    fn rejects_unknown_keyword_without_varkwargs() {
        let sig = Signature::new(vec![ParamSpec::Positional("a".into())]);
        let mut kwargs = Map::new();
        kwargs.insert("surprise".into(), Value::from(1));
        let err = sig.validate_call(&[Value::from(1)], &kwargs).unwrap_err();
        assert!(matches!(err, ProcedureError::BadArguments(_)));
    }

    #[test]
    fn accepts_varargs_overflow() {
        let sig = Signature::new(vec![ParamSpec::VarArgs("args".into())]);
        assert!(sig
            .validate_call(&[Value::from(1), Value::from(2), Value::from(3)], &Map::new())
            .is_ok());
    }

    #[tokio::test]
    async fn a_procedure_with_only_access_related_parameters_accepts_empty_params_and_kwparams() {
        // Access-related parameters never appear in `Signature` (spec.md §4
        // invariant), so a handler that only wants `_access_dict` has an
        // empty public signature and must accept an empty call.
        let proc = Procedure::new(
            "ns.whoami_like",
            Signature::default(),
            "doc",
            HashMap::new(),
            true,
            AcceptedAccessParams {
                access_dict: true,
                ..AcceptedAccessParams::default()
            },
            Arc::new(|args: CallArgs| Box::pin(async move { Ok(Value::String(format!("{:?}", args.access_context))) })),
        );
        let result = proc
            .invoke(vec![], Map::new(), AccessContext::new(), String::new(), String::new())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn invoke_runs_authorize_before_validation() {
        let sig = Signature::new(vec![ParamSpec::Positional("a".into())]);
        let proc = Procedure::new(
            "ns.proc",
            sig,
            "doc",
            HashMap::new(),
            true,
            AcceptedAccessParams::default(),
            noop_handler(),
        )
        .with_authorize(Arc::new(|_ctx| Err(ProcedureError::access_denied("no"))));

        let err = proc
            .invoke(vec![], Map::new(), AccessContext::new(), String::new(), String::new())
            .await
            .unwrap_err();
        assert_eq!(err.wire_name(), "AccessDenied");
    }

    #[tokio::test]
    async fn invoke_substitutes_the_procedure_name_into_bad_arguments() {
        let sig = Signature::new(vec![ParamSpec::Positional("a".into())]);
        let proc = Procedure::new(
            "ns.proc",
            sig,
            "doc",
            HashMap::new(),
            true,
            AcceptedAccessParams::default(),
            noop_handler(),
        );
        let err = proc
            .invoke(vec![], Map::new(), AccessContext::new(), String::new(), String::new())
            .await
            .unwrap_err();
        match err {
            ProcedureError::BadArguments(msg) => assert!(msg.starts_with("ns.proc")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
