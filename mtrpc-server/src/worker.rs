//! Per-request execution (spec.md §4.6): decode, resolve, invoke, classify
//! errors, encode, deliver exactly one result.
//!
//! Grounded on `RPCTaskThread.run()` in `mtrpc/server/threads.py`: that
//! method is a single linear pipeline with one `try`/`except` chain per
//! stage, feeding a namedtuple `Result` into the shared `result_fifo`. Here
//! each task is a short-lived tokio task (spec.md §2: "Workers are
//! short-lived and produce exactly one Result") instead of a `threading.Thread`.

use std::sync::Arc;

use mtrpc_proto::{ProcedureError, Request, RequestDecodeError, Response};
use mtrpc_tree::{resolve_procedure_with_access, MethodTree};
use serde_json::Value;

use crate::control_plane::{ControlPlane, ResultMessage, Task};

const LOG_TRUNCATE_LEN: usize = 200;

fn truncate_for_log(value: &Value) -> String {
    let rendered = value.to_string();
    if rendered.len() > LOG_TRUNCATE_LEN {
        let cut = rendered
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= LOG_TRUNCATE_LEN)
            .last()
            .unwrap_or(0);
        format!("{}... ({} bytes)", &rendered[..cut], rendered.len())
    } else {
        rendered
    }
}

/// Redact parameters whose keyword name looks like a secret, the way a
/// production server must before writing a call to the log (not itself
/// part of the original, which logs arguments verbatim; see DESIGN.md).
fn loggable_kwargs(kwargs: &serde_json::Map<String, Value>) -> Value {
    let mut redacted = serde_json::Map::with_capacity(kwargs.len());
    for (k, v) in kwargs {
        if k.to_ascii_lowercase().starts_with("passw") {
            redacted.insert(k.clone(), Value::String("***".to_string()));
        } else {
            redacted.insert(k.clone(), v.clone());
        }
    }
    Value::Object(redacted)
}

fn classify_decode_error(body: &[u8], err: RequestDecodeError) -> ProcedureError {
    let preview = truncate_for_log(&Value::String(String::from_utf8_lossy(body).to_string()));
    match err {
        RequestDecodeError::NotJson(msg) => ProcedureError::DeserializationError(format!("{msg} (body: {preview})")),
        RequestDecodeError::InvalidShape(msg) => ProcedureError::InvalidRequest(msg),
    }
}

/// Run one task to completion and enqueue its single result. Never panics on
/// a malformed or misrouted request — every failure becomes a `Response`
/// carrying a `WireError`, per spec.md §4.6 and §7.
pub async fn execute_task(task: Task, tree: Arc<MethodTree>, results_tx: tokio::sync::mpsc::UnboundedSender<ResultMessage>) {
    let task_id = task.id;
    let reply_to = task.reply_to.clone();

    let response = run_task(&task, &tree).await;

    let payload = match serde_json::to_vec(&response) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!(task_id, error = %err, "response failed to serialize, falling back to SerializationError");
            let fallback = Response::failure(response.id.clone(), ProcedureError::SerializationError(err.to_string()).into_wire());
            serde_json::to_vec(&fallback).expect("a WireError-only response always serializes")
        }
    };

    if results_tx
        .send(ResultMessage::Response { task_id, reply_to, payload })
        .is_err()
    {
        tracing::warn!(task_id, "result FIFO closed, dropping completed task's result");
    }
}

async fn run_task(task: &Task, tree: &MethodTree) -> Response {
    let request: Request = match Request::decode(&task.request_body) {
        Ok(request) => request,
        Err(err) => {
            let procedure_err = classify_decode_error(&task.request_body, err);
            tracing::debug!(task_id = task.id, error = %procedure_err, "request failed to decode");
            // No id could be recovered from an undecodable body; unlike a
            // resolved request, there is nothing to echo back.
            return Response::failure(Value::Null, procedure_err.into_wire());
        }
    };

    if request.is_notification() {
        tracing::debug!(task_id = task.id, method = %request.method, "notification received, not implemented");
        return Response::failure(Value::Null, ProcedureError::NotificationsNotImplemented.into_wire());
    }

    let procedure = match resolve_procedure_with_access(
        tree,
        &request.method,
        &task.access_context,
        &task.access_key_pattern,
        &task.access_keyhole_pattern,
    ) {
        Ok(Some(procedure)) => procedure,
        Ok(None) => {
            tracing::debug!(task_id = task.id, method = %request.method, "method not found or access denied");
            return Response::failure(request.id.clone(), ProcedureError::NotFound(request.method.clone()).into_wire());
        }
        Err(err) => {
            // spec.md §4.3/§4.6: a bad access-key/keyhole template is a
            // configuration-time fault, never a silent denial — it must not
            // surface as `NotFound`. Logged critical (§7: "configuration-time
            // errors... are surfaced as server faults and logged at critical
            // severity") and reported to the caller as the opaque taxonomy
            // member so the broken template text never leaks onto the wire.
            tracing::error!(task_id = task.id, method = %request.method, error = %err, "access pattern configuration error");
            return Response::failure(
                request.id.clone(),
                ProcedureError::InternalServerError(err.to_string()).into_wire(),
            );
        }
    };

    tracing::info!(
        task_id = task.id,
        method = %request.method,
        params = %Value::Array(request.params.clone()),
        kwparams = %loggable_kwargs(&request.kwparams),
        "calling procedure"
    );

    match procedure
        .invoke(
            request.params.clone(),
            request.kwparams.clone(),
            task.access_context.clone(),
            task.access_key_pattern.clone(),
            task.access_keyhole_pattern.clone(),
        )
        .await
    {
        Ok(result) => {
            tracing::info!(task_id = task.id, method = %request.method, result = %truncate_for_log(&result), "call completed");
            Response::success(request.id, result)
        }
        Err(err) => {
            tracing::debug!(task_id = task.id, method = %request.method, error = %err, "call failed");
            Response::failure(request.id, err.into_wire())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtrpc_tree::{build_tree, AcceptedAccessParams, AccessContext, ParamSpec, Procedure, Signature, SourceSpec, SourceUnit, UnitExport};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc as StdArc;
    use tokio::sync::mpsc;

    struct EchoUnit;
    impl SourceUnit for EchoUnit {
        fn exports(&self) -> Vec<UnitExport> {
            vec![UnitExport {
                local_name: "echo".into(),
                procedure: Procedure::new(
                    "echo",
                    Signature::new(vec![ParamSpec::Positional("value".into())]),
                    "echo",
                    HashMap::new(),
                    true,
                    AcceptedAccessParams::default(),
                    StdArc::new(|args| Box::pin(async move { Ok(args.positional[0].clone()) })),
                ),
            }]
        }
    }

    fn tree() -> Arc<MethodTree> {
        let spec = SourceSpec {
            mount: "ns".into(),
            unit: Box::new(EchoUnit),
            exports: vec!["*".into()],
            post_init_kwargs: serde_json::Map::new(),
        };
        Arc::new(build_tree(vec![spec]).unwrap())
    }

    fn task_with_body(body: Vec<u8>) -> Task {
        Task {
            id: 1,
            request_body: body,
            access_context: AccessContext::new(),
            access_key_pattern: "{full_name}".into(),
            access_keyhole_pattern: ".".into(),
            reply_to: Some("reply-queue".into()),
        }
    }

    #[tokio::test]
    async fn successful_call_delivers_a_success_response() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let body = serde_json::to_vec(&json!({"id": 1, "method": "ns.echo", "params": ["hi"]})).unwrap();
        execute_task(task_with_body(body), tree(), tx).await;
        let ResultMessage::Response { payload, reply_to, .. } = rx.recv().await.unwrap() else {
            panic!("expected a Response result");
        };
        assert_eq!(reply_to.as_deref(), Some("reply-queue"));
        let response: Response = serde_json::from_slice(&payload).unwrap();
        assert_eq!(response.result, json!("hi"));
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn unresolvable_method_yields_not_found() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let body = serde_json::to_vec(&json!({"id": 1, "method": "ns.missing", "params": []})).unwrap();
        execute_task(task_with_body(body), tree(), tx).await;
        let ResultMessage::Response { payload, .. } = rx.recv().await.unwrap() else {
            panic!("expected a Response result");
        };
        let response: Response = serde_json::from_slice(&payload).unwrap();
        assert_eq!(response.error.unwrap().name, "NotFound");
    }

    #[tokio::test]
    async fn malformed_body_yields_deserialization_error_with_null_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        execute_task(task_with_body(b"not json".to_vec()), tree(), tx).await;
        let ResultMessage::Response { payload, .. } = rx.recv().await.unwrap() else {
            panic!("expected a Response result");
        };
        let response: Response = serde_json::from_slice(&payload).unwrap();
        assert_eq!(response.id, Value::Null);
        assert_eq!(response.error.unwrap().name, "DeserializationError");
    }

    #[tokio::test]
    async fn well_formed_but_shape_invalid_body_yields_invalid_request() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let body = serde_json::to_vec(&json!({"id": 1, "method": "ns.echo", "params": {"not": "an array"}})).unwrap();
        execute_task(task_with_body(body), tree(), tx).await;
        let ResultMessage::Response { payload, .. } = rx.recv().await.unwrap() else {
            panic!("expected a Response result");
        };
        let response: Response = serde_json::from_slice(&payload).unwrap();
        assert_eq!(response.error.unwrap().name, "InvalidRequest");
    }

    #[tokio::test]
    async fn unresolved_access_pattern_placeholder_yields_internal_server_error_not_not_found() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut task = task_with_body(serde_json::to_vec(&json!({"id": 1, "method": "ns.echo", "params": ["hi"]})).unwrap());
        task.access_key_pattern = "{no_such_field}".into();
        execute_task(task, tree(), tx).await;
        let ResultMessage::Response { payload, .. } = rx.recv().await.unwrap() else {
            panic!("expected a Response result");
        };
        let response: Response = serde_json::from_slice(&payload).unwrap();
        assert_eq!(response.error.unwrap().name, "InternalServerError");
    }

    #[tokio::test]
    async fn notification_without_id_is_not_implemented() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let body = serde_json::to_vec(&json!({"method": "ns.echo", "params": ["hi"]})).unwrap();
        execute_task(task_with_body(body), tree(), tx).await;
        let ResultMessage::Response { payload, .. } = rx.recv().await.unwrap() else {
            panic!("expected a Response result");
        };
        let response: Response = serde_json::from_slice(&payload).unwrap();
        assert_eq!(response.error.unwrap().name, "NotificationsNotImplemented");
    }

    #[test]
    fn loggable_kwargs_redacts_password_fields() {
        let mut kwargs = serde_json::Map::new();
        kwargs.insert("password".into(), json!("secret"));
        kwargs.insert("username".into(), json!("alice"));
        let redacted = loggable_kwargs(&kwargs);
        assert_eq!(redacted["password"], json!("***"));
        assert_eq!(redacted["username"], json!("alice"));
    }
}
