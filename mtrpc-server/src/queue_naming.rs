//! Deterministic request-queue naming (spec.md §6, SPEC_FULL supplement 2).
//!
//! Grounded verbatim on `mtrpc/server/threads.py`'s `RPCManager.init`:
//! `mtrpc_queue.<client_id>.<sha1("{exchange}|{routing_key}").hexdigest()[:6]>`.
//! Multiple server processes sharing the same `client_id` and binding set
//! converge on the same queue name and so compete for the same messages.

use sha1::{Digest, Sha1};

/// The queue name a binding resolves to for one `client_id`.
pub fn queue_name(client_id: &str, exchange: &str, routing_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(exchange.as_bytes());
    hasher.update(b"|");
    hasher.update(routing_key.as_bytes());
    let digest = hasher.finalize();
    let hex = format!("{digest:x}");
    format!("mtrpc_queue.{client_id}.{}", &hex[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_converge_on_the_same_queue_name() {
        let a = queue_name("client-a", "rpc", "rpc.#");
        let b = queue_name("client-a", "rpc", "rpc.#");
        assert_eq!(a, b);
    }

    #[test]
    fn different_bindings_get_different_queue_names() {
        let a = queue_name("client-a", "rpc", "rpc.#");
        let b = queue_name("client-a", "rpc", "rpc.other.#");
        assert_ne!(a, b);
    }

    #[test]
    fn different_client_ids_get_different_queue_names_for_the_same_binding() {
        let a = queue_name("client-a", "rpc", "rpc.#");
        let b = queue_name("client-b", "rpc", "rpc.#");
        assert_ne!(a, b);
    }

    #[test]
    fn name_is_prefixed_and_six_hex_chars() {
        let name = queue_name("c", "e", "rk");
        assert!(name.starts_with("mtrpc_queue.c."));
        let suffix = name.rsplit('.').next().unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
