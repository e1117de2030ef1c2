//! Shared identifiers and time helpers used across the CPV protocol stack.

use std::time::{SystemTime, UNIX_EPOCH};

/// A participant identifier, e.g. `server1`, `server2`, `server3`, `client1`.
///
/// By convention verifiers are named `server<k>` and clients `client<k>`;
/// nothing in the wire format enforces the convention beyond the
/// `server`/`client` prefix used to classify an inbound `HELLO`.
pub type NodeId = String;

/// Returns `true` if `id` is conventionally a verifier id.
pub fn is_server_id(id: &str) -> bool {
    id.starts_with("server")
}

/// Returns `true` if `id` is conventionally a client id.
pub fn is_client_id(id: &str) -> bool {
    id.starts_with("client")
}

/// Host-local wall-clock time, as fractional seconds since the Unix epoch.
///
/// All delay measurements in the protocol are differences of two calls to
/// this function, so only monotonic *within a process* behavior matters —
/// there is no attempt at cross-host clock synchronization (see the MP
/// protocol's symmetrization, which is specifically designed to tolerate
/// the clock skew this implies).
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs_f64()
}
