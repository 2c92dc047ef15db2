//! Pending-call table.

use std::collections::HashMap;
use std::time::Instant;

use duplex_core::{CallId, RpcError};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::metrics::PENDING_REJECTED_TOTAL;

/// Settlement channel of one pending call: the raw reply body or a failure.
pub type ReplyReceiver = oneshot::Receiver<Result<String, RpcError>>;

struct PendingCall {
    method: String,
    registered_at: Instant,
    tx: oneshot::Sender<Result<String, RpcError>>,
}

/// Calls awaiting a reply, keyed by call id.
///
/// Every entry leaves the table exactly once: matched by a reply, rolled
/// back after a failed send, or settled by [`PendingCalls::reject_all`].
#[derive(Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<CallId, PendingCall>>,
}

impl PendingCalls {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call. A duplicate id is a precondition failure.
    pub fn register(&self, id: CallId, method: &str) -> Result<ReplyReceiver, RpcError> {
        let (tx, rx) = oneshot::channel();
        let mut calls = self.calls.lock();
        if calls.contains_key(&id) {
            return Err(RpcError::precondition(format!(
                "Call id {id} is already pending"
            )));
        }
        let _ = calls.insert(
            id,
            PendingCall {
                method: method.to_owned(),
                registered_at: Instant::now(),
                tx,
            },
        );
        Ok(rx)
    }

    /// Settle the call with a reply body. Returns `false` if nothing matched.
    pub fn resolve(&self, id: &CallId, body: String) -> bool {
        let Some(call) = self.calls.lock().remove(id) else {
            return false;
        };
        debug!(
            %id,
            method = %call.method,
            elapsed_ms = call.registered_at.elapsed().as_millis(),
            "reply matched"
        );
        let _ = call.tx.send(Ok(body));
        true
    }

    /// Drop a registration without settling it.
    pub fn remove(&self, id: &CallId) -> bool {
        self.calls.lock().remove(id).is_some()
    }

    /// Settle every pending call with a failure.
    pub fn reject_all(&self, reason: &RpcError) -> usize {
        let drained: Vec<_> = self.calls.lock().drain().collect();
        let count = drained.len();
        for (id, call) in drained {
            debug!(%id, method = %call.method, reason = %reason, "pending call rejected");
            let _ = call.tx.send(Err(reason.clone()));
        }
        if count > 0 {
            counter!(PENDING_REJECTED_TOTAL).increment(count as u64);
        }
        count
    }

    /// Calls awaiting a reply.
    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}
