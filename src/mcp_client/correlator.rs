//! Request correlation: matches JSON-RPC responses to pending requests.
//!
//! Every outgoing request gets an id from [`RequestCorrelator::next_id`] and a
//! oneshot channel in the pending table. The stdout reader task hands every
//! parsed response to [`RequestCorrelator::dispatch`], which completes the
//! matching entry. Responses may arrive in any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use super::errors::McpError;
use super::types::JsonRpcResponse;

/// What a pending request eventually completes with.
pub type Completion = Result<serde_json::Value, McpError>;

/// One in-flight request awaiting its response.
struct PendingRequest {
    method: String,
    created_at: Instant,
    tx: oneshot::Sender<Completion>,
}

/// Owns the id counter and the pending-request table for one connection.
pub struct RequestCorrelator {
    server_name: String,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

impl RequestCorrelator {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Next request id. Strictly increasing, starting at 1.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingRequest>> {
        // The table holds no invariants a panicking holder could break.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a pending request and return the receiver its response
    /// will be delivered on.
    pub fn register(
        &self,
        id: u64,
        method: &str,
    ) -> Result<oneshot::Receiver<Completion>, McpError> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.table();
        if table.contains_key(&id) {
            return Err(McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("request id {id} is already pending"),
            });
        }
        table.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                created_at: Instant::now(),
                tx,
            },
        );
        Ok(rx)
    }

    /// Complete the pending request matching `response.id`.
    ///
    /// Returns `false` when no request with that id is pending, or when the
    /// message is a server-initiated request that merely shares the id; the
    /// message is dropped and the table is left untouched.
    pub fn dispatch(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.response_id() else {
            return false;
        };
        let Some(entry) = self.table().remove(&id) else {
            tracing::debug!(
                server = %self.server_name,
                id,
                "dropping response with no pending request"
            );
            return false;
        };

        let completion = match (response.result, response.error) {
            (_, Some(err)) => Err(McpError::RemoteError {
                code: err.code,
                message: err.message_or_default(),
                data: err.data,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(serde_json::Value::Null),
        };

        tracing::trace!(
            server = %self.server_name,
            id,
            method = %entry.method,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "response matched"
        );

        // The caller may have stopped waiting; nothing to do then.
        let _ = entry.tx.send(completion);
        true
    }

    /// Wait for the response to request `id`, removing it from the table if
    /// the window elapses first.
    pub async fn wait(
        &self,
        id: u64,
        method: &str,
        rx: oneshot::Receiver<Completion>,
        timeout: Duration,
    ) -> Completion {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(completion)) => completion,
            Ok(Err(_)) => Err(McpError::TransportClosed {
                name: self.server_name.clone(),
                reason: "response channel dropped".into(),
            }),
            Err(_) => {
                self.cancel(id);
                tracing::warn!(
                    server = %self.server_name,
                    id,
                    method,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(McpError::RequestTimeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Drop a pending request without completing it.
    pub fn cancel(&self, id: u64) -> bool {
        self.table().remove(&id).is_some()
    }

    /// Fail every pending request with `TransportClosed`. Returns how many
    /// were failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(u64, PendingRequest)> = self.table().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            tracing::debug!(
                server = %self.server_name,
                id,
                method = %entry.method,
                "failing pending request"
            );
            let _ = entry.tx.send(Err(McpError::TransportClosed {
                name: self.server_name.clone(),
                reason: reason.to_string(),
            }));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.table().len()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
