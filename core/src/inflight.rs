//! Registry of in-flight prompt operations, indexed by session and by
//! (session, operation) so cancellation can target either granularity.

// A poisoned registry mutex means a panic mid-registration; propagating the
// panic is the right outcome.
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Default)]
pub struct InFlightRegistry {
    by_session: Mutex<HashMap<String, HashMap<String, CancellationToken>>>,
}

pub struct OperationGuard<'a> {
    registry: &'a InFlightRegistry,
    pub session_id: String,
    pub operation_id: String,
    pub token: CancellationToken,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.session_id, &self.operation_id);
    }
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new operation for `session_id`. Fails with `None` when the
    /// session already has one in flight: a session owns at most one prompt
    /// at a time.
    pub fn register(&self, session_id: &str) -> Option<OperationGuard<'_>> {
        let mut by_session = self.by_session.lock().unwrap();
        let ops = by_session.entry(session_id.to_string()).or_default();
        if !ops.is_empty() {
            return None;
        }
        let operation_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        ops.insert(operation_id.clone(), token.clone());
        Some(OperationGuard {
            registry: self,
            session_id: session_id.to_string(),
            operation_id,
            token,
        })
    }

    fn remove(&self, session_id: &str, operation_id: &str) {
        let mut by_session = self.by_session.lock().unwrap();
        if let Some(ops) = by_session.get_mut(session_id) {
            ops.remove(operation_id);
            if ops.is_empty() {
                by_session.remove(session_id);
            }
        }
    }

    pub fn has_in_flight(&self, session_id: &str) -> bool {
        self.by_session
            .lock()
            .unwrap()
            .get(session_id)
            .is_some_and(|ops| !ops.is_empty())
    }

    /// Signal every operation for `session_id`. Returns whether any token was
    /// fired. Idempotent: cancelling an already-cancelled token is a no-op.
    pub fn cancel_session(&self, session_id: &str) -> bool {
        let by_session = self.by_session.lock().unwrap();
        match by_session.get(session_id) {
            Some(ops) if !ops.is_empty() => {
                for token in ops.values() {
                    token.cancel();
                }
                true
            }
            _ => false,
        }
    }

    /// Signal one specific operation.
    pub fn cancel_operation(&self, session_id: &str, operation_id: &str) -> bool {
        let by_session = self.by_session.lock().unwrap();
        match by_session
            .get(session_id)
            .and_then(|ops| ops.get(operation_id))
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}
