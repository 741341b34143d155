//! At-most-once bookkeeping for forwarded calls.
//!
//! Every forwarded `tools/call` registers its outbound request id here. The
//! upstream response and the timeout timer both race to [`PendingCalls::try_resolve`];
//! exactly one wins, and the loser's payload is dropped instead of producing
//! a second client-visible message for the same id.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct PendingCall {
    resolved: bool,
}

/// Registry of in-flight forwarded calls, keyed by outbound request id.
#[derive(Debug, Default)]
pub struct PendingCalls {
    inner: Mutex<HashMap<String, PendingCall>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingCall>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a freshly dispatched call.
    pub fn register(&self, id: &str) {
        self.lock().insert(id.to_string(), PendingCall::default());
    }

    /// Claim the right to settle this call. The first caller gets `true`;
    /// every later caller (a late response, a lost timer race) gets `false`
    /// and must not deliver anything.
    pub fn try_resolve(&self, id: &str) -> bool {
        match self.lock().get_mut(id) {
            Some(call) if !call.resolved => {
                call.resolved = true;
                true
            }
            _ => false,
        }
    }

    /// Drop the entry once the settled result has been delivered.
    pub fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }
}
