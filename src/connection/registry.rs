//! Outstanding request tracking.
//!
//! The registry allocates request ids and holds one completion slot per
//! request awaiting its response. A slot is removed exactly once, by
//! whichever comes first:
//!
//! - [`RequestRegistry::resolve`] when the response arrives
//! - [`RequestRegistry::fail`] when the send phase failed
//! - [`RequestRegistry::fail_all`] when the transport went away
//!
//! Later completions for the same id find no slot and are dropped.

// ============================================================================
// Imports
// ============================================================================

use std::time::Instant;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::RequestId;
use crate::protocol::Command;

// ============================================================================
// Types
// ============================================================================

/// Receiver for a request's outcome.
pub type ResponseReceiver = oneshot::Receiver<Result<Command>>;

type Responder = oneshot::Sender<Result<Command>>;

struct PendingRequest {
    created_at: Instant,
    fingerprint: Option<String>,
    responder: Responder,
    followers: Vec<Responder>,
}

impl PendingRequest {
    fn complete(self, outcome: Result<Command>) {
        for follower in self.followers {
            let _ = follower.send(outcome.clone());
        }
        let _ = self.responder.send(outcome);
    }
}

#[derive(Default)]
struct RegistryState {
    next_id: u32,
    pending: FxHashMap<RequestId, PendingRequest>,
    by_fingerprint: FxHashMap<String, RequestId>,
}

impl RegistryState {
    fn remove(&mut self, id: RequestId) -> Option<PendingRequest> {
        let request = self.pending.remove(&id)?;
        if let Some(fingerprint) = &request.fingerprint
            && self.by_fingerprint.get(fingerprint) == Some(&id)
        {
            self.by_fingerprint.remove(fingerprint);
        }
        Some(request)
    }

    fn allocate_id(&mut self) -> RequestId {
        loop {
            let id = RequestId::new(self.next_id).next();
            self.next_id = id.as_u32();
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }
}

// ============================================================================
// RequestRegistry
// ============================================================================

/// Correlates requests with responses.
pub struct RequestRegistry {
    state: Mutex<RegistryState>,
    max_pending: usize,
}

impl RequestRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            max_pending,
        }
    }

    /// Allocates an id and a completion slot.
    ///
    /// With a `fingerprint`, later identical requests may [`join`](Self::join)
    /// this one while it is outstanding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if `max_pending` requests are already
    /// outstanding.
    pub fn register(&self, fingerprint: Option<String>) -> Result<(RequestId, ResponseReceiver)> {
        let mut state = self.state.lock();

        if state.pending.len() >= self.max_pending {
            return Err(Error::protocol(format!(
                "Too many pending requests ({})",
                self.max_pending
            )));
        }

        let id = state.allocate_id();
        let (tx, rx) = oneshot::channel();

        if let Some(fingerprint) = &fingerprint {
            state.by_fingerprint.insert(fingerprint.clone(), id);
        }
        state.pending.insert(
            id,
            PendingRequest {
                created_at: Instant::now(),
                fingerprint,
                responder: tx,
                followers: Vec::new(),
            },
        );

        trace!(%id, pending = state.pending.len(), "Request registered");
        Ok((id, rx))
    }

    /// Attaches to an outstanding request with the same fingerprint.
    ///
    /// Returns `None` if there is none; the caller should register its own.
    pub fn join(&self, fingerprint: &str) -> Option<ResponseReceiver> {
        let mut state = self.state.lock();
        let id = *state.by_fingerprint.get(fingerprint)?;
        let request = state.pending.get_mut(&id)?;

        let (tx, rx) = oneshot::channel();
        request.followers.push(tx);

        debug!(%id, followers = request.followers.len(), "Joined in-flight request");
        Some(rx)
    }

    /// Completes the request matching `response`.
    ///
    /// A response carrying an error object completes with
    /// [`Error::Server`]. Returns `false` if no request is waiting for this
    /// id.
    pub fn resolve(&self, response: Command) -> bool {
        let Some(id) = response.request_id else {
            return false;
        };

        let Some(request) = self.state.lock().remove(id) else {
            debug!(%id, "Dropping response without pending request");
            return false;
        };

        trace!(%id, elapsed = ?request.created_at.elapsed(), "Request resolved");
        request.complete(response.into_result());
        true
    }

    /// Fails one request. Returns `false` if it already completed.
    pub fn fail(&self, id: RequestId, error: Error) -> bool {
        let Some(request) = self.state.lock().remove(id) else {
            return false;
        };

        debug!(%id, %error, "Request failed");
        request.complete(Err(error));
        true
    }

    /// Fails every outstanding request. Returns how many were failed.
    pub fn fail_all(&self, error: &Error) -> usize {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.by_fingerprint.clear();
            state.pending.drain().map(|(_, request)| request).collect()
        };

        let count = drained.len();
        for request in drained {
            request.complete(Err(error.clone()));
        }

        if count > 0 {
            debug!(count, %error, "Failed all pending requests");
        }
        count
    }

    /// Returns `true` if `id` is outstanding.
    #[must_use]
    pub fn contains(&self, id: RequestId) -> bool {
        self.state.lock().pending.contains_key(&id)
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Returns `true` if no request is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }
}

impl std::fmt::Debug for RequestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRegistry")
            .field("pending", &self.len())
            .field("max_pending", &self.max_pending)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
