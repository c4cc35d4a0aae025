//! Request correlation: pending request bookkeeping and event routing.
//!
//! Uses `scc::HashMap` so the facade can register and unsubscribe without
//! going through the connection driver, while the driver dispatches events
//! sequentially on its own task. Callbacks run outside the map's locks, so a
//! callback may unsubscribe itself.

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use tracing::{debug, error};

use crate::{
    error::{TransportError, TransportResult},
    types::{ListenEvent, RequestId, StreamFrame},
};

/// Callback invoked with every event for one request.
pub type ListenCallback = Arc<dyn Fn(ListenEvent) + Send + Sync + 'static>;

/// A request awaiting streamed events.
struct PendingRequest {
    callback: ListenCallback,
    created_at: Instant,
    completed: Arc<AtomicBool>,
}

/// What happened to a dispatched frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivered; the request stays pending.
    Delivered,
    /// Delivered a terminal phase; the request is now completed.
    Completed,
    /// No pending request with that id.
    Unmatched,
    /// The request was completed before this frame arrived.
    AlreadyCompleted,
}

/// Store of pending requests keyed by [`RequestId`].
pub struct PendingRequestStore {
    requests: scc::HashMap<RequestId, PendingRequest>,
    max_pending: usize,
}

impl PendingRequestStore {
    /// Create a new store that accepts at most `max_pending` requests.
    pub fn new(max_pending: usize) -> Self {
        Self {
            requests: scc::HashMap::new(),
            max_pending,
        }
    }

    /// Register a callback under a freshly minted request id.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::CapacityExceeded`] when the store is full.
    pub fn register<F>(self: &Arc<Self>, callback: F) -> TransportResult<Subscription>
    where
        F: Fn(ListenEvent) + Send + Sync + 'static,
    {
        self.register_arc(Arc::new(callback))
    }

    pub(crate) fn register_arc(self: &Arc<Self>, callback: ListenCallback) -> TransportResult<Subscription> {
        if self.requests.len() >= self.max_pending {
            return Err(TransportError::capacity_exceeded(
                "Too many pending requests",
            ));
        }

        let completed = Arc::new(AtomicBool::new(false));
        let mut request_id = RequestId::new();
        let mut pending = PendingRequest {
            callback,
            created_at: Instant::now(),
            completed: Arc::clone(&completed),
        };

        // A ULID collision means two ids in the same millisecond with equal
        // random parts; mint again rather than clobber.
        loop {
            match self.requests.insert_sync(request_id.clone(), pending) {
                Ok(()) => break,
                Err((_, returned)) => {
                    pending = returned;
                    request_id = RequestId::new();
                }
            }
        }

        debug!(request_id = %request_id, "Registered pending request");

        Ok(Subscription {
            request_id,
            completed,
            store: Arc::downgrade(self),
        })
    }

    /// Route a frame to its request's callback.
    ///
    /// `terminal` marks the request completed after delivery. Unmatched
    /// frames are dropped.
    pub fn dispatch(&self, frame: StreamFrame, terminal: bool) -> DispatchOutcome {
        let Some((callback, completed)) = self.requests.read_sync(&frame.request_id, |_, p| {
            (Arc::clone(&p.callback), Arc::clone(&p.completed))
        }) else {
            debug!(request_id = %frame.request_id, phase = %frame.phase, "Dropping event for unknown request");
            return DispatchOutcome::Unmatched;
        };

        if completed.load(Ordering::Acquire) {
            self.requests.remove_sync(&frame.request_id);
            return DispatchOutcome::AlreadyCompleted;
        }

        let request_id = frame.request_id.clone();
        invoke(&callback, ListenEvent::from(frame));

        if terminal {
            completed.store(true, Ordering::Release);
            self.requests.remove_sync(&request_id);
            debug!(request_id = %request_id, "Request completed");
            DispatchOutcome::Completed
        } else {
            DispatchOutcome::Delivered
        }
    }

    /// Complete every pending request, delivering a synthesized terminal
    /// event to each one that was still pending.
    ///
    /// Returns the number of callbacks notified.
    pub fn fail_all(&self, phase: &str, event_type: &str, payload: serde_json::Value) -> usize {
        let mut ids = Vec::new();
        self.requests.retain_sync(|id, _| {
            ids.push(id.clone());
            true
        });

        let mut notified = 0;
        for id in ids {
            let Some((_, pending)) = self.requests.remove_sync(&id) else {
                continue;
            };
            if pending.completed.swap(true, Ordering::AcqRel) {
                continue;
            }
            debug!(
                request_id = %id,
                age_ms = u64::try_from(pending.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                phase,
                "Completing pending request"
            );
            invoke(
                &pending.callback,
                ListenEvent::synthesized(id, phase, event_type, payload.clone()),
            );
            notified += 1;
        }
        notified
    }

    /// Whether `id` is still pending.
    pub fn contains(&self, id: &RequestId) -> bool {
        self.requests.contains_sync(id)
    }

    /// Check if there's capacity for more requests.
    pub fn has_capacity(&self) -> bool {
        self.requests.len() < self.max_pending
    }

    /// Get the current number of pending requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn complete(&self, id: &RequestId) {
        self.requests.remove_sync(id);
    }
}

impl fmt::Debug for PendingRequestStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequestStore")
            .field("len", &self.requests.len())
            .field("max_pending", &self.max_pending)
            .finish()
    }
}

fn invoke(callback: &ListenCallback, event: ListenEvent) {
    let request_id = event.request_id.clone();
    if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        error!(request_id = %request_id, "Listener callback panicked; event discarded");
    }
}

/// Caller-side handle to a pending request.
///
/// Holds no reference into the store's storage; dropping it does not
/// unsubscribe.
#[derive(Clone)]
pub struct Subscription {
    request_id: RequestId,
    completed: Arc<AtomicBool>,
    store: Weak<PendingRequestStore>,
}

impl Subscription {
    /// The id correlating this request with its events.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Stop delivering events for this request.
    ///
    /// Idempotent, and safe after natural completion. Returns `true` only for
    /// the call that actually completed the request. Does not affect the
    /// shared connection or other requests.
    pub fn unsubscribe(&self) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(store) = self.store.upgrade() {
            store.complete(&self.request_id);
        }
        debug!(request_id = %self.request_id, "Unsubscribed");
        true
    }

    /// Whether the request has completed or been unsubscribed.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("request_id", &self.request_id)
            .field("completed", &self.is_completed())
            .finish()
    }
}
