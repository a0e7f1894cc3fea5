//! Notification delivery with pause buffering.
//!
//! Push notifications go straight to the application handler while the
//! dispatcher is live. While paused they are queued in arrival order, and
//! [`NotificationDispatcher::resume`] replays the queue before anything
//! that arrives later is delivered.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::protocol::Command;

// ============================================================================
// Types
// ============================================================================

/// Notification handler callback type.
pub type NotificationHandler = Arc<dyn Fn(Command) + Send + Sync>;

#[derive(Default)]
struct DispatchState {
    paused: bool,
    draining: bool,
    queue: VecDeque<Command>,
}

// ============================================================================
// NotificationDispatcher
// ============================================================================

/// Routes push notifications to the application.
#[derive(Default)]
pub struct NotificationDispatcher {
    state: Mutex<DispatchState>,
    handler: Mutex<Option<NotificationHandler>>,
}

impl NotificationDispatcher {
    /// Creates a live dispatcher without a handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the application handler.
    pub fn set_handler(&self, handler: NotificationHandler) {
        *self.handler.lock() = Some(handler);
    }

    /// Removes the application handler.
    pub fn clear_handler(&self) {
        *self.handler.lock() = None;
    }

    /// Delivers or queues one notification.
    ///
    /// While a resume is draining, new notifications join the back of the
    /// queue so ordering is kept.
    pub fn dispatch(&self, command: Command) {
        {
            let mut state = self.state.lock();
            if state.paused || state.draining {
                trace!(%command, queued = state.queue.len() + 1, "Notification buffered");
                state.queue.push_back(command);
                return;
            }
        }
        self.deliver(command);
    }

    /// Starts buffering notifications.
    pub fn pause(&self) {
        self.state.lock().paused = true;
        debug!("Notification delivery paused");
    }

    /// Replays buffered notifications in order, then resumes live delivery.
    ///
    /// Returns how many notifications this call replayed. A resume issued
    /// while another one is draining clears the pause and leaves the rest
    /// of the queue to the running drain. A [`pause`](Self::pause) during
    /// the drain stops it with the rest of the queue kept.
    pub fn resume(&self) -> usize {
        if self.unpause() { self.drain() } else { 0 }
    }

    /// Clears the pause flag.
    ///
    /// Returns `true` when the caller must run [`drain`](Self::drain), and
    /// `false` when a drain is already running and will pick up the queue.
    pub(crate) fn unpause(&self) -> bool {
        let mut state = self.state.lock();
        state.paused = false;
        if state.draining {
            return false;
        }
        state.draining = true;
        true
    }

    /// Delivers queued notifications until the queue is empty or delivery
    /// is paused again. Must follow an [`unpause`](Self::unpause) that
    /// returned `true`.
    pub(crate) fn drain(&self) -> usize {
        let mut replayed = 0;
        loop {
            let next = {
                let mut state = self.state.lock();
                let next = if state.paused {
                    None
                } else {
                    state.queue.pop_front()
                };
                if next.is_none() {
                    state.draining = false;
                }
                next
            };
            let Some(command) = next else {
                break;
            };
            self.deliver(command);
            replayed += 1;
        }

        if replayed > 0 {
            debug!(replayed, "Buffered notifications replayed");
        }
        replayed
    }

    /// Returns `true` while notifications are buffered.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Number of notifications waiting for resume.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn deliver(&self, command: Command) {
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => handler(command),
            None => trace!(%command, "Notification dropped, no handler"),
        }
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("NotificationDispatcher")
            .field("paused", &state.paused)
            .field("buffered", &state.queue.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::protocol::{CommandKind, Operation};

    fn notification(n: i64) -> Command {
        Command::new(CommandKind::Conv, Operation::Joined, json!({"n": n}))
    }

    fn recording(dispatcher: &NotificationDispatcher) -> Arc<Mutex<Vec<i64>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.set_handler(Arc::new(move |command: Command| {
            sink.lock().push(command.get_i64("n"));
        }));
        seen
    }

    #[test]
    fn test_live_delivery() {
        let dispatcher = NotificationDispatcher::new();
        let seen = recording(&dispatcher);

        dispatcher.dispatch(notification(1));
        dispatcher.dispatch(notification(2));

        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_pause_buffers_and_resume_replays_in_order() {
        let dispatcher = NotificationDispatcher::new();
        let seen = recording(&dispatcher);

        dispatcher.pause();
        for n in 1..=3 {
            dispatcher.dispatch(notification(n));
        }
        assert!(seen.lock().is_empty());
        assert_eq!(dispatcher.buffered_len(), 3);

        assert_eq!(dispatcher.resume(), 3);
        dispatcher.dispatch(notification(4));

        assert_eq!(*seen.lock(), vec![1, 2, 3, 4]);
        assert!(!dispatcher.is_paused());
    }

    #[test]
    fn test_notification_during_drain_is_queued_behind() {
        let dispatcher = Arc::new(NotificationDispatcher::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let reentrant = Arc::downgrade(&dispatcher);
        dispatcher.set_handler(Arc::new(move |command: Command| {
            let n = command.get_i64("n");
            sink.lock().push(n);
            if n == 1
                && let Some(dispatcher) = reentrant.upgrade()
            {
                dispatcher.dispatch(notification(10));
            }
        }));

        dispatcher.pause();
        dispatcher.dispatch(notification(1));
        dispatcher.dispatch(notification(2));
        dispatcher.resume();

        assert_eq!(*seen.lock(), vec![1, 2, 10]);
    }

    #[test]
    fn test_pause_during_drain_keeps_rest() {
        let dispatcher = Arc::new(NotificationDispatcher::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let reentrant = Arc::downgrade(&dispatcher);
        dispatcher.set_handler(Arc::new(move |command: Command| {
            sink.lock().push(command.get_i64("n"));
            if let Some(dispatcher) = reentrant.upgrade() {
                dispatcher.pause();
            }
        }));

        dispatcher.pause();
        dispatcher.dispatch(notification(1));
        dispatcher.dispatch(notification(2));

        assert_eq!(dispatcher.resume(), 1);
        assert!(dispatcher.is_paused());
        assert_eq!(dispatcher.buffered_len(), 1);
    }

    #[test]
    fn test_pause_and_resume_inside_drain_keeps_draining() {
        let dispatcher = Arc::new(NotificationDispatcher::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let reentrant = Arc::downgrade(&dispatcher);
        dispatcher.set_handler(Arc::new(move |command: Command| {
            let n = command.get_i64("n");
            sink.lock().push(n);
            if n == 1
                && let Some(dispatcher) = reentrant.upgrade()
            {
                dispatcher.pause();
                assert_eq!(dispatcher.resume(), 0);
            }
        }));

        dispatcher.pause();
        dispatcher.dispatch(notification(1));
        dispatcher.dispatch(notification(2));

        assert_eq!(dispatcher.resume(), 2);
        assert!(!dispatcher.is_paused());
        assert_eq!(dispatcher.buffered_len(), 0);

        dispatcher.dispatch(notification(3));
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_resume_during_drain_clears_pause() {
        let dispatcher = NotificationDispatcher::new();
        dispatcher.pause();
        dispatcher.dispatch(notification(1));

        assert!(dispatcher.unpause());
        dispatcher.pause();
        assert!(!dispatcher.unpause());
        assert!(!dispatcher.is_paused());

        assert_eq!(dispatcher.drain(), 1);
        assert_eq!(dispatcher.buffered_len(), 0);
    }

    #[test]
    fn test_without_handler_notifications_are_dropped() {
        let dispatcher = NotificationDispatcher::new();
        dispatcher.dispatch(notification(1));
        assert_eq!(dispatcher.buffered_len(), 0);
    }
}
