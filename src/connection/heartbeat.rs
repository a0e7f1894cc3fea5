//! Liveness probing.
//!
//! While the connection is open the monitor sends a probe every interval.
//! Each probe left unanswered counts as a miss; when a tick finds
//! `max_missed` probes still unanswered the monitor gives up and invokes
//! its timeout callback exactly once.
//!
//! ```text
//! t=0          t=interval        t=2*interval
//! probe ──────► probe / timeout ─► ...
//!   ▲  pong resets the miss counter
//! ```
//!
//! The first probe is sent immediately on start, so with `max_missed = 1`
//! the connection is declared dead one interval after an unanswered probe.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace, warn};

// ============================================================================
// HeartbeatOptions
// ============================================================================

/// Heartbeat configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatOptions {
    /// Time between probes. Zero disables probing.
    pub interval: Duration,
    /// Unanswered probes tolerated before the connection is declared dead.
    pub max_missed: u32,
    /// Any inbound frame counts as a reply, not only `echo`.
    pub reset_on_any_frame: bool,
}

impl HeartbeatOptions {
    /// 180 second interval, one miss, only `echo` replies count.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            interval: Duration::from_secs(180),
            max_missed: 1,
            reset_on_any_frame: false,
        }
    }

    /// Probes every `interval`.
    #[inline]
    #[must_use]
    pub const fn every(interval: Duration) -> Self {
        Self {
            interval,
            max_missed: 1,
            reset_on_any_frame: false,
        }
    }

    /// No probing.
    #[inline]
    #[must_use]
    pub const fn disabled() -> Self {
        Self::every(Duration::ZERO)
    }

    /// Sets the miss threshold (at least one).
    #[inline]
    #[must_use]
    pub const fn with_max_missed(mut self, max_missed: u32) -> Self {
        self.max_missed = if max_missed == 0 { 1 } else { max_missed };
        self
    }

    /// Counts every inbound frame as proof of liveness.
    #[inline]
    #[must_use]
    pub const fn with_reset_on_any_frame(mut self) -> Self {
        self.reset_on_any_frame = true;
        self
    }

    /// Returns `true` if probing is enabled.
    #[inline]
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// HeartbeatMonitor
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    unanswered: u32,
}

/// Drives probes for one open period of the connection.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    options: HeartbeatOptions,
    counters: Arc<Mutex<Counters>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    /// Creates a stopped monitor.
    #[must_use]
    pub fn new(options: HeartbeatOptions) -> Self {
        Self {
            options,
            counters: Arc::new(Mutex::new(Counters::default())),
            task: Mutex::new(None),
        }
    }

    /// Starts probing, replacing any previous run.
    ///
    /// `probe` is called on every tick that does not time out. `on_timeout`
    /// is called at most once, after which the monitor stops by itself.
    pub fn start<P, T>(&self, probe: P, on_timeout: T)
    where
        P: Fn() + Send + 'static,
        T: FnOnce() + Send + 'static,
    {
        self.stop();
        self.counters.lock().unanswered = 0;

        if !self.options.is_enabled() {
            debug!("Heartbeat disabled");
            return;
        }

        let interval = self.options.interval;
        let max_missed = self.options.max_missed.max(1);
        let counters = Arc::clone(&self.counters);

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let timed_out = {
                    let mut counters = counters.lock();
                    if counters.unanswered >= max_missed {
                        true
                    } else {
                        counters.unanswered += 1;
                        false
                    }
                };
                if timed_out {
                    break;
                }

                trace!("Heartbeat probe");
                probe();
            }

            warn!(?interval, max_missed, "Heartbeat timed out");
            on_timeout();
        });

        *self.task.lock() = Some(handle);
        debug!(?interval, max_missed, "Heartbeat started");
    }

    /// Records an `echo` reply.
    #[inline]
    pub fn pong(&self) {
        self.counters.lock().unanswered = 0;
    }

    /// Records any inbound frame.
    #[inline]
    pub fn frame_received(&self) {
        if self.options.reset_on_any_frame {
            self.pong();
        }
    }

    /// Stops probing. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            debug!("Heartbeat stopped");
        }
    }

    /// Returns `true` while the probe task runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Probes sent since the last reply.
    #[must_use]
    pub fn unanswered(&self) -> u32 {
        self.counters.lock().unanswered
    }

    /// Configured options.
    #[inline]
    #[must_use]
    pub const fn options(&self) -> &HeartbeatOptions {
        &self.options
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Tests
// ============================================================================
