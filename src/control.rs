//! Training Control
//!
//! A [`TrainingControl`] is a cloneable handle shared between the training
//! loop and whoever wants to steer it, typically a UI or another thread.
//!
//! ```text
//! Idle ──train──▶ Training ──pause──▶ Paused
//!   ▲                │  ▲                │
//!   │                │  └────resume──────┘
//!   └─finish/error/stop
//! ```
//!
//! The loop checks the handle at every epoch, batch and sample boundary.
//! While a pause is pending it blocks on a condition variable until
//! [`TrainingControl::resume`] is called, then carries on from exactly where
//! it stopped. Nothing is rolled back.
//!
//! A stop request is honoured at the next epoch boundary. Stopping a paused
//! loop wakes it so that it can reach that boundary.
//!
//! Requests are sticky: a pause or stop issued just before training starts is
//! seen by the first boundary check.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingState {
    #[default]
    Idle,
    Training,
    Paused,
}

#[derive(Debug, Default)]
struct ControlFlags {
    state: TrainingState,
    pause_requested: bool,
    stop_requested: bool,
}

#[derive(Debug, Default)]
struct Shared {
    flags: Mutex<ControlFlags>,
    changed: Condvar,
}

#[derive(Clone, Debug, Default)]
pub struct TrainingControl {
    shared: Arc<Shared>,
}

impl TrainingControl {
    /// Fresh handle in the `Idle` state with no pending requests
    ///
    /// Every [`Model`](crate::Model) owns one already; use
    /// [`Model::control`](crate::Model::control) to share it. Clones refer to
    /// the same flags.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use layerwise::{Model, TrainingState};
    /// # use std::time::Duration;
    /// # let model: Model = todo!();
    /// let control = model.control();
    /// std::thread::spawn(move || {
    ///     control.pause();
    ///     control.wait_for_state(TrainingState::Paused, Duration::from_secs(5));
    ///     control.stop();
    /// });
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ControlFlags> {
        // The flags stay consistent even if a holder panicked.
        self.shared
            .flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, flags: &mut ControlFlags, state: TrainingState) {
        if flags.state != state {
            flags.state = state;
            self.shared.changed.notify_all();
        }
    }

    pub fn state(&self) -> TrainingState {
        self.lock().state
    }

    /// Ask the loop to suspend at its next boundary.
    pub fn pause(&self) {
        let mut flags = self.lock();
        flags.pause_requested = true;
        debug!(state = ?flags.state, "pause requested");
    }

    /// Let a paused loop continue.
    pub fn resume(&self) {
        let mut flags = self.lock();
        flags.pause_requested = false;
        debug!(state = ?flags.state, "resume requested");
        self.shared.changed.notify_all();
    }

    /// Ask the loop to finish at the next epoch boundary.
    pub fn stop(&self) {
        let mut flags = self.lock();
        flags.stop_requested = true;
        flags.pause_requested = false;
        debug!(state = ?flags.state, "stop requested");
        self.shared.changed.notify_all();
    }

    pub fn is_pause_requested(&self) -> bool {
        self.lock().pause_requested
    }

    pub fn is_stop_requested(&self) -> bool {
        self.lock().stop_requested
    }

    /// Clear pending requests. Has no effect on a running loop's state.
    pub fn clear(&self) {
        let mut flags = self.lock();
        flags.pause_requested = false;
        flags.stop_requested = false;
        self.shared.changed.notify_all();
    }

    /// Block until the state equals `state` or `timeout` elapses.
    ///
    /// Returns whether the state was reached.
    pub fn wait_for_state(&self, state: TrainingState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flags = self.lock();
        while flags.state != state {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            flags = match self.shared.changed.wait_timeout(flags, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Mark the loop as running. The returned guard puts the state back to
    /// `Idle` and clears a consumed stop request when dropped.
    pub(crate) fn begin(&self) -> ControlGuard<'_> {
        let mut flags = self.lock();
        self.set_state(&mut flags, TrainingState::Training);
        ControlGuard { control: self }
    }

    /// Suspension point. Blocks while a pause is pending.
    pub(crate) fn checkpoint(&self, boundary: &'static str) {
        let mut flags = self.lock();
        if !flags.pause_requested {
            return;
        }

        debug!(boundary, "training paused");
        self.set_state(&mut flags, TrainingState::Paused);
        while flags.pause_requested {
            flags = self
                .shared
                .changed
                .wait(flags)
                .unwrap_or_else(PoisonError::into_inner);
        }
        self.set_state(&mut flags, TrainingState::Training);
        debug!(boundary, "training resumed");
    }
}

pub(crate) struct ControlGuard<'a> {
    control: &'a TrainingControl,
}

impl Drop for ControlGuard<'_> {
    fn drop(&mut self) {
        let mut flags = self.control.lock();
        flags.stop_requested = false;
        self.control.set_state(&mut flags, TrainingState::Idle);
    }
}
