//! Signalling primitives shared with the outer wait-set.
//!
//! A [`WaitSetData`] is owned by whoever blocks on it. Entities hold it only
//! while attached and set its flag whenever they gain data. The flag is
//! level-triggered: it stays set until the waiter clears it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Level-triggered flag and condition variable a waiter blocks on.
#[derive(Debug, Default)]
pub struct WaitSetData {
    triggered: Mutex<bool>,
    condition: Condvar,
}

impl WaitSetData {
    /// Create an untriggered wait-set.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set the flag and wake one waiter.
    pub fn notify(&self) {
        let mut triggered = self.triggered.lock();
        *triggered = true;
        self.condition.notify_one();
    }

    /// Whether the flag is set.
    pub fn is_triggered(&self) -> bool {
        *self.triggered.lock()
    }

    /// Block until the flag is set or `timeout` elapses, then clear it.
    ///
    /// Returns whether the flag was set. `None` waits indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut triggered = self.triggered.lock();
        while !*triggered {
            match deadline {
                None => self.condition.wait(&mut triggered),
                Some(deadline) => {
                    if self
                        .condition
                        .wait_until(&mut triggered, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
            }
        }
        std::mem::replace(&mut *triggered, false)
    }
}

#[derive(Debug, Default)]
struct GuardState {
    triggered: bool,
    wait_set: Option<Arc<WaitSetData>>,
}

/// A user- or graph-triggered condition.
#[derive(Debug, Default)]
pub struct GuardCondition {
    state: Mutex<GuardState>,
}

impl GuardCondition {
    /// Create an untriggered guard condition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the trigger and notify the attached wait-set, if any.
    pub fn trigger(&self) {
        let mut state = self.state.lock();
        state.triggered = true;
        if let Some(wait_set) = &state.wait_set {
            wait_set.notify();
        }
    }

    /// Attach a wait-set to notify on trigger.
    pub fn attach_condition(&self, wait_set: Arc<WaitSetData>) {
        self.state.lock().wait_set = Some(wait_set);
    }

    /// Detach the wait-set.
    pub fn detach_condition(&self) {
        self.state.lock().wait_set = None;
    }

    /// Whether the condition is triggered.
    pub fn has_triggered(&self) -> bool {
        self.state.lock().triggered
    }

    /// Return the trigger and reset it.
    pub fn get_and_reset_trigger(&self) -> bool {
        std::mem::take(&mut self.state.lock().triggered)
    }
}

/// User callback told how many new events arrived.
pub type EventCallback = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct CallbackState {
    callback: Option<EventCallback>,
    unread_count: usize,
}

/// Holds the user's "new data" callback.
///
/// Events that arrive while no callback is installed are counted and reported
/// in one call as soon as a callback is set.
#[derive(Default)]
pub struct DataCallbackManager {
    state: Mutex<CallbackState>,
}

impl std::fmt::Debug for DataCallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DataCallbackManager")
            .field("has_callback", &state.callback.is_some())
            .field("unread_count", &state.unread_count)
            .finish()
    }
}

impl DataCallbackManager {
    /// Create a manager without a callback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or clear the callback.
    pub fn set_callback(&self, callback: Option<EventCallback>) {
        let pending = {
            let mut state = self.state.lock();
            state.callback = callback.clone();
            match &callback {
                Some(_) => std::mem::take(&mut state.unread_count),
                None => 0,
            }
        };
        if let (Some(callback), true) = (callback, pending > 0) {
            callback(pending);
        }
    }

    /// Report one new event.
    pub fn trigger_callback(&self) {
        let callback = {
            let mut state = self.state.lock();
            match &state.callback {
                Some(callback) => Arc::clone(callback),
                None => {
                    state.unread_count += 1;
                    return;
                }
            }
        };
        callback(1);
    }
}
