//! Completion handles for asynchronous device submissions.
//!
//! An [`Event`] is created pending when work is submitted and is signalled by
//! the backend once that work has finished (or failed). Submissions take a
//! wait-list of events and do not start before every event in it completed,
//! which is how dependency chains between kernels are expressed.

use core::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Drives a backend forward while a caller blocks on an event.
///
/// Backends without their own worker threads (wgpu) only fire completion
/// callbacks while the device is being polled.
pub(crate) type Pump = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Pending,
    Complete,
    Failed(String),
}

struct Inner {
    label: &'static str,
    state: Mutex<State>,
    ready: Condvar,
    pump: Option<Pump>,
}

/// Observable state of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// The operation has not finished yet.
    Pending,
    /// The operation finished successfully.
    Complete,
    /// The operation (or one of its dependencies) failed.
    Failed,
}

/// Opaque future representing the completion of one device submission.
///
/// Cloning an event is cheap; all clones observe the same completion.
#[derive(Clone)]
#[must_use = "events must be waited on or passed to a later submission"]
pub struct Event {
    inner: Arc<Inner>,
}

impl Event {
    /// An event that is already complete.
    pub fn complete() -> Self {
        Self::with_state("complete", State::Complete, None)
    }

    pub(crate) fn pending(label: &'static str, pump: Option<Pump>) -> Self {
        Self::with_state(label, State::Pending, pump)
    }

    fn with_state(label: &'static str, state: State, pump: Option<Pump>) -> Self {
        Self {
            inner: Arc::new(Inner {
                label,
                state: Mutex::new(state),
                ready: Condvar::new(),
                pump,
            }),
        }
    }

    /// Marks the event complete and wakes every waiter.
    pub(crate) fn signal(&self) {
        self.settle(State::Complete);
    }

    /// Marks the event failed and wakes every waiter.
    pub(crate) fn fail(&self, message: impl Into<String>) {
        self.settle(State::Failed(message.into()));
    }

    fn settle(&self, next: State) {
        let mut state = self.inner.state.lock();
        if *state == State::Pending {
            *state = next;
            self.inner.ready.notify_all();
        }
    }

    /// The label of the submission that created this event.
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.inner.label
    }

    /// Current status without blocking.
    #[must_use]
    pub fn status(&self) -> EventStatus {
        match *self.inner.state.lock() {
            State::Pending => EventStatus::Pending,
            State::Complete => EventStatus::Complete,
            State::Failed(_) => EventStatus::Failed,
        }
    }

    /// Returns `true` once the operation finished successfully.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status() == EventStatus::Complete
    }

    /// Blocks the calling thread until the operation finishes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceExecution`] if the operation or one of its
    /// dependencies failed.
    pub fn wait(&self) -> Result<()> {
        loop {
            let mut state = self.inner.state.lock();
            match &*state {
                State::Complete => return Ok(()),
                State::Failed(msg) => {
                    return Err(Error::DeviceExecution(format!(
                        "{}: {msg}",
                        self.inner.label
                    )));
                }
                State::Pending => {}
            }
            match &self.inner.pump {
                Some(pump) => {
                    drop(state);
                    pump();
                    std::thread::yield_now();
                }
                None => self.inner.ready.wait(&mut state),
            }
        }
    }

    /// Waits for every event in `events`, reporting the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first [`Error::DeviceExecution`] encountered.
    pub fn wait_all(events: &[Self]) -> Result<()> {
        events.iter().try_for_each(Self::wait)
    }

    /// Returns `true` if both handles observe the same submission.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A pending [`Event`] completed by the host instead of a device submission.
///
/// Useful to hold back a chain of submissions until some host-side condition
/// holds. Dropping it unsignalled fails the event, so no waiter blocks forever.
#[derive(Debug)]
pub struct UserEvent {
    event: Event,
}

impl UserEvent {
    /// Creates a pending user event.
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self {
            event: Event::pending(label, None),
        }
    }

    /// A handle to pass into wait-lists.
    pub fn event(&self) -> Event {
        self.event.clone()
    }

    /// Completes the event.
    pub fn signal(self) {
        self.event.signal();
    }

    /// Fails the event and everything waiting on it.
    pub fn fail(self, message: impl Into<String>) {
        self.event.fail(message);
    }
}

impl Drop for UserEvent {
    fn drop(&mut self) {
        self.event.fail("user event dropped before it was signalled");
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("label", &self.inner.label)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn waiters_wake_when_signalled_from_another_thread() {
        let ev = Event::pending("test", None);
        let remote = ev.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.signal();
        });
        ev.wait().unwrap();
        assert!(ev.is_complete());
        handle.join().unwrap();
    }

    #[test]
    fn user_events_gate_waiters() {
        let gate = UserEvent::new("gate");
        let ev = gate.event();
        assert_eq!(ev.status(), EventStatus::Pending);
        gate.signal();
        ev.wait().unwrap();

        let dropped = UserEvent::new("abandoned");
        let ev = dropped.event();
        drop(dropped);
        assert_eq!(ev.status(), EventStatus::Failed);
    }

    #[test]
    fn failure_is_sticky() {
        let ev = Event::pending("gemm", None);
        ev.fail("boom");
        ev.signal();
        assert_eq!(ev.status(), EventStatus::Failed);
        let err = ev.wait().unwrap_err();
        assert!(err.to_string().contains("gemm: boom"));
    }

    #[test]
    fn pump_is_driven_while_pending() {
        let ev = Event::pending("pumped", None);
        let target = ev.clone();
        let pumped = Event::pending(
            "pumped",
            Some(Arc::new(move || target.signal())),
        );
        // the pump of `pumped` completes `ev`, not itself; complete it too
        let finisher = pumped.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            finisher.signal();
        });
        pumped.wait().unwrap();
        assert!(ev.is_complete());
        handle.join().unwrap();
    }
}
