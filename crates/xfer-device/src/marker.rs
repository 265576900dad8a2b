//! Completion markers.
//!
//! A marker is a pair of monotonic tickets. Recording a marker on a queue arms the next ticket
//! and enqueues a signal for it; the queue signals the ticket once every command ahead of it has
//! finished. Waiting targets the most recently armed ticket, so re-recording retargets later
//! waits while any wait already in progress keeps its own target.

use std::fmt;
use std::sync::Arc;

#[cfg(all(feature = "loom", test))]
use loom::sync::{Condvar, Mutex, MutexGuard};
#[cfg(not(all(feature = "loom", test)))]
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::error::{DeviceError, Result};

#[derive(Debug, Default)]
struct Tickets {
    armed: u64,
    reached: u64,
}

pub(crate) struct MarkerInner {
    label: String,
    tickets: Mutex<Tickets>,
    cond: Condvar,
}

impl MarkerInner {
    fn lock(&self) -> MutexGuard<'_, Tickets> {
        match self.tickets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Arm the next ticket. The caller must arrange for it to be signalled.
    pub(crate) fn arm(&self) -> u64 {
        let mut tickets = self.lock();
        tickets.armed += 1;
        tickets.armed
    }

    pub(crate) fn signal(&self, ticket: u64) {
        let mut tickets = self.lock();
        if ticket > tickets.reached {
            tickets.reached = ticket;
        }
        drop(tickets);
        self.cond.notify_all();
    }

    /// Block until `ticket` has been signalled.
    pub(crate) fn wait_ticket(&self, ticket: u64) {
        let mut tickets = self.lock();
        while tickets.reached < ticket {
            tickets = match self.cond.wait(tickets) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// The ticket a wait issued now would target, if the marker was ever recorded.
    pub(crate) fn current_target(&self) -> Option<u64> {
        match self.lock().armed {
            0 => None,
            armed => Some(armed),
        }
    }
}

/// A completion marker. Owned by exactly one channel (not `Clone`).
pub struct Marker {
    inner: Arc<MarkerInner>,
}

impl Marker {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MarkerInner {
                label: label.into(),
                tickets: Mutex::new(Tickets::default()),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub(crate) fn inner(&self) -> &Arc<MarkerInner> {
        &self.inner
    }

    pub fn is_recorded(&self) -> bool {
        self.inner.current_target().is_some()
    }

    /// Non-blocking completion check: `true` once the latest recording has been reached.
    ///
    /// A marker that was never recorded reports `false`.
    pub fn query(&self) -> bool {
        let tickets = self.inner.lock();
        tickets.armed != 0 && tickets.reached >= tickets.armed
    }

    /// Block the calling thread until the latest recording has been reached.
    ///
    /// Waiting on an already reached marker returns immediately.
    pub fn wait(&self) -> Result<()> {
        let Some(target) = self.inner.current_target() else {
            return Err(DeviceError::MarkerNotRecorded(self.inner.label.clone()));
        };
        self.inner.wait_ticket(target);
        Ok(())
    }
}

impl fmt::Debug for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tickets = self.inner.lock();
        f.debug_struct("Marker")
            .field("label", &self.inner.label)
            .field("armed", &tickets.armed)
            .field("reached", &tickets.reached)
            .finish()
    }
}
