//! Append-only process state log for test observability.
//!
//! Lets tests assert on internal transitions (deadlock detection, table
//! creation, shutdown) without scraping log output. Strictly a no-op
//! outside test mode so the event list never grows in production.

use chrono::{DateTime, Utc};
use std::sync::{Mutex, PoisonError};

/// Internal states worth observing from tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    CreatingNewTable,
    DeadlockFound,
    ShuttingDown,
    InitFailure,
}

/// One recorded transition.
#[derive(Debug, Clone)]
pub struct ProcessStateEvent {
    pub state: ProcessState,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Ordered event log, active only under test instrumentation.
pub struct ProcessStateRecorder {
    enabled: bool,
    events: Mutex<Vec<ProcessStateEvent>>,
}

impl ProcessStateRecorder {
    pub fn new(test_mode: bool) -> Self {
        Self {
            enabled: test_mode,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Append an event. No-op when not in test mode.
    pub fn record(&self, state: ProcessState, error: Option<String>) {
        if !self.enabled {
            return;
        }
        tracing::debug!(?state, error = error.as_deref(), "process state recorded");
        self.lock().push(ProcessStateEvent {
            state,
            error,
            at: Utc::now(),
        });
    }

    /// Most recent event with the given state, if any.
    pub fn last_event_of(&self, state: ProcessState) -> Option<ProcessStateEvent> {
        self.lock().iter().rev().find(|e| e.state == state).cloned()
    }

    /// Number of recorded events with the given state.
    pub fn count_of(&self, state: ProcessState) -> usize {
        self.lock().iter().filter(|e| e.state == state).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ProcessStateEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
