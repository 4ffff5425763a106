//! Test utilities for asserting on state machines.
//!
//! Gated behind the `testing` feature (and available to this crate's own
//! tests). [`StateRecorder`] drains a [`StateStream`] in a background task
//! so tests can make await-style assertions instead of sleeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::machine::{MachineState, StateStream};

/// Collects every state emitted by a stream, in order.
///
/// Dropping the recorder aborts the collection, which also ends the
/// machine's subscription.
///
/// # Example
///
/// ```ignore
/// let recorder = StateRecorder::start(machine.state().unwrap());
/// machine.dispatch(Action::Start).unwrap();
/// recorder.wait_for(|s| matches!(s, State::Running)).await;
/// assert_eq!(recorder.states().len(), 2);
/// ```
pub struct StateRecorder<S> {
    states: Arc<Mutex<Vec<Arc<S>>>>,
    notify: Arc<Notify>,
    ended: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl<S: MachineState> StateRecorder<S> {
    /// Start recording from `stream` in a background task.
    pub fn start(mut stream: StateStream<S>) -> Self {
        let states: Arc<Mutex<Vec<Arc<S>>>> = Arc::new(Mutex::new(Vec::new()));
        let notify = Arc::new(Notify::new());
        let ended = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn({
            let states = Arc::clone(&states);
            let notify = Arc::clone(&notify);
            let ended = Arc::clone(&ended);
            async move {
                while let Some(state) = stream.recv().await {
                    states
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(state);
                    notify.notify_waiters();
                }
                ended.store(true, Ordering::Release);
                notify.notify_waiters();
            }
        });

        Self {
            states,
            notify,
            ended,
            task,
        }
    }

    /// Everything recorded so far, in emission order.
    pub fn states(&self) -> Vec<Arc<S>> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of states recorded so far.
    pub fn len(&self) -> usize {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the observed stream has ended.
    pub fn has_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Wait until at least `count` states have been recorded.
    ///
    /// Panics if the stream ends first: an ended stream can never reach
    /// the count, and hanging would hide the failure.
    pub async fn wait_for_count(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            if self.len() >= count {
                return;
            }
            assert!(
                !self.has_ended(),
                "state stream ended after {} states while waiting for {}",
                self.len(),
                count
            );
            notified.await;
        }
    }

    /// Wait until some recorded state satisfies `predicate` and return the
    /// first match.
    pub async fn wait_for<F>(&self, predicate: F) -> Arc<S>
    where
        F: Fn(&S) -> bool,
    {
        loop {
            let notified = self.notify.notified();
            if let Some(found) = self.states().iter().find(|s| predicate(s.as_ref())) {
                return Arc::clone(found);
            }
            assert!(
                !self.has_ended(),
                "state stream ended without a state matching the predicate"
            );
            notified.await;
        }
    }
}

impl<S> Drop for StateRecorder<S> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
