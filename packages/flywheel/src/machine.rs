//! The public state machine surface: construction, dispatch, observation.
//!
//! A [`StateMachine`] is inert until its state stream is collected.
//! Subscribing spawns the store loop, starts side effects whose guard
//! holds, and begins emitting states; dropping the stream tears the whole
//! collection down again. The machine retains its latest state across
//! subscriptions, so a new collection resumes where the previous one
//! stopped.
//!
//! # Contract
//!
//! - [`dispatch`](StateMachine::dispatch) requires an active collector;
//!   without one it fails fast with [`MachineError::NotCollected`] instead
//!   of buffering forever.
//! - At most one concurrent collector: the running-side-effect set is tied
//!   to a single subscription. A second concurrent
//!   [`state`](StateMachine::state) call fails with
//!   [`MachineError::AlreadyCollected`].

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::effect::{SideEffectBuilder, StateHandle};
use crate::error::MachineError;
use crate::store::StoreLoop;

/// Marker trait for state types. Blanket-implemented; states only need to
/// be debuggable and shareable across tasks.
pub trait MachineState: fmt::Debug + Send + Sync + 'static {}

impl<T: fmt::Debug + Send + Sync + 'static> MachineState for T {}

/// Marker trait for action types. Blanket-implemented; actions are cloned
/// once per side effect on forward.
pub trait Action: fmt::Debug + Clone + Send + 'static {}

impl<T: fmt::Debug + Clone + Send + 'static> Action for T {}

/// Observer channel capacity: slow collectors backpressure the loop
/// instead of dropping states.
const OBSERVER_CAPACITY: usize = 64;

struct Shared<S, A> {
    state: StateHandle<S>,
    collected: AtomicBool,
    actions_tx: RwLock<Option<mpsc::UnboundedSender<A>>>,
}

/// A reactive state machine: an immutable state evolved by guarded
/// asynchronous side effects and external actions.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use flywheel::{ChangedState, Guard, SideEffectBuilder, StateMachine};
///
/// #[derive(Debug, Clone, PartialEq)]
/// enum AppState {
///     Loading,
///     Ready,
/// }
///
/// #[derive(Debug, Clone)]
/// enum AppAction {
///     Refresh,
/// }
///
/// # async fn demo() {
/// let machine = StateMachine::new(
///     AppState::Loading,
///     vec![SideEffectBuilder::on_enter(
///         Guard::new(|s: &AppState| matches!(s, AppState::Loading)),
///         |_snapshot: Arc<AppState>| async move {
///             Ok(ChangedState::override_with(AppState::Ready))
///         },
///     )],
/// );
///
/// let mut states = machine.state().unwrap();
/// assert_eq!(*states.recv().await.unwrap(), AppState::Loading);
/// assert_eq!(*states.recv().await.unwrap(), AppState::Ready);
/// machine.dispatch(AppAction::Refresh).unwrap();
/// # }
/// ```
pub struct StateMachine<S: MachineState, A: Action> {
    shared: Arc<Shared<S, A>>,
    effects: Arc<[SideEffectBuilder<S, A>]>,
    shutdown: CancellationToken,
}

impl<S: MachineState, A: Action> StateMachine<S, A> {
    /// Create a machine from an initial state and its side-effect
    /// descriptors. Nothing runs until [`state`](StateMachine::state) is
    /// collected.
    pub fn new(initial: S, effects: Vec<SideEffectBuilder<S, A>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: StateHandle::new(Arc::new(initial)),
                collected: AtomicBool::new(false),
                actions_tx: RwLock::new(None),
            }),
            effects: effects.into(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Enqueue an external action.
    ///
    /// Fails fast with [`MachineError::NotCollected`] when nobody collects
    /// the state stream; the action would otherwise sit in a buffer
    /// forever.
    pub fn dispatch(&self, action: A) -> Result<(), MachineError> {
        let slot = self
            .shared
            .actions_tx
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(tx) => tx.send(action).map_err(|_| MachineError::NotCollected),
            None => Err(MachineError::NotCollected),
        }
    }

    /// Start collecting the state stream.
    ///
    /// Spawns the store loop on the current tokio runtime and returns a
    /// stream that begins with the machine's current state. Dropping the
    /// stream shuts the collection down (side effects are cancelled with
    /// shutdown origin); the machine can then be collected again and
    /// resumes from its retained state.
    pub fn state(&self) -> Result<StateStream<S>, MachineError> {
        if self
            .shared
            .collected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MachineError::AlreadyCollected);
        }

        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        *self
            .shared
            .actions_tx
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(actions_tx);

        let (states_tx, states_rx) = mpsc::channel(OBSERVER_CAPACITY);
        let store = StoreLoop::new(
            self.shared.state.clone(),
            &self.effects,
            actions_rx,
            states_tx,
            self.shutdown.child_token(),
        );
        tokio::spawn(store.run());

        let shared = Arc::clone(&self.shared);
        Ok(StateStream {
            rx: states_rx,
            on_drop: Some(Box::new(move || {
                *shared
                    .actions_tx
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = None;
                shared.collected.store(false, Ordering::Release);
            })),
        })
    }
}

impl<S: MachineState, A: Action> Drop for StateMachine<S, A> {
    fn drop(&mut self) {
        // Tear down any still-running collection with shutdown origin.
        self.shutdown.cancel();
    }
}

impl<S: MachineState, A: Action> fmt::Debug for StateMachine<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("side_effects", &self.effects.len())
            .field("collected", &self.shared.collected.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

/// The live stream of states emitted by a collected [`StateMachine`].
///
/// Starts with the current state at subscription time. Dropping it ends
/// the subscription.
pub struct StateStream<S> {
    rx: mpsc::Receiver<Arc<S>>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl<S> StateStream<S> {
    /// Receive the next state, or `None` once the machine is gone.
    pub async fn recv(&mut self) -> Option<Arc<S>> {
        self.rx.recv().await
    }
}

impl<S> Stream for StateStream<S> {
    type Item = Arc<S>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<S> Drop for StateStream<S> {
    fn drop(&mut self) {
        if let Some(release) = self.on_drop.take() {
            release();
        }
    }
}

impl<S> fmt::Debug for StateStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangedState;
    use crate::guard::Guard;
    use crate::policy::ExecutionPolicy;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum TestState {
        Start,
        Stepped(u32),
    }

    #[derive(Debug, Clone, PartialEq)]
    enum TestAction {
        Step(u32),
    }

    fn step_machine() -> StateMachine<TestState, TestAction> {
        StateMachine::new(
            TestState::Start,
            vec![SideEffectBuilder::on_action(
                Guard::new(|_: &TestState| true),
                ExecutionPolicy::Ordered,
                |action: TestAction| {
                    let TestAction::Step(n) = action;
                    Some(n)
                },
                |n: u32, _snapshot| async move { Ok(ChangedState::override_with(TestState::Stepped(n))) },
            )],
        )
    }

    #[tokio::test]
    async fn test_dispatch_without_collector_fails_fast() {
        let machine = step_machine();
        assert_eq!(
            machine.dispatch(TestAction::Step(1)),
            Err(MachineError::NotCollected)
        );
    }

    #[tokio::test]
    async fn test_collection_starts_with_current_state() {
        let machine = step_machine();
        let mut states = machine.state().unwrap();
        assert_eq!(*states.recv().await.unwrap(), TestState::Start);
    }

    #[tokio::test]
    async fn test_second_concurrent_collector_is_rejected() {
        let machine = step_machine();
        let _states = machine.state().unwrap();
        assert!(matches!(
            machine.state(),
            Err(MachineError::AlreadyCollected)
        ));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_side_effects() {
        let machine = step_machine();
        let mut states = machine.state().unwrap();
        assert_eq!(*states.recv().await.unwrap(), TestState::Start);

        machine.dispatch(TestAction::Step(7)).unwrap();
        assert_eq!(*states.recv().await.unwrap(), TestState::Stepped(7));
    }

    #[tokio::test]
    async fn test_resubscription_resumes_from_retained_state() {
        let machine = step_machine();

        {
            let mut states = machine.state().unwrap();
            assert_eq!(*states.recv().await.unwrap(), TestState::Start);
            machine.dispatch(TestAction::Step(3)).unwrap();
            assert_eq!(*states.recv().await.unwrap(), TestState::Stepped(3));
        }

        // Dropping the stream released the collection.
        assert_eq!(
            machine.dispatch(TestAction::Step(4)),
            Err(MachineError::NotCollected)
        );

        let mut states = machine.state().unwrap();
        assert_eq!(*states.recv().await.unwrap(), TestState::Stepped(3));
    }

    #[tokio::test]
    async fn test_stream_ends_when_machine_is_dropped() {
        let machine = step_machine();
        let mut states = machine.state().unwrap();
        assert_eq!(*states.recv().await.unwrap(), TestState::Start);

        drop(machine);
        let ended = tokio::time::timeout(Duration::from_secs(1), states.recv())
            .await
            .expect("stream should end promptly");
        assert!(ended.is_none());
    }
}
