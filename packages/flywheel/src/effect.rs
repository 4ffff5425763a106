//! Side-effect trait, descriptors, and the context a running instance gets.
//!
//! A side effect is a unit of autonomous behavior: a [`Guard`] over the
//! state plus an async body that reads current state, consumes forwarded
//! actions, and emits [`ChangedState`] values into the engine.
//!
//! # Key Properties
//!
//! - **Descriptors are inert**: a [`SideEffectBuilder`] is configuration.
//!   Nothing runs until the guard first holds and the scheduler builds an
//!   instance from the factory, handing it the state snapshot of that
//!   moment.
//! - **Every emission is guarded**: changes leave an instance only through
//!   its [`ChangeSink`], which tags them with the instance's guard. The
//!   store loop re-checks that guard at apply time, so a change produced
//!   under an assumption the state no longer satisfies is discarded, not
//!   applied.
//! - **Cancellation is cooperative**: the body is raced against its
//!   cancellation token and dropped at the next suspension point.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::change::ChangedState;
use crate::guard::Guard;
use crate::machine::{Action, MachineState};

/// Shared read access to the machine's authoritative current state.
///
/// Side effects hold one of these instead of a state copy: guards and
/// handlers must see the freshest state, not the one from activation time.
pub struct StateHandle<S> {
    slot: Arc<RwLock<Arc<S>>>,
}

impl<S> Clone for StateHandle<S> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<S> StateHandle<S> {
    pub(crate) fn new(initial: Arc<S>) -> Self {
        Self {
            slot: Arc::new(RwLock::new(initial)),
        }
    }

    /// The current state.
    pub fn get(&self) -> Arc<S> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set(&self, next: Arc<S>) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

/// A state change queued for the store loop, tagged with the guard that was
/// valid when it was produced. The loop re-checks the guard at apply time.
pub(crate) struct GuardedChange<S> {
    pub(crate) guard: Guard<S>,
    pub(crate) change: ChangedState<S>,
}

/// Where a running side effect sends its state changes.
///
/// Cloneable; every change sent through the sink carries the instance's
/// guard for the apply-time re-check.
pub struct ChangeSink<S> {
    guard: Guard<S>,
    tx: mpsc::UnboundedSender<GuardedChange<S>>,
}

impl<S> Clone for ChangeSink<S> {
    fn clone(&self) -> Self {
        Self {
            guard: self.guard.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<S> ChangeSink<S> {
    pub(crate) fn new(guard: Guard<S>, tx: mpsc::UnboundedSender<GuardedChange<S>>) -> Self {
        Self { guard, tx }
    }

    /// Queue a state change for serialized application.
    ///
    /// Sending never blocks. If the store loop is gone the change is
    /// silently dropped; the side effect is about to be cancelled anyway.
    pub fn send(&self, change: ChangedState<S>) {
        let _ = self.tx.send(GuardedChange {
            guard: self.guard.clone(),
            change,
        });
    }
}

/// Everything a running side-effect instance needs: the forwarded action
/// stream, live state access, the change sink, and its cancellation tokens.
pub struct RunContext<S, A> {
    pub(crate) actions: mpsc::UnboundedReceiver<A>,
    pub(crate) state: StateHandle<S>,
    pub(crate) sink: ChangeSink<S>,
    pub(crate) cancellation: CancellationToken,
    pub(crate) shutdown: CancellationToken,
}

impl<S, A> RunContext<S, A> {
    pub(crate) fn new(
        actions: mpsc::UnboundedReceiver<A>,
        state: StateHandle<S>,
        sink: ChangeSink<S>,
        cancellation: CancellationToken,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            actions,
            state,
            sink,
            cancellation,
            shutdown,
        }
    }

    /// Receive the next forwarded action, or `None` when the instance is
    /// being torn down.
    pub async fn next_action(&mut self) -> Option<A> {
        self.actions.recv().await
    }

    /// The machine's current state (not the activation snapshot).
    pub fn current_state(&self) -> Arc<S> {
        self.state.get()
    }

    /// The sink for this instance's state changes.
    pub fn sink(&self) -> &ChangeSink<S> {
        &self.sink
    }

    /// This instance's cancellation token.
    ///
    /// Cancelled both when the guard stops holding and when the whole
    /// collection shuts down; use [`RunContext::is_shutdown`] to tell the
    /// two apart.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the cancellation originates from the machine or collection
    /// shutting down, as opposed to this side effect's guard flipping.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// An owned handle to the collection's shutdown token.
    ///
    /// Cancellation arrives by dropping the body at its next suspension
    /// point, so origin checks usually happen in drop guards; clone this
    /// token into them. The shutdown token is cancelled before instances
    /// are torn down, so at drop time it reliably distinguishes "the
    /// collection is shutting down" from "my guard flipped".
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Read the current state if `guard` still holds for it.
///
/// This is the narrowing step: a side effect that was triggered under some
/// state assumption re-validates it against live state and gets the
/// snapshot only on success.
pub(crate) fn narrow<S: 'static>(state: &StateHandle<S>, guard: &Guard<S>) -> Option<Arc<S>> {
    let current = state.get();
    guard.check(&current).then_some(current)
}

/// A running side effect.
///
/// Implementations are built by [`SideEffectBuilder`] factories; the
/// scheduler owns at most one running instance per descriptor and drives
/// its lifecycle from guard transitions.
#[async_trait]
pub trait SideEffect<S: MachineState, A: Action>: Send {
    /// The guard that keeps this instance alive.
    ///
    /// May be narrower than the descriptor's start guard (identity
    /// scoping); the scheduler uses it for cancel decisions, action
    /// forwarding, and apply-time re-checks.
    fn guard(&self) -> Guard<S>;

    /// Run the instance to completion or cancellation.
    async fn run(self: Box<Self>, ctx: RunContext<S, A>);
}

type EffectFactory<S, A> = Arc<dyn Fn(Arc<S>) -> Box<dyn SideEffect<S, A>> + Send + Sync>;

/// Descriptor for one side effect: a start guard plus an instance factory.
///
/// Descriptors are produced by the configuring layer and consumed by
/// [`StateMachine::new`](crate::StateMachine::new). Constructors for the
/// concrete kinds live on this type: [`on_enter`](SideEffectBuilder::on_enter),
/// [`on_action`](SideEffectBuilder::on_action),
/// [`collect_while`](SideEffectBuilder::collect_while), the `_effect`
/// variants, and the child-machine kinds.
pub struct SideEffectBuilder<S, A> {
    pub(crate) guard: Guard<S>,
    pub(crate) factory: EffectFactory<S, A>,
}

impl<S, A> Clone for SideEffectBuilder<S, A> {
    fn clone(&self) -> Self {
        Self {
            guard: self.guard.clone(),
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<S: MachineState, A: Action> SideEffectBuilder<S, A> {
    /// Create a descriptor from a guard and an instance factory.
    ///
    /// The factory receives the state snapshot taken at the moment the
    /// guard transitioned to true. Prefer the concrete-kind constructors;
    /// this is the escape hatch for custom side effects.
    pub fn new<F>(guard: Guard<S>, factory: F) -> Self
    where
        F: Fn(Arc<S>) -> Box<dyn SideEffect<S, A>> + Send + Sync + 'static,
    {
        Self {
            guard,
            factory: Arc::new(factory),
        }
    }

    pub(crate) fn start_guard(&self) -> &Guard<S> {
        &self.guard
    }

    pub(crate) fn build(&self, snapshot: Arc<S>) -> Box<dyn SideEffect<S, A>> {
        (self.factory)(snapshot)
    }
}

/// Handler signature shared by the triggered kinds: payload plus a state
/// snapshot in, one state change out. `anyhow::Error` is internal
/// transport; a failed handler terminates its side effect and is logged,
/// never surfaced to the machine's consumer.
pub(crate) type ChangeHandler<S, M> =
    Arc<dyn Fn(M, Arc<S>) -> BoxFuture<'static, anyhow::Result<ChangedState<S>>> + Send + Sync>;
