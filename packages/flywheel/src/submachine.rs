//! Child state machines driven from a parent side effect.
//!
//! Two compositions:
//!
//! - **On-enter**: one child per activation. Built when the parent guard
//!   becomes true, torn down when it fails.
//! - **On-action**: one child per matching trigger action, keyed by the
//!   action value; a repeated key cancels and replaces the previous child.
//!   Non-trigger actions are mapped and forwarded to every live child.
//!
//! # Startup synchronization
//!
//! The child's dispatch contract fails fast while its state stream is not
//! collected, so forwarding an action too early would lose it. Every child
//! gets a [`StartupGate`]: the collector task releases it right after
//! subscribing, and forwarders await it before each dispatch. The gate is
//! one-shot: once the subscription is live it never blocks again.
//!
//! Child state emissions map through an async handler into parent
//! [`ChangedState`]s, under the parent guard's apply-time re-check like
//! any other emission.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, trace, warn};

use crate::change::ChangedState;
use crate::effect::{narrow, ChangeSink, RunContext, SideEffect, SideEffectBuilder, StateHandle};
use crate::gate::StartupGate;
use crate::guard::Guard;
use crate::machine::{Action, MachineState, StateMachine};

type ChildFactory<S, CS, CA> = Arc<dyn Fn(Arc<S>) -> StateMachine<CS, CA> + Send + Sync>;
type KeyedChildFactory<S, A, CS, CA> =
    Arc<dyn Fn(A, Arc<S>) -> StateMachine<CS, CA> + Send + Sync>;
type ActionForwarder<A, CA> = Arc<dyn Fn(A) -> Option<CA> + Send + Sync>;
type ChildStateHandler<S, CS> =
    Arc<dyn Fn(Arc<S>, Arc<CS>) -> BoxFuture<'static, anyhow::Result<ChangedState<S>>> + Send + Sync>;

struct OnEnterMachine<S, A, CS: MachineState, CA: Action> {
    guard: Guard<S>,
    snapshot: Arc<S>,
    factory: ChildFactory<S, CS, CA>,
    forwarder: ActionForwarder<A, CA>,
    handler: ChildStateHandler<S, CS>,
}

#[async_trait]
impl<S, A, CS, CA> SideEffect<S, A> for OnEnterMachine<S, A, CS, CA>
where
    S: MachineState,
    A: Action,
    CS: MachineState,
    CA: Action,
{
    fn guard(&self) -> Guard<S> {
        self.guard.clone()
    }

    async fn run(self: Box<Self>, ctx: RunContext<S, A>) {
        let OnEnterMachine {
            guard,
            snapshot,
            factory,
            forwarder,
            handler,
        } = *self;
        let RunContext {
            mut actions,
            state,
            sink,
            ..
        } = ctx;

        debug!("starting child state machine");
        let child = Arc::new(factory(snapshot));
        let gate = Arc::new(StartupGate::new());

        let collect = {
            let child = Arc::clone(&child);
            let gate = Arc::clone(&gate);
            collect_child(child, gate, state, guard, sink, handler)
        };

        let forward = async move {
            while let Some(action) = actions.recv().await {
                if let Some(child_action) = forwarder(action) {
                    gate.released().await;
                    trace!(action = ?child_action, "forwarding action to child state machine");
                    if let Err(err) = child.dispatch(child_action) {
                        warn!(error = %err, "dropping action for child state machine");
                    }
                }
            }
        };

        tokio::join!(collect, forward);
    }
}

/// Subscribe to a child machine, release its gate, and map every child
/// state into a parent change while the parent guard holds.
async fn collect_child<S, CS, CA>(
    child: Arc<StateMachine<CS, CA>>,
    gate: Arc<StartupGate>,
    state: StateHandle<S>,
    guard: Guard<S>,
    sink: ChangeSink<S>,
    handler: ChildStateHandler<S, CS>,
) where
    S: MachineState,
    CS: MachineState,
    CA: Action,
{
    let mut child_states = match child.state() {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "cannot observe child state machine");
            return;
        }
    };
    gate.release();

    while let Some(child_state) = child_states.recv().await {
        let Some(parent) = narrow(&state, &guard) else {
            continue;
        };
        trace!(state = ?child_state, "child state machine emitted");
        match handler(parent, child_state).await {
            Ok(change) => sink.send(change),
            Err(err) => {
                error!(error = %err, "child state handler failed");
                return;
            }
        }
    }
}

struct OnActionMachine<S, A, CS: MachineState, CA: Action> {
    guard: Guard<S>,
    trigger: Arc<dyn Fn(&A) -> bool + Send + Sync>,
    factory: KeyedChildFactory<S, A, CS, CA>,
    forwarder: ActionForwarder<A, CA>,
    handler: ChildStateHandler<S, CS>,
}

struct ChildEntry<A, CS: MachineState, CA: Action> {
    key: A,
    child: Arc<StateMachine<CS, CA>>,
    gate: Arc<StartupGate>,
    collector: AbortHandle,
}

#[async_trait]
impl<S, A, CS, CA> SideEffect<S, A> for OnActionMachine<S, A, CS, CA>
where
    S: MachineState,
    A: Action + PartialEq,
    CS: MachineState,
    CA: Action,
{
    fn guard(&self) -> Guard<S> {
        self.guard.clone()
    }

    async fn run(self: Box<Self>, ctx: RunContext<S, A>) {
        let OnActionMachine {
            guard,
            trigger,
            factory,
            forwarder,
            handler,
        } = *self;
        let RunContext {
            mut actions,
            state,
            sink,
            ..
        } = ctx;

        let mut children: Vec<ChildEntry<A, CS, CA>> = Vec::new();
        // Owns collector and forward tasks; dropped on cancellation, which
        // aborts them and releases the child machines.
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                maybe = actions.recv() => match maybe {
                    Some(action) => {
                        let Some(current) = narrow(&state, &guard) else {
                            continue;
                        };
                        children.retain(|entry| !entry.collector.is_finished());

                        if trigger(&action) {
                            if let Some(index) =
                                children.iter().position(|entry| entry.key == action)
                            {
                                debug!("replacing child state machine for repeated trigger");
                                let previous = children.remove(index);
                                previous.collector.abort();
                            }

                            debug!(action = ?action, "starting child state machine");
                            let child = Arc::new(factory(action.clone(), current));
                            let gate = Arc::new(StartupGate::new());
                            let collector = tasks.spawn(collect_child(
                                Arc::clone(&child),
                                Arc::clone(&gate),
                                state.clone(),
                                guard.clone(),
                                sink.clone(),
                                handler.clone(),
                            ));
                            children.push(ChildEntry {
                                key: action,
                                child,
                                gate,
                                collector,
                            });
                        } else {
                            for entry in &children {
                                if let Some(child_action) = forwarder(action.clone()) {
                                    let child = Arc::clone(&entry.child);
                                    let gate = Arc::clone(&entry.gate);
                                    tasks.spawn(async move {
                                        gate.released().await;
                                        if let Err(err) = child.dispatch(child_action) {
                                            warn!(
                                                error = %err,
                                                "dropping action for child state machine"
                                            );
                                        }
                                    });
                                }
                            }
                        }
                    }
                    None => break,
                },
                Some(outcome) = tasks.join_next(), if !tasks.is_empty() => {
                    match outcome {
                        Ok(()) => {}
                        Err(err) if err.is_cancelled() => {
                            trace!("child task cancelled");
                        }
                        Err(err) => error!(error = %err, "child task panicked"),
                    }
                }
            }
        }
    }
}

impl<S: MachineState, A: Action> SideEffectBuilder<S, A> {
    /// Run a child state machine for the lifetime of each activation.
    ///
    /// `factory` builds the child from the parent's start snapshot.
    /// Actions are mapped through `forwarder` (return `None` to keep an
    /// action parent-only) and never reach the child before its state
    /// stream is collected. Every child state runs through `handler` to
    /// produce a parent change.
    pub fn on_enter_start_machine<CS, CA, Fac, Fwd, H, Fut>(
        guard: Guard<S>,
        factory: Fac,
        forwarder: Fwd,
        handler: H,
    ) -> Self
    where
        CS: MachineState,
        CA: Action,
        Fac: Fn(Arc<S>) -> StateMachine<CS, CA> + Send + Sync + 'static,
        Fwd: Fn(A) -> Option<CA> + Send + Sync + 'static,
        H: Fn(Arc<S>, Arc<CS>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ChangedState<S>>> + Send + 'static,
    {
        let factory: ChildFactory<S, CS, CA> = Arc::new(factory);
        let forwarder: ActionForwarder<A, CA> = Arc::new(forwarder);
        let handler: ChildStateHandler<S, CS> =
            Arc::new(move |parent, child| handler(parent, child).boxed());
        let instance_guard = guard.clone();
        SideEffectBuilder::new(guard, move |snapshot| {
            Box::new(OnEnterMachine {
                guard: instance_guard.clone(),
                snapshot,
                factory: factory.clone(),
                forwarder: forwarder.clone(),
                handler: handler.clone(),
            }) as Box<dyn SideEffect<S, A>>
        })
    }

    /// Run a child state machine per matching trigger action.
    ///
    /// Children are keyed by the triggering action value; a repeated
    /// trigger with an equal action cancels the previous child and starts
    /// a fresh one. Non-trigger actions are mapped through `forwarder` and
    /// forwarded to every live child, gated on each child's subscription
    /// being live.
    pub fn on_action_start_machine<CS, CA, Trig, Fac, Fwd, H, Fut>(
        guard: Guard<S>,
        trigger: Trig,
        factory: Fac,
        forwarder: Fwd,
        handler: H,
    ) -> Self
    where
        A: PartialEq,
        CS: MachineState,
        CA: Action,
        Trig: Fn(&A) -> bool + Send + Sync + 'static,
        Fac: Fn(A, Arc<S>) -> StateMachine<CS, CA> + Send + Sync + 'static,
        Fwd: Fn(A) -> Option<CA> + Send + Sync + 'static,
        H: Fn(Arc<S>, Arc<CS>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ChangedState<S>>> + Send + 'static,
    {
        let trigger: Arc<dyn Fn(&A) -> bool + Send + Sync> = Arc::new(trigger);
        let factory: KeyedChildFactory<S, A, CS, CA> = Arc::new(factory);
        let forwarder: ActionForwarder<A, CA> = Arc::new(forwarder);
        let handler: ChildStateHandler<S, CS> =
            Arc::new(move |parent, child| handler(parent, child).boxed());
        let instance_guard = guard.clone();
        SideEffectBuilder::new(guard, move |_snapshot| {
            Box::new(OnActionMachine {
                guard: instance_guard.clone(),
                trigger: trigger.clone(),
                factory: factory.clone(),
                forwarder: forwarder.clone(),
                handler: handler.clone(),
            }) as Box<dyn SideEffect<S, A>>
        })
    }
}
