// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Table-driven finite state machine.
//!
//! Handlers are looked up by `(state, event)` and run synchronously while the
//! machine's lock is held. Observers see every committed change as
//! `(old, new)` in registration order, before the new state is visible to
//! [`Fsm::state`]. Calling back into the same machine from a handler or an
//! observer is reported as [`FsmError::Reentrant`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, ThreadId};
use thiserror::Error;

pub type Handler<S, C> = Box<dyn Fn(&C, &mut Transition<'_, S>) + Send + Sync>;
pub type Observer<S> = Box<dyn Fn(S, S) + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsmError {
    #[error("handler set twice for state({state}) event({event})")]
    DuplicateHandler { state: String, event: String },

    #[error("state machine re-entered from its own handler or observer")]
    Reentrant,
}

pub struct Fsm<S, E, C> {
    state: Mutex<S>,
    committed: RwLock<S>,
    owner: Mutex<Option<ThreadId>>,
    handlers: HashMap<(S, E), Handler<S, C>>,
    observers: RwLock<Vec<Observer<S>>>,
}

/// Write access to the state while the machine is locked.
pub struct Transition<'a, S> {
    state: &'a mut S,
    committed: &'a RwLock<S>,
    observers: &'a RwLock<Vec<Observer<S>>>,
}

impl<S: Copy> Transition<'_, S> {
    pub fn state(&self) -> S {
        *self.state
    }

    pub fn set(&mut self, new: S) {
        let old = *self.state;
        for observer in read(self.observers).iter() {
            observer(old, new);
        }
        *self.state = new;
        *write(self.committed) = new;
    }
}

impl<S, E, C> Fsm<S, E, C>
where
    S: Copy + Eq + Hash + Debug,
    E: Copy + Eq + Hash + Debug,
{
    pub fn new(initial: S) -> Self {
        Self {
            state: Mutex::new(initial),
            committed: RwLock::new(initial),
            owner: Mutex::new(None),
            handlers: HashMap::new(),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn add_handler<F>(&mut self, state: S, event: E, handler: F) -> Result<&mut Self, FsmError>
    where
        F: Fn(&C, &mut Transition<'_, S>) + Send + Sync + 'static,
    {
        if self.handlers.contains_key(&(state, event)) {
            return Err(FsmError::DuplicateHandler {
                state: format!("{state:?}"),
                event: format!("{event:?}"),
            });
        }
        self.handlers.insert((state, event), Box::new(handler));
        Ok(self)
    }

    pub fn add_observer<F>(&self, observer: F)
    where
        F: Fn(S, S) + Send + Sync + 'static,
    {
        write(&self.observers).push(Box::new(observer));
    }

    /// Last committed state. Does not wait for an in-flight transition.
    pub fn state(&self) -> S {
        *read(&self.committed)
    }

    pub fn has_handler(&self, state: S, event: E) -> bool {
        self.handlers.contains_key(&(state, event))
    }

    /// Run the handler for `(current, event)`. Events without a handler are
    /// ignored and the current state is returned unchanged.
    pub fn operate(&self, ctx: &C, event: E) -> Result<S, FsmError> {
        self.transition(|t| {
            if let Some(handler) = self.handlers.get(&(t.state(), event)) {
                handler(ctx, t);
            }
            t.state()
        })
    }

    pub fn set_state(&self, new: S) -> Result<(), FsmError> {
        self.transition(|t| t.set(new))
    }

    /// Lock the machine and hand `f` a [`Transition`].
    pub fn transition<R>(&self, f: impl FnOnce(&mut Transition<'_, S>) -> R) -> Result<R, FsmError> {
        let me = thread::current().id();
        if *lock(&self.owner) == Some(me) {
            return Err(FsmError::Reentrant);
        }
        let mut state = lock(&self.state);
        let _owner = OwnerGuard::acquire(&self.owner, me);
        let mut t = Transition {
            state: &mut *state,
            committed: &self.committed,
            observers: &self.observers,
        };
        Ok(f(&mut t))
    }
}

struct OwnerGuard<'a>(&'a Mutex<Option<ThreadId>>);

impl<'a> OwnerGuard<'a> {
    fn acquire(slot: &'a Mutex<Option<ThreadId>>, id: ThreadId) -> Self {
        *lock(slot) = Some(id);
        Self(slot)
    }
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        *lock(self.0) = None;
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
