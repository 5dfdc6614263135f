//! Single-slot callback registration.
//!
//! Each event holds at most one handler. `set` replaces whatever was there,
//! `clear` empties the slot, and `try_invoke` runs the current handler on
//! the calling thread. The handler is cloned out of the slot before it runs,
//! so a callback may re-register itself (or another) without deadlocking.

use std::fmt;
use std::sync::{Arc, RwLock};

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;

pub struct Event<E> {
    slot: RwLock<Option<Handler<E>>>,
}

impl<E> Default for Event<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Event<E> {
    pub const fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    /// Register `handler`, replacing any previous one.
    pub fn set<F>(&self, handler: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let handler: Handler<E> = Arc::new(handler);
        match self.slot.write() {
            Ok(mut slot) => *slot = Some(handler),
            Err(poisoned) => *poisoned.into_inner() = Some(handler),
        }
    }

    pub fn clear(&self) {
        match self.slot.write() {
            Ok(mut slot) => *slot = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    pub fn is_set(&self) -> bool {
        self.current().is_some()
    }

    /// Run the registered handler with `arg`. Returns `false` if the slot
    /// was empty.
    pub fn try_invoke(&self, arg: &E) -> bool {
        match self.current() {
            Some(handler) => {
                handler(arg);
                true
            }
            None => false,
        }
    }

    fn current(&self) -> Option<Handler<E>> {
        match self.slot.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl<E> fmt::Debug for Event<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("set", &self.is_set()).finish()
    }
}
