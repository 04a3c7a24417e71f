//! BusBar
//!
//! a synchronous, in-process dispatch bus: independent parts of a program
//! exchange notifications and requests through a shared [`Bus`] without
//! holding references to each other. where roundtable moves messages between
//! tasks, busbar runs every delivery on the caller's own call stack - no
//! tasks, no channels, no `.await`.
//!
//! a bus is described entirely at compile time by a [`Config`] impl: the
//! handler interface (usually a `dyn Trait`), how many addresses exist and
//! how they are ordered, how many handlers may sit at one address, and what
//! locking (if any) guards the whole thing. handlers are caller-owned
//! `Arc`s; the bus keeps only weak references and never outlives its users'
//! intent.
//!
//! the interesting part is reentrancy: handlers may connect, disconnect, and
//! dispatch *on the same bus, from inside a delivery*. every in-flight
//! dispatch keeps a repair-able cursor on a per-bus stack, and membership
//! changes fix those cursors up before touching the handler list. see
//! [`stack`] for the protocol.

#[macro_use]
extern crate tracing;

pub mod config;
mod container;
mod dispatch;
pub mod error;
pub mod lock;
mod membership;
pub mod policy;
mod queue;
pub mod router;
mod stack;
pub mod storage;

use std::{fmt, sync::Arc};

use crate::{
    config::{AddrId, Config},
    dispatch::State,
    lock::{Lock, StateShell},
    queue::QueueState,
};

pub use crate::{
    config::Queued,
    dispatch::ActiveDispatch,
    error::BusError,
    membership::NodeRef,
    router::{EventFrame, Router, Verdict},
};

/// one configured bus instance.
///
/// `Bus` is a cheap handle (clone freely); all clones share the same address
/// container, deferred queue, router chain, and dispatch stack. how the
/// instance behaves is fixed by the [`Config`] type parameter.
pub struct Bus<C: Config> {
    shared: Arc<Shared<C>>,
}

pub(crate) struct Shared<C: Config> {
    /// container + repair stack + router chain, under the dispatch lock
    pub(crate) state: <C::Lock as Lock>::Shell<State<C>>,
    /// deferred messages, under their own lock so queueing from inside a
    /// delivery never contends with the dispatch in progress
    pub(crate) queue: <C::QueueLock as Lock>::Shell<QueueState<C>>,
}

impl<C: Config> Bus<C> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: StateShell::new(State::new()),
                queue: StateShell::new(QueueState::new()),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<Shared<C>>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<C>> {
        &self.shared
    }

    /// number of live handler connections, across every address.
    pub fn handler_count(&self) -> usize {
        self.shared.state.with(|st| st.container.handler_count())
    }

    pub fn has_handlers(&self) -> bool {
        self.handler_count() != 0
    }

    /// clear the deferred queue if the heuristic is enabled and the last
    /// address is gone. called after anything that can empty the container.
    pub(crate) fn purge_if_vacant(&self) {
        if !C::PURGE_QUEUE_ON_LAST_DROP {
            return;
        }
        if self.shared.state.with(|st| st.container.is_empty()) {
            // drain first, drop after: dropping a deferred message can touch
            // the state lock again (cached refs unpin their node)
            let stale = self.shared.queue.with(|q| q.drain());
            if !stale.is_empty() {
                trace!("dropping {} deferred messages with the last address", stale.len());
            }
            drop(stale);
        }
    }
}

impl<C: Config> Clone for Bus<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Config> Default for Bus<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Config> fmt::Debug for Bus<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("config", &std::any::type_name::<C>())
            .field("handlers", &self.handler_count())
            .finish()
    }
}

/// compare two (possibly wide) pointers by data address only.
pub(crate) fn data_ptr<T: ?Sized>(ptr: *const T) -> *const () {
    ptr as *const ()
}

/// convenience alias: the address id type of a bus config.
pub type AddressOf<C> = AddrId<C>;
