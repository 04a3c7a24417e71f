//! the deferred queue.
//!
//! queueing records a message; nothing is delivered until someone calls
//! [`Bus::execute_queued`], at which point each message runs as an ordinary
//! dispatch on the caller's stack. the queue sits behind its own lock
//! ([`Config::QueueLock`](crate::config::Config)) so handlers can queue
//! follow-up work from inside a delivery - those messages land *behind*
//! whatever is already pending and run when the drain loop reaches them.

use std::collections::VecDeque;

use crate::{
    config::{AddrId, Config, Queued},
    dispatch::Target,
    lock::{IntoCall, IntoTask, Lock, StateShell},
    membership::NodeRef,
    policy::WithId,
    Bus,
};

// the boxing bound follows the queue's lock policy: a thread-safe queue
// stores `+ Send` closures, a single-threaded one takes anything (so
// queued calls may capture `Rc` state).
type Call<C> = Box<<<C as Config>::QueueLock as Lock>::Call<<C as Config>::Interface>>;
type Task<C> = Box<<<C as Config>::QueueLock as Lock>::Task<Bus<C>>>;

/// one recorded message.
pub(crate) enum Deferred<C: Config> {
    Broadcast {
        call: Call<C>,
        reverse: bool,
    },
    Event {
        id: AddrId<C>,
        call: Call<C>,
        reverse: bool,
    },
    /// holds the `NodeRef`, so a queued message keeps its address alive
    /// until delivery (or until the queue is cleared)
    Cached {
        at: NodeRef<C>,
        call: Call<C>,
        reverse: bool,
    },
    Function(Task<C>),
}

pub(crate) struct QueueState<C: Config> {
    items: VecDeque<Deferred<C>>,
}

impl<C: Config> QueueState<C> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    fn push(&mut self, msg: Deferred<C>) {
        self.items.push_back(msg);
    }

    fn pop(&mut self) -> Option<Deferred<C>> {
        self.items.pop_front()
    }

    /// take everything at once. callers drop the result *outside* the queue
    /// lock: dropping a cached message re-enters the state lock.
    pub fn drain(&mut self) -> VecDeque<Deferred<C>> {
        std::mem::take(&mut self.items)
    }
}

/// the queueing surface; only exists when the config opts in with
/// [`Queued`].
impl<C: Queued> Bus<C> {
    fn push(&self, msg: Deferred<C>) {
        self.shared().queue.with(|q| q.push(msg));
    }

    /// record a broadcast for later delivery.
    pub fn queue_broadcast(&self, call: impl IntoCall<C::QueueLock, C::Interface>) {
        self.push(Deferred::Broadcast {
            call: call.into_call(),
            reverse: false,
        });
    }

    pub fn queue_broadcast_reverse(&self, call: impl IntoCall<C::QueueLock, C::Interface>) {
        self.push(Deferred::Broadcast {
            call: call.into_call(),
            reverse: true,
        });
    }

    /// record an addressed event for later delivery. the id is looked up at
    /// delivery time; if it no longer exists the message is quietly dropped.
    pub fn queue_event(&self, id: AddrId<C>, call: impl IntoCall<C::QueueLock, C::Interface>)
    where
        C::Addresses: WithId<C>,
    {
        self.push(Deferred::Event {
            id,
            call: call.into_call(),
            reverse: false,
        });
    }

    pub fn queue_event_reverse(&self, id: AddrId<C>, call: impl IntoCall<C::QueueLock, C::Interface>)
    where
        C::Addresses: WithId<C>,
    {
        self.push(Deferred::Event {
            id,
            call: call.into_call(),
            reverse: true,
        });
    }

    /// record an event at a cached address. the clone of `at` pins the node
    /// while the message waits.
    pub fn queue_event_cached(&self, at: &NodeRef<C>, call: impl IntoCall<C::QueueLock, C::Interface>) {
        if !at.belongs_to(self) {
            warn!("ignoring queued event: {}", crate::BusError::ForeignNodeRef);
            return;
        }
        self.push(Deferred::Cached {
            at: at.clone(),
            call: call.into_call(),
            reverse: false,
        });
    }

    /// record an arbitrary closure; it runs with the bus during the drain,
    /// in order with the queued events around it.
    pub fn queue_function(&self, f: impl IntoTask<C::QueueLock, Bus<C>>) {
        self.push(Deferred::Function(f.into_task()));
    }

    /// deliver every pending message, in queueing order, on this call stack.
    ///
    /// messages are popped one at a time with the queue unlocked in between,
    /// so anything queued *during* the drain (by a handler, or by a queued
    /// function) is also delivered before this returns. idempotent: an empty
    /// queue is a no-op.
    pub fn execute_queued(&self) {
        while let Some(msg) = self.shared().queue.with(|q| q.pop()) {
            self.run_deferred(msg);
        }
    }

    fn run_deferred(&self, msg: Deferred<C>) {
        match msg {
            Deferred::Broadcast { call, reverse } => {
                self.dispatch(Target::All, reverse, true, call);
            }
            Deferred::Event { id, call, reverse } => {
                self.dispatch(Target::Id(id), reverse, true, call);
            }
            Deferred::Cached { at, call, reverse } => {
                if let Some(target) = self.cached_target(&at) {
                    self.dispatch(target, reverse, true, call);
                }
            }
            Deferred::Function(f) => f(self),
        }
    }

    /// throw away everything pending without running it.
    pub fn clear_queued(&self) {
        let stale = self.shared().queue.with(|q| q.drain());
        if !stale.is_empty() {
            trace!("cleared {} deferred messages", stale.len());
        }
        drop(stale);
    }
}
