//! routers: interposers that see every event before any handler does.
//!
//! routers run in ascending `order` (ties resolve by connection order),
//! outside the iteration-repair stack: they are not handlers, a dispatch
//! that never gets past them pushes no frame at all. a router can wave the
//! event through, swallow it, or [`forward`](EventFrame::forward) it onto
//! another bus with a compatible interface.
//!
//! the chain itself is deliberately rigid: it cannot be modified while any
//! dispatch (even one still in its router phase) is in flight.

use std::sync::Arc;

use crate::{
    config::{AddrId, Config},
    data_ptr,
    dispatch::Target,
    error::BusError,
    lock::StateShell,
    policy::{AddressPolicy, WithId},
    Bus,
};

/// what a router decided about the event it was shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// let it continue to the remaining routers and then the handlers
    Continue,
    /// run the remaining routers, but never the handlers
    SkipListeners,
    /// drop the event now: no further routers, no handlers
    Stop,
}

/// an event interposer. connected with [`Bus::router_connect`].
pub trait Router<C: Config>: Send + Sync + 'static {
    fn route(&self, event: &mut EventFrame<'_, C>) -> Verdict;
}

pub(crate) struct RouterSlot<C: Config> {
    pub order: i32,
    pub seq: u64,
    pub router: Arc<dyn Router<C>>,
}

/// an in-flight event as a router sees it: where it was headed, how it got
/// here, and the call itself (invocable via the `forward` methods).
pub struct EventFrame<'a, C: Config> {
    id: Option<&'a AddrId<C>>,
    call: &'a mut dyn FnMut(&C::Interface),
    queued: bool,
    reverse: bool,
}

impl<'a, C: Config> EventFrame<'a, C> {
    pub(crate) fn new(
        id: Option<&'a AddrId<C>>,
        call: &'a mut dyn FnMut(&C::Interface),
        queued: bool,
        reverse: bool,
    ) -> Self {
        Self {
            id,
            call,
            queued,
            reverse,
        }
    }

    /// the address the event targets; `None` for a broadcast (or a cached
    /// target whose address is already gone).
    pub fn address(&self) -> Option<&AddrId<C>> {
        self.id
    }

    /// true when the event came out of the deferred queue.
    pub fn is_queued(&self) -> bool {
        self.queued
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    /// re-issue the event as a broadcast on `bus`. delivery mode (direction,
    /// queued-ness) carries over. `bus` may be the origin bus itself; the
    /// forwarded dispatch runs nested, through `bus`'s own router chain.
    pub fn forward<D>(&mut self, bus: &Bus<D>)
    where
        D: Config<Interface = C::Interface>,
    {
        let call = &mut self.call;
        bus.dispatch(Target::All, self.reverse, self.queued, |h| call(h));
    }

    /// re-issue the event at the same address on `bus` (which must share
    /// the id type). a broadcast falls back to [`forward`](Self::forward).
    pub fn forward_addressed<D>(&mut self, bus: &Bus<D>)
    where
        D: Config<Interface = C::Interface>,
        D::Addresses: WithId<D> + AddressPolicy<D, Id = AddrId<C>>,
    {
        match self.id {
            Some(id) => {
                let target = Target::Id(id.clone());
                let call = &mut self.call;
                bus.dispatch(target, self.reverse, self.queued, |h| call(h));
            }
            None => self.forward(bus),
        }
    }
}

impl<C: Config> Bus<C> {
    /// insert a router into the chain at `order` (lower runs earlier, ties
    /// run in connection order). fails with [`BusError::DispatchActive`] if
    /// any dispatch is in flight, or [`BusError::AlreadyConnected`] if this
    /// router instance is already in the chain.
    pub fn router_connect(&self, order: i32, router: Arc<dyn Router<C>>) -> Result<(), BusError> {
        let res = self.shared().state.with(|st| {
            if st.depth > 0 {
                return Err(BusError::DispatchActive);
            }
            let rp = data_ptr(Arc::as_ptr(&router));
            if st
                .routers
                .iter()
                .any(|s| data_ptr(Arc::as_ptr(&s.router)) == rp)
            {
                return Err(BusError::AlreadyConnected);
            }
            st.router_seq += 1;
            let seq = st.router_seq;
            let pos = st.routers.partition_point(|s| (s.order, s.seq) <= (order, seq));
            st.routers.insert(pos, RouterSlot { order, seq, router });
            Ok(())
        });
        if let Err(e) = res {
            warn!("router connect refused: {e}");
        }
        res
    }

    /// remove a router from the chain. same in-flight restriction as
    /// [`router_connect`](Bus::router_connect).
    pub fn router_disconnect(&self, router: &Arc<dyn Router<C>>) -> Result<(), BusError> {
        let rp = data_ptr(Arc::as_ptr(router));
        let res = self.shared().state.with(|st| {
            if st.depth > 0 {
                return Err(BusError::DispatchActive);
            }
            let pos = st
                .routers
                .iter()
                .position(|s| data_ptr(Arc::as_ptr(&s.router)) == rp)
                .ok_or(BusError::RouterNotConnected)?;
            st.routers.remove(pos);
            Ok(())
        });
        if let Err(e) = res {
            warn!("router disconnect refused: {e}");
        }
        res
    }

    pub fn router_count(&self) -> usize {
        self.shared().state.with(|st| st.routers.len())
    }
}
