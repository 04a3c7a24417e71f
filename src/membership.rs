//! connect / disconnect / bind: everything that changes who is listening.
//!
//! handlers are identified by the data address of their `Arc`, so the same
//! object can be connected at many addresses but only once per address.
//! every mutation repairs the in-flight dispatch cursors (see [`stack`]
//! (crate::stack)) before the handler list actually shifts.

use std::{
    cmp::Ordering,
    sync::{Arc, Weak},
};

use crate::{
    config::{AddrId, Config},
    container::{Ensured, Entry},
    data_ptr,
    dispatch::State,
    error::BusError,
    lock::StateShell,
    policy::{HandlerPolicy, SoleAddress, WithId},
    stack, Bus, Shared,
};

impl<C: Config> State<C> {
    /// drop an entry and fix every cursor that pointed at or past it.
    pub(crate) fn remove_entry(&mut self, slot: usize, idx: usize) {
        self.container.node_mut(slot).entries.remove(idx);
        stack::entry_removed(&mut self.frames, slot, idx);
    }

    /// erase the node if nothing keeps it alive (no entries, no pins).
    pub(crate) fn maybe_erase(&mut self, slot: usize) {
        let erase = {
            let n = self.container.node(slot);
            n.entries.is_empty() && n.pins == 0
        };
        if erase {
            let pos = self.container.remove(slot);
            stack::node_removed(&mut self.frames, pos);
        }
    }

    /// release one pin, erasing the node if it was the last thing holding
    /// an empty node in place.
    pub(crate) fn unpin(&mut self, slot: usize) {
        let n = self.container.node_mut(slot);
        debug_assert!(n.pins > 0);
        n.pins -= 1;
        self.maybe_erase(slot);
    }

    /// throw out entries whose handler was dropped without disconnecting.
    fn prune(&mut self, slot: usize) {
        let mut idx = 0;
        while idx < self.container.node(slot).entries.len() {
            if self.container.node(slot).entries[idx].handler.strong_count() == 0 {
                self.remove_entry(slot, idx);
            } else {
                idx += 1;
            }
        }
    }

    fn connect_at(&mut self, id: AddrId<C>, handler: &Arc<C::Interface>) -> Result<(), BusError> {
        let Ensured { slot, created_at } = self.container.ensure(id);
        if let Some(pos) = created_at {
            stack::node_inserted(&mut self.frames, pos);
        }
        self.prune(slot);
        let hp = data_ptr(Arc::as_ptr(handler));
        let pos = {
            let node = self.container.node(slot);
            if node
                .entries
                .iter()
                .any(|e| data_ptr(e.handler.as_ptr()) == hp)
            {
                return Err(BusError::AlreadyConnected);
            }
            if C::Handlers::SINGLE && !node.entries.is_empty() {
                return Err(BusError::AddressOccupied);
            }
            if C::Handlers::ORDERED {
                // stable: equal handlers keep connection order
                node.entries.partition_point(|e| match e.handler.upgrade() {
                    Some(existing) => {
                        C::Handlers::order(existing.as_ref(), handler.as_ref())
                            != Ordering::Greater
                    }
                    None => true,
                })
            } else {
                node.entries.len()
            }
        };
        let seq = self.container.next_seq();
        self.container.node_mut(slot).entries.insert(
            pos,
            Entry {
                handler: Arc::downgrade(handler),
                seq,
            },
        );
        stack::entry_inserted(&mut self.frames, slot, pos);
        Ok(())
    }

    fn disconnect_one(&mut self, slot: usize, hp: *const ()) -> Result<(), BusError> {
        let idx = self
            .container
            .node(slot)
            .entries
            .iter()
            .position(|e| data_ptr(e.handler.as_ptr()) == hp)
            .ok_or(BusError::NotConnected)?;
        self.remove_entry(slot, idx);
        self.maybe_erase(slot);
        Ok(())
    }

    /// remove every binding of the handler; returns the ids it was
    /// connected at.
    fn disconnect_everywhere(&mut self, hp: *const ()) -> Vec<AddrId<C>> {
        let slots: Vec<usize> = self.container.order.clone();
        let mut removed = Vec::new();
        for slot in slots {
            let id = self.container.node(slot).id.clone();
            if self.disconnect_one(slot, hp).is_ok() {
                removed.push(id);
            }
        }
        removed
    }
}

impl<C: Config> Bus<C> {
    pub(crate) fn connect_inner(
        &self,
        id: AddrId<C>,
        handler: &Arc<C::Interface>,
    ) -> Result<(), BusError> {
        let res = self
            .shared()
            .state
            .with(|st| st.connect_at(id.clone(), handler));
        match res {
            Ok(()) => {
                trace!(id = ?id, "handler connected");
                C::on_connect(self, handler, &id);
            }
            Err(e) => warn!(id = ?id, "connect refused: {e}"),
        }
        res
    }

    /// remove the handler from every address it is connected at.
    pub fn disconnect(&self, handler: &Arc<C::Interface>) -> Result<(), BusError> {
        let ids = self
            .shared()
            .state
            .with(|st| st.disconnect_everywhere(data_ptr(Arc::as_ptr(handler))));
        if ids.is_empty() {
            warn!("disconnect refused: {}", BusError::NotConnected);
            return Err(BusError::NotConnected);
        }
        self.purge_if_vacant();
        for id in &ids {
            C::on_disconnect(self, handler, id);
        }
        Ok(())
    }

    fn bind_inner(&self, id: AddrId<C>) -> NodeRef<C> {
        let (slot, gen) = self.shared().state.with(|st| {
            let Ensured { slot, created_at } = st.container.ensure(id);
            if let Some(pos) = created_at {
                stack::node_inserted(&mut st.frames, pos);
            }
            st.container.node_mut(slot).pins += 1;
            (slot, st.container.gen_of(slot))
        });
        NodeRef {
            shared: Arc::downgrade(self.shared()),
            slot,
            gen,
        }
    }
}

/// single-address conveniences.
impl<C: Config> Bus<C>
where
    C::Addresses: SoleAddress<C>,
{
    /// connect a handler to the bus's one implicit address.
    pub fn connect(&self, handler: &Arc<C::Interface>) -> Result<(), BusError> {
        self.connect_inner((), handler)
    }

    /// cache the implicit address for repeat fast-path dispatch.
    pub fn bind(&self) -> NodeRef<C> {
        self.bind_inner(())
    }
}

/// addressed membership.
impl<C: Config> Bus<C>
where
    C::Addresses: WithId<C>,
{
    /// connect a handler at `id`, creating the address on first use.
    pub fn connect_at(&self, id: AddrId<C>, handler: &Arc<C::Interface>) -> Result<(), BusError> {
        self.connect_inner(id, handler)
    }

    /// remove the handler's binding at `id` only.
    pub fn disconnect_from(
        &self,
        id: &AddrId<C>,
        handler: &Arc<C::Interface>,
    ) -> Result<(), BusError> {
        let res = self.shared().state.with(|st| {
            let slot = st.container.lookup(id).ok_or(BusError::NotConnected)?;
            st.disconnect_one(slot, data_ptr(Arc::as_ptr(handler)))
        });
        match res {
            Ok(()) => {
                self.purge_if_vacant();
                C::on_disconnect(self, handler, id);
            }
            Err(e) => warn!(id = ?id, "disconnect refused: {e}"),
        }
        res
    }

    /// cache the node for `id`, creating it if absent. the reference pins
    /// the node: it stays addressable (even with zero handlers) until the
    /// last `NodeRef` to it is dropped.
    pub fn bind_to(&self, id: AddrId<C>) -> NodeRef<C> {
        self.bind_inner(id)
    }
}

/// a cached address: dispatch through this skips the id lookup entirely.
/// holding one keeps the address node alive.
pub struct NodeRef<C: Config> {
    shared: Weak<Shared<C>>,
    slot: usize,
    gen: u32,
}

impl<C: Config> NodeRef<C> {
    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn gen(&self) -> u32 {
        self.gen
    }

    pub(crate) fn belongs_to(&self, bus: &Bus<C>) -> bool {
        self.shared.as_ptr() == Arc::as_ptr(bus.shared())
    }

    /// the id this reference is bound to, if the bus is still alive.
    pub fn address(&self) -> Option<AddrId<C>> {
        let shared = self.shared.upgrade()?;
        shared.state.with(|st| {
            st.container
                .live(self.slot, self.gen)
                .then(|| st.container.node(self.slot).id.clone())
        })
    }
}

impl<C: Config> Clone for NodeRef<C> {
    fn clone(&self) -> Self {
        if let Some(shared) = self.shared.upgrade() {
            shared.state.with(|st| {
                if st.container.live(self.slot, self.gen) {
                    st.container.node_mut(self.slot).pins += 1;
                }
            });
        }
        Self {
            shared: self.shared.clone(),
            slot: self.slot,
            gen: self.gen,
        }
    }
}

impl<C: Config> Drop for NodeRef<C> {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.state.with(|st| {
            if st.container.live(self.slot, self.gen) {
                st.unpin(self.slot);
            }
        });
        Bus::from_shared(shared).purge_if_vacant();
    }
}

impl<C: Config> std::fmt::Debug for NodeRef<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRef")
            .field("slot", &self.slot)
            .field("gen", &self.gen)
            .field("live", &self.address().is_some())
            .finish()
    }
}
