//! the address container: a slab of address nodes plus the id index and the
//! broadcast visiting order.
//!
//! nodes are referred to by `(slot, gen)` pairs. erasing a node bumps the
//! slot's generation, so a stale handle can never resolve to a reused slot.
//! a node stays in the container exactly while it is useful: it has live
//! handler entries, or something is pinning it (a cached [`NodeRef`]
//! (crate::NodeRef), or a dispatch currently iterating it).

use std::{cmp::Ordering, collections::HashMap, sync::Weak};

use crate::{
    config::{AddrId, Config},
    policy::AddressPolicy,
};

/// one connected handler at one address. `seq` is the global connection
/// sequence number; a dispatch only visits entries whose seq is at or below
/// the value the sequence had when the dispatch began.
pub(crate) struct Entry<C: Config> {
    pub handler: Weak<C::Interface>,
    pub seq: u64,
}

/// one mailbox: the handlers connected at a single address.
pub(crate) struct Node<C: Config> {
    pub id: AddrId<C>,
    /// creation sequence number, same gating rule as entries
    pub seq: u64,
    /// outstanding pins: cached refs + dispatches currently iterating here.
    /// a node is erased only when it has no entries and no pins.
    pub pins: usize,
    pub entries: Vec<Entry<C>>,
}

pub(crate) struct Slot<C: Config> {
    pub gen: u32,
    pub node: Option<Node<C>>,
}

pub(crate) struct Container<C: Config> {
    slots: Vec<Slot<C>>,
    free: Vec<usize>,
    by_id: HashMap<AddrId<C>, usize>,
    /// live slots in broadcast visiting order (creation order, or sorted by
    /// the address policy's comparator)
    pub order: Vec<usize>,
    seq: u64,
}

/// result of [`Container::ensure`].
pub(crate) struct Ensured {
    pub slot: usize,
    /// position in `order` where a fresh node was inserted (None if the
    /// address already existed). the caller must repair broadcast cursors.
    pub created_at: Option<usize>,
}

impl<C: Config> Container<C> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_id: HashMap::new(),
            order: Vec::new(),
            seq: 0,
        }
    }

    /// hand out the next connection sequence number.
    pub fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// the sequence value as of now; entries stamped later compare greater.
    pub fn seq_snapshot(&self) -> u64 {
        self.seq
    }

    pub fn lookup(&self, id: &AddrId<C>) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// does `(slot, gen)` still name a live node?
    pub fn live(&self, slot: usize, gen: u32) -> bool {
        self.slots
            .get(slot)
            .is_some_and(|s| s.gen == gen && s.node.is_some())
    }

    pub fn gen_of(&self, slot: usize) -> u32 {
        self.slots[slot].gen
    }

    pub fn node(&self, slot: usize) -> &Node<C> {
        self.slots[slot].node.as_ref().expect("slot names a live node")
    }

    pub fn node_mut(&mut self, slot: usize) -> &mut Node<C> {
        self.slots[slot].node.as_mut().expect("slot names a live node")
    }

    pub fn handler_count(&self) -> usize {
        self.order
            .iter()
            .map(|&s| {
                self.node(s)
                    .entries
                    .iter()
                    .filter(|e| e.handler.strong_count() != 0)
                    .count()
            })
            .sum()
    }

    /// find-or-create the node for `id`.
    pub fn ensure(&mut self, id: AddrId<C>) -> Ensured {
        if let Some(slot) = self.lookup(&id) {
            return Ensured {
                slot,
                created_at: None,
            };
        }
        let seq = self.next_seq();
        let node = Node {
            id: id.clone(),
            seq,
            pins: 0,
            entries: Vec::new(),
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot].node = Some(node);
                slot
            }
            None => {
                self.slots.push(Slot { gen: 0, node: Some(node) });
                self.slots.len() - 1
            }
        };
        let pos = if C::Addresses::ORDERED {
            let slots = &self.slots;
            self.order.partition_point(|&s| {
                let there = &slots[s].node.as_ref().expect("order names live nodes").id;
                C::Addresses::order(there, &id) != Ordering::Greater
            })
        } else {
            self.order.len()
        };
        self.order.insert(pos, slot);
        self.by_id.insert(id, slot);
        Ensured {
            slot,
            created_at: Some(pos),
        }
    }

    /// erase the node at `slot`. caller guarantees it is live, entry-less
    /// and unpinned. returns the position it held in `order` so cursors can
    /// be repaired.
    pub fn remove(&mut self, slot: usize) -> usize {
        let node = self.slots[slot].node.take().expect("removing a live node");
        debug_assert!(node.entries.is_empty() && node.pins == 0);
        self.by_id.remove(&node.id);
        self.slots[slot].gen = self.slots[slot].gen.wrapping_add(1);
        self.free.push(slot);
        let pos = self
            .order
            .iter()
            .position(|&s| s == slot)
            .expect("live node is in the visiting order");
        self.order.remove(pos);
        pos
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{lock, policy};

    struct Plain;
    impl Config for Plain {
        type Interface = dyn Fn() + Send + Sync;
        type Addresses = policy::ById<u32>;
        type Handlers = policy::ManyHandlers;
        type Lock = lock::SingleThread;
        type QueueLock = lock::SingleThread;
    }

    struct Sorted;
    impl Config for Sorted {
        type Interface = dyn Fn() + Send + Sync;
        type Addresses = policy::ByIdOrdered<u32>;
        type Handlers = policy::ManyHandlers;
        type Lock = lock::SingleThread;
        type QueueLock = lock::SingleThread;
    }

    fn entry<C: Config<Interface = dyn Fn() + Send + Sync>>(
        c: &mut Container<C>,
        keep: &mut Vec<Arc<dyn Fn() + Send + Sync>>,
    ) -> Entry<C> {
        let h: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});
        keep.push(h.clone());
        let seq = c.next_seq();
        Entry {
            handler: Arc::downgrade(&h),
            seq,
        }
    }

    #[test]
    fn ensure_is_idempotent() {
        let mut c = Container::<Plain>::new();
        let a = c.ensure(7);
        assert!(a.created_at.is_some());
        let b = c.ensure(7);
        assert_eq!(a.slot, b.slot);
        assert!(b.created_at.is_none());
        assert_eq!(c.order.len(), 1);
    }

    #[test]
    fn creation_order_visiting() {
        let mut c = Container::<Plain>::new();
        let s9 = c.ensure(9).slot;
        let s1 = c.ensure(1).slot;
        let s5 = c.ensure(5).slot;
        assert_eq!(c.order, vec![s9, s1, s5]);
    }

    #[test]
    fn sorted_visiting_order() {
        let mut c = Container::<Sorted>::new();
        let s9 = c.ensure(9).slot;
        let s1 = c.ensure(1).slot;
        let s5 = c.ensure(5).slot;
        assert_eq!(c.order, vec![s1, s5, s9]);
        // ids resolve regardless of order position
        assert_eq!(c.lookup(&9), Some(s9));
    }

    #[test]
    fn remove_invalidates_generation() {
        let mut c = Container::<Plain>::new();
        let slot = c.ensure(3).slot;
        let gen = c.gen_of(slot);
        assert!(c.live(slot, gen));
        c.remove(slot);
        assert!(!c.live(slot, gen));
        assert_eq!(c.lookup(&3), None);
        // slot is reused with a fresh generation
        let again = c.ensure(4).slot;
        assert_eq!(again, slot);
        assert!(!c.live(slot, gen));
        assert!(c.live(slot, c.gen_of(slot)));
    }

    #[test]
    fn handler_count_skips_dead_weaks() {
        let mut keep = Vec::new();
        let mut c = Container::<Plain>::new();
        let slot = c.ensure(1).slot;
        let e1 = entry(&mut c, &mut keep);
        let e2 = entry(&mut c, &mut keep);
        c.node_mut(slot).entries.push(e1);
        c.node_mut(slot).entries.push(e2);
        assert_eq!(c.handler_count(), 2);
        keep.pop();
        assert_eq!(c.handler_count(), 1);
    }
}
