//! the dispatch engine.
//!
//! a dispatch resolves its target (everything / one id / one cached node),
//! offers the event to the router chain, then pushes a [`Frame`] and walks
//! handlers one step at a time. the bus lock is taken per *step*, never
//! across a handler invocation: while user code runs, the bus is fully
//! unlocked, so handlers are free to connect, disconnect, queue, and even
//! dispatch again on the same bus - and on a thread-safe bus, other
//! threads' dispatches make progress in between. each dispatch steps the
//! frame named by its own token, so concurrent frames never cross.
//!
//! visibility rule: a dispatch invokes exactly the handlers that were
//! connected when it began, minus any that disconnect (or are dropped)
//! before their turn. connections made mid-dispatch are stamped with a
//! later sequence number and skipped.

use std::{sync::Arc, thread};

use crate::{
    config::{AddrId, Config},
    container::Container,
    lock::StateShell,
    router::{RouterSlot, Verdict},
    stack::Frame,
    Bus, EventFrame, NodeRef,
};

/// everything guarded by the dispatch lock.
pub(crate) struct State<C: Config> {
    pub container: Container<C>,
    /// the iteration-repair frames, in begin order
    pub frames: Vec<Frame<C>>,
    pub frame_seq: u64,
    pub routers: Vec<RouterSlot<C>>,
    pub router_seq: u64,
    /// dispatches in flight, *including* their router phase. guards the
    /// router-chain mutation precondition.
    pub depth: usize,
}

impl<C: Config> State<C> {
    pub fn new() -> Self {
        Self {
            container: Container::new(),
            frames: Vec::new(),
            frame_seq: 0,
            routers: Vec::new(),
            router_seq: 0,
            depth: 0,
        }
    }
}

/// what a dispatch is aimed at.
pub(crate) enum Target<C: Config> {
    All,
    Id(AddrId<C>),
    Cached { slot: usize, gen: u32 },
}

/// one engine step: either a handler to invoke (lock released), or done.
enum Step<C: Config> {
    Call(Arc<C::Interface>),
    Done,
}

impl<C: Config> State<C> {
    /// resolve the target and push a frame for it, returning the frame's
    /// token. `None` means the target does not exist (addressed dispatch
    /// to an absent id) - not an error.
    fn begin(&mut self, target: &Target<C>, reverse: bool, queued: bool) -> Option<u64> {
        let seq_limit = self.container.seq_snapshot();
        self.frame_seq += 1;
        let token = self.frame_seq;
        let owner = thread::current().id();
        let frame = match target {
            Target::All => Frame {
                token,
                owner,
                node: None,
                cursor: 0,
                addr_cursor: Frame::<C>::start_cursor(reverse, self.container.order.len()),
                broadcast: true,
                reverse,
                queued,
                seq_limit,
                current_id: None,
            },
            Target::Id(id) => match self.container.lookup(id) {
                Some(slot) => self.node_frame(token, owner, slot, reverse, queued, seq_limit),
                None => return None,
            },
            Target::Cached { slot, gen } => {
                if !self.container.live(*slot, *gen) {
                    return None;
                }
                self.node_frame(token, owner, *slot, reverse, queued, seq_limit)
            }
        };
        self.frames.push(frame);
        Some(token)
    }

    fn node_frame(
        &mut self,
        token: u64,
        owner: thread::ThreadId,
        slot: usize,
        reverse: bool,
        queued: bool,
        seq_limit: u64,
    ) -> Frame<C> {
        let node = self.container.node_mut(slot);
        node.pins += 1;
        Frame {
            token,
            owner,
            node: Some(slot),
            cursor: Frame::<C>::start_cursor(reverse, node.entries.len()),
            addr_cursor: 0,
            broadcast: false,
            reverse,
            queued,
            seq_limit,
            current_id: Some(node.id.clone()),
        }
    }

    fn frame_ix(&self, token: u64) -> usize {
        self.frames
            .iter()
            .position(|f| f.token == token)
            .expect("dispatch frame stays until its guard finishes it")
    }

    /// advance the frame named by `token` to its next live, visible
    /// handler. frames are never added or removed while the lock is held
    /// here, so the index stays valid for the whole step.
    fn step(&mut self, token: u64) -> Step<C> {
        let fi = self.frame_ix(token);
        loop {
            let (node, broadcast) = {
                let top = &self.frames[fi];
                (top.node, top.broadcast)
            };
            match node {
                Some(slot) => {
                    let len = self.container.node(slot).entries.len();
                    let top = &mut self.frames[fi];
                    let Some(idx) = top.peek(len) else {
                        // node exhausted
                        top.node = None;
                        self.unpin(slot);
                        if !broadcast {
                            return Step::Done;
                        }
                        continue;
                    };
                    let entry = &self.container.node(slot).entries[idx];
                    let seq = entry.seq;
                    let upgraded = entry.handler.upgrade();
                    let top = &mut self.frames[fi];
                    if seq > top.seq_limit {
                        // connected after this dispatch began
                        top.advance();
                        continue;
                    }
                    match upgraded {
                        Some(handler) => {
                            // advance *before* the call, so a handler that
                            // disconnects itself leaves a valid cursor
                            top.advance();
                            return Step::Call(handler);
                        }
                        None => {
                            // owner dropped the handler without
                            // disconnecting; prune in place (repairs every
                            // frame, including this one)
                            self.remove_entry(slot, idx);
                            continue;
                        }
                    }
                }
                None if broadcast => {
                    let order_len = self.container.order.len();
                    let top = &mut self.frames[fi];
                    let Some(pos) = top.peek_addr(order_len) else {
                        return Step::Done;
                    };
                    let slot = self.container.order[pos];
                    let node_seq = self.container.node(slot).seq;
                    let top = &mut self.frames[fi];
                    top.advance_addr();
                    if node_seq > top.seq_limit {
                        continue;
                    }
                    // enter the node, pinning it for the duration
                    let (len, id) = {
                        let n = self.container.node_mut(slot);
                        n.pins += 1;
                        (n.entries.len(), n.id.clone())
                    };
                    let top = &mut self.frames[fi];
                    top.node = Some(slot);
                    top.cursor = Frame::<C>::start_cursor(top.reverse, len);
                    top.current_id = Some(id);
                }
                None => return Step::Done,
            }
        }
    }

    /// retire the frame named by `token`. if the dispatch unwound
    /// mid-call the frame is still parked on a node; release that pin too.
    fn finish(&mut self, token: u64) {
        let fi = self.frame_ix(token);
        let frame = self.frames.remove(fi);
        if let Some(slot) = frame.node {
            self.unpin(slot);
        }
    }
}

/// keeps `State::depth` honest across early returns.
struct DepthGuard<'a, C: Config>(&'a Bus<C>);

impl<'a, C: Config> DepthGuard<'a, C> {
    fn enter(bus: &'a Bus<C>) -> Self {
        bus.shared().state.with(|st| st.depth += 1);
        Self(bus)
    }
}

impl<C: Config> Drop for DepthGuard<'_, C> {
    fn drop(&mut self) {
        self.0.shared().state.with(|st| st.depth -= 1);
    }
}

/// pairs every `begin` with a `finish`, even when a handler panics: an
/// unwind must not leave a phantom frame (or a leaked node pin) behind.
struct FrameGuard<'a, C: Config> {
    bus: &'a Bus<C>,
    token: u64,
}

impl<C: Config> Drop for FrameGuard<'_, C> {
    fn drop(&mut self) {
        self.bus.shared().state.with(|st| st.finish(self.token));
    }
}

impl<C: Config> Bus<C> {
    /// the one true dispatch path; everything public funnels through here.
    pub(crate) fn dispatch<R>(
        &self,
        target: Target<C>,
        reverse: bool,
        queued: bool,
        mut f: impl FnMut(&C::Interface) -> R,
    ) -> Option<R> {
        let _depth = DepthGuard::enter(self);

        let routers: Vec<_> = self
            .shared()
            .state
            .with(|st| st.routers.iter().map(|r| r.router.clone()).collect());
        if !routers.is_empty() {
            let frame_id: Option<AddrId<C>> = match &target {
                Target::All => None,
                Target::Id(id) => Some(id.clone()),
                Target::Cached { slot, gen } => self.shared().state.with(|st| {
                    st.container
                        .live(*slot, *gen)
                        .then(|| st.container.node(*slot).id.clone())
                }),
            };
            let mut skip = false;
            {
                let mut relay = |h: &C::Interface| {
                    let _ = f(h);
                };
                let mut frame = EventFrame::new(frame_id.as_ref(), &mut relay, queued, reverse);
                for router in &routers {
                    match router.route(&mut frame) {
                        Verdict::Continue => {}
                        Verdict::SkipListeners => skip = true,
                        Verdict::Stop => {
                            trace!("router stopped event");
                            return None;
                        }
                    }
                }
            }
            if skip {
                trace!("router skipped listeners");
                return None;
            }
        }

        let Some(token) = self
            .shared()
            .state
            .with(|st| st.begin(&target, reverse, queued))
        else {
            return None;
        };
        let frame = FrameGuard { bus: self, token };
        let mut last = None;
        loop {
            match self.shared().state.with(|st| st.step(token)) {
                Step::Call(handler) => last = Some(f(&handler)),
                Step::Done => break,
            }
        }
        drop(frame);
        // pruning dead handlers may have emptied the container
        self.purge_if_vacant();
        last
    }

    /// invoke the call on every handler at every address.
    pub fn broadcast(&self, f: impl FnMut(&C::Interface)) {
        self.dispatch(Target::All, false, false, f);
    }

    /// like [`broadcast`](Bus::broadcast), visiting addresses and handlers
    /// back to front.
    pub fn broadcast_reverse(&self, f: impl FnMut(&C::Interface)) {
        self.dispatch(Target::All, true, false, f);
    }

    /// broadcast, returning the last handler's value. per-handler values
    /// can be accumulated by the closure itself.
    pub fn broadcast_result<R>(&self, f: impl FnMut(&C::Interface) -> R) -> Option<R> {
        self.dispatch(Target::All, false, false, f)
    }

    pub fn broadcast_result_reverse<R>(&self, f: impl FnMut(&C::Interface) -> R) -> Option<R> {
        self.dispatch(Target::All, true, false, f)
    }

    /// dispatch at a cached address (no lookup, no allocation).
    pub fn event_cached(&self, at: &NodeRef<C>, f: impl FnMut(&C::Interface)) {
        self.event_cached_result(at, f);
    }

    pub fn event_cached_reverse(&self, at: &NodeRef<C>, f: impl FnMut(&C::Interface)) {
        self.event_cached_result_reverse(at, f);
    }

    pub fn event_cached_result<R>(
        &self,
        at: &NodeRef<C>,
        f: impl FnMut(&C::Interface) -> R,
    ) -> Option<R> {
        let target = self.cached_target(at)?;
        self.dispatch(target, false, false, f)
    }

    pub fn event_cached_result_reverse<R>(
        &self,
        at: &NodeRef<C>,
        f: impl FnMut(&C::Interface) -> R,
    ) -> Option<R> {
        let target = self.cached_target(at)?;
        self.dispatch(target, true, false, f)
    }

    pub(crate) fn cached_target(&self, at: &NodeRef<C>) -> Option<Target<C>> {
        if !at.belongs_to(self) {
            warn!("ignoring dispatch: {}", crate::BusError::ForeignNodeRef);
            return None;
        }
        Some(Target::Cached {
            slot: at.slot(),
            gen: at.gen(),
        })
    }

    /// the innermost dispatch currently running on the calling thread, if
    /// any. meant to be called from inside a handler to learn which
    /// address is being delivered to, and whether the event came through
    /// the queue or in reverse. other threads' in-flight dispatches on a
    /// shared bus are not reported.
    pub fn current(&self) -> Option<ActiveDispatch<AddrId<C>>> {
        let me = thread::current().id();
        self.shared().state.with(|st| {
            st.frames
                .iter()
                .rev()
                .find(|f| f.owner == me)
                .map(|f| ActiveDispatch {
                    address: f.current_id.clone(),
                    queued: f.queued,
                    reverse: f.reverse,
                })
        })
    }
}

/// addressed dispatch; only exists when the address policy has ids.
impl<C: Config> Bus<C>
where
    C::Addresses: crate::policy::WithId<C>,
{
    /// invoke the call on every handler at one address. an id with no
    /// handlers is quietly a no-op.
    pub fn event(&self, id: &AddrId<C>, f: impl FnMut(&C::Interface)) {
        self.dispatch(Target::Id(id.clone()), false, false, f);
    }

    pub fn event_reverse(&self, id: &AddrId<C>, f: impl FnMut(&C::Interface)) {
        self.dispatch(Target::Id(id.clone()), true, false, f);
    }

    pub fn event_result<R>(&self, id: &AddrId<C>, f: impl FnMut(&C::Interface) -> R) -> Option<R> {
        self.dispatch(Target::Id(id.clone()), false, false, f)
    }

    pub fn event_result_reverse<R>(
        &self,
        id: &AddrId<C>,
        f: impl FnMut(&C::Interface) -> R,
    ) -> Option<R> {
        self.dispatch(Target::Id(id.clone()), true, false, f)
    }
}

/// what [`Bus::current`] reports about an in-flight dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveDispatch<Id> {
    /// the address being delivered to (None while a broadcast is between
    /// addresses)
    pub address: Option<Id>,
    /// the event came out of the deferred queue
    pub queued: bool,
    pub reverse: bool,
}
