//! the iteration-repair stack.
//!
//! every in-flight dispatch owns one [`Frame`] on a per-bus `Vec`, in
//! begin order. one thread's own dispatches nest strictly LIFO (dispatch
//! is synchronous), but on a thread-safe bus several threads' frames
//! coexist, so a frame is addressed by its `token`, never by stack
//! position. a frame is a live cursor into the container; whenever
//! membership changes, the mutation site calls the matching repair
//! function *before* the list shifts underneath the cursors.
//!
//! cursor encoding, chosen so one repair rule covers both directions:
//!   forward:  `cursor` = index of the next element to visit; done at `len`
//!   reverse:  `cursor` = next index + 1;                     done at `0`
//!
//! with that encoding, removing index `i` requires `cursor -= 1` exactly
//! when `i < cursor`, and inserting at `i` requires `cursor += 1` exactly
//! when `i < cursor`. the same pair of rules repairs the address-level
//! cursor of a broadcast when whole nodes come and go.
//!
//! invariant kept by all of this: a frame's cursor is always either
//! past-the-end or naming a still-present element.

use std::thread::ThreadId;

use crate::config::{AddrId, Config};

/// marker for one in-flight dispatch.
pub(crate) struct Frame<C: Config> {
    /// stable identity of this dispatch; frames of concurrent dispatches
    /// interleave in the vec, so the engine finds its own frame by token
    pub token: u64,
    /// thread that began the dispatch (for `current()` on a shared bus)
    pub owner: ThreadId,
    /// slot currently being iterated (pinned in the container), if any
    pub node: Option<usize>,
    /// handler-level cursor into the current node's entry list
    pub cursor: usize,
    /// address-level cursor into `container.order` (broadcast only)
    pub addr_cursor: usize,
    /// true for broadcast (walks every address), false for a single node
    pub broadcast: bool,
    pub reverse: bool,
    pub queued: bool,
    /// entries/nodes stamped after this are invisible to this dispatch
    pub seq_limit: u64,
    /// the address currently receiving the event (for [`Bus::current`]
    /// (crate::Bus::current))
    pub current_id: Option<AddrId<C>>,
}

impl<C: Config> Frame<C> {
    /// initial handler cursor for a node with `len` entries.
    pub fn start_cursor(reverse: bool, len: usize) -> usize {
        if reverse {
            len
        } else {
            0
        }
    }

    /// next entry index this frame will visit, if any. does not advance.
    pub fn peek(&self, len: usize) -> Option<usize> {
        if self.reverse {
            self.cursor.checked_sub(1)
        } else {
            (self.cursor < len).then_some(self.cursor)
        }
    }

    /// step the handler cursor past the index just peeked.
    pub fn advance(&mut self) {
        if self.reverse {
            self.cursor -= 1;
        } else {
            self.cursor += 1;
        }
    }

    /// same scheme, address level.
    pub fn peek_addr(&self, len: usize) -> Option<usize> {
        if self.reverse {
            self.addr_cursor.checked_sub(1)
        } else {
            (self.addr_cursor < len).then_some(self.addr_cursor)
        }
    }

    pub fn advance_addr(&mut self) {
        if self.reverse {
            self.addr_cursor -= 1;
        } else {
            self.addr_cursor += 1;
        }
    }
}

/// an entry was removed from `slot` at `idx`: fix every cursor that was at
/// or past it. cost is O(dispatch depth), not O(handlers).
pub(crate) fn entry_removed<C: Config>(frames: &mut [Frame<C>], slot: usize, idx: usize) {
    for f in frames {
        if f.node == Some(slot) && idx < f.cursor {
            f.cursor -= 1;
        }
    }
}

/// an entry was inserted into `slot` at `idx`.
pub(crate) fn entry_inserted<C: Config>(frames: &mut [Frame<C>], slot: usize, idx: usize) {
    for f in frames {
        if f.node == Some(slot) && idx < f.cursor {
            f.cursor += 1;
        }
    }
}

/// a node was erased from the visiting order at `pos`.
pub(crate) fn node_removed<C: Config>(frames: &mut [Frame<C>], pos: usize) {
    for f in frames {
        if f.broadcast && pos < f.addr_cursor {
            f.addr_cursor -= 1;
        }
    }
}

/// a node was inserted into the visiting order at `pos`.
pub(crate) fn node_inserted<C: Config>(frames: &mut [Frame<C>], pos: usize) {
    for f in frames {
        if f.broadcast && pos < f.addr_cursor {
            f.addr_cursor += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, lock, policy};

    struct Cfg;
    impl Config for Cfg {
        type Interface = dyn Fn();
        type Addresses = policy::SingleAddress;
        type Handlers = policy::ManyHandlers;
        type Lock = lock::SingleThread;
        type QueueLock = lock::SingleThread;
    }

    fn frame(reverse: bool, cursor: usize) -> Frame<Cfg> {
        Frame {
            token: 0,
            owner: std::thread::current().id(),
            node: Some(0),
            cursor,
            addr_cursor: 0,
            broadcast: false,
            reverse,
            queued: false,
            seq_limit: u64::MAX,
            current_id: None,
        }
    }

    // walk a synthetic list of length `len`, removing `kill` right before
    // visiting position `at`, and return the indices actually visited
    // (as labels of the original list).
    fn walk(reverse: bool, len: usize, kill: usize, at: usize) -> Vec<usize> {
        let mut labels: Vec<usize> = (0..len).collect();
        let mut f = frame(reverse, Frame::<Cfg>::start_cursor(reverse, len));
        let mut visited = Vec::new();
        let mut removed = false;
        while let Some(idx) = f.peek(labels.len()) {
            if !removed && visited.len() == at {
                if let Some(pos) = labels.iter().position(|&l| l == kill) {
                    labels.remove(pos);
                    entry_removed(std::slice::from_mut(&mut f), 0, pos);
                    removed = true;
                    continue;
                }
            }
            visited.push(labels[idx]);
            f.advance();
        }
        visited
    }

    #[test]
    fn forward_removal_of_current_target_skips_it() {
        // about to visit 2, and 2 is removed: 2 must not run, 3/4 must
        assert_eq!(walk(false, 5, 2, 2), vec![0, 1, 3, 4]);
    }

    #[test]
    fn forward_removal_behind_cursor_is_harmless() {
        // element 0 was already visited when it got removed; the rest still
        // run exactly once
        assert_eq!(walk(false, 5, 0, 3), vec![0, 1, 2, 3, 4]);
        // removing an element ahead of the cursor skips only that element
        assert_eq!(walk(false, 5, 4, 1), vec![0, 1, 2, 3]);
    }

    #[test]
    fn reverse_removal_of_current_target_skips_it() {
        // reverse visits 4,3,2,1,0; removing 2 right before its turn
        assert_eq!(walk(true, 5, 2, 2), vec![4, 3, 1, 0]);
    }

    #[test]
    fn reverse_removal_of_visited_element_is_harmless() {
        assert_eq!(walk(true, 5, 4, 2), vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn insertion_before_cursor_does_not_revisit() {
        let mut labels = vec![10, 11, 12];
        let mut f = frame(false, Frame::<Cfg>::start_cursor(false, 3));
        let mut visited = Vec::new();
        // visit 10, then insert 99 at the front
        let idx = f.peek(labels.len()).unwrap();
        visited.push(labels[idx]);
        f.advance();
        labels.insert(0, 99);
        entry_inserted(std::slice::from_mut(&mut f), 0, 0);
        while let Some(idx) = f.peek(labels.len()) {
            visited.push(labels[idx]);
            f.advance();
        }
        // 99 shifted the list but nothing is repeated or skipped
        assert_eq!(visited, vec![10, 11, 12]);
    }
}
