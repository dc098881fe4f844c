//! Component C1: a priority-ordered queue of pips, organized as a chain of
//! fixed-capacity blocks kept in descending priority order. A block holds up
//! to [`crate::consts::BLOCK_CAPACITY`] entries; once full it splits in two
//! so that insertion never shifts more than half a block's worth of entries.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;

use crate::consts::BLOCK_CAPACITY;
use crate::error::DispatchError;
use crate::pip::{BoxFuture, RunnablePip, SlotReleaser};

struct Entry {
    priority: i32,
    pip: Box<dyn RunnablePip>,
}

/// A contiguous, priority-descending run of entries.
///
/// Kept as a `VecDeque` rather than `Vec` so that `dequeue` from the front of
/// the queue's first block is O(1) instead of shifting the whole block.
struct ItemBlock {
    entries: VecDeque<Entry>,
}

impl ItemBlock {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    fn max_priority(&self) -> Option<i32> {
        self.entries.front().map(|e| e.priority)
    }

    fn min_priority(&self) -> Option<i32> {
        self.entries.back().map(|e| e.priority)
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= BLOCK_CAPACITY
    }

    /// Position of the first entry with `priority` strictly less than
    /// `priority` (i.e. the FIFO-stable insertion point for a new entry at
    /// this priority, placed after existing equal-priority entries).
    fn insert_position(&self, priority: i32) -> usize {
        // entries are sorted descending by priority; partition_point wants an
        // ascending predicate, so we search on "is this entry's priority >= priority".
        self.entries.partition_point(|e| e.priority >= priority)
    }

    fn insert(&mut self, priority: i32, pip: Box<dyn RunnablePip>) {
        let pos = self.insert_position(priority);
        self.entries.insert(pos, Entry { priority, pip });
    }

    /// Splits off the lower half (by priority, i.e. the tail) into a new
    /// block, keeping the higher-priority half in `self`.
    fn split_tail(&mut self) -> ItemBlock {
        let mid = self.entries.len() / 2;
        let tail = self.entries.split_off(mid);
        ItemBlock { entries: tail }
    }
}

/// What [`PriorityQueue::process_items`]'s callback decides about the entry
/// it was just handed.
pub enum ProcessDecision {
    /// Leave the entry in the queue and keep scanning.
    Keep,
    /// Remove the entry from the queue (it was dispatched, or discarded) and
    /// keep scanning.
    Remove,
    /// Remove the entry and stop scanning immediately. Used once a queue has
    /// no more admission headroom, since every later entry (lower or equal
    /// priority) would also be rejected.
    RemoveAndStop,
    /// Leave the entry and stop scanning immediately.
    KeepAndStop,
}

thread_local! {
    /// Identities (see `PriorityQueue::key`) of queues whose `process_items`
    /// traversal is in progress on *this* thread.
    ///
    /// Checked before the queue's internal lock is ever touched, so a
    /// genuine reentrant call (the same thread, from inside the running
    /// callback) fails fast with `InvalidOperation` instead of deadlocking on
    /// `parking_lot::Mutex`, which isn't reentrant. A concurrent call from a
    /// different thread doesn't have its own thread-local entry for this
    /// queue, so it falls through to the real lock and blocks on it like any
    /// other contended access.
    static ACTIVE_TRAVERSALS: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
}

/// RAII marker for one thread's traversal of a given queue. Inserts `key` on
/// construction, removes it on drop — including an unwind from a panicking
/// callback — so a panic inside `process_items` can't permanently wedge the
/// queue into rejecting every further call.
struct ReentrancyGuard {
    key: usize,
}

impl ReentrancyGuard {
    fn enter(key: usize, reason: &'static str) -> Result<Self, DispatchError> {
        let already_active = ACTIVE_TRAVERSALS.with(|set| !set.borrow_mut().insert(key));
        if already_active {
            return Err(DispatchError::invalid_operation(reason));
        }
        Ok(Self { key })
    }

    fn is_active(key: usize) -> bool {
        ACTIVE_TRAVERSALS.with(|set| set.borrow().contains(&key))
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        ACTIVE_TRAVERSALS.with(|set| {
            set.borrow_mut().remove(&self.key);
        });
    }
}

/// Placeholder swapped into an entry's slot while `dequeue` pulls the real
/// pip out through `process_items`'s `&mut Box<dyn RunnablePip>` signature.
/// Never actually runs: the entry is removed from the queue in the same step.
struct DequeuedPlaceholder;

impl RunnablePip for DequeuedPlaceholder {
    fn priority(&self) -> i32 {
        i32::MIN
    }
    fn run(self: Box<Self>, _releaser: Box<dyn SlotReleaser>) -> BoxFuture<'static, Result<(), DispatchError>> {
        Box::pin(async { Ok(()) })
    }
}

/// A priority-ordered FIFO-within-priority queue of pips.
///
/// All mutation happens under one lock. `process_items` additionally guards
/// against reentrant calls from within its own callback (e.g. a callback that
/// itself tries to enqueue and immediately re-scan) via [`ReentrancyGuard`],
/// checked before the lock is taken so reentrancy fails fast instead of
/// deadlocking.
pub struct PriorityQueue {
    inner: Mutex<Inner>,
}

struct Inner {
    blocks: VecDeque<ItemBlock>,
    len: usize,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                blocks: VecDeque::new(),
                len: 0,
            }),
        }
    }

    fn key(&self) -> usize {
        self as *const PriorityQueue as usize
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts `pip` at `priority`, preserving FIFO order among equal
    /// priorities. Splits the target block if it is at capacity.
    pub fn enqueue(&self, priority: i32, pip: Box<dyn RunnablePip>) -> Result<(), DispatchError> {
        if ReentrancyGuard::is_active(self.key()) {
            return Err(DispatchError::invalid_operation(
                "enqueue called reentrantly from within process_items",
            ));
        }

        let mut inner = self.inner.lock();
        let block_idx = Self::locate_block(&inner.blocks, priority);
        match inner.blocks.get_mut(block_idx) {
            Some(block) if !block.is_full() => {
                block.insert(priority, pip);
            }
            Some(block) => {
                // Block is full: split it, then insert into whichever half
                // the priority belongs to.
                let tail = block.split_tail();
                let tail_max = tail.max_priority();
                inner.blocks.insert(block_idx + 1, tail);
                let target = match tail_max {
                    Some(max) if priority <= max => block_idx + 1,
                    _ => block_idx,
                };
                inner.blocks[target].insert(priority, pip);
            }
            None => {
                let mut block = ItemBlock::new();
                block.insert(priority, pip);
                inner.blocks.push_back(block);
            }
        }
        inner.len += 1;
        Ok(())
    }

    /// Finds the block that should contain `priority`: the first block whose
    /// `min_priority()` is `<= priority`, or the last block if none qualify
    /// (new lowest priority), or index 0 if the queue is empty.
    ///
    /// Blocks are kept in descending-priority order with non-overlapping
    /// ranges, so `min_priority() > priority` is true for a prefix of blocks
    /// and false from some point on; `partition_point` finds that point in
    /// O(log B) instead of scanning every block.
    fn locate_block(blocks: &VecDeque<ItemBlock>, priority: i32) -> usize {
        if blocks.is_empty() {
            return 0;
        }
        let idx =
            blocks.partition_point(|block| matches!(block.min_priority(), Some(min) if min > priority));
        idx.min(blocks.len() - 1)
    }

    /// Removes and returns the highest-priority entry, if any.
    ///
    /// Implemented as a one-step `process_items` traversal so it shares the
    /// same reentrancy guard as every other mutator; a reentrant `dequeue`
    /// from inside a `process_items` callback simply returns `None` (its
    /// `Option` return type can't carry the `InvalidOperation` error the
    /// nested `process_items` call produces internally).
    pub fn dequeue(&self) -> Option<Box<dyn RunnablePip>> {
        let mut taken = None;
        let _ = self.process_items(|_priority, pip| {
            taken = Some(std::mem::replace(pip, Box::new(DequeuedPlaceholder)));
            ProcessDecision::RemoveAndStop
        });
        taken
    }

    /// Walks the queue from highest to lowest priority, handing each entry's
    /// priority and a mutable look at the pip to `f`, which decides whether
    /// to keep scanning and whether to remove the entry. Held under the
    /// queue's internal lock for the whole traversal, so `f` must not call
    /// back into this queue; any such call is rejected before it can touch
    /// the lock (see [`ReentrancyGuard`]).
    pub fn process_items<F>(&self, mut f: F) -> Result<(), DispatchError>
    where
        F: FnMut(i32, &mut Box<dyn RunnablePip>) -> ProcessDecision,
    {
        let _guard = ReentrancyGuard::enter(self.key(), "process_items called reentrantly")?;
        let mut inner = self.inner.lock();

        'outer: for block_idx in 0..inner.blocks.len() {
            let mut cursor = 0;
            loop {
                let Some(block) = inner.blocks.get_mut(block_idx) else {
                    break;
                };
                let Some(entry) = block.entries.get_mut(cursor) else {
                    break;
                };
                let decision = f(entry.priority, &mut entry.pip);
                match decision {
                    ProcessDecision::Keep => cursor += 1,
                    ProcessDecision::KeepAndStop => {
                        return Ok(());
                    }
                    ProcessDecision::Remove => {
                        block.entries.remove(cursor);
                        inner.len -= 1;
                    }
                    ProcessDecision::RemoveAndStop => {
                        block.entries.remove(cursor);
                        inner.len -= 1;
                        break 'outer;
                    }
                }
            }
        }

        inner.blocks.retain(|b| !b.entries.is_empty());
        Ok(())
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopPip(i32);

    impl RunnablePip for NoopPip {
        fn priority(&self) -> i32 {
            self.0
        }
        fn run(self: Box<Self>, _releaser: Box<dyn SlotReleaser>) -> BoxFuture<'static, Result<(), DispatchError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn pip(p: i32) -> Box<dyn RunnablePip> {
        Box::new(NoopPip(p))
    }

    #[test]
    fn dequeues_highest_priority_first() {
        let q = PriorityQueue::new();
        q.enqueue(1, pip(1)).unwrap();
        q.enqueue(5, pip(5)).unwrap();
        q.enqueue(3, pip(3)).unwrap();
        assert_eq!(q.dequeue().unwrap().priority(), 5);
        assert_eq!(q.dequeue().unwrap().priority(), 3);
        assert_eq!(q.dequeue().unwrap().priority(), 1);
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn equal_priority_is_fifo() {
        let q = PriorityQueue::new();
        for i in 0..10 {
            q.enqueue(0, pip(i)).unwrap();
        }
        // All same priority; order among NoopPip is indistinguishable by
        // priority, but len() accounting must still be exact.
        assert_eq!(q.len(), 10);
        for _ in 0..10 {
            q.dequeue().unwrap();
        }
        assert!(q.is_empty());
    }

    #[test]
    fn splits_block_past_capacity() {
        let q = PriorityQueue::new();
        for i in 0..(BLOCK_CAPACITY * 2 + 3) {
            q.enqueue(i as i32, pip(i as i32)).unwrap();
        }
        assert_eq!(q.len(), BLOCK_CAPACITY * 2 + 3);
        let mut last = i32::MAX;
        let mut count = 0;
        while let Some(p) = q.dequeue() {
            assert!(p.priority() <= last);
            last = p.priority();
            count += 1;
        }
        assert_eq!(count, BLOCK_CAPACITY * 2 + 3);
    }

    #[test]
    fn process_items_can_remove_and_stop_early() {
        let q = PriorityQueue::new();
        for i in 0..5 {
            q.enqueue(i, pip(i)).unwrap();
        }
        let mut seen = Vec::new();
        q.process_items(|priority, _pip| {
            seen.push(priority);
            if priority == 3 {
                ProcessDecision::RemoveAndStop
            } else {
                ProcessDecision::Keep
            }
        })
        .unwrap();
        assert_eq!(seen, vec![4, 3]);
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn process_items_rejects_reentrant_enqueue() {
        let q = PriorityQueue::new();
        q.enqueue(1, pip(1)).unwrap();

        let mut reentrant_result = None;
        q.process_items(|_priority, _pip| {
            reentrant_result = Some(q.enqueue(2, pip(2)));
            ProcessDecision::Keep
        })
        .unwrap();

        assert!(matches!(
            reentrant_result,
            Some(Err(DispatchError::InvalidOperation { .. }))
        ));
        // The reentrant call was rejected, not applied.
        assert_eq!(q.len(), 1);

        // The guard was released once the outer call returned; the queue is
        // still usable afterward.
        q.enqueue(2, pip(2)).unwrap();
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn process_items_rejects_reentrant_process_items_and_dequeue() {
        let q = PriorityQueue::new();
        q.enqueue(1, pip(1)).unwrap();

        let mut nested_process_result = None;
        let mut nested_dequeue_result = None;
        q.process_items(|_priority, _pip| {
            nested_process_result = Some(q.process_items(|_, _| ProcessDecision::Keep));
            nested_dequeue_result = Some(q.dequeue());
            ProcessDecision::Keep
        })
        .unwrap();

        assert!(matches!(
            nested_process_result,
            Some(Err(DispatchError::InvalidOperation { .. }))
        ));
        // dequeue() has no Result to carry the error through, so a reentrant
        // call just comes back empty rather than removing anything.
        assert!(nested_dequeue_result.unwrap().is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn panicking_callback_does_not_poison_the_queue() {
        let q = PriorityQueue::new();
        q.enqueue(1, pip(1)).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            q.process_items(|_priority, _pip| panic!("boom"))
        }));
        assert!(result.is_err());

        // The reentrancy guard was released on unwind; the queue still works.
        q.enqueue(2, pip(2)).unwrap();
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn enqueue_on_empty_queue() {
        let q = PriorityQueue::new();
        assert!(q.is_empty());
        q.enqueue(1, pip(1)).unwrap();
        assert_eq!(q.len(), 1);
    }
}
