//! Component C3: a bounded, weight-admitted dispatch queue for one
//! [`DispatcherKind`].
//!
//! Admission is governed by atomic running/queued counters and a
//! restartable "try to admit, defer if full" loop over the priority queue;
//! a bounded thread-id pool hands out tracer slots to admitted pips.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use tracing::{error, instrument};

use crate::error::{DispatchError, Result};
use crate::kind::{DispatcherKind, PipQueueHandle};
use crate::pip::{BoxFuture, PipType, RunnablePip, SlotReleaser};
use crate::priority_queue::PriorityQueue;

struct Shared {
    kind: DispatcherKind,
    outer: Arc<dyn PipQueueHandle>,
    queue: PriorityQueue,
    use_weight: bool,
    /// Held for the duration of a whole `start_tasks` admission sweep,
    /// separate from the priority queue's own internal lock. `enqueue` never
    /// takes this lock, so it isn't blocked behind an in-progress sweep.
    admission: Mutex<()>,
    max_parallel_degree: AtomicUsize,
    /// High-water mark of `num_acquired_slots`, distinct from the adjustable
    /// `max_parallel_degree` ceiling above (see `adjust_parallel_degree`).
    max_running: AtomicUsize,
    num_acquired_slots: AtomicUsize,
    num_running_pips: AtomicUsize,
    num_queued_pips: AtomicUsize,
    num_queued_process_pips: AtomicUsize,
    thread_ids: ArrayQueue<usize>,
    disposed: AtomicBool,
}

impl Shared {
    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(DispatchError::Disposed { queue: self.kind })
        } else {
            Ok(())
        }
    }

    /// Called by a [`DispatcherReleaser`] once its pip gives back its admitted
    /// weight. Returns the thread id to the pool and wakes the outer
    /// scheduler so it can try to dispatch more work.
    fn release_resource(&self, weight: u32, thread_id: Option<usize>) {
        self.num_acquired_slots
            .fetch_sub(weight as usize, Ordering::AcqRel);
        if let Some(id) = thread_id {
            let _ = self.thread_ids.push(id);
        }
        self.outer.trigger_dispatcher();
    }
}

/// One weighted, priority-ordered dispatch queue.
pub struct DispatcherQueue {
    shared: Arc<Shared>,
}

impl DispatcherQueue {
    pub fn new(
        outer: Arc<dyn PipQueueHandle>,
        kind: DispatcherKind,
        max_parallel_degree: usize,
        use_weight: bool,
    ) -> Self {
        let max_parallel_degree = max_parallel_degree.max(1);
        let thread_ids = ArrayQueue::new(max_parallel_degree);
        for id in 0..max_parallel_degree {
            let _ = thread_ids.push(id);
        }
        Self {
            shared: Arc::new(Shared {
                kind,
                outer,
                queue: PriorityQueue::new(),
                use_weight,
                admission: Mutex::new(()),
                max_parallel_degree: AtomicUsize::new(max_parallel_degree),
                max_running: AtomicUsize::new(0),
                num_acquired_slots: AtomicUsize::new(0),
                num_running_pips: AtomicUsize::new(0),
                num_queued_pips: AtomicUsize::new(0),
                num_queued_process_pips: AtomicUsize::new(0),
                thread_ids,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn kind(&self) -> DispatcherKind {
        self.shared.kind
    }

    pub fn num_running_pips(&self) -> usize {
        self.shared.num_running_pips.load(Ordering::Acquire)
    }

    pub fn num_queued_pips(&self) -> usize {
        self.shared.num_queued_pips.load(Ordering::Acquire)
    }

    pub fn num_acquired_slots(&self) -> usize {
        self.shared.num_acquired_slots.load(Ordering::Acquire)
    }

    pub fn num_queued_process_pips(&self) -> usize {
        self.shared.num_queued_process_pips.load(Ordering::Acquire)
    }

    pub fn max_parallel_degree(&self) -> usize {
        self.shared.max_parallel_degree.load(Ordering::Acquire)
    }

    /// High-water mark of `num_acquired_slots` ever observed on this queue.
    pub fn max_running(&self) -> usize {
        self.shared.max_running.load(Ordering::Acquire)
    }

    /// Adds `pip` to the priority queue. Does not attempt to start it; the
    /// outer scheduler is expected to follow up with `start_tasks`.
    #[instrument(skip(self, pip), fields(kind = ?self.shared.kind))]
    pub fn enqueue(&self, pip: Box<dyn RunnablePip>) -> Result<()> {
        self.shared.check_disposed()?;
        let priority = pip.priority();
        let is_process = matches!(pip.pip_type(), PipType::Process);
        self.shared.queue.enqueue(priority, pip)?;
        self.shared
            .num_queued_pips
            .fetch_add(1, Ordering::AcqRel);
        if is_process {
            self.shared
                .num_queued_process_pips
                .fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Starts every pip the current admission state has headroom for, highest
    /// priority first. Holds `shared.admission` for the whole sweep so two
    /// concurrent `start_tasks` calls can't race on the same headroom; each
    /// loop iteration still takes and releases the priority queue's own lock
    /// independently via `dequeue`/`enqueue`, so `enqueue` is never blocked
    /// behind an in-progress sweep. Stops as soon as one pip is deferred for
    /// capacity, since every later (lower-or-equal priority) entry would be
    /// deferred too.
    #[instrument(skip(self), fields(kind = ?self.shared.kind))]
    pub fn start_tasks(&self) -> Result<()> {
        self.shared.check_disposed()?;
        let shared = &self.shared;
        let _admission = shared.admission.lock();

        loop {
            let running = shared.num_acquired_slots.load(Ordering::Acquire);
            let cap = shared.max_parallel_degree.load(Ordering::Acquire);
            if running >= cap {
                break;
            }

            let Some(pip) = shared.queue.dequeue() else {
                break;
            };

            let weight = if shared.use_weight { pip.weight().max(1) } else { 1 };

            // Oversize bypass: with nothing running, admit a pip whose own
            // weight exceeds the cap rather than stall forever.
            let admits =
                running + weight as usize <= cap || (running == 0 && weight as usize > cap);

            if !admits {
                let priority = pip.priority();
                let _ = shared.queue.enqueue(priority, pip);
                break;
            }

            let acquired = shared
                .num_acquired_slots
                .fetch_add(weight as usize, Ordering::AcqRel)
                + weight as usize;
            shared.max_running.fetch_max(acquired, Ordering::AcqRel);
            shared.num_running_pips.fetch_add(1, Ordering::AcqRel);
            shared.num_queued_pips.fetch_sub(1, Ordering::AcqRel);
            if matches!(pip.pip_type(), PipType::Process) {
                shared
                    .num_queued_process_pips
                    .fetch_sub(1, Ordering::AcqRel);
            }

            Self::launch(shared.clone(), pip, weight);
        }

        Ok(())
    }

    /// `start_run_task_async`: yields once to the ambient scheduler before
    /// running the pip, so that `enqueue -> start_tasks -> launch` never runs
    /// a pip synchronously on the caller's thread.
    fn launch(shared: Arc<Shared>, pip: Box<dyn RunnablePip>, weight: u32) {
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            Self::run_core_async(shared, pip, weight).await;
        });
    }

    async fn run_core_async(shared: Arc<Shared>, mut pip: Box<dyn RunnablePip>, weight: u32) {
        let kind = shared.kind;
        let thread_id = if pip.include_in_tracer() {
            shared.thread_ids.pop()
        } else {
            None
        };
        if let Some(id) = thread_id {
            pip.set_thread_id(id as i32);
        }

        let releaser = Box::new(DispatcherReleaser::new(shared.clone(), weight, thread_id));
        let result = pip.run(releaser).await;
        if let Err(err) = &result {
            error!(?kind, %err, "pip run failed");
        }
        shared.num_running_pips.fetch_sub(1, Ordering::AcqRel);
        shared.outer.decrement_running_or_queued_pips(kind);
    }

    /// Permanently marks the queue as disposed and drops every still-queued
    /// pip. Further `enqueue`/`start_tasks` calls fail with
    /// [`DispatchError::Disposed`]; pips already running are unaffected.
    pub fn dispose(&self) {
        self.shared.disposed.store(true, Ordering::Release);
        while self.shared.queue.dequeue().is_some() {}
        self.shared.num_queued_pips.store(0, Ordering::Release);
        self.shared.num_queued_process_pips.store(0, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Changes the admission ceiling, returning `true` iff it actually
    /// changed. Never resizes the thread-id pool (sized once at construction
    /// to the queue's initial parallel degree); a new ceiling above that peak
    /// is accepted but thread ids simply run out sooner, which only affects
    /// diagnostics, not admission.
    pub fn adjust_parallel_degree(&self, new_max: usize) -> bool {
        let new_max = new_max.max(1);
        let old = self.shared.max_parallel_degree.swap(new_max, Ordering::AcqRel);
        if old != new_max {
            self.shared.outer.trigger_dispatcher();
            true
        } else {
            false
        }
    }
}

/// Gives a running pip a way to release its admitted weight back to the
/// owning [`DispatcherQueue`] independently of when its future resolves.
///
/// One-shot: the first `release` call clears the latch and does the actual
/// work; later calls are no-ops returning `false`. A `Drop` safety net
/// releases the admitted weight if the pip never called `release` itself
/// (e.g. it returned early via `?`).
struct DispatcherReleaser {
    shared: Arc<Shared>,
    weight: u32,
    thread_id: std::sync::Mutex<Option<usize>>,
    released: AtomicBool,
}

impl DispatcherReleaser {
    fn new(shared: Arc<Shared>, weight: u32, thread_id: Option<usize>) -> Self {
        Self {
            shared,
            weight,
            thread_id: std::sync::Mutex::new(thread_id),
            released: AtomicBool::new(false),
        }
    }

    fn release_with(&self, weight: u32) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        let thread_id = self.thread_id.lock().unwrap().take();
        self.shared.release_resource(weight, thread_id);
        true
    }
}

impl SlotReleaser for DispatcherReleaser {
    fn release(&self, weight: u32) -> bool {
        self.release_with(weight)
    }
}

impl Drop for DispatcherReleaser {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            self.release_with(self.weight);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::NullPipQueueHandle;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    struct CountingPip {
        priority: i32,
        weight: u32,
        ran: Arc<StdAtomicUsize>,
    }

    impl RunnablePip for CountingPip {
        fn priority(&self) -> i32 {
            self.priority
        }
        fn weight(&self) -> u32 {
            self.weight
        }
        fn run(
            self: Box<Self>,
            releaser: Box<dyn SlotReleaser>,
        ) -> BoxFuture<'static, Result<()>> {
            let ran = self.ran.clone();
            let weight = self.weight;
            Box::pin(async move {
                ran.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                releaser.release(weight);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn enqueue_then_start_runs_pip() {
        let q = DispatcherQueue::new(Arc::new(NullPipQueueHandle), DispatcherKind::Cpu, 4, true);
        let ran = Arc::new(StdAtomicUsize::new(0));
        q.enqueue(Box::new(CountingPip {
            priority: 1,
            weight: 1,
            ran: ran.clone(),
        }))
        .unwrap();
        q.start_tasks().unwrap();
        tokio::task::yield_now().await;
        // Give the spawned task a chance to run.
        for _ in 0..10 {
            if ran.load(std::sync::atomic::Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(ran.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn capacity_defers_lower_priority_pips() {
        let q = DispatcherQueue::new(Arc::new(NullPipQueueHandle), DispatcherKind::Cpu, 1, true);
        let ran = Arc::new(StdAtomicUsize::new(0));
        q.enqueue(Box::new(CountingPip {
            priority: 5,
            weight: 1,
            ran: ran.clone(),
        }))
        .unwrap();
        q.enqueue(Box::new(CountingPip {
            priority: 1,
            weight: 1,
            ran: ran.clone(),
        }))
        .unwrap();
        q.start_tasks().unwrap();
        assert_eq!(q.num_queued_pips(), 1);
    }

    #[test]
    fn dispose_rejects_further_enqueues() {
        let q = DispatcherQueue::new(Arc::new(NullPipQueueHandle), DispatcherKind::Io, 2, false);
        q.dispose();
        let ran = Arc::new(StdAtomicUsize::new(0));
        let err = q
            .enqueue(Box::new(CountingPip {
                priority: 1,
                weight: 1,
                ran,
            }))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Disposed { .. }));
    }

    #[test]
    fn adjust_parallel_degree_updates_ceiling() {
        let q = DispatcherQueue::new(Arc::new(NullPipQueueHandle), DispatcherKind::Io, 2, false);
        assert_eq!(q.max_parallel_degree(), 2);
        assert!(q.adjust_parallel_degree(8));
        assert_eq!(q.max_parallel_degree(), 8);
        assert!(q.adjust_parallel_degree(1));
        assert_eq!(q.max_parallel_degree(), 1);
    }

    #[test]
    fn adjust_parallel_degree_is_idempotent() {
        let q = DispatcherQueue::new(Arc::new(NullPipQueueHandle), DispatcherKind::Io, 4, false);
        assert!(!q.adjust_parallel_degree(4));
        assert!(q.adjust_parallel_degree(8));
        assert!(!q.adjust_parallel_degree(8));
    }

    #[tokio::test]
    async fn releaser_release_is_idempotent() {
        let q = DispatcherQueue::new(Arc::new(NullPipQueueHandle), DispatcherKind::Cpu, 4, false);
        let shared = q.shared.clone();
        let releaser = DispatcherReleaser::new(shared, 1, None);
        assert!(releaser.release(1));
        assert!(!releaser.release(1));
    }

    #[tokio::test]
    async fn max_running_tracks_high_water_mark_not_cap() {
        let q = DispatcherQueue::new(Arc::new(NullPipQueueHandle), DispatcherKind::Cpu, 4, true);
        assert_eq!(q.max_running(), 0);
        let ran = Arc::new(StdAtomicUsize::new(0));
        q.enqueue(Box::new(CountingPip {
            priority: 1,
            weight: 3,
            ran: ran.clone(),
        }))
        .unwrap();
        q.start_tasks().unwrap();
        assert_eq!(q.max_running(), 3);
        for _ in 0..20 {
            if ran.load(std::sync::atomic::Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        // High-water mark persists after the pip releases its slots.
        assert_eq!(q.max_running(), 3);
        assert_eq!(q.num_acquired_slots(), 0);
    }
}
