//! Component C4: the four `ChooseWorker*` queues, which run on a dedicated
//! Tokio runtime instead of the ambient one C3 queues spawn onto, so that
//! latency-sensitive worker-selection pips never queue up behind unrelated
//! CPU/IO pip traffic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tokio::runtime::{Handle, Runtime};
use tracing::error;

use crate::error::{DispatchError, Result};
use crate::kind::{DispatcherKind, PipQueueHandle};
use crate::pip::{BoxFuture, RunnablePip, SlotReleaser};
use crate::priority_queue::{PriorityQueue, ProcessDecision};

struct Shared {
    kind: DispatcherKind,
    outer: Arc<dyn PipQueueHandle>,
    queue: PriorityQueue,
    max_parallel_degree: AtomicUsize,
    /// High-water mark of `num_acquired_slots`, the comparator the fast-restart
    /// path uses — intentionally looser than `max_parallel_degree` (see Open
    /// Questions in the design doc).
    max_running: AtomicUsize,
    num_acquired_slots: AtomicUsize,
    num_running_pips: AtomicUsize,
    num_queued_pips: AtomicUsize,
    run_time_ticks: AtomicU64,
    fast_choose_next_count: AtomicU64,
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

    /// Called by a [`ChooseWorkerReleaser`] once its pip gives back its
    /// acquired slot. Mirrors C3's `Shared::release_resource`: the real
    /// counter decrement plus waking the outer scheduler.
    fn release_resource(&self) {
        self.num_running_pips.fetch_sub(1, Ordering::AcqRel);
        self.num_acquired_slots.fetch_sub(1, Ordering::AcqRel);
        self.outer.trigger_dispatcher();
    }

    fn spawn_on(self: Arc<Self>, handle: &Handle, pip: Box<dyn RunnablePip>) {
        let kind = self.kind;
        let releaser = Box::new(ChooseWorkerReleaser::new(self.clone()));
        let started = std::time::Instant::now();

        handle.spawn(async move {
            let result = pip.run(releaser).await;
            if let Err(err) = &result {
                error!(?kind, %err, "choose-worker pip run failed");
            }
            self.run_time_ticks
                .fetch_add(started.elapsed().as_millis() as u64, Ordering::AcqRel);
            self.outer.decrement_running_or_queued_pips(kind);

            // `release_resource` has already run by this point: either the
            // pip called `releaser.release` itself, or the releaser's `Drop`
            // ran it when `pip.run`'s future was consumed by `.await` above.
            // Fast restart is an additional step on top of that release, not
            // a replacement for it.
            //
            // Compares freed slots against the high-water mark `max_running`,
            // not the configured `max_parallel_degree` ceiling. Since
            // `max_running` only ever grows, this is a looser (more eager)
            // predicate than `< max_parallel_degree` would be; the design doc
            // preserves this comparator deliberately.
            let running = self.num_acquired_slots.load(Ordering::Acquire);
            let max_running = self.max_running.load(Ordering::Acquire);
            if running < max_running {
                self.fast_choose_next_count.fetch_add(1, Ordering::AcqRel);
                let handle = Handle::current();
                let _ = drain_admissible(&self, &handle);
            }
        });
    }
}

/// Admits and spawns every pip the current headroom allows, onto whichever
/// runtime `handle` belongs to. Shared by the ordinary `start_tasks` path and
/// the completion-time fast-restart path, since both boil down to "drain
/// what fits, right now".
fn drain_admissible(shared: &Arc<Shared>, handle: &Handle) -> Result<()> {
    shared.queue.process_items(|_priority, pip| {
        let running = shared.num_acquired_slots.load(Ordering::Acquire);
        let cap = shared.max_parallel_degree.load(Ordering::Acquire);
        if running >= cap {
            return ProcessDecision::KeepAndStop;
        }
        let acquired = shared.num_acquired_slots.fetch_add(1, Ordering::AcqRel) + 1;
        shared.max_running.fetch_max(acquired, Ordering::AcqRel);
        shared.num_running_pips.fetch_add(1, Ordering::AcqRel);
        shared.num_queued_pips.fetch_sub(1, Ordering::AcqRel);
        let taken = std::mem::replace(pip, Box::new(NullPip));
        shared.clone().spawn_on(handle, taken);
        ProcessDecision::Remove
    })
}

/// A worker-selection queue: unweighted (every pip costs exactly one slot)
/// and backed by its own dedicated runtime.
pub struct ChooseWorkerQueue {
    shared: Arc<Shared>,
    handle: Handle,
    /// Holds the runtime so `dispose` can shut it down without needing
    /// ownership of `self`; `None` after the first `dispose`.
    rt: std::sync::Mutex<Option<Runtime>>,
}

impl ChooseWorkerQueue {
    pub fn new(outer: Arc<dyn PipQueueHandle>, kind: DispatcherKind, max_parallel_degree: usize) -> Self {
        let max_parallel_degree = max_parallel_degree.max(1);
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(max_parallel_degree)
            .thread_name("ChooseWorker Thread")
            .enable_all()
            .build()
            .expect("failed to build dedicated choose-worker runtime");
        let handle = rt.handle().clone();

        Self {
            shared: Arc::new(Shared {
                kind,
                outer,
                queue: PriorityQueue::new(),
                max_parallel_degree: AtomicUsize::new(max_parallel_degree),
                max_running: AtomicUsize::new(0),
                num_acquired_slots: AtomicUsize::new(0),
                num_running_pips: AtomicUsize::new(0),
                num_queued_pips: AtomicUsize::new(0),
                run_time_ticks: AtomicU64::new(0),
                fast_choose_next_count: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
            }),
            handle,
            rt: std::sync::Mutex::new(Some(rt)),
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

    pub fn max_parallel_degree(&self) -> usize {
        self.shared.max_parallel_degree.load(Ordering::Acquire)
    }

    /// High-water mark of `num_acquired_slots` ever observed on this queue.
    pub fn max_running(&self) -> usize {
        self.shared.max_running.load(Ordering::Acquire)
    }

    /// Cumulative wall-clock time spent inside `run_core_async` across every
    /// pip this queue has run, in milliseconds.
    pub fn run_time_millis(&self) -> u64 {
        self.shared.run_time_ticks.load(Ordering::Acquire)
    }

    /// Count of completions that went straight back into the priority queue
    /// via the fast-restart path instead of waiting on the outer scheduler's
    /// next `start_tasks` sweep.
    pub fn fast_choose_next_count(&self) -> u64 {
        self.shared.fast_choose_next_count.load(Ordering::Acquire)
    }

    pub fn enqueue(&self, pip: Box<dyn RunnablePip>) -> Result<()> {
        self.shared.check_disposed()?;
        let priority = pip.priority();
        self.shared.queue.enqueue(priority, pip)?;
        self.shared.num_queued_pips.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn start_tasks(&self) -> Result<()> {
        self.shared.check_disposed()?;
        drain_admissible(&self.shared, &self.handle)
    }

    /// Shuts down the dedicated runtime (non-blocking: in-flight tasks are
    /// detached, not awaited) before marking the queue disposed, per the
    /// base `DispatcherQueue::dispose` contract.
    pub fn dispose(&self) {
        if let Some(rt) = self.rt.lock().unwrap().take() {
            rt.shutdown_background();
        }
        self.shared.disposed.store(true, Ordering::Release);
        while self.shared.queue.dequeue().is_some() {}
        self.shared.num_queued_pips.store(0, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Changes the admission ceiling, returning `true` iff it actually
    /// changed. Does not resize the dedicated runtime, which keeps the
    /// worker-thread count it was built with.
    pub fn adjust_parallel_degree(&self, new_max: usize) -> bool {
        let new_max = new_max.max(1);
        let old = self
            .shared
            .max_parallel_degree
            .swap(new_max, Ordering::AcqRel);
        if old != new_max {
            self.shared.outer.trigger_dispatcher();
            true
        } else {
            false
        }
    }
}

struct NullPip;
impl RunnablePip for NullPip {
    fn priority(&self) -> i32 {
        i32::MIN
    }
    fn run(self: Box<Self>, _releaser: Box<dyn SlotReleaser>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Gives a running worker-selection pip a way to release its acquired slot
/// back to the owning [`ChooseWorkerQueue`] independently of when its future
/// resolves, mirroring C3's `DispatcherReleaser`.
///
/// One-shot: the first `release` call clears the latch and does the actual
/// work; later calls are no-ops returning `false`. A `Drop` safety net
/// releases the slot if the pip never called `release` itself.
struct ChooseWorkerReleaser {
    shared: Arc<Shared>,
    released: AtomicBool,
}

impl ChooseWorkerReleaser {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            released: AtomicBool::new(false),
        }
    }

    fn release_now(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shared.release_resource();
        true
    }
}

impl SlotReleaser for ChooseWorkerReleaser {
    fn release(&self, _weight: u32) -> bool {
        self.release_now()
    }
}

impl Drop for ChooseWorkerReleaser {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            self.release_now();
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
        ran: Arc<StdAtomicUsize>,
    }

    impl RunnablePip for CountingPip {
        fn priority(&self) -> i32 {
            self.priority
        }
        fn run(self: Box<Self>, _releaser: Box<dyn SlotReleaser>) -> BoxFuture<'static, Result<()>> {
            let ran = self.ran.clone();
            Box::pin(async move {
                ran.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[test]
    fn enqueue_then_start_runs_pip() {
        let q = ChooseWorkerQueue::new(Arc::new(NullPipQueueHandle), DispatcherKind::ChooseWorkerCpu, 2);
        let ran = Arc::new(StdAtomicUsize::new(0));
        q.enqueue(Box::new(CountingPip {
            priority: 1,
            ran: ran.clone(),
        }))
        .unwrap();
        q.start_tasks().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(ran.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn dispose_rejects_further_enqueues() {
        let q = ChooseWorkerQueue::new(Arc::new(NullPipQueueHandle), DispatcherKind::ChooseWorkerLight, 1);
        q.dispose();
        let ran = Arc::new(StdAtomicUsize::new(0));
        let err = q
            .enqueue(Box::new(CountingPip { priority: 1, ran }))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Disposed { .. }));
    }

    #[test]
    fn fast_restart_count_starts_at_zero() {
        let q = ChooseWorkerQueue::new(Arc::new(NullPipQueueHandle), DispatcherKind::ChooseWorkerIpc, 2);
        assert_eq!(q.fast_choose_next_count(), 0);
    }

    #[test]
    fn fast_restart_drains_queued_pip_on_completion() {
        let q = ChooseWorkerQueue::new(Arc::new(NullPipQueueHandle), DispatcherKind::ChooseWorkerCpu, 1);
        let ran = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..3 {
            q.enqueue(Box::new(CountingPip {
                priority: 1,
                ran: ran.clone(),
            }))
            .unwrap();
        }
        q.start_tasks().unwrap();
        for _ in 0..50 {
            if ran.load(std::sync::atomic::Ordering::SeqCst) == 3 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(ran.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert!(q.fast_choose_next_count() >= 1);
    }

    #[test]
    fn adjust_parallel_degree_is_idempotent() {
        let q = ChooseWorkerQueue::new(Arc::new(NullPipQueueHandle), DispatcherKind::ChooseWorkerLight, 2);
        assert_eq!(q.max_parallel_degree(), 2);
        assert!(q.adjust_parallel_degree(4));
        assert!(!q.adjust_parallel_degree(4));
    }
}
