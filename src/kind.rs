//! The taxonomy of queue kinds an outer scheduler composes (component C5),
//! and the trait boundary the core expects from that outer scheduler.

use std::sync::Arc;

use crate::choose_worker::ChooseWorkerQueue;
use crate::config::DispatcherConfig;
use crate::dispatcher::DispatcherQueue;

/// The fixed set of queue roles a `PipQueue` outer scheduler instantiates.
///
/// The core attaches no behavior to a tag beyond "is it a choose-worker
/// queue" (see [`DispatcherKind::is_choose_worker`]); everything else is
/// construction-time parameterization via [`DispatcherConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherKind {
    Io,
    Cpu,
    Light,
    IpcPips,
    CacheLookup,
    SealDirs,
    DelayedCacheLookup,
    Materialize,
    ChooseWorkerCpu,
    ChooseWorkerCacheLookup,
    ChooseWorkerLight,
    ChooseWorkerIpc,
}

impl DispatcherKind {
    /// All kinds, in a stable order. Used to build a `PipDispatcher` and by
    /// tests that want to iterate the whole taxonomy.
    pub const ALL: [DispatcherKind; 12] = [
        DispatcherKind::Io,
        DispatcherKind::Cpu,
        DispatcherKind::Light,
        DispatcherKind::IpcPips,
        DispatcherKind::CacheLookup,
        DispatcherKind::SealDirs,
        DispatcherKind::DelayedCacheLookup,
        DispatcherKind::Materialize,
        DispatcherKind::ChooseWorkerCpu,
        DispatcherKind::ChooseWorkerCacheLookup,
        DispatcherKind::ChooseWorkerLight,
        DispatcherKind::ChooseWorkerIpc,
    ];

    /// Worker-selection queues run on a dedicated thread pool (C4); every
    /// other kind is a plain bounded, weighted dispatcher (C3).
    pub fn is_choose_worker(&self) -> bool {
        matches!(
            self,
            DispatcherKind::ChooseWorkerCpu
                | DispatcherKind::ChooseWorkerCacheLookup
                | DispatcherKind::ChooseWorkerLight
                | DispatcherKind::ChooseWorkerIpc
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            DispatcherKind::Io => "IO",
            DispatcherKind::Cpu => "CPU",
            DispatcherKind::Light => "Light",
            DispatcherKind::IpcPips => "IpcPips",
            DispatcherKind::CacheLookup => "CacheLookup",
            DispatcherKind::SealDirs => "SealDirs",
            DispatcherKind::DelayedCacheLookup => "DelayedCacheLookup",
            DispatcherKind::Materialize => "Materialize",
            DispatcherKind::ChooseWorkerCpu => "ChooseWorkerCpu",
            DispatcherKind::ChooseWorkerCacheLookup => "ChooseWorkerCacheLookup",
            DispatcherKind::ChooseWorkerLight => "ChooseWorkerLight",
            DispatcherKind::ChooseWorkerIpc => "ChooseWorkerIpc",
        }
    }
}

/// The two callbacks the core needs from its outer `PipQueue` collaborator.
///
/// The core is generic over `Arc<dyn PipQueueHandle>`; it never constructs or
/// assumes a concrete outer scheduler. Both methods must be callable from any
/// thread, including from inside a completion continuation.
pub trait PipQueueHandle: Send + Sync {
    /// Called at the end of every `run_core_async`, regardless of outcome.
    fn decrement_running_or_queued_pips(&self, kind: DispatcherKind);

    /// Called from `release_resource` whenever slots return to a queue, so
    /// the outer scheduler can consider dispatching more work.
    fn trigger_dispatcher(&self);
}

/// A `PipQueueHandle` that does nothing — useful for unit tests and for
/// standalone use of a single `DispatcherQueue`/`ChooseWorkerQueue` without an
/// outer scheduler.
#[derive(Debug, Default)]
pub struct NullPipQueueHandle;

impl PipQueueHandle for NullPipQueueHandle {
    fn decrement_running_or_queued_pips(&self, _kind: DispatcherKind) {}
    fn trigger_dispatcher(&self) {}
}

/// Either flavor of queue a [`PipDispatcher`] may hold for a given kind.
pub enum AnyQueue {
    Plain(DispatcherQueue),
    ChooseWorker(ChooseWorkerQueue),
}

impl AnyQueue {
    pub fn num_running_pips(&self) -> usize {
        match self {
            AnyQueue::Plain(q) => q.num_running_pips(),
            AnyQueue::ChooseWorker(q) => q.num_running_pips(),
        }
    }

    pub fn num_queued_pips(&self) -> usize {
        match self {
            AnyQueue::Plain(q) => q.num_queued_pips(),
            AnyQueue::ChooseWorker(q) => q.num_queued_pips(),
        }
    }

    pub fn is_disposed(&self) -> bool {
        match self {
            AnyQueue::Plain(q) => q.is_disposed(),
            AnyQueue::ChooseWorker(q) => q.is_disposed(),
        }
    }

    /// See `DispatcherQueue::adjust_parallel_degree`/`ChooseWorkerQueue::adjust_parallel_degree`.
    pub fn adjust_parallel_degree(&self, new_max: usize) -> bool {
        match self {
            AnyQueue::Plain(q) => q.adjust_parallel_degree(new_max),
            AnyQueue::ChooseWorker(q) => q.adjust_parallel_degree(new_max),
        }
    }
}

/// Owns one queue per [`DispatcherKind`], choosing C3 or C4 per
/// `is_choose_worker`. Not a reimplementation of the outer scheduler's own
/// dispatch loop: it is a thin convenience surface an outer scheduler may use
/// instead of hand-rolling the kind-to-queue table itself.
pub struct PipDispatcher {
    outer: Arc<dyn PipQueueHandle>,
    queues: std::collections::HashMap<DispatcherKind, AnyQueue>,
}

impl PipDispatcher {
    pub fn new(outer: Arc<dyn PipQueueHandle>, config: &DispatcherConfig) -> Self {
        let mut queues = std::collections::HashMap::new();
        for kind in DispatcherKind::ALL {
            let entry = config.entry(kind);
            let queue = if kind.is_choose_worker() {
                AnyQueue::ChooseWorker(ChooseWorkerQueue::new(
                    outer.clone(),
                    kind,
                    entry.max_parallel_degree,
                ))
            } else {
                AnyQueue::Plain(DispatcherQueue::new(
                    outer.clone(),
                    kind,
                    entry.max_parallel_degree,
                    entry.use_weight,
                ))
            };
            queues.insert(kind, queue);
        }
        Self { outer, queues }
    }

    pub fn enqueue(
        &self,
        kind: DispatcherKind,
        pip: Box<dyn crate::pip::RunnablePip>,
    ) -> crate::error::Result<()> {
        match &self.queues[&kind] {
            AnyQueue::Plain(q) => q.enqueue(pip),
            AnyQueue::ChooseWorker(q) => q.enqueue(pip),
        }
    }

    pub fn start_tasks(&self, kind: DispatcherKind) -> crate::error::Result<()> {
        match &self.queues[&kind] {
            AnyQueue::Plain(q) => q.start_tasks(),
            AnyQueue::ChooseWorker(q) => q.start_tasks(),
        }
    }

    /// Borrows the underlying queue for `kind`, for reads or direct calls
    /// (e.g. `adjust_parallel_degree`) the enqueue/start_tasks/dispose
    /// convenience methods above don't cover.
    pub fn queue_for(&self, kind: DispatcherKind) -> &AnyQueue {
        &self.queues[&kind]
    }

    /// Calls `start_tasks` on every queue in the taxonomy. The outer
    /// scheduler's real dispatch loop is expected to be smarter about which
    /// kinds actually have headroom; this is the naive sweep.
    pub fn start_all(&self) -> crate::error::Result<()> {
        for kind in DispatcherKind::ALL {
            self.start_tasks(kind)?;
        }
        Ok(())
    }

    pub fn dispose(&self, kind: DispatcherKind) {
        match &self.queues[&kind] {
            AnyQueue::Plain(q) => q.dispose(),
            AnyQueue::ChooseWorker(q) => q.dispose(),
        }
    }

    pub fn dispose_all(&self) {
        for kind in DispatcherKind::ALL {
            self.dispose(kind);
        }
    }

    pub fn outer(&self) -> &Arc<dyn PipQueueHandle> {
        &self.outer
    }
}
