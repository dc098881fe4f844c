//! The unit of work a dispatch queue schedules (consumed side of the
//! boundary; the outer scheduler implements this trait for its own pip
//! representation).

use std::future::Future;
use std::pin::Pin;

use crate::error::DispatchError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Coarse classification used only to decide oversize-bypass eligibility in
/// weighted queues; the core attaches no other behavior to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipType {
    Process,
    Ipc,
    CacheLookup,
    SealDirectory,
    Materialize,
    Other,
}

/// Handed to [`RunnablePip::run`] so the pip can give back its admitted slots
/// exactly once, at whatever point its own execution model considers the
/// resource-holding phase over (e.g. a process pip releasing its weight once
/// the child process has been launched, well before it exits).
pub trait SlotReleaser: Send + Sync {
    /// Releases `weight` slots back to the owning queue. Idempotent: the
    /// first call performs the release and returns `true`; every later call
    /// is a no-op returning `false`.
    fn release(&self, weight: u32) -> bool;
}

/// A schedulable unit of work, owned by one dispatch queue at a time.
///
/// Implementations are supplied by the outer scheduler; the core only ever
/// holds `Box<dyn RunnablePip>` and never downcasts it.
pub trait RunnablePip: Send {
    /// Higher runs first. Ties break FIFO within an [`crate::priority_queue::ItemBlock`].
    fn priority(&self) -> i32;

    /// Admission weight against a queue's `max_parallel_degree`. Ignored by
    /// queues configured with `use_weight = false`, which always charge 1.
    fn weight(&self) -> u32 {
        1
    }

    fn pip_type(&self) -> PipType {
        PipType::Other
    }

    fn include_in_tracer(&self) -> bool {
        true
    }

    /// Tracer thread slot assigned by the dispatcher queue, or `-1` if none
    /// was assigned (not requested via `include_in_tracer`, or the pool was
    /// empty at admission time). Implementations that don't care about the
    /// tracer can ignore both this and `set_thread_id`.
    fn thread_id(&self) -> i32 {
        -1
    }

    /// Called by the owning queue right before `run`, once, with the slot
    /// popped from its thread-id pool. Never called if `include_in_tracer()`
    /// is `false` or the pool was empty.
    fn set_thread_id(&mut self, _id: i32) {}

    /// Runs the pip to completion. `releaser` lets the implementation give
    /// back its admitted weight as soon as it no longer needs the slot,
    /// independent of when the returned future resolves.
    fn run(self: Box<Self>, releaser: Box<dyn SlotReleaser>) -> BoxFuture<'static, Result<(), DispatchError>>;
}
