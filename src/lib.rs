#![warn(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::perf)]
#![warn(clippy::style)]

//! Work-dispatch core of a build engine's pip scheduler.
//!
//! Bounded, priority-ordered queues that admit units of build work ("pips")
//! and release them to execution according to per-queue parallelism and
//! weight budgets. The crate has no file or wire format and no CLI surface —
//! it is purely an in-process library that an outer `PipQueue`-style
//! scheduler composes via [`kind::PipDispatcher`], or uses one queue at a
//! time via [`dispatcher::DispatcherQueue`] / [`choose_worker::ChooseWorkerQueue`]
//! directly.
//!
//! Components, leaf-first:
//!
//! - [`priority_queue`] — a blocked priority queue with in-place,
//!   selective-removal traversal under a single lock.
//! - [`dispatcher`] — a bounded, weighted, priority-ordered dispatch queue
//!   built on top of it.
//! - [`choose_worker`] — the dedicated-thread variant used for
//!   latency-sensitive worker-selection pips.
//! - [`kind`] — the taxonomy of queue roles an outer scheduler composes, and
//!   the trait boundary the core expects from that scheduler.
//! - [`config`] — construction-time parameterization of every queue kind.
//! - [`error`] — the typed error taxonomy shared by every component.
//! - [`logging`] — structured tracing setup for a binary hosting this crate.

pub mod choose_worker;
pub mod config;
pub mod consts;
pub mod dispatcher;
pub mod error;
pub mod kind;
pub mod logging;
pub mod pip;
pub mod priority_queue;

pub use choose_worker::ChooseWorkerQueue;
pub use config::{DispatcherConfig, DispatcherEntry};
pub use dispatcher::DispatcherQueue;
pub use error::{DispatchError, Result};
pub use kind::{DispatcherKind, PipDispatcher, PipQueueHandle};
pub use pip::{BoxFuture, PipType, RunnablePip, SlotReleaser};
pub use priority_queue::{PriorityQueue, ProcessDecision};
