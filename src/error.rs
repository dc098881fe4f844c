//! Typed error taxonomy shared by every component of the dispatch core:
//! named variants carrying structured context, one `#[error("...")]` message
//! per variant, no bare `String` errors.

use std::error::Error as StdError;
use std::fmt;

use crate::kind::DispatcherKind;

pub type Result<T = (), E = DispatchError> = core::result::Result<T, E>;

/// Errors surfaced by the dispatch core's public API. A pip deferred for lack
/// of capacity is not represented here: it's a private control-flow outcome
/// inside `start_tasks`, not a failure.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A public mutator was called after the owning queue was disposed.
    #[error("dispatcher queue {queue:?} is disposed")]
    Disposed { queue: DispatcherKind },

    /// Reentrant use of `PriorityQueue::process_items`/`enqueue`, or scheduling
    /// onto a disposed dedicated runtime during shutdown.
    #[error("invalid operation: {reason}")]
    InvalidOperation { reason: &'static str },

    /// `RunnablePip::run` returned an error. The queue's accounting stays
    /// consistent regardless; this variant only carries the failure onward to
    /// whatever sink is watching the fire-and-forget launch.
    #[error("pip run failed: {source}")]
    RunFailed {
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// A `DispatcherConfig` failed to parse or contained an invalid entry.
    #[error("invalid dispatcher config: {reason}")]
    ConfigInvalid { reason: String },
}

impl DispatchError {
    pub fn run_failed<E>(source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        DispatchError::RunFailed {
            source: Box::new(source),
        }
    }

    pub fn invalid_operation(reason: &'static str) -> Self {
        DispatchError::InvalidOperation { reason }
    }
}

/// A minimal boxed-string error for call sites (tests, examples) that need to
/// hand `RunnablePip::run` a failure without defining their own error type.
#[derive(Debug)]
pub struct Opaque(pub String);

impl fmt::Display for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for Opaque {}
