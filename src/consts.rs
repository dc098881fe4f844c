//! Crate-wide tunables.

/// Fixed capacity of a single [`crate::priority_queue::ItemBlock`].
///
/// Chosen so that a binary search inside a block and a shift-on-insert both
/// stay cheap relative to a block split; see the `priority_queue` module for
/// the full rationale.
pub const BLOCK_CAPACITY: usize = 512;

include!(concat!(env!("OUT_DIR"), "/version.rs"));

/// Build metadata, generated by `build.rs` from `CARGO_PKG_VERSION_*`.
pub struct Version {
    pub full: &'static str,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub pre: Option<&'static str>,
}

impl core::fmt::Display for Version {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.full)
    }
}

pub const VERSION: Version = Version {
    full: VERSION_FULL,
    major: VERSION_MAJOR,
    minor: VERSION_MINOR,
    patch: VERSION_PATCH,
    pre: VERSION_PRE,
};
