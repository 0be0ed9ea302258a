//! Error type for the allocator's public surface.

/// The two observable error kinds from an `alloc` call, plus
/// constructor-time validation.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No free block exists whose nominal bin lower-bound is ≥ the
    /// requested size, or the requested size was zero.
    #[error("no free block large enough for the request")]
    OutOfMemory,

    /// The block pool has no free slot to hand out. `alloc` may fold
    /// this into `OutOfMemory` at the call site if the distinction
    /// doesn't matter to the caller.
    #[error("block pool exhausted (capacity {capacity})")]
    OutOfBlockSlots { capacity: u32 },

    /// `with_capacity` was given a degenerate `total_size` or
    /// `max_blocks`.
    #[error("invalid allocator configuration: {reason}")]
    InvalidConfig { reason: &'static str },
}
