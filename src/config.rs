//! Kernel configuration constants
//!
//! Tunable parameters for the VM and SFS cores. Modify these values to
//! adjust kernel behavior.

#![allow(dead_code)]

/// Minimum number of RAM frames that must remain available to user space
/// after any kernel allocation. `alloc_kpages` refuses requests that would
/// dip below this.
pub const MIN_USER_PAGES: usize = 8;

/// How many eviction rounds `alloc_kpages` attempts before giving up on a
/// contiguous multi-page request.
pub const NUM_TRIES: usize = 4;

/// Dirty-frame percentage at which the paging daemon starts writing
/// frames back to swap.
pub const PAGING_DAEMON_THRESHOLD: usize = 50;

/// Size of the user stack region, in pages. The stack grows down from the
/// top of user space; addresses between the heap end and the bottom of
/// this region are a forbidden gap.
pub const STACK_PAGES: usize = 1024;

/// Number of entries in each per-CPU software TLB.
pub const NUM_TLB: usize = 64;

/// The checkpointer is woken once the journal odometer exceeds
/// (journal bytes / CHECKPOINT_BOUND_DIVISOR).
pub const CHECKPOINT_BOUND_DIVISOR: u64 = 8;
