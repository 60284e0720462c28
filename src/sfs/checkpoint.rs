//! Checkpointing
//!
//! Periodically trims the journal up to a "keep" LSN that every active
//! transaction, every dirty buffer, and the freemap provably do not
//! reach behind. The checkpoint daemon sleeps on its wait channel until
//! the record writer sees the odometer cross the bound.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::sync::WaitChannel;

use super::SfsFs;

/// Checkpointer control state.
pub struct CheckpointState {
    /// Odometer bound in bytes; 0 disables kicking.
    pub bound: AtomicU64,
    /// Cleared at unmount to stop the daemon.
    pub run: AtomicBool,
    /// Woken by the record writer when the bound is crossed.
    pub chan: WaitChannel,
}

impl CheckpointState {
    pub(crate) fn new() -> Self {
        Self {
            bound: AtomicU64::new(0),
            run: AtomicBool::new(false),
            chan: WaitChannel::new(),
        }
    }
}

impl SfsFs {
    /// One round of checkpointing: compute the keep LSN, trim, and reset
    /// the odometer.
    ///
    /// It is safe to discard any record below the keep LSN: every active
    /// transaction, every unflushed buffer, and the freemap refer only to
    /// records at or past it.
    pub fn checkpoint(&self) {
        let mut keep = self.journal.peek_next_lsn();

        {
            let active = self.active_txns.lock();
            for &tnx in active.iter() {
                debug_assert!(tnx > 0);
                keep = keep.min(tnx);
            }
        }

        {
            let metadata = self.metadata.lock();
            for block in self.buffers.dirty_blocks() {
                if let Some(span) = metadata.buffers.get(&block) {
                    if span.oldest > 0 {
                        keep = keep.min(span.oldest);
                    }
                }
            }
            if metadata.freemap.oldest > 0 {
                keep = keep.min(metadata.freemap.oldest);
            }
        }

        if let Err(err) = self.journal.trim(keep) {
            log::error!("[SFS] checkpoint trim failed: {err}");
            return;
        }
        self.journal.clear_odometer();
    }

    /// Whether the odometer has crossed the checkpoint bound.
    pub fn should_checkpoint(&self) -> bool {
        let bound = self.checkpoint_state.bound.load(Ordering::Acquire);
        bound > 0 && self.journal.odometer() >= bound
    }

    /// The checkpoint daemon body: wait for a kick, checkpoint, repeat
    /// until unmount clears the run flag. The embedder gives this its
    /// own kernel thread.
    pub fn checkpoint_daemon(&self) {
        while self.checkpoint_state.run.load(Ordering::Acquire) {
            if !self.should_checkpoint() {
                let seen = self.checkpoint_state.chan.generation();
                if !self.should_checkpoint() && self.checkpoint_state.run.load(Ordering::Acquire) {
                    self.checkpoint_state.chan.wait_from(seen);
                }
                continue;
            }
            self.checkpoint();
        }
    }

    pub(crate) fn checkpoint_stop(&self) {
        self.checkpoint_state.run.store(false, Ordering::Release);
        self.checkpoint_state.chan.wake_all();
    }
}
