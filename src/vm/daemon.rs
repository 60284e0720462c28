//! Paging daemon
//!
//! A background sweep that writes dirty user frames out to swap once the
//! dirty ratio crosses [`PAGING_DAEMON_THRESHOLD`]. The embedder runs
//! [`Vm::paging_daemon_tick`] once per time-unit from a kernel thread;
//! tests drive [`Vm::daemon_sweep`] directly.

use core::sync::atomic::Ordering;

use crate::config::PAGING_DAEMON_THRESHOLD;

use super::coremap::CmeFlags;
use super::{CpuId, Vm};

impl Vm {
    /// One daemon cycle: sweep if the dirty ratio is at or above the
    /// threshold. Returns whether a sweep ran.
    pub fn paging_daemon_tick(&self, cpu: CpuId) -> bool {
        let over = {
            let cm = self.coremap.lock();
            cm.num_dirty * 100 / cm.num_pages >= PAGING_DAEMON_THRESHOLD
        };
        if over {
            self.daemon_sweep(cpu);
        }
        over
    }

    /// Write every dirty, non-busy user frame out to swap.
    pub fn daemon_sweep(&self, cpu: CpuId) {
        self.stats.daemon_runs.fetch_add(1, Ordering::Relaxed);
        let mut cm = self.coremap.lock();
        for i in 0..cm.num_pages {
            let cme = &cm.entries[i];
            if !cme.flags.contains(CmeFlags::EXISTS) {
                break;
            }
            if cme.flags.contains(CmeFlags::BUSY)
                || !cme.flags.contains(CmeFlags::DIRTY)
                || cme.flags.contains(CmeFlags::KPAGE)
                || cme.owner.is_none()
            {
                continue;
            }
            cm.entries[i].flags.insert(CmeFlags::BUSY);
            cm = self.page_write_out(cm, cpu, i);
            cm.entries[i].flags.remove(CmeFlags::BUSY);
            self.core_wchan.wake_all();
        }
    }
}
