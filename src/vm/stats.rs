//! VM statistics counters

use core::sync::atomic::{AtomicU32, Ordering};

/// Machine-wide VM event counters.
pub struct VmStats {
    /// Faults that required bringing a page in (swap read or zero fill).
    pub page_faults: AtomicU32,
    /// Faults that required a synchronous write to swap first.
    pub write_page_faults: AtomicU32,
    /// Every entry into the fault handler.
    pub vm_faults: AtomicU32,
    /// Sweeps performed by the paging daemon.
    pub daemon_runs: AtomicU32,
    /// TLB shootdowns executed on their target CPU.
    pub tlb_shootdowns: AtomicU32,
}

impl VmStats {
    pub const fn new() -> Self {
        Self {
            page_faults: AtomicU32::new(0),
            write_page_faults: AtomicU32::new(0),
            vm_faults: AtomicU32::new(0),
            daemon_runs: AtomicU32::new(0),
            tlb_shootdowns: AtomicU32::new(0),
        }
    }

    pub fn reset(&self) {
        self.page_faults.store(0, Ordering::Relaxed);
        self.write_page_faults.store(0, Ordering::Relaxed);
        self.vm_faults.store(0, Ordering::Relaxed);
        self.daemon_runs.store(0, Ordering::Relaxed);
        self.tlb_shootdowns.store(0, Ordering::Relaxed);
    }

    /// Log the counters.
    pub fn report(&self) {
        log::info!(
            "[VM] stats: vm_faults={} page_faults={} write_page_faults={} daemon_runs={} tlb_shootdowns={}",
            self.vm_faults.load(Ordering::Relaxed),
            self.page_faults.load(Ordering::Relaxed),
            self.write_page_faults.load(Ordering::Relaxed),
            self.daemon_runs.load(Ordering::Relaxed),
            self.tlb_shootdowns.load(Ordering::Relaxed),
        );
    }
}

impl Default for VmStats {
    fn default() -> Self {
        Self::new()
    }
}
