//! Per-CPU software TLBs and shootdown
//!
//! Each CPU owns a small array of (vaddr, ppn) translations. Only the
//! owning CPU flushes its own TLB; a shootdown aimed at another CPU is
//! queued there (the model's inter-processor interrupt) and the requester
//! sleeps on the TLB wait channel until the target drains its queue via
//! [`Vm::service_shootdowns`] and clears the frame's `tlb_resident` flag.

use alloc::vec::Vec;
use core::mem;
use core::sync::atomic::Ordering;

use crate::config::NUM_TLB;
use crate::sync::Spinlock;

use super::coremap::{CmeFlags, Coremap};
use super::{CpuId, Ppn, VAddr, Vm, page_align};

/// One TLB translation.
#[derive(Debug, Clone, Copy)]
pub struct TlbEntry {
    pub vaddr: VAddr,
    pub ppn: Ppn,
    /// Writes permitted through this entry.
    pub dirty: bool,
    pub valid: bool,
}

impl TlbEntry {
    const fn invalid() -> Self {
        Self {
            vaddr: 0,
            ppn: 0,
            dirty: false,
            valid: false,
        }
    }
}

/// A software TLB.
pub struct Tlb {
    entries: [TlbEntry; NUM_TLB],
}

impl Tlb {
    fn new() -> Self {
        Self {
            entries: [TlbEntry::invalid(); NUM_TLB],
        }
    }

    /// Find the slot mapping `vaddr`, if any.
    pub fn probe(&self, vaddr: VAddr) -> Option<usize> {
        let vaddr = page_align(vaddr);
        self.entries
            .iter()
            .position(|e| e.valid && e.vaddr == vaddr)
    }

    pub fn read(&self, index: usize) -> TlbEntry {
        self.entries[index]
    }

    pub fn write(&mut self, index: usize, entry: TlbEntry) {
        self.entries[index] = entry;
    }

    pub fn invalidate(&mut self, index: usize) {
        self.entries[index] = TlbEntry::invalid();
    }
}

/// A request to invalidate TLB state on a particular CPU.
#[derive(Debug, Clone, Copy)]
pub struct TlbShootdown {
    /// CPU whose TLB holds the stale entry.
    pub cpu: CpuId,
    /// Address to flush; ignored when `flush_all` is set.
    pub vaddr: VAddr,
    pub flush_all: bool,
}

/// One modeled CPU: its TLB and its queue of pending shootdown requests.
pub struct Cpu {
    pub id: CpuId,
    pub tlb: Spinlock<Tlb>,
    pending: Spinlock<Vec<TlbShootdown>>,
}

impl Cpu {
    pub(crate) fn new(id: CpuId) -> Self {
        Self {
            id,
            tlb: Spinlock::new(Tlb::new()),
            pending: Spinlock::new(Vec::new()),
        }
    }
}

impl Vm {
    /// Execute or forward a shootdown. Requires the coremap lock, because
    /// completing a flush clears the victim frame's `tlb_resident` flag.
    ///
    /// If the target CPU is not `cur_cpu` the request is queued there and
    /// this returns immediately; the caller is expected to sleep on the
    /// TLB wait channel until the flag clears.
    pub(crate) fn tlb_shootdown_locked(&self, cm: &mut Coremap, cur_cpu: CpuId, t: &TlbShootdown) {
        if t.cpu != cur_cpu {
            self.cpus[t.cpu].pending.lock().push(*t);
            return;
        }

        self.stats.tlb_shootdowns.fetch_add(1, Ordering::Relaxed);
        let mut tlb = self.cpus[t.cpu].tlb.lock();
        if t.flush_all {
            for i in 0..NUM_TLB {
                let entry = tlb.read(i);
                if entry.valid {
                    cm.entries[entry.ppn].flags.remove(CmeFlags::TLB);
                    tlb.invalidate(i);
                }
            }
        } else if let Some(index) = tlb.probe(t.vaddr) {
            let entry = tlb.read(index);
            cm.entries[entry.ppn].flags.remove(CmeFlags::TLB);
            tlb.invalidate(index);
        }
        drop(tlb);
        self.tlb_wchan.wake_all();
    }

    /// Execute or forward a shootdown, taking the coremap lock.
    pub fn tlb_shootdown(&self, cur_cpu: CpuId, t: &TlbShootdown) {
        let mut cm = self.coremap.lock();
        self.tlb_shootdown_locked(&mut cm, cur_cpu, t);
    }

    /// Drain `cpu`'s shootdown queue. The embedder calls this from the
    /// target CPU's interrupt path; tests call it directly.
    pub fn service_shootdowns(&self, cpu: CpuId) {
        let requests = mem::take(&mut *self.cpus[cpu].pending.lock());
        if requests.is_empty() {
            return;
        }
        let mut cm = self.coremap.lock();
        for t in &requests {
            debug_assert_eq!(t.cpu, cpu);
            self.tlb_shootdown_locked(&mut cm, cpu, t);
        }
    }
}
