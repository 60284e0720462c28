//! Coremap: the physical-frame registry
//!
//! One entry per RAM frame, all under a single spinlock with short
//! critical sections. The entry records who owns the frame, where its
//! swap copy lives, and the flag bits the eviction and TLB protocols key
//! off. This module also implements the kernel page allocator.

use bitflags::bitflags;

use crate::config::{MIN_USER_PAGES, NUM_TRIES};

use super::{AsId, CpuId, KERNEL_VADDR_START, VAddr, Vm, kvaddr_of, kvaddr_to_ppn};

bitflags! {
    /// Per-frame flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CmeFlags: u8 {
        /// Frame has been written since its last swap write-out.
        const DIRTY  = 1 << 0;
        /// Some CPU's TLB maps this frame.
        const TLB    = 1 << 1;
        /// Frame is mid-transition; excludes concurrent eviction/readout.
        const BUSY   = 1 << 2;
        /// Interior frame of a contiguous kernel allocation.
        const KERNEL = 1 << 3;
        /// Frame belongs to the kernel.
        const KPAGE  = 1 << 4;
        /// Frame is backed by RAM at all.
        const EXISTS = 1 << 5;
    }
}

/// One coremap entry.
#[derive(Debug, Clone)]
pub struct CoremapEntry {
    /// Owning address space; `None` for free and kernel frames.
    pub owner: Option<AsId>,
    /// Virtual address within the owner.
    pub vaddr: VAddr,
    /// Swap slot holding this page's last written-out copy; 0 if none.
    pub swap_slot: usize,
    /// CPU whose TLB may map this frame, for targeted shootdown.
    pub owner_cpu: Option<CpuId>,
    pub flags: CmeFlags,
}

impl CoremapEntry {
    pub(crate) fn free() -> Self {
        Self {
            owner: None,
            vaddr: 0,
            swap_slot: 0,
            owner_cpu: None,
            flags: CmeFlags::EXISTS,
        }
    }
}

/// The frame registry.
pub struct Coremap {
    pub entries: alloc::vec::Vec<CoremapEntry>,
    /// Number of RAM-backed frames.
    pub num_pages: usize,
    /// Frames currently owned by the kernel.
    pub num_kpages: usize,
    /// Frames with the dirty bit set.
    pub num_dirty: usize,
    /// Clock hand for the eviction scan.
    pub clock_head: usize,
}

impl Vm {
    /// Reserve `npages` contiguous frames for the kernel and return their
    /// kernel virtual address, or `None` if the allocation would leave
    /// fewer than `MIN_USER_PAGES` frames for user space or no run can be
    /// assembled after `NUM_TRIES` eviction rounds.
    ///
    /// The first frame of the run is marked `kernel_internal = 0`, the
    /// rest 1, all with `kernel_page = 1`; the region is zeroed.
    pub fn alloc_kpages(&self, cpu: CpuId, npages: usize) -> Option<VAddr> {
        if npages == 0 {
            return None;
        }
        let mut cm = self.coremap.lock();

        let headroom = cm.num_pages.checked_sub(cm.num_kpages + npages)?;
        if headroom < MIN_USER_PAGES {
            return None;
        }

        let mut start_of_block: Option<usize> = None;
        for _ in 0..NUM_TRIES {
            // Look for a run of free frames.
            let mut start = 0;
            let mut pages_found = 0;
            for i in 0..cm.num_pages {
                let cme = &cm.entries[i];
                if !cme.flags.contains(CmeFlags::EXISTS) {
                    break;
                }
                if cme.owner.is_none()
                    && !cme.flags.contains(CmeFlags::KPAGE)
                    && !cme.flags.contains(CmeFlags::BUSY)
                {
                    if pages_found == 0 {
                        start = i;
                    }
                    pages_found += 1;
                    if pages_found == npages {
                        break;
                    }
                } else {
                    pages_found = 0;
                }
            }
            if pages_found == npages {
                start_of_block = Some(start);
                break;
            }

            // Not enough free frames; push user pages out and rescan.
            if npages == 1 {
                let (cm2, ppn) = self.page_get(cm, cpu, false);
                cm = cm2;
                start_of_block = Some(ppn);
                break;
            }
            for _ in 0..npages - pages_found {
                let (cm2, ppn) = self.page_get(cm, cpu, false);
                cm = cm2;
                cm.entries[ppn].flags.remove(CmeFlags::BUSY);
            }
            self.core_wchan.wake_all();
        }

        let start = start_of_block?;
        for i in 0..npages {
            let cme = &mut cm.entries[start + i];
            cme.owner = None;
            cme.vaddr = kvaddr_of(start + i);
            cme.swap_slot = 0;
            cme.owner_cpu = None;
            cme.flags = if i == 0 {
                CmeFlags::KPAGE | CmeFlags::EXISTS
            } else {
                CmeFlags::KPAGE | CmeFlags::KERNEL | CmeFlags::EXISTS
            };
        }
        cm.num_kpages += npages;
        drop(cm);
        self.core_wchan.wake_all();

        self.zero_frames(start, npages);
        Some(kvaddr_of(start))
    }

    /// Release a kernel allocation made by [`Vm::alloc_kpages`]. Walks
    /// forward from the head frame while the `kernel_internal` marking
    /// holds.
    pub fn free_kpages(&self, kva: VAddr) {
        assert!(kva >= KERNEL_VADDR_START);
        let mut cm = self.coremap.lock();

        let mut ppn = kvaddr_to_ppn(kva);
        {
            let cme = &mut cm.entries[ppn];
            assert!(!cme.flags.contains(CmeFlags::BUSY));
            assert!(cme.flags.contains(CmeFlags::KPAGE));
            assert!(!cme.flags.contains(CmeFlags::KERNEL));
            assert!(cme.owner.is_none());
            cme.flags.remove(CmeFlags::KPAGE);
        }
        cm.num_kpages -= 1;
        ppn += 1;

        while ppn < cm.num_pages
            && cm.entries[ppn]
                .flags
                .contains(CmeFlags::KERNEL | CmeFlags::KPAGE)
        {
            let cme = &mut cm.entries[ppn];
            assert!(!cme.flags.contains(CmeFlags::BUSY));
            assert!(cme.owner.is_none());
            cme.flags.remove(CmeFlags::KPAGE | CmeFlags::KERNEL);
            cm.num_kpages -= 1;
            ppn += 1;
        }
    }
}
