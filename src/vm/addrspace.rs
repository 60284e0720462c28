//! Address spaces
//!
//! Per-process virtual-memory containers: a sparse directory of
//! second-level page tables, the heap bounds, and a sleepable lock held
//! across fault handling and fork. Second-level tables are allocated once
//! and never freed while the space lives, so the eviction path can reach
//! a victim's PTE while holding only the coremap lock.
//!
//! The busy-bit protocol lives here too: `pte_acquire` sleeps on the core
//! wait channel while a present PTE's frame is busy, and revalidates
//! ownership after waking — the frame may have been stolen.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use once_cell::race::OnceBox;

use crate::sync::{Sleeplock, SpinlockGuard};

use super::coremap::{CmeFlags, Coremap};
use super::pagetable::{
    PD_SIZE, PT_SIZE, PageTable, Pte, indices_to_vaddr, vaddr_to_pdi, vaddr_to_pti,
};
use super::tlb::TlbShootdown;
use super::{
    AsId, CpuId, KERNEL_VADDR_START, PAGE_SIZE, Ppn, STACK_MIN, VAddr, Vm, VmError, page_align,
};

/// Heap bounds, protected by the address-space lock.
pub struct AsData {
    pub heap_start: usize,
    pub heap_size: usize,
}

/// A per-process address space.
pub struct AddressSpace {
    pub id: AsId,
    /// Directory of second-level tables, leaves allocated on demand.
    /// User addresses only ever touch the lower half; the upper half is
    /// the kernel's and stays empty.
    pd: [OnceBox<PageTable>; PD_SIZE],
    /// Sleepable lock held across fault handling and fork copy.
    pub(crate) data: Sleeplock<AsData>,
}

impl AddressSpace {
    fn new(id: AsId) -> Arc<Self> {
        Arc::new(Self {
            id,
            pd: [const { OnceBox::new() }; PD_SIZE],
            data: Sleeplock::new(AsData {
                heap_start: 0,
                heap_size: 0,
            }),
        })
    }

    pub(crate) fn leaf(&self, pdi: usize) -> Option<&PageTable> {
        self.pd[pdi].get()
    }

    pub(crate) fn leaf_or_alloc(&self, pdi: usize) -> &PageTable {
        self.pd[pdi].get_or_init(|| Box::new(PageTable::new()))
    }

    /// The PTE for `vaddr`, if its second-level table exists.
    pub fn pte(&self, vaddr: VAddr) -> Option<Pte> {
        self.leaf(vaddr_to_pdi(vaddr))
            .map(|leaf| leaf.get(vaddr_to_pti(vaddr)))
    }

    pub(crate) fn set_pte(&self, vaddr: VAddr, pte: Pte) {
        self.leaf(vaddr_to_pdi(vaddr))
            .expect("setting PTE without a page table")
            .set(vaddr_to_pti(vaddr), pte);
    }

    /// Current heap bounds (start, size).
    pub fn heap(&self) -> (usize, usize) {
        let data = self.data.lock();
        (data.heap_start, data.heap_size)
    }

    /// Visit every PTE in the directory.
    pub(crate) fn for_each_pte(&self, mut f: impl FnMut(VAddr, Pte)) {
        for pdi in 0..PD_SIZE {
            let Some(leaf) = self.leaf(pdi) else { continue };
            for pti in 0..PT_SIZE {
                f(indices_to_vaddr(pdi, pti), leaf.get(pti));
            }
        }
    }
}

impl Vm {
    /// Create an empty address space and register it.
    pub fn as_create(&self) -> Arc<AddressSpace> {
        let id = self.next_asid.fetch_add(1, Ordering::Relaxed);
        let space = AddressSpace::new(id);
        self.spaces.lock().insert(id, space.clone());
        space
    }

    pub(crate) fn space_by_id(&self, id: AsId) -> Arc<AddressSpace> {
        self.spaces
            .lock()
            .get(&id)
            .cloned()
            .expect("no address space registered for owned frame")
    }

    /// Make `cpu`'s TLB consistent with a newly activated address space
    /// by flushing it entirely.
    pub fn as_activate(&self, cpu: CpuId) {
        let t = TlbShootdown {
            cpu,
            vaddr: 0,
            flush_all: true,
        };
        self.tlb_shootdown(cpu, &t);
    }

    // ------------------------------------------------------------------
    // Busy-bit protocol
    // ------------------------------------------------------------------

    /// Pin the frame behind `vaddr`'s PTE, sleeping while it is busy.
    ///
    /// Returns the pinned frame number, or `None` if the PTE is absent —
    /// including the case where the frame was stolen by eviction while we
    /// slept. The caller must eventually hand the result to
    /// [`Vm::pte_release_locked`].
    pub(crate) fn pte_acquire<'a>(
        &'a self,
        space: &AddressSpace,
        vaddr: VAddr,
        mut cm: SpinlockGuard<'a, Coremap>,
    ) -> (SpinlockGuard<'a, Coremap>, Option<Ppn>) {
        loop {
            let Some(pte) = space.pte(vaddr) else {
                return (cm, None);
            };
            if !pte.present() {
                return (cm, None);
            }
            let ppn = pte.ppn();
            debug_assert!(ppn < cm.num_pages);
            let cme = &cm.entries[ppn];
            debug_assert!(!cme.flags.contains(CmeFlags::KPAGE));
            if cme.flags.contains(CmeFlags::BUSY) {
                cm = self.core_wchan.sleep(&self.coremap, cm);
                continue;
            }
            // Revalidate: the frame may have changed hands while we slept.
            if cme.owner != Some(space.id) {
                return (cm, None);
            }
            cm.entries[ppn].flags.insert(CmeFlags::BUSY);
            return (cm, Some(ppn));
        }
    }

    /// Unpin a frame pinned by [`Vm::pte_acquire`] and wake sleepers.
    pub(crate) fn pte_release_locked(&self, cm: &mut Coremap, held: Option<Ppn>) {
        if let Some(ppn) = held {
            debug_assert!(!cm.entries[ppn].flags.contains(CmeFlags::KPAGE));
            cm.entries[ppn].flags.remove(CmeFlags::BUSY);
            self.core_wchan.wake_all();
        }
    }

    // ------------------------------------------------------------------
    // Regions
    // ------------------------------------------------------------------

    /// Define a demand-zero segment of `memsize` bytes at `vaddr` and
    /// advance the heap start past it.
    pub fn as_define_region(
        &self,
        space: &Arc<AddressSpace>,
        cpu: CpuId,
        vaddr: VAddr,
        memsize: usize,
        writeable: bool,
    ) -> Result<(), VmError> {
        let vaddr = page_align(vaddr);
        if memsize == 0 {
            return Err(VmError::InvalidArgument);
        }
        if vaddr >= KERNEL_VADDR_START || vaddr.saturating_add(memsize) > KERNEL_VADDR_START {
            return Err(VmError::InvalidArgument);
        }

        let mut data = space.data.lock();
        let mut defined = 0;
        while defined < memsize {
            let va = vaddr + defined;
            space.leaf_or_alloc(vaddr_to_pdi(va));
            let cm = self.coremap.lock();
            let (mut cm, held) = self.pte_acquire(space, va, cm);
            let pte = space.pte(va).expect("region leaf just allocated");
            if !pte.valid() {
                space.set_pte(va, Pte::demand_zero(writeable));
            } else if pte.writeable() != writeable {
                space.set_pte(va, pte.with_writeable(writeable));
                if pte.present() {
                    let (resident, owner_cpu, frame_va) = {
                        let cme = &cm.entries[pte.ppn()];
                        (cme.flags.contains(CmeFlags::TLB), cme.owner_cpu, cme.vaddr)
                    };
                    // A downgrade must not leave a stale writable mapping.
                    if resident {
                        let t = TlbShootdown {
                            cpu: owner_cpu.expect("TLB-resident frame without owner cpu"),
                            vaddr: frame_va,
                            flush_all: false,
                        };
                        self.tlb_shootdown_locked(&mut cm, cpu, &t);
                        while cm.entries[pte.ppn()].flags.contains(CmeFlags::TLB) {
                            cm = self.tlb_wchan.sleep(&self.coremap, cm);
                        }
                    }
                }
            }
            self.pte_release_locked(&mut cm, held);
            drop(cm);
            defined += PAGE_SIZE;
        }

        if data.heap_start < vaddr + defined {
            data.heap_start = vaddr + defined;
        }
        debug_assert!(data.heap_start % PAGE_SIZE == 0);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fork
    // ------------------------------------------------------------------

    /// Produce a fully independent copy of `old` for a forked process.
    ///
    /// Swapped-out pages are brought back in first (the swap read targets
    /// the parent explicitly, so no address-space switching is needed);
    /// demand-zero pages are copied as demand-zero without allocating a
    /// frame; everything else gets a fresh frame and a byte copy.
    pub fn as_copy(
        &self,
        old: &Arc<AddressSpace>,
        cpu: CpuId,
    ) -> Result<Arc<AddressSpace>, VmError> {
        let new_space = self.as_create();
        let old_data = old.data.lock();

        for pdi in 0..PD_SIZE / 2 {
            let Some(leaf) = old.leaf(pdi) else { continue };
            for pti in 0..PT_SIZE {
                if !leaf.get(pti).valid() {
                    continue;
                }
                let vaddr = indices_to_vaddr(pdi, pti);

                let cm = self.coremap.lock();
                let (mut cm, mut held) = self.pte_acquire(old, vaddr, cm);

                // If the page lives only in swap, bring it into memory.
                loop {
                    let pte = leaf.get(pti);
                    if pte.present() || pte.zeroed() {
                        break;
                    }
                    let (cm2, _) = self.page_swapin(old, cpu, vaddr, cm);
                    cm = cm2;
                    let (cm2, h) = self.pte_acquire(old, vaddr, cm);
                    cm = cm2;
                    held = h;
                }

                let pte = leaf.get(pti);
                let child_pte = if pte.zeroed() {
                    Pte::demand_zero(true)
                } else {
                    let (cm2, new_ppn) = self.page_get(cm, cpu, false);
                    cm = cm2;
                    debug_assert!(new_ppn != 0 && new_ppn != pte.ppn());
                    {
                        let cme = &mut cm.entries[new_ppn];
                        cme.owner = Some(new_space.id);
                        cme.vaddr = vaddr;
                        cme.swap_slot = 0;
                        cme.owner_cpu = Some(cpu);
                        cme.flags = CmeFlags::BUSY | CmeFlags::EXISTS;
                    }
                    drop(cm);
                    self.copy_frame(pte.ppn(), new_ppn);
                    cm = self.coremap.lock();
                    Pte::mapped(new_ppn, true)
                };
                new_space.leaf_or_alloc(pdi).set(pti, child_pte);
                self.pte_release_locked(&mut cm, held);
            }
        }

        // Publish the child's frames all at once.
        {
            let mut cm = self.coremap.lock();
            for i in 0..cm.num_pages {
                if cm.entries[i].owner == Some(new_space.id) {
                    cm.entries[i].flags.remove(CmeFlags::BUSY);
                }
            }
        }
        self.core_wchan.wake_all();

        {
            let mut new_data = new_space.data.lock();
            new_data.heap_start = old_data.heap_start;
            new_data.heap_size = old_data.heap_size;
        }
        Ok(new_space)
    }

    // ------------------------------------------------------------------
    // Destruction
    // ------------------------------------------------------------------

    /// Tear down an address space: release every frame, free every swap
    /// slot, and unregister it.
    pub fn as_destroy(&self, space: Arc<AddressSpace>) {
        {
            let _data = space.data.lock();
            for pdi in 0..PD_SIZE {
                let Some(leaf) = space.leaf(pdi) else { continue };
                for pti in 0..PT_SIZE {
                    let pte = leaf.get(pti);
                    if !pte.valid() {
                        continue;
                    }
                    let vaddr = indices_to_vaddr(pdi, pti);
                    if pte.present() {
                        let cm = self.coremap.lock();
                        let (mut cm, held) = self.pte_acquire(&space, vaddr, cm);
                        match held {
                            None => {
                                // Stolen while we slept; only a swap copy
                                // remains.
                                let pte = leaf.get(pti);
                                debug_assert!(!pte.present());
                                drop(cm);
                                if !pte.zeroed() && pte.ppn() > 0 {
                                    self.swap.destroy_slot(pte.ppn());
                                }
                            }
                            Some(ppn) => {
                                let slot = {
                                    if cm.entries[ppn].flags.contains(CmeFlags::DIRTY) {
                                        cm.num_dirty -= 1;
                                    }
                                    let cme = &mut cm.entries[ppn];
                                    debug_assert!(!cme.flags.contains(CmeFlags::KERNEL));
                                    cme.flags.remove(CmeFlags::DIRTY | CmeFlags::TLB);
                                    cme.owner = None;
                                    cme.vaddr = 0;
                                    cme.owner_cpu = None;
                                    let slot = cme.swap_slot;
                                    cme.swap_slot = 0;
                                    slot
                                };
                                self.pte_release_locked(&mut cm, held);
                                drop(cm);
                                if slot > 0 {
                                    self.swap.destroy_slot(slot);
                                }
                            }
                        }
                    } else if !pte.zeroed() && pte.ppn() > 0 {
                        self.swap.destroy_slot(pte.ppn());
                    }
                    leaf.set(pti, Pte::invalid());
                }
            }
        }
        self.spaces.lock().remove(&space.id);
    }

    // ------------------------------------------------------------------
    // sbrk
    // ------------------------------------------------------------------

    /// Grow or shrink the heap in whole-page steps, returning the old
    /// break. Growth only creates demand-zero PTEs; no frame is reserved
    /// until first touch. Shrinking releases frames and swap slots.
    pub fn sbrk(
        &self,
        space: &Arc<AddressSpace>,
        cpu: CpuId,
        amount: isize,
    ) -> Result<VAddr, VmError> {
        if amount % PAGE_SIZE as isize != 0 {
            return Err(VmError::InvalidArgument);
        }

        let mut data = space.data.lock();
        debug_assert!(data.heap_start % PAGE_SIZE == 0);
        let old_break = data.heap_start + data.heap_size;
        if amount == 0 {
            return Ok(old_break);
        }

        if amount > 0 {
            let grow = amount as usize;
            if old_break + grow > STACK_MIN {
                return Err(VmError::OutOfMemory);
            }
            for i in 0..grow / PAGE_SIZE {
                let va = old_break + i * PAGE_SIZE;
                space.leaf_or_alloc(vaddr_to_pdi(va));
                let cm = self.coremap.lock();
                let (mut cm, held) = self.pte_acquire(space, va, cm);
                space.set_pte(va, Pte::demand_zero(true));
                self.pte_release_locked(&mut cm, held);
            }
            data.heap_size += grow;
        } else {
            let shrink = amount.unsigned_abs();
            if shrink > data.heap_size {
                return Err(VmError::InvalidArgument);
            }
            for i in 1..=shrink / PAGE_SIZE {
                let va = old_break - i * PAGE_SIZE;
                if space.leaf(vaddr_to_pdi(va)).is_none() {
                    continue;
                }
                let cm = self.coremap.lock();
                let (mut cm, held) = self.pte_acquire(space, va, cm);
                let pte = space.pte(va).expect("leaf checked above");
                if pte.present() {
                    let ppn = pte.ppn();
                    let (resident, owner_cpu, frame_va) = {
                        let cme = &cm.entries[ppn];
                        debug_assert!(!cme.flags.contains(CmeFlags::KPAGE));
                        (cme.flags.contains(CmeFlags::TLB), cme.owner_cpu, cme.vaddr)
                    };
                    if resident {
                        let t = TlbShootdown {
                            cpu: owner_cpu.expect("TLB-resident frame without owner cpu"),
                            vaddr: frame_va,
                            flush_all: false,
                        };
                        self.tlb_shootdown_locked(&mut cm, cpu, &t);
                        while cm.entries[ppn].flags.contains(CmeFlags::TLB) {
                            cm = self.tlb_wchan.sleep(&self.coremap, cm);
                        }
                    }
                    let slot = {
                        if cm.entries[ppn].flags.contains(CmeFlags::DIRTY) {
                            cm.num_dirty -= 1;
                        }
                        let cme = &mut cm.entries[ppn];
                        cme.flags.remove(CmeFlags::DIRTY | CmeFlags::KERNEL);
                        cme.owner = None;
                        cme.vaddr = 0;
                        cme.owner_cpu = None;
                        let slot = cme.swap_slot;
                        cme.swap_slot = 0;
                        slot
                    };
                    if slot != 0 {
                        self.swap.destroy_slot(slot);
                    }
                } else if !pte.zeroed() && pte.ppn() > 0 {
                    self.swap.destroy_slot(pte.ppn());
                }
                space.set_pte(va, Pte::invalid());
                self.pte_release_locked(&mut cm, held);
            }
            data.heap_size -= shrink;
        }

        Ok(old_break)
    }
}
