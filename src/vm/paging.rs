//! Page faults, swap-in, and eviction
//!
//! The bridge between page tables, the coremap, swap, and the TLBs.
//! Eviction is clock replacement: a free frame if one exists, otherwise a
//! clean swap-backed frame at the hand, otherwise a synchronous write-out
//! of the first evictable frame the hand reaches.

use core::sync::atomic::Ordering;

use crate::config::NUM_TLB;
use crate::sync::SpinlockGuard;

use super::addrspace::AddressSpace;
use super::coremap::{CmeFlags, Coremap};
use super::pagetable::{Pte, vaddr_to_pdi};
use super::tlb::{TlbEntry, TlbShootdown};
use super::{
    CpuId, FaultKind, KERNEL_VADDR_START, Ppn, STACK_MAX, STACK_MIN, VAddr, Vm, VmError, in_stack,
    page_align,
};

impl Vm {
    /// Handle a fault at `vaddr` on `cpu` for `space`.
    ///
    /// Resolves demand-zero and swapped-out pages, enforces write
    /// permission, and installs a TLB entry. A `BadAddress` return means
    /// the access was a segmentation error; the process layer decides
    /// what to do about that.
    pub fn vm_fault(
        &self,
        space: &AddressSpace,
        cpu: CpuId,
        kind: FaultKind,
        vaddr: VAddr,
    ) -> Result<(), VmError> {
        self.stats.vm_faults.fetch_add(1, Ordering::Relaxed);

        let vaddr = page_align(vaddr);
        if vaddr >= KERNEL_VADDR_START {
            return Err(VmError::BadAddress);
        }

        let heap = space.data.lock();

        // The gap between the heap end and the stack bottom maps nothing.
        if vaddr <= STACK_MIN && vaddr >= heap.heap_start + heap.heap_size {
            return Err(VmError::BadAddress);
        }

        let pdi = vaddr_to_pdi(vaddr);
        if space.leaf(pdi).is_none() {
            // Only the stack region grows page tables on demand.
            if !(vaddr > STACK_MIN && vaddr <= STACK_MAX) {
                return Err(VmError::BadAddress);
            }
            space.leaf_or_alloc(pdi);
        }

        let cm = self.coremap.lock();
        let (mut cm, held) = self.pte_acquire(space, vaddr, cm);

        let pte = space.pte(vaddr).expect("leaf exists");
        if !pte.present() || (!pte.valid() && in_stack(vaddr)) || pte.zeroed() {
            self.stats.page_faults.fetch_add(1, Ordering::Relaxed);
            let (cm2, _) = self.page_swapin(space, cpu, vaddr, cm);
            cm = cm2;
        }

        let pte = space.pte(vaddr).expect("leaf exists");
        debug_assert!(pte.present());
        let ppn = pte.ppn();
        debug_assert!(ppn < cm.num_pages);
        cm.entries[ppn].flags.insert(CmeFlags::BUSY);
        debug_assert_eq!(cm.entries[ppn].owner, Some(space.id));
        debug_assert_eq!(cm.entries[ppn].vaddr, vaddr);

        let write = matches!(kind, FaultKind::Write | FaultKind::ReadOnly);
        if write && !pte.writeable() {
            cm.entries[ppn].flags.remove(CmeFlags::BUSY);
            self.pte_release_locked(&mut cm, held);
            self.core_wchan.wake_all();
            return Err(VmError::BadAddress);
        }

        // Install the translation, evicting a random TLB slot on a miss.
        let mut tlb = self.cpus[cpu].tlb.lock();
        let index = match tlb.probe(vaddr) {
            Some(index) => index,
            None => {
                let index = self.random() as usize % NUM_TLB;
                let old = tlb.read(index);
                if old.valid {
                    cm.entries[old.ppn].flags.remove(CmeFlags::TLB);
                    self.tlb_wchan.wake_all();
                }
                index
            }
        };
        if write && !cm.entries[ppn].flags.contains(CmeFlags::DIRTY) {
            cm.entries[ppn].flags.insert(CmeFlags::DIRTY);
            cm.num_dirty += 1;
        }
        tlb.write(
            index,
            TlbEntry {
                vaddr,
                ppn,
                dirty: write,
                valid: true,
            },
        );
        drop(tlb);
        {
            let cme = &mut cm.entries[ppn];
            cme.flags.insert(CmeFlags::TLB);
            cme.owner_cpu = Some(cpu);
        }

        cm.entries[ppn].flags.remove(CmeFlags::BUSY);
        self.core_wchan.wake_all();
        self.pte_release_locked(&mut cm, held);
        Ok(())
    }

    /// Bring `vaddr` into a fresh frame for `space`: read its swap slot
    /// if it has one, zero-fill otherwise, then publish the mapping.
    ///
    /// Called with the coremap lock held; the returned frame has been
    /// published and unpinned, and core sleepers have been woken.
    pub(crate) fn page_swapin<'a>(
        &'a self,
        space: &AddressSpace,
        cpu: CpuId,
        vaddr: VAddr,
        cm: SpinlockGuard<'a, Coremap>,
    ) -> (SpinlockGuard<'a, Coremap>, Ppn) {
        let (mut cm, ppn) = self.page_get(cm, cpu, true);
        debug_assert!(vaddr != 0 && ppn != 0 && ppn < cm.num_pages);
        {
            let cme = &cm.entries[ppn];
            debug_assert!(cme.owner.is_none());
            debug_assert!(!cme.flags.contains(CmeFlags::KPAGE));
            debug_assert!(cme.flags.contains(CmeFlags::BUSY));
        }

        let pte = space.pte(vaddr).unwrap_or(Pte::invalid());
        let swap_slot = if pte.valid() && !pte.zeroed() {
            pte.ppn()
        } else {
            0
        };
        if swap_slot != 0 {
            drop(cm);
            self.swap_read(ppn, swap_slot);
            cm = self.coremap.lock();
        } else {
            self.zero_frames(ppn, 1);
        }

        {
            let cme = &mut cm.entries[ppn];
            cme.owner = Some(space.id);
            cme.vaddr = vaddr;
            cme.swap_slot = swap_slot;
            cme.owner_cpu = Some(cpu);
            cme.flags = CmeFlags::EXISTS;
        }

        // No one else can hold this PTE: the address-space lock is ours
        // and the frame was not yet in the coremap.
        debug_assert!(!pte.present());
        space.set_pte(vaddr, Pte::mapped(ppn, true));

        self.core_wchan.wake_all();
        (cm, ppn)
    }

    /// Find a frame to repopulate, evicting if necessary. The returned
    /// frame is marked `busy`; the caller fills it, clears `busy`, and
    /// wakes the core channel.
    pub(crate) fn page_get<'a>(
        &'a self,
        mut cm: SpinlockGuard<'a, Coremap>,
        cpu: CpuId,
        from_fault: bool,
    ) -> (SpinlockGuard<'a, Coremap>, Ppn) {
        // Pass 1: a free frame.
        for i in 0..cm.num_pages {
            let cme = &cm.entries[i];
            if cme.flags.contains(CmeFlags::EXISTS)
                && cme.owner.is_none()
                && !cme.flags.contains(CmeFlags::KPAGE)
                && !cme.flags.contains(CmeFlags::BUSY)
            {
                cm.entries[i].flags.insert(CmeFlags::BUSY);
                return (cm, i);
            }
        }

        // Pass 2: a clean, swap-backed user frame at the clock hand.
        let mut victim: Option<Ppn> = None;
        for _ in 0..cm.num_pages {
            let clock = cm.clock_head;
            cm.clock_head = (clock + 1) % cm.num_pages;
            let cme = &cm.entries[clock];
            if cme.owner.is_some()
                && !cme.flags.contains(CmeFlags::DIRTY)
                && !cme.flags.contains(CmeFlags::KPAGE)
                && !cme.flags.contains(CmeFlags::BUSY)
                && cme.swap_slot != 0
            {
                victim = Some(clock);
                break;
            }
        }

        let victim = match victim {
            Some(v) => {
                cm.entries[v].flags.insert(CmeFlags::BUSY);
                v
            }
            None => {
                // Pass 3: write out the first evictable frame the hand
                // reaches.
                let v = loop {
                    let clock = cm.clock_head;
                    cm.clock_head = (clock + 1) % cm.num_pages;
                    let cme = &cm.entries[clock];
                    if !cme.flags.contains(CmeFlags::KPAGE) && !cme.flags.contains(CmeFlags::BUSY) {
                        break clock;
                    }
                };
                cm.entries[v].flags.insert(CmeFlags::BUSY);
                cm = self.page_write_out(cm, cpu, v);
                if from_fault {
                    self.stats.write_page_faults.fetch_add(1, Ordering::Relaxed);
                }
                v
            }
        };

        // Reclaim the victim: flush its TLB entry, point its PTE at the
        // swap copy, and wipe the coremap entry.
        debug_assert!(victim != 0);
        let (owner, vaddr, resident, owner_cpu) = {
            let cme = &cm.entries[victim];
            (cme.owner, cme.vaddr, cme.flags.contains(CmeFlags::TLB), cme.owner_cpu)
        };
        let owner = owner.expect("evicting a frame nobody owns");
        debug_assert!(vaddr != 0);

        if resident {
            let t = TlbShootdown {
                cpu: owner_cpu.expect("TLB-resident frame without owner cpu"),
                vaddr,
                flush_all: false,
            };
            self.tlb_shootdown_locked(&mut cm, cpu, &t);
            while cm.entries[victim].flags.contains(CmeFlags::TLB) {
                cm = self.tlb_wchan.sleep(&self.coremap, cm);
            }
        }

        let space = self.space_by_id(owner);
        let pte = space.pte(vaddr).expect("owned frame without a PTE");
        debug_assert!(pte.present() && pte.ppn() == victim);
        let swap_slot = cm.entries[victim].swap_slot;
        debug_assert!(swap_slot != 0);
        space.set_pte(vaddr, pte.evicted_to(swap_slot));

        {
            let cme = &mut cm.entries[victim];
            cme.owner = None;
            cme.vaddr = 0;
            cme.swap_slot = 0;
            cme.owner_cpu = None;
            cme.flags = CmeFlags::BUSY | CmeFlags::EXISTS;
        }

        (cm, victim)
    }

    /// Flush frame `ppn` to swap, allocating a slot on first write-out.
    /// The frame must already be `busy`; the coremap lock is released
    /// around the device write.
    pub(crate) fn page_write_out<'a>(
        &'a self,
        mut cm: SpinlockGuard<'a, Coremap>,
        cpu: CpuId,
        ppn: Ppn,
    ) -> SpinlockGuard<'a, Coremap> {
        assert!(ppn > 0);
        {
            let cme = &cm.entries[ppn];
            assert!(!cme.flags.contains(CmeFlags::KPAGE));
            assert!(cme.flags.contains(CmeFlags::BUSY));
        }

        let mut swap_slot = cm.entries[ppn].swap_slot;
        if swap_slot == 0 {
            swap_slot = self.swap.find_free();
            let owner = cm.entries[ppn].owner.expect("writing out unowned frame");
            let vaddr = cm.entries[ppn].vaddr;
            debug_assert!(vaddr != 0);
            let space = self.space_by_id(owner);
            let pte = space.pte(vaddr).expect("owned frame without a PTE");
            debug_assert!(pte.ppn() == ppn);
            space.set_pte(vaddr, pte.materialized());
        }

        drop(cm);
        self.swap_write(ppn, swap_slot);
        cm = self.coremap.lock();

        if cm.entries[ppn].flags.contains(CmeFlags::DIRTY) {
            cm.num_dirty -= 1;
        }
        {
            let cme = &mut cm.entries[ppn];
            cme.flags.remove(CmeFlags::DIRTY);
            cme.swap_slot = swap_slot;
        }

        let (resident, owner_cpu, vaddr) = {
            let cme = &cm.entries[ppn];
            (cme.flags.contains(CmeFlags::TLB), cme.owner_cpu, cme.vaddr)
        };
        if resident {
            let t = TlbShootdown {
                cpu: owner_cpu.expect("TLB-resident frame without owner cpu"),
                vaddr,
                flush_all: false,
            };
            self.tlb_shootdown_locked(&mut cm, cpu, &t);
            while cm.entries[ppn].flags.contains(CmeFlags::TLB) {
                cm = self.tlb_wchan.sleep(&self.coremap, cm);
            }
        }

        cm
    }
}
