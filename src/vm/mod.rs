//! Virtual memory core
//!
//! Demand paging with swap. The pieces, bottom-up:
//!
//! - [`swap`]: bitmap-tracked page slots on a block device.
//! - [`coremap`]: one entry per RAM frame — owner, flags, swap slot,
//!   clock hand; plus the kernel page allocator.
//! - [`pagetable`]: two-level page tables with bit-packed entries.
//! - [`paging`]: the fault handler, swap-in, and clock eviction.
//! - [`tlb`]: per-CPU software TLBs with cross-CPU shootdown.
//! - [`addrspace`]: address-space create/fork/destroy, regions, sbrk.
//! - [`daemon`]: the background dirty-page writer.
//!
//! All global VM state lives in a [`Vm`] handle created by
//! [`Vm::bootstrap`]; callers pass it (and their CPU id) explicitly.

pub mod addrspace;
pub mod coremap;
pub mod daemon;
pub mod pagetable;
pub mod paging;
pub mod stats;
pub mod swap;
pub mod tlb;

#[cfg(test)]
mod vm_tests;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::AtomicU64;

use crate::config;
use crate::device::BlockDevice;
use crate::sync::{Spinlock, WaitChannel};

use addrspace::AddressSpace;
use coremap::{CmeFlags, Coremap, CoremapEntry};
use stats::VmStats;
use swap::SwapTracker;
use tlb::Cpu;

/// Page size: 4KB
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Bottom of the kernel's virtual range. User addresses live below this.
pub const KERNEL_VADDR_START: VAddr = 0x8000_0000;

/// Top of the user stack region (exclusive).
pub const STACK_MAX: VAddr = KERNEL_VADDR_START;

/// Bottom of the user stack region. Addresses between the heap end and
/// this are a forbidden gap.
pub const STACK_MIN: VAddr = STACK_MAX - config::STACK_PAGES * PAGE_SIZE;

/// Physical page (frame) number.
pub type Ppn = usize;
/// Virtual address.
pub type VAddr = usize;
/// CPU identifier, an index into the machine's CPU array.
pub type CpuId = usize;
/// Address-space identifier, an index into the VM registry.
pub type AsId = u64;

/// Align an address down to its page.
#[inline]
pub const fn page_align(va: VAddr) -> VAddr {
    va & !(PAGE_SIZE - 1)
}

/// Kernel virtual address of a frame.
#[inline]
pub const fn kvaddr_of(ppn: Ppn) -> VAddr {
    KERNEL_VADDR_START + ppn * PAGE_SIZE
}

/// Frame number of a kernel virtual address.
#[inline]
pub const fn kvaddr_to_ppn(kva: VAddr) -> Ppn {
    (kva - KERNEL_VADDR_START) / PAGE_SIZE
}

/// Whether an address falls in the user stack region.
#[inline]
pub(crate) fn in_stack(va: VAddr) -> bool {
    va >= STACK_MIN && va < STACK_MAX
}

// ============================================================================
// Fault kinds and errors
// ============================================================================

/// The kind of access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
    /// Write to a page the TLB has mapped read-only.
    ReadOnly,
}

/// VM error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Malformed request (e.g. misaligned sbrk)
    InvalidArgument,
    /// Address outside every region; the process layer should treat this
    /// as a segmentation fault
    BadAddress,
    /// No memory available after eviction retries
    OutOfMemory,
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::InvalidArgument => write!(f, "Invalid argument"),
            VmError::BadAddress => write!(f, "Bad address"),
            VmError::OutOfMemory => write!(f, "Out of memory"),
        }
    }
}

// ============================================================================
// The VM singleton
// ============================================================================

type PageData = Box<[u8; PAGE_SIZE]>;

/// All machine-wide VM state: the coremap and its wait channels, the
/// frame arena, the swap tracker, the CPUs, and the address-space
/// registry.
pub struct Vm {
    /// Frame state. Short critical sections only; never held across I/O.
    pub(crate) coremap: Spinlock<Coremap>,
    /// Wakes sleepers on coremap `busy` bits.
    pub(crate) core_wchan: WaitChannel,
    /// Wakes sleepers waiting for a TLB shootdown to complete.
    pub(crate) tlb_wchan: WaitChannel,
    /// Frame contents, one lock per frame so copies and swap I/O can run
    /// with the coremap lock released (the `busy` bit serializes owners).
    frames: Box<[Spinlock<PageData>]>,
    pub(crate) swap: SwapTracker,
    pub(crate) cpus: Box<[Cpu]>,
    pub stats: VmStats,
    pub(crate) spaces: Spinlock<BTreeMap<AsId, Arc<AddressSpace>>>,
    pub(crate) next_asid: AtomicU64,
    prng: Spinlock<u64>,
}

impl Vm {
    /// Build the VM state for a machine with `ram_pages` frames of RAM and
    /// `num_cpus` CPUs, backed by `swap_dev` for paging.
    ///
    /// Frame 0 is reserved as the kernel's boot footprint, which also
    /// guarantees that frame number 0 never appears in a PTE (a PTE ppn of
    /// 0 means "no swap slot").
    pub fn bootstrap(ram_pages: usize, num_cpus: usize, swap_dev: Arc<dyn BlockDevice>) -> Arc<Vm> {
        assert!(num_cpus >= 1);

        let mut entries = Vec::with_capacity(ram_pages);
        entries.push(CoremapEntry {
            owner: None,
            vaddr: kvaddr_of(0),
            swap_slot: 0,
            owner_cpu: None,
            flags: CmeFlags::KPAGE | CmeFlags::EXISTS,
        });
        for _ in 1..ram_pages {
            entries.push(CoremapEntry::free());
        }

        let coremap = Coremap {
            entries,
            num_pages: ram_pages,
            num_kpages: 1,
            num_dirty: 0,
            clock_head: 0,
        };
        if coremap.num_pages - coremap.num_kpages < config::MIN_USER_PAGES {
            panic!("kernel takes too much memory");
        }

        let frames: Box<[Spinlock<PageData>]> = (0..ram_pages)
            .map(|_| Spinlock::new(Box::new([0u8; PAGE_SIZE])))
            .collect();
        let cpus: Box<[Cpu]> = (0..num_cpus).map(Cpu::new).collect();

        log::info!(
            "[VM] bootstrap: {} frames, {} cpus, {} swap slots",
            ram_pages,
            num_cpus,
            swap_dev.num_blocks() as usize / swap::SECTORS_PER_PAGE
        );

        Arc::new(Vm {
            coremap: Spinlock::new(coremap),
            core_wchan: WaitChannel::new(),
            tlb_wchan: WaitChannel::new(),
            frames,
            swap: SwapTracker::new(swap_dev),
            cpus,
            stats: VmStats::new(),
            spaces: Spinlock::new(BTreeMap::new()),
            next_asid: AtomicU64::new(1),
            prng: Spinlock::new(0x9e37_79b9_7f4a_7c15),
        })
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub(crate) fn random(&self) -> u64 {
        let mut s = self.prng.lock();
        let mut x = *s;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        *s = x;
        x
    }

    // ------------------------------------------------------------------
    // Frame contents
    // ------------------------------------------------------------------

    pub(crate) fn with_frame<R>(&self, ppn: Ppn, f: impl FnOnce(&[u8; PAGE_SIZE]) -> R) -> R {
        let frame = self.frames[ppn].lock();
        f(&frame)
    }

    pub(crate) fn with_frame_mut<R>(
        &self,
        ppn: Ppn,
        f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R,
    ) -> R {
        let mut frame = self.frames[ppn].lock();
        f(&mut frame)
    }

    /// Zero `npages` frames starting at `ppn`.
    pub(crate) fn zero_frames(&self, ppn: Ppn, npages: usize) {
        for i in 0..npages {
            self.with_frame_mut(ppn + i, |buf| buf.fill(0));
        }
    }

    /// Copy frame contents `src` -> `dst` through a bounce buffer, so the
    /// two frame locks are never held at once.
    pub(crate) fn copy_frame(&self, src: Ppn, dst: Ppn) {
        let mut bounce = Box::new([0u8; PAGE_SIZE]);
        self.with_frame(src, |buf| bounce.copy_from_slice(&buf[..]));
        self.with_frame_mut(dst, |buf| buf.copy_from_slice(&bounce[..]));
    }

    // ------------------------------------------------------------------
    // Invariant checking (used by the VM tests)
    // ------------------------------------------------------------------

    /// Walk the coremap and every registered address space, asserting the
    /// cross-structure invariants: user frames and present PTEs point at
    /// each other, and absent non-zeroed PTEs name in-use swap slots.
    pub fn check_invariants(&self) {
        let cm = self.coremap.lock();
        let spaces = self.spaces.lock();
        for (ppn, cme) in cm.entries.iter().enumerate() {
            if !cme.flags.contains(CmeFlags::EXISTS) || cme.flags.contains(CmeFlags::BUSY) {
                continue;
            }
            if let Some(as_id) = cme.owner {
                let space = spaces
                    .get(&as_id)
                    .expect("coremap entry owned by unregistered address space");
                let pte = space.pte(cme.vaddr).expect("owned frame without a PTE");
                assert!(pte.present(), "owned frame's PTE not present");
                assert_eq!(pte.ppn(), ppn, "PTE does not point back at its frame");
            }
        }
        for space in spaces.values() {
            space.for_each_pte(|va, pte| {
                if !pte.valid() {
                    return;
                }
                if pte.present() {
                    let cme = &cm.entries[pte.ppn()];
                    if cme.flags.contains(CmeFlags::BUSY) {
                        return;
                    }
                    assert_eq!(cme.owner, Some(space.id), "frame owner mismatch at {va:#x}");
                    assert_eq!(cme.vaddr, va, "frame vaddr mismatch");
                } else if !pte.zeroed() && pte.ppn() != 0 {
                    assert!(
                        self.swap.slot_in_use(pte.ppn()),
                        "absent PTE names a free swap slot"
                    );
                }
            });
        }
    }
}
