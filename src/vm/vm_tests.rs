//! VM tests
//!
//! Drive the fault/eviction machinery against a small RAM arena and a
//! RAM-backed swap device, then check the cross-structure invariants.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::config::MIN_USER_PAGES;
use crate::device::RamDisk;

use super::addrspace::AddressSpace;
use super::coremap::CmeFlags;
use super::tlb::TlbShootdown;
use super::*;

const CPU: CpuId = 0;
const HEAP_BASE: VAddr = 0x0001_0000;

fn make_vm(ram_pages: usize) -> Arc<Vm> {
    // 4096 sectors = 512 swap slots.
    Vm::bootstrap(ram_pages, 1, Arc::new(RamDisk::new(4096)))
}

/// A space with a one-page region so the heap starts above it.
fn make_space(vm: &Vm) -> Arc<AddressSpace> {
    let space = vm.as_create();
    vm.as_define_region(&space, CPU, HEAP_BASE, PAGE_SIZE, true)
        .unwrap();
    space
}

/// Fault a page writable and fill it.
fn poke(vm: &Vm, space: &Arc<AddressSpace>, va: VAddr, fill: u8) {
    vm.vm_fault(space, CPU, FaultKind::Write, va).unwrap();
    let pte = space.pte(va).unwrap();
    assert!(pte.present());
    vm.with_frame_mut(pte.ppn(), |buf| buf.fill(fill));
}

/// Fault a page readable and return its first byte.
fn peek(vm: &Vm, space: &Arc<AddressSpace>, va: VAddr) -> u8 {
    vm.vm_fault(space, CPU, FaultKind::Read, va).unwrap();
    let pte = space.pte(va).unwrap();
    assert!(pte.present());
    vm.with_frame(pte.ppn(), |buf| buf[0])
}

#[test]
fn demand_zero_allocation() {
    let vm = make_vm(32);
    let space = make_space(&vm);

    let slots_before = vm.swap.slots_used();
    let brk = vm.sbrk(&space, CPU, PAGE_SIZE as isize).unwrap();

    let pte = space.pte(brk).unwrap();
    assert!(pte.valid() && pte.zeroed() && !pte.present());

    // First touch materializes a zero page without touching swap.
    assert_eq!(peek(&vm, &space, brk), 0);
    let pte = space.pte(brk).unwrap();
    assert!(pte.present() && !pte.zeroed());
    vm.with_frame(pte.ppn(), |buf| assert!(buf.iter().all(|&b| b == 0)));
    assert_eq!(vm.swap.slots_used(), slots_before);
    {
        let cm = vm.coremap.lock();
        assert_eq!(cm.entries[pte.ppn()].swap_slot, 0);
    }

    vm.check_invariants();
    vm.as_destroy(space);
}

#[test]
fn write_fault_sets_dirty_and_tlb() {
    let vm = make_vm(32);
    let space = make_space(&vm);
    let brk = vm.sbrk(&space, CPU, PAGE_SIZE as isize).unwrap();

    poke(&vm, &space, brk, 0x5a);
    let pte = space.pte(brk).unwrap();
    let ppn = pte.ppn();

    {
        let cm = vm.coremap.lock();
        assert!(cm.entries[ppn].flags.contains(CmeFlags::DIRTY));
        assert!(cm.entries[ppn].flags.contains(CmeFlags::TLB));
        assert_eq!(cm.num_dirty, 1);
    }
    {
        let tlb = vm.cpus[CPU].tlb.lock();
        let index = tlb.probe(brk).expect("no TLB entry after write fault");
        let entry = tlb.read(index);
        assert_eq!(entry.ppn, ppn);
        assert!(entry.dirty);
    }

    vm.check_invariants();
    vm.as_destroy(space);
}

#[test]
fn readonly_fault_promotes_clean_entry() {
    let vm = make_vm(32);
    let space = make_space(&vm);
    let brk = vm.sbrk(&space, CPU, PAGE_SIZE as isize).unwrap();

    vm.vm_fault(&space, CPU, FaultKind::Read, brk).unwrap();
    let ppn = space.pte(brk).unwrap().ppn();
    {
        let tlb = vm.cpus[CPU].tlb.lock();
        let entry = tlb.read(tlb.probe(brk).unwrap());
        assert!(!entry.dirty);
    }
    {
        let cm = vm.coremap.lock();
        assert!(!cm.entries[ppn].flags.contains(CmeFlags::DIRTY));
    }

    // The write through the read-only mapping re-faults as ReadOnly.
    vm.vm_fault(&space, CPU, FaultKind::ReadOnly, brk).unwrap();
    {
        let tlb = vm.cpus[CPU].tlb.lock();
        let entry = tlb.read(tlb.probe(brk).unwrap());
        assert!(entry.dirty);
    }
    {
        let cm = vm.coremap.lock();
        assert!(cm.entries[ppn].flags.contains(CmeFlags::DIRTY));
    }

    vm.as_destroy(space);
}

#[test]
fn eviction_round_trip() {
    let vm = make_vm(16);
    let space = make_space(&vm);
    let pages = 32;
    let brk = vm.sbrk(&space, CPU, (pages * PAGE_SIZE) as isize).unwrap();

    for i in 0..pages {
        poke(&vm, &space, brk + i * PAGE_SIZE, i as u8);
    }
    for i in 0..pages {
        assert_eq!(peek(&vm, &space, brk + i * PAGE_SIZE), i as u8);
    }
    assert!(vm.stats.write_page_faults.load(Ordering::Relaxed) > 0);

    vm.check_invariants();
    vm.as_destroy(space);
    assert_eq!(vm.swap.slots_used(), 0);
}

#[test]
fn fork_copies_through_swap() {
    let vm = make_vm(24);
    let parent = make_space(&vm);
    let brk = vm.sbrk(&parent, CPU, (8 * PAGE_SIZE) as isize).unwrap();

    // Write the pattern, flush it to swap, then generate enough traffic
    // from a second space to steal the (clean, swap-backed) frame.
    poke(&vm, &parent, brk, 0xab);
    for i in 1..8 {
        poke(&vm, &parent, brk + i * PAGE_SIZE, i as u8);
    }
    vm.daemon_sweep(CPU);

    let noise = make_space(&vm);
    let noise_brk = vm.sbrk(&noise, CPU, (20 * PAGE_SIZE) as isize).unwrap();
    for i in 0..20 {
        poke(&vm, &noise, noise_brk + i * PAGE_SIZE, 0xee);
    }
    let pte = parent.pte(brk).unwrap();
    assert!(!pte.present(), "pattern page was not evicted");
    assert!(pte.ppn() != 0, "evicted page has no swap slot");

    let child = vm.as_copy(&parent, CPU).unwrap();
    assert_eq!(child.heap(), parent.heap());

    // The child sees the pattern and survives the parent's death.
    assert_eq!(peek(&vm, &child, brk), 0xab);
    vm.as_destroy(parent);
    assert_eq!(peek(&vm, &child, brk), 0xab);

    vm.check_invariants();
    vm.as_destroy(noise);
    vm.as_destroy(child);
    assert_eq!(vm.swap.slots_used(), 0);
}

#[test]
fn fork_keeps_demand_zero_pages_unbacked() {
    let vm = make_vm(32);
    let parent = make_space(&vm);
    let brk = vm.sbrk(&parent, CPU, PAGE_SIZE as isize).unwrap();

    let child = vm.as_copy(&parent, CPU).unwrap();
    let pte = child.pte(brk).unwrap();
    assert!(pte.valid() && pte.zeroed() && !pte.present());

    vm.as_destroy(parent);
    vm.as_destroy(child);
}

#[test]
fn kernel_page_allocation() {
    let vm = make_vm(32);

    let kva = vm.alloc_kpages(CPU, 3).expect("alloc_kpages failed");
    let ppn = kvaddr_to_ppn(kva);
    {
        let cm = vm.coremap.lock();
        assert!(cm.entries[ppn].flags.contains(CmeFlags::KPAGE));
        assert!(!cm.entries[ppn].flags.contains(CmeFlags::KERNEL));
        for i in 1..3 {
            assert!(cm.entries[ppn + i].flags.contains(CmeFlags::KPAGE));
            assert!(cm.entries[ppn + i].flags.contains(CmeFlags::KERNEL));
        }
    }
    vm.with_frame(ppn, |buf| assert!(buf.iter().all(|&b| b == 0)));

    vm.free_kpages(kva);
    {
        let cm = vm.coremap.lock();
        for i in 0..3 {
            assert!(!cm.entries[ppn + i].flags.contains(CmeFlags::KPAGE));
        }
    }

    // Requests that would starve user space are refused.
    assert!(vm.alloc_kpages(CPU, 32 - MIN_USER_PAGES).is_none());
}

#[test]
fn sbrk_argument_checks() {
    let vm = make_vm(32);
    let space = make_space(&vm);

    assert_eq!(
        vm.sbrk(&space, CPU, 123),
        Err(VmError::InvalidArgument)
    );
    assert_eq!(
        vm.sbrk(&space, CPU, -(PAGE_SIZE as isize)),
        Err(VmError::InvalidArgument)
    );

    let brk = vm.sbrk(&space, CPU, 0).unwrap();
    assert_eq!(brk, HEAP_BASE + PAGE_SIZE);

    vm.as_destroy(space);
}

#[test]
fn sbrk_shrink_releases_backing() {
    let vm = make_vm(32);
    let space = make_space(&vm);
    let brk = vm.sbrk(&space, CPU, PAGE_SIZE as isize).unwrap();

    poke(&vm, &space, brk, 0x11);
    vm.daemon_sweep(CPU);
    assert_eq!(vm.swap.slots_used(), 1);

    let new_brk = vm.sbrk(&space, CPU, -(PAGE_SIZE as isize)).unwrap();
    assert_eq!(new_brk, brk + PAGE_SIZE);
    assert!(!space.pte(brk).unwrap().valid());
    assert_eq!(vm.swap.slots_used(), 0);

    vm.check_invariants();
    vm.as_destroy(space);
}

#[test]
fn bad_addresses_fault_out() {
    let vm = make_vm(32);
    let space = make_space(&vm);

    // Kernel range.
    assert_eq!(
        vm.vm_fault(&space, CPU, FaultKind::Read, KERNEL_VADDR_START),
        Err(VmError::BadAddress)
    );
    // The gap between the heap end and the stack bottom.
    assert_eq!(
        vm.vm_fault(&space, CPU, FaultKind::Read, STACK_MIN - PAGE_SIZE),
        Err(VmError::BadAddress)
    );
    // The stack region itself grows on demand.
    let stack_va = STACK_MAX - PAGE_SIZE;
    vm.vm_fault(&space, CPU, FaultKind::Write, stack_va).unwrap();
    assert!(space.pte(stack_va).unwrap().present());

    vm.as_destroy(space);
}

#[test]
fn daemon_cleans_dirty_frames() {
    let vm = make_vm(16);
    let space = make_space(&vm);
    let pages = 8;
    let brk = vm.sbrk(&space, CPU, (pages * PAGE_SIZE) as isize).unwrap();
    for i in 0..pages {
        poke(&vm, &space, brk + i * PAGE_SIZE, 0xcc);
    }

    // 8 dirty frames out of 16 crosses the 50% threshold.
    assert!(vm.paging_daemon_tick(CPU));
    assert!(vm.stats.daemon_runs.load(Ordering::Relaxed) >= 1);
    {
        let cm = vm.coremap.lock();
        assert_eq!(cm.num_dirty, 0);
        for i in 0..pages {
            let pte = space.pte(brk + i * PAGE_SIZE).unwrap();
            assert!(cm.entries[pte.ppn()].swap_slot != 0);
        }
    }
    // Nothing left to clean.
    assert!(!vm.paging_daemon_tick(CPU));

    vm.check_invariants();
    vm.as_destroy(space);
}

#[test]
fn cross_cpu_shootdown_is_queued_and_serviced() {
    let vm = Vm::bootstrap(32, 2, Arc::new(RamDisk::new(4096)));
    let space = make_space(&vm);
    let brk = vm.sbrk(&space, CPU, PAGE_SIZE as isize).unwrap();
    poke(&vm, &space, brk, 0x77);
    let ppn = space.pte(brk).unwrap().ppn();

    // A request from CPU 1 targeting CPU 0 only queues the IPI.
    let t = TlbShootdown {
        cpu: 0,
        vaddr: brk,
        flush_all: false,
    };
    vm.tlb_shootdown(1, &t);
    {
        let cm = vm.coremap.lock();
        assert!(cm.entries[ppn].flags.contains(CmeFlags::TLB));
    }

    // The target CPU drains its queue and clears the resident bit.
    vm.service_shootdowns(0);
    {
        let cm = vm.coremap.lock();
        assert!(!cm.entries[ppn].flags.contains(CmeFlags::TLB));
    }
    assert!(vm.cpus[0].tlb.lock().probe(brk).is_none());
    assert!(vm.stats.tlb_shootdowns.load(Ordering::Relaxed) >= 1);

    vm.as_destroy(space);
}

#[test]
fn busy_bit_handoff_across_threads() {
    let vm = make_vm(32);
    let space = make_space(&vm);
    let brk = vm.sbrk(&space, CPU, PAGE_SIZE as isize).unwrap();
    poke(&vm, &space, brk, 0x42);
    let ppn = space.pte(brk).unwrap().ppn();

    // Pin the frame as another owner would mid-transition.
    {
        let mut cm = vm.coremap.lock();
        cm.entries[ppn].flags.insert(CmeFlags::BUSY);
    }

    // A fault against the pinned frame must sleep in pte_acquire until
    // the busy bit clears and the core channel is woken.
    let faulter = {
        let vm = vm.clone();
        let space = space.clone();
        std::thread::spawn(move || {
            vm.vm_fault(&space, CPU, FaultKind::Read, brk).unwrap();
        })
    };
    std::thread::sleep(std::time::Duration::from_millis(20));
    assert!(!faulter.is_finished(), "fault completed against a busy frame");

    {
        let mut cm = vm.coremap.lock();
        cm.entries[ppn].flags.remove(CmeFlags::BUSY);
    }
    vm.core_wchan.wake_all();
    faulter.join().unwrap();

    // The frame was not stolen; the mapping survived the handoff.
    let pte = space.pte(brk).unwrap();
    assert!(pte.present());
    assert_eq!(pte.ppn(), ppn);
    assert_eq!(vm.with_frame(ppn, |buf| buf[0]), 0x42);

    vm.check_invariants();
    vm.as_destroy(space);
}

#[test]
fn as_destroy_releases_swap_slots() {
    let vm = make_vm(32);
    let space = make_space(&vm);
    let brk = vm.sbrk(&space, CPU, (2 * PAGE_SIZE) as isize).unwrap();
    poke(&vm, &space, brk, 1);
    poke(&vm, &space, brk + PAGE_SIZE, 2);
    vm.daemon_sweep(CPU);
    assert_eq!(vm.swap.slots_used(), 2);

    vm.as_destroy(space);
    assert_eq!(vm.swap.slots_used(), 0);
}
