//! Crash recovery
//!
//! Runs once at mount, before the record writer is enabled. Three passes
//! over the live journal window:
//!
//! 1. **Check** (newest to oldest): pair start/end records to find
//!    transactions that never committed, and build the protected-block
//!    table — blocks allocated inside the window, tagged with their
//!    newest allocation LSN. Records logically older than that LSN must
//!    not touch such a block: it belongs to a new owner now and the
//!    stale bytes would corrupt user data.
//! 2. **Undo** (newest to oldest): roll back committed state using the
//!    old-value side of each record. `WriteBlock` is undone by checksum
//!    verification — a mismatch means a torn write and the block is
//!    zeroed. `ZeroBlock` cannot be undone but both feed the
//!    latest-writes table that the redo pass consults.
//! 3. **Redo** (oldest to newest): reapply the new-value side, skipping
//!    `WriteBlock` entirely and `ZeroBlock` records for blocks that were
//!    written again later.
//!
//! Aborted transactions are ignored in redo, except that block-bitmap
//! records are still rolled back in the undo direction. Inode-targeted
//! records re-initialize the inode image whenever its on-disk type does
//! not match what the record expects, because the inode block may never
//! have been flushed after allocation.
//!
//! Recovery failure panics; the system cannot safely proceed.
//!
//! After the passes, the morgue directory is emptied: each entry is a
//! file whose final unlink raced a crash, so its inode is reclaimed and
//! the slot cleared, all inside one ordinary transaction.

use alloc::collections::BTreeMap;

use super::dir::{DIRENTRY_SIZE, Direntry, ENTRIES_PER_BLOCK};
use super::inode::{Inode, TYPE_DIR, TYPE_FILE, TYPE_INVAL};
use super::logging::Txn;
use super::record::{LogOp, IndLevel, Record, fletcher32};
use super::{FsError, Lsn, SFS_DBPERIDB, SFS_MORGUE_BLOCK, SFS_NOINO, SfsFs, set_block_slot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Undo,
    Redo,
}

/// Should this record leave `block` alone because a newer allocation
/// handed the block to a different owner?
fn is_protected(protected: &BTreeMap<u32, Lsn>, block: u32, lsn: Lsn) -> bool {
    protected.get(&block).is_some_and(|&plsn| plsn > lsn)
}

impl SfsFs {
    /// The three recovery passes. Called from mount with the writer
    /// disabled.
    pub(crate) fn recover(&self) -> Result<(), FsError> {
        let window = self.journal.take_window();

        // ------------------------------------------------------------------
        // Check pass: classify transactions, collect protected blocks.
        // ------------------------------------------------------------------
        let mut protected: BTreeMap<u32, Lsn> = BTreeMap::new();
        let mut ended: alloc::vec::Vec<Lsn> = alloc::vec::Vec::new();
        let mut aborted: alloc::vec::Vec<Lsn> = alloc::vec::Vec::new();

        for (lsn, rec) in window.iter().rev() {
            match rec {
                Record::AllocBlock { block, .. } => {
                    // First seen on a reverse scan is the newest
                    // allocation of this block.
                    protected.entry(*block).or_insert(*lsn);
                }
                Record::EndTxn { tnx, .. } => ended.push(*tnx),
                Record::StartTxn { tnx, .. } => {
                    if let Some(index) = ended.iter().position(|t| t == tnx) {
                        ended.remove(index);
                    } else {
                        // Never committed.
                        aborted.push(*tnx);
                    }
                }
                _ => {}
            }
        }
        // End records whose starts fell off the head of the log belong to
        // transactions older than the window; ignore their records too.
        aborted.append(&mut ended);

        log::info!(
            "[SFS] recovery: {} records, {} aborted transactions, {} protected blocks",
            window.len(),
            aborted.len(),
            protected.len()
        );

        // ------------------------------------------------------------------
        // Undo pass, newest to oldest.
        // ------------------------------------------------------------------
        let mut latest_writes: BTreeMap<u32, Lsn> = BTreeMap::new();

        for (lsn, rec) in window.iter().rev() {
            match rec {
                Record::ZeroBlock { block, .. } => {
                    if !is_protected(&protected, *block, *lsn)
                        && !latest_writes.contains_key(block)
                    {
                        latest_writes.insert(*block, *lsn);
                    }
                }
                Record::WriteBlock { block, .. } => {
                    if !is_protected(&protected, *block, *lsn)
                        && !latest_writes.contains_key(block)
                    {
                        if let Err(err) =
                            self.apply_record(rec, Direction::Undo, &protected, *lsn, &aborted)
                        {
                            panic!("undoing record at lsn {lsn} failed: {err}");
                        }
                        latest_writes.insert(*block, *lsn);
                    }
                }
                _ => {
                    if let Err(err) =
                        self.apply_record(rec, Direction::Undo, &protected, *lsn, &aborted)
                    {
                        panic!("undoing record at lsn {lsn} failed: {err}");
                    }
                }
            }
        }

        // ------------------------------------------------------------------
        // Redo pass, oldest to newest.
        // ------------------------------------------------------------------
        for (lsn, rec) in window.iter() {
            match rec {
                Record::WriteBlock { .. } => {}
                Record::ZeroBlock { block, .. }
                    if latest_writes.get(block).is_some_and(|&wl| wl > *lsn) => {}
                _ => {
                    if let Err(err) =
                        self.apply_record(rec, Direction::Redo, &protected, *lsn, &aborted)
                    {
                        panic!("redoing record at lsn {lsn} failed: {err}");
                    }
                }
            }
        }

        Ok(())
    }

    /// Apply one side of a record.
    fn apply_record(
        &self,
        rec: &Record,
        direction: Direction,
        protected: &BTreeMap<u32, Lsn>,
        lsn: Lsn,
        aborted: &[Lsn],
    ) -> Result<(), FsError> {
        match rec {
            Record::Pad
            | Record::Trim { .. }
            | Record::StartTxn { .. }
            | Record::EndTxn { .. }
            | Record::AbortTxn { .. } => Ok(()),

            Record::AllocBlock { tnx, block } => {
                // Bitmap state must be rolled back even for aborted
                // transactions; only their redo is skipped.
                if aborted.contains(tnx) && direction == Direction::Redo {
                    return Ok(());
                }
                let mut fm = self.freemap.lock();
                let index = *block as usize;
                match direction {
                    Direction::Redo => {
                        if !fm.map.is_set(index) {
                            fm.map.mark(index);
                        }
                    }
                    Direction::Undo => {
                        if fm.map.is_set(index) {
                            fm.map.unmark(index);
                        }
                    }
                }
                fm.dirty = true;
                Ok(())
            }

            Record::FreeBlock { tnx, block } => {
                if aborted.contains(tnx) && direction == Direction::Redo {
                    return Ok(());
                }
                let mut fm = self.freemap.lock();
                let index = *block as usize;
                match direction {
                    Direction::Redo => {
                        if fm.map.is_set(index) {
                            fm.map.unmark(index);
                        }
                    }
                    Direction::Undo => {
                        if !fm.map.is_set(index) {
                            fm.map.mark(index);
                        }
                    }
                }
                fm.dirty = true;
                Ok(())
            }

            Record::ZeroBlock { tnx, block } => {
                // A block zeroing cannot be undone.
                if direction == Direction::Undo {
                    return Ok(());
                }
                if (direction == Direction::Redo && aborted.contains(tnx))
                    || is_protected(protected, *block, lsn)
                {
                    return Ok(());
                }
                self.clearblock_internal(&Txn::NONE, *block, false)
            }

            Record::ChangeDirentry {
                tnx,
                ino,
                slot,
                old_ino,
                old_name,
                new_ino,
                new_name,
            } => {
                if (direction == Direction::Redo && aborted.contains(tnx))
                    || is_protected(protected, *ino, lsn)
                {
                    return Ok(());
                }
                // If undoing and the inode block is unallocated, there is
                // nothing to undo.
                if direction == Direction::Undo && !self.bused(*ino) {
                    return Ok(());
                }
                let inode = self.inode_load(*ino)?;
                if inode.typ != TYPE_DIR {
                    // The directory never got written to disk.
                    return Ok(());
                }
                if direction == Direction::Undo {
                    let slots = inode.size / DIRENTRY_SIZE as u32;
                    if slots < *slot {
                        // The slot was never allocated.
                        return Ok(());
                    }
                }
                let (target_ino, target_name) = match direction {
                    Direction::Redo => (*new_ino, *new_name),
                    Direction::Undo => (*old_ino, *old_name),
                };
                let entry = Direntry {
                    ino: target_ino,
                    name: target_name,
                };
                let block = self.bmap_alloc(&Txn::NONE, *ino, slot / ENTRIES_PER_BLOCK as u32)?;
                {
                    let arc = self.buffers.read(self.device.as_ref(), block)?;
                    let mut buf = arc.lock();
                    let off = (*slot as usize % ENTRIES_PER_BLOCK) * DIRENTRY_SIZE;
                    put_direntry(&mut buf.data[off..off + DIRENTRY_SIZE], &entry);
                    buf.dirty = true;
                }
                let needed = (*slot + 1) * DIRENTRY_SIZE as u32;
                if inode.size < needed {
                    self.inode_recover_update(*ino, TYPE_DIR, |i| i.size = needed)?;
                }
                Ok(())
            }

            Record::ChangeSize {
                tnx,
                ino,
                old_size,
                new_size,
                ityp,
            } => {
                if (direction == Direction::Redo && aborted.contains(tnx))
                    || is_protected(protected, *ino, lsn)
                {
                    return Ok(());
                }
                let size = match direction {
                    Direction::Redo => *new_size,
                    Direction::Undo => *old_size,
                };
                self.inode_recover_update(*ino, *ityp, |i| i.size = size)
            }

            Record::ChangeLinkCount {
                tnx,
                ino,
                old_count,
                new_count,
                ityp,
            } => {
                if (direction == Direction::Redo && aborted.contains(tnx))
                    || is_protected(protected, *ino, lsn)
                {
                    return Ok(());
                }
                let count = match direction {
                    Direction::Redo => *new_count,
                    Direction::Undo => *old_count,
                };
                self.inode_recover_update(*ino, *ityp, |i| i.linkcount = count)
            }

            Record::ChangeIndirectPtr {
                tnx,
                ino,
                level,
                old_ptr,
                new_ptr,
                ityp,
            } => {
                if (direction == Direction::Redo && aborted.contains(tnx))
                    || is_protected(protected, *ino, lsn)
                {
                    return Ok(());
                }
                let ptr = match direction {
                    Direction::Redo => *new_ptr,
                    Direction::Undo => *old_ptr,
                };
                let level = *level;
                self.inode_recover_update(*ino, *ityp, move |i| match level {
                    IndLevel::Single => i.indirect = ptr,
                    IndLevel::Double => i.dindirect = ptr,
                    IndLevel::Triple => i.tindirect = ptr,
                })
            }

            Record::ChangeDirectPtr {
                tnx,
                ino,
                slot,
                old_ptr,
                new_ptr,
                ityp,
            } => {
                if (direction == Direction::Redo && aborted.contains(tnx))
                    || is_protected(protected, *ino, lsn)
                {
                    return Ok(());
                }
                let ptr = match direction {
                    Direction::Redo => *new_ptr,
                    Direction::Undo => *old_ptr,
                };
                let slot = *slot as usize;
                assert!(slot < super::SFS_NDIRECT);
                self.inode_recover_update(*ino, *ityp, move |i| i.direct[slot] = ptr)
            }

            Record::ChangeInoInIndirect {
                tnx,
                block,
                slot,
                old_ptr,
                new_ptr,
            } => {
                if (direction == Direction::Redo && aborted.contains(tnx))
                    || is_protected(protected, *block, lsn)
                {
                    return Ok(());
                }
                let ptr = match direction {
                    Direction::Redo => *new_ptr,
                    Direction::Undo => *old_ptr,
                };
                self.recover_block_slot(*block, *slot as usize, ptr)
            }

            Record::ChangeBlockObj {
                tnx,
                block,
                offset,
                old_val,
                new_val,
            } => {
                if (direction == Direction::Redo && aborted.contains(tnx))
                    || is_protected(protected, *block, lsn)
                {
                    return Ok(());
                }
                let val = match direction {
                    Direction::Redo => *new_val,
                    Direction::Undo => *old_val,
                };
                self.recover_block_slot(*block, *offset as usize, val)
            }

            Record::WriteBlock {
                tnx,
                block,
                checksum,
            } => {
                // Undo only; the redo pass skips these entirely.
                if aborted.contains(tnx) {
                    return Ok(());
                }
                let current = {
                    let arc = self.buffers.read(self.device.as_ref(), *block)?;
                    let buf = arc.lock();
                    fletcher32(&buf.data)
                };
                if current != *checksum {
                    log::warn!(
                        "[SFS] torn write detected on block {}, zeroing",
                        block
                    );
                    self.clearblock_internal(&Txn::NONE, *block, false)
                } else {
                    Ok(())
                }
            }

            Record::ChangeInodeType {
                tnx,
                ino,
                old_type,
                new_type,
            } => {
                if (direction == Direction::Redo && aborted.contains(tnx))
                    || is_protected(protected, *ino, lsn)
                {
                    return Ok(());
                }
                let (to_set, expected) = match direction {
                    Direction::Redo => (*new_type, *old_type),
                    Direction::Undo => (*old_type, *new_type),
                };
                if to_set != TYPE_INVAL && to_set != TYPE_FILE && to_set != TYPE_DIR {
                    panic!("invalid inode type {to_set} in change-inode-type record");
                }
                let arc = self.buffers.read(self.device.as_ref(), *ino)?;
                let mut buf = arc.lock();
                let mut inode = Inode::decode(&buf.data);
                if inode.typ != expected {
                    // The inode block never got written to disk.
                    inode = Inode::new(TYPE_INVAL);
                }
                inode.typ = to_set;
                inode.encode_into(&mut buf.data);
                buf.dirty = true;
                Ok(())
            }
        }
    }

    /// Rewrite an inode during recovery, re-initializing the image first
    /// if its on-disk type does not match what the record expects.
    fn inode_recover_update(
        &self,
        ino: u32,
        expected_type: u16,
        f: impl FnOnce(&mut Inode),
    ) -> Result<(), FsError> {
        let arc = self.buffers.read(self.device.as_ref(), ino)?;
        let mut buf = arc.lock();
        let mut inode = Inode::decode(&buf.data);
        if inode.typ != expected_type {
            // The inode block never got flushed after allocation.
            inode = Inode::new(expected_type);
        }
        f(&mut inode);
        inode.encode_into(&mut buf.data);
        buf.dirty = true;
        Ok(())
    }

    /// Raw u32 slot write into a block during recovery.
    fn recover_block_slot(&self, block: u32, slot: usize, val: u32) -> Result<(), FsError> {
        assert!(slot < SFS_DBPERIDB);
        let arc = self.buffers.read(self.device.as_ref(), block)?;
        let mut buf = arc.lock();
        set_block_slot(&mut buf.data, slot, val);
        buf.dirty = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Morgue processing
    // ------------------------------------------------------------------

    /// Empty the morgue: each entry is a file linked only there because
    /// its last unlink raced a crash. Reclaim each inode, clear the
    /// slot, and truncate the morgue, all in one transaction.
    pub(crate) fn process_morgue(&self) -> Result<(), FsError> {
        let txn = self.txn_start(LogOp::Morgue)?;
        let nentries = self.dir_nentries(SFS_MORGUE_BLOCK)?;
        for slot in 0..nentries {
            let entry = self.readdir(SFS_MORGUE_BLOCK, slot)?;
            if entry.ino == SFS_NOINO {
                continue;
            }
            log::info!("[SFS] reclaiming morgue entry ino {}", entry.ino);
            self.dir_unlink(&txn, SFS_MORGUE_BLOCK, slot)?;
            self.reclaim_inode(&txn, entry.ino)?;
        }
        self.itrunc(&txn, SFS_MORGUE_BLOCK)?;
        self.txn_end(txn, LogOp::Morgue)
    }

    /// Free everything an inode owns, invalidate it, and release its
    /// block.
    pub fn reclaim_inode(&self, txn: &Txn, ino: u32) -> Result<(), FsError> {
        self.itrunc(txn, ino)?;
        self.inode_set_type(txn, ino, TYPE_INVAL)?;
        self.bfree(txn, ino)
    }
}

fn put_direntry(buf: &mut [u8], entry: &Direntry) {
    super::record::put_u32(buf, 0, entry.ino);
    buf[4..4 + super::SFS_NAMELEN].copy_from_slice(&entry.name);
}
