//! Block allocation
//!
//! Journaled allocation over the free-block bitmap. The freemap lock is
//! sleepable and held across whole operations; the metadata lock nests
//! inside it. Freemap I/O always moves the whole bitmap.

use crate::bitmap::Bitmap;
use crate::device::BlockDevice;

use super::logging::Txn;
use super::record::Record;
use super::{FsError, SFS_BLOCKSIZE, SFS_FREEMAP_START, SfsFs, freemap_bits, freemap_blocks};

/// The free-block bitmap and its dirty flag.
pub struct Freemap {
    pub map: Bitmap,
    pub dirty: bool,
}

/// Read the whole freemap off the device.
pub(crate) fn load_freemap(device: &dyn BlockDevice, nblocks: u32) -> Result<Bitmap, FsError> {
    let mut map = Bitmap::new(freemap_bits(nblocks));
    let mut bytes = alloc::vec![0u8; freemap_blocks(nblocks) as usize * SFS_BLOCKSIZE];
    for b in 0..freemap_blocks(nblocks) {
        let mut buf = [0u8; SFS_BLOCKSIZE];
        device.read_block(u64::from(SFS_FREEMAP_START + b), &mut buf)?;
        let off = b as usize * SFS_BLOCKSIZE;
        bytes[off..off + SFS_BLOCKSIZE].copy_from_slice(&buf);
    }
    for (i, word) in map.data_mut().iter_mut().enumerate() {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
        *word = u64::from_le_bytes(arr);
    }
    Ok(map)
}

/// Write the whole freemap to the device.
pub(crate) fn write_freemap(device: &dyn BlockDevice, map: &Bitmap) -> Result<(), FsError> {
    let words = map.data();
    let nblocks = words.len() * 8 / SFS_BLOCKSIZE;
    for b in 0..nblocks {
        let mut buf = [0u8; SFS_BLOCKSIZE];
        for i in 0..SFS_BLOCKSIZE / 8 {
            let word = words[b * (SFS_BLOCKSIZE / 8) + i];
            buf[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
        }
        device.write_block(u64::from(SFS_FREEMAP_START + b as u32), &buf)?;
    }
    Ok(())
}

impl SfsFs {
    /// Allocate a block: mark the free bit, journal the allocation, and
    /// hand the block back zeroed. Any failure hands the bit back.
    pub fn balloc(&self, txn: &Txn) -> Result<u32, FsError> {
        let block = {
            let mut fm = self.freemap.lock();
            let block = fm.map.alloc().ok_or(FsError::NoSpace)? as u32;
            if let Err(err) = self.write_record(txn, Record::AllocBlock { tnx: txn.id(), block }) {
                // Nothing journaled, nothing dirtied; just release the bit.
                fm.map.unmark(block as usize);
                return Err(err);
            }
            fm.dirty = true;
            self.metadata.lock().freemap.update(txn.id());
            block
        };

        if block >= self.nblocks() {
            panic!("balloc: invalid block {block}");
        }

        // Clear the block before returning it.
        if let Err(err) = self.clearblock(txn, block) {
            let mut fm = self.freemap.lock();
            fm.map.unmark(block as usize);
            // In case someone wrote the map out during the clearblock.
            fm.dirty = true;
            self.metadata.lock().freemap.update(txn.id());
            return Err(err);
        }
        Ok(block)
    }

    /// Free a block with the freemap already locked. The caller keeps the
    /// lock until its whole operation completes so nobody reallocates the
    /// block underneath it.
    pub(crate) fn bfree_prelocked(
        &self,
        fm: &mut Freemap,
        txn: &Txn,
        block: u32,
    ) -> Result<(), FsError> {
        self.write_record(txn, Record::FreeBlock { tnx: txn.id(), block })?;
        fm.map.unmark(block as usize);
        fm.dirty = true;
        self.metadata.lock().freemap.update(txn.id());
        Ok(())
    }

    /// Free a block.
    pub fn bfree(&self, txn: &Txn, block: u32) -> Result<(), FsError> {
        let mut fm = self.freemap.lock();
        self.bfree_prelocked(&mut fm, txn, block)
    }

    /// Whether a block is marked in use.
    pub fn bused(&self, block: u32) -> bool {
        if block >= self.nblocks() {
            panic!("bused called on out of range block {block}");
        }
        self.freemap.lock().map.is_set(block as usize)
    }

    /// Zero a block through the buffer cache, journaling the zeroing.
    pub fn clearblock(&self, txn: &Txn, block: u32) -> Result<(), FsError> {
        self.clearblock_internal(txn, block, true)
    }

    pub(crate) fn clearblock_internal(
        &self,
        txn: &Txn,
        block: u32,
        do_record: bool,
    ) -> Result<(), FsError> {
        let buf = self.buffers.get_noread(self.device.as_ref(), block)?;
        if do_record {
            self.write_record(txn, Record::ZeroBlock { tnx: txn.id(), block })?;
        }
        {
            let mut b = buf.lock();
            b.data.fill(0);
            b.dirty = true;
        }
        self.update_buffer_metadata(block, txn.id());
        Ok(())
    }

    /// Flush the freemap if it is dirty and clear its transaction span.
    pub(crate) fn sync_freemap(&self) -> Result<(), FsError> {
        let mut fm = self.freemap.lock();
        if fm.dirty {
            write_freemap(self.device.as_ref(), &fm.map)?;
            fm.dirty = false;
            self.metadata.lock().freemap.clear();
        }
        Ok(())
    }
}
