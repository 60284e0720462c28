//! Inodes and block mapping
//!
//! An inode occupies a whole block: size, type, link count, 15 direct
//! pointers, one single-, one double-, and one triple-indirect pointer.
//! Inode numbers are the block numbers the inodes live in.
//!
//! Every mutation here is journaled with old and new values: pointer
//! installs and clears, size changes, link counts, type changes, and
//! file-data writes (which carry a checksum of the new contents).

use alloc::vec::Vec;

use super::logging::Txn;
use super::record::{IndLevel, Record, fletcher32, get_u16, get_u32, put_u16, put_u32};
use super::{
    FsError, Lsn, SFS_BLOCKSIZE, SFS_DBPERIDB, SFS_NDIRECT, SfsFs, block_slot, set_block_slot,
};

/// Should not appear on disk.
pub const TYPE_INVAL: u16 = 0;
pub const TYPE_FILE: u16 = 1;
pub const TYPE_DIR: u16 = 2;

/// An in-memory inode image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub size: u32,
    pub typ: u16,
    pub linkcount: u16,
    pub direct: [u32; SFS_NDIRECT],
    pub indirect: u32,
    pub dindirect: u32,
    pub tindirect: u32,
}

impl Inode {
    pub fn new(typ: u16) -> Self {
        Self {
            size: 0,
            typ,
            linkcount: 0,
            direct: [0; SFS_NDIRECT],
            indirect: 0,
            dindirect: 0,
            tindirect: 0,
        }
    }

    pub(crate) fn encode(&self) -> [u8; SFS_BLOCKSIZE] {
        let mut buf = [0u8; SFS_BLOCKSIZE];
        self.encode_into(&mut buf);
        buf
    }

    pub(crate) fn encode_into(&self, buf: &mut [u8; SFS_BLOCKSIZE]) {
        buf.fill(0);
        put_u32(buf, 0, self.size);
        put_u16(buf, 4, self.typ);
        put_u16(buf, 6, self.linkcount);
        for (i, ptr) in self.direct.iter().enumerate() {
            put_u32(buf, 8 + i * 4, *ptr);
        }
        put_u32(buf, 8 + SFS_NDIRECT * 4, self.indirect);
        put_u32(buf, 12 + SFS_NDIRECT * 4, self.dindirect);
        put_u32(buf, 16 + SFS_NDIRECT * 4, self.tindirect);
    }

    pub(crate) fn decode(buf: &[u8; SFS_BLOCKSIZE]) -> Self {
        let mut direct = [0u32; SFS_NDIRECT];
        for (i, ptr) in direct.iter_mut().enumerate() {
            *ptr = get_u32(buf, 8 + i * 4);
        }
        Self {
            size: get_u32(buf, 0),
            typ: get_u16(buf, 4),
            linkcount: get_u16(buf, 6),
            direct,
            indirect: get_u32(buf, 8 + SFS_NDIRECT * 4),
            dindirect: get_u32(buf, 12 + SFS_NDIRECT * 4),
            tindirect: get_u32(buf, 16 + SFS_NDIRECT * 4),
        }
    }
}

impl SfsFs {
    /// Load an inode image through the buffer cache.
    pub fn inode_load(&self, ino: u32) -> Result<Inode, FsError> {
        let arc = self.buffers.read(self.device.as_ref(), ino)?;
        let buf = arc.lock();
        Ok(Inode::decode(&buf.data))
    }

    /// Rewrite an inode in place and mark its buffer dirty.
    pub(crate) fn inode_update(
        &self,
        ino: u32,
        tnx: Lsn,
        f: impl FnOnce(&mut Inode),
    ) -> Result<(), FsError> {
        let arc = self.buffers.read(self.device.as_ref(), ino)?;
        {
            let mut buf = arc.lock();
            let mut inode = Inode::decode(&buf.data);
            f(&mut inode);
            inode.encode_into(&mut buf.data);
            buf.dirty = true;
        }
        self.update_buffer_metadata(ino, tnx);
        Ok(())
    }

    /// Turn a freshly allocated block into an inode of the given type.
    pub fn create_inode(&self, txn: &Txn, typ: u16) -> Result<u32, FsError> {
        let ino = self.balloc(txn)?;
        self.write_record(
            txn,
            Record::ChangeInodeType {
                tnx: txn.id(),
                ino,
                old_type: TYPE_INVAL,
                new_type: typ,
            },
        )?;
        self.inode_update(ino, txn.id(), |inode| inode.typ = typ)?;
        Ok(ino)
    }

    pub fn inode_set_size(&self, txn: &Txn, ino: u32, new_size: u32) -> Result<(), FsError> {
        let inode = self.inode_load(ino)?;
        self.write_record(
            txn,
            Record::ChangeSize {
                tnx: txn.id(),
                ino,
                old_size: inode.size,
                new_size,
                ityp: inode.typ,
            },
        )?;
        self.inode_update(ino, txn.id(), |i| i.size = new_size)
    }

    pub fn inode_set_linkcount(&self, txn: &Txn, ino: u32, new_count: u16) -> Result<(), FsError> {
        let inode = self.inode_load(ino)?;
        self.write_record(
            txn,
            Record::ChangeLinkCount {
                tnx: txn.id(),
                ino,
                old_count: inode.linkcount,
                new_count,
                ityp: inode.typ,
            },
        )?;
        self.inode_update(ino, txn.id(), |i| i.linkcount = new_count)
    }

    pub fn inode_set_type(&self, txn: &Txn, ino: u32, new_type: u16) -> Result<(), FsError> {
        let inode = self.inode_load(ino)?;
        self.write_record(
            txn,
            Record::ChangeInodeType {
                tnx: txn.id(),
                ino,
                old_type: inode.typ,
                new_type,
            },
        )?;
        self.inode_update(ino, txn.id(), |i| i.typ = new_type)
    }

    // ------------------------------------------------------------------
    // Block mapping
    // ------------------------------------------------------------------

    fn indirect_slot(&self, iblock: u32, slot: usize) -> Result<u32, FsError> {
        let arc = self.buffers.read(self.device.as_ref(), iblock)?;
        let buf = arc.lock();
        Ok(block_slot(&buf.data, slot))
    }

    /// Read the pointer at `slot` of indirect block `iblock`, allocating
    /// and journaling a fresh block there if it is a hole.
    fn indirect_slot_alloc(&self, txn: &Txn, iblock: u32, slot: usize) -> Result<u32, FsError> {
        let cur = self.indirect_slot(iblock, slot)?;
        if cur != 0 {
            return Ok(cur);
        }
        let fresh = self.balloc(txn)?;
        self.write_record(
            txn,
            Record::ChangeInoInIndirect {
                tnx: txn.id(),
                block: iblock,
                slot: slot as u32,
                old_ptr: 0,
                new_ptr: fresh,
            },
        )?;
        {
            let arc = self.buffers.read(self.device.as_ref(), iblock)?;
            let mut buf = arc.lock();
            set_block_slot(&mut buf.data, slot, fresh);
            buf.dirty = true;
        }
        self.update_buffer_metadata(iblock, txn.id());
        Ok(fresh)
    }

    /// Make sure the inode's indirect pointer at `level` exists.
    fn ensure_indirect(&self, txn: &Txn, ino: u32, level: IndLevel) -> Result<u32, FsError> {
        let inode = self.inode_load(ino)?;
        let cur = match level {
            IndLevel::Single => inode.indirect,
            IndLevel::Double => inode.dindirect,
            IndLevel::Triple => inode.tindirect,
        };
        if cur != 0 {
            return Ok(cur);
        }
        let fresh = self.balloc(txn)?;
        self.write_record(
            txn,
            Record::ChangeIndirectPtr {
                tnx: txn.id(),
                ino,
                level,
                old_ptr: 0,
                new_ptr: fresh,
                ityp: inode.typ,
            },
        )?;
        self.inode_update(ino, txn.id(), |i| match level {
            IndLevel::Single => i.indirect = fresh,
            IndLevel::Double => i.dindirect = fresh,
            IndLevel::Triple => i.tindirect = fresh,
        })?;
        Ok(fresh)
    }

    /// Disk block backing file block `fileblock`, or 0 for a hole.
    pub fn bmap_read(&self, ino: u32, fileblock: u32) -> Result<u32, FsError> {
        let inode = self.inode_load(ino)?;
        let db = SFS_DBPERIDB as u32;
        let mut fb = fileblock;

        if fb < SFS_NDIRECT as u32 {
            return Ok(inode.direct[fb as usize]);
        }
        fb -= SFS_NDIRECT as u32;

        if fb < db {
            if inode.indirect == 0 {
                return Ok(0);
            }
            return self.indirect_slot(inode.indirect, fb as usize);
        }
        fb -= db;

        if fb < db * db {
            if inode.dindirect == 0 {
                return Ok(0);
            }
            let l1 = self.indirect_slot(inode.dindirect, (fb / db) as usize)?;
            if l1 == 0 {
                return Ok(0);
            }
            return self.indirect_slot(l1, (fb % db) as usize);
        }
        fb -= db * db;

        if fb < db * db * db {
            if inode.tindirect == 0 {
                return Ok(0);
            }
            let l2 = self.indirect_slot(inode.tindirect, (fb / (db * db)) as usize)?;
            if l2 == 0 {
                return Ok(0);
            }
            let l1 = self.indirect_slot(l2, ((fb / db) % db) as usize)?;
            if l1 == 0 {
                return Ok(0);
            }
            return self.indirect_slot(l1, (fb % db) as usize);
        }
        Err(FsError::NoSpace)
    }

    /// Disk block backing file block `fileblock`, allocating the whole
    /// chain on the way down if needed.
    pub fn bmap_alloc(&self, txn: &Txn, ino: u32, fileblock: u32) -> Result<u32, FsError> {
        let db = SFS_DBPERIDB as u32;
        let mut fb = fileblock;

        if fb < SFS_NDIRECT as u32 {
            let inode = self.inode_load(ino)?;
            let slot = fb as usize;
            if inode.direct[slot] != 0 {
                return Ok(inode.direct[slot]);
            }
            let fresh = self.balloc(txn)?;
            self.write_record(
                txn,
                Record::ChangeDirectPtr {
                    tnx: txn.id(),
                    ino,
                    slot: fb,
                    old_ptr: 0,
                    new_ptr: fresh,
                    ityp: inode.typ,
                },
            )?;
            self.inode_update(ino, txn.id(), |i| i.direct[slot] = fresh)?;
            return Ok(fresh);
        }
        fb -= SFS_NDIRECT as u32;

        if fb < db {
            let ib = self.ensure_indirect(txn, ino, IndLevel::Single)?;
            return self.indirect_slot_alloc(txn, ib, fb as usize);
        }
        fb -= db;

        if fb < db * db {
            let ib = self.ensure_indirect(txn, ino, IndLevel::Double)?;
            let l1 = self.indirect_slot_alloc(txn, ib, (fb / db) as usize)?;
            return self.indirect_slot_alloc(txn, l1, (fb % db) as usize);
        }
        fb -= db * db;

        if fb < db * db * db {
            let ib = self.ensure_indirect(txn, ino, IndLevel::Triple)?;
            let l2 = self.indirect_slot_alloc(txn, ib, (fb / (db * db)) as usize)?;
            let l1 = self.indirect_slot_alloc(txn, l2, ((fb / db) % db) as usize)?;
            return self.indirect_slot_alloc(txn, l1, (fb % db) as usize);
        }
        Err(FsError::NoSpace)
    }

    // ------------------------------------------------------------------
    // File data
    // ------------------------------------------------------------------

    /// Read one block of file data; holes read as zeros.
    pub fn read_file_block(&self, ino: u32, fileblock: u32) -> Result<[u8; SFS_BLOCKSIZE], FsError> {
        let block = self.bmap_read(ino, fileblock)?;
        if block == 0 {
            return Ok([0u8; SFS_BLOCKSIZE]);
        }
        let arc = self.buffers.read(self.device.as_ref(), block)?;
        let buf = arc.lock();
        Ok(buf.data)
    }

    /// Write one block of file data, journaling a `WriteBlock` record
    /// carrying the checksum of the new contents.
    pub fn write_file_block(
        &self,
        txn: &Txn,
        ino: u32,
        fileblock: u32,
        data: &[u8; SFS_BLOCKSIZE],
    ) -> Result<u32, FsError> {
        let block = self.bmap_alloc(txn, ino, fileblock)?;
        self.write_record(
            txn,
            Record::WriteBlock {
                tnx: txn.id(),
                block,
                checksum: fletcher32(data),
            },
        )?;
        {
            let arc = self.buffers.get_noread(self.device.as_ref(), block)?;
            let mut buf = arc.lock();
            buf.data.copy_from_slice(data);
            buf.dirty = true;
        }
        self.update_buffer_metadata(block, txn.id());
        Ok(block)
    }

    // ------------------------------------------------------------------
    // Truncate
    // ------------------------------------------------------------------

    /// Free every block the inode references and reset its size to zero.
    pub fn itrunc(&self, txn: &Txn, ino: u32) -> Result<(), FsError> {
        let inode = self.inode_load(ino)?;

        for (slot, ptr) in inode.direct.iter().enumerate() {
            if *ptr != 0 {
                self.write_record(
                    txn,
                    Record::ChangeDirectPtr {
                        tnx: txn.id(),
                        ino,
                        slot: slot as u32,
                        old_ptr: *ptr,
                        new_ptr: 0,
                        ityp: inode.typ,
                    },
                )?;
                self.bfree(txn, *ptr)?;
            }
        }

        for (level, ptr) in [
            (IndLevel::Single, inode.indirect),
            (IndLevel::Double, inode.dindirect),
            (IndLevel::Triple, inode.tindirect),
        ] {
            if ptr == 0 {
                continue;
            }
            let depth = match level {
                IndLevel::Single => 1,
                IndLevel::Double => 2,
                IndLevel::Triple => 3,
            };
            self.free_indirect_tree(txn, ptr, depth)?;
            self.write_record(
                txn,
                Record::ChangeIndirectPtr {
                    tnx: txn.id(),
                    ino,
                    level,
                    old_ptr: ptr,
                    new_ptr: 0,
                    ityp: inode.typ,
                },
            )?;
        }

        self.write_record(
            txn,
            Record::ChangeSize {
                tnx: txn.id(),
                ino,
                old_size: inode.size,
                new_size: 0,
                ityp: inode.typ,
            },
        )?;
        self.inode_update(ino, txn.id(), |i| {
            i.size = 0;
            i.direct = [0; SFS_NDIRECT];
            i.indirect = 0;
            i.dindirect = 0;
            i.tindirect = 0;
        })
    }

    fn free_indirect_tree(&self, txn: &Txn, iblock: u32, depth: u32) -> Result<(), FsError> {
        let ptrs: Vec<u32> = {
            let arc = self.buffers.read(self.device.as_ref(), iblock)?;
            let buf = arc.lock();
            (0..SFS_DBPERIDB).map(|i| block_slot(&buf.data, i)).collect()
        };
        for ptr in ptrs.into_iter().filter(|&p| p != 0) {
            if depth == 1 {
                self.bfree(txn, ptr)?;
            } else {
                self.free_indirect_tree(txn, ptr, depth - 1)?;
            }
        }
        self.bfree(txn, iblock)
    }
}
