//! Directories and the morgue
//!
//! Fixed 64-byte directory entries: a 4-byte inode number (0 marks a
//! free slot) and a 60-byte name. Slot writes are journaled as
//! `ChangeDirentry` records with both the old and new entry.
//!
//! The morgue is a reserved directory holding files whose final unlink
//! raced a crash; its entries are reclaimed at mount.

use super::logging::Txn;
use super::record::{Record, get_u32, put_u32};
use super::{
    FsError, SFS_BLOCKSIZE, SFS_MORGUE_BLOCK, SFS_NAMELEN, SFS_NOINO, SfsFs,
};
use super::inode::TYPE_FILE;

/// Size of one directory entry on disk.
pub const DIRENTRY_SIZE: usize = 64;
/// Entries per directory data block.
pub const ENTRIES_PER_BLOCK: usize = SFS_BLOCKSIZE / DIRENTRY_SIZE;

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Direntry {
    pub ino: u32,
    pub name: [u8; SFS_NAMELEN],
}

impl Direntry {
    /// A free slot.
    pub fn empty() -> Self {
        Self {
            ino: SFS_NOINO,
            name: [0; SFS_NAMELEN],
        }
    }

    pub fn new(ino: u32, name: &str) -> Result<Self, FsError> {
        Self::from_bytes(ino, name.as_bytes())
    }

    /// Build an entry from raw name bytes (the morgue uses non-text
    /// counter names).
    pub fn from_bytes(ino: u32, name: &[u8]) -> Result<Self, FsError> {
        if name.len() >= SFS_NAMELEN {
            return Err(FsError::NameTooLong);
        }
        let mut buf = [0u8; SFS_NAMELEN];
        buf[..name.len()].copy_from_slice(name);
        Ok(Self { ino, name: buf })
    }

    pub fn name_str(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(SFS_NAMELEN);
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    fn encode_into(&self, buf: &mut [u8]) {
        put_u32(buf, 0, self.ino);
        buf[4..4 + SFS_NAMELEN].copy_from_slice(&self.name);
    }

    fn decode(buf: &[u8]) -> Self {
        let mut name = [0u8; SFS_NAMELEN];
        name.copy_from_slice(&buf[4..4 + SFS_NAMELEN]);
        Self {
            ino: get_u32(buf, 0),
            name,
        }
    }
}

impl SfsFs {
    /// Number of slots in a directory.
    pub fn dir_nentries(&self, ino: u32) -> Result<u32, FsError> {
        let inode = self.inode_load(ino)?;
        if inode.size as usize % DIRENTRY_SIZE != 0 {
            return Err(FsError::Corrupt);
        }
        Ok(inode.size / DIRENTRY_SIZE as u32)
    }

    /// Read directory slot `slot`.
    pub fn readdir(&self, ino: u32, slot: u32) -> Result<Direntry, FsError> {
        let block = self.read_file_block(ino, slot / ENTRIES_PER_BLOCK as u32)?;
        let off = (slot as usize % ENTRIES_PER_BLOCK) * DIRENTRY_SIZE;
        Ok(Direntry::decode(&block[off..off + DIRENTRY_SIZE]))
    }

    /// Rewrite directory slot `slot`, journaled with the previous entry.
    /// Writing at the current entry count appends a slot.
    pub fn writedir(&self, txn: &Txn, ino: u32, slot: u32, entry: &Direntry) -> Result<(), FsError> {
        let nentries = self.dir_nentries(ino)?;
        if slot > nentries {
            return Err(FsError::NotFound);
        }
        let old = if slot < nentries {
            self.readdir(ino, slot)?
        } else {
            Direntry::empty()
        };

        // Install the block mapping first so its records precede the
        // direntry record in the journal; redo replays in that order.
        let block = self.bmap_alloc(txn, ino, slot / ENTRIES_PER_BLOCK as u32)?;

        self.write_record(
            txn,
            Record::ChangeDirentry {
                tnx: txn.id(),
                ino,
                slot,
                old_ino: old.ino,
                old_name: old.name,
                new_ino: entry.ino,
                new_name: entry.name,
            },
        )?;
        {
            let arc = self.buffers.read(self.device.as_ref(), block)?;
            let mut buf = arc.lock();
            let off = (slot as usize % ENTRIES_PER_BLOCK) * DIRENTRY_SIZE;
            entry.encode_into(&mut buf.data[off..off + DIRENTRY_SIZE]);
            buf.dirty = true;
        }
        self.update_buffer_metadata(block, txn.id());

        if slot == nentries {
            self.inode_set_size(txn, ino, (slot + 1) * DIRENTRY_SIZE as u32)?;
        }
        Ok(())
    }

    /// Link `ino` into directory `dir_ino` under `name`, reusing a free
    /// slot if one exists. Returns the slot used.
    pub fn dir_link(&self, txn: &Txn, dir_ino: u32, entry: Direntry) -> Result<u32, FsError> {
        let nentries = self.dir_nentries(dir_ino)?;
        let mut slot = nentries;
        for i in 0..nentries {
            if self.readdir(dir_ino, i)?.ino == SFS_NOINO {
                slot = i;
                break;
            }
        }
        self.writedir(txn, dir_ino, slot, &entry)?;
        Ok(slot)
    }

    /// Clear directory slot `slot`.
    pub fn dir_unlink(&self, txn: &Txn, dir_ino: u32, slot: u32) -> Result<(), FsError> {
        self.writedir(txn, dir_ino, slot, &Direntry::empty())
    }

    /// Find `name` in `dir_ino`; returns (slot, ino).
    pub fn dir_lookup(&self, dir_ino: u32, name: &str) -> Result<Option<(u32, u32)>, FsError> {
        let nentries = self.dir_nentries(dir_ino)?;
        for slot in 0..nentries {
            let entry = self.readdir(dir_ino, slot)?;
            if entry.ino != SFS_NOINO && entry.name_str() == name {
                return Ok(Some((slot, entry.ino)));
            }
        }
        Ok(None)
    }

    /// Convenience: create a file inode and link it under `name` with a
    /// link count of one.
    pub fn create_file(&self, txn: &Txn, dir_ino: u32, name: &str) -> Result<u32, FsError> {
        let ino = self.create_inode(txn, TYPE_FILE)?;
        self.dir_link(txn, dir_ino, Direntry::new(ino, name)?)?;
        self.inode_set_linkcount(txn, ino, 1)?;
        Ok(ino)
    }

    // ------------------------------------------------------------------
    // Morgue
    // ------------------------------------------------------------------

    /// If `linkcount` hit zero while the file is still in use, park the
    /// inode in the morgue under a counter name so a crash before the
    /// final reclaim leaves it findable at the next mount.
    pub fn consider_morgue(&self, txn: &Txn, linkcount: u16, ino: u32) -> Result<(), FsError> {
        if linkcount != 0 {
            return Ok(());
        }
        let name = {
            let mut current = self.morgue_name.lock();
            let name = *current;
            advance_morgue_name(&mut current);
            name
        };
        self.dir_link(txn, SFS_MORGUE_BLOCK, Direntry::from_bytes(ino, &name)?)?;
        Ok(())
    }
}

/// Advance the 4-byte morgue counter name, skipping zero bytes (a zero
/// would terminate the name early).
fn advance_morgue_name(name: &mut [u8; 4]) {
    name[3] = name[3].wrapping_add(1);
    for i in (0..4).rev() {
        if name[i] == 0 {
            name[i] = 1;
            if i != 0 {
                name[i - 1] = name[i - 1].wrapping_add(1);
            } else {
                *name = [1, 1, 1, 1];
            }
        } else {
            break;
        }
    }
}
