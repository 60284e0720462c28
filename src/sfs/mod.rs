//! SFS journaling core
//!
//! A 512-byte-block file system with write-ahead logging and three-pass
//! crash recovery. The pieces:
//!
//! - [`journal`]: the physical journal container — an append-only,
//!   LSN-addressed circular log with trim.
//! - [`record`]: typed transaction records and their wire format.
//! - [`logging`]: the record writer and transaction lifecycle.
//! - [`buffer`]: the block buffer cache plus per-buffer transaction spans.
//! - [`balloc`]: journaled block allocation over the freemap.
//! - [`inode`], [`dir`]: journaled inode, block-mapping, and directory
//!   operations — the set recovery and the morgue need.
//! - [`checkpoint`]: journal trimming up to a proven-safe LSN.
//! - [`recovery`]: check/undo/redo at mount, plus morgue cleanup.
//!
//! On-disk layout: superblock at block 0, root directory inode at block
//! 1, morgue directory inode at block 2, freemap from block 3, journal in
//! a contiguous span described by the superblock.

pub mod balloc;
pub mod buffer;
pub mod checkpoint;
pub mod dir;
pub mod inode;
pub mod journal;
pub mod logging;
pub mod record;
pub mod recovery;

#[cfg(test)]
mod sfs_tests;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::config::CHECKPOINT_BOUND_DIVISOR;
use crate::device::{BlockDevice, DiskError, SECTOR_SIZE};
use crate::sync::{Sleeplock, Spinlock};

use balloc::Freemap;
use buffer::{BufferCache, MetadataTable};
use checkpoint::CheckpointState;
use inode::{Inode, TYPE_DIR};
use journal::Journal;
use record::{get_u32, put_u32};

/// Log sequence number. 48 bits on disk; monotonically increasing.
pub type Lsn = u64;

/// Magic number identifying an SFS volume.
pub const SFS_MAGIC: u32 = 0xabad_f001;
/// Size of our blocks.
pub const SFS_BLOCKSIZE: usize = SECTOR_SIZE;
/// Max length of the volume name.
pub const SFS_VOLNAME_SIZE: usize = 32;
/// Direct block pointers in an inode.
pub const SFS_NDIRECT: usize = 15;
/// Direct block pointers per indirect block.
pub const SFS_DBPERIDB: usize = SFS_BLOCKSIZE / 4;
/// Max length of a file name.
pub const SFS_NAMELEN: usize = 60;
/// Block the superblock lives in.
pub const SFS_SUPER_BLOCK: u32 = 0;
/// Location of the root directory inode.
pub const SFS_ROOTDIR_INO: u32 = 1;
/// The morgue directory inode.
pub const SFS_MORGUE_BLOCK: u32 = 2;
/// First block of the freemap.
pub const SFS_FREEMAP_START: u32 = 3;
/// Inode number denoting a free directory slot.
pub const SFS_NOINO: u32 = 0;

/// Bits in one freemap block.
pub const SFS_BITSPERBLOCK: usize = SFS_BLOCKSIZE * 8;

/// Freemap size in bits, rounded up to whole blocks.
pub const fn freemap_bits(nblocks: u32) -> usize {
    (nblocks as usize).div_ceil(SFS_BITSPERBLOCK) * SFS_BITSPERBLOCK
}

/// Freemap size in blocks.
pub const fn freemap_blocks(nblocks: u32) -> u32 {
    (freemap_bits(nblocks) / SFS_BITSPERBLOCK) as u32
}

// ============================================================================
// Error Types
// ============================================================================

/// File system error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// I/O error from the device layer
    IoError,
    /// No SFS volume on the device
    NoFilesystem,
    /// On-disk structure failed validation
    Corrupt,
    /// No space left on the volume
    NoSpace,
    /// The journal span is out of room
    JournalFull,
    /// Files are still open
    Busy,
    /// File or slot not found
    NotFound,
    /// Operation on something that is not a directory
    NotADirectory,
    /// Name exceeds `SFS_NAMELEN`
    NameTooLong,
}

impl core::fmt::Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FsError::IoError => write!(f, "I/O error"),
            FsError::NoFilesystem => write!(f, "No filesystem found"),
            FsError::Corrupt => write!(f, "Filesystem corrupt"),
            FsError::NoSpace => write!(f, "No space left"),
            FsError::JournalFull => write!(f, "Journal full"),
            FsError::Busy => write!(f, "Filesystem busy"),
            FsError::NotFound => write!(f, "Not found"),
            FsError::NotADirectory => write!(f, "Not a directory"),
            FsError::NameTooLong => write!(f, "Name too long"),
        }
    }
}

impl From<DiskError> for FsError {
    fn from(_: DiskError) -> Self {
        FsError::IoError
    }
}

// ============================================================================
// Superblock
// ============================================================================

/// On-disk superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    /// Number of blocks in the volume.
    pub nblocks: u32,
    pub volname: [u8; SFS_VOLNAME_SIZE],
    /// First block of the journal span.
    pub journalstart: u32,
    /// Number of blocks in the journal span.
    pub journalblocks: u32,
}

impl Superblock {
    pub fn volname_str(&self) -> &str {
        let end = self
            .volname
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(SFS_VOLNAME_SIZE);
        core::str::from_utf8(&self.volname[..end]).unwrap_or("")
    }

    pub(crate) fn encode(&self) -> [u8; SFS_BLOCKSIZE] {
        let mut buf = [0u8; SFS_BLOCKSIZE];
        put_u32(&mut buf, 0, self.magic);
        put_u32(&mut buf, 4, self.nblocks);
        buf[8..8 + SFS_VOLNAME_SIZE].copy_from_slice(&self.volname);
        put_u32(&mut buf, 40, self.journalstart);
        put_u32(&mut buf, 44, self.journalblocks);
        buf
    }

    pub(crate) fn decode(buf: &[u8; SFS_BLOCKSIZE]) -> Self {
        let mut volname = [0u8; SFS_VOLNAME_SIZE];
        volname.copy_from_slice(&buf[8..8 + SFS_VOLNAME_SIZE]);
        // Ensure null termination of the volume name.
        volname[SFS_VOLNAME_SIZE - 1] = 0;
        Self {
            magic: get_u32(buf, 0),
            nblocks: get_u32(buf, 4),
            volname,
            journalstart: get_u32(buf, 40),
            journalblocks: get_u32(buf, 44),
        }
    }
}

pub(crate) struct SuperState {
    pub sb: Superblock,
    pub dirty: bool,
}

// ============================================================================
// The mounted file system
// ============================================================================

/// A mounted SFS volume.
pub struct SfsFs {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) superblock: Spinlock<SuperState>,
    /// Free-block bitmap. The sleepable lock is held across whole
    /// allocation operations.
    pub(crate) freemap: Sleeplock<Freemap>,
    /// Transaction spans for dirty buffers and the freemap. Acquired
    /// inside the freemap lock when both are needed; never the reverse.
    pub(crate) metadata: Spinlock<MetadataTable>,
    pub(crate) buffers: BufferCache,
    pub(crate) journal: Journal,
    /// Held only across start-transaction emission, so id assignment is
    /// atomic with the LSN peek.
    pub(crate) record_lock: Sleeplock<()>,
    pub(crate) active_txns: Spinlock<Vec<Lsn>>,
    pub(crate) checkpoint_state: CheckpointState,
    /// While set, the record writer is a no-op.
    pub(crate) in_recovery: AtomicBool,
    /// Counter name for the next morgue entry.
    pub(crate) morgue_name: Spinlock<[u8; 4]>,
    open_files: AtomicUsize,
}

impl SfsFs {
    /// Mount the volume on `device`: validate the superblock, load the
    /// freemap and the journal, run recovery, process the morgue, and
    /// arm the checkpointer.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Arc<SfsFs>, FsError> {
        let mut buf = [0u8; SFS_BLOCKSIZE];
        device.read_block(SFS_SUPER_BLOCK as u64, &mut buf)?;
        let sb = Superblock::decode(&buf);

        if sb.magic != SFS_MAGIC {
            log::warn!(
                "[SFS] wrong magic in superblock ({:#x}, should be {:#x})",
                sb.magic,
                SFS_MAGIC
            );
            return Err(FsError::NoFilesystem);
        }
        if sb.journalblocks >= sb.nblocks {
            log::warn!("[SFS] journal takes up whole volume");
        }
        if u64::from(sb.nblocks) > device.num_blocks() {
            log::warn!(
                "[SFS] fs has {} blocks, device has {}",
                sb.nblocks,
                device.num_blocks()
            );
        }

        let freemap = balloc::load_freemap(device.as_ref(), sb.nblocks)?;
        let journal = Journal::load(device.clone(), sb.journalstart, sb.journalblocks)?;
        let journal_bytes = u64::from(sb.journalblocks) * SFS_BLOCKSIZE as u64;

        let fs = Arc::new(SfsFs {
            device,
            superblock: Spinlock::new(SuperState { sb, dirty: false }),
            freemap: Sleeplock::new(Freemap {
                map: freemap,
                dirty: false,
            }),
            metadata: Spinlock::new(MetadataTable::new()),
            buffers: BufferCache::new(),
            journal,
            record_lock: Sleeplock::new(()),
            active_txns: Spinlock::new(Vec::new()),
            checkpoint_state: CheckpointState::new(),
            in_recovery: AtomicBool::new(true),
            morgue_name: Spinlock::new([1, 1, 1, 1]),
            open_files: AtomicUsize::new(0),
        });

        log::info!("[SFS] mounting volume '{}'", fs.volname());
        log::info!("[SFS] running recovery");
        fs.recover()?;
        fs.in_recovery.store(false, Ordering::Release);

        // The journal is live again; morgue cleanup is an ordinary
        // transaction.
        fs.process_morgue()?;

        // Recovery effects must be on disk before the mount-time trim.
        fs.sync()?;
        fs.checkpoint();
        fs.checkpoint_state
            .bound
            .store(journal_bytes / CHECKPOINT_BOUND_DIVISOR, Ordering::Release);
        fs.checkpoint_state.run.store(true, Ordering::Release);

        log::info!("[SFS] mount complete");
        Ok(fs)
    }

    /// Unmount. Refused while any file is open; otherwise syncs
    /// everything and stops the checkpointer.
    pub fn unmount(&self) -> Result<(), FsError> {
        if self.open_files.load(Ordering::Acquire) > 0 {
            return Err(FsError::Busy);
        }
        self.sync()?;
        self.checkpoint_stop();
        debug_assert!(!self.freemap.lock().dirty);
        self.buffers.drop_all();
        log::info!("[SFS] unmounted '{}'", self.volname());
        Ok(())
    }

    /// Flush dirty buffers, the freemap, and the superblock.
    pub fn sync(&self) -> Result<(), FsError> {
        self.buffers.sync(self.device.as_ref(), &self.metadata)?;
        self.sync_freemap()?;
        self.sync_superblock()?;
        Ok(())
    }

    fn sync_superblock(&self) -> Result<(), FsError> {
        let mut state = self.superblock.lock();
        if state.dirty {
            let buf = state.sb.encode();
            self.device.write_block(SFS_SUPER_BLOCK as u64, &buf)?;
            state.dirty = false;
        }
        Ok(())
    }

    pub fn volname(&self) -> alloc::string::String {
        let state = self.superblock.lock();
        alloc::string::String::from(state.sb.volname_str())
    }

    pub(crate) fn nblocks(&self) -> u32 {
        self.superblock.lock().sb.nblocks
    }

    /// The external file layer reports opens/closes here; unmount is
    /// refused while the count is nonzero.
    pub fn file_opened(&self) {
        self.open_files.fetch_add(1, Ordering::AcqRel);
    }

    pub fn file_closed(&self) {
        self.open_files.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn recovering(&self) -> bool {
        self.in_recovery.load(Ordering::Acquire)
    }
}

// ============================================================================
// mkfs
// ============================================================================

/// Format `device` as an empty SFS volume with a journal of
/// `journal_blocks` blocks at the end of the disk.
pub fn mkfs(device: &dyn BlockDevice, volname: &str, journal_blocks: u32) -> Result<(), FsError> {
    let nblocks = device.num_blocks() as u32;
    let fm_blocks = freemap_blocks(nblocks);
    if journal_blocks < 2 || SFS_FREEMAP_START + fm_blocks + journal_blocks >= nblocks {
        return Err(FsError::NoSpace);
    }
    let journalstart = nblocks - journal_blocks;

    let mut volname_buf = [0u8; SFS_VOLNAME_SIZE];
    let name_bytes = volname.as_bytes();
    if name_bytes.len() >= SFS_VOLNAME_SIZE {
        return Err(FsError::NameTooLong);
    }
    volname_buf[..name_bytes.len()].copy_from_slice(name_bytes);

    let sb = Superblock {
        magic: SFS_MAGIC,
        nblocks,
        volname: volname_buf,
        journalstart,
        journalblocks: journal_blocks,
    };
    device.write_block(SFS_SUPER_BLOCK as u64, &sb.encode())?;

    // Root and morgue directories, both empty.
    let root = Inode::new(TYPE_DIR);
    device.write_block(SFS_ROOTDIR_INO as u64, &root.encode())?;
    let morgue = Inode::new(TYPE_DIR);
    device.write_block(SFS_MORGUE_BLOCK as u64, &morgue.encode())?;

    // Freemap: superblock, root, morgue, the freemap itself, the journal
    // span, and the rounding tail past the end of the device are in use.
    let mut map = crate::bitmap::Bitmap::new(freemap_bits(nblocks));
    for b in 0..SFS_FREEMAP_START + fm_blocks {
        map.mark(b as usize);
    }
    for b in journalstart..nblocks {
        map.mark(b as usize);
    }
    for b in nblocks as usize..freemap_bits(nblocks) {
        map.mark(b);
    }
    balloc::write_freemap(device, &map)?;

    // Blank journal: all-zero headers are invalid by construction.
    let zero = [0u8; SFS_BLOCKSIZE];
    for b in journalstart..nblocks {
        device.write_block(b as u64, &zero)?;
    }

    Ok(())
}

/// Read one u32 slot out of a raw block image.
pub(crate) fn block_slot(buf: &[u8; SFS_BLOCKSIZE], slot: usize) -> u32 {
    get_u32(buf, slot * 4)
}

/// Write one u32 slot into a raw block image.
pub(crate) fn set_block_slot(buf: &mut [u8; SFS_BLOCKSIZE], slot: usize, val: u32) {
    put_u32(buf, slot * 4, val);
}
