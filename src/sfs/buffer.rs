//! Block buffer cache
//!
//! A block-indexed cache of 512-byte buffers with dirty tracking. For
//! each dirty buffer (and for the freemap) the metadata table keeps the
//! span of transactions that touched it — `(oldest, newest)` ids — which
//! is what checkpointing uses to compute the keep LSN.
//!
//! Lock ordering: the metadata lock may be taken while a buffer lock is
//! wanted, never the reverse; callers update metadata after dropping the
//! buffer lock.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::device::BlockDevice;
use crate::sync::Spinlock;

use super::{FsError, Lsn, SFS_BLOCKSIZE, SfsFs};

/// The transactions that last touched a piece of state.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxnSpan {
    pub oldest: Lsn,
    pub newest: Lsn,
}

impl TxnSpan {
    pub fn update(&mut self, tnx: Lsn) {
        if tnx == 0 {
            return;
        }
        if self.oldest == 0 {
            self.oldest = tnx;
        }
        if self.newest < tnx {
            self.newest = tnx;
        }
    }

    pub fn clear(&mut self) {
        self.oldest = 0;
        self.newest = 0;
    }
}

/// Transaction spans for dirty buffers and the freemap.
pub struct MetadataTable {
    pub buffers: BTreeMap<u32, TxnSpan>,
    pub freemap: TxnSpan,
}

impl MetadataTable {
    pub(crate) fn new() -> Self {
        Self {
            buffers: BTreeMap::new(),
            freemap: TxnSpan::default(),
        }
    }
}

/// One cached block.
pub struct Buffer {
    pub data: [u8; SFS_BLOCKSIZE],
    pub dirty: bool,
}

/// The cache itself.
pub struct BufferCache {
    map: Spinlock<BTreeMap<u32, Arc<Spinlock<Buffer>>>>,
}

impl BufferCache {
    pub(crate) fn new() -> Self {
        Self {
            map: Spinlock::new(BTreeMap::new()),
        }
    }

    fn entry(
        &self,
        device: &dyn BlockDevice,
        block: u32,
        read: bool,
    ) -> Result<Arc<Spinlock<Buffer>>, FsError> {
        if let Some(buf) = self.map.lock().get(&block) {
            return Ok(buf.clone());
        }
        let mut data = [0u8; SFS_BLOCKSIZE];
        if read {
            device.read_block(u64::from(block), &mut data)?;
        }
        let buf = Arc::new(Spinlock::new(Buffer { data, dirty: false }));
        // Someone may have raced the insert; keep whichever won.
        Ok(self
            .map
            .lock()
            .entry(block)
            .or_insert_with(|| buf.clone())
            .clone())
    }

    /// Get the buffer for `block`, reading it from disk on a miss.
    pub(crate) fn read(
        &self,
        device: &dyn BlockDevice,
        block: u32,
    ) -> Result<Arc<Spinlock<Buffer>>, FsError> {
        self.entry(device, block, true)
    }

    /// Get the buffer for `block` without reading the device; used when
    /// the caller is about to overwrite the whole block.
    pub(crate) fn get_noread(
        &self,
        device: &dyn BlockDevice,
        block: u32,
    ) -> Result<Arc<Spinlock<Buffer>>, FsError> {
        self.entry(device, block, false)
    }

    /// Write every dirty buffer back and clear its transaction span.
    pub(crate) fn sync(
        &self,
        device: &dyn BlockDevice,
        metadata: &Spinlock<MetadataTable>,
    ) -> Result<(), FsError> {
        let buffers: Vec<(u32, Arc<Spinlock<Buffer>>)> = self
            .map
            .lock()
            .iter()
            .map(|(b, a)| (*b, a.clone()))
            .collect();
        for (block, arc) in buffers {
            let mut buf = arc.lock();
            if buf.dirty {
                device.write_block(u64::from(block), &buf.data)?;
                buf.dirty = false;
                drop(buf);
                metadata.lock().buffers.remove(&block);
            }
        }
        Ok(())
    }

    /// Blocks whose buffers are currently dirty.
    pub(crate) fn dirty_blocks(&self) -> Vec<u32> {
        self.map
            .lock()
            .iter()
            .filter(|(_, arc)| arc.lock().dirty)
            .map(|(b, _)| *b)
            .collect()
    }

    /// Invalidate everything. All buffers must be clean.
    pub(crate) fn drop_all(&self) {
        let mut map = self.map.lock();
        for (block, arc) in map.iter() {
            debug_assert!(!arc.lock().dirty, "dropping dirty buffer for block {block}");
        }
        map.clear();
    }
}

impl SfsFs {
    /// Record that `tnx` touched the buffer for `block`. Called after the
    /// buffer lock has been dropped.
    pub(crate) fn update_buffer_metadata(&self, block: u32, tnx: Lsn) {
        self.metadata
            .lock()
            .buffers
            .entry(block)
            .or_default()
            .update(tnx);
    }
}
