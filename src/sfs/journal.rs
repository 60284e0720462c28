//! Physical journal container
//!
//! An append-only, LSN-addressed circular log over the journal span of
//! the volume. Records never span blocks: when the next record does not
//! fit, the tail of the current block is covered by a `Pad` container
//! record (or left zeroed when even a header will not fit — a zero
//! header is invalid, so the scanner just moves to the next block).
//!
//! Appends are write-through: a record is on disk before the call
//! returns, which is what makes the log a write-ahead log. `trim(lsn)`
//! emits a `Trim` container record; everything older than the named LSN
//! may then be overwritten. The odometer counts bytes appended since it
//! was last cleared and drives checkpoint scheduling.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::device::BlockDevice;
use crate::sync::Spinlock;

use super::record::{
    CLASS_CLIENT, CLASS_CONTAINER, REC_PAD, REC_TRIM, Record, pack_header, put_u64, unpack_header,
};
use super::{FsError, Lsn, SFS_BLOCKSIZE};

struct BlockInfo {
    /// Block index within the journal span.
    index: u32,
    /// LSN of the first record written to the block.
    first_lsn: Lsn,
}

struct JournalState {
    /// Next LSN to assign.
    next_lsn: Lsn,
    /// Records below this LSN have been trimmed.
    tail_lsn: Lsn,
    /// Block currently being filled, within the span.
    cur_block: u32,
    cur_off: usize,
    cur_buf: [u8; SFS_BLOCKSIZE],
    /// Blocks holding live records, oldest first; includes `cur_block`
    /// once it holds a record.
    live_blocks: VecDeque<BlockInfo>,
    /// Bytes appended since the last checkpoint.
    odometer: u64,
    /// Live records decoded at load time, consumed by recovery.
    window: Vec<(Lsn, Record)>,
}

/// The journal container for one volume.
pub struct Journal {
    device: Arc<dyn BlockDevice>,
    start: u32,
    nblocks: u32,
    state: Spinlock<JournalState>,
}

impl Journal {
    /// Scan the journal span, decode the live record window (everything
    /// at or past the newest trim point), and position the writer on the
    /// block after the newest record.
    pub(crate) fn load(
        device: Arc<dyn BlockDevice>,
        start: u32,
        nblocks: u32,
    ) -> Result<Journal, FsError> {
        assert!(nblocks >= 2, "journal span too small");

        let mut all: BTreeMap<Lsn, Record> = BTreeMap::new();
        let mut block_first: BTreeMap<Lsn, u32> = BTreeMap::new();
        let mut tail: Lsn = 1;
        let mut max_lsn: Lsn = 0;
        let mut max_block: Option<u32> = None;

        for b in 0..nblocks {
            let mut buf = [0u8; SFS_BLOCKSIZE];
            device.read_block(u64::from(start + b), &mut buf)?;
            let mut off = 0;
            let mut first_in_block: Option<Lsn> = None;
            while off + 8 <= SFS_BLOCKSIZE {
                let header = super::record::get_u64(&buf, off);
                if header == 0 {
                    break;
                }
                let (class, typ, len, lsn) = unpack_header(header);
                if len < 8 || off + len > SFS_BLOCKSIZE || lsn == 0 {
                    return Err(FsError::Corrupt);
                }
                if first_in_block.is_none() {
                    first_in_block = Some(lsn);
                }
                if lsn > max_lsn {
                    max_lsn = lsn;
                    max_block = Some(b);
                }
                let payload = &buf[off + 8..off + len];
                match class {
                    CLASS_CONTAINER => match typ {
                        REC_PAD => {}
                        REC_TRIM => {
                            if let Record::Trim { tail: t } = Record::decode(typ, payload)? {
                                tail = tail.max(t);
                            }
                        }
                        _ => return Err(FsError::Corrupt),
                    },
                    CLASS_CLIENT => {
                        all.insert(lsn, Record::decode(typ, payload)?);
                    }
                    _ => unreachable!(),
                }
                off += len;
            }
            if let Some(first) = first_in_block {
                block_first.insert(first, b);
            }
        }

        let window: Vec<(Lsn, Record)> = all.range(tail..).map(|(l, r)| (*l, r.clone())).collect();

        let (cur_block, next_lsn, tail_lsn) = match max_block {
            None => (0, 1, 1),
            Some(mb) => ((mb + 1) % nblocks, max_lsn + 1, tail),
        };

        // Rebuild the live-block list: every block whose first record is
        // at or past the tail, plus the block that contains the tail.
        let mut live_blocks: VecDeque<BlockInfo> = VecDeque::new();
        let mut tail_holder: Option<(Lsn, u32)> = None;
        for (&first, &idx) in &block_first {
            if first >= tail_lsn {
                live_blocks.push_back(BlockInfo {
                    index: idx,
                    first_lsn: first,
                });
            } else {
                tail_holder = Some((first, idx));
            }
        }
        if let Some((first, idx)) = tail_holder {
            live_blocks.push_front(BlockInfo {
                index: idx,
                first_lsn: first,
            });
        }
        if live_blocks.iter().any(|b| b.index == cur_block) {
            return Err(FsError::JournalFull);
        }

        log::debug!(
            "[Journal] loaded: {} live records, tail lsn {}, next lsn {}",
            window.len(),
            tail_lsn,
            next_lsn
        );

        Ok(Journal {
            device,
            start,
            nblocks,
            state: Spinlock::new(JournalState {
                next_lsn,
                tail_lsn,
                cur_block,
                cur_off: 0,
                cur_buf: [0u8; SFS_BLOCKSIZE],
                live_blocks,
                odometer: 0,
                window,
            }),
        })
    }

    /// Take the live window decoded at load time. Recovery calls this
    /// exactly once.
    pub(crate) fn take_window(&self) -> Vec<(Lsn, Record)> {
        core::mem::take(&mut self.state.lock().window)
    }

    /// The LSN the next appended record will get.
    pub fn peek_next_lsn(&self) -> Lsn {
        self.state.lock().next_lsn
    }

    /// LSN below which records have been trimmed away.
    pub fn tail_lsn(&self) -> Lsn {
        self.state.lock().tail_lsn
    }

    /// Bytes appended since the odometer was last cleared.
    pub fn odometer(&self) -> u64 {
        self.state.lock().odometer
    }

    pub fn clear_odometer(&self) {
        self.state.lock().odometer = 0;
    }

    /// Append a record, assign it the next LSN, and write it through to
    /// the device.
    pub(crate) fn append(&self, rec: &Record) -> Result<Lsn, FsError> {
        let payload = rec.encode_payload();
        let total = 8 + payload.len();
        let occupied = (total + 1) / 2 * 2;
        assert!(occupied <= SFS_BLOCKSIZE);

        let mut st = self.state.lock();

        if st.cur_off + occupied > SFS_BLOCKSIZE {
            let remaining = SFS_BLOCKSIZE - st.cur_off;
            if remaining >= 8 {
                let lsn = st.next_lsn;
                st.next_lsn += 1;
                let header = pack_header(CLASS_CONTAINER, REC_PAD, remaining, lsn);
                let off = st.cur_off;
                put_u64(&mut st.cur_buf, off, header);
                st.cur_off = SFS_BLOCKSIZE;
                st.odometer += remaining as u64;
            }
            self.flush_current(&st)?;
            self.advance_block(&mut st)?;
        }

        let lsn = st.next_lsn;
        st.next_lsn += 1;
        if st.cur_off == 0 {
            let index = st.cur_block;
            st.live_blocks.push_back(BlockInfo {
                index,
                first_lsn: lsn,
            });
        }

        let header = pack_header(rec.class(), rec.type_code(), total, lsn);
        let off = st.cur_off;
        put_u64(&mut st.cur_buf, off, header);
        st.cur_buf[off + 8..off + total].copy_from_slice(&payload);
        st.cur_off += occupied;
        st.odometer += occupied as u64;

        self.flush_current(&st)?;
        Ok(lsn)
    }

    /// Discard everything below `keep`: emit a trim record, advance the
    /// tail, and release dead blocks for reuse.
    pub(crate) fn trim(&self, keep: Lsn) -> Result<(), FsError> {
        self.append(&Record::Trim { tail: keep })?;
        let mut st = self.state.lock();
        if keep > st.tail_lsn {
            st.tail_lsn = keep;
        }
        while st.live_blocks.len() >= 2 && st.live_blocks[1].first_lsn <= keep {
            st.live_blocks.pop_front();
        }
        log::debug!("[Journal] trimmed up to lsn {}", keep);
        Ok(())
    }

    fn flush_current(&self, st: &JournalState) -> Result<(), FsError> {
        self.device
            .write_block(u64::from(self.start + st.cur_block), &st.cur_buf)?;
        Ok(())
    }

    fn advance_block(&self, st: &mut JournalState) -> Result<(), FsError> {
        let next = (st.cur_block + 1) % self.nblocks;
        if st.live_blocks.front().map(|b| b.index) == Some(next) {
            return Err(FsError::JournalFull);
        }
        st.cur_block = next;
        st.cur_off = 0;
        st.cur_buf = [0u8; SFS_BLOCKSIZE];
        Ok(())
    }
}
