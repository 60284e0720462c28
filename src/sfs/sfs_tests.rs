//! SFS tests
//!
//! Journal container behavior, record wire format, and the crash
//! scenarios: aborted transactions, torn writes, protected blocks, the
//! morgue, checkpoint bounds, and recovery idempotence. "Crash" means
//! dropping the mounted file system without syncing and remounting the
//! same RAM disk.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::device::RamDisk;

use super::dir::Direntry;
use super::inode::{TYPE_FILE, TYPE_INVAL};
use super::journal::Journal;
use super::record::{IndLevel, LogOp, Record, fletcher32, pack_header, unpack_header};
use super::*;

const DISK_BLOCKS: u64 = 512;
const JOURNAL_BLOCKS: u32 = 64;
const JOURNAL_START: u32 = DISK_BLOCKS as u32 - JOURNAL_BLOCKS;

fn fresh_fs() -> (Arc<RamDisk>, Arc<SfsFs>) {
    let disk = Arc::new(RamDisk::new(DISK_BLOCKS));
    mkfs(disk.as_ref(), "testvol", JOURNAL_BLOCKS).unwrap();
    let fs = SfsFs::mount(disk.clone()).unwrap();
    (disk, fs)
}

fn remount(disk: &Arc<RamDisk>) -> Arc<SfsFs> {
    SfsFs::mount(disk.clone()).unwrap()
}

// ============================================================================
// Mount / unmount
// ============================================================================

#[test]
fn mkfs_mount_unmount() {
    let (_disk, fs) = fresh_fs();
    assert_eq!(fs.volname(), "testvol");
    assert_eq!(fs.dir_nentries(SFS_ROOTDIR_INO).unwrap(), 0);

    fs.file_opened();
    assert_eq!(fs.unmount(), Err(FsError::Busy));
    fs.file_closed();
    fs.unmount().unwrap();
}

#[test]
fn mount_rejects_garbage() {
    let disk = Arc::new(RamDisk::new(DISK_BLOCKS));
    assert_eq!(
        SfsFs::mount(disk).err(),
        Some(FsError::NoFilesystem)
    );
}

// ============================================================================
// Record format
// ============================================================================

#[test]
fn header_packing_roundtrip() {
    let header = pack_header(1, 9, 12, 0x0000_1234_5678);
    assert_ne!(header, 0);
    let (class, typ, len, lsn) = unpack_header(header);
    assert_eq!(class, 1);
    assert_eq!(typ, 9);
    assert_eq!(len, 12);
    assert_eq!(lsn, 0x0000_1234_5678);
}

#[test]
fn record_roundtrip() {
    let mut old_name = [0u8; SFS_NAMELEN];
    old_name[..3].copy_from_slice(b"foo");
    let mut new_name = [0u8; SFS_NAMELEN];
    new_name[..3].copy_from_slice(b"bar");

    let records = [
        Record::Trim { tail: 77 },
        Record::StartTxn {
            tnx: 5,
            op: LogOp::Creat,
        },
        Record::EndTxn {
            tnx: 5,
            op: LogOp::Creat,
        },
        Record::AbortTxn {
            tnx: 5,
            op: LogOp::Remove,
        },
        Record::ChangeDirentry {
            tnx: 5,
            ino: 9,
            slot: 3,
            old_ino: 0,
            old_name,
            new_ino: 12,
            new_name,
        },
        Record::ZeroBlock { tnx: 5, block: 40 },
        Record::AllocBlock { tnx: 5, block: 41 },
        Record::FreeBlock { tnx: 5, block: 42 },
        Record::ChangeSize {
            tnx: 5,
            ino: 9,
            old_size: 0,
            new_size: 4096,
            ityp: TYPE_FILE,
        },
        Record::ChangeLinkCount {
            tnx: 5,
            ino: 9,
            old_count: 1,
            new_count: 0,
            ityp: TYPE_FILE,
        },
        Record::ChangeIndirectPtr {
            tnx: 5,
            ino: 9,
            level: IndLevel::Double,
            old_ptr: 0,
            new_ptr: 88,
            ityp: TYPE_FILE,
        },
        Record::ChangeDirectPtr {
            tnx: 5,
            ino: 9,
            slot: 14,
            old_ptr: 7,
            new_ptr: 0,
            ityp: TYPE_FILE,
        },
        Record::ChangeInoInIndirect {
            tnx: 5,
            block: 88,
            slot: 100,
            old_ptr: 0,
            new_ptr: 89,
        },
        Record::WriteBlock {
            tnx: 5,
            block: 89,
            checksum: 0xdead_beef,
        },
        Record::ChangeInodeType {
            tnx: 5,
            ino: 9,
            old_type: TYPE_INVAL,
            new_type: TYPE_FILE,
        },
        Record::ChangeBlockObj {
            tnx: 5,
            block: 90,
            offset: 17,
            old_val: 1,
            new_val: 2,
        },
    ];

    for rec in &records {
        let payload = rec.encode_payload();
        let decoded = Record::decode(rec.type_code(), &payload).unwrap();
        assert_eq!(&decoded, rec);
    }
}

#[test]
fn fletcher32_detects_corruption() {
    let mut block = [0u8; SFS_BLOCKSIZE];
    block.fill(0x3c);
    let sum = fletcher32(&block);
    assert_eq!(sum, fletcher32(&block));
    block[300] ^= 1;
    assert_ne!(sum, fletcher32(&block));
}

// ============================================================================
// Journal container
// ============================================================================

#[test]
fn journal_survives_reload() {
    let disk = Arc::new(RamDisk::new(DISK_BLOCKS));
    mkfs(disk.as_ref(), "jvol", JOURNAL_BLOCKS).unwrap();

    let journal = Journal::load(disk.clone(), JOURNAL_START, JOURNAL_BLOCKS).unwrap();
    assert_eq!(journal.peek_next_lsn(), 1);

    let recs = [
        Record::StartTxn {
            tnx: 1,
            op: LogOp::Write,
        },
        Record::AllocBlock { tnx: 1, block: 10 },
        Record::EndTxn {
            tnx: 1,
            op: LogOp::Write,
        },
    ];
    let mut lsns = Vec::new();
    for rec in &recs {
        lsns.push(journal.append(rec).unwrap());
    }
    assert_eq!(lsns, alloc::vec![1, 2, 3]);
    drop(journal);

    let reloaded = Journal::load(disk.clone(), JOURNAL_START, JOURNAL_BLOCKS).unwrap();
    assert_eq!(reloaded.peek_next_lsn(), 4);
    let window = reloaded.take_window();
    assert_eq!(window.len(), 3);
    for ((lsn, rec), (want_lsn, want_rec)) in window.iter().zip(lsns.iter().zip(recs.iter())) {
        assert_eq!(lsn, want_lsn);
        assert_eq!(rec, want_rec);
    }
}

#[test]
fn journal_trim_discards_old_records() {
    let disk = Arc::new(RamDisk::new(DISK_BLOCKS));
    mkfs(disk.as_ref(), "jvol", JOURNAL_BLOCKS).unwrap();

    let journal = Journal::load(disk.clone(), JOURNAL_START, JOURNAL_BLOCKS).unwrap();
    for block in 0..8 {
        journal
            .append(&Record::AllocBlock { tnx: 1, block })
            .unwrap();
    }
    journal.trim(5).unwrap();
    assert_eq!(journal.tail_lsn(), 5);
    drop(journal);

    let reloaded = Journal::load(disk, JOURNAL_START, JOURNAL_BLOCKS).unwrap();
    let window = reloaded.take_window();
    assert!(!window.is_empty());
    assert!(window.iter().all(|(lsn, _)| *lsn >= 5));
}

#[test]
fn journal_odometer_counts_appends() {
    let disk = Arc::new(RamDisk::new(DISK_BLOCKS));
    mkfs(disk.as_ref(), "jvol", JOURNAL_BLOCKS).unwrap();

    let journal = Journal::load(disk, JOURNAL_START, JOURNAL_BLOCKS).unwrap();
    assert_eq!(journal.odometer(), 0);
    journal
        .append(&Record::AllocBlock { tnx: 1, block: 4 })
        .unwrap();
    // 8-byte header + 12-byte payload.
    assert_eq!(journal.odometer(), 20);
    journal.clear_odometer();
    assert_eq!(journal.odometer(), 0);
}

// ============================================================================
// Crash scenarios
// ============================================================================

#[test]
fn crash_between_start_and_end_rolls_back() {
    let (disk, fs) = fresh_fs();

    let txn = fs.txn_start(LogOp::Creat).unwrap();
    let ino = fs.create_file(&txn, SFS_ROOTDIR_INO, "victim").unwrap();
    fs.txn_end(txn, LogOp::Creat).unwrap();
    fs.sync().unwrap();
    assert_eq!(fs.inode_load(ino).unwrap().size, 0);

    // Size change inside a transaction that never commits; the dirty
    // buffer reaches the disk before the crash.
    let txn = fs.txn_start(LogOp::Write).unwrap();
    fs.inode_set_size(&txn, ino, 1234).unwrap();
    fs.sync().unwrap();
    assert_eq!(fs.inode_load(ino).unwrap().size, 1234);
    drop(txn);
    drop(fs);

    let fs = remount(&disk);
    let inode = fs.inode_load(ino).unwrap();
    assert_eq!(inode.typ, TYPE_FILE);
    assert_eq!(inode.size, 0);
}

#[test]
fn torn_write_is_zeroed() {
    let (disk, fs) = fresh_fs();

    let txn = fs.txn_start(LogOp::Write).unwrap();
    let ino = fs.create_file(&txn, SFS_ROOTDIR_INO, "data").unwrap();
    let mut payload = [0u8; SFS_BLOCKSIZE];
    for (i, b) in payload.iter_mut().enumerate() {
        *b = i as u8;
    }
    let block = fs.write_file_block(&txn, ino, 0, &payload).unwrap();
    fs.inode_set_size(&txn, ino, SFS_BLOCKSIZE as u32).unwrap();
    fs.txn_end(txn, LogOp::Write).unwrap();
    fs.sync().unwrap();

    // Half the sector made it, half did not.
    let mut torn = payload;
    torn[SFS_BLOCKSIZE / 2..].fill(0x99);
    disk.write_block(u64::from(block), &torn).unwrap();
    drop(fs);

    let fs = remount(&disk);
    let data = fs.read_file_block(ino, 0).unwrap();
    assert!(data.iter().all(|&b| b == 0), "torn block was not zeroed");
}

#[test]
fn protected_block_not_clobbered_by_stale_write() {
    let (disk, fs) = fresh_fs();

    // T1: a file with one data block of pattern bytes.
    let t1 = fs.txn_start(LogOp::Write).unwrap();
    let f1 = fs.create_file(&t1, SFS_ROOTDIR_INO, "old").unwrap();
    let mut p1 = [0u8; SFS_BLOCKSIZE];
    p1.fill(0x41);
    let b = fs.write_file_block(&t1, f1, 0, &p1).unwrap();
    fs.txn_end(t1, LogOp::Write).unwrap();

    // T2: truncate frees that data block.
    let t2 = fs.txn_start(LogOp::Truncate).unwrap();
    fs.itrunc(&t2, f1).unwrap();
    fs.txn_end(t2, LogOp::Truncate).unwrap();

    // T3: the freed block is reallocated as a fresh file's inode.
    let t3 = fs.txn_start(LogOp::Creat).unwrap();
    let f2 = fs.create_file(&t3, SFS_ROOTDIR_INO, "new").unwrap();
    fs.txn_end(t3, LogOp::Creat).unwrap();
    assert_eq!(f2, b, "expected the reallocation to reuse the block");
    fs.sync().unwrap();
    drop(fs);

    // Recovery must not resurrect (or checksum-zero) the old payload:
    // the block belongs to T3's file now.
    let fs = remount(&disk);
    let inode = fs.inode_load(f2).unwrap();
    assert_eq!(inode.typ, TYPE_FILE);
    assert_eq!(inode.linkcount, 1);
    assert_eq!(
        fs.dir_lookup(SFS_ROOTDIR_INO, "new").unwrap().map(|e| e.1),
        Some(f2)
    );
}

#[test]
fn aborted_allocation_rolls_back_bitmap() {
    let (disk, fs) = fresh_fs();

    let txn = fs.txn_start(LogOp::Write).unwrap();
    let block = fs.balloc(&txn).unwrap();
    fs.sync().unwrap();
    assert!(fs.bused(block));
    fs.txn_abort(txn, LogOp::Write).unwrap();
    drop(fs);

    let fs = remount(&disk);
    assert!(!fs.bused(block));
}

#[test]
fn morgue_reclaims_orphans_at_mount() {
    let (disk, fs) = fresh_fs();

    let txn = fs.txn_start(LogOp::Remove).unwrap();
    let ino = fs.create_file(&txn, SFS_ROOTDIR_INO, "doomed").unwrap();
    let mut data = [0u8; SFS_BLOCKSIZE];
    data.fill(7);
    fs.write_file_block(&txn, ino, 0, &data).unwrap();

    // Final unlink while the file is still in use: it goes to the
    // morgue instead of being reclaimed.
    let (slot, found) = fs
        .dir_lookup(SFS_ROOTDIR_INO, "doomed")
        .unwrap()
        .expect("file vanished");
    assert_eq!(found, ino);
    fs.dir_unlink(&txn, SFS_ROOTDIR_INO, slot).unwrap();
    fs.inode_set_linkcount(&txn, ino, 0).unwrap();
    fs.consider_morgue(&txn, 0, ino).unwrap();
    fs.txn_end(txn, LogOp::Remove).unwrap();
    fs.sync().unwrap();
    assert_eq!(fs.dir_nentries(SFS_MORGUE_BLOCK).unwrap(), 1);
    drop(fs);

    let fs = remount(&disk);
    assert!(fs.dir_lookup(SFS_ROOTDIR_INO, "doomed").unwrap().is_none());
    assert_eq!(fs.dir_nentries(SFS_MORGUE_BLOCK).unwrap(), 0);
    assert!(!fs.bused(ino), "orphan inode block was not reclaimed");
}

#[test]
fn checkpoint_trims_to_oldest_active_transaction() {
    let (_disk, fs) = fresh_fs();

    let t1 = fs.txn_start(LogOp::Write).unwrap();
    let keep = t1.id();
    let t2 = fs.txn_start(LogOp::Creat).unwrap();
    let _ino = fs.create_file(&t2, SFS_ROOTDIR_INO, "x").unwrap();
    fs.txn_end(t2, LogOp::Creat).unwrap();

    // Flush the buffers so the open transaction is what bounds the trim.
    fs.sync().unwrap();
    fs.checkpoint();

    assert_eq!(fs.journal.tail_lsn(), keep);
    for &tnx in fs.active_txns.lock().iter() {
        assert!(tnx >= keep);
    }
    assert_eq!(fs.journal.odometer(), 0);

    fs.txn_end(t1, LogOp::Write).unwrap();
}

#[test]
fn recovery_is_idempotent() {
    let (disk, fs) = fresh_fs();

    let txn = fs.txn_start(LogOp::Creat).unwrap();
    let ino = fs.create_file(&txn, SFS_ROOTDIR_INO, "persist").unwrap();
    fs.txn_end(txn, LogOp::Creat).unwrap();

    // Crash with an open transaction in the log.
    let txn = fs.txn_start(LogOp::Write).unwrap();
    fs.inode_set_size(&txn, ino, 4096).unwrap();
    fs.sync().unwrap();
    drop(txn);
    drop(fs);

    let data_bytes = JOURNAL_START as usize * SFS_BLOCKSIZE;

    let fs = remount(&disk);
    fs.unmount().unwrap();
    drop(fs);
    let image1 = disk.image()[..data_bytes].to_vec();

    let fs = remount(&disk);
    fs.unmount().unwrap();
    drop(fs);
    let image2 = disk.image()[..data_bytes].to_vec();

    assert_eq!(image1, image2, "second recovery changed on-disk state");
}

// ============================================================================
// Directory operations
// ============================================================================

#[test]
fn directory_link_unlink_lookup() {
    let (_disk, fs) = fresh_fs();

    let txn = fs.txn_start(LogOp::Mkdir).unwrap();
    let a = fs.create_file(&txn, SFS_ROOTDIR_INO, "a").unwrap();
    let b = fs.create_file(&txn, SFS_ROOTDIR_INO, "b").unwrap();
    assert_eq!(fs.dir_nentries(SFS_ROOTDIR_INO).unwrap(), 2);

    let (slot_a, ino_a) = fs.dir_lookup(SFS_ROOTDIR_INO, "a").unwrap().unwrap();
    assert_eq!(ino_a, a);
    fs.dir_unlink(&txn, SFS_ROOTDIR_INO, slot_a).unwrap();
    assert!(fs.dir_lookup(SFS_ROOTDIR_INO, "a").unwrap().is_none());

    // The freed slot is reused before the directory grows.
    let c = fs.create_file(&txn, SFS_ROOTDIR_INO, "c").unwrap();
    let (slot_c, _) = fs.dir_lookup(SFS_ROOTDIR_INO, "c").unwrap().unwrap();
    assert_eq!(slot_c, slot_a);
    assert_eq!(fs.dir_nentries(SFS_ROOTDIR_INO).unwrap(), 2);

    assert_ne!(b, c);
    let long = "x".repeat(SFS_NAMELEN);
    assert_eq!(
        Direntry::new(1, &long).err(),
        Some(FsError::NameTooLong)
    );

    fs.txn_end(txn, LogOp::Mkdir).unwrap();
}

#[test]
fn file_data_round_trips_through_indirect_blocks() {
    let disk = Arc::new(RamDisk::new(2048));
    mkfs(disk.as_ref(), "bigvol", JOURNAL_BLOCKS).unwrap();
    let fs = SfsFs::mount(disk).unwrap();

    let txn = fs.txn_start(LogOp::Write).unwrap();
    let ino = fs.create_file(&txn, SFS_ROOTDIR_INO, "big").unwrap();

    // One direct block, one behind the single indirect.
    let fileblocks = [0u32, SFS_NDIRECT as u32 + 5];
    for &fb in &fileblocks {
        let mut data = [0u8; SFS_BLOCKSIZE];
        data.fill(fb as u8 + 1);
        fs.write_file_block(&txn, ino, fb, &data).unwrap();
    }
    fs.txn_end(txn, LogOp::Write).unwrap();

    for &fb in &fileblocks {
        let data = fs.read_file_block(ino, fb).unwrap();
        assert!(data.iter().all(|&b| b == fb as u8 + 1));
    }
    // Holes read as zeros.
    let hole = fs.read_file_block(ino, 7).unwrap();
    assert!(hole.iter().all(|&b| b == 0));

    let inode = fs.inode_load(ino).unwrap();
    assert_ne!(inode.indirect, 0);

    // Truncation returns every block to the freemap.
    let txn = fs.txn_start(LogOp::Truncate).unwrap();
    let data_block = fs.bmap_read(ino, 0).unwrap();
    let indirect = inode.indirect;
    fs.itrunc(&txn, ino).unwrap();
    fs.txn_end(txn, LogOp::Truncate).unwrap();
    assert!(!fs.bused(data_block));
    assert!(!fs.bused(indirect));
    assert_eq!(fs.inode_load(ino).unwrap().size, 0);
}
