//! Record writer and transaction lifecycle
//!
//! Recoverable operations bracket their mutations between `txn_start`
//! and `txn_end` (or `txn_abort`) and emit typed records in between. The
//! transaction id is the LSN of the start record; the record lock makes
//! peeking that LSN and emitting the start record atomic. While recovery
//! is running the writer is a no-op.

use core::sync::atomic::Ordering;

use super::record::{LogOp, Record};
use super::{FsError, Lsn, SfsFs};

/// A live transaction handle. Obtained from [`SfsFs::txn_start`] and
/// threaded through every journaled operation; consumed by
/// [`SfsFs::txn_end`] or [`SfsFs::txn_abort`].
#[must_use]
pub struct Txn {
    id: Lsn,
}

impl Txn {
    /// The no-transaction handle recovery uses internally; its records
    /// are suppressed anyway.
    pub(crate) const NONE: Txn = Txn { id: 0 };

    pub fn id(&self) -> Lsn {
        self.id
    }
}

impl SfsFs {
    /// Open a transaction: assign it the next LSN as its id, register it
    /// in the active list, and emit the start record.
    pub fn txn_start(&self, op: LogOp) -> Result<Txn, FsError> {
        if self.recovering() {
            return Ok(Txn::NONE);
        }

        let record_guard = self.record_lock.lock();
        let id = self.journal.peek_next_lsn();
        self.active_txns.lock().push(id);
        self.journal.append(&Record::StartTxn { tnx: id, op })?;
        drop(record_guard);

        self.kick_checkpointer();
        Ok(Txn { id })
    }

    /// Commit: emit the end record and deregister the transaction.
    pub fn txn_end(&self, txn: Txn, op: LogOp) -> Result<(), FsError> {
        self.txn_close(txn, op, false)
    }

    /// Abort: emit the abort record and deregister the transaction.
    /// Recovery will undo whatever the transaction made visible.
    pub fn txn_abort(&self, txn: Txn, op: LogOp) -> Result<(), FsError> {
        self.txn_close(txn, op, true)
    }

    fn txn_close(&self, txn: Txn, op: LogOp, abort: bool) -> Result<(), FsError> {
        if self.recovering() || txn.id == 0 {
            return Ok(());
        }
        let rec = if abort {
            Record::AbortTxn { tnx: txn.id, op }
        } else {
            Record::EndTxn { tnx: txn.id, op }
        };
        self.journal.append(&rec)?;

        {
            let mut active = self.active_txns.lock();
            let index = active
                .iter()
                .position(|&t| t == txn.id)
                .expect("ending a transaction that is not active");
            active.remove(index);
        }

        self.kick_checkpointer();
        Ok(())
    }

    /// Emit one client record for a live transaction. A no-op during
    /// recovery.
    pub(crate) fn write_record(&self, txn: &Txn, rec: Record) -> Result<(), FsError> {
        if self.recovering() {
            return Ok(());
        }
        debug_assert!(txn.id != 0, "journaled mutation outside a transaction");
        debug_assert_eq!(rec.tnx(), Some(txn.id));
        self.journal.append(&rec)?;
        self.kick_checkpointer();
        Ok(())
    }

    /// Wake the checkpointer if the odometer has crossed the bound.
    fn kick_checkpointer(&self) {
        let bound = self.checkpoint_state.bound.load(Ordering::Acquire);
        if bound > 0 && self.journal.odometer() >= bound {
            self.checkpoint_state.chan.wake_all();
        }
    }
}
