//! Transaction identities and commit epochs as seen by the frame layer.
//!
//! Frames never drive the transaction lifecycle. They only need to know, for a
//! row's owning transaction, whether and when it committed ([`CommitLookup`]),
//! and, for a reader, its id and snapshot bound ([`Transaction`]).

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::row::{RowAddress, UndoRecord};

pub type TxId = i64;

/// Owner id stored in rows that belong to no transaction.
pub const NO_OWNER: TxId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed(i64),
    Aborted,
}

pub trait CommitLookup: Send + Sync {
    /// State of `tx`, or `None` when the transaction is unknown (for instance
    /// because it finished before this process started).
    fn state(&self, tx: TxId) -> Option<TxState>;

    /// Lowest snapshot bound among running transactions, `None` when nothing runs.
    fn oldest_active_snapshot(&self) -> Option<i64>;
}

/// A running transaction: its id, the highest commit epoch it may observe, and
/// the undo records of every row it replaced.
pub struct Transaction {
    id: TxId,
    snapshot_bound: i64,
    lookup: Arc<dyn CommitLookup>,
    undo: Mutex<Vec<UndoRecord>>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("snapshot_bound", &self.snapshot_bound)
            .finish()
    }
}

impl Transaction {
    pub fn new(id: TxId, snapshot_bound: i64, lookup: Arc<dyn CommitLookup>) -> Self {
        Self {
            id,
            snapshot_bound,
            lookup,
            undo: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn snapshot_bound(&self) -> i64 {
        self.snapshot_bound
    }

    pub fn lookup(&self) -> &dyn CommitLookup {
        self.lookup.as_ref()
    }

    /// Commit epoch of `owner` for visibility purposes: `None` for no owner or an
    /// owner too old to be tracked, `Some(0)` while the owner is still running,
    /// `Some(epoch)` once committed.
    pub fn owner_commit_epoch(&self, owner: TxId) -> Option<i64> {
        if owner == NO_OWNER {
            return None;
        }
        match self.lookup.state(owner) {
            Some(TxState::Active) => Some(0),
            Some(TxState::Committed(epoch)) => Some(epoch),
            // Aborted owners never commit.
            Some(TxState::Aborted) => Some(0),
            None => None,
        }
    }

    /// Whether every running reader already sees `epoch`. Versions replaced by
    /// a commit at or below this point are unreachable to all readers.
    pub fn all_readers_see(&self, epoch: i64) -> bool {
        self.lookup
            .oldest_active_snapshot()
            .map_or(true, |oldest| oldest >= epoch)
    }

    pub fn is_live_foreign(&self, owner: TxId) -> bool {
        owner != NO_OWNER
            && owner != self.id
            && matches!(self.lookup.state(owner), Some(TxState::Active))
    }

    pub fn record_undo(&self, record: UndoRecord) {
        self.undo.lock().push(record);
    }

    pub fn has_undo_for(&self, address: RowAddress) -> bool {
        self.undo.lock().iter().any(|r| r.address == address)
    }

    pub fn undo_log(&self) -> Vec<UndoRecord> {
        self.undo.lock().clone()
    }
}

/// Issues transaction ids and commit epochs and answers [`CommitLookup`] queries.
#[derive(Debug)]
pub struct TransactionRegistry {
    next_tx: AtomicI64,
    last_epoch: AtomicI64,
    states: DashMap<TxId, TxState>,
    active_snapshots: DashMap<TxId, i64>,
    commit_lock: Mutex<()>,
}

impl TransactionRegistry {
    pub fn new() -> Arc<Self> {
        Self::with_epoch_base(0)
    }

    /// Registry whose first commit receives epoch `base + 1`.
    pub fn with_epoch_base(base: i64) -> Arc<Self> {
        Arc::new(Self {
            next_tx: AtomicI64::new(1),
            last_epoch: AtomicI64::new(base),
            states: DashMap::new(),
            active_snapshots: DashMap::new(),
            commit_lock: Mutex::new(()),
        })
    }

    /// Begin a transaction that sees everything committed so far.
    pub fn begin(self: &Arc<Self>) -> Transaction {
        let _guard = self.commit_lock.lock();
        let bound = self.last_epoch.load(Ordering::SeqCst);
        self.begin_at(bound)
    }

    /// Begin a transaction with an explicit snapshot bound.
    pub fn begin_at(self: &Arc<Self>, snapshot_bound: i64) -> Transaction {
        let id = self.next_tx.fetch_add(1, Ordering::SeqCst);
        self.states.insert(id, TxState::Active);
        self.active_snapshots.insert(id, snapshot_bound);
        debug!(tx = id, snapshot_bound, "transaction started");
        Transaction::new(id, snapshot_bound, Arc::clone(self) as Arc<dyn CommitLookup>)
    }

    /// Mark `tx` committed and return its commit epoch.
    pub fn commit(&self, tx: &Transaction) -> i64 {
        let _guard = self.commit_lock.lock();
        let epoch = self.last_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.states.insert(tx.id(), TxState::Committed(epoch));
        self.active_snapshots.remove(&tx.id());
        debug!(tx = tx.id(), epoch, "transaction committed");
        epoch
    }

    pub fn abort(&self, tx: &Transaction) {
        self.states.insert(tx.id(), TxState::Aborted);
        self.active_snapshots.remove(&tx.id());
        debug!(tx = tx.id(), "transaction aborted");
    }

    pub fn last_epoch(&self) -> i64 {
        self.last_epoch.load(Ordering::SeqCst)
    }

    /// Drop bookkeeping for a finished transaction. Rows it still owns are then
    /// treated as committed long ago.
    pub fn forget(&self, tx: TxId) {
        self.states.remove(&tx);
        self.active_snapshots.remove(&tx);
    }
}

impl CommitLookup for TransactionRegistry {
    fn state(&self, tx: TxId) -> Option<TxState> {
        self.states.get(&tx).map(|s| *s)
    }

    fn oldest_active_snapshot(&self) -> Option<i64> {
        self.active_snapshots.iter().map(|e| *e.value()).min()
    }
}
