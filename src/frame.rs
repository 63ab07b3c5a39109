//! The page abstraction shared by heap and index frames.
//!
//! ```text
//! frame header (96 bytes, big-endian)
//!  0 fileId 4 | 4 framePointer 8 | 12 objectId 4 | 16 frameKind 4 | 20 cursor 4
//! 24 bytesUsed 4 | 28 rowCounter 4 | 32 spare 4 | 36 allocFileId 4 | 40 allocPointer 8
//! 48 int0..int6 (7 x 4) | 76 long0, long1 (2 x 8) | 92 reserved 4
//! chunk area
//! 96 RecordHeader || payload, repeated up to bytesUsed, zero padded to the frame size
//! ```
//!
//! [`FrameCore`] holds the decoded state of one page and implements the row
//! lifecycle, MVCC visibility and the flush snapshot overlay. [`Frame`] wraps
//! it in the page mutex and ties mutations to commit tokens.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt::Display,
    sync::Arc,
    thread,
    time::Duration,
};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::{
    chunk_index::ChunkIndex,
    codec::{Codec, Key},
    commit::{CommitToken, FlushFrame},
    error::{FrameError, Result},
    row::{Chunk, RecordHeader, RowAddress, RowPointer, RowState, UndoRecord},
    tx::{Transaction, TxId, NO_OWNER},
};

pub const FRAME_HEADER_SIZE_BYTES: usize = 96;
/// Value of a link slot that points nowhere.
pub const NO_LINK: i64 = -1;
/// Row pointers must fit the 2-byte in-page pointer of the row header.
pub const ROW_POINTER_LIMIT: i32 = u16::MAX as i32 + 1;

pub const INT_SLOT_COUNT: usize = 7;
pub const LONG_SLOT_COUNT: usize = 2;
const INT_SLOTS_OFFSET: usize = 48;
const LONG_SLOTS_OFFSET: usize = 76;
const RESERVED_OFFSET: usize = 92;

fn get_i32(buf: &[u8], offset: usize) -> i32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    i32::from_be_bytes(bytes)
}

fn get_i64(buf: &[u8], offset: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    i64::from_be_bytes(bytes)
}

fn set_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn set_i64(buf: &mut [u8], offset: usize, value: i64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

/// Physical location of a frame: its file and byte offset inside that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId {
    pub file_id: i32,
    pub frame_pointer: i64,
}

impl FrameId {
    pub fn new(file_id: i32, frame_pointer: i64) -> Self {
        Self {
            file_id,
            frame_pointer,
        }
    }
}

impl Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file_id, self.frame_pointer)
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Heap = 1,
    IndexNode = 2,
    IndexLeaf = 3,
}

impl FrameKind {
    pub fn is_index(&self) -> bool {
        matches!(self, FrameKind::IndexNode | FrameKind::IndexLeaf)
    }
}

impl TryFrom<u32> for FrameKind {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameKind::Heap),
            2 => Ok(FrameKind::IndexNode),
            3 => Ok(FrameKind::IndexLeaf),
            other => Err(other),
        }
    }
}

/// Decoded 96-byte frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub file_id: i32,
    pub frame_pointer: i64,
    pub object_id: i32,
    pub kind: FrameKind,
    pub cursor: i32,
    pub bytes_used: i32,
    pub row_counter: i32,
    pub spare: i32,
    pub alloc_file_id: i32,
    pub alloc_pointer: i64,
    pub int_slots: [i32; INT_SLOT_COUNT],
    pub long_slots: [i64; LONG_SLOT_COUNT],
    pub reserved: i32,
}

impl FrameHeader {
    /// Header of an empty frame. Every type-specific slot starts unlinked.
    pub fn new(id: FrameId, object_id: i32, kind: FrameKind) -> Self {
        Self {
            file_id: id.file_id,
            frame_pointer: id.frame_pointer,
            object_id,
            kind,
            cursor: FRAME_HEADER_SIZE_BYTES as i32,
            bytes_used: FRAME_HEADER_SIZE_BYTES as i32,
            row_counter: 0,
            spare: 0,
            alloc_file_id: id.file_id,
            alloc_pointer: id.frame_pointer,
            int_slots: [NO_LINK as i32; INT_SLOT_COUNT],
            long_slots: [NO_LINK; LONG_SLOT_COUNT],
            reserved: 0,
        }
    }

    pub fn frame_id(&self) -> FrameId {
        FrameId::new(self.file_id, self.frame_pointer)
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        set_i32(buf, 0, self.file_id);
        set_i64(buf, 4, self.frame_pointer);
        set_i32(buf, 12, self.object_id);
        set_i32(buf, 16, self.kind as u32 as i32);
        set_i32(buf, 20, self.cursor);
        set_i32(buf, 24, self.bytes_used);
        set_i32(buf, 28, self.row_counter);
        set_i32(buf, 32, self.spare);
        set_i32(buf, 36, self.alloc_file_id);
        set_i64(buf, 40, self.alloc_pointer);
        for (i, value) in self.int_slots.iter().enumerate() {
            set_i32(buf, INT_SLOTS_OFFSET + i * 4, *value);
        }
        for (i, value) in self.long_slots.iter().enumerate() {
            set_i64(buf, LONG_SLOTS_OFFSET + i * 8, *value);
        }
        set_i32(buf, RESERVED_OFFSET, self.reserved);
    }

    /// Decode and validate a header. `frame` names the page in errors.
    pub fn read_from(buf: &[u8], frame: FrameId) -> Result<Self> {
        let invalid = |detail: String| FrameError::InvalidFrame { frame, detail };
        if buf.len() < FRAME_HEADER_SIZE_BYTES {
            return Err(invalid(format!(
                "buffer of {} bytes cannot hold a frame header",
                buf.len()
            )));
        }
        let raw_kind = get_i32(buf, 16) as u32;
        let kind = FrameKind::try_from(raw_kind).map_err(|bits| match bits {
            0 => invalid("frame header is empty".to_string()),
            other => invalid(format!("unknown frame kind {other}")),
        })?;
        let mut int_slots = [0i32; INT_SLOT_COUNT];
        for (i, slot) in int_slots.iter_mut().enumerate() {
            *slot = get_i32(buf, INT_SLOTS_OFFSET + i * 4);
        }
        let mut long_slots = [0i64; LONG_SLOT_COUNT];
        for (i, slot) in long_slots.iter_mut().enumerate() {
            *slot = get_i64(buf, LONG_SLOTS_OFFSET + i * 8);
        }
        let header = Self {
            file_id: get_i32(buf, 0),
            frame_pointer: get_i64(buf, 4),
            object_id: get_i32(buf, 12),
            kind,
            cursor: get_i32(buf, 20),
            bytes_used: get_i32(buf, 24),
            row_counter: get_i32(buf, 28),
            spare: get_i32(buf, 32),
            alloc_file_id: get_i32(buf, 36),
            alloc_pointer: get_i64(buf, 40),
            int_slots,
            long_slots,
            reserved: get_i32(buf, RESERVED_OFFSET),
        };
        let used = header.bytes_used;
        if used < FRAME_HEADER_SIZE_BYTES as i32 || used as usize > buf.len() {
            return Err(invalid(format!(
                "bytesUsed {used} outside [{FRAME_HEADER_SIZE_BYTES}, {}]",
                buf.len()
            )));
        }
        if header.cursor != used {
            return Err(invalid(format!(
                "cursor {} disagrees with bytesUsed {used}",
                header.cursor
            )));
        }
        if !(0..=ROW_POINTER_LIMIT).contains(&header.row_counter) {
            return Err(invalid(format!("row counter {} out of range", header.row_counter)));
        }
        Ok(header)
    }
}

/// Result of an insert: the new row's address, or the space the caller must
/// find elsewhere (split or allocate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(RowAddress),
    NoSpace { needed: usize, free: usize },
}

impl InsertOutcome {
    pub fn address(&self) -> Option<RowAddress> {
        match self {
            InsertOutcome::Inserted(address) => Some(*address),
            InsertOutcome::NoSpace { .. } => None,
        }
    }
}

/// Result of an in-place payload update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated(UndoRecord),
    NoSpace { needed: usize, free: usize },
}

/// How a writer reacts to a row held by a live foreign transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLockPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RowLockPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

enum RowAccess {
    Free,
    Busy(TxId),
}

/// Decoded state of one page. Never shared; always reached through a [`Frame`]
/// lock or owned outright.
#[derive(Debug)]
pub struct FrameCore {
    header: FrameHeader,
    frame_size: usize,
    chunks: ChunkIndex,
    free_pointers: BTreeSet<RowPointer>,
    /// Pre-barrier row copies, keyed by the id of the token whose mutation saved them.
    snapshots: BTreeMap<i64, HashMap<RowPointer, Chunk>>,
    pending_barrier: Option<i64>,
    dirty: bool,
    last_mutation: i64,
}

impl FrameCore {
    pub fn new(header: FrameHeader, frame_size: usize) -> Self {
        let chunks = if header.kind.is_index() {
            ChunkIndex::ordered()
        } else {
            ChunkIndex::heap()
        };
        Self {
            header,
            frame_size,
            chunks,
            free_pointers: BTreeSet::new(),
            snapshots: BTreeMap::new(),
            pending_barrier: None,
            dirty: false,
            last_mutation: 0,
        }
    }

    pub fn id(&self) -> FrameId {
        self.header.frame_id()
    }

    pub fn kind(&self) -> FrameKind {
        self.header.kind
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut FrameHeader {
        &mut self.header
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn bytes_used(&self) -> usize {
        self.header.bytes_used as usize
    }

    pub fn free(&self) -> usize {
        self.frame_size - self.bytes_used()
    }

    pub fn chunks(&self) -> &ChunkIndex {
        &self.chunks
    }

    pub fn chunks_mut(&mut self) -> &mut ChunkIndex {
        &mut self.chunks
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn pending_barrier(&self) -> Option<i64> {
        self.pending_barrier
    }

    pub fn snapshot_rows(&self) -> usize {
        self.snapshots.values().map(HashMap::len).sum()
    }

    fn address(&self, pointer: RowPointer) -> RowAddress {
        RowAddress::in_frame(self.id(), pointer)
    }

    fn sync_usage(&mut self) {
        let used = (FRAME_HEADER_SIZE_BYTES + self.chunks.used()) as i32;
        self.header.bytes_used = used;
        self.header.cursor = used;
    }

    fn mark_mutated(&mut self, token_id: i64) {
        self.dirty = true;
        self.last_mutation = self.last_mutation.max(token_id);
    }

    fn next_pointer(&mut self) -> Option<RowPointer> {
        if self.header.row_counter < ROW_POINTER_LIMIT {
            let pointer = self.header.row_counter;
            self.header.row_counter += 1;
            return Some(pointer);
        }
        let pointer = self.free_pointers.iter().next().copied()?;
        self.free_pointers.remove(&pointer);
        trace!(frame = %self.id(), pointer, "recycling row pointer");
        Some(pointer)
    }

    /// Copy the row at `pointer` into the overlay if a flush cut is pending and
    /// the row still holds its pre-barrier bytes.
    fn preserve_for_flush(&mut self, pointer: RowPointer, token_id: i64) {
        let Some(barrier) = self.pending_barrier else {
            return;
        };
        let Some(chunk) = self.chunks.get(pointer) else {
            return;
        };
        if chunk.header.commit_epoch > barrier {
            return;
        }
        if self.snapshots.values().any(|rows| rows.contains_key(&pointer)) {
            return;
        }
        let copy = chunk.detached();
        self.snapshots
            .entry(token_id)
            .or_default()
            .insert(pointer, copy);
    }

    /// Add `chunk` as a new row. With `check_space` unset the caller guarantees
    /// the row fits; overflowing the frame is then an internal error.
    pub fn insert_chunk(
        &mut self,
        mut chunk: Chunk,
        owner: TxId,
        token_id: i64,
        check_space: bool,
    ) -> Result<InsertOutcome> {
        let needed = chunk.size();
        let free = self.free();
        if needed > free {
            if check_space {
                return Ok(InsertOutcome::NoSpace { needed, free });
            }
            return Err(FrameError::Internal(format!(
                "row of {needed} bytes overflows frame {} with {free} bytes free",
                self.id()
            )));
        }
        if chunk.payload.len() > u16::MAX as usize {
            return Err(FrameError::Internal(format!(
                "payload of {} bytes exceeds the row length field",
                chunk.payload.len()
            )));
        }
        let Some(pointer) = self.next_pointer() else {
            return Ok(InsertOutcome::NoSpace { needed, free });
        };
        chunk.header.owner_tx = owner;
        chunk.header.state = RowState::Normal;
        chunk.header.length = chunk.payload.len() as u16;
        chunk.header.in_page_ptr = pointer as u16;
        chunk.header.commit_epoch = token_id;
        chunk.prior = None;
        self.chunks.add(chunk)?;
        self.sync_usage();
        self.mark_mutated(token_id);
        Ok(InsertOutcome::Inserted(self.address(pointer)))
    }

    fn row_access(&self, pointer: RowPointer, tx: &Transaction) -> Result<RowAccess> {
        let address = self.address(pointer);
        let chunk = self
            .chunks
            .get(pointer)
            .ok_or(FrameError::NoSuchRow { address })?;
        let owner = chunk.header.owner_tx;
        if tx.is_live_foreign(owner) {
            return Ok(RowAccess::Busy(owner));
        }
        if chunk.header.state == RowState::Deleted {
            return Err(FrameError::RecordDeleted { address });
        }
        Ok(RowAccess::Free)
    }

    /// Take over a row moved from another frame. Owner and state are kept; the
    /// row gets a fresh pointer in this frame.
    pub fn adopt_chunk(&mut self, mut chunk: Chunk, token_id: i64) -> Result<RowAddress> {
        let needed = chunk.size();
        if needed > self.free() {
            return Err(FrameError::Internal(format!(
                "moved row of {needed} bytes overflows frame {} with {} bytes free",
                self.id(),
                self.free()
            )));
        }
        let pointer = self.next_pointer().ok_or_else(|| {
            FrameError::Internal(format!("frame {} has no row pointer left", self.id()))
        })?;
        chunk.header.in_page_ptr = pointer as u16;
        chunk.header.commit_epoch = token_id;
        self.chunks.add(chunk)?;
        self.sync_usage();
        self.mark_mutated(token_id);
        Ok(self.address(pointer))
    }

    /// Rewrite the back-pointer of an index row in place.
    pub fn set_back_pointer(
        &mut self,
        pointer: RowPointer,
        target: Option<RowAddress>,
        token_id: i64,
    ) -> Result<()> {
        self.preserve_for_flush(pointer, token_id);
        let address = self.address(pointer);
        let chunk = self
            .chunks
            .get_mut(pointer)
            .ok_or(FrameError::NoSuchRow { address })?;
        chunk.header.back_pointer = target;
        chunk.header.commit_epoch = token_id;
        self.mark_mutated(token_id);
        Ok(())
    }

    /// Start a new version of the row at `pointer` owned by `tx`. The replaced
    /// version is kept as `prior` unless `tx` already owned it.
    fn replace_version(
        &mut self,
        pointer: RowPointer,
        tx: &Transaction,
        token_id: i64,
        state: RowState,
        payload: Option<Vec<u8>>,
    ) -> Result<UndoRecord> {
        self.preserve_for_flush(pointer, token_id);
        let address = self.address(pointer);
        let current = self
            .chunks
            .get(pointer)
            .ok_or(FrameError::NoSuchRow { address })?;
        let undo = UndoRecord {
            address,
            header: current.header.clone(),
            payload: current.payload.clone(),
        };
        let prior = if current.header.owner_tx == tx.id() {
            current.prior.clone()
        } else {
            let mut older = current.clone();
            // Earlier versions stay reachable while a reader predates this commit.
            let superseded = match tx.owner_commit_epoch(older.header.owner_tx) {
                None => true,
                Some(0) => false,
                Some(epoch) => tx.all_readers_see(epoch),
            };
            if superseded {
                older.prior = None;
            }
            Some(Box::new(older))
        };
        let mut next = current.detached();
        next.prior = prior;
        next.header.owner_tx = tx.id();
        next.header.state = state;
        next.header.commit_epoch = token_id;
        if let Some(payload) = payload {
            next.header.length = payload.len() as u16;
            next.payload = payload;
        }
        self.chunks.replace(next)?;
        self.sync_usage();
        self.mark_mutated(token_id);
        Ok(undo)
    }

    pub fn update_chunk(
        &mut self,
        pointer: RowPointer,
        payload: Vec<u8>,
        tx: &Transaction,
        token_id: i64,
    ) -> Result<UpdateOutcome> {
        let address = self.address(pointer);
        let current = self
            .chunks
            .get(pointer)
            .ok_or(FrameError::NoSuchRow { address })?;
        let old_len = current.payload.len();
        let free = self.free();
        if payload.len() > old_len + free {
            return Ok(UpdateOutcome::NoSpace {
                needed: payload.len() - old_len,
                free,
            });
        }
        if payload.len() > u16::MAX as usize {
            return Err(FrameError::Internal(format!(
                "payload of {} bytes exceeds the row length field",
                payload.len()
            )));
        }
        self.replace_version(pointer, tx, token_id, RowState::Normal, Some(payload))
            .map(UpdateOutcome::Updated)
    }

    /// Flip the row to `Deleted`. The bytes stay until [`FrameCore::remove_chunk`].
    pub fn delete_chunk(
        &mut self,
        pointer: RowPointer,
        tx: &Transaction,
        token_id: i64,
    ) -> Result<UndoRecord> {
        self.replace_version(pointer, tx, token_id, RowState::Deleted, None)
    }

    pub fn lock_row(
        &mut self,
        pointer: RowPointer,
        tx: &Transaction,
        token_id: i64,
    ) -> Result<UndoRecord> {
        self.replace_version(pointer, tx, token_id, RowState::Locked, None)
    }

    /// Physically drop the row at `pointer`. Its pointer becomes reusable once
    /// the row counter is exhausted.
    pub fn remove_chunk(&mut self, pointer: RowPointer, token_id: i64) -> Result<Chunk> {
        self.preserve_for_flush(pointer, token_id);
        let chunk = self.chunks.remove_by_pointer(pointer)?;
        self.free_pointers.insert(pointer);
        self.sync_usage();
        self.mark_mutated(token_id);
        Ok(chunk)
    }

    /// Undo everything `tx` did in this frame. Rows it inserted are removed;
    /// rows it replaced get back the version `tx` found, which travels with the
    /// row even when a split moved it to another frame.
    pub fn rollback_transaction(&mut self, tx: TxId, token_id: i64) -> Result<usize> {
        let id = self.id();
        let owned: Vec<RowPointer> = self
            .chunks
            .pointers()
            .filter(|p| {
                self.chunks
                    .get(*p)
                    .is_some_and(|c| c.header.owner_tx == tx)
            })
            .collect();

        let mut reverted = 0;
        for pointer in owned {
            self.preserve_for_flush(pointer, token_id);
            let address = self.address(pointer);
            let current = self
                .chunks
                .get(pointer)
                .ok_or(FrameError::NoSuchRow { address })?;
            let found = current.prior.as_deref().map(|found| {
                let mut restored = found.clone();
                restored.header.in_page_ptr = current.header.in_page_ptr;
                restored.header.commit_epoch = token_id;
                restored
            });
            match found {
                Some(restored) => {
                    self.chunks.replace(restored)?;
                }
                None => {
                    self.remove_chunk(pointer, token_id)?;
                }
            }
            reverted += 1;
        }
        self.sync_usage();
        if reverted > 0 {
            self.mark_mutated(token_id);
        }
        debug!(frame = %id, tx, reverted, "rolled back transaction rows");
        Ok(reverted)
    }

    /// The rows `tx` sees right now, in pointer order for heap frames and key
    /// order for index frames.
    pub fn compute_visible_rows(&mut self, tx: &Transaction) -> Vec<Chunk> {
        let id = self.id();
        let visible = |chunk: &Chunk| visible_version(chunk, tx, id).map(Chunk::detached);
        if self.chunks.is_ordered() {
            self.chunks.iter_ordered().filter_map(visible).collect()
        } else {
            self.chunks.iter_by_pointer().filter_map(visible).collect()
        }
    }

    /// Byte image of the current rows.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        self.render(None)
    }

    /// Byte image as of `barrier`: overlay copies where a row changed after the
    /// barrier, live rows stamped at or before it, nothing newer.
    pub fn serialize_at(&self, barrier: i64) -> Result<Vec<u8>> {
        self.render(Some(barrier))
    }

    fn render(&self, barrier: Option<i64>) -> Result<Vec<u8>> {
        let mut rows: Vec<&Chunk> = Vec::with_capacity(self.chunks.len());
        match barrier {
            None => rows.extend(self.chunks.iter_by_pointer()),
            Some(barrier) => {
                let overlay: HashMap<RowPointer, &Chunk> = self
                    .snapshots
                    .values()
                    .flat_map(|rows| rows.iter().map(|(p, c)| (*p, c)))
                    .collect();
                rows.extend(self.chunks.iter_by_pointer().filter(|c| {
                    !overlay.contains_key(&c.row_pointer()) && c.header.commit_epoch <= barrier
                }));
                rows.extend(overlay.into_values());
            }
        }
        if self.chunks.is_ordered() {
            rows.sort_by(|a, b| a.key.cmp(&b.key).then(a.row_pointer().cmp(&b.row_pointer())));
        } else {
            rows.sort_by_key(|c| c.row_pointer());
        }

        let mut buf = vec![0u8; self.frame_size];
        let mut offset = FRAME_HEADER_SIZE_BYTES;
        for chunk in rows {
            let end = offset + chunk.size();
            if end > self.frame_size {
                return Err(FrameError::InvalidFrame {
                    frame: self.id(),
                    detail: format!(
                        "rows need {end} bytes, frame holds {}",
                        self.frame_size
                    ),
                });
            }
            chunk.write_to(&mut buf[offset..end]);
            offset = end;
        }
        let mut header = self.header.clone();
        header.bytes_used = offset as i32;
        header.cursor = offset as i32;
        header.write_to(&mut buf[..FRAME_HEADER_SIZE_BYTES]);
        Ok(buf)
    }

    pub fn begin_flush(&mut self, barrier: i64) {
        self.pending_barrier = Some(barrier);
    }

    pub fn finish_flush(&mut self, barrier: i64, written: bool) {
        self.pending_barrier = None;
        self.snapshots.clear();
        if written {
            self.dirty = self.last_mutation > barrier;
        }
    }
}

fn normal_visible(chunk: &Chunk, tx: &Transaction, frame: FrameId) -> bool {
    let owner = chunk.header.owner_tx;
    if owner == NO_OWNER || owner == tx.id() {
        return true;
    }
    if tx.has_undo_for(RowAddress::in_frame(frame, chunk.row_pointer())) {
        return true;
    }
    match tx.owner_commit_epoch(owner) {
        // unknown owners finished before anything we track
        None => true,
        Some(epoch) => epoch > 0 && epoch <= tx.snapshot_bound(),
    }
}

fn deleted_visible(chunk: &Chunk, tx: &Transaction) -> bool {
    let owner = chunk.header.owner_tx;
    if owner == NO_OWNER || owner == tx.id() {
        return false;
    }
    match tx.owner_commit_epoch(owner) {
        None => false,
        Some(0) => true,
        Some(epoch) => epoch > tx.snapshot_bound(),
    }
}

/// The version of `chunk` that `tx` may observe, walking back through prior
/// versions when the newest one is not visible yet.
pub(crate) fn visible_version<'a>(chunk: &'a Chunk, tx: &Transaction, frame: FrameId) -> Option<&'a Chunk> {
    match chunk.header.state {
        RowState::Normal if normal_visible(chunk, tx, frame) => Some(chunk),
        RowState::Locked => None,
        RowState::Deleted if !deleted_visible(chunk, tx) => None,
        RowState::Deleted => match chunk.prior.as_deref() {
            Some(prior) => visible_version(prior, tx, frame),
            None => Some(chunk),
        },
        _ => chunk
            .prior
            .as_deref()
            .and_then(|prior| visible_version(prior, tx, frame)),
    }
}

/// Header and row headers of a raw page, without payload decoding. Used for
/// inspection of pages whose key schema is unknown.
pub fn inspect_image(bytes: &[u8], frame: FrameId) -> Result<(FrameHeader, Vec<RecordHeader>)> {
    let header = FrameHeader::read_from(bytes, frame)?;
    let indexed = header.kind.is_index();
    let used = header.bytes_used as usize;
    let mut rows = Vec::new();
    let mut offset = FRAME_HEADER_SIZE_BYTES;
    while offset < used {
        let row = RecordHeader::read_from(&bytes[offset..used], indexed, frame)?;
        offset += RecordHeader::encoded_size(indexed) + row.length as usize;
        rows.push(row);
    }
    if offset != used {
        return Err(FrameError::InvalidFrame {
            frame,
            detail: format!("last row ends at {offset}, past bytesUsed {used}"),
        });
    }
    Ok((header, rows))
}

/// Parse a raw page into a [`FrameCore`]. Index frames need `key_codec` to
/// recover each entry's key from its payload.
pub fn decode_image(
    bytes: &[u8],
    expected: FrameId,
    key_codec: Option<&dyn Codec>,
) -> Result<FrameCore> {
    let header = FrameHeader::read_from(bytes, expected)?;
    let invalid = |detail: String| FrameError::InvalidFrame {
        frame: expected,
        detail,
    };
    if header.frame_id() != expected {
        return Err(invalid(format!(
            "header names frame {}",
            header.frame_id()
        )));
    }
    let indexed = header.kind.is_index();
    if indexed && key_codec.is_none() {
        return Err(FrameError::Internal(format!(
            "index frame {expected} loaded without a key codec"
        )));
    }
    let used = header.bytes_used as usize;
    let row_counter = header.row_counter;
    let mut core = FrameCore::new(header, bytes.len());
    let header_size = RecordHeader::encoded_size(indexed);
    let mut offset = FRAME_HEADER_SIZE_BYTES;
    while offset < used {
        let row_header = RecordHeader::read_from(&bytes[offset..used], indexed, expected)?;
        let start = offset + header_size;
        let end = start + row_header.length as usize;
        if end > used {
            return Err(invalid(format!(
                "row at offset {offset} runs to {end}, past bytesUsed {used}"
            )));
        }
        let pointer = RowPointer::from(row_header.in_page_ptr);
        if pointer >= row_counter {
            return Err(invalid(format!(
                "row pointer {pointer} not below row counter {row_counter}"
            )));
        }
        if core.chunks.contains(pointer) {
            return Err(invalid(format!("row pointer {pointer} appears twice")));
        }
        let payload = bytes[start..end].to_vec();
        let key = match key_codec {
            Some(codec) if indexed => {
                let values = codec.decode(&payload).map_err(|e| {
                    invalid(format!("key of row {pointer} does not decode: {e}"))
                })?;
                Some(Key(values))
            }
            _ => None,
        };
        core.chunks.add(Chunk {
            header: row_header,
            payload,
            key,
            prior: None,
        })?;
        offset = end;
    }
    core.free_pointers = (0..row_counter).filter(|p| !core.chunks.contains(*p)).collect();
    core.sync_usage();
    if core.bytes_used() != used {
        return Err(invalid(format!(
            "rows account for {} bytes, header claims {used}",
            core.bytes_used()
        )));
    }
    Ok(core)
}

/// A page behind its mutex. Every mutation registers the frame with the
/// caller's commit token.
pub struct Frame {
    id: FrameId,
    policy: RowLockPolicy,
    core: Mutex<FrameCore>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame").field("id", &self.id).finish()
    }
}

impl Frame {
    pub fn new(core: FrameCore, policy: RowLockPolicy) -> Arc<Self> {
        Arc::new(Self {
            id: core.id(),
            policy,
            core: Mutex::new(core),
        })
    }

    pub fn format(
        id: FrameId,
        object_id: i32,
        kind: FrameKind,
        frame_size: usize,
        policy: RowLockPolicy,
    ) -> Arc<Self> {
        Self::new(
            FrameCore::new(FrameHeader::new(id, object_id, kind), frame_size),
            policy,
        )
    }

    pub fn load(
        bytes: &[u8],
        id: FrameId,
        key_codec: Option<&dyn Codec>,
        policy: RowLockPolicy,
    ) -> Result<Arc<Self>> {
        Ok(Self::new(decode_image(bytes, id, key_codec)?, policy))
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn policy(&self) -> RowLockPolicy {
        self.policy
    }

    /// Direct access to the page state for callers that already coordinate
    /// with the flush protocol (index maintenance, inspection).
    pub fn lock(&self) -> MutexGuard<'_, FrameCore> {
        self.core.lock()
    }

    pub fn register(self: &Arc<Self>, token: &CommitToken) {
        token.register(Arc::clone(self) as Arc<dyn FlushFrame>);
    }

    pub fn insert_chunk(
        self: &Arc<Self>,
        chunk: Chunk,
        tx: Option<&Transaction>,
        check_space: bool,
        token: &CommitToken,
    ) -> Result<InsertOutcome> {
        let owner = tx.map_or(NO_OWNER, Transaction::id);
        let outcome = self
            .core
            .lock()
            .insert_chunk(chunk, owner, token.id(), check_space)?;
        if let InsertOutcome::Inserted(_) = outcome {
            self.register(token);
        }
        Ok(outcome)
    }

    /// Run `op` on the row once no live foreign transaction holds it. The page
    /// mutex is released while backing off.
    fn write_row<T>(
        self: &Arc<Self>,
        pointer: RowPointer,
        tx: &Transaction,
        token: &CommitToken,
        mut op: impl FnMut(&mut FrameCore) -> Result<T>,
    ) -> Result<T> {
        let address = RowAddress::in_frame(self.id, pointer);
        let mut attempt = 0;
        loop {
            let owner = {
                let mut core = self.core.lock();
                match core.row_access(pointer, tx)? {
                    RowAccess::Free => {
                        let out = op(&mut core)?;
                        drop(core);
                        self.register(token);
                        return Ok(out);
                    }
                    RowAccess::Busy(owner) => owner,
                }
            };
            if attempt >= self.policy.retries {
                warn!(%address, owner, attempts = attempt + 1, "row stayed locked");
                return Err(FrameError::RecordLocked { address });
            }
            attempt += 1;
            debug!(%address, owner, attempt, "row held by live transaction, backing off");
            thread::sleep(self.policy.backoff);
        }
    }

    pub fn update_chunk(
        self: &Arc<Self>,
        pointer: RowPointer,
        payload: Vec<u8>,
        tx: &Transaction,
        token: &CommitToken,
    ) -> Result<UpdateOutcome> {
        let token_id = token.id();
        let outcome = self.write_row(pointer, tx, token, |core| {
            core.update_chunk(pointer, payload.clone(), tx, token_id)
        })?;
        if let UpdateOutcome::Updated(undo) = &outcome {
            tx.record_undo(undo.clone());
        }
        Ok(outcome)
    }

    pub fn delete_chunk(
        self: &Arc<Self>,
        pointer: RowPointer,
        tx: &Transaction,
        token: &CommitToken,
    ) -> Result<UndoRecord> {
        let token_id = token.id();
        let undo = self.write_row(pointer, tx, token, |core| {
            core.delete_chunk(pointer, tx, token_id)
        })?;
        tx.record_undo(undo.clone());
        Ok(undo)
    }

    pub fn lock_row(
        self: &Arc<Self>,
        pointer: RowPointer,
        tx: &Transaction,
        token: &CommitToken,
    ) -> Result<UndoRecord> {
        let token_id = token.id();
        let undo = self.write_row(pointer, tx, token, |core| {
            core.lock_row(pointer, tx, token_id)
        })?;
        tx.record_undo(undo.clone());
        Ok(undo)
    }

    pub fn remove_chunk(
        self: &Arc<Self>,
        pointer: RowPointer,
        token: &CommitToken,
    ) -> Result<Chunk> {
        let chunk = self.core.lock().remove_chunk(pointer, token.id())?;
        self.register(token);
        Ok(chunk)
    }

    pub fn rollback_transaction(
        self: &Arc<Self>,
        tx: &Transaction,
        token: &CommitToken,
    ) -> Result<usize> {
        let reverted = self.core.lock().rollback_transaction(tx.id(), token.id())?;
        if reverted > 0 {
            self.register(token);
        }
        Ok(reverted)
    }

    pub fn compute_visible_rows(&self, tx: &Transaction) -> Vec<Chunk> {
        self.core.lock().compute_visible_rows(tx)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        self.core.lock().serialize()
    }

    pub fn is_dirty(&self) -> bool {
        self.core.lock().is_dirty()
    }
}

impl FlushFrame for Frame {
    fn frame_id(&self) -> FrameId {
        self.id
    }

    fn begin_flush(&self, barrier: i64) {
        self.core.lock().begin_flush(barrier);
    }

    fn serialize_at(&self, barrier: i64, live: bool) -> Result<Vec<u8>> {
        let core = self.core.lock();
        if live {
            core.serialize()
        } else {
            core.serialize_at(barrier)
        }
    }

    fn finish_flush(&self, barrier: i64, written: bool) {
        self.core.lock().finish_flush(barrier, written);
    }
}
