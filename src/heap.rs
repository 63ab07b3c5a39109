//! Heap frames hold unordered rows. Frames of one object form a doubly linked
//! extent chain through the prev/next slots of the frame header.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::{
    commit::CommitToken,
    error::{FrameError, Result},
    frame::{
        Frame, FrameCore, FrameHeader, FrameId, FrameKind, InsertOutcome, RowLockPolicy,
        UpdateOutcome, FRAME_HEADER_SIZE_BYTES, NO_LINK,
    },
    row::{Chunk, RowAddress, RowPointer, UndoRecord, HEAP_ROW_HEADER_SIZE_BYTES},
    storage::{FrameAllocator, PageStore},
    tx::Transaction,
};

const PREV_FILE_SLOT: usize = 0;
const NEXT_FILE_SLOT: usize = 1;
const PREV_POINTER_SLOT: usize = 0;
const NEXT_POINTER_SLOT: usize = 1;

fn link(core: &FrameCore, file_slot: usize, pointer_slot: usize) -> Option<FrameId> {
    let header = core.header();
    let file_id = header.int_slots[file_slot];
    if file_id as i64 == NO_LINK {
        return None;
    }
    Some(FrameId::new(file_id, header.long_slots[pointer_slot]))
}

fn set_link(core: &mut FrameCore, file_slot: usize, pointer_slot: usize, target: Option<FrameId>) {
    let header = core.header_mut();
    match target {
        Some(id) => {
            header.int_slots[file_slot] = id.file_id;
            header.long_slots[pointer_slot] = id.frame_pointer;
        }
        None => {
            header.int_slots[file_slot] = NO_LINK as i32;
            header.long_slots[pointer_slot] = NO_LINK;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeapFrame {
    frame: Arc<Frame>,
}

impl HeapFrame {
    pub fn format(id: FrameId, object_id: i32, frame_size: usize, policy: RowLockPolicy) -> Self {
        Self {
            frame: Frame::format(id, object_id, FrameKind::Heap, frame_size, policy),
        }
    }

    pub fn load(bytes: &[u8], id: FrameId, policy: RowLockPolicy) -> Result<Self> {
        let frame = Frame::load(bytes, id, None, policy)?;
        let kind = frame.lock().kind();
        if kind != FrameKind::Heap {
            return Err(FrameError::InvalidFrame {
                frame: id,
                detail: format!("expected a heap frame, found {kind:?}"),
            });
        }
        Ok(Self { frame })
    }

    pub fn frame(&self) -> &Arc<Frame> {
        &self.frame
    }

    pub fn id(&self) -> FrameId {
        self.frame.id()
    }

    pub fn header(&self) -> FrameHeader {
        self.frame.lock().header().clone()
    }

    pub fn prev(&self) -> Option<FrameId> {
        link(&self.frame.lock(), PREV_FILE_SLOT, PREV_POINTER_SLOT)
    }

    pub fn next(&self) -> Option<FrameId> {
        link(&self.frame.lock(), NEXT_FILE_SLOT, NEXT_POINTER_SLOT)
    }

    pub fn set_prev(&self, prev: Option<FrameId>, token: &CommitToken) {
        set_link(&mut self.frame.lock(), PREV_FILE_SLOT, PREV_POINTER_SLOT, prev);
        self.frame.register(token);
    }

    pub fn set_next(&self, next: Option<FrameId>, token: &CommitToken) {
        set_link(&mut self.frame.lock(), NEXT_FILE_SLOT, NEXT_POINTER_SLOT, next);
        self.frame.register(token);
    }

    pub fn free(&self) -> usize {
        self.frame.lock().free()
    }

    pub fn insert(
        &self,
        payload: Vec<u8>,
        tx: &Transaction,
        token: &CommitToken,
    ) -> Result<InsertOutcome> {
        self.frame
            .insert_chunk(Chunk::heap(payload), Some(tx), true, token)
    }

    pub fn update(
        &self,
        pointer: RowPointer,
        payload: Vec<u8>,
        tx: &Transaction,
        token: &CommitToken,
    ) -> Result<UpdateOutcome> {
        self.frame.update_chunk(pointer, payload, tx, token)
    }

    pub fn delete(
        &self,
        pointer: RowPointer,
        tx: &Transaction,
        token: &CommitToken,
    ) -> Result<UndoRecord> {
        self.frame.delete_chunk(pointer, tx, token)
    }

    pub fn lock_row(
        &self,
        pointer: RowPointer,
        tx: &Transaction,
        token: &CommitToken,
    ) -> Result<UndoRecord> {
        self.frame.lock_row(pointer, tx, token)
    }

    pub fn remove(&self, pointer: RowPointer, token: &CommitToken) -> Result<Chunk> {
        self.frame.remove_chunk(pointer, token)
    }

    pub fn rows(&self, tx: &Transaction) -> Vec<Chunk> {
        self.frame.compute_visible_rows(tx)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        self.frame.serialize()
    }
}

/// The extent chain of heap frames that stores one object's rows.
pub struct HeapFile {
    object_id: i32,
    file_id: i32,
    frame_size: usize,
    policy: RowLockPolicy,
    allocator: Arc<dyn FrameAllocator>,
    frames: RwLock<Vec<HeapFrame>>,
}

impl std::fmt::Debug for HeapFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapFile")
            .field("object_id", &self.object_id)
            .field("file_id", &self.file_id)
            .field("frames", &self.frames.read().len())
            .finish()
    }
}

impl HeapFile {
    pub fn create(
        object_id: i32,
        file_id: i32,
        frame_size: usize,
        policy: RowLockPolicy,
        allocator: Arc<dyn FrameAllocator>,
    ) -> Result<Self> {
        let id = allocator.allocate_frame(FrameKind::Heap, file_id)?;
        let first = HeapFrame::format(id, object_id, frame_size, policy);
        Ok(Self {
            object_id,
            file_id,
            frame_size,
            policy,
            allocator,
            frames: RwLock::new(vec![first]),
        })
    }

    /// Load the chain starting at `first` by following next links.
    pub fn open(
        object_id: i32,
        first: FrameId,
        frame_size: usize,
        policy: RowLockPolicy,
        store: &dyn PageStore,
        allocator: Arc<dyn FrameAllocator>,
    ) -> Result<Self> {
        let mut frames = Vec::new();
        let mut cursor = Some(first);
        while let Some(id) = cursor {
            if frames.iter().any(|f: &HeapFrame| f.id() == id) {
                return Err(FrameError::InvalidFrame {
                    frame: id,
                    detail: "heap chain loops back on itself".to_string(),
                });
            }
            let bytes = store.read_page(id.file_id, id.frame_pointer, frame_size)?;
            let frame = HeapFrame::load(&bytes, id, policy)?;
            cursor = frame.next();
            frames.push(frame);
        }
        debug!(object_id, frames = frames.len(), "opened heap file");
        Ok(Self {
            object_id,
            file_id: first.file_id,
            frame_size,
            policy,
            allocator,
            frames: RwLock::new(frames),
        })
    }

    pub fn object_id(&self) -> i32 {
        self.object_id
    }

    pub fn frames(&self) -> Vec<HeapFrame> {
        self.frames.read().clone()
    }

    pub fn frame(&self, id: FrameId) -> Option<HeapFrame> {
        self.frames.read().iter().find(|f| f.id() == id).cloned()
    }

    fn frame_of(&self, address: RowAddress) -> Result<HeapFrame> {
        self.frame(address.frame_id())
            .ok_or(FrameError::NoSuchRow { address })
    }

    /// Insert into the tail frame, growing the chain when it is full.
    pub fn insert(
        &self,
        payload: Vec<u8>,
        tx: &Transaction,
        token: &CommitToken,
    ) -> Result<InsertOutcome> {
        let needed = HEAP_ROW_HEADER_SIZE_BYTES + payload.len();
        let capacity = self.frame_size - FRAME_HEADER_SIZE_BYTES;
        if needed > capacity {
            return Ok(InsertOutcome::NoSpace {
                needed,
                free: capacity,
            });
        }
        let mut tail = self.tail()?;
        loop {
            match tail.insert(payload.clone(), tx, token)? {
                InsertOutcome::Inserted(address) => return Ok(InsertOutcome::Inserted(address)),
                // Concurrent writers may fill a fresh tail before we get to it.
                InsertOutcome::NoSpace { .. } => tail = self.grow(&tail, token)?,
            }
        }
    }

    fn tail(&self) -> Result<HeapFrame> {
        self.frames
            .read()
            .last()
            .cloned()
            .ok_or_else(|| FrameError::Internal(format!("heap file {} has no frames", self.object_id)))
    }

    fn grow(&self, tail: &HeapFrame, token: &CommitToken) -> Result<HeapFrame> {
        let mut frames = self.frames.write();
        // Another writer may have grown the chain already.
        if let Some(last) = frames.last() {
            if last.id() != tail.id() {
                return Ok(last.clone());
            }
        }
        let id = self.allocator.allocate_frame(FrameKind::Heap, self.file_id)?;
        let grown = HeapFrame::format(id, self.object_id, self.frame_size, self.policy);
        grown.set_prev(Some(tail.id()), token);
        tail.set_next(Some(id), token);
        debug!(object_id = self.object_id, frame = %id, "heap chain grew");
        frames.push(grown.clone());
        Ok(grown)
    }

    pub fn update(
        &self,
        address: RowAddress,
        payload: Vec<u8>,
        tx: &Transaction,
        token: &CommitToken,
    ) -> Result<UpdateOutcome> {
        self.frame_of(address)?
            .update(address.row_pointer, payload, tx, token)
    }

    pub fn delete(
        &self,
        address: RowAddress,
        tx: &Transaction,
        token: &CommitToken,
    ) -> Result<UndoRecord> {
        self.frame_of(address)?.delete(address.row_pointer, tx, token)
    }

    /// Every row of the chain visible to `tx`, with its address.
    pub fn scan(&self, tx: &Transaction) -> Vec<(RowAddress, Chunk)> {
        self.frames()
            .iter()
            .flat_map(|frame| {
                let id = frame.id();
                frame
                    .rows(tx)
                    .into_iter()
                    .map(move |chunk| (RowAddress::in_frame(id, chunk.row_pointer()), chunk))
            })
            .collect()
    }

    /// Roll back `tx` in every frame of the chain.
    pub fn rollback(&self, tx: &Transaction, token: &CommitToken) -> Result<usize> {
        let mut reverted = 0;
        for frame in self.frames() {
            reverted += frame.frame().rollback_transaction(tx, token)?;
        }
        Ok(reverted)
    }
}

#[cfg(test)]
mod heap_tests {
    use std::time::Duration;

    use super::*;
    use crate::{commit::TokenPool, storage::MemoryStore, tx::TransactionRegistry};

    const FRAME_SIZE: usize = 256;

    fn policy() -> RowLockPolicy {
        RowLockPolicy {
            retries: 1,
            backoff: Duration::from_millis(1),
        }
    }

    fn heap_file(store: &Arc<MemoryStore>) -> HeapFile {
        HeapFile::create(
            7,
            0,
            FRAME_SIZE,
            policy(),
            Arc::clone(store) as Arc<dyn FrameAllocator>,
        )
        .unwrap()
    }

    #[test]
    fn rollback_reverts_rows_across_the_chain() {
        let store = Arc::new(MemoryStore::new(FRAME_SIZE));
        let heap = heap_file(&store);
        let pool = TokenPool::new(false);
        let token = pool.acquire().unwrap();
        let registry = TransactionRegistry::new();
        let loader = registry.begin();
        let mut addresses = Vec::new();
        for n in 0..6u8 {
            let outcome = heap.insert(vec![n; 40], &loader, &token).unwrap();
            addresses.push(outcome.address().unwrap());
        }
        registry.commit(&loader);
        assert!(heap.frames().len() > 1);

        let tx = registry.begin();
        heap.update(addresses[0], vec![9; 10], &tx, &token).unwrap();
        heap.delete(addresses[5], &tx, &token).unwrap();
        let fresh = heap.insert(vec![8; 10], &tx, &token).unwrap().address().unwrap();
        heap.update(fresh, vec![7; 12], &tx, &token).unwrap();
        assert_eq!(heap.rollback(&tx, &token).unwrap(), 3);
        registry.abort(&tx);

        let rows = heap.scan(&registry.begin());
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[0].1.payload, vec![0; 40]);
        assert!(rows.iter().all(|(address, _)| *address != fresh));
    }

    #[test]
    fn links_round_trip_through_header_slots() {
        let pool = TokenPool::new(false);
        let token = pool.acquire().unwrap();
        let frame = HeapFrame::format(FrameId::new(0, 256), 1, FRAME_SIZE, policy());
        assert_eq!(frame.prev(), None);
        frame.set_prev(Some(FrameId::new(0, 0)), &token);
        frame.set_next(Some(FrameId::new(2, 512)), &token);

        let loaded = HeapFrame::load(&frame.serialize().unwrap(), frame.id(), policy()).unwrap();
        assert_eq!(loaded.prev(), Some(FrameId::new(0, 0)));
        assert_eq!(loaded.next(), Some(FrameId::new(2, 512)));
        assert!(pool.is_dirty(frame.id()));
    }

    #[test]
    fn loading_an_index_image_as_heap_is_fatal() {
        let core = FrameCore::new(
            FrameHeader::new(FrameId::new(0, 0), 1, FrameKind::IndexLeaf),
            FRAME_SIZE,
        );
        let image = core.serialize().unwrap();
        assert!(matches!(
            HeapFrame::load(&image, FrameId::new(0, 0), policy()),
            Err(FrameError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn full_tail_grows_the_chain() {
        let store = Arc::new(MemoryStore::new(FRAME_SIZE));
        let file = heap_file(&store);
        let registry = TransactionRegistry::new();
        let pool = TokenPool::new(false);
        let tx = registry.begin();
        let token = pool.acquire().unwrap();

        // 96 header bytes leave room for two 64-byte rows (16 + 48) and a bit.
        let mut addresses = Vec::new();
        for i in 0..5u8 {
            let outcome = file.insert(vec![i; 48], &tx, &token).unwrap();
            addresses.push(outcome.address().unwrap());
        }
        let frames = file.frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].next(), Some(frames[1].id()));
        assert_eq!(frames[1].prev(), Some(frames[0].id()));
        assert_eq!(frames[2].next(), None);

        let rows = file.scan(&tx);
        assert_eq!(rows.len(), 5);
        assert_eq!(rows.iter().map(|(a, _)| *a).collect::<Vec<_>>(), addresses);
    }

    #[test]
    fn oversized_rows_never_fit() {
        let store = Arc::new(MemoryStore::new(FRAME_SIZE));
        let file = heap_file(&store);
        let registry = TransactionRegistry::new();
        let pool = TokenPool::new(false);
        let tx = registry.begin();
        let token = pool.acquire().unwrap();
        let outcome = file.insert(vec![0; FRAME_SIZE], &tx, &token).unwrap();
        assert!(matches!(outcome, InsertOutcome::NoSpace { .. }));
        assert_eq!(file.frames().len(), 1);
    }

    #[test]
    fn chain_reopens_from_store() {
        let store = Arc::new(MemoryStore::new(FRAME_SIZE));
        let file = heap_file(&store);
        let registry = TransactionRegistry::new();
        let pool = TokenPool::new(false);
        let tx = registry.begin();
        {
            let token = pool.acquire().unwrap();
            for i in 0..4u8 {
                file.insert(vec![i; 60], &tx, &token).unwrap();
            }
        }
        registry.commit(&tx);
        for frame in file.frames() {
            let id = frame.id();
            store
                .write_page(id.file_id, id.frame_pointer, &frame.serialize().unwrap())
                .unwrap();
        }
        let first = file.frames()[0].id();
        let reopened = HeapFile::open(
            7,
            first,
            FRAME_SIZE,
            policy(),
            &*store,
            Arc::clone(&store) as Arc<dyn FrameAllocator>,
        )
        .unwrap();
        assert_eq!(reopened.frames().len(), file.frames().len());
        let reader = registry.begin();
        let payloads: Vec<Vec<u8>> = reopened.scan(&reader).into_iter().map(|(_, c)| c.payload).collect();
        assert_eq!(payloads, (0..4u8).map(|i| vec![i; 60]).collect::<Vec<_>>());
    }

    #[test]
    fn update_and_delete_by_address() {
        let store = Arc::new(MemoryStore::new(FRAME_SIZE));
        let file = heap_file(&store);
        let registry = TransactionRegistry::new();
        let pool = TokenPool::new(false);
        let writer = registry.begin();
        let token = pool.acquire().unwrap();
        let a = file.insert(b"one".to_vec(), &writer, &token).unwrap().address().unwrap();
        let b = file.insert(b"two".to_vec(), &writer, &token).unwrap().address().unwrap();
        file.update(a, b"uno".to_vec(), &writer, &token).unwrap();
        file.delete(b, &writer, &token).unwrap();
        registry.commit(&writer);

        let reader = registry.begin();
        let rows = file.scan(&reader);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.payload, b"uno");
        assert!(matches!(
            file.delete(RowAddress::new(9, 0, 0), &reader, &token),
            Err(FrameError::NoSuchRow { .. })
        ));
    }
}
