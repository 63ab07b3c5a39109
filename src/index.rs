//! B-tree index frames.
//!
//! A node frame holds separator entries whose back-pointer slot addresses a
//! child frame: the child under separator `k` holds keys `<= k`. Keys above
//! every separator live under the left (last) child kept in the header. A
//! leaf frame holds key entries whose back-pointer addresses the heap row.
//!
//! When a frame is full, [`IndexFrame::add`] splits it into a new right
//! sibling. Runs of equal keys stay on one page where possible; a page made
//! of a single run is divided and flagged so lookups continue into the next
//! sibling.

use std::sync::Arc;

use tracing::debug;

use crate::{
    codec::{Codec, Key},
    commit::CommitToken,
    error::{FrameError, Result},
    frame::{
        visible_version, Frame, FrameCore, FrameHeader, FrameId, FrameKind, InsertOutcome,
        RowLockPolicy, FRAME_HEADER_SIZE_BYTES, NO_LINK,
    },
    row::{Chunk, RowAddress, RowPointer, RowState, UndoRecord},
    storage::FrameAllocator,
    tx::{Transaction, NO_OWNER},
};

const FLAGS_SLOT: usize = 0;
const PARENT_FILE_SLOT: usize = 1;
const NEXT_POINTER_HIGH_SLOT: usize = 2;
const NEXT_POINTER_LOW_SLOT: usize = 3;
const NEXT_FILE_SLOT: usize = 4;
const PARENT_POINTER_SLOT: usize = 0;
const LEFT_CHILD_SLOT: usize = 1;

/// The page's maximum key may continue into the next sibling.
pub const FLAG_MULTI_VALUE: i32 = 1;
/// The page came out of a split that had to cut a run of equal keys.
pub const FLAG_DIVIDED: i32 = 1 << 1;
pub const FLAG_UNIQUE: i32 = 1 << 2;

fn flags(core: &FrameCore) -> i32 {
    core.header().int_slots[FLAGS_SLOT]
}

fn set_flags(core: &mut FrameCore, flags: i32) {
    core.header_mut().int_slots[FLAGS_SLOT] = flags;
}

fn parent(core: &FrameCore) -> Option<FrameId> {
    let header = core.header();
    let file_id = header.int_slots[PARENT_FILE_SLOT];
    if file_id as i64 == NO_LINK {
        return None;
    }
    Some(FrameId::new(file_id, header.long_slots[PARENT_POINTER_SLOT]))
}

fn set_parent(core: &mut FrameCore, target: Option<FrameId>) {
    let header = core.header_mut();
    let (file_id, pointer) = target.map_or((NO_LINK as i32, NO_LINK), |id| {
        (id.file_id, id.frame_pointer)
    });
    header.int_slots[PARENT_FILE_SLOT] = file_id;
    header.long_slots[PARENT_POINTER_SLOT] = pointer;
}

fn next_sibling(core: &FrameCore) -> Option<FrameId> {
    let header = core.header();
    let file_id = header.int_slots[NEXT_FILE_SLOT];
    if file_id as i64 == NO_LINK {
        return None;
    }
    let high = header.int_slots[NEXT_POINTER_HIGH_SLOT] as i64;
    let low = header.int_slots[NEXT_POINTER_LOW_SLOT] as u32 as i64;
    Some(FrameId::new(file_id, (high << 32) | low))
}

fn set_next_sibling(core: &mut FrameCore, target: Option<FrameId>) {
    let header = core.header_mut();
    let (file_id, pointer) = target.map_or((NO_LINK as i32, NO_LINK), |id| {
        (id.file_id, id.frame_pointer)
    });
    header.int_slots[NEXT_FILE_SLOT] = file_id;
    header.int_slots[NEXT_POINTER_HIGH_SLOT] = (pointer >> 32) as i32;
    header.int_slots[NEXT_POINTER_LOW_SLOT] = pointer as i32;
}

/// Children always live in the node's own file.
fn left_child(core: &FrameCore) -> Option<FrameId> {
    let pointer = core.header().long_slots[LEFT_CHILD_SLOT];
    (pointer != NO_LINK).then(|| FrameId::new(core.id().file_id, pointer))
}

fn set_left_child(core: &mut FrameCore, target: Option<FrameId>) {
    core.header_mut().long_slots[LEFT_CHILD_SLOT] = target.map_or(NO_LINK, |id| id.frame_pointer);
}

fn child_of(chunk: &Chunk) -> Option<FrameId> {
    chunk.header.back_pointer.map(|address| address.frame_id())
}

/// Outcome of [`IndexFrame::add`].
#[derive(Debug)]
pub enum AddOutcome {
    Added(RowAddress),
    Split(SplitResult),
}

/// What the caller needs to hook a fresh right sibling into the tree.
#[derive(Debug)]
pub struct SplitResult {
    /// Where the new entry landed. Always `None` for node frames.
    pub entry: Option<RowAddress>,
    /// Largest key left on the splitting page; it becomes the parent separator.
    pub separator: Key,
    pub sibling: IndexFrame,
    /// Children that now hang below `sibling` (node splits only).
    pub moved_children: Vec<FrameId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Existing(RowPointer),
    Incoming,
}

#[derive(Debug)]
struct Planned {
    key: Key,
    slot: Slot,
    size: usize,
}

fn fits(items: &[Planned], split: usize, capacity: usize) -> bool {
    let left: usize = items[..split].iter().map(|i| i.size).sum();
    let right: usize = items[split..].iter().map(|i| i.size).sum();
    left <= capacity && right <= capacity
}

/// Number of entries that stay on the splitting page.
fn split_point(items: &[Planned], capacity: usize, append: bool) -> Result<usize> {
    let n = items.len();
    if append {
        return Ok(n - 1);
    }
    let total: usize = items.iter().map(|i| i.size).sum();
    let mut acc = 0;
    let mut split = n - 1;
    for (i, item) in items.iter().enumerate() {
        acc += item.size;
        if acc * 2 >= total {
            split = i + 1;
            break;
        }
    }
    let midpoint = split.clamp(1, n - 1);
    split = midpoint;

    let first_key = &items[0].key;
    if items[split].key == *first_key {
        debug!(split, "moving split point to the right");
        while split < n && items[split].key == *first_key {
            split += 1;
        }
        if split == n {
            debug!("page holds a single key run, dividing it");
            split = midpoint;
        }
    } else {
        debug!(split, "moving split point left to the first instance of the split key");
        let split_key = &items[split].key;
        while split > 0 && items[split - 1].key == *split_key {
            split -= 1;
        }
    }
    if !fits(items, split, capacity) {
        split = midpoint;
    }
    if !fits(items, split, capacity) {
        return Err(FrameError::Internal(format!(
            "no split point leaves both halves within {capacity} bytes"
        )));
    }
    Ok(split)
}

/// A B-tree node or leaf page.
#[derive(Clone)]
pub struct IndexFrame {
    frame: Arc<Frame>,
    codec: Arc<dyn Codec>,
}

impl std::fmt::Debug for IndexFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexFrame")
            .field("id", &self.frame.id())
            .finish()
    }
}

impl IndexFrame {
    pub fn format(
        id: FrameId,
        object_id: i32,
        kind: FrameKind,
        frame_size: usize,
        policy: RowLockPolicy,
        codec: Arc<dyn Codec>,
        unique: bool,
    ) -> Self {
        let mut header = FrameHeader::new(id, object_id, kind);
        header.int_slots[FLAGS_SLOT] = if unique { FLAG_UNIQUE } else { 0 };
        let core = FrameCore::new(header, frame_size);
        Self {
            frame: Frame::new(core, policy),
            codec,
        }
    }

    pub fn load(
        bytes: &[u8],
        id: FrameId,
        policy: RowLockPolicy,
        codec: Arc<dyn Codec>,
    ) -> Result<Self> {
        let frame = Frame::load(bytes, id, Some(codec.as_ref()), policy)?;
        let kind = frame.lock().kind();
        if !kind.is_index() {
            return Err(FrameError::InvalidFrame {
                frame: id,
                detail: format!("expected an index frame, found {kind:?}"),
            });
        }
        Ok(Self { frame, codec })
    }

    pub fn frame(&self) -> &Arc<Frame> {
        &self.frame
    }

    pub fn id(&self) -> FrameId {
        self.frame.id()
    }

    pub fn kind(&self) -> FrameKind {
        self.frame.lock().kind()
    }

    pub fn is_leaf(&self) -> bool {
        self.kind() == FrameKind::IndexLeaf
    }

    pub fn len(&self) -> usize {
        self.frame.lock().chunks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_multi_value(&self) -> bool {
        flags(&self.frame.lock()) & FLAG_MULTI_VALUE != 0
    }

    pub fn is_divided(&self) -> bool {
        flags(&self.frame.lock()) & FLAG_DIVIDED != 0
    }

    pub fn is_unique(&self) -> bool {
        flags(&self.frame.lock()) & FLAG_UNIQUE != 0
    }

    pub fn parent(&self) -> Option<FrameId> {
        parent(&self.frame.lock())
    }

    pub fn set_parent(&self, target: Option<FrameId>, token: &CommitToken) {
        set_parent(&mut self.frame.lock(), target);
        self.frame.register(token);
    }

    pub fn next_sibling(&self) -> Option<FrameId> {
        next_sibling(&self.frame.lock())
    }

    pub fn left_child(&self) -> Option<FrameId> {
        left_child(&self.frame.lock())
    }

    pub fn set_left_child(&self, target: Option<FrameId>, token: &CommitToken) {
        set_left_child(&mut self.frame.lock(), target);
        self.frame.register(token);
    }

    /// Every entry in key order, regardless of visibility.
    pub fn entries(&self) -> Vec<Chunk> {
        self.frame
            .lock()
            .chunks_mut()
            .iter_ordered()
            .map(Chunk::detached)
            .collect()
    }

    pub fn keys(&self) -> Vec<Key> {
        self.frame
            .lock()
            .chunks_mut()
            .iter_ordered()
            .filter_map(|c| c.key.clone())
            .collect()
    }

    pub fn max_key(&self) -> Option<Key> {
        self.frame
            .lock()
            .chunks_mut()
            .iter_ordered()
            .last()
            .and_then(|c| c.key.clone())
    }

    /// Child frame to descend into for `key`: the child of the first separator
    /// `>= key`, else the left (last) child.
    pub fn get_child_element_ptr(&self, key: &Key) -> Result<FrameId> {
        let mut core = self.frame.lock();
        let id = core.id();
        if core.kind() != FrameKind::IndexNode {
            return Err(FrameError::Internal(format!(
                "child lookup on non-node frame {id}"
            )));
        }
        let found = core
            .chunks_mut()
            .iter_ordered()
            .find(|c| c.key.as_ref().is_some_and(|k| k >= key))
            .map(|c| {
                child_of(c).ok_or_else(|| FrameError::InvalidFrame {
                    frame: id,
                    detail: format!("separator {} has no child", c.row_pointer()),
                })
            })
            .transpose()?;
        match found {
            Some(child) => Ok(child),
            None => left_child(&core).ok_or_else(|| FrameError::InvalidFrame {
                frame: id,
                detail: "node has no left child".to_string(),
            }),
        }
    }

    /// First entry for `key` visible to `tx`. Needs no sorting.
    pub fn get_object_by_key(&self, key: &Key, tx: &Transaction) -> Option<Chunk> {
        let core = self.frame.lock();
        let id = core.id();
        core.chunks()
            .get_by_key(key)
            .into_iter()
            .find_map(|c| visible_version(c, tx, id).map(Chunk::detached))
    }

    /// Every entry for `key` visible to `tx`, in row order.
    pub fn get_objects_by_key(&self, key: &Key, tx: &Transaction) -> Vec<Chunk> {
        let mut core = self.frame.lock();
        let id = core.id();
        core.chunks_mut()
            .iter_ordered()
            .skip_while(|c| c.key.as_ref().is_some_and(|k| k < key))
            .take_while(|c| c.key.as_ref() == Some(key))
            .filter_map(|c| visible_version(c, tx, id).map(Chunk::detached))
            .collect()
    }

    /// Whether a live transaction other than `tx` holds an uncommitted entry for `key`.
    pub fn has_pending_entry(&self, key: &Key, tx: &Transaction) -> bool {
        let mut core = self.frame.lock();
        let pending = core.chunks_mut()
            .iter_ordered()
            .skip_while(|c| c.key.as_ref().is_some_and(|k| k < key))
            .take_while(|c| c.key.as_ref() == Some(key))
            .any(|c| c.header.state == RowState::Normal && tx.is_live_foreign(c.header.owner_tx));
        pending
    }

    fn find_entry(core: &mut FrameCore, key: &Key, target: Option<RowAddress>) -> Option<RowPointer> {
        core.chunks_mut()
            .iter_ordered()
            .find(|c| c.key.as_ref() == Some(key) && c.header.back_pointer == target)
            .map(Chunk::row_pointer)
    }

    pub fn contains_entry(&self, key: &Key, target: Option<RowAddress>) -> bool {
        Self::find_entry(&mut self.frame.lock(), key, target).is_some()
    }

    /// Key of the separator that references `child`, `None` when `child` is the
    /// left child or not referenced at all.
    pub fn separator_for(&self, child: FrameId) -> Option<Key> {
        self.frame
            .lock()
            .chunks()
            .iter_by_pointer()
            .find(|c| child_of(c) == Some(child))
            .and_then(|c| c.key.clone())
    }

    /// Leftmost child of a node.
    pub fn first_child(&self) -> Option<FrameId> {
        let mut core = self.frame.lock();
        let first = core.chunks_mut().iter_ordered().next().and_then(child_of);
        first.or_else(|| left_child(&core))
    }

    /// Every child of a node, in key order with the left child last.
    pub fn children(&self) -> Vec<FrameId> {
        let mut core = self.frame.lock();
        let mut children: Vec<FrameId> = core.chunks_mut().iter_ordered().filter_map(child_of).collect();
        children.extend(left_child(&core));
        children
    }

    /// Physically remove the entry `(key, target)`.
    pub fn remove_entry(
        &self,
        key: &Key,
        target: Option<RowAddress>,
        token: &CommitToken,
    ) -> Result<Chunk> {
        let pointer = Self::find_entry(&mut self.frame.lock(), key, target).ok_or(
            FrameError::NoSuchRow {
                address: target.unwrap_or(RowAddress::in_frame(self.id(), -1)),
            },
        )?;
        self.frame.remove_chunk(pointer, token)
    }

    /// Mark the entry `(key, target)` deleted by `tx`.
    pub fn delete_entry(
        &self,
        key: &Key,
        target: Option<RowAddress>,
        tx: &Transaction,
        token: &CommitToken,
    ) -> Result<UndoRecord> {
        let pointer = Self::find_entry(&mut self.frame.lock(), key, target).ok_or(
            FrameError::NoSuchRow {
                address: target.unwrap_or(RowAddress::in_frame(self.id(), -1)),
            },
        )?;
        self.frame.delete_chunk(pointer, tx, token)
    }

    /// Point whatever referenced child `old` at `new` instead.
    pub fn repoint_child(&self, old: FrameId, new: FrameId, token: &CommitToken) -> Result<()> {
        let mut core = self.frame.lock();
        if left_child(&core) == Some(old) {
            set_left_child(&mut core, Some(new));
        } else {
            let pointer = core
                .chunks()
                .iter_by_pointer()
                .find(|c| child_of(c) == Some(old))
                .map(Chunk::row_pointer)
                .ok_or_else(|| {
                    FrameError::Internal(format!("node {} does not reference child {old}", core.id()))
                })?;
            core.set_back_pointer(pointer, Some(RowAddress::in_frame(new, 0)), token.id())?;
        }
        drop(core);
        self.frame.register(token);
        Ok(())
    }

    /// Insert `(key, target)`, splitting into a new right sibling when the page
    /// is full. Leaf entries belong to `tx`; node entries have no owner.
    pub fn add(
        &self,
        key: Key,
        target: Option<RowAddress>,
        tx: Option<&Transaction>,
        token: &CommitToken,
        allocator: &dyn FrameAllocator,
    ) -> Result<AddOutcome> {
        let payload = self.codec.encode(key.values())?;
        let entry = Chunk::index(key, payload, target);
        let owner = tx.map_or(NO_OWNER, Transaction::id);
        let token_id = token.id();

        let mut core = self.frame.lock();
        let capacity = core.frame_size() - FRAME_HEADER_SIZE_BYTES;
        if entry.size() * 2 > capacity {
            return Err(FrameError::Internal(format!(
                "index entry of {} bytes cannot share a {capacity}-byte page",
                entry.size()
            )));
        }
        if let InsertOutcome::Inserted(address) =
            core.insert_chunk(entry.clone(), owner, token_id, true)?
        {
            drop(core);
            self.frame.register(token);
            return Ok(AddOutcome::Added(address));
        }

        let kind = core.kind();
        let new_key = entry.key.clone().unwrap_or_default();
        let mut items: Vec<Planned> = core
            .chunks_mut()
            .iter_ordered()
            .map(|c| Planned {
                key: c.key.clone().unwrap_or_default(),
                slot: Slot::Existing(c.row_pointer()),
                size: c.size(),
            })
            .collect();
        let max_key = items.last().map(|i| i.key.clone());
        let position = items.partition_point(|i| i.key <= new_key);
        items.insert(
            position,
            Planned {
                key: new_key.clone(),
                slot: Slot::Incoming,
                size: entry.size(),
            },
        );
        let append = max_key.is_some_and(|max| new_key > max);
        let split = split_point(&items, capacity, append)?;
        let inside_run = items[split - 1].key == items[split].key;
        debug!(
            frame = %core.id(),
            entries = items.len(),
            split,
            append,
            inside_run,
            "splitting index frame"
        );

        let sibling_id = allocator.allocate_frame(kind, core.id().file_id)?;
        let page_flags = flags(&core);
        let sibling = IndexFrame::format(
            sibling_id,
            core.header().object_id,
            kind,
            core.frame_size(),
            self.frame.policy(),
            Arc::clone(&self.codec),
            page_flags & FLAG_UNIQUE != 0,
        );
        let mut sib = sibling.frame.lock();

        let mut incoming_left = true;
        for item in &items[split..] {
            match item.slot {
                Slot::Existing(pointer) => {
                    let chunk = core.remove_chunk(pointer, token_id)?;
                    sib.adopt_chunk(chunk, token_id)?;
                }
                Slot::Incoming => incoming_left = false,
            }
        }
        let outcome = if incoming_left {
            core.insert_chunk(entry, owner, token_id, false)?
        } else {
            sib.insert_chunk(entry, owner, token_id, false)?
        };
        let placed = outcome
            .address()
            .ok_or_else(|| FrameError::Internal(format!("no row pointer left in {}", core.id())))?;

        set_next_sibling(&mut sib, next_sibling(&core));
        set_next_sibling(&mut core, Some(sibling_id));
        set_parent(&mut sib, parent(&core));
        set_left_child(&mut sib, left_child(&core));

        let mut left_flags = page_flags & !FLAG_MULTI_VALUE;
        let mut right_flags = page_flags;
        if inside_run {
            left_flags |= FLAG_MULTI_VALUE | FLAG_DIVIDED;
            right_flags |= FLAG_DIVIDED;
        }
        set_flags(&mut core, left_flags);
        set_flags(&mut sib, right_flags);

        let separator = items[split - 1].key.clone();
        let (entry, moved_children) = if kind == FrameKind::IndexNode {
            let promoted = match items[split - 1].slot {
                Slot::Existing(pointer) => pointer,
                Slot::Incoming => placed.row_pointer,
            };
            let chunk = core.remove_chunk(promoted, token_id)?;
            set_left_child(&mut core, child_of(&chunk));
            let mut moved: Vec<FrameId> = sib.chunks().iter_by_pointer().filter_map(child_of).collect();
            moved.extend(left_child(&sib));
            debug!(frame = %core.id(), separator = %separator, "promoted last node entry");
            (None, moved)
        } else {
            (Some(placed), Vec::new())
        };
        drop(sib);
        drop(core);
        self.frame.register(token);
        sibling.frame.register(token);

        Ok(AddOutcome::Split(SplitResult {
            entry,
            separator,
            sibling,
            moved_children,
        }))
    }
}

#[cfg(test)]
mod index_tests {
    use std::{collections::HashSet, time::Duration};

    use proptest::prelude::*;

    use super::*;
    use crate::{
        commit::TokenPool,
        storage::MemoryStore,
        test_utils::{long_codec, long_key},
        tx::TransactionRegistry,
    };

    /// Header plus eight `Long` entries of 40 bytes.
    const SMALL_FRAME: usize = FRAME_HEADER_SIZE_BYTES + 8 * 40;

    fn policy() -> RowLockPolicy {
        RowLockPolicy {
            retries: 0,
            backoff: Duration::from_millis(1),
        }
    }

    fn page(store: &MemoryStore, kind: FrameKind, frame_size: usize) -> IndexFrame {
        let id = store.allocate_frame(kind, 0).unwrap();
        IndexFrame::format(id, 3, kind, frame_size, policy(), Arc::new(long_codec()), false)
    }

    fn fill(
        frame: &IndexFrame,
        keys: &[i64],
        store: &MemoryStore,
        token: &CommitToken,
    ) {
        for (i, k) in keys.iter().enumerate() {
            let target = Some(RowAddress::new(9, 0, i as i32));
            let outcome = frame.add(long_key(*k), target, None, token, store).unwrap();
            assert!(matches!(outcome, AddOutcome::Added(_)));
        }
    }

    fn split_of(outcome: AddOutcome) -> SplitResult {
        match outcome {
            AddOutcome::Split(split) => split,
            AddOutcome::Added(address) => panic!("expected a split, entry went to {address}"),
        }
    }

    #[test]
    fn link_slots_round_trip() {
        let store = MemoryStore::new(SMALL_FRAME);
        let pool = TokenPool::new(false);
        let token = pool.acquire().unwrap();
        let frame = page(&store, FrameKind::IndexNode, SMALL_FRAME);
        assert_eq!(frame.next_sibling(), None);
        assert_eq!(frame.parent(), None);

        let far = FrameId::new(2, (7i64 << 32) + 416);
        frame.set_parent(Some(FrameId::new(0, 832)), &token);
        frame.set_left_child(Some(FrameId::new(0, 1248)), &token);
        set_next_sibling(&mut frame.frame().lock(), Some(far));

        let image = frame.frame().serialize().unwrap();
        let loaded = IndexFrame::load(&image, frame.id(), policy(), Arc::new(long_codec())).unwrap();
        assert_eq!(loaded.parent(), Some(FrameId::new(0, 832)));
        assert_eq!(loaded.left_child(), Some(FrameId::new(0, 1248)));
        assert_eq!(loaded.next_sibling(), Some(far));
        assert!(!loaded.has_multi_value());
    }

    #[test]
    fn larger_key_goes_alone_to_the_sibling() {
        let frame_size = FRAME_HEADER_SIZE_BYTES + 50 * 40;
        let store = MemoryStore::new(frame_size);
        let pool = TokenPool::new(false);
        let token = pool.acquire().unwrap();
        let leaf = page(&store, FrameKind::IndexLeaf, frame_size);
        fill(&leaf, &(1..=50).collect::<Vec<_>>(), &store, &token);

        let split = split_of(leaf.add(long_key(51), None, None, &token, &store).unwrap());
        assert_eq!(split.separator, long_key(50));
        assert_eq!(leaf.len(), 50);
        assert_eq!(split.sibling.keys(), vec![long_key(51)]);
        assert_eq!(leaf.next_sibling(), Some(split.sibling.id()));
        assert_eq!(split.entry.map(|a| a.frame_id()), Some(split.sibling.id()));
        assert!(split.moved_children.is_empty());
    }

    #[test]
    fn duplicate_runs_stay_on_one_page() {
        let store = MemoryStore::new(SMALL_FRAME);
        let pool = TokenPool::new(false);
        let token = pool.acquire().unwrap();
        let leaf = page(&store, FrameKind::IndexLeaf, SMALL_FRAME);
        fill(&leaf, &[2, 1, 2, 2, 1, 2, 2, 2], &store, &token);

        let split = split_of(leaf.add(long_key(1), None, None, &token, &store).unwrap());
        assert_eq!(leaf.keys(), vec![long_key(1); 3]);
        assert_eq!(split.sibling.keys(), vec![long_key(2); 6]);
        assert_eq!(split.separator, long_key(1));
        assert!(!leaf.has_multi_value());
        assert!(!leaf.is_divided());
    }

    #[test]
    fn single_run_is_divided_and_flagged() {
        let store = MemoryStore::new(SMALL_FRAME);
        let pool = TokenPool::new(false);
        let token = pool.acquire().unwrap();
        let leaf = page(&store, FrameKind::IndexLeaf, SMALL_FRAME);
        fill(&leaf, &[5; 8], &store, &token);

        let split = split_of(leaf.add(long_key(5), None, None, &token, &store).unwrap());
        assert_eq!(leaf.len() + split.sibling.len(), 9);
        assert!(leaf.has_multi_value());
        assert!(leaf.is_divided());
        assert!(split.sibling.is_divided());
        assert!(!split.sibling.has_multi_value());
    }

    #[test]
    fn node_split_promotes_last_entry() {
        let store = MemoryStore::new(SMALL_FRAME);
        let pool = TokenPool::new(false);
        let token = pool.acquire().unwrap();
        let node = page(&store, FrameKind::IndexNode, SMALL_FRAME);
        let child = |n: i64| FrameId::new(0, n * SMALL_FRAME as i64);
        node.set_left_child(Some(child(99)), &token);
        for k in 1..=8i64 {
            let target = Some(RowAddress::in_frame(child(k), 0));
            node.add(long_key(k * 10), target, None, &token, &store).unwrap();
        }

        let target = Some(RowAddress::in_frame(child(85), 0));
        let split = split_of(node.add(long_key(85), target, None, &token, &store).unwrap());
        assert_eq!(split.separator, long_key(80));
        assert_eq!(split.entry, None);
        assert_eq!(node.len(), 7);
        assert_eq!(node.left_child(), Some(child(8)));
        assert_eq!(split.sibling.keys(), vec![long_key(85)]);
        assert_eq!(split.sibling.left_child(), Some(child(99)));
        let moved: HashSet<FrameId> = split.moved_children.into_iter().collect();
        assert_eq!(moved, HashSet::from([child(85), child(99)]));
    }

    #[test]
    fn child_lookup_takes_first_separator_not_below_key() {
        let store = MemoryStore::new(SMALL_FRAME);
        let pool = TokenPool::new(false);
        let token = pool.acquire().unwrap();
        let node = page(&store, FrameKind::IndexNode, SMALL_FRAME);
        let (a, b, c) = (FrameId::new(0, 1000), FrameId::new(0, 2000), FrameId::new(0, 3000));
        node.add(long_key(20), Some(RowAddress::in_frame(b, 0)), None, &token, &store).unwrap();
        node.add(long_key(10), Some(RowAddress::in_frame(a, 0)), None, &token, &store).unwrap();
        node.set_left_child(Some(c), &token);

        assert_eq!(node.get_child_element_ptr(&long_key(5)).unwrap(), a);
        assert_eq!(node.get_child_element_ptr(&long_key(10)).unwrap(), a);
        assert_eq!(node.get_child_element_ptr(&long_key(15)).unwrap(), b);
        assert_eq!(node.get_child_element_ptr(&long_key(25)).unwrap(), c);

        node.repoint_child(b, FrameId::new(0, 4000), &token).unwrap();
        assert_eq!(node.get_child_element_ptr(&long_key(15)).unwrap(), FrameId::new(0, 4000));
    }

    #[test]
    fn leaf_lookups_respect_visibility() {
        let store = MemoryStore::new(SMALL_FRAME);
        let pool = TokenPool::new(false);
        let token = pool.acquire().unwrap();
        let registry = TransactionRegistry::new();
        let writer = registry.begin();
        let leaf = page(&store, FrameKind::IndexLeaf, SMALL_FRAME);
        for (i, k) in [7i64, 3, 7, 9].iter().enumerate() {
            let target = Some(RowAddress::new(1, 0, i as i32));
            leaf.add(long_key(*k), target, Some(&writer), &token, &store).unwrap();
        }
        let early = registry.begin();
        assert!(leaf.get_object_by_key(&long_key(3), &early).is_none());
        assert_eq!(leaf.get_objects_by_key(&long_key(7), &writer).len(), 2);

        registry.commit(&writer);
        let reader = registry.begin();
        let found = leaf.get_object_by_key(&long_key(3), &reader).unwrap();
        assert_eq!(found.header.back_pointer, Some(RowAddress::new(1, 0, 1)));
        let sevens = leaf.get_objects_by_key(&long_key(7), &reader);
        assert_eq!(sevens.len(), 2);
        assert!(leaf.get_objects_by_key(&long_key(8), &reader).is_empty());

        let deleter = registry.begin();
        leaf.delete_entry(&long_key(9), Some(RowAddress::new(1, 0, 3)), &deleter, &token)
            .unwrap();
        registry.commit(&deleter);
        assert!(leaf.get_object_by_key(&long_key(9), &registry.begin()).is_none());
        assert!(leaf.get_object_by_key(&long_key(9), &reader).is_some());
    }

    proptest! {
        #[test]
        fn split_preserves_every_entry(keys in proptest::collection::vec(0i64..6, 9)) {
            let store = MemoryStore::new(SMALL_FRAME);
            let pool = TokenPool::new(false);
            let token = pool.acquire().unwrap();
            let leaf = page(&store, FrameKind::IndexLeaf, SMALL_FRAME);
            fill(&leaf, &keys[..8], &store, &token);

            let incoming = RowAddress::new(9, 0, 8);
            let split = split_of(leaf.add(long_key(keys[8]), Some(incoming), None, &token, &store).unwrap());

            let mut before: Vec<(Key, Option<RowAddress>)> = keys
                .iter()
                .enumerate()
                .map(|(i, k)| (long_key(*k), Some(RowAddress::new(9, 0, i as i32))))
                .collect();
            let left = leaf.entries();
            let right = split.sibling.entries();
            let mut after: Vec<(Key, Option<RowAddress>)> = left
                .iter()
                .chain(&right)
                .map(|c| (c.key.clone().unwrap(), c.header.back_pointer))
                .collect();
            before.sort();
            after.sort();
            prop_assert_eq!(before, after);

            let left_max = left.last().and_then(|c| c.key.clone()).unwrap();
            let right_min = right.first().and_then(|c| c.key.clone()).unwrap();
            prop_assert!(left_max <= right_min);
            if left_max == right_min {
                prop_assert!(leaf.has_multi_value());
            }
            prop_assert_eq!(split.separator, left_max);
        }
    }
}
