use std::{collections::VecDeque, sync::Arc};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::{
    codec::{Codec, Key},
    commit::CommitToken,
    error::{FrameError, Result},
    frame::{FrameId, FrameKind, RowLockPolicy},
    index::{AddOutcome, IndexFrame, SplitResult},
    row::{Chunk, RowAddress, UndoRecord},
    storage::{FrameAllocator, PageStore},
    tx::Transaction,
};

/// A B-tree over index frames. Leaves map keys to heap row addresses; runs of
/// one key may span several leaves chained through next-sibling links.
///
/// Structural changes (splits, new roots) run under the tree's structure lock
/// in write mode, lookups in read mode.
pub struct IndexTree {
    object_id: i32,
    file_id: i32,
    frame_size: usize,
    policy: RowLockPolicy,
    unique: bool,
    codec: Arc<dyn Codec>,
    allocator: Arc<dyn FrameAllocator>,
    root: RwLock<FrameId>,
    frames: DashMap<FrameId, IndexFrame>,
    structure: RwLock<()>,
}

impl std::fmt::Debug for IndexTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexTree")
            .field("object_id", &self.object_id)
            .field("root", &*self.root.read())
            .field("frames", &self.frames.len())
            .field("unique", &self.unique)
            .finish()
    }
}

impl IndexTree {
    pub fn create(
        object_id: i32,
        file_id: i32,
        frame_size: usize,
        policy: RowLockPolicy,
        codec: Arc<dyn Codec>,
        unique: bool,
        allocator: Arc<dyn FrameAllocator>,
    ) -> Result<Self> {
        let root_id = allocator.allocate_frame(FrameKind::IndexLeaf, file_id)?;
        let root = IndexFrame::format(
            root_id,
            object_id,
            FrameKind::IndexLeaf,
            frame_size,
            policy,
            Arc::clone(&codec),
            unique,
        );
        let frames = DashMap::new();
        frames.insert(root_id, root);
        debug!(object_id, root = %root_id, unique, "created index");
        Ok(Self {
            object_id,
            file_id,
            frame_size,
            policy,
            unique,
            codec,
            allocator,
            root: RwLock::new(root_id),
            frames,
            structure: RwLock::new(()),
        })
    }

    /// Load every frame reachable from `root`.
    pub fn open(
        object_id: i32,
        root: FrameId,
        frame_size: usize,
        policy: RowLockPolicy,
        codec: Arc<dyn Codec>,
        store: &dyn PageStore,
        allocator: Arc<dyn FrameAllocator>,
    ) -> Result<Self> {
        let frames: DashMap<FrameId, IndexFrame> = DashMap::new();
        let mut pending = VecDeque::from([root]);
        while let Some(id) = pending.pop_front() {
            if frames.contains_key(&id) {
                return Err(FrameError::InvalidFrame {
                    frame: id,
                    detail: "index frame reachable twice".to_string(),
                });
            }
            let bytes = store.read_page(id.file_id, id.frame_pointer, frame_size)?;
            let frame = IndexFrame::load(&bytes, id, policy, Arc::clone(&codec))?;
            if !frame.is_leaf() {
                pending.extend(frame.children());
            }
            frames.insert(id, frame);
        }
        let unique = frames.get(&root).is_some_and(|f| f.is_unique());
        info!(object_id, root = %root, frames = frames.len(), "opened index");
        Ok(Self {
            object_id,
            file_id: root.file_id,
            frame_size,
            policy,
            unique,
            codec,
            allocator,
            root: RwLock::new(root),
            frames,
            structure: RwLock::new(()),
        })
    }

    pub fn object_id(&self) -> i32 {
        self.object_id
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn root(&self) -> FrameId {
        *self.root.read()
    }

    pub fn frames(&self) -> Vec<IndexFrame> {
        self.frames.iter().map(|f| f.value().clone()).collect()
    }

    pub fn frame(&self, id: FrameId) -> Result<IndexFrame> {
        self.frames
            .get(&id)
            .map(|f| f.value().clone())
            .ok_or_else(|| FrameError::Internal(format!("index {} has no frame {id}", self.object_id)))
    }

    fn find_leaf(&self, key: &Key) -> Result<IndexFrame> {
        let mut current = self.frame(self.root())?;
        while !current.is_leaf() {
            let child = current.get_child_element_ptr(key)?;
            current = self.frame(child)?;
        }
        Ok(current)
    }

    /// The leaf after `leaf` when its largest key runs on into it.
    fn continuation(&self, leaf: &IndexFrame, key: &Key) -> Result<Option<IndexFrame>> {
        if !leaf.has_multi_value() || leaf.max_key().as_ref() != Some(key) {
            return Ok(None);
        }
        leaf.next_sibling().map(|id| self.frame(id)).transpose()
    }

    fn find_unlocked(&self, key: &Key, tx: &Transaction) -> Result<Option<Chunk>> {
        let mut leaf = Some(self.find_leaf(key)?);
        while let Some(current) = leaf {
            if let Some(found) = current.get_object_by_key(key, tx) {
                return Ok(Some(found));
            }
            leaf = self.continuation(&current, key)?;
        }
        Ok(None)
    }

    /// Whether `key` is visible to `tx` or held by another live transaction.
    fn key_taken(&self, key: &Key, tx: &Transaction) -> Result<bool> {
        let mut leaf = Some(self.find_leaf(key)?);
        while let Some(current) = leaf {
            if current.get_object_by_key(key, tx).is_some() || current.has_pending_entry(key, tx) {
                return Ok(true);
            }
            leaf = self.continuation(&current, key)?;
        }
        Ok(false)
    }

    /// First entry for `key` visible to `tx`.
    pub fn find(&self, key: &Key, tx: &Transaction) -> Result<Option<Chunk>> {
        let _guard = self.structure.read();
        self.find_unlocked(key, tx)
    }

    /// Every entry for `key` visible to `tx`, following divided runs across leaves.
    pub fn find_all(&self, key: &Key, tx: &Transaction) -> Result<Vec<Chunk>> {
        let _guard = self.structure.read();
        let mut found = Vec::new();
        let mut leaf = Some(self.find_leaf(key)?);
        while let Some(current) = leaf {
            found.extend(current.get_objects_by_key(key, tx));
            leaf = self.continuation(&current, key)?;
        }
        Ok(found)
    }

    /// Add `key -> target` owned by `tx`.
    pub fn insert(
        &self,
        key: Key,
        target: RowAddress,
        tx: &Transaction,
        token: &CommitToken,
    ) -> Result<RowAddress> {
        let _guard = self.structure.write();
        if self.unique && self.key_taken(&key, tx)? {
            return Err(FrameError::DuplicateKey {
                key: key.to_string(),
            });
        }
        let leaf = self.find_leaf(&key)?;
        match leaf.add(key, Some(target), Some(tx), token, self.allocator.as_ref())? {
            AddOutcome::Added(address) => Ok(address),
            AddOutcome::Split(split) => {
                let address = split.entry.ok_or_else(|| {
                    FrameError::Internal("leaf split lost the new entry".to_string())
                })?;
                self.link_split(leaf, split, token)?;
                Ok(address)
            }
        }
    }

    /// Hook split siblings into their parents, splitting upward as needed.
    fn link_split(
        &self,
        mut page: IndexFrame,
        mut split: SplitResult,
        token: &CommitToken,
    ) -> Result<()> {
        loop {
            let sibling = split.sibling.clone();
            self.frames.insert(sibling.id(), sibling.clone());
            for child in &split.moved_children {
                self.frame(*child)?.set_parent(Some(sibling.id()), token);
            }

            let Some(parent_id) = page.parent() else {
                return self.grow_root(&page, &sibling, split.separator, token);
            };
            let parent = self.frame(parent_id)?;
            // Equal separators keep their children in leaf order.
            let child = match parent.separator_for(page.id()) {
                Some(existing) if existing == split.separator => sibling.id(),
                _ => {
                    parent.repoint_child(page.id(), sibling.id(), token)?;
                    page.id()
                }
            };
            let entry = Some(RowAddress::in_frame(child, 0));
            match parent.add(split.separator, entry, None, token, self.allocator.as_ref())? {
                AddOutcome::Added(_) => return Ok(()),
                AddOutcome::Split(next) => {
                    page = parent;
                    split = next;
                }
            }
        }
    }

    fn grow_root(
        &self,
        left: &IndexFrame,
        right: &IndexFrame,
        separator: Key,
        token: &CommitToken,
    ) -> Result<()> {
        let root_id = self
            .allocator
            .allocate_frame(FrameKind::IndexNode, self.file_id)?;
        let root = IndexFrame::format(
            root_id,
            self.object_id,
            FrameKind::IndexNode,
            self.frame_size,
            self.policy,
            Arc::clone(&self.codec),
            self.unique,
        );
        let entry = Some(RowAddress::in_frame(left.id(), 0));
        if let AddOutcome::Split(_) = root.add(separator, entry, None, token, self.allocator.as_ref())? {
            return Err(FrameError::Internal("fresh root split".to_string()));
        }
        root.set_left_child(Some(right.id()), token);
        left.set_parent(Some(root_id), token);
        right.set_parent(Some(root_id), token);
        self.frames.insert(root_id, root);
        *self.root.write() = root_id;
        debug!(object_id = self.object_id, root = %root_id, "index grew a new root");
        Ok(())
    }

    fn leaf_holding(&self, key: &Key, target: RowAddress) -> Result<IndexFrame> {
        let mut leaf = Some(self.find_leaf(key)?);
        while let Some(current) = leaf {
            if current.contains_entry(key, Some(target)) {
                return Ok(current);
            }
            leaf = self.continuation(&current, key)?;
        }
        Err(FrameError::NoSuchRow { address: target })
    }

    /// Mark the entry `key -> target` deleted by `tx`.
    pub fn delete(
        &self,
        key: &Key,
        target: RowAddress,
        tx: &Transaction,
        token: &CommitToken,
    ) -> Result<UndoRecord> {
        let _guard = self.structure.read();
        self.leaf_holding(key, target)?
            .delete_entry(key, Some(target), tx, token)
    }

    /// Physically drop the entry `key -> target`.
    pub fn remove(&self, key: &Key, target: RowAddress, token: &CommitToken) -> Result<Chunk> {
        let _guard = self.structure.read();
        self.leaf_holding(key, target)?
            .remove_entry(key, Some(target), token)
    }

    /// Leaves from left to right.
    pub fn leaves(&self) -> Result<Vec<IndexFrame>> {
        let _guard = self.structure.read();
        let mut current = self.frame(self.root())?;
        while !current.is_leaf() {
            let child = current.first_child().ok_or_else(|| FrameError::InvalidFrame {
                frame: current.id(),
                detail: "node has no children".to_string(),
            })?;
            current = self.frame(child)?;
        }
        let mut leaves = vec![current.clone()];
        while let Some(next) = current.next_sibling() {
            current = self.frame(next)?;
            leaves.push(current.clone());
        }
        Ok(leaves)
    }

    /// Every entry visible to `tx`, in key order.
    pub fn scan(&self, tx: &Transaction) -> Result<Vec<Chunk>> {
        Ok(self
            .leaves()?
            .iter()
            .flat_map(|leaf| leaf.frame().compute_visible_rows(tx))
            .collect())
    }

    pub fn rollback(&self, tx: &Transaction, token: &CommitToken) -> Result<usize> {
        let _guard = self.structure.read();
        let mut reverted = 0;
        for frame in self.frames().iter().filter(|f| f.is_leaf()) {
            reverted += frame.frame().rollback_transaction(tx, token)?;
        }
        Ok(reverted)
    }

    /// Number of levels, a lone root leaf counting as one.
    pub fn depth(&self) -> Result<usize> {
        let _guard = self.structure.read();
        let mut depth = 1;
        let mut current = self.frame(self.root())?;
        while let Some(child) = (!current.is_leaf()).then(|| current.first_child()).flatten() {
            current = self.frame(child)?;
            depth += 1;
        }
        Ok(depth)
    }
}
