use std::collections::HashMap;

use crate::{
    codec::Key,
    error::{FrameError, Result},
    row::{Chunk, RowPointer},
};

/// In-memory map of the chunks held by one frame.
///
/// Heap frames only use the pointer map. Index frames also keep a key multimap
/// and a pointer list that is sorted by `(key, pointer)` on demand. The index is
/// owned by its frame and is only ever touched under that frame's mutex.
#[derive(Debug, Default)]
pub struct ChunkIndex {
    by_pointer: HashMap<RowPointer, Chunk>,
    by_key: Option<HashMap<Key, Vec<RowPointer>>>,
    ordered: Vec<RowPointer>,
    sorted: bool,
    used: usize,
}

impl ChunkIndex {
    pub fn heap() -> Self {
        Self {
            sorted: true,
            ..Self::default()
        }
    }

    pub fn ordered() -> Self {
        Self {
            by_key: Some(HashMap::new()),
            sorted: true,
            ..Self::default()
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.by_key.is_some()
    }

    pub fn len(&self) -> usize {
        self.by_pointer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pointer.is_empty()
    }

    /// Total bytes of all chunks, headers included.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub fn contains(&self, pointer: RowPointer) -> bool {
        self.by_pointer.contains_key(&pointer)
    }

    pub fn get(&self, pointer: RowPointer) -> Option<&Chunk> {
        self.by_pointer.get(&pointer)
    }

    /// Mutable access for in-place header changes. Callers must not change the
    /// chunk's size or key through this; use [`ChunkIndex::replace`] for that.
    pub fn get_mut(&mut self, pointer: RowPointer) -> Option<&mut Chunk> {
        self.by_pointer.get_mut(&pointer)
    }

    pub fn add(&mut self, chunk: Chunk) -> Result<()> {
        let pointer = chunk.row_pointer();
        if self.by_pointer.contains_key(&pointer) {
            return Err(FrameError::Internal(format!(
                "row pointer {pointer} is already present in the chunk index"
            )));
        }
        if let Some(by_key) = self.by_key.as_mut() {
            let key = chunk.key.clone().ok_or_else(|| {
                FrameError::Internal(format!("index chunk {pointer} carries no key"))
            })?;
            by_key.entry(key).or_default().push(pointer);
            self.ordered.push(pointer);
            self.sorted = false;
        }
        self.used += chunk.size();
        self.by_pointer.insert(pointer, chunk);
        Ok(())
    }

    pub fn remove_by_pointer(&mut self, pointer: RowPointer) -> Result<Chunk> {
        let chunk = self.by_pointer.remove(&pointer).ok_or_else(|| {
            FrameError::Internal(format!(
                "row pointer {pointer} is not present in the chunk index"
            ))
        })?;
        if let Some(by_key) = self.by_key.as_mut() {
            if let Some(key) = chunk.key.as_ref() {
                if let Some(pointers) = by_key.get_mut(key) {
                    pointers.retain(|p| *p != pointer);
                    if pointers.is_empty() {
                        by_key.remove(key);
                    }
                }
            }
            self.ordered.retain(|p| *p != pointer);
        }
        self.used -= chunk.size();
        Ok(chunk)
    }

    /// Swap the chunk stored under `chunk`'s pointer, keeping byte accounting
    /// and key maps consistent. Returns the replaced chunk.
    pub fn replace(&mut self, chunk: Chunk) -> Result<Chunk> {
        let old = self.remove_by_pointer(chunk.row_pointer())?;
        self.add(chunk)?;
        Ok(old)
    }

    /// Sort the ordered list by key, ties broken by row pointer.
    pub fn sort(&mut self) {
        if self.sorted {
            return;
        }
        let by_pointer = &self.by_pointer;
        self.ordered.sort_by(|a, b| {
            let key_a = by_pointer.get(a).and_then(|c| c.key.as_ref());
            let key_b = by_pointer.get(b).and_then(|c| c.key.as_ref());
            key_a.cmp(&key_b).then(a.cmp(b))
        });
        self.sorted = true;
    }

    /// Chunks in key order for index frames, sorting first if needed.
    pub fn iter_ordered(&mut self) -> impl Iterator<Item = &Chunk> + '_ {
        self.sort();
        let by_pointer = &self.by_pointer;
        self.ordered.iter().filter_map(move |p| by_pointer.get(p))
    }

    /// Chunks in row-pointer order. Used for heap frames.
    pub fn iter_by_pointer(&self) -> impl Iterator<Item = &Chunk> + '_ {
        let mut pointers: Vec<&RowPointer> = self.by_pointer.keys().collect();
        pointers.sort();
        pointers
            .into_iter()
            .filter_map(move |p| self.by_pointer.get(p))
    }

    /// All chunks stored under `key`, in insertion order. No sorting required.
    pub fn get_by_key(&self, key: &Key) -> Vec<&Chunk> {
        self.by_key
            .as_ref()
            .and_then(|by_key| by_key.get(key))
            .map(|pointers| {
                pointers
                    .iter()
                    .filter_map(|p| self.by_pointer.get(p))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pointers(&self) -> impl Iterator<Item = RowPointer> + '_ {
        self.by_pointer.keys().copied()
    }
}
