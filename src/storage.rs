//! Disk side of the frame layer: reading and writing raw pages, and handing
//! out frame locations.

use std::{
    collections::{BTreeSet, HashMap},
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    error::{FrameError, Result},
    frame::{FrameId, FrameKind},
};

pub trait PageStore: Send + Sync {
    /// Read `size` bytes at `offset`. Bytes past the end of the file read as zero.
    fn read_page(&self, file_id: i32, offset: i64, size: usize) -> Result<Vec<u8>>;

    fn write_page(&self, file_id: i32, offset: i64, bytes: &[u8]) -> Result<()>;

    /// Make every completed write of `file_id` durable.
    fn sync(&self, file_id: i32) -> Result<()>;
}

pub trait FrameAllocator: Send + Sync {
    fn allocate_frame(&self, kind: FrameKind, file_id: i32) -> Result<FrameId>;

    fn free_frame(&self, frame: FrameId) -> Result<()>;
}

fn check_offset(frame_size: usize, offset: i64) -> Result<u64> {
    if offset < 0 || offset as u64 % frame_size as u64 != 0 {
        return Err(FrameError::Internal(format!(
            "frame pointer {offset} is not a multiple of the frame size {frame_size}"
        )));
    }
    Ok(offset as u64)
}

/// Frames kept in `<file_id>.frames` files under one directory. Frame pointers
/// are byte offsets, always multiples of the frame size. Page I/O is
/// positional, so concurrent readers and writers never share a file cursor.
#[derive(Debug)]
pub struct FileStore {
    directory: PathBuf,
    frame_size: usize,
    open_files: Mutex<HashMap<i32, Arc<File>>>,
    free_frames: Mutex<HashMap<i32, BTreeSet<i64>>>,
}

impl FileStore {
    pub fn open<P>(directory: P, frame_size: usize) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;
        debug!(directory = %directory.display(), frame_size, "opened frame store");
        Ok(Self {
            directory,
            frame_size,
            open_files: Mutex::new(HashMap::new()),
            free_frames: Mutex::new(HashMap::new()),
        })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn path_of(&self, file_id: i32) -> PathBuf {
        self.directory.join(format!("{file_id}.frames"))
    }

    /// Length of the file in frames.
    pub fn length(&self, file_id: i32) -> Result<u64> {
        let file = self.get_file(file_id)?;
        Ok(file.metadata()?.len() / self.frame_size as u64)
    }

    fn get_file(&self, file_id: i32) -> Result<Arc<File>> {
        let mut files = self.open_files.lock();
        if let Some(file) = files.get(&file_id) {
            return Ok(Arc::clone(file));
        }
        let file = Arc::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(self.path_of(file_id))?,
        );
        files.insert(file_id, Arc::clone(&file));
        Ok(file)
    }
}

impl PageStore for FileStore {
    fn read_page(&self, file_id: i32, offset: i64, size: usize) -> Result<Vec<u8>> {
        let start = check_offset(self.frame_size, offset)?;
        let file = self.get_file(file_id)?;
        let mut contents = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            match file.read_at(&mut contents[filled..], start + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        trace!(file_id, offset, filled, "read frame");
        Ok(contents)
    }

    fn write_page(&self, file_id: i32, offset: i64, bytes: &[u8]) -> Result<()> {
        let start = check_offset(self.frame_size, offset)?;
        self.get_file(file_id)?.write_all_at(bytes, start)?;
        trace!(file_id, offset, len = bytes.len(), "wrote frame");
        Ok(())
    }

    fn sync(&self, file_id: i32) -> Result<()> {
        self.get_file(file_id)?.sync_data()?;
        Ok(())
    }
}

impl FrameAllocator for FileStore {
    fn allocate_frame(&self, kind: FrameKind, file_id: i32) -> Result<FrameId> {
        let mut free_frames = self.free_frames.lock();
        if let Some(free) = free_frames.get_mut(&file_id) {
            if let Some(pointer) = free.pop_first() {
                debug!(file_id, pointer, ?kind, "reusing freed frame");
                return Ok(FrameId::new(file_id, pointer));
            }
        }
        let pointer = (self.length(file_id)? * self.frame_size as u64) as i64;
        self.write_page(file_id, pointer, &vec![0u8; self.frame_size])?;
        debug!(file_id, pointer, ?kind, "appended frame");
        Ok(FrameId::new(file_id, pointer))
    }

    fn free_frame(&self, frame: FrameId) -> Result<()> {
        check_offset(self.frame_size, frame.frame_pointer)?;
        self.write_page(
            frame.file_id,
            frame.frame_pointer,
            &vec![0u8; self.frame_size],
        )?;
        self.free_frames
            .lock()
            .entry(frame.file_id)
            .or_default()
            .insert(frame.frame_pointer);
        Ok(())
    }
}

/// Page store kept entirely in memory.
#[derive(Debug)]
pub struct MemoryStore {
    frame_size: usize,
    pages: Mutex<HashMap<FrameId, Vec<u8>>>,
    next_pointer: Mutex<HashMap<i32, i64>>,
    free_frames: Mutex<HashMap<i32, BTreeSet<i64>>>,
}

impl MemoryStore {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            pages: Mutex::new(HashMap::new()),
            next_pointer: Mutex::new(HashMap::new()),
            free_frames: Mutex::new(HashMap::new()),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }
}

impl PageStore for MemoryStore {
    fn read_page(&self, file_id: i32, offset: i64, size: usize) -> Result<Vec<u8>> {
        check_offset(self.frame_size, offset)?;
        let mut contents = vec![0u8; size];
        if let Some(page) = self.pages.lock().get(&FrameId::new(file_id, offset)) {
            let len = page.len().min(size);
            contents[..len].copy_from_slice(&page[..len]);
        }
        Ok(contents)
    }

    fn write_page(&self, file_id: i32, offset: i64, bytes: &[u8]) -> Result<()> {
        check_offset(self.frame_size, offset)?;
        self.pages
            .lock()
            .insert(FrameId::new(file_id, offset), bytes.to_vec());
        Ok(())
    }

    fn sync(&self, _file_id: i32) -> Result<()> {
        Ok(())
    }
}

impl FrameAllocator for MemoryStore {
    fn allocate_frame(&self, _kind: FrameKind, file_id: i32) -> Result<FrameId> {
        if let Some(free) = self.free_frames.lock().get_mut(&file_id) {
            if let Some(pointer) = free.pop_first() {
                return Ok(FrameId::new(file_id, pointer));
            }
        }
        let mut next = self.next_pointer.lock();
        let pointer = next.entry(file_id).or_insert(0);
        let frame = FrameId::new(file_id, *pointer);
        *pointer += self.frame_size as i64;
        Ok(frame)
    }

    fn free_frame(&self, frame: FrameId) -> Result<()> {
        check_offset(self.frame_size, frame.frame_pointer)?;
        self.pages.lock().remove(&frame);
        self.free_frames
            .lock()
            .entry(frame.file_id)
            .or_default()
            .insert(frame.frame_pointer);
        Ok(())
    }
}

#[cfg(test)]
mod storage_tests {
    use super::*;
    use crate::test_utils::TestDir;

    const FRAME_SIZE: usize = 400;

    fn setup() -> (TestDir, FileStore) {
        let dir = TestDir::new();
        let store = FileStore::open(&dir, FRAME_SIZE).unwrap();
        (dir, store)
    }

    #[test]
    fn reading_past_end_yields_zeros() {
        let (_dir, store) = setup();
        let page = store.read_page(3, 4 * FRAME_SIZE as i64, FRAME_SIZE).unwrap();
        assert_eq!(page, vec![0u8; FRAME_SIZE]);
    }

    #[test]
    fn written_pages_read_back() {
        let (_dir, store) = setup();
        let bytes: Vec<u8> = (0..FRAME_SIZE).map(|i| i as u8).collect();
        store.write_page(1, FRAME_SIZE as i64, &bytes).unwrap();
        store.sync(1).unwrap();
        assert_eq!(store.read_page(1, FRAME_SIZE as i64, FRAME_SIZE).unwrap(), bytes);
        assert_eq!(store.length(1).unwrap(), 2);
    }

    #[test]
    fn unaligned_offsets_are_rejected() {
        let (_dir, store) = setup();
        assert!(matches!(
            store.read_page(1, 7, FRAME_SIZE),
            Err(FrameError::Internal(_))
        ));
    }

    #[test]
    fn allocation_appends_then_reuses_freed_frames() {
        let (_dir, store) = setup();
        let first = store.allocate_frame(FrameKind::Heap, 0).unwrap();
        let second = store.allocate_frame(FrameKind::Heap, 0).unwrap();
        assert_eq!(first, FrameId::new(0, 0));
        assert_eq!(second, FrameId::new(0, FRAME_SIZE as i64));
        assert_eq!(store.length(0).unwrap(), 2);

        store.free_frame(first).unwrap();
        assert_eq!(store.allocate_frame(FrameKind::IndexLeaf, 0).unwrap(), first);
        assert_eq!(
            store.allocate_frame(FrameKind::Heap, 0).unwrap(),
            FrameId::new(0, 2 * FRAME_SIZE as i64)
        );
    }

    #[test]
    fn memory_store_behaves_like_file_store() {
        let store = MemoryStore::new(FRAME_SIZE);
        let a = store.allocate_frame(FrameKind::Heap, 5).unwrap();
        let b = store.allocate_frame(FrameKind::Heap, 5).unwrap();
        assert_eq!(b.frame_pointer - a.frame_pointer, FRAME_SIZE as i64);
        assert_eq!(store.read_page(5, a.frame_pointer, FRAME_SIZE).unwrap(), vec![0; FRAME_SIZE]);

        store.write_page(5, b.frame_pointer, &[9; FRAME_SIZE]).unwrap();
        assert_eq!(store.read_page(5, b.frame_pointer, FRAME_SIZE).unwrap(), vec![9; FRAME_SIZE]);
        store.free_frame(b).unwrap();
        assert_eq!(store.page_count(), 0);
        assert_eq!(store.allocate_frame(FrameKind::Heap, 5).unwrap(), b);
    }

    #[test]
    fn concurrent_writers_land_pages_at_their_own_offsets() {
        let (_dir, store) = setup();
        let store = Arc::new(store);
        let threads = 8;
        let per_thread = 200;
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..per_thread {
                        let page = (i * threads + t) as i64;
                        let fill = (page % 251) as u8;
                        store
                            .write_page(2, page * FRAME_SIZE as i64, &[fill; FRAME_SIZE])
                            .unwrap();
                        let back = store.read_page(2, page * FRAME_SIZE as i64, FRAME_SIZE).unwrap();
                        assert_eq!(back, vec![fill; FRAME_SIZE]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for page in 0..(threads * per_thread) as i64 {
            let bytes = store.read_page(2, page * FRAME_SIZE as i64, FRAME_SIZE).unwrap();
            assert_eq!(bytes, vec![(page % 251) as u8; FRAME_SIZE], "page {page}");
        }
        assert_eq!(store.length(2).unwrap(), (threads * per_thread) as u64);
    }

    #[test]
    fn allocation_races_with_page_writes() {
        let (_dir, store) = setup();
        let store = Arc::new(store);
        let first = store.allocate_frame(FrameKind::Heap, 0).unwrap();
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    store
                        .write_page(0, first.frame_pointer, &[7; FRAME_SIZE])
                        .unwrap();
                }
            })
        };
        let allocated: Vec<FrameId> = (0..200)
            .map(|_| store.allocate_frame(FrameKind::Heap, 0).unwrap())
            .collect();
        writer.join().unwrap();

        assert_eq!(store.read_page(0, 0, FRAME_SIZE).unwrap(), vec![7; FRAME_SIZE]);
        for frame in allocated {
            let bytes = store.read_page(0, frame.frame_pointer, FRAME_SIZE).unwrap();
            assert!(bytes.iter().all(|b| *b == 0), "frame {frame} was overwritten");
        }
    }
}
