//! Writing dirty frames back to the page store.
//!
//! [`Flusher::flush_once`] runs one cycle: take the exclusive token, write the
//! barrier image of every frame in the cut, sync the touched files and commit
//! the cut. [`FlushTask`] repeats that on a background thread.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::{
    commit::TokenPool,
    error::{FrameError, Result},
    storage::PageStore,
};

/// What one flush cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    pub barrier: i64,
    pub frames: usize,
    pub files: usize,
}

#[derive(Clone)]
pub struct Flusher {
    pool: TokenPool,
    store: Arc<dyn PageStore>,
}

impl std::fmt::Debug for Flusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flusher").field("pool", &self.pool).finish()
    }
}

impl Flusher {
    pub fn new(pool: TokenPool, store: Arc<dyn PageStore>) -> Self {
        Self { pool, store }
    }

    /// Flush every frame dirtied before the barrier. On failure the cut goes
    /// back to the dirty table and the next cycle retries it.
    pub fn flush_once(&self) -> Result<FlushStats> {
        let start = Instant::now();
        let cut = self.pool.acquire_exclusive()?;
        let barrier = cut.barrier();
        let live = cut.exclusive_row_locking();

        let mut files = BTreeSet::new();
        for frame in cut.frames() {
            let id = frame.frame_id();
            let image = frame.serialize_at(barrier, live)?;
            self.store.write_page(id.file_id, id.frame_pointer, &image)?;
            trace!(frame = %id, barrier, "frame written");
            files.insert(id.file_id);
        }
        for file_id in &files {
            self.store.sync(*file_id)?;
        }

        let stats = FlushStats {
            barrier,
            frames: cut.frames().len(),
            files: files.len(),
        };
        cut.commit();
        if stats.frames > 0 {
            debug!(
                barrier,
                frames = stats.frames,
                files = stats.files,
                elapsed_us = start.elapsed().as_micros() as u64,
                "flush cycle finished"
            );
        }
        Ok(stats)
    }
}

struct TaskShared {
    stopped: Mutex<bool>,
    wake: Condvar,
    cycles: AtomicU64,
    failures: AtomicU64,
}

/// Runs [`Flusher::flush_once`] every interval until stopped.
pub struct FlushTask {
    shared: Arc<TaskShared>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for FlushTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushTask")
            .field("cycles", &self.cycles())
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl FlushTask {
    pub fn spawn(flusher: Flusher, interval: Duration) -> Result<Self> {
        let shared = Arc::new(TaskShared {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
            cycles: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        });
        let task_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("framedb-flush".to_string())
            .spawn(move || Self::run(&task_shared, &flusher, interval))?;
        debug!(interval_ms = interval.as_millis() as u64, "flush task started");
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    fn run(shared: &TaskShared, flusher: &Flusher, interval: Duration) {
        let mut stopped = shared.stopped.lock();
        while !*stopped {
            shared.wake.wait_for(&mut stopped, interval);
            if *stopped {
                break;
            }
            MutexGuard::unlocked(&mut stopped, || match flusher.flush_once() {
                Ok(_) => {
                    shared.cycles.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    shared.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "background flush failed");
                }
            });
        }
    }

    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }

    /// Stop the thread and wait for the running cycle, if any, to finish.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        *self.shared.stopped.lock() = true;
        self.shared.wake.notify_all();
        handle
            .join()
            .map_err(|_| FrameError::Internal("flush thread panicked".to_string()))?;
        debug!(cycles = self.cycles(), "flush task stopped");
        Ok(())
    }
}

impl Drop for FlushTask {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "flush task did not shut down cleanly");
        }
    }
}

#[cfg(test)]
mod flush_tests {
    use super::*;
    use crate::{
        btree::IndexTree,
        codec::Key,
        frame::{FrameId, FrameKind, RowLockPolicy},
        heap::{HeapFile, HeapFrame},
        row::RowAddress,
        storage::{FileStore, FrameAllocator, MemoryStore},
        test_utils::{long_codec, long_key, TestDir},
        tx::TransactionRegistry,
    };

    const FRAME_SIZE: usize = 512;

    struct FailingStore;

    impl PageStore for FailingStore {
        fn read_page(&self, _file_id: i32, _offset: i64, size: usize) -> Result<Vec<u8>> {
            Ok(vec![0; size])
        }

        fn write_page(&self, _file_id: i32, _offset: i64, _bytes: &[u8]) -> Result<()> {
            Err(FrameError::Io(std::io::Error::other("disk unplugged")))
        }

        fn sync(&self, _file_id: i32) -> Result<()> {
            Ok(())
        }
    }

    fn heap_frame(store: &MemoryStore) -> HeapFrame {
        let id = store.allocate_frame(FrameKind::Heap, 0).unwrap();
        HeapFrame::format(id, 1, FRAME_SIZE, RowLockPolicy::default())
    }

    #[test]
    fn flush_writes_dirty_frames_and_clears_the_table() {
        let store = Arc::new(MemoryStore::new(FRAME_SIZE));
        let pool = TokenPool::new(false);
        let registry = TransactionRegistry::new();
        let frame = heap_frame(&store);
        let tx = registry.begin();
        let token = pool.acquire().unwrap();
        frame.insert(b"first".to_vec(), &tx, &token).unwrap();
        frame.insert(b"second".to_vec(), &tx, &token).unwrap();
        token.commit();
        registry.commit(&tx);
        assert_eq!(pool.dirty_frames(), 1);

        let flusher = Flusher::new(pool.clone(), Arc::clone(&store) as Arc<dyn PageStore>);
        let stats = flusher.flush_once().unwrap();
        assert_eq!(stats.frames, 1);
        assert_eq!(stats.files, 1);
        assert_eq!(pool.dirty_frames(), 0);
        assert_eq!(pool.barrier(), None);
        assert!(!frame.frame().is_dirty());

        let id = frame.id();
        let bytes = store.read_page(id.file_id, id.frame_pointer, FRAME_SIZE).unwrap();
        let reloaded = HeapFrame::load(&bytes, id, RowLockPolicy::default()).unwrap();
        let payloads: Vec<Vec<u8>> = reloaded
            .rows(&registry.begin())
            .into_iter()
            .map(|c| c.payload)
            .collect();
        assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn failed_write_returns_the_cut_to_the_dirty_table() {
        let store = MemoryStore::new(FRAME_SIZE);
        let pool = TokenPool::new(false);
        let registry = TransactionRegistry::new();
        let frame = heap_frame(&store);
        let tx = registry.begin();
        let token = pool.acquire().unwrap();
        frame.insert(b"row".to_vec(), &tx, &token).unwrap();
        token.commit();

        let flusher = Flusher::new(pool.clone(), Arc::new(FailingStore));
        assert!(matches!(flusher.flush_once(), Err(FrameError::Io(_))));
        assert!(pool.is_dirty(frame.id()));
        assert_eq!(pool.barrier(), None);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn empty_cycle_writes_nothing() {
        let store = Arc::new(MemoryStore::new(FRAME_SIZE));
        let flusher = Flusher::new(TokenPool::new(false), Arc::clone(&store) as Arc<dyn PageStore>);
        assert_eq!(flusher.flush_once().unwrap().frames, 0);
        assert_eq!(store.page_count(), 0);
    }

    #[test]
    fn background_task_flushes_periodically() {
        let store = Arc::new(MemoryStore::new(FRAME_SIZE));
        let pool = TokenPool::new(false);
        let registry = TransactionRegistry::new();
        let frame = heap_frame(&store);
        let task = FlushTask::spawn(
            Flusher::new(pool.clone(), Arc::clone(&store) as Arc<dyn PageStore>),
            Duration::from_millis(5),
        )
        .unwrap();

        let tx = registry.begin();
        let token = pool.acquire().unwrap();
        frame.insert(b"background".to_vec(), &tx, &token).unwrap();
        token.commit();

        let deadline = Instant::now() + Duration::from_secs(5);
        while (frame.frame().is_dirty() || task.cycles() == 0) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!frame.frame().is_dirty());
        assert_eq!(task.failures(), 0);
        task.stop().unwrap();

        let id: FrameId = frame.id();
        let bytes = store.read_page(id.file_id, id.frame_pointer, FRAME_SIZE).unwrap();
        assert!(HeapFrame::load(&bytes, id, RowLockPolicy::default()).is_ok());
    }

    #[test]
    fn concurrent_heap_writers_with_background_flush() {
        let dir = TestDir::new();
        let store = Arc::new(FileStore::open(&dir, FRAME_SIZE).unwrap());
        let pool = TokenPool::new(false);
        let registry = TransactionRegistry::new();
        let heap = Arc::new(
            HeapFile::create(
                1,
                0,
                FRAME_SIZE,
                RowLockPolicy::default(),
                Arc::clone(&store) as Arc<dyn FrameAllocator>,
            )
            .unwrap(),
        );
        let flusher = Flusher::new(pool.clone(), Arc::clone(&store) as Arc<dyn PageStore>);
        let task = FlushTask::spawn(flusher.clone(), Duration::from_millis(1)).unwrap();

        let writers = 4;
        let rows_per_writer = 60u32;
        let mut handles = Vec::new();
        for w in 0..writers {
            let heap = Arc::clone(&heap);
            let pool = pool.clone();
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                let tx = registry.begin();
                for n in 0..rows_per_writer {
                    let token = pool.acquire().unwrap();
                    let payload = format!("w{w}-row{n:03}").into_bytes();
                    let outcome = heap.insert(payload, &tx, &token).unwrap();
                    assert!(outcome.address().is_some());
                    token.commit();
                }
                registry.commit(&tx);
            }));
        }
        handles
            .into_iter()
            .for_each(|handle| handle.join().unwrap());
        task.stop().unwrap();
        flusher.flush_once().unwrap();
        assert_eq!(pool.dirty_frames(), 0);

        let first = heap.frames()[0].id();
        let reopened = HeapFile::open(
            1,
            first,
            FRAME_SIZE,
            RowLockPolicy::default(),
            &*store,
            Arc::clone(&store) as Arc<dyn FrameAllocator>,
        )
        .unwrap();
        assert_eq!(reopened.frames().len(), heap.frames().len());
        let mut payloads: Vec<String> = reopened
            .scan(&registry.begin())
            .into_iter()
            .map(|(_, chunk)| String::from_utf8(chunk.payload).unwrap())
            .collect();
        payloads.sort();
        let mut expected: Vec<String> = (0..writers)
            .flat_map(|w| (0..rows_per_writer).map(move |n| format!("w{w}-row{n:03}")))
            .collect();
        expected.sort();
        assert_eq!(payloads, expected);
    }

    #[test]
    fn concurrent_index_writers_survive_flush_cycles() {
        let store = Arc::new(MemoryStore::new(FRAME_SIZE));
        let pool = TokenPool::new(false);
        let registry = TransactionRegistry::new();
        let tree = Arc::new(
            IndexTree::create(
                7,
                3,
                FRAME_SIZE,
                RowLockPolicy::default(),
                Arc::new(long_codec()),
                false,
                Arc::clone(&store) as Arc<dyn FrameAllocator>,
            )
            .unwrap(),
        );
        let flusher = Flusher::new(pool.clone(), Arc::clone(&store) as Arc<dyn PageStore>);
        let task = FlushTask::spawn(flusher.clone(), Duration::from_millis(1)).unwrap();

        let writers = 3i64;
        let keys_per_writer = 80i64;
        let mut handles = Vec::new();
        for w in 0..writers {
            let tree = Arc::clone(&tree);
            let pool = pool.clone();
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                let tx = registry.begin();
                for n in 0..keys_per_writer {
                    let key = n * writers + w;
                    let token = pool.acquire().unwrap();
                    tree.insert(long_key(key), RowAddress::new(0, 0, key as i32), &tx, &token)
                        .unwrap();
                    token.commit();
                }
                registry.commit(&tx);
            }));
        }
        handles
            .into_iter()
            .for_each(|handle| handle.join().unwrap());
        task.stop().unwrap();
        flusher.flush_once().unwrap();
        assert!(tree.depth().unwrap() > 1);

        let reopened = IndexTree::open(
            7,
            tree.root(),
            FRAME_SIZE,
            RowLockPolicy::default(),
            Arc::new(long_codec()),
            &*store,
            Arc::clone(&store) as Arc<dyn FrameAllocator>,
        )
        .unwrap();
        let reader = registry.begin();
        let keys: Vec<Key> = reopened
            .scan(&reader)
            .unwrap()
            .into_iter()
            .map(|chunk| chunk.key.unwrap_or_default())
            .collect();
        let expected: Vec<Key> = (0..writers * keys_per_writer).map(long_key).collect();
        assert_eq!(keys, expected);
        for key in [0, 101, writers * keys_per_writer - 1] {
            let found = reopened.find(&long_key(key), &reader).unwrap().unwrap();
            assert_eq!(found.header.back_pointer.map(|a| a.row_pointer), Some(key as i32));
        }
    }
}
