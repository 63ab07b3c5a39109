use std::sync::{
    atomic::{AtomicI32, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    btree::IndexTree,
    codec::{Schema, SchemaCodec},
    commit::{CommitToken, TokenPool},
    config::EngineConfig,
    error::Result,
    flush::{FlushStats, FlushTask, Flusher},
    frame::{FrameId, RowLockPolicy},
    heap::HeapFile,
    storage::{FileStore, FrameAllocator, PageStore},
    tx::{Transaction, TransactionRegistry},
};

/// Everything the frame layer shares process-wide: configuration, the token
/// pool with its dirty table, the transaction registry and the page store.
/// Built once at startup and handed to whoever needs it.
pub struct EngineContext {
    config: EngineConfig,
    pool: TokenPool,
    registry: Arc<TransactionRegistry>,
    store: Arc<FileStore>,
    next_object_id: AtomicI32,
    flush_task: Mutex<Option<FlushTask>>,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish()
    }
}

impl EngineContext {
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(FileStore::open(&config.data_dir, config.frame_size)?);
        info!(
            data_dir = %config.data_dir.display(),
            frame_size = config.frame_size,
            exclusive_row_locking = config.exclusive_row_locking,
            "engine context ready"
        );
        Ok(Self {
            pool: TokenPool::new(config.exclusive_row_locking),
            registry: TransactionRegistry::new(),
            store,
            next_object_id: AtomicI32::new(1),
            flush_task: Mutex::new(None),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &TokenPool {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<TransactionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> Arc<FileStore> {
        Arc::clone(&self.store)
    }

    pub fn policy(&self) -> RowLockPolicy {
        RowLockPolicy {
            retries: self.config.row_lock_retries,
            backoff: self.config.row_lock_backoff,
        }
    }

    pub fn begin(&self) -> Transaction {
        self.registry.begin()
    }

    pub fn commit(&self, tx: &Transaction) -> i64 {
        self.registry.commit(tx)
    }

    pub fn acquire_token(&self) -> Result<CommitToken> {
        self.pool.acquire()
    }

    fn allocator(&self) -> Arc<dyn FrameAllocator> {
        Arc::clone(&self.store) as Arc<dyn FrameAllocator>
    }

    fn object_id(&self) -> i32 {
        self.next_object_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn create_heap_file(&self, file_id: i32) -> Result<HeapFile> {
        HeapFile::create(
            self.object_id(),
            file_id,
            self.config.frame_size,
            self.policy(),
            self.allocator(),
        )
    }

    pub fn open_heap_file(&self, object_id: i32, first: FrameId) -> Result<HeapFile> {
        HeapFile::open(
            object_id,
            first,
            self.config.frame_size,
            self.policy(),
            &*self.store,
            self.allocator(),
        )
    }

    pub fn create_index(&self, file_id: i32, key_schema: Schema, unique: bool) -> Result<IndexTree> {
        IndexTree::create(
            self.object_id(),
            file_id,
            self.config.frame_size,
            self.policy(),
            Arc::new(SchemaCodec::new(key_schema)),
            unique,
            self.allocator(),
        )
    }

    pub fn open_index(&self, object_id: i32, root: FrameId, key_schema: Schema) -> Result<IndexTree> {
        IndexTree::open(
            object_id,
            root,
            self.config.frame_size,
            self.policy(),
            Arc::new(SchemaCodec::new(key_schema)),
            &*self.store,
            self.allocator(),
        )
    }

    pub fn flusher(&self) -> Flusher {
        Flusher::new(self.pool.clone(), Arc::clone(&self.store) as Arc<dyn PageStore>)
    }

    /// Run one flush cycle on the calling thread.
    pub fn flush(&self) -> Result<FlushStats> {
        self.flusher().flush_once()
    }

    /// Start the periodic background flush. A running task is kept.
    pub fn start_flush_task(&self) -> Result<()> {
        let mut task = self.flush_task.lock();
        if task.is_none() {
            *task = Some(FlushTask::spawn(self.flusher(), self.config.flush_interval)?);
        }
        Ok(())
    }

    pub fn stop_flush_task(&self) -> Result<()> {
        match self.flush_task.lock().take() {
            Some(task) => task.stop(),
            None => Ok(()),
        }
    }

    /// Stop the background flush and write out whatever is still dirty.
    pub fn shutdown(self) -> Result<FlushStats> {
        self.stop_flush_task()?;
        let stats = self.flush()?;
        debug!(frames = stats.frames, "final flush before shutdown");
        Ok(stats)
    }
}
