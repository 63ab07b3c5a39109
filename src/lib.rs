//! Page-level storage for an embedded database: heap and B-tree index frames
//! with MVCC row visibility, commit tokens grouping frame mutations, and a
//! background flush that writes a consistent cut of dirty frames.

pub mod btree;
pub mod chunk_index;
pub mod codec;
pub mod commit;
pub mod config;
pub mod engine;
pub mod error;
pub mod flush;
pub mod frame;
pub mod heap;
pub mod index;
pub mod row;
pub mod storage;
pub mod tx;

#[cfg(test)]
mod test_utils;

pub use btree::IndexTree;
pub use chunk_index::ChunkIndex;
pub use codec::{Codec, ColumnType, Key, Schema, SchemaCodec, Value};
pub use commit::{CommitToken, FlushFrame, FlushToken, TokenPool};
pub use config::{EngineConfig, DEFAULT_FRAME_SIZE_BYTES};
pub use engine::EngineContext;
pub use error::{FrameError, Result};
pub use flush::{FlushStats, FlushTask, Flusher};
pub use frame::{
    decode_image, inspect_image, Frame, FrameCore, FrameHeader, FrameId, FrameKind, InsertOutcome,
    RowLockPolicy, UpdateOutcome, FRAME_HEADER_SIZE_BYTES,
};
pub use heap::{HeapFile, HeapFrame};
pub use index::{AddOutcome, IndexFrame, SplitResult};
pub use row::{Chunk, RecordHeader, RowAddress, RowPointer, RowState, UndoRecord};
pub use storage::{FileStore, FrameAllocator, MemoryStore, PageStore};
pub use tx::{CommitLookup, Transaction, TransactionRegistry, TxId, TxState};
