use std::path::Path;

use tempfile::TempDir;

use crate::{
    codec::{ColumnType, Key, Schema, SchemaCodec},
    frame::{FrameCore, FrameHeader, FrameId, FrameKind},
    row::Chunk,
};

pub struct TestDir {
    dir: TempDir,
}

impl TestDir {
    pub fn new() -> Self {
        let dir = tempfile::Builder::new()
            .prefix("framedb-test-")
            .tempdir()
            .unwrap();
        Self { dir }
    }
}

impl AsRef<Path> for TestDir {
    fn as_ref(&self) -> &Path {
        self.dir.path()
    }
}

pub fn long_key(value: i64) -> Key {
    Key::from(value)
}

pub fn long_codec() -> SchemaCodec {
    SchemaCodec::new(Schema::new(vec![ColumnType::Long]))
}

/// Index chunk at `pointer` whose payload is the encoded key.
pub fn index_chunk(pointer: u16, key: i64) -> Chunk {
    let payload = key.to_be_bytes().to_vec();
    let mut chunk = Chunk::index(long_key(key), payload, None);
    chunk.header.in_page_ptr = pointer;
    chunk
}

/// Empty heap frame at `0:0`.
pub fn heap_core(frame_size: usize) -> FrameCore {
    FrameCore::new(
        FrameHeader::new(FrameId::new(0, 0), 1, FrameKind::Heap),
        frame_size,
    )
}
