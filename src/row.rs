//! Row addressing and the per-row header that precedes every payload in a frame.
//!
//! ```text
//! heap row header (16 bytes)
//! +-------------+--------+--------+-------------+----------+
//! | ownerTxId 8 | state 2| len 2  | inPagePtr 2 | reserved 2|
//! +-------------+--------+--------+-------------+----------+
//! index row header (32 bytes) = heap row header + back-pointer RowAddress
//! +-----------+----------------+----------------+
//! | fileId 4  | framePointer 8 | rowPointer 4   |
//! +-----------+----------------+----------------+
//! ```

use std::fmt::Display;

use crate::{
    codec::Key,
    error::{FrameError, Result},
    frame::FrameId,
    tx::{TxId, NO_OWNER},
};

pub const HEAP_ROW_HEADER_SIZE_BYTES: usize = 16;
pub const INDEX_ROW_HEADER_SIZE_BYTES: usize = 32;
/// Serialized size of a [`RowAddress`].
pub const ROW_ADDRESS_SIZE_BYTES: usize = 16;
/// File id written into an address slot that holds no address.
pub const NO_FILE: i32 = -1;

/// Row pointer within one frame.
pub type RowPointer = i32;

/// Logical location of one row. Ordered by file, then frame, then row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowAddress {
    pub file_id: i32,
    pub frame_pointer: i64,
    pub row_pointer: RowPointer,
}

impl RowAddress {
    pub fn new(file_id: i32, frame_pointer: i64, row_pointer: RowPointer) -> Self {
        Self {
            file_id,
            frame_pointer,
            row_pointer,
        }
    }

    pub fn in_frame(frame: FrameId, row_pointer: RowPointer) -> Self {
        Self::new(frame.file_id, frame.frame_pointer, row_pointer)
    }

    pub fn frame_id(&self) -> FrameId {
        FrameId::new(self.file_id, self.frame_pointer)
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.file_id.to_be_bytes());
        buf[4..12].copy_from_slice(&self.frame_pointer.to_be_bytes());
        buf[12..16].copy_from_slice(&self.row_pointer.to_be_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Option<Self> {
        let file_id = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if file_id == NO_FILE {
            return None;
        }
        let mut pointer = [0u8; 8];
        pointer.copy_from_slice(&buf[4..12]);
        Some(Self {
            file_id,
            frame_pointer: i64::from_be_bytes(pointer),
            row_pointer: i32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }
}

impl Display for RowAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.file_id, self.frame_pointer, self.row_pointer
        )
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    Normal = 0,
    Locked = 1,
    Deleted = 2,
}

impl TryFrom<u16> for RowState {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(RowState::Normal),
            1 => Ok(RowState::Locked),
            2 => Ok(RowState::Deleted),
            other => Err(other),
        }
    }
}

/// Per-row metadata.
///
/// `commit_epoch` is the id of the last commit token that mutated the row. It
/// lives only in memory; rows read from disk start at 0, which predates every
/// sync barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub owner_tx: TxId,
    pub state: RowState,
    pub length: u16,
    pub in_page_ptr: u16,
    pub reserved: u16,
    pub commit_epoch: i64,
    pub back_pointer: Option<RowAddress>,
}

impl RecordHeader {
    pub fn new(length: u16) -> Self {
        Self {
            owner_tx: NO_OWNER,
            state: RowState::Normal,
            length,
            in_page_ptr: 0,
            reserved: 0,
            commit_epoch: 0,
            back_pointer: None,
        }
    }

    pub fn has_owner(&self) -> bool {
        self.owner_tx != NO_OWNER
    }

    pub fn encoded_size(indexed: bool) -> usize {
        if indexed {
            INDEX_ROW_HEADER_SIZE_BYTES
        } else {
            HEAP_ROW_HEADER_SIZE_BYTES
        }
    }

    /// Write the on-disk header. `buf` must hold [`Self::encoded_size`] bytes.
    pub fn write_to(&self, buf: &mut [u8], indexed: bool) {
        buf[0..8].copy_from_slice(&self.owner_tx.to_be_bytes());
        buf[8..10].copy_from_slice(&(self.state as u16).to_be_bytes());
        buf[10..12].copy_from_slice(&self.length.to_be_bytes());
        buf[12..14].copy_from_slice(&self.in_page_ptr.to_be_bytes());
        buf[14..16].copy_from_slice(&self.reserved.to_be_bytes());
        if indexed {
            let slot = &mut buf[16..INDEX_ROW_HEADER_SIZE_BYTES];
            match self.back_pointer {
                Some(address) => address.write_to(slot),
                None => {
                    slot.fill(0);
                    slot[0..4].copy_from_slice(&NO_FILE.to_be_bytes());
                }
            }
        }
    }

    pub fn read_from(buf: &[u8], indexed: bool, frame: FrameId) -> Result<Self> {
        let size = Self::encoded_size(indexed);
        if buf.len() < size {
            return Err(FrameError::InvalidFrame {
                frame,
                detail: format!("row header needs {size} bytes, {} left", buf.len()),
            });
        }
        let mut owner = [0u8; 8];
        owner.copy_from_slice(&buf[0..8]);
        let raw_state = u16::from_be_bytes([buf[8], buf[9]]);
        let state = RowState::try_from(raw_state).map_err(|bits| FrameError::InvalidFrame {
            frame,
            detail: format!("unknown row state {bits:#06x}"),
        })?;
        Ok(Self {
            owner_tx: i64::from_be_bytes(owner),
            state,
            length: u16::from_be_bytes([buf[10], buf[11]]),
            in_page_ptr: u16::from_be_bytes([buf[12], buf[13]]),
            reserved: u16::from_be_bytes([buf[14], buf[15]]),
            commit_epoch: 0,
            back_pointer: if indexed {
                RowAddress::read_from(&buf[16..INDEX_ROW_HEADER_SIZE_BYTES])
            } else {
                None
            },
        })
    }
}

/// One row inside a frame: header plus payload.
///
/// Index chunks also carry their decoded key. `prior` holds the version this
/// row replaced while the replacing transaction may still be invisible to
/// other readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub header: RecordHeader,
    pub payload: Vec<u8>,
    pub key: Option<Key>,
    pub prior: Option<Box<Chunk>>,
}

impl Chunk {
    pub fn heap(payload: Vec<u8>) -> Self {
        Self {
            header: RecordHeader::new(payload.len() as u16),
            payload,
            key: None,
            prior: None,
        }
    }

    pub fn index(key: Key, payload: Vec<u8>, back_pointer: Option<RowAddress>) -> Self {
        let mut header = RecordHeader::new(payload.len() as u16);
        header.back_pointer = back_pointer;
        Self {
            header,
            payload,
            key: Some(key),
            prior: None,
        }
    }

    pub fn is_indexed(&self) -> bool {
        self.key.is_some()
    }

    pub fn row_pointer(&self) -> RowPointer {
        RowPointer::from(self.header.in_page_ptr)
    }

    /// Bytes this chunk occupies inside a frame.
    pub fn size(&self) -> usize {
        RecordHeader::encoded_size(self.is_indexed()) + self.payload.len()
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        let indexed = self.is_indexed();
        let header_size = RecordHeader::encoded_size(indexed);
        self.header.write_to(&mut buf[..header_size], indexed);
        buf[header_size..header_size + self.payload.len()].copy_from_slice(&self.payload);
    }

    /// Copy without the attached prior version, as written to disk.
    pub fn detached(&self) -> Chunk {
        Chunk {
            header: self.header.clone(),
            payload: self.payload.clone(),
            key: self.key.clone(),
            prior: None,
        }
    }
}

/// Pre-image of a row kept by the writing transaction so it can be rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRecord {
    pub address: RowAddress,
    pub header: RecordHeader,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod row_tests {
    use super::*;

    #[test]
    fn heap_header_layout_is_big_endian_16_bytes() {
        let header = RecordHeader {
            owner_tx: 0x0102,
            state: RowState::Deleted,
            length: 5,
            in_page_ptr: 7,
            reserved: 0,
            commit_epoch: 99,
            back_pointer: None,
        };
        let mut buf = [0u8; HEAP_ROW_HEADER_SIZE_BYTES];
        header.write_to(&mut buf, false);
        assert_eq!(&buf[0..8], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(&buf[8..10], &[0, 2]);
        assert_eq!(&buf[10..12], &[0, 5]);
        assert_eq!(&buf[12..14], &[0, 7]);

        let decoded = RecordHeader::read_from(&buf, false, FrameId::new(0, 0)).unwrap();
        assert_eq!(decoded.owner_tx, 0x0102);
        assert_eq!(decoded.state, RowState::Deleted);
        // the commit epoch is not persisted
        assert_eq!(decoded.commit_epoch, 0);
    }

    #[test]
    fn index_header_carries_back_pointer() {
        let mut header = RecordHeader::new(8);
        header.back_pointer = Some(RowAddress::new(3, 8192, 11));
        let mut buf = [0u8; INDEX_ROW_HEADER_SIZE_BYTES];
        header.write_to(&mut buf, true);
        let decoded = RecordHeader::read_from(&buf, true, FrameId::new(0, 0)).unwrap();
        assert_eq!(decoded.back_pointer, Some(RowAddress::new(3, 8192, 11)));

        header.back_pointer = None;
        header.write_to(&mut buf, true);
        let decoded = RecordHeader::read_from(&buf, true, FrameId::new(0, 0)).unwrap();
        assert_eq!(decoded.back_pointer, None);
    }

    #[test]
    fn unknown_state_bits_are_corruption() {
        let mut buf = [0u8; HEAP_ROW_HEADER_SIZE_BYTES];
        buf[8..10].copy_from_slice(&0x0100u16.to_be_bytes());
        assert!(matches!(
            RecordHeader::read_from(&buf, false, FrameId::new(0, 0)),
            Err(FrameError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn addresses_order_by_file_frame_row() {
        let a = RowAddress::new(1, 10, 5);
        let b = RowAddress::new(1, 11, 0);
        let c = RowAddress::new(2, 0, 0);
        assert!(a < b && b < c);
    }
}
