//! # Per-Thread Redo Log Buffer
//!
//! Every logical write appends a redo log entry to its worker's log buffer
//! and defers the actual record mutation to commit. The buffer is a bump
//! arena: entries are variable-length blobs allocated once, referenced by
//! the transaction's write set, and freed wholesale when the transaction
//! ends.
//!
//! ## Entry Layout
//!
//! ```text
//! +--------------------+-------------------+----------------------+
//! | LogEntryHeader(24B)| key (key_length)  | payload (payload_cnt)|
//! +--------------------+-------------------+----------------------+
//! ```
//!
//! The total entry length is rounded up to 8 bytes. The header is a
//! zerocopy struct so commit-time application parses it straight out of the
//! arena bytes without copying.

use bumpalo::Bump;
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::storage::StorageId;

pub const LOG_HEADER_SIZE: usize = 24;

/// Discriminates how commit applies an entry to its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    MasstreeInsert,
    MasstreeOverwrite,
    MasstreeDelete,
    ArrayOverwrite,
    Unknown,
}

impl LogType {
    fn to_u16(self) -> u16 {
        match self {
            LogType::MasstreeInsert => 1,
            LogType::MasstreeOverwrite => 2,
            LogType::MasstreeDelete => 3,
            LogType::ArrayOverwrite => 4,
            LogType::Unknown => 0,
        }
    }

    fn from_u16(v: u16) -> Self {
        match v {
            1 => LogType::MasstreeInsert,
            2 => LogType::MasstreeOverwrite,
            3 => LogType::MasstreeDelete,
            4 => LogType::ArrayOverwrite,
            _ => LogType::Unknown,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct LogEntryHeader {
    length: U32,
    log_type: U16,
    key_length: U16,
    storage_id: U32,
    payload_offset: U16,
    payload_count: U16,
    layer: u8,
    reserved: [u8; 7],
}

const _: () = assert!(std::mem::size_of::<LogEntryHeader>() == LOG_HEADER_SIZE);

impl LogEntryHeader {
    pub fn log_type(&self) -> LogType {
        LogType::from_u16(self.log_type.get())
    }

    pub fn length(&self) -> usize {
        self.length.get() as usize
    }

    pub fn key_length(&self) -> usize {
        self.key_length.get() as usize
    }

    pub fn storage_id(&self) -> StorageId {
        self.storage_id.get()
    }

    pub fn payload_offset(&self) -> usize {
        self.payload_offset.get() as usize
    }

    pub fn payload_count(&self) -> usize {
        self.payload_count.get() as usize
    }

    pub fn layer(&self) -> u8 {
        self.layer
    }
}

/// A borrowed view of one log entry inside the arena.
pub struct LogEntry<'a> {
    bytes: &'a [u8],
}

impl<'a> LogEntry<'a> {
    /// # Safety
    /// `ptr` must point at a fully populated entry of `len` bytes inside a
    /// live log buffer arena.
    pub unsafe fn from_raw(ptr: *const u8, len: usize) -> Self {
        Self {
            bytes: std::slice::from_raw_parts(ptr, len),
        }
    }

    pub fn header(&self) -> &LogEntryHeader {
        LogEntryHeader::ref_from_bytes(&self.bytes[..LOG_HEADER_SIZE])
            .expect("log entry header is always in-bounds")
    }

    pub fn key(&self) -> &[u8] {
        let len = self.header().key_length();
        &self.bytes[LOG_HEADER_SIZE..LOG_HEADER_SIZE + len]
    }

    pub fn payload(&self) -> &[u8] {
        let header = self.header();
        let start = LOG_HEADER_SIZE + header.key_length();
        &self.bytes[start..start + header.payload_count()]
    }
}

/// Total entry length for a key/payload pair, 8-byte aligned.
pub fn calculate_log_length(key_length: usize, payload_count: usize) -> usize {
    (LOG_HEADER_SIZE + key_length + payload_count + 7) & !7
}

/// The per-worker redo log arena.
pub struct LogBuffer {
    arena: Bump,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self { arena: Bump::new() }
    }

    /// Reserves a zeroed contiguous region for one entry.
    pub fn reserve_new_log(&self, length: usize) -> &mut [u8] {
        debug_assert!(length >= LOG_HEADER_SIZE);
        self.arena.alloc_slice_fill_copy(length, 0u8)
    }

    /// Populates a reserved region as one entry. Returns the raw handle the
    /// write set keeps.
    pub fn push_entry(
        &self,
        log_type: LogType,
        storage_id: StorageId,
        key: &[u8],
        payload: &[u8],
        payload_offset: usize,
        layer: u8,
    ) -> (*const u8, usize) {
        let length = calculate_log_length(key.len(), payload.len());
        let buf = self.reserve_new_log(length);
        let header = LogEntryHeader {
            length: U32::new(length as u32),
            log_type: U16::new(log_type.to_u16()),
            key_length: U16::new(key.len() as u16),
            storage_id: U32::new(storage_id),
            payload_offset: U16::new(payload_offset as u16),
            payload_count: U16::new(payload.len() as u16),
            layer,
            reserved: [0; 7],
        };
        buf[..LOG_HEADER_SIZE].copy_from_slice(header.as_bytes());
        buf[LOG_HEADER_SIZE..LOG_HEADER_SIZE + key.len()].copy_from_slice(key);
        buf[LOG_HEADER_SIZE + key.len()..LOG_HEADER_SIZE + key.len() + payload.len()]
            .copy_from_slice(payload);
        (buf.as_ptr(), length)
    }

    /// Frees all entries. Callers must have dropped every handle first.
    pub fn reset(&mut self) {
        self.arena.reset();
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}
