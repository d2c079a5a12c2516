//! # Array Storage
//!
//! A fixed-payload, offset-addressed record array sharing the masstree's
//! OCC contract: every record carries an 8-byte `XctId` owner word, reads
//! run the optimistic protocol against it, writes append redo logs.
//!
//! The page tree is static: created in full when the storage is created,
//! never split or grown. Interior pages are plain routing tables of child
//! pointers; leaf pages pack `(owner id, payload)` records back to back.
//! Records exist from creation (zero-filled, never deleted), so there is no
//! reserve path and no structural concurrency at all; the only moving parts
//! are the per-record owner words.
//!
//! ```text
//! level 2        [ interior ]
//!                 /    |    \
//! level 1   [interior] ...   (fanout = 504 children)
//!            /   |  \
//! level 0  [leaf] [leaf] ...  (records_per_page records each)
//! ```

use std::cell::UnsafeCell;

use crate::config::{PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::error::{ErrorCode, StorageResult};
use crate::memory::{CoreMemory, PageResolver};
use crate::storage::{align8, PageType, PrimitivePayload, StorageId, VolatilePointer};
use crate::thread::ThreadContext;
use crate::xct::{optimistic_read, AtomicXctId, LogType};

const BODY_BYTES: usize = PAGE_SIZE - PAGE_HEADER_SIZE;
const RECORD_OVERHEAD: usize = 8;

/// Child pointers per interior page (8-byte pointer words).
const INTERIOR_FANOUT: u64 = (BODY_BYTES / 8) as u64;

#[repr(C)]
struct ArrayPage {
    #[allow(dead_code)]
    page_id: u64,
    #[allow(dead_code)]
    storage_id: StorageId,
    page_type: u8,
    #[allow(dead_code)]
    level: u8,
    _pad: u16,
    _reserved: [u8; PAGE_HEADER_SIZE - 16],
    body: UnsafeCell<[u8; BODY_BYTES]>,
}

const _: () = assert!(std::mem::size_of::<ArrayPage>() == PAGE_SIZE);

// Leaf bodies hold per-record atomics; interior bodies are immutable after
// creation. Access follows the OCC record protocol.
unsafe impl Sync for ArrayPage {}

impl ArrayPage {
    /// # Safety
    /// `frame` must be an exclusively owned pool frame.
    unsafe fn initialize<'a>(
        frame: *mut u8,
        storage_id: StorageId,
        page_id: VolatilePointer,
        page_type: PageType,
        level: u8,
    ) -> &'a ArrayPage {
        std::ptr::write_bytes(frame, 0, PAGE_SIZE);
        let page = &mut *(frame as *mut ArrayPage);
        page.page_id = page_id.word;
        page.storage_id = storage_id;
        page.page_type = page_type as u8;
        page.level = level;
        &*(frame as *const ArrayPage)
    }

    /// # Safety
    /// `frame` must point at an initialized array page.
    unsafe fn from_frame<'a>(frame: *mut u8) -> &'a ArrayPage {
        &*(frame as *const ArrayPage)
    }

    fn body_ptr(&self) -> *mut u8 {
        self.body.get() as *mut u8
    }

    fn child(&self, index: u64) -> VolatilePointer {
        debug_assert_eq!(PageType::from_byte(self.page_type), PageType::ArrayInterior);
        debug_assert!(index < INTERIOR_FANOUT);
        // SAFETY: interior bodies are written once at creation and read-only
        // afterwards; the index is within the fanout.
        let word = unsafe { *(self.body_ptr() as *const u64).add(index as usize) };
        VolatilePointer { word }
    }

    fn set_child(&self, index: u64, pointer: VolatilePointer) {
        debug_assert!(index < INTERIOR_FANOUT);
        // SAFETY: only called while the page is still private to the
        // creating thread.
        unsafe {
            *(self.body_ptr() as *mut u64).add(index as usize) = pointer.word;
        }
    }

    fn record(&self, index: u64, record_stride: usize) -> (&AtomicXctId, *mut u8) {
        debug_assert_eq!(PageType::from_byte(self.page_type), PageType::ArrayLeaf);
        let base = index as usize * record_stride;
        debug_assert!(base + record_stride <= BODY_BYTES);
        // SAFETY: in-bounds per the stride check; the owner word is an
        // atomic and the payload follows the OCC protocol.
        unsafe {
            let ptr = self.body_ptr().add(base);
            (
                &*(ptr as *const AtomicXctId),
                ptr.add(RECORD_OVERHEAD),
            )
        }
    }
}

/// A fixed-size array of `array_size` records, each `payload_size` bytes.
#[derive(Debug)]
pub struct ArrayStorage {
    id: StorageId,
    name: String,
    payload_size: u16,
    array_size: u64,
    levels: u8,
    records_per_page: u64,
    root: VolatilePointer,
    resolver: PageResolver,
}

impl ArrayStorage {
    fn record_stride(payload_size: u16) -> usize {
        RECORD_OVERHEAD + align8(payload_size as usize)
    }

    fn calculate_levels(payload_size: u16, array_size: u64) -> (u64, u8) {
        let records_per_page = (BODY_BYTES / Self::record_stride(payload_size)) as u64;
        let mut levels = 1u8;
        let mut pages = array_size.div_ceil(records_per_page);
        while pages != 1 {
            pages = pages.div_ceil(INTERIOR_FANOUT);
            levels += 1;
        }
        (records_per_page, levels)
    }

    /// Records covered by one subtree rooted at `level`.
    fn coverage(&self, level: u8) -> u64 {
        let mut records = self.records_per_page;
        for _ in 0..level {
            records = records.saturating_mul(INTERIOR_FANOUT);
        }
        records
    }

    pub(crate) fn create(
        core: &mut CoreMemory,
        id: StorageId,
        name: &str,
        payload_size: u16,
        array_size: u64,
    ) -> StorageResult<Self> {
        debug_assert!(array_size > 0);
        let (records_per_page, levels) = Self::calculate_levels(payload_size, array_size);
        tracing::info!(
            storage = name,
            id,
            array_size,
            levels,
            "creating array storage"
        );
        let mut storage = Self {
            id,
            name: name.to_string(),
            payload_size,
            array_size,
            levels,
            records_per_page,
            root: VolatilePointer::NULL,
            resolver: core.resolver().clone(),
        };
        storage.root = storage.build_subtree(core, levels - 1, array_size)?;
        Ok(storage)
    }

    fn build_subtree(
        &self,
        core: &mut CoreMemory,
        level: u8,
        records: u64,
    ) -> StorageResult<VolatilePointer> {
        let offset = core.grab_free_page()?;
        let node = core.node();
        let pointer = VolatilePointer::new(node, 0, 0, offset);
        let frame = core.resolver().pool(node).resolve(offset);
        if level == 0 {
            // Zero-filled leaf: every record starts as epoch-0, all-zero
            // payload, logically present.
            // SAFETY: freshly grabbed frame.
            unsafe {
                ArrayPage::initialize(frame, self.id, pointer, PageType::ArrayLeaf, 0);
            }
            return Ok(pointer);
        }
        // SAFETY: freshly grabbed frame.
        let page = unsafe {
            ArrayPage::initialize(frame, self.id, pointer, PageType::ArrayInterior, level)
        };
        let child_coverage = self.coverage(level - 1);
        let children = records.div_ceil(child_coverage);
        debug_assert!(children <= INTERIOR_FANOUT);
        let mut remaining = records;
        for index in 0..children {
            let child = self.build_subtree(core, level - 1, remaining.min(child_coverage))?;
            page.set_child(index, child);
            remaining = remaining.saturating_sub(child_coverage);
        }
        Ok(pointer)
    }

    pub fn id(&self) -> StorageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload_size(&self) -> u16 {
        self.payload_size
    }

    pub fn array_size(&self) -> u64 {
        self.array_size
    }

    pub fn levels(&self) -> u8 {
        self.levels
    }

    fn resolve(&self, pointer: VolatilePointer) -> &ArrayPage {
        // SAFETY: pointers inside this storage's static tree address
        // initialized array pages that live until teardown.
        unsafe { ArrayPage::from_frame(self.resolver.resolve(pointer)) }
    }

    /// Routes an offset down the static tree to its record.
    fn locate_record(&self, offset: u64) -> StorageResult<(&AtomicXctId, *mut u8)> {
        if offset >= self.array_size {
            return Err(ErrorCode::KeyNotFound);
        }
        let mut page = self.resolve(self.root);
        let mut remainder = offset;
        let mut level = self.levels - 1;
        while level > 0 {
            let child_coverage = self.coverage(level - 1);
            let child_index = remainder / child_coverage;
            remainder %= child_coverage;
            page = self.resolve(page.child(child_index));
            level -= 1;
        }
        Ok(page.record(remainder, Self::record_stride(self.payload_size)))
    }

    fn require_xct(&self, context: &ThreadContext) -> StorageResult<()> {
        if context.xct.is_active() {
            Ok(())
        } else {
            Err(ErrorCode::NotInitialized)
        }
    }

    /// Copies the whole payload of `offset` into `buffer`.
    pub fn get_record(
        &self,
        context: &mut ThreadContext,
        offset: u64,
        buffer: &mut [u8],
    ) -> StorageResult<()> {
        if buffer.len() < self.payload_size as usize {
            return Err(ErrorCode::TooSmallPayloadBuffer);
        }
        let len = self.payload_size as usize;
        self.get_record_part(context, offset, &mut buffer[..len], 0)
    }

    pub fn get_record_part(
        &self,
        context: &mut ThreadContext,
        offset: u64,
        buffer: &mut [u8],
        payload_offset: usize,
    ) -> StorageResult<()> {
        self.require_xct(context)?;
        if payload_offset + buffer.len() > self.payload_size as usize {
            return Err(ErrorCode::TooShortPayload);
        }
        let (owner, payload) = self.locate_record(offset)?;
        optimistic_read(&mut context.xct, self.id, owner, |_observed| {
            // SAFETY: in-bounds per the payload_size check; concurrent
            // installers hold the owner keylock and we re-validate the
            // owner id after the copy.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    payload.add(payload_offset),
                    buffer.as_mut_ptr(),
                    buffer.len(),
                );
            }
            Ok(())
        })
    }

    pub fn get_record_primitive<P: PrimitivePayload>(
        &self,
        context: &mut ThreadContext,
        offset: u64,
        payload_offset: usize,
    ) -> StorageResult<P> {
        let mut bytes = [0u8; 16];
        self.get_record_part(context, offset, &mut bytes[..P::SIZE], payload_offset)?;
        Ok(P::read_from(&bytes[..P::SIZE]))
    }

    /// Overwrites part of the record's payload at commit time.
    pub fn overwrite_record(
        &self,
        context: &mut ThreadContext,
        offset: u64,
        payload: &[u8],
        payload_offset: usize,
    ) -> StorageResult<()> {
        self.require_xct(context)?;
        if payload_offset + payload.len() > self.payload_size as usize {
            return Err(ErrorCode::TooShortPayload);
        }
        let (owner, record) = self.locate_record(offset)?;
        optimistic_read(&mut context.xct, self.id, owner, |_observed| Ok(()))?;
        let (log_ptr, log_len) = context.log.push_entry(
            LogType::ArrayOverwrite,
            self.id,
            &offset.to_be_bytes(),
            payload,
            payload_offset,
            0,
        );
        context
            .xct
            .add_to_write_set(self.id, owner, record, log_ptr, log_len);
        Ok(())
    }

    pub fn overwrite_record_primitive<P: PrimitivePayload>(
        &self,
        context: &mut ThreadContext,
        offset: u64,
        payload: P,
        payload_offset: usize,
    ) -> StorageResult<()> {
        let mut bytes = [0u8; 16];
        payload.write_to(&mut bytes[..P::SIZE]);
        self.overwrite_record(context, offset, &bytes[..P::SIZE], payload_offset)
    }

    /// Adds `*value` to the numeric payload at `payload_offset`; `*value`
    /// becomes the new value. The read is idempotent across optimistic
    /// retries.
    pub fn increment_record<P: PrimitivePayload>(
        &self,
        context: &mut ThreadContext,
        offset: u64,
        value: &mut P,
        payload_offset: usize,
    ) -> StorageResult<()> {
        self.require_xct(context)?;
        if payload_offset + P::SIZE > self.payload_size as usize {
            return Err(ErrorCode::TooShortPayload);
        }
        let (owner, record) = self.locate_record(offset)?;
        let mut current = P::default();
        optimistic_read(&mut context.xct, self.id, owner, |_observed| {
            let mut bytes = [0u8; 16];
            // SAFETY: in-bounds per the payload_size check; validated by
            // the owner id re-read.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    record.add(payload_offset),
                    bytes.as_mut_ptr(),
                    P::SIZE,
                );
            }
            current = P::read_from(&bytes[..P::SIZE]);
            Ok(())
        })?;

        *value = value.add(current);
        let mut bytes = [0u8; 16];
        value.write_to(&mut bytes[..P::SIZE]);
        let (log_ptr, log_len) = context.log.push_entry(
            LogType::ArrayOverwrite,
            self.id,
            &offset.to_be_bytes(),
            &bytes[..P::SIZE],
            payload_offset,
            0,
        );
        context
            .xct
            .add_to_write_set(self.id, owner, record, log_ptr, log_len);
        Ok(())
    }

    /// Returns every page to the pool. Callers guarantee quiescence.
    pub(crate) fn release_pages(&self) {
        if !self.root.is_null() {
            self.release_recursive(self.root, self.levels - 1, self.array_size);
        }
    }

    fn release_recursive(&self, pointer: VolatilePointer, level: u8, records: u64) {
        if level > 0 {
            let page = self.resolve(pointer);
            let child_coverage = self.coverage(level - 1);
            let children = records.div_ceil(child_coverage);
            let mut remaining = records;
            for index in 0..children {
                self.release_recursive(
                    page.child(index),
                    level - 1,
                    remaining.min(child_coverage),
                );
                remaining = remaining.saturating_sub(child_coverage);
            }
        }
        self.resolver
            .pool(pointer.node())
            .release(pointer.offset());
    }
}
