//! # Storage Layer
//!
//! A storage is one named index living inside the engine. Two kinds exist:
//!
//! - [`MasstreeStorage`](masstree::MasstreeStorage) — the primary index, a
//!   trie of B⁺-trees over 8-byte key slices.
//! - [`ArrayStorage`](array::ArrayStorage) — a fixed-payload,
//!   offset-addressed record array.
//!
//! Both share the OCC contract: reads observe a record's `XctId`, writes
//! append redo logs and defer installation to commit.
//!
//! The [`StorageManager`] is the catalog: it assigns storage ids, maps
//! names to handles, and owns teardown. Handles are a tagged
//! [`Storage`] enum; callers pattern-match for the concrete kind.

pub mod array;
pub mod masstree;
mod page;

pub use page::{
    DualPagePointer, PagePoolOffset, PageType, StorageId, VolatilePointer,
    POINTER_FLAG_SWAPPABLE,
};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::error::{ErrorCode, StorageResult};
use crate::thread::ThreadContext;

use self::array::ArrayStorage;
use self::masstree::MasstreeStorage;

/// Rounds up to the next multiple of 8; page internals keep everything
/// 8-byte aligned.
pub(crate) fn align8(value: usize) -> usize {
    (value + 7) & !7
}

/// Fixed-width payload types usable with the typed record operations.
/// Implementations load and store native-endian bytes.
pub trait PrimitivePayload: Copy + Default {
    const SIZE: usize;
    fn read_from(bytes: &[u8]) -> Self;
    fn write_to(self, out: &mut [u8]);
    fn add(self, other: Self) -> Self;
}

macro_rules! impl_primitive_payload_int {
    ($($ty:ty),*) => {$(
        impl PrimitivePayload for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();
            fn read_from(bytes: &[u8]) -> Self {
                <$ty>::from_ne_bytes(bytes[..Self::SIZE].try_into().unwrap())
            }
            fn write_to(self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_ne_bytes());
            }
            fn add(self, other: Self) -> Self {
                self.wrapping_add(other)
            }
        }
    )*};
}

macro_rules! impl_primitive_payload_float {
    ($($ty:ty),*) => {$(
        impl PrimitivePayload for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();
            fn read_from(bytes: &[u8]) -> Self {
                <$ty>::from_ne_bytes(bytes[..Self::SIZE].try_into().unwrap())
            }
            fn write_to(self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_ne_bytes());
            }
            fn add(self, other: Self) -> Self {
                self + other
            }
        }
    )*};
}

impl_primitive_payload_int!(u8, u16, u32, u64, i8, i16, i32, i64);
impl_primitive_payload_float!(f32, f64);

/// Kind tag carried in a storage's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Masstree,
    Array,
}

/// Identity of a storage: id, name, kind.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub id: StorageId,
    pub name: String,
    pub storage_type: StorageType,
}

/// A tagged storage handle, the engine's answer to abstract-base-class
/// downcasts: callers match on the kind they expect.
#[derive(Clone)]
pub enum Storage {
    Masstree(Arc<MasstreeStorage>),
    Array(Arc<ArrayStorage>),
}

impl Storage {
    pub fn id(&self) -> StorageId {
        match self {
            Storage::Masstree(s) => s.id(),
            Storage::Array(s) => s.id(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Storage::Masstree(s) => s.name(),
            Storage::Array(s) => s.name(),
        }
    }

    pub fn metadata(&self) -> Metadata {
        match self {
            Storage::Masstree(s) => Metadata {
                id: s.id(),
                name: s.name().to_string(),
                storage_type: StorageType::Masstree,
            },
            Storage::Array(s) => Metadata {
                id: s.id(),
                name: s.name().to_string(),
                storage_type: StorageType::Array,
            },
        }
    }

    pub fn as_masstree(&self) -> Option<&Arc<MasstreeStorage>> {
        match self {
            Storage::Masstree(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Arc<ArrayStorage>> {
        match self {
            Storage::Array(s) => Some(s),
            _ => None,
        }
    }
}

/// The storage catalog. Creation and drop are cold paths behind one mutex;
/// lookups clone the handle out.
pub struct StorageManager {
    next_id: AtomicU32,
    catalog: Mutex<HashMap<String, Storage>>,
}

impl StorageManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            catalog: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a masstree storage with an empty first-layer root.
    pub fn create_masstree(
        &self,
        context: &mut ThreadContext,
        name: &str,
    ) -> StorageResult<Arc<MasstreeStorage>> {
        let mut catalog = self.catalog.lock();
        if catalog.contains_key(name) {
            tracing::error!(storage = name, "storage already exists");
            return Err(ErrorCode::AlreadyExists);
        }
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let storage = Arc::new(MasstreeStorage::create(&mut context.core, id, name)?);
        catalog.insert(name.to_string(), Storage::Masstree(Arc::clone(&storage)));
        Ok(storage)
    }

    /// Creates an array storage of `array_size` records of `payload_size`
    /// bytes, fully pre-allocated.
    pub fn create_array(
        &self,
        context: &mut ThreadContext,
        name: &str,
        payload_size: u16,
        array_size: u64,
    ) -> StorageResult<Arc<ArrayStorage>> {
        let mut catalog = self.catalog.lock();
        if catalog.contains_key(name) {
            tracing::error!(storage = name, "storage already exists");
            return Err(ErrorCode::AlreadyExists);
        }
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let storage = Arc::new(ArrayStorage::create(
            &mut context.core,
            id,
            name,
            payload_size,
            array_size,
        )?);
        catalog.insert(name.to_string(), Storage::Array(Arc::clone(&storage)));
        Ok(storage)
    }

    pub fn get_storage(&self, name: &str) -> Option<Storage> {
        self.catalog.lock().get(name).cloned()
    }

    /// Removes a storage and returns its pages to the pool. The caller must
    /// ensure no transaction still touches it.
    pub fn drop_storage(&self, id: StorageId) -> StorageResult<()> {
        let mut catalog = self.catalog.lock();
        let name = catalog
            .iter()
            .find(|(_, storage)| storage.id() == id)
            .map(|(name, _)| name.clone())
            .ok_or(ErrorCode::KeyNotFound)?;
        let storage = catalog.remove(&name).expect("name was just found");
        match storage {
            Storage::Masstree(s) => s.release_pages(),
            Storage::Array(s) => s.release_pages(),
        }
        tracing::info!(storage = %name, id, "dropped storage");
        Ok(())
    }

    /// Engine teardown: releases every storage's pages.
    pub(crate) fn drop_all(&self) {
        let mut catalog = self.catalog.lock();
        for (_, storage) in catalog.drain() {
            match storage {
                Storage::Masstree(s) => s.release_pages(),
                Storage::Array(s) => s.release_pages(),
            }
        }
    }
}

impl Default for StorageManager {
    fn default() -> Self {
        Self::new()
    }
}
