//! # Engine Configuration Constants
//!
//! This module centralizes the geometry and protocol constants of the engine,
//! grouping interdependent values together. Constants that depend on each
//! other are co-located so a change to one cannot silently invalidate another.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> PAGE_HEADER_SIZE (64 bytes, fixed)
//!       │
//!       ├─> BORDER_MAX_KEYS + BORDER_CELL_BYTES
//!       │     The border slot table and the cell region must both fit in
//!       │     PAGE_SIZE - PAGE_HEADER_SIZE. Checked by a const assertion
//!       │     against the slot word size.
//!       │
//!       └─> INTERMEDIATE_MINIPAGES * MINIPAGE_POINTERS
//!             The minipage array plus page-level separators must fit in the
//!             same budget. Checked in intermediate.rs against the real
//!             struct sizes.
//!
//! MAX_KEY_LENGTH (248 bytes)
//!       │
//!       └─> Border slots store the per-layer remaining key length in one
//!           byte; NEXT_LAYER_SENTINEL (0xFF) is reserved, so the longest
//!           representable remainder is 254 bytes. 248 keeps the limit on an
//!           8-byte slice boundary.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `BORDER_SLOT_BYTES * BORDER_MAX_KEYS + BORDER_CELL_BYTES` fills the page
//!    body exactly (border.rs asserts the struct size).
//! 2. `MAX_KEY_LENGTH % 8 == 0` and `MAX_KEY_LENGTH < NEXT_LAYER_SENTINEL`.
//! 3. `MIN_PAYLOAD_RESERVATION` is at least the size of a dual page pointer,
//!    so any record slot can be promoted to a next-layer pointer in place.

/// Size of each page frame in bytes (4KB). The fundamental allocation unit
/// of the volatile page pool.
pub const PAGE_SIZE: usize = 4096;

/// Size of the common page header. 64-byte aligned so the body starts on a
/// cache line boundary.
pub const PAGE_HEADER_SIZE: usize = 64;

/// Maximum key length accepted by the masstree storage, in bytes.
pub const MAX_KEY_LENGTH: usize = 248;

/// Sentinel stored as a slot's remaining-key-length when the slot holds a
/// pointer to the next trie layer instead of a record.
pub const NEXT_LAYER_SENTINEL: u8 = 0xFF;

/// Maximum number of slots in a border (leaf) page.
pub const BORDER_MAX_KEYS: usize = 48;

/// Bytes of a single border slot word triple (owner id, slice, packed info).
pub const BORDER_SLOT_BYTES: usize = 24;

/// Bytes available for suffix/payload cells in a border page. The cell
/// region grows from the page tail toward the slot table.
pub const BORDER_CELL_BYTES: usize =
    PAGE_SIZE - PAGE_HEADER_SIZE - 8 - BORDER_SLOT_BYTES * BORDER_MAX_KEYS;

const _: () = assert!(BORDER_CELL_BYTES >= 1024, "cell region too small to be useful");
const _: () = assert!(MAX_KEY_LENGTH % 8 == 0, "key limit must end on a slice boundary");
const _: () = assert!(MAX_KEY_LENGTH < NEXT_LAYER_SENTINEL as usize);

/// Every record cell reserves at least this many payload bytes so the slot
/// can later be promoted to a next-layer pointer in place (the pointer is
/// written over the payload region).
pub const MIN_PAYLOAD_RESERVATION: usize = 16;

/// Number of minipages in an intermediate page (9 page-level separators).
pub const INTERMEDIATE_MINIPAGES: usize = 10;

/// Number of child pointers per minipage (15 mini-level separators).
pub const MINIPAGE_POINTERS: usize = 16;

/// Smallest key slice; the low fence of a layer root.
pub const INFIMUM_SLICE: u64 = 0;

/// Largest key slice. A page whose high fence is the supremum is flagged in
/// its version word rather than compared against this value.
pub const SUPREMUM_SLICE: u64 = u64::MAX;

/// Diagnostic cap on core retry loops. Retrying is unbounded by design; past
/// this count the loop logs a livelock warning and keeps going.
pub const MAX_RETRIES: usize = 1000;

/// Number of free page offsets a thread grabs from its node pool at once.
pub const FREE_PAGE_BATCH: usize = 16;

/// Number of free-list shards per node pool. Keeps allocation off a single
/// mutex when many workers grab pages at once.
pub const POOL_SHARD_COUNT: usize = 16;
