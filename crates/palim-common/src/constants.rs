//! On-disk layout constants.
//!
//! Page geometry is fixed at compile time; runtime-tunable values live in
//! [`crate::config::EngineConfig`].

/// Page size in bytes.
pub const PAGE_SIZE: usize = 8192;

/// Size of the page header in bytes.
pub const PAGE_HEADER_SIZE: usize = 24;

/// Size of one line pointer in bytes.
pub const LINE_POINTER_SIZE: usize = 4;

/// Size of one transaction slot (xid + undo pointer) in bytes.
pub const TRANS_SLOT_SIZE: usize = 16;

/// Number of transaction slots reserved in a page's special area.
///
/// Four covers the common case of a handful of concurrent writers per
/// page; busier pages spill extra slots onto overflow pages.
pub const TRANS_SLOTS_PER_PAGE: usize = 4;

/// Highest slot number representable in a tuple header's slot field.
/// Slots beyond the on-page array (up to this bound) live on overflow
/// pages.
pub const MAX_TRANS_SLOTS: usize = 63;

/// Size of the tuple header in bytes: two info masks and the data offset.
pub const TUPLE_HEADER_SIZE: usize = 5;

/// Tuple starts are aligned to this boundary so headers can be mutated
/// in place with two-byte stores.
pub const TUPLE_ALIGNMENT: usize = 2;

/// Magic number identifying an engine relation metapage.
pub const META_MAGIC: u32 = 0xA05C;

/// Metapage format version.
pub const META_VERSION: u32 = 1;

/// Magic number at the head of every undo-log meta file.
pub const UNDO_META_MAGIC: u32 = 0x504C_4D55;

/// Undo-log meta file format version.
pub const UNDO_META_VERSION: u32 = 1;

/// Default size of one undo segment file in bytes.
pub const UNDO_SEGMENT_SIZE: usize = 1024 * 1024;

/// Default window size for batched rollback reads, in bytes.
pub const ROLLBACK_WINDOW_SIZE: usize = 32 * 1024 * 1024;

/// Default ceiling on undo size applied in the foreground on abort, in
/// bytes. Larger aborts are handed to the background worker.
pub const ROLLBACK_FOREGROUND_LIMIT: usize = 64 * 1024;
