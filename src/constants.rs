//! Magic numbers and constants for TideDB

use crate::types::Ref;

// ============================================================================
// File header magic
// ============================================================================

/// File mnemonic: "T-DB" (bytes 16..20 of the header)
pub const MNEMONIC: [u8; 4] = [b'T', b'-', b'D', b'B'];

/// Streaming-form footer cookie
pub const FOOTER_MAGIC_COOKIE: u64 = 0x3034_3131_3031_3032;

/// Slot-0 sentinel marking a streaming-form file
pub const STREAMING_SENTINEL: u64 = 0xFFFF_FFFF_FFFF_FFFF;

// ============================================================================
// Current versions
// ============================================================================

/// On-disk file format written by this engine
pub const CURRENT_FILE_FORMAT: u8 = 24;

/// Oldest file format this engine will open
pub const MIN_SUPPORTED_FILE_FORMAT: u8 = 20;

// ============================================================================
// Layout
// ============================================================================

/// Fixed header size (two top-ref slots + info block)
pub const HEADER_SIZE: usize = 24;

/// Streaming footer size (magic cookie + top ref)
pub const FOOTER_SIZE: usize = 16;

/// Node header size (capacity + byte size, both u32 LE)
pub const NODE_HEADER_SIZE: usize = 8;

/// OS page size assumed for section alignment and slab rounding
pub const PAGE_SIZE: usize = 4096;

/// Smallest ref the allocator will ever hand out
pub const MIN_REF: Ref = HEADER_SIZE as Ref;

/// 8-byte alignment required of every ref and allocation size
pub const REF_ALIGNMENT: u64 = 8;

// ============================================================================
// Section layout
// ============================================================================

/// Number of 1-page sections before sizes start doubling
pub const SECTIONS_IN_FIRST_GROUP: usize = 16;

/// Sections per doubling group after the first
pub const SECTIONS_PER_GROUP: usize = 8;

// ============================================================================
// Allocator tuning
// ============================================================================

/// Entries in the ref-translation cache
pub const TRANSLATION_CACHE_SIZE: usize = 256;

/// Fraction of uncommitted bytes used to size a fresh slab (20%)
pub const SLAB_GROWTH_NUMERATOR: u64 = 1;
pub const SLAB_GROWTH_DENOMINATOR: u64 = 5;

// ============================================================================
// Coordinator tuning
// ============================================================================

/// Bounded retries for `Retry` races observed while opening a shared file
pub const OPEN_RETRY_LIMIT: u32 = 10;

/// Backoff between open retries in milliseconds
pub const OPEN_RETRY_BACKOFF_MS: u64 = 5;

// ============================================================================
// Sync changeset framing
// ============================================================================

/// Changeset frame magic: "TSYN" in little-endian u32
pub const CHANGESET_MAGIC: u32 = 0x4e59_5354;

/// Changeset frame version
pub const CHANGESET_VERSION: u16 = 1;

// ============================================================================
// Client reset metadata
// ============================================================================

/// Reserved table tracking in-flight client resets
pub const META_RESET_TABLE: &str = "client_reset_metadata";

/// Schema version of the reset metadata row
pub const META_RESET_VERSION: i64 = 1;

/// File name of the manifest written into the recovery directory
pub const RESET_MANIFEST_FILE: &str = "reset-manifest.json";

// ============================================================================
// Initial keys (0 is reserved/null)
// ============================================================================

pub const INITIAL_TABLE_KEY: u32 = 1;
pub const INITIAL_COLUMN_KEY: u32 = 1;
pub const INITIAL_OBJECT_KEY: u64 = 1;
