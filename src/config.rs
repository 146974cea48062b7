// Page id within the data file. Ids 0 and 1 are the two meta pages and are
// never handed out by the allocator.
pub type PageId = u64;
// Monotonically increasing transaction id, persisted in the meta page.
pub type TxId = u64;

pub type Key = Vec<u8>;
pub type Value = Vec<u8>;

pub const META_PAGE_0: PageId = 0;
pub const META_PAGE_1: PageId = 1;

// id(8) + flags(2) + count(2) + overflow(4)
pub const PAGE_HEADER_SIZE: usize = 16;

pub const BRANCH_PAGE_FLAG: u16 = 0x01;
pub const LEAF_PAGE_FLAG: u16 = 0x02;
pub const META_PAGE_FLAG: u16 = 0x04;
pub const FREELIST_PAGE_FLAG: u16 = 0x08;

pub const BRANCH_ELEMENT_SIZE: usize = 16;
pub const LEAF_ELEMENT_SIZE: usize = 16;

// Leaf element flag marking the value as a serialized bucket header.
pub const BUCKET_LEAF_FLAG: u32 = 0x01;

pub const MAGIC: u32 = 0xED0C_DAED;
pub const VERSION: u32 = 2;
pub const CHECKSUM_SEED: u64 = 0x0420_ADEF;

pub const MAX_KEY_SIZE: usize = 32768;
pub const MAX_VALUE_SIZE: usize = (1 << 31) - 2;

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_FILL_PERCENT: f64 = 0.5;
pub const MIN_FILL_PERCENT: f64 = 0.1;
pub const MAX_FILL_PERCENT: f64 = 1.0;

// Mmap sizing: double from MIN_MMAP_STEP up to MAX_MMAP_STEP, then grow in
// whole MAX_MMAP_STEP increments.
pub const MIN_MMAP_STEP: usize = 1 << 15; // 32 KiB
pub const MAX_MMAP_STEP: usize = 1 << 30; // 1 GiB
