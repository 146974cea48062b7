use xxhash_rust::xxh64::xxh64;

use crate::config::{PageId, TxId, CHECKSUM_SEED, MAGIC, META_PAGE_FLAG, PAGE_HEADER_SIZE, VERSION};
use crate::error::{Error, Result};
use crate::page::{get_u32, get_u64, put_u32, put_u64, Page, PageMut};

// Serialized length of the meta body, checksum included.
pub(crate) const META_SIZE: usize = 52;
const CHECKSUM_OFFSET: usize = 44;

/// Root metadata of the database. Two copies live at pages 0 and 1; a commit
/// writes the copy at `txid % 2`, so at least one valid copy survives a crash
/// in the middle of a meta write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    /// Root page of the top-level bucket tree.
    pub root: PageId,
    /// Page holding the serialized freelist.
    pub freelist: PageId,
    /// Exclusive high-water mark; every reachable page id is below it.
    pub pgid: PageId,
    pub txid: TxId,
    pub checksum: u64,
}

impl Meta {
    pub(crate) fn new(page_size: u32) -> Meta {
        Meta {
            magic: MAGIC,
            version: VERSION,
            page_size,
            root: 0,
            freelist: 0,
            pgid: 0,
            txid: 0,
            checksum: 0,
        }
    }

    fn pack_body(&self) -> [u8; META_SIZE] {
        let mut body = [0u8; META_SIZE];
        put_u32(&mut body, 0, self.magic);
        put_u32(&mut body, 4, self.version);
        put_u32(&mut body, 8, self.page_size);
        put_u64(&mut body, 12, self.root);
        put_u64(&mut body, 20, self.freelist);
        put_u64(&mut body, 28, self.pgid);
        put_u64(&mut body, 36, self.txid);
        put_u64(&mut body, CHECKSUM_OFFSET, self.checksum);
        body
    }

    fn unpack_body(body: &[u8]) -> Meta {
        Meta {
            magic: get_u32(body, 0),
            version: get_u32(body, 4),
            page_size: get_u32(body, 8),
            root: get_u64(body, 12),
            freelist: get_u64(body, 20),
            pgid: get_u64(body, 28),
            txid: get_u64(body, 36),
            checksum: get_u64(body, CHECKSUM_OFFSET),
        }
    }

    fn sum64(&self) -> u64 {
        let body = self.pack_body();
        xxh64(&body[..CHECKSUM_OFFSET], CHECKSUM_SEED)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::InvalidMagic(self.magic));
        }
        if self.version != VERSION {
            return Err(Error::InvalidVersion(self.version));
        }
        if self.checksum != self.sum64() {
            return Err(Error::InvalidChecksum);
        }
        Ok(())
    }

    /// Parse a meta page and validate it.
    pub(crate) fn read_from_page(page: Page<'_>) -> Result<Meta> {
        let body = page.body();
        if body.len() < META_SIZE {
            return Err(Error::InvalidChecksum);
        }
        let meta = Meta::unpack_body(&body[..META_SIZE]);
        meta.validate()?;
        Ok(meta)
    }

    /// Serialize into a page buffer, stamping the checksum and the page
    /// header. Meta pages alternate: the target page id is `txid % 2`.
    pub(crate) fn write_to_page(&mut self, buf: &mut [u8]) {
        self.write_to_page_as(buf, self.txid % 2);
    }

    /// Serialize into a page buffer with an explicit page id; used by
    /// snapshot copies, which fill both meta slots from one meta.
    pub(crate) fn write_to_page_as(&mut self, buf: &mut [u8], page_id: PageId) {
        self.checksum = self.sum64();
        let mut page = PageMut::new(buf);
        page.set_id(page_id);
        page.set_flags(META_PAGE_FLAG);
        page.set_count(0);
        page.set_overflow(0);
        let body = self.pack_body();
        page.write_bytes(PAGE_HEADER_SIZE, &body);
    }

    /// Page id this meta copy is written to.
    pub(crate) fn page_id(&self) -> PageId {
        self.txid % 2
    }
}
