use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use fs2::FileExt as _;
use log::debug;
use memmap2::{Mmap, MmapOptions};

use crate::bucket::BucketData;
use crate::config::{
    PageId, TxId, DEFAULT_PAGE_SIZE, FREELIST_PAGE_FLAG, LEAF_PAGE_FLAG, MAX_MMAP_STEP,
    PAGE_HEADER_SIZE,
};
use crate::error::{Error, Result};
use crate::freelist::Freelist;
use crate::meta::{Meta, META_SIZE};
use crate::node::NodeArena;
use crate::page::{Page, PageMut};
use crate::tx::{Tx, TxInner, TxStatus};

/// Database open options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Open without write access and without taking the file lock.
    pub read_only: bool,
    /// Skip fsync on commit. Much faster and much less durable; a crash can
    /// lose or corrupt recent transactions.
    pub no_sync: bool,
    /// Pre-size the mapping so large databases avoid early remaps (read
    /// transactions block remapping).
    pub initial_mmap_size: usize,
    /// Run a full consistency check inside every commit.
    pub strict_mode: bool,
    /// Reserved for a blocking file-lock mode; currently unused.
    pub timeout: Duration,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            read_only: false,
            no_sync: false,
            initial_mmap_size: 0,
            strict_mode: false,
            timeout: Duration::ZERO,
        }
    }
}

/// The active read-only mapping of the data file.
pub(crate) struct MmapArea {
    map: Mmap,
    page_size: usize,
}

impl MmapArea {
    fn map_file(file: &File, len: usize, page_size: usize) -> Result<MmapArea> {
        let map = unsafe { MmapOptions::new().len(len).map(file)? };
        Ok(MmapArea { map, page_size })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Bytes from the start of `pgid` to the end of the mapping; page views
    /// bound their own reads via element counts.
    pub fn page(&self, pgid: PageId) -> &[u8] {
        &self.map[pgid as usize * self.page_size..]
    }
}

#[derive(Clone, Copy)]
pub(crate) enum MmapRef<'a> {
    /// A read transaction's own guard; no locking per access.
    Area(&'a MmapArea),
    /// The writable transaction locks transiently; only it can remap, so a
    /// shared acquisition can never block it.
    Lock(&'a RwLock<MmapArea>),
}

/// Resolves a page id to bytes: the transaction's dirty buffer when one
/// exists, otherwise the mapping.
#[derive(Clone, Copy)]
pub(crate) struct PageSource<'a> {
    pub pages: &'a HashMap<PageId, Vec<u8>>,
    pub mmap: MmapRef<'a>,
    pub page_size: usize,
}

impl PageSource<'_> {
    pub fn with<R>(&self, pgid: PageId, f: impl FnOnce(Page<'_>) -> R) -> R {
        if let Some(buf) = self.pages.get(&pgid) {
            return f(Page::new(buf));
        }
        match self.mmap {
            MmapRef::Area(area) => f(Page::new(area.page(pgid))),
            MmapRef::Lock(lock) => {
                let area = lock.read().unwrap();
                f(Page::new(area.page(pgid)))
            }
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct TxStatsTotals {
    pub write_count: u64,
}

/// Point-in-time database counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DbStats {
    /// Read transactions started over the database lifetime.
    pub tx_n: u64,
    /// Write transactions started over the database lifetime.
    pub write_tx_n: u64,
    /// Currently open transactions.
    pub open_tx_n: u64,
    pub free_page_n: usize,
    pub pending_page_n: usize,
    /// Pages written by commits.
    pub page_write_n: u64,
}

/// An embedded key/value database backed by a single memory-mapped file.
/// One writable transaction at a time, any number of concurrent readers.
pub struct Db {
    path: PathBuf,
    pub(crate) file: File,
    pub(crate) options: Options,
    pub(crate) page_size: usize,
    pub(crate) mmap: RwLock<MmapArea>,
    /// Shared while a transaction copies the meta at begin, exclusive while
    /// a commit writes a meta page and while closing.
    pub(crate) meta_rw: RwLock<()>,
    /// Serializes writable transactions.
    writer: Mutex<()>,
    pub(crate) freelist: Mutex<Freelist>,
    /// Meta txids of the open read transactions, for freelist release.
    pub(crate) read_txs: Mutex<Vec<TxId>>,
    /// Recycled single-page buffers, scoped to this database.
    pub(crate) page_pool: Mutex<Vec<Vec<u8>>>,
    pub(crate) tx_stats: RwLock<TxStatsTotals>,
    opened: AtomicBool,
    tx_n: AtomicU64,
    write_tx_n: AtomicU64,
    pub(crate) open_tx_n: AtomicU64,
}

fn default_page_size() -> usize {
    let ps = page_size::get();
    if (512..=65536).contains(&ps) && ps.is_power_of_two() {
        ps
    } else {
        DEFAULT_PAGE_SIZE
    }
}

/// Pick the valid meta copy with the higher txid; with both copies broken
/// the database cannot be opened.
fn load_meta_in(area: &MmapArea) -> Result<Meta> {
    let meta0 = Meta::read_from_page(Page::new(area.page(0)));
    let meta1 = Meta::read_from_page(Page::new(area.page(1)));
    match (meta0, meta1) {
        (Ok(a), Ok(b)) => Ok(if a.txid > b.txid { a } else { b }),
        (Ok(a), Err(_)) => Ok(a),
        (Err(_), Ok(b)) => Ok(b),
        (Err(e), Err(_)) => Err(e),
    }
}

/// Mapping size for at least `min` bytes: doubling steps up to 1 GiB, whole
/// gigabytes beyond that, always a multiple of the page size.
fn mmap_size(min: usize, page_size: usize) -> usize {
    for shift in 15..=30 {
        if min <= 1usize << shift {
            return 1 << shift;
        }
    }
    let mut size = min;
    if size % MAX_MMAP_STEP != 0 {
        size = (size / MAX_MMAP_STEP + 1) * MAX_MMAP_STEP;
    }
    if size % page_size != 0 {
        size = (size / page_size + 1) * page_size;
    }
    size
}

/// Lay out a fresh database: two meta pages, an empty freelist at page 2 and
/// an empty leaf as the root bucket at page 3.
fn init_file(file: &File, page_size: usize) -> Result<()> {
    let mut buf = vec![0u8; page_size * 4];
    for i in 0..2u64 {
        let mut meta = Meta::new(page_size as u32);
        meta.root = 3;
        meta.freelist = 2;
        meta.pgid = 4;
        meta.txid = i;
        meta.write_to_page(&mut buf[i as usize * page_size..(i as usize + 1) * page_size]);
    }
    {
        let slice = &mut buf[2 * page_size..3 * page_size];
        Freelist::new().write(slice);
        let mut page = PageMut::new(slice);
        page.set_id(2);
    }
    {
        let slice = &mut buf[3 * page_size..4 * page_size];
        let mut page = PageMut::new(slice);
        page.set_id(3);
        page.set_flags(LEAF_PAGE_FLAG);
    }
    file.write_all_at(&buf, 0)?;
    file.sync_all()?;
    Ok(())
}

/// Page size of an existing file, taken from whichever meta copy validates.
fn read_page_size(file: &File, file_len: usize) -> Result<usize> {
    if file_len < PAGE_HEADER_SIZE + META_SIZE {
        return Err(Error::InvalidMagic(0));
    }
    let to_read = file_len.min(1 << 17);
    let mut buf = vec![0u8; to_read];
    file.read_exact_at(&mut buf, 0)?;
    match Meta::read_from_page(Page::new(&buf)) {
        Ok(meta) => Ok(meta.page_size as usize),
        Err(err) => {
            // Copy 0 may be mid-write from a crash. Probe copy 1 at every
            // plausible page size; the stored page_size must agree with the
            // offset it was found at.
            let mut offset = 512;
            while offset + PAGE_HEADER_SIZE + META_SIZE <= to_read {
                if let Ok(meta) = Meta::read_from_page(Page::new(&buf[offset..])) {
                    if meta.page_size as usize == offset {
                        return Ok(offset);
                    }
                }
                offset *= 2;
            }
            Err(err)
        }
    }
}

impl Db {
    /// Open or create the database at `path`. Writable opens take an
    /// exclusive advisory lock on the file.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Db> {
        let path = path.as_ref().to_path_buf();
        let file = if options.read_only {
            OpenOptions::new().read(true).open(&path)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?
        };
        if !options.read_only {
            file.try_lock_exclusive()?;
        }

        let mut file_len = file.metadata()?.len() as usize;
        let page_size = if file_len == 0 {
            let ps = default_page_size();
            init_file(&file, ps)?;
            file_len = ps * 4;
            ps
        } else {
            read_page_size(&file, file_len)?
        };

        if options.read_only && file_len < page_size * 2 {
            return Err(Error::InvalidMagic(0));
        }
        let map_len = if options.read_only {
            file_len
        } else {
            let want = mmap_size(file_len.max(options.initial_mmap_size), page_size);
            if want > file_len {
                file.set_len(want as u64)?;
                file.sync_all()?;
            }
            want
        };
        let area = MmapArea::map_file(&file, map_len, page_size)?;

        let meta = load_meta_in(&area)?;
        let freelist_page = Page::new(area.page(meta.freelist));
        if freelist_page.flags() != FREELIST_PAGE_FLAG {
            return Err(Error::InvalidPageFlags(freelist_page.flags(), meta.freelist));
        }
        let mut freelist = Freelist::new();
        freelist.read(freelist_page);

        debug!(
            "opened {:?}: page_size={} txid={} pgid={} free={}",
            path,
            page_size,
            meta.txid,
            meta.pgid,
            freelist.free_count()
        );
        Ok(Db {
            path,
            file,
            options,
            page_size,
            mmap: RwLock::new(area),
            meta_rw: RwLock::new(()),
            writer: Mutex::new(()),
            freelist: Mutex::new(freelist),
            read_txs: Mutex::new(Vec::new()),
            page_pool: Mutex::new(Vec::new()),
            tx_stats: RwLock::new(TxStatsTotals::default()),
            opened: AtomicBool::new(true),
            tx_n: AtomicU64::new(0),
            write_tx_n: AtomicU64::new(0),
            open_tx_n: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    pub(crate) fn load_meta_from(&self, area: &MmapArea) -> Result<Meta> {
        load_meta_in(area)
    }

    /// Grow the file and move the mapping so it covers at least `min_size`
    /// bytes. Blocks until no read transaction holds the mapping. Node
    /// bytes are heap-owned, so nothing in the running transaction can dangle
    /// across the move.
    pub(crate) fn remap(&self, min_size: usize) -> Result<()> {
        let mut area = self.mmap.write().unwrap();
        let new_len = mmap_size(min_size, self.page_size);
        if new_len <= area.len() {
            return Ok(());
        }
        let file_len = self.file.metadata()?.len() as usize;
        if new_len > file_len {
            self.file.set_len(new_len as u64)?;
        }
        debug!(
            "remapping {:?}: {} -> {} bytes",
            self.path,
            area.len(),
            new_len
        );
        *area = MmapArea::map_file(&self.file, new_len, self.page_size)?;
        // both copies are revalidated after the move; at least one must hold
        load_meta_in(&area)?;
        Ok(())
    }

    /// Start a transaction. Writable transactions are serialized by the
    /// writer lock; read transactions pin the mapping shared.
    pub fn begin(&self, writable: bool) -> Result<Tx<'_>> {
        if !self.opened.load(Ordering::SeqCst) {
            return Err(Error::DatabaseNotOpen);
        }
        if writable && self.options.read_only {
            return Err(Error::DatabaseReadOnly);
        }
        if writable {
            self.begin_rw()
        } else {
            self.begin_ro()
        }
    }

    fn begin_ro(&self) -> Result<Tx<'_>> {
        let meta_guard = self.meta_rw.read().unwrap();
        let mmap_guard = self.mmap.read().unwrap();
        let meta = load_meta_in(&mmap_guard)?;
        self.read_txs.lock().unwrap().push(meta.txid);
        drop(meta_guard);
        self.tx_n.fetch_add(1, Ordering::SeqCst);
        self.open_tx_n.fetch_add(1, Ordering::SeqCst);
        Ok(Tx {
            db: self,
            writable: false,
            managed: false,
            status: TxStatus::InProgress,
            inner: TxInner {
                root: BucketData::new(meta.root),
                meta,
                pages: HashMap::new(),
                arena: NodeArena::default(),
                grew: false,
            },
            mmap_guard: Some(mmap_guard),
            writer_guard: None,
            commit_handlers: Vec::new(),
        })
    }

    fn begin_rw(&self) -> Result<Tx<'_>> {
        let writer_guard = self.writer.lock().unwrap();
        let mut meta = {
            let _meta_guard = self.meta_rw.read().unwrap();
            let mmap = self.mmap.read().unwrap();
            load_meta_in(&mmap)?
        };
        meta.txid += 1;

        // reclaim pages freed by transactions no open reader can still see
        {
            let read_txs = self.read_txs.lock().unwrap();
            let min_txid = read_txs.iter().copied().min().unwrap_or(TxId::MAX);
            self.freelist
                .lock()
                .unwrap()
                .release(min_txid.saturating_sub(1));
        }

        self.write_tx_n.fetch_add(1, Ordering::SeqCst);
        self.open_tx_n.fetch_add(1, Ordering::SeqCst);
        Ok(Tx {
            db: self,
            writable: true,
            managed: false,
            status: TxStatus::InProgress,
            inner: TxInner {
                root: BucketData::new(meta.root),
                meta,
                pages: HashMap::new(),
                arena: NodeArena::default(),
                grew: false,
            },
            mmap_guard: None,
            writer_guard: Some(writer_guard),
            commit_handlers: Vec::new(),
        })
    }

    /// Run `f` in a managed read transaction.
    pub fn view<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let mut tx = self.begin(false)?;
        tx.managed = true;
        let result = f(&tx);
        tx.managed = false;
        let _ = tx.rollback_inner();
        result
    }

    /// Run `f` in a managed write transaction; commit on success, roll back
    /// on error. Manual commit/rollback inside `f` fails with
    /// `ManagedTxOperationDisallowed` semantics.
    pub fn update<T>(&self, f: impl FnOnce(&mut Tx<'_>) -> Result<T>) -> Result<T> {
        let mut tx = self.begin(true)?;
        tx.managed = true;
        match f(&mut tx) {
            Ok(value) => {
                tx.managed = false;
                tx.commit_inner()?;
                Ok(value)
            }
            Err(err) => {
                tx.managed = false;
                let _ = tx.rollback_inner();
                Err(err)
            }
        }
    }

    /// Force an fsync of the data file; useful with `no_sync`.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn stats(&self) -> DbStats {
        let freelist = self.freelist.lock().unwrap();
        DbStats {
            tx_n: self.tx_n.load(Ordering::SeqCst),
            write_tx_n: self.write_tx_n.load(Ordering::SeqCst),
            open_tx_n: self.open_tx_n.load(Ordering::SeqCst),
            free_page_n: freelist.free_count(),
            pending_page_n: freelist.pending_count(),
            page_write_n: self.tx_stats.read().unwrap().write_count,
        }
    }

    /// Flush and mark the database closed. Blocks until the writer and all
    /// open transactions are done. Runs from `Drop` too, so a lock poisoned
    /// by a panicking transaction must not abort the close.
    pub fn close(&self) -> Result<()> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let _meta = self.meta_rw.write().unwrap_or_else(|e| e.into_inner());
        let _mmap = self.mmap.read().unwrap_or_else(|e| e.into_inner());
        if self.opened.swap(false, Ordering::SeqCst) {
            if !self.options.read_only {
                self.file.sync_all()?;
                let _ = self.file.unlock();
            }
            debug!("closed {:?}", self.path);
        }
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
