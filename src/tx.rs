use std::collections::{HashMap, HashSet};
use std::os::unix::fs::FileExt;
use std::sync::{MutexGuard, RwLockReadGuard};

use log::trace;

use crate::bucket::{
    create_bucket_op, delete_bucket_op, rebalance_bucket, resolve_ref, spill_bucket, Bucket,
    BucketData, BucketMut, RebalanceCtx,
};
use crate::config::{PageId, TxId, BRANCH_PAGE_FLAG, FREELIST_PAGE_FLAG, LEAF_PAGE_FLAG};
use crate::cursor::Cursor;
use crate::db::{Db, MmapArea, MmapRef, PageSource};
use crate::error::{Error, Result};
use crate::meta::Meta;
use crate::node::NodeArena;
use crate::page::{get_u64, PageMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxStatus {
    InProgress,
    Committed,
    RolledBack,
}

/// Mutable state of one transaction: the meta snapshot plus, for writable
/// transactions, the dirty pages, the node arena and the bucket tree.
pub(crate) struct TxInner {
    pub meta: Meta,
    pub pages: HashMap<PageId, Vec<u8>>,
    pub arena: NodeArena,
    pub root: BucketData,
    pub grew: bool,
}

/// A transaction over the database. Read-only transactions may run
/// concurrently; a writable transaction is exclusive. Dropping an
/// in-progress transaction rolls it back.
pub struct Tx<'db> {
    pub(crate) db: &'db Db,
    pub(crate) writable: bool,
    pub(crate) managed: bool,
    pub(crate) status: TxStatus,
    pub(crate) inner: TxInner,
    /// Held by read transactions for their whole lifetime so a remap cannot
    /// move the mapping under borrowed pages.
    pub(crate) mmap_guard: Option<RwLockReadGuard<'db, MmapArea>>,
    /// Held by the writable transaction for its whole lifetime.
    pub(crate) writer_guard: Option<MutexGuard<'db, ()>>,
    pub(crate) commit_handlers: Vec<Box<dyn FnOnce() + 'db>>,
}

/// Borrowed pieces of a writable transaction used by the spill phase, which
/// needs to mutate the dirty-page map while walking the node arena.
pub(crate) struct SpillState<'a> {
    pub pages: &'a mut HashMap<PageId, Vec<u8>>,
    pub arena: &'a mut NodeArena,
    pub meta: &'a mut Meta,
    pub grew: &'a mut bool,
    pub db: &'a Db,
    pub txid: TxId,
    pub page_size: usize,
}

impl SpillState<'_> {
    pub fn allocate(&mut self, count: usize) -> Result<PageId> {
        tx_allocate(self.db, self.meta, self.pages, self.grew, count)
    }
}

/// Hand out `count` contiguous pages: from the freelist when a run exists,
/// otherwise by extending the high water mark (growing the mapping when the
/// new extent exceeds it). The returned page buffer is registered dirty.
pub(crate) fn tx_allocate(
    db: &Db,
    meta: &mut Meta,
    pages: &mut HashMap<PageId, Vec<u8>>,
    grew: &mut bool,
    count: usize,
) -> Result<PageId> {
    let page_size = db.page_size;
    let mut pgid = db.freelist.lock().unwrap().allocate(count);
    if pgid == 0 {
        pgid = meta.pgid;
        meta.pgid += count as PageId;
        let min_size = meta.pgid as usize * page_size;
        let mapped = db.mmap.read().unwrap().len();
        if min_size > mapped {
            db.remap(min_size)?;
            *grew = true;
        }
    }

    let mut buf = if count == 1 {
        db.page_pool
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; page_size])
    } else {
        vec![0u8; count * page_size]
    };
    {
        let mut page = PageMut::new(&mut buf);
        page.set_id(pgid);
        page.set_flags(0);
        page.set_count(0);
        page.set_overflow(count as u32 - 1);
    }
    pages.insert(pgid, buf);
    Ok(pgid)
}

impl<'db> Tx<'db> {
    pub fn id(&self) -> TxId {
        self.inner.meta.txid
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn page_size(&self) -> usize {
        self.db.page_size
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.status != TxStatus::InProgress {
            return Err(Error::TxClosed);
        }
        Ok(())
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.writable {
            return Err(Error::TxNotWritable);
        }
        Ok(())
    }

    pub(crate) fn state(&self) -> &TxInner {
        &self.inner
    }

    pub(crate) fn page_source(&self) -> PageSource<'_> {
        let mmap = match &self.mmap_guard {
            Some(guard) => MmapRef::Area(&**guard),
            None => MmapRef::Lock(&self.db.mmap),
        };
        PageSource {
            pages: &self.inner.pages,
            mmap,
            page_size: self.db.page_size,
        }
    }

    /// Split the transaction into the disjoint pieces write operations need:
    /// a read-only page source, the node arena and the bucket tree.
    pub(crate) fn split_write(&mut self) -> (PageSource<'_>, &mut NodeArena, &mut BucketData) {
        let mmap = match &self.mmap_guard {
            Some(guard) => MmapRef::Area(&**guard),
            None => MmapRef::Lock(&self.db.mmap),
        };
        (
            PageSource {
                pages: &self.inner.pages,
                mmap,
                page_size: self.db.page_size,
            },
            &mut self.inner.arena,
            &mut self.inner.root,
        )
    }

    //
    // Bucket surface (root level)
    //

    pub(crate) fn open_bucket(&self, path: Vec<Vec<u8>>) -> Result<Bucket<'_, 'db>> {
        self.ensure_open()?;
        {
            let src = self.page_source();
            resolve_ref(&src, &self.inner.arena, &self.inner.root, &path)?;
        }
        Ok(Bucket { tx: self, path })
    }

    /// Open a top-level bucket for reading.
    pub fn bucket(&self, name: &[u8]) -> Result<Bucket<'_, 'db>> {
        self.open_bucket(vec![name.to_vec()])
    }

    /// Open a top-level bucket for writing.
    pub fn bucket_mut(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        self.ensure_writable()?;
        let path = vec![name.to_vec()];
        {
            let (src, arena, root) = self.split_write();
            crate::bucket::resolve_mut(&src, &*arena, root, &path)?;
        }
        Ok(BucketMut { tx: self, path })
    }

    /// Create a top-level bucket; fails with `BucketExists` if present.
    pub fn create_bucket(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        self.ensure_writable()?;
        {
            let (src, arena, root) = self.split_write();
            create_bucket_op(&src, arena, root, &[], name, false)?;
        }
        Ok(BucketMut {
            tx: self,
            path: vec![name.to_vec()],
        })
    }

    pub fn create_bucket_if_not_exists(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        self.ensure_writable()?;
        {
            let (src, arena, root) = self.split_write();
            create_bucket_op(&src, arena, root, &[], name, true)?;
        }
        Ok(BucketMut {
            tx: self,
            path: vec![name.to_vec()],
        })
    }

    /// Delete a top-level bucket and everything below it.
    pub fn delete_bucket(&mut self, name: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let txid = self.inner.meta.txid;
        let db = self.db;
        let (src, arena, root) = self.split_write();
        delete_bucket_op(&src, arena, root, db, txid, &[], name)
    }

    /// Cursor over the top-level bucket names.
    pub fn cursor(&self) -> Cursor<'_, 'db> {
        Cursor {
            tx: self,
            path: Vec::new(),
            stack: Vec::new(),
        }
    }

    /// Visit every top-level entry; bucket headers come with a `None` value.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], Option<&[u8]>) -> Result<()>) -> Result<()> {
        self.ensure_open()?;
        let mut cursor = self.cursor();
        let mut item = cursor.first()?;
        while let Some((key, value)) = item {
            f(&key, value.as_deref())?;
            item = cursor.next()?;
        }
        Ok(())
    }

    /// Visit the name of every top-level bucket.
    pub fn for_each_bucket(&self, mut f: impl FnMut(&[u8]) -> Result<()>) -> Result<()> {
        self.for_each(|name, value| {
            if value.is_none() {
                f(name)?;
            }
            Ok(())
        })
    }

    /// Run `f` after this transaction commits successfully.
    pub fn add_commit_handler(&mut self, f: impl FnOnce() + 'db) {
        self.commit_handlers.push(Box::new(f));
    }

    /// Write the database as seen by this transaction to a fresh file at
    /// `path`. The copy is a complete, consistent database: both meta slots
    /// are filled from this transaction's snapshot.
    pub fn copy_to(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        self.ensure_open()?;
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let page_size = self.db.page_size;
        let src = self.page_source();

        let mut buf = vec![0u8; page_size];
        let mut meta = self.inner.meta;
        meta.write_to_page_as(&mut buf, 0);
        file.write_all_at(&buf, 0)?;
        // the second copy carries a lower txid so the first one wins
        meta.txid = meta.txid.saturating_sub(1);
        meta.write_to_page_as(&mut buf, 1);
        file.write_all_at(&buf, page_size as u64)?;

        let mut pgid: PageId = 2;
        while pgid < self.inner.meta.pgid {
            if let Some(dirty) = self.inner.pages.get(&pgid) {
                file.write_all_at(dirty, pgid * page_size as u64)?;
                pgid += (dirty.len() / page_size) as PageId;
            } else {
                src.with(pgid, |p| buf.copy_from_slice(p.raw(page_size)));
                file.write_all_at(&buf, pgid * page_size as u64)?;
                pgid += 1;
            }
        }
        file.sync_all()?;
        Ok(())
    }

    //
    // Commit / rollback
    //

    /// Commit the transaction: rebalance, spill, rewrite the freelist, write
    /// dirty pages and finally the alternating meta page. Any failure rolls
    /// the transaction back and surfaces as `CommitFailed`.
    pub fn commit(&mut self) -> Result<()> {
        if self.managed {
            return Err(Error::TxManaged);
        }
        self.commit_inner()
    }

    pub(crate) fn commit_inner(&mut self) -> Result<()> {
        self.ensure_writable()?;
        match self.try_commit() {
            Ok(()) => {
                self.close_tx(TxStatus::Committed);
                let handlers: Vec<_> = self.commit_handlers.drain(..).collect();
                for handler in handlers {
                    handler();
                }
                Ok(())
            }
            Err(err) => {
                let _ = self.rollback_inner();
                Err(Error::CommitFailed(Box::new(err)))
            }
        }
    }

    fn try_commit(&mut self) -> Result<()> {
        let txid = self.inner.meta.txid;
        let page_size = self.db.page_size;

        // 1. merge under-filled nodes
        {
            let mmap = match &self.mmap_guard {
                Some(guard) => MmapRef::Area(&**guard),
                None => MmapRef::Lock(&self.db.mmap),
            };
            let TxInner {
                ref pages,
                ref mut arena,
                ref mut root,
                ..
            } = self.inner;
            let mut ctx = RebalanceCtx {
                src: PageSource {
                    pages,
                    mmap,
                    page_size,
                },
                arena,
                db: self.db,
                txid,
                page_size,
            };
            rebalance_bucket(&mut ctx, root)?;
        }

        // 2+3. write modified nodes to fresh pages, then point the meta at
        // the new root
        {
            let TxInner {
                ref mut pages,
                ref mut arena,
                ref mut root,
                ref mut meta,
                ref mut grew,
            } = self.inner;
            let mut state = SpillState {
                pages,
                arena,
                meta,
                grew,
                db: self.db,
                txid,
                page_size,
            };
            spill_bucket(&mut state, root)?;
            state.meta.root = root.root;
        }

        // 4. retire the old freelist page and persist the current freelist
        {
            let TxInner {
                ref mut pages,
                ref mut meta,
                ref mut grew,
                ..
            } = self.inner;
            let old = meta.freelist;
            let overflow = {
                let src = PageSource {
                    pages: &*pages,
                    mmap: MmapRef::Lock(&self.db.mmap),
                    page_size,
                };
                src.with(old, |p| p.overflow())
            };
            self.db.freelist.lock().unwrap().free(txid, old, overflow)?;
            let size = self.db.freelist.lock().unwrap().size();
            let count = (size + page_size - 1) / page_size;
            let new_pgid = tx_allocate(self.db, meta, pages, grew, count)?;
            {
                let freelist = self.db.freelist.lock().unwrap();
                let buf = pages.get_mut(&new_pgid).unwrap();
                freelist.write(buf);
            }
            meta.freelist = new_pgid;
        }

        // 5. dirty pages, ascending, adjacent runs coalesced
        self.write_pages()?;

        // 6. data fsync; metadata only when the file grew
        if !self.db.options.no_sync {
            if self.inner.grew {
                self.db.file.sync_all()?;
            } else {
                self.db.file.sync_data()?;
            }
        }

        // 7. optional full consistency check
        if self.db.options.strict_mode {
            self.check()?;
        }

        // 8. alternate meta page
        self.write_meta()?;

        trace!(
            "committed tx {} ({} dirty pages, root {})",
            txid,
            self.inner.pages.len(),
            self.inner.meta.root
        );
        Ok(())
    }

    fn write_pages(&mut self) -> Result<()> {
        let page_size = self.db.page_size as u64;
        let mut ids: Vec<PageId> = self.inner.pages.keys().copied().collect();
        ids.sort_unstable();

        let span = |buf: &Vec<u8>| (buf.len() / self.db.page_size) as PageId;
        let mut i = 0;
        while i < ids.len() {
            let start = ids[i];
            let mut end = start + span(&self.inner.pages[&ids[i]]);
            let mut j = i + 1;
            while j < ids.len() && ids[j] == end {
                end += span(&self.inner.pages[&ids[j]]);
                j += 1;
            }
            if j == i + 1 {
                let buf = &self.inner.pages[&start];
                self.db.file.write_all_at(buf, start * page_size)?;
            } else {
                let total: usize = ids[i..j]
                    .iter()
                    .map(|id| self.inner.pages[id].len())
                    .sum();
                let mut run = Vec::with_capacity(total);
                for id in &ids[i..j] {
                    run.extend_from_slice(&self.inner.pages[id]);
                }
                self.db.file.write_all_at(&run, start * page_size)?;
            }
            i = j;
        }
        let mut stats = self.db.tx_stats.write().unwrap();
        stats.write_count += ids.len() as u64;
        Ok(())
    }

    fn write_meta(&mut self) -> Result<()> {
        let page_size = self.db.page_size;
        let mut buf = vec![0u8; page_size];
        self.inner.meta.write_to_page(&mut buf);
        let offset = self.inner.meta.page_id() * page_size as u64;
        // exclusive against transactions reading the meta at begin
        let _guard = self.db.meta_rw.write().unwrap();
        self.db.file.write_all_at(&buf, offset)?;
        if !self.db.options.no_sync {
            self.db.file.sync_data()?;
        }
        Ok(())
    }

    /// Roll back the transaction, dropping all in-memory changes and any
    /// pages freed by it.
    pub fn rollback(&mut self) -> Result<()> {
        if self.managed {
            return Err(Error::TxManaged);
        }
        self.rollback_inner()
    }

    pub(crate) fn rollback_inner(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.writable {
            let txid = self.inner.meta.txid;
            let mut freelist = self.db.freelist.lock().unwrap();
            freelist.rollback(txid);
            // restore the committed freelist without resurrecting ids still
            // pending for older transactions
            let mmap = self.db.mmap.read().unwrap();
            if let Ok(committed) = self.db.load_meta_from(&mmap) {
                freelist.reload(crate::page::Page::new(mmap.page(committed.freelist)));
            }
        }
        self.close_tx(TxStatus::RolledBack);
        Ok(())
    }

    fn close_tx(&mut self, status: TxStatus) {
        self.status = status;
        if self.writable {
            let mut pool = self.db.page_pool.lock().unwrap();
            for (_, mut buf) in self.inner.pages.drain() {
                if buf.len() == self.db.page_size {
                    buf.fill(0);
                    pool.push(buf);
                }
            }
        } else {
            let mut txs = self.db.read_txs.lock().unwrap();
            if let Some(pos) = txs.iter().position(|&t| t == self.inner.meta.txid) {
                txs.swap_remove(pos);
            }
        }
        self.db
            .open_tx_n
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        self.mmap_guard = None;
        self.writer_guard = None;
    }

    //
    // Consistency check
    //

    /// Verify that no page is both reachable and freed, that no page is
    /// referenced twice, and that every page below the high water mark is
    /// either reachable or freed.
    pub fn check(&self) -> Result<()> {
        self.ensure_open()?;
        let src = self.page_source();
        let meta = &self.inner.meta;
        let freed: HashSet<PageId> = self.db.freelist.lock().unwrap().all_freed().clone();
        let mut errors = Vec::new();
        let mut reachable: HashSet<PageId> = HashSet::new();
        reachable.insert(0);
        reachable.insert(1);

        let fl_overflow = src.with(meta.freelist, |p| {
            if p.flags() != FREELIST_PAGE_FLAG {
                errors.push(Error::InvalidPageFlags(p.flags(), meta.freelist).to_string());
            }
            p.overflow()
        });
        for id in meta.freelist..=meta.freelist + fl_overflow as PageId {
            if !reachable.insert(id) {
                errors.push(Error::CircularReference(id).to_string());
            }
        }

        self.check_tree(&src, meta.root, &freed, &mut reachable, &mut errors);

        for id in 2..meta.pgid {
            if !reachable.contains(&id) && !freed.contains(&id) {
                errors.push(format!("page {}: unreachable and unfreed", id));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::CheckFailed(errors))
        }
    }

    fn check_tree(
        &self,
        src: &PageSource<'_>,
        pgid: PageId,
        freed: &HashSet<PageId>,
        reachable: &mut HashSet<PageId>,
        errors: &mut Vec<String>,
    ) {
        // inline buckets own no pages
        if pgid == 0 {
            return;
        }
        if pgid >= self.inner.meta.pgid {
            errors.push(Error::PageIdAboveHighWaterMark(pgid, self.inner.meta.pgid).to_string());
            return;
        }
        enum Kind {
            Branch(Vec<PageId>),
            Leaf(Vec<PageId>),
            Bad(u16),
        }
        let (kind, overflow) = src.with(pgid, |p| {
            let flags = p.flags();
            let kind = if flags == BRANCH_PAGE_FLAG {
                Kind::Branch((0..p.count()).map(|i| p.branch_pgid(i)).collect())
            } else if flags == LEAF_PAGE_FLAG {
                // nested bucket roots hang off leaf values
                let mut roots = Vec::new();
                for i in 0..p.count() {
                    if p.leaf_flags(i) & crate::config::BUCKET_LEAF_FLAG != 0 {
                        roots.push(get_u64(p.leaf_value(i), 0));
                    }
                }
                Kind::Leaf(roots)
            } else {
                Kind::Bad(flags)
            };
            (kind, p.overflow())
        });

        for id in pgid..=pgid + overflow as PageId {
            if freed.contains(&id) {
                errors.push(format!("page {}: reachable but freed", id));
            }
            if !reachable.insert(id) {
                errors.push(Error::CircularReference(id).to_string());
            }
        }
        match kind {
            Kind::Bad(flags) => errors.push(Error::InvalidPageFlags(flags, pgid).to_string()),
            Kind::Branch(children) => {
                for child in children {
                    self.check_tree(src, child, freed, reachable, errors);
                }
            }
            Kind::Leaf(roots) => {
                for root in roots {
                    self.check_tree(src, root, freed, reachable, errors);
                }
            }
        }
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.status == TxStatus::InProgress {
            let _ = self.rollback_inner();
        }
    }
}
