use std::collections::{BTreeMap, HashSet};

use crate::config::{PageId, TxId, FREELIST_PAGE_FLAG, PAGE_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::page::{get_u32, get_u64, put_u32, put_u64, Page, PageMut};

/// Tracks page ids that can be reused. Pages freed by a transaction stay
/// `pending` under that transaction's id until no open reader can still
/// observe them, then move to the reusable `ids` list.
pub(crate) struct Freelist {
    // Reusable page ids, sorted ascending.
    ids: Vec<PageId>,
    // Ids freed per transaction, not yet reusable.
    pending: BTreeMap<TxId, Vec<PageId>>,
    // Membership set over ids and all pending lists.
    cache: HashSet<PageId>,
}

impl Freelist {
    pub fn new() -> Freelist {
        Freelist {
            ids: Vec::new(),
            pending: BTreeMap::new(),
            cache: HashSet::new(),
        }
    }

    pub fn free_count(&self) -> usize {
        self.ids.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(|ids| ids.len()).sum()
    }

    pub fn count(&self) -> usize {
        self.free_count() + self.pending_count()
    }

    /// Serialized size in bytes, page header included.
    pub fn size(&self) -> usize {
        PAGE_HEADER_SIZE + 4 + 8 * self.count()
    }

    pub fn freed(&self, pgid: PageId) -> bool {
        self.cache.contains(&pgid)
    }

    pub fn all_freed(&self) -> &HashSet<PageId> {
        &self.cache
    }

    /// Release the span starting at `pgid` (plus `overflow` trailing pages)
    /// into the pending list of `txid`.
    pub fn free(&mut self, txid: TxId, pgid: PageId, overflow: u32) -> Result<()> {
        debug_assert!(pgid > 1, "cannot free meta page {}", pgid);
        for id in pgid..=pgid + overflow as PageId {
            if !self.cache.insert(id) {
                return Err(Error::DoubleFree(id));
            }
            self.pending.entry(txid).or_default().push(id);
        }
        Ok(())
    }

    /// Move every pending list with txid <= `upto` into the reusable set.
    pub fn release(&mut self, upto: TxId) {
        let keep = self.pending.split_off(&(upto + 1));
        for (_, mut ids) in std::mem::replace(&mut self.pending, keep) {
            self.ids.append(&mut ids);
        }
        self.ids.sort_unstable();
    }

    /// Drop the pending list of an aborted transaction.
    pub fn rollback(&mut self, txid: TxId) {
        if let Some(ids) = self.pending.remove(&txid) {
            for id in ids {
                self.cache.remove(&id);
            }
        }
    }

    /// Return the starting id of the lowest-addressed run of `n` contiguous
    /// reusable pages, removing the run; 0 when no such run exists.
    pub fn allocate(&mut self, n: usize) -> PageId {
        if n == 0 || self.ids.is_empty() {
            return 0;
        }
        let mut initial: PageId = 0;
        let mut previd: PageId = 0;
        for i in 0..self.ids.len() {
            let id = self.ids[i];
            debug_assert!(id > 1, "invalid free page id {}", id);
            if previd == 0 || id - previd != 1 {
                initial = id;
            }
            if (id - initial) as usize + 1 == n {
                self.ids.drain(i + 1 - n..=i);
                for freed in initial..initial + n as PageId {
                    self.cache.remove(&freed);
                }
                return initial;
            }
            previd = id;
        }
        0
    }

    /// Serialize all ids (reusable first, then pending in ascending txid
    /// order) into a freelist page. Pending ids are persisted too: after a
    /// crash no transaction that freed them can be rolled forward, so they
    /// are safe to promote to reusable on the next load.
    pub fn write(&self, buf: &mut [u8]) {
        let count = self.count();
        let mut page = PageMut::new(buf);
        page.set_flags(FREELIST_PAGE_FLAG);
        page.set_count(0);
        put_u32(page.buf, PAGE_HEADER_SIZE, count as u32);
        let mut offs = PAGE_HEADER_SIZE + 4;
        for &id in &self.ids {
            put_u64(page.buf, offs, id);
            offs += 8;
        }
        for ids in self.pending.values() {
            for &id in ids {
                put_u64(page.buf, offs, id);
                offs += 8;
            }
        }
    }

    /// Load the reusable set from a freelist page, keeping current pending
    /// lists. Ids read from disk include what was pending at write time.
    pub fn read(&mut self, page: Page<'_>) {
        let body = page.body();
        let body_count = get_u32(body, 0) as usize;
        self.ids.clear();
        self.ids.reserve(body_count);
        let mut offs = 4;
        for _ in 0..body_count {
            self.ids.push(get_u64(body, offs));
            offs += 8;
        }
        self.ids.sort_unstable();
        self.rebuild_cache();
    }

    /// Crash-recovery variant of `read`: ids that are pending in memory are
    /// excluded, so a rolled-back transaction cannot resurrect pages still
    /// owed to older transactions.
    pub fn reload(&mut self, page: Page<'_>) {
        let pending: HashSet<PageId> = self
            .pending
            .values()
            .flat_map(|ids| ids.iter().copied())
            .collect();
        let body = page.body();
        let body_count = get_u32(body, 0) as usize;
        let mut ids = Vec::with_capacity(body_count);
        let mut offs = 4;
        for _ in 0..body_count {
            let id = get_u64(body, offs);
            offs += 8;
            if !pending.contains(&id) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        self.ids = ids;
        self.rebuild_cache();
    }

    fn rebuild_cache(&mut self) {
        self.cache.clear();
        self.cache.extend(self.ids.iter().copied());
        for ids in self.pending.values() {
            self.cache.extend(ids.iter().copied());
        }
    }
}
