use crate::bucket::{cursor_delete_op, resolve_ref, BucketData};
use crate::config::{PageId, BUCKET_LEAF_FLAG};
use crate::db::PageSource;
use crate::error::{Error, Result};
use crate::node::{Node, NodeArena, NodeId};
use crate::page::Page;
use crate::tx::Tx;

/// Position of one traversal frame: a page, a materialized node, or the
/// embedded page of an inline bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageNodeId {
    Page(PageId),
    Node(NodeId),
    Inline,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ElemRef {
    pub id: PageNodeId,
    pub index: usize,
}

/// Read view over one bucket: resolves page ids to dirty buffers, mmap pages
/// or cached nodes.
pub(crate) struct BucketView<'a> {
    pub src: PageSource<'a>,
    pub arena: &'a NodeArena,
    pub bucket: &'a BucketData,
}

pub(crate) enum PageOrNode<'b> {
    Page(Page<'b>),
    Node(&'b Node),
}

impl PageOrNode<'_> {
    pub fn is_leaf(&self) -> bool {
        match self {
            PageOrNode::Page(p) => p.is_leaf(),
            PageOrNode::Node(n) => n.is_leaf,
        }
    }

    pub fn count(&self) -> usize {
        match self {
            PageOrNode::Page(p) => p.count(),
            PageOrNode::Node(n) => n.inodes.len(),
        }
    }

    fn key_at(&self, index: usize) -> &[u8] {
        match self {
            PageOrNode::Page(p) => {
                if p.is_leaf() {
                    p.leaf_key(index)
                } else {
                    p.branch_key(index)
                }
            }
            PageOrNode::Node(n) => &n.inodes[index].key,
        }
    }

    pub fn child_pgid(&self, index: usize) -> PageId {
        match self {
            PageOrNode::Page(p) => p.branch_pgid(index),
            PageOrNode::Node(n) => n.inodes[index].pgid,
        }
    }

    pub fn leaf_item(&self, index: usize) -> (Vec<u8>, Vec<u8>, u32) {
        match self {
            PageOrNode::Page(p) => (
                p.leaf_key(index).to_vec(),
                p.leaf_value(index).to_vec(),
                p.leaf_flags(index),
            ),
            PageOrNode::Node(n) => {
                let inode = &n.inodes[index];
                (inode.key.clone(), inode.value.clone(), inode.flags)
            }
        }
    }

    /// Index of the last key <= target; 0 when every key is greater.
    fn search_branch(&self, key: &[u8]) -> usize {
        let mut lo = 0;
        let mut hi = self.count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key_at(mid) <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo.saturating_sub(1)
    }

    /// Insertion point: index of the first key >= target.
    fn search_leaf(&self, key: &[u8]) -> usize {
        let mut lo = 0;
        let mut hi = self.count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key_at(mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

impl<'a> BucketView<'a> {
    /// Root frame of this bucket's tree.
    pub fn root_ref(&self) -> PageNodeId {
        if let Some(id) = self.bucket.root_node {
            return PageNodeId::Node(id);
        }
        if self.bucket.root == 0 {
            return PageNodeId::Inline;
        }
        self.page_or_node(self.bucket.root)
    }

    /// Prefer the materialized node over its backing page.
    pub fn page_or_node(&self, pgid: PageId) -> PageNodeId {
        match self.bucket.nodes.get(&pgid) {
            Some(&id) => PageNodeId::Node(id),
            None => PageNodeId::Page(pgid),
        }
    }

    /// A frame recorded as a page is upgraded to the materialized node once
    /// one exists, so cursors observe in-transaction mutations.
    pub fn with<R>(&self, id: PageNodeId, f: impl FnOnce(PageOrNode<'_>) -> R) -> R {
        match id {
            PageNodeId::Node(nid) => f(PageOrNode::Node(self.arena.get(nid))),
            PageNodeId::Page(pgid) => match self.bucket.nodes.get(&pgid) {
                Some(&nid) => f(PageOrNode::Node(self.arena.get(nid))),
                None => self.src.with(pgid, |p| f(PageOrNode::Page(p))),
            },
            PageNodeId::Inline => match self.bucket.root_node {
                Some(nid) => f(PageOrNode::Node(self.arena.get(nid))),
                None => match &self.bucket.inline_page {
                    Some(buf) => f(PageOrNode::Page(Page::new(buf))),
                    None => unreachable!("inline bucket without an embedded page"),
                },
            },
        }
    }
}

pub(crate) type Item = (Vec<u8>, Vec<u8>, u32);

fn top_count(view: &BucketView<'_>, stack: &[ElemRef]) -> usize {
    let top = stack.last().expect("empty cursor stack");
    view.with(top.id, |pn| pn.count())
}

/// Entry under the current stack position, None when the position is past
/// the end of its leaf.
pub(crate) fn key_value(view: &BucketView<'_>, stack: &[ElemRef]) -> Option<Item> {
    let top = stack.last()?;
    view.with(top.id, |pn| {
        if pn.count() == 0 || top.index >= pn.count() {
            None
        } else {
            debug_assert!(pn.is_leaf(), "cursor stopped on a branch");
            Some(pn.leaf_item(top.index))
        }
    })
}

/// Descend from the top frame's current index to the leftmost leaf below it.
fn descend_first(view: &BucketView<'_>, stack: &mut Vec<ElemRef>) {
    loop {
        let top = stack.last().expect("empty cursor stack");
        let child = view.with(top.id, |pn| {
            if pn.is_leaf() {
                None
            } else {
                Some(pn.child_pgid(top.index))
            }
        });
        match child {
            Some(pgid) => {
                let id = view.page_or_node(pgid);
                stack.push(ElemRef { id, index: 0 });
            }
            None => break,
        }
    }
}

/// Mirror of `descend_first` toward the rightmost leaf.
fn descend_last(view: &BucketView<'_>, stack: &mut Vec<ElemRef>) {
    loop {
        let top = stack.last().expect("empty cursor stack");
        let child = view.with(top.id, |pn| {
            if pn.is_leaf() {
                None
            } else {
                Some(pn.child_pgid(top.index))
            }
        });
        match child {
            Some(pgid) => {
                let id = view.page_or_node(pgid);
                let count = view.with(id, |pn| pn.count());
                stack.push(ElemRef {
                    id,
                    index: count.saturating_sub(1),
                });
            }
            None => break,
        }
    }
}

pub(crate) fn c_first(view: &BucketView<'_>, stack: &mut Vec<ElemRef>) -> Option<Item> {
    stack.clear();
    stack.push(ElemRef {
        id: view.root_ref(),
        index: 0,
    });
    descend_first(view, stack);
    if top_count(view, stack) == 0 {
        return c_next(view, stack);
    }
    key_value(view, stack)
}

pub(crate) fn c_last(view: &BucketView<'_>, stack: &mut Vec<ElemRef>) -> Option<Item> {
    stack.clear();
    let root = view.root_ref();
    let count = view.with(root, |pn| pn.count());
    stack.push(ElemRef {
        id: root,
        index: count.saturating_sub(1),
    });
    descend_last(view, stack);
    key_value(view, stack)
}

pub(crate) fn c_next(view: &BucketView<'_>, stack: &mut Vec<ElemRef>) -> Option<Item> {
    loop {
        // Walk up to the deepest frame that can still advance.
        let mut level: isize = stack.len() as isize - 1;
        while level >= 0 {
            let elem = &mut stack[level as usize];
            let count = view.with(elem.id, |pn| pn.count());
            if elem.index + 1 < count {
                elem.index += 1;
                break;
            }
            level -= 1;
        }
        if level < 0 {
            return None;
        }
        stack.truncate(level as usize + 1);
        descend_first(view, stack);
        // skip leaves drained by deletions
        if top_count(view, stack) == 0 {
            continue;
        }
        return key_value(view, stack);
    }
}

pub(crate) fn c_prev(view: &BucketView<'_>, stack: &mut Vec<ElemRef>) -> Option<Item> {
    loop {
        let Some(top) = stack.last_mut() else {
            return None;
        };
        if top.index > 0 {
            top.index -= 1;
            break;
        }
        stack.pop();
    }
    descend_last(view, stack);
    key_value(view, stack)
}

/// Position at the given key without the past-the-end correction; used by
/// mutation paths that only need the insertion point.
pub(crate) fn c_seek_raw(view: &BucketView<'_>, stack: &mut Vec<ElemRef>, key: &[u8]) -> Option<Item> {
    stack.clear();
    search(view, stack, view.root_ref(), key);
    key_value(view, stack)
}

/// Position at the first entry >= key.
pub(crate) fn c_seek(view: &BucketView<'_>, stack: &mut Vec<ElemRef>, key: &[u8]) -> Option<Item> {
    let item = c_seek_raw(view, stack, key);
    let top = stack.last().expect("seek leaves a frame");
    let count = view.with(top.id, |pn| pn.count());
    if top.index >= count {
        return c_next(view, stack);
    }
    item
}

fn search(view: &BucketView<'_>, stack: &mut Vec<ElemRef>, id: PageNodeId, key: &[u8]) {
    let (is_leaf, index, child) = view.with(id, |pn| {
        if pn.is_leaf() {
            (true, pn.search_leaf(key), 0)
        } else {
            let i = pn.search_branch(key);
            (false, i, pn.child_pgid(i))
        }
    });
    stack.push(ElemRef { id, index });
    if !is_leaf {
        search(view, stack, view.page_or_node(child), key);
    }
}

fn public_item(item: Option<Item>) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
    item.map(|(k, v, flags)| {
        if flags & BUCKET_LEAF_FLAG != 0 {
            (k, None)
        } else {
            (k, Some(v))
        }
    })
}

/// Ordered traversal over one bucket. The cursor borrows the transaction
/// shared, so the tree cannot change under it.
pub struct Cursor<'b, 'db> {
    pub(crate) tx: &'b Tx<'db>,
    pub(crate) path: Vec<Vec<u8>>,
    pub(crate) stack: Vec<ElemRef>,
}

impl<'b, 'db> Cursor<'b, 'db> {
    fn run<R>(
        &mut self,
        f: impl FnOnce(&BucketView<'_>, &mut Vec<ElemRef>) -> R,
    ) -> Result<R> {
        let Cursor { tx, path, stack } = self;
        tx.ensure_open()?;
        let src = tx.page_source();
        let inner = tx.state();
        let res = resolve_ref(&src, &inner.arena, &inner.root, path)?;
        let view = BucketView {
            src,
            arena: &inner.arena,
            bucket: res.data(),
        };
        Ok(f(&view, stack))
    }

    /// Move to the first entry of the bucket.
    pub fn first(&mut self) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        self.run(|view, stack| public_item(c_first(view, stack)))
    }

    /// Move to the last entry of the bucket.
    pub fn last(&mut self) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        self.run(|view, stack| public_item(c_last(view, stack)))
    }

    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        self.run(|view, stack| public_item(c_next(view, stack)))
    }

    pub fn prev(&mut self) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        self.run(|view, stack| public_item(c_prev(view, stack)))
    }

    /// Move to the first entry at or after `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        self.run(|view, stack| public_item(c_seek(view, stack, key)))
    }
}

/// Cursor over a writable transaction; additionally supports deleting the
/// entry under the cursor.
pub struct CursorMut<'b, 'db> {
    pub(crate) tx: &'b mut Tx<'db>,
    pub(crate) path: Vec<Vec<u8>>,
    pub(crate) stack: Vec<ElemRef>,
    pub(crate) skip_next: bool,
}

impl<'b, 'db> CursorMut<'b, 'db> {
    fn run<R>(
        &mut self,
        f: impl FnOnce(&BucketView<'_>, &mut Vec<ElemRef>) -> R,
    ) -> Result<R> {
        let CursorMut { tx, path, stack, .. } = self;
        let tx = &**tx;
        tx.ensure_open()?;
        let src = tx.page_source();
        let inner = tx.state();
        let res = resolve_ref(&src, &inner.arena, &inner.root, path)?;
        let view = BucketView {
            src,
            arena: &inner.arena,
            bucket: res.data(),
        };
        Ok(f(&view, stack))
    }

    pub fn first(&mut self) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        self.skip_next = false;
        self.run(|view, stack| public_item(c_first(view, stack)))
    }

    pub fn last(&mut self) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        self.skip_next = false;
        self.run(|view, stack| public_item(c_last(view, stack)))
    }

    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        if self.skip_next {
            // the previous delete shifted the following entry into the
            // current slot
            self.skip_next = false;
            let current = self.run(|view, stack| key_value(view, stack))?;
            if current.is_some() {
                return Ok(public_item(current));
            }
        }
        self.run(|view, stack| public_item(c_next(view, stack)))
    }

    pub fn prev(&mut self) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        self.skip_next = false;
        self.run(|view, stack| public_item(c_prev(view, stack)))
    }

    pub fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        self.skip_next = false;
        self.run(|view, stack| public_item(c_seek(view, stack, key)))
    }

    /// Delete the entry under the cursor. Fails with `CursorNotPositioned`
    /// when the cursor has no current entry and `IncompatibleValue` when the
    /// entry is a nested bucket.
    pub fn delete(&mut self) -> Result<()> {
        self.tx.ensure_writable()?;
        if self.stack.is_empty() {
            return Err(Error::CursorNotPositioned);
        }
        let item = self.run(|view, stack| key_value(view, stack))?;
        let (key, _, flags) = match item {
            Some(item) => item,
            None => return Err(Error::CursorNotPositioned),
        };
        if flags & BUCKET_LEAF_FLAG != 0 {
            return Err(Error::IncompatibleValue);
        }
        let CursorMut {
            tx,
            path,
            stack,
            skip_next,
        } = self;
        let non_empty = cursor_delete_op(tx, path, stack, &key)?;
        *skip_next = non_empty;
        Ok(())
    }
}
