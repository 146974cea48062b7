use std::collections::{BTreeMap, HashMap};

use log::trace;

use crate::config::{
    PageId, TxId, BUCKET_LEAF_FLAG, DEFAULT_FILL_PERCENT, LEAF_ELEMENT_SIZE, LEAF_PAGE_FLAG,
    MAX_FILL_PERCENT, MAX_KEY_SIZE, MAX_VALUE_SIZE, MIN_FILL_PERCENT, PAGE_HEADER_SIZE,
};
use crate::cursor::{
    c_first, c_next, c_seek_raw, BucketView, Cursor, CursorMut, ElemRef, PageNodeId,
};
use crate::db::{Db, PageSource};
use crate::error::{Error, Result};
use crate::node::{Node, NodeArena, NodeId};
use crate::page::{get_u64, put_u64, Page, PageMut};
use crate::tx::{SpillState, Tx};

/// Per-transaction state of one bucket: the committed root, plus everything
/// materialized while the transaction runs.
#[derive(Debug)]
pub(crate) struct BucketData {
    /// Root page of this bucket's tree; 0 for an inline bucket.
    pub root: PageId,
    pub fill_percent: f64,
    /// Copy of the embedded page of an inline bucket.
    pub inline_page: Option<Vec<u8>>,
    pub root_node: Option<NodeId>,
    /// Materialized nodes of this bucket, by the page id they were read from.
    pub nodes: HashMap<PageId, NodeId>,
    /// Child buckets touched by this transaction, in name order.
    pub buckets: BTreeMap<Vec<u8>, BucketData>,
}

impl BucketData {
    pub fn new(root: PageId) -> BucketData {
        BucketData {
            root,
            fill_percent: DEFAULT_FILL_PERCENT,
            inline_page: None,
            root_node: None,
            nodes: HashMap::new(),
            buckets: BTreeMap::new(),
        }
    }

    /// Parse a bucket header value: 8-byte root id, then the embedded page
    /// when the root id is 0.
    pub fn from_value(value: &[u8]) -> BucketData {
        let root = get_u64(value, 0);
        let mut data = BucketData::new(root);
        if root == 0 {
            data.inline_page = Some(value[8..].to_vec());
        }
        data
    }

    /// Header value of a bucket that lives in its own pages.
    pub fn header_value(root: PageId) -> Vec<u8> {
        let mut value = vec![0u8; 8];
        put_u64(&mut value, 0, root);
        value
    }

    /// Value of a freshly created bucket: zero root plus an empty leaf page.
    pub fn empty_inline_value() -> Vec<u8> {
        let mut value = vec![0u8; 8 + PAGE_HEADER_SIZE];
        let mut page = PageMut::new(&mut value[8..]);
        page.set_flags(LEAF_PAGE_FLAG);
        value
    }

    pub fn new_inline() -> BucketData {
        let mut data = BucketData::new(0);
        data.inline_page = Some(BucketData::empty_inline_value()[8..].to_vec());
        data
    }
}

/// Resolution result for read-only access: either the transaction's cached
/// state or a detached copy materialized from the tree.
pub(crate) enum BucketRes<'a> {
    Cached(&'a BucketData),
    Detached(Box<BucketData>),
}

impl BucketRes<'_> {
    pub fn data(&self) -> &BucketData {
        match self {
            BucketRes::Cached(b) => b,
            BucketRes::Detached(b) => b,
        }
    }
}

/// Open the child bucket `name` of `bucket` by seeking its header entry.
fn open_child(
    src: &PageSource<'_>,
    arena: &NodeArena,
    bucket: &BucketData,
    name: &[u8],
) -> Result<BucketData> {
    let mut stack = Vec::new();
    let view = BucketView {
        src: *src,
        arena,
        bucket,
    };
    match c_seek_raw(&view, &mut stack, name) {
        Some((k, v, flags)) if k == name => {
            if flags & BUCKET_LEAF_FLAG == 0 {
                return Err(Error::IncompatibleValue);
            }
            Ok(BucketData::from_value(&v))
        }
        _ => Err(Error::BucketNotFound),
    }
}

/// Walk `path` down from the root bucket without touching the cache.
pub(crate) fn resolve_ref<'a>(
    src: &PageSource<'a>,
    arena: &'a NodeArena,
    root: &'a BucketData,
    path: &[Vec<u8>],
) -> Result<BucketRes<'a>> {
    let mut cur = BucketRes::Cached(root);
    for name in path {
        cur = match cur {
            BucketRes::Cached(b) => match b.buckets.get(name) {
                Some(child) => BucketRes::Cached(child),
                None => BucketRes::Detached(Box::new(open_child(src, arena, b, name)?)),
            },
            BucketRes::Detached(b) => {
                BucketRes::Detached(Box::new(open_child(src, arena, &b, name)?))
            }
        };
    }
    Ok(cur)
}

/// Walk `path` down from the root bucket, materializing child bucket state
/// into the cache along the way.
pub(crate) fn resolve_mut<'a>(
    src: &PageSource<'_>,
    arena: &NodeArena,
    root: &'a mut BucketData,
    path: &[Vec<u8>],
) -> Result<&'a mut BucketData> {
    let mut cur = root;
    for name in path {
        if !cur.buckets.contains_key(name) {
            let child = open_child(src, arena, cur, name)?;
            cur.buckets.insert(name.clone(), child);
        }
        cur = cur.buckets.get_mut(name).unwrap();
    }
    Ok(cur)
}

/// Materialize the node behind `pgid` (0 for the embedded page of an inline
/// bucket), caching it on the bucket and linking it to `parent`.
pub(crate) fn bucket_node(
    arena: &mut NodeArena,
    bucket: &mut BucketData,
    src: &PageSource<'_>,
    pgid: PageId,
    parent: Option<NodeId>,
) -> NodeId {
    if let Some(&id) = bucket.nodes.get(&pgid) {
        return id;
    }
    let mut node = if bucket.root == 0 && pgid == 0 {
        match &bucket.inline_page {
            Some(buf) => {
                let mut n = Node::read(Page::new(buf));
                n.pgid = 0;
                n
            }
            None => unreachable!("inline bucket without an embedded page"),
        }
    } else {
        src.with(pgid, |p| Node::read(p))
    };
    node.parent = parent;
    let id = arena.alloc(node);
    match parent {
        Some(p) => arena.get_mut(p).children.push(id),
        None => bucket.root_node = Some(id),
    }
    bucket.nodes.insert(pgid, id);
    id
}

/// Materialize the whole root-to-leaf chain described by a cursor stack and
/// return the leaf node.
pub(crate) fn stack_to_node(
    arena: &mut NodeArena,
    bucket: &mut BucketData,
    src: &PageSource<'_>,
    stack: &[ElemRef],
) -> NodeId {
    debug_assert!(!stack.is_empty(), "cursor stack is empty");
    let mut n = match stack[0].id {
        PageNodeId::Node(id) => id,
        PageNodeId::Page(pgid) => bucket_node(arena, bucket, src, pgid, None),
        PageNodeId::Inline => bucket_node(arena, bucket, src, 0, None),
    };
    for frame in &stack[..stack.len() - 1] {
        debug_assert!(!arena.get(n).is_leaf, "branch expected on cursor path");
        let child_pgid = arena.get(n).inodes[frame.index].pgid;
        n = bucket_node(arena, bucket, src, child_pgid, Some(n));
    }
    debug_assert!(arena.get(n).is_leaf, "cursor path must end at a leaf");
    n
}

//
// Key operations
//

pub(crate) fn get_op(
    src: &PageSource<'_>,
    arena: &NodeArena,
    root: &BucketData,
    path: &[Vec<u8>],
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let res = resolve_ref(src, arena, root, path)?;
    let view = BucketView {
        src: *src,
        arena,
        bucket: res.data(),
    };
    let mut stack = Vec::new();
    match c_seek_raw(&view, &mut stack, key) {
        Some((k, v, flags)) if k == key && flags & BUCKET_LEAF_FLAG == 0 => Ok(Some(v)),
        _ => Ok(None),
    }
}

pub(crate) fn put_op(
    src: &PageSource<'_>,
    arena: &mut NodeArena,
    root: &mut BucketData,
    path: &[Vec<u8>],
    key: &[u8],
    value: &[u8],
) -> Result<()> {
    if key.is_empty() {
        return Err(Error::KeyRequired);
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(Error::KeyTooLarge);
    }
    if value.len() > MAX_VALUE_SIZE {
        return Err(Error::ValueTooLarge);
    }
    let bucket = resolve_mut(src, arena, root, path)?;
    let mut stack = Vec::new();
    let found = {
        let view = BucketView {
            src: *src,
            arena: &*arena,
            bucket: &*bucket,
        };
        c_seek_raw(&view, &mut stack, key)
    };
    if let Some((k, _, flags)) = found {
        if k == key && flags & BUCKET_LEAF_FLAG != 0 {
            return Err(Error::IncompatibleValue);
        }
    }
    let nid = stack_to_node(arena, bucket, src, &stack);
    arena.get_mut(nid).put(key, key, value.to_vec(), 0, 0);
    Ok(())
}

pub(crate) fn delete_op(
    src: &PageSource<'_>,
    arena: &mut NodeArena,
    root: &mut BucketData,
    path: &[Vec<u8>],
    key: &[u8],
) -> Result<()> {
    let bucket = resolve_mut(src, arena, root, path)?;
    let mut stack = Vec::new();
    let found = {
        let view = BucketView {
            src: *src,
            arena: &*arena,
            bucket: &*bucket,
        };
        c_seek_raw(&view, &mut stack, key)
    };
    match found {
        Some((k, _, flags)) if k == key => {
            if flags & BUCKET_LEAF_FLAG != 0 {
                return Err(Error::IncompatibleValue);
            }
        }
        // deleting a missing key is a no-op
        _ => return Ok(()),
    }
    let nid = stack_to_node(arena, bucket, src, &stack);
    arena.get_mut(nid).del(key);
    Ok(())
}

/// Delete under an already-positioned cursor; returns whether the leaf still
/// holds entries afterwards.
pub(crate) fn cursor_delete_op(
    tx: &mut Tx<'_>,
    path: &[Vec<u8>],
    stack: &[ElemRef],
    key: &[u8],
) -> Result<bool> {
    let (src, arena, root) = tx.split_write();
    let bucket = resolve_mut(&src, &*arena, root, path)?;
    let nid = stack_to_node(arena, bucket, &src, stack);
    arena.get_mut(nid).del(key);
    Ok(!arena.get(nid).inodes.is_empty())
}

//
// Bucket management
//

pub(crate) fn create_bucket_op(
    src: &PageSource<'_>,
    arena: &mut NodeArena,
    root: &mut BucketData,
    path: &[Vec<u8>],
    name: &[u8],
    if_not_exists: bool,
) -> Result<()> {
    if name.is_empty() {
        return Err(Error::BucketNameRequired);
    }
    if name.len() > MAX_KEY_SIZE {
        return Err(Error::KeyTooLarge);
    }
    let bucket = resolve_mut(src, arena, root, path)?;
    let mut stack = Vec::new();
    let found = {
        let view = BucketView {
            src: *src,
            arena: &*arena,
            bucket: &*bucket,
        };
        c_seek_raw(&view, &mut stack, name)
    };
    if let Some((k, _, flags)) = found {
        if k == name {
            if flags & BUCKET_LEAF_FLAG != 0 {
                if if_not_exists {
                    return Ok(());
                }
                return Err(Error::BucketExists);
            }
            return Err(Error::IncompatibleValue);
        }
    }
    let value = BucketData::empty_inline_value();
    let nid = stack_to_node(arena, bucket, src, &stack);
    arena.get_mut(nid).put(name, name, value, 0, BUCKET_LEAF_FLAG);
    bucket.buckets.insert(name.to_vec(), BucketData::new_inline());
    Ok(())
}

pub(crate) fn delete_bucket_op(
    src: &PageSource<'_>,
    arena: &mut NodeArena,
    root: &mut BucketData,
    db: &Db,
    txid: TxId,
    path: &[Vec<u8>],
    name: &[u8],
) -> Result<()> {
    if name.is_empty() {
        return Err(Error::BucketNameRequired);
    }
    let bucket = resolve_mut(src, arena, root, path)?;
    delete_bucket_inner(src, arena, bucket, db, txid, name)
}

fn delete_bucket_inner(
    src: &PageSource<'_>,
    arena: &mut NodeArena,
    bucket: &mut BucketData,
    db: &Db,
    txid: TxId,
    name: &[u8],
) -> Result<()> {
    let mut stack = Vec::new();
    let found = {
        let view = BucketView {
            src: *src,
            arena: &*arena,
            bucket: &*bucket,
        };
        c_seek_raw(&view, &mut stack, name)
    };
    match found {
        Some((k, _, flags)) if k == name => {
            if flags & BUCKET_LEAF_FLAG == 0 {
                return Err(Error::IncompatibleValue);
            }
        }
        _ => return Err(Error::BucketNotFound),
    }

    if !bucket.buckets.contains_key(name) {
        let child = open_child(src, &*arena, &*bucket, name)?;
        bucket.buckets.insert(name.to_vec(), child);
    }
    {
        let child = bucket.buckets.get_mut(name).unwrap();
        // recursively delete nested buckets first
        let sub_names = {
            let view = BucketView {
                src: *src,
                arena: &*arena,
                bucket: &*child,
            };
            collect_bucket_names(&view)
        };
        for sub in sub_names {
            delete_bucket_inner(src, arena, child, db, txid, &sub)?;
        }
        // drop materialized state and free the subtree's pages
        child.nodes.clear();
        child.root_node = None;
        free_bucket(src, child, db, txid)?;
    }
    bucket.buckets.remove(name);

    // remove the header entry from the parent leaf
    let nid = stack_to_node(arena, bucket, src, &stack);
    arena.get_mut(nid).del(name);
    Ok(())
}

fn collect_bucket_names(view: &BucketView<'_>) -> Vec<Vec<u8>> {
    let mut names = Vec::new();
    let mut stack = Vec::new();
    let mut item = c_first(view, &mut stack);
    while let Some((k, _, flags)) = item {
        if flags & BUCKET_LEAF_FLAG != 0 {
            names.push(k);
        }
        item = c_next(view, &mut stack);
    }
    names
}

/// Release every page of `bucket`'s tree into the freelist and reset its
/// root. An inline bucket owns no pages.
fn free_bucket(src: &PageSource<'_>, bucket: &mut BucketData, db: &Db, txid: TxId) -> Result<()> {
    if bucket.root == 0 {
        return Ok(());
    }
    free_tree(src, db, txid, bucket.root)?;
    bucket.root = 0;
    Ok(())
}

fn free_tree(src: &PageSource<'_>, db: &Db, txid: TxId, pgid: PageId) -> Result<()> {
    let (children, overflow) = src.with(pgid, |p| {
        let mut children = Vec::new();
        if p.is_branch() {
            for i in 0..p.count() {
                children.push(p.branch_pgid(i));
            }
        }
        (children, p.overflow())
    });
    db.freelist.lock().unwrap().free(txid, pgid, overflow)?;
    for child in children {
        free_tree(src, db, txid, child)?;
    }
    Ok(())
}

//
// Rebalance
//

pub(crate) struct RebalanceCtx<'a> {
    pub src: PageSource<'a>,
    pub arena: &'a mut NodeArena,
    pub db: &'a Db,
    pub txid: TxId,
    pub page_size: usize,
}

/// Rebalance every node this transaction removed keys from, then recurse
/// into the touched child buckets.
pub(crate) fn rebalance_bucket(ctx: &mut RebalanceCtx<'_>, bucket: &mut BucketData) -> Result<()> {
    let ids: Vec<NodeId> = bucket.nodes.values().copied().collect();
    for id in ids {
        rebalance_node(ctx, bucket, id)?;
    }
    let names: Vec<Vec<u8>> = bucket.buckets.keys().cloned().collect();
    for name in names {
        let mut child = bucket.buckets.remove(&name).unwrap();
        rebalance_bucket(ctx, &mut child)?;
        bucket.buckets.insert(name, child);
    }
    Ok(())
}

fn free_node(ctx: &mut RebalanceCtx<'_>, id: NodeId) -> Result<()> {
    let pgid = ctx.arena.get(id).pgid;
    if pgid > 0 {
        let overflow = ctx.src.with(pgid, |p| p.overflow());
        ctx.db.freelist.lock().unwrap().free(ctx.txid, pgid, overflow)?;
        ctx.arena.get_mut(id).pgid = 0;
    }
    Ok(())
}

fn rebalance_node(ctx: &mut RebalanceCtx<'_>, bucket: &mut BucketData, id: NodeId) -> Result<()> {
    if !ctx.arena.get(id).unbalanced {
        return Ok(());
    }
    ctx.arena.get_mut(id).unbalanced = false;

    let threshold = ctx.page_size / 4;
    {
        let n = ctx.arena.get(id);
        if n.size() > threshold && n.inodes.len() > n.min_keys() {
            return Ok(());
        }
    }

    let parent = ctx.arena.get(id).parent;
    let Some(parent) = parent else {
        // Root node. A branch root with a single child is collapsed into it.
        let collapse = {
            let n = ctx.arena.get(id);
            !n.is_leaf && n.inodes.len() == 1
        };
        if collapse {
            let src = ctx.src;
            let child_pgid = ctx.arena.get(id).inodes[0].pgid;
            let child = bucket_node(ctx.arena, bucket, &src, child_pgid, Some(id));

            let (child_is_leaf, child_inodes, child_children) = {
                let c = ctx.arena.get_mut(child);
                (
                    c.is_leaf,
                    std::mem::take(&mut c.inodes),
                    std::mem::take(&mut c.children),
                )
            };
            {
                let n = ctx.arena.get_mut(id);
                n.is_leaf = child_is_leaf;
                n.inodes = child_inodes;
                n.children = child_children;
            }
            // reparent grandchildren that are materialized
            let pgids: Vec<PageId> = ctx.arena.get(id).inodes.iter().map(|i| i.pgid).collect();
            for pgid in pgids {
                if let Some(&g) = bucket.nodes.get(&pgid) {
                    ctx.arena.get_mut(g).parent = Some(id);
                }
            }
            {
                let c = ctx.arena.get_mut(child);
                c.parent = None;
                c.unbalanced = false;
            }
            bucket.nodes.remove(&child_pgid);
            free_node(ctx, child)?;
        }
        return Ok(());
    };

    // A node left without keys is removed outright.
    if ctx.arena.get(id).inodes.is_empty() {
        let key = ctx.arena.get(id).key.clone();
        ctx.arena.get_mut(parent).del(&key);
        ctx.arena.remove_child(parent, id);
        let pgid = ctx.arena.get(id).pgid;
        bucket.nodes.remove(&pgid);
        free_node(ctx, id)?;
        return rebalance_node(ctx, bucket, parent);
    }

    debug_assert!(
        ctx.arena.get(parent).inodes.len() > 1,
        "parent must have at least two children"
    );

    if ctx.arena.child_index(parent, id) == 0 {
        // leftmost child: absorb the next sibling into this node
        let next_index = ctx.arena.child_index(parent, id) + 1;
        let sibling_pgid = ctx.arena.get(parent).inodes[next_index].pgid;
        let src = ctx.src;
        let sibling = bucket_node(ctx.arena, bucket, &src, sibling_pgid, Some(parent));
        merge_nodes(ctx, bucket, sibling, id, parent)?;
    } else {
        // absorb this node into the previous sibling
        let prev_index = ctx.arena.child_index(parent, id) - 1;
        let sibling_pgid = ctx.arena.get(parent).inodes[prev_index].pgid;
        let src = ctx.src;
        let sibling = bucket_node(ctx.arena, bucket, &src, sibling_pgid, Some(parent));
        merge_nodes(ctx, bucket, id, sibling, parent)?;
    }
    rebalance_node(ctx, bucket, parent)
}

/// Append `source`'s inodes onto `dest` (its left neighbor), moving any
/// materialized children over, then drop `source` from the tree.
fn merge_nodes(
    ctx: &mut RebalanceCtx<'_>,
    bucket: &mut BucketData,
    source: NodeId,
    dest: NodeId,
    parent: NodeId,
) -> Result<()> {
    let pgids: Vec<PageId> = ctx.arena.get(source).inodes.iter().map(|i| i.pgid).collect();
    for pgid in pgids {
        if let Some(&child) = bucket.nodes.get(&pgid) {
            if let Some(p) = ctx.arena.get(child).parent {
                ctx.arena.remove_child(p, child);
            }
            ctx.arena.get_mut(child).parent = Some(dest);
            ctx.arena.get_mut(dest).children.push(child);
        }
    }
    let mut moved = std::mem::take(&mut ctx.arena.get_mut(source).inodes);
    ctx.arena.get_mut(dest).inodes.append(&mut moved);

    let source_key = ctx.arena.get(source).key.clone();
    ctx.arena.get_mut(parent).del(&source_key);
    ctx.arena.remove_child(parent, source);
    let source_pgid = ctx.arena.get(source).pgid;
    bucket.nodes.remove(&source_pgid);
    ctx.arena.get_mut(source).unbalanced = false;
    free_node(ctx, source)?;
    Ok(())
}

//
// Spill
//

fn spill_src<'s>(
    pages: &'s HashMap<PageId, Vec<u8>>,
    db: &'s Db,
    page_size: usize,
) -> PageSource<'s> {
    PageSource {
        pages,
        mmap: crate::db::MmapRef::Lock(&db.mmap),
        page_size,
    }
}

/// True when the bucket can be packed into its parent's leaf value: a single
/// leaf root with no nested buckets, small enough for a quarter page.
fn inlineable(arena: &NodeArena, bucket: &BucketData, page_size: usize) -> bool {
    let Some(nid) = bucket.root_node else {
        return false;
    };
    let n = arena.get(nid);
    if !n.is_leaf {
        return false;
    }
    let mut size = 8 + PAGE_HEADER_SIZE;
    for inode in &n.inodes {
        if inode.flags & BUCKET_LEAF_FLAG != 0 {
            return false;
        }
        size += LEAF_ELEMENT_SIZE + inode.key.len() + inode.value.len();
        if size > page_size / 4 {
            return false;
        }
    }
    true
}

/// Serialize an inline bucket: zeroed root id followed by the root node
/// written as a page.
fn write_inline_value(arena: &NodeArena, bucket: &BucketData) -> Vec<u8> {
    let n = arena.get(bucket.root_node.expect("inline bucket has a root node"));
    let mut value = vec![0u8; 8 + n.size()];
    n.write(&mut value[8..]);
    value
}

/// Free the whole tree of a bucket that is being packed inline. Walks
/// materialized nodes where they exist: rebalance may already have released
/// pages the committed tree still references, and those must not be freed a
/// second time.
fn free_for_inline(state: &mut SpillState<'_>, bucket: &mut BucketData) -> Result<()> {
    if bucket.root == 0 {
        return Ok(());
    }
    free_page_node_walk(state, bucket, bucket.root)?;
    bucket.root = 0;
    Ok(())
}

fn free_page_node_walk(
    state: &mut SpillState<'_>,
    bucket: &BucketData,
    pgid: PageId,
) -> Result<()> {
    if let Some(&nid) = bucket.nodes.get(&pgid) {
        let node_pgid = state.arena.get(nid).pgid;
        if node_pgid > 0 {
            let overflow = {
                let src = spill_src(&*state.pages, state.db, state.page_size);
                src.with(node_pgid, |p| p.overflow())
            };
            state
                .db
                .freelist
                .lock()
                .unwrap()
                .free(state.txid, node_pgid, overflow)?;
            state.arena.get_mut(nid).pgid = 0;
        }
        if !state.arena.get(nid).is_leaf {
            let children: Vec<PageId> =
                state.arena.get(nid).inodes.iter().map(|i| i.pgid).collect();
            for child in children {
                free_page_node_walk(state, bucket, child)?;
            }
        }
        Ok(())
    } else {
        let (children, overflow) = {
            let src = spill_src(&*state.pages, state.db, state.page_size);
            src.with(pgid, |p| {
                let mut children = Vec::new();
                if p.is_branch() {
                    for i in 0..p.count() {
                        children.push(p.branch_pgid(i));
                    }
                }
                (children, p.overflow())
            })
        };
        state
            .db
            .freelist
            .lock()
            .unwrap()
            .free(state.txid, pgid, overflow)?;
        for child in children {
            free_page_node_walk(state, bucket, child)?;
        }
        Ok(())
    }
}

/// Write every modified node of `bucket` (children first) to freshly
/// allocated pages and update the bucket's root. Child buckets are spilled
/// before their parent entry is rewritten.
pub(crate) fn spill_bucket(state: &mut SpillState<'_>, bucket: &mut BucketData) -> Result<()> {
    let names: Vec<Vec<u8>> = bucket.buckets.keys().cloned().collect();
    for name in names {
        let mut child = bucket.buckets.remove(&name).unwrap();
        let value = if inlineable(&*state.arena, &child, state.page_size) {
            free_for_inline(state, &mut child)?;
            write_inline_value(&*state.arena, &child)
        } else {
            spill_bucket(state, &mut child)?;
            BucketData::header_value(child.root)
        };
        let had_root_node = child.root_node.is_some();
        bucket.buckets.insert(name.clone(), child);
        // untouched buckets keep their existing entry
        if !had_root_node {
            continue;
        }

        let mut stack = Vec::new();
        let found = {
            let src = spill_src(&*state.pages, state.db, state.page_size);
            let view = BucketView {
                src,
                arena: &*state.arena,
                bucket: &*bucket,
            };
            c_seek_raw(&view, &mut stack, &name)
        };
        match &found {
            Some((k, _, flags)) if k == &name => {
                assert!(
                    flags & BUCKET_LEAF_FLAG != 0,
                    "entry for {:?} is not a bucket header",
                    String::from_utf8_lossy(&name)
                );
            }
            _ => panic!(
                "bucket header for {:?} disappeared during spill",
                String::from_utf8_lossy(&name)
            ),
        }
        let src = spill_src(&*state.pages, state.db, state.page_size);
        let nid = stack_to_node(state.arena, bucket, &src, &stack);
        state
            .arena
            .get_mut(nid)
            .put(&name, &name, value, 0, BUCKET_LEAF_FLAG);
    }

    let Some(root_node) = bucket.root_node else {
        return Ok(());
    };
    spill_node(state, bucket, root_node)?;
    let new_root = state.arena.root_of(root_node);
    bucket.root_node = Some(new_root);
    let pgid = state.arena.get(new_root).pgid;
    debug_assert!(pgid < state.meta.pgid, "root page above high water mark");
    bucket.root = pgid;
    trace!("bucket spilled to root page {}", pgid);
    Ok(())
}

fn spill_node(state: &mut SpillState<'_>, bucket: &mut BucketData, id: NodeId) -> Result<()> {
    if state.arena.get(id).spilled {
        return Ok(());
    }

    // Spill children first, ordered by key. The list can grow while we walk
    // it (grandchildren splitting add siblings), so iterate by index.
    {
        let mut children = std::mem::take(&mut state.arena.get_mut(id).children);
        let arena = &*state.arena;
        children.sort_by(|&a, &b| arena.get(a).inodes[0].key.cmp(&arena.get(b).inodes[0].key));
        state.arena.get_mut(id).children = children;
    }
    let mut i = 0;
    loop {
        let child = {
            let children = &state.arena.get(id).children;
            if i >= children.len() {
                break;
            }
            children[i]
        };
        spill_node(state, bucket, child)?;
        i += 1;
    }
    state.arena.get_mut(id).children.clear();

    let nodes = state
        .arena
        .split(id, state.page_size, bucket.fill_percent.clamp(MIN_FILL_PERCENT, MAX_FILL_PERCENT));
    for nid in nodes {
        // release the page this node came from
        {
            let pgid = state.arena.get(nid).pgid;
            if pgid > 0 {
                let overflow = {
                    let src = spill_src(&*state.pages, state.db, state.page_size);
                    src.with(pgid, |p| p.overflow())
                };
                state
                    .db
                    .freelist
                    .lock()
                    .unwrap()
                    .free(state.txid, pgid, overflow)?;
                state.arena.get_mut(nid).pgid = 0;
            }
        }

        // allocate a fresh contiguous span and write the node out
        let size = state.arena.get(nid).size();
        let count = (size + state.page_size - 1) / state.page_size;
        let new_pgid = state.allocate(count)?;
        debug_assert!(new_pgid >= 2, "allocator returned a meta page");
        if new_pgid + (count as PageId) > state.meta.pgid {
            return Err(Error::PageIdAboveHighWaterMark(new_pgid, state.meta.pgid));
        }
        {
            let buf = state.pages.get_mut(&new_pgid).unwrap();
            state.arena.get(nid).write(buf);
        }
        {
            let n = state.arena.get_mut(nid);
            n.pgid = new_pgid;
            n.spilled = true;
        }

        // upsert this node's entry in its parent
        let parent = state.arena.get(nid).parent;
        if let Some(p) = parent {
            let (old_key, first_key) = {
                let n = state.arena.get(nid);
                let old = if n.key.is_empty() {
                    n.inodes[0].key.clone()
                } else {
                    n.key.clone()
                };
                (old, n.inodes[0].key.clone())
            };
            state
                .arena
                .get_mut(p)
                .put(&old_key, &first_key, Vec::new(), new_pgid, 0);
            state.arena.get_mut(nid).key = first_key;
        }
    }

    // a parent created by the split above has not been visited yet
    let parent = state.arena.get(id).parent;
    if let Some(p) = parent {
        if state.arena.get(p).pgid == 0 && !state.arena.get(p).spilled {
            state.arena.get_mut(id).children.clear();
            return spill_node(state, bucket, p);
        }
    }
    Ok(())
}

//
// Statistics
//

/// Recursive usage counters of one bucket.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BucketStats {
    pub branch_page_n: usize,
    pub branch_overflow_n: usize,
    pub leaf_page_n: usize,
    pub leaf_overflow_n: usize,
    /// Number of keys, nested bucket headers included.
    pub key_n: usize,
    pub depth: usize,
    pub branch_alloc: usize,
    pub branch_inuse: usize,
    pub leaf_alloc: usize,
    pub leaf_inuse: usize,
    /// Total buckets, this one included.
    pub bucket_n: usize,
    pub inline_bucket_n: usize,
    pub inline_bucket_inuse: usize,
}

impl BucketStats {
    fn add(&mut self, other: &BucketStats) {
        self.branch_page_n += other.branch_page_n;
        self.branch_overflow_n += other.branch_overflow_n;
        self.leaf_page_n += other.leaf_page_n;
        self.leaf_overflow_n += other.leaf_overflow_n;
        self.key_n += other.key_n;
        self.depth = self.depth.max(other.depth);
        self.branch_alloc += other.branch_alloc;
        self.branch_inuse += other.branch_inuse;
        self.leaf_alloc += other.leaf_alloc;
        self.leaf_inuse += other.leaf_inuse;
        self.bucket_n += other.bucket_n;
        self.inline_bucket_n += other.inline_bucket_n;
        self.inline_bucket_inuse += other.inline_bucket_inuse;
    }
}

fn inline_page_inuse(page: Page<'_>) -> usize {
    let mut used = PAGE_HEADER_SIZE;
    for i in 0..page.count() {
        let elem = page.leaf_elem(i);
        used += LEAF_ELEMENT_SIZE + elem.ksize as usize + elem.vsize as usize;
    }
    used
}

/// Compute recursive statistics over the committed pages of a bucket.
pub(crate) fn stats_op(src: &PageSource<'_>, data: &BucketData, page_size: usize) -> BucketStats {
    let mut stats = BucketStats {
        bucket_n: 1,
        ..Default::default()
    };
    if data.root == 0 {
        stats.inline_bucket_n = 1;
        stats.depth = 1;
        if let Some(buf) = &data.inline_page {
            let page = Page::new(buf);
            stats.key_n = page.count();
            stats.inline_bucket_inuse = 8 + inline_page_inuse(page);
        }
        return stats;
    }
    let mut sub_values = Vec::new();
    let depth = stats_walk(src, data.root, 1, &mut stats, page_size, &mut sub_values);
    stats.depth = depth;
    for value in sub_values {
        let child = BucketData::from_value(&value);
        let child_stats = stats_op(src, &child, page_size);
        stats.add(&child_stats);
    }
    stats
}

fn stats_walk(
    src: &PageSource<'_>,
    pgid: PageId,
    depth: usize,
    stats: &mut BucketStats,
    page_size: usize,
    sub_values: &mut Vec<Vec<u8>>,
) -> usize {
    enum Info {
        Leaf {
            overflow: u32,
            inuse: usize,
            key_n: usize,
            buckets: Vec<Vec<u8>>,
        },
        Branch {
            overflow: u32,
            inuse: usize,
            children: Vec<PageId>,
        },
    }
    let info = src.with(pgid, |p| {
        if p.is_leaf() {
            let mut buckets = Vec::new();
            for i in 0..p.count() {
                if p.leaf_flags(i) & BUCKET_LEAF_FLAG != 0 {
                    buckets.push(p.leaf_value(i).to_vec());
                }
            }
            Info::Leaf {
                overflow: p.overflow(),
                inuse: inline_page_inuse(p),
                key_n: p.count(),
                buckets,
            }
        } else {
            let mut children = Vec::new();
            let mut inuse = PAGE_HEADER_SIZE;
            for i in 0..p.count() {
                let elem = p.branch_elem(i);
                children.push(elem.pgid);
                inuse += crate::config::BRANCH_ELEMENT_SIZE + elem.ksize as usize;
            }
            Info::Branch {
                overflow: p.overflow(),
                inuse,
                children,
            }
        }
    });
    match info {
        Info::Leaf {
            overflow,
            inuse,
            key_n,
            buckets,
        } => {
            stats.leaf_page_n += 1;
            stats.leaf_overflow_n += overflow as usize;
            stats.leaf_inuse += inuse;
            stats.leaf_alloc += (overflow as usize + 1) * page_size;
            stats.key_n += key_n;
            sub_values.extend(buckets);
            depth
        }
        Info::Branch {
            overflow,
            inuse,
            children,
        } => {
            stats.branch_page_n += 1;
            stats.branch_overflow_n += overflow as usize;
            stats.branch_inuse += inuse;
            stats.branch_alloc += (overflow as usize + 1) * page_size;
            let mut max_depth = depth;
            for child in children {
                let d = stats_walk(src, child, depth + 1, stats, page_size, sub_values);
                max_depth = max_depth.max(d);
            }
            max_depth
        }
    }
}

//
// Public handles
//

/// Read handle over a bucket. Holds a shared borrow of the transaction, so
/// the tree cannot change while the handle is alive.
pub struct Bucket<'b, 'db> {
    pub(crate) tx: &'b Tx<'db>,
    pub(crate) path: Vec<Vec<u8>>,
}

impl<'b, 'db> Bucket<'b, 'db> {
    /// Fetch the value stored at `key`. Nested bucket headers and missing
    /// keys both yield `None`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tx.ensure_open()?;
        let src = self.tx.page_source();
        let state = self.tx.state();
        get_op(&src, &state.arena, &state.root, &self.path, key)
    }

    /// Open the nested bucket `name`. The handle borrows the transaction,
    /// not this bucket, so handles can be chained.
    pub fn bucket(&self, name: &[u8]) -> Result<Bucket<'b, 'db>> {
        let mut path = self.path.clone();
        path.push(name.to_vec());
        self.tx.open_bucket(path)
    }

    pub fn cursor(&self) -> Cursor<'b, 'db> {
        Cursor {
            tx: self.tx,
            path: self.path.clone(),
            stack: Vec::new(),
        }
    }

    /// Visit every entry in key order. Nested buckets are passed with a
    /// `None` value.
    pub fn for_each(
        &self,
        mut f: impl FnMut(&[u8], Option<&[u8]>) -> Result<()>,
    ) -> Result<()> {
        let mut cursor = self.cursor();
        let mut item = cursor.first()?;
        while let Some((key, value)) = item {
            f(&key, value.as_deref())?;
            item = cursor.next()?;
        }
        Ok(())
    }

    /// Visit the name of every nested bucket.
    pub fn for_each_bucket(&self, mut f: impl FnMut(&[u8]) -> Result<()>) -> Result<()> {
        self.for_each(|name, value| {
            if value.is_none() {
                f(name)?;
            }
            Ok(())
        })
    }

    pub fn stats(&self) -> Result<BucketStats> {
        self.tx.ensure_open()?;
        let src = self.tx.page_source();
        let state = self.tx.state();
        let res = resolve_ref(&src, &state.arena, &state.root, &self.path)?;
        Ok(stats_op(&src, res.data(), self.tx.page_size()))
    }
}

/// Writable handle over a bucket.
pub struct BucketMut<'b, 'db> {
    pub(crate) tx: &'b mut Tx<'db>,
    pub(crate) path: Vec<Vec<u8>>,
}

impl<'b, 'db> BucketMut<'b, 'db> {
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tx.ensure_open()?;
        let src = self.tx.page_source();
        let state = self.tx.state();
        get_op(&src, &state.arena, &state.root, &self.path, key)
    }

    /// Insert or replace `key`. Fails on empty keys, oversized keys or
    /// values, and keys holding a nested bucket.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tx.ensure_writable()?;
        let (src, arena, root) = self.tx.split_write();
        put_op(&src, arena, root, &self.path, key, value)
    }

    /// Remove `key` if present; removing a nested bucket this way fails.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.tx.ensure_writable()?;
        let (src, arena, root) = self.tx.split_write();
        delete_op(&src, arena, root, &self.path, key)
    }

    /// Open the nested bucket `name` for writing.
    pub fn bucket_mut(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        self.tx.ensure_writable()?;
        let mut path = self.path.clone();
        path.push(name.to_vec());
        // materialize and verify the bucket exists
        {
            let (src, arena, root) = self.tx.split_write();
            resolve_mut(&src, &*arena, root, &path)?;
        }
        Ok(BucketMut {
            tx: &mut *self.tx,
            path,
        })
    }

    /// Read-only handle over the nested bucket `name`.
    pub fn bucket(&self, name: &[u8]) -> Result<Bucket<'_, 'db>> {
        let mut path = self.path.clone();
        path.push(name.to_vec());
        self.tx.open_bucket(path)
    }

    pub fn create_bucket(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        self.tx.ensure_writable()?;
        let mut path = self.path.clone();
        {
            let (src, arena, root) = self.tx.split_write();
            create_bucket_op(&src, arena, root, &path, name, false)?;
        }
        path.push(name.to_vec());
        Ok(BucketMut {
            tx: &mut *self.tx,
            path,
        })
    }

    pub fn create_bucket_if_not_exists(&mut self, name: &[u8]) -> Result<BucketMut<'_, 'db>> {
        self.tx.ensure_writable()?;
        let mut path = self.path.clone();
        {
            let (src, arena, root) = self.tx.split_write();
            create_bucket_op(&src, arena, root, &path, name, true)?;
        }
        path.push(name.to_vec());
        Ok(BucketMut {
            tx: &mut *self.tx,
            path,
        })
    }

    /// Delete the nested bucket `name` and everything below it.
    pub fn delete_bucket(&mut self, name: &[u8]) -> Result<()> {
        self.tx.ensure_writable()?;
        let txid = self.tx.id();
        let db = self.tx.db;
        let (src, arena, root) = self.tx.split_write();
        delete_bucket_op(&src, arena, root, db, txid, &self.path, name)
    }

    pub fn cursor(&self) -> Cursor<'_, 'db> {
        Cursor {
            tx: &*self.tx,
            path: self.path.clone(),
            stack: Vec::new(),
        }
    }

    pub fn cursor_mut(&mut self) -> CursorMut<'_, 'db> {
        CursorMut {
            tx: &mut *self.tx,
            path: self.path.clone(),
            stack: Vec::new(),
            skip_next: false,
        }
    }

    pub fn for_each(
        &self,
        mut f: impl FnMut(&[u8], Option<&[u8]>) -> Result<()>,
    ) -> Result<()> {
        let mut cursor = self.cursor();
        let mut item = cursor.first()?;
        while let Some((key, value)) = item {
            f(&key, value.as_deref())?;
            item = cursor.next()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> Result<BucketStats> {
        self.tx.ensure_open()?;
        let src = self.tx.page_source();
        let state = self.tx.state();
        let res = resolve_ref(&src, &state.arena, &state.root, &self.path)?;
        Ok(stats_op(&src, res.data(), self.tx.page_size()))
    }

    /// Tune the node fill threshold for splits in this bucket, clamped to
    /// [0.1, 1.0].
    pub fn set_fill_percent(&mut self, fill: f64) -> Result<()> {
        self.tx.ensure_writable()?;
        let (src, arena, root) = self.tx.split_write();
        let bucket = resolve_mut(&src, arena, root, &self.path)?;
        bucket.fill_percent = fill.clamp(MIN_FILL_PERCENT, MAX_FILL_PERCENT);
        Ok(())
    }
}
