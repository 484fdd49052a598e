//! Copy-on-write B+tree over decoded pages.
//!
//! Reads go through a [`PageSource`]; writes go through a [`PageWriter`],
//! which hands out new page numbers for every page it is asked to change
//! unless the page is already dirty in the current transaction. Every
//! update copies the root-to-leaf path, splits pages that no longer fit,
//! merges pages that fall under a quarter full, and collapses a root that is
//! left with a single child.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::mem;

use crate::config::KeyOrder;
use crate::constants::{DbFlags, CURSOR_STACK};
use crate::error::{Error, Result};
use crate::meta::{TableRecord, TreeInfo};
use crate::page::{self, Branch, Leaf, LeafEntry, NodeData, Page};

impl KeyOrder {
    /// Compare two keys (or duplicate values) under this ordering
    pub(crate) fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            KeyOrder::Lexical => a.cmp(b),
            KeyOrder::Reverse => a.iter().rev().cmp(b.iter().rev()),
            KeyOrder::Integer => match (int_value(a), int_value(b)) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            },
        }
    }

    /// Integer keys must be exactly 4 or 8 bytes
    pub(crate) fn check(self, bytes: &[u8]) -> Result<()> {
        if self == KeyOrder::Integer && int_value(bytes).is_none() {
            return Err(Error::BadValSize);
        }
        Ok(())
    }
}

fn int_value(bytes: &[u8]) -> Option<u64> {
    match bytes.len() {
        4 => Some(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64),
        8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            Some(u64::from_ne_bytes(raw))
        }
        _ => None,
    }
}

/// Read access to the pages visible to a transaction
pub(crate) trait PageSource {
    fn page_size(&self) -> usize;

    fn page(&self, pgno: u64) -> Result<Cow<'_, Page>>;

    fn overflow(&self, pgno: u64, len: usize) -> Result<Cow<'_, [u8]>>;
}

/// Page allocation and copy-on-write for a write transaction
pub(crate) trait PageWriter: PageSource {
    /// Whether `pgno` was allocated by this transaction
    fn is_dirty(&self, pgno: u64) -> bool;

    /// Store `page` under `pgno` if given (it must be dirty), else under a new page
    fn put_page(&mut self, pgno: Option<u64>, page: Page) -> Result<u64>;

    /// Release a page this transaction no longer references
    fn free_page(&mut self, pgno: u64) -> Result<()>;

    /// Store a value in a fresh run of overflow pages
    fn alloc_overflow(&mut self, data: &[u8]) -> Result<u64>;

    /// Release an overflow run holding `len` bytes
    fn free_overflow(&mut self, pgno: u64, len: u64) -> Result<()>;
}

/// Destination of a page-by-page tree copy
pub(crate) trait PageSink {
    fn append(&mut self, page: &Page) -> Result<u64>;

    fn append_overflow(&mut self, data: &[u8]) -> Result<u64>;
}

/// Where to land in a tree
#[derive(Debug, Clone, Copy)]
pub(crate) enum Seek<'k> {
    First,
    Last,
    /// First key greater than or equal
    Ge(&'k [u8]),
    /// First key strictly greater
    Gt(&'k [u8]),
    /// Last key strictly smaller
    Lt(&'k [u8]),
}

fn branch_index(branch: &Branch, order: KeyOrder, key: &[u8]) -> usize {
    let seps = branch.keys.get(1..).unwrap_or(&[]);
    seps.partition_point(|sep| order.compare(sep, key) != Ordering::Greater)
}

/// Find the entry at `target`
pub(crate) fn seek<S: PageSource>(
    src: &S,
    info: &TreeInfo,
    order: KeyOrder,
    target: Seek<'_>,
) -> Result<Option<LeafEntry>> {
    match seek_in(src, info, order, target)? {
        Some((page, idx)) => match page.as_ref() {
            Page::Leaf(leaf) => Ok(Some(leaf.entries[idx].clone())),
            Page::Branch(_) => Err(Error::Corrupted),
        },
        None => Ok(None),
    }
}

/// Entries of the leaf holding `target`, with the index of the entry found
pub(crate) fn seek_leaf<S: PageSource>(
    src: &S,
    info: &TreeInfo,
    order: KeyOrder,
    target: Seek<'_>,
) -> Result<Option<(Vec<LeafEntry>, usize)>> {
    match seek_in(src, info, order, target)? {
        Some((page, idx)) => match page.into_owned() {
            Page::Leaf(leaf) => Ok(Some((leaf.entries, idx))),
            Page::Branch(_) => Err(Error::Corrupted),
        },
        None => Ok(None),
    }
}

fn seek_in<'s, S: PageSource>(
    src: &'s S,
    info: &TreeInfo,
    order: KeyOrder,
    target: Seek<'_>,
) -> Result<Option<(Cow<'s, Page>, usize)>> {
    if info.is_empty() {
        return Ok(None);
    }
    let mut stack: Vec<(Cow<'s, Page>, usize)> = Vec::new();
    let mut pgno = info.root;
    loop {
        if stack.len() >= CURSOR_STACK {
            return Err(Error::CursorFull);
        }
        let page = src.page(pgno)?;
        let down = match page.as_ref() {
            Page::Branch(b) => {
                if b.children.is_empty() {
                    return Err(Error::Corrupted);
                }
                let idx = match target {
                    Seek::First => 0,
                    Seek::Last => b.children.len() - 1,
                    Seek::Ge(k) | Seek::Gt(k) | Seek::Lt(k) => branch_index(b, order, k),
                };
                Some((idx, b.children[idx]))
            }
            Page::Leaf(_) => None,
        };
        if let Some((idx, child)) = down {
            stack.push((page, idx));
            pgno = child;
            continue;
        }

        let Page::Leaf(leaf) = page.as_ref() else {
            return Err(Error::Corrupted);
        };
        let len = leaf.entries.len() as isize;
        let lower = |k: &[u8]| {
            leaf.entries
                .partition_point(|e| order.compare(&e.key, k) == Ordering::Less) as isize
        };
        let idx = match target {
            Seek::First => 0,
            Seek::Last => len - 1,
            Seek::Ge(k) => lower(k),
            Seek::Gt(k) => leaf
                .entries
                .partition_point(|e| order.compare(&e.key, k) != Ordering::Greater)
                as isize,
            Seek::Lt(k) => lower(k) - 1,
        };
        if idx >= 0 && idx < len {
            return Ok(Some((page, idx as usize)));
        }
        return step_leaf(src, stack, idx >= 0);
    }
}

/// Continue from an exhausted leaf into the neighbouring one
fn step_leaf<'s, S: PageSource>(
    src: &'s S,
    mut stack: Vec<(Cow<'s, Page>, usize)>,
    forward: bool,
) -> Result<Option<(Cow<'s, Page>, usize)>> {
    while let Some((page, idx)) = stack.pop() {
        let Page::Branch(branch) = page.as_ref() else {
            return Err(Error::Corrupted);
        };
        let next = if forward {
            idx + 1
        } else {
            match idx.checked_sub(1) {
                Some(i) => i,
                None => continue,
            }
        };
        if next < branch.children.len() {
            return edge(src, branch.children[next], forward, stack.len() + 1).map(Some);
        }
    }
    Ok(None)
}

/// Leaf and index of the first or last entry below `pgno`
fn edge<S: PageSource>(src: &S, mut pgno: u64, first: bool, mut depth: usize) -> Result<(Cow<'_, Page>, usize)> {
    loop {
        if depth >= CURSOR_STACK {
            return Err(Error::CursorFull);
        }
        let page = src.page(pgno)?;
        let child = match page.as_ref() {
            Page::Branch(b) => {
                let child = if first { b.children.first() } else { b.children.last() };
                *child.ok_or(Error::Corrupted)?
            }
            Page::Leaf(l) => {
                if l.entries.is_empty() {
                    return Err(Error::Corrupted);
                }
                let idx = if first { 0 } else { l.entries.len() - 1 };
                return Ok((page, idx));
            }
        };
        pgno = child;
        depth += 1;
    }
}

/// Exact lookup
pub(crate) fn get<S: PageSource>(
    src: &S,
    info: &TreeInfo,
    order: KeyOrder,
    key: &[u8],
) -> Result<Option<NodeData>> {
    Ok(seek(src, info, order, Seek::Ge(key))?
        .filter(|e| order.compare(&e.key, key) == Ordering::Equal)
        .map(|e| e.data))
}

struct PathNode {
    pgno: u64,
    page: Page,
    idx: usize,
}

struct Piece {
    sep: Vec<u8>,
    page: Page,
}

fn load_path<W: PageWriter>(
    w: &W,
    info: &TreeInfo,
    order: KeyOrder,
    key: &[u8],
) -> Result<Vec<PathNode>> {
    let mut path = Vec::new();
    let mut pgno = info.root;
    loop {
        if path.len() >= CURSOR_STACK {
            return Err(Error::CursorFull);
        }
        let page = w.page(pgno)?.into_owned();
        let down = match &page {
            Page::Branch(b) => {
                if b.children.is_empty() {
                    return Err(Error::Corrupted);
                }
                let idx = branch_index(b, order, key);
                Some((idx, b.children[idx]))
            }
            Page::Leaf(_) => None,
        };
        match down {
            Some((idx, child)) => {
                path.push(PathNode { pgno, page, idx });
                pgno = child;
            }
            None => {
                path.push(PathNode { pgno, page, idx: 0 });
                return Ok(path);
            }
        }
    }
}

fn leaf_of(path: &mut [PathNode]) -> Result<&mut Leaf> {
    match path.last_mut() {
        Some(PathNode {
            page: Page::Leaf(leaf),
            ..
        }) => Ok(leaf),
        _ => Err(Error::Corrupted),
    }
}

/// Insert or overwrite `key`, returning the data it replaced
pub(crate) fn put<W: PageWriter>(
    w: &mut W,
    info: &mut TreeInfo,
    order: KeyOrder,
    key: &[u8],
    data: NodeData,
) -> Result<Option<NodeData>> {
    if info.is_empty() {
        let page = Page::Leaf(Leaf {
            entries: vec![LeafEntry {
                key: key.to_vec(),
                data,
            }],
        });
        info.root = w.put_page(None, page)?;
        info.depth = 1;
        info.leaf_pages += 1;
        return Ok(None);
    }

    let mut path = load_path(w, info, order, key)?;
    let leaf = leaf_of(&mut path)?;
    let old = match leaf.entries.binary_search_by(|e| order.compare(&e.key, key)) {
        Ok(i) => Some(mem::replace(&mut leaf.entries[i].data, data)),
        Err(i) => {
            leaf.entries.insert(
                i,
                LeafEntry {
                    key: key.to_vec(),
                    data,
                },
            );
            None
        }
    };
    rebuild(w, info, path)?;
    Ok(old)
}

/// Remove `key`, returning its data
pub(crate) fn delete<W: PageWriter>(
    w: &mut W,
    info: &mut TreeInfo,
    order: KeyOrder,
    key: &[u8],
) -> Result<Option<NodeData>> {
    if info.is_empty() {
        return Ok(None);
    }
    let mut path = load_path(w, info, order, key)?;
    let leaf = leaf_of(&mut path)?;
    let removed = match leaf.entries.binary_search_by(|e| order.compare(&e.key, key)) {
        Ok(i) => leaf.entries.remove(i).data,
        Err(_) => return Ok(None),
    };
    rebuild(w, info, path)?;
    Ok(Some(removed))
}

fn node_sizes(page: &Page) -> Vec<usize> {
    match page {
        Page::Leaf(l) => l.entries.iter().map(LeafEntry::size).collect(),
        Page::Branch(b) => b
            .keys
            .iter()
            .enumerate()
            .map(|(i, k)| page::branch_node_size(if i == 0 { 0 } else { k.len() }))
            .collect(),
    }
}

/// Start indices of the pieces a page must be cut into
fn split_points(sizes: &[usize], cap: usize) -> Vec<usize> {
    let total: usize = sizes.iter().sum();
    if total <= cap {
        return vec![0];
    }
    let mut best: Option<(usize, usize)> = None;
    let mut prefix = 0;
    for m in 1..sizes.len() {
        prefix += sizes[m - 1];
        let rest = total - prefix;
        if prefix <= cap && rest <= cap {
            let imbalance = prefix.abs_diff(rest);
            if best.map_or(true, |(b, _)| imbalance < b) {
                best = Some((imbalance, m));
            }
        }
    }
    if let Some((_, m)) = best {
        return vec![0, m];
    }

    let mut starts = vec![0];
    let mut used = 0;
    for (i, size) in sizes.iter().enumerate() {
        if used + size > cap && used > 0 {
            starts.push(i);
            used = 0;
        }
        used += size;
    }
    starts
}

fn split(page: Page, cap: usize) -> Vec<Piece> {
    let starts = split_points(&node_sizes(&page), cap);
    if starts.len() == 1 {
        return vec![Piece {
            sep: Vec::new(),
            page,
        }];
    }
    let mut pieces = Vec::with_capacity(starts.len());
    match page {
        Page::Leaf(leaf) => {
            let mut entries = leaf.entries;
            for &start in starts.iter().skip(1).rev() {
                let tail = entries.split_off(start);
                pieces.push(Piece {
                    sep: tail[0].key.clone(),
                    page: Page::Leaf(Leaf { entries: tail }),
                });
            }
            pieces.push(Piece {
                sep: Vec::new(),
                page: Page::Leaf(Leaf { entries }),
            });
        }
        Page::Branch(branch) => {
            let Branch {
                mut keys,
                mut children,
            } = branch;
            for &start in starts.iter().skip(1).rev() {
                let mut tail_keys = keys.split_off(start);
                let tail_children = children.split_off(start);
                let sep = mem::take(&mut tail_keys[0]);
                pieces.push(Piece {
                    sep,
                    page: Page::Branch(Branch {
                        keys: tail_keys,
                        children: tail_children,
                    }),
                });
            }
            pieces.push(Piece {
                sep: Vec::new(),
                page: Page::Branch(Branch { keys, children }),
            });
        }
    }
    pieces.reverse();
    pieces
}

fn count_pages(info: &mut TreeInfo, leaf: bool, delta: i64) {
    let counter = if leaf {
        &mut info.leaf_pages
    } else {
        &mut info.branch_pages
    };
    *counter = counter.saturating_add_signed(delta);
}

/// Store a modified page, in place if it is already dirty
fn rewrite<W: PageWriter>(w: &mut W, old: u64, page: Page) -> Result<u64> {
    if w.is_dirty(old) {
        w.put_page(Some(old), page)
    } else {
        w.free_page(old)?;
        w.put_page(None, page)
    }
}

fn write_pieces<W: PageWriter>(
    w: &mut W,
    info: &mut TreeInfo,
    old: u64,
    pieces: Vec<Piece>,
    leaf: bool,
) -> Result<Vec<(Vec<u8>, u64)>> {
    if pieces.is_empty() {
        w.free_page(old)?;
        count_pages(info, leaf, -1);
        return Ok(Vec::new());
    }
    let mut written = Vec::with_capacity(pieces.len());
    for (i, Piece { sep, page }) in pieces.into_iter().enumerate() {
        let pgno = if i == 0 {
            rewrite(w, old, page)?
        } else {
            count_pages(info, leaf, 1);
            w.put_page(None, page)?
        };
        written.push((sep, pgno));
    }
    Ok(written)
}

/// Replace child `idx` of `branch` by the written pieces
fn splice(branch: &mut Branch, idx: usize, written: Vec<(Vec<u8>, u64)>) {
    if written.is_empty() {
        branch.children.remove(idx);
        branch.keys.remove(idx);
        if idx == 0 {
            if let Some(first) = branch.keys.first_mut() {
                first.clear();
            }
        }
        return;
    }
    for (offset, (sep, pgno)) in written.into_iter().enumerate() {
        if offset == 0 {
            branch.children[idx] = pgno;
        } else {
            branch.children.insert(idx + offset, pgno);
            branch.keys.insert(idx + offset, sep);
        }
    }
}

/// Fold an underfull child into a neighbour when the pair fits one page.
/// Returns the (possibly merged) page and the child's new index.
fn merge_sibling<W: PageWriter>(
    w: &mut W,
    info: &mut TreeInfo,
    branch: &mut Branch,
    idx: usize,
    page: Page,
    cap: usize,
    leaf: bool,
) -> Result<(Page, usize)> {
    let left = idx > 0;
    let sib_idx = if left { idx - 1 } else { idx + 1 };
    let sep_idx = if left { idx } else { idx + 1 };
    let sib_pgno = branch.children[sib_idx];
    let sibling = w.page(sib_pgno)?.into_owned();

    let extra = if leaf { 0 } else { branch.keys[sep_idx].len() };
    if sibling.used() + page.used() + extra > cap {
        return Ok((page, idx));
    }

    let merged = match (sibling, page) {
        (Page::Leaf(s), Page::Leaf(c)) => {
            let (mut a, b) = if left { (s, c) } else { (c, s) };
            a.entries.extend(b.entries);
            Page::Leaf(a)
        }
        (Page::Branch(s), Page::Branch(c)) => {
            let (mut a, mut b) = if left { (s, c) } else { (c, s) };
            if b.keys.is_empty() {
                return Err(Error::Corrupted);
            }
            b.keys[0] = branch.keys[sep_idx].clone();
            a.keys.extend(b.keys);
            a.children.extend(b.children);
            Page::Branch(a)
        }
        _ => return Err(Error::Corrupted),
    };

    w.free_page(sib_pgno)?;
    count_pages(info, leaf, -1);
    branch.children.remove(sib_idx);
    branch.keys.remove(sep_idx);
    Ok((merged, if left { idx - 1 } else { idx }))
}

/// Write a modified root-to-leaf path back, bottom up
fn rebuild<W: PageWriter>(w: &mut W, info: &mut TreeInfo, mut path: Vec<PathNode>) -> Result<()> {
    let cap = page::page_capacity(w.page_size());
    let node = path.pop().ok_or(Error::Corrupted)?;
    let mut old = node.pgno;
    let mut pieces = if node.page.len() == 0 {
        Vec::new()
    } else {
        split(node.page, cap)
    };
    let mut leaf_level = true;

    while let Some(PathNode { pgno, page, idx }) = path.pop() {
        let Page::Branch(mut branch) = page else {
            return Err(Error::Corrupted);
        };
        let mut idx = idx;
        if pieces.len() == 1 && pieces[0].page.used() < cap / 4 && branch.children.len() > 1 {
            let Piece { sep, page } = pieces.remove(0);
            let (page, at) = merge_sibling(w, info, &mut branch, idx, page, cap, leaf_level)?;
            pieces.push(Piece { sep, page });
            idx = at;
        }
        let written = write_pieces(w, info, old, pieces, leaf_level)?;
        splice(&mut branch, idx, written);
        pieces = if branch.children.is_empty() {
            Vec::new()
        } else {
            split(Page::Branch(branch), cap)
        };
        old = pgno;
        leaf_level = false;
    }

    let mut written = write_pieces(w, info, old, pieces, leaf_level)?;
    if written.is_empty() {
        info.root = 0;
        info.depth = 0;
        return Ok(());
    }
    while written.len() > 1 {
        let (keys, children): (Vec<_>, Vec<_>) = written.into_iter().unzip();
        info.depth += 1;
        written = Vec::new();
        for Piece { sep, page } in split(Page::Branch(Branch { keys, children }), cap) {
            info.branch_pages += 1;
            written.push((sep, w.put_page(None, page)?));
        }
    }
    info.root = written[0].1;
    collapse_root(w, info)
}

fn collapse_root<W: PageWriter>(w: &mut W, info: &mut TreeInfo) -> Result<()> {
    loop {
        let child = match w.page(info.root)?.as_ref() {
            Page::Branch(b) if b.children.len() == 1 => b.children[0],
            _ => return Ok(()),
        };
        w.free_page(info.root)?;
        info.branch_pages = info.branch_pages.saturating_sub(1);
        info.depth = info.depth.saturating_sub(1);
        info.root = child;
    }
}

/// Release every page of a tree, nested trees and overflow runs included
pub(crate) fn free_tree<W: PageWriter>(w: &mut W, info: &TreeInfo) -> Result<()> {
    if info.is_empty() {
        return Ok(());
    }
    free_subtree(w, info.root, 0)
}

fn free_subtree<W: PageWriter>(w: &mut W, pgno: u64, depth: usize) -> Result<()> {
    if depth >= CURSOR_STACK {
        return Err(Error::CursorFull);
    }
    match w.page(pgno)?.into_owned() {
        Page::Branch(b) => {
            for child in b.children {
                free_subtree(w, child, depth + 1)?;
            }
        }
        Page::Leaf(l) => {
            for entry in l.entries {
                match entry.data {
                    NodeData::Overflow { pgno, len } => w.free_overflow(pgno, len)?,
                    NodeData::SubTree(sub) => free_tree(w, &sub)?,
                    NodeData::Inline(_) => {}
                }
            }
        }
    }
    w.free_page(pgno)
}

/// Copy a tree into `sink`, renumbering pages in post-order. Catalog trees
/// carry table records whose trees are copied along.
pub(crate) fn copy_tree<S: PageSource, K: PageSink>(
    src: &S,
    info: &TreeInfo,
    sink: &mut K,
    catalog: bool,
) -> Result<TreeInfo> {
    if info.is_empty() {
        return Ok(*info);
    }
    let root = copy_subtree(src, info.root, sink, catalog, 0)?;
    Ok(TreeInfo { root, ..*info })
}

fn copy_subtree<S: PageSource, K: PageSink>(
    src: &S,
    pgno: u64,
    sink: &mut K,
    catalog: bool,
    depth: usize,
) -> Result<u64> {
    if depth >= CURSOR_STACK {
        return Err(Error::CursorFull);
    }
    let mut page = src.page(pgno)?.into_owned();
    match &mut page {
        Page::Branch(b) => {
            for child in b.children.iter_mut() {
                *child = copy_subtree(src, *child, sink, catalog, depth + 1)?;
            }
        }
        Page::Leaf(l) => {
            for entry in l.entries.iter_mut() {
                match &mut entry.data {
                    NodeData::Overflow { pgno, len } => {
                        let data = src.overflow(*pgno, *len as usize)?;
                        *pgno = sink.append_overflow(&data)?;
                    }
                    NodeData::SubTree(sub) => {
                        let copied = copy_tree(src, sub, sink, false)?;
                        *sub = copied;
                    }
                    NodeData::Inline(value) if catalog => {
                        let mut record = TableRecord::decode(value)?;
                        record.tree = copy_tree(src, &record.tree, sink, false)?;
                        *value = record.encode()?;
                    }
                    NodeData::Inline(_) => {}
                }
            }
        }
    }
    sink.append(&page)
}

/// How a value-level put treats existing data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PutMode {
    /// Fail if the key exists at all
    InsertKey,
    /// Fail if the key (or, with duplicates, the key/value pair) exists
    Insert,
    /// Insert or overwrite
    Upsert,
    /// Overwrite the single existing value
    Update,
}

/// A table's tree seen at the key/value level: values may live inline, in
/// overflow pages, or as a nested tree of sorted duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TableTree {
    pub(crate) flags: DbFlags,
    pub(crate) info: TreeInfo,
}

impl TableTree {
    pub(crate) fn new(flags: DbFlags, info: TreeInfo) -> Self {
        TableTree { flags, info }
    }

    pub(crate) fn key_order(&self) -> KeyOrder {
        if self.flags.contains(DbFlags::INTEGERKEY) {
            KeyOrder::Integer
        } else if self.flags.contains(DbFlags::REVERSEKEY) {
            KeyOrder::Reverse
        } else {
            KeyOrder::Lexical
        }
    }

    pub(crate) fn is_dupsort(&self) -> bool {
        self.flags.contains(DbFlags::DUPSORT)
    }

    /// Ordering of values under one key
    pub(crate) fn value_order(&self) -> KeyOrder {
        if !self.is_dupsort() {
            KeyOrder::Lexical
        } else if self.flags.contains(DbFlags::INTEGERDUP) {
            KeyOrder::Integer
        } else if self.flags.contains(DbFlags::REVERSEDUP) {
            KeyOrder::Reverse
        } else {
            KeyOrder::Lexical
        }
    }

    fn fixed_values(&self) -> bool {
        self.flags.intersects(DbFlags::DUPFIXED | DbFlags::INTEGERDUP)
    }

    pub(crate) fn check_key(&self, psize: usize, key: &[u8]) -> Result<()> {
        if key.len() > page::max_key_size(psize) {
            return Err(Error::BadValSize);
        }
        self.key_order().check(key)
    }

    pub(crate) fn check_value(&self, psize: usize, value: &[u8]) -> Result<()> {
        if self.is_dupsort() {
            if value.len() > page::max_key_size(psize) {
                return Err(Error::BadValSize);
            }
            self.value_order().check(value)?;
        } else if value.len() as u64 > u32::MAX as u64 {
            return Err(Error::BadValSize);
        }
        Ok(())
    }

    fn entry<S: PageSource>(&self, src: &S, key: &[u8]) -> Result<Option<NodeData>> {
        get(src, &self.info, self.key_order(), key)
    }

    fn load_value<S: PageSource>(src: &S, data: &NodeData) -> Result<Vec<u8>> {
        match data {
            NodeData::Inline(v) => Ok(v.clone()),
            NodeData::Overflow { pgno, len } => Ok(src.overflow(*pgno, *len as usize)?.into_owned()),
            NodeData::SubTree(_) => Err(Error::Incompatible),
        }
    }

    fn count_of(data: &NodeData) -> u64 {
        match data {
            NodeData::SubTree(sub) => sub.entries,
            _ => 1,
        }
    }

    /// Position among the values of one entry
    pub(crate) fn value_seek<S: PageSource>(
        &self,
        src: &S,
        data: &NodeData,
        target: Seek<'_>,
    ) -> Result<Option<Vec<u8>>> {
        let order = self.value_order();
        if let NodeData::SubTree(sub) = data {
            return Ok(seek(src, sub, order, target)?.map(|e| e.key));
        }
        let value = Self::load_value(src, data)?;
        let hit = match target {
            Seek::First | Seek::Last => true,
            Seek::Ge(x) => order.compare(&value, x) != Ordering::Less,
            Seek::Gt(x) => order.compare(&value, x) == Ordering::Greater,
            Seek::Lt(x) => order.compare(&value, x) == Ordering::Less,
        };
        Ok(hit.then_some(value))
    }

    /// First value and number of values stored under `key`
    pub(crate) fn get<S: PageSource>(&self, src: &S, key: &[u8]) -> Result<Option<(Vec<u8>, u64)>> {
        let Some(data) = self.entry(src, key)? else {
            return Ok(None);
        };
        let value = self
            .value_seek(src, &data, Seek::First)?
            .ok_or(Error::Corrupted)?;
        Ok(Some((value, Self::count_of(&data))))
    }

    /// Seek a key, returning it with its first (or last) value
    pub(crate) fn key_seek<S: PageSource>(
        &self,
        src: &S,
        target: Seek<'_>,
        last_dup: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match seek(src, &self.info, self.key_order(), target)? {
            Some(entry) => self.pair_at(src, &entry, last_dup).map(Some),
            None => Ok(None),
        }
    }

    /// Seek a key, returning the leaf it sits in and its index there
    pub(crate) fn leaf_seek<S: PageSource>(
        &self,
        src: &S,
        target: Seek<'_>,
    ) -> Result<Option<(Vec<LeafEntry>, usize)>> {
        seek_leaf(src, &self.info, self.key_order(), target)
    }

    /// Key of a leaf entry with its first (or last) value
    pub(crate) fn pair_at<S: PageSource>(
        &self,
        src: &S,
        entry: &LeafEntry,
        last_dup: bool,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let which = if last_dup { Seek::Last } else { Seek::First };
        let value = self
            .value_seek(src, &entry.data, which)?
            .ok_or(Error::Corrupted)?;
        Ok((entry.key.clone(), value))
    }

    /// Seek among the values of `key`; `None` if the key or the value is absent
    pub(crate) fn dup_seek<S: PageSource>(
        &self,
        src: &S,
        key: &[u8],
        target: Seek<'_>,
    ) -> Result<Option<Vec<u8>>> {
        match self.entry(src, key)? {
            Some(data) => self.value_seek(src, &data, target),
            None => Ok(None),
        }
    }

    /// Whether the exact pair is stored
    pub(crate) fn contains_pair<S: PageSource>(&self, src: &S, key: &[u8], value: &[u8]) -> Result<bool> {
        Ok(self
            .dup_seek(src, key, Seek::Ge(value))?
            .is_some_and(|v| self.value_order().compare(&v, value) == Ordering::Equal))
    }

    pub(crate) fn dup_count<S: PageSource>(&self, src: &S, key: &[u8]) -> Result<u64> {
        Ok(self.entry(src, key)?.map_or(0, |d| Self::count_of(&d)))
    }

    fn store_value<W: PageWriter>(&mut self, w: &mut W, key: &[u8], value: &[u8]) -> Result<NodeData> {
        let psize = w.page_size();
        if page::needs_overflow(psize, key.len(), value.len()) {
            let pgno = w.alloc_overflow(value)?;
            self.info.overflow_pages += page::overflow_pages(psize, value.len());
            Ok(NodeData::Overflow {
                pgno,
                len: value.len() as u64,
            })
        } else {
            Ok(NodeData::Inline(value.to_vec()))
        }
    }

    fn release<W: PageWriter>(&mut self, w: &mut W, data: NodeData) -> Result<()> {
        match data {
            NodeData::Overflow { pgno, len } => {
                w.free_overflow(pgno, len)?;
                let pages = page::overflow_pages(w.page_size(), len as usize);
                self.info.overflow_pages = self.info.overflow_pages.saturating_sub(pages);
            }
            NodeData::SubTree(sub) => {
                free_tree(w, &sub)?;
                self.absorb(&sub, &TreeInfo::default());
            }
            NodeData::Inline(_) => {}
        }
        Ok(())
    }

    /// Carry page count changes of a nested tree into the table's counters
    fn absorb(&mut self, before: &TreeInfo, after: &TreeInfo) {
        let adjust = |total: u64, was: u64, now: u64| (total + now).saturating_sub(was);
        self.info.leaf_pages = adjust(self.info.leaf_pages, before.leaf_pages, after.leaf_pages);
        self.info.branch_pages =
            adjust(self.info.branch_pages, before.branch_pages, after.branch_pages);
    }

    /// Integer keys must all have the same width
    fn check_uniform_key<S: PageSource>(&self, src: &S, key: &[u8]) -> Result<()> {
        if self.key_order() != KeyOrder::Integer {
            return Ok(());
        }
        match seek(src, &self.info, KeyOrder::Integer, Seek::First)? {
            Some(first) if first.key.len() != key.len() => Err(Error::BadValSize),
            _ => Ok(()),
        }
    }

    fn check_uniform_value<S: PageSource>(&self, src: &S, data: &NodeData, value: &[u8]) -> Result<()> {
        if !self.fixed_values() {
            return Ok(());
        }
        match self.value_seek(src, data, Seek::First)? {
            Some(first) if first.len() != value.len() => Err(Error::BadValSize),
            _ => Ok(()),
        }
    }

    /// Store `value` under `key` according to `mode`
    pub(crate) fn put<W: PageWriter>(
        &mut self,
        w: &mut W,
        key: &[u8],
        value: &[u8],
        mode: PutMode,
    ) -> Result<()> {
        let psize = w.page_size();
        self.check_key(psize, key)?;
        self.check_value(psize, value)?;
        let order = self.key_order();
        let existing = self.entry(w, key)?;

        if !self.is_dupsort() {
            match (mode, &existing) {
                (PutMode::InsertKey | PutMode::Insert, Some(_)) => return Err(Error::KeyExist),
                (PutMode::Update, None) => return Err(Error::NotFound),
                (_, None) => self.check_uniform_key(w, key)?,
                _ => {}
            }
            let data = self.store_value(w, key, value)?;
            match put(w, &mut self.info, order, key, data)? {
                Some(old) => self.release(w, old)?,
                None => self.info.entries += 1,
            }
            return Ok(());
        }

        let Some(data) = existing else {
            if mode == PutMode::Update {
                return Err(Error::NotFound);
            }
            self.check_uniform_key(w, key)?;
            put(w, &mut self.info, order, key, NodeData::Inline(value.to_vec()))?;
            self.info.entries += 1;
            return Ok(());
        };

        match mode {
            PutMode::InsertKey => return Err(Error::KeyExist),
            PutMode::Update => {
                if Self::count_of(&data) > 1 {
                    return Err(Error::MultipleValues);
                }
                self.check_uniform_value(w, &data, value)?;
                put(w, &mut self.info, order, key, NodeData::Inline(value.to_vec()))?;
                return Ok(());
            }
            PutMode::Insert | PutMode::Upsert => {}
        }

        if self.contains_pair(w, key, value)? {
            return match mode {
                PutMode::Insert => Err(Error::KeyExist),
                _ => Ok(()),
            };
        }
        self.check_uniform_value(w, &data, value)?;

        let dup_order = self.value_order();
        let before = match &data {
            NodeData::SubTree(sub) => *sub,
            _ => TreeInfo::default(),
        };
        let mut sub = match data {
            NodeData::Inline(first) => {
                let mut sub = TreeInfo::default();
                put(w, &mut sub, dup_order, &first, NodeData::Inline(Vec::new()))?;
                sub.entries = 1;
                sub
            }
            NodeData::SubTree(sub) => sub,
            NodeData::Overflow { .. } => return Err(Error::Corrupted),
        };
        put(w, &mut sub, dup_order, value, NodeData::Inline(Vec::new()))?;
        sub.entries += 1;
        self.absorb(&before, &sub);
        put(w, &mut self.info, order, key, NodeData::SubTree(sub))?;
        self.info.entries += 1;
        Ok(())
    }

    /// Remove `key` and all its values
    pub(crate) fn erase_key<W: PageWriter>(&mut self, w: &mut W, key: &[u8]) -> Result<bool> {
        let order = self.key_order();
        let Some(data) = delete(w, &mut self.info, order, key)? else {
            return Ok(false);
        };
        self.info.entries = self.info.entries.saturating_sub(Self::count_of(&data));
        self.release(w, data)?;
        Ok(true)
    }

    /// Remove one key/value pair
    pub(crate) fn erase_pair<W: PageWriter>(&mut self, w: &mut W, key: &[u8], value: &[u8]) -> Result<bool> {
        let order = self.key_order();
        let Some(data) = self.entry(w, key)? else {
            return Ok(false);
        };

        let NodeData::SubTree(mut sub) = data else {
            let stored = Self::load_value(w, &data)?;
            if self.value_order().compare(&stored, value) != Ordering::Equal {
                return Ok(false);
            }
            return self.erase_key(w, key);
        };

        let before = sub;
        let dup_order = self.value_order();
        if delete(w, &mut sub, dup_order, value)?.is_none() {
            return Ok(false);
        }
        sub.entries = sub.entries.saturating_sub(1);
        if sub.entries <= 1 {
            let last = seek(w, &sub, dup_order, Seek::First)?.ok_or(Error::Corrupted)?;
            free_tree(w, &sub)?;
            self.absorb(&before, &TreeInfo::default());
            put(w, &mut self.info, order, key, NodeData::Inline(last.key))?;
        } else {
            self.absorb(&before, &sub);
            put(w, &mut self.info, order, key, NodeData::SubTree(sub))?;
        }
        self.info.entries = self.info.entries.saturating_sub(1);
        Ok(true)
    }

    /// Drop every entry, keeping the table's flags
    pub(crate) fn clear<W: PageWriter>(&mut self, w: &mut W) -> Result<()> {
        free_tree(w, &self.info)?;
        self.info = TreeInfo {
            flags: self.info.flags,
            ..Default::default()
        };
        Ok(())
    }
}
