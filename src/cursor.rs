use crate::btree::{PutMode, Seek, TableTree};
use crate::constants::WriteFlags;
use crate::database::{self, Database};
use crate::error::{Error, Result};
use crate::page::LeafEntry;
use crate::transaction::{Transaction, View};
use crate::types::CursorOp;

/// A key/value pair returned by cursor moves
pub type Pair = (Vec<u8>, Vec<u8>);

/// Ordered traversal over one table.
///
/// A cursor remembers the pair it sits on together with the leaf it was
/// found in. Steps stay inside that leaf while the transaction is unchanged;
/// after a write, or at a leaf boundary, the cursor finds its way back by
/// comparison, so writes through the same transaction never leave it
/// dangling. It is bound to one transaction; passing any other gives
/// `BadTxn` until [`Cursor::renew`] rebinds it.
#[derive(Debug, Clone)]
pub struct Cursor {
    db: Database,
    /// Serial of the bound transaction
    serial: u64,
    /// Current pair, `None` when unpositioned
    pos: Option<Pair>,
    /// A forward move ran off the end
    past_end: bool,
    leaf: Option<LeafCache>,
    /// Transaction serial and generation `leaf` was read at
    leaf_stamp: (u64, u64),
}

/// Entries of the leaf the cursor last landed in
#[derive(Debug, Clone)]
struct LeafCache {
    entries: Vec<LeafEntry>,
    idx: usize,
}

impl LeafCache {
    /// The remembered entry, if it is the one for `key`
    fn entry<'c>(cache: &'c Option<LeafCache>, key: &[u8]) -> Option<&'c LeafEntry> {
        cache
            .as_ref()
            .and_then(|c| c.entries.get(c.idx))
            .filter(|e| e.key == key)
    }
}

impl Cursor {
    /// Open a cursor on `db` bound to `txn`
    pub fn open(txn: &Transaction, db: Database) -> Result<Cursor> {
        txn.check_live()?;
        txn.env_inner()?.check_handle(&db)?;
        Ok(Cursor {
            db,
            serial: txn.serial(),
            pos: None,
            past_end: false,
            leaf: None,
            leaf_stamp: (0, 0),
        })
    }

    /// Table this cursor walks
    pub fn database(&self) -> Database {
        self.db
    }

    fn bind<'t>(&self, txn: &'t Transaction) -> Result<(TableTree, View<'t>)> {
        if txn.serial() != self.serial {
            return Err(Error::BadTxn);
        }
        let tree = txn.table(&self.db)?;
        Ok((tree, txn.view()?))
    }

    fn position(&self) -> Result<&Pair> {
        self.pos.as_ref().ok_or(Error::Invalid)
    }

    /// Move as directed by `op`. A miss returns `None`, or `NotFound` when
    /// `throw_on_not_found` is set.
    pub fn move_to(
        &mut self,
        txn: &Transaction,
        op: CursorOp,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        throw_on_not_found: bool,
    ) -> Result<Option<Pair>> {
        if (op.needs_key() && key.is_none()) || (op.needs_value() && value.is_none()) {
            return Err(Error::Invalid);
        }
        let (tree, view) = self.bind(txn)?;
        let stamp = (txn.serial(), txn.generation());
        let fresh = self.leaf_stamp == stamp;
        let mut leaf = self.leaf.take().filter(|_| fresh);
        let found = self.locate(&tree, &view, op, key, value, &mut leaf);
        self.leaf = leaf;
        self.leaf_stamp = stamp;
        match found? {
            Some(pair) => {
                self.pos = Some(pair.clone());
                self.past_end = false;
                Ok(Some(pair))
            }
            None => {
                self.miss(op);
                if throw_on_not_found {
                    Err(Error::NotFound)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Move without arguments, reporting a miss as `None`
    pub fn get(&mut self, txn: &Transaction, op: CursorOp) -> Result<Option<Pair>> {
        self.move_to(txn, op, None, None, false)
    }

    fn miss(&mut self, op: CursorOp) {
        match op {
            CursorOp::Next | CursorOp::NextNoDup | CursorOp::First | CursorOp::Last => {
                self.pos = None;
                self.past_end = true;
            }
            CursorOp::Set
            | CursorOp::SetKey
            | CursorOp::SetRange
            | CursorOp::GetBoth
            | CursorOp::GetBothRange => {
                self.pos = None;
                self.past_end = false;
            }
            // dup moves, backward moves and GetCurrent stay put
            _ => {}
        }
    }

    fn locate(
        &self,
        tree: &TableTree,
        view: &View<'_>,
        op: CursorOp,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        leaf: &mut Option<LeafCache>,
    ) -> Result<Option<Pair>> {
        let key = key.unwrap_or_default();
        let value = value.unwrap_or_default();

        Ok(match op {
            CursorOp::First => seek_key(tree, view, Seek::First, false, leaf)?,
            CursorOp::Last => seek_key(tree, view, Seek::Last, true, leaf)?,
            CursorOp::Next => match &self.pos {
                Some((k, v)) => match dup_step(tree, view, leaf, k, Seek::Gt(v))? {
                    Some(next) => Some((k.clone(), next)),
                    None => step_key(tree, view, leaf, k, true)?,
                },
                None if self.past_end => None,
                None => seek_key(tree, view, Seek::First, false, leaf)?,
            },
            CursorOp::Prev => match &self.pos {
                Some((k, v)) => match dup_step(tree, view, leaf, k, Seek::Lt(v))? {
                    Some(prev) => Some((k.clone(), prev)),
                    None => step_key(tree, view, leaf, k, false)?,
                },
                None => seek_key(tree, view, Seek::Last, true, leaf)?,
            },
            CursorOp::NextNoDup => match &self.pos {
                Some((k, _)) => step_key(tree, view, leaf, k, true)?,
                None if self.past_end => None,
                None => seek_key(tree, view, Seek::First, false, leaf)?,
            },
            CursorOp::PrevNoDup => match &self.pos {
                Some((k, _)) => step_key(tree, view, leaf, k, false)?,
                None => seek_key(tree, view, Seek::Last, true, leaf)?,
            },
            CursorOp::FirstDup => {
                let (k, _) = self.position()?;
                with_key(k, tree.dup_seek(view, k, Seek::First)?)
            }
            CursorOp::LastDup => {
                let (k, _) = self.position()?;
                with_key(k, tree.dup_seek(view, k, Seek::Last)?)
            }
            CursorOp::NextDup => {
                let (k, v) = self.position()?;
                with_key(k, dup_step(tree, view, leaf, k, Seek::Gt(v))?)
            }
            CursorOp::PrevDup => {
                let (k, v) = self.position()?;
                with_key(k, dup_step(tree, view, leaf, k, Seek::Lt(v))?)
            }
            CursorOp::GetCurrent => {
                let (k, v) = self.position()?;
                if tree.is_dupsort() {
                    tree.contains_pair(view, k, v)?.then(|| (k.clone(), v.clone()))
                } else {
                    with_key(k, tree.get(view, k)?.map(|(v, _)| v))
                }
            }
            CursorOp::Set | CursorOp::SetKey => with_key(key, tree.get(view, key)?.map(|(v, _)| v)),
            CursorOp::SetRange => seek_key(tree, view, Seek::Ge(key), false, leaf)?,
            CursorOp::GetBoth => tree
                .contains_pair(view, key, value)?
                .then(|| (key.to_vec(), value.to_vec())),
            CursorOp::GetBothRange => with_key(key, tree.dup_seek(view, key, Seek::Ge(value))?),
        })
    }

    pub fn first(&mut self, txn: &Transaction) -> Result<Option<Pair>> {
        self.get(txn, CursorOp::First)
    }

    pub fn last(&mut self, txn: &Transaction) -> Result<Option<Pair>> {
        self.get(txn, CursorOp::Last)
    }

    pub fn next(&mut self, txn: &Transaction) -> Result<Option<Pair>> {
        self.get(txn, CursorOp::Next)
    }

    pub fn prev(&mut self, txn: &Transaction) -> Result<Option<Pair>> {
        self.get(txn, CursorOp::Prev)
    }

    /// Position at `key` exactly
    pub fn set(&mut self, txn: &Transaction, key: &[u8]) -> Result<Option<Pair>> {
        self.move_to(txn, CursorOp::Set, Some(key), None, false)
    }

    /// Position at the first key not less than `key`
    pub fn lower_bound(&mut self, txn: &Transaction, key: &[u8]) -> Result<Option<Pair>> {
        self.move_to(txn, CursorOp::SetRange, Some(key), None, false)
    }

    /// Not positioned on any pair
    pub fn eof(&self) -> bool {
        self.pos.is_none()
    }

    /// Positioned on the first pair of the table
    pub fn on_first(&self, txn: &Transaction) -> Result<bool> {
        self.is_at(txn, Seek::First, false)
    }

    /// Positioned on the last pair of the table
    pub fn on_last(&self, txn: &Transaction) -> Result<bool> {
        self.is_at(txn, Seek::Last, true)
    }

    fn is_at(&self, txn: &Transaction, target: Seek<'_>, last_dup: bool) -> Result<bool> {
        let (tree, view) = self.bind(txn)?;
        let Some(pos) = &self.pos else {
            return Ok(false);
        };
        Ok(tree.key_seek(&view, target, last_dup)?.as_ref() == Some(pos))
    }

    /// Number of values under the current key
    pub fn count(&self, txn: &Transaction) -> Result<u64> {
        let (tree, view) = self.bind(txn)?;
        let (k, _) = self.position()?;
        tree.dup_count(&view, k)
    }

    fn write(&mut self, txn: &mut Transaction, key: &[u8], value: &[u8], mode: PutMode) -> Result<()> {
        if txn.serial() != self.serial {
            return Err(Error::BadTxn);
        }
        self.db.put_mode(txn, key, value, mode)?;
        self.pos = Some((key.to_vec(), value.to_vec()));
        self.past_end = false;
        Ok(())
    }

    /// Store a pair as directed by write flags and move onto it. `CURRENT`
    /// overwrites the pair under the cursor and needs `key` to match it.
    pub fn put(&mut self, txn: &mut Transaction, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        if flags.contains(WriteFlags::CURRENT) && !flags.contains(WriteFlags::NOOVERWRITE) {
            let (k, _) = self.position()?;
            if k.as_slice() != key {
                return Err(Error::KeyMismatch);
            }
            return self.put_current(txn, value);
        }
        self.write(txn, key, value, database::put_mode(flags)?)
    }

    pub fn insert(&mut self, txn: &mut Transaction, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(txn, key, value, PutMode::Insert)
    }

    pub fn upsert(&mut self, txn: &mut Transaction, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(txn, key, value, PutMode::Upsert)
    }

    pub fn update(&mut self, txn: &mut Transaction, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(txn, key, value, PutMode::Update)
    }

    /// Replace the value of the pair under the cursor
    pub fn put_current(&mut self, txn: &mut Transaction, value: &[u8]) -> Result<()> {
        if txn.serial() != self.serial {
            return Err(Error::BadTxn);
        }
        let (k, v) = self.position()?.clone();
        let dupsort = txn.table(&self.db)?.is_dupsort();
        if dupsort {
            self.db.replace_duplicate(txn, &k, &v, Some(value))?;
        } else {
            self.db.put_mode(txn, &k, value, PutMode::Update)?;
        }
        self.pos = Some((k, value.to_vec()));
        Ok(())
    }

    /// Erase the pair under the cursor, or every value of its key with
    /// `all_dups`. The next forward move lands on the following pair.
    pub fn erase(&mut self, txn: &mut Transaction, all_dups: bool) -> Result<bool> {
        if txn.serial() != self.serial {
            return Err(Error::BadTxn);
        }
        let (k, v) = self.position()?.clone();
        if all_dups {
            self.db.erase(txn, &k)
        } else {
            self.db.erase_pair(txn, &k, &v)
        }
    }

    /// Bind to another transaction of the same environment, unpositioned
    pub fn renew(&mut self, txn: &Transaction) -> Result<()> {
        txn.check_live()?;
        txn.env_inner()?.check_handle(&self.db)?;
        self.serial = txn.serial();
        self.pos = None;
        self.past_end = false;
        self.leaf = None;
        Ok(())
    }

    pub fn close(self) {}

    /// Every pair from the first on
    pub fn iter<'c, 't, 'p>(&'c mut self, txn: &'t Transaction<'p>) -> Iter<'c, 't, 'p> {
        Iter::new(self, txn, CursorOp::First, None, CursorOp::Next)
    }

    /// Every pair from the first key not less than `key`
    pub fn iter_from<'c, 't, 'p>(&'c mut self, txn: &'t Transaction<'p>, key: &[u8]) -> Iter<'c, 't, 'p> {
        Iter::new(self, txn, CursorOp::SetRange, Some(key), CursorOp::Next)
    }

    /// Every value stored under `key`
    pub fn iter_dup<'c, 't, 'p>(&'c mut self, txn: &'t Transaction<'p>, key: &[u8]) -> Iter<'c, 't, 'p> {
        Iter::new(self, txn, CursorOp::Set, Some(key), CursorOp::NextDup)
    }
}

/// Seek a key and remember the leaf it was found in
fn seek_key(
    tree: &TableTree,
    view: &View<'_>,
    target: Seek<'_>,
    last_dup: bool,
    leaf: &mut Option<LeafCache>,
) -> Result<Option<Pair>> {
    *leaf = None;
    let Some((entries, idx)) = tree.leaf_seek(view, target)? else {
        return Ok(None);
    };
    let pair = tree.pair_at(view, &entries[idx], last_dup)?;
    *leaf = Some(LeafCache { entries, idx });
    Ok(Some(pair))
}

/// Move to the neighbouring key, inside the remembered leaf when possible
fn step_key(
    tree: &TableTree,
    view: &View<'_>,
    leaf: &mut Option<LeafCache>,
    key: &[u8],
    forward: bool,
) -> Result<Option<Pair>> {
    if LeafCache::entry(leaf, key).is_some() {
        if let Some(cache) = leaf.as_mut() {
            let next = if forward { Some(cache.idx + 1) } else { cache.idx.checked_sub(1) };
            if let Some(idx) = next.filter(|i| *i < cache.entries.len()) {
                cache.idx = idx;
                return tree.pair_at(view, &cache.entries[idx], !forward).map(Some);
            }
        }
    }
    let target = if forward { Seek::Gt(key) } else { Seek::Lt(key) };
    seek_key(tree, view, target, !forward, leaf)
}

/// Seek among the values of `key`, reading its entry from the remembered leaf
fn dup_step(
    tree: &TableTree,
    view: &View<'_>,
    leaf: &Option<LeafCache>,
    key: &[u8],
    target: Seek<'_>,
) -> Result<Option<Vec<u8>>> {
    if !tree.is_dupsort() {
        return Ok(None);
    }
    match LeafCache::entry(leaf, key) {
        Some(entry) => tree.value_seek(view, &entry.data, target),
        None => tree.dup_seek(view, key, target),
    }
}

fn with_key(key: &[u8], value: Option<Vec<u8>>) -> Option<Pair> {
    value.map(|v| (key.to_vec(), v))
}

/// Iterator over cursor moves
#[derive(Debug)]
pub struct Iter<'c, 't, 'p> {
    cursor: &'c mut Cursor,
    txn: &'t Transaction<'p>,
    /// Outcome of the positioning move, taken by the first `next`
    start: Option<Result<Option<Pair>>>,
    step: CursorOp,
    done: bool,
}

impl<'c, 't, 'p> Iter<'c, 't, 'p> {
    fn new(
        cursor: &'c mut Cursor,
        txn: &'t Transaction<'p>,
        op: CursorOp,
        key: Option<&[u8]>,
        step: CursorOp,
    ) -> Self {
        let start = cursor.move_to(txn, op, key, None, false);
        Iter {
            cursor,
            txn,
            start: Some(start),
            step,
            done: false,
        }
    }
}

impl Iterator for Iter<'_, '_, '_> {
    type Item = Result<Pair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let moved = match self.start.take() {
            Some(start) => start,
            None => self.cursor.get(self.txn, self.step),
        };
        match moved {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
