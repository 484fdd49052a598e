use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use log::{debug, trace, warn};
use memmap2::Mmap;
use parking_lot::{Condvar, Mutex};

use crate::btree::{self, PageSource, PageWriter, Seek, TableTree};
use crate::config::{Durability, GcPolicy, KeyOrder};
use crate::constants::{DbFlags, MetaFlags, TransactionFlags, META_PAGES};
use crate::database::{Database, TableSlot, MAIN_DBI};
use crate::env::{EnvInner, Environment};
use crate::error::{Error, Result};
use crate::meta::{Meta, TableRecord, TreeInfo};
use crate::midl::Idl;
use crate::page::{self, NodeData, Page};
use crate::snapshot::{oldest_snapshot, FreeList};
use crate::store::page_bytes;

/// Free-list key for pages no snapshot references at all
const SPARE_TXNID: u64 = 0;

/// The environment's single writer slot
#[derive(Debug, Default)]
pub(crate) struct WriterLock {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

impl WriterLock {
    /// Become the writer, waiting for the current one if `blocking`
    pub(crate) fn acquire(&self, thread: ThreadId, blocking: bool) -> Result<()> {
        let mut owner = self.owner.lock();
        loop {
            match *owner {
                None => {
                    *owner = Some(thread);
                    return Ok(());
                }
                Some(current) if current == thread => return Err(Error::OverlappingTransactions),
                Some(_) if !blocking => return Err(Error::Busy),
                Some(_) => self.released.wait(&mut owner),
            }
        }
    }

    pub(crate) fn release(&self) {
        *self.owner.lock() = None;
        self.released.notify_one();
    }

    pub(crate) fn is_held(&self) -> bool {
        self.owner.lock().is_some()
    }
}

/// Committed pages as seen through one mapping
#[derive(Debug, Clone)]
pub(crate) struct MapView {
    map: Arc<Mmap>,
    psize: usize,
}

impl MapView {
    pub(crate) fn new(map: Arc<Mmap>, psize: usize) -> Self {
        MapView { map, psize }
    }

    pub(crate) fn map(&self) -> &Mmap {
        &self.map
    }
}

impl PageSource for MapView {
    fn page_size(&self) -> usize {
        self.psize
    }

    fn page(&self, pgno: u64) -> Result<Cow<'_, Page>> {
        if pgno < META_PAGES {
            return Err(Error::Corrupted);
        }
        let bytes = page_bytes(&self.map, self.psize, pgno, 1)?;
        Ok(Cow::Owned(Page::decode(bytes, pgno)?))
    }

    fn overflow(&self, pgno: u64, len: usize) -> Result<Cow<'_, [u8]>> {
        let pages = page::overflow_pages(self.psize, len);
        let bytes = page_bytes(&self.map, self.psize, pgno, pages)?;
        Ok(Cow::Owned(page::decode_overflow(bytes, pgno, len)?))
    }
}

/// Pages visible to a transaction
pub(crate) enum View<'a> {
    Snapshot(&'a MapView),
    Write(&'a WriteTxn),
}

impl PageSource for View<'_> {
    fn page_size(&self) -> usize {
        match self {
            View::Snapshot(v) => v.page_size(),
            View::Write(w) => w.page_size(),
        }
    }

    fn page(&self, pgno: u64) -> Result<Cow<'_, Page>> {
        match self {
            View::Snapshot(v) => v.page(pgno),
            View::Write(w) => w.page(pgno),
        }
    }

    fn overflow(&self, pgno: u64, len: usize) -> Result<Cow<'_, [u8]>> {
        match self {
            View::Snapshot(v) => v.overflow(pgno, len),
            View::Write(w) => w.overflow(pgno, len),
        }
    }
}

/// Look up a table's catalog record
pub(crate) fn load_record<S: PageSource>(
    src: &S,
    catalog: &TreeInfo,
    name: &[u8],
) -> Result<Option<TableRecord>> {
    match btree::get(src, catalog, KeyOrder::Lexical, name)? {
        Some(NodeData::Inline(bytes)) => Ok(Some(TableRecord::decode(&bytes)?)),
        Some(_) => Err(Error::Corrupted),
        None => Ok(None),
    }
}

/// Every table record in the catalog, in name order
pub(crate) fn catalog_records<S: PageSource>(src: &S, catalog: &TreeInfo) -> Result<Vec<(Vec<u8>, TableRecord)>> {
    let mut records = Vec::new();
    let mut next = btree::seek(src, catalog, KeyOrder::Lexical, Seek::First)?;
    while let Some(entry) = next {
        let NodeData::Inline(bytes) = &entry.data else {
            return Err(Error::Corrupted);
        };
        records.push((entry.key.clone(), TableRecord::decode(bytes)?));
        next = btree::seek(src, catalog, KeyOrder::Lexical, Seek::Gt(&entry.key))?;
    }
    Ok(records)
}

fn load_table<S: PageSource>(src: &S, catalog: &TreeInfo, dbi: u32, slot: &TableSlot) -> Result<TableTree> {
    match load_record(src, catalog, &slot.name)? {
        Some(record) => Ok(TableTree::new(record.flags, record.tree)),
        None if dbi == MAIN_DBI => Ok(TableTree::new(slot.flags, TreeInfo::default())),
        None => Err(Error::BadDbi),
    }
}

#[derive(Debug, Clone)]
struct TableState {
    name: Vec<u8>,
    tree: TableTree,
    dirty: bool,
}

/// Private state of a write transaction
#[derive(Debug, Clone)]
pub(crate) struct WriteTxn {
    env: Arc<EnvInner>,
    /// Pages of the snapshot this transaction builds on
    base: MapView,
    /// Meta under construction
    pub(crate) meta: Meta,
    /// Modified tree pages
    dirty: HashMap<u64, Page>,
    /// Modified overflow runs
    dirty_overflow: HashMap<u64, Vec<u8>>,
    /// Pages held in `dirty` and `dirty_overflow`
    dirty_pages: usize,
    dirty_limit: usize,
    /// Free-list records not yet reclaimed
    gc: FreeList,
    /// Pages holding the committed free-list chain
    gc_chain: Vec<u64>,
    /// Reclaimed pages ready for reuse
    reclaimed: Idl,
    /// Dirty pages freed again, reusable at once
    loose: Idl,
    /// Committed pages this transaction stopped referencing
    freed: Idl,
    /// Records freed before this txn id may be reclaimed
    oldest: u64,
    policy: GcPolicy,
    tables: BTreeMap<u32, TableState>,
    /// Handles registered by this transaction
    created: Vec<u32>,
    /// Handles deleted by this transaction
    dropped: Vec<u32>,
    /// Anything to commit
    changed: bool,
    /// Bumped on every mutable access
    generation: u64,
}

impl WriteTxn {
    fn begin(env: &Arc<EnvInner>, durability: Durability) -> Result<Self> {
        let (meta, steady_txnid, map) = {
            let head = env.head.read();
            (head.meta.clone(), head.steady_txnid, env.store.map())
        };
        let psize = meta.page_size();
        let (gc, gc_chain) = FreeList::load(&map, psize, meta.gc_root)?;
        let pinned = (durability != Durability::NoSync).then_some(steady_txnid + 1);
        let oldest = oldest_snapshot(meta.txnid + 1, env.readers.oldest(), pinned);
        let config = env.config.read();

        let mut next = meta.clone();
        next.txnid = meta.txnid + 1;
        Ok(WriteTxn {
            env: Arc::clone(env),
            base: MapView::new(map, psize),
            meta: next,
            dirty: HashMap::new(),
            dirty_overflow: HashMap::new(),
            dirty_pages: 0,
            dirty_limit: config.dirty_page_limit,
            gc,
            gc_chain,
            reclaimed: Idl::new(),
            loose: Idl::new(),
            freed: Idl::new(),
            oldest,
            policy: env.policy,
            tables: BTreeMap::new(),
            created: Vec::new(),
            dropped: Vec::new(),
            changed: false,
            generation: 0,
        })
    }

    pub(crate) fn txnid(&self) -> u64 {
        self.meta.txnid
    }

    pub(crate) fn table(&self, dbi: u32, slot: &TableSlot) -> Result<TableTree> {
        match self.tables.get(&dbi) {
            Some(state) => Ok(state.tree),
            None => load_table(self, &self.meta.catalog, dbi, slot),
        }
    }

    /// Record a table as modified
    pub(crate) fn store_table(&mut self, dbi: u32, name: Vec<u8>, tree: TableTree) {
        self.changed = true;
        self.tables.insert(
            dbi,
            TableState {
                name,
                tree,
                dirty: true,
            },
        );
    }

    /// Catalog record of `name`, including tables changed in this transaction
    pub(crate) fn record(&self, name: &[u8]) -> Result<Option<TableRecord>> {
        if let Some(state) = self.tables.values().find(|s| s.name == name) {
            return Ok(Some(TableRecord {
                flags: state.tree.flags,
                tree: state.tree.info,
            }));
        }
        load_record(self, &self.meta.catalog, name)
    }

    /// Start an empty table under a freshly registered handle
    pub(crate) fn create_table(&mut self, dbi: u32, name: Vec<u8>, flags: DbFlags, registered: bool) {
        if registered {
            self.created.push(dbi);
        }
        self.dropped.retain(|d| *d != dbi);
        self.store_table(dbi, name, TableTree::new(flags, TreeInfo::default()));
    }

    /// Empty a table, and delete it from the catalog if `delete`
    pub(crate) fn drop_table(&mut self, dbi: u32, slot: &TableSlot, delete: bool) -> Result<()> {
        let mut tree = self.table(dbi, slot)?;
        tree.clear(self)?;
        if !delete || dbi == MAIN_DBI {
            self.store_table(dbi, slot.name.clone(), tree);
            return Ok(());
        }
        self.tables.remove(&dbi);
        let mut catalog = self.meta.catalog;
        btree::delete(self, &mut catalog, KeyOrder::Lexical, &slot.name)?;
        self.meta.catalog = catalog;
        self.dropped.push(dbi);
        self.changed = true;
        Ok(())
    }

    fn take_from(idl: &mut Idl, n: u64) -> Option<u64> {
        if n == 1 {
            idl.pop_first()
        } else {
            idl.take_run(n as usize)
        }
    }

    /// Reuse free pages before growing the used area
    fn alloc(&mut self, n: u64) -> Result<u64> {
        if let Some(pgno) = Self::take_from(&mut self.loose, n) {
            return Ok(pgno);
        }
        loop {
            if let Some(pgno) = Self::take_from(&mut self.reclaimed, n) {
                return Ok(pgno);
            }
            match self.gc.take_reclaimable(self.oldest, self.policy) {
                Some((txnid, pages)) => {
                    trace!("reclaimed {} pages freed by txn {}", pages.len(), txnid);
                    self.reclaimed.merge(pages.as_slice());
                }
                None => break,
            }
        }
        self.extend(n)
    }

    fn extend(&mut self, n: u64) -> Result<u64> {
        let pgno = self.meta.next_pgno;
        let end = pgno + n;
        if end * self.base.psize as u64 > self.meta.geometry.upper {
            return Err(Error::MapFull);
        }
        self.meta.next_pgno = end;
        Ok(pgno)
    }

    fn charge(&mut self, n: usize) -> Result<()> {
        if self.dirty_pages + n > self.dirty_limit {
            return Err(Error::TxnFull);
        }
        self.dirty_pages += n;
        self.changed = true;
        Ok(())
    }

    fn flush_tables(&mut self) -> Result<()> {
        let txnid = self.meta.txnid;
        let records = self
            .tables
            .values()
            .filter(|state| state.dirty)
            .map(|state| {
                let mut tree = state.tree.info;
                tree.mod_txnid = txnid;
                let record = TableRecord {
                    flags: state.tree.flags,
                    tree,
                };
                Ok((state.name.clone(), record.encode()?))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut catalog = self.meta.catalog;
        for (name, record) in records {
            btree::put(self, &mut catalog, KeyOrder::Lexical, &name, NodeData::Inline(record))?;
        }
        self.meta.catalog = catalog;
        Ok(())
    }

    /// Fold freed and unused pages into the free list and write its chain
    fn save_gc(&mut self) -> Result<Vec<(u64, Vec<u8>)>> {
        let psize = self.base.psize;
        let old_chain = mem::take(&mut self.gc_chain);
        self.freed.extend(old_chain);
        let freed = mem::take(&mut self.freed);
        self.gc.add(self.meta.txnid, freed.as_slice());

        let mut spare = mem::take(&mut self.loose);
        spare.merge(mem::take(&mut self.reclaimed).as_slice());
        self.meta.next_pgno = spare.trim_tail(self.meta.next_pgno);

        let cap = page::freelist_capacity(psize);
        let mut chain: Vec<u64> = Vec::new();
        let words = loop {
            let mut list = self.gc.clone();
            list.add(SPARE_TXNID, spare.as_slice());
            let words = list.encode_words();
            if chain.len() >= words.len().div_ceil(cap) {
                break words;
            }
            let pgno = match spare.pop_first() {
                Some(pgno) => pgno,
                None => self.extend(1)?,
            };
            chain.push(pgno);
        };

        let mut pages = Vec::with_capacity(chain.len());
        let mut chunks = words.chunks(cap);
        for (i, pgno) in chain.iter().enumerate() {
            let next = chain.get(i + 1).copied().unwrap_or(0);
            let chunk = chunks.next().unwrap_or(&[]);
            pages.push((*pgno, page::encode_freelist(*pgno, next, chunk, psize)?));
        }
        self.meta.gc_root = chain.first().copied().unwrap_or(0);
        debug!(
            "txn {} free list: {} words on {} pages",
            self.meta.txnid,
            words.len(),
            chain.len()
        );
        Ok(pages)
    }

    /// Write everything out and publish the new meta
    fn commit(mut self) -> Result<()> {
        let env = Arc::clone(&self.env);
        let psize = self.base.psize;
        self.flush_tables()?;
        let gc_pages = self.save_gc()?;

        let geometry = self.meta.geometry;
        let target = self
            .meta
            .next_pgno
            .max(geometry.now.min(geometry.upper) / psize as u64);
        env.store.ensure_pages(target, &self.meta.geometry)?;

        let mut encoded = Vec::with_capacity(self.dirty.len() + self.dirty_overflow.len() + gc_pages.len());
        for (pgno, page) in &self.dirty {
            encoded.push((*pgno, page.encode(*pgno, psize)?));
        }
        for (pgno, data) in &self.dirty_overflow {
            encoded.push((*pgno, page::encode_overflow(*pgno, data, psize)?));
        }
        encoded.extend(gc_pages);
        encoded.sort_unstable_by_key(|(pgno, _)| *pgno);
        env.store
            .write_pages(encoded.iter().map(|(pgno, bytes)| (*pgno, bytes.as_slice())))?;

        let durability = env.durability();
        if durability.syncs_data() {
            env.store.sync()?;
        }

        self.meta.flags.set(MetaFlags::STEADY, durability.writes_steady());
        self.meta.flags.set(MetaFlags::LIFO, self.policy == GcPolicy::Lifo);
        self.meta.geometry.now = env.store.file_size().min(geometry.upper);

        let mut head = env.head.write();
        let slot = head.next_slot();
        let written = env.store.write_meta(slot, &self.meta).and_then(|_| {
            if durability.syncs_meta() {
                env.store.sync()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            warn!("meta write for txn {} failed: {}", self.meta.txnid, e);
            env.mark_panicked();
            return Err(Error::Panic);
        }
        head.publish(self.meta.clone(), slot);
        drop(head);
        debug!(
            "committed txn {} to slot {} ({} pages written)",
            self.meta.txnid,
            slot,
            encoded.len()
        );

        // Never cut pages a live reader's mapping still covers
        let keep = self.meta.next_pgno.max(env.readers.pinned_pages());
        if let Err(e) = env.store.maybe_shrink(keep, &self.meta.geometry) {
            warn!("could not shrink data file: {}", e);
        }
        Ok(())
    }
}

impl PageSource for WriteTxn {
    fn page_size(&self) -> usize {
        self.base.psize
    }

    fn page(&self, pgno: u64) -> Result<Cow<'_, Page>> {
        match self.dirty.get(&pgno) {
            Some(page) => Ok(Cow::Borrowed(page)),
            None => self.base.page(pgno),
        }
    }

    fn overflow(&self, pgno: u64, len: usize) -> Result<Cow<'_, [u8]>> {
        match self.dirty_overflow.get(&pgno) {
            Some(data) => Ok(Cow::Borrowed(data.as_slice())),
            None => self.base.overflow(pgno, len),
        }
    }
}

impl PageWriter for WriteTxn {
    fn is_dirty(&self, pgno: u64) -> bool {
        self.dirty.contains_key(&pgno)
    }

    fn put_page(&mut self, pgno: Option<u64>, page: Page) -> Result<u64> {
        let pgno = match pgno {
            Some(pgno) => pgno,
            None => {
                self.charge(1)?;
                self.alloc(1)?
            }
        };
        self.dirty.insert(pgno, page);
        Ok(pgno)
    }

    fn free_page(&mut self, pgno: u64) -> Result<()> {
        if self.dirty.remove(&pgno).is_some() {
            self.dirty_pages -= 1;
            self.loose.insert(pgno);
        } else {
            self.freed.insert(pgno);
        }
        Ok(())
    }

    fn alloc_overflow(&mut self, data: &[u8]) -> Result<u64> {
        let n = page::overflow_pages(self.base.psize, data.len());
        self.charge(n as usize)?;
        let pgno = self.alloc(n)?;
        self.dirty_overflow.insert(pgno, data.to_vec());
        Ok(pgno)
    }

    fn free_overflow(&mut self, pgno: u64, len: u64) -> Result<()> {
        let n = page::overflow_pages(self.base.psize, len as usize);
        let run = pgno..pgno + n;
        if self.dirty_overflow.remove(&pgno).is_some() {
            self.dirty_pages -= n as usize;
            self.loose.extend(run);
        } else {
            self.freed.extend(run);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ReadTxn {
    /// Reader slot, held across reset and renew
    slot: usize,
    view: MapView,
    meta: Meta,
}

#[derive(Debug)]
enum TxnKind<'p> {
    Read(ReadTxn),
    Write(Box<WriteTxn>),
    Nested {
        parent: &'p mut WriteTxn,
        child: Box<WriteTxn>,
    },
    Finished,
}

/// A read or write transaction.
///
/// Top-level transactions are `Transaction<'static>`; a nested write
/// transaction borrows its parent mutably for its whole life, so the parent
/// cannot be used until the child commits or aborts.
#[derive(Debug)]
pub struct Transaction<'p> {
    /// Released once the transaction finishes
    env: Option<Arc<EnvInner>>,
    /// Snapshot (read) or new (write) transaction id
    txnid: u64,
    /// Distinguishes every begin and renew, cursors bind to it
    serial: u64,
    /// Thread that began the transaction
    owner: ThreadId,
    /// Reader slot is tied to this object rather than to `owner`
    detached: bool,
    flags: TransactionFlags,
    kind: TxnKind<'p>,
}

impl Transaction<'static> {
    pub(crate) fn begin_read(env: &Arc<EnvInner>) -> Result<Self> {
        env.check_usable()?;
        let detached = env.config.read().no_tls;
        let owner = thread::current().id();
        let (meta, map, slot) = {
            let head = env.head.read();
            let slot = env
                .readers
                .acquire(&head.meta, (!detached).then_some(owner))?;
            (head.meta.clone(), env.store.map(), slot)
        };
        debug!("begin read txn {} in reader slot {}", meta.txnid, slot);
        Ok(Transaction {
            env: Some(Arc::clone(env)),
            txnid: meta.txnid,
            serial: env.next_serial(),
            owner,
            detached,
            flags: TransactionFlags::RDONLY,
            kind: TxnKind::Read(ReadTxn {
                slot,
                view: MapView::new(map, meta.page_size()),
                meta,
            }),
        })
    }

    pub(crate) fn begin_write(env: &Arc<EnvInner>, blocking: bool) -> Result<Self> {
        env.check_usable()?;
        if env.config.read().read_only {
            return Err(Error::TxnReadOnly);
        }
        let owner = thread::current().id();
        env.writer.acquire(owner, blocking)?;
        let write = match WriteTxn::begin(env, env.durability()) {
            Ok(write) => write,
            Err(e) => {
                env.writer.release();
                return Err(e);
            }
        };
        debug!("begin write txn {}", write.txnid());
        Ok(Transaction {
            env: Some(Arc::clone(env)),
            txnid: write.txnid(),
            serial: env.next_serial(),
            owner,
            detached: false,
            flags: TransactionFlags::empty(),
            kind: TxnKind::Write(Box::new(write)),
        })
    }
}

impl<'p> Transaction<'p> {
    /// Transaction id: the snapshot for readers, the id being built for writers
    pub fn id(&self) -> u64 {
        self.txnid
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(TransactionFlags::RDONLY)
    }

    pub fn is_finished(&self) -> bool {
        self.flags.contains(TransactionFlags::FINISHED)
    }

    /// Whether the transaction can now only be aborted
    pub fn is_broken(&self) -> bool {
        self.flags.contains(TransactionFlags::ERROR)
    }

    pub fn is_nested(&self) -> bool {
        self.flags.contains(TransactionFlags::NESTED)
    }

    /// Environment this transaction belongs to, until it finishes
    pub fn env(&self) -> Result<Environment> {
        Ok(Environment::from_inner(Arc::clone(self.env_inner()?)))
    }

    pub(crate) fn env_inner(&self) -> Result<&Arc<EnvInner>> {
        self.env.as_ref().ok_or(Error::BadTxn)
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    fn check_thread(&self) -> Result<()> {
        if self.detached || thread::current().id() == self.owner {
            Ok(())
        } else {
            Err(Error::ThreadMismatch)
        }
    }

    /// The transaction accepts operations
    pub(crate) fn check_live(&self) -> Result<()> {
        if self
            .flags
            .intersects(TransactionFlags::FINISHED | TransactionFlags::RESET | TransactionFlags::ERROR)
        {
            return Err(Error::BadTxn);
        }
        self.check_thread()
    }

    /// Pages visible to this transaction
    pub(crate) fn view(&self) -> Result<View<'_>> {
        self.check_live()?;
        match &self.kind {
            TxnKind::Read(r) => Ok(View::Snapshot(&r.view)),
            TxnKind::Write(w) => Ok(View::Write(w)),
            TxnKind::Nested { child, .. } => Ok(View::Write(child)),
            TxnKind::Finished => Err(Error::BadTxn),
        }
    }

    pub(crate) fn write_state(&mut self) -> Result<&mut WriteTxn> {
        self.check_live()?;
        let w = match &mut self.kind {
            TxnKind::Write(w) => w,
            TxnKind::Nested { child, .. } => child,
            TxnKind::Read(_) => return Err(Error::TxnReadOnly),
            TxnKind::Finished => return Err(Error::BadTxn),
        };
        w.generation += 1;
        Ok(w)
    }

    /// Changes whenever the transaction's pages may have changed
    pub(crate) fn generation(&self) -> u64 {
        match &self.kind {
            TxnKind::Write(w) => w.generation,
            TxnKind::Nested { child, .. } => child.generation,
            TxnKind::Read(_) | TxnKind::Finished => 0,
        }
    }

    /// Catalog of this transaction's snapshot
    pub(crate) fn catalog(&self) -> Result<TreeInfo> {
        match &self.kind {
            TxnKind::Read(r) => Ok(r.meta.catalog),
            TxnKind::Write(w) => Ok(w.meta.catalog),
            TxnKind::Nested { child, .. } => Ok(child.meta.catalog),
            TxnKind::Finished => Err(Error::BadTxn),
        }
    }

    /// Meta of this transaction's snapshot, or the one being built
    pub(crate) fn meta(&self) -> Result<&Meta> {
        match &self.kind {
            TxnKind::Read(r) => Ok(&r.meta),
            TxnKind::Write(w) => Ok(&w.meta),
            TxnKind::Nested { child, .. } => Ok(&child.meta),
            TxnKind::Finished => Err(Error::BadTxn),
        }
    }

    /// Catalog record of `name`, as this transaction sees it
    pub(crate) fn record(&self, name: &[u8]) -> Result<Option<TableRecord>> {
        self.check_live()?;
        match &self.kind {
            TxnKind::Read(r) => load_record(&r.view, &r.meta.catalog, name),
            TxnKind::Write(w) => w.record(name),
            TxnKind::Nested { child, .. } => child.record(name),
            TxnKind::Finished => Err(Error::BadTxn),
        }
    }

    /// Records of every table as this transaction sees them, including
    /// changes not yet committed
    pub(crate) fn table_records(&self) -> Result<Vec<TableRecord>> {
        let view = self.view()?;
        let mut records: BTreeMap<Vec<u8>, TableRecord> =
            catalog_records(&view, &self.catalog()?)?.into_iter().collect();
        let pending = match &self.kind {
            TxnKind::Write(w) => Some(&w.tables),
            TxnKind::Nested { child, .. } => Some(&child.tables),
            _ => None,
        };
        for state in pending.into_iter().flat_map(|t| t.values()) {
            records.insert(
                state.name.clone(),
                TableRecord {
                    flags: state.tree.flags,
                    tree: state.tree.info,
                },
            );
        }
        Ok(records.into_values().collect())
    }

    /// Mapping and meta of a read transaction's snapshot
    pub(crate) fn snapshot(&self) -> Result<(&MapView, &Meta)> {
        self.check_live()?;
        match &self.kind {
            TxnKind::Read(r) => Ok((&r.view, &r.meta)),
            _ => Err(Error::Incompatible),
        }
    }

    /// Current state of a table
    pub(crate) fn table(&self, db: &Database) -> Result<TableTree> {
        self.check_live()?;
        let slot = self.env_inner()?.check_handle(db)?;
        match &self.kind {
            TxnKind::Read(r) => load_table(&r.view, &r.meta.catalog, db.dbi(), &slot),
            TxnKind::Write(w) => w.table(db.dbi(), &slot),
            TxnKind::Nested { child, .. } => child.table(db.dbi(), &slot),
            TxnKind::Finished => Err(Error::BadTxn),
        }
    }

    /// Run a modification of one table. Fatal failures break the transaction.
    pub(crate) fn write_table<T, F>(&mut self, db: &Database, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTxn, &mut TableTree) -> Result<T>,
    {
        let slot = self.env_inner()?.check_handle(db)?;
        let result = self.write_state().and_then(|w| {
            let mut tree = w.table(db.dbi(), &slot)?;
            let before = tree;
            let out = f(w, &mut tree)?;
            if tree != before {
                w.store_table(db.dbi(), slot.name, tree);
            }
            Ok(out)
        });
        self.note(result)
    }

    /// Break the transaction if `result` carries a fatal error
    pub(crate) fn note<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() && !self.is_readonly() {
                warn!("txn {} broken by {}", self.txnid, e);
                self.flags.insert(TransactionFlags::ERROR);
            }
        }
        result
    }

    /// Begin a child write transaction. Its changes reach this transaction
    /// only if it commits.
    pub fn begin_nested_txn(&mut self) -> Result<Transaction<'_>> {
        let env = Arc::clone(self.env_inner()?);
        if env.config.read().write_map {
            return Err(Error::Incompatible);
        }
        let serial = env.next_serial();
        let (txnid, owner) = (self.txnid, self.owner);
        let parent = self.write_state()?;
        let child = Box::new(parent.clone());
        debug!("begin nested txn under {}", txnid);
        Ok(Transaction {
            env: Some(env),
            txnid,
            serial,
            owner,
            detached: false,
            flags: TransactionFlags::NESTED,
            kind: TxnKind::Nested { parent, child },
        })
    }

    /// Commit. A `ThreadMismatch` leaves the transaction alive; any other
    /// outcome ends it.
    pub fn commit(&mut self) -> Result<()> {
        if self.is_finished() {
            return Err(Error::BadTxn);
        }
        self.check_thread()?;
        if self.is_broken() {
            self.finish_abort();
            return Err(Error::BadTxn);
        }

        let Some(env) = self.env.take() else {
            return Err(Error::BadTxn);
        };
        let kind = mem::replace(&mut self.kind, TxnKind::Finished);
        self.flags.insert(TransactionFlags::FINISHED);
        match kind {
            TxnKind::Read(r) => {
                env.readers.release(r.slot);
                Ok(())
            }
            TxnKind::Nested { parent, child } => {
                *parent = *child;
                debug!("nested txn merged into {}", self.txnid);
                Ok(())
            }
            TxnKind::Write(w) => {
                let created = w.created.clone();
                let dropped = w.dropped.clone();
                let result = if w.changed {
                    w.commit()
                } else {
                    debug!("txn {} had no changes", self.txnid);
                    Ok(())
                };
                {
                    let mut tables = env.tables.write();
                    let released = if result.is_ok() { &dropped } else { &created };
                    for dbi in released {
                        tables.release(*dbi);
                    }
                }
                env.writer.release();
                result
            }
            TxnKind::Finished => Err(Error::BadTxn),
        }
    }

    /// Discard all changes. Aborting a finished transaction does nothing.
    pub fn abort(&mut self) -> Result<()> {
        if self.is_finished() {
            return Ok(());
        }
        self.check_thread()?;
        self.finish_abort();
        Ok(())
    }

    fn finish_abort(&mut self) {
        let kind = mem::replace(&mut self.kind, TxnKind::Finished);
        self.flags.insert(TransactionFlags::FINISHED);
        let Some(env) = self.env.take() else {
            return;
        };
        match kind {
            TxnKind::Read(r) => env.readers.release(r.slot),
            TxnKind::Write(w) => {
                let mut tables = env.tables.write();
                for dbi in &w.created {
                    tables.release(*dbi);
                }
                drop(tables);
                env.writer.release();
                debug!("aborted txn {}", self.txnid);
            }
            TxnKind::Nested { parent, child } => {
                let mut tables = env.tables.write();
                for dbi in child.created.iter().filter(|d| !parent.created.contains(d)) {
                    tables.release(*dbi);
                }
                debug!("aborted nested txn under {}", self.txnid);
            }
            TxnKind::Finished => {}
        }
    }

    /// Mark a write transaction unusable; only abort remains possible
    pub fn break_txn(&mut self) -> Result<()> {
        if self.is_finished() {
            return Err(Error::BadTxn);
        }
        self.check_thread()?;
        self.flags.insert(TransactionFlags::ERROR);
        Ok(())
    }

    /// Release the snapshot of a read transaction, keeping its reader slot
    pub fn reset(&mut self) -> Result<()> {
        if !self.is_readonly() {
            return Err(Error::Invalid);
        }
        self.check_live()?;
        if let TxnKind::Read(r) = &self.kind {
            self.env_inner()?.readers.rebind(r.slot, None);
        }
        self.flags.insert(TransactionFlags::RESET);
        Ok(())
    }

    /// Bind a reset read transaction to the latest snapshot
    pub fn renew(&mut self) -> Result<()> {
        if !self.is_readonly() || !self.flags.contains(TransactionFlags::RESET) || self.is_finished() {
            return Err(Error::BadTxn);
        }
        let env = Arc::clone(self.env_inner()?);
        env.check_usable()?;
        let TxnKind::Read(r) = &mut self.kind else {
            return Err(Error::BadTxn);
        };
        {
            let head = env.head.read();
            env.readers.rebind(r.slot, Some(&head.meta));
            r.meta = head.meta.clone();
            r.view = MapView::new(env.store.map(), r.meta.page_size());
        }
        self.txnid = r.meta.txnid;
        self.serial = env.next_serial();
        self.owner = thread::current().id();
        self.flags.remove(TransactionFlags::RESET);
        debug!("renewed read txn at {}", self.txnid);
        Ok(())
    }

    /// Replace the geometry carried by the next meta
    pub(crate) fn set_geometry(&mut self, geometry: crate::config::Geometry) -> Result<()> {
        let w = self.write_state()?;
        let used = w.meta.next_pgno * w.base.psize as u64;
        if geometry.page_size != w.meta.page_size() || geometry.upper < used {
            return Err(Error::IncompatibleGeometry);
        }
        w.meta.geometry = geometry;
        w.changed = true;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.is_finished() {
            self.finish_abort();
        }
    }
}
