use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use lazy_static::lazy_static;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::btree::{self, PageSink};
use crate::config::{Durability, EnvConfig, GcPolicy, Geometry};
use crate::constants::{EnvFlags, MetaFlags, DATA_NAME, LOCK_NAME, LOCK_SUFFIX, META_PAGES};
use crate::database::{Database, TableRegistry, TableSlot};
use crate::error::{Error, Result};
use crate::flock::{self, FileLock};
use crate::meta::Meta;
use crate::page::{self, Page};
use crate::snapshot::{self, HeadState, ReaderTable};
use crate::store::{page_bytes, PageStore};
use crate::transaction::{Transaction, WriterLock};
use crate::types::{EnvInfo, ReaderInfo, RemoveMode, Stat};

lazy_static! {
    /// Durability flags that may change while the environment is open
    static ref CHANGEABLE: EnvFlags = EnvFlags::NOSYNC | EnvFlags::NOMETASYNC | EnvFlags::MAPASYNC;
    /// Data files opened by this process
    static ref OPEN_PATHS: Mutex<HashSet<PathBuf>> = Mutex::new(HashSet::new());
}

static NEXT_ENV_ID: AtomicU64 = AtomicU64::new(1);

/// Bytes copied per write when cloning raw pages
const COPY_CHUNK: usize = 1 << 20;

/// Claim on a data file in the process-wide registry
#[derive(Debug)]
struct PathClaim(PathBuf);

impl PathClaim {
    fn acquire(key: PathBuf) -> Result<Self> {
        if !OPEN_PATHS.lock().insert(key.clone()) {
            return Err(Error::Busy);
        }
        Ok(PathClaim(key))
    }
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        OPEN_PATHS.lock().remove(&self.0);
    }
}

/// Data and lock file locations for an environment path
fn layout(path: &Path, no_subdir: bool) -> (PathBuf, PathBuf) {
    if no_subdir {
        let mut lock = path.as_os_str().to_os_string();
        lock.push(LOCK_SUFFIX);
        (path.to_path_buf(), PathBuf::from(lock))
    } else {
        (path.join(DATA_NAME), path.join(LOCK_NAME))
    }
}

/// Stable identity of a data file for the open-path registry
fn registry_key(data_path: &Path) -> PathBuf {
    let (Some(dir), Some(name)) = (data_path.parent(), data_path.file_name()) else {
        return data_path.to_path_buf();
    };
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    fs::canonicalize(dir)
        .map(|d| d.join(name))
        .unwrap_or_else(|_| data_path.to_path_buf())
}

/// Shared state of an open environment
#[derive(Debug)]
pub(crate) struct EnvInner {
    /// Process-unique id, stamped into table handles
    pub(crate) id: u64,
    /// Path the environment was opened with
    path: PathBuf,
    pub(crate) config: RwLock<EnvConfig>,
    pub(crate) store: PageStore,
    pub(crate) head: RwLock<HeadState>,
    pub(crate) readers: ReaderTable,
    pub(crate) writer: WriterLock,
    pub(crate) tables: RwLock<TableRegistry>,
    /// Page reclamation order of this session
    pub(crate) policy: GcPolicy,
    serial: AtomicU64,
    panicked: AtomicBool,
    closed: AtomicBool,
    lock: Mutex<Option<FileLock>>,
    claim: Mutex<Option<PathClaim>>,
}

impl EnvInner {
    /// New transactions may start
    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.panicked.load(Ordering::SeqCst) {
            return Err(Error::Panic);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::BadSignature);
        }
        Ok(())
    }

    pub(crate) fn mark_panicked(&self) {
        self.panicked.store(true, Ordering::SeqCst);
    }

    pub(crate) fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn durability(&self) -> Durability {
        self.config.read().durability
    }

    /// Registered slot of a handle
    pub(crate) fn check_handle(&self, db: &Database) -> Result<TableSlot> {
        if db.env_id() != self.id {
            return Err(Error::BadSignature);
        }
        self.tables.read().get(db.dbi()).ok_or(Error::BadDbi)
    }

    /// Flush the data file and make the head meta steady
    fn promote_steady(&self) -> Result<()> {
        self.store.sync()?;
        let mut head = self.head.write();
        if head.meta.is_steady() {
            return Ok(());
        }
        let mut meta = head.meta.clone();
        meta.flags.insert(MetaFlags::STEADY);
        let slot = head.slot;
        if let Err(e) = self.store.write_meta(slot, &meta).and_then(|_| self.store.sync()) {
            warn!("promoting txn {} to steady failed: {}", meta.txnid, e);
            self.mark_panicked();
            return Err(Error::Panic);
        }
        debug!("txn {} is now steady", meta.txnid);
        head.publish(meta, slot);
        Ok(())
    }

    fn release(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.lock.lock().take();
        self.claim.lock().take();
    }
}

/// An open database environment.
///
/// Cloning is cheap; every clone and every transaction shares the same
/// files, reader table and writer slot.
#[derive(Debug, Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl Environment {
    pub(crate) fn from_inner(inner: Arc<EnvInner>) -> Self {
        Environment { inner }
    }

    /// Open the environment at `path`, creating it unless read-only
    pub fn open<P: AsRef<Path>>(path: P, config: EnvConfig) -> Result<Environment> {
        config.validate()?;
        let path = path.as_ref();
        if !config.no_subdir && !config.read_only {
            fs::create_dir_all(path)?;
        }
        let (data_path, lock_path) = layout(path, config.no_subdir);
        let claim = PathClaim::acquire(registry_key(&data_path))?;

        let exclusive = config.exclusive || !config.read_only;
        let lock = match FileLock::try_lock(&lock_path, exclusive, config.file_mode) {
            Ok(lock) => Some(lock),
            Err(e) if flock::is_contended(&e) => return Err(Error::Busy),
            Err(e) if config.read_only => {
                info!("no lock file for {} ({}), opening unlocked", path.display(), e);
                None
            }
            Err(e) => return Err(e.into()),
        };

        let file = PageStore::open_file(&data_path, config.read_only, config.file_mode)?;
        if file.metadata()?.len() == 0 {
            if config.read_only {
                return Err(Error::Invalid);
            }
            let geometry = config.geometry.unwrap_or_default();
            geometry.validate()?;
            let meta = Meta::new(geometry.normalized(), config.gc_policy.unwrap_or_default());
            PageStore::init_file(&file, &meta)?;
            info!(
                "created {} with page size {}",
                data_path.display(),
                meta.page_size()
            );
        }

        let (first, second) = PageStore::read_metas(&file);
        let metas = [first, second];
        if metas.iter().all(|m| m.is_err()) {
            return Err(snapshot::meta_failure(&metas));
        }
        let mut head = snapshot::recover(metas, !config.read_only)?;
        let psize = head.meta.page_size();

        if let Some(requested) = config.geometry {
            if requested.page_size != psize && !config.accede {
                return Err(Error::IncompatibleGeometry);
            }
            if !config.read_only && requested.page_size == psize {
                requested.validate()?;
                let geometry = requested.normalized();
                if geometry.upper < head.meta.next_pgno * psize as u64 {
                    return Err(Error::IncompatibleGeometry);
                }
                head.meta.geometry = Geometry {
                    now: head.meta.geometry.now,
                    ..geometry
                };
            }
        }

        let policy = match config.gc_policy {
            Some(policy) if !config.read_only => policy,
            _ => head.meta.gc_policy(),
        };

        let store = PageStore::new(data_path, file, psize, config.no_readahead)?;
        if store.file_size() < head.meta.next_pgno * psize as u64 {
            return Err(Error::Corrupted);
        }
        info!(
            "opened {} at txn {} ({} bytes, {:?})",
            path.display(),
            head.meta.txnid,
            store.file_size(),
            config.durability
        );

        let inner = EnvInner {
            id: NEXT_ENV_ID.fetch_add(1, Ordering::SeqCst),
            path: path.to_path_buf(),
            readers: ReaderTable::new(config.max_readers),
            tables: RwLock::new(TableRegistry::new(config.max_tables)),
            config: RwLock::new(config),
            store,
            head: RwLock::new(head),
            writer: WriterLock::default(),
            policy,
            serial: AtomicU64::new(1),
            panicked: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            lock: Mutex::new(lock),
            claim: Mutex::new(Some(claim)),
        };
        Ok(Environment {
            inner: Arc::new(inner),
        })
    }

    /// Open with the packed flag word and file mode
    pub fn open_with_flags<P: AsRef<Path>>(path: P, flags: EnvFlags, mode: u32) -> Result<Environment> {
        Self::open(path, EnvConfig::from_flags(flags).file_mode(mode))
    }

    /// Path the environment was opened with
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn config(&self) -> EnvConfig {
        self.inner.config.read().clone()
    }

    pub fn flags(&self) -> EnvFlags {
        self.inner.config.read().flags()
    }

    pub fn page_size(&self) -> usize {
        self.inner.store.page_size()
    }

    /// Largest key, or duplicate value, a table accepts
    pub fn max_key_size(&self) -> usize {
        page::max_key_size(self.page_size())
    }

    /// Begin a read transaction on the latest snapshot
    pub fn begin_ro_txn(&self) -> Result<Transaction<'static>> {
        Transaction::begin_read(&self.inner)
    }

    /// Begin a write transaction, waiting for the current writer
    pub fn begin_rw_txn(&self) -> Result<Transaction<'static>> {
        Transaction::begin_write(&self.inner, true)
    }

    /// Begin a write transaction, failing with `Busy` if another is active
    pub fn try_begin_rw_txn(&self) -> Result<Transaction<'static>> {
        Transaction::begin_write(&self.inner, false)
    }

    /// Begin a write transaction, or a read transaction in a read-only
    /// environment
    pub fn begin_txn(&self) -> Result<Transaction<'static>> {
        if self.inner.config.read().read_only {
            self.begin_ro_txn()
        } else {
            self.begin_rw_txn()
        }
    }

    /// Flush the latest commit to disk and close the environment. Fails with
    /// `Busy` while a write transaction is active; open read transactions
    /// keep their snapshot.
    pub fn close(self) -> Result<()> {
        if self.inner.writer.is_held() {
            return Err(Error::Busy);
        }
        let writable = !self.inner.config.read().read_only;
        let synced = if writable && !self.inner.panicked.load(Ordering::SeqCst) {
            self.sync(true)
        } else {
            Ok(())
        };
        self.inner.release();
        info!("closed {}", self.inner.path.display());
        synced
    }

    /// Close regardless of active transactions, without flushing
    pub fn close_forced(self) {
        self.inner.release();
        info!("closed {} (forced)", self.inner.path.display());
    }

    /// Statistics over all tables, in `txn`'s view or the latest snapshot
    pub fn stat(&self, txn: Option<&Transaction>) -> Result<Stat> {
        let own;
        let txn = match txn {
            Some(txn) => txn,
            None => {
                own = self.begin_ro_txn()?;
                &own
            }
        };
        let meta = txn.meta()?;
        let mut stat = meta.catalog.stat(meta.page_size());
        stat.entries = 0;
        for record in txn.table_records()? {
            let tree = &record.tree;
            stat.depth = stat.depth.max(tree.depth as u32);
            stat.branch_pages += tree.branch_pages;
            stat.leaf_pages += tree.leaf_pages;
            stat.overflow_pages += tree.overflow_pages;
            stat.entries += tree.entries;
            stat.mod_txnid = stat.mod_txnid.max(tree.mod_txnid);
        }
        Ok(stat)
    }

    pub fn info(&self) -> EnvInfo {
        let head = self.inner.head.read();
        EnvInfo {
            geometry: head.meta.geometry,
            file_size: self.inner.store.file_size(),
            last_pgno: head.meta.next_pgno.saturating_sub(1),
            last_txnid: head.meta.txnid,
            steady_txnid: head.steady_txnid,
            max_readers: self.inner.readers.max(),
            num_readers: self.inner.readers.count(),
            gc_policy: self.inner.policy,
        }
    }

    /// Reader slots in use
    pub fn reader_list(&self) -> Vec<ReaderInfo> {
        self.inner.readers.list()
    }

    /// Flush to disk and make the latest commit the recovery point. Without
    /// `force`, a fully durable environment has nothing to do.
    pub fn sync(&self, force: bool) -> Result<()> {
        self.inner.check_usable()?;
        if self.inner.config.read().read_only {
            return Ok(());
        }
        if !force && self.inner.durability() == Durability::Durable {
            return Ok(());
        }
        self.inner.writer.acquire(thread::current().id(), true)?;
        let result = self.inner.promote_steady();
        self.inner.writer.release();
        result
    }

    /// Turn durability flags on or off; other flags give `Invalid`
    pub fn set_flags(&self, flags: EnvFlags, on: bool) -> Result<()> {
        if !CHANGEABLE.contains(flags) {
            return Err(Error::Invalid);
        }
        let mut config = self.inner.config.write();
        let mut current = config.durability.flags();
        current.set(flags, on);
        config.durability = Durability::from_flags(current);
        debug!("durability is now {:?}", config.durability);
        Ok(())
    }

    /// Change size bounds; takes effect through a commit of its own
    pub fn set_geometry(&self, geometry: Geometry) -> Result<()> {
        geometry.validate()?;
        if geometry.page_size != self.page_size() {
            return Err(Error::IncompatibleGeometry);
        }
        let mut txn = self.begin_rw_txn()?;
        txn.set_geometry(geometry.normalized())?;
        txn.commit()
    }

    /// Copy the latest snapshot to `dest`, a new directory or file as the
    /// environment's layout dictates.
    ///
    /// A compact copy rewrites live pages only, renumbered from the start of
    /// the file, and carries no free list.
    pub fn copy<P: AsRef<Path>>(&self, dest: P, compact: bool, force_dynamic_size: bool) -> Result<()> {
        let dest = dest.as_ref();
        let no_subdir = self.inner.config.read().no_subdir;
        if !no_subdir {
            fs::create_dir_all(dest)?;
        }
        let (data_path, _) = layout(dest, no_subdir);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(self.inner.config.read().file_mode)
            .open(&data_path)?;

        let txn = self.begin_ro_txn()?;
        let (view, snapshot) = txn.snapshot()?;
        let psize = snapshot.page_size();
        let mut meta = snapshot.clone();
        meta.flags.insert(MetaFlags::STEADY);

        if compact {
            let mut sink = CopySink {
                file: &file,
                psize,
                next: META_PAGES,
            };
            meta.catalog = btree::copy_tree(view, &snapshot.catalog, &mut sink, true)?;
            meta.gc_root = 0;
            meta.next_pgno = sink.next;
        } else {
            let start = META_PAGES as usize * psize;
            let end = snapshot.next_pgno as usize * psize;
            let used = page_bytes(view.map(), psize, 0, snapshot.next_pgno)?;
            let mut offset = start;
            while offset < end {
                let len = COPY_CHUNK.min(end - offset);
                file.write_all_at(&used[offset..offset + len], offset as u64)?;
                offset += len;
            }
        }

        let used = meta.next_pgno * psize as u64;
        if force_dynamic_size && meta.geometry.lower == meta.geometry.upper {
            meta.geometry.lower = META_PAGES * 2 * psize as u64;
        }
        meta.geometry.now = used.max(meta.geometry.lower);
        file.set_len(meta.geometry.now)?;
        for slot in 0..META_PAGES {
            file.write_all_at(&meta.encode(slot)?, slot * psize as u64)?;
        }
        file.sync_all()?;
        info!(
            "copied txn {} to {}{}",
            meta.txnid,
            data_path.display(),
            if compact { " (compacted)" } else { "" }
        );
        Ok(())
    }

    /// Delete the files of a closed environment. Returns whether a data file
    /// was found.
    pub fn remove<P: AsRef<Path>>(path: P, mode: RemoveMode) -> Result<bool> {
        let path = path.as_ref();
        let no_subdir = !path.is_dir();
        let (data_path, lock_path) = layout(path, no_subdir);

        let _lock = match mode {
            RemoveMode::Unconditional => None,
            RemoveMode::EnsureUnused => match FileLock::try_lock(&lock_path, true, 0o644) {
                Ok(lock) => Some(lock),
                Err(e) if flock::is_contended(&e) => return Err(Error::Busy),
                Err(e) => return Err(e.into()),
            },
            RemoveMode::WaitForUnused => Some(FileLock::lock(&lock_path, true, 0o644)?),
        };

        let found = match fs::remove_file(&data_path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        match fs::remove_file(&lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if !no_subdir {
            if let Err(e) = fs::remove_dir(path) {
                debug!("kept directory {}: {}", path.display(), e);
            }
        }
        info!("removed {} ({:?})", path.display(), mode);
        Ok(found)
    }
}

/// Sequential page writer for compacting copies
struct CopySink<'f> {
    file: &'f File,
    psize: usize,
    next: u64,
}

impl PageSink for CopySink<'_> {
    fn append(&mut self, page: &Page) -> Result<u64> {
        let pgno = self.next;
        self.file
            .write_all_at(&page.encode(pgno, self.psize)?, pgno * self.psize as u64)?;
        self.next += 1;
        Ok(pgno)
    }

    fn append_overflow(&mut self, data: &[u8]) -> Result<u64> {
        let pgno = self.next;
        let bytes = page::encode_overflow(pgno, data, self.psize)?;
        self.file.write_all_at(&bytes, pgno * self.psize as u64)?;
        self.next += page::overflow_pages(self.psize, data.len());
        Ok(pgno)
    }
}
