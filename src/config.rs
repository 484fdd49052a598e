use once_cell::sync::OnceCell;

use crate::constants::{
    DbFlags, EnvFlags, DEFAULT_GROWTH_STEP, DEFAULT_INITIAL_SIZE, DEFAULT_MAX_DBS,
    DEFAULT_MAX_DIRTY, DEFAULT_MAX_READERS, DEFAULT_MAX_SIZE, DEFAULT_PAGE_SIZE,
    DEFAULT_SHRINK_THRESHOLD, MAX_PAGE_SIZE, META_PAGES, MIN_PAGE_SIZE,
};
use crate::error::{Error, Result};

static OS_PAGE_SIZE: OnceCell<usize> = OnceCell::new();

/// Page size of the running system, clamped into the supported range
pub fn os_page_size() -> usize {
    *OS_PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            DEFAULT_PAGE_SIZE
        } else {
            (size as usize).clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
        }
    })
}

/// How much a commit flushes before it returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Data pages and the meta page are synced on every commit
    #[default]
    Durable,
    /// Data pages are synced, the meta page is left to the OS
    NoMetaSync,
    /// Nothing is synced; the last synced snapshot is kept for recovery
    LazyKeepSteady,
    /// Nothing is synced and no recovery point is kept
    NoSync,
}

impl Durability {
    pub(crate) fn syncs_data(self) -> bool {
        matches!(self, Durability::Durable | Durability::NoMetaSync)
    }

    pub(crate) fn syncs_meta(self) -> bool {
        self == Durability::Durable
    }

    /// Whether commits leave a meta page that recovery may trust
    pub(crate) fn writes_steady(self) -> bool {
        self != Durability::LazyKeepSteady
    }

    pub(crate) fn from_flags(flags: EnvFlags) -> Self {
        if flags.contains(EnvFlags::NOSYNC) && flags.contains(EnvFlags::MAPASYNC) {
            Durability::NoSync
        } else if flags.contains(EnvFlags::NOSYNC) {
            Durability::LazyKeepSteady
        } else if flags.contains(EnvFlags::NOMETASYNC) {
            Durability::NoMetaSync
        } else {
            Durability::Durable
        }
    }

    pub(crate) fn flags(self) -> EnvFlags {
        match self {
            Durability::Durable => EnvFlags::empty(),
            Durability::NoMetaSync => EnvFlags::NOMETASYNC,
            Durability::LazyKeepSteady => EnvFlags::NOSYNC,
            Durability::NoSync => EnvFlags::NOSYNC | EnvFlags::MAPASYNC,
        }
    }
}

/// Order in which freed pages are handed out again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcPolicy {
    /// Oldest freed pages first
    #[default]
    Fifo,
    /// Most recently reclaimable pages first
    Lifo,
}

/// Size bounds of the data file, all in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Smallest size the file is shrunk to
    pub lower: u64,
    /// Size of a newly created file
    pub now: u64,
    /// Largest size the file may grow to
    pub upper: u64,
    /// Granularity of growth
    pub growth_step: u64,
    /// Unused tail that triggers truncation, 0 disables shrinking
    pub shrink_threshold: u64,
    /// Database page size
    pub page_size: usize,
}

impl Default for Geometry {
    fn default() -> Self {
        let page_size = os_page_size();
        Self {
            lower: META_PAGES * 2 * page_size as u64,
            now: DEFAULT_INITIAL_SIZE,
            upper: DEFAULT_MAX_SIZE,
            growth_step: DEFAULT_GROWTH_STEP,
            shrink_threshold: DEFAULT_SHRINK_THRESHOLD,
            page_size,
        }
    }
}

impl Geometry {
    /// Set lower, current and upper size bounds
    pub fn size_bounds(mut self, lower: u64, now: u64, upper: u64) -> Self {
        self.lower = lower;
        self.now = now;
        self.upper = upper;
        self
    }

    /// Set growth step
    pub fn growth_step(mut self, step: u64) -> Self {
        self.growth_step = step;
        self
    }

    /// Set shrink threshold
    pub fn shrink_threshold(mut self, threshold: u64) -> Self {
        self.shrink_threshold = threshold;
        self
    }

    /// Set page size
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    /// Check bounds and page size
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(Error::IncompatibleGeometry);
        }
        let min = META_PAGES * 2 * self.page_size as u64;
        if self.upper < min || self.lower > self.now || self.now > self.upper {
            return Err(Error::IncompatibleGeometry);
        }
        if usize::try_from(self.upper).is_err() || self.upper > isize::MAX as u64 {
            return Err(Error::TooLarge);
        }
        Ok(())
    }

    /// Bounds rounded to whole pages, with the lower bound raised to the minimum
    pub(crate) fn normalized(&self) -> Geometry {
        let psize = self.page_size as u64;
        let round = |v: u64| v.div_ceil(psize) * psize;
        let min = META_PAGES * 2 * psize;
        let lower = round(self.lower).max(min);
        let upper = (self.upper / psize * psize).max(lower);
        let now = round(self.now).clamp(lower, upper);
        Geometry {
            lower,
            now,
            upper,
            growth_step: round(self.growth_step.max(psize)),
            shrink_threshold: if self.shrink_threshold == 0 {
                0
            } else {
                round(self.shrink_threshold)
            },
            page_size: self.page_size,
        }
    }
}

/// Environment configuration with named, independently validated options
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Path is the data file itself rather than a directory
    pub no_subdir: bool,
    /// Disallow all writes
    pub read_only: bool,
    /// Refuse to open if another process holds the environment
    pub exclusive: bool,
    /// Adopt persisted settings instead of failing on mismatch
    pub accede: bool,
    /// Write-mapped I/O, incompatible with nested transactions
    pub write_map: bool,
    /// Reader slots belong to transactions instead of OS threads
    pub no_tls: bool,
    /// Hint the kernel that access is random
    pub no_readahead: bool,
    /// Skip zeroing of freshly allocated page buffers
    pub no_meminit: bool,
    /// Commit flush policy
    pub durability: Durability,
    /// Maximum number of named tables
    pub max_tables: u32,
    /// Maximum number of concurrent read transactions
    pub max_readers: u32,
    /// Dirty pages a write transaction may hold before `TxnFull`
    pub dirty_page_limit: usize,
    /// File geometry, `None` adopts the existing file's or the defaults
    pub geometry: Option<Geometry>,
    /// Page reclamation order, `None` adopts the persisted policy
    pub gc_policy: Option<GcPolicy>,
    /// Permission bits for created files
    pub file_mode: u32,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            no_subdir: false,
            read_only: false,
            exclusive: false,
            accede: false,
            write_map: false,
            no_tls: false,
            no_readahead: false,
            no_meminit: false,
            durability: Durability::Durable,
            max_tables: DEFAULT_MAX_DBS,
            max_readers: DEFAULT_MAX_READERS,
            dirty_page_limit: DEFAULT_MAX_DIRTY,
            geometry: None,
            gc_policy: None,
            file_mode: 0o644,
        }
    }
}

impl EnvConfig {
    /// Build a configuration from the packed flag word
    pub fn from_flags(flags: EnvFlags) -> Self {
        Self {
            no_subdir: flags.contains(EnvFlags::NOSUBDIR),
            read_only: flags.contains(EnvFlags::RDONLY),
            exclusive: flags.contains(EnvFlags::EXCLUSIVE),
            accede: flags.contains(EnvFlags::ACCEDE),
            write_map: flags.contains(EnvFlags::WRITEMAP),
            no_tls: flags.contains(EnvFlags::NOTLS),
            no_readahead: flags.contains(EnvFlags::NORDAHEAD),
            no_meminit: flags.contains(EnvFlags::NOMEMINIT),
            durability: Durability::from_flags(flags),
            gc_policy: flags
                .contains(EnvFlags::LIFORECLAIM)
                .then_some(GcPolicy::Lifo),
            ..Default::default()
        }
    }

    /// Pack the configuration back into a flag word
    pub fn flags(&self) -> EnvFlags {
        let mut flags = self.durability.flags();
        flags.set(EnvFlags::NOSUBDIR, self.no_subdir);
        flags.set(EnvFlags::RDONLY, self.read_only);
        flags.set(EnvFlags::EXCLUSIVE, self.exclusive);
        flags.set(EnvFlags::ACCEDE, self.accede);
        flags.set(EnvFlags::WRITEMAP, self.write_map);
        flags.set(EnvFlags::NOTLS, self.no_tls);
        flags.set(EnvFlags::NORDAHEAD, self.no_readahead);
        flags.set(EnvFlags::NOMEMINIT, self.no_meminit);
        flags.set(EnvFlags::LIFORECLAIM, self.gc_policy == Some(GcPolicy::Lifo));
        flags
    }

    /// Path is the data file itself
    pub fn no_subdir(mut self, on: bool) -> Self {
        self.no_subdir = on;
        self
    }

    /// Open read-only
    pub fn read_only(mut self, on: bool) -> Self {
        self.read_only = on;
        self
    }

    /// Open exclusively
    pub fn exclusive(mut self, on: bool) -> Self {
        self.exclusive = on;
        self
    }

    /// Adopt persisted settings on mismatch
    pub fn accede(mut self, on: bool) -> Self {
        self.accede = on;
        self
    }

    /// Use write-mapped I/O
    pub fn write_map(mut self, on: bool) -> Self {
        self.write_map = on;
        self
    }

    /// Detach reader slots from threads
    pub fn no_tls(mut self, on: bool) -> Self {
        self.no_tls = on;
        self
    }

    /// Disable readahead
    pub fn no_readahead(mut self, on: bool) -> Self {
        self.no_readahead = on;
        self
    }

    /// Skip zero-initialisation of page buffers
    pub fn no_meminit(mut self, on: bool) -> Self {
        self.no_meminit = on;
        self
    }

    /// Set the durability tier
    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Set maximum number of named tables
    pub fn max_tables(mut self, max: u32) -> Self {
        self.max_tables = max;
        self
    }

    /// Set maximum number of readers
    pub fn max_readers(mut self, max: u32) -> Self {
        self.max_readers = max;
        self
    }

    /// Set dirty page limit per write transaction
    pub fn dirty_page_limit(mut self, limit: usize) -> Self {
        self.dirty_page_limit = limit;
        self
    }

    /// Set file geometry
    pub fn geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// Set page reclamation policy
    pub fn gc_policy(mut self, policy: GcPolicy) -> Self {
        self.gc_policy = Some(policy);
        self
    }

    /// Set permission bits for created files
    pub fn file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }

    /// Check option combinations
    pub fn validate(&self) -> Result<()> {
        if self.max_readers == 0 || self.dirty_page_limit == 0 {
            return Err(Error::Invalid);
        }
        if self.read_only && self.write_map {
            return Err(Error::Incompatible);
        }
        if let Some(geometry) = &self.geometry {
            geometry.validate()?;
        }
        Ok(())
    }
}

/// Key comparison mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyOrder {
    /// Byte-by-byte lexicographic
    #[default]
    Lexical,
    /// Lexicographic from the last byte
    Reverse,
    /// Native-endian unsigned integers of 4 or 8 bytes
    Integer,
}

/// Duplicate-value settings of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DupOptions {
    /// Ordering of values under one key
    pub order: KeyOrder,
    /// All values have the same length
    pub fixed: bool,
}

/// Table open options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableOptions {
    /// Key ordering
    pub key_order: KeyOrder,
    /// Sorted duplicates, `None` for one value per key
    pub dup: Option<DupOptions>,
    /// Create the table if absent
    pub create: bool,
    /// Adopt persisted flags instead of failing on mismatch
    pub accede: bool,
}

impl TableOptions {
    /// Options for creating a table
    pub fn create() -> Self {
        Self {
            create: true,
            ..Default::default()
        }
    }

    /// Set key ordering
    pub fn key_order(mut self, order: KeyOrder) -> Self {
        self.key_order = order;
        self
    }

    /// Enable sorted duplicates
    pub fn dup_sort(mut self, dup: DupOptions) -> Self {
        self.dup = Some(dup);
        self
    }

    /// Adopt persisted flags
    pub fn accede(mut self, on: bool) -> Self {
        self.accede = on;
        self
    }

    /// Build options from the packed flag word
    pub fn from_flags(flags: DbFlags) -> Result<Self> {
        if flags.contains(DbFlags::REVERSEKEY) && flags.contains(DbFlags::INTEGERKEY) {
            return Err(Error::Invalid);
        }
        let dup_bits = DbFlags::DUPFIXED | DbFlags::INTEGERDUP | DbFlags::REVERSEDUP;
        if flags.intersects(dup_bits) && !flags.contains(DbFlags::DUPSORT) {
            return Err(Error::Invalid);
        }
        if flags.contains(DbFlags::REVERSEDUP) && flags.contains(DbFlags::INTEGERDUP) {
            return Err(Error::Invalid);
        }
        let order = |integer: DbFlags, reverse: DbFlags| {
            if flags.contains(integer) {
                KeyOrder::Integer
            } else if flags.contains(reverse) {
                KeyOrder::Reverse
            } else {
                KeyOrder::Lexical
            }
        };
        let dup = flags.contains(DbFlags::DUPSORT).then(|| DupOptions {
            order: order(DbFlags::INTEGERDUP, DbFlags::REVERSEDUP),
            fixed: flags.intersects(DbFlags::DUPFIXED | DbFlags::INTEGERDUP),
        });
        Ok(Self {
            key_order: order(DbFlags::INTEGERKEY, DbFlags::REVERSEKEY),
            dup,
            create: flags.contains(DbFlags::CREATE),
            accede: flags.contains(DbFlags::ACCEDE),
        })
    }

    /// Persistent flags describing the table layout
    pub fn flags(&self) -> DbFlags {
        let mut flags = DbFlags::empty();
        match self.key_order {
            KeyOrder::Lexical => {}
            KeyOrder::Reverse => flags |= DbFlags::REVERSEKEY,
            KeyOrder::Integer => flags |= DbFlags::INTEGERKEY,
        }
        if let Some(dup) = self.dup {
            flags |= DbFlags::DUPSORT;
            match dup.order {
                KeyOrder::Lexical => {}
                KeyOrder::Reverse => flags |= DbFlags::REVERSEDUP,
                KeyOrder::Integer => flags |= DbFlags::INTEGERDUP,
            }
            if dup.fixed {
                flags |= DbFlags::DUPFIXED;
            }
        }
        flags
    }
}
