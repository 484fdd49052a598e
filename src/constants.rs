use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EnvFlags: u32 {
        const NOSUBDIR = 0x4000;
        const NOSYNC = 0x10000;
        const RDONLY = 0x20000;
        const NOMETASYNC = 0x40000;
        const WRITEMAP = 0x80000;
        const MAPASYNC = 0x100000;
        const NOTLS = 0x200000;
        const EXCLUSIVE = 0x400000;
        const NORDAHEAD = 0x800000;
        const NOMEMINIT = 0x1000000;
        const ACCEDE = 0x40000000;
        const LIFORECLAIM = 0x4000000;
    }
}

// Database flags
bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct DbFlags: u32 {
        const REVERSEKEY = 0x02;
        const DUPSORT = 0x04;
        const INTEGERKEY = 0x08;
        const DUPFIXED = 0x10;
        const INTEGERDUP = 0x20;
        const REVERSEDUP = 0x40;
        const ACCEDE = 0x40000000;
        const CREATE = 0x40000;
    }
}

impl DbFlags {
    /// Flags that are persisted with the table and checked on reopen
    pub(crate) const PERSISTENT: DbFlags = DbFlags::REVERSEKEY
        .union(DbFlags::DUPSORT)
        .union(DbFlags::INTEGERKEY)
        .union(DbFlags::DUPFIXED)
        .union(DbFlags::INTEGERDUP)
        .union(DbFlags::REVERSEDUP);
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WriteFlags: u32 {
        const NOOVERWRITE = 0x10;
        const NODUPDATA = 0x20;
        const CURRENT = 0x40;
    }
}

// Transaction state flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TransactionFlags: u32 {
        const RDONLY = EnvFlags::RDONLY.bits();
        const FINISHED = 0x01;
        const ERROR = 0x02;
        const RESET = 0x08;
        const NESTED = 0x10;
    }
}

// Leaf node flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct NodeFlags: u8 {
        const BIGDATA = 0x01;
        const SUBDATA = 0x02;
    }
}

// Page flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct PageFlags: u16 {
        const BRANCH = 0x01;
        const LEAF = 0x02;
        const OVERFLOW = 0x04;
        const META = 0x08;
        const FREELIST = 0x10;
    }
}

// Meta flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct MetaFlags: u32 {
        const STEADY = 0x01;
        const LIFO = 0x02;
    }
}

/// Magic number for lumokv data files
pub const MDB_MAGIC: u32 = 0xBEEF_DEAD;
/// Version numbers major
pub const VERSION_MAJOR: u32 = 0;
/// Version numbers minor
pub const VERSION_MINOR: u32 = 3;
/// Version numbers patch
pub const VERSION_PATCH: u32 = 0;
/// On-disk format version, bumped whenever the page layout changes
pub const DATA_VERSION: u32 = 2;
/// Number of redundant meta pages at the start of the file
pub const META_PAGES: u64 = 2;
/// Smallest supported page size
pub const MIN_PAGE_SIZE: usize = 256;
/// Largest supported page size
pub const MAX_PAGE_SIZE: usize = 65536;
/// Page size used when neither the file nor the caller picks one
pub const DEFAULT_PAGE_SIZE: usize = 4096;
/// Reader slots when the caller does not say otherwise
pub const DEFAULT_MAX_READERS: u32 = 126;
/// Named tables when the caller does not say otherwise
pub const DEFAULT_MAX_DBS: u32 = 16;
/// Dirty pages a single write transaction may hold
pub const DEFAULT_MAX_DIRTY: usize = 1 << 20;
/// Initial data file size for new environments
pub const DEFAULT_INITIAL_SIZE: u64 = 1 << 20;
/// Default upper bound of the data file
pub const DEFAULT_MAX_SIZE: u64 = 1 << 30;
/// Default step the data file grows by
pub const DEFAULT_GROWTH_STEP: u64 = 1 << 20;
/// Default slack that triggers truncation of the data file
pub const DEFAULT_SHRINK_THRESHOLD: u64 = 4 << 20;
/// Deepest tree a cursor can walk
pub const CURSOR_STACK: usize = 32;
/// Data file name in directory mode
pub const DATA_NAME: &str = "data.mdb";
/// Lock file name in directory mode
pub const LOCK_NAME: &str = "lock.mdb";
/// Lock file suffix in no-subdir mode
pub const LOCK_SUFFIX: &str = "-lck";
