use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::config::{GcPolicy, Geometry};
use crate::constants::{DbFlags, MetaFlags, PageFlags, DATA_VERSION, MDB_MAGIC};
use crate::error::{Error, Result};
use crate::page::PAGE_HEADER_SIZE;
use crate::types::Stat;

/// Encoded size of a tree descriptor
pub(crate) const TREE_INFO_SIZE: usize = 52;
/// Encoded size of a catalog record
pub(crate) const TABLE_RECORD_SIZE: usize = 4 + TREE_INFO_SIZE;
/// Encoded size of a meta record, page header included
pub(crate) const META_SIZE: usize = PAGE_HEADER_SIZE + 4 * 4 + 8 * 5 + 8 * 3 + TREE_INFO_SIZE + 4;

/// Root and counters of one B-tree, matching MDB_db
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TreeInfo {
    /// Persistent table flags, unused for nested trees
    pub(crate) flags: u16,
    /// Depth of B-tree
    pub(crate) depth: u16,
    /// Root page number, 0 for an empty tree
    pub(crate) root: u64,
    /// Number of branch pages
    pub(crate) branch_pages: u64,
    /// Number of leaf pages
    pub(crate) leaf_pages: u64,
    /// Number of overflow pages
    pub(crate) overflow_pages: u64,
    /// Number of data entries
    pub(crate) entries: u64,
    /// Last transaction that touched the tree
    pub(crate) mod_txnid: u64,
}

impl TreeInfo {
    pub(crate) fn is_empty(&self) -> bool {
        self.root == 0
    }

    pub(crate) fn stat(&self, psize: usize) -> Stat {
        Stat {
            psize: psize as u32,
            depth: self.depth as u32,
            branch_pages: self.branch_pages,
            leaf_pages: self.leaf_pages,
            overflow_pages: self.overflow_pages,
            entries: self.entries,
            mod_txnid: self.mod_txnid,
        }
    }

    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u16::<LittleEndian>(self.flags)?;
        w.write_u16::<LittleEndian>(self.depth)?;
        w.write_u64::<LittleEndian>(self.root)?;
        w.write_u64::<LittleEndian>(self.branch_pages)?;
        w.write_u64::<LittleEndian>(self.leaf_pages)?;
        w.write_u64::<LittleEndian>(self.overflow_pages)?;
        w.write_u64::<LittleEndian>(self.entries)?;
        w.write_u64::<LittleEndian>(self.mod_txnid)?;
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        Ok(TreeInfo {
            flags: r.read_u16::<LittleEndian>().map_err(|e| Error::Decode("tree flags", e))?,
            depth: r.read_u16::<LittleEndian>().map_err(|e| Error::Decode("tree depth", e))?,
            root: r.read_u64::<LittleEndian>().map_err(|e| Error::Decode("tree root", e))?,
            branch_pages: r
                .read_u64::<LittleEndian>()
                .map_err(|e| Error::Decode("branch_pages", e))?,
            leaf_pages: r
                .read_u64::<LittleEndian>()
                .map_err(|e| Error::Decode("leaf_pages", e))?,
            overflow_pages: r
                .read_u64::<LittleEndian>()
                .map_err(|e| Error::Decode("overflow_pages", e))?,
            entries: r.read_u64::<LittleEndian>().map_err(|e| Error::Decode("entries", e))?,
            mod_txnid: r
                .read_u64::<LittleEndian>()
                .map_err(|e| Error::Decode("mod_txnid", e))?,
        })
    }
}

/// Catalog record of a table: its persistent flags and tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TableRecord {
    pub(crate) flags: DbFlags,
    pub(crate) tree: TreeInfo,
}

impl TableRecord {
    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(TABLE_RECORD_SIZE);
        buf.write_u32::<LittleEndian>(self.flags.bits())?;
        self.tree.write_to(&mut buf)?;
        Ok(buf)
    }

    pub(crate) fn decode(mut bytes: &[u8]) -> Result<Self> {
        let bits = bytes
            .read_u32::<LittleEndian>()
            .map_err(|e| Error::Decode("table flags", e))?;
        let flags = DbFlags::from_bits(bits).ok_or(Error::Corrupted)?;
        let tree = TreeInfo::read_from(&mut bytes)?;
        Ok(TableRecord { flags, tree })
    }
}

/// Meta page contents, matching MDB_meta
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Meta {
    /// Steady and reclamation flags
    pub(crate) flags: MetaFlags,
    /// File geometry, page size included
    pub(crate) geometry: Geometry,
    /// txnid that committed this page
    pub(crate) txnid: u64,
    /// First never-allocated page
    pub(crate) next_pgno: u64,
    /// First page of the free-list chain, 0 when there is none
    pub(crate) gc_root: u64,
    /// Tree of named tables
    pub(crate) catalog: TreeInfo,
}

impl Meta {
    pub(crate) fn new(geometry: Geometry, policy: GcPolicy) -> Self {
        let mut flags = MetaFlags::STEADY;
        flags.set(MetaFlags::LIFO, policy == GcPolicy::Lifo);
        Meta {
            flags,
            geometry,
            txnid: 0,
            next_pgno: crate::constants::META_PAGES,
            gc_root: 0,
            catalog: TreeInfo::default(),
        }
    }

    pub(crate) fn page_size(&self) -> usize {
        self.geometry.page_size
    }

    pub(crate) fn is_steady(&self) -> bool {
        self.flags.contains(MetaFlags::STEADY)
    }

    pub(crate) fn gc_policy(&self) -> GcPolicy {
        if self.flags.contains(MetaFlags::LIFO) {
            GcPolicy::Lifo
        } else {
            GcPolicy::Fifo
        }
    }

    /// Encode into a page-sized buffer for slot `pgno`
    pub(crate) fn encode(&self, pgno: u64) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.page_size());
        buf.write_u64::<LittleEndian>(pgno)?;
        buf.write_u16::<LittleEndian>(PageFlags::META.bits())?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(0)?;

        buf.write_u32::<LittleEndian>(MDB_MAGIC)?;
        buf.write_u32::<LittleEndian>(DATA_VERSION)?;
        buf.write_u32::<LittleEndian>(self.geometry.page_size as u32)?;
        buf.write_u32::<LittleEndian>(self.flags.bits())?;
        buf.write_u64::<LittleEndian>(self.geometry.lower)?;
        buf.write_u64::<LittleEndian>(self.geometry.now)?;
        buf.write_u64::<LittleEndian>(self.geometry.upper)?;
        buf.write_u64::<LittleEndian>(self.geometry.growth_step)?;
        buf.write_u64::<LittleEndian>(self.geometry.shrink_threshold)?;
        buf.write_u64::<LittleEndian>(self.txnid)?;
        buf.write_u64::<LittleEndian>(self.next_pgno)?;
        buf.write_u64::<LittleEndian>(self.gc_root)?;
        self.catalog.write_to(&mut buf)?;

        let checksum = crc32fast::hash(&buf[PAGE_HEADER_SIZE..]);
        buf.write_u32::<LittleEndian>(checksum)?;
        buf.resize(self.page_size(), 0);
        Ok(buf)
    }

    /// Decode and validate a meta record
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < META_SIZE {
            return Err(Error::Invalid);
        }
        let body = &bytes[PAGE_HEADER_SIZE..META_SIZE - 4];
        let mut r = body;

        let magic = r.read_u32::<LittleEndian>().map_err(|e| Error::Decode("magic", e))?;
        if magic != MDB_MAGIC {
            return Err(Error::Invalid);
        }
        let version = r.read_u32::<LittleEndian>().map_err(|e| Error::Decode("version", e))?;
        if version != DATA_VERSION {
            return Err(Error::VersionMismatch);
        }

        let mut tail = &bytes[META_SIZE - 4..META_SIZE];
        let stored = tail
            .read_u32::<LittleEndian>()
            .map_err(|e| Error::Decode("checksum", e))?;
        if crc32fast::hash(body) != stored {
            return Err(Error::Corrupted);
        }

        let page_size = r.read_u32::<LittleEndian>().map_err(|e| Error::Decode("psize", e))?;
        let flags = r.read_u32::<LittleEndian>().map_err(|e| Error::Decode("flags", e))?;
        let mut next = |field| r.read_u64::<LittleEndian>().map_err(|e| Error::Decode(field, e));
        let geometry = Geometry {
            lower: next("lower")?,
            now: next("now")?,
            upper: next("upper")?,
            growth_step: next("growth_step")?,
            shrink_threshold: next("shrink_threshold")?,
            page_size: page_size as usize,
        };
        let txnid = next("txnid")?;
        let next_pgno = next("next_pgno")?;
        let gc_root = next("gc_root")?;
        let catalog = TreeInfo::read_from(&mut r)?;

        geometry.validate().map_err(|_| Error::Corrupted)?;
        Ok(Meta {
            flags: MetaFlags::from_bits_truncate(flags),
            geometry,
            txnid,
            next_pgno,
            gc_root,
            catalog,
        })
    }
}
