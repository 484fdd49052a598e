use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::constants::{NodeFlags, PageFlags};
use crate::error::{Error, Result};
use crate::meta::{TreeInfo, TABLE_RECORD_SIZE, TREE_INFO_SIZE};

/// Size of the common page header: pgno, flags, count, overflow pages
pub(crate) const PAGE_HEADER_SIZE: usize = 16;
/// Fixed part of a leaf node: flags, key size, data size
const LEAF_NODE_HEADER: usize = 1 + 2 + 4;
/// Fixed part of a branch node: child pgno, key size
const BRANCH_NODE_HEADER: usize = 8 + 2;
/// Encoded size of an overflow reference
const OVERFLOW_REF_SIZE: usize = 16;

/// Payload of a leaf node
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NodeData {
    /// Value stored in the node
    Inline(Vec<u8>),
    /// Value stored in a run of overflow pages
    Overflow { pgno: u64, len: u64 },
    /// Sorted duplicate values kept in a nested tree
    SubTree(TreeInfo),
}

impl NodeData {
    fn encoded_len(&self) -> usize {
        match self {
            NodeData::Inline(v) => v.len(),
            NodeData::Overflow { .. } => OVERFLOW_REF_SIZE,
            NodeData::SubTree(_) => TREE_INFO_SIZE,
        }
    }
}

/// Key/data node on a leaf page
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LeafEntry {
    pub(crate) key: Vec<u8>,
    pub(crate) data: NodeData,
}

impl LeafEntry {
    pub(crate) fn size(&self) -> usize {
        leaf_node_size(self.key.len(), &self.data)
    }
}

/// Internal page: `children[i]` holds keys in `[keys[i], keys[i + 1])`, `keys[0]` is unused
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Branch {
    pub(crate) keys: Vec<Vec<u8>>,
    pub(crate) children: Vec<u64>,
}

/// Leaf page
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Leaf {
    pub(crate) entries: Vec<LeafEntry>,
}

/// Decoded tree page
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Page {
    Branch(Branch),
    Leaf(Leaf),
}

pub(crate) fn leaf_node_size(key_len: usize, data: &NodeData) -> usize {
    LEAF_NODE_HEADER + key_len + data.encoded_len()
}

pub(crate) fn branch_node_size(key_len: usize) -> usize {
    BRANCH_NODE_HEADER + key_len
}

/// Largest node a page of `psize` bytes accepts while still holding two nodes
pub(crate) fn node_max(psize: usize) -> usize {
    (psize - PAGE_HEADER_SIZE) / 2
}

/// Largest key, so that any node flavour carrying it still fits
pub(crate) fn max_key_size(psize: usize) -> usize {
    node_max(psize) - LEAF_NODE_HEADER - TREE_INFO_SIZE
}

/// Longest table name whose catalog record stays inline
pub(crate) fn max_table_name(psize: usize) -> usize {
    node_max(psize) - LEAF_NODE_HEADER - TABLE_RECORD_SIZE
}

/// Whether a value must move to overflow pages
pub(crate) fn needs_overflow(psize: usize, key_len: usize, value_len: usize) -> bool {
    LEAF_NODE_HEADER + key_len + value_len > node_max(psize)
}

/// Pages occupied by an overflow run holding `len` bytes
pub(crate) fn overflow_pages(psize: usize, len: usize) -> u64 {
    (PAGE_HEADER_SIZE + len).div_ceil(psize) as u64
}

/// Bytes available for nodes on a page
pub(crate) fn page_capacity(psize: usize) -> usize {
    psize - PAGE_HEADER_SIZE
}

fn header(buf: &mut Vec<u8>, pgno: u64, flags: PageFlags, count: u16, pages: u32) -> Result<()> {
    buf.write_u64::<LittleEndian>(pgno)?;
    buf.write_u16::<LittleEndian>(flags.bits())?;
    buf.write_u16::<LittleEndian>(count)?;
    buf.write_u32::<LittleEndian>(pages)?;
    Ok(())
}

/// Parsed page header
#[derive(Debug, Clone, Copy)]
pub(crate) struct PageHeader {
    pub(crate) pgno: u64,
    pub(crate) flags: PageFlags,
    pub(crate) count: u16,
    pub(crate) pages: u32,
}

impl PageHeader {
    pub(crate) fn read(bytes: &[u8], expect: u64) -> Result<Self> {
        let mut r = bytes;
        let pgno = r.read_u64::<LittleEndian>().map_err(|e| Error::Decode("pgno", e))?;
        let flags = r.read_u16::<LittleEndian>().map_err(|e| Error::Decode("page flags", e))?;
        let count = r.read_u16::<LittleEndian>().map_err(|e| Error::Decode("count", e))?;
        let pages = r.read_u32::<LittleEndian>().map_err(|e| Error::Decode("pages", e))?;
        if pgno != expect {
            return Err(Error::Corrupted);
        }
        Ok(PageHeader {
            pgno,
            flags: PageFlags::from_bits(flags).ok_or(Error::Corrupted)?,
            count,
            pages,
        })
    }
}

impl Page {
    pub(crate) fn len(&self) -> usize {
        match self {
            Page::Branch(b) => b.children.len(),
            Page::Leaf(l) => l.entries.len(),
        }
    }

    /// Bytes used by nodes, header excluded
    pub(crate) fn used(&self) -> usize {
        match self {
            Page::Branch(b) => b.keys.iter().skip(1).map(|k| k.len()).sum::<usize>()
                + b.children.len() * BRANCH_NODE_HEADER,
            Page::Leaf(l) => l.entries.iter().map(LeafEntry::size).sum(),
        }
    }

    pub(crate) fn encode(&self, pgno: u64, psize: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(psize);
        match self {
            Page::Branch(branch) => {
                header(&mut buf, pgno, PageFlags::BRANCH, branch.children.len() as u16, 0)?;
                for (i, child) in branch.children.iter().enumerate() {
                    let key: &[u8] = if i == 0 { &[] } else { &branch.keys[i] };
                    buf.write_u64::<LittleEndian>(*child)?;
                    buf.write_u16::<LittleEndian>(key.len() as u16)?;
                    buf.extend_from_slice(key);
                }
            }
            Page::Leaf(leaf) => {
                header(&mut buf, pgno, PageFlags::LEAF, leaf.entries.len() as u16, 0)?;
                for entry in &leaf.entries {
                    let flags = match entry.data {
                        NodeData::Inline(_) => NodeFlags::empty(),
                        NodeData::Overflow { .. } => NodeFlags::BIGDATA,
                        NodeData::SubTree(_) => NodeFlags::SUBDATA,
                    };
                    buf.write_u8(flags.bits())?;
                    buf.write_u16::<LittleEndian>(entry.key.len() as u16)?;
                    buf.write_u32::<LittleEndian>(entry.data.encoded_len() as u32)?;
                    buf.extend_from_slice(&entry.key);
                    match &entry.data {
                        NodeData::Inline(v) => buf.extend_from_slice(v),
                        NodeData::Overflow { pgno, len } => {
                            buf.write_u64::<LittleEndian>(*pgno)?;
                            buf.write_u64::<LittleEndian>(*len)?;
                        }
                        NodeData::SubTree(info) => info.write_to(&mut buf)?,
                    }
                }
            }
        }
        if buf.len() > psize {
            return Err(Error::Corrupted);
        }
        buf.resize(psize, 0);
        Ok(buf)
    }

    pub(crate) fn decode(bytes: &[u8], pgno: u64) -> Result<Self> {
        let hdr = PageHeader::read(bytes, pgno)?;
        let mut r = &bytes[PAGE_HEADER_SIZE..];
        let count = hdr.count as usize;

        if hdr.flags.contains(PageFlags::BRANCH) {
            let mut branch = Branch {
                keys: Vec::with_capacity(count),
                children: Vec::with_capacity(count),
            };
            for _ in 0..count {
                let child = r.read_u64::<LittleEndian>().map_err(|e| Error::Decode("child", e))?;
                let klen = r.read_u16::<LittleEndian>().map_err(|e| Error::Decode("ksize", e))?;
                branch.children.push(child);
                branch.keys.push(take(&mut r, klen as usize)?);
            }
            return Ok(Page::Branch(branch));
        }
        if !hdr.flags.contains(PageFlags::LEAF) {
            return Err(Error::Corrupted);
        }

        let mut leaf = Leaf {
            entries: Vec::with_capacity(count),
        };
        for _ in 0..count {
            let flags = r.read_u8().map_err(|e| Error::Decode("node flags", e))?;
            let flags = NodeFlags::from_bits(flags).ok_or(Error::Corrupted)?;
            let klen = r.read_u16::<LittleEndian>().map_err(|e| Error::Decode("ksize", e))?;
            let dlen = r.read_u32::<LittleEndian>().map_err(|e| Error::Decode("dsize", e))?;
            let key = take(&mut r, klen as usize)?;
            let data = if flags.contains(NodeFlags::BIGDATA) {
                let pgno = r.read_u64::<LittleEndian>().map_err(|e| Error::Decode("ovpgno", e))?;
                let len = r.read_u64::<LittleEndian>().map_err(|e| Error::Decode("ovlen", e))?;
                NodeData::Overflow { pgno, len }
            } else if flags.contains(NodeFlags::SUBDATA) {
                NodeData::SubTree(TreeInfo::read_from(&mut r)?)
            } else {
                NodeData::Inline(take(&mut r, dlen as usize)?)
            };
            leaf.entries.push(LeafEntry { key, data });
        }
        Ok(Page::Leaf(leaf))
    }
}

fn take(r: &mut &[u8], len: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; len];
    r.read_exact(&mut out).map_err(|e| Error::Decode("node bytes", e))?;
    Ok(out)
}

/// Encode a value into a run of overflow pages
pub(crate) fn encode_overflow(pgno: u64, data: &[u8], psize: usize) -> Result<Vec<u8>> {
    let pages = overflow_pages(psize, data.len());
    let mut buf = Vec::with_capacity(pages as usize * psize);
    header(&mut buf, pgno, PageFlags::OVERFLOW, 0, pages as u32)?;
    buf.extend_from_slice(data);
    buf.resize(pages as usize * psize, 0);
    Ok(buf)
}

/// Read a value back from an overflow run
pub(crate) fn decode_overflow(bytes: &[u8], pgno: u64, len: usize) -> Result<Vec<u8>> {
    let hdr = PageHeader::read(bytes, pgno)?;
    if !hdr.flags.contains(PageFlags::OVERFLOW) || bytes.len() < PAGE_HEADER_SIZE + len {
        return Err(Error::Corrupted);
    }
    Ok(bytes[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + len].to_vec())
}

/// Words of free-list data that fit on one chain page
pub(crate) fn freelist_capacity(psize: usize) -> usize {
    (psize - PAGE_HEADER_SIZE - 8) / 8
}

/// Encode one page of the free-list chain
pub(crate) fn encode_freelist(pgno: u64, next: u64, words: &[u64], psize: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(psize);
    header(&mut buf, pgno, PageFlags::FREELIST, words.len() as u16, 0)?;
    buf.write_u64::<LittleEndian>(next)?;
    for word in words {
        buf.write_u64::<LittleEndian>(*word)?;
    }
    buf.resize(psize, 0);
    Ok(buf)
}

/// Decode one page of the free-list chain into `(next, words)`
pub(crate) fn decode_freelist(bytes: &[u8], pgno: u64) -> Result<(u64, Vec<u64>)> {
    let hdr = PageHeader::read(bytes, pgno)?;
    if !hdr.flags.contains(PageFlags::FREELIST) {
        return Err(Error::Corrupted);
    }
    let mut r = &bytes[PAGE_HEADER_SIZE..];
    let next = r.read_u64::<LittleEndian>().map_err(|e| Error::Decode("gc next", e))?;
    let mut words = Vec::with_capacity(hdr.count as usize);
    for _ in 0..hdr.count {
        words.push(r.read_u64::<LittleEndian>().map_err(|e| Error::Decode("gc word", e))?);
    }
    Ok((next, words))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_page_roundtrip() {
        let leaf = Page::Leaf(Leaf {
            entries: vec![
                LeafEntry {
                    key: b"".to_vec(),
                    data: NodeData::Inline(b"empty key".to_vec()),
                },
                LeafEntry {
                    key: b"big".to_vec(),
                    data: NodeData::Overflow { pgno: 40, len: 9000 },
                },
                LeafEntry {
                    key: b"dups".to_vec(),
                    data: NodeData::SubTree(TreeInfo {
                        root: 7,
                        depth: 1,
                        entries: 3,
                        ..Default::default()
                    }),
                },
            ],
        });
        let bytes = leaf.encode(3, 512).unwrap();
        assert_eq!(bytes.len(), 512);
        assert_eq!(Page::decode(&bytes, 3).unwrap(), leaf);
        assert_eq!(leaf.used(), 7 + 9 + 7 + 3 + 16 + 7 + 4 + TREE_INFO_SIZE);
    }

    #[test]
    fn test_branch_ignores_first_key() {
        let branch = Page::Branch(Branch {
            keys: vec![b"ignored".to_vec(), b"m".to_vec()],
            children: vec![4, 5],
        });
        let decoded = Page::decode(&branch.encode(9, 256).unwrap(), 9).unwrap();
        match decoded {
            Page::Branch(b) => {
                assert!(b.keys[0].is_empty());
                assert_eq!(b.keys[1], b"m");
                assert_eq!(b.children, vec![4, 5]);
            }
            Page::Leaf(_) => panic!("expected branch"),
        }
    }

    #[test]
    fn test_wrong_pgno_is_corruption() {
        let bytes = Page::Leaf(Leaf::default()).encode(3, 256).unwrap();
        assert!(matches!(Page::decode(&bytes, 4), Err(Error::Corrupted)));
    }

    #[test]
    fn test_overflow_roundtrip() {
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let bytes = encode_overflow(11, &data, 256).unwrap();
        assert_eq!(bytes.len() as u64, overflow_pages(256, 1000) * 256);
        assert_eq!(decode_overflow(&bytes, 11, 1000).unwrap(), data);
    }

    #[test]
    fn test_freelist_page() {
        let words = [3u64, 2, 10, 11];
        let bytes = encode_freelist(6, 8, &words, 256).unwrap();
        assert_eq!(decode_freelist(&bytes, 6).unwrap(), (8, words.to_vec()));
        assert_eq!(freelist_capacity(256), 29);
    }

    #[test]
    fn test_size_limits() {
        assert_eq!(node_max(4096), 2040);
        assert!(max_key_size(256) > 32);
        assert!(!needs_overflow(4096, max_table_name(4096), TABLE_RECORD_SIZE));
        assert!(needs_overflow(4096, max_table_name(4096) + 1, TABLE_RECORD_SIZE));
        assert!(!needs_overflow(4096, 10, 100));
        assert!(needs_overflow(4096, 10, 3000));
    }
}
