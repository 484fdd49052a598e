use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, trace};
use memmap2::{Advice, Mmap, MmapOptions};
use parking_lot::{Mutex, RwLock};

use crate::config::Geometry;
use crate::constants::{MAX_PAGE_SIZE, META_PAGES, MIN_PAGE_SIZE};
use crate::error::{Error, Result};
use crate::meta::{Meta, META_SIZE};

/// Fixed-size pages over the data file and its read-only mapping.
///
/// Pages are written with positional writes and read back through the
/// mapping. The mapping is replaced whenever the file changes size; readers
/// keep the `Arc` they started with, which stays valid for every page of
/// their snapshot.
#[derive(Debug)]
pub(crate) struct PageStore {
    /// Path of the data file
    path: PathBuf,
    /// Data file
    file: File,
    /// Page size
    psize: usize,
    /// Current mapping
    map: RwLock<Arc<Mmap>>,
    /// Current file size in bytes
    file_size: Mutex<u64>,
    /// Random-access hint for new mappings
    no_readahead: bool,
}

impl PageStore {
    /// Open or create the data file
    pub(crate) fn open_file(path: &Path, read_only: bool, mode: u32) -> Result<File> {
        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true).create(true).mode(mode);
        }
        Ok(options.open(path)?)
    }

    /// Lay out a fresh data file: both meta slots and the initial size
    pub(crate) fn init_file(file: &File, meta: &Meta) -> Result<()> {
        let psize = meta.page_size();
        file.set_len(meta.geometry.now)?;
        for slot in 0..META_PAGES {
            file.write_all_at(&meta.encode(slot)?, slot * psize as u64)?;
        }
        file.sync_all()?;
        Ok(())
    }

    /// Read both meta slots, probing for the page size if slot 0 is unreadable
    pub(crate) fn read_metas(file: &File) -> (Result<Meta>, Result<Meta>) {
        let first = read_meta_at(file, 0);
        let psize = match &first {
            Ok(meta) => meta.page_size(),
            Err(_) => {
                let mut size = MIN_PAGE_SIZE;
                loop {
                    let probe = read_meta_at(file, size as u64);
                    if let Ok(meta) = &probe {
                        if meta.page_size() == size {
                            return (first, probe);
                        }
                    }
                    if size == MAX_PAGE_SIZE {
                        return (first, probe);
                    }
                    size *= 2;
                }
            }
        };
        let second = read_meta_at(file, psize as u64);
        (first, second)
    }

    pub(crate) fn new(path: PathBuf, file: File, psize: usize, no_readahead: bool) -> Result<Self> {
        let file_size = file.metadata()?.len();
        let map = map_file(&file, file_size, no_readahead)?;
        Ok(PageStore {
            path,
            file,
            psize,
            map: RwLock::new(Arc::new(map)),
            file_size: Mutex::new(file_size),
            no_readahead,
        })
    }

    pub(crate) fn page_size(&self) -> usize {
        self.psize
    }

    pub(crate) fn file_size(&self) -> u64 {
        *self.file_size.lock()
    }

    /// Current mapping
    pub(crate) fn map(&self) -> Arc<Mmap> {
        Arc::clone(&self.map.read())
    }

    /// Write encoded pages at their positions
    pub(crate) fn write_pages<'a, I>(&self, pages: I) -> Result<()>
    where
        I: IntoIterator<Item = (u64, &'a [u8])>,
    {
        for (pgno, bytes) in pages {
            trace!("write page {} ({} bytes)", pgno, bytes.len());
            self.file.write_all_at(bytes, pgno * self.psize as u64)?;
        }
        Ok(())
    }

    /// Write a meta record into its slot
    pub(crate) fn write_meta(&self, slot: u64, meta: &Meta) -> Result<()> {
        let bytes = meta.encode(slot)?;
        self.file.write_all_at(&bytes, slot * self.psize as u64)?;
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Grow the file so that `pages` pages fit, in whole growth steps
    pub(crate) fn ensure_pages(&self, pages: u64, geometry: &Geometry) -> Result<()> {
        let needed = pages * self.psize as u64;
        if needed > geometry.upper {
            return Err(Error::MapFull);
        }
        let mut size = self.file_size.lock();
        if needed <= *size {
            return Ok(());
        }
        let step = geometry.growth_step.max(self.psize as u64);
        let grown = (needed.div_ceil(step) * step).min(geometry.upper);
        debug!("growing {} from {} to {} bytes", self.path.display(), *size, grown);
        self.file.set_len(grown).map_err(|_| Error::UnableToExtend)?;
        *size = grown;
        self.remap(grown)
    }

    /// Truncate the unused tail when it exceeds the shrink threshold, or
    /// when the file is larger than the upper bound
    pub(crate) fn maybe_shrink(&self, used_pages: u64, geometry: &Geometry) -> Result<()> {
        let used = used_pages * self.psize as u64;
        let mut size = self.file_size.lock();
        let oversized = *size > geometry.upper;
        let slack = size.saturating_sub(used);
        if !oversized && (geometry.shrink_threshold == 0 || slack <= geometry.shrink_threshold) {
            return Ok(());
        }
        let step = geometry.growth_step.max(self.psize as u64);
        let target = (used.div_ceil(step) * step)
            .max(geometry.lower)
            .min(geometry.upper);
        if target >= *size {
            return Ok(());
        }
        debug!("shrinking {} from {} to {} bytes", self.path.display(), *size, target);
        self.file.set_len(target)?;
        *size = target;
        self.remap(target)
    }

    fn remap(&self, size: u64) -> Result<()> {
        let map = map_file(&self.file, size, self.no_readahead)?;
        *self.map.write() = Arc::new(map);
        Ok(())
    }
}

fn map_file(file: &File, size: u64, no_readahead: bool) -> Result<Mmap> {
    let len = usize::try_from(size).map_err(|_| Error::TooLarge)?;
    let map = unsafe { MmapOptions::new().len(len).map(file)? };
    if no_readahead {
        map.advise(Advice::Random)?;
    }
    Ok(map)
}

fn read_meta_at(file: &File, offset: u64) -> Result<Meta> {
    let mut buf = vec![0u8; META_SIZE];
    file.read_exact_at(&mut buf, offset)?;
    Meta::decode(&buf)
}

/// Bytes of `count` pages starting at `pgno`
pub(crate) fn page_bytes(map: &Mmap, psize: usize, pgno: u64, count: u64) -> Result<&[u8]> {
    let start = usize::try_from(pgno)
        .ok()
        .and_then(|p| p.checked_mul(psize))
        .ok_or(Error::PageNotFound)?;
    let end = start + count as usize * psize;
    if end > map.len() {
        return Err(Error::PageNotFound);
    }
    Ok(&map[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcPolicy;
    use tempfile::TempDir;

    fn geometry() -> Geometry {
        Geometry::default()
            .page_size(1024)
            .size_bounds(0, 8192, 65536)
            .growth_step(4096)
            .shrink_threshold(8192)
            .normalized()
    }

    fn fresh_store(dir: &TempDir) -> PageStore {
        let path = dir.path().join("data.mdb");
        let file = PageStore::open_file(&path, false, 0o644).unwrap();
        PageStore::init_file(&file, &Meta::new(geometry(), GcPolicy::Fifo)).unwrap();
        PageStore::new(path, file, 1024, false).unwrap()
    }

    #[test]
    fn test_init_and_read_metas() {
        let dir = TempDir::new().unwrap();
        let store = fresh_store(&dir);
        assert_eq!(store.file_size(), 8192);
        let file = PageStore::open_file(&dir.path().join("data.mdb"), true, 0o644).unwrap();
        let (a, b) = PageStore::read_metas(&file);
        assert_eq!(a.unwrap().page_size(), 1024);
        assert_eq!(b.unwrap().txnid, 0);
    }

    #[test]
    fn test_probe_second_slot() {
        let dir = TempDir::new().unwrap();
        let store = fresh_store(&dir);
        store.write_pages([(0, &[0u8; 1024][..])]).unwrap();
        let file = PageStore::open_file(&dir.path().join("data.mdb"), true, 0o644).unwrap();
        let (a, b) = PageStore::read_metas(&file);
        assert!(a.is_err());
        assert_eq!(b.unwrap().page_size(), 1024);
    }

    #[test]
    fn test_grow_and_shrink() {
        let dir = TempDir::new().unwrap();
        let store = fresh_store(&dir);
        let geometry = geometry();

        store.ensure_pages(20, &geometry).unwrap();
        assert_eq!(store.file_size(), 20480);
        assert_eq!(store.map().len(), 20480);

        assert!(matches!(store.ensure_pages(65, &geometry), Err(Error::MapFull)));

        store.maybe_shrink(3, &geometry).unwrap();
        assert_eq!(store.file_size(), 4096);
    }

    #[test]
    fn test_shrink_to_lowered_upper_bound() {
        let dir = TempDir::new().unwrap();
        let store = fresh_store(&dir);
        store.ensure_pages(16, &geometry()).unwrap();
        assert_eq!(store.file_size(), 16384);

        let lowered = Geometry {
            upper: 8192,
            shrink_threshold: 0,
            ..geometry()
        };
        store.maybe_shrink(4, &lowered).unwrap();
        assert_eq!(store.file_size(), 4096);
        assert_eq!(store.map().len(), 4096);
    }

    #[test]
    fn test_page_bytes_bounds() {
        let dir = TempDir::new().unwrap();
        let store = fresh_store(&dir);
        let map = store.map();
        assert_eq!(page_bytes(&map, 1024, 7, 1).unwrap().len(), 1024);
        assert!(matches!(page_bytes(&map, 1024, 8, 1), Err(Error::PageNotFound)));
    }
}
