//! Snapshot bookkeeping: which meta is the head, which snapshots readers
//! hold, and which freed pages may be handed out again.

use std::collections::BTreeMap;
use std::thread::ThreadId;

use log::{info, warn};
use memmap2::Mmap;
use parking_lot::Mutex;

use crate::config::GcPolicy;
use crate::constants::META_PAGES;
use crate::error::{Error, Result};
use crate::meta::Meta;
use crate::midl::{Idl, Pgno};
use crate::page;
use crate::store::page_bytes;
use crate::types::ReaderInfo;

/// The published snapshot and the last one known to be on disk
#[derive(Debug, Clone)]
pub(crate) struct HeadState {
    /// Most recent committed meta
    pub(crate) meta: Meta,
    /// Slot holding `meta`
    pub(crate) slot: u64,
    /// Slot holding the last steady meta
    pub(crate) steady_slot: u64,
    /// Txn id of the last steady meta
    pub(crate) steady_txnid: u64,
}

impl HeadState {
    /// Slot the next commit writes to. The steady slot is never overwritten
    /// by a non-steady meta.
    pub(crate) fn next_slot(&self) -> u64 {
        (self.steady_slot + 1) % META_PAGES
    }

    /// Record a newly written meta
    pub(crate) fn publish(&mut self, meta: Meta, slot: u64) {
        if meta.is_steady() {
            self.steady_slot = slot;
            self.steady_txnid = meta.txnid;
        }
        self.meta = meta;
        self.slot = slot;
    }
}

/// Choose the head among the two meta slots.
///
/// The highest valid txn id wins. A non-steady head is replaced by the
/// steady meta in the other slot when `rollback` is allowed.
pub(crate) fn recover(metas: [Result<Meta>; 2], rollback: bool) -> Result<HeadState> {
    let [first, second] = metas;
    let valid: Vec<(u64, Meta)> = [first, second]
        .into_iter()
        .enumerate()
        .filter_map(|(slot, meta)| match meta {
            Ok(meta) => Some((slot as u64, meta)),
            Err(e) => {
                warn!("meta slot {} rejected: {}", slot, e);
                None
            }
        })
        .collect();

    let head = valid
        .iter()
        .max_by(|a, b| a.1.txnid.cmp(&b.1.txnid).then(b.0.cmp(&a.0)))
        .cloned()
        .ok_or(Error::Invalid)?;
    let steady = valid
        .iter()
        .filter(|(_, m)| m.is_steady())
        .max_by_key(|(_, m)| m.txnid)
        .cloned();

    let (slot, meta) = match (&steady, head.1.is_steady()) {
        (Some(steady), false) if rollback => {
            warn!(
                "rolling back from weak txn {} to steady txn {}",
                head.1.txnid, steady.1.txnid
            );
            steady.clone()
        }
        _ => head,
    };
    let (steady_slot, steady_txnid) = match steady {
        Some((s, m)) if m.txnid <= meta.txnid => (s, m.txnid),
        _ => (slot, meta.txnid),
    };
    info!("recovered txn {} from meta slot {}", meta.txnid, slot);
    Ok(HeadState {
        meta,
        slot,
        steady_slot,
        steady_txnid,
    })
}

/// Pick the error to report when neither meta slot is usable
pub(crate) fn meta_failure(metas: &[Result<Meta>; 2]) -> Error {
    let failed = |pred: fn(&Error) -> bool| metas.iter().any(|m| matches!(m, Err(e) if pred(e)));
    if failed(|e| matches!(e, Error::VersionMismatch)) {
        Error::VersionMismatch
    } else if failed(|e| matches!(e, Error::Corrupted)) {
        Error::Corrupted
    } else {
        Error::Invalid
    }
}

#[derive(Debug, Clone)]
struct ReaderSlot {
    txnid: Option<u64>,
    /// Pages allocated in the pinned snapshot
    pages: u64,
    thread: Option<ThreadId>,
}

/// Reader slots of the environment, each pinning one snapshot
#[derive(Debug)]
pub(crate) struct ReaderTable {
    slots: Mutex<Vec<Option<ReaderSlot>>>,
    max: usize,
}

impl ReaderTable {
    pub(crate) fn new(max: u32) -> Self {
        ReaderTable {
            slots: Mutex::new(Vec::new()),
            max: max as usize,
        }
    }

    pub(crate) fn max(&self) -> u32 {
        self.max as u32
    }

    /// Claim a slot for a snapshot
    pub(crate) fn acquire(&self, snapshot: &Meta, thread: Option<ThreadId>) -> Result<usize> {
        let mut slots = self.slots.lock();
        let entry = ReaderSlot {
            txnid: Some(snapshot.txnid),
            pages: snapshot.next_pgno,
            thread,
        };
        if let Some(idx) = slots.iter().position(Option::is_none) {
            slots[idx] = Some(entry);
            return Ok(idx);
        }
        if slots.len() >= self.max {
            return Err(Error::ReadersFull);
        }
        slots.push(Some(entry));
        Ok(slots.len() - 1)
    }

    /// Point a held slot at another snapshot, or at none while reset
    pub(crate) fn rebind(&self, slot: usize, snapshot: Option<&Meta>) {
        if let Some(Some(entry)) = self.slots.lock().get_mut(slot) {
            entry.txnid = snapshot.map(|m| m.txnid);
            entry.pages = snapshot.map_or(0, |m| m.next_pgno);
        }
    }

    pub(crate) fn release(&self, slot: usize) {
        let mut slots = self.slots.lock();
        if let Some(entry) = slots.get_mut(slot) {
            *entry = None;
        }
        while matches!(slots.last(), Some(None)) {
            slots.pop();
        }
    }

    /// Oldest snapshot still pinned by a reader
    pub(crate) fn oldest(&self) -> Option<u64> {
        self.slots
            .lock()
            .iter()
            .flatten()
            .filter_map(|slot| slot.txnid)
            .min()
    }

    /// Pages the file must keep for every pinned snapshot's mapping
    pub(crate) fn pinned_pages(&self) -> u64 {
        self.slots
            .lock()
            .iter()
            .flatten()
            .map(|slot| slot.pages)
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn count(&self) -> u32 {
        self.slots.lock().iter().flatten().count() as u32
    }

    pub(crate) fn list(&self) -> Vec<ReaderInfo> {
        self.slots
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| {
                entry.as_ref().map(|e| ReaderInfo {
                    slot,
                    txnid: e.txnid,
                    thread: e.thread,
                })
            })
            .collect()
    }
}

/// Freed page lists keyed by the id of the transaction that freed them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FreeList {
    records: BTreeMap<u64, Idl>,
}

impl FreeList {
    /// Total number of free pages
    pub(crate) fn pages(&self) -> usize {
        self.records.values().map(Idl::len).sum()
    }

    /// Add pages under a txn id, merging with an existing record
    pub(crate) fn add(&mut self, txnid: u64, pages: &[Pgno]) {
        if pages.is_empty() {
            return;
        }
        let pages = Idl::from_unsorted(pages.to_vec());
        self.records.entry(txnid).or_default().merge(pages.as_slice());
    }

    /// Take the next record that no snapshot older than `oldest` can see
    pub(crate) fn take_reclaimable(&mut self, oldest: u64, policy: GcPolicy) -> Option<(u64, Idl)> {
        let txnid = match policy {
            GcPolicy::Fifo => *self.records.keys().next()?,
            GcPolicy::Lifo => *self.records.range(..oldest).next_back()?.0,
        };
        if txnid >= oldest {
            return None;
        }
        self.records.remove(&txnid).map(|pages| (txnid, pages))
    }

    /// Flatten into `[txnid, count, pgno...]*`
    pub(crate) fn encode_words(&self) -> Vec<u64> {
        let mut words = Vec::with_capacity(self.records.len() * 2 + self.pages());
        for (txnid, pages) in &self.records {
            words.push(*txnid);
            words.push(pages.len() as u64);
            words.extend_from_slice(pages.as_slice());
        }
        words
    }

    pub(crate) fn decode_words(words: &[u64]) -> Result<Self> {
        let mut list = FreeList::default();
        let mut rest = words;
        while !rest.is_empty() {
            if rest.len() < 2 {
                return Err(Error::Corrupted);
            }
            let (txnid, count) = (rest[0], rest[1] as usize);
            let pages = rest.get(2..2 + count).ok_or(Error::Corrupted)?;
            list.add(txnid, pages);
            rest = &rest[2 + count..];
        }
        Ok(list)
    }

    /// Load the chain rooted at `root`, returning the list and the chain pages
    pub(crate) fn load(map: &Mmap, psize: usize, root: Pgno) -> Result<(Self, Vec<Pgno>)> {
        let mut words = Vec::new();
        let mut chain = Vec::new();
        let mut pgno = root;
        while pgno != 0 {
            if chain.len() as u64 > map.len() as u64 / psize as u64 {
                return Err(Error::Corrupted);
            }
            let (next, mut chunk) = page::decode_freelist(page_bytes(map, psize, pgno, 1)?, pgno)?;
            chain.push(pgno);
            words.append(&mut chunk);
            pgno = next;
        }
        Ok((Self::decode_words(&words)?, chain))
    }
}

/// Reuse bound for free-list records: pages freed by a txn below it are
/// reachable from no live snapshot. Callers pass the bounds already raised
/// past the head and the pinned steady snapshot; a reader's own snapshot
/// id counts as-is.
pub(crate) fn oldest_snapshot(head_txnid: u64, reader: Option<u64>, pinned: Option<u64>) -> u64 {
    [Some(head_txnid), reader, pinned]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(head_txnid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Geometry;
    use crate::constants::MetaFlags;

    fn meta(txnid: u64, steady: bool) -> Meta {
        let mut meta = Meta::new(Geometry::default().page_size(4096), GcPolicy::Fifo);
        meta.txnid = txnid;
        meta.flags.set(MetaFlags::STEADY, steady);
        meta
    }

    #[test]
    fn test_recover_picks_highest() {
        let head = recover([Ok(meta(4, true)), Ok(meta(5, true))], true).unwrap();
        assert_eq!(head.meta.txnid, 5);
        assert_eq!(head.slot, 1);
        assert_eq!(head.next_slot(), 0);
    }

    #[test]
    fn test_recover_skips_damaged_slot() {
        let head = recover([Ok(meta(4, true)), Err(Error::Corrupted)], true).unwrap();
        assert_eq!(head.meta.txnid, 4);
        assert!(matches!(
            recover([Err(Error::Invalid), Err(Error::Corrupted)], true),
            Err(Error::Invalid)
        ));
    }

    #[test]
    fn test_recover_rolls_back_weak_head() {
        let metas = || [Ok(meta(7, true)), Ok(meta(9, false))];
        let head = recover(metas(), true).unwrap();
        assert_eq!(head.meta.txnid, 7);
        assert_eq!(head.slot, 0);

        let head = recover(metas(), false).unwrap();
        assert_eq!(head.meta.txnid, 9);
        assert_eq!(head.steady_txnid, 7);
        assert_eq!(head.next_slot(), 1);
    }

    #[test]
    fn test_meta_failure_precedence() {
        let metas = [Err(Error::Invalid), Err(Error::VersionMismatch)];
        assert!(matches!(meta_failure(&metas), Error::VersionMismatch));
        let metas = [Err(Error::Corrupted), Err(Error::Invalid)];
        assert!(matches!(meta_failure(&metas), Error::Corrupted));
    }

    #[test]
    fn test_reader_table() {
        let table = ReaderTable::new(2);
        let mut older = meta(3, true);
        older.next_pgno = 40;
        let a = table.acquire(&meta(5, true), None).unwrap();
        let b = table.acquire(&older, None).unwrap();
        assert!(matches!(table.acquire(&meta(9, true), None), Err(Error::ReadersFull)));
        assert_eq!(table.oldest(), Some(3));
        assert_eq!(table.pinned_pages(), 40);

        table.rebind(b, None);
        assert_eq!(table.oldest(), Some(5));
        assert_eq!(table.pinned_pages(), meta(5, true).next_pgno);
        table.release(a);
        table.release(b);
        assert_eq!(table.count(), 0);
        assert_eq!(table.oldest(), None);
        assert_eq!(table.pinned_pages(), 0);
    }

    #[test]
    fn test_reclaim_policies() {
        let mut list = FreeList::default();
        list.add(2, &[10, 11]);
        list.add(4, &[12]);
        list.add(8, &[13]);

        let mut fifo = list.clone();
        assert_eq!(fifo.take_reclaimable(5, GcPolicy::Fifo).unwrap().0, 2);
        assert_eq!(fifo.take_reclaimable(5, GcPolicy::Fifo).unwrap().0, 4);
        assert!(fifo.take_reclaimable(5, GcPolicy::Fifo).is_none());

        let mut lifo = list;
        assert_eq!(lifo.take_reclaimable(5, GcPolicy::Lifo).unwrap().0, 4);
        assert_eq!(lifo.take_reclaimable(5, GcPolicy::Lifo).unwrap().0, 2);
        assert!(lifo.take_reclaimable(5, GcPolicy::Lifo).is_none());
    }

    #[test]
    fn test_free_list_words() {
        let mut list = FreeList::default();
        list.add(3, &[9, 4]);
        list.add(6, &[20]);
        let words = list.encode_words();
        assert_eq!(words, vec![3, 2, 4, 9, 6, 1, 20]);
        assert_eq!(FreeList::decode_words(&words).unwrap(), list);
        assert!(matches!(FreeList::decode_words(&[3, 5, 1]), Err(Error::Corrupted)));
    }

    #[test]
    fn test_oldest_snapshot() {
        assert_eq!(oldest_snapshot(10, None, None), 10);
        assert_eq!(oldest_snapshot(10, Some(7), None), 7);
        assert_eq!(oldest_snapshot(10, Some(7), Some(4)), 4);
    }
}
