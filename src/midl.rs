/// A page number
pub(crate) type Pgno = u64;

/// ID List - a sorted, duplicate-free list of page numbers in ascending order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Idl {
    ids: Vec<Pgno>,
}

impl Idl {
    pub(crate) fn new() -> Self {
        Idl { ids: Vec::new() }
    }

    /// Build from any order of page numbers
    pub(crate) fn from_unsorted(mut ids: Vec<Pgno>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Idl { ids }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    pub(crate) fn as_slice(&self) -> &[Pgno] {
        &self.ids
    }

    /// Insert keeping order; returns false if already present
    pub(crate) fn insert(&mut self, id: Pgno) -> bool {
        match self.ids.binary_search(&id) {
            Ok(_) => false,
            Err(pos) => {
                self.ids.insert(pos, id);
                true
            }
        }
    }

    /// Merge another list into this one
    pub(crate) fn merge(&mut self, other: &[Pgno]) {
        if other.is_empty() {
            return;
        }
        let mut merged = Vec::with_capacity(self.ids.len() + other.len());
        let (mut i, mut j) = (0, 0);
        while i < self.ids.len() && j < other.len() {
            let (a, b) = (self.ids[i], other[j]);
            if a < b {
                merged.push(a);
                i += 1;
            } else {
                if a == b {
                    i += 1;
                }
                merged.push(b);
                j += 1;
            }
        }
        merged.extend_from_slice(&self.ids[i..]);
        merged.extend_from_slice(&other[j..]);
        merged.dedup();
        self.ids = merged;
    }

    /// Take the lowest id
    pub(crate) fn pop_first(&mut self) -> Option<Pgno> {
        if self.ids.is_empty() {
            None
        } else {
            Some(self.ids.remove(0))
        }
    }

    /// Remove and return the first run of `n` consecutive ids
    pub(crate) fn take_run(&mut self, n: usize) -> Option<Pgno> {
        if n == 0 || self.ids.len() < n {
            return None;
        }
        let start = (0..=self.ids.len() - n).find(|&i| self.ids[i + n - 1] - self.ids[i] == (n - 1) as u64)?;
        let first = self.ids[start];
        self.ids.drain(start..start + n);
        Some(first)
    }

    /// Drop ids adjacent to `end` (the first unused page) and return the lowered end
    pub(crate) fn trim_tail(&mut self, mut end: Pgno) -> Pgno {
        while let Some(&last) = self.ids.last() {
            if last + 1 != end {
                break;
            }
            self.ids.pop();
            end = last;
        }
        end
    }
}

impl Extend<Pgno> for Idl {
    fn extend<T: IntoIterator<Item = Pgno>>(&mut self, iter: T) {
        let other = Idl::from_unsorted(iter.into_iter().collect());
        self.merge(other.as_slice());
    }
}
