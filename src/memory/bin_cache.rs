use super::record::AllocationRecord;
use super::stats;
use std::collections::BTreeMap;

/// Freed records parked per bin, awaiting reuse or eviction.
///
/// Each bin keeps its records in a `BTreeMap` keyed by real size, so reuse is
/// a best-fit range lookup: the smallest cached size that covers the request.
/// Records of equal size are stacked; the most recently freed one is reissued
/// first.
///
/// Not synchronised: the owning allocator keeps it behind its lock.
pub(crate) struct BinCache {
    bins: Vec<BTreeMap<usize, Vec<AllocationRecord>>>,
    cached_bytes: usize,
    cached_records: usize,
}

impl BinCache {
    pub fn new(bin_count: usize) -> Self {
        Self {
            bins: (0..bin_count).map(|_| BTreeMap::new()).collect(),
            cached_bytes: 0,
            cached_records: 0,
        }
    }

    pub fn insert(&mut self, bin: usize, record: AllocationRecord) {
        let size = record.size();
        self.bins[bin].entry(size).or_default().push(record);
        self.cached_bytes += size;
        self.cached_records += 1;
        stats::BUFFERED_CACHED.add(size);
    }

    /// Remove and return the smallest record in `bin` whose size lies in
    /// `min..=max`.
    pub fn take_best_fit(
        &mut self,
        bin: usize,
        min: usize,
        max: usize,
    ) -> Option<AllocationRecord> {
        if min > max {
            return None;
        }
        let map = &mut self.bins[bin];
        let (&size, list) = map.range_mut(min..=max).next()?;
        let record = list.pop()?;
        if list.is_empty() {
            map.remove(&size);
        }
        self.cached_bytes -= size;
        self.cached_records -= 1;
        stats::BUFFERED_CACHED.sub(size);
        Some(record)
    }

    /// Remove every record, smallest bin first. The cache is empty when this
    /// returns.
    pub fn drain_all(&mut self) -> Vec<AllocationRecord> {
        let mut out = Vec::with_capacity(self.cached_records);
        for map in &mut self.bins {
            for (_, list) in std::mem::take(map) {
                out.extend(list);
            }
        }
        stats::BUFFERED_CACHED.sub(self.cached_bytes);
        self.cached_bytes = 0;
        self.cached_records = 0;
        out
    }

    /// Remove records, largest real size first (across all bins), until the
    /// cached total is at most `target` bytes.
    pub fn drain_to(&mut self, target: usize) -> Vec<AllocationRecord> {
        let mut out = Vec::new();
        while self.cached_bytes > target {
            let Some((bin, size)) = self.largest() else {
                break;
            };
            let map = &mut self.bins[bin];
            let Some(list) = map.get_mut(&size) else {
                break;
            };
            if let Some(record) = list.pop() {
                self.cached_bytes -= size;
                self.cached_records -= 1;
                stats::BUFFERED_CACHED.sub(size);
                out.push(record);
            }
            if list.is_empty() {
                map.remove(&size);
            }
        }
        out
    }

    /// Bin and size of the largest cached record.
    fn largest(&self) -> Option<(usize, usize)> {
        self.bins
            .iter()
            .enumerate()
            .filter_map(|(bin, map)| map.keys().next_back().map(|&size| (bin, size)))
            .max_by_key(|&(_, size)| size)
    }

    #[inline]
    pub fn cached_bytes(&self) -> usize {
        self.cached_bytes
    }

    #[inline]
    pub fn cached_records(&self) -> usize {
        self.cached_records
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cached_records == 0
    }

    #[cfg(test)]
    pub fn bin_len(&self, bin: usize) -> usize {
        self.bins[bin].values().map(Vec::len).sum()
    }
}

impl Drop for BinCache {
    fn drop(&mut self) {
        // Records still here were never evicted: their regions leak, but the
        // global gauge must not keep counting them.
        stats::BUFFERED_CACHED.sub(self.cached_bytes);
    }
}
