//! C1: the remap table — O(1) primary→spare lookup, dynamic resize,
//! insertion/removal.

use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Minimum bucket count the table is never allowed to shrink below.
pub const MIN_BUCKETS: usize = 64;

/// How an entry was installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryFlags {
    Manual,
    Auto,
    Pending,
}

/// A single primary→spare remap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapEntry {
    pub primary_sector: u64,
    pub spare_sector: u64,
    pub length_sectors: u32,
    pub flags: EntryFlags,
}

impl RemapEntry {
    pub fn primary_end(&self) -> u64 {
        self.primary_sector + self.length_sectors as u64
    }

    pub fn spare_end(&self) -> u64 {
        self.spare_sector + self.length_sectors as u64
    }

    pub fn contains_primary(&self, sector: u64) -> bool {
        sector >= self.primary_sector && sector < self.primary_end()
    }

    /// Translate a primary sector known to be contained in this entry to its
    /// spare counterpart.
    pub fn translate(&self, sector: u64) -> u64 {
        debug_assert!(self.contains_primary(sector));
        self.spare_sector + (sector - self.primary_sector)
    }
}

/// Mixes a sector address for bucket placement with good low-bit
/// distribution. A splitmix64-style finalizer — this table
/// is an internal kernel-adjacent index, not attacker-facing, so a
/// DoS-resistant keyed hash is not required.
fn mix(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    x
}

/// O(1)-lookup primary→spare index. Exact-start lookups (the common case:
/// length-1 entries, which covers every Auto entry) hit one hash bucket.
/// Lookups that fall strictly inside a multi-sector Manual entry fall back
/// to an ordered secondary index.
pub struct RemapTable {
    buckets: Vec<Vec<RemapEntry>>,
    /// primary_start -> primary_end, mirrors every live entry; backs
    /// overlap checks and the multi-sector lookup fallback.
    primary_starts: BTreeMap<u64, u64>,
    /// spare_start -> spare_end, mirrors every live entry; backs the
    /// disjoint-spare-range invariant.
    spare_starts: BTreeMap<u64, u64>,
    entries_count: usize,
    resize_count: u64,
    resize_failures: u64,
    spare_usable_start: u64,
    spare_size_sectors: u64,
    meta_reserved_sectors: u64,
}

impl RemapTable {
    /// `meta_reserved_sectors` and `spare_usable_start`/`spare_size_sectors`
    /// bound the spare ranges this table will accept's
    /// "reserved sectors never handed out" and "spare ranges disjoint and
    /// inside the usable region" invariants.
    pub fn new(meta_reserved_sectors: u64, spare_usable_start: u64, spare_size_sectors: u64) -> Self {
        Self {
            buckets: (0..MIN_BUCKETS).map(|_| Vec::new()).collect(),
            primary_starts: BTreeMap::new(),
            spare_starts: BTreeMap::new(),
            entries_count: 0,
            resize_count: 0,
            resize_failures: 0,
            spare_usable_start,
            spare_size_sectors,
            meta_reserved_sectors,
        }
    }

    pub fn entries_count(&self) -> usize {
        self.entries_count
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn resize_count(&self) -> u64 {
        self.resize_count
    }

    pub fn resize_failures(&self) -> u64 {
        self.resize_failures
    }

    fn bucket_index(&self, primary_sector: u64) -> usize {
        (mix(primary_sector) as usize) & (self.buckets.len() - 1)
    }

    /// `lookup(p)`: returns the entry whose primary range contains `p`.
    /// Expected O(1): one hash, one bounded bucket walk for the exact-start
    /// fast path.
    pub fn lookup(&self, primary_sector: u64) -> Option<RemapEntry> {
        let idx = self.bucket_index(primary_sector);
        if let Some(entry) = self.buckets[idx]
            .iter()
            .find(|e| e.primary_sector == primary_sector)
        {
            return Some(*entry);
        }

        // Fall back to the ordered index for multi-sector entries where
        // `primary_sector` lands strictly inside the range, not at its start.
        let (&start, _) = self.primary_starts.range(..=primary_sector).next_back()?;
        let idx = self.bucket_index(start);
        self.buckets[idx]
            .iter()
            .find(|e| e.primary_sector == start && e.contains_primary(primary_sector))
            .copied()
    }

    /// Entries intersecting `[start, start + len)`, in ascending primary
    /// order. Used by the dispatcher to split a request at remap
    /// boundaries.
    pub fn overlapping(&self, start: u64, len: u32) -> Vec<RemapEntry> {
        let end = start + len as u64;
        let mut out = Vec::new();

        // An entry starting before `start` may still extend into the range.
        if let Some((&pstart, _)) = self.primary_starts.range(..start).next_back() {
            if let Some(e) = self.lookup(pstart) {
                if e.primary_end() > start {
                    out.push(e);
                }
            }
        }
        for (&pstart, _) in self.primary_starts.range(start..end) {
            if let Some(e) = self.lookup(pstart) {
                out.push(e);
            }
        }
        out.sort_by_key(|e| e.primary_sector);
        out.dedup_by_key(|e| e.primary_sector);
        out
    }

    fn check_primary_overlap(&self, start: u64, end: u64) -> Result<()> {
        if let Some((_, &pend)) = self.primary_starts.range(..start).next_back() {
            if pend > start {
                return Err(Error::Overlap { start, end });
            }
        }
        if self.primary_starts.range(start..end).next().is_some() {
            return Err(Error::Overlap { start, end });
        }
        Ok(())
    }

    fn check_spare_overlap(&self, start: u64, end: u64) -> Result<()> {
        if let Some((_, &send)) = self.spare_starts.range(..start).next_back() {
            if send > start {
                return Err(Error::Overlap { start, end });
            }
        }
        if self.spare_starts.range(start..end).next().is_some() {
            return Err(Error::Overlap { start, end });
        }
        Ok(())
    }

    fn check_spare_bounds(&self, start: u64, end: u64) -> Result<()> {
        if start < self.meta_reserved_sectors {
            return Err(Error::ReservedTarget(start));
        }
        if start < self.spare_usable_start || end > self.spare_size_sectors {
            return Err(Error::OutOfRange(start));
        }
        Ok(())
    }

    /// `insert(entry)`: rejects with `Overlap` if the primary range
    /// intersects any existing entry, or the spare range is reserved,
    /// out of range, or overlaps another entry's spare range. On success,
    /// schedules a grow if load factor now exceeds 1.5.
    pub fn insert(&mut self, entry: RemapEntry) -> Result<()> {
        let pstart = entry.primary_sector;
        let pend = entry.primary_end();
        let sstart = entry.spare_sector;
        let send = entry.spare_end();

        self.check_primary_overlap(pstart, pend)?;
        self.check_spare_bounds(sstart, send)?;
        self.check_spare_overlap(sstart, send)?;

        let idx = self.bucket_index(pstart);
        self.buckets[idx].push(entry);
        self.primary_starts.insert(pstart, pend);
        self.spare_starts.insert(sstart, send);
        self.entries_count += 1;

        // entries * 2 > buckets * 3  <=>  load factor > 1.5, integer-only.
        if self.entries_count * 2 > self.buckets.len() * 3 {
            let new_count = self.buckets.len() * 2;
            if let Err(e) = self.resize_to(new_count) {
                log::warn!("remap table grow to {new_count} buckets failed: {e}");
            }
        }
        Ok(())
    }

    /// `remove(p)`: removes the entry starting exactly at `p`. Schedules a
    /// shrink if load factor falls below 0.5 and the table is above the
    /// minimum size.
    pub fn remove(&mut self, primary_sector: u64) -> Result<RemapEntry> {
        let idx = self.bucket_index(primary_sector);
        let pos = self.buckets[idx]
            .iter()
            .position(|e| e.primary_sector == primary_sector)
            .ok_or(Error::NotFound(primary_sector))?;
        let entry = self.buckets[idx].remove(pos);
        self.primary_starts.remove(&entry.primary_sector);
        self.spare_starts.remove(&entry.spare_sector);
        self.entries_count -= 1;

        // entries * 2 < buckets  <=>  load factor < 0.5, integer-only.
        if self.entries_count > 0
            && self.entries_count * 2 < self.buckets.len()
            && self.buckets.len() > MIN_BUCKETS
        {
            let new_count = (self.buckets.len() / 2).max(MIN_BUCKETS);
            if let Err(e) = self.resize_to(new_count) {
                log::warn!("remap table shrink to {new_count} buckets failed: {e}");
            }
        }
        Ok(entry)
    }

    /// Rebuild all chains into `new_count` buckets. A failed allocation
    /// leaves the old table in place and increments `resize_failures`
    ///.
    fn resize_to(&mut self, new_count: usize) -> Result<()> {
        let mut new_buckets: Vec<Vec<RemapEntry>> = Vec::new();
        if new_buckets.try_reserve_exact(new_count).is_err() {
            self.resize_failures += 1;
            return Err(Error::AllocFailure(new_count));
        }
        for _ in 0..new_count {
            new_buckets.push(Vec::new());
        }

        let mask = new_count - 1;
        for bucket in &self.buckets {
            for entry in bucket {
                let idx = (mix(entry.primary_sector) as usize) & mask;
                new_buckets[idx].push(*entry);
            }
        }
        self.buckets = new_buckets;
        self.resize_count += 1;
        Ok(())
    }

    /// Test/diagnostic hook exercising resize_to directly, used to trigger
    /// the `AllocFailure` boundary behavior deterministically without
    /// actually exhausting system memory.
    #[doc(hidden)]
    pub fn force_resize(&mut self, new_count: usize) -> Result<()> {
        self.resize_to(new_count)
    }

    /// Lazily iterate all live entries, in unspecified but (for the
    /// duration of this call) stable order.
    pub fn iter(&self) -> impl Iterator<Item = &RemapEntry> {
        self.buckets.iter().flat_map(|b| b.iter())
    }

    /// Immutable snapshot for persistence, so `MetadataCodec` does not need
    /// to hold the hot-path lock for the whole encode.
    pub fn snapshot(&self) -> Vec<RemapEntry> {
        self.iter().copied().collect()
    }

    pub fn manual_count(&self) -> usize {
        self.iter().filter(|e| e.flags == EntryFlags::Manual).count()
    }

    pub fn auto_count(&self) -> usize {
        self.iter().filter(|e| e.flags == EntryFlags::Auto).count()
    }

    /// Find `length` contiguous free spare sectors, starting the search at
    /// `start_hint` and wrapping once back to the start of the usable region.
    /// Returns `None` if no run of that length is free anywhere in the usable
    /// region.
    pub fn find_free_spare_run(&self, length: u32, start_hint: u64) -> Option<u64> {
        let length = length as u64;
        let lo = self.spare_usable_start;
        let hi = self.spare_size_sectors;
        if length == 0 || hi <= lo || length > hi - lo {
            return None;
        }
        let hint = start_hint.clamp(lo, hi - length);
        self.scan_from(hint, hi, length)
            .or_else(|| self.scan_from(lo, hi, length))
    }

    fn scan_from(&self, from: u64, hi: u64, length: u64) -> Option<u64> {
        let mut cursor = from;
        if let Some((_, &pend)) = self.spare_starts.range(..=cursor).next_back() {
            if pend > cursor {
                cursor = pend;
            }
        }
        for (&ostart, &oend) in self.spare_starts.range(cursor..) {
            if ostart >= hi {
                break;
            }
            if ostart.saturating_sub(cursor) >= length {
                return Some(cursor);
            }
            cursor = cursor.max(oend);
        }
        if cursor + length <= hi {
            Some(cursor)
        } else {
            None
        }
    }
}
