//! An ordered map keyed by half-open ranges, with overlap rejection.
//!
//! [`RangeMap`] stores disjoint `start..end` ranges in a `BTreeMap` keyed by
//! range start. Insertion refuses any range that overlaps an existing entry,
//! which lets callers treat "no two registered ranges overlap" as a structural
//! invariant instead of something to re-check on every query.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::collections::btree_map::{BTreeMap, Entry, Iter};
use core::ops::Range;

#[derive(Debug, Default)]
pub struct RangeMap<K, V> {
    inner: BTreeMap<K, (Range<K>, V)>,
}

impl<K: Ord + Copy, V> RangeMap<K, V> {
    pub const fn new() -> Self {
        RangeMap {
            inner: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Insert `range` mapping to `value`.
    ///
    /// Fails, handing `value` back, if `range` is empty or overlaps any
    /// entry already in the map.
    pub fn try_insert(&mut self, range: Range<K>, value: V) -> Result<(), V> {
        if range.start >= range.end {
            return Err(value);
        }
        // The only candidates for overlap are the nearest entry starting at
        // or below `range.start` and the nearest one starting above it.
        if let Some((_, (prev, _))) = self.inner.range(..=range.start).next_back() {
            if prev.end > range.start {
                return Err(value);
            }
        }
        if let Some((_, (next, _))) = self.inner.range(range.start..).next() {
            if next.start < range.end {
                return Err(value);
            }
        }
        self.inner.insert(range.start, (range, value));
        Ok(())
    }

    /// Remove the entry whose range is exactly `range`, if there is one.
    pub fn remove_exact(&mut self, range: Range<K>) -> Option<V> {
        match self.inner.entry(range.start) {
            Entry::Occupied(ent) if ent.get().0 == range => Some(ent.remove().1),
            _ => None,
        }
    }

    /// Find the entry whose range contains `key`.
    pub fn get_contained(&self, key: &K) -> Option<(&Range<K>, &V)> {
        self.inner
            .range(..=*key)
            .next_back()
            .map(|(_, (range, value))| (range, value))
            .filter(|(range, _)| *key < range.end)
    }

    #[inline]
    pub fn iter(&self) -> Iter<'_, K, (Range<K>, V)> {
        self.inner.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_disjoint() {
        let mut map = RangeMap::new();
        assert!(map.try_insert(10..20, 'a').is_ok());
        assert!(map.try_insert(30..40, 'b').is_ok());
        assert!(map.try_insert(20..30, 'c').is_ok());
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn insert_overlap_rejected() {
        let mut map = RangeMap::new();
        map.try_insert(10..20, 'a').unwrap();

        assert_eq!(map.try_insert(5..11, 'x'), Err('x'));
        assert_eq!(map.try_insert(19..25, 'x'), Err('x'));
        assert_eq!(map.try_insert(12..15, 'x'), Err('x'));
        assert_eq!(map.try_insert(5..25, 'x'), Err('x'));
        assert_eq!(map.try_insert(10..20, 'x'), Err('x'));
        // Empty ranges are never valid keys.
        assert_eq!(map.try_insert(7..7, 'x'), Err('x'));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn point_query() {
        let mut map = RangeMap::new();
        map.try_insert(10..20, 'a').unwrap();
        map.try_insert(40..50, 'b').unwrap();

        assert_eq!(map.get_contained(&10), Some((&(10..20), &'a')));
        assert_eq!(map.get_contained(&19), Some((&(10..20), &'a')));
        assert_eq!(map.get_contained(&20), None);
        assert_eq!(map.get_contained(&9), None);
        assert_eq!(map.get_contained(&45), Some((&(40..50), &'b')));
    }

    #[test]
    fn remove_exact_only() {
        let mut map = RangeMap::new();
        map.try_insert(10..20, 'a').unwrap();

        assert_eq!(map.remove_exact(10..19), None);
        assert_eq!(map.remove_exact(11..20), None);
        assert_eq!(map.remove_exact(10..20), Some('a'));
        assert_eq!(map.remove_exact(10..20), None);
        assert!(map.is_empty());
    }
}
