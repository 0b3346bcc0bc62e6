//! Canonical sets of non-overlapping byte ranges.

use std::collections::BTreeMap;
use std::fmt;

/// Ordered set of disjoint, non-adjacent `(offset, length)` ranges.
///
/// Insertion order does not matter: overlapping and touching ranges are
/// always merged into the canonical form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    /// start -> length
    map: BTreeMap<u64, u64>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a range, merging it with anything it overlaps or touches.
    pub fn union_insert(&mut self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let mut start = offset;
        let mut end = offset + length;

        if let Some((&s, &l)) = self.map.range(..=start).next_back() {
            if s + l >= start {
                start = s;
                end = end.max(s + l);
                self.map.remove(&s);
            }
        }

        let following: Vec<(u64, u64)> = self
            .map
            .range(start..=end)
            .map(|(&s, &l)| (s, l))
            .collect();
        for (s, l) in following {
            end = end.max(s + l);
            self.map.remove(&s);
        }

        self.map.insert(start, end - start);
    }

    /// Removes a range, splitting any interval it cuts through.
    pub fn erase(&mut self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let end = offset + length;
        let overlapping: Vec<(u64, u64)> = self
            .map
            .range(..end)
            .rev()
            .take_while(|&(&s, &l)| s + l > offset)
            .map(|(&s, &l)| (s, l))
            .collect();

        for (s, l) in overlapping {
            self.map.remove(&s);
            if s < offset {
                self.map.insert(s, offset - s);
            }
            if s + l > end {
                self.map.insert(end, s + l - end);
            }
        }
    }

    /// Removes every range of `other`.
    pub fn subtract(&mut self, other: &IntervalSet) {
        for (offset, length) in other.iter() {
            self.erase(offset, length);
        }
    }

    /// Ranges present in both sets.
    pub fn intersection_of(a: &IntervalSet, b: &IntervalSet) -> IntervalSet {
        let mut result = IntervalSet::new();
        let mut lhs = a.iter().peekable();
        let mut rhs = b.iter().peekable();
        while let (Some(&(a_off, a_len)), Some(&(b_off, b_len))) = (lhs.peek(), rhs.peek()) {
            let a_end = a_off + a_len;
            let b_end = b_off + b_len;
            let start = a_off.max(b_off);
            let end = a_end.min(b_end);
            if start < end {
                result.map.insert(start, end - start);
            }
            if a_end <= b_end {
                lhs.next();
            } else {
                rhs.next();
            }
        }
        result
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.map
            .range(..=offset)
            .next_back()
            .map(|(&s, &l)| offset < s + l)
            .unwrap_or(false)
    }

    /// Iterates ranges in ascending offset order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.map.iter().map(|(&s, &l)| (s, l))
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of disjoint ranges.
    pub fn num_intervals(&self) -> usize {
        self.map.len()
    }

    /// Total number of bytes covered.
    pub fn size(&self) -> u64 {
        self.map.values().sum()
    }

    /// End of the last range, 0 when empty.
    pub fn range_end(&self) -> u64 {
        self.map
            .iter()
            .next_back()
            .map(|(&s, &l)| s + l)
            .unwrap_or(0)
    }
}

impl FromIterator<(u64, u64)> for IntervalSet {
    fn from_iter<T: IntoIterator<Item = (u64, u64)>>(iter: T) -> Self {
        let mut set = IntervalSet::new();
        for (offset, length) in iter {
            set.union_insert(offset, length);
        }
        set
    }
}

impl fmt::Display for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (offset, length)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}~{}", offset, length)?;
        }
        write!(f, "]")
    }
}
