//! Serial command numbering and range sets.
//!
//! Commands on a session are numbered with 32-bit serial numbers that wrap
//! around. Comparisons follow serial-number arithmetic, so a freshly wrapped
//! id still orders after the ids issued just before the wrap. [`SequenceSet`]
//! stores ordered, disjoint, inclusive ranges of command ids and backs the
//! `session.completed` / `session.known-completed` exchanges.

use std::fmt;

use bincode::{Decode, Encode};

/// A session command id using serial-number arithmetic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Encode, Decode)]
pub struct SequenceNumber(pub u32);

impl SequenceNumber {
    /// The id assigned to the first command on a fresh session.
    pub const ZERO: Self = Self(0);

    /// Return the id following `self`, wrapping at `u32::MAX`.
    #[must_use]
    pub const fn next(self) -> Self { Self(self.0.wrapping_add(1)) }

    /// Signed serial distance from `other` to `self`.
    ///
    /// Positive when `self` is ahead of `other` in serial order.
    #[must_use]
    pub const fn distance(self, other: Self) -> i32 { self.0.wrapping_sub(other.0) as i32 }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering { self.distance(*other).cmp(&0) }
}

impl From<u32> for SequenceNumber {
    fn from(value: u32) -> Self { Self(value) }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}

/// Cursor describing the next command a sender will issue.
///
/// `offset` is the byte offset into an interrupted frameset; it is zero
/// except while a partially transferred frameset is being resumed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct SessionPoint {
    /// Next command id to be used by the sender.
    pub command: SequenceNumber,
    /// Offset within the frameset of `command`, zero at command boundaries.
    pub offset: u64,
}

impl SessionPoint {
    /// Construct a point at the start of `command`.
    #[must_use]
    pub const fn new(command: SequenceNumber) -> Self {
        Self {
            command,
            offset: 0,
        }
    }

    /// Advance past a completely transferred command.
    pub fn advance(&mut self) {
        self.command = self.command.next();
        self.offset = 0;
    }
}

/// An inclusive range of command ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub struct SequenceRange {
    /// Lowest id in the range.
    pub lower: SequenceNumber,
    /// Highest id in the range.
    pub upper: SequenceNumber,
}

impl SequenceRange {
    /// Construct a range covering `lower..=upper`.
    ///
    /// # Panics
    ///
    /// Panics if `upper` precedes `lower` in serial order; ranges of that
    /// shape cannot appear on the wire and indicate a broken invariant.
    #[must_use]
    pub fn new(lower: SequenceNumber, upper: SequenceNumber) -> Self {
        assert!(lower <= upper, "inverted sequence range {lower}-{upper}");
        Self { lower, upper }
    }

    fn contains(&self, id: SequenceNumber) -> bool { self.lower <= id && id <= self.upper }

    fn len(&self) -> u64 { u64::from(self.upper.0.wrapping_sub(self.lower.0)) + 1 }
}

/// Ordered set of disjoint command-id ranges.
///
/// Adjacent and overlapping insertions coalesce, so the encoded form is
/// always the minimal list of `[lower, upper]` pairs.
///
/// # Examples
///
/// ```
/// use amqwire::{SequenceNumber, SequenceSet};
///
/// let mut set = SequenceSet::new();
/// set.add(SequenceNumber(2));
/// set.add(SequenceNumber(0));
/// set.add(SequenceNumber(1));
/// assert_eq!(set.ranges().count(), 1);
/// assert_eq!(set.first(), Some(SequenceNumber(0)));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct SequenceSet {
    ranges: Vec<SequenceRange>,
}

impl SequenceSet {
    /// An empty set.
    #[must_use]
    pub const fn new() -> Self { Self { ranges: Vec::new() } }

    /// Build a set holding a single id.
    #[must_use]
    pub fn of(id: SequenceNumber) -> Self {
        let mut set = Self::new();
        set.add(id);
        set
    }

    /// True when the set holds no ids.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.ranges.is_empty() }

    /// Number of ids covered by the set.
    #[must_use]
    pub fn len(&self) -> u64 { self.ranges.iter().map(SequenceRange::len).sum() }

    /// Lowest id in the set, if any.
    #[must_use]
    pub fn first(&self) -> Option<SequenceNumber> { self.ranges.first().map(|r| r.lower) }

    /// Highest id in the set, if any.
    #[must_use]
    pub fn last(&self) -> Option<SequenceNumber> { self.ranges.last().map(|r| r.upper) }

    /// True when `id` is covered by the set.
    #[must_use]
    pub fn contains(&self, id: SequenceNumber) -> bool {
        self.ranges.iter().any(|r| r.contains(id))
    }

    /// Iterate the disjoint ranges in ascending order.
    pub fn ranges(&self) -> impl Iterator<Item = SequenceRange> + '_ { self.ranges.iter().copied() }

    /// Iterate every id in the set in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = SequenceNumber> + '_ {
        self.ranges.iter().flat_map(|r| {
            let mut next = Some(r.lower);
            let upper = r.upper;
            std::iter::from_fn(move || {
                let current = next?;
                next = if current == upper { None } else { Some(current.next()) };
                Some(current)
            })
        })
    }

    /// Insert a single id, merging with neighbouring ranges.
    pub fn add(&mut self, id: SequenceNumber) { self.add_range(SequenceRange::new(id, id)); }

    /// Insert an inclusive range, merging with overlapping or adjacent ones.
    pub fn add_range(&mut self, range: SequenceRange) {
        let mut merged = range;
        let mut insert_at = self.ranges.len();
        let mut index = 0;
        while index < self.ranges.len() {
            let existing = self.ranges[index];
            if existing.upper.next() < merged.lower {
                index += 1;
                continue;
            }
            if merged.upper.next() < existing.lower {
                insert_at = index;
                break;
            }
            // Overlapping or adjacent: absorb and remove the existing range.
            merged.lower = merged.lower.min(existing.lower);
            merged.upper = merged.upper.max(existing.upper);
            self.ranges.remove(index);
            insert_at = index;
        }
        let at = insert_at.min(self.ranges.len());
        self.ranges.insert(at, merged);
    }

    /// Remove a single id, splitting a range when it falls in the middle.
    pub fn remove(&mut self, id: SequenceNumber) {
        let Some(index) = self.ranges.iter().position(|r| r.contains(id)) else {
            return;
        };
        let range = self.ranges.remove(index);
        let mut insert = index;
        if range.lower < id {
            let below = SequenceRange::new(range.lower, SequenceNumber(id.0.wrapping_sub(1)));
            self.ranges.insert(insert, below);
            insert += 1;
        }
        if id < range.upper {
            self.ranges.insert(insert, SequenceRange::new(id.next(), range.upper));
        }
    }

    /// Remove every id covered by `other`.
    pub fn remove_set(&mut self, other: &SequenceSet) {
        for range in other.ranges() {
            for id in SequenceSet::from(range).ids() {
                self.remove(id);
            }
        }
    }

    /// Merge every id of `other` into `self`.
    pub fn add_set(&mut self, other: &SequenceSet) {
        for range in other.ranges() {
            self.add_range(range);
        }
    }

    /// Drop all ids from the set.
    pub fn clear(&mut self) { self.ranges.clear(); }
}

impl From<SequenceRange> for SequenceSet {
    fn from(range: SequenceRange) -> Self {
        let mut set = Self::new();
        set.add_range(range);
        set
    }
}

impl FromIterator<SequenceNumber> for SequenceSet {
    fn from_iter<I: IntoIterator<Item = SequenceNumber>>(iter: I) -> Self {
        let mut set = Self::new();
        for id in iter {
            set.add(id);
        }
        set
    }
}

impl fmt::Display for SequenceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if range.lower == range.upper {
                write!(f, "{}", range.lower)?;
            } else {
                write!(f, "{}-{}", range.lower, range.upper)?;
            }
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn seq(n: u32) -> SequenceNumber { SequenceNumber(n) }

    #[rstest]
    #[case(0, 1)]
    #[case(41, 4_000_000)]
    #[case(u32::MAX, 0)]
    fn serial_order_holds_across_wrap(#[case] earlier: u32, #[case] later: u32) {
        assert!(seq(earlier) < seq(later));
        assert!(seq(later) > seq(earlier));
    }

    #[rstest]
    fn adjacent_ids_coalesce() {
        let mut set = SequenceSet::new();
        set.add(seq(1));
        set.add(seq(3));
        set.add(seq(2));
        assert_eq!(set.ranges().count(), 1);
        assert_eq!(set.first(), Some(seq(1)));
        assert_eq!(set.last(), Some(seq(3)));
    }

    #[rstest]
    fn remove_splits_range() {
        let mut set = SequenceSet::from(SequenceRange::new(seq(0), seq(4)));
        set.remove(seq(2));
        let ranges: Vec<_> = set.ranges().collect();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0], SequenceRange::new(seq(0), seq(1)));
        assert_eq!(ranges[1], SequenceRange::new(seq(3), seq(4)));
    }

    #[rstest]
    fn remove_front_advances_first() {
        let mut set = SequenceSet::from(SequenceRange::new(seq(5), seq(7)));
        set.remove(seq(5));
        assert_eq!(set.first(), Some(seq(6)));
    }

    #[rstest]
    fn ids_walk_every_member() {
        let mut set = SequenceSet::new();
        set.add_range(SequenceRange::new(seq(1), seq(2)));
        set.add(seq(9));
        let ids: Vec<u32> = set.ids().map(|s| s.0).collect();
        assert_eq!(ids, vec![1, 2, 9]);
    }

    #[rstest]
    fn remove_set_subtracts() {
        let mut set = SequenceSet::from(SequenceRange::new(seq(0), seq(9)));
        let mut gone = SequenceSet::new();
        gone.add_range(SequenceRange::new(seq(2), seq(4)));
        gone.add(seq(8));
        set.remove_set(&gone);
        assert_eq!(set.len(), 6);
        assert!(!set.contains(seq(3)));
        assert!(set.contains(seq(7)));
    }
}
