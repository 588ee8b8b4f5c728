use std::collections::HashSet;
use std::ops;

use tracing::warn;

use super::error::{Nip77Error, Result};
use super::fingerprint::Accumulator;
use super::model::{Bound, EventId, Fingerprint, Record};
use crate::nip01::Event;

/// Number of sub-ranges a mismatched range is split into
pub const BUCKET_COUNT: usize = 16;

/// Ranges with fewer records than this are sent as id lists
pub const ID_LIST_THRESHOLD: usize = BUCKET_COUNT * 2;

/// Sealed, sorted set of records that a reconciliation runs against.
///
/// Records are kept in protocol order with unique ids. The set never changes
/// after construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegentropyStorage {
    records: Vec<Record>,
}

impl NegentropyStorage {
    /// Seal `records` into sorted order.
    ///
    /// A repeated id keeps its first occurrence; later copies are dropped with
    /// a warning.
    pub fn new(records: Vec<Record>) -> Self {
        let mut seen = HashSet::with_capacity(records.len());
        let mut unique = Vec::with_capacity(records.len());

        for record in records {
            if seen.insert(record.id) {
                unique.push(record);
            } else {
                warn!(
                    id = %hex::encode(record.id),
                    timestamp = record.timestamp,
                    "dropping duplicate negentropy record"
                );
            }
        }

        unique.sort_unstable();
        Self { records: unique }
    }

    /// Build storage from events, skipping any whose id is not 32 bytes of hex.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let records = events
            .into_iter()
            .filter_map(|event| match Record::from_event(event) {
                Ok(record) => Some(record),
                Err(error) => {
                    warn!(id = %event.id, %error, "skipping event with malformed id");
                    None
                }
            })
            .collect();
        Self::new(records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn get(&self, index: usize) -> Option<&Record> {
        self.records.get(index)
    }

    /// Records in `[begin, end)`.
    pub fn slice(&self, begin: usize, end: usize) -> Result<&[Record]> {
        self.records.get(begin..end).ok_or_else(|| {
            Nip77Error::InvalidRange(format!(
                "index range {begin}..{end} outside storage of {} records",
                self.records.len()
            ))
        })
    }

    /// First index in `[begin, end)` whose record is not below `bound`, or `end`.
    pub fn find_lower_bound(&self, begin: usize, end: usize, bound: &Bound) -> usize {
        let end = end.min(self.records.len());
        if begin >= end {
            return end;
        }
        begin
            + self.records[begin..end]
                .partition_point(|record| record.cmp_bound(bound).is_lt())
    }

    /// Index range covered by `[lower, upper)`.
    pub fn index_range(&self, lower: &Bound, upper: &Bound) -> ops::Range<usize> {
        let len = self.records.len();
        let begin = self.find_lower_bound(0, len, lower);
        let end = self.find_lower_bound(begin, len, upper);
        begin..end
    }

    /// Fingerprint of the records in `[begin, end)`.
    pub fn fingerprint(&self, begin: usize, end: usize) -> Result<Fingerprint> {
        let mut acc = Accumulator::new();
        acc.extend(self.slice(begin, end)?.iter().map(|record| &record.id));
        Ok(acc.fingerprint())
    }

    /// Fingerprint of the records in `[lower, upper)`.
    pub fn fingerprint_range(&self, lower: &Bound, upper: &Bound) -> Fingerprint {
        let range = self.index_range(lower, upper);
        let mut acc = Accumulator::new();
        acc.extend(self.records[range].iter().map(|record| &record.id));
        acc.fingerprint()
    }

    /// Ids of the records in `[lower, upper)`, in protocol order.
    pub fn ids_in_range(&self, lower: &Bound, upper: &Bound) -> Vec<EventId> {
        let range = self.index_range(lower, upper);
        self.records[range].iter().map(|record| record.id).collect()
    }

    /// Split `[begin, end)` into at most `pieces` consecutive buckets.
    ///
    /// Returns the exclusive end index of each bucket with the bound that
    /// separates it from the next. The final bucket ends at `end` and carries
    /// `upper`. Leftover records go to the leading buckets, one each.
    pub fn split_points(
        &self,
        begin: usize,
        end: usize,
        pieces: usize,
        upper: &Bound,
    ) -> Result<Vec<(usize, Bound)>> {
        let records = self.slice(begin, end)?;
        let count = records.len();
        let pieces = pieces.clamp(1, count.max(1));
        let per_bucket = count / pieces;
        let leftover = count % pieces;

        let mut points = Vec::with_capacity(pieces);
        let mut curr = begin;
        for i in 0..pieces {
            curr += per_bucket + usize::from(i < leftover);
            let bound = if curr >= end {
                upper.clone()
            } else {
                Bound::minimal(&self.records[curr - 1], &self.records[curr])
            };
            points.push((curr, bound));
        }
        Ok(points)
    }

    /// Bounds splitting `[lower, upper)` into `pieces` roughly equal parts.
    ///
    /// Each returned bound is the exclusive upper edge of one part; the last
    /// one is `upper`.
    pub fn bounds_for_split(&self, lower: &Bound, upper: &Bound, pieces: usize) -> Vec<Bound> {
        let range = self.index_range(lower, upper);
        self.split_points(range.start, range.end, pieces, upper)
            .map(|points| points.into_iter().map(|(_, bound)| bound).collect())
            .unwrap_or_else(|_| vec![upper.clone()])
    }
}

impl FromIterator<Record> for NegentropyStorage {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
