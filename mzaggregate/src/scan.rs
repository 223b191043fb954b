//! Scans and the run-level collections they are drawn from.
use std::ops::RangeInclusive;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::peaks::Spectrum;

/// A single acquisition. `index` is one-based and unique within its run.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Scan {
    pub index: usize,
    pub retention_time: f64,
    pub ms_level: u8,
    pub spectrum: Spectrum,
}

impl Scan {
    pub fn new(index: usize, retention_time: f64, ms_level: u8, spectrum: Spectrum) -> Self {
        Self {
            index,
            retention_time,
            ms_level,
            spectrum,
        }
    }
}

/// Random access to scans by their one-based index.
pub trait ScanSource {
    /// Retrieve the scan at `one_based_index`, if it exists
    fn get_scan(&self, one_based_index: usize) -> Option<&Scan>;

    /// The number of scans available. Valid indices are `1..=num_scans()`.
    fn num_scans(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.num_scans() == 0
    }
}

impl ScanSource for [Scan] {
    fn get_scan(&self, one_based_index: usize) -> Option<&Scan> {
        one_based_index.checked_sub(1).and_then(|i| self.get(i))
    }

    fn num_scans(&self) -> usize {
        self.len()
    }
}

impl ScanSource for Vec<Scan> {
    fn get_scan(&self, one_based_index: usize) -> Option<&Scan> {
        self.as_slice().get_scan(one_based_index)
    }

    fn num_scans(&self) -> usize {
        self.len()
    }
}

impl<T: ScanSource + ?Sized> ScanSource for &T {
    fn get_scan(&self, one_based_index: usize) -> Option<&Scan> {
        (**self).get_scan(one_based_index)
    }

    fn num_scans(&self) -> usize {
        (**self).num_scans()
    }
}

/// An in-memory run of scans ordered by acquisition.
///
/// Scans are expected to be pushed in retention time order, which the time-based
/// lookups rely on.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MsRun {
    scans: Vec<Scan>,
}

impl MsRun {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            scans: Vec::with_capacity(capacity),
        }
    }

    /// Append a scan, assigning it the next one-based index, which is returned.
    pub fn push_scan(&mut self, retention_time: f64, ms_level: u8, spectrum: Spectrum) -> usize {
        let index = self.scans.len() + 1;
        self.scans
            .push(Scan::new(index, retention_time, ms_level, spectrum));
        index
    }

    pub fn len(&self) -> usize {
        self.scans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scans.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Scan> {
        self.scans.iter()
    }

    pub fn as_slice(&self) -> &[Scan] {
        &self.scans
    }

    pub fn ms1_scans(&self) -> impl Iterator<Item = &Scan> + '_ {
        self.scans.iter().filter(|s| s.ms_level == 1)
    }

    /// Scans with a one-based index in `range`. Indices beyond the run are ignored.
    pub fn scans_in_index_range(&self, range: RangeInclusive<usize>) -> &[Scan] {
        let start = range.start().saturating_sub(1).min(self.scans.len());
        let end = (*range.end()).min(self.scans.len());
        if start >= end {
            &[]
        } else {
            &self.scans[start..end]
        }
    }

    /// Scans whose retention time lies within `start..=end`
    pub fn scans_in_time_range(&self, start: f64, end: f64) -> &[Scan] {
        match self.scan_range_for_time(start, end) {
            Some((first, last)) => self.scans_in_index_range(first..=last),
            None => &[],
        }
    }

    /// The inclusive one-based index bounds of the scans acquired within `start..=end`
    pub fn scan_range_for_time(&self, start: f64, end: f64) -> Option<(usize, usize)> {
        let lo = self.scans.partition_point(|s| s.retention_time < start);
        let hi = self.scans.partition_point(|s| s.retention_time <= end);
        if lo < hi {
            Some((lo + 1, hi))
        } else {
            None
        }
    }

    /// The one-based index of the scan acquired closest to `time`, preferring the
    /// earlier scan on a tie.
    pub fn closest_scan_index(&self, time: f64) -> Option<usize> {
        if self.scans.is_empty() || time.is_nan() {
            return None;
        }
        let i = self.scans.partition_point(|s| s.retention_time < time);
        if i == 0 {
            return Some(1);
        }
        if i == self.scans.len() {
            return Some(self.scans.len());
        }
        let before = time - self.scans[i - 1].retention_time;
        let after = self.scans[i].retention_time - time;
        if after < before {
            Some(i + 1)
        } else {
            Some(i)
        }
    }
}

impl ScanSource for MsRun {
    fn get_scan(&self, one_based_index: usize) -> Option<&Scan> {
        self.scans.get_scan(one_based_index)
    }

    fn num_scans(&self) -> usize {
        self.scans.len()
    }
}

impl<'a> IntoIterator for &'a MsRun {
    type Item = &'a Scan;

    type IntoIter = std::slice::Iter<'a, Scan>;

    fn into_iter(self) -> Self::IntoIter {
        self.scans.iter()
    }
}

impl FromIterator<(f64, u8, Spectrum)> for MsRun {
    fn from_iter<T: IntoIterator<Item = (f64, u8, Spectrum)>>(iter: T) -> Self {
        let mut run = Self::new();
        for (retention_time, ms_level, spectrum) in iter {
            run.push_scan(retention_time, ms_level, spectrum);
        }
        run
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn make_run() -> MsRun {
        [
            (0.5, 1u8),
            (0.6, 2),
            (1.0, 1),
            (1.1, 2),
            (1.5, 1),
        ]
        .into_iter()
        .map(|(rt, level)| (rt, level, Spectrum::default()))
        .collect()
    }

    #[test]
    fn test_indexing() {
        let run = make_run();
        assert_eq!(run.num_scans(), 5);
        assert!(run.get_scan(0).is_none());
        assert_eq!(run.get_scan(1).unwrap().index, 1);
        assert_eq!(run.get_scan(5).unwrap().retention_time, 1.5);
        assert!(run.get_scan(6).is_none());
        assert_eq!(run.ms1_scans().count(), 3);
        assert_eq!(run.scans_in_index_range(2..=4).len(), 3);
        assert_eq!(run.scans_in_index_range(4..=10).len(), 2);
        assert!(run.scans_in_index_range(7..=10).is_empty());
    }

    #[test]
    fn test_time_lookup() {
        let run = make_run();
        assert_eq!(run.scan_range_for_time(0.55, 1.1), Some((2, 4)));
        assert_eq!(run.scans_in_time_range(0.55, 1.1).len(), 3);
        assert_eq!(run.scan_range_for_time(2.0, 3.0), None);
        assert_eq!(run.closest_scan_index(0.0), Some(1));
        assert_eq!(run.closest_scan_index(0.95), Some(3));
        assert_eq!(run.closest_scan_index(1.25), Some(4));
        assert_eq!(run.closest_scan_index(9.0), Some(5));
        assert_eq!(MsRun::new().closest_scan_index(1.0), None);
    }
}
