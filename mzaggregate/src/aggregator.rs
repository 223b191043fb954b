//! Streaming aggregation of per-scan isotopic envelopes into multi-scan features.
//!
//! A [`FeatureAggregator`] consumes scans in increasing scan index order and keeps
//! a list of *open* features in the order they were first seen. Each envelope extends
//! the first open feature whose mass it matches under one of the
//! [`ISOTOPE_HYPOTHESES`](crate::feature::ISOTOPE_HYPOTHESES), or opens a new one.
//! After a scan is consumed, every open feature which has gone more than
//! `max_missed_scans` scans without being extended is closed and emitted, so memory
//! use is bounded by the number of analytes co-eluting at any one time rather than by
//! the length of the run.
use std::collections::VecDeque;
use std::iter::FusedIterator;
use std::mem;

use thiserror::Error;
use tracing::{debug, trace};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::envelope::IsotopicEnvelope;
use crate::feature::Feature;

/// The number of consecutive scans an open feature may go without a matching envelope
/// before it is closed
pub const DEFAULT_MAX_MISSED_SCANS: usize = 1;

/// The deconvolution result for a single scan, the input unit of a [`FeatureAggregator`]
#[derive(Debug, Clone, PartialEq)]
pub struct ScanEnvelopes {
    pub scan_index: usize,
    pub elution_time: f64,
    /// `None` when the scan was excluded or could not be deconvoluted, which still
    /// advances the aggregator.
    pub envelopes: Option<Vec<IsotopicEnvelope>>,
}

impl ScanEnvelopes {
    pub fn new(scan_index: usize, elution_time: f64, envelopes: Vec<IsotopicEnvelope>) -> Self {
        Self {
            scan_index,
            elution_time,
            envelopes: Some(envelopes),
        }
    }

    pub fn skipped(scan_index: usize, elution_time: f64) -> Self {
        Self {
            scan_index,
            elution_time,
            envelopes: None,
        }
    }
}

impl From<(usize, f64, Vec<IsotopicEnvelope>)> for ScanEnvelopes {
    fn from(value: (usize, f64, Vec<IsotopicEnvelope>)) -> Self {
        Self::new(value.0, value.1, value.2)
    }
}

/// A failure which ends aggregation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregationError {
    #[error("Scan {scan_index} arrived after scan {previous}, scans must be strictly increasing")]
    OrderingViolation { scan_index: usize, previous: usize },
}

/// Counters describing the work a [`FeatureAggregator`] has done so far
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AggregationStats {
    pub scans_consumed: usize,
    pub envelopes_consumed: usize,
    pub features_opened: usize,
    pub features_emitted: usize,
    pub max_open_features: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggregatorState {
    Consuming,
    Flushing,
    Done,
}

/// Groups isotopic envelopes from consecutive scans into [`Feature`]s.
///
/// This is a single pass, lazily evaluated [`Iterator`]. Features are yielded as soon
/// as they are closed, in the order they were opened within each eviction round. If the
/// input violates the scan ordering, a single [`AggregationError`] is yielded and the
/// iterator is exhausted, so a consumer can distinguish normal completion from an
/// aborted run by whether an `Err` was seen.
#[derive(Debug)]
pub struct FeatureAggregator<I: Iterator<Item = ScanEnvelopes>> {
    scans: I,
    aggregation_tolerance_ppm: f64,
    max_missed_scans: usize,
    open_features: Vec<Feature>,
    closed_features: VecDeque<Feature>,
    scan_cursor: Option<usize>,
    state: AggregatorState,
    stats: AggregationStats,
}

impl<I: Iterator<Item = ScanEnvelopes>> FeatureAggregator<I> {
    pub fn new<T: IntoIterator<IntoIter = I>>(scans: T, aggregation_tolerance_ppm: f64) -> Self {
        Self {
            scans: scans.into_iter(),
            aggregation_tolerance_ppm,
            max_missed_scans: DEFAULT_MAX_MISSED_SCANS,
            open_features: Vec::new(),
            closed_features: VecDeque::new(),
            scan_cursor: None,
            state: AggregatorState::Consuming,
            stats: AggregationStats::default(),
        }
    }

    /// Close features once they have gone `max_missed_scans` scans without being
    /// extended. Zero closes a feature as soon as a scan passes without it, which is
    /// the classic `max_scan_index < scan_cursor` rule.
    pub fn with_max_missed_scans(mut self, max_missed_scans: usize) -> Self {
        self.max_missed_scans = max_missed_scans;
        self
    }

    pub fn aggregation_tolerance_ppm(&self) -> f64 {
        self.aggregation_tolerance_ppm
    }

    pub fn max_missed_scans(&self) -> usize {
        self.max_missed_scans
    }

    /// The index of the last scan consumed
    pub fn scan_cursor(&self) -> Option<usize> {
        self.scan_cursor
    }

    pub fn open_feature_count(&self) -> usize {
        self.open_features.len()
    }

    pub fn open_features(&self) -> &[Feature] {
        &self.open_features
    }

    pub fn stats(&self) -> AggregationStats {
        self.stats
    }

    /// Add `envelope` to the first open feature it matches, or open a new feature
    fn assign(&mut self, envelope: IsotopicEnvelope, scan_index: usize, elution_time: f64) {
        let mass = envelope.monoisotopic_mass;
        let tolerance = self.aggregation_tolerance_ppm;
        match self
            .open_features
            .iter_mut()
            .find(|f| f.match_mass(mass, tolerance).is_some())
        {
            Some(feature) => {
                feature.add_envelope(envelope, scan_index, elution_time);
            }
            None => {
                self.open_features
                    .push(Feature::new(envelope, scan_index, elution_time));
                self.stats.features_opened += 1;
            }
        }
    }

    /// Close every open feature last extended more than `max_missed_scans` scans
    /// before `scan_index`, keeping the remainder in insertion order.
    fn evict(&mut self, scan_index: usize) {
        let max_missed_scans = self.max_missed_scans;
        let (evicted, kept): (Vec<_>, Vec<_>) = mem::take(&mut self.open_features)
            .into_iter()
            .partition(|f| f.max_scan_index.saturating_add(max_missed_scans) < scan_index);
        self.open_features = kept;
        if !evicted.is_empty() {
            trace!("Evicting {} features at scan {scan_index}", evicted.len());
            self.closed_features.extend(evicted);
        }
    }

    fn consume(&mut self, scan: ScanEnvelopes) -> Result<(), AggregationError> {
        let scan_index = scan.scan_index;
        if let Some(previous) = self.scan_cursor {
            if scan_index <= previous {
                return Err(AggregationError::OrderingViolation {
                    scan_index,
                    previous,
                });
            }
        }
        self.scan_cursor = Some(scan_index);
        self.stats.scans_consumed += 1;

        if let Some(envelopes) = scan.envelopes {
            self.stats.envelopes_consumed += envelopes.len();
            for envelope in envelopes {
                self.assign(envelope, scan_index, scan.elution_time);
            }
        }
        self.stats.max_open_features = self.stats.max_open_features.max(self.open_features.len());

        self.evict(scan_index);
        Ok(())
    }
}

impl<I: Iterator<Item = ScanEnvelopes>> Iterator for FeatureAggregator<I> {
    type Item = Result<Feature, AggregationError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(feature) = self.closed_features.pop_front() {
                self.stats.features_emitted += 1;
                return Some(Ok(feature));
            }
            match self.state {
                AggregatorState::Done => return None,
                AggregatorState::Flushing => {
                    debug!(
                        "Flushing {} open features after scan {:?}",
                        self.open_features.len(),
                        self.scan_cursor
                    );
                    self.closed_features.extend(self.open_features.drain(..));
                    self.state = AggregatorState::Done;
                }
                AggregatorState::Consuming => match self.scans.next() {
                    Some(scan) => {
                        if let Err(err) = self.consume(scan) {
                            self.state = AggregatorState::Done;
                            self.open_features.clear();
                            return Some(Err(err));
                        }
                    }
                    None => {
                        self.state = AggregatorState::Flushing;
                    }
                },
            }
        }
    }
}

impl<I: Iterator<Item = ScanEnvelopes>> FusedIterator for FeatureAggregator<I> {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::peaks::Peak;

    fn envelope(mass: f64, n_peaks: usize) -> IsotopicEnvelope {
        let peaks = (0..n_peaks)
            .map(|i| Peak::new(mass + 1.007276 + i as f64, 100.0))
            .collect();
        IsotopicEnvelope::new(mass, 1, peaks)
    }

    fn scan(index: usize, masses: &[f64]) -> ScanEnvelopes {
        ScanEnvelopes::new(
            index,
            index as f64 * 0.5,
            masses.iter().map(|m| envelope(*m, 3)).collect(),
        )
    }

    #[test]
    fn test_five_scans() {
        let scans = vec![
            scan(1, &[1000.0]),
            scan(2, &[1500.0]),
            scan(3, &[1000.005]),
            scan(4, &[2000.0]),
            scan(5, &[2500.0]),
        ];
        let features: Vec<Feature> = FeatureAggregator::new(scans, 10.0)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(features.len(), 4);
        let target = features
            .iter()
            .find(|f| (f.mass() - 1000.0025).abs() < 1e-3)
            .unwrap();
        assert_eq!(target.min_scan_index, 1);
        assert_eq!(target.max_scan_index, 3);
        assert_eq!(target.num_peaks(), 6);
        assert_eq!(target.num_envelopes(), 2);
        for f in features.iter().filter(|f| !std::ptr::eq(*f, target)) {
            assert_eq!(f.num_envelopes(), 1);
        }
    }

    #[test]
    fn test_eviction_timing() {
        let scans = vec![
            scan(1, &[1000.0, 1200.0]),
            scan(2, &[1000.0]),
            scan(3, &[]),
            scan(4, &[]),
        ];
        let mut agg = FeatureAggregator::new(scans, 10.0).with_max_missed_scans(0);

        // 1200 is closed after scan 2, 1000 after scan 3
        let first = agg.next().unwrap().unwrap();
        assert_eq!(agg.scan_cursor(), Some(2));
        assert!((first.mass() - 1200.0).abs() < 1e-6);
        assert_eq!(agg.open_feature_count(), 1);

        let second = agg.next().unwrap().unwrap();
        assert_eq!(agg.scan_cursor(), Some(3));
        assert!((second.mass() - 1000.0).abs() < 1e-6);
        assert_eq!(second.max_scan_index, 2);

        assert!(agg.next().is_none());
        assert!(agg.next().is_none());
        let stats = agg.stats();
        assert_eq!(stats.scans_consumed, 4);
        assert_eq!(stats.envelopes_consumed, 3);
        assert_eq!(stats.features_opened, 2);
        assert_eq!(stats.features_emitted, 2);
        assert_eq!(stats.max_open_features, 2);
    }

    #[test]
    fn test_isotope_offsets() {
        let scans = vec![
            scan(1, &[1000.0]),
            scan(2, &[1001.0029]),
            scan(3, &[1005.0]),
        ];
        let features: Vec<Feature> = FeatureAggregator::new(scans, 10.0)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[0].num_envelopes(), 2);
        assert_eq!(features[0].mass_groups().len(), 2);
        assert_eq!(features[0].max_scan_index, 2);
        assert!((features[1].mass() - 1005.0).abs() < 1e-6);
    }

    #[test]
    fn test_skipped_scans_advance() {
        let scans = vec![
            scan(1, &[1000.0]),
            ScanEnvelopes::skipped(2, 1.0),
            ScanEnvelopes::skipped(3, 1.5),
            scan(4, &[1000.0]),
        ];
        let features: Vec<Feature> = FeatureAggregator::new(scans, 10.0)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[0].max_scan_index, 1);
        assert_eq!(features[1].min_scan_index, 4);
    }

    #[test]
    fn test_missed_scan_bridged() {
        let scans = || {
            vec![
                scan(1, &[1000.0]),
                scan(2, &[640.0]),
                scan(3, &[1000.0]),
                scan(4, &[]),
                scan(5, &[]),
                scan(6, &[1000.0]),
            ]
        };
        let features: Vec<Feature> = FeatureAggregator::new(scans(), 10.0)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(features.len(), 3);
        assert_eq!(features[0].min_scan_index, 2);
        assert_eq!((features[1].min_scan_index, features[1].max_scan_index), (1, 3));
        assert_eq!(features[2].min_scan_index, 6);

        let features: Vec<Feature> = FeatureAggregator::new(scans(), 10.0)
            .with_max_missed_scans(2)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[1].num_envelopes(), 3);
    }

    #[test]
    fn test_ordering_violation() {
        let scans = vec![scan(2, &[1000.0]), scan(4, &[800.0]), scan(3, &[1000.0])];
        let mut agg = FeatureAggregator::new(scans, 10.0);
        let first = agg.next().unwrap().unwrap();
        assert!((first.mass() - 1000.0).abs() < 1e-6);
        assert_eq!(
            agg.next(),
            Some(Err(AggregationError::OrderingViolation {
                scan_index: 3,
                previous: 4
            }))
        );
        assert!(agg.next().is_none());
    }

    #[test]
    fn test_empty_input() {
        let mut agg = FeatureAggregator::new(Vec::<ScanEnvelopes>::new(), 10.0);
        assert!(agg.next().is_none());
        assert_eq!(agg.scan_cursor(), None);
    }
}
