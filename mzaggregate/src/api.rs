//! A high level API coupling parallel deconvolution with feature aggregation.
use std::ops::RangeInclusive;

use tracing::{info, info_span};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::aggregator::{FeatureAggregator, DEFAULT_MAX_MISSED_SCANS};
use crate::processor::{
    DeconvolutionParams, ParallelScanProcessor, ProcessingError, ScanDeconvolver, ScanEnvelopesIter,
    ScanError, ScanResultSet,
};
use crate::scan::{Scan, ScanSource};

/// Parameters for deconvoluting scans and aggregating the results into features
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AggregationParams {
    /// The m/z window searched for isotopic patterns
    pub mz_range: (f64, f64),
    /// The inclusive range of charge states to consider
    pub charge_range: (i32, i32),
    /// The mass accuracy used when fitting isotopic patterns within a scan
    pub deconvolution_tolerance_ppm: f64,
    /// The largest permitted ratio between adjacent isotopic peak intensities
    pub intensity_ratio_limit: f64,
    /// The mass accuracy used when matching envelopes to features across scans
    pub aggregation_tolerance_ppm: f64,
    /// How many consecutive scans a feature may go unmatched before it is closed
    #[cfg_attr(feature = "serde", serde(default = "default_max_missed_scans"))]
    pub max_missed_scans: usize,
}

#[cfg(feature = "serde")]
fn default_max_missed_scans() -> usize {
    DEFAULT_MAX_MISSED_SCANS
}

impl Default for AggregationParams {
    fn default() -> Self {
        Self {
            mz_range: (0.0, f64::INFINITY),
            charge_range: (1, 8),
            deconvolution_tolerance_ppm: 20.0,
            intensity_ratio_limit: 3.0,
            aggregation_tolerance_ppm: 10.0,
            max_missed_scans: DEFAULT_MAX_MISSED_SCANS,
        }
    }
}

impl AggregationParams {
    pub fn deconvolution_params(&self) -> DeconvolutionParams {
        DeconvolutionParams {
            mz_range: self.mz_range,
            charge_range: self.charge_range,
            error_tolerance_ppm: self.deconvolution_tolerance_ppm,
            intensity_ratio_limit: self.intensity_ratio_limit,
        }
    }
}

/// The product of [`FeatureAggregationEngine::aggregate`].
///
/// `failures` lists every scan which could not be deconvoluted. Those scans contribute
/// no envelopes but still advance the aggregator. `features` is lazy, no feature is
/// built until it is iterated.
#[derive(Debug)]
pub struct AggregatedFeatures {
    pub scan_range: Option<RangeInclusive<usize>>,
    pub failures: Vec<ScanError>,
    pub features: FeatureAggregator<ScanEnvelopesIter>,
}

impl AggregatedFeatures {
    pub fn new(results: ScanResultSet, params: &AggregationParams) -> Self {
        let scan_range = results.scan_range();
        let failures = results.failures().cloned().collect();
        let features = FeatureAggregator::new(results, params.aggregation_tolerance_ppm)
            .with_max_missed_scans(params.max_missed_scans);
        Self {
            scan_range,
            failures,
            features,
        }
    }
}

/// Deconvolutes a range of scans in parallel and aggregates the envelopes found into
/// features.
#[derive(Debug, Clone)]
pub struct FeatureAggregationEngine<D: ScanDeconvolver + Clone + Send + Sync> {
    deconvolver: D,
    params: AggregationParams,
    processor: ParallelScanProcessor,
}

impl<D: ScanDeconvolver + Clone + Send + Sync> FeatureAggregationEngine<D> {
    pub fn new(deconvolver: D, params: AggregationParams) -> Self {
        Self {
            deconvolver,
            params,
            processor: ParallelScanProcessor::default(),
        }
    }

    pub fn with_processor(mut self, processor: ParallelScanProcessor) -> Self {
        self.processor = processor;
        self
    }

    pub fn params(&self) -> &AggregationParams {
        &self.params
    }

    pub fn processor(&self) -> &ParallelScanProcessor {
        &self.processor
    }

    pub fn processor_mut(&mut self) -> &mut ParallelScanProcessor {
        &mut self.processor
    }

    pub fn deconvolver(&self) -> &D {
        &self.deconvolver
    }

    /// Run only the parallel deconvolution over `min_scan..=max_scan`, defaulting to
    /// every scan in `source`.
    pub fn deconvolute<S, P>(
        &self,
        source: &S,
        min_scan: Option<usize>,
        max_scan: Option<usize>,
        include: P,
    ) -> Result<ScanResultSet, ProcessingError>
    where
        S: ScanSource + Sync + ?Sized,
        P: Fn(&Scan) -> bool + Sync,
    {
        let min_scan = min_scan.unwrap_or(1);
        let max_scan = max_scan.unwrap_or_else(|| source.num_scans());
        let span = info_span!("deconvolute", min_scan, max_scan);
        let _entered = span.enter();
        self.processor.process(
            source,
            min_scan,
            max_scan,
            include,
            &self.deconvolver,
            &self.params.deconvolution_params(),
        )
    }

    /// Deconvolute every included scan in `min_scan..=max_scan` and prepare the
    /// envelopes for aggregation.
    ///
    /// All deconvolution finishes before this returns. Aggregation happens as the
    /// returned [`AggregatedFeatures::features`] is iterated.
    pub fn aggregate<S, P>(
        &self,
        source: &S,
        min_scan: Option<usize>,
        max_scan: Option<usize>,
        include: P,
    ) -> Result<AggregatedFeatures, ProcessingError>
    where
        S: ScanSource + Sync + ?Sized,
        P: Fn(&Scan) -> bool + Sync,
    {
        let results = self.deconvolute(source, min_scan, max_scan, include)?;
        if !results.is_empty() {
            info!(
                "Aggregating {} envelopes from {} scans at {} ppm",
                results.num_envelopes(),
                results.len(),
                self.params.aggregation_tolerance_ppm
            );
        }
        Ok(AggregatedFeatures::new(results, &self.params))
    }
}

/// Deconvolute a range of scans and aggregate the results into features in one call.
///
/// This is a convenience wrapper around [`FeatureAggregationEngine`] using the default
/// [`ParallelScanProcessor`] settings. `min_scan` and `max_scan` default to the whole run.
#[allow(clippy::too_many_arguments)]
pub fn aggregate<S, D, P>(
    source: &S,
    deconvolver: D,
    min_scan: Option<usize>,
    max_scan: Option<usize>,
    min_charge: i32,
    max_charge: i32,
    deconvolution_tolerance_ppm: f64,
    intensity_ratio_limit: f64,
    aggregation_tolerance_ppm: f64,
    include: P,
) -> Result<AggregatedFeatures, ProcessingError>
where
    S: ScanSource + Sync + ?Sized,
    D: ScanDeconvolver + Clone + Send + Sync,
    P: Fn(&Scan) -> bool + Sync,
{
    let params = AggregationParams {
        charge_range: (min_charge, max_charge),
        deconvolution_tolerance_ppm,
        intensity_ratio_limit,
        aggregation_tolerance_ppm,
        ..Default::default()
    };
    let engine = FeatureAggregationEngine::new(deconvolver, params);
    engine.aggregate(source, min_scan, max_scan, include)
}
