//! Merge replicate mass spectra and aggregate deconvolved isotopic envelopes into
//! features spanning multiple scans.
//!
//! There are two entry points:
//! - [`merge_spectra`] combines several centroided spectra into one, pooling peaks
//!   within a ppm tolerance of each other.
//! - [`FeatureAggregationEngine`] runs a [`ScanDeconvolver`] over a range of scans in
//!   parallel with a [`ParallelScanProcessor`], then streams the resulting envelopes
//!   through a [`FeatureAggregator`] which groups them into [`Feature`]s.
//!
//! The deconvolution algorithm itself is not part of this crate. Anything implementing
//! [`ScanDeconvolver`], including a plain closure, can be used.
pub mod aggregator;
pub mod api;
pub mod envelope;
pub mod feature;
pub mod merge;
pub mod peaks;
pub mod processor;
pub mod scan;

pub use aggregator::{
    AggregationError, AggregationStats, FeatureAggregator, ScanEnvelopes, DEFAULT_MAX_MISSED_SCANS,
};
pub use api::{aggregate, AggregatedFeatures, AggregationParams, FeatureAggregationEngine};
pub use envelope::{EnvelopeObservation, IsotopicEnvelope};
pub use feature::{Feature, IsotopeOffset, MassGroup, ISOTOPE_HYPOTHESES, ISOTOPE_SPACINGS};
pub use merge::{merge_spectra, merge_spectra_skip_empty, MergeAccumulator, MergeError};
pub use peaks::{Peak, Spectrum, SpectrumError};
pub use processor::{
    create_threadpool, CancellationToken, DeconvolutionParams, DeconvolverError,
    ParallelScanProcessor, ProcessingError, ScanDeconvolver, ScanError, ScanOutcome,
    ScanResultSet,
};
pub use scan::{MsRun, Scan, ScanSource};
