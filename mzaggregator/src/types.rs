use mzdata::spectrum::MultiLayerSpectrum;
use mzpeaks::CentroidPeak;

use mzdeisotope::solution::DeconvolvedSolutionPeak;

pub(crate) type CPeak = CentroidPeak;
pub(crate) type DPeak = DeconvolvedSolutionPeak;
pub(crate) type SpectrumType = MultiLayerSpectrum<CPeak, DPeak>;
pub(crate) const BUFFER_SIZE: usize = 10_000;
pub(crate) const PEAK_COUNT_THRESHOLD_WARNING: usize = 10_000;
