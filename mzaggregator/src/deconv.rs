use mzdeisotope::{
    DeconvolutionEngine,
    scorer::{MaximizingFitFilter, PenalizedMSDeconvScorer},
    solution::DeconvolvedSolutionPeak,
};
use mzpeaks::{prelude::*, CentroidPeak, MZPeakSetType, Tolerance};

use tracing::trace;

use mzaggregate::{
    DeconvolutionParams, DeconvolverError, IsotopicEnvelope, Peak, Scan, ScanDeconvolver,
};

use crate::args::DeconvolutionBuilderParams;

pub type EngineType =
    DeconvolutionEngine<'static, CentroidPeak, PenalizedMSDeconvScorer, MaximizingFitFilter>;

/// A [`ScanDeconvolver`] backed by an `mzdeisotope` [`DeconvolutionEngine`].
///
/// Each worker thread gets its own clone, and with it its own isotopic pattern cache.
#[derive(Debug, Clone)]
pub struct EngineDeconvolver {
    engine: EngineType,
    max_missed_peaks: u16,
}

impl EngineDeconvolver {
    pub fn new(engine: EngineType, max_missed_peaks: u16) -> Self {
        Self {
            engine,
            max_missed_peaks,
        }
    }

    pub fn max_missed_peaks(&self) -> u16 {
        self.max_missed_peaks
    }
}

impl From<&DeconvolutionBuilderParams> for EngineDeconvolver {
    fn from(value: &DeconvolutionBuilderParams) -> Self {
        Self::new(value.build_engine(), value.max_missed_peaks)
    }
}

fn envelope_from_solution(peak: &DeconvolvedSolutionPeak) -> IsotopicEnvelope {
    let peaks = peak
        .envelope
        .iter()
        .map(|pt| Peak::new(pt.mz, pt.intensity as f64))
        .collect();
    IsotopicEnvelope::new(peak.neutral_mass, peak.charge, peaks)
        .with_total_intensity(peak.intensity as f64)
        .with_score(peak.score)
}

impl ScanDeconvolver for EngineDeconvolver {
    fn deconvolute(
        &mut self,
        scan: &Scan,
        params: &DeconvolutionParams,
    ) -> Result<Vec<IsotopicEnvelope>, DeconvolverError> {
        let (low, high) = params.mz_range;
        let window = scan.spectrum.between(low, high);
        if window.is_empty() {
            return Ok(Vec::new());
        }
        let peaks: MZPeakSetType<CentroidPeak> = window
            .iter()
            .enumerate()
            .map(|(i, p)| CentroidPeak::new(p.mz, p.intensity as f32, i as u32))
            .collect();

        let solutions = self
            .engine
            .deconvolute_peaks(
                peaks,
                Tolerance::PPM(params.error_tolerance_ppm),
                params.charge_range,
                self.max_missed_peaks,
            )
            .map_err(|e| DeconvolverError::Failed(e.to_string()))?;

        trace!(
            "Scan {} yielded {} envelopes from {} peaks",
            scan.index,
            solutions.len(),
            window.len()
        );
        Ok(solutions.iter().map(envelope_from_solution).collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use mzaggregate::Spectrum;
    use mzpeaks::peak::MZPoint;

    use crate::args::make_default_ms1_deconvolution_params;

    #[test]
    fn test_envelope_from_solution() {
        let solution = DeconvolvedSolutionPeak::new(
            998.5,
            300.0,
            2,
            0,
            42.0,
            Box::new(vec![
                MZPoint::new(500.257, 200.0),
                MZPoint::new(500.758, 100.0),
            ]),
        );
        let env = envelope_from_solution(&solution);
        assert_eq!(env.charge, 2);
        assert_eq!(env.num_peaks(), 2);
        assert_eq!(env.score, 42.0);
        assert_eq!(env.total_intensity, 300.0);
        assert_eq!(env.monoisotopic_mass, 998.5);
    }

    #[test_log::test]
    fn test_empty_window() {
        let mut params = make_default_ms1_deconvolution_params();
        params.mz_range = (80.0, 300.0);
        let mut deconv = EngineDeconvolver::from(&params);
        let scan = Scan::new(
            1,
            0.5,
            1,
            Spectrum::from_unsorted(vec![Peak::new(500.0, 1e4), Peak::new(500.5, 5e3)]),
        );
        let dparams = DeconvolutionParams {
            mz_range: (80.0, 300.0),
            ..Default::default()
        };
        let envelopes = deconv.deconvolute(&scan, &dparams).unwrap();
        assert!(envelopes.is_empty());
    }
}
