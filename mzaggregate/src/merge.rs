//! Tolerance-based merging of replicate spectra into a single peak list.
//!
//! The merge walks every input spectrum with its own cursor and always consumes the
//! globally smallest remaining m/z next, folding it into a running intensity-weighted
//! centroid as long as it stays within the requested ppm tolerance of that centroid.
//! Because the comparison is made against the *evolving* centroid, a series of peaks
//! each within tolerance of the previous accumulation will be chained together even
//! if the first and last are further apart than the tolerance.
use mzpeaks::Tolerance;
use thiserror::Error;
use tracing::{trace, warn};

use crate::peaks::{Peak, Spectrum};

/// An error that might occur while merging spectra
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MergeError {
    #[error("Spectrum {index} contained no peaks to merge")]
    EmptyInput { index: usize },
}

/// An intensity-weighted running centroid over every peak folded into it.
///
/// Offsets are accumulated relative to the first peak folded, so a run of
/// bit-identical m/z values keeps exactly that m/z.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct MergeAccumulator {
    origin: f64,
    weighted_offset: f64,
    unweighted_offset: f64,
    intensity: f64,
    count: usize,
}

impl MergeAccumulator {
    pub fn new(peak: &Peak) -> Self {
        let mut acc = Self {
            origin: peak.mz,
            ..Default::default()
        };
        acc.fold(peak);
        acc
    }

    /// Add another peak's contribution to the accumulation
    pub fn fold(&mut self, peak: &Peak) {
        let offset = peak.mz - self.origin;
        self.weighted_offset += offset * peak.intensity;
        self.unweighted_offset += offset;
        self.intensity += peak.intensity;
        self.count += 1;
    }

    /// The current centroid. Falls back to the plain mean when nothing folded so far
    /// carried any intensity.
    pub fn mz(&self) -> f64 {
        if self.count <= 1 {
            self.origin
        } else if self.intensity > 0.0 {
            self.origin + self.weighted_offset / self.intensity
        } else {
            self.origin + self.unweighted_offset / self.count as f64
        }
    }

    pub fn intensity(&self) -> f64 {
        self.intensity
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Test whether `mz` may be folded into this accumulation
    pub fn accepts(&self, mz: f64, ppm_tolerance: f64) -> bool {
        Tolerance::PPM(ppm_tolerance).test(mz, self.mz())
    }

    pub fn to_peak(&self) -> Peak {
        Peak::new(self.mz(), self.intensity)
    }
}

/// Merge a collection of spectra into a single de-duplicated spectrum.
///
/// Every input peak contributes to exactly one output peak. Peaks are combined when the
/// next smallest m/z across all inputs, `candidate`, satisfies
/// `(candidate - centroid) / centroid * 1e6 <= ppm_tolerance` against the current
/// accumulation. Intensities are summed and the output m/z is the intensity-weighted
/// mean of the contributing peaks.
///
/// A non-positive tolerance only combines peaks with bit-identical m/z values. Negative
/// tolerances are treated as zero.
///
/// # Errors
/// If any input spectrum is empty, [`MergeError::EmptyInput`] is returned naming its position.
/// Passing no spectra at all produces an empty spectrum.
pub fn merge_spectra<'a, I: IntoIterator<Item = &'a Spectrum>>(
    spectra: I,
    ppm_tolerance: f64,
) -> Result<Spectrum, MergeError> {
    let spectra: Vec<&[Peak]> = spectra.into_iter().map(|s| s.as_slice()).collect();
    if let Some(index) = spectra.iter().position(|s| s.is_empty()) {
        return Err(MergeError::EmptyInput { index });
    }
    Ok(merge_peak_lists(&spectra, ppm_tolerance.max(0.0)))
}

/// As [`merge_spectra`], but empty spectra are logged and skipped instead of failing the
/// whole merge.
pub fn merge_spectra_skip_empty<'a, I: IntoIterator<Item = &'a Spectrum>>(
    spectra: I,
    ppm_tolerance: f64,
) -> Spectrum {
    let spectra: Vec<&[Peak]> = spectra
        .into_iter()
        .enumerate()
        .filter_map(|(index, s)| {
            if s.is_empty() {
                warn!("Skipping spectrum {index} during merge, it contained no peaks");
                None
            } else {
                Some(s.as_slice())
            }
        })
        .collect();
    merge_peak_lists(&spectra, ppm_tolerance.max(0.0))
}

fn merge_peak_lists(spectra: &[&[Peak]], ppm_tolerance: f64) -> Spectrum {
    let total: usize = spectra.iter().map(|s| s.len()).sum();
    let mut cursors = vec![0usize; spectra.len()];
    let mut merged = Vec::with_capacity(total);

    let next_mz = |cursors: &[usize], i: usize| -> f64 {
        spectra[i]
            .get(cursors[i])
            .map(|p| p.mz)
            .unwrap_or(f64::INFINITY)
    };

    let mut current: Option<MergeAccumulator> = None;
    loop {
        let mut best_i = None;
        let mut best_mz = f64::INFINITY;
        for i in 0..spectra.len() {
            let mz = next_mz(&cursors, i);
            if mz < best_mz {
                best_mz = mz;
                best_i = Some(i);
            }
        }

        let Some(i) = best_i else {
            break;
        };

        let peak = &spectra[i][cursors[i]];
        cursors[i] += 1;

        match current.as_mut() {
            Some(acc) if acc.accepts(peak.mz, ppm_tolerance) => {
                acc.fold(peak);
            }
            Some(acc) => {
                merged.push(acc.to_peak());
                *acc = MergeAccumulator::new(peak);
            }
            None => {
                current = Some(MergeAccumulator::new(peak));
            }
        }
    }

    if let Some(acc) = current {
        merged.push(acc.to_peak());
    }

    trace!(
        "Merged {} spectra with {total} peaks into {} peaks",
        spectra.len(),
        merged.len()
    );
    Spectrum::from_sorted_unchecked(merged)
}

#[cfg(test)]
mod test {
    use super::*;

    fn spectrum(peaks: &[(f64, f64)]) -> Spectrum {
        Spectrum::new(peaks.iter().copied().map(Peak::from).collect()).unwrap()
    }

    #[test]
    fn test_disjoint_union() {
        let a = spectrum(&[(100.0, 10.0), (300.0, 5.0)]);
        let b = spectrum(&[(200.0, 3.0), (400.0, 1.0)]);
        let merged = merge_spectra([&a, &b], 10.0).unwrap();
        assert_eq!(
            merged.as_slice(),
            &[
                Peak::new(100.0, 10.0),
                Peak::new(200.0, 3.0),
                Peak::new(300.0, 5.0),
                Peak::new(400.0, 1.0),
            ]
        );
    }

    #[test]
    fn test_single_center() {
        let a = spectrum(&[(500.0, 10.0)]);
        let b = spectrum(&[(500.001, 30.0)]);
        let c = spectrum(&[(500.002, 10.0)]);
        let merged = merge_spectra([&a, &b, &c], 10.0).unwrap();
        assert_eq!(merged.len(), 1);
        let expected_mz = (500.0 * 10.0 + 500.001 * 30.0 + 500.002 * 10.0) / 50.0;
        assert!((merged[0].mz - expected_mz).abs() < 1e-9);
        assert_eq!(merged[0].intensity, 50.0);

        let reordered = merge_spectra([&c, &a, &b], 10.0).unwrap();
        assert_eq!(reordered.len(), 1);
        assert!((reordered[0].mz - merged[0].mz).abs() < 1e-9);
        assert_eq!(reordered[0].intensity, merged[0].intensity);
    }

    #[test]
    fn test_chained_against_centroid() {
        // Each step is within 10 ppm of the running centroid, the endpoints are not
        let a = spectrum(&[(1000.0, 1.0), (1000.013, 1.0)]);
        let b = spectrum(&[(1000.008, 1.0)]);
        let merged = merge_spectra([&a, &b], 10.0).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].intensity, 3.0);
        assert!((merged[0].mz - 1000.007).abs() < 1e-9);
    }

    #[test]
    fn test_idempotent() {
        let a = spectrum(&[(100.0, 1.0), (100.0005, 2.0), (250.0, 4.0)]);
        let b = spectrum(&[(100.0002, 3.0), (250.001, 1.0), (900.0, 8.0)]);
        let merged = merge_spectra([&a, &b], 10.0).unwrap();
        let remerged = merge_spectra([&merged], 10.0).unwrap();
        assert_eq!(merged, remerged);
    }

    #[test]
    fn test_zero_tolerance() {
        let a = spectrum(&[(100.0, 1.0), (200.0, 1.0)]);
        let b = spectrum(&[(100.0, 2.0), (200.0000001, 1.0)]);
        let merged = merge_spectra([&a, &b], 0.0).unwrap();
        assert_eq!(
            merged.as_slice(),
            &[
                Peak::new(100.0, 3.0),
                Peak::new(200.0, 1.0),
                Peak::new(200.0000001, 1.0),
            ]
        );

        let merged = merge_spectra([&a, &b], -5.0).unwrap();
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_zero_tolerance_identical_mz() {
        let a = spectrum(&[(100.1, 1.0)]);
        let b = spectrum(&[(100.1, 2.0)]);
        let c = spectrum(&[(100.1, 1.0)]);
        let merged = merge_spectra([&a, &b, &c], 0.0).unwrap();
        assert_eq!(merged.as_slice(), &[Peak::new(100.1, 4.0)]);
    }

    #[test]
    fn test_empty_input() {
        let a = spectrum(&[(100.0, 1.0)]);
        let b = Spectrum::default();
        assert_eq!(
            merge_spectra([&a, &b], 10.0),
            Err(MergeError::EmptyInput { index: 1 })
        );

        let merged = merge_spectra_skip_empty([&a, &b], 10.0);
        assert_eq!(merged.as_slice(), a.as_slice());

        let nothing: [&Spectrum; 0] = [];
        assert!(merge_spectra(nothing, 10.0).unwrap().is_empty());
    }

    #[test]
    fn test_zero_intensity() {
        let a = spectrum(&[(100.0, 0.0)]);
        let b = spectrum(&[(100.0001, 0.0)]);
        let merged = merge_spectra([&a, &b], 10.0).unwrap();
        assert_eq!(merged.len(), 1);
        assert!((merged[0].mz - 100.00005).abs() < 1e-9);
        assert_eq!(merged[0].intensity, 0.0);
    }
}
