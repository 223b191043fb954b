//! Deconvolved isotopic envelopes and the scan context they were observed in.
use std::fmt::Display;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::peaks::Peak;

/// An isotopic pattern produced by deconvolving a single scan.
///
/// `peaks` are the experimental peaks which were assigned to the pattern, and
/// `total_intensity` is their summed intensity unless the producer supplied its own.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IsotopicEnvelope {
    pub monoisotopic_mass: f64,
    pub charge: i32,
    pub peaks: Vec<Peak>,
    pub total_intensity: f64,
    /// The goodness-of-fit reported by the deconvolution algorithm, zero if unscored
    #[cfg_attr(feature = "serde", serde(default))]
    pub score: f32,
}

impl IsotopicEnvelope {
    pub fn new(monoisotopic_mass: f64, charge: i32, peaks: Vec<Peak>) -> Self {
        let total_intensity = peaks.iter().map(|p| p.intensity).sum();
        Self {
            monoisotopic_mass,
            charge,
            peaks,
            total_intensity,
            score: 0.0,
        }
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.score = score;
        self
    }

    pub fn with_total_intensity(mut self, total_intensity: f64) -> Self {
        self.total_intensity = total_intensity;
        self
    }

    pub fn num_peaks(&self) -> usize {
        self.peaks.len()
    }
}

impl Display for IsotopicEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "IsotopicEnvelope({:0.4}, z={}, {} peaks, {:0.2})",
            self.monoisotopic_mass,
            self.charge,
            self.peaks.len(),
            self.total_intensity
        )
    }
}

/// An [`IsotopicEnvelope`] tagged with the scan it was found in
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EnvelopeObservation {
    pub scan_index: usize,
    pub elution_time: f64,
    pub envelope: IsotopicEnvelope,
}

impl EnvelopeObservation {
    pub fn new(scan_index: usize, elution_time: f64, envelope: IsotopicEnvelope) -> Self {
        Self {
            scan_index,
            elution_time,
            envelope,
        }
    }

    pub fn monoisotopic_mass(&self) -> f64 {
        self.envelope.monoisotopic_mass
    }

    pub fn charge(&self) -> i32 {
        self.envelope.charge
    }

    pub fn num_peaks(&self) -> usize {
        self.envelope.peaks.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_envelope() {
        let envelope = IsotopicEnvelope::new(
            998.9927,
            2,
            vec![Peak::new(500.5036, 100.0), Peak::new(501.0050, 60.0)],
        );
        assert_eq!(envelope.total_intensity, 160.0);
        assert_eq!(envelope.num_peaks(), 2);
    }
}
