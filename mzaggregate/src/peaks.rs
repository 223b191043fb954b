//! Centroided peaks and the spectra built from them.
use std::cmp::Ordering;
use std::fmt::Display;
use std::ops::Index;
use std::slice;

use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::merge::{merge_spectra, MergeError};

/// A single centroided signal, an m/z coordinate and the signal measured there.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Peak {
    pub mz: f64,
    pub intensity: f64,
}

impl Peak {
    pub fn new(mz: f64, intensity: f64) -> Self {
        Self { mz, intensity }
    }
}

impl Display for Peak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:0.5}, {:0.2})", self.mz, self.intensity)
    }
}

impl From<(f64, f64)> for Peak {
    fn from(value: (f64, f64)) -> Self {
        Self::new(value.0, value.1)
    }
}

/// An error raised when a peak list violates the [`Spectrum`] invariants
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpectrumError {
    #[error("Peak {index} at m/z {mz} does not follow the previous peak at m/z {previous}")]
    NotStrictlyIncreasing { index: usize, mz: f64, previous: f64 },
    #[error("Peak {index} has a negative intensity {intensity}")]
    NegativeIntensity { index: usize, intensity: f64 },
    #[error("Peak {index} has a non-finite coordinate ({mz}, {intensity})")]
    NonFinite { index: usize, mz: f64, intensity: f64 },
}

/// A peak list sorted by strictly increasing m/z with non-negative intensities.
///
/// The invariants are checked on construction, so every [`Spectrum`] in circulation
/// can be walked with a single forward cursor.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Spectrum {
    peaks: Vec<Peak>,
}

impl Spectrum {
    /// Build a spectrum from a peak list which must already be sorted.
    pub fn new(peaks: Vec<Peak>) -> Result<Self, SpectrumError> {
        let mut previous: Option<f64> = None;
        for (index, peak) in peaks.iter().enumerate() {
            if !peak.mz.is_finite() || !peak.intensity.is_finite() {
                return Err(SpectrumError::NonFinite {
                    index,
                    mz: peak.mz,
                    intensity: peak.intensity,
                });
            }
            if peak.intensity < 0.0 {
                return Err(SpectrumError::NegativeIntensity {
                    index,
                    intensity: peak.intensity,
                });
            }
            if let Some(previous) = previous {
                if peak.mz <= previous {
                    return Err(SpectrumError::NotStrictlyIncreasing {
                        index,
                        mz: peak.mz,
                        previous,
                    });
                }
            }
            previous = Some(peak.mz);
        }
        Ok(Self { peaks })
    }

    /// Build a spectrum from an arbitrary peak list.
    ///
    /// Peaks with non-finite coordinates or negative intensities are dropped, the rest
    /// are sorted by m/z, and peaks sharing an identical m/z are summed together.
    pub fn from_unsorted(mut peaks: Vec<Peak>) -> Self {
        peaks.retain(|p| p.mz.is_finite() && p.intensity.is_finite() && p.intensity >= 0.0);
        peaks.sort_by(|a, b| a.mz.total_cmp(&b.mz));
        peaks.dedup_by(|next, kept| {
            if next.mz == kept.mz {
                kept.intensity += next.intensity;
                true
            } else {
                false
            }
        });
        Self { peaks }
    }

    /// Wrap a peak list produced by code that upholds the ordering invariant itself
    pub(crate) fn from_sorted_unchecked(peaks: Vec<Peak>) -> Self {
        debug_assert!(peaks.windows(2).all(|w| w[0].mz < w[1].mz));
        Self { peaks }
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, Peak> {
        self.peaks.iter()
    }

    pub fn as_slice(&self) -> &[Peak] {
        &self.peaks
    }

    pub fn get(&self, index: usize) -> Option<&Peak> {
        self.peaks.get(index)
    }

    pub fn into_peaks(self) -> Vec<Peak> {
        self.peaks
    }

    /// The total ion current, the sum of all peak intensities
    pub fn tic(&self) -> f64 {
        self.peaks.iter().map(|p| p.intensity).sum()
    }

    /// The most intense peak, if any
    pub fn base_peak(&self) -> Option<&Peak> {
        self.peaks.iter().max_by(|a, b| {
            a.intensity
                .partial_cmp(&b.intensity)
                .unwrap_or(Ordering::Equal)
        })
    }

    /// The lowest and highest m/z in the spectrum
    pub fn mz_range(&self) -> Option<(f64, f64)> {
        match (self.peaks.first(), self.peaks.last()) {
            (Some(first), Some(last)) => Some((first.mz, last.mz)),
            _ => None,
        }
    }

    /// Peaks whose m/z falls within `low..=high`
    pub fn between(&self, low: f64, high: f64) -> &[Peak] {
        let start = self.peaks.partition_point(|p| p.mz < low);
        let end = self.peaks.partition_point(|p| p.mz <= high);
        if start >= end {
            &[]
        } else {
            &self.peaks[start..end]
        }
    }

    /// Merge this spectrum with `other` using [`merge_spectra`]
    pub fn merge_with(&self, other: &Spectrum, ppm_tolerance: f64) -> Result<Spectrum, MergeError> {
        merge_spectra([self, other], ppm_tolerance)
    }
}

impl Index<usize> for Spectrum {
    type Output = Peak;

    fn index(&self, index: usize) -> &Self::Output {
        &self.peaks[index]
    }
}

impl<'a> IntoIterator for &'a Spectrum {
    type Item = &'a Peak;

    type IntoIter = slice::Iter<'a, Peak>;

    fn into_iter(self) -> Self::IntoIter {
        self.peaks.iter()
    }
}

impl TryFrom<Vec<Peak>> for Spectrum {
    type Error = SpectrumError;

    fn try_from(value: Vec<Peak>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl FromIterator<Peak> for Spectrum {
    fn from_iter<T: IntoIterator<Item = Peak>>(iter: T) -> Self {
        Self::from_unsorted(iter.into_iter().collect())
    }
}
