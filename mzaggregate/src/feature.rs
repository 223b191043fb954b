//! Multi-scan features assembled from isotopic envelopes.
use std::fmt::Display;

use itertools::Itertools;
use mzpeaks::Tolerance;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::envelope::{EnvelopeObservation, IsotopicEnvelope};

/// The empirical mass spacing between the monoisotopic peak and the first three
/// isotopic peaks of an averagine-like pattern.
pub const ISOTOPE_SPACINGS: [f64; 3] = [1.002868314, 2.005408917, 3.007841294];

/// Envelopes within this many Daltons of a mass group's mass are pooled into that group
pub const MASS_GROUP_TOLERANCE: f64 = 0.5;

/// A hypothesis that an observed mass is `shift` isotopic peaks away from the mass
/// of a feature, i.e. that the monoisotopic peak was mis-assigned by the deconvolver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IsotopeOffset {
    pub shift: i8,
    pub mass_shift: f64,
}

impl IsotopeOffset {
    pub const fn new(shift: i8, mass_shift: f64) -> Self {
        Self { shift, mass_shift }
    }

    /// Test whether `query`, corrected by this offset, is within `ppm_tolerance` of `reference`
    #[inline]
    pub fn matches(&self, query: f64, reference: f64, ppm_tolerance: f64) -> bool {
        Tolerance::PPM(ppm_tolerance).test(query - self.mass_shift, reference)
    }
}

/// The offsets tried when matching a mass to a feature, in the order they are tried
pub const ISOTOPE_HYPOTHESES: [IsotopeOffset; 7] = [
    IsotopeOffset::new(0, 0.0),
    IsotopeOffset::new(1, ISOTOPE_SPACINGS[0]),
    IsotopeOffset::new(-1, -ISOTOPE_SPACINGS[0]),
    IsotopeOffset::new(2, ISOTOPE_SPACINGS[1]),
    IsotopeOffset::new(-2, -ISOTOPE_SPACINGS[1]),
    IsotopeOffset::new(3, ISOTOPE_SPACINGS[2]),
    IsotopeOffset::new(-3, -ISOTOPE_SPACINGS[2]),
];

/// Observations of one feature sharing the same nominal isotope offset
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MassGroup {
    observations: Vec<EnvelopeObservation>,
    mass: f64,
    num_peaks: usize,
}

impl MassGroup {
    pub fn new(observation: EnvelopeObservation) -> Self {
        let mass = observation.monoisotopic_mass();
        let num_peaks = observation.num_peaks();
        Self {
            observations: vec![observation],
            mass,
            num_peaks,
        }
    }

    pub fn push(&mut self, observation: EnvelopeObservation) {
        self.num_peaks += observation.num_peaks();
        self.observations.push(observation);
        let n = self.observations.len() as f64;
        self.mass = self
            .observations
            .iter()
            .map(|o| o.monoisotopic_mass())
            .sum::<f64>()
            / n;
    }

    /// The mean monoisotopic mass of the member envelopes
    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// The total number of experimental peaks across the member envelopes
    pub fn num_peaks(&self) -> usize {
        self.num_peaks
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn observations(&self) -> &[EnvelopeObservation] {
        &self.observations
    }

    pub fn charges(&self) -> Vec<i32> {
        self.observations
            .iter()
            .map(|o| o.charge())
            .sorted()
            .dedup()
            .collect()
    }
}

/// A set of isotopic envelopes believed to originate from the same analyte eluting
/// over a contiguous span of scans.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Feature {
    mass_groups: Vec<MassGroup>,
    representative: usize,
    pub min_scan_index: usize,
    pub max_scan_index: usize,
    pub min_elution_time: f64,
    pub max_elution_time: f64,
    pub total_intensity: f64,
}

impl Feature {
    pub fn new(envelope: IsotopicEnvelope, scan_index: usize, elution_time: f64) -> Self {
        let total_intensity = envelope.total_intensity;
        let group = MassGroup::new(EnvelopeObservation::new(scan_index, elution_time, envelope));
        Self {
            mass_groups: vec![group],
            representative: 0,
            min_scan_index: scan_index,
            max_scan_index: scan_index,
            min_elution_time: elution_time,
            max_elution_time: elution_time,
            total_intensity,
        }
    }

    /// Add `envelope` to this feature, pooling it with the closest mass group within
    /// [`MASS_GROUP_TOLERANCE`] or starting a new group.
    pub fn add_envelope(
        &mut self,
        envelope: IsotopicEnvelope,
        scan_index: usize,
        elution_time: f64,
    ) {
        self.min_scan_index = self.min_scan_index.min(scan_index);
        self.max_scan_index = self.max_scan_index.max(scan_index);
        self.min_elution_time = self.min_elution_time.min(elution_time);
        self.max_elution_time = self.max_elution_time.max(elution_time);
        self.total_intensity += envelope.total_intensity;

        let mass = envelope.monoisotopic_mass;
        let observation = EnvelopeObservation::new(scan_index, elution_time, envelope);

        let nearest = self
            .mass_groups
            .iter()
            .enumerate()
            .map(|(i, g)| (i, (g.mass() - mass).abs()))
            .filter(|(_, err)| *err < MASS_GROUP_TOLERANCE)
            .min_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| i);

        match nearest {
            Some(i) => self.mass_groups[i].push(observation),
            None => self.mass_groups.push(MassGroup::new(observation)),
        }
        self.update_representative();
    }

    /// The group with the most peaks wins, the earliest group on a tie
    fn update_representative(&mut self) {
        let mut best = 0;
        for (i, group) in self.mass_groups.iter().enumerate().skip(1) {
            if group.num_peaks() > self.mass_groups[best].num_peaks() {
                best = i;
            }
        }
        self.representative = best;
    }

    pub fn representative_group(&self) -> &MassGroup {
        &self.mass_groups[self.representative]
    }

    /// The mass of the mass group supported by the most peaks
    pub fn mass(&self) -> f64 {
        self.representative_group().mass()
    }

    /// Find the first isotope hypothesis under which `mass` matches this feature
    pub fn match_mass(&self, mass: f64, ppm_tolerance: f64) -> Option<IsotopeOffset> {
        let reference = self.mass();
        ISOTOPE_HYPOTHESES
            .iter()
            .find(|h| h.matches(mass, reference, ppm_tolerance))
            .copied()
    }

    pub fn num_peaks(&self) -> usize {
        self.mass_groups.iter().map(|g| g.num_peaks()).sum()
    }

    pub fn num_envelopes(&self) -> usize {
        self.mass_groups.iter().map(|g| g.len()).sum()
    }

    /// The distinct charge states observed, in ascending order
    pub fn charges(&self) -> Vec<i32> {
        self.observations()
            .map(|o| o.charge())
            .sorted()
            .dedup()
            .collect()
    }

    pub fn mass_groups(&self) -> &[MassGroup] {
        &self.mass_groups
    }

    pub fn observations(&self) -> impl Iterator<Item = &EnvelopeObservation> + '_ {
        self.mass_groups.iter().flat_map(|g| g.observations.iter())
    }

    pub fn into_observations(self) -> impl Iterator<Item = EnvelopeObservation> {
        self.mass_groups.into_iter().flat_map(|g| g.observations)
    }

    /// The number of scans spanned, inclusive of both ends
    pub fn scan_span(&self) -> usize {
        self.max_scan_index - self.min_scan_index + 1
    }
}

impl Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Feature({:0.4}, scans {}-{}, time {:0.3}-{:0.3}, {:0.2}, {} peaks, charges {:?})",
            self.mass(),
            self.min_scan_index,
            self.max_scan_index,
            self.min_elution_time,
            self.max_elution_time,
            self.total_intensity,
            self.num_peaks(),
            self.charges()
        )
    }
}
