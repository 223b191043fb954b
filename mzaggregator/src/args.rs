use std::fmt::Display;
use std::num::ParseIntError;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use mzdeisotope::{
    DeconvolutionEngine, IsotopicModelLike,
    isotopic_model::{IsotopicModel, IsotopicModels, IsotopicPatternParams},
    scorer::{MaximizingFitFilter, PenalizedMSDeconvScorer, ScoreType},
};

use crate::types::CPeak;

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgIsotopicModels {
    Peptide,
    Glycan,
    Glycopeptide,
    PermethylatedGlycan,
    Heparin,
    HeparanSulfate,
}

impl From<ArgIsotopicModels> for IsotopicModels {
    fn from(value: ArgIsotopicModels) -> Self {
        match value {
            ArgIsotopicModels::Peptide => IsotopicModels::Peptide,
            ArgIsotopicModels::Glycan => IsotopicModels::Glycan,
            ArgIsotopicModels::Glycopeptide => IsotopicModels::Glycopeptide,
            ArgIsotopicModels::PermethylatedGlycan => IsotopicModels::PermethylatedGlycan,
            ArgIsotopicModels::Heparin => IsotopicModels::Heparin,
            ArgIsotopicModels::HeparanSulfate => IsotopicModels::HeparanSulfate,
        }
    }
}

impl From<ArgIsotopicModels> for IsotopicModel<'static> {
    fn from(value: ArgIsotopicModels) -> Self {
        let m: IsotopicModels = value.into();
        m.into()
    }
}

impl Display for ArgIsotopicModels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Error)]
pub enum ChargeRangeParseError {
    #[error("Failed to parse charge range low {0}")]
    MalformedLow(ParseIntError),
    #[error("Failed to parse charge range high {0}")]
    MalformedHigh(ParseIntError),
    #[error("Charge range {0}-{1} must have a non-zero low and a high of at least the low")]
    Inverted(i32, i32),
}

/// A range of charge states, denoted (low)-(high) or (high) alone with an implied low of 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgChargeRange(pub i32, pub i32);

impl FromStr for ArgChargeRange {
    type Err = ChargeRangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // A leading '-' belongs to a negative low, not the separator
        let (low, high) = match s.get(1..).and_then(|rest| rest.find(['-', ':', ' '])) {
            Some(i) => (&s[..=i], &s[i + 2..]),
            None => ("", s),
        };
        let high: i32 = high
            .trim()
            .parse()
            .map_err(ChargeRangeParseError::MalformedHigh)?;
        let low: i32 = if low.trim().is_empty() {
            if high < 0 {
                -1
            } else {
                1
            }
        } else {
            low.trim()
                .parse()
                .map_err(ChargeRangeParseError::MalformedLow)?
        };
        if low == 0 || high == 0 || low.abs() > high.abs() || low.signum() != high.signum() {
            return Err(ChargeRangeParseError::Inverted(low, high));
        }
        Ok(Self(low, high))
    }
}

impl Display for ArgChargeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.0, self.1)
    }
}

impl From<ArgChargeRange> for (i32, i32) {
    fn from(value: ArgChargeRange) -> Self {
        (value.0, value.1)
    }
}

impl Default for ArgChargeRange {
    fn default() -> Self {
        Self(1, 8)
    }
}

/// Everything needed to construct a configured [`DeconvolutionEngine`]
#[derive(Debug, Clone)]
pub struct DeconvolutionBuilderParams {
    pub scorer: PenalizedMSDeconvScorer,
    pub isotopic_models: Vec<ArgIsotopicModels>,
    pub fit_filter: MaximizingFitFilter,
    pub isotopic_params: IsotopicPatternParams,
    pub charge_range: (i32, i32),
    pub mz_range: (f64, f64),
    pub max_missed_peaks: u16,
}

impl DeconvolutionBuilderParams {
    pub fn new(
        scorer: PenalizedMSDeconvScorer,
        isotopic_models: Vec<ArgIsotopicModels>,
        fit_filter: MaximizingFitFilter,
        isotopic_params: IsotopicPatternParams,
        charge_range: (i32, i32),
        mz_range: (f64, f64),
        max_missed_peaks: u16,
    ) -> Self {
        Self {
            scorer,
            isotopic_models,
            fit_filter,
            isotopic_params,
            charge_range,
            mz_range,
            max_missed_peaks,
        }
    }

    pub fn with_score_threshold(mut self, threshold: ScoreType) -> Self {
        self.fit_filter.threshold = threshold;
        self
    }

    /// Build the engine and pre-populate its isotopic pattern cache over the m/z and
    /// charge ranges to be searched.
    pub fn build_engine(
        &self,
    ) -> DeconvolutionEngine<'static, CPeak, PenalizedMSDeconvScorer, MaximizingFitFilter> {
        let models: IsotopicModelLike<'static> = if self.isotopic_models.is_empty() {
            IsotopicModels::Peptide.into()
        } else {
            self.isotopic_models
                .iter()
                .map(|m| IsotopicModel::from(*m))
                .collect()
        };
        let mut engine = DeconvolutionEngine::new(
            self.isotopic_params,
            models,
            self.scorer,
            self.fit_filter,
            true,
        );
        let max_mz = if self.mz_range.1.is_finite() {
            self.mz_range.1
        } else {
            DEFAULT_CACHE_MAX_MZ
        };
        engine.populate_isotopic_model_cache(
            self.mz_range.0.max(DEFAULT_CACHE_MIN_MZ),
            max_mz,
            self.charge_range.0,
            self.charge_range.1,
        );
        engine
    }
}

/// Lower level knobs for the parallel scan processor, only settable from a configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorParams {
    /// The number of consecutive scans each worker takes at a time
    pub chunk_size: usize,
}

impl Default for ProcessorParams {
    fn default() -> Self {
        Self { chunk_size: 8 }
    }
}

const DEFAULT_CACHE_MIN_MZ: f64 = 80.0;
const DEFAULT_CACHE_MAX_MZ: f64 = 3000.0;

pub fn make_default_ms1_deconvolution_params() -> DeconvolutionBuilderParams {
    DeconvolutionBuilderParams::new(
        PenalizedMSDeconvScorer::new(0.02, 2.0),
        vec![ArgIsotopicModels::Peptide],
        MaximizingFitFilter::new(20.0),
        Default::default(),
        (1, 8),
        (80.0, 2200.0),
        1,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_charge_range_fromstr() -> Result<(), ChargeRangeParseError> {
        let z: ArgChargeRange = "1-8".parse()?;
        assert_eq!(z, ArgChargeRange(1, 8));

        let z: ArgChargeRange = "12".parse()?;
        assert_eq!(z, ArgChargeRange(1, 12));

        let z: ArgChargeRange = "2:4".parse()?;
        assert_eq!(z, ArgChargeRange(2, 4));

        let z: ArgChargeRange = "-1--4".parse()?;
        assert_eq!(z, ArgChargeRange(-1, -4));

        assert_eq!(z.to_string(), "-1--4");
        Ok(())
    }

    #[test]
    fn test_charge_range_malformed() {
        assert!(matches!(
            "a-3".parse::<ArgChargeRange>(),
            Err(ChargeRangeParseError::MalformedLow(_))
        ));
        assert!(matches!(
            "1-b".parse::<ArgChargeRange>(),
            Err(ChargeRangeParseError::MalformedHigh(_))
        ));
        assert!(matches!(
            "5-2".parse::<ArgChargeRange>(),
            Err(ChargeRangeParseError::Inverted(5, 2))
        ));
    }
}
