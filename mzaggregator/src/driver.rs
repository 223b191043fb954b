use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use crossbeam_channel::bounded;
use serde::{Deserialize, Serialize};

use thiserror::Error;

use tracing::{debug, info, warn};

use mzdata::io::MassSpectrometryFormat;

use mzdeisotope::scorer::ScoreType;

use mzaggregate::{
    AggregatedFeatures, AggregationError, AggregationParams, FeatureAggregationEngine, MsRun,
    ParallelScanProcessor, ProcessingError, Scan, DEFAULT_MAX_MISSED_SCANS,
};

use crate::args::{
    make_default_ms1_deconvolution_params, ArgChargeRange, ArgIsotopicModels,
    DeconvolutionBuilderParams, ProcessorParams,
};
use crate::deconv::EngineDeconvolver;
use crate::read::{read_run, ReadParams};
use crate::time_range::TimeRange;
use crate::types::BUFFER_SIZE;
use crate::write::{open_output, write_output};

fn non_negative_float_f64(s: &str) -> Result<f64, String> {
    let value = s.parse::<f64>().map_err(|e| e.to_string())?;
    if !value.is_finite() {
        Err(format!("`{s}` is not a finite number"))
    } else if value < 0.0 {
        Err(format!("`{s}` is less than zero"))
    } else {
        Ok(value)
    }
}

fn non_negative_float_f32(s: &str) -> Result<f32, String> {
    let value = s.parse::<f32>().map_err(|e| e.to_string())?;
    if !value.is_finite() {
        Err(format!("`{s}` is not a finite number"))
    } else if value < 0.0 {
        Err(format!("`{s}` is less than zero"))
    } else {
        Ok(value)
    }
}

#[derive(Debug, Error)]
pub enum MZAggregatorError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("The input file format for {0} was either unknown or not supported ({1:?})")]
    FormatUnknownOrNotSupportedError(String, MassSpectrometryFormat),
    #[error("The input file format from STDIN was either unknown or not supported ({0:?})")]
    FormatUnknownOrNotSupportedErrorStdIn(MassSpectrometryFormat),
    #[error("Failed to load configuration: {0}")]
    ConfigurationError(
        #[source]
        #[from]
        figment::Error,
    ),
    #[error(transparent)]
    ProcessingError(#[from] ProcessingError),
    #[error(transparent)]
    AggregationError(#[from] AggregationError),
    #[error("Failed to serialize output: {0}")]
    SerializationError(
        #[source]
        #[from]
        serde_json::Error,
    ),
    #[error("No MS{ms_level} scans found in scan range {start}-{end}")]
    NoScansInRange { ms_level: u8, start: usize, end: usize },
}

/// Deconvolute the scans of a mass spectrometry file and aggregate the isotopic envelopes
/// found across consecutive scans into LC features.
///
/// Read a file or stream, deconvolute every scan at the requested MS level in parallel,
/// and write one line per feature as TSV or JSON lines.
#[derive(Parser, Debug, Deserialize, Serialize)]
#[command(author, version)]
pub struct MZAggregator {
    /// The path to read the input spectra from, or if '-' is passed, read from STDIN
    #[arg()]
    pub input_file: String,

    /// The path to write the features to, or if '-' is passed, write TSV to STDOUT.
    ///
    /// Paths ending in `.json` or `.jsonl` are written as JSON lines, anything else
    /// as TSV. A trailing `.gz` compresses the output.
    #[arg(short = 'o', long = "output-file", default_value = "-")]
    pub output_file: PathBuf,

    /// The path to write a log file to, in addition to STDERR
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// A TOML configuration file to read additional parameters from.
    ///
    /// Configurations are also read from `mzaggregator.toml` in the working directory.
    /// Environment variables prefixed with `MZAGGREGATOR_` will be read too.
    #[arg(long = "config-file")]
    pub config_file: Option<PathBuf>,

    /// The number of features that may be queued for writing at once
    #[arg(short = 'w', long="write-buffer-size", default_value_t=BUFFER_SIZE)]
    pub write_buffer_size: usize,

    /// The number of threads to use, passing a value < 1 to use all available threads
    #[arg(
        short='t',
        long="threads",
        default_value_t=-1,
    )]
    pub threads: i32,

    /// The time range to process, denoted (start?)-(stop?)
    #[arg(
        short='r',
        long="time-range",
        value_parser=TimeRange::from_str,
        value_name="BEGIN-END",
        long_help=r#"The time range to process, denoted (start?)-(stop?)

If a start is not specified, processing begins from the start of the run.
If a stop is not specified, processing stops at the end of the run.
"#
    )]
    pub time_range: Option<TimeRange>,

    /// The first one-based scan index to process
    #[arg(long = "min-scan")]
    pub min_scan: Option<usize>,

    /// The last one-based scan index to process
    #[arg(long = "max-scan")]
    pub max_scan: Option<usize>,

    /// The MS level of the scans to deconvolute and aggregate
    #[arg(long = "ms-level", default_value_t = 1)]
    pub ms_level: u8,

    /// The lowest m/z to search for isotopic patterns
    #[arg(long = "min-mz", default_value_t = 0.0, value_parser = non_negative_float_f64)]
    pub min_mz: f64,

    /// The highest m/z to search for isotopic patterns, unbounded if not given
    #[arg(long = "max-mz", value_parser = non_negative_float_f64)]
    pub max_mz: Option<f64>,

    /// The range of charge states to consider for each peak denoted (low)-(high) or (high)
    #[arg(
        short = 'z',
        long = "charge-range",
        default_value_t=ArgChargeRange(1, 8),
    )]
    pub charge_range: ArgChargeRange,

    /// The mass accuracy in ppm used when fitting isotopic patterns within a scan
    #[arg(
        short = 'e',
        long = "deconvolution-tolerance",
        default_value_t = 20.0,
        value_parser = non_negative_float_f64
    )]
    pub deconvolution_tolerance: f64,

    /// The largest permitted intensity ratio between adjacent isotopic peaks
    #[arg(
        long = "intensity-ratio-limit",
        default_value_t = 3.0,
        value_parser = non_negative_float_f64
    )]
    pub intensity_ratio_limit: f64,

    /// The mass accuracy in ppm used when matching envelopes to features across scans
    #[arg(
        short = 'p',
        long = "aggregation-tolerance",
        default_value_t = 10.0,
        value_parser = non_negative_float_f64
    )]
    pub aggregation_tolerance: f64,

    /// The number of consecutive scans a feature may go unmatched before it is closed
    #[arg(long = "max-missed-scans", default_value_t = DEFAULT_MAX_MISSED_SCANS)]
    pub max_missed_scans: usize,

    /// The minimum isotopic pattern fit score
    #[arg(short = 's', long = "score-threshold", default_value_t = 20.0)]
    pub score_threshold: ScoreType,

    /// The isotopic model to use, may be passed more than once
    #[arg(short = 'a', long = "isotopic-model", default_value = "peptide")]
    pub isotopic_model: Vec<ArgIsotopicModels>,

    /// The maximum number of missed peaks in an isotopic pattern
    #[arg(short = 'm', long = "max-missed-peaks", default_value_t = 1)]
    pub max_missed_peaks: u16,

    /// The minimum signal-to-noise ratio used when picking peaks from profile spectra
    #[arg(
        long = "signal-to-noise",
        default_value_t = 1.0,
        value_parser = non_negative_float_f32
    )]
    pub signal_to_noise: f32,

    /// Stop at the first scan which fails to deconvolute instead of skipping it
    #[arg(long = "fail-fast")]
    pub fail_fast: bool,

    /// Abandon deconvolution after this many seconds, writing nothing
    #[arg(long = "timeout", value_parser = non_negative_float_f64)]
    pub timeout: Option<f64>,

    #[arg(
        skip,
        help = "Additional granular control over how scans are distributed across threads"
    )]
    #[serde(default)]
    pub processor_params: ProcessorParams,
}

impl MZAggregator {
    fn read_params(&self) -> ReadParams {
        ReadParams {
            ms_level: self.ms_level,
            time_range: self.time_range.unwrap_or_default(),
            signal_to_noise: self.signal_to_noise,
        }
    }

    fn mz_range(&self) -> (f64, f64) {
        (self.min_mz, self.max_mz.unwrap_or(f64::INFINITY))
    }

    pub fn deconvolution_builder_params(&self) -> DeconvolutionBuilderParams {
        let mut params =
            make_default_ms1_deconvolution_params().with_score_threshold(self.score_threshold);
        params.isotopic_models = self.isotopic_model.clone();
        params.charge_range = self.charge_range.into();
        params.mz_range = self.mz_range();
        params.max_missed_peaks = self.max_missed_peaks;
        params
    }

    pub fn aggregation_params(&self) -> AggregationParams {
        AggregationParams {
            mz_range: self.mz_range(),
            charge_range: self.charge_range.into(),
            deconvolution_tolerance_ppm: self.deconvolution_tolerance,
            intensity_ratio_limit: self.intensity_ratio_limit,
            aggregation_tolerance_ppm: self.aggregation_tolerance,
            max_missed_scans: self.max_missed_scans,
        }
    }

    fn make_processor(&self) -> ParallelScanProcessor {
        ParallelScanProcessor::new(self.threads)
            .with_chunk_size(self.processor_params.chunk_size)
            .with_fail_fast(self.fail_fast)
            .with_timeout(self.timeout.and_then(|t| match Duration::try_from_secs_f64(t) {
                Ok(timeout) => Some(timeout),
                Err(e) => {
                    warn!("Ignoring timeout {t}: {e}");
                    None
                }
            }))
            .with_required_ms_level(Some(self.ms_level))
    }

    /// Narrow the requested scan index range to the run and the time range, if any
    pub fn resolve_scan_range(&self, run: &MsRun) -> Result<(usize, usize), MZAggregatorError> {
        let mut start = self.min_scan.unwrap_or(1).max(1);
        let mut end = self.max_scan.unwrap_or(run.len()).min(run.len());
        if let Some(time_range) = self.time_range {
            match run.scan_range_for_time(time_range.start, time_range.end) {
                Some((lo, hi)) => {
                    start = start.max(lo);
                    end = end.min(hi);
                }
                None => end = 0,
            }
        }
        let has_target_scans = start <= end
            && run
                .scans_in_index_range(start..=end)
                .iter()
                .any(|s| s.ms_level == self.ms_level);
        if has_target_scans {
            Ok((start, end))
        } else {
            Err(MZAggregatorError::NoScansInRange {
                ms_level: self.ms_level,
                start,
                end,
            })
        }
    }

    pub fn main(&self) -> Result<(), MZAggregatorError> {
        info!(
            "mzaggregator v{}",
            option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
        );
        info!("Input: {}", self.input_file);
        info!("Output: {}", self.output_file.display());
        match toml::to_string_pretty(self) {
            Ok(config) => debug!("Configuration:\n{config}"),
            Err(e) => debug!("Failed to render configuration: {e}"),
        }

        let start = Instant::now();
        let read_params = self.read_params();
        let (run, mut prog) = read_run(&self.input_file, &read_params)?;
        let (min_scan, max_scan) = self.resolve_scan_range(&run)?;
        info!("Processing scans {min_scan} through {max_scan}");

        let deconvolver = EngineDeconvolver::from(&self.deconvolution_builder_params());
        let engine = FeatureAggregationEngine::new(deconvolver, self.aggregation_params())
            .with_processor(self.make_processor());

        let ms_level = self.ms_level;
        let time_range = read_params.time_range;
        if !time_range.is_unbounded() {
            info!("Restricting to retention times {time_range}");
        }
        let results = engine.deconvolute(
            &run,
            Some(min_scan),
            Some(max_scan),
            move |scan: &Scan| {
                scan.ms_level == ms_level && time_range.contains_time(scan.retention_time)
            },
        )?;
        drop(run);

        prog.scans_deconvoluted = results.num_succeeded();
        prog.scans_failed = results.num_failed();
        prog.envelopes = results.num_envelopes();
        let deconvolution_done = Instant::now();
        info!(
            "Deconvolution Elapsed Time: {:0.3?}",
            deconvolution_done - start
        );

        let aggregated = AggregatedFeatures::new(results, &self.aggregation_params());
        for failure in aggregated.failures.iter().take(10) {
            warn!("{failure}");
        }
        if aggregated.failures.len() > 10 {
            warn!("... and {} more scans failed", aggregated.failures.len() - 10);
        }

        let writer = open_output(&self.output_file)?;
        let (send_features, recv_features) = bounded(self.write_buffer_size.max(1));
        let mut features = aggregated.features;

        let aggregate_task = thread::spawn(move || {
            for feature in features.by_ref() {
                let feature = feature?;
                if send_features.send(feature).is_err() {
                    warn!("The feature writer stopped receiving early");
                    break;
                }
            }
            Ok::<_, AggregationError>(features.stats())
        });

        let write_task = thread::spawn(move || write_output(writer, recv_features));

        let mut outcome = Ok(());
        match aggregate_task.join() {
            Ok(Ok(stats)) => {
                debug!(
                    "Opened {} features, at most {} at once",
                    stats.features_opened, stats.max_open_features
                );
            }
            Ok(Err(e)) => {
                outcome = Err(e.into());
            }
            Err(e) => {
                warn!("Failed to join aggregation task: {e:?}");
            }
        }

        match write_task.join() {
            Ok(o) => {
                prog.features_written = o?;
            }
            Err(e) => {
                warn!("Failed to join writer task: {e:?}");
            }
        }

        prog.log();
        let elapsed = Instant::now() - start;
        if (elapsed - (deconvolution_done - start)).as_secs_f64() > 2.0 {
            info!("Total Elapsed Time: {:0.3?}", elapsed);
        }
        outcome
    }
}
