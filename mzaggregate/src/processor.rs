//! Concurrent per-scan deconvolution over a contiguous range of scan indices.
//!
//! Every scan index in the requested range owns one slot in a [`ScanResultSet`]. The
//! slots are split into fixed size chunks, and each chunk is handed to exactly one
//! worker of a dedicated [`rayon::ThreadPool`], so no two workers ever write to the
//! same slot. When [`ParallelScanProcessor::process`] returns, all workers have finished.
use std::any::Any;
use std::ops::RangeInclusive;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::aggregator::ScanEnvelopes;
use crate::envelope::IsotopicEnvelope;
use crate::scan::{Scan, ScanSource};

/// The parameters passed through to a [`ScanDeconvolver`] for every scan
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeconvolutionParams {
    /// The m/z window to search for isotopic patterns in
    pub mz_range: (f64, f64),
    /// The inclusive range of charge states to consider
    pub charge_range: (i32, i32),
    /// The mass accuracy used to match theoretical and experimental peaks
    pub error_tolerance_ppm: f64,
    /// The largest permitted ratio between adjacent isotopic peak intensities
    pub intensity_ratio_limit: f64,
}

impl Default for DeconvolutionParams {
    fn default() -> Self {
        Self {
            mz_range: (0.0, f64::INFINITY),
            charge_range: (1, 8),
            error_tolerance_ppm: 20.0,
            intensity_ratio_limit: 3.0,
        }
    }
}

/// An error reported by a [`ScanDeconvolver`] for a single scan
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeconvolverError {
    #[error("Cannot deconvolute a scan with MS level {0}")]
    ScanLevelMismatch(u8),
    #[error("Deconvolution failed: {0}")]
    Failed(String),
}

/// Turns one scan into the isotopic envelopes found in it.
///
/// A [`ParallelScanProcessor`] clones the deconvolver once per worker thread, so any
/// mutable state, like a cache of theoretical isotopic patterns, is never shared.
pub trait ScanDeconvolver {
    fn deconvolute(
        &mut self,
        scan: &Scan,
        params: &DeconvolutionParams,
    ) -> Result<Vec<IsotopicEnvelope>, DeconvolverError>;
}

impl<F> ScanDeconvolver for F
where
    F: FnMut(&Scan, &DeconvolutionParams) -> Result<Vec<IsotopicEnvelope>, DeconvolverError>,
{
    fn deconvolute(
        &mut self,
        scan: &Scan,
        params: &DeconvolutionParams,
    ) -> Result<Vec<IsotopicEnvelope>, DeconvolverError> {
        (self)(scan, params)
    }
}

/// A failure confined to a single scan
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScanError {
    #[error("Scan {scan_index} has MS level {ms_level} which cannot be deconvoluted")]
    ScanLevelMismatch { scan_index: usize, ms_level: u8 },
    #[error("Failed to deconvolute scan {scan_index}: {message}")]
    DeconvolutionFailure { scan_index: usize, message: String },
    #[error("Scan {scan_index} was not found")]
    MissingScan { scan_index: usize },
}

impl ScanError {
    pub fn scan_index(&self) -> usize {
        match self {
            Self::ScanLevelMismatch { scan_index, .. } => *scan_index,
            Self::DeconvolutionFailure { scan_index, .. } => *scan_index,
            Self::MissingScan { scan_index } => *scan_index,
        }
    }

    fn from_deconvolver(scan_index: usize, err: DeconvolverError) -> Self {
        match err {
            DeconvolverError::ScanLevelMismatch(ms_level) => Self::ScanLevelMismatch {
                scan_index,
                ms_level,
            },
            DeconvolverError::Failed(message) => Self::DeconvolutionFailure {
                scan_index,
                message,
            },
        }
    }
}

/// What happened to a single scan index during processing
#[derive(Debug, Default, Clone, PartialEq)]
pub enum ScanOutcome {
    /// The scan was excluded by the inclusion predicate. This is not the same
    /// as a scan which was deconvoluted and yielded nothing.
    #[default]
    NotAttempted,
    Envelopes(Vec<IsotopicEnvelope>),
    Failed(ScanError),
    /// Processing stopped before this scan was reached
    Cancelled,
}

impl ScanOutcome {
    pub fn envelopes(&self) -> Option<&[IsotopicEnvelope]> {
        match self {
            Self::Envelopes(envelopes) => Some(envelopes),
            _ => None,
        }
    }

    pub fn into_envelopes(self) -> Option<Vec<IsotopicEnvelope>> {
        match self {
            Self::Envelopes(envelopes) => Some(envelopes),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ScanError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Envelopes(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ScanSlot {
    retention_time: f64,
    outcome: ScanOutcome,
}

impl Default for ScanSlot {
    fn default() -> Self {
        Self {
            retention_time: f64::NAN,
            outcome: ScanOutcome::NotAttempted,
        }
    }
}

/// Per-scan outcomes for a contiguous, inclusive range of scan indices.
///
/// Lookups outside of the range return `None` rather than panicking.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScanResultSet {
    start: usize,
    slots: Vec<ScanSlot>,
}

impl ScanResultSet {
    /// Allocate one [`ScanOutcome::NotAttempted`] slot for every index in `min_scan..=max_scan`
    pub fn new(min_scan: usize, max_scan: usize) -> Self {
        let n = if max_scan >= min_scan {
            max_scan - min_scan + 1
        } else {
            0
        };
        Self {
            start: min_scan,
            slots: vec![ScanSlot::default(); n],
        }
    }

    fn slot_of(&self, scan_index: usize) -> Option<usize> {
        scan_index
            .checked_sub(self.start)
            .filter(|i| *i < self.slots.len())
    }

    pub fn get(&self, scan_index: usize) -> Option<&ScanOutcome> {
        self.slot_of(scan_index).map(|i| &self.slots[i].outcome)
    }

    /// The retention time recorded for `scan_index`, `NaN` if the scan was missing
    pub fn retention_time(&self, scan_index: usize) -> Option<f64> {
        self.slot_of(scan_index).map(|i| self.slots[i].retention_time)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn scan_range(&self) -> Option<RangeInclusive<usize>> {
        if self.slots.is_empty() {
            None
        } else {
            Some(self.start..=(self.start + self.slots.len() - 1))
        }
    }

    /// Iterate over `(scan_index, outcome)` pairs in index order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ScanOutcome)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (self.start + i, &slot.outcome))
    }

    pub fn failures(&self) -> impl Iterator<Item = &ScanError> + '_ {
        self.slots.iter().filter_map(|slot| slot.outcome.error())
    }

    pub fn num_succeeded(&self) -> usize {
        self.slots.iter().filter(|s| s.outcome.is_success()).count()
    }

    /// The number of scans which were either deconvoluted or failed
    pub fn num_attempted(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.outcome, ScanOutcome::Envelopes(_) | ScanOutcome::Failed(_)))
            .count()
    }

    pub fn num_failed(&self) -> usize {
        self.failures().count()
    }

    /// True when no scan was skipped because processing was stopped early
    pub fn is_complete(&self) -> bool {
        !self.slots.iter().any(|s| s.outcome.is_cancelled())
    }

    pub fn num_envelopes(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|s| s.outcome.envelopes())
            .map(|e| e.len())
            .sum()
    }

    /// Convert every slot into the input for a
    /// [`FeatureAggregator`](crate::aggregator::FeatureAggregator), in scan index order.
    /// Anything other than a successful deconvolution carries no envelopes.
    pub fn into_scan_envelopes(self) -> ScanEnvelopesIter {
        ScanEnvelopesIter {
            start: self.start,
            slots: self.slots.into_iter().enumerate(),
        }
    }
}

/// An owning iterator over a [`ScanResultSet`] yielding [`ScanEnvelopes`]
#[derive(Debug)]
pub struct ScanEnvelopesIter {
    start: usize,
    slots: std::iter::Enumerate<std::vec::IntoIter<ScanSlot>>,
}

impl Iterator for ScanEnvelopesIter {
    type Item = ScanEnvelopes;

    fn next(&mut self) -> Option<Self::Item> {
        self.slots.next().map(|(i, slot)| ScanEnvelopes {
            scan_index: self.start + i,
            elution_time: slot.retention_time,
            envelopes: slot.outcome.into_envelopes(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.slots.size_hint()
    }
}

impl ExactSizeIterator for ScanEnvelopesIter {}

impl IntoIterator for ScanResultSet {
    type Item = ScanEnvelopes;

    type IntoIter = ScanEnvelopesIter;

    fn into_iter(self) -> Self::IntoIter {
        self.into_scan_envelopes()
    }
}

/// A flag shared between the caller and a running [`ParallelScanProcessor`] to stop
/// dispatching work early.
#[derive(Debug, Default, Clone)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A failure which aborted processing of the whole range
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Failed to build the worker thread pool: {0}")]
    ThreadPool(
        #[source]
        #[from]
        rayon::ThreadPoolBuildError,
    ),
    #[error("Processing stopped at the first failure: {0}")]
    ScanFailed(ScanError),
    #[error(
        "Processing was cancelled after {} of {} scans",
        .partial.num_attempted(),
        .partial.len()
    )]
    Cancelled { partial: Box<ScanResultSet> },
    #[error("Processing timed out after {elapsed:?}")]
    Timeout {
        partial: Box<ScanResultSet>,
        elapsed: Duration,
    },
}

impl ProcessingError {
    /// The results computed before processing stopped, if any were kept
    pub fn partial_results(&self) -> Option<&ScanResultSet> {
        match self {
            Self::Cancelled { partial } | Self::Timeout { partial, .. } => Some(partial),
            _ => None,
        }
    }

    pub fn into_partial_results(self) -> Option<ScanResultSet> {
        match self {
            Self::Cancelled { partial } | Self::Timeout { partial, .. } => Some(*partial),
            _ => None,
        }
    }
}

/// Build a thread pool with `threads` workers, or one per available core if `threads < 1`
pub fn create_threadpool(threads: i32) -> Result<rayon::ThreadPool, rayon::ThreadPoolBuildError> {
    let num_threads = if threads > 0 {
        threads as usize
    } else {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    };
    debug!("Using {} cores", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "deconvolver panicked".to_string()
    }
}

#[derive(Debug, Default)]
struct StopFlags {
    halted: AtomicBool,
    timed_out: AtomicBool,
}

/// Runs a [`ScanDeconvolver`] over every included scan in a range using a fixed size
/// pool of worker threads.
#[derive(Debug, Clone)]
pub struct ParallelScanProcessor {
    /// The number of worker threads, or all available cores if `< 1`
    pub threads: i32,
    /// The number of consecutive scan indices handed to a worker at a time
    pub chunk_size: usize,
    /// Stop dispatching work at the first failed scan and report it
    pub fail_fast: bool,
    /// Stop dispatching work once this much time has passed
    pub timeout: Option<Duration>,
    /// When set, included scans of any other MS level fail without being deconvoluted
    pub required_ms_level: Option<u8>,
    cancellation: CancellationToken,
}

impl Default for ParallelScanProcessor {
    fn default() -> Self {
        Self {
            threads: -1,
            chunk_size: 8,
            fail_fast: false,
            timeout: None,
            required_ms_level: None,
            cancellation: CancellationToken::default(),
        }
    }
}

impl ParallelScanProcessor {
    pub fn new(threads: i32) -> Self {
        Self {
            threads,
            ..Default::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_required_ms_level(mut self, ms_level: Option<u8>) -> Self {
        self.required_ms_level = ms_level;
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// A handle which cancels this processor's runs when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Deconvolute every scan in `min_scan..=max_scan` for which `include` returns `true`.
    ///
    /// Failures of individual scans are recorded in the returned [`ScanResultSet`] unless
    /// [`ParallelScanProcessor::fail_fast`] is set.
    ///
    /// # Errors
    /// - [`ProcessingError::ThreadPool`] if the worker pool could not be started
    /// - [`ProcessingError::ScanFailed`] with the lowest-indexed failure when failing fast
    /// - [`ProcessingError::Timeout`] or [`ProcessingError::Cancelled`] carrying whatever
    ///   was finished before processing stopped
    pub fn process<S, D, P>(
        &self,
        source: &S,
        min_scan: usize,
        max_scan: usize,
        include: P,
        deconvolver: &D,
        params: &DeconvolutionParams,
    ) -> Result<ScanResultSet, ProcessingError>
    where
        S: ScanSource + Sync + ?Sized,
        D: ScanDeconvolver + Clone + Send + Sync,
        P: Fn(&Scan) -> bool + Sync,
    {
        let mut results = ScanResultSet::new(min_scan, max_scan);
        if results.is_empty() {
            debug!("Scan range {min_scan}-{max_scan} is empty");
            return Ok(results);
        }

        info!(
            "Deconvoluting scans {min_scan}-{max_scan} ({} scans)",
            results.len()
        );
        let pool = create_threadpool(self.threads)?;
        let started = Instant::now();
        let deadline = self.timeout.map(|t| started + t);
        let flags = StopFlags::default();
        let chunk_size = self.chunk_size.max(1);

        let timed_out = || match deadline {
            Some(deadline) if Instant::now() >= deadline => {
                flags.timed_out.store(true, Ordering::Release);
                true
            }
            _ => false,
        };
        let should_stop = || {
            self.cancellation.is_cancelled() || flags.halted.load(Ordering::Acquire) || timed_out()
        };

        pool.install(|| {
            results
                .slots
                .par_chunks_mut(chunk_size)
                .enumerate()
                .for_each_init(
                    || deconvolver.clone(),
                    |local, (chunk_i, chunk)| {
                        let first = min_scan + chunk_i * chunk_size;
                        let mut stopped = should_stop();
                        if !stopped {
                            trace!("Starting chunk at scan {first}");
                        }
                        for (offset, slot) in chunk.iter_mut().enumerate() {
                            let scan_index = first + offset;
                            if !stopped && timed_out() {
                                stopped = true;
                            }
                            self.process_slot(
                                source,
                                scan_index,
                                slot,
                                &include,
                                local,
                                deconvolver,
                                params,
                                stopped,
                                &flags,
                            );
                        }
                    },
                );
        });

        let elapsed = started.elapsed();
        if self.fail_fast {
            if let Some(err) = results.failures().next() {
                warn!("Stopping after failure: {err}");
                return Err(ProcessingError::ScanFailed(err.clone()));
            }
        }

        if !results.is_complete() {
            if flags.timed_out.load(Ordering::Acquire) {
                warn!("Deconvolution timed out after {elapsed:?}");
                return Err(ProcessingError::Timeout {
                    partial: Box::new(results),
                    elapsed,
                });
            }
            warn!("Deconvolution was cancelled");
            return Err(ProcessingError::Cancelled {
                partial: Box::new(results),
            });
        }

        let n_failed = results.num_failed();
        if n_failed > 0 {
            warn!("{n_failed} scans failed to deconvolute");
        }
        info!(
            "Deconvoluted {} scans yielding {} envelopes in {:0.3} seconds",
            results.num_succeeded(),
            results.num_envelopes(),
            elapsed.as_secs_f64()
        );
        Ok(results)
    }

    #[allow(clippy::too_many_arguments)]
    fn process_slot<S, D, P>(
        &self,
        source: &S,
        scan_index: usize,
        slot: &mut ScanSlot,
        include: &P,
        local: &mut D,
        template: &D,
        params: &DeconvolutionParams,
        stopped: bool,
        flags: &StopFlags,
    ) where
        S: ScanSource + ?Sized,
        D: ScanDeconvolver + Clone,
        P: Fn(&Scan) -> bool,
    {
        let Some(scan) = source.get_scan(scan_index) else {
            slot.outcome = ScanOutcome::Failed(ScanError::MissingScan { scan_index });
            if self.fail_fast {
                flags.halted.store(true, Ordering::Release);
            }
            return;
        };
        slot.retention_time = scan.retention_time;

        if !include(scan) {
            slot.outcome = ScanOutcome::NotAttempted;
            return;
        }
        if stopped {
            slot.outcome = ScanOutcome::Cancelled;
            return;
        }

        if let Some(ms_level) = self.required_ms_level {
            if scan.ms_level != ms_level {
                slot.outcome = ScanOutcome::Failed(ScanError::ScanLevelMismatch {
                    scan_index,
                    ms_level: scan.ms_level,
                });
                if self.fail_fast {
                    flags.halted.store(true, Ordering::Release);
                }
                return;
            }
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| local.deconvolute(scan, params)));
        slot.outcome = match result {
            Ok(Ok(envelopes)) => {
                trace!("Scan {scan_index} yielded {} envelopes", envelopes.len());
                ScanOutcome::Envelopes(envelopes)
            }
            Ok(Err(err)) => ScanOutcome::Failed(ScanError::from_deconvolver(scan_index, err)),
            Err(payload) => {
                // The worker's copy may have been left in an inconsistent state
                *local = template.clone();
                ScanOutcome::Failed(ScanError::DeconvolutionFailure {
                    scan_index,
                    message: panic_message(payload),
                })
            }
        };
        if let ScanOutcome::Failed(err) = &slot.outcome {
            debug!("{err}");
            if self.fail_fast {
                flags.halted.store(true, Ordering::Release);
            }
        }
    }
}
