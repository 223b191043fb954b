use std::fs;
use std::io;
use std::path::Path;
use std::time::Instant;

use mzdata::io::{
    infer_format, infer_from_stream, mgf::MGFReaderType, mzml::MzMLReaderType,
    MassSpectrometryFormat, PreBufferedStream, RestartableGzDecoder, StreamingSpectrumIterator,
};
#[cfg(feature = "mzmlb")]
use mzdata::io::mzmlb::MzMLbReaderType;
#[cfg(feature = "thermo")]
use mzdata::io::thermo::ThermoRawReaderType;
use mzdata::prelude::*;
use mzdata::spectrum::SignalContinuity;

use tracing::{debug, info, trace, warn};

use mzaggregate::{MsRun, Peak, Spectrum};

use crate::driver::MZAggregatorError;
use crate::progress::ProgressRecord;
use crate::time_range::TimeRange;
use crate::types::{CPeak, DPeak, SpectrumType, PEAK_COUNT_THRESHOLD_WARNING};

/// Controls which spectra are peak picked while loading a run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadParams {
    pub ms_level: u8,
    pub time_range: TimeRange,
    pub signal_to_noise: f32,
}

impl Default for ReadParams {
    fn default() -> Self {
        Self {
            ms_level: 1,
            time_range: TimeRange::default(),
            signal_to_noise: 1.0,
        }
    }
}

/// Convert one spectrum into centroided peaks, picking peaks from profile data first.
///
/// Spectra at other MS levels or outside the time range keep their place in the run
/// with no peaks so that scan indices stay aligned with the source file.
fn centroid_spectrum(spectrum: &mut SpectrumType, params: &ReadParams) -> Spectrum {
    if spectrum.ms_level() != params.ms_level
        || !params.time_range.contains_time(spectrum.start_time())
    {
        return Spectrum::default();
    }

    let id = spectrum.id().to_string();
    let peaks = match spectrum.signal_continuity() {
        SignalContinuity::Profile => {
            trace!("Picking peaks for {id}");
            match spectrum.pick_peaks(params.signal_to_noise) {
                Ok(()) => spectrum.peaks.as_ref(),
                Err(e) => {
                    warn!("Failed to pick peaks for {id}: {e}");
                    None
                }
            }
        }
        _ => match spectrum.try_build_centroids() {
            Ok(peaks) => Some(peaks),
            Err(e) => {
                warn!("Failed to read centroids for {id}: {e}");
                None
            }
        },
    };

    match peaks {
        Some(peaks) => peaks
            .iter()
            .map(|p| Peak::new(p.mz, p.intensity as f64))
            .collect(),
        None => Spectrum::default(),
    }
}

/// Load every spectrum from `spectra` into an [`MsRun`], one scan per spectrum in
/// acquisition order.
pub fn load_run<I: Iterator<Item = SpectrumType>>(
    spectra: I,
    params: &ReadParams,
) -> (MsRun, ProgressRecord) {
    let started = Instant::now();
    let mut run = MsRun::with_capacity(spectra.size_hint().0);
    let mut prog = ProgressRecord::default();
    for mut spectrum in spectra {
        let spectrum_peaks = centroid_spectrum(&mut spectrum, params);
        prog.spectra_read += 1;
        if spectrum.ms_level() == params.ms_level {
            prog.target_spectra += 1;
            prog.target_peaks += spectrum_peaks.len();
        }
        if spectrum_peaks.len() > PEAK_COUNT_THRESHOLD_WARNING {
            debug!(
                "{} has {} peaks, deconvolution may be slow",
                spectrum.id(),
                spectrum_peaks.len()
            );
        }
        run.push_scan(spectrum.start_time(), spectrum.ms_level(), spectrum_peaks);
    }
    info!(
        "Loaded {} spectra ({} at MS level {}) in {:0.3} seconds",
        prog.spectra_read,
        prog.target_spectra,
        params.ms_level,
        started.elapsed().as_secs_f64()
    );
    (run, prog)
}

/// Open `input_file`, or STDIN if it is `-`, and load it with [`load_run`]
pub fn read_run(
    input_file: &str,
    params: &ReadParams,
) -> Result<(MsRun, ProgressRecord), MZAggregatorError> {
    if input_file == "-" {
        let mut buffered = PreBufferedStream::new_with_buffer_size(io::stdin(), 2usize.pow(20))?;
        let (ms_format, compressed) = infer_from_stream(&mut buffered)?;
        debug!("Detected {ms_format:?} from STDIN (compressed? {compressed})");
        match ms_format {
            MassSpectrometryFormat::MGF => {
                if compressed {
                    let reader = StreamingSpectrumIterator::new(
                        MGFReaderType::<_, CPeak, DPeak>::new(RestartableGzDecoder::new(
                            io::BufReader::new(buffered),
                        )),
                    );
                    Ok(load_run(reader, params))
                } else {
                    let reader = StreamingSpectrumIterator::new(
                        MGFReaderType::<_, CPeak, DPeak>::new(buffered),
                    );
                    Ok(load_run(reader, params))
                }
            }
            MassSpectrometryFormat::MzML => {
                if compressed {
                    let reader = StreamingSpectrumIterator::new(
                        MzMLReaderType::<_, CPeak, DPeak>::new(RestartableGzDecoder::new(
                            io::BufReader::new(buffered),
                        )),
                    );
                    Ok(load_run(reader, params))
                } else {
                    let reader = StreamingSpectrumIterator::new(
                        MzMLReaderType::<_, CPeak, DPeak>::new(buffered),
                    );
                    Ok(load_run(reader, params))
                }
            }
            _ => Err(MZAggregatorError::FormatUnknownOrNotSupportedErrorStdIn(
                ms_format,
            )),
        }
    } else {
        if !Path::new(input_file).exists() {
            return Err(MZAggregatorError::IOError(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Input file {input_file} does not exist"),
            )));
        }
        let (ms_format, compressed) = infer_format(input_file)?;
        debug!("Detected {ms_format:?} from path (compressed? {compressed})");
        match ms_format {
            MassSpectrometryFormat::MGF => {
                if compressed {
                    let fh = RestartableGzDecoder::new(io::BufReader::new(fs::File::open(
                        input_file,
                    )?));
                    let reader =
                        StreamingSpectrumIterator::new(MGFReaderType::<_, CPeak, DPeak>::new(fh));
                    Ok(load_run(reader, params))
                } else {
                    let reader = MGFReaderType::<_, CPeak, DPeak>::open_path(input_file)?;
                    Ok(load_run(reader, params))
                }
            }
            MassSpectrometryFormat::MzML => {
                if compressed {
                    let fh = RestartableGzDecoder::new(io::BufReader::new(fs::File::open(
                        input_file,
                    )?));
                    let reader =
                        StreamingSpectrumIterator::new(MzMLReaderType::<_, CPeak, DPeak>::new(fh));
                    Ok(load_run(reader, params))
                } else {
                    let reader = MzMLReaderType::<_, CPeak, DPeak>::open_path(input_file)?;
                    Ok(load_run(reader, params))
                }
            }
            #[cfg(feature = "mzmlb")]
            MassSpectrometryFormat::MzMLb => {
                let reader = MzMLbReaderType::<CPeak, DPeak>::open_path(input_file)?;
                Ok(load_run(reader, params))
            }
            #[cfg(feature = "thermo")]
            MassSpectrometryFormat::ThermoRaw => {
                let reader = ThermoRawReaderType::<CPeak, DPeak>::open_path(input_file)?;
                Ok(load_run(reader, params))
            }
            _ => Err(MZAggregatorError::FormatUnknownOrNotSupportedError(
                input_file.to_string(),
                ms_format,
            )),
        }
    }
}
