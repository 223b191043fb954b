use std::fmt::Display;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::Instant;

use crossbeam_channel::Receiver;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::{debug, info};

use mzaggregate::Feature;

/// The tabular formats features can be written in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureFormat {
    TSV,
    JSONLines,
}

impl Display for FeatureFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TSV => f.write_str("tsv"),
            Self::JSONLines => f.write_str("jsonl"),
        }
    }
}

/// Infer the output format and whether to gzip compress from a file path.
///
/// `.json` and `.jsonl` select JSON lines, anything else is tab-separated.
/// A trailing `.gz` requests compression.
pub fn infer_output_format(path: &Path) -> (FeatureFormat, bool) {
    let (stem, compressed) = match path.extension() {
        Some(ext) if ext.eq_ignore_ascii_case("gz") => (path.with_extension(""), true),
        _ => (path.to_path_buf(), false),
    };
    let format = match stem.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("json") || ext.eq_ignore_ascii_case("jsonl") => {
            FeatureFormat::JSONLines
        }
        _ => FeatureFormat::TSV,
    };
    (format, compressed)
}

/// The summary of a [`Feature`] written out, one per line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureRecord {
    pub mass: f64,
    pub num_peaks: usize,
    pub num_envelopes: usize,
    pub min_scan_index: usize,
    pub max_scan_index: usize,
    pub min_elution_time: f64,
    pub max_elution_time: f64,
    pub total_intensity: f64,
    pub charges: Vec<i32>,
}

impl From<&Feature> for FeatureRecord {
    fn from(value: &Feature) -> Self {
        Self {
            mass: value.mass(),
            num_peaks: value.num_peaks(),
            num_envelopes: value.num_envelopes(),
            min_scan_index: value.min_scan_index,
            max_scan_index: value.max_scan_index,
            min_elution_time: value.min_elution_time,
            max_elution_time: value.max_elution_time,
            total_intensity: value.total_intensity,
            charges: value.charges(),
        }
    }
}

const TSV_HEADER: &str = "mass\tnum_peaks\tnum_envelopes\tmin_scan_index\tmax_scan_index\t\
    min_elution_time\tmax_elution_time\ttotal_intensity\tcharges";

pub struct FeatureWriter<W: Write> {
    handle: W,
    format: FeatureFormat,
    features_written: usize,
    wrote_header: bool,
}

impl<W: Write> FeatureWriter<W> {
    pub fn new(handle: W, format: FeatureFormat) -> Self {
        Self {
            handle,
            format,
            features_written: 0,
            wrote_header: false,
        }
    }

    pub fn format(&self) -> FeatureFormat {
        self.format
    }

    pub fn features_written(&self) -> usize {
        self.features_written
    }

    fn write_header(&mut self) -> io::Result<()> {
        if matches!(self.format, FeatureFormat::TSV) {
            writeln!(self.handle, "{TSV_HEADER}")?;
        }
        self.wrote_header = true;
        Ok(())
    }

    pub fn write_feature(&mut self, feature: &Feature) -> io::Result<()> {
        if !self.wrote_header {
            self.write_header()?;
        }
        let record = FeatureRecord::from(feature);
        match self.format {
            FeatureFormat::TSV => {
                let charges = record
                    .charges
                    .iter()
                    .map(|z| z.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                writeln!(
                    self.handle,
                    "{:0.6}\t{}\t{}\t{}\t{}\t{:0.4}\t{:0.4}\t{:0.2}\t{}",
                    record.mass,
                    record.num_peaks,
                    record.num_envelopes,
                    record.min_scan_index,
                    record.max_scan_index,
                    record.min_elution_time,
                    record.max_elution_time,
                    record.total_intensity,
                    charges
                )?;
            }
            FeatureFormat::JSONLines => {
                serde_json::to_writer(&mut self.handle, &record)?;
                self.handle.write_all(b"\n")?;
            }
        }
        self.features_written += 1;
        Ok(())
    }

    /// Write the header if nothing was written yet, flush, and hand back the stream
    pub fn finish(mut self) -> io::Result<W> {
        if !self.wrote_header {
            self.write_header()?;
        }
        self.handle.flush()?;
        Ok(self.handle)
    }
}

/// Open the destination for features, `-` meaning STDOUT
pub fn open_output(path: &Path) -> io::Result<FeatureWriter<Box<dyn Write + Send>>> {
    if path == Path::new("-") {
        let handle: Box<dyn Write + Send> = Box::new(io::BufWriter::new(io::stdout()));
        return Ok(FeatureWriter::new(handle, FeatureFormat::TSV));
    }
    let (format, compressed) = infer_output_format(path);
    debug!(
        "Writing {format} to {} (compressed? {compressed})",
        path.display()
    );
    let handle = io::BufWriter::new(fs::File::create(path)?);
    let handle: Box<dyn Write + Send> = if compressed {
        Box::new(GzEncoder::new(handle, Compression::best()))
    } else {
        Box::new(handle)
    };
    Ok(FeatureWriter::new(handle, format))
}

/// Drain `receiver` into `writer` until every sender hangs up, returning how many
/// features were written.
pub fn write_output<W: Write>(
    mut writer: FeatureWriter<W>,
    receiver: Receiver<Feature>,
) -> io::Result<usize> {
    let started = Instant::now();
    let mut checkpoint = 0usize;
    let mut last_scan = 0usize;
    while let Ok(feature) = receiver.recv() {
        writer.write_feature(&feature)?;
        last_scan = last_scan.max(feature.max_scan_index);
        let count = writer.features_written();
        if count - checkpoint >= 10_000 {
            info!(
                "Wrote {count} features | Scan={last_scan} | {} items in the write queue",
                receiver.len()
            );
            checkpoint = count;
        }
    }
    let count = writer.features_written();
    let mut handle = writer.finish()?;
    handle.flush()?;
    info!(
        "Finished writing {count} features in {:0.3?}",
        started.elapsed()
    );
    Ok(count)
}

#[cfg(test)]
mod test {
    use super::*;
    use mzaggregate::{IsotopicEnvelope, Peak};

    fn make_feature() -> Feature {
        let env = |mass: f64, z: i32| {
            IsotopicEnvelope::new(
                mass,
                z,
                vec![
                    Peak::new(mass / z as f64 + 1.007, 100.0),
                    Peak::new(mass / z as f64 + 1.5, 50.0),
                ],
            )
        };
        let mut feature = Feature::new(env(1000.0, 2), 3, 1.5);
        feature.add_envelope(env(1000.001, 3), 4, 1.6);
        feature
    }

    #[test]
    fn test_infer_output_format() {
        assert_eq!(
            infer_output_format(Path::new("out.tsv")),
            (FeatureFormat::TSV, false)
        );
        assert_eq!(
            infer_output_format(Path::new("out.jsonl.gz")),
            (FeatureFormat::JSONLines, true)
        );
        assert_eq!(
            infer_output_format(Path::new("out.JSON")),
            (FeatureFormat::JSONLines, false)
        );
        assert_eq!(
            infer_output_format(Path::new("features")),
            (FeatureFormat::TSV, false)
        );
    }

    #[test]
    fn test_write_tsv() -> io::Result<()> {
        let mut writer = FeatureWriter::new(Vec::new(), FeatureFormat::TSV);
        writer.write_feature(&make_feature())?;
        let buf = String::from_utf8(writer.finish()?).unwrap();
        let mut lines = buf.lines();
        assert_eq!(lines.next(), Some(TSV_HEADER));
        let row: Vec<&str> = lines.next().unwrap().split('\t').collect();
        assert_eq!(row.len(), 9);
        assert_eq!(row[1], "4");
        assert_eq!(row[3], "3");
        assert_eq!(row[4], "4");
        assert_eq!(row[8], "2,3");
        assert!(lines.next().is_none());
        Ok(())
    }

    #[test]
    fn test_write_jsonl() -> io::Result<()> {
        let (send, recv) = crossbeam_channel::bounded(4);
        send.send(make_feature()).unwrap();
        send.send(make_feature()).unwrap();
        drop(send);
        let writer = FeatureWriter::new(Vec::new(), FeatureFormat::JSONLines);
        let count = write_output(writer, recv)?;
        assert_eq!(count, 2);
        Ok(())
    }

    #[test]
    fn test_empty_tsv_has_header() -> io::Result<()> {
        let writer = FeatureWriter::new(Vec::new(), FeatureFormat::TSV);
        let buf = String::from_utf8(writer.finish()?).unwrap();
        assert_eq!(buf.trim_end(), TSV_HEADER);
        Ok(())
    }
}
