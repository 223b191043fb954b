use tracing::info;

/// Counters reported once a run finishes
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ProgressRecord {
    pub spectra_read: usize,
    /// Spectra at the MS level being deconvoluted
    pub target_spectra: usize,
    pub target_peaks: usize,
    pub scans_deconvoluted: usize,
    pub scans_failed: usize,
    pub envelopes: usize,
    pub features_written: usize,
}

impl ProgressRecord {
    pub fn log(&self) {
        info!(
            "Spectra Read: {} | Target Level Spectra: {}",
            self.spectra_read, self.target_spectra
        );
        info!("Target Level Peaks: {}", self.target_peaks);
        info!(
            "Scans Deconvoluted: {} | Failed: {}",
            self.scans_deconvoluted, self.scans_failed
        );
        info!("Envelopes: {}", self.envelopes);
        info!("Features: {}", self.features_written);
    }
}
