use std::collections::HashMap;

use mzaggregate::{
    aggregate, merge_spectra, AggregatedFeatures, AggregationParams, DeconvolutionParams,
    DeconvolverError, FeatureAggregationEngine, IsotopicEnvelope, MsRun, ParallelScanProcessor,
    Peak, ProcessingError, Scan, ScanError, ScanOutcome, Spectrum,
};

/// Treat every peak as the monoisotopic peak of a singly charged two peak envelope
fn peaks_as_masses(
    scan: &Scan,
    _params: &DeconvolutionParams,
) -> Result<Vec<IsotopicEnvelope>, DeconvolverError> {
    Ok(scan
        .spectrum
        .iter()
        .map(|p| {
            IsotopicEnvelope::new(
                p.mz,
                1,
                vec![*p, Peak::new(p.mz + 1.00335, p.intensity / 2.0)],
            )
        })
        .collect())
}

fn fails_on_third(
    scan: &Scan,
    params: &DeconvolutionParams,
) -> Result<Vec<IsotopicEnvelope>, DeconvolverError> {
    if scan.index == 3 {
        Err(DeconvolverError::Failed("no isotopic fits converged".to_string()))
    } else {
        peaks_as_masses(scan, params)
    }
}

fn make_run(masses: &[&[f64]]) -> MsRun {
    masses
        .iter()
        .enumerate()
        .map(|(i, ms)| {
            let spectrum: Spectrum = ms.iter().map(|m| Peak::new(*m, 1000.0)).collect();
            (i as f64 * 0.25, 1u8, spectrum)
        })
        .collect()
}

#[test_log::test]
fn test_five_scan_aggregation() {
    let run = make_run(&[&[1000.0], &[1500.0], &[1000.005], &[2000.0], &[2500.0]]);
    let aggregated = aggregate(
        &run,
        peaks_as_masses,
        None,
        None,
        1,
        8,
        20.0,
        3.0,
        10.0,
        |_: &Scan| true,
    )
    .unwrap();
    assert!(aggregated.failures.is_empty());
    assert_eq!(aggregated.scan_range, Some(1..=5));

    let features: Vec<_> = aggregated.features.collect::<Result<_, _>>().unwrap();
    assert_eq!(features.len(), 4);

    let joined: Vec<_> = features.iter().filter(|f| f.num_envelopes() == 2).collect();
    assert_eq!(joined.len(), 1);
    let joined = joined[0];
    assert_eq!(joined.min_scan_index, 1);
    assert_eq!(joined.max_scan_index, 3);
    assert_eq!(joined.num_peaks(), 4);
    assert!((joined.mass() - 1000.0025).abs() < 1e-6);
    assert_eq!(joined.charges(), vec![1]);
}

#[test_log::test]
fn test_envelopes_covered_exactly_once() {
    let masses: Vec<Vec<f64>> = (0..30)
        .map(|i| {
            let mut ms = vec![800.0 + (i % 7) as f64 * 101.0, 1203.4];
            if i % 5 == 0 {
                ms.push(1204.40286);
            }
            if i % 11 == 3 {
                ms.push(3000.0 + i as f64);
            }
            ms
        })
        .collect();
    let rows: Vec<&[f64]> = masses.iter().map(|m| m.as_slice()).collect();
    let run = make_run(&rows);

    let engine = FeatureAggregationEngine::new(peaks_as_masses, AggregationParams::default())
        .with_processor(ParallelScanProcessor::new(3).with_chunk_size(4));
    let mut aggregated = engine.aggregate(&run, None, None, |_: &Scan| true).unwrap();

    let mut seen: HashMap<(usize, u64), usize> = HashMap::new();
    let mut n_features = 0;
    for feature in aggregated.features.by_ref() {
        let feature = feature.unwrap();
        n_features += 1;
        for obs in feature.observations() {
            *seen
                .entry((obs.scan_index, obs.monoisotopic_mass().to_bits()))
                .or_default() += 1;
        }
    }

    let expected: usize = masses.iter().map(|m| m.len()).sum();
    assert_eq!(seen.len(), expected);
    assert!(seen.values().all(|c| *c == 1));

    let stats = aggregated.features.stats();
    assert_eq!(stats.features_emitted, n_features);
    assert_eq!(stats.envelopes_consumed, expected);
    assert_eq!(stats.scans_consumed, 30);
}

#[test_log::test]
fn test_features_never_emitted_early() {
    let run = make_run(&[
        &[500.0, 900.0],
        &[500.001],
        &[700.0],
        &[500.002, 700.0],
        &[],
        &[700.0],
        &[900.0],
    ]);
    let engine = FeatureAggregationEngine::new(peaks_as_masses, AggregationParams::default());
    let mut aggregated = engine.aggregate(&run, None, None, |_: &Scan| true).unwrap();
    let last_scan = run.len();
    while let Some(feature) = aggregated.features.next() {
        let feature = feature.unwrap();
        let cursor = aggregated.features.scan_cursor().unwrap();
        assert!(
            feature.max_scan_index < cursor || cursor == last_scan,
            "{feature} emitted at scan {cursor}"
        );
    }
    assert_eq!(aggregated.features.open_feature_count(), 0);
}

#[test_log::test]
fn test_excluded_scans_differ_from_empty() {
    let run = make_run(&[&[1000.0], &[], &[1000.0], &[1000.0]]);
    let engine = FeatureAggregationEngine::new(peaks_as_masses, AggregationParams::default());
    let results = engine
        .deconvolute(&run, None, None, |scan: &Scan| scan.index != 3)
        .unwrap();
    assert_eq!(results.get(1).and_then(|o| o.envelopes()).map(|e| e.len()), Some(1));
    assert_eq!(results.get(2), Some(&ScanOutcome::Envelopes(Vec::new())));
    assert_eq!(results.get(3), Some(&ScanOutcome::NotAttempted));
    assert_eq!(results.num_attempted(), 3);

    // Scans 2 and 3 both pass without a match for the feature opened in scan 1
    let params = AggregationParams::default();
    let features: Vec<_> = AggregatedFeatures::new(results, &params)
        .features
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(features.len(), 2);
    assert!(features.iter().all(|f| f.num_envelopes() == 1));
}

#[test_log::test]
fn test_failure_isolated() {
    let run = make_run(&[&[1000.0], &[1000.0], &[1000.0], &[1000.0], &[1000.0]]);
    let engine = FeatureAggregationEngine::new(fails_on_third, AggregationParams::default())
        .with_processor(ParallelScanProcessor::new(2).with_chunk_size(1));
    let aggregated = engine.aggregate(&run, None, None, |_: &Scan| true).unwrap();
    assert_eq!(aggregated.failures.len(), 1);
    assert!(matches!(
        &aggregated.failures[0],
        ScanError::DeconvolutionFailure { scan_index: 3, .. }
    ));

    // The failed scan contributes nothing but the feature bridges it
    let features: Vec<_> = aggregated.features.collect::<Result<_, _>>().unwrap();
    assert_eq!(features.len(), 1);
    let scans: Vec<_> = features[0].observations().map(|o| o.scan_index).collect();
    assert_eq!(scans, vec![1, 2, 4, 5]);

    let params = AggregationParams {
        max_missed_scans: 0,
        ..Default::default()
    };
    let engine = FeatureAggregationEngine::new(fails_on_third, params)
        .with_processor(ParallelScanProcessor::new(2).with_chunk_size(1));
    let aggregated = engine.aggregate(&run, None, None, |_: &Scan| true).unwrap();
    let spans: Vec<_> = aggregated
        .features
        .map(|f| f.map(|f| (f.min_scan_index, f.max_scan_index)))
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(spans, vec![(1, 2), (4, 5)]);
}

#[test_log::test]
fn test_fail_fast() {
    let run = make_run(&[&[1000.0], &[1000.0], &[1000.0], &[1000.0], &[1000.0]]);
    let engine = FeatureAggregationEngine::new(fails_on_third, AggregationParams::default())
        .with_processor(ParallelScanProcessor::new(2).with_fail_fast(true));
    match engine.aggregate(&run, None, None, |_: &Scan| true) {
        Err(ProcessingError::ScanFailed(err)) => assert_eq!(err.scan_index(), 3),
        Err(e) => panic!("Unexpected error {e}"),
        Ok(_) => panic!("Expected scan 3 to fail"),
    }
}

#[test]
fn test_merge_replicate_scans() {
    let run = make_run(&[
        &[400.0, 650.3],
        &[400.002, 812.9],
        &[399.999, 650.3001],
    ]);
    let merged = merge_spectra(run.iter().map(|s| &s.spectrum), 10.0).unwrap();
    assert_eq!(merged.len(), 3);
    assert!((merged[0].mz - 400.000333).abs() < 1e-5);
    assert_eq!(merged[0].intensity, 3000.0);
    assert_eq!(merged[1].intensity, 2000.0);
    assert_eq!(merged[2].intensity, 1000.0);
    assert_eq!(merged.tic(), run.iter().map(|s| s.spectrum.tic()).sum::<f64>());
}
