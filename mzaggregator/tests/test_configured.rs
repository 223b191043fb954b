use clap::Parser;
use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};

use mzaggregator::{ArgChargeRange, ArgIsotopicModels, MZAggregator, TimeRange};

fn base_args() -> MZAggregator {
    MZAggregator::parse_from(["mzaggregator", "input.mzML", "-t", "4"])
}

#[test_log::test]
fn test_toml_overrides_defaults() {
    let config = Figment::new()
        .merge(Serialized::defaults(base_args()))
        .merge(Toml::string(
            r#"
charge_range = [2, 6]
isotopic_model = ["glycan", "peptide"]
aggregation_tolerance = 5.0
time_range = { start = 10.0, end = 20.0 }
fail_fast = true

[processor_params]
chunk_size = 2
"#,
        ));
    let driver: MZAggregator = config.extract().unwrap();
    assert_eq!(driver.input_file, "input.mzML");
    assert_eq!(driver.threads, 4);
    assert_eq!(driver.charge_range, ArgChargeRange(2, 6));
    assert_eq!(
        driver.isotopic_model,
        vec![ArgIsotopicModels::Glycan, ArgIsotopicModels::Peptide]
    );
    assert_eq!(driver.aggregation_tolerance, 5.0);
    assert_eq!(driver.time_range, Some(TimeRange::new(10.0, 20.0)));
    assert!(driver.fail_fast);
    assert_eq!(driver.processor_params.chunk_size, 2);
    assert_eq!(driver.deconvolution_tolerance, 20.0);
}

#[test_log::test]
fn test_defaults_survive_extraction() {
    let config = Figment::new().merge(Serialized::defaults(base_args()));
    let driver: MZAggregator = config.extract().unwrap();
    assert_eq!(driver.charge_range, ArgChargeRange(1, 8));
    assert_eq!(driver.ms_level, 1);
    assert_eq!(driver.max_mz, None);
    assert_eq!(driver.timeout, None);
    assert_eq!(driver.processor_params.chunk_size, 8);
    assert_eq!(driver.aggregation_params().aggregation_tolerance_ppm, 10.0);
}
