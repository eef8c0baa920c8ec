//! Configuration file loading and validation.

use autopower::config::{AppConfig, DeviceCheckPolicy, DEFAULT_BUS_ADDRESS};
use autopower::error::ConfigError;
use autopower::measurement::FailureCategory;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_bundled_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/autopower.toml");
    let config = AppConfig::load(path).unwrap();

    assert_eq!(config.models.len(), 3);
    assert_eq!(config.measurement.device_check, DeviceCheckPolicy::OnNoCurrent);
    assert_eq!(config.retry.initial_backoff, Duration::from_millis(500));

    let s936 = &config.models[1];
    let categories: Vec<FailureCategory> = s936
        .thresholds
        .fail_bands
        .iter()
        .map(|band| band.category)
        .collect();
    assert_eq!(
        categories,
        [FailureCategory::SustainedOutOfBand, FailureCategory::Overcurrent]
    );
    assert_eq!(s936.thresholds.overcurrent_limit, 3.5);
    assert_eq!(config.models[0].thresholds.overcurrent_limit, 4.0);
}

#[test]
fn test_defaults_fill_missing_sections() {
    let file = write_config(
        r#"
[[models]]
model_id = "F966"
voltage = 4.2
pass_min = 0.1
pass_max = 0.5
"#,
    );
    let config = AppConfig::load(file.path()).unwrap();
    assert_eq!(config.application.name, "AutoPowerTester");
    assert_eq!(config.measurement.presence_threshold, 0.005);
    assert_eq!(config.models[0].bus_address.value(), DEFAULT_BUS_ADDRESS);
    assert_eq!(config.models[0].bus_address.to_string(), "GPIB0::6::INSTR");
}

#[test]
fn test_missing_file_is_reported() {
    let err = AppConfig::load("/definitely/not/here/autopower.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("not found")));
}

#[test]
fn test_invalid_profiles_are_rejected_before_any_run() {
    let out_of_range = write_config(
        r#"
[[models]]
model_id = "F966"
voltage = 4.2
bus_address = 31
pass_min = 0.1
pass_max = 0.5
"#,
    );
    assert!(AppConfig::load(out_of_range.path()).is_err());

    let overlapping = write_config(
        r#"
[[models]]
model_id = "S936"
voltage = 4.0
pass_min = 0.1
pass_max = 0.5
fail_bands = [
    { category = "W74A", low = 0.5, high = 1.0 },
    { category = "W748", low = 0.9, high = 2.0 },
]
"#,
    );
    let err = AppConfig::load(overlapping.path()).unwrap_err();
    assert!(err.to_string().contains("overlap detected"));

    let zero_samples = write_config("[measurement]\nsample_count = 0\n");
    assert!(AppConfig::load(zero_samples.path()).is_err());

    let duplicate = write_config(
        r#"
[[models]]
model_id = "A556"
voltage = 3.85
pass_min = 0.2
pass_max = 0.6

[[models]]
model_id = "A556"
voltage = 3.85
bus_address = 7
pass_min = 0.2
pass_max = 0.6
"#,
    );
    let err = AppConfig::load(duplicate.path()).unwrap_err();
    assert!(err.to_string().contains("'A556' is configured more than once"));

    let endless = write_config("[measurement]\nno_current_timeout = \"1000000years\"\n");
    assert!(AppConfig::load(endless.path()).is_err());
}

#[test]
fn test_environment_overrides_file_values() {
    let file = write_config("[retry]\nmax_attempts = 2\n");
    std::env::set_var("AUTOPOWER_RETRY__MAX_ATTEMPTS", "5");
    let loaded = AppConfig::load(file.path());
    std::env::remove_var("AUTOPOWER_RETRY__MAX_ATTEMPTS");

    assert_eq!(loaded.unwrap().retry.max_attempts, 5);
}
